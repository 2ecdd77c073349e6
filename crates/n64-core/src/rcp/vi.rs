/// VI: Video Interface.
///
/// Controls video output: framebuffer address, resolution, timing.
/// Generates an interrupt once per field at the configured half-line.
/// Registers at physical 0x0440_0000.
use std::sync::Arc;

use parking_lot::Mutex;

use super::mi::{Mi, MiInterrupt};
use super::peripheral::RegisterMap;
use crate::bus::{BusError, Device, DmaPort};
use crate::memory::register::RegisterBlock;

pub const CTRL: usize = 0;
pub const ORIGIN: usize = 1;
pub const WIDTH: usize = 2;
pub const INTR: usize = 3;
pub const CURRENT: usize = 4;
pub const BURST: usize = 5;
pub const V_SYNC: usize = 6;
pub const H_SYNC: usize = 7;
pub const LEAP: usize = 8;
pub const H_START: usize = 9;
pub const V_START: usize = 10;
pub const V_BURST: usize = 11;
pub const X_SCALE: usize = 12;
pub const Y_SCALE: usize = 13;

const NAMES: [&str; 14] = [
    "VI_CTRL", "VI_ORIGIN", "VI_WIDTH", "VI_INTR", "VI_CURRENT", "VI_BURST", "VI_V_SYNC",
    "VI_H_SYNC", "VI_LEAP", "VI_H_START", "VI_V_START", "VI_V_BURST", "VI_X_SCALE",
    "VI_Y_SCALE",
];

/// ~93.75 MHz CPU / 60 fields / 525 half-lines (NTSC).
pub const CYCLES_PER_LINE: u64 = 93_750_000 / 60 / 525;

const DEFAULT_WIDTH: u32 = 320;
const DEFAULT_HEIGHT: u32 = 240;
const DEFAULT_V_SYNC: u32 = 525;

pub struct Vi {
    regs: Mutex<RegisterMap>,
    /// Cycles accumulated towards the next half-line.
    line_cycles: Mutex<u64>,
    mi: Arc<Mi>,
}

impl Vi {
    pub fn new(mi: Arc<Mi>) -> Result<Self, BusError> {
        let blocks = NAMES
            .iter()
            .enumerate()
            .map(|(i, &name)| {
                if i == CURRENT {
                    RegisterBlock::dual(name, 1)
                } else {
                    RegisterBlock::new(name, 1)
                }
            })
            .collect();
        Ok(Self {
            regs: Mutex::new(RegisterMap::sequential("VI", 0x10_0000, blocks)?),
            line_cycles: Mutex::new(0),
            mi,
        })
    }

    pub fn reg(&self, index: usize) -> u32 {
        self.regs.lock().visible(index)
    }

    pub fn origin(&self) -> u32 {
        self.reg(ORIGIN) & 0x00FF_FFFF
    }

    pub fn current_line(&self) -> u32 {
        self.reg(CURRENT)
    }

    /// Active display width in pixels: ((hend − hstart) * xscale) / 0x400,
    /// with xscale in 2.10 fixed point.
    pub fn display_width(&self) -> u32 {
        let regs = self.regs.lock();
        Self::visible_span(regs.visible(H_START), regs.visible(X_SCALE), 0x400, DEFAULT_WIDTH)
    }

    /// Active display height in lines: ((vend − vstart) * yscale) / 0x800.
    pub fn display_height(&self) -> u32 {
        let regs = self.regs.lock();
        Self::visible_span(regs.visible(V_START), regs.visible(Y_SCALE), 0x800, DEFAULT_HEIGHT)
    }

    fn visible_span(start_end: u32, scale: u32, divisor: u32, default: u32) -> u32 {
        let scale = scale & 0xFFF;
        if scale == 0 {
            return default;
        }
        let start = (start_end >> 16) & 0x3FF;
        let end = start_end & 0x3FF;
        (end.saturating_sub(start) * scale) / divisor
    }

    /// CPU cycles left before the half-line counter next moves.
    pub fn cycles_to_next_line(&self) -> u64 {
        CYCLES_PER_LINE.saturating_sub(*self.line_cycles.lock())
    }

    /// Advance VI by `cycles` CPU cycles. Fires the VI interrupt when the
    /// half-line counter reaches VI_INTR.
    pub fn advance(&self, cycles: u64) {
        let mut acc = self.line_cycles.lock();
        *acc += cycles;
        while *acc >= CYCLES_PER_LINE {
            *acc -= CYCLES_PER_LINE;
            let mut regs = self.regs.lock();
            let v_sync = match regs.visible(V_SYNC) & 0x3FF {
                0 => DEFAULT_V_SYNC,
                lines => lines,
            };
            let line = (regs.visible(CURRENT) + 1) % v_sync;
            regs.publish(CURRENT, line);
            let hit = line == regs.visible(INTR) & 0x3FF;
            drop(regs);
            if hit {
                self.mi.set_interrupt(MiInterrupt::VI);
            }
        }
    }
}

impl Device for Vi {
    fn name(&self) -> &'static str {
        "VI"
    }

    fn read(&self, offset: u32, buf: &mut [u8]) -> Result<(), BusError> {
        self.regs.lock().read(offset, buf)
    }

    fn write(&self, offset: u32, data: &[u8]) -> Result<(), BusError> {
        self.regs.lock().write(offset, data)
    }

    fn post_write(&self, offset: u32, len: u32, _dma: &dyn DmaPort) -> Result<(), BusError> {
        let touched = self.regs.lock().touched(offset, len);
        for slot in touched {
            match slot {
                CURRENT => self.mi.clear_interrupt(MiInterrupt::VI),
                ORIGIN | WIDTH | H_START | V_START | X_SCALE | Y_SCALE => {
                    log::debug!("{} set to {:#010X}", NAMES[slot], self.reg(slot));
                }
                _ => {}
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct NoDma;

    impl DmaPort for NoDma {
        fn copy(&self, _src: u32, _dst: u32, _len: u32) -> Result<u32, BusError> {
            Ok(0)
        }
    }

    fn vi() -> (Vi, Arc<Mi>) {
        let mi = Arc::new(Mi::new().unwrap());
        (Vi::new(Arc::clone(&mi)).unwrap(), mi)
    }

    fn write_reg(vi: &Vi, index: usize, val: u32) {
        let offset = index as u32 * 4;
        vi.write(offset, &val.to_be_bytes()).unwrap();
        vi.post_write(offset, 4, &NoDma).unwrap();
    }

    #[test]
    fn zero_scale_falls_back_to_320x240() {
        let (vi, _) = vi();
        assert_eq!(vi.display_width(), 320);
        assert_eq!(vi.display_height(), 240);
    }

    #[test]
    fn dimensions_follow_fixed_point_scale() {
        let (vi, _) = vi();
        // NTSC 320x240: hstart 0x6C..0x2EC, vstart 0x25..0x1FF
        write_reg(&vi, H_START, (0x06C << 16) | 0x2EC);
        write_reg(&vi, X_SCALE, 0x200);
        write_reg(&vi, V_START, (0x025 << 16) | 0x1FF);
        write_reg(&vi, Y_SCALE, 0x400);
        assert_eq!(vi.display_width(), (0x2EC - 0x06C) * 0x200 / 0x400);
        assert_eq!(vi.display_width(), 320);
        assert_eq!(vi.display_height(), (0x1FF - 0x025) * 0x400 / 0x800);
    }

    #[test]
    fn reaching_intr_line_raises_and_current_write_clears() {
        let (vi, mi) = vi();
        write_reg(&vi, INTR, 2);
        vi.advance(CYCLES_PER_LINE);
        assert_eq!(mi.intr(), 0);
        vi.advance(CYCLES_PER_LINE);
        assert_eq!(vi.current_line(), 2);
        assert_eq!(mi.intr(), 1 << MiInterrupt::VI as u8);

        write_reg(&vi, CURRENT, 0);
        assert_eq!(mi.intr(), 0);
        assert_eq!(vi.current_line(), 2);
    }

    #[test]
    fn cycles_to_next_line_counts_down() {
        let (vi, _) = vi();
        assert_eq!(vi.cycles_to_next_line(), CYCLES_PER_LINE);
        vi.advance(CYCLES_PER_LINE - 10);
        assert_eq!(vi.cycles_to_next_line(), 10);
        vi.advance(10);
        assert_eq!(vi.current_line(), 1);
        assert_eq!(vi.cycles_to_next_line(), CYCLES_PER_LINE);
    }

    #[test]
    fn line_counter_wraps_at_v_sync() {
        let (vi, _) = vi();
        write_reg(&vi, V_SYNC, 4);
        vi.advance(CYCLES_PER_LINE * 5);
        assert_eq!(vi.current_line(), 1);
    }
}
