/// AI: Audio Interface.
///
/// DMA-based audio output. Registers at physical 0x0450_0000.
/// Sample playback is not emulated: the registers keep what software wrote,
/// AI_LEN reads back as drained, and an AI_STATUS write acks the interrupt.
use std::sync::Arc;

use parking_lot::Mutex;

use super::mi::{Mi, MiInterrupt};
use super::peripheral::RegisterMap;
use crate::bus::{BusError, Device, DmaPort};
use crate::memory::register::RegisterBlock;

pub const DRAM_ADDR: usize = 0;
pub const LEN: usize = 1;
pub const CONTROL: usize = 2;
pub const STATUS: usize = 3;
pub const DACRATE: usize = 4;
pub const BITRATE: usize = 5;

pub struct Ai {
    regs: Mutex<RegisterMap>,
    mi: Arc<Mi>,
}

impl Ai {
    pub fn new(mi: Arc<Mi>) -> Result<Self, BusError> {
        let regs = RegisterMap::sequential(
            "AI",
            0x10_0000,
            vec![
                RegisterBlock::new("AI_DRAM_ADDR", 1),
                RegisterBlock::dual("AI_LEN", 1),
                RegisterBlock::new("AI_CONTROL", 1),
                RegisterBlock::dual("AI_STATUS", 1),
                RegisterBlock::new("AI_DACRATE", 1),
                RegisterBlock::new("AI_BITRATE", 1),
            ],
        )?;
        Ok(Self {
            regs: Mutex::new(regs),
            mi,
        })
    }

    /// Last value software stored into register `index`.
    pub fn reg(&self, index: usize) -> u32 {
        self.regs.lock().reg(index)
    }

    /// Output sample rate implied by AI_DACRATE.
    pub fn sample_rate(&self) -> u32 {
        match self.reg(DACRATE) & 0x3FFF {
            0 => 32_000,
            rate => 48_681_812 / (rate + 1),
        }
    }
}

impl Device for Ai {
    fn name(&self) -> &'static str {
        "AI"
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
                LEN => log::trace!(
                    "AI buffer {:#010X} len={:#X}",
                    self.reg(DRAM_ADDR),
                    self.reg(LEN) & 0x3_FFF8
                ),
                STATUS => self.mi.clear_interrupt(MiInterrupt::AI),
                _ => {}
            }
        }
        Ok(())
    }
}
