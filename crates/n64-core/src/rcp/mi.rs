/// MI: MIPS Interface (Interrupt Controller).
///
/// Aggregates interrupts from all RCP components (SP, SI, AI, VI, PI, DP)
/// into a single interrupt line to the CPU (COP0 Cause IP2).
///
/// Registers at physical 0x0430_0000:
///   0x00 MI_MODE     (W: set/clear commands, R: current mode)
///   0x04 MI_VERSION  (R)
///   0x08 MI_INTR     (R)
///   0x0C MI_MASK     (W: set/clear pairs, R: current mask)
use parking_lot::Mutex;

use super::peripheral::RegisterMap;
use crate::bus::{BusError, Device, DmaPort};
use crate::memory::register::RegisterBlock;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MiInterrupt {
    SP = 0,
    SI = 1,
    AI = 2,
    VI = 3,
    PI = 4,
    DP = 5,
}

const MODE: usize = 0;
const VERSION: usize = 1;
const INTR: usize = 2;
const MASK: usize = 3;

pub const MI_VERSION_RETAIL: u32 = 0x0202_0102;

pub struct Mi {
    regs: Mutex<RegisterMap>,
}

impl Mi {
    pub fn new() -> Result<Self, BusError> {
        let regs = RegisterMap::sequential(
            "MI",
            0x10_0000,
            vec![
                RegisterBlock::dual("MI_MODE", 1),
                RegisterBlock::read_only("MI_VERSION", 1),
                RegisterBlock::read_only("MI_INTR", 1),
                RegisterBlock::dual("MI_MASK", 1),
            ],
        )?;
        Ok(Self {
            regs: Mutex::new(regs),
        })
    }

    pub fn set_version(&self, version: u32) {
        self.regs.lock().set(VERSION, version);
    }

    pub fn version(&self) -> u32 {
        self.regs.lock().visible(VERSION)
    }

    pub fn set_interrupt(&self, irq: MiInterrupt) {
        let mut regs = self.regs.lock();
        let intr = regs.visible(INTR) | (1 << irq as u8);
        regs.publish(INTR, intr);
    }

    pub fn clear_interrupt(&self, irq: MiInterrupt) {
        let mut regs = self.regs.lock();
        let intr = regs.visible(INTR) & !(1 << irq as u8);
        regs.publish(INTR, intr);
    }

    pub fn intr(&self) -> u32 {
        self.regs.lock().visible(INTR)
    }

    pub fn mask(&self) -> u32 {
        self.regs.lock().visible(MASK)
    }

    /// Returns true if any unmasked interrupt is pending.
    pub fn interrupt_pending(&self) -> bool {
        let regs = self.regs.lock();
        regs.visible(INTR) & regs.visible(MASK) & 0x3F != 0
    }

    /// MI_MODE write: set/clear pairs + DP interrupt clear.
    ///
    /// Bit 7: clear init mode, Bit 8: set init mode
    /// Bit 9: clear ebus test, Bit 10: set ebus test
    /// Bit 11: clear DP interrupt
    /// Bit 12: clear RDRAM reg, Bit 13: set RDRAM reg
    fn write_mode(&self, val: u32) {
        let mut mode = self.regs.lock().visible(MODE);
        mode = (mode & !0x7F) | (val & 0x7F);

        for (clear, set, bit) in [(7, 8, 7), (9, 10, 8), (12, 13, 9)] {
            if val & (1 << clear) != 0 {
                mode &= !(1 << bit);
            }
            if val & (1 << set) != 0 {
                mode |= 1 << bit;
            }
        }
        self.regs.lock().publish(MODE, mode);

        if val & (1 << 11) != 0 {
            self.clear_interrupt(MiInterrupt::DP);
        }
    }

    /// MI_MASK write: bit 2n clears mask n, bit 2n+1 sets it.
    fn write_mask(&self, val: u32) {
        let mut regs = self.regs.lock();
        let mut mask = regs.visible(MASK);
        for i in 0..6u32 {
            match (val >> (i * 2)) & 0x03 {
                0b01 => mask &= !(1 << i),
                0b10 => mask |= 1 << i,
                _ => {}
            }
        }
        regs.publish(MASK, mask);
    }
}

impl Device for Mi {
    fn name(&self) -> &'static str {
        "MI"
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
            let val = self.regs.lock().reg(slot);
            match slot {
                MODE => self.write_mode(val),
                MASK => self.write_mask(val),
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

    fn write_reg(mi: &Mi, offset: u32, val: u32) {
        mi.write(offset, &val.to_be_bytes()).unwrap();
        mi.post_write(offset, 4, &NoDma).unwrap();
    }

    #[test]
    fn mask_pairs_gate_pending_interrupts() {
        let mi = Mi::new().unwrap();
        mi.set_interrupt(MiInterrupt::VI);
        assert!(!mi.interrupt_pending());

        write_reg(&mi, 0x0C, 0b10 << 6); // set VI mask
        assert_eq!(mi.mask(), 1 << 3);
        assert!(mi.interrupt_pending());

        write_reg(&mi, 0x0C, 0b01 << 6); // clear VI mask
        assert!(!mi.interrupt_pending());
        assert_eq!(mi.intr(), 1 << 3);
    }

    #[test]
    fn mode_write_clears_dp_interrupt() {
        let mi = Mi::new().unwrap();
        mi.set_interrupt(MiInterrupt::DP);
        write_reg(&mi, 0x00, (1 << 11) | (1 << 8) | 0x15);
        assert_eq!(mi.intr(), 0);
        let mut buf = [0u8; 4];
        mi.read(0x00, &mut buf).unwrap();
        assert_eq!(u32::from_be_bytes(buf), (1 << 7) | 0x15);
    }

    #[test]
    fn intr_and_version_are_read_only() {
        let mi = Mi::new().unwrap();
        mi.set_version(MI_VERSION_RETAIL);
        write_reg(&mi, 0x04, 0);
        write_reg(&mi, 0x08, 0xFF);
        assert_eq!(mi.version(), MI_VERSION_RETAIL);
        assert_eq!(mi.intr(), 0);
    }
}
