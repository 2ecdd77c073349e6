/// PI: Peripheral Interface.
///
/// Handles DMA between the cartridge domain and RDRAM.
/// Writing PI_WR_LEN copies cart → RDRAM, PI_RD_LEN copies RDRAM → cart.
/// Registers at physical 0x0460_0000.
///
/// Transfers run to completion inside the register write, so the CPU
/// never sees PI_STATUS busy; the completion interrupt is raised through
/// MI as soon as the copy lands.
use std::sync::Arc;

use parking_lot::Mutex;

use super::mi::{Mi, MiInterrupt};
use super::peripheral::RegisterMap;
use crate::bus::{BusError, Device, DmaPort};
use crate::memory::register::RegisterBlock;

pub const DRAM_ADDR: usize = 0;
pub const CART_ADDR: usize = 1;
pub const RD_LEN: usize = 2;
pub const WR_LEN: usize = 3;
pub const STATUS: usize = 4;

const NAMES: [&str; 13] = [
    "PI_DRAM_ADDR",
    "PI_CART_ADDR",
    "PI_RD_LEN",
    "PI_WR_LEN",
    "PI_STATUS",
    "PI_BSD_DOM1_LAT",
    "PI_BSD_DOM1_PWD",
    "PI_BSD_DOM1_PGS",
    "PI_BSD_DOM1_RLS",
    "PI_BSD_DOM2_LAT",
    "PI_BSD_DOM2_PWD",
    "PI_BSD_DOM2_PGS",
    "PI_BSD_DOM2_RLS",
];

/// PI_STATUS read bits.
const STATUS_DMA_BUSY: u32 = 0x01;
const STATUS_INTERRUPT: u32 = 0x08;

/// PI DMA direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PiDma {
    /// Cart → RDRAM (loading from ROM/SRAM)
    CartToDram,
    /// RDRAM → Cart (saving to SRAM/Flash)
    DramToCart,
}

pub struct Pi {
    regs: Mutex<RegisterMap>,
    mi: Arc<Mi>,
    /// Completed transfers, for diagnostics.
    dma_count: Mutex<u32>,
}

impl Pi {
    pub fn new(mi: Arc<Mi>) -> Result<Self, BusError> {
        let blocks = NAMES
            .iter()
            .enumerate()
            .map(|(i, &name)| {
                if i == STATUS {
                    RegisterBlock::dual(name, 1)
                } else {
                    RegisterBlock::new(name, 1)
                }
            })
            .collect();
        Ok(Self {
            regs: Mutex::new(RegisterMap::sequential("PI", 0x10_0000, blocks)?),
            mi,
            dma_count: Mutex::new(0),
        })
    }

    pub fn reg(&self, index: usize) -> u32 {
        self.regs.lock().visible(index)
    }

    pub fn dma_count(&self) -> u32 {
        *self.dma_count.lock()
    }

    fn run_dma(&self, direction: PiDma, length_reg: u32, dma: &dyn DmaPort) -> Result<(), BusError> {
        let (dram_addr, cart_addr) = {
            let mut regs = self.regs.lock();
            let dram = regs.reg(DRAM_ADDR) & 0x00FF_FFFF & !1;
            let cart = regs.reg(CART_ADDR) & !1;
            regs.set(DRAM_ADDR, dram);
            regs.set(CART_ADDR, cart);
            let status = regs.visible(STATUS) | STATUS_DMA_BUSY;
            regs.publish(STATUS, status);
            (dram, cart)
        };
        let len = (length_reg & 0x00FF_FFFF) + 1;
        let (src, dst) = match direction {
            PiDma::CartToDram => (cart_addr, dram_addr),
            PiDma::DramToCart => (dram_addr, cart_addr),
        };
        log::debug!(
            "PI DMA {:?}: {:#010X} -> {:#010X}, len={:#X}",
            direction,
            src,
            dst,
            len
        );

        let result = dma.copy(src, dst, len);

        let mut regs = self.regs.lock();
        let status = regs.visible(STATUS) & !STATUS_DMA_BUSY;
        match result {
            Ok(count) => {
                regs.set(DRAM_ADDR, dram_addr.wrapping_add(count) & 0x00FF_FFFF);
                regs.set(CART_ADDR, cart_addr.wrapping_add(count));
                regs.publish(STATUS, status | STATUS_INTERRUPT);
                drop(regs);
                *self.dma_count.lock() += 1;
                self.mi.set_interrupt(MiInterrupt::PI);
                Ok(())
            }
            Err(err) => {
                regs.publish(STATUS, status);
                log::warn!("PI DMA {:?} failed: {}", direction, err);
                Err(err)
            }
        }
    }

    /// PI_STATUS write: bit 0 resets the controller, bit 1 acks the interrupt.
    fn write_status(&self, val: u32) {
        let mut regs = self.regs.lock();
        if val & 0x01 != 0 {
            regs.publish(STATUS, 0);
        }
        if val & 0x02 != 0 {
            let status = regs.visible(STATUS) & !STATUS_INTERRUPT;
            regs.publish(STATUS, status);
            drop(regs);
            self.mi.clear_interrupt(MiInterrupt::PI);
        }
    }
}

impl Device for Pi {
    fn name(&self) -> &'static str {
        "PI"
    }

    fn read(&self, offset: u32, buf: &mut [u8]) -> Result<(), BusError> {
        self.regs.lock().read(offset, buf)
    }

    fn write(&self, offset: u32, data: &[u8]) -> Result<(), BusError> {
        self.regs.lock().write(offset, data)
    }

    fn post_write(&self, offset: u32, len: u32, dma: &dyn DmaPort) -> Result<(), BusError> {
        let touched = self.regs.lock().touched(offset, len);
        for slot in touched {
            let val = self.regs.lock().reg(slot);
            log::debug!("PI write: {} = {:#010X}", NAMES[slot], val);
            match slot {
                RD_LEN => self.run_dma(PiDma::DramToCart, val, dma)?,
                WR_LEN => self.run_dma(PiDma::CartToDram, val, dma)?,
                STATUS => self.write_status(val),
                _ => {}
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;

    /// Records requested copies; fails past `limit` bytes.
    struct RecordingDma {
        copies: RefCell<Vec<(u32, u32, u32)>>,
        limit: u32,
    }

    impl DmaPort for RecordingDma {
        fn copy(&self, src: u32, dst: u32, len: u32) -> Result<u32, BusError> {
            self.copies.borrow_mut().push((src, dst, len));
            if len > self.limit {
                return Err(BusError::MemoryCopy {
                    count: self.limit,
                    source: Box::new(BusError::Unmapped(src + self.limit)),
                });
            }
            Ok(len)
        }
    }

    fn pi() -> (Pi, Arc<Mi>) {
        let mi = Arc::new(Mi::new().unwrap());
        (Pi::new(Arc::clone(&mi)).unwrap(), mi)
    }

    fn write_reg(pi: &Pi, dma: &dyn DmaPort, index: usize, val: u32) -> Result<(), BusError> {
        let offset = index as u32 * 4;
        pi.write(offset, &val.to_be_bytes())?;
        pi.post_write(offset, 4, dma)
    }

    #[test]
    fn wr_len_copies_cart_to_dram_with_length_plus_one() {
        let (pi, mi) = pi();
        let dma = RecordingDma {
            copies: RefCell::new(Vec::new()),
            limit: u32::MAX,
        };
        write_reg(&pi, &dma, DRAM_ADDR, 0x8040_0001).unwrap();
        write_reg(&pi, &dma, CART_ADDR, 0x1000_1000).unwrap();
        write_reg(&pi, &dma, WR_LEN, 0x0000_0FFF).unwrap();

        assert_eq!(*dma.copies.borrow(), vec![(0x1000_1000, 0x0040_0000, 0x1000)]);
        assert_eq!(pi.reg(DRAM_ADDR), 0x0040_1000);
        assert_eq!(pi.reg(CART_ADDR), 0x1000_2000);
        assert_eq!(pi.reg(STATUS), STATUS_INTERRUPT);
        assert_eq!(mi.intr(), 1 << MiInterrupt::PI as u8);
        assert_eq!(pi.dma_count(), 1);

        write_reg(&pi, &dma, STATUS, 0x02).unwrap();
        assert_eq!(pi.reg(STATUS), 0);
        assert_eq!(mi.intr(), 0);
    }

    #[test]
    fn rd_len_copies_dram_to_cart() {
        let (pi, _) = pi();
        let dma = RecordingDma {
            copies: RefCell::new(Vec::new()),
            limit: u32::MAX,
        };
        write_reg(&pi, &dma, DRAM_ADDR, 0x0000_0200).unwrap();
        write_reg(&pi, &dma, CART_ADDR, 0x1000_0041).unwrap();
        write_reg(&pi, &dma, RD_LEN, 0x7F).unwrap();
        assert_eq!(*dma.copies.borrow(), vec![(0x0000_0200, 0x1000_0040, 0x80)]);
    }

    #[test]
    fn failed_copy_propagates_partial_count() {
        let (pi, mi) = pi();
        let dma = RecordingDma {
            copies: RefCell::new(Vec::new()),
            limit: 0x40,
        };
        write_reg(&pi, &dma, CART_ADDR, 0x1000_0000).unwrap();
        let err = write_reg(&pi, &dma, WR_LEN, 0xFF).unwrap_err();
        assert!(matches!(err, BusError::MemoryCopy { count: 0x40, .. }));
        assert_eq!(pi.reg(STATUS) & STATUS_DMA_BUSY, 0);
        assert_eq!(mi.intr(), 0);
    }
}
