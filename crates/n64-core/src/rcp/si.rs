/// SI: Serial Interface.
///
/// Handles DMA between PIF RAM (64 bytes) and RDRAM for controller I/O.
/// Writing to SI_PIF_ADDR_RD64B (0x04) triggers PIF→RDRAM.
/// Writing to SI_PIF_ADDR_WR64B (0x10) triggers RDRAM→PIF.
/// Both raise an SI interrupt on completion.
/// Registers at physical 0x0480_0000.
///
/// The value written to RD64B/WR64B is the PIF address, which is always
/// PIF RAM; the RDRAM side comes from SI_DRAM_ADDR.
use std::sync::Arc;

use parking_lot::Mutex;

use super::mi::{Mi, MiInterrupt};
use super::peripheral::RegisterMap;
use crate::bus::{BusError, Device, DmaPort};
use crate::memory::pif::PIF_RAM_ADDR;
use crate::memory::register::RegisterBlock;

const DRAM_ADDR: usize = 0;
const PIF_ADDR_RD64B: usize = 1;
const PIF_ADDR_WR64B: usize = 2;
const STATUS: usize = 3;

const STATUS_INTERRUPT: u32 = 1 << 12;

/// Bytes moved by one SI DMA.
pub const SI_DMA_LEN: u32 = 64;

/// SI DMA direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SiDma {
    /// PIF RAM → RDRAM (game reads controller state)
    PifToDram,
    /// RDRAM → PIF RAM (game sends commands to PIF)
    DramToPif,
}

pub struct Si {
    regs: Mutex<RegisterMap>,
    mi: Arc<Mi>,
    /// (dram_addr, direction) of recent transfers, newest last.
    dma_log: Mutex<Vec<(u32, SiDma)>>,
}

const DMA_LOG_DEPTH: usize = 64;

impl Si {
    pub fn new(mi: Arc<Mi>) -> Result<Self, BusError> {
        let regs = RegisterMap::new("SI", 0x10_0000)
            .with(0x00, RegisterBlock::new("SI_DRAM_ADDR", 1))?
            .with(0x04, RegisterBlock::new("SI_PIF_ADDR_RD64B", 1))?
            .with(0x10, RegisterBlock::new("SI_PIF_ADDR_WR64B", 1))?
            .with(0x18, RegisterBlock::dual("SI_STATUS", 1))?;
        Ok(Self {
            regs: Mutex::new(regs),
            mi,
            dma_log: Mutex::new(Vec::new()),
        })
    }

    pub fn status(&self) -> u32 {
        self.regs.lock().visible(STATUS)
    }

    pub fn dram_addr(&self) -> u32 {
        self.regs.lock().reg(DRAM_ADDR) & 0x00FF_FFFF
    }

    pub fn recent_dma(&self) -> Vec<(u32, SiDma)> {
        self.dma_log.lock().clone()
    }

    fn run_dma(&self, direction: SiDma, dma: &dyn DmaPort) -> Result<(), BusError> {
        let dram = self.dram_addr();
        let (src, dst) = match direction {
            SiDma::PifToDram => (PIF_RAM_ADDR, dram),
            SiDma::DramToPif => (dram, PIF_RAM_ADDR),
        };
        log::debug!("SI DMA {:?}: {:#010X} -> {:#010X}", direction, src, dst);
        dma.copy(src, dst, SI_DMA_LEN)?;

        {
            let mut log = self.dma_log.lock();
            if log.len() == DMA_LOG_DEPTH {
                log.remove(0);
            }
            log.push((dram, direction));
        }
        {
            let mut regs = self.regs.lock();
            let status = regs.visible(STATUS) | STATUS_INTERRUPT;
            regs.publish(STATUS, status);
        }
        self.mi.set_interrupt(MiInterrupt::SI);
        Ok(())
    }
}

impl Device for Si {
    fn name(&self) -> &'static str {
        "SI"
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
            match slot {
                PIF_ADDR_RD64B => self.run_dma(SiDma::PifToDram, dma)?,
                PIF_ADDR_WR64B => self.run_dma(SiDma::DramToPif, dma)?,
                STATUS => {
                    let mut regs = self.regs.lock();
                    let status = regs.visible(STATUS) & !STATUS_INTERRUPT;
                    regs.publish(STATUS, status);
                    drop(regs);
                    self.mi.clear_interrupt(MiInterrupt::SI);
                }
                _ => {}
            }
        }
        Ok(())
    }
}
