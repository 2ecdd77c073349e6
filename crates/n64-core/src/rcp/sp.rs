/// SP: Signal Processor interface.
///
/// Contains 4KB DMEM (data memory) and 4KB IMEM (instruction memory),
/// the DMA engine that fills them, and the status/semaphore registers.
/// DMEM at 0x0400_0000, IMEM at 0x0400_1000 (mirrored up to 0x0403_FFFF),
/// registers at 0x0404_0000, PC/IBIST at 0x0408_0000.
///
/// The vector unit itself is not emulated. When the CPU releases halt the
/// SP immediately halts again with broke set, as if the task ran to its
/// break instruction; intr-on-break then raises the SP interrupt.
use std::sync::Arc;

use parking_lot::Mutex;

use super::mi::{Mi, MiInterrupt};
use super::peripheral::RegisterMap;
use crate::bus::{BusError, Device, DmaPort};
use crate::memory::register::RegisterBlock;

/// Physical base of SP memory.
pub const SP_MEM_BASE: u32 = 0x0400_0000;
pub const SP_MEM_SIZE: u32 = 0x2000;
/// Offsets below this mirror DMEM/IMEM.
const MEM_WINDOW: u32 = 0x4_0000;
const BANK_SIZE: u32 = 0x1000;

// Slot indices in the register map.
const MEM: usize = 0;
const MEM_ADDR: usize = 1;
const DRAM_ADDR: usize = 2;
const RD_LEN: usize = 3;
const WR_LEN: usize = 4;
const STATUS: usize = 5;
const DMA_FULL: usize = 6;
const DMA_BUSY: usize = 7;
const SEMAPHORE: usize = 8;
const PC: usize = 9;

const REG_NAMES: [&str; 8] = [
    "SP_MEM_ADDR",
    "SP_DRAM_ADDR",
    "SP_RD_LEN",
    "SP_WR_LEN",
    "SP_STATUS",
    "SP_DMA_FULL",
    "SP_DMA_BUSY",
    "SP_SEMAPHORE",
];

/// SP_STATUS read bits.
pub mod status {
    pub const HALT: u32 = 0x0001;
    pub const BROKE: u32 = 0x0002;
    pub const DMA_BUSY: u32 = 0x0004;
    pub const DMA_FULL: u32 = 0x0008;
    pub const IO_FULL: u32 = 0x0010;
    pub const SSTEP: u32 = 0x0020;
    pub const INTR_BREAK: u32 = 0x0040;
    /// Signal n lives at bit 7 + n.
    pub const fn signal(n: u32) -> u32 {
        1 << (7 + n)
    }
}

/// SP DMA direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpDma {
    /// RDRAM → DMEM/IMEM
    DramToMem,
    /// DMEM/IMEM → RDRAM
    MemToDram,
}

pub struct Sp {
    regs: Mutex<RegisterMap>,
    mi: Arc<Mi>,
}

impl Sp {
    pub fn new(mi: Arc<Mi>) -> Result<Self, BusError> {
        let mut regs = RegisterMap::new("SP", 0x10_0000)
            .with(0, RegisterBlock::new("SP_MEM", (SP_MEM_SIZE / 4) as usize))?;
        for (i, &name) in REG_NAMES.iter().enumerate() {
            let offset = MEM_WINDOW + i as u32 * 4;
            let block = match i + 1 {
                STATUS | SEMAPHORE | RD_LEN | WR_LEN => RegisterBlock::dual(name, 1),
                DMA_FULL | DMA_BUSY => RegisterBlock::read_only(name, 1),
                _ => RegisterBlock::new(name, 1),
            };
            regs = regs.with(offset, block)?;
        }
        regs = regs
            .with(0x8_0000, RegisterBlock::new("SP_PC", 1))?
            .with(0x8_0004, RegisterBlock::new("SP_IBIST", 1))?;
        regs.set(STATUS, status::HALT);
        Ok(Self {
            regs: Mutex::new(regs),
            mi,
        })
    }

    /// Current SP_STATUS as the CPU would read it.
    pub fn status(&self) -> u32 {
        self.regs.lock().visible(STATUS)
    }

    pub fn pc(&self) -> u32 {
        self.regs.lock().reg(PC) & 0xFFC
    }

    pub fn is_halted(&self) -> bool {
        self.status() & status::HALT != 0
    }

    /// Copy `data` into SP memory at `offset` (0 = DMEM, 0x1000 = IMEM).
    pub fn load(&self, offset: u32, data: &[u8]) -> Result<(), BusError> {
        let mut regs = self.regs.lock();
        let end = (offset as usize + data.len()).min(SP_MEM_SIZE as usize);
        let len = end.saturating_sub(offset as usize);
        regs.block_mut(MEM).cpu_write(offset, &data[..len])?;
        Ok(())
    }

    pub fn read_mem_u32(&self, offset: u32) -> u32 {
        self.regs.lock().block(MEM).visible(((offset & (SP_MEM_SIZE - 1)) / 4) as usize)
    }

    pub fn halt(&self) {
        let mut regs = self.regs.lock();
        let status = regs.visible(STATUS) | status::HALT;
        regs.publish(STATUS, status);
    }

    /// Walk `len` bytes of the mirrored memory window in chunks that stay
    /// inside the 8 KB backing block.
    fn mem_chunks(offset: u32, len: usize) -> impl Iterator<Item = (u32, usize, usize)> {
        let mut pos = 0usize;
        std::iter::from_fn(move || {
            if pos >= len {
                return None;
            }
            let at = (offset + pos as u32) & (SP_MEM_SIZE - 1);
            let n = (len - pos).min((SP_MEM_SIZE - at) as usize);
            let chunk = (at, pos, n);
            pos += n;
            Some(chunk)
        })
    }

    fn run_dma(&self, direction: SpDma, length_reg: u32, dma: &dyn DmaPort) -> Result<(), BusError> {
        let (mem_addr, dram_addr) = {
            let mut regs = self.regs.lock();
            let status = regs.visible(STATUS) | status::DMA_BUSY;
            regs.publish(STATUS, status);
            (regs.reg(MEM_ADDR) & 0x1FF8, regs.reg(DRAM_ADDR) & 0x00FF_FFF8)
        };
        let row_len = (length_reg & 0xFFF) | 7;
        let row_len = row_len + 1;
        let rows = ((length_reg >> 12) & 0xFF) + 1;
        let skip = (length_reg >> 20) & 0xFFF;
        log::debug!(
            "SP DMA {:?}: mem={:#06X} dram={:#010X} len={:#X} count={} skip={:#X}",
            direction,
            mem_addr,
            dram_addr,
            row_len,
            rows,
            skip
        );

        let bank = mem_addr & BANK_SIZE;
        let mut mem_off = mem_addr & (BANK_SIZE - 1);
        let mut dram = dram_addr;
        let mut result = Ok(());
        'rows: for _ in 0..rows {
            // A row wraps inside its 4 KB bank.
            let mut done = 0;
            while done < row_len {
                let n = (row_len - done).min(BANK_SIZE - mem_off);
                let sp_addr = SP_MEM_BASE + bank + mem_off;
                let copied = match direction {
                    SpDma::DramToMem => dma.copy(dram + done, sp_addr, n),
                    SpDma::MemToDram => dma.copy(sp_addr, dram + done, n),
                };
                if let Err(err) = copied {
                    result = Err(err);
                    break 'rows;
                }
                done += n;
                mem_off = (mem_off + n) & (BANK_SIZE - 1);
            }
            dram = dram.wrapping_add(row_len + skip) & 0x00FF_FFFF;
        }

        let mut regs = self.regs.lock();
        regs.set(MEM_ADDR, bank | mem_off);
        regs.set(DRAM_ADDR, dram);
        let slot = match direction {
            SpDma::DramToMem => RD_LEN,
            SpDma::MemToDram => WR_LEN,
        };
        regs.publish(slot, (skip << 20) | 0xFF8);
        let status = regs.visible(STATUS) & !status::DMA_BUSY;
        regs.publish(STATUS, status);
        result
    }

    /// SP_STATUS write: set/clear pairs.
    ///
    /// bit 0/1 clear/set halt, bit 2 clear broke, bit 3/4 clear/set intr,
    /// bit 5/6 clear/set sstep, bit 7/8 clear/set intr-on-break,
    /// bits 9..24 clear/set signal 0..7.
    fn write_status(&self, val: u32) {
        let mut regs = self.regs.lock();
        let mut status = regs.visible(STATUS);
        let mut pair = |clear: u32, set: u32, bit: u32| {
            if val & (1 << clear) != 0 {
                status &= !bit;
            }
            if val & (1 << set) != 0 {
                status |= bit;
            }
        };
        pair(0, 1, status::HALT);
        pair(5, 6, status::SSTEP);
        pair(7, 8, status::INTR_BREAK);
        for n in 0..8 {
            pair(9 + n * 2, 10 + n * 2, status::signal(n));
        }
        if val & (1 << 2) != 0 {
            status &= !status::BROKE;
        }

        let released = status & status::HALT == 0;
        let raise_break = released && status & status::INTR_BREAK != 0;
        if released {
            log::debug!("SP released at PC {:#06X}, halting on break", regs.reg(PC) & 0xFFC);
            status |= status::HALT | status::BROKE;
        }
        regs.publish(STATUS, status);
        drop(regs);

        if val & (1 << 3) != 0 {
            self.mi.clear_interrupt(MiInterrupt::SP);
        }
        if val & (1 << 4) != 0 || raise_break {
            self.mi.set_interrupt(MiInterrupt::SP);
        }
    }
}

impl Device for Sp {
    fn name(&self) -> &'static str {
        "SP"
    }

    fn read(&self, offset: u32, buf: &mut [u8]) -> Result<(), BusError> {
        let mut regs = self.regs.lock();
        if offset < MEM_WINDOW {
            let block = regs.block(MEM);
            for (at, pos, n) in Self::mem_chunks(offset, buf.len()) {
                block.cpu_read(at, &mut buf[pos..pos + n])?;
            }
            return Ok(());
        }
        regs.read(offset, buf)?;
        if regs.touched(offset, buf.len() as u32).contains(&SEMAPHORE) {
            regs.publish(SEMAPHORE, 1);
        }
        Ok(())
    }

    fn write(&self, offset: u32, data: &[u8]) -> Result<(), BusError> {
        let mut regs = self.regs.lock();
        if offset < MEM_WINDOW {
            let block = regs.block_mut(MEM);
            for (at, pos, n) in Self::mem_chunks(offset, data.len()) {
                block.cpu_write(at, &data[pos..pos + n])?;
            }
            return Ok(());
        }
        regs.write(offset, data)
    }

    fn post_write(&self, offset: u32, len: u32, dma: &dyn DmaPort) -> Result<(), BusError> {
        if offset < MEM_WINDOW {
            return Ok(());
        }
        let touched = self.regs.lock().touched(offset, len);
        for slot in touched {
            let val = self.regs.lock().reg(slot);
            match slot {
                RD_LEN => self.run_dma(SpDma::DramToMem, val, dma)?,
                WR_LEN => self.run_dma(SpDma::MemToDram, val, dma)?,
                STATUS => self.write_status(val),
                SEMAPHORE => self.regs.lock().set(SEMAPHORE, 0),
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

    struct RecordingDma(RefCell<Vec<(u32, u32, u32)>>);

    impl DmaPort for RecordingDma {
        fn copy(&self, src: u32, dst: u32, len: u32) -> Result<u32, BusError> {
            self.0.borrow_mut().push((src, dst, len));
            Ok(len)
        }
    }

    fn sp() -> (Sp, Arc<Mi>) {
        let mi = Arc::new(Mi::new().unwrap());
        (Sp::new(Arc::clone(&mi)).unwrap(), mi)
    }

    fn write_reg(sp: &Sp, dma: &dyn DmaPort, offset: u32, val: u32) {
        sp.write(offset, &val.to_be_bytes()).unwrap();
        sp.post_write(offset, 4, dma).unwrap();
    }

    fn read_reg(sp: &Sp, offset: u32) -> u32 {
        let mut buf = [0u8; 4];
        sp.read(offset, &mut buf).unwrap();
        u32::from_be_bytes(buf)
    }

    #[test]
    fn resets_halted() {
        let (sp, _) = sp();
        assert!(sp.is_halted());
        assert_eq!(read_reg(&sp, 0x4_0010), status::HALT);
    }

    #[test]
    fn memory_mirrors_through_window() {
        let (sp, _) = sp();
        let dma = RecordingDma(RefCell::new(Vec::new()));
        write_reg(&sp, &dma, 0x1004, 0xDEAD_BEEF);
        assert_eq!(read_reg(&sp, 0x3_1004), 0xDEAD_BEEF);
        assert_eq!(sp.read_mem_u32(0x1004), 0xDEAD_BEEF);
        // The last IMEM word and first DMEM word are neighbours in the mirror.
        sp.write(0x1FFE, &[1, 2, 3, 4]).unwrap();
        assert_eq!(read_reg(&sp, 0x0000) >> 16, 0x0304);
    }

    #[test]
    fn dma_rows_honour_count_and_skip() {
        let (sp, _) = sp();
        let dma = RecordingDma(RefCell::new(Vec::new()));
        write_reg(&sp, &dma, 0x4_0000, 0x1100);
        write_reg(&sp, &dma, 0x4_0004, 0x0020_0000);
        // len 0x0F -> 16 bytes per row, count 1 -> 2 rows, skip 0x10
        write_reg(&sp, &dma, 0x4_0008, (0x010 << 20) | (1 << 12) | 0x00F);

        assert_eq!(
            *dma.0.borrow(),
            vec![
                (0x0020_0000, 0x0400_1100, 16),
                (0x0020_0020, 0x0400_1110, 16),
            ]
        );
        assert_eq!(read_reg(&sp, 0x4_0000), 0x1120);
        assert_eq!(read_reg(&sp, 0x4_0004), 0x0020_0040);
        assert_eq!(sp.status() & status::DMA_BUSY, 0);
    }

    #[test]
    fn dma_row_wraps_inside_its_bank() {
        let (sp, _) = sp();
        let dma = RecordingDma(RefCell::new(Vec::new()));
        write_reg(&sp, &dma, 0x4_0000, 0x0FF8);
        write_reg(&sp, &dma, 0x4_0004, 0x100);
        write_reg(&sp, &dma, 0x4_000C, 0x00F);
        assert_eq!(
            *dma.0.borrow(),
            vec![(0x0400_0FF8, 0x100, 8), (0x0400_0000, 0x108, 8)]
        );
    }

    #[test]
    fn status_pairs_drive_signals_and_interrupt() {
        let (sp, mi) = sp();
        let dma = RecordingDma(RefCell::new(Vec::new()));
        // set intr, set signal 2
        write_reg(&sp, &dma, 0x4_0010, (1 << 4) | (1 << 14));
        assert_eq!(mi.intr(), 1 << MiInterrupt::SP as u8);
        assert_eq!(sp.status(), status::HALT | status::signal(2));

        write_reg(&sp, &dma, 0x4_0010, (1 << 3) | (1 << 13));
        assert_eq!(mi.intr(), 0);
        assert_eq!(sp.status(), status::HALT);
    }

    #[test]
    fn releasing_halt_breaks_and_raises_when_enabled() {
        let (sp, mi) = sp();
        let dma = RecordingDma(RefCell::new(Vec::new()));
        write_reg(&sp, &dma, 0x4_0010, (1 << 8) | (1 << 2) | 1);
        assert_eq!(
            sp.status(),
            status::HALT | status::BROKE | status::INTR_BREAK
        );
        assert_eq!(mi.intr(), 1 << MiInterrupt::SP as u8);
    }

    #[test]
    fn semaphore_reads_then_latches() {
        let (sp, _) = sp();
        let dma = RecordingDma(RefCell::new(Vec::new()));
        assert_eq!(read_reg(&sp, 0x4_001C), 0);
        assert_eq!(read_reg(&sp, 0x4_001C), 1);
        write_reg(&sp, &dma, 0x4_001C, 0);
        assert_eq!(read_reg(&sp, 0x4_001C), 0);
    }

    #[test]
    fn pc_is_word_aligned_twelve_bits() {
        let (sp, _) = sp();
        let dma = RecordingDma(RefCell::new(Vec::new()));
        write_reg(&sp, &dma, 0x8_0000, 0x1_2347);
        assert_eq!(sp.pc(), 0x344);
    }
}
