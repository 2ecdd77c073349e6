use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use super::admission::Admission;
use super::region::{resolve, Region};
use super::{Bus, BusError, Device, DmaPort, Transfer};
use crate::cart::Cartridge;
use crate::memory::pif::Pif;
use crate::memory::rdram::Rdram;
use crate::rcp::ai::Ai;
use crate::rcp::mi::Mi;
use crate::rcp::peripheral::RegisterFile;
use crate::rcp::pi::Pi;
use crate::rcp::si::Si;
use crate::rcp::sp::Sp;
use crate::rcp::vi::Vi;

/// Past this many distinct ranges the pending code writes collapse into
/// one covering span.
const MAX_CODE_WRITES: usize = 1024;

/// The concrete bus that wires all hardware components together.
/// Physical address dispatch happens here.
///
/// Every access takes whole-bus admission: any number of readers, or any
/// number of writers, never both. Device side effects (DMA kicks, PIF
/// command processing) run from the post-write hook while the writer's
/// admission is still held, and DMA copies go through `DmaPort` without
/// admitting again.
pub struct Interconnect {
    admission: Admission,
    pub rdram: Rdram,
    pub rdram_regs: RegisterFile,
    pub sp: Sp,
    pub dp_command: RegisterFile,
    pub dp_span: RegisterFile,
    pub mi: Arc<Mi>,
    pub vi: Vi,
    pub ai: Ai,
    pub pi: Pi,
    pub ri: RegisterFile,
    pub si: Si,
    pub cart: Cartridge,
    pub pif: Pif,
    /// Record RDRAM writes for the recompiler when set.
    code_watch: AtomicBool,
    /// Guest physical ranges where code may have changed since the last drain.
    code_writes: Mutex<Vec<(u32, u32)>>,
}

impl Interconnect {
    pub fn new(cart: Cartridge, rdram_size: usize) -> Result<Self, BusError> {
        let mi = Arc::new(Mi::new()?);
        Ok(Self {
            admission: Admission::new(),
            rdram: Rdram::new(rdram_size),
            rdram_regs: RegisterFile::new("RDRAM regs", 10, Region::RdramRegs.size())?,
            sp: Sp::new(Arc::clone(&mi))?,
            dp_command: RegisterFile::new("DP command", 8, Region::DpCommand.size())?,
            dp_span: RegisterFile::new("DP span", 4, Region::DpSpan.size())?,
            vi: Vi::new(Arc::clone(&mi))?,
            ai: Ai::new(Arc::clone(&mi))?,
            pi: Pi::new(Arc::clone(&mi))?,
            ri: RegisterFile::new("RI", 8, Region::Ri.size())?,
            si: Si::new(Arc::clone(&mi))?,
            mi,
            cart,
            pif: Pif::new(),
            code_watch: AtomicBool::new(false),
            code_writes: Mutex::new(Vec::new()),
        })
    }

    pub fn device(&self, region: Region) -> &dyn Device {
        match region {
            Region::Rdram => &self.rdram,
            Region::RdramRegs => &self.rdram_regs,
            Region::Sp => &self.sp,
            Region::DpCommand => &self.dp_command,
            Region::DpSpan => &self.dp_span,
            Region::Mi => self.mi.as_ref(),
            Region::Vi => &self.vi,
            Region::Ai => &self.ai,
            Region::Pi => &self.pi,
            Region::Ri => &self.ri,
            Region::Si => &self.si,
            Region::Cartridge => &self.cart,
            Region::Pif => &self.pif,
        }
    }

    /// Start or stop recording RDRAM writes for `take_code_writes`.
    pub fn set_code_watch(&self, enabled: bool) {
        self.code_watch.store(enabled, Ordering::Release);
        if !enabled {
            self.code_writes.lock().clear();
        }
    }

    pub fn admission(&self) -> &Admission {
        &self.admission
    }

    pub fn read(&self, addr: u32, buf: &mut [u8], transfer: Transfer) -> Result<(), BusError> {
        let _guard = self.admission.read();
        self.read_span(addr, buf, transfer)
    }

    pub fn write(&self, addr: u32, data: &[u8], transfer: Transfer) -> Result<(), BusError> {
        let _guard = self.admission.write();
        self.write_span(addr, data, transfer)
    }

    /// DMA-style copy for callers outside the bus (debuggers, boot code).
    pub fn memory_copy(&self, src: u32, dst: u32, len: u32) -> Result<u32, BusError> {
        let _guard = self.admission.write();
        self.copy(src, dst, len)
    }

    /// Split `[addr, addr + len)` into runs owned by one region, resolving
    /// every byte.
    fn runs(addr: u32, len: usize) -> Result<Vec<(Region, u32, usize, usize)>, BusError> {
        let mut runs: Vec<(Region, u32, usize, usize)> = Vec::new();
        for i in 0..len {
            let (region, offset) = resolve(addr.wrapping_add(i as u32))?;
            match runs.last_mut() {
                Some((r, start, _, n)) if *r == region && *start + *n as u32 == offset => *n += 1,
                _ => runs.push((region, offset, i, 1)),
            }
        }
        Ok(runs)
    }

    fn aligned_target(addr: u32, len: usize) -> Result<(Region, u32), BusError> {
        let (region, offset) = resolve(addr)?;
        if u64::from(offset) + len as u64 > u64::from(region.size()) {
            return Err(BusError::OutOfRange {
                device: region.name(),
                offset,
                len: len as u32,
            });
        }
        Ok((region, offset))
    }

    fn read_span(&self, addr: u32, buf: &mut [u8], transfer: Transfer) -> Result<(), BusError> {
        match transfer {
            Transfer::Aligned => {
                let (region, offset) = Self::aligned_target(addr, buf.len())?;
                self.device(region).read(offset, buf)
            }
            Transfer::Unaligned => {
                for (region, offset, pos, n) in Self::runs(addr, buf.len())? {
                    self.device(region).read(offset, &mut buf[pos..pos + n])?;
                }
                Ok(())
            }
        }
    }

    fn write_span(&self, addr: u32, data: &[u8], transfer: Transfer) -> Result<(), BusError> {
        match transfer {
            Transfer::Aligned => {
                let (region, offset) = Self::aligned_target(addr, data.len())?;
                self.write_device(region, offset, data)
            }
            Transfer::Unaligned => {
                for (region, offset, pos, n) in Self::runs(addr, data.len())? {
                    self.write_device(region, offset, &data[pos..pos + n])?;
                }
                Ok(())
            }
        }
    }

    fn write_device(&self, region: Region, offset: u32, data: &[u8]) -> Result<(), BusError> {
        let device = self.device(region);
        device.write(offset, data)?;
        if region == Region::Rdram {
            self.note_code_write(offset, data.len() as u32);
        }
        device.post_write(offset, data.len() as u32, self)
    }

    fn note_code_write(&self, start: u32, len: u32) {
        if len == 0 || !self.code_watch.load(Ordering::Acquire) {
            return;
        }
        let mut writes = self.code_writes.lock();
        if let Some((last_start, last_len)) = writes.last_mut() {
            let last_end = last_start.saturating_add(*last_len);
            if start >= *last_start && start <= last_end {
                let new_end = last_end.max(start.saturating_add(len));
                *last_len = new_end - *last_start;
                return;
            }
        }
        writes.push((start, len));
        if writes.len() > MAX_CODE_WRITES {
            let lo = writes.iter().map(|(s, _)| *s).min().unwrap_or(start);
            let hi = writes
                .iter()
                .map(|(s, l)| s.saturating_add(*l))
                .max()
                .unwrap_or(start + len);
            writes.clear();
            writes.push((lo, hi - lo));
        }
    }
}

impl DmaPort for Interconnect {
    fn copy(&self, src: u32, dst: u32, len: u32) -> Result<u32, BusError> {
        let mut done = 0u32;
        let mut chunk = [0u8; 4];
        while done < len {
            let n = (len - done).min(4) as usize;
            let step = self
                .read_span(src.wrapping_add(done), &mut chunk[..n], Transfer::Unaligned)
                .and_then(|()| {
                    self.write_span(dst.wrapping_add(done), &chunk[..n], Transfer::Unaligned)
                });
            if let Err(err) = step {
                return Err(BusError::MemoryCopy {
                    count: done,
                    source: Box::new(err),
                });
            }
            done += n as u32;
        }
        Ok(done)
    }
}

fn transfer_for(addr: u32, len: usize) -> Transfer {
    if len.is_power_of_two() && addr as usize % len == 0 {
        Transfer::Aligned
    } else {
        Transfer::Unaligned
    }
}

impl Bus for Interconnect {
    fn read(&self, addr: u32, buf: &mut [u8]) -> Result<(), BusError> {
        Interconnect::read(self, addr, buf, transfer_for(addr, buf.len()))
    }

    fn write(&self, addr: u32, data: &[u8]) -> Result<(), BusError> {
        Interconnect::write(self, addr, data, transfer_for(addr, data.len()))
    }

    fn take_code_writes(&self) -> Vec<(u32, u32)> {
        std::mem::take(&mut *self.code_writes.lock())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::rdram::RDRAM_SIZE;
    use crate::rcp::mi::MiInterrupt;
    use rand::Rng;
    use std::sync::atomic::AtomicUsize;

    fn test_cart(size: usize) -> Cartridge {
        let mut rom = vec![0u8; size];
        rom[0..4].copy_from_slice(&0x8037_1240u32.to_be_bytes());
        for (i, byte) in rom.iter_mut().enumerate().skip(0x1000) {
            *byte = i as u8;
        }
        Cartridge::from_bytes(rom).unwrap()
    }

    fn interconnect() -> Interconnect {
        let _ = env_logger::builder().is_test(true).try_init();
        Interconnect::new(test_cart(0x2000), RDRAM_SIZE).unwrap()
    }

    #[test]
    fn words_round_trip_through_rdram_and_registers() {
        let bus = interconnect();
        bus.write_u32(0x0000_1000, 0x1234_5678).unwrap();
        assert_eq!(bus.read_u32(0x0000_1000).unwrap(), 0x1234_5678);
        assert_eq!(bus.read_u16(0x0000_1002).unwrap(), 0x5678);

        bus.write_u32(0x0470_0004, 0x40).unwrap();
        assert_eq!(bus.read_u32(0x0470_0004).unwrap(), 0x40);
    }

    #[test]
    fn unmapped_access_fails_with_address() {
        let bus = interconnect();
        assert_eq!(bus.read_u32(0x0500_0000), Err(BusError::Unmapped(0x0500_0000)));
        assert_eq!(
            bus.write_u8(0x1FD0_0000, 1),
            Err(BusError::Unmapped(0x1FD0_0000))
        );
    }

    #[test]
    fn aligned_transfer_may_not_cross_a_device_end() {
        let bus = interconnect();
        let mut buf = [0u8; 8];
        let err = Interconnect::read(&bus, 0x03EF_FFFC, &mut buf, Transfer::Aligned).unwrap_err();
        assert!(matches!(err, BusError::OutOfRange { offset: 0x03EF_FFFC, .. }));
    }

    #[test]
    fn unaligned_transfer_walks_across_devices() {
        let bus = interconnect();
        // The last two RDRAM bytes lie past the installed store and read
        // zero; the next two come from the RDRAM register file.
        bus.rdram_regs.set(0, 0xAABB_CCDD);
        let mut buf = [0u8; 4];
        Interconnect::read(&bus, 0x03EF_FFFE, &mut buf, Transfer::Unaligned).unwrap();
        assert_eq!(buf, [0, 0, 0xAA, 0xBB]);

        // A walk that runs into a hole fails at the first unmapped byte.
        let err = Interconnect::read(&bus, 0x048F_FFFE, &mut buf, Transfer::Unaligned).unwrap_err();
        assert_eq!(err, BusError::Unmapped(0x0490_0000));
    }

    #[test]
    fn pi_dma_loads_cart_into_rdram_and_raises_mi() {
        let bus = interconnect();
        bus.write_u32(0x0460_0000, 0x0000_2000).unwrap(); // PI_DRAM_ADDR
        bus.write_u32(0x0460_0004, 0x1000_1000).unwrap(); // PI_CART_ADDR
        bus.write_u32(0x0460_000C, 0x0000_000F).unwrap(); // PI_WR_LEN

        assert_eq!(bus.read_u32(0x2000).unwrap(), 0x0001_0203);
        assert_eq!(bus.read_u32(0x200C).unwrap(), 0x0C0D_0E0F);
        assert_eq!(bus.read_u32(0x0460_0000).unwrap(), 0x2010);
        assert_eq!(bus.mi.intr(), 1 << MiInterrupt::PI as u8);
    }

    #[test]
    fn dma_reports_bytes_copied_before_fault() {
        let bus = interconnect();
        // The destination runs off the end of the SI window into a hole.
        let err = bus.memory_copy(0x1000_0000, 0x048F_FFF8, 16).unwrap_err();
        match err {
            BusError::MemoryCopy { count, source } => {
                assert_eq!(count, 8);
                assert_eq!(*source, BusError::Unmapped(0x0490_0000));
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn si_round_trip_runs_pif_commands() {
        let bus = interconnect();
        bus.pif.controller(0).unwrap().append(crate::memory::Buttons::START);

        // Command frame in RDRAM: poll channel 0, end marker, JoyBus bit.
        let mut frame = [0u8; 64];
        frame[0..7].copy_from_slice(&[0x01, 0x04, 0x01, 0xFF, 0xFF, 0xFF, 0xFF]);
        frame[7] = 0xFE;
        frame[63] = 0x01;
        for (i, chunk) in frame.chunks(4).enumerate() {
            let word = u32::from_be_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
            bus.write_u32(0x3000 + i as u32 * 4, word).unwrap();
        }

        bus.write_u32(0x0480_0000, 0x3000).unwrap(); // SI_DRAM_ADDR
        bus.write_u32(0x0480_0010, 0x1FC0_07C0).unwrap(); // WR64B
        bus.write_u32(0x0480_0000, 0x3100).unwrap();
        bus.write_u32(0x0480_0004, 0x1FC0_07C0).unwrap(); // RD64B

        // Response bytes follow the single command byte: buttons, then stick.
        let reply: Vec<u8> = (3..7).map(|i| bus.read_u8(0x3100 + i).unwrap()).collect();
        assert_eq!(reply, [0x10, 0x00, 0x00, 0x00]);
        assert_eq!(bus.read_u8(0x3100 + 7).unwrap(), 0xFE);
        assert_eq!(bus.read_u8(0x3100 + 63).unwrap(), 0);
        assert_ne!(bus.mi.intr() & (1 << MiInterrupt::SI as u8), 0);
    }

    #[test]
    fn rdram_writes_are_recorded_only_while_watched() {
        let bus = interconnect();
        bus.write_u32(0x100, 1).unwrap();
        assert!(bus.take_code_writes().is_empty());

        bus.set_code_watch(true);
        bus.write_u32(0x100, 1).unwrap();
        bus.write_u32(0x104, 2).unwrap();
        bus.write_u32(0x0430_000C, 0).unwrap();
        bus.write_u32(0x800, 3).unwrap();
        assert_eq!(bus.take_code_writes(), vec![(0x100, 8), (0x800, 4)]);
        assert!(bus.take_code_writes().is_empty());
    }

    #[test]
    fn many_scattered_code_writes_collapse_into_one_span() {
        let bus = interconnect();
        bus.set_code_watch(true);
        for i in 0..=MAX_CODE_WRITES as u32 {
            bus.write_u8(0x1000 + i * 16, 0).unwrap();
        }
        assert_eq!(
            bus.take_code_writes(),
            vec![(0x1000, MAX_CODE_WRITES as u32 * 16 + 1)]
        );
    }

    /// Readers must never observe half of a concurrent 8-byte store.
    #[test]
    fn concurrent_doubleword_stores_are_never_torn() {
        let bus = interconnect();
        let patterns = [0x1111_1111_1111_1111u64, 0x2222_2222_2222_2222];
        bus.write_u64(0x4000, patterns[0]).unwrap();
        let torn = AtomicUsize::new(0);

        std::thread::scope(|s| {
            for _ in 0..2 {
                let bus = &bus;
                s.spawn(move || {
                    let mut rng = rand::thread_rng();
                    for _ in 0..2000 {
                        let value = patterns[rng.gen_range(0..2)];
                        bus.write_u64(0x4000, value).unwrap();
                        if rng.gen_bool(0.1) {
                            std::thread::yield_now();
                        }
                    }
                });
            }
            for _ in 0..2 {
                let bus = &bus;
                let torn = &torn;
                s.spawn(move || {
                    let mut rng = rand::thread_rng();
                    for _ in 0..2000 {
                        let value = bus.read_u64(0x4000).unwrap();
                        if !patterns.contains(&value) {
                            torn.fetch_add(1, Ordering::Relaxed);
                        }
                        if rng.gen_bool(0.1) {
                            std::thread::yield_now();
                        }
                    }
                });
            }
        });

        assert_eq!(torn.load(Ordering::Relaxed), 0);
        assert_eq!(bus.admission().readers(), 0);
        assert_eq!(bus.admission().writers(), 0);
    }
}
