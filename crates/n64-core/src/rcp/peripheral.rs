/// Register layout shared by the memory-mapped RCP interfaces.
///
/// A `RegisterMap` places register blocks at fixed device-relative byte
/// offsets. Gaps between blocks read as zero and swallow writes. Layouts
/// are validated once at construction: offsets must be word aligned,
/// blocks must not overlap and must fit inside the device.
use parking_lot::Mutex;

use crate::bus::{BusError, Device};
use crate::memory::register::RegisterBlock;

pub struct RegisterMap {
    device: &'static str,
    size: u32,
    slots: Vec<(u32, RegisterBlock)>,
}

impl RegisterMap {
    pub fn new(device: &'static str, size: u32) -> Self {
        Self {
            device,
            size,
            slots: Vec::new(),
        }
    }

    /// Lay `blocks` out back to back from offset 0.
    pub fn sequential(
        device: &'static str,
        size: u32,
        blocks: Vec<RegisterBlock>,
    ) -> Result<Self, BusError> {
        let mut map = Self::new(device, size);
        let mut offset = 0;
        for block in blocks {
            let len = block.size_bytes();
            map = map.with(offset, block)?;
            offset += len;
        }
        Ok(map)
    }

    /// Place `block` at `offset`. Slot indices follow insertion order.
    pub fn with(mut self, offset: u32, block: RegisterBlock) -> Result<Self, BusError> {
        let layout_error = BusError::Layout {
            device: self.device,
            offset,
        };
        let size = block.size_bytes();
        if offset % 4 != 0 || size == 0 || offset.checked_add(size).map_or(true, |end| end > self.size) {
            return Err(layout_error);
        }
        let overlaps = self
            .slots
            .iter()
            .any(|(base, other)| offset < base + other.size_bytes() && *base < offset + size);
        if overlaps {
            return Err(layout_error);
        }
        self.slots.push((offset, block));
        Ok(self)
    }

    pub fn size(&self) -> u32 {
        self.size
    }

    fn locate(&self, offset: u32) -> Option<usize> {
        self.slots
            .iter()
            .position(|(base, block)| offset >= *base && offset < base + block.size_bytes())
    }

    /// First byte at or after `offset` that belongs to a block.
    fn next_mapped(&self, offset: u32) -> u32 {
        self.slots
            .iter()
            .map(|(base, _)| *base)
            .filter(|base| *base > offset)
            .min()
            .unwrap_or(self.size)
    }

    fn check(&self, offset: u32, len: usize) -> Result<(), BusError> {
        if offset as u64 + len as u64 > u64::from(self.size) {
            return Err(BusError::OutOfRange {
                device: self.device,
                offset,
                len: len as u32,
            });
        }
        Ok(())
    }

    pub fn read(&self, offset: u32, buf: &mut [u8]) -> Result<(), BusError> {
        self.check(offset, buf.len())?;
        let mut pos = 0usize;
        while pos < buf.len() {
            let addr = offset + pos as u32;
            let remaining = buf.len() - pos;
            match self.locate(addr) {
                Some(slot) => {
                    let (base, block) = &self.slots[slot];
                    let n = remaining.min((base + block.size_bytes() - addr) as usize);
                    block.cpu_read(addr - base, &mut buf[pos..pos + n])?;
                    pos += n;
                }
                None => {
                    let n = remaining.min((self.next_mapped(addr) - addr) as usize);
                    buf[pos..pos + n].fill(0);
                    pos += n;
                }
            }
        }
        Ok(())
    }

    pub fn write(&mut self, offset: u32, data: &[u8]) -> Result<(), BusError> {
        self.check(offset, data.len())?;
        let mut pos = 0usize;
        while pos < data.len() {
            let addr = offset + pos as u32;
            let remaining = data.len() - pos;
            match self.locate(addr) {
                Some(slot) => {
                    let (base, block) = &mut self.slots[slot];
                    let n = remaining.min((*base + block.size_bytes() - addr) as usize);
                    block.cpu_write(addr - *base, &data[pos..pos + n])?;
                    pos += n;
                }
                None => {
                    let n = remaining.min((self.next_mapped(addr) - addr) as usize);
                    log::trace!("{}: write to unmapped offset {:#X} dropped", self.device, addr);
                    pos += n;
                }
            }
        }
        Ok(())
    }

    /// Slot indices overlapping `[offset, offset + len)`.
    pub fn touched(&self, offset: u32, len: u32) -> Vec<usize> {
        let end = offset.saturating_add(len);
        self.slots
            .iter()
            .enumerate()
            .filter(|(_, (base, block))| offset < base + block.size_bytes() && *base < end)
            .map(|(i, _)| i)
            .collect()
    }

    pub fn block(&self, slot: usize) -> &RegisterBlock {
        &self.slots[slot].1
    }

    pub fn block_mut(&mut self, slot: usize) -> &mut RegisterBlock {
        &mut self.slots[slot].1
    }

    /// CPU-written value of a single-word register.
    pub fn reg(&self, slot: usize) -> u32 {
        self.block(slot).written(0)
    }

    /// CPU-visible value of a single-word register.
    pub fn visible(&self, slot: usize) -> u32 {
        self.block(slot).visible(0)
    }

    /// Update the CPU-visible value of a single-word register.
    pub fn publish(&mut self, slot: usize, value: u32) {
        self.block_mut(slot).publish(0, value);
    }

    /// Set both sides of a single-word register.
    pub fn set(&mut self, slot: usize, value: u32) {
        self.block_mut(slot).set(0, value);
    }
}

/// Plain register file with no behaviour attached.
///
/// Used for the interfaces whose side effects live outside this core
/// (RDRAM configuration, RI, the RDP command and span units): software can
/// program them and read back what it wrote.
pub struct RegisterFile {
    name: &'static str,
    regs: Mutex<RegisterMap>,
}

impl RegisterFile {
    pub fn new(name: &'static str, words: usize, size: u32) -> Result<Self, BusError> {
        let blocks = (0..words).map(|_| RegisterBlock::new(name, 1)).collect();
        Ok(Self {
            name,
            regs: Mutex::new(RegisterMap::sequential(name, size, blocks)?),
        })
    }

    pub fn reg(&self, index: usize) -> u32 {
        self.regs.lock().reg(index)
    }

    pub fn set(&self, index: usize, value: u32) {
        self.regs.lock().set(index, value);
    }
}

impl Device for RegisterFile {
    fn name(&self) -> &'static str {
        self.name
    }

    fn read(&self, offset: u32, buf: &mut [u8]) -> Result<(), BusError> {
        self.regs.lock().read(offset, buf)
    }

    fn write(&self, offset: u32, data: &[u8]) -> Result<(), BusError> {
        self.regs.lock().write(offset, data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn two_regs() -> RegisterMap {
        RegisterMap::new("dev", 0x100)
            .with(0x00, RegisterBlock::new("a", 1))
            .unwrap()
            .with(0x10, RegisterBlock::new("b", 1))
            .unwrap()
    }

    #[test]
    fn layout_rejects_misaligned_overlapping_and_oversized_blocks() {
        let map = two_regs();
        assert!(matches!(
            map.with(0x02, RegisterBlock::new("c", 1)),
            Err(BusError::Layout { offset: 0x02, .. })
        ));
        assert!(two_regs().with(0x10, RegisterBlock::new("c", 1)).is_err());
        assert!(two_regs().with(0xFC, RegisterBlock::new("c", 2)).is_err());
    }

    #[test]
    fn holes_read_zero_and_swallow_writes() {
        let mut map = two_regs();
        map.set(0, 0xAABB_CCDD);
        map.set(1, 0x1122_3344);
        map.write(0x08, &[0xFF; 4]).unwrap();

        let mut buf = [0xEEu8; 0x14];
        map.read(0, &mut buf).unwrap();
        assert_eq!(&buf[0..4], &[0xAA, 0xBB, 0xCC, 0xDD]);
        assert_eq!(&buf[4..0x10], &[0u8; 12]);
        assert_eq!(&buf[0x10..0x14], &[0x11, 0x22, 0x33, 0x44]);
    }

    #[test]
    fn touched_reports_overlapping_slots() {
        let map = two_regs();
        assert_eq!(map.touched(0x00, 4), vec![0]);
        assert_eq!(map.touched(0x02, 0x10), vec![0, 1]);
        assert!(map.touched(0x20, 4).is_empty());
    }

    #[test]
    fn register_file_reads_back_writes() {
        let ri = RegisterFile::new("RI", 8, 0x10_0000).unwrap();
        ri.write(0x04, &0x0000_0040u32.to_be_bytes()).unwrap();
        assert_eq!(ri.reg(1), 0x40);
        let mut buf = [0u8; 4];
        ri.read(0x04, &mut buf).unwrap();
        assert_eq!(u32::from_be_bytes(buf), 0x40);
        assert!(ri.read(0x10_0000, &mut buf).is_err());
    }
}
