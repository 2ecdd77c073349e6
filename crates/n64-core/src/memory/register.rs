/// Memory-mapped register block.
///
/// Registers are kept as host-order `u32` words. The bus sees them as
/// big-endian bytes: byte lane 0 of a word is its most significant byte.
///
/// A dual-buffered block keeps two copies of every word:
///   write side: what the CPU last stored (device logic consumes this)
///   read side: what the CPU sees on load (device logic publishes this)
/// A single-buffered block aliases both sides onto one buffer.
use crate::bus::BusError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Buffering {
    Single,
    Dual,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegisterAccess {
    ReadWrite,
    ReadOnly,
    WriteOnly,
}

/// Word range touched by a CPU write, inclusive on both ends.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WriteSpan {
    pub first: usize,
    pub last: usize,
}

impl WriteSpan {
    pub fn contains(&self, index: usize) -> bool {
        (self.first..=self.last).contains(&index)
    }
}

pub struct RegisterBlock {
    name: &'static str,
    read_side: Vec<u32>,
    write_side: Option<Vec<u32>>,
    access: RegisterAccess,
}

impl RegisterBlock {
    pub fn new(name: &'static str, words: usize) -> Self {
        Self::build(name, words, Buffering::Single, RegisterAccess::ReadWrite)
    }

    pub fn dual(name: &'static str, words: usize) -> Self {
        Self::build(name, words, Buffering::Dual, RegisterAccess::ReadWrite)
    }

    pub fn read_only(name: &'static str, words: usize) -> Self {
        Self::build(name, words, Buffering::Single, RegisterAccess::ReadOnly)
    }

    pub fn write_only(name: &'static str, words: usize) -> Self {
        Self::build(name, words, Buffering::Single, RegisterAccess::WriteOnly)
    }

    pub fn build(
        name: &'static str,
        words: usize,
        buffering: Buffering,
        access: RegisterAccess,
    ) -> Self {
        let write_side = match buffering {
            Buffering::Single => None,
            Buffering::Dual => Some(vec![0; words]),
        };
        Self {
            name,
            read_side: vec![0; words],
            write_side,
            access,
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn buffering(&self) -> Buffering {
        if self.write_side.is_some() {
            Buffering::Dual
        } else {
            Buffering::Single
        }
    }

    pub fn size_bytes(&self) -> u32 {
        (self.read_side.len() * 4) as u32
    }

    fn check_span(&self, offset: u32, len: usize) -> Result<(), BusError> {
        let end = offset as u64 + len as u64;
        if end > u64::from(self.size_bytes()) {
            return Err(BusError::OutOfRange {
                device: self.name,
                offset,
                len: len as u32,
            });
        }
        Ok(())
    }

    /// CPU-side load of `buf.len()` bytes starting at byte `offset`.
    pub fn cpu_read(&self, offset: u32, buf: &mut [u8]) -> Result<(), BusError> {
        self.check_span(offset, buf.len())?;
        if self.access == RegisterAccess::WriteOnly {
            buf.fill(0);
            return Ok(());
        }
        for (i, byte) in buf.iter_mut().enumerate() {
            let pos = offset as usize + i;
            *byte = self.read_side[pos / 4].to_be_bytes()[pos % 4];
        }
        Ok(())
    }

    /// CPU-side store. Returns the words touched, or `None` when the block
    /// ignores CPU writes.
    pub fn cpu_write(&mut self, offset: u32, data: &[u8]) -> Result<Option<WriteSpan>, BusError> {
        self.check_span(offset, data.len())?;
        if data.is_empty() {
            return Ok(None);
        }
        if self.access == RegisterAccess::ReadOnly {
            log::debug!(
                "{}: ignoring write to read-only register at {:#06X}",
                self.name,
                offset
            );
            return Ok(None);
        }
        let target = match self.write_side.as_mut() {
            Some(side) => side,
            None => &mut self.read_side,
        };
        for (i, byte) in data.iter().enumerate() {
            let pos = offset as usize + i;
            let mut lanes = target[pos / 4].to_be_bytes();
            lanes[pos % 4] = *byte;
            target[pos / 4] = u32::from_be_bytes(lanes);
        }
        Ok(Some(WriteSpan {
            first: offset as usize / 4,
            last: (offset as usize + data.len() - 1) / 4,
        }))
    }

    /// Last value stored by the CPU into word `index`.
    pub fn written(&self, index: usize) -> u32 {
        match &self.write_side {
            Some(side) => side[index],
            None => self.read_side[index],
        }
    }

    /// Value the CPU will observe when it loads word `index`.
    pub fn visible(&self, index: usize) -> u32 {
        self.read_side[index]
    }

    /// Publish a hardware-side value to the CPU-visible buffer.
    pub fn publish(&mut self, index: usize, value: u32) {
        self.read_side[index] = value;
    }

    /// Overwrite the CPU-written side. A no-op distinction for single buffers.
    pub fn set_written(&mut self, index: usize, value: u32) {
        match self.write_side.as_mut() {
            Some(side) => side[index] = value,
            None => self.read_side[index] = value,
        }
    }

    /// Force both sides of word `index` to `value`.
    pub fn set(&mut self, index: usize, value: u32) {
        self.read_side[index] = value;
        if let Some(side) = self.write_side.as_mut() {
            side[index] = value;
        }
    }

    pub fn words(&self) -> usize {
        self.read_side.len()
    }
}
