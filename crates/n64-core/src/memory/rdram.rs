use parking_lot::Mutex;

use crate::bus::{BusError, Device};

/// RDRAM: the N64's main system memory.
///
/// 4 MB on base N64, 8 MB with Expansion Pak. The bus gives RDRAM the
/// whole 0x0000_0000..0x03EF_FFFF window; offsets past the installed
/// memory read as zero and drop writes.
pub struct Rdram {
    data: Mutex<Vec<u8>>,
    size: usize,
}

pub const RDRAM_SIZE: usize = 8 * 1024 * 1024;

impl Rdram {
    pub fn new(size: usize) -> Self {
        Self {
            data: Mutex::new(vec![0u8; size]),
            size,
        }
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Copy `bytes` straight into memory, bypassing the bus. Used by boot.
    pub fn load(&self, offset: usize, bytes: &[u8]) {
        let mut data = self.data.lock();
        let end = (offset + bytes.len()).min(self.size);
        if offset < end {
            data[offset..end].copy_from_slice(&bytes[..end - offset]);
        }
    }

    pub fn read_u32(&self, offset: usize) -> u32 {
        let mut buf = [0u8; 4];
        self.copy_out(offset, &mut buf);
        u32::from_be_bytes(buf)
    }

    pub fn write_u32(&self, offset: usize, val: u32) {
        self.load(offset, &val.to_be_bytes());
    }

    fn copy_out(&self, offset: usize, buf: &mut [u8]) {
        let data = self.data.lock();
        for (i, byte) in buf.iter_mut().enumerate() {
            *byte = data.get(offset + i).copied().unwrap_or(0);
        }
    }
}

impl Device for Rdram {
    fn name(&self) -> &'static str {
        "RDRAM"
    }

    fn read(&self, offset: u32, buf: &mut [u8]) -> Result<(), BusError> {
        let offset = offset as usize;
        if offset + buf.len() <= self.size {
            buf.copy_from_slice(&self.data.lock()[offset..offset + buf.len()]);
        } else {
            self.copy_out(offset, buf);
        }
        Ok(())
    }

    fn write(&self, offset: u32, data: &[u8]) -> Result<(), BusError> {
        let offset = offset as usize;
        if offset >= self.size {
            log::trace!("RDRAM: write past installed memory at {:#010X}", offset);
        }
        self.load(offset, data);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reads_past_installed_memory_are_zero() {
        let ram = Rdram::new(0x100);
        ram.write(0xFE, &[1, 2, 3, 4]).unwrap();
        let mut buf = [0xFFu8; 4];
        ram.read(0xFE, &mut buf).unwrap();
        assert_eq!(buf, [1, 2, 0, 0]);
    }

    #[test]
    fn words_are_big_endian() {
        let ram = Rdram::new(RDRAM_SIZE);
        ram.write_u32(0x318, 0x0080_0000);
        let mut buf = [0u8; 4];
        ram.read(0x318, &mut buf).unwrap();
        assert_eq!(buf, [0x00, 0x80, 0x00, 0x00]);
        assert_eq!(ram.read_u32(0x318), 0x0080_0000);
    }
}
