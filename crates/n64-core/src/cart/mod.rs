pub mod checksum;
pub mod cic;
pub mod rom;

use std::path::Path;

use crate::bus::{BusError, Device};
use cic::CicVariant;
use rom::{RomError, RomHeader};

/// Cartridge: holds the ROM data.
///
/// The ROM is loaded once and served through the cartridge domain at
/// 0x1000_0000, exactly like real hardware. ROM data is immutable: reads
/// past the end return 0 and writes are dropped.
pub struct Cartridge {
    data: Vec<u8>,
    header: RomHeader,
    cic: CicVariant,
}

impl Cartridge {
    pub fn new(data: Vec<u8>, header: RomHeader) -> Self {
        let cic = cic::detect(&data);
        log::info!("CIC: {}", cic);
        Self { data, header, cic }
    }

    pub fn load(path: &Path) -> Result<Self, RomError> {
        let (header, data) = rom::load_rom(path)?;
        Ok(Self::new(data, header))
    }

    pub fn from_bytes(bytes: Vec<u8>) -> Result<Self, RomError> {
        let (header, data) = rom::from_bytes(bytes)?;
        Ok(Self::new(data, header))
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn header(&self) -> &RomHeader {
        &self.header
    }

    pub fn cic(&self) -> CicVariant {
        self.cic
    }
}

impl Device for Cartridge {
    fn name(&self) -> &'static str {
        "cartridge"
    }

    fn read(&self, offset: u32, buf: &mut [u8]) -> Result<(), BusError> {
        let start = offset as usize;
        for (i, byte) in buf.iter_mut().enumerate() {
            *byte = self.data.get(start + i).copied().unwrap_or(0);
        }
        Ok(())
    }

    fn write(&self, offset: u32, data: &[u8]) -> Result<(), BusError> {
        log::warn!(
            "cartridge: {}-byte write to ROM at {:#010X} dropped",
            data.len(),
            0x1000_0000 + offset
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tiny_cart() -> Cartridge {
        let mut rom = vec![0u8; 0x1000];
        rom[0..4].copy_from_slice(&0x8037_1240u32.to_be_bytes());
        rom[0x40] = 0xAB;
        Cartridge::from_bytes(rom).unwrap()
    }

    #[test]
    fn reads_past_end_are_zero_and_writes_are_dropped() {
        let cart = tiny_cart();
        let mut buf = [0xFFu8; 4];
        cart.read(0x0FFE, &mut buf).unwrap();
        assert_eq!(buf, [0; 4]);

        cart.write(0x40, &[0x00]).unwrap();
        cart.read(0x40, &mut buf[..1]).unwrap();
        assert_eq!(buf[0], 0xAB);
    }

    #[test]
    fn unknown_ipl3_reports_6102() {
        assert_eq!(tiny_cart().cic(), CicVariant::X102);
    }
}
