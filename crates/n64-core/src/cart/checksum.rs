/// IPL3 boot checksum over the first megabyte of game code.
///
/// IPL3 refuses to boot a cartridge whose header CRC words disagree with
/// this sum, so patched ROMs need `update_rom_checksum` before they run.
use super::cic::CicVariant;
use super::rom::RomError;

pub const CHECKSUM_START: usize = 0x1000;
pub const CHECKSUM_LENGTH: usize = 0x10_0000;
const X105_TABLE: usize = 0x0750;

fn word(rom: &[u8], offset: usize) -> u32 {
    u32::from_be_bytes([rom[offset], rom[offset + 1], rom[offset + 2], rom[offset + 3]])
}

/// Compute (CRC1, CRC2) for a normalized big-endian image.
pub fn compute_checksum(rom: &[u8], cic: CicVariant) -> Result<(u32, u32), RomError> {
    if rom.len() < CHECKSUM_START + CHECKSUM_LENGTH {
        return Err(RomError::TooSmall(rom.len()));
    }
    let seed = cic.checksum_seed();
    let (mut t1, mut t2, mut t3, mut t4, mut t5, mut t6) = (seed, seed, seed, seed, seed, seed);

    let body = &rom[CHECKSUM_START..CHECKSUM_START + CHECKSUM_LENGTH];
    for (i, chunk) in body.chunks_exact(4).enumerate() {
        let w = u32::from_be_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
        let (sum, carry) = t6.overflowing_add(w);
        if carry {
            t4 = t4.wrapping_add(1);
        }
        t6 = sum;
        t3 ^= w;
        let r = w.rotate_left(w & 0x1F);
        t5 = t5.wrapping_add(r);
        if t2 > w {
            t2 ^= r;
        } else {
            t2 ^= t6 ^ w;
        }
        t1 = match cic {
            CicVariant::X105 => t1.wrapping_add(word(rom, X105_TABLE + ((i * 4) & 0xFF)) ^ w),
            _ => t1.wrapping_add(t5 ^ w),
        };
    }

    Ok(match cic {
        CicVariant::X103 => ((t6 ^ t4).wrapping_add(t3), (t5 ^ t2).wrapping_add(t1)),
        CicVariant::X106 => (
            t6.wrapping_mul(t4).wrapping_add(t3),
            t5.wrapping_mul(t2).wrapping_add(t1),
        ),
        _ => (t6 ^ t4 ^ t3, t5 ^ t2 ^ t1),
    })
}

/// Recompute the checksum and store it in the header at 0x10/0x14.
pub fn update_rom_checksum(rom: &mut [u8], cic: CicVariant) -> Result<(u32, u32), RomError> {
    let (crc1, crc2) = compute_checksum(rom, cic)?;
    rom[0x10..0x14].copy_from_slice(&crc1.to_be_bytes());
    rom[0x14..0x18].copy_from_slice(&crc2.to_be_bytes());
    log::info!("Checksum updated: {:#010X} {:#010X}", crc1, crc2);
    Ok((crc1, crc2))
}
