use std::fs;
use std::path::Path;

/// ROM byte order format, detected from the first 4 bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RomFormat {
    /// .z64: Big-endian (native N64 byte order). Magic: 0x80371240
    BigEndian,
    /// .v64: Byte-swapped (each 16-bit pair has bytes flipped). Magic: 0x37804012
    ByteSwapped,
    /// .n64: Little-endian (each 32-bit word is reversed). Magic: 0x40123780
    LittleEndian,
}

/// Television standard the cartridge targets.
///
/// The discriminant is the value IPL3 expects in r20.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TvType {
    Pal = 0,
    Ntsc = 1,
    Mpal = 2,
}

impl TvType {
    /// Map the header country code to a TV standard.
    pub fn from_country(code: u8) -> Self {
        match code {
            b'D' | b'F' | b'I' | b'P' | b'S' | b'U' | b'X' | b'Y' => TvType::Pal,
            b'B' => TvType::Mpal,
            _ => TvType::Ntsc,
        }
    }
}

/// Parsed ROM header (first 0x40 bytes of the ROM).
#[derive(Debug, Clone)]
pub struct RomHeader {
    pub format: RomFormat,
    pub pi_timing: u32,
    pub clock_rate: u32,
    pub entry_point: u32,
    pub release: u32,
    pub crc1: u32,
    pub crc2: u32,
    pub name: String,
    pub game_code: [u8; 4],
    pub country: u8,
    pub version: u8,
    pub tv_type: TvType,
}

#[derive(Debug, thiserror::Error)]
pub enum RomError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Unknown ROM format (magic {0:#010X})")]
    UnknownFormat(u32),
    #[error("ROM too small (got {0} bytes)")]
    TooSmall(usize),
}

pub const HEADER_SIZE: usize = 0x40;

/// Load a ROM from disk: detect format, normalize, parse header.
pub fn load_rom(path: &Path) -> Result<(RomHeader, Vec<u8>), RomError> {
    let data = fs::read(path)?;
    from_bytes(data)
}

/// Same as `load_rom` for an in-memory image.
pub fn from_bytes(mut data: Vec<u8>) -> Result<(RomHeader, Vec<u8>), RomError> {
    if data.len() < HEADER_SIZE {
        return Err(RomError::TooSmall(data.len()));
    }
    let magic = [data[0], data[1], data[2], data[3]];
    let format = detect_format(magic)?;
    normalize(&mut data, format);
    let header = parse_header(&data, format)?;
    log::info!(
        "ROM: \"{}\" ({}), {:?}, entry {:#010X}, {} bytes",
        header.name,
        String::from_utf8_lossy(&header.game_code),
        header.tv_type,
        header.entry_point,
        data.len()
    );
    Ok((header, data))
}

pub fn detect_format(magic: [u8; 4]) -> Result<RomFormat, RomError> {
    match u32::from_be_bytes(magic) {
        0x8037_1240 => Ok(RomFormat::BigEndian),
        0x3780_4012 => Ok(RomFormat::ByteSwapped),
        0x4012_3780 => Ok(RomFormat::LittleEndian),
        other => Err(RomError::UnknownFormat(other)),
    }
}

/// Byte-swap the ROM in place to big-endian (z64) order. A trailing
/// partial word is left alone.
pub fn normalize(data: &mut [u8], format: RomFormat) {
    match format {
        RomFormat::BigEndian => {}
        RomFormat::ByteSwapped => {
            for pair in data.chunks_exact_mut(2) {
                pair.swap(0, 1);
            }
        }
        RomFormat::LittleEndian => {
            for word in data.chunks_exact_mut(4) {
                word.reverse();
            }
        }
    }
}

fn be_u32(data: &[u8], offset: usize) -> u32 {
    u32::from_be_bytes([
        data[offset],
        data[offset + 1],
        data[offset + 2],
        data[offset + 3],
    ])
}

/// Parse the 64-byte header of a normalized image.
pub fn parse_header(data: &[u8], format: RomFormat) -> Result<RomHeader, RomError> {
    if data.len() < HEADER_SIZE {
        return Err(RomError::TooSmall(data.len()));
    }
    let name = String::from_utf8_lossy(&data[0x20..0x34])
        .trim_matches(|c: char| c == '\0' || c.is_whitespace())
        .to_string();
    let country = data[0x3E];
    Ok(RomHeader {
        format,
        pi_timing: be_u32(data, 0x00),
        clock_rate: be_u32(data, 0x04),
        entry_point: be_u32(data, 0x08),
        release: be_u32(data, 0x0C),
        crc1: be_u32(data, 0x10),
        crc2: be_u32(data, 0x14),
        name,
        game_code: [data[0x3B], data[0x3C], data[0x3D], data[0x3E]],
        country,
        version: data[0x3F],
        tv_type: TvType::from_country(country),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn z64_header() -> Vec<u8> {
        let mut rom = vec![0u8; 0x1000];
        rom[0..4].copy_from_slice(&0x8037_1240u32.to_be_bytes());
        rom[0x08..0x0C].copy_from_slice(&0x8000_0400u32.to_be_bytes());
        rom[0x10..0x14].copy_from_slice(&0x635A_2BFFu32.to_be_bytes());
        rom[0x14..0x18].copy_from_slice(&0x8B02_2326u32.to_be_bytes());
        rom[0x20..0x34].copy_from_slice(b"SUPER MARIO 64      ");
        rom[0x3B..0x3F].copy_from_slice(b"NSME");
        rom
    }

    #[test]
    fn all_three_byte_orders_normalize_to_z64() {
        let z64 = z64_header();
        let v64: Vec<u8> = z64.chunks(2).flat_map(|p| [p[1], p[0]]).collect();
        let n64: Vec<u8> = z64
            .chunks(4)
            .flat_map(|w| [w[3], w[2], w[1], w[0]])
            .collect();

        for (image, format) in [
            (z64.clone(), RomFormat::BigEndian),
            (v64, RomFormat::ByteSwapped),
            (n64, RomFormat::LittleEndian),
        ] {
            let (header, data) = from_bytes(image).unwrap();
            assert_eq!(header.format, format);
            assert_eq!(data, z64);
        }
    }

    #[test]
    fn header_fields_and_region() {
        let (header, _) = from_bytes(z64_header()).unwrap();
        assert_eq!(header.entry_point, 0x8000_0400);
        assert_eq!(header.crc1, 0x635A_2BFF);
        assert_eq!(header.crc2, 0x8B02_2326);
        assert_eq!(header.name, "SUPER MARIO 64");
        assert_eq!(&header.game_code, b"NSME");
        assert_eq!(header.tv_type, TvType::Ntsc);

        assert_eq!(TvType::from_country(b'P'), TvType::Pal);
        assert_eq!(TvType::from_country(b'B'), TvType::Mpal);
        assert_eq!(TvType::from_country(b'J'), TvType::Ntsc);
    }

    #[test]
    fn rejects_short_and_unknown_images() {
        assert!(matches!(from_bytes(vec![0x80; 0x20]), Err(RomError::TooSmall(0x20))));
        assert!(matches!(
            from_bytes(vec![0xDE; 0x40]),
            Err(RomError::UnknownFormat(0xDEDE_DEDE))
        ));
    }
}
