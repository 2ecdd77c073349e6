/// Physical memory map.
///
///   0x0000_0000..0x03EF_FFFF  RDRAM
///   0x03F0_0000..0x03FF_FFFF  RDRAM registers
///   0x0400_0000..0x040F_FFFF  SP (DMEM/IMEM, registers, PC)
///   0x0410_0000..0x041F_FFFF  DP command registers
///   0x0420_0000..0x042F_FFFF  DP span registers
///   0x0430_0000..0x043F_FFFF  MI
///   0x0440_0000..0x044F_FFFF  VI
///   0x0450_0000..0x045F_FFFF  AI
///   0x0460_0000..0x046F_FFFF  PI
///   0x0470_0000..0x047F_FFFF  RI
///   0x0480_0000..0x048F_FFFF  SI
///   0x1000_0000..0x1FBF_FFFF  Cartridge domain
///   0x1FC0_0000..0x1FCF_FFFF  PIF ROM + RAM
///
/// Every region starts and ends on a 64 KiB boundary, so the decode table
/// is indexed by `addr >> 16`.
use super::BusError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Region {
    Rdram,
    RdramRegs,
    Sp,
    DpCommand,
    DpSpan,
    Mi,
    Vi,
    Ai,
    Pi,
    Ri,
    Si,
    Cartridge,
    Pif,
}

impl Region {
    pub const ALL: [Region; 13] = [
        Region::Rdram,
        Region::RdramRegs,
        Region::Sp,
        Region::DpCommand,
        Region::DpSpan,
        Region::Mi,
        Region::Vi,
        Region::Ai,
        Region::Pi,
        Region::Ri,
        Region::Si,
        Region::Cartridge,
        Region::Pif,
    ];

    pub const fn base(self) -> u32 {
        match self {
            Region::Rdram => 0x0000_0000,
            Region::RdramRegs => 0x03F0_0000,
            Region::Sp => 0x0400_0000,
            Region::DpCommand => 0x0410_0000,
            Region::DpSpan => 0x0420_0000,
            Region::Mi => 0x0430_0000,
            Region::Vi => 0x0440_0000,
            Region::Ai => 0x0450_0000,
            Region::Pi => 0x0460_0000,
            Region::Ri => 0x0470_0000,
            Region::Si => 0x0480_0000,
            Region::Cartridge => 0x1000_0000,
            Region::Pif => 0x1FC0_0000,
        }
    }

    pub const fn size(self) -> u32 {
        match self {
            Region::Rdram => 0x03F0_0000,
            Region::Cartridge => 0x0FC0_0000,
            _ => 0x0010_0000,
        }
    }

    pub const fn end(self) -> u32 {
        self.base() + self.size()
    }

    pub fn name(self) -> &'static str {
        match self {
            Region::Rdram => "RDRAM",
            Region::RdramRegs => "RDRAM regs",
            Region::Sp => "SP",
            Region::DpCommand => "DP command",
            Region::DpSpan => "DP span",
            Region::Mi => "MI",
            Region::Vi => "VI",
            Region::Ai => "AI",
            Region::Pi => "PI",
            Region::Ri => "RI",
            Region::Si => "SI",
            Region::Cartridge => "cartridge",
            Region::Pif => "PIF",
        }
    }
}

const PAGES: usize = 0x2000;

const fn build_decode_table() -> [Option<Region>; PAGES] {
    let mut table = [None; PAGES];
    let mut r = 0;
    while r < Region::ALL.len() {
        let region = Region::ALL[r];
        let mut page = (region.base() >> 16) as usize;
        let last = (region.end() >> 16) as usize;
        while page < last {
            table[page] = Some(region);
            page += 1;
        }
        r += 1;
    }
    table
}

static DECODE: [Option<Region>; PAGES] = build_decode_table();

/// Resolve a physical address to its owning region and region-relative offset.
pub fn resolve(addr: u32) -> Result<(Region, u32), BusError> {
    match DECODE.get((addr >> 16) as usize).copied().flatten() {
        Some(region) => Ok((region, addr - region.base())),
        None => Err(BusError::Unmapped(addr)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn region_boundaries_resolve_to_owner() {
        assert_eq!(resolve(0x0000_0000), Ok((Region::Rdram, 0)));
        assert_eq!(resolve(0x03EF_FFFF), Ok((Region::Rdram, 0x03EF_FFFF)));
        assert_eq!(resolve(0x03F0_0004), Ok((Region::RdramRegs, 4)));
        assert_eq!(resolve(0x0404_0010), Ok((Region::Sp, 0x4_0010)));
        assert_eq!(resolve(0x0460_000C), Ok((Region::Pi, 0x0C)));
        assert_eq!(resolve(0x0480_0018), Ok((Region::Si, 0x18)));
        assert_eq!(resolve(0x1000_0040), Ok((Region::Cartridge, 0x40)));
        assert_eq!(resolve(0x1FC0_07FF), Ok((Region::Pif, 0x7FF)));
    }

    #[test]
    fn holes_fail_with_the_offending_address() {
        for addr in [0x0490_0000, 0x04FF_FFFC, 0x0500_0508, 0x0FFF_FFFF, 0x1FD0_0000, 0xFFFF_FFFF] {
            assert_eq!(resolve(addr), Err(BusError::Unmapped(addr)));
        }
    }

    #[test]
    fn every_mapped_page_has_exactly_one_owner_and_offset_in_range() {
        for page in 0..=0xFFFFu32 {
            for low in [0x0000u32, 0x7FFF, 0xFFFF] {
                let addr = (page << 16) | low;
                let owners = Region::ALL
                    .iter()
                    .filter(|r| addr >= r.base() && addr < r.end())
                    .count();
                match resolve(addr) {
                    Ok((region, offset)) => {
                        assert_eq!(owners, 1, "{addr:#010X}");
                        assert!(offset < region.size());
                        assert_eq!(region.base() + offset, addr);
                    }
                    Err(err) => {
                        assert_eq!(owners, 0, "{addr:#010X}");
                        assert_eq!(err, BusError::Unmapped(addr));
                    }
                }
            }
        }
    }
}
