/// TLB: Translation Lookaside Buffer.
///
/// 32-entry fully associative TLB that maps virtual addresses to physical.
/// Each entry maps a *pair* of pages (even + odd), with variable page sizes
/// from 4KB to 16MB controlled by PageMask.
///
/// Entry format:
///   PageMask[24:13]: mask bits (determines page size)
///   EntryHi[63:62]: R (region)
///   EntryHi[39:13]: VPN2 (virtual page number / 2)
///   EntryHi[7:0]: ASID (address space identifier)
///   EntryLo0/1: even/odd page mappings:
///     [29:6] PFN (physical frame number, in 4KB units)
///     [2]    D (dirty/writable)
///     [1]    V (valid)
///     [0]    G (global: ignore ASID if BOTH Lo0 and Lo1 have G=1)

pub const TLB_ENTRIES: usize = 32;

const PAGE_MASK_BITS: u32 = 0x01FF_E000;
/// EntryHi bits that take part in the VPN2 compare (R and VPN2).
const VPN2_BITS: u64 = 0xC000_00FF_FFFF_E000;
/// EntryLo bits the hardware keeps (PFN, C, D, V, G).
const ENTRY_LO_BITS: u64 = 0x3FFF_FFFF;
const UNMAPPED_VPN2: u64 = 0xC000_00FF_8000_0000;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TlbEntry {
    pub page_mask: u32,
    pub entry_hi: u64,
    pub entry_lo0: u64,
    pub entry_lo1: u64,
}

impl TlbEntry {
    fn mask(&self) -> u64 {
        self.page_mask as u64 | 0x1FFF
    }

    fn global(&self) -> bool {
        (self.entry_lo0 & self.entry_lo1 & 0x1) == 1
    }

    fn matches(&self, vaddr: u64, asid: u8) -> bool {
        let compare = VPN2_BITS & !self.mask();
        if (vaddr & compare) != (self.entry_hi & compare) {
            return false;
        }
        self.global() || self.entry_hi as u8 == asid
    }
}

/// Why a mapped access could not be translated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TlbFault {
    /// No entry matched: refill exception.
    Miss,
    /// Matching entry, but the selected page has V clear.
    Invalid,
    /// Store to a valid page with D clear.
    Modified,
}

pub struct Tlb {
    entries: [TlbEntry; TLB_ENTRIES],
}

impl Default for Tlb {
    fn default() -> Self {
        Self::new()
    }
}

impl Tlb {
    /// Entries start with distinct VPN2s in the xkseg hole past
    /// 0xC000_00FF_7FFF_FFFF, which raises an address error before it
    /// reaches the TLB, so nothing matches until software writes an entry.
    pub fn new() -> Self {
        Self {
            entries: std::array::from_fn(|i| TlbEntry {
                entry_hi: UNMAPPED_VPN2 | ((i as u64) << 13),
                ..TlbEntry::default()
            }),
        }
    }

    /// TLBR
    pub fn read(&self, index: usize) -> TlbEntry {
        self.entries[index % TLB_ENTRIES]
    }

    /// TLBWI / TLBWR. Unwritable bits are dropped on the way in.
    pub fn write(&mut self, index: usize, entry: TlbEntry) {
        let page_mask = entry.page_mask & PAGE_MASK_BITS;
        let compare = VPN2_BITS & !(page_mask as u64 | 0x1FFF);
        let stored = TlbEntry {
            page_mask,
            entry_hi: (entry.entry_hi & compare) | (entry.entry_hi & 0xFF),
            entry_lo0: entry.entry_lo0 & ENTRY_LO_BITS,
            entry_lo1: entry.entry_lo1 & ENTRY_LO_BITS,
        };
        log::debug!(
            "TLB[{}] = hi {:#018X} lo0 {:#010X} lo1 {:#010X} mask {:#010X}",
            index % TLB_ENTRIES,
            stored.entry_hi,
            stored.entry_lo0,
            stored.entry_lo1,
            stored.page_mask
        );
        self.entries[index % TLB_ENTRIES] = stored;
    }

    /// TLBP: index of the entry matching EntryHi's VPN2 and ASID.
    pub fn probe(&self, entry_hi: u64) -> Option<usize> {
        let asid = entry_hi as u8;
        self.entries
            .iter()
            .position(|entry| entry.matches(entry_hi, asid))
    }

    /// Translate a mapped virtual address.
    ///
    /// The effective mask is PageMask | 0x1FFF; the bit just above the
    /// per-page offset selects the odd page of the pair.
    pub fn translate(&self, vaddr: u64, asid: u8, store: bool) -> Result<u32, TlbFault> {
        let entry = self
            .entries
            .iter()
            .find(|entry| entry.matches(vaddr, asid))
            .ok_or(TlbFault::Miss)?;

        let mask = entry.mask();
        let odd = (vaddr & ((mask + 1) >> 1)) != 0;
        let entry_lo = if odd { entry.entry_lo1 } else { entry.entry_lo0 };
        if (entry_lo & 0x2) == 0 {
            return Err(TlbFault::Invalid);
        }
        if store && (entry_lo & 0x4) == 0 {
            return Err(TlbFault::Modified);
        }
        let pfn = (entry_lo >> 6) & 0x00FF_FFFF;
        let offset_mask = mask >> 1;
        let physical = ((pfn << 12) & !offset_mask) | (vaddr & offset_mask);
        Ok(physical as u32)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // EntryLo with PFN, dirty, valid, global
    fn lo(pfn: u64, dirty: bool, valid: bool, global: bool) -> u64 {
        (pfn << 6) | ((dirty as u64) << 2) | ((valid as u64) << 1) | global as u64
    }

    #[test]
    fn reset_entries_match_nothing() {
        let tlb = Tlb::new();
        for vaddr in [0, 0x1000, 0x7FFF_E000, 0xFFFF_FFFF_C000_0000] {
            assert_eq!(tlb.translate(vaddr, 0, false), Err(TlbFault::Miss));
        }
        assert_eq!(tlb.probe(0), None);
        assert_ne!(tlb.read(0).entry_hi, tlb.read(1).entry_hi);
    }

    #[test]
    fn even_and_odd_pages_of_a_4k_pair() {
        let mut tlb = Tlb::new();
        tlb.write(
            3,
            TlbEntry {
                page_mask: 0,
                entry_hi: 0x0040_0000 | 0x12,
                entry_lo0: lo(0x100, true, true, false),
                entry_lo1: lo(0x200, true, true, false),
            },
        );
        assert_eq!(tlb.translate(0x0040_0123, 0x12, false), Ok(0x0010_0123));
        assert_eq!(tlb.translate(0x0040_1FFC, 0x12, true), Ok(0x0020_0FFC));
        // Other ASID, not global
        assert_eq!(tlb.translate(0x0040_0123, 0x13, false), Err(TlbFault::Miss));
        assert_eq!(tlb.probe(0x0040_0000 | 0x12), Some(3));
        assert_eq!(tlb.probe(0x0040_0000 | 0x13), None);
    }

    #[test]
    fn global_entries_ignore_asid() {
        let mut tlb = Tlb::new();
        tlb.write(
            0,
            TlbEntry {
                page_mask: 0,
                entry_hi: 0x8000,
                entry_lo0: lo(0x1, true, true, true),
                entry_lo1: lo(0x2, true, true, true),
            },
        );
        assert_eq!(tlb.translate(0x8004, 0xFF, false), Ok(0x1004));
    }

    #[test]
    fn invalid_and_modified_faults() {
        let mut tlb = Tlb::new();
        tlb.write(
            1,
            TlbEntry {
                page_mask: 0,
                entry_hi: 0x0010_0000,
                entry_lo0: lo(0x10, false, true, true),
                entry_lo1: lo(0x11, true, false, true),
            },
        );
        assert_eq!(tlb.translate(0x0010_0000, 0, false), Ok(0x0001_0000));
        assert_eq!(tlb.translate(0x0010_0000, 0, true), Err(TlbFault::Modified));
        assert_eq!(tlb.translate(0x0010_1000, 0, false), Err(TlbFault::Invalid));
    }

    #[test]
    fn large_pages_use_page_mask() {
        let mut tlb = Tlb::new();
        // 16KB pages: the pair covers 32KB
        tlb.write(
            2,
            TlbEntry {
                page_mask: 0x6000,
                entry_hi: 0x0100_0000,
                entry_lo0: lo(0x400, true, true, true),
                entry_lo1: lo(0x800, true, true, true),
            },
        );
        assert_eq!(tlb.translate(0x0100_3FFC, 0, false), Ok(0x0040_3FFC));
        assert_eq!(tlb.translate(0x0100_4000, 0, false), Ok(0x0080_0000));
        assert_eq!(tlb.read(2).page_mask, 0x6000);
    }

    #[test]
    fn write_drops_unwritable_bits() {
        let mut tlb = Tlb::new();
        tlb.write(
            35,
            TlbEntry {
                page_mask: 0xFFFF_FFFF,
                entry_hi: 0xFFFF_FFFF_FFFF_FFFF,
                entry_lo0: u64::MAX,
                entry_lo1: 0,
            },
        );
        let entry = tlb.read(3);
        assert_eq!(entry.page_mask, PAGE_MASK_BITS);
        assert_eq!(entry.entry_hi & 0x1FF_FF00, 0);
        assert_eq!(entry.entry_lo0, ENTRY_LO_BITS);
    }
}
