/// Exception codes for the VR4300 (stored in COP0 Cause register bits [6:2]).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ExceptionCode {
    Interrupt = 0,
    TlbModification = 1,
    TlbLoad = 2,
    TlbStore = 3,
    AddressErrorLoad = 4,
    AddressErrorStore = 5,
    BusErrorInstruction = 6,
    BusErrorData = 7,
    Syscall = 8,
    Breakpoint = 9,
    ReservedInstruction = 10,
    CoprocessorUnusable = 11,
    Overflow = 12,
    Trap = 13,
    FloatingPoint = 15,
    Watch = 23,
}

/// A synchronous condition recorded by the instruction that caused it.
///
/// Serviced at the end of the same step, ahead of interrupts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExceptionKind {
    Reset,
    /// 32-bit TLB refill (no matching entry).
    TlbRefill { store: bool, vaddr: u64 },
    /// 64-bit TLB refill (no matching entry, extended addressing).
    XtlbRefill { store: bool, vaddr: u64 },
    CacheError,
    /// TLB invalid or modified, or an address error, carrying the
    /// faulting virtual address.
    Address { code: ExceptionCode, vaddr: u64 },
    CoprocessorUnusable(u8),
    General(ExceptionCode),
}

impl ExceptionKind {
    pub fn code(self) -> ExceptionCode {
        match self {
            Self::Reset | Self::CacheError => ExceptionCode::Interrupt,
            Self::TlbRefill { store, .. } | Self::XtlbRefill { store, .. } => {
                if store {
                    ExceptionCode::TlbStore
                } else {
                    ExceptionCode::TlbLoad
                }
            }
            Self::Address { code, .. } => code,
            Self::CoprocessorUnusable(_) => ExceptionCode::CoprocessorUnusable,
            Self::General(code) => code,
        }
    }

    /// Service order when one step records several conditions:
    /// Reset, then TLB refill, then cache error, then everything else.
    pub fn priority(self) -> u8 {
        match self {
            Self::Reset => 3,
            Self::TlbRefill { .. } | Self::XtlbRefill { .. } => 2,
            Self::CacheError => 1,
            _ => 0,
        }
    }

    /// Faulting virtual address, for the kinds that load BadVAddr.
    pub fn bad_vaddr(self) -> Option<u64> {
        match self {
            Self::TlbRefill { vaddr, .. }
            | Self::XtlbRefill { vaddr, .. }
            | Self::Address { vaddr, .. } => Some(vaddr),
            _ => None,
        }
    }
}

/// Where an exception is taken: the instruction EPC should name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExceptionSite {
    pub pc: u64,
    /// The instruction at `pc` sits in a branch delay slot, so EPC must
    /// point at the branch instead.
    pub delay_slot: bool,
}
