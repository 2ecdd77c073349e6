/// COP0: System Control Coprocessor.
///
/// Manages TLB, exceptions, interrupts, and the Count/Compare timer.
///
/// Status and Cause are kept twice: the raw register words in `regs`, and
/// decoded flag views that are rebuilt on every write so the hot paths
/// (mode checks, interrupt gating) never re-decode.
use crate::cpu::exceptions::{ExceptionCode, ExceptionKind, ExceptionSite};

/// Privilege level selected by Status.KSU (overridden to Kernel by EXL/ERL).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Ksu {
    #[default]
    Kernel,
    Supervisor,
    User,
}

/// Decoded view of the Status register.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StatusFlags {
    pub ie: bool,
    pub exl: bool,
    pub erl: bool,
    pub ksu: Ksu,
    pub ux: bool,
    pub sx: bool,
    pub kx: bool,
    pub im: u8,
    pub de: bool,
    pub ce: bool,
    pub ts: bool,
    pub bev: bool,
    pub re: bool,
    pub fr: bool,
    pub rp: bool,
    pub cu: u8,
}

impl StatusFlags {
    pub fn decode(raw: u32) -> Self {
        let bit = |n: u32| raw & (1 << n) != 0;
        Self {
            ie: bit(0),
            exl: bit(1),
            erl: bit(2),
            ksu: match (raw >> 3) & 0x3 {
                0 => Ksu::Kernel,
                1 => Ksu::Supervisor,
                // 3 is reserved and behaves as user mode
                _ => Ksu::User,
            },
            ux: bit(5),
            sx: bit(6),
            kx: bit(7),
            im: (raw >> 8) as u8,
            de: bit(16),
            ce: bit(17),
            ts: bit(21),
            bev: bit(22),
            re: bit(25),
            fr: bit(26),
            rp: bit(27),
            cu: ((raw >> 28) & 0xF) as u8,
        }
    }
}

/// Decoded view of the Cause register.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CauseFlags {
    pub exc_code: u8,
    pub ip: u8,
    pub ce: u8,
    pub bd: bool,
}

impl CauseFlags {
    pub fn decode(raw: u32) -> Self {
        Self {
            exc_code: ((raw >> 2) & 0x1F) as u8,
            ip: (raw >> 8) as u8,
            ce: ((raw >> 28) & 0x3) as u8,
            bd: raw & (1 << 31) != 0,
        }
    }
}

pub struct Cop0 {
    /// 32 COP0 registers (64-bit each)
    pub regs: [u64; 32],
    status: StatusFlags,
    cause: CauseFlags,
    /// Synchronous exception raised by the current instruction.
    pending: Option<ExceptionKind>,
    /// Count advances on every second pipeline cycle.
    half_cycle: bool,
    /// Route Count == Compare to IP7 (hardware behaviour). When clear, the
    /// match raises a one-shot internal timer condition instead.
    timer_on_ip7: bool,
    timer_pending: bool,
}

// COP0 register indices
impl Cop0 {
    pub const INDEX: usize = 0;
    pub const RANDOM: usize = 1;
    pub const ENTRY_LO0: usize = 2;
    pub const ENTRY_LO1: usize = 3;
    pub const CONTEXT: usize = 4;
    pub const PAGE_MASK: usize = 5;
    pub const WIRED: usize = 6;
    pub const BAD_VADDR: usize = 8;
    pub const COUNT: usize = 9;
    pub const ENTRY_HI: usize = 10;
    pub const COMPARE: usize = 11;
    pub const STATUS: usize = 12;
    pub const CAUSE: usize = 13;
    pub const EPC: usize = 14;
    pub const PRID: usize = 15;
    pub const CONFIG: usize = 16;
    pub const LL_ADDR: usize = 17;
    pub const WATCH_LO: usize = 18;
    pub const WATCH_HI: usize = 19;
    pub const X_CONTEXT: usize = 20;
    pub const TAG_LO: usize = 28;
    pub const TAG_HI: usize = 29;
    pub const ERROR_EPC: usize = 30;
}

/// Status bits written directly by exception entry and ERET.
const STATUS_EXL: u64 = 1 << 1;
const STATUS_ERL: u64 = 1 << 2;
const STATUS_BEV: u64 = 1 << 22;
const CAUSE_BD: u64 = 1 << 31;
const CAUSE_IP7: u64 = 1 << 15;
/// Cause bits software may write: IP0 and IP1.
const CAUSE_SW_MASK: u64 = 0x0000_0300;

pub const RESET_VECTOR: u64 = 0xFFFF_FFFF_BFC0_0000;
const BOOT_BASE: u64 = 0xFFFF_FFFF_BFC0_0200;
const GENERAL_BASE: u64 = 0xFFFF_FFFF_8000_0000;
const CACHE_BASE: u64 = 0xFFFF_FFFF_A000_0000;

impl Default for Cop0 {
    fn default() -> Self {
        Self::new()
    }
}

impl Cop0 {
    pub fn new() -> Self {
        let mut regs = [0u64; 32];
        // Config register defaults: Big-endian, data cache writeback
        regs[Self::CONFIG] = 0x0006_E463;
        // Random starts at 31 (decrements to Wired)
        regs[Self::RANDOM] = 31;
        regs[Self::PRID] = 0x0000_0B22; // NEC VR4300
        Self {
            regs,
            status: StatusFlags::default(),
            cause: CauseFlags::default(),
            pending: None,
            half_cycle: false,
            timer_on_ip7: true,
            timer_pending: false,
        }
    }

    pub fn status(&self) -> StatusFlags {
        self.status
    }

    pub fn cause(&self) -> CauseFlags {
        self.cause
    }

    fn set_status_raw(&mut self, raw: u64) {
        self.regs[Self::STATUS] = raw & 0xFFFF_FFFF;
        self.status = StatusFlags::decode(raw as u32);
    }

    fn set_cause_raw(&mut self, raw: u64) {
        self.regs[Self::CAUSE] = raw & 0xFFFF_FFFF;
        self.cause = CauseFlags::decode(raw as u32);
    }

    /// Read a COP0 register (MFC0)
    pub fn read_reg(&self, index: usize) -> u64 {
        self.regs[index & 0x1F]
    }

    /// Write a COP0 register (MTC0) with side effects
    pub fn write_reg(&mut self, index: usize, val: u64) {
        let index = index & 0x1F;
        match index {
            Self::COUNT => self.regs[Self::COUNT] = val & 0xFFFF_FFFF,
            Self::COMPARE => {
                self.regs[Self::COMPARE] = val & 0xFFFF_FFFF;
                // Writing Compare clears the timer interrupt (IP7)
                let cause = self.regs[Self::CAUSE] & !CAUSE_IP7;
                self.set_cause_raw(cause);
                self.timer_pending = false;
            }
            Self::STATUS => self.set_status_raw(val),
            Self::CAUSE => {
                // Only software interrupt bits (IP0, IP1) are writable
                let writable = val & CAUSE_SW_MASK;
                let preserved = self.regs[Self::CAUSE] & !CAUSE_SW_MASK;
                self.set_cause_raw(preserved | writable);
            }
            Self::WIRED => {
                log::debug!("MTC0 Wired = {}", val & 0x3F);
                self.regs[Self::WIRED] = val & 0x3F;
                self.regs[Self::RANDOM] = 31;
            }
            Self::CONTEXT => {
                // BadVPN2 (bits 4..22) is hardware-owned.
                let bad_vpn2 = self.regs[Self::CONTEXT] & 0x007F_FFF0;
                self.regs[Self::CONTEXT] = (val & !0x007F_FFFF) | bad_vpn2;
            }
            Self::X_CONTEXT => {
                let hw = self.regs[Self::X_CONTEXT] & 0x0000_0001_FFFF_FFF0;
                self.regs[Self::X_CONTEXT] = (val & !0x0000_0001_FFFF_FFFF) | hw;
            }
            Self::RANDOM | Self::PRID | Self::BAD_VADDR => {
                log::trace!("MTC0 to read-only register {} ignored", index);
            }
            Self::PAGE_MASK => self.regs[index] = val & 0x01FF_E000,
            Self::INDEX => self.regs[index] = val & 0x8000_003F,
            _ => self.regs[index] = val,
        }
    }

    /// Overwrite Cause including the hardware-owned bits. Reset state only.
    pub fn load_cause(&mut self, raw: u64) {
        self.set_cause_raw(raw);
    }

    /// Current privilege level. EXL and ERL force kernel mode.
    pub fn mode(&self) -> Ksu {
        if self.status.exl || self.status.erl {
            Ksu::Kernel
        } else {
            self.status.ksu
        }
    }

    /// 64-bit addressing enabled for the current mode.
    pub fn addressing_64(&self) -> bool {
        match self.mode() {
            Ksu::Kernel => self.status.kx,
            Ksu::Supervisor => self.status.sx,
            Ksu::User => self.status.ux,
        }
    }

    /// 64-bit operations are legal: always in kernel mode, otherwise only
    /// with 64-bit addressing.
    pub fn operation_64(&self) -> bool {
        self.mode() == Ksu::Kernel || self.addressing_64()
    }

    pub fn asid(&self) -> u8 {
        self.regs[Self::ENTRY_HI] as u8
    }

    /// Record a synchronous exception for this step. A later condition
    /// replaces the recorded one only if it has a higher priority.
    pub fn cause_exception(&mut self, kind: ExceptionKind) {
        if let Some(pending) = self.pending {
            if kind.priority() <= pending.priority() {
                return;
            }
            log::trace!("COP0: {:?} preempts {:?}", kind, pending);
        }
        if let Some(vaddr) = kind.bad_vaddr() {
            self.regs[Self::BAD_VADDR] = vaddr;
            let context = self.regs[Self::CONTEXT] & !0x007F_FFFF;
            self.regs[Self::CONTEXT] = context | (((vaddr >> 13) & 0x7_FFFF) << 4);
            let xcontext = self.regs[Self::X_CONTEXT] & !0x0000_0001_FFFF_FFFF;
            let region = (vaddr >> 62) & 0x3;
            self.regs[Self::X_CONTEXT] =
                xcontext | (region << 31) | (((vaddr >> 13) & 0x7FF_FFFF) << 4);
            let asid = self.regs[Self::ENTRY_HI] & 0xFF;
            self.regs[Self::ENTRY_HI] = (vaddr & 0xC000_00FF_FFFF_E000) | asid;
        }
        self.pending = Some(kind);
    }

    pub fn has_pending_exception(&self) -> bool {
        self.pending.is_some()
    }

    pub fn pending_exception(&self) -> Option<ExceptionKind> {
        self.pending
    }

    /// Drive a hardware interrupt line (2..=7) from an external source.
    pub fn set_interrupt_line(&mut self, line: u8, level: bool) {
        debug_assert!((2..=7).contains(&line));
        let bit = 1u64 << (8 + line);
        let cause = if level {
            self.regs[Self::CAUSE] | bit
        } else {
            self.regs[Self::CAUSE] & !bit
        };
        if cause != self.regs[Self::CAUSE] {
            self.set_cause_raw(cause);
        }
    }

    pub fn set_timer_on_ip7(&mut self, enabled: bool) {
        self.timer_on_ip7 = enabled;
    }

    /// Advance one pipeline cycle. Count increments every second call.
    pub fn tick(&mut self) {
        self.half_cycle = !self.half_cycle;
        if self.half_cycle {
            return;
        }
        let count = (self.regs[Self::COUNT] + 1) & 0xFFFF_FFFF;
        self.regs[Self::COUNT] = count;
        if count == self.regs[Self::COMPARE] & 0xFFFF_FFFF {
            if self.timer_on_ip7 {
                let cause = self.regs[Self::CAUSE] | CAUSE_IP7;
                self.set_cause_raw(cause);
            } else {
                self.timer_pending = true;
            }
        }
    }

    /// Decrement Random register (wraps from Wired back to 31)
    pub fn decrement_random(&mut self) {
        let wired = self.regs[Self::WIRED] & 0x1F;
        let random = self.regs[Self::RANDOM] & 0x1F;
        self.regs[Self::RANDOM] = if random <= wired { 31 } else { random - 1 };
    }

    /// IE set with EXL and ERL clear.
    pub fn interrupts_enabled(&self) -> bool {
        self.status.ie && !self.status.exl && !self.status.erl
    }

    /// Lowest enabled and asserted interrupt line: the software group
    /// (0..=2) first, then the hardware group (3..=7), ascending.
    pub fn pending_interrupt_line(&self) -> Option<u8> {
        let live = self.cause.ip & self.status.im;
        (0..8u8).find(|line| live & (1 << line) != 0)
    }

    /// Take the highest-priority exception, if any. Returns the vector to
    /// jump to; this is the only PC redirect outside branch execution.
    pub fn service(&mut self, site: ExceptionSite) -> Option<u64> {
        let (general, cache) = if self.status.bev {
            (BOOT_BASE, BOOT_BASE)
        } else {
            (GENERAL_BASE, CACHE_BASE)
        };

        let kind = match self.pending.take() {
            Some(kind) => kind,
            None => {
                if !self.interrupts_enabled() {
                    return None;
                }
                if let Some(line) = self.pending_interrupt_line() {
                    log::trace!("COP0: interrupt line {} taken at {:#018X}", line, site.pc);
                } else if self.timer_pending {
                    self.timer_pending = false;
                    log::trace!("COP0: internal timer taken at {:#018X}", site.pc);
                } else {
                    return None;
                }
                self.enter(site, ExceptionCode::Interrupt, 0);
                return Some(general + 0x180);
            }
        };

        match kind {
            ExceptionKind::Reset => {
                self.regs[Self::ERROR_EPC] = site.pc;
                let status = self.regs[Self::STATUS] | STATUS_ERL | STATUS_BEV;
                self.set_status_raw(status);
                Some(RESET_VECTOR)
            }
            ExceptionKind::TlbRefill { .. } | ExceptionKind::XtlbRefill { .. } => {
                let nested = self.status.exl;
                let offset = match (nested, kind) {
                    (true, _) => 0x180,
                    (false, ExceptionKind::XtlbRefill { .. }) => 0x080,
                    (false, _) => 0x000,
                };
                self.enter(site, kind.code(), 0);
                Some(general + offset)
            }
            ExceptionKind::CacheError => {
                self.regs[Self::ERROR_EPC] = Self::epc_for(site);
                let status = self.regs[Self::STATUS] | STATUS_ERL;
                self.set_status_raw(status);
                Some(cache + 0x100)
            }
            ExceptionKind::CoprocessorUnusable(unit) => {
                self.enter(site, kind.code(), unit);
                Some(general + 0x180)
            }
            _ => {
                self.enter(site, kind.code(), 0);
                Some(general + 0x180)
            }
        }
    }

    fn epc_for(site: ExceptionSite) -> u64 {
        if site.delay_slot {
            site.pc.wrapping_sub(4)
        } else {
            site.pc
        }
    }

    /// Common exception entry: EPC/BD (unless already at exception level),
    /// ExcCode, CE, then EXL.
    fn enter(&mut self, site: ExceptionSite, code: ExceptionCode, unit: u8) {
        let mut cause = self.regs[Self::CAUSE];
        if !self.status.exl {
            self.regs[Self::EPC] = Self::epc_for(site);
            if site.delay_slot {
                cause |= CAUSE_BD;
            } else {
                cause &= !CAUSE_BD;
            }
        }
        cause = (cause & !0x7C) | (u64::from(code as u8) << 2);
        cause = (cause & !(0x3 << 28)) | (u64::from(unit & 0x3) << 28);
        self.set_cause_raw(cause);

        let status = self.regs[Self::STATUS] | STATUS_EXL;
        self.set_status_raw(status);
    }

    /// ERET: leave exception level. The caller clears LLbit.
    pub fn eret(&mut self) -> u64 {
        let status = self.regs[Self::STATUS];
        if self.status.erl {
            self.set_status_raw(status & !STATUS_ERL);
            self.regs[Self::ERROR_EPC]
        } else {
            self.set_status_raw(status & !STATUS_EXL);
            self.regs[Self::EPC]
        }
    }
}
