use crate::bus::{Bus, BusError};
use crate::cpu::cop0::{Cop0, Ksu};
use crate::cpu::cop1::Cop1;
use crate::cpu::exceptions::{ExceptionCode, ExceptionKind, ExceptionSite};
use crate::cpu::instruction::Instruction;
use crate::cpu::tlb::{Tlb, TlbFault};
use crate::debug::{RetiredInstruction, TraceLog};

/// Kind of memory access being translated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Access {
    Fetch,
    Load,
    Store,
}

impl Access {
    fn is_store(self) -> bool {
        self == Access::Store
    }
}

/// NEC VR4300 CPU: the N64's main processor.
///
/// A MIPS III 64-bit processor running at 93.75 MHz.
/// 32 general-purpose 64-bit registers (r0 hardwired to 0),
/// HI/LO for multiply/divide, and two coprocessors.
pub struct Vr4300 {
    /// 32 general-purpose 64-bit registers. gpr[0] is always 0.
    pub gpr: [u64; 32],

    /// Program counter (64-bit virtual address)
    pub pc: u64,

    /// Next PC: used for branch delay slot handling.
    /// After each instruction: pc = next_pc; next_pc += 4.
    /// Branch instructions modify next_pc instead of pc.
    pub next_pc: u64,

    /// HI register: upper half of multiply, remainder of divide
    pub hi: u64,

    /// LO register: lower half of multiply, quotient of divide
    pub lo: u64,

    /// COP0: System Control Coprocessor (TLB, exceptions, interrupts)
    pub cop0: Cop0,

    /// COP1: Floating Point Unit
    pub cop1: Cop1,

    pub tlb: Tlb,

    /// The instruction being executed sits in a branch delay slot.
    pub in_delay_slot: bool,

    /// The next instruction to execute is a delay slot.
    pub branch_pending: bool,

    /// LLBit for Load Linked / Store Conditional (atomic operations)
    pub ll_bit: bool,

    /// Retired-instruction ring, when tracing is on.
    pub trace: Option<TraceLog>,

    current_pc: u64,
    current_raw: u32,
}

impl Default for Vr4300 {
    fn default() -> Self {
        Self::new()
    }
}

impl Vr4300 {
    pub fn new() -> Self {
        let mut cpu = Self {
            gpr: [0u64; 32],
            pc: 0xFFFF_FFFF_BFC0_0000, // Reset vector (kseg1 → PIF ROM)
            next_pc: 0xFFFF_FFFF_BFC0_0004,
            hi: 0,
            lo: 0,
            cop0: Cop0::new(),
            cop1: Cop1::new(),
            tlb: Tlb::new(),
            in_delay_slot: false,
            branch_pending: false,
            ll_bit: false,
            trace: None,
            current_pc: 0,
            current_raw: 0,
        };

        // COP0 initial state after cold reset: CU0=1, CU1=1, FR=1
        cpu.write_status(0x3400_0000);
        cpu
    }

    /// Status writes also switch the FPU register view.
    pub fn write_status(&mut self, value: u64) {
        self.cop0.write_reg(Cop0::STATUS, value);
        self.cop1.set_fr(self.cop0.status().fr);
    }

    /// Jump to `pc` with no pending delay slot.
    pub fn set_pc(&mut self, pc: u64) {
        self.pc = pc;
        self.next_pc = pc.wrapping_add(4);
        self.branch_pending = false;
    }

    /// Execute one instruction. Returns number of cycles consumed.
    ///
    /// Fetch, decode, execute, then retire. Guest exceptions never surface
    /// as errors: they redirect the PC during retire. `Err` means the bus
    /// itself failed.
    pub fn step(&mut self, bus: &impl Bus) -> Result<u64, BusError> {
        let pc = self.pc;
        let raw = self.fetch(bus, pc)?;
        self.begin(pc, raw.unwrap_or(0));
        if let Some(raw) = raw {
            self.execute(Instruction::decode(raw), bus, pc)?;
        }
        self.retire();
        Ok(1)
    }

    /// Fetch the word at `pc`. `None` means the fetch raised an exception.
    pub fn fetch(&mut self, bus: &impl Bus, pc: u64) -> Result<Option<u32>, BusError> {
        if pc & 0x3 != 0 {
            self.cop0.cause_exception(ExceptionKind::Address {
                code: ExceptionCode::AddressErrorLoad,
                vaddr: pc,
            });
            return Ok(None);
        }
        let Some(phys) = self.translate(pc, Access::Fetch) else {
            return Ok(None);
        };
        bus.read_u32(phys).map(Some)
    }

    /// Start executing the instruction at `pc`: advance the PC pair and
    /// move the delay-slot marker onto this instruction.
    pub fn begin(&mut self, pc: u64, raw: u32) {
        self.current_pc = pc;
        self.current_raw = raw;
        self.in_delay_slot = std::mem::take(&mut self.branch_pending);
        self.pc = self.next_pc;
        self.next_pc = self.next_pc.wrapping_add(4);
    }

    /// Branch decision for the instruction in flight.
    pub fn branch(&mut self, target: u64, taken: bool) {
        if taken {
            self.next_pc = target;
        }
        self.branch_pending = true;
    }

    /// Branch-likely: a branch not taken nullifies its delay slot.
    pub fn branch_likely(&mut self, target: u64, taken: bool) {
        if taken {
            self.branch(target, true);
        } else {
            self.pc = self.next_pc;
            self.next_pc = self.next_pc.wrapping_add(4);
        }
    }

    /// Finish the instruction in flight. Returns false when an exception
    /// or interrupt redirected the PC.
    pub fn retire(&mut self) -> bool {
        // r0 is hardwired to 0
        self.gpr[0] = 0;
        self.cop0.tick();
        self.cop0.decrement_random();

        if let Some(trace) = self.trace.as_mut() {
            trace.push(RetiredInstruction {
                pc: self.current_pc,
                raw: self.current_raw,
                delay_slot: self.in_delay_slot,
            });
        }

        let site = if self.cop0.has_pending_exception() {
            ExceptionSite {
                pc: self.current_pc,
                delay_slot: self.in_delay_slot,
            }
        } else {
            ExceptionSite {
                pc: self.pc,
                delay_slot: self.branch_pending,
            }
        };
        match self.cop0.service(site) {
            Some(target) => {
                log::trace!(
                    "exception {} -> {:#018X} (EPC {:#018X})",
                    self.cop0.cause().exc_code,
                    target,
                    self.cop0.regs[Cop0::EPC]
                );
                self.cop1.set_fr(self.cop0.status().fr);
                self.set_pc(target);
                false
            }
            None => true,
        }
    }

    /// Resolve a virtual address without side effects.
    ///
    /// MIPS segments (32-bit addressing):
    ///   kuseg (0x0000_0000..0x7FFF_FFFF): TLB mapped
    ///   kseg0 (0x8000_0000..0x9FFF_FFFF): direct map, cached
    ///   kseg1 (0xA000_0000..0xBFFF_FFFF): direct map, uncached
    ///   ksseg/kseg3 (0xC000_0000+):       TLB mapped
    pub fn resolve(&self, vaddr: u64, access: Access) -> Result<u32, ExceptionKind> {
        let store = access.is_store();
        let address_error = ExceptionKind::Address {
            code: if store {
                ExceptionCode::AddressErrorStore
            } else {
                ExceptionCode::AddressErrorLoad
            },
            vaddr,
        };
        let wide = self.cop0.addressing_64();
        let mode = self.cop0.mode();

        // `Some` for directly mapped segments, `None` for TLB-mapped ones.
        let direct = if wide {
            match vaddr {
                0x0000_0000_0000_0000..=0x0000_00FF_FFFF_FFFF => None,
                0x4000_0000_0000_0000..=0x4000_00FF_FFFF_FFFF if mode != Ksu::User => None,
                0x8000_0000_0000_0000..=0xBFFF_FFFF_FFFF_FFFF if mode == Ksu::Kernel => {
                    Some(vaddr as u32)
                }
                0xC000_0000_0000_0000..=0xC000_00FF_7FFF_FFFF if mode == Ksu::Kernel => None,
                0xFFFF_FFFF_8000_0000..=0xFFFF_FFFF_BFFF_FFFF if mode == Ksu::Kernel => {
                    Some(vaddr as u32 & 0x1FFF_FFFF)
                }
                0xFFFF_FFFF_C000_0000..=0xFFFF_FFFF_DFFF_FFFF if mode != Ksu::User => None,
                0xFFFF_FFFF_E000_0000..=0xFFFF_FFFF_FFFF_FFFF if mode == Ksu::Kernel => None,
                _ => return Err(address_error),
            }
        } else {
            let addr32 = vaddr as u32;
            match (addr32, mode) {
                (0x0000_0000..=0x7FFF_FFFF, _) => None,
                (0x8000_0000..=0xBFFF_FFFF, Ksu::Kernel) => Some(addr32 & 0x1FFF_FFFF),
                (0xC000_0000..=0xDFFF_FFFF, Ksu::Kernel | Ksu::Supervisor) => None,
                (0xE000_0000..=0xFFFF_FFFF, Ksu::Kernel) => None,
                _ => return Err(address_error),
            }
        };
        if let Some(phys) = direct {
            return Ok(phys);
        }

        let lookup = if wide { vaddr } else { vaddr as u32 as i32 as u64 };
        self.tlb
            .translate(lookup, self.cop0.asid(), store)
            .map_err(|fault| match fault {
                TlbFault::Miss if wide => ExceptionKind::XtlbRefill { store, vaddr },
                TlbFault::Miss => ExceptionKind::TlbRefill { store, vaddr },
                TlbFault::Invalid => ExceptionKind::Address {
                    code: if store {
                        ExceptionCode::TlbStore
                    } else {
                        ExceptionCode::TlbLoad
                    },
                    vaddr,
                },
                TlbFault::Modified => ExceptionKind::Address {
                    code: ExceptionCode::TlbModification,
                    vaddr,
                },
            })
    }

    /// Translate a virtual address, raising the matching exception on
    /// failure.
    pub fn translate(&mut self, vaddr: u64, access: Access) -> Option<u32> {
        match self.resolve(vaddr, access) {
            Ok(phys) => Some(phys),
            Err(kind) => {
                log::trace!("translate {:#018X} ({:?}) faulted: {:?}", vaddr, access, kind);
                self.cop0.cause_exception(kind);
                None
            }
        }
    }

    fn check_alignment(&mut self, vaddr: u64, size: u32, access: Access) -> bool {
        if vaddr & u64::from(size - 1) == 0 {
            return true;
        }
        self.cop0.cause_exception(ExceptionKind::Address {
            code: if access.is_store() {
                ExceptionCode::AddressErrorStore
            } else {
                ExceptionCode::AddressErrorLoad
            },
            vaddr,
        });
        false
    }

    /// Load `size` bytes (1, 2, 4 or 8), zero-extended. `None` means an
    /// address or TLB exception was raised.
    pub fn load(&mut self, bus: &impl Bus, vaddr: u64, size: u32) -> Result<Option<u64>, BusError> {
        if !self.check_alignment(vaddr, size, Access::Load) {
            return Ok(None);
        }
        let Some(phys) = self.translate(vaddr, Access::Load) else {
            return Ok(None);
        };
        let value = match size {
            1 => u64::from(bus.read_u8(phys)?),
            2 => u64::from(bus.read_u16(phys)?),
            4 => u64::from(bus.read_u32(phys)?),
            _ => bus.read_u64(phys)?,
        };
        Ok(Some(value))
    }

    /// Store raw bytes at `vaddr` (SWL/SWR/SDL/SDR). The range never
    /// crosses an aligned word or doubleword, so one translation covers it.
    pub fn store_bytes(
        &mut self,
        bus: &impl Bus,
        vaddr: u64,
        bytes: &[u8],
    ) -> Result<bool, BusError> {
        let Some(phys) = self.translate(vaddr, Access::Store) else {
            return Ok(false);
        };
        bus.write(phys, bytes)?;
        Ok(true)
    }

    /// Store the low `size` bytes of `value`. Returns false when an address
    /// or TLB exception was raised instead.
    pub fn store(
        &mut self,
        bus: &impl Bus,
        vaddr: u64,
        size: u32,
        value: u64,
    ) -> Result<bool, BusError> {
        if !self.check_alignment(vaddr, size, Access::Store) {
            return Ok(false);
        }
        let Some(phys) = self.translate(vaddr, Access::Store) else {
            return Ok(false);
        };
        match size {
            1 => bus.write_u8(phys, value as u8)?,
            2 => bus.write_u16(phys, value as u16)?,
            4 => bus.write_u32(phys, value as u32)?,
            _ => bus.write_u64(phys, value)?,
        }
        Ok(true)
    }
}
