use crate::bus::{Bus, BusError};
use crate::cpu::cop0::{Cop0, Ksu};
use crate::cpu::exceptions::{ExceptionCode, ExceptionKind};
use crate::cpu::instruction::Instruction;
use crate::cpu::tlb::TlbEntry;
use crate::cpu::vr4300::Vr4300;

#[inline]
fn sext32(v: u32) -> u64 {
    v as i32 as i64 as u64
}

impl Vr4300 {
    /// Execute a decoded instruction.
    ///
    /// `current_pc` is the PC of this instruction (before advancement),
    /// needed for branch target calculations and exception handling.
    /// Architectural faults are recorded in COP0; only bus failures return
    /// `Err`.
    pub fn execute(
        &mut self,
        instr: Instruction,
        bus: &impl Bus,
        current_pc: u64,
    ) -> Result<(), BusError> {
        log::trace!("{:#018X}: {}", current_pc, instr);
        let rs = self.gpr[instr.rs()];
        let rt = self.gpr[instr.rt()];
        let imm = instr.imm_sign_ext();

        match instr.opcode() {
            0x00 => self.execute_special(instr, current_pc),
            0x01 => self.execute_regimm(instr, current_pc),
            0x02 => self.branch(instr.jump_target(current_pc), true), // J
            0x03 => {
                // JAL
                self.gpr[31] = current_pc.wrapping_add(8);
                self.branch(instr.jump_target(current_pc), true);
            }
            0x04 => self.branch(instr.branch_target(current_pc), rs == rt), // BEQ
            0x05 => self.branch(instr.branch_target(current_pc), rs != rt), // BNE
            0x06 => self.branch(instr.branch_target(current_pc), rs as i64 <= 0), // BLEZ
            0x07 => self.branch(instr.branch_target(current_pc), rs as i64 > 0), // BGTZ
            0x08 => {
                // ADDI
                match (rs as i32).checked_add(imm as i32) {
                    Some(v) => self.gpr[instr.rt()] = sext32(v as u32),
                    None => self.raise(ExceptionCode::Overflow),
                }
            }
            0x09 => self.gpr[instr.rt()] = sext32((rs as u32).wrapping_add(imm as u32)), // ADDIU
            0x0A => self.gpr[instr.rt()] = ((rs as i64) < (imm as i64)) as u64, // SLTI
            0x0B => self.gpr[instr.rt()] = (rs < imm) as u64, // SLTIU
            0x0C => self.gpr[instr.rt()] = rs & u64::from(instr.imm()), // ANDI
            0x0D => self.gpr[instr.rt()] = rs | u64::from(instr.imm()), // ORI
            0x0E => self.gpr[instr.rt()] = rs ^ u64::from(instr.imm()), // XORI
            0x0F => self.gpr[instr.rt()] = sext32(u32::from(instr.imm()) << 16), // LUI
            0x10 => self.execute_cop0(instr, current_pc),
            0x11 => return self.execute_cop1(instr, current_pc),
            0x12 => {
                if self.cop0.status().cu & 0x4 == 0 {
                    self.cop0.cause_exception(ExceptionKind::CoprocessorUnusable(2));
                } else {
                    self.raise(ExceptionCode::ReservedInstruction);
                }
            }
            0x14 => self.branch_likely(instr.branch_target(current_pc), rs == rt), // BEQL
            0x15 => self.branch_likely(instr.branch_target(current_pc), rs != rt), // BNEL
            0x16 => self.branch_likely(instr.branch_target(current_pc), rs as i64 <= 0), // BLEZL
            0x17 => self.branch_likely(instr.branch_target(current_pc), rs as i64 > 0), // BGTZL
            0x18 => {
                // DADDI
                if self.require_64() {
                    match (rs as i64).checked_add(imm as i64) {
                        Some(v) => self.gpr[instr.rt()] = v as u64,
                        None => self.raise(ExceptionCode::Overflow),
                    }
                }
            }
            0x19 => {
                // DADDIU
                if self.require_64() {
                    self.gpr[instr.rt()] = rs.wrapping_add(imm);
                }
            }
            0x1A | 0x1B => {
                if self.require_64() {
                    return self.load_double_partial(instr, bus);
                }
            }
            0x20..=0x27 | 0x30 | 0x34 | 0x37 => return self.execute_load(instr, bus),
            0x28..=0x2E | 0x38 | 0x3C | 0x3F => return self.execute_store(instr, bus),
            0x2F => {} // CACHE: no cache model
            0x31 | 0x35 | 0x39 | 0x3D => return self.execute_cop1_memory(instr, bus),
            0x32 | 0x36 | 0x3A | 0x3E => {
                // LWC2/LDC2/SWC2/SDC2: no COP2 on the VR4300
                self.cop0.cause_exception(ExceptionKind::CoprocessorUnusable(2));
            }
            _ => self.raise(ExceptionCode::ReservedInstruction),
        }
        Ok(())
    }

    /// Record a general exception for the instruction in flight.
    pub fn raise(&mut self, code: ExceptionCode) {
        self.cop0.cause_exception(ExceptionKind::General(code));
    }

    /// 64-bit operations are reserved outside 64-bit mode.
    fn require_64(&mut self) -> bool {
        if self.cop0.operation_64() {
            true
        } else {
            self.raise(ExceptionCode::ReservedInstruction);
            false
        }
    }

    fn execute_special(&mut self, instr: Instruction, current_pc: u64) {
        let rs = self.gpr[instr.rs()];
        let rt = self.gpr[instr.rt()];
        let rd = instr.rd();
        let sa = instr.sa();

        match instr.funct() {
            0x00 => self.gpr[rd] = sext32((rt as u32) << sa), // SLL
            0x02 => self.gpr[rd] = sext32((rt as u32) >> sa), // SRL
            // SRA shifts the full register, then keeps the low word.
            0x03 => self.gpr[rd] = sext32(((rt as i64) >> sa) as u32),
            0x04 => self.gpr[rd] = sext32((rt as u32) << (rs & 0x1F)), // SLLV
            0x06 => self.gpr[rd] = sext32((rt as u32) >> (rs & 0x1F)), // SRLV
            0x07 => self.gpr[rd] = sext32(((rt as i64) >> (rs & 0x1F)) as u32), // SRAV
            0x08 => self.branch(rs, true), // JR
            0x09 => {
                // JALR: target is read before the link is written
                self.gpr[rd] = current_pc.wrapping_add(8);
                self.branch(rs, true);
            }
            0x0C => self.raise(ExceptionCode::Syscall),
            0x0D => self.raise(ExceptionCode::Breakpoint),
            0x0F => {} // SYNC
            0x10 => self.gpr[rd] = self.hi, // MFHI
            0x11 => self.hi = rs,           // MTHI
            0x12 => self.gpr[rd] = self.lo, // MFLO
            0x13 => self.lo = rs,           // MTLO
            0x14 => {
                if self.require_64() {
                    self.gpr[rd] = rt << (rs & 0x3F); // DSLLV
                }
            }
            0x16 => {
                if self.require_64() {
                    self.gpr[rd] = rt >> (rs & 0x3F); // DSRLV
                }
            }
            0x17 => {
                if self.require_64() {
                    self.gpr[rd] = ((rt as i64) >> (rs & 0x3F)) as u64; // DSRAV
                }
            }
            0x18 => {
                // MULT
                let product = (rs as i32 as i64).wrapping_mul(rt as i32 as i64);
                self.lo = sext32(product as u32);
                self.hi = sext32((product >> 32) as u32);
            }
            0x19 => {
                // MULTU
                let product = (rs as u32 as u64) * (rt as u32 as u64);
                self.lo = sext32(product as u32);
                self.hi = sext32((product >> 32) as u32);
            }
            0x1A => self.div32(rs as i32, rt as i32),
            0x1B => self.divu32(rs as u32, rt as u32),
            0x1C => {
                if self.require_64() {
                    // DMULT
                    let product = (rs as i64 as i128) * (rt as i64 as i128);
                    self.lo = product as u64;
                    self.hi = (product >> 64) as u64;
                }
            }
            0x1D => {
                if self.require_64() {
                    // DMULTU
                    let product = (rs as u128) * (rt as u128);
                    self.lo = product as u64;
                    self.hi = (product >> 64) as u64;
                }
            }
            0x1E => {
                if self.require_64() {
                    self.div64(rs as i64, rt as i64);
                }
            }
            0x1F => {
                if self.require_64() {
                    // DDIVU
                    if rt == 0 {
                        self.lo = u64::MAX;
                        self.hi = rs;
                    } else {
                        self.lo = rs / rt;
                        self.hi = rs % rt;
                    }
                }
            }
            0x20 => match (rs as i32).checked_add(rt as i32) {
                // ADD
                Some(v) => self.gpr[rd] = sext32(v as u32),
                None => self.raise(ExceptionCode::Overflow),
            },
            0x21 => self.gpr[rd] = sext32((rs as u32).wrapping_add(rt as u32)), // ADDU
            0x22 => match (rs as i32).checked_sub(rt as i32) {
                // SUB
                Some(v) => self.gpr[rd] = sext32(v as u32),
                None => self.raise(ExceptionCode::Overflow),
            },
            0x23 => self.gpr[rd] = sext32((rs as u32).wrapping_sub(rt as u32)), // SUBU
            0x24 => self.gpr[rd] = rs & rt,    // AND
            0x25 => self.gpr[rd] = rs | rt,    // OR
            0x26 => self.gpr[rd] = rs ^ rt,    // XOR
            0x27 => self.gpr[rd] = !(rs | rt), // NOR
            0x2A => self.gpr[rd] = ((rs as i64) < (rt as i64)) as u64, // SLT
            0x2B => self.gpr[rd] = (rs < rt) as u64, // SLTU
            0x2C => {
                if self.require_64() {
                    // DADD
                    match (rs as i64).checked_add(rt as i64) {
                        Some(v) => self.gpr[rd] = v as u64,
                        None => self.raise(ExceptionCode::Overflow),
                    }
                }
            }
            0x2D => {
                if self.require_64() {
                    self.gpr[rd] = rs.wrapping_add(rt); // DADDU
                }
            }
            0x2E => {
                if self.require_64() {
                    // DSUB
                    match (rs as i64).checked_sub(rt as i64) {
                        Some(v) => self.gpr[rd] = v as u64,
                        None => self.raise(ExceptionCode::Overflow),
                    }
                }
            }
            0x2F => {
                if self.require_64() {
                    self.gpr[rd] = rs.wrapping_sub(rt); // DSUBU
                }
            }
            0x30 => self.trap_if((rs as i64) >= (rt as i64)), // TGE
            0x31 => self.trap_if(rs >= rt),                   // TGEU
            0x32 => self.trap_if((rs as i64) < (rt as i64)),  // TLT
            0x33 => self.trap_if(rs < rt),                    // TLTU
            0x34 => self.trap_if(rs == rt),                   // TEQ
            0x36 => self.trap_if(rs != rt),                   // TNE
            0x38 => {
                if self.require_64() {
                    self.gpr[rd] = rt << sa; // DSLL
                }
            }
            0x3A => {
                if self.require_64() {
                    self.gpr[rd] = rt >> sa; // DSRL
                }
            }
            0x3B => {
                if self.require_64() {
                    self.gpr[rd] = ((rt as i64) >> sa) as u64; // DSRA
                }
            }
            0x3C => {
                if self.require_64() {
                    self.gpr[rd] = rt << (sa + 32); // DSLL32
                }
            }
            0x3E => {
                if self.require_64() {
                    self.gpr[rd] = rt >> (sa + 32); // DSRL32
                }
            }
            0x3F => {
                if self.require_64() {
                    self.gpr[rd] = ((rt as i64) >> (sa + 32)) as u64; // DSRA32
                }
            }
            _ => self.raise(ExceptionCode::ReservedInstruction),
        }
    }

    fn div32(&mut self, dividend: i32, divisor: i32) {
        if divisor == 0 {
            self.lo = if dividend >= 0 { u64::MAX } else { 1 };
            self.hi = sext32(dividend as u32);
        } else {
            // i32::MIN / -1 wraps back to i32::MIN with remainder 0
            self.lo = sext32(dividend.wrapping_div(divisor) as u32);
            self.hi = sext32(dividend.wrapping_rem(divisor) as u32);
        }
    }

    fn divu32(&mut self, dividend: u32, divisor: u32) {
        if divisor == 0 {
            self.lo = u64::MAX;
            self.hi = sext32(dividend);
        } else {
            self.lo = sext32(dividend / divisor);
            self.hi = sext32(dividend % divisor);
        }
    }

    fn div64(&mut self, dividend: i64, divisor: i64) {
        if divisor == 0 {
            self.lo = if dividend >= 0 { u64::MAX } else { 1 };
            self.hi = dividend as u64;
        } else {
            self.lo = dividend.wrapping_div(divisor) as u64;
            self.hi = dividend.wrapping_rem(divisor) as u64;
        }
    }

    fn trap_if(&mut self, condition: bool) {
        if condition {
            self.raise(ExceptionCode::Trap);
        }
    }

    fn execute_regimm(&mut self, instr: Instruction, current_pc: u64) {
        let rs = self.gpr[instr.rs()];
        let imm = instr.imm_sign_ext();
        let target = instr.branch_target(current_pc);
        let negative = (rs as i64) < 0;

        match instr.rt() {
            0x00 => self.branch(target, negative),                // BLTZ
            0x01 => self.branch(target, !negative),               // BGEZ
            0x02 => self.branch_likely(target, negative),         // BLTZL
            0x03 => self.branch_likely(target, !negative),        // BGEZL
            0x08 => self.trap_if((rs as i64) >= (imm as i64)),    // TGEI
            0x09 => self.trap_if(rs >= imm),                      // TGEIU
            0x0A => self.trap_if((rs as i64) < (imm as i64)),     // TLTI
            0x0B => self.trap_if(rs < imm),                       // TLTIU
            0x0C => self.trap_if(rs == imm),                      // TEQI
            0x0E => self.trap_if(rs != imm),                      // TNEI
            0x10..=0x13 => {
                // BLTZAL/BGEZAL/BLTZALL/BGEZALL: link regardless of outcome
                self.gpr[31] = current_pc.wrapping_add(8);
                let taken = if instr.rt() & 1 == 0 { negative } else { !negative };
                if instr.rt() & 0x2 == 0 {
                    self.branch(target, taken);
                } else {
                    self.branch_likely(target, taken);
                }
            }
            _ => self.raise(ExceptionCode::ReservedInstruction),
        }
    }

    fn effective_address(&self, instr: Instruction) -> u64 {
        self.gpr[instr.rs()].wrapping_add(instr.imm_sign_ext())
    }

    fn execute_load(&mut self, instr: Instruction, bus: &impl Bus) -> Result<(), BusError> {
        let vaddr = self.effective_address(instr);
        let rt = instr.rt();
        match instr.opcode() {
            0x22 | 0x26 => return self.load_word_partial(instr, bus),
            0x27 | 0x34 | 0x37 if !self.require_64() => return Ok(()),
            _ => {}
        }
        let (size, signed) = match instr.opcode() {
            0x20 => (1, true),       // LB
            0x21 => (2, true),       // LH
            0x23 | 0x30 => (4, true), // LW, LL
            0x24 => (1, false),      // LBU
            0x25 => (2, false),      // LHU
            0x27 => (4, false),      // LWU
            _ => (8, false),         // LD, LLD
        };
        let Some(value) = self.load(bus, vaddr, size)? else {
            return Ok(());
        };
        self.gpr[rt] = if signed {
            match size {
                1 => value as u8 as i8 as i64 as u64,
                2 => value as u16 as i16 as i64 as u64,
                _ => sext32(value as u32),
            }
        } else {
            value
        };
        if matches!(instr.opcode(), 0x30 | 0x34) {
            self.link_load(vaddr);
        }
        Ok(())
    }

    /// LL/LLD: remember the reservation.
    fn link_load(&mut self, vaddr: u64) {
        self.ll_bit = true;
        if let Ok(phys) = self.resolve(vaddr, crate::cpu::Access::Load) {
            self.cop0.regs[Cop0::LL_ADDR] = u64::from(phys >> 4);
        }
    }

    fn execute_store(&mut self, instr: Instruction, bus: &impl Bus) -> Result<(), BusError> {
        let vaddr = self.effective_address(instr);
        let rt = instr.rt();
        let value = self.gpr[rt];
        match instr.opcode() {
            0x28 => {
                self.store(bus, vaddr, 1, value)?; // SB
            }
            0x29 => {
                self.store(bus, vaddr, 2, value)?; // SH
            }
            0x2B => {
                self.store(bus, vaddr, 4, value)?; // SW
            }
            0x2A | 0x2E => return self.store_word_partial(instr, bus),
            0x2C | 0x2D => {
                if self.require_64() {
                    return self.store_double_partial(instr, bus);
                }
            }
            0x38 => {
                // SC
                if self.ll_bit {
                    if self.store(bus, vaddr, 4, value)? {
                        self.gpr[rt] = 1;
                    }
                } else {
                    self.gpr[rt] = 0;
                }
            }
            0x3C => {
                // SCD
                if self.require_64() {
                    if self.ll_bit {
                        if self.store(bus, vaddr, 8, value)? {
                            self.gpr[rt] = 1;
                        }
                    } else {
                        self.gpr[rt] = 0;
                    }
                }
            }
            _ => {
                // SD
                if self.require_64() {
                    self.store(bus, vaddr, 8, value)?;
                }
            }
        }
        Ok(())
    }

    /// LWL/LWR: merge part of an aligned word into rt (big-endian).
    fn load_word_partial(&mut self, instr: Instruction, bus: &impl Bus) -> Result<(), BusError> {
        let vaddr = self.effective_address(instr);
        let Some(mem) = self.load(bus, vaddr & !0x3, 4)? else {
            return Ok(());
        };
        let mem = mem as u32;
        let k = (vaddr & 0x3) as u32;
        let reg = self.gpr[instr.rt()] as u32;
        let merged = if instr.opcode() == 0x22 {
            // LWL: bytes k..3 land in the high end of the register
            let shift = 8 * k;
            (reg & !(u32::MAX << shift)) | (mem << shift)
        } else {
            // LWR: bytes 0..=k land in the low end
            let shift = 8 * (3 - k);
            (reg & !(u32::MAX >> shift)) | (mem >> shift)
        };
        self.gpr[instr.rt()] = sext32(merged);
        Ok(())
    }

    /// SWL/SWR: only the bytes that change are written; memory is never
    /// read.
    fn store_word_partial(&mut self, instr: Instruction, bus: &impl Bus) -> Result<(), BusError> {
        let vaddr = self.effective_address(instr);
        let k = (vaddr & 0x3) as usize;
        let reg = (self.gpr[instr.rt()] as u32).to_be_bytes();
        if instr.opcode() == 0x2A {
            // SWL: the high 4-k register bytes fill vaddr..end of word
            self.store_bytes(bus, vaddr, &reg[..4 - k])?;
        } else {
            // SWR: the low k+1 register bytes fill start of word..=vaddr
            self.store_bytes(bus, vaddr & !0x3, &reg[3 - k..])?;
        }
        Ok(())
    }

    /// LDL/LDR
    fn load_double_partial(&mut self, instr: Instruction, bus: &impl Bus) -> Result<(), BusError> {
        let vaddr = self.effective_address(instr);
        let Some(mem) = self.load(bus, vaddr & !0x7, 8)? else {
            return Ok(());
        };
        let k = (vaddr & 0x7) as u32;
        let reg = self.gpr[instr.rt()];
        self.gpr[instr.rt()] = if instr.opcode() == 0x1A {
            let shift = 8 * k;
            (reg & !(u64::MAX << shift)) | (mem << shift)
        } else {
            let shift = 8 * (7 - k);
            (reg & !(u64::MAX >> shift)) | (mem >> shift)
        };
        Ok(())
    }

    /// SDL/SDR
    fn store_double_partial(&mut self, instr: Instruction, bus: &impl Bus) -> Result<(), BusError> {
        let vaddr = self.effective_address(instr);
        let k = (vaddr & 0x7) as usize;
        let reg = self.gpr[instr.rt()].to_be_bytes();
        if instr.opcode() == 0x2C {
            self.store_bytes(bus, vaddr, &reg[..8 - k])?;
        } else {
            self.store_bytes(bus, vaddr & !0x7, &reg[7 - k..])?;
        }
        Ok(())
    }

    fn execute_cop0(&mut self, instr: Instruction, current_pc: u64) {
        if self.cop0.mode() != Ksu::Kernel && self.cop0.status().cu & 0x1 == 0 {
            self.cop0.cause_exception(ExceptionKind::CoprocessorUnusable(0));
            return;
        }
        match instr.rs() {
            0x00 => self.gpr[instr.rt()] = sext32(self.cop0.read_reg(instr.rd()) as u32), // MFC0
            0x01 => {
                if self.require_64() {
                    self.gpr[instr.rt()] = self.cop0.read_reg(instr.rd()); // DMFC0
                }
            }
            0x04 => self.write_cop0(instr.rd(), sext32(self.gpr[instr.rt()] as u32)), // MTC0
            0x05 => {
                if self.require_64() {
                    self.write_cop0(instr.rd(), self.gpr[instr.rt()]); // DMTC0
                }
            }
            0x10..=0x1F => match instr.funct() {
                0x01 => self.tlb_read(),
                0x02 => {
                    let index = (self.cop0.regs[Cop0::INDEX] & 0x1F) as usize;
                    self.tlb_write(index);
                }
                0x06 => {
                    let index = (self.cop0.regs[Cop0::RANDOM] & 0x1F) as usize;
                    self.tlb_write(index);
                }
                0x08 => {
                    // TLBP
                    self.cop0.regs[Cop0::INDEX] =
                        match self.tlb.probe(self.cop0.regs[Cop0::ENTRY_HI]) {
                            Some(index) => index as u64,
                            None => 0x8000_0000,
                        };
                }
                0x18 => {
                    // ERET: no delay slot
                    let target = self.cop0.eret();
                    self.cop1.set_fr(self.cop0.status().fr);
                    self.ll_bit = false;
                    log::trace!("ERET at {:#018X} -> {:#018X}", current_pc, target);
                    self.set_pc(target);
                }
                _ => self.raise(ExceptionCode::ReservedInstruction),
            },
            _ => self.raise(ExceptionCode::ReservedInstruction),
        }
    }

    fn write_cop0(&mut self, index: usize, value: u64) {
        if index == Cop0::STATUS {
            self.write_status(value);
        } else {
            self.cop0.write_reg(index, value);
        }
    }

    fn tlb_read(&mut self) {
        let index = (self.cop0.regs[Cop0::INDEX] & 0x1F) as usize;
        let entry = self.tlb.read(index);
        let global = entry.entry_lo0 & entry.entry_lo1 & 0x1;
        self.cop0.regs[Cop0::PAGE_MASK] = u64::from(entry.page_mask);
        self.cop0.regs[Cop0::ENTRY_HI] = entry.entry_hi;
        self.cop0.regs[Cop0::ENTRY_LO0] = (entry.entry_lo0 & !0x1) | global;
        self.cop0.regs[Cop0::ENTRY_LO1] = (entry.entry_lo1 & !0x1) | global;
    }

    fn tlb_write(&mut self, index: usize) {
        let regs = &self.cop0.regs;
        // G is stored only when both halves carry it
        let global = regs[Cop0::ENTRY_LO0] & regs[Cop0::ENTRY_LO1] & 0x1;
        let entry = TlbEntry {
            page_mask: regs[Cop0::PAGE_MASK] as u32,
            entry_hi: regs[Cop0::ENTRY_HI],
            entry_lo0: (regs[Cop0::ENTRY_LO0] & !0x1) | global,
            entry_lo1: (regs[Cop0::ENTRY_LO1] & !0x1) | global,
        };
        self.tlb.write(index, entry);
    }

    fn cop1_usable(&mut self) -> bool {
        if self.cop0.status().cu & 0x2 == 0 {
            self.cop0.cause_exception(ExceptionKind::CoprocessorUnusable(1));
            return false;
        }
        self.cop1.set_fr(self.cop0.status().fr);
        true
    }

    fn execute_cop1(&mut self, instr: Instruction, current_pc: u64) -> Result<(), BusError> {
        if !self.cop1_usable() {
            return Ok(());
        }
        let rt = instr.rt();
        let fs = instr.fs();
        match instr.rs() {
            0x00 => self.gpr[rt] = sext32(self.cop1.read_word(fs)), // MFC1
            0x01 => self.gpr[rt] = self.cop1.read_double(fs),       // DMFC1
            0x02 => self.gpr[rt] = sext32(self.cop1.read_control(fs)), // CFC1
            0x04 => self.cop1.write_word(fs, self.gpr[rt] as u32),  // MTC1
            0x05 => self.cop1.write_double(fs, self.gpr[rt]),       // DMTC1
            0x06 => {
                // CTC1
                if self.cop1.write_control(fs, self.gpr[rt] as u32).is_err() {
                    self.raise(ExceptionCode::FloatingPoint);
                }
            }
            0x08 => {
                // BC1F/BC1T/BC1FL/BC1TL
                let target = instr.branch_target(current_pc);
                let taken = self.cop1.condition() == (rt & 0x1 != 0);
                if rt & 0x2 == 0 {
                    self.branch(target, taken);
                } else {
                    self.branch_likely(target, taken);
                }
            }
            0x10 | 0x11 | 0x14 | 0x15 => {
                if self.cop1.execute(instr).is_err() {
                    self.raise(ExceptionCode::FloatingPoint);
                }
            }
            _ => self.raise(ExceptionCode::ReservedInstruction),
        }
        Ok(())
    }

    /// LWC1/LDC1/SWC1/SDC1
    fn execute_cop1_memory(&mut self, instr: Instruction, bus: &impl Bus) -> Result<(), BusError> {
        if !self.cop1_usable() {
            return Ok(());
        }
        let vaddr = self.effective_address(instr);
        let ft = instr.ft();
        match instr.opcode() {
            0x31 => {
                if let Some(value) = self.load(bus, vaddr, 4)? {
                    self.cop1.write_word(ft, value as u32);
                }
            }
            0x35 => {
                if let Some(value) = self.load(bus, vaddr, 8)? {
                    self.cop1.write_double(ft, value);
                }
            }
            0x39 => {
                let value = u64::from(self.cop1.read_word(ft));
                self.store(bus, vaddr, 4, value)?;
            }
            _ => {
                let value = self.cop1.read_double(ft);
                self.store(bus, vaddr, 8, value)?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use crate::bus::Bus;
    use crate::cpu::cop0::Cop0;
    use crate::cpu::exceptions::ExceptionCode;
    use crate::cpu::testing::TestBus;
    use crate::cpu::Vr4300;

    const BASE: u64 = 0xFFFF_FFFF_8000_0000;

    fn run(program: &[u32]) -> (Vr4300, TestBus) {
        let bus = TestBus::new(0x2000);
        bus.load_program(0, program);
        let mut cpu = Vr4300::new();
        cpu.set_pc(BASE);
        for _ in 0..program.len() {
            cpu.step(&bus).unwrap();
        }
        (cpu, bus)
    }

    #[test]
    fn add_overflow_leaves_destination() {
        let (cpu, _) = run(&[
            0x3C08_7FFF, // lui t0, 0x7FFF
            0x3508_FFFF, // ori t0, t0, 0xFFFF
            0x240A_0005, // addiu t2, r0, 5
            0x2109_0001, // addi t1, t0, 1 (overflows)
        ]);
        assert_eq!(cpu.gpr[9], 0);
        assert_eq!(cpu.cop0.cause().exc_code, ExceptionCode::Overflow as u8);
        assert_eq!(cpu.pc, BASE + 0x180);
        assert_eq!(cpu.cop0.regs[Cop0::EPC], BASE + 0xC);
    }

    #[test]
    fn addu_sign_extends_low_word() {
        let (cpu, _) = run(&[
            0x3C08_7FFF, // lui t0, 0x7FFF
            0x3508_FFFF, // ori t0, t0, 0xFFFF
            0x2509_0001, // addiu t1, t0, 1
        ]);
        assert_eq!(cpu.gpr[9], 0xFFFF_FFFF_8000_0000);
    }

    #[test]
    fn divide_by_zero_hardware_results() {
        let (cpu, _) = run(&[
            0x2408_FFF9, // addiu t0, r0, -7
            0x0100_001A, // div t0, r0
        ]);
        assert_eq!(cpu.lo, 1);
        assert_eq!(cpu.hi, (-7i64) as u64);

        let (cpu, _) = run(&[
            0x2408_0007, // addiu t0, r0, 7
            0x0100_001B, // divu t0, r0
        ]);
        assert_eq!(cpu.lo, u64::MAX);
        assert_eq!(cpu.hi, 7);

        let (cpu, _) = run(&[
            0x2408_0007, // addiu t0, r0, 7
            0x0100_001E, // ddiv t0, r0
        ]);
        assert_eq!(cpu.lo, u64::MAX);
        assert_eq!(cpu.hi, 7);
    }

    #[test]
    fn mult_and_dmultu() {
        let (cpu, _) = run(&[
            0x2408_FFFE, // addiu t0, r0, -2
            0x2409_0003, // addiu t1, r0, 3
            0x0109_0018, // mult t0, t1
            0x0000_5012, // mflo t2
            0x0000_5810, // mfhi t3
        ]);
        assert_eq!(cpu.gpr[10], (-6i64) as u64);
        assert_eq!(cpu.gpr[11], u64::MAX);

        let (cpu, _) = run(&[
            0x2408_FFFF, // addiu t0, r0, -1
            0x0108_001D, // dmultu t0, t0
        ]);
        assert_eq!(cpu.lo, 1);
        assert_eq!(cpu.hi, 0xFFFF_FFFF_FFFF_FFFE);
    }

    #[test]
    fn shifts_and_doubleword_shifts() {
        let (cpu, _) = run(&[
            0x2408_FFF0, // addiu t0, r0, -16
            0x0008_4902, // srl t1, t0, 4
            0x0008_5103, // sra t2, t0, 4
            0x0008_583C, // dsll32 t3, t0, 0
            0x000B_603E, // dsrl32 t4, t3, 0
        ]);
        assert_eq!(cpu.gpr[9], 0x0000_0000_0FFF_FFFF);
        assert_eq!(cpu.gpr[10], u64::MAX);
        assert_eq!(cpu.gpr[11], 0xFFFF_FFF0_0000_0000);
        assert_eq!(cpu.gpr[12], 0xFFFF_FFF0);
    }

    #[test]
    fn loads_sign_and_zero_extend() {
        let bus = TestBus::new(0x2000);
        bus.load_program(0x100, &[0x8081_FEFF]);
        bus.load_program(
            0,
            &[
                0x3C0C_8000, // lui t4, 0x8000
                0x8188_0100, // lb t0, 0x100(t4)
                0x9189_0100, // lbu t1, 0x100(t4)
                0x858A_0102, // lh t2, 0x102(t4)
                0x958B_0102, // lhu t3, 0x102(t4)
                0x8D8D_0100, // lw t5, 0x100(t4)
                0x9D8E_0100, // lwu t6, 0x100(t4)
            ],
        );
        let mut cpu = Vr4300::new();
        cpu.set_pc(BASE);
        for _ in 0..7 {
            cpu.step(&bus).unwrap();
        }
        assert_eq!(cpu.gpr[8], 0xFFFF_FFFF_FFFF_FF80);
        assert_eq!(cpu.gpr[9], 0x80);
        assert_eq!(cpu.gpr[10], 0xFFFF_FFFF_FFFF_FEFF);
        assert_eq!(cpu.gpr[11], 0xFEFF);
        assert_eq!(cpu.gpr[13], 0xFFFF_FFFF_8081_FEFF);
        assert_eq!(cpu.gpr[14], 0x8081_FEFF);
    }

    #[test]
    fn unaligned_word_pair_loads_and_stores() {
        let bus = TestBus::new(0x2000);
        bus.load_program(0x100, &[0x1122_3344, 0x5566_7788]);
        bus.load_program(
            0,
            &[
                0x3C0C_8000, // lui t4, 0x8000
                0x8988_0101, // lwl t0, 0x101(t4)
                0x9988_0104, // lwr t0, 0x104(t4)
                0xA988_0109, // swl t0, 0x109(t4)
                0xB988_010C, // swr t0, 0x10C(t4)
            ],
        );
        let mut cpu = Vr4300::new();
        cpu.set_pc(BASE);
        for _ in 0..5 {
            cpu.step(&bus).unwrap();
        }
        assert_eq!(cpu.gpr[8], 0x2233_4455);
        assert_eq!(bus.read_u32(0x108).unwrap(), 0x0022_3344);
        assert_eq!(bus.read_u32(0x10C).unwrap(), 0x5500_0000);
    }

    #[test]
    fn swl_to_unmapped_page_is_a_store_miss() {
        let (cpu, bus) = run(&[
            0x2408_1234, // addiu t0, r0, 0x1234
            0xA808_0010, // swl t0, 0x10(r0)
        ]);
        assert_eq!(cpu.cop0.cause().exc_code, ExceptionCode::TlbStore as u8);
        assert_eq!(cpu.cop0.regs[Cop0::BAD_VADDR], 0x10);
        assert_eq!(bus.read_u32(0x10).unwrap(), 0);
    }

    #[test]
    fn ll_sc_pair() {
        let (cpu, bus) = run(&[
            0x3C0C_8000, // lui t4, 0x8000
            0x2409_0009, // addiu t1, r0, 9
            0xC188_0200, // ll t0, 0x200(t4)
            0xE189_0200, // sc t1, 0x200(t4)
            0xE189_0204, // sc t1, 0x204(t4) -- t1 now 1, link still held
            0x4200_0018, // eret clears the link
        ]);
        assert_eq!(bus.read_u32(0x200).unwrap(), 9);
        assert_eq!(bus.read_u32(0x204).unwrap(), 1);
        assert!(!cpu.ll_bit);
    }

    #[test]
    fn likely_branch_not_taken_nullifies_slot() {
        let (cpu, _) = run(&[
            0x2408_0001, // addiu t0, r0, 1
            0x5100_0002, // beql t0, r0, +2 (not taken)
            0x2409_0007, // addiu t1, r0, 7 (nullified)
            0x240A_0003, // addiu t2, r0, 3
        ]);
        assert_eq!(cpu.gpr[9], 0);
        assert_eq!(cpu.gpr[10], 3);
        assert_eq!(cpu.pc, BASE + 0x14);
    }

    #[test]
    fn link_forms_write_return_address() {
        let (cpu, _) = run(&[
            0x0411_0003, // bgezal r0, +3
            0x0000_0000, // nop
        ]);
        assert_eq!(cpu.gpr[31], BASE + 8);
        assert_eq!(cpu.pc, BASE + 0x10);
    }

    #[test]
    fn trap_and_break_raise() {
        let (cpu, _) = run(&[0x0000_0034]); // teq r0, r0
        assert_eq!(cpu.cop0.cause().exc_code, ExceptionCode::Trap as u8);
        let (cpu, _) = run(&[0x0000_000D]); // break
        assert_eq!(cpu.cop0.cause().exc_code, ExceptionCode::Breakpoint as u8);
    }

    #[test]
    fn user_mode_64_bit_op_is_reserved() {
        let bus = TestBus::new(0x100);
        bus.load_program(0, &[0x0000_402D]); // daddu t0, r0, r0
        let mut cpu = Vr4300::new();
        cpu.write_status(0x3400_0010); // user mode, UX clear
        cpu.set_pc(0x0000_0000);
        // kuseg needs a mapping for the fetch
        cpu.tlb.write(
            0,
            crate::cpu::tlb::TlbEntry {
                page_mask: 0,
                entry_hi: 0,
                entry_lo0: 0x7,
                entry_lo1: 0x7,
            },
        );
        cpu.step(&bus).unwrap();
        assert_eq!(
            cpu.cop0.cause().exc_code,
            ExceptionCode::ReservedInstruction as u8
        );
    }

    #[test]
    fn cop1_disabled_raises_cpu1() {
        let bus = TestBus::new(0x100);
        bus.load_program(0, &[0x4480_4000]); // mtc1 r0, f8
        let mut cpu = Vr4300::new();
        cpu.write_status(0x0000_0000);
        cpu.set_pc(BASE);
        cpu.step(&bus).unwrap();
        assert_eq!(
            cpu.cop0.cause().exc_code,
            ExceptionCode::CoprocessorUnusable as u8
        );
        assert_eq!(cpu.cop0.cause().ce, 1);
    }

    #[test]
    fn fpu_round_trip_through_memory() {
        let (cpu, bus) = run(&[
            0x3C0C_8000, // lui t4, 0x8000
            0x3C08_3FC0, // lui t0, 0x3FC0 (1.5f)
            0x4488_0000, // mtc1 t0, f0
            0x4600_0080, // add.s f2, f0, f0
            0xE582_0300, // swc1 f2, 0x300(t4)
            0x4600_103C, // c.lt.s f2, f0
            0x4501_0002, // bc1t +2 (not taken)
            0x0000_0000, // nop
        ]);
        assert_eq!(f32::from_bits(bus.read_u32(0x300).unwrap()), 3.0);
        assert!(!cpu.cop1.condition());
        assert_eq!(cpu.pc, BASE + 0x20);
    }

    #[test]
    fn tlb_write_probe_and_mapped_access() {
        let (cpu, bus) = run(&[
            0x3C08_0040, // lui t0, 0x0040      (VPN2 0x0040_0000)
            0x4088_5000, // mtc0 t0, EntryHi
            0x2409_0007, // addiu t1, r0, 7     (PFN 0, D, V, G)
            0x3529_0040, // ori t1, t1, 0x40    (PFN 1 -> 0x1000)
            0x4089_1000, // mtc0 t1, EntryLo0
            0x4089_1800, // mtc0 t1, EntryLo1
            0x4080_0000, // mtc0 r0, Index
            0x4200_0002, // tlbwi
            0x4200_0008, // tlbp
            0x400A_0000, // mfc0 t2, Index
            0x240B_0055, // addiu t3, r0, 0x55
            0xAD0B_0010, // sw t3, 0x10(t0)
        ]);
        assert_eq!(cpu.gpr[10], 0);
        assert_eq!(bus.read_u32(0x1010).unwrap(), 0x55);
    }
}
