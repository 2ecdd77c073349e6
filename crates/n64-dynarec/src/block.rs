//! Compiled blocks and the guest interface they run against.

use crate::op::Op;

/// Architectural faults a native op can raise.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trap {
    /// Signed overflow in a trapping add/sub.
    Overflow,
    /// 64-bit operation outside 64-bit mode.
    ReservedInstruction,
}

/// The only channel from a compiled block to the machine.
///
/// Every op is bracketed by `begin` and `retire`, exactly like an
/// interpreter step, so timing and exception entry stay identical.
pub trait GuestContext {
    type Error;

    fn gpr(&self, reg: u8) -> u64;
    fn set_gpr(&mut self, reg: u8, value: u64);
    fn hi(&self) -> u64;
    fn lo(&self) -> u64;
    fn set_hi(&mut self, value: u64);
    fn set_lo(&mut self, value: u64);

    /// 64-bit operations are currently legal.
    fn operation_64(&self) -> bool;

    fn raise(&mut self, trap: Trap);

    /// `Ok(None)` means an address or TLB exception was raised instead.
    fn load(&mut self, vaddr: u64, size: u8, signed: bool) -> Result<Option<u64>, Self::Error>;
    fn store(&mut self, vaddr: u64, size: u8, value: u64) -> Result<Option<()>, Self::Error>;

    fn begin(&mut self, pc: u64, raw: u32);
    fn branch(&mut self, target: u64, taken: bool);
    /// `Ok(false)` when an exception or interrupt redirected the PC.
    fn retire(&mut self) -> Result<bool, Self::Error>;
    fn interpret(&mut self, raw: u32, pc: u64) -> Result<(), Self::Error>;
    fn pc(&self) -> u64;
}

/// How a block run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockExit {
    /// Fell off the end with no pending jump.
    Completed { retired: u32 },
    /// Ended after the delay slot of its terminating branch.
    Jumped { retired: u32 },
    /// The PC left the static path early (exception, interrupt, nullified
    /// slot, ERET).
    Redirected { retired: u32 },
}

impl BlockExit {
    pub fn retired(self) -> u32 {
        match self {
            BlockExit::Completed { retired }
            | BlockExit::Jumped { retired }
            | BlockExit::Redirected { retired } => retired,
        }
    }
}

/// Metadata and ops for one compiled block.
#[derive(Debug, Clone)]
pub struct CompiledBlock {
    /// Inclusive block start address in guest physical space.
    pub start_phys: u32,
    /// Exclusive block end address in guest physical space.
    pub end_phys: u32,
    /// Virtual address the block was compiled for.
    pub start_vaddr: u64,
    /// Number of guest instructions included in this block.
    pub instruction_count: u32,
    /// True if the block ended on a control-transfer boundary.
    pub has_control_flow: bool,
    /// Static target of the terminating direct branch or jump.
    pub jump_target: Option<u64>,
    /// Raw guest words the block was built from.
    pub shadow: Vec<u32>,
    pub ops: Vec<Op>,
}

#[inline]
fn sext32(v: u32) -> u64 {
    v as i32 as i64 as u64
}

#[inline]
fn relative(pc: u64, offset: i16) -> u64 {
    pc.wrapping_add(4).wrapping_add(((offset as i64) << 2) as u64)
}

impl CompiledBlock {
    /// Run the block against `ctx`, starting at the context's current PC.
    pub fn execute<C: GuestContext>(&self, ctx: &mut C) -> Result<BlockExit, C::Error> {
        let mut pc = ctx.pc();
        for (i, (&op, &raw)) in self.ops.iter().zip(&self.shadow).enumerate() {
            ctx.begin(pc, raw);
            run_op(ctx, op, pc)?;
            let retired = i as u32 + 1;
            if !ctx.retire()? {
                return Ok(BlockExit::Redirected { retired });
            }
            if retired == self.instruction_count {
                break;
            }
            let expected = pc.wrapping_add(4);
            if ctx.pc() != expected {
                return Ok(BlockExit::Redirected { retired });
            }
            pc = expected;
        }
        Ok(if self.has_control_flow {
            BlockExit::Jumped {
                retired: self.instruction_count,
            }
        } else {
            BlockExit::Completed {
                retired: self.instruction_count,
            }
        })
    }
}

fn run_op<C: GuestContext>(ctx: &mut C, op: Op, pc: u64) -> Result<(), C::Error> {
    match op {
        Op::Addi { rs, rt, imm } => {
            match (ctx.gpr(rs) as i32).checked_add(i32::from(imm)) {
                Some(v) => ctx.set_gpr(rt, sext32(v as u32)),
                None => ctx.raise(Trap::Overflow),
            }
        }
        Op::Addiu { rs, rt, imm } => {
            ctx.set_gpr(rt, sext32((ctx.gpr(rs) as u32).wrapping_add(imm as i32 as u32)))
        }
        Op::Daddi { rs, rt, imm } => {
            if !ctx.operation_64() {
                ctx.raise(Trap::ReservedInstruction);
            } else {
                match (ctx.gpr(rs) as i64).checked_add(i64::from(imm)) {
                    Some(v) => ctx.set_gpr(rt, v as u64),
                    None => ctx.raise(Trap::Overflow),
                }
            }
        }
        Op::Daddiu { rs, rt, imm } => {
            if !ctx.operation_64() {
                ctx.raise(Trap::ReservedInstruction);
            } else {
                ctx.set_gpr(rt, ctx.gpr(rs).wrapping_add(imm as i64 as u64));
            }
        }
        Op::Slti { rs, rt, imm } => {
            ctx.set_gpr(rt, ((ctx.gpr(rs) as i64) < i64::from(imm)) as u64)
        }
        Op::Sltiu { rs, rt, imm } => ctx.set_gpr(rt, (ctx.gpr(rs) < imm as i64 as u64) as u64),
        Op::Andi { rs, rt, imm } => ctx.set_gpr(rt, ctx.gpr(rs) & u64::from(imm)),
        Op::Ori { rs, rt, imm } => ctx.set_gpr(rt, ctx.gpr(rs) | u64::from(imm)),
        Op::Xori { rs, rt, imm } => ctx.set_gpr(rt, ctx.gpr(rs) ^ u64::from(imm)),
        Op::Lui { rt, imm } => ctx.set_gpr(rt, ((imm as i64) << 16) as u64),

        Op::Add { rs, rt, rd } => match (ctx.gpr(rs) as i32).checked_add(ctx.gpr(rt) as i32) {
            Some(v) => ctx.set_gpr(rd, sext32(v as u32)),
            None => ctx.raise(Trap::Overflow),
        },
        Op::Addu { rs, rt, rd } => {
            ctx.set_gpr(rd, sext32((ctx.gpr(rs) as u32).wrapping_add(ctx.gpr(rt) as u32)))
        }
        Op::Sub { rs, rt, rd } => match (ctx.gpr(rs) as i32).checked_sub(ctx.gpr(rt) as i32) {
            Some(v) => ctx.set_gpr(rd, sext32(v as u32)),
            None => ctx.raise(Trap::Overflow),
        },
        Op::Subu { rs, rt, rd } => {
            ctx.set_gpr(rd, sext32((ctx.gpr(rs) as u32).wrapping_sub(ctx.gpr(rt) as u32)))
        }
        Op::Dadd { rs, rt, rd } => wide(ctx, |ctx| {
            match (ctx.gpr(rs) as i64).checked_add(ctx.gpr(rt) as i64) {
                Some(v) => ctx.set_gpr(rd, v as u64),
                None => ctx.raise(Trap::Overflow),
            }
        }),
        Op::Daddu { rs, rt, rd } => wide(ctx, |ctx| {
            ctx.set_gpr(rd, ctx.gpr(rs).wrapping_add(ctx.gpr(rt)))
        }),
        Op::Dsub { rs, rt, rd } => wide(ctx, |ctx| {
            match (ctx.gpr(rs) as i64).checked_sub(ctx.gpr(rt) as i64) {
                Some(v) => ctx.set_gpr(rd, v as u64),
                None => ctx.raise(Trap::Overflow),
            }
        }),
        Op::Dsubu { rs, rt, rd } => wide(ctx, |ctx| {
            ctx.set_gpr(rd, ctx.gpr(rs).wrapping_sub(ctx.gpr(rt)))
        }),
        Op::And { rs, rt, rd } => ctx.set_gpr(rd, ctx.gpr(rs) & ctx.gpr(rt)),
        Op::Or { rs, rt, rd } => ctx.set_gpr(rd, ctx.gpr(rs) | ctx.gpr(rt)),
        Op::Xor { rs, rt, rd } => ctx.set_gpr(rd, ctx.gpr(rs) ^ ctx.gpr(rt)),
        Op::Nor { rs, rt, rd } => ctx.set_gpr(rd, !(ctx.gpr(rs) | ctx.gpr(rt))),
        Op::Slt { rs, rt, rd } => {
            ctx.set_gpr(rd, ((ctx.gpr(rs) as i64) < (ctx.gpr(rt) as i64)) as u64)
        }
        Op::Sltu { rs, rt, rd } => ctx.set_gpr(rd, (ctx.gpr(rs) < ctx.gpr(rt)) as u64),

        Op::Sll { rt, rd, sa } => ctx.set_gpr(rd, sext32((ctx.gpr(rt) as u32) << sa)),
        Op::Srl { rt, rd, sa } => ctx.set_gpr(rd, sext32((ctx.gpr(rt) as u32) >> sa)),
        Op::Sra { rt, rd, sa } => ctx.set_gpr(rd, sext32(((ctx.gpr(rt) as i64) >> sa) as u32)),
        Op::Sllv { rs, rt, rd } => {
            let sa = ctx.gpr(rs) & 0x1F;
            ctx.set_gpr(rd, sext32((ctx.gpr(rt) as u32) << sa))
        }
        Op::Srlv { rs, rt, rd } => {
            let sa = ctx.gpr(rs) & 0x1F;
            ctx.set_gpr(rd, sext32((ctx.gpr(rt) as u32) >> sa))
        }
        Op::Srav { rs, rt, rd } => {
            let sa = ctx.gpr(rs) & 0x1F;
            ctx.set_gpr(rd, sext32(((ctx.gpr(rt) as i64) >> sa) as u32))
        }
        Op::Dsll { rt, rd, sa } => wide(ctx, |ctx| ctx.set_gpr(rd, ctx.gpr(rt) << sa)),
        Op::Dsrl { rt, rd, sa } => wide(ctx, |ctx| ctx.set_gpr(rd, ctx.gpr(rt) >> sa)),
        Op::Dsra { rt, rd, sa } => {
            wide(ctx, |ctx| ctx.set_gpr(rd, ((ctx.gpr(rt) as i64) >> sa) as u64))
        }
        Op::Dsllv { rs, rt, rd } => wide(ctx, |ctx| {
            let sa = ctx.gpr(rs) & 0x3F;
            ctx.set_gpr(rd, ctx.gpr(rt) << sa)
        }),
        Op::Dsrlv { rs, rt, rd } => wide(ctx, |ctx| {
            let sa = ctx.gpr(rs) & 0x3F;
            ctx.set_gpr(rd, ctx.gpr(rt) >> sa)
        }),
        Op::Dsrav { rs, rt, rd } => wide(ctx, |ctx| {
            let sa = ctx.gpr(rs) & 0x3F;
            ctx.set_gpr(rd, ((ctx.gpr(rt) as i64) >> sa) as u64)
        }),

        Op::Mfhi { rd } => ctx.set_gpr(rd, ctx.hi()),
        Op::Mflo { rd } => ctx.set_gpr(rd, ctx.lo()),
        Op::Mthi { rs } => ctx.set_hi(ctx.gpr(rs)),
        Op::Mtlo { rs } => ctx.set_lo(ctx.gpr(rs)),
        Op::Mult { rs, rt } => {
            let product = (ctx.gpr(rs) as i32 as i64).wrapping_mul(ctx.gpr(rt) as i32 as i64);
            ctx.set_lo(sext32(product as u32));
            ctx.set_hi(sext32((product >> 32) as u32));
        }
        Op::Multu { rs, rt } => {
            let product = (ctx.gpr(rs) as u32 as u64) * (ctx.gpr(rt) as u32 as u64);
            ctx.set_lo(sext32(product as u32));
            ctx.set_hi(sext32((product >> 32) as u32));
        }
        Op::Div { rs, rt } => {
            let (dividend, divisor) = (ctx.gpr(rs) as i32, ctx.gpr(rt) as i32);
            if divisor == 0 {
                ctx.set_lo(if dividend >= 0 { u64::MAX } else { 1 });
                ctx.set_hi(sext32(dividend as u32));
            } else {
                ctx.set_lo(sext32(dividend.wrapping_div(divisor) as u32));
                ctx.set_hi(sext32(dividend.wrapping_rem(divisor) as u32));
            }
        }
        Op::Divu { rs, rt } => {
            let (dividend, divisor) = (ctx.gpr(rs) as u32, ctx.gpr(rt) as u32);
            if divisor == 0 {
                ctx.set_lo(u64::MAX);
                ctx.set_hi(sext32(dividend));
            } else {
                ctx.set_lo(sext32(dividend / divisor));
                ctx.set_hi(sext32(dividend % divisor));
            }
        }

        Op::Load {
            rs,
            rt,
            offset,
            size,
            signed,
        } => {
            // LD and LWU are 64-bit operations
            if (size == 8 || (size == 4 && !signed)) && !ctx.operation_64() {
                ctx.raise(Trap::ReservedInstruction);
                return Ok(());
            }
            let vaddr = ctx.gpr(rs).wrapping_add(offset as i64 as u64);
            if let Some(value) = ctx.load(vaddr, size, signed)? {
                ctx.set_gpr(rt, value);
            }
        }
        Op::Store {
            rs,
            rt,
            offset,
            size,
        } => {
            if size == 8 && !ctx.operation_64() {
                ctx.raise(Trap::ReservedInstruction);
                return Ok(());
            }
            let vaddr = ctx.gpr(rs).wrapping_add(offset as i64 as u64);
            ctx.store(vaddr, size, ctx.gpr(rt))?;
        }

        Op::Beq { rs, rt, offset } => {
            let taken = ctx.gpr(rs) == ctx.gpr(rt);
            ctx.branch(relative(pc, offset), taken)
        }
        Op::Bne { rs, rt, offset } => {
            let taken = ctx.gpr(rs) != ctx.gpr(rt);
            ctx.branch(relative(pc, offset), taken)
        }
        Op::Blez { rs, offset } => {
            let taken = ctx.gpr(rs) as i64 <= 0;
            ctx.branch(relative(pc, offset), taken)
        }
        Op::Bgtz { rs, offset } => {
            let taken = ctx.gpr(rs) as i64 > 0;
            ctx.branch(relative(pc, offset), taken)
        }
        Op::Bltz { rs, offset } => {
            let taken = (ctx.gpr(rs) as i64) < 0;
            ctx.branch(relative(pc, offset), taken)
        }
        Op::Bgez { rs, offset } => {
            let taken = ctx.gpr(rs) as i64 >= 0;
            ctx.branch(relative(pc, offset), taken)
        }
        Op::J { .. } | Op::Jal { .. } => {
            if let Op::Jal { .. } = op {
                ctx.set_gpr(31, pc.wrapping_add(8));
            }
            if let Some(target) = op.static_target(pc) {
                ctx.branch(target, true);
            }
        }
        Op::Jr { rs } => {
            let target = ctx.gpr(rs);
            ctx.branch(target, true)
        }
        Op::Jalr { rs, rd } => {
            let target = ctx.gpr(rs);
            ctx.set_gpr(rd, pc.wrapping_add(8));
            ctx.branch(target, true)
        }

        Op::Interpret { raw, .. } => ctx.interpret(raw, pc)?,
    }
    Ok(())
}

/// Run a 64-bit op, or raise RI when 64-bit operations are off.
fn wide<C: GuestContext>(ctx: &mut C, f: impl FnOnce(&mut C)) {
    if ctx.operation_64() {
        f(ctx);
    } else {
        ctx.raise(Trap::ReservedInstruction);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{TestContext, TestSource};
    use crate::{BlockCompiler, CompileRequest, ThreadedCompiler};

    const BASE: u64 = 0xFFFF_FFFF_8000_0000;

    fn compile(words: &[u32]) -> CompiledBlock {
        let pairs: Vec<(u32, u32)> = words
            .iter()
            .enumerate()
            .map(|(i, w)| (0x200 + 4 * i as u32, *w))
            .collect();
        let mut src = TestSource::with_words(&pairs);
        ThreadedCompiler::default()
            .compile(
                &CompileRequest {
                    start_phys: 0x200,
                    start_vaddr: BASE + 0x200,
                    max_instructions: 32,
                },
                &mut src,
            )
            .unwrap()
    }

    #[test]
    fn taken_branch_runs_slot_then_jumps() {
        let block = compile(&[
            0x2408_0003, // addiu t0, r0, 3
            0x1500_0004, // bne t0, r0, +4
            0x2409_0007, // addiu t1, r0, 7 (slot)
        ]);
        let mut ctx = TestContext::at(BASE + 0x200);
        let exit = block.execute(&mut ctx).unwrap();
        assert_eq!(exit, BlockExit::Jumped { retired: 3 });
        assert_eq!(ctx.gpr[9], 7);
        assert_eq!(ctx.pc, BASE + 0x208 + 16);
    }

    #[test]
    fn overflow_redirects_and_keeps_destination() {
        let block = compile(&[
            0x3C08_7FFF, // lui t0, 0x7FFF
            0x3508_FFFF, // ori t0, t0, 0xFFFF
            0x2109_0001, // addi t1, t0, 1
            0x240A_0001, // addiu t2, r0, 1
        ]);
        let mut ctx = TestContext::at(BASE + 0x200);
        ctx.gpr[9] = 0x55;
        let exit = block.execute(&mut ctx).unwrap();
        assert_eq!(exit, BlockExit::Redirected { retired: 3 });
        assert_eq!(ctx.traps, vec![Trap::Overflow]);
        assert_eq!(ctx.gpr[9], 0x55);
        assert_eq!(ctx.gpr[10], 0);
    }

    #[test]
    fn interrupt_stops_block_between_ops() {
        let block = compile(&[0x2408_0001, 0x2409_0002, 0x240A_0003]);
        let mut ctx = TestContext::at(BASE + 0x200);
        ctx.interrupt_at = Some(2);
        let exit = block.execute(&mut ctx).unwrap();
        assert_eq!(exit, BlockExit::Redirected { retired: 2 });
        assert_eq!(ctx.gpr[10], 0);
        assert_eq!(ctx.pc, BASE + 0x180);
    }

    #[test]
    fn loads_extend_and_stores_truncate() {
        let block = compile(&[
            0x2408_FF80, // addiu t0, r0, -128
            0xA008_0010, // sb t0, 0x10(r0)
            0x8009_0010, // lb t1, 0x10(r0)
            0x900A_0010, // lbu t2, 0x10(r0)
        ]);
        let mut ctx = TestContext::at(BASE + 0x200);
        block.execute(&mut ctx).unwrap();
        assert_eq!(ctx.mem[0x10], 0x80);
        assert_eq!(ctx.gpr[9], 0xFFFF_FFFF_FFFF_FF80);
        assert_eq!(ctx.gpr[10], 0x80);
    }

    #[test]
    fn wide_ops_need_64_bit_mode() {
        let block = compile(&[0x0108_482D]); // daddu t1, t0, t0
        let mut ctx = TestContext::at(BASE + 0x200);
        ctx.wide = false;
        ctx.gpr[8] = 1;
        let exit = block.execute(&mut ctx).unwrap();
        assert_eq!(exit, BlockExit::Redirected { retired: 1 });
        assert_eq!(ctx.traps, vec![Trap::ReservedInstruction]);
        assert_eq!(ctx.gpr[9], 0);
    }

    #[test]
    fn interpreted_ops_go_through_the_context() {
        let block = compile(&[0x8908_0001, 0x2409_0001]); // lwl t0, 1(t0); addiu
        let mut ctx = TestContext::at(BASE + 0x200);
        let exit = block.execute(&mut ctx).unwrap();
        assert_eq!(exit, BlockExit::Completed { retired: 2 });
        assert_eq!(ctx.interpreted, vec![0x8908_0001]);
        assert_eq!(ctx.gpr[9], 1);
    }

    #[test]
    fn div_by_zero_matches_hardware() {
        let block = compile(&[
            0x2408_FFF9, // addiu t0, r0, -7
            0x0100_001A, // div t0, r0
        ]);
        let mut ctx = TestContext::at(BASE + 0x200);
        block.execute(&mut ctx).unwrap();
        assert_eq!(ctx.lo, 1);
        assert_eq!(ctx.hi, 0xFFFF_FFFF_FFFF_FFF9);
    }
}
