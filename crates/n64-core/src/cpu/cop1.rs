/// COP1: Floating Point Unit.
///
/// 32 x 64-bit FPU registers and two control registers (FCR0, FCR31).
///
/// With Status.FR clear the unit behaves like a 32-bit FPU: sixteen
/// even/odd pairs, where a single-word access to an odd register reaches
/// the high half of its even partner and doubleword accesses always use
/// the even register.
use crate::cpu::instruction::Instruction;

/// FCR31 layout.
pub mod fcsr {
    pub const ROUNDING_MASK: u32 = 0x3;
    pub const FLAG_SHIFT: u32 = 2;
    pub const ENABLE_SHIFT: u32 = 7;
    pub const CAUSE_SHIFT: u32 = 12;
    pub const CAUSE_MASK: u32 = 0x3F << CAUSE_SHIFT;
    pub const CONDITION: u32 = 1 << 23;
    pub const FLUSH: u32 = 1 << 24;
    pub const WRITABLE: u32 = 0x0183_FFFF;

    // Exception bits, in flag/enable/cause order
    pub const INEXACT: u8 = 1 << 0;
    pub const UNDERFLOW: u8 = 1 << 1;
    pub const OVERFLOW: u8 = 1 << 2;
    pub const DIV_ZERO: u8 = 1 << 3;
    pub const INVALID: u8 = 1 << 4;
    /// Unimplemented operation: cause only, always traps.
    pub const UNIMPLEMENTED: u8 = 1 << 5;
}

use fcsr::{DIV_ZERO, INEXACT, INVALID, OVERFLOW, UNDERFLOW, UNIMPLEMENTED};

/// Operand formats selected by the `fmt` field.
const FMT_S: u32 = 16;
const FMT_D: u32 = 17;
const FMT_W: u32 = 20;
const FMT_L: u32 = 21;

/// An FPU operation trapped: the CPU must take a floating-point exception.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FpuTrap;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoundingMode {
    Nearest,
    Zero,
    Up,
    Down,
}

impl RoundingMode {
    fn apply(self, x: f64) -> f64 {
        match self {
            Self::Nearest => x.round_ties_even(),
            Self::Zero => x.trunc(),
            Self::Up => x.ceil(),
            Self::Down => x.floor(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Arith {
    Add,
    Sub,
    Mul,
    Div,
    Sqrt,
}

/// Move a round-to-nearest result to where the directed mode puts it.
///
/// `below` tells whether the exact value lies above `r`. Only called for
/// inexact results; an infinite `r` is an overflow from finite operands.
macro_rules! directed_fn {
    ($name:ident, $ty:ty) => {
        fn $name(r: $ty, below: bool, mode: RoundingMode) -> $ty {
            if r.is_infinite() {
                let clamp = match mode {
                    RoundingMode::Nearest => false,
                    RoundingMode::Zero => true,
                    RoundingMode::Up => r < 0.0,
                    RoundingMode::Down => r > 0.0,
                };
                return if clamp { <$ty>::MAX.copysign(r) } else { r };
            }
            let up = match mode {
                RoundingMode::Nearest => return r,
                RoundingMode::Zero => {
                    // Step toward zero only when nearest rounded away from it.
                    if r > 0.0 && !below {
                        false
                    } else if r < 0.0 && below {
                        true
                    } else {
                        return r;
                    }
                }
                RoundingMode::Up if below => true,
                RoundingMode::Down if !below => false,
                _ => return r,
            };
            if r == 0.0 {
                let tiny = <$ty>::from_bits(1);
                return if up { tiny } else { -tiny };
            }
            let bits = r.to_bits();
            <$ty>::from_bits(if (r > 0.0) == up { bits + 1 } else { bits - 1 })
        }
    };
}

directed_fn!(directed_s, f32);
directed_fn!(directed_d, f64);

/// Arithmetic with exact IEEE exception detection. The inexact test uses
/// the error-free transforms (two-sum and fused multiply-add residuals),
/// and the residual's sign steers directed rounding.
macro_rules! arith_fn {
    ($name:ident, $ty:ty, $directed:ident) => {
        fn $name(op: Arith, a: $ty, b: $ty, mode: RoundingMode) -> ($ty, u8) {
            let mut r = match op {
                Arith::Add => a + b,
                Arith::Sub => a - b,
                Arith::Mul => a * b,
                Arith::Div => a / b,
                Arith::Sqrt => a.sqrt(),
            };
            let b_used = op != Arith::Sqrt;
            let cause = if a.is_nan() || (b_used && b.is_nan()) || r.is_nan() {
                INVALID
            } else if op == Arith::Div && b == 0.0 && a.is_finite() {
                DIV_ZERO
            } else if !a.is_finite() || (b_used && !b.is_finite()) {
                // Infinite operands give exact results.
                0
            } else if r.is_infinite() {
                r = $directed(r, false, mode);
                OVERFLOW | INEXACT
            } else {
                let residual = match op {
                    Arith::Add | Arith::Sub => {
                        let b = if op == Arith::Sub { -b } else { b };
                        let bb = r - a;
                        (a - (r - bb)) + (b - bb)
                    }
                    Arith::Mul => a.mul_add(b, -r),
                    Arith::Div => r.mul_add(b, -a),
                    Arith::Sqrt => r.mul_add(r, -a),
                };
                if residual != 0.0 {
                    let below = match op {
                        Arith::Add | Arith::Sub | Arith::Mul => residual > 0.0,
                        Arith::Div => (residual > 0.0) != (b > 0.0),
                        Arith::Sqrt => residual < 0.0,
                    };
                    r = $directed(r, below, mode);
                }
                let tiny = r != 0.0 && r.abs() < <$ty>::MIN_POSITIVE;
                match (residual != 0.0, tiny) {
                    (true, true) => UNDERFLOW | INEXACT,
                    (true, false) => INEXACT,
                    (false, _) => 0,
                }
            };
            (r, cause)
        }
    };
}

arith_fn!(arith_s, f32, directed_s);
arith_fn!(arith_d, f64, directed_d);

/// Float to integer conversion target.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum IntFormat {
    Word,
    Long,
}

pub struct Cop1 {
    /// 32 floating-point registers (64-bit each)
    pub fpr: [u64; 32],
    /// FCR0: FPU Implementation/Revision register (read-only)
    pub fcr0: u32,
    /// FCR31: FPU Control/Status register (rounding mode, condition flag, exceptions)
    pub fcr31: u32,
    /// Mirror of Status.FR
    fr: bool,
}

impl Default for Cop1 {
    fn default() -> Self {
        Self::new()
    }
}

impl Cop1 {
    pub fn new() -> Self {
        Self {
            fpr: [0u64; 32],
            fcr0: 0x0000_0A00, // VR4300 FPU revision
            fcr31: 0,
            fr: false,
        }
    }

    pub fn set_fr(&mut self, fr: bool) {
        self.fr = fr;
    }

    pub fn condition(&self) -> bool {
        self.fcr31 & fcsr::CONDITION != 0
    }

    pub fn rounding_mode(&self) -> RoundingMode {
        match self.fcr31 & fcsr::ROUNDING_MASK {
            0 => RoundingMode::Nearest,
            1 => RoundingMode::Zero,
            2 => RoundingMode::Up,
            _ => RoundingMode::Down,
        }
    }

    /// 32-bit view of register `index`.
    pub fn read_word(&self, index: usize) -> u32 {
        if self.fr || index & 1 == 0 {
            self.fpr[index] as u32
        } else {
            (self.fpr[index & !1] >> 32) as u32
        }
    }

    pub fn write_word(&mut self, index: usize, value: u32) {
        if self.fr || index & 1 == 0 {
            self.fpr[index] = (self.fpr[index] & !0xFFFF_FFFF) | value as u64;
        } else {
            let even = index & !1;
            self.fpr[even] = (self.fpr[even] & 0xFFFF_FFFF) | ((value as u64) << 32);
        }
    }

    /// 64-bit view of register `index`.
    pub fn read_double(&self, index: usize) -> u64 {
        if self.fr {
            self.fpr[index]
        } else {
            self.fpr[index & !1]
        }
    }

    pub fn write_double(&mut self, index: usize, value: u64) {
        if self.fr {
            self.fpr[index] = value;
        } else {
            self.fpr[index & !1] = value;
        }
    }

    fn read_s(&self, index: usize) -> f32 {
        f32::from_bits(self.read_word(index))
    }

    fn read_d(&self, index: usize) -> f64 {
        f64::from_bits(self.read_double(index))
    }

    /// CFC1
    pub fn read_control(&self, index: usize) -> u32 {
        match index {
            0 => self.fcr0,
            31 => self.fcr31,
            _ => 0,
        }
    }

    /// CTC1. Writing a cause bit whose enable is set traps immediately.
    pub fn write_control(&mut self, index: usize, value: u32) -> Result<(), FpuTrap> {
        if index != 31 {
            log::trace!("CTC1 to FCR{} ignored", index);
            return Ok(());
        }
        self.fcr31 = value & fcsr::WRITABLE;
        let cause = ((self.fcr31 >> fcsr::CAUSE_SHIFT) & 0x3F) as u8;
        let enables = ((self.fcr31 >> fcsr::ENABLE_SHIFT) & 0x1F) as u8;
        if cause & (enables | UNIMPLEMENTED) != 0 {
            return Err(FpuTrap);
        }
        Ok(())
    }

    /// Publish the cause bits of one operation. Returns `Err` when the
    /// operation traps, in which case the destination must not be written
    /// and the sticky flags stay untouched.
    fn commit(&mut self, cause: u8) -> Result<(), FpuTrap> {
        self.fcr31 =
            (self.fcr31 & !fcsr::CAUSE_MASK) | (u32::from(cause) << fcsr::CAUSE_SHIFT);
        let enables = ((self.fcr31 >> fcsr::ENABLE_SHIFT) & 0x1F) as u8;
        if cause & (enables | UNIMPLEMENTED) != 0 {
            log::trace!("FPU trap, cause {:#04X}", cause);
            return Err(FpuTrap);
        }
        self.fcr31 |= u32::from(cause & 0x1F) << fcsr::FLAG_SHIFT;
        Ok(())
    }

    fn unimplemented(&mut self) -> Result<(), FpuTrap> {
        self.commit(UNIMPLEMENTED)
    }

    /// Execute a COP1 computational instruction (fmt = S, D, W or L).
    pub fn execute(&mut self, instr: Instruction) -> Result<(), FpuTrap> {
        let fmt = instr.fmt();
        let funct = instr.funct();
        match (fmt, funct) {
            (FMT_S | FMT_D, 0x00..=0x04) => {
                let op = match funct {
                    0x00 => Arith::Add,
                    0x01 => Arith::Sub,
                    0x02 => Arith::Mul,
                    0x03 => Arith::Div,
                    _ => Arith::Sqrt,
                };
                let mode = self.rounding_mode();
                if fmt == FMT_S {
                    let (r, cause) =
                        arith_s(op, self.read_s(instr.fs()), self.read_s(instr.ft()), mode);
                    self.commit(cause)?;
                    self.write_word(instr.fd(), r.to_bits());
                } else {
                    let (r, cause) =
                        arith_d(op, self.read_d(instr.fs()), self.read_d(instr.ft()), mode);
                    self.commit(cause)?;
                    self.write_double(instr.fd(), r.to_bits());
                }
                Ok(())
            }
            (FMT_S | FMT_D, 0x05..=0x07) => self.sign_op(instr),
            (FMT_S | FMT_D, 0x08..=0x0F) => {
                let mode = match funct & 0x3 {
                    0 => RoundingMode::Nearest,
                    1 => RoundingMode::Zero,
                    2 => RoundingMode::Up,
                    _ => RoundingMode::Down,
                };
                let target = if funct < 0x0C {
                    IntFormat::Long
                } else {
                    IntFormat::Word
                };
                self.to_integer(instr, mode, target)
            }
            (FMT_S | FMT_D, 0x24) => self.to_integer(instr, self.rounding_mode(), IntFormat::Word),
            (FMT_S | FMT_D, 0x25) => self.to_integer(instr, self.rounding_mode(), IntFormat::Long),
            (FMT_D | FMT_W | FMT_L, 0x20) => self.to_single(instr),
            (FMT_S | FMT_W | FMT_L, 0x21) => self.to_double(instr),
            (FMT_S | FMT_D, 0x30..=0x3F) => self.compare(instr),
            _ => {
                log::trace!("COP1 unimplemented fmt {} funct {:#04X}", fmt, funct);
                self.unimplemented()
            }
        }
    }

    /// ABS / MOV / NEG
    fn sign_op(&mut self, instr: Instruction) -> Result<(), FpuTrap> {
        let funct = instr.funct();
        if instr.fmt() == FMT_S {
            let x = self.read_s(instr.fs());
            let r = match funct {
                0x05 => x.abs(),
                0x06 => x,
                _ => -x,
            };
            let cause = if funct != 0x06 && x.is_nan() { INVALID } else { 0 };
            self.commit(cause)?;
            self.write_word(instr.fd(), r.to_bits());
        } else {
            let x = self.read_d(instr.fs());
            let r = match funct {
                0x05 => x.abs(),
                0x06 => x,
                _ => -x,
            };
            let cause = if funct != 0x06 && x.is_nan() { INVALID } else { 0 };
            self.commit(cause)?;
            self.write_double(instr.fd(), r.to_bits());
        }
        Ok(())
    }

    fn source_as_f64(&self, instr: Instruction) -> f64 {
        if instr.fmt() == FMT_S {
            f64::from(self.read_s(instr.fs()))
        } else {
            self.read_d(instr.fs())
        }
    }

    /// ROUND/TRUNC/CEIL/FLOOR and CVT.W/CVT.L. Out-of-range and
    /// non-finite sources are unimplemented operations.
    fn to_integer(
        &mut self,
        instr: Instruction,
        mode: RoundingMode,
        target: IntFormat,
    ) -> Result<(), FpuTrap> {
        let x = self.source_as_f64(instr);
        let r = mode.apply(x);
        let in_range = match target {
            IntFormat::Word => (-2_147_483_648.0..=2_147_483_647.0).contains(&r),
            IntFormat::Long => (-9.223_372_036_854_775_808e18..9.223_372_036_854_775_808e18)
                .contains(&r),
        };
        if !x.is_finite() || !in_range {
            return self.unimplemented();
        }
        self.commit(if r != x { INEXACT } else { 0 })?;
        match target {
            IntFormat::Word => self.write_word(instr.fd(), r as i32 as u32),
            IntFormat::Long => self.write_double(instr.fd(), r as i64 as u64),
        }
        Ok(())
    }

    fn to_single(&mut self, instr: Instruction) -> Result<(), FpuTrap> {
        let mode = self.rounding_mode();
        let (r, cause) = match instr.fmt() {
            FMT_D => {
                let x = self.read_d(instr.fs());
                let r = x as f32;
                if x.is_nan() {
                    (r, INVALID)
                } else if r.is_infinite() && x.is_finite() {
                    (directed_s(r, false, mode), OVERFLOW | INEXACT)
                } else if f64::from(r) != x {
                    (directed_s(r, f64::from(r) < x, mode), INEXACT)
                } else {
                    (r, 0)
                }
            }
            FMT_W => {
                let x = i64::from(self.read_word(instr.fs()) as i32);
                let r = x as f32;
                if r as i64 != x {
                    (directed_s(r, (r as i64) < x, mode), INEXACT)
                } else {
                    (r, 0)
                }
            }
            _ => {
                let x = i128::from(self.read_double(instr.fs()) as i64);
                let r = x as f32;
                if r as i128 != x {
                    (directed_s(r, (r as i128) < x, mode), INEXACT)
                } else {
                    (r, 0)
                }
            }
        };
        self.commit(cause)?;
        self.write_word(instr.fd(), r.to_bits());
        Ok(())
    }

    fn to_double(&mut self, instr: Instruction) -> Result<(), FpuTrap> {
        let (r, cause) = match instr.fmt() {
            FMT_S => {
                let x = self.read_s(instr.fs());
                (f64::from(x), if x.is_nan() { INVALID } else { 0 })
            }
            FMT_W => (f64::from(self.read_word(instr.fs()) as i32), 0),
            _ => {
                let x = i128::from(self.read_double(instr.fs()) as i64);
                let r = x as f64;
                if r as i128 != x {
                    (directed_d(r, (r as i128) < x, self.rounding_mode()), INEXACT)
                } else {
                    (r, 0)
                }
            }
        };
        self.commit(cause)?;
        self.write_double(instr.fd(), r.to_bits());
        Ok(())
    }

    /// C.cond.fmt: the low four funct bits select the predicate:
    /// bit 0 unordered, bit 1 equal, bit 2 less, bit 3 signal on NaN.
    fn compare(&mut self, instr: Instruction) -> Result<(), FpuTrap> {
        let cond = instr.funct() & 0xF;
        let (a, b) = if instr.fmt() == FMT_S {
            (
                f64::from(self.read_s(instr.fs())),
                f64::from(self.read_s(instr.ft())),
            )
        } else {
            (self.read_d(instr.fs()), self.read_d(instr.ft()))
        };
        let unordered = a.is_nan() || b.is_nan();
        let result = (unordered && cond & 0x1 != 0)
            || (!unordered && a == b && cond & 0x2 != 0)
            || (!unordered && a < b && cond & 0x4 != 0);
        let cause = if unordered && cond & 0x8 != 0 { INVALID } else { 0 };
        self.commit(cause)?;
        if result {
            self.fcr31 |= fcsr::CONDITION;
        } else {
            self.fcr31 &= !fcsr::CONDITION;
        }
        Ok(())
    }
}
