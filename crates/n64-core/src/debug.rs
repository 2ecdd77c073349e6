/// Debug infrastructure for the N64 emulator.
///
/// `TraceLog` keeps the most recent retired instructions; `RegisterSnapshot`
/// is a plain copy of CPU state for dumps. Observers only ever see copies,
/// so nothing here can stall the tick loop.
use std::fmt;

use crate::cpu::cop0::Cop0;
use crate::cpu::instruction::Instruction;
use crate::cpu::Vr4300;

/// One retired instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetiredInstruction {
    pub pc: u64,
    pub raw: u32,
    pub delay_slot: bool,
}

impl fmt::Display for RetiredInstruction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:#018X}{} {}",
            self.pc,
            if self.delay_slot { "*" } else { " " },
            Instruction::decode(self.raw)
        )
    }
}

/// Ring buffer of retired instructions.
pub struct TraceLog {
    entries: Vec<RetiredInstruction>,
    capacity: usize,
    write_pos: usize,
}

impl TraceLog {
    /// `None` for a zero capacity: tracing disabled.
    pub fn new(capacity: usize) -> Option<Self> {
        if capacity == 0 {
            return None;
        }
        Some(Self {
            entries: Vec::with_capacity(capacity.min(4096)),
            capacity,
            write_pos: 0,
        })
    }

    pub fn push(&mut self, entry: RetiredInstruction) {
        if self.entries.len() < self.capacity {
            self.entries.push(entry);
        } else {
            self.entries[self.write_pos] = entry;
        }
        self.write_pos = (self.write_pos + 1) % self.capacity;
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// The most recent `count` entries in chronological order.
    pub fn recent(&self, count: usize) -> impl Iterator<Item = &RetiredInstruction> {
        let len = self.entries.len();
        let count = count.min(len);
        let start = if len < self.capacity {
            len - count
        } else {
            (self.write_pos + self.capacity - count) % self.capacity
        };
        (0..count).map(move |i| &self.entries[(start + i) % len])
    }
}

/// Copy of the architectural CPU state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegisterSnapshot {
    pub gpr: [u64; 32],
    pub fpr: [u64; 32],
    pub hi: u64,
    pub lo: u64,
    pub pc: u64,
    pub next_pc: u64,
    pub status: u64,
    pub cause: u64,
    pub epc: u64,
    pub count: u64,
    pub compare: u64,
}

impl RegisterSnapshot {
    pub fn capture(cpu: &Vr4300) -> Self {
        Self {
            gpr: cpu.gpr,
            fpr: cpu.cop1.fpr,
            hi: cpu.hi,
            lo: cpu.lo,
            pc: cpu.pc,
            next_pc: cpu.next_pc,
            status: cpu.cop0.regs[Cop0::STATUS],
            cause: cpu.cop0.regs[Cop0::CAUSE],
            epc: cpu.cop0.regs[Cop0::EPC],
            count: cpu.cop0.regs[Cop0::COUNT],
            compare: cpu.cop0.regs[Cop0::COMPARE],
        }
    }
}

const GPR_NAMES: [&str; 32] = [
    "r0", "at", "v0", "v1", "a0", "a1", "a2", "a3", //
    "t0", "t1", "t2", "t3", "t4", "t5", "t6", "t7", //
    "s0", "s1", "s2", "s3", "s4", "s5", "s6", "s7", //
    "t8", "t9", "k0", "k1", "gp", "sp", "s8", "ra",
];

impl fmt::Display for RegisterSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "pc {:#018X}  next {:#018X}", self.pc, self.next_pc)?;
        for row in 0..8 {
            for col in 0..4 {
                let i = row * 4 + col;
                write!(f, "{:>2} {:016X}  ", GPR_NAMES[i], self.gpr[i])?;
            }
            writeln!(f)?;
        }
        writeln!(f, "hi {:016X}  lo {:016X}", self.hi, self.lo)?;
        writeln!(
            f,
            "status {:#010X}  cause {:#010X}  epc {:#018X}",
            self.status, self.cause, self.epc
        )?;
        write!(f, "count {:#010X}  compare {:#010X}", self.count, self.compare)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn retired(pc: u64) -> RetiredInstruction {
        RetiredInstruction {
            pc,
            raw: 0,
            delay_slot: false,
        }
    }

    #[test]
    fn ring_keeps_latest_in_order() {
        let mut log = TraceLog::new(3).unwrap();
        for pc in 0..5u64 {
            log.push(retired(pc));
        }
        let pcs: Vec<u64> = log.recent(3).map(|e| e.pc).collect();
        assert_eq!(pcs, vec![2, 3, 4]);
        let pcs: Vec<u64> = log.recent(10).map(|e| e.pc).collect();
        assert_eq!(pcs, vec![2, 3, 4]);
        assert_eq!(log.len(), 3);
    }

    #[test]
    fn partial_ring_and_zero_capacity() {
        assert!(TraceLog::new(0).is_none());
        let mut log = TraceLog::new(8).unwrap();
        log.push(retired(7));
        log.push(retired(8));
        let pcs: Vec<u64> = log.recent(1).map(|e| e.pc).collect();
        assert_eq!(pcs, vec![8]);
    }

    #[test]
    fn snapshot_dump_names_registers() {
        let mut cpu = Vr4300::new();
        cpu.gpr[29] = 0xA400_1FF0;
        let snap = RegisterSnapshot::capture(&cpu);
        let text = snap.to_string();
        assert!(text.contains("sp 00000000A4001FF0"));
        assert!(text.contains("status 0x34000000"));
    }
}
