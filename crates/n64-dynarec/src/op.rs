//! Decoded operations executed natively by the threaded backend.

/// One pre-decoded guest instruction.
///
/// Branch and jump offsets are kept relative so a block stays valid when
/// the same physical code is reached through another virtual segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Op {
    // Immediate ALU
    Addi { rs: u8, rt: u8, imm: i16 },
    Addiu { rs: u8, rt: u8, imm: i16 },
    Daddi { rs: u8, rt: u8, imm: i16 },
    Daddiu { rs: u8, rt: u8, imm: i16 },
    Slti { rs: u8, rt: u8, imm: i16 },
    Sltiu { rs: u8, rt: u8, imm: i16 },
    Andi { rs: u8, rt: u8, imm: u16 },
    Ori { rs: u8, rt: u8, imm: u16 },
    Xori { rs: u8, rt: u8, imm: u16 },
    Lui { rt: u8, imm: i16 },

    // Register ALU
    Add { rs: u8, rt: u8, rd: u8 },
    Addu { rs: u8, rt: u8, rd: u8 },
    Sub { rs: u8, rt: u8, rd: u8 },
    Subu { rs: u8, rt: u8, rd: u8 },
    Dadd { rs: u8, rt: u8, rd: u8 },
    Daddu { rs: u8, rt: u8, rd: u8 },
    Dsub { rs: u8, rt: u8, rd: u8 },
    Dsubu { rs: u8, rt: u8, rd: u8 },
    And { rs: u8, rt: u8, rd: u8 },
    Or { rs: u8, rt: u8, rd: u8 },
    Xor { rs: u8, rt: u8, rd: u8 },
    Nor { rs: u8, rt: u8, rd: u8 },
    Slt { rs: u8, rt: u8, rd: u8 },
    Sltu { rs: u8, rt: u8, rd: u8 },

    // Shifts
    Sll { rt: u8, rd: u8, sa: u8 },
    Srl { rt: u8, rd: u8, sa: u8 },
    Sra { rt: u8, rd: u8, sa: u8 },
    Sllv { rs: u8, rt: u8, rd: u8 },
    Srlv { rs: u8, rt: u8, rd: u8 },
    Srav { rs: u8, rt: u8, rd: u8 },
    Dsll { rt: u8, rd: u8, sa: u8 },
    Dsrl { rt: u8, rd: u8, sa: u8 },
    Dsra { rt: u8, rd: u8, sa: u8 },
    Dsllv { rs: u8, rt: u8, rd: u8 },
    Dsrlv { rs: u8, rt: u8, rd: u8 },
    Dsrav { rs: u8, rt: u8, rd: u8 },

    // HI/LO
    Mfhi { rd: u8 },
    Mflo { rd: u8 },
    Mthi { rs: u8 },
    Mtlo { rs: u8 },
    Mult { rs: u8, rt: u8 },
    Multu { rs: u8, rt: u8 },
    Div { rs: u8, rt: u8 },
    Divu { rs: u8, rt: u8 },

    // Memory. `size` is 1, 2, 4 or 8 bytes.
    Load { rs: u8, rt: u8, offset: i16, size: u8, signed: bool },
    Store { rs: u8, rt: u8, offset: i16, size: u8 },

    // Control flow
    Beq { rs: u8, rt: u8, offset: i16 },
    Bne { rs: u8, rt: u8, offset: i16 },
    Blez { rs: u8, offset: i16 },
    Bgtz { rs: u8, offset: i16 },
    Bltz { rs: u8, offset: i16 },
    Bgez { rs: u8, offset: i16 },
    J { target: u32 },
    Jal { target: u32 },
    Jr { rs: u8 },
    Jalr { rs: u8, rd: u8 },

    /// Anything else runs through the interpreter. `ends_block` marks
    /// instructions that may change translation, privilege or the PC
    /// without a delay slot.
    Interpret { raw: u32, ends_block: bool },
}

impl Op {
    /// Branches and jumps with a delay slot, native or interpreted.
    pub fn is_control_flow(self) -> bool {
        match self {
            Op::Beq { .. }
            | Op::Bne { .. }
            | Op::Blez { .. }
            | Op::Bgtz { .. }
            | Op::Bltz { .. }
            | Op::Bgez { .. }
            | Op::J { .. }
            | Op::Jal { .. }
            | Op::Jr { .. }
            | Op::Jalr { .. } => true,
            Op::Interpret { raw, .. } => interpreted_branch(raw),
            _ => false,
        }
    }

    pub fn ends_block(self) -> bool {
        matches!(self, Op::Interpret { ends_block: true, .. })
    }

    /// Static target of a direct branch or jump at `pc`.
    pub fn static_target(self, pc: u64) -> Option<u64> {
        let relative = |offset: i16| {
            Some(pc.wrapping_add(4).wrapping_add(((offset as i64) << 2) as u64))
        };
        match self {
            Op::Beq { offset, .. }
            | Op::Bne { offset, .. }
            | Op::Blez { offset, .. }
            | Op::Bgtz { offset, .. }
            | Op::Bltz { offset, .. }
            | Op::Bgez { offset, .. } => relative(offset),
            Op::J { target } | Op::Jal { target } => {
                Some((pc.wrapping_add(4) & !0x0FFF_FFFF) | (u64::from(target) << 2))
            }
            _ => None,
        }
    }
}

/// Branch-likely, REGIMM link forms and BC1x: interpreted, but still
/// followed by a delay slot.
fn interpreted_branch(raw: u32) -> bool {
    let opcode = raw >> 26;
    let rs = (raw >> 21) & 0x1F;
    let rt = (raw >> 16) & 0x1F;
    match opcode {
        0x01 => matches!(rt, 0x00..=0x03 | 0x10..=0x13),
        0x11 => rs == 0x08,
        0x14..=0x17 => true,
        _ => false,
    }
}

/// Instructions that must end a block after they execute: exceptions,
/// COP0 traffic (Status, TLB, ERET) and cache maintenance.
fn must_end_block(raw: u32) -> bool {
    let opcode = raw >> 26;
    let funct = raw & 0x3F;
    match opcode {
        0x00 => matches!(funct, 0x0C | 0x0D | 0x30..=0x36),
        0x01 => matches!((raw >> 16) & 0x1F, 0x08..=0x0E),
        0x10 | 0x2F => true,
        // CTC1 may trap immediately
        0x11 => (raw >> 21) & 0x1F == 0x06,
        _ => false,
    }
}

/// Decode one raw word.
pub fn decode(raw: u32) -> Op {
    let opcode = (raw >> 26) as u8;
    let rs = ((raw >> 21) & 0x1F) as u8;
    let rt = ((raw >> 16) & 0x1F) as u8;
    let rd = ((raw >> 11) & 0x1F) as u8;
    let sa = ((raw >> 6) & 0x1F) as u8;
    let funct = (raw & 0x3F) as u8;
    let imm = raw as u16;
    let simm = imm as i16;

    let interpret = Op::Interpret {
        raw,
        ends_block: must_end_block(raw),
    };

    match opcode {
        0x00 => match funct {
            0x00 => Op::Sll { rt, rd, sa },
            0x02 => Op::Srl { rt, rd, sa },
            0x03 => Op::Sra { rt, rd, sa },
            0x04 => Op::Sllv { rs, rt, rd },
            0x06 => Op::Srlv { rs, rt, rd },
            0x07 => Op::Srav { rs, rt, rd },
            0x08 => Op::Jr { rs },
            0x09 => Op::Jalr { rs, rd },
            0x10 => Op::Mfhi { rd },
            0x11 => Op::Mthi { rs },
            0x12 => Op::Mflo { rd },
            0x13 => Op::Mtlo { rs },
            0x14 => Op::Dsllv { rs, rt, rd },
            0x16 => Op::Dsrlv { rs, rt, rd },
            0x17 => Op::Dsrav { rs, rt, rd },
            0x18 => Op::Mult { rs, rt },
            0x19 => Op::Multu { rs, rt },
            0x1A => Op::Div { rs, rt },
            0x1B => Op::Divu { rs, rt },
            0x20 => Op::Add { rs, rt, rd },
            0x21 => Op::Addu { rs, rt, rd },
            0x22 => Op::Sub { rs, rt, rd },
            0x23 => Op::Subu { rs, rt, rd },
            0x24 => Op::And { rs, rt, rd },
            0x25 => Op::Or { rs, rt, rd },
            0x26 => Op::Xor { rs, rt, rd },
            0x27 => Op::Nor { rs, rt, rd },
            0x2A => Op::Slt { rs, rt, rd },
            0x2B => Op::Sltu { rs, rt, rd },
            0x2C => Op::Dadd { rs, rt, rd },
            0x2D => Op::Daddu { rs, rt, rd },
            0x2E => Op::Dsub { rs, rt, rd },
            0x2F => Op::Dsubu { rs, rt, rd },
            0x38 => Op::Dsll { rt, rd, sa },
            0x3A => Op::Dsrl { rt, rd, sa },
            0x3B => Op::Dsra { rt, rd, sa },
            0x3C => Op::Dsll { rt, rd, sa: sa + 32 },
            0x3E => Op::Dsrl { rt, rd, sa: sa + 32 },
            0x3F => Op::Dsra { rt, rd, sa: sa + 32 },
            _ => interpret,
        },
        0x01 => match rt {
            0x00 => Op::Bltz { rs, offset: simm },
            0x01 => Op::Bgez { rs, offset: simm },
            _ => interpret,
        },
        0x02 => Op::J { target: raw & 0x03FF_FFFF },
        0x03 => Op::Jal { target: raw & 0x03FF_FFFF },
        0x04 => Op::Beq { rs, rt, offset: simm },
        0x05 => Op::Bne { rs, rt, offset: simm },
        0x06 => Op::Blez { rs, offset: simm },
        0x07 => Op::Bgtz { rs, offset: simm },
        0x08 => Op::Addi { rs, rt, imm: simm },
        0x09 => Op::Addiu { rs, rt, imm: simm },
        0x0A => Op::Slti { rs, rt, imm: simm },
        0x0B => Op::Sltiu { rs, rt, imm: simm },
        0x0C => Op::Andi { rs, rt, imm },
        0x0D => Op::Ori { rs, rt, imm },
        0x0E => Op::Xori { rs, rt, imm },
        0x0F => Op::Lui { rt, imm: simm },
        0x18 => Op::Daddi { rs, rt, imm: simm },
        0x19 => Op::Daddiu { rs, rt, imm: simm },
        0x20 | 0x21 | 0x23 | 0x24 | 0x25 | 0x27 | 0x37 => {
            let (size, signed) = match opcode {
                0x20 => (1, true),
                0x21 => (2, true),
                0x23 => (4, true),
                0x24 => (1, false),
                0x25 => (2, false),
                0x27 => (4, false),
                _ => (8, false),
            };
            Op::Load {
                rs,
                rt,
                offset: simm,
                size,
                signed,
            }
        }
        0x28 | 0x29 | 0x2B | 0x3F => Op::Store {
            rs,
            rt,
            offset: simm,
            size: match opcode {
                0x28 => 1,
                0x29 => 2,
                0x2B => 4,
                _ => 8,
            },
        },
        _ => interpret,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_native_forms() {
        assert_eq!(
            decode(0x2408_0005),
            Op::Addiu {
                rs: 0,
                rt: 8,
                imm: 5
            }
        );
        assert_eq!(
            decode(0x000B_603E),
            Op::Dsrl {
                rt: 11,
                rd: 12,
                sa: 32
            }
        );
        assert_eq!(
            decode(0x8D8B_0100),
            Op::Load {
                rs: 12,
                rt: 11,
                offset: 0x100,
                size: 4,
                signed: true
            }
        );
    }

    #[test]
    fn classifies_interpreted_instructions() {
        // eret
        assert_eq!(
            decode(0x4200_0018),
            Op::Interpret {
                raw: 0x4200_0018,
                ends_block: true
            }
        );
        // beql is control flow, not a block terminator by itself
        let beql = decode(0x5100_0002);
        assert!(beql.is_control_flow());
        assert!(!beql.ends_block());
        // lwl is plain interpreted work
        assert!(!decode(0x8988_0101).is_control_flow());
        assert!(!decode(0x8988_0101).ends_block());
    }

    #[test]
    fn static_targets() {
        let pc = 0xFFFF_FFFF_8000_0010;
        assert_eq!(decode(0x1000_FFFF).static_target(pc), Some(pc));
        assert_eq!(
            decode(0x0800_0040).static_target(pc),
            Some(0xFFFF_FFFF_8000_0100)
        );
        assert_eq!(decode(0x0100_0008).static_target(pc), None); // jr t0
    }
}
