/// A decoded MIPS III instruction.
///
/// This is a thin wrapper around the raw 32-bit opcode with named
/// accessor methods so that execution code reads cleanly.
///
/// MIPS instruction formats (all 32-bit):
///
/// R-type:  [opcode:6][rs:5][rt:5][rd:5][sa:5][funct:6]
/// I-type:  [opcode:6][rs:5][rt:5][imm:16]
/// J-type:  [opcode:6][target:26]
/// FR-type: [COP1:6][fmt:5][ft:5][fs:5][fd:5][funct:6]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Instruction(pub u32);

impl Instruction {
    #[inline]
    pub fn decode(raw: u32) -> Self {
        Self(raw)
    }

    #[inline]
    pub fn opcode(self) -> u32 {
        (self.0 >> 26) & 0x3F
    }
    #[inline]
    pub fn rs(self) -> usize {
        ((self.0 >> 21) & 0x1F) as usize
    }
    #[inline]
    pub fn rt(self) -> usize {
        ((self.0 >> 16) & 0x1F) as usize
    }
    #[inline]
    pub fn rd(self) -> usize {
        ((self.0 >> 11) & 0x1F) as usize
    }
    #[inline]
    pub fn sa(self) -> u32 {
        (self.0 >> 6) & 0x1F
    }
    #[inline]
    pub fn funct(self) -> u32 {
        self.0 & 0x3F
    }
    #[inline]
    pub fn imm(self) -> u16 {
        self.0 as u16
    }
    #[inline]
    pub fn imm_sign_ext(self) -> u64 {
        self.imm() as i16 as i64 as u64
    }
    #[inline]
    pub fn target(self) -> u32 {
        self.0 & 0x03FF_FFFF
    }
    #[inline]
    pub fn raw(self) -> u32 {
        self.0
    }

    // COP1 field aliases
    #[inline]
    pub fn fmt(self) -> u32 {
        self.rs() as u32
    }
    #[inline]
    pub fn ft(self) -> usize {
        self.rt()
    }
    #[inline]
    pub fn fs(self) -> usize {
        self.rd()
    }
    #[inline]
    pub fn fd(self) -> usize {
        self.sa() as usize
    }

    /// Relative branch target for the instruction at `pc`.
    #[inline]
    pub fn branch_target(self, pc: u64) -> u64 {
        pc.wrapping_add(4).wrapping_add(self.imm_sign_ext() << 2)
    }

    /// J/JAL target: upper bits come from the delay slot address.
    #[inline]
    pub fn jump_target(self, pc: u64) -> u64 {
        (pc.wrapping_add(4) & !0x0FFF_FFFF) | ((self.target() as u64) << 2)
    }

    /// Instruction name for trace output. Unknown encodings read "???".
    pub fn mnemonic(self) -> &'static str {
        const PRIMARY: [&str; 64] = [
            "SPECIAL", "REGIMM", "J", "JAL", "BEQ", "BNE", "BLEZ", "BGTZ", //
            "ADDI", "ADDIU", "SLTI", "SLTIU", "ANDI", "ORI", "XORI", "LUI", //
            "COP0", "COP1", "COP2", "???", "BEQL", "BNEL", "BLEZL", "BGTZL", //
            "DADDI", "DADDIU", "LDL", "LDR", "???", "???", "???", "???", //
            "LB", "LH", "LWL", "LW", "LBU", "LHU", "LWR", "LWU", //
            "SB", "SH", "SWL", "SW", "SDL", "SDR", "SWR", "CACHE", //
            "LL", "LWC1", "LWC2", "???", "LLD", "LDC1", "LDC2", "LD", //
            "SC", "SWC1", "SWC2", "???", "SCD", "SDC1", "SDC2", "SD",
        ];
        const SPECIAL: [&str; 64] = [
            "SLL", "???", "SRL", "SRA", "SLLV", "???", "SRLV", "SRAV", //
            "JR", "JALR", "???", "???", "SYSCALL", "BREAK", "???", "SYNC", //
            "MFHI", "MTHI", "MFLO", "MTLO", "DSLLV", "???", "DSRLV", "DSRAV", //
            "MULT", "MULTU", "DIV", "DIVU", "DMULT", "DMULTU", "DDIV", "DDIVU", //
            "ADD", "ADDU", "SUB", "SUBU", "AND", "OR", "XOR", "NOR", //
            "???", "???", "SLT", "SLTU", "DADD", "DADDU", "DSUB", "DSUBU", //
            "TGE", "TGEU", "TLT", "TLTU", "TEQ", "???", "TNE", "???", //
            "DSLL", "???", "DSRL", "DSRA", "DSLL32", "???", "DSRL32", "DSRA32",
        ];
        match self.opcode() {
            0x00 if self.0 == 0 => "NOP",
            0x00 => SPECIAL[self.funct() as usize],
            0x01 => match self.rt() {
                0x00 => "BLTZ",
                0x01 => "BGEZ",
                0x02 => "BLTZL",
                0x03 => "BGEZL",
                0x08 => "TGEI",
                0x09 => "TGEIU",
                0x0A => "TLTI",
                0x0B => "TLTIU",
                0x0C => "TEQI",
                0x0E => "TNEI",
                0x10 => "BLTZAL",
                0x11 => "BGEZAL",
                0x12 => "BLTZALL",
                0x13 => "BGEZALL",
                _ => "???",
            },
            op => PRIMARY[op as usize],
        }
    }
}

impl std::fmt::Display for Instruction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:<8} {:#010X}", self.mnemonic(), self.0)
    }
}
