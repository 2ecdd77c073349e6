//! Dynarec infrastructure shared by emulator cores.
//!
//! This crate keeps backend/compiler concerns separate from core emulation logic.
//! Blocks reach the machine only through [`GuestContext`], so the core decides
//! what a load, a branch or an exception means. The backend is threaded code.

use std::collections::{BTreeMap, BTreeSet};

mod block;
mod op;
mod threaded;

pub use block::{BlockExit, CompiledBlock, GuestContext, Trap};
pub use op::{decode, Op};
pub use threaded::ThreadedCompiler;

/// Input needed to compile a guest basic block.
#[derive(Debug, Clone, Copy)]
pub struct CompileRequest {
    /// Start physical address (guest space) of the block.
    pub start_phys: u32,
    /// Virtual address the block is entered at.
    pub start_vaddr: u64,
    /// Maximum number of instructions to include in a block.
    pub max_instructions: u32,
}

/// Guest instruction source used by the compiler.
pub trait InstructionSource {
    fn read_u32(&mut self, phys_addr: u32) -> Result<u32, CompileError>;
}

/// Compilation failure.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CompileError {
    /// Source memory could not be read.
    #[error("cannot read guest code at {phys_addr:#010X}")]
    MemoryRead { phys_addr: u32 },
    /// A branch would be separated from its delay slot.
    #[error("branch at {phys_addr:#010X} has no room for its delay slot")]
    SplitDelaySlot { phys_addr: u32 },
    /// The delay slot holds another branch or a block terminator.
    #[error("unsupported instruction in delay slot at {phys_addr:#010X}")]
    ControlFlowInDelaySlot { phys_addr: u32 },
}

/// Backend trait for block compilers.
///
/// Backends should treat `start_phys` as the cache key. Invalidation is always
/// performed in guest physical addresses.
pub trait BlockCompiler {
    fn name(&self) -> &'static str;
    fn compile(
        &mut self,
        request: &CompileRequest,
        source: &mut dyn InstructionSource,
    ) -> Result<CompiledBlock, CompileError>;
    fn invalidate_range(&mut self, _start_phys: u32, _len: u32) {}
}

/// Compiler configuration.
#[derive(Debug, Clone, Copy)]
pub struct RecompilerConfig {
    pub max_block_instructions: u32,
}

impl Default for RecompilerConfig {
    fn default() -> Self {
        Self {
            max_block_instructions: 64,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnsureResult {
    CacheHit,
    Compiled,
    CompileFailed,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RecompilerStats {
    pub cache_hits: u64,
    pub failed_cache_hits: u64,
    pub blocks_compiled: u64,
    pub compile_failures: u64,
    pub invalidated_blocks: u64,
    pub blocks_executed: u64,
    pub instructions_executed: u64,
}

/// Core recompiler pipeline: cache + backend compiler.
pub struct Recompiler {
    compiler: Box<dyn BlockCompiler>,
    config: RecompilerConfig,
    cache: BTreeMap<u32, CompiledBlock>,
    failed_cache: BTreeSet<u32>,
    stats: RecompilerStats,
    last_error: Option<CompileError>,
}

impl Recompiler {
    pub fn new(compiler: Box<dyn BlockCompiler>, config: RecompilerConfig) -> Self {
        Self {
            compiler,
            config,
            cache: BTreeMap::new(),
            failed_cache: BTreeSet::new(),
            stats: RecompilerStats::default(),
            last_error: None,
        }
    }

    /// Recompiler with the threaded backend.
    pub fn threaded(config: RecompilerConfig) -> Self {
        Self::new(Box::<ThreadedCompiler>::default(), config)
    }

    pub fn backend_name(&self) -> &'static str {
        self.compiler.name()
    }

    pub fn cache_len(&self) -> usize {
        self.cache.len()
    }

    pub fn failed_cache_len(&self) -> usize {
        self.failed_cache.len()
    }

    pub fn stats(&self) -> RecompilerStats {
        self.stats
    }

    pub fn last_error(&self) -> Option<&CompileError> {
        self.last_error.as_ref()
    }

    pub fn lookup(&self, start_phys: u32) -> Option<&CompiledBlock> {
        self.cache.get(&start_phys)
    }

    pub fn is_failed(&self, start_phys: u32) -> bool {
        self.failed_cache.contains(&start_phys)
    }

    pub fn ensure_compiled(
        &mut self,
        start_phys: u32,
        start_vaddr: u64,
        source: &mut dyn InstructionSource,
    ) -> EnsureResult {
        if self.cache.contains_key(&start_phys) {
            self.stats.cache_hits += 1;
            return EnsureResult::CacheHit;
        }
        if self.failed_cache.contains(&start_phys) {
            self.stats.cache_hits += 1;
            self.stats.failed_cache_hits += 1;
            return EnsureResult::CacheHit;
        }

        let request = CompileRequest {
            start_phys,
            start_vaddr,
            max_instructions: self.config.max_block_instructions.max(1),
        };
        match self.compiler.compile(&request, source) {
            Ok(block) => {
                self.stats.blocks_compiled += 1;
                self.failed_cache.remove(&start_phys);
                self.cache.insert(start_phys, block);
                EnsureResult::Compiled
            }
            Err(err) => {
                log::debug!("compile failed at {:#010X}: {}", start_phys, err);
                self.stats.compile_failures += 1;
                self.failed_cache.insert(start_phys);
                self.last_error = Some(err);
                EnsureResult::CompileFailed
            }
        }
    }

    /// Run the cached block at `start_phys`, if there is one.
    pub fn execute<C: GuestContext>(
        &mut self,
        start_phys: u32,
        ctx: &mut C,
    ) -> Option<Result<BlockExit, C::Error>> {
        let block = self.cache.get(&start_phys)?;
        let result = block.execute(ctx);
        if let Ok(exit) = &result {
            self.stats.blocks_executed += 1;
            self.stats.instructions_executed += u64::from(exit.retired());
        }
        Some(result)
    }

    pub fn invalidate_range(&mut self, start_phys: u32, len: u32) {
        if len == 0 {
            return;
        }
        let end_phys = start_phys.saturating_add(len);
        let keys_to_drop: Vec<u32> = self
            .cache
            .iter()
            .filter_map(|(key, block)| {
                let overlap = block.start_phys < end_phys && start_phys < block.end_phys;
                if overlap {
                    Some(*key)
                } else {
                    None
                }
            })
            .collect();

        for key in keys_to_drop {
            if self.cache.remove(&key).is_some() {
                self.stats.invalidated_blocks += 1;
            }
        }

        let failed_to_drop: Vec<u32> = self
            .failed_cache
            .range(start_phys..end_phys)
            .copied()
            .collect();
        for key in failed_to_drop {
            if self.failed_cache.remove(&key) {
                self.stats.invalidated_blocks += 1;
            }
        }

        self.compiler.invalidate_range(start_phys, len);
    }

    /// Drop every block and failure record.
    pub fn flush(&mut self) {
        self.stats.invalidated_blocks += (self.cache.len() + self.failed_cache.len()) as u64;
        self.cache.clear();
        self.failed_cache.clear();
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use std::collections::HashMap;

    use super::*;

    pub struct TestSource {
        words: HashMap<u32, u32>,
    }

    impl TestSource {
        pub fn with_words(pairs: &[(u32, u32)]) -> Self {
            let mut words = HashMap::new();
            for (addr, word) in pairs {
                words.insert(*addr, *word);
            }
            Self { words }
        }
    }

    impl InstructionSource for TestSource {
        fn read_u32(&mut self, phys_addr: u32) -> Result<u32, CompileError> {
            self.words
                .get(&phys_addr)
                .copied()
                .ok_or(CompileError::MemoryRead { phys_addr })
        }
    }

    /// Minimal machine: registers, a flat byte memory at physical 0 reached
    /// through kseg0, and the same PC/delay-slot bookkeeping as the CPU.
    #[derive(Default)]
    pub struct TestContext {
        pub gpr: [u64; 32],
        pub hi: u64,
        pub lo: u64,
        pub pc: u64,
        pub next_pc: u64,
        pub mem: Vec<u8>,
        pub traps: Vec<Trap>,
        pub interpreted: Vec<u32>,
        pub retired: u32,
        /// Retire at which to report an interrupt.
        pub interrupt_at: Option<u32>,
        pub wide: bool,
        branch_pending: bool,
        trap_pending: bool,
    }

    impl TestContext {
        pub fn at(pc: u64) -> Self {
            Self {
                pc,
                next_pc: pc.wrapping_add(4),
                mem: vec![0; 0x1000],
                wide: true,
                ..Self::default()
            }
        }

        fn offset(vaddr: u64) -> usize {
            (vaddr as u32 & 0x1FFF_FFFF) as usize
        }
    }

    impl GuestContext for TestContext {
        type Error = String;

        fn gpr(&self, reg: u8) -> u64 {
            self.gpr[reg as usize]
        }
        fn set_gpr(&mut self, reg: u8, value: u64) {
            self.gpr[reg as usize] = value;
        }
        fn hi(&self) -> u64 {
            self.hi
        }
        fn lo(&self) -> u64 {
            self.lo
        }
        fn set_hi(&mut self, value: u64) {
            self.hi = value;
        }
        fn set_lo(&mut self, value: u64) {
            self.lo = value;
        }
        fn operation_64(&self) -> bool {
            self.wide
        }
        fn raise(&mut self, trap: Trap) {
            self.traps.push(trap);
            self.trap_pending = true;
        }
        fn load(&mut self, vaddr: u64, size: u8, signed: bool) -> Result<Option<u64>, String> {
            let at = Self::offset(vaddr);
            let bytes = self
                .mem
                .get(at..at + size as usize)
                .ok_or_else(|| format!("load {vaddr:#X}"))?;
            let mut value = bytes.iter().fold(0u64, |acc, b| acc << 8 | u64::from(*b));
            if signed {
                let shift = 64 - 8 * u32::from(size);
                value = ((value << shift) as i64 >> shift) as u64;
            }
            Ok(Some(value))
        }
        fn store(&mut self, vaddr: u64, size: u8, value: u64) -> Result<Option<()>, String> {
            let at = Self::offset(vaddr);
            let size = size as usize;
            let bytes = self
                .mem
                .get_mut(at..at + size)
                .ok_or_else(|| format!("store {vaddr:#X}"))?;
            bytes.copy_from_slice(&value.to_be_bytes()[8 - size..]);
            Ok(Some(()))
        }
        fn begin(&mut self, _pc: u64, _raw: u32) {
            self.branch_pending = false;
            self.pc = self.next_pc;
            self.next_pc = self.next_pc.wrapping_add(4);
        }
        fn branch(&mut self, target: u64, taken: bool) {
            if taken {
                self.next_pc = target;
            }
            self.branch_pending = true;
        }
        fn retire(&mut self) -> Result<bool, String> {
            self.gpr[0] = 0;
            self.retired += 1;
            let interrupted = self.interrupt_at == Some(self.retired);
            if std::mem::take(&mut self.trap_pending) || interrupted {
                self.pc = 0xFFFF_FFFF_8000_0180;
                self.next_pc = self.pc + 4;
                return Ok(false);
            }
            Ok(true)
        }
        fn interpret(&mut self, raw: u32, _pc: u64) -> Result<(), String> {
            self.interpreted.push(raw);
            Ok(())
        }
        fn pc(&self) -> u64 {
            self.pc
        }
    }
}
