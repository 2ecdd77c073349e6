use std::collections::HashMap;

use crate::bus::{Bus, BusError};
use crate::config::DynarecSettings;
use crate::cpu::exceptions::ExceptionCode;
use crate::cpu::instruction::Instruction;
use crate::cpu::{Access, Vr4300};
use crate::jit::{ExecutionEngine, Interpreter};

use n64_dynarec::{
    BlockExit, EnsureResult, GuestContext, InstructionSource, Recompiler, RecompilerConfig,
    RecompilerStats, Trap,
};

#[derive(Debug, Clone, Copy, Default)]
pub struct DynarecRuntimeStats {
    pub blocks_executed: u64,
    pub block_instructions: u64,
    pub chained_blocks: u64,
    pub redirected_exits: u64,
    pub fallback_instructions_executed: u64,
    pub fallback_guard: u64,
    pub fallback_no_block: u64,
    pub fallback_failed_cache: u64,
    pub fallback_cold: u64,
    pub invalidate_calls: u64,
    pub invalidate_bytes: u64,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct DynarecStats {
    pub runtime: DynarecRuntimeStats,
    pub recompiler: RecompilerStats,
    pub block_cache_len: usize,
    pub failed_cache_len: usize,
    pub hot_entries: usize,
    pub hot_threshold: u32,
    pub max_block_instructions: u32,
    /// Successor blocks run straight from cache after the first one.
    pub chain_limit: u32,
}

#[derive(Clone, Copy)]
enum FallbackReason {
    Guard,
    NoBlock,
    FailedCache,
    Cold,
}

struct BusSource<'a, B: Bus> {
    bus: &'a B,
}

impl<B: Bus> InstructionSource for BusSource<'_, B> {
    fn read_u32(&mut self, phys_addr: u32) -> Result<u32, n64_dynarec::CompileError> {
        self.bus
            .read_u32(phys_addr)
            .map_err(|_| n64_dynarec::CompileError::MemoryRead { phys_addr })
    }
}

/// Guest context handed to compiled blocks: the CPU plus its bus.
///
/// Every callback lands in the same `Vr4300` methods the interpreter uses,
/// which is what keeps both strategies in lockstep.
struct CpuContext<'a, B: Bus> {
    cpu: &'a mut Vr4300,
    bus: &'a B,
    /// Physical range of the running block.
    block: (u32, u32),
    /// Code-write ranges drained from the bus while the block ran.
    writes: Vec<(u32, u32)>,
    dirty: bool,
}

impl<'a, B: Bus> CpuContext<'a, B> {
    fn new(cpu: &'a mut Vr4300, bus: &'a B, block: (u32, u32)) -> Self {
        Self {
            cpu,
            bus,
            block,
            writes: Vec::new(),
            dirty: false,
        }
    }

    /// Pick up RDRAM writes made by the last op; a write into the running
    /// block stops it after the op retires.
    fn collect_writes(&mut self) {
        let (start, end) = self.block;
        for (addr, len) in self.bus.take_code_writes() {
            if addr < end && start < addr.saturating_add(len) {
                self.dirty = true;
            }
            self.writes.push((addr, len));
        }
    }
}

impl<B: Bus> GuestContext for CpuContext<'_, B> {
    type Error = BusError;

    fn gpr(&self, reg: u8) -> u64 {
        self.cpu.gpr[reg as usize]
    }

    fn set_gpr(&mut self, reg: u8, value: u64) {
        self.cpu.gpr[reg as usize] = value;
    }

    fn hi(&self) -> u64 {
        self.cpu.hi
    }

    fn lo(&self) -> u64 {
        self.cpu.lo
    }

    fn set_hi(&mut self, value: u64) {
        self.cpu.hi = value;
    }

    fn set_lo(&mut self, value: u64) {
        self.cpu.lo = value;
    }

    fn operation_64(&self) -> bool {
        self.cpu.cop0.operation_64()
    }

    fn raise(&mut self, trap: Trap) {
        self.cpu.raise(match trap {
            Trap::Overflow => ExceptionCode::Overflow,
            Trap::ReservedInstruction => ExceptionCode::ReservedInstruction,
        });
    }

    fn load(&mut self, vaddr: u64, size: u8, signed: bool) -> Result<Option<u64>, BusError> {
        let value = self.cpu.load(self.bus, vaddr, u32::from(size))?;
        Ok(value.map(|v| {
            if !signed {
                return v;
            }
            match size {
                1 => v as u8 as i8 as i64 as u64,
                2 => v as u16 as i16 as i64 as u64,
                4 => v as u32 as i32 as i64 as u64,
                _ => v,
            }
        }))
    }

    fn store(&mut self, vaddr: u64, size: u8, value: u64) -> Result<Option<()>, BusError> {
        let stored = self.cpu.store(self.bus, vaddr, u32::from(size), value)?;
        self.collect_writes();
        Ok(stored.then_some(()))
    }

    fn begin(&mut self, pc: u64, raw: u32) {
        self.cpu.begin(pc, raw);
    }

    fn branch(&mut self, target: u64, taken: bool) {
        self.cpu.branch(target, taken);
    }

    fn retire(&mut self) -> Result<bool, BusError> {
        let on_path = self.cpu.retire();
        Ok(on_path && !self.dirty)
    }

    fn interpret(&mut self, raw: u32, pc: u64) -> Result<(), BusError> {
        self.cpu.execute(Instruction::decode(raw), self.bus, pc)?;
        self.collect_writes();
        Ok(())
    }

    fn pc(&self) -> u64 {
        self.cpu.pc
    }
}

/// Entry points counted towards hotness before the table is reset.
const HOT_COUNT_LIMIT: usize = 4096;

/// Recompiler engine with interpreter fallback.
///
/// Entries are counted until they turn hot, then compiled once and run
/// through [`CpuContext`]. Anything the cache cannot serve takes exactly one
/// interpreter step.
pub struct RecompilerEngine {
    fallback: Interpreter,
    recompiler: Recompiler,
    runtime: DynarecRuntimeStats,
    hot_counts: HashMap<u32, u32>,
    hot_threshold: u32,
    max_block_instructions: u32,
    chain_limit: u32,
}

impl RecompilerEngine {
    pub fn new(settings: DynarecSettings) -> Self {
        let recompiler = Recompiler::threaded(RecompilerConfig {
            max_block_instructions: settings.max_block_instructions,
        });
        log::info!(
            "recompiler enabled (backend={}, hot={}, max_block={}, chain={})",
            recompiler.backend_name(),
            settings.hot_threshold,
            settings.max_block_instructions,
            settings.chain_limit
        );
        Self {
            fallback: Interpreter,
            recompiler,
            runtime: DynarecRuntimeStats::default(),
            hot_counts: HashMap::new(),
            hot_threshold: settings.hot_threshold.max(1),
            max_block_instructions: settings.max_block_instructions,
            chain_limit: settings.chain_limit,
        }
    }

    pub fn stats(&self) -> DynarecStats {
        DynarecStats {
            runtime: self.runtime,
            recompiler: self.recompiler.stats(),
            block_cache_len: self.recompiler.cache_len(),
            failed_cache_len: self.recompiler.failed_cache_len(),
            hot_entries: self.hot_counts.len(),
            hot_threshold: self.hot_threshold,
            max_block_instructions: self.max_block_instructions,
            chain_limit: self.chain_limit,
        }
    }

    pub fn stats_line(&self) -> String {
        let stats = self.stats();
        format!(
            "blocks={} block_instr={} chained={} redirected={} fallback_instr={} fallback_guard={} fallback_no_block={} fallback_failed_cache={} fallback_cold={} compiled={} compile_failures={} invalidated={} invalidate_calls={} invalidate_bytes={} block_cache_len={} failed_cache_len={} hot_entries={} hot_threshold={} max_block_insns={} chain_limit={}",
            stats.runtime.blocks_executed,
            stats.runtime.block_instructions,
            stats.runtime.chained_blocks,
            stats.runtime.redirected_exits,
            stats.runtime.fallback_instructions_executed,
            stats.runtime.fallback_guard,
            stats.runtime.fallback_no_block,
            stats.runtime.fallback_failed_cache,
            stats.runtime.fallback_cold,
            stats.recompiler.blocks_compiled,
            stats.recompiler.compile_failures,
            stats.recompiler.invalidated_blocks,
            stats.runtime.invalidate_calls,
            stats.runtime.invalidate_bytes,
            stats.block_cache_len,
            stats.failed_cache_len,
            stats.hot_entries,
            stats.hot_threshold,
            stats.max_block_instructions,
            stats.chain_limit
        )
    }

    pub fn reset_stats(&mut self) {
        self.runtime = DynarecRuntimeStats::default();
    }

    fn run_fallback(
        &mut self,
        cpu: &mut Vr4300,
        bus: &impl Bus,
        reason: FallbackReason,
    ) -> Result<u64, BusError> {
        let retired = self.fallback.execute(cpu, bus)?;
        self.runtime.fallback_instructions_executed = self
            .runtime
            .fallback_instructions_executed
            .wrapping_add(retired);
        match reason {
            FallbackReason::Guard => self.runtime.fallback_guard += 1,
            FallbackReason::NoBlock => self.runtime.fallback_no_block += 1,
            FallbackReason::FailedCache => self.runtime.fallback_failed_cache += 1,
            FallbackReason::Cold => self.runtime.fallback_cold += 1,
        }
        Ok(retired)
    }

    fn should_attempt_compile(&mut self, start_phys: u32) -> bool {
        if self.hot_counts.len() >= HOT_COUNT_LIMIT
            && !self.hot_counts.contains_key(&start_phys)
        {
            log::debug!("hot counter table full, resetting {} entries", self.hot_counts.len());
            self.hot_counts.clear();
        }
        let entry = self.hot_counts.entry(start_phys).or_insert(0);
        *entry = entry.saturating_add(1);
        *entry >= self.hot_threshold
    }

    /// Physical address a block may be entered at, or `None` when the next
    /// instruction needs the interpreter (pending delay slot, fetch fault).
    fn entry_phys(cpu: &Vr4300) -> Option<u32> {
        if cpu.branch_pending || cpu.pc & 0x3 != 0 {
            return None;
        }
        cpu.resolve(cpu.pc, Access::Fetch).ok()
    }

    /// Apply the bus's code-write barrier.
    fn drain_code_writes(&mut self, bus: &impl Bus) {
        for (start, len) in bus.take_code_writes() {
            self.invalidate_range(start, len);
        }
    }

    fn run_chain<B: Bus>(
        &mut self,
        cpu: &mut Vr4300,
        bus: &B,
        first_phys: u32,
        budget: u64,
    ) -> Result<u64, BusError> {
        let mut total = 0u64;
        let mut start_phys = first_phys;
        let mut successors = 0u32;

        loop {
            let Some(range) = self
                .recompiler
                .lookup(start_phys)
                .map(|block| (block.start_phys, block.end_phys))
            else {
                break;
            };
            let mut ctx = CpuContext::new(cpu, bus, range);
            let exit = match self.recompiler.execute(start_phys, &mut ctx) {
                Some(result) => result?,
                None => break,
            };
            let writes = std::mem::take(&mut ctx.writes);
            for (start, len) in writes {
                self.invalidate_range(start, len);
            }

            self.runtime.blocks_executed += 1;
            self.runtime.block_instructions += u64::from(exit.retired());
            total += u64::from(exit.retired());
            if let BlockExit::Redirected { .. } = exit {
                self.runtime.redirected_exits += 1;
                break;
            }

            if successors >= self.chain_limit || total >= budget {
                break;
            }
            let Some(next) = Self::entry_phys(cpu) else {
                break;
            };
            if self.recompiler.lookup(next).is_none() {
                break;
            }
            successors += 1;
            self.runtime.chained_blocks += 1;
            start_phys = next;
        }
        Ok(total)
    }
}

impl ExecutionEngine for RecompilerEngine {
    fn execute(&mut self, cpu: &mut Vr4300, bus: &impl Bus) -> Result<u64, BusError> {
        self.execute_within(cpu, bus, u64::MAX)
    }

    fn execute_within(
        &mut self,
        cpu: &mut Vr4300,
        bus: &impl Bus,
        budget: u64,
    ) -> Result<u64, BusError> {
        self.drain_code_writes(bus);

        let Some(start_phys) = Self::entry_phys(cpu) else {
            return self.run_fallback(cpu, bus, FallbackReason::Guard);
        };

        if self.recompiler.lookup(start_phys).is_none() {
            if self.recompiler.is_failed(start_phys) {
                return self.run_fallback(cpu, bus, FallbackReason::FailedCache);
            }
            if !self.should_attempt_compile(start_phys) {
                return self.run_fallback(cpu, bus, FallbackReason::Cold);
            }
            let mut source = BusSource { bus };
            match self
                .recompiler
                .ensure_compiled(start_phys, cpu.pc, &mut source)
            {
                EnsureResult::Compiled => {
                    self.hot_counts.remove(&start_phys);
                }
                EnsureResult::CacheHit => {}
                EnsureResult::CompileFailed => {
                    if let Some(err) = self.recompiler.last_error() {
                        log::debug!(
                            "block compile failed at {:#010X} (backend={}): {}",
                            start_phys,
                            self.recompiler.backend_name(),
                            err
                        );
                    }
                    return self.run_fallback(cpu, bus, FallbackReason::NoBlock);
                }
            }
        }

        let retired = self.run_chain(cpu, bus, start_phys, budget)?;
        if retired == 0 {
            return self.run_fallback(cpu, bus, FallbackReason::NoBlock);
        }
        Ok(retired)
    }

    fn invalidate_range(&mut self, start: u32, len: u32) {
        if len == 0 {
            return;
        }
        self.recompiler.invalidate_range(start, len);
        let end = start.saturating_add(len);
        self.hot_counts.retain(|&phys, _| phys < start || phys >= end);
        self.runtime.invalidate_calls = self.runtime.invalidate_calls.wrapping_add(1);
        self.runtime.invalidate_bytes = self.runtime.invalidate_bytes.wrapping_add(u64::from(len));
    }

    fn name(&self) -> &'static str {
        self.recompiler.backend_name()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn engine(hot_threshold: u32) -> RecompilerEngine {
        RecompilerEngine::new(DynarecSettings {
            enabled: true,
            hot_threshold,
            max_block_instructions: 16,
            chain_limit: 0,
        })
    }

    #[test]
    fn hot_counts_stay_bounded() {
        let mut rc = engine(u32::MAX);
        for i in 0..(HOT_COUNT_LIMIT as u32 + 100) {
            assert!(!rc.should_attempt_compile(i * 4));
        }
        assert!(rc.stats().hot_entries <= HOT_COUNT_LIMIT);
    }

    #[test]
    fn invalidation_forgets_counts_in_range() {
        let mut rc = engine(3);
        for phys in [0x100, 0x200, 0x300] {
            rc.should_attempt_compile(phys);
            rc.should_attempt_compile(phys);
        }
        rc.invalidate_range(0x200, 4);
        assert_eq!(rc.stats().hot_entries, 2);
        assert!(rc.should_attempt_compile(0x100));
        assert!(!rc.should_attempt_compile(0x200));
    }
}
