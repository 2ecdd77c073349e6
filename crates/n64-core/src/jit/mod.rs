use crate::bus::{Bus, BusError};
use crate::config::{DynarecSettings, EmulatorConfig};
use crate::cpu::Vr4300;

mod dynarec;

pub use dynarec::{DynarecRuntimeStats, DynarecStats, RecompilerEngine};

/// Execution engine abstraction.
///
/// The interpreter is always available. `Engine` can also run the dynamic
/// recompilation pipeline, which falls back to the interpreter whenever a
/// block cannot be used.
pub trait ExecutionEngine {
    /// Execute one unit of work and return the instructions retired.
    /// Interpreter: one instruction. Recompiler: one block chain.
    fn execute(&mut self, cpu: &mut Vr4300, bus: &impl Bus) -> Result<u64, BusError>;

    /// Like [`execute`](Self::execute), but no further block is chained
    /// once `budget` instructions have retired. One block may still run
    /// past it.
    fn execute_within(
        &mut self,
        cpu: &mut Vr4300,
        bus: &impl Bus,
        _budget: u64,
    ) -> Result<u64, BusError> {
        self.execute(cpu, bus)
    }

    /// Invalidate any compiled code covering [start, start+len) in
    /// physical RDRAM. Called when memory writes may have modified code.
    fn invalidate_range(&mut self, start: u32, len: u32);

    fn name(&self) -> &'static str;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct Interpreter;

impl ExecutionEngine for Interpreter {
    fn execute(&mut self, cpu: &mut Vr4300, bus: &impl Bus) -> Result<u64, BusError> {
        cpu.step(bus)
    }

    fn invalidate_range(&mut self, _start: u32, _len: u32) {}

    fn name(&self) -> &'static str {
        "interpreter"
    }
}

/// Runtime-selected execution engine.
pub enum Engine {
    Interpreter(Interpreter),
    Recompiler(Box<RecompilerEngine>),
}

impl Engine {
    pub fn interpreter() -> Self {
        Self::Interpreter(Interpreter)
    }

    pub fn recompiler(settings: DynarecSettings) -> Self {
        Self::Recompiler(Box::new(RecompilerEngine::new(settings)))
    }

    pub fn from_config(config: &EmulatorConfig) -> Self {
        if config.dynarec.enabled {
            Self::recompiler(config.dynarec)
        } else {
            Self::interpreter()
        }
    }

    /// Build engine from environment (`N64_DYNAREC` and friends).
    pub fn from_env() -> Self {
        Self::from_config(&EmulatorConfig::from_env())
    }

    pub fn uses_recompiler(&self) -> bool {
        matches!(self, Engine::Recompiler(_))
    }

    pub fn execute(&mut self, cpu: &mut Vr4300, bus: &impl Bus) -> Result<u64, BusError> {
        match self {
            Engine::Interpreter(engine) => engine.execute(cpu, bus),
            Engine::Recompiler(engine) => engine.execute(cpu, bus),
        }
    }

    pub fn execute_within(
        &mut self,
        cpu: &mut Vr4300,
        bus: &impl Bus,
        budget: u64,
    ) -> Result<u64, BusError> {
        match self {
            Engine::Interpreter(engine) => engine.execute_within(cpu, bus, budget),
            Engine::Recompiler(engine) => engine.execute_within(cpu, bus, budget),
        }
    }

    pub fn invalidate_range(&mut self, start: u32, len: u32) {
        match self {
            Engine::Interpreter(engine) => engine.invalidate_range(start, len),
            Engine::Recompiler(engine) => engine.invalidate_range(start, len),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Engine::Interpreter(engine) => engine.name(),
            Engine::Recompiler(engine) => engine.name(),
        }
    }

    pub fn dynarec_stats_line(&self) -> Option<String> {
        match self {
            Engine::Interpreter(_) => None,
            Engine::Recompiler(engine) => Some(engine.stats_line()),
        }
    }

    pub fn dynarec_stats(&self) -> Option<DynarecStats> {
        match self {
            Engine::Interpreter(_) => None,
            Engine::Recompiler(engine) => Some(engine.stats()),
        }
    }

    pub fn reset_stats(&mut self) {
        match self {
            Engine::Interpreter(_) => {}
            Engine::Recompiler(engine) => engine.reset_stats(),
        }
    }

    #[cfg(test)]
    pub(crate) fn recompiler_for_tests() -> Self {
        Self::recompiler(DynarecSettings {
            enabled: true,
            hot_threshold: 1,
            max_block_instructions: 256,
            chain_limit: 2,
        })
    }
}
