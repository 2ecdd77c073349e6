use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::bus::map::Interconnect;
use crate::bus::BusError;
use crate::cart::rom::RomError;
use crate::cart::{cic, Cartridge};
use crate::config::{BootMode, EmulatorConfig};
use crate::cpu::cop0::Cop0;
use crate::cpu::Vr4300;
use crate::debug::TraceLog;
use crate::jit::Engine;
use crate::memory::joybus::JoyController;
use crate::rcp::mi::MI_VERSION_RETAIL;

/// IPL3 starts here, in SP DMEM.
const IPL3_ENTRY: u64 = 0xFFFF_FFFF_A400_0040;
/// The IPL3 copies this much game code before jumping to the entry point.
const BOOT_COPY_LIMIT: usize = 0x10_0000;
/// RDRAM word where IPL3 leaves the installed memory size (osMemSize).
const OS_MEM_SIZE: usize = 0x318;

#[derive(Debug, thiserror::Error)]
pub enum N64Error {
    #[error("ROM error: {0}")]
    Rom(#[from] RomError),
    #[error("bus error: {0}")]
    Bus(#[from] BusError),
    #[error("PIF boot requested but no PIF ROM was loaded")]
    MissingPifRom,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    /// The host raised the stop flag.
    Stopped,
}

/// Host-side stop request, shareable across threads.
#[derive(Debug, Clone, Default)]
pub struct StopHandle(Arc<AtomicBool>);

impl StopHandle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn raise(&self) {
        self.0.store(true, Ordering::Release);
    }

    pub fn is_raised(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

/// The top-level N64 system.
///
/// Owns the CPU, bus (with all hardware components), and execution engine.
pub struct N64 {
    pub cpu: Vr4300,
    pub bus: Interconnect,
    engine: Engine,
    pub cycles: u64,
    config: EmulatorConfig,
    pif_rom_loaded: bool,
}

impl N64 {
    /// Load a ROM from disk and boot it with the environment's configuration.
    pub fn new(rom_path: &Path) -> Result<Self, N64Error> {
        let cart = Cartridge::load(rom_path)?;
        Self::with_config(cart, EmulatorConfig::from_env())
    }

    pub fn from_rom_bytes(bytes: Vec<u8>) -> Result<Self, N64Error> {
        let cart = Cartridge::from_bytes(bytes)?;
        Self::with_config(cart, EmulatorConfig::from_env())
    }

    pub fn with_config(cart: Cartridge, config: EmulatorConfig) -> Result<Self, N64Error> {
        let bus = Interconnect::new(cart, config.rdram_size)?;
        let engine = Engine::from_config(&config);
        bus.set_code_watch(engine.uses_recompiler());

        let mut cpu = Vr4300::new();
        cpu.trace = TraceLog::new(config.trace_depth);

        let mut n64 = Self {
            cpu,
            bus,
            engine,
            cycles: 0,
            config,
            pif_rom_loaded: false,
        };
        n64.boot()?;
        log::info!(
            "N64 ready: {:?} boot at {:#018X}, {} engine, {} MiB RDRAM",
            n64.config.boot,
            n64.cpu.pc,
            n64.engine.name(),
            n64.config.rdram_size >> 20
        );
        Ok(n64)
    }

    pub fn config(&self) -> &EmulatorConfig {
        &self.config
    }

    pub fn engine(&self) -> &Engine {
        &self.engine
    }

    /// Install the PIF boot ROM. Required before ticking a `PifRom` boot.
    pub fn load_pif_rom(&mut self, bytes: &[u8]) {
        self.bus.pif.load_rom(bytes);
        self.pif_rom_loaded = true;
        log::info!("PIF ROM loaded ({} bytes)", bytes.len());
    }

    pub fn controller(&self, slot: usize) -> Option<Arc<JoyController>> {
        self.bus.pif.controller(slot)
    }

    fn boot(&mut self) -> Result<(), N64Error> {
        if self.config.boot == BootMode::PifRom {
            self.cpu.set_pc(crate::cpu::cop0::RESET_VECTOR);
            return Ok(());
        }
        self.boot_hle()?;
        if self.config.boot == BootMode::Direct {
            self.boot_direct();
        }
        Ok(())
    }

    /// Recreate the state the PIF leaves for IPL3.
    fn boot_hle(&mut self) -> Result<(), N64Error> {
        let header = self.bus.cart.header();
        let (variant, tv) = (self.bus.cart.cic(), header.tv_type);

        let regs = &mut self.cpu.cop0.regs;
        regs[Cop0::COUNT] = 0x5000;
        regs[Cop0::CONFIG] = 0x0006_E463;
        regs[Cop0::EPC] = 0xFFFF_FFFF;
        regs[Cop0::ERROR_EPC] = 0xFFFF_FFFF;
        regs[Cop0::CONTEXT] = 0x007F_FFF0;
        self.cpu.cop0.load_cause(0xB000_007C);
        self.cpu.write_status(0x3400_0000);

        self.bus.mi.set_version(MI_VERSION_RETAIL);
        self.bus.sp.halt();

        let data = self.bus.cart.data();
        let boot_len = data.len().min(cic::IPL3_END);
        self.bus.sp.load(0, &data[..boot_len])?;
        if variant == cic::CicVariant::X105 {
            let ipl2: Vec<u8> = cic::X105_IPL2
                .iter()
                .flat_map(|word| word.to_be_bytes())
                .collect();
            self.bus.sp.load(0x1000, &ipl2)?;
        }

        cic::apply_initial_regs(variant, tv, &mut self.cpu.gpr);
        self.cpu.set_pc(IPL3_ENTRY);
        log::info!("HLE boot: {} ({:?})", variant, tv);
        Ok(())
    }

    /// Do the IPL3's copy ourselves and enter the game directly.
    fn boot_direct(&mut self) {
        let entry = self.bus.cart.header().entry_point;
        let data = self.bus.cart.data();
        let game = data.get(cic::IPL3_END..).unwrap_or(&[]);
        let game = &game[..game.len().min(BOOT_COPY_LIMIT)];
        let dest = (entry & 0x1FFF_FFFF) as usize;
        self.bus.rdram.load(dest, game);
        self.bus
            .rdram
            .write_u32(OS_MEM_SIZE, self.config.rdram_size as u32);
        self.cpu.set_pc(entry as i32 as i64 as u64);
        log::info!(
            "direct boot: copied {:#X} bytes to RDRAM[{:#010X}]",
            game.len(),
            dest
        );
    }

    /// Run one engine step and let the devices catch up. Returns the
    /// cycles consumed.
    pub fn tick(&mut self) -> Result<u64, N64Error> {
        if self.config.boot == BootMode::PifRom && !self.pif_rom_loaded {
            return Err(N64Error::MissingPifRom);
        }
        // Chained blocks stop at the next VI line so its interrupt is seen
        // at a block boundary near where the interpreter would take it.
        let budget = self.bus.vi.cycles_to_next_line();
        let elapsed = self
            .engine
            .execute_within(&mut self.cpu, &self.bus, budget)?;
        self.cycles += elapsed;
        self.bus.vi.advance(elapsed);
        self.cpu
            .cop0
            .set_interrupt_line(2, self.bus.mi.interrupt_pending());
        Ok(elapsed)
    }

    /// Tick until `stop` is raised. The flag is checked between ticks.
    pub fn run(&mut self, stop: &StopHandle) -> Result<RunOutcome, N64Error> {
        while !stop.is_raised() {
            self.tick()?;
        }
        log::info!("stopped after {} cycles", self.cycles);
        if let Some(line) = self.engine.dynarec_stats_line() {
            log::info!("{}", line);
        }
        Ok(RunOutcome::Stopped)
    }

    /// Run `ticks` ticks. Returns the cycles consumed.
    pub fn run_for(&mut self, ticks: u64) -> Result<u64, N64Error> {
        let start = self.cycles;
        for _ in 0..ticks {
            self.tick()?;
        }
        Ok(self.cycles - start)
    }
}
