pub mod bus;
pub mod cart;
pub mod config;
pub mod cpu;
pub mod debug;
pub mod jit;
pub mod memory;
pub mod n64;
pub mod rcp;

pub use config::{BootMode, EmulatorConfig};
pub use n64::{N64Error, RunOutcome, StopHandle, N64};
