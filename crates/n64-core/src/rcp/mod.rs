pub mod ai;
pub mod mi;
pub mod peripheral;
pub mod pi;
pub mod si;
pub mod sp;
pub mod vi;

pub use mi::{Mi, MiInterrupt};
pub use peripheral::{RegisterFile, RegisterMap};
