pub mod cop0;
pub mod cop1;
pub mod exceptions;
pub mod execute;
pub mod instruction;
pub mod tlb;
pub mod vr4300;

pub use vr4300::{Access, Vr4300};
