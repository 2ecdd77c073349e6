pub mod joybus;
pub mod pif;
pub mod rdram;
pub mod register;

pub use joybus::{Buttons, JoyController};
pub use pif::Pif;
pub use rdram::Rdram;
