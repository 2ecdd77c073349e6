/// Controller state shared between the input thread and the PIF.
///
/// The host ORs button presses in with `append`; the next ControllerState
/// JoyBus command reads the accumulated mask and clears it, so a press
/// shorter than one poll is still seen once.
use std::ops::{BitOr, BitOrAssign};

use parking_lot::Mutex;

/// Standard controller button mask, in JoyBus wire order.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct Buttons(pub u16);

impl Buttons {
    pub const NONE: Buttons = Buttons(0);
    pub const C_RIGHT: Buttons = Buttons(0x0001);
    pub const C_LEFT: Buttons = Buttons(0x0002);
    pub const C_DOWN: Buttons = Buttons(0x0004);
    pub const C_UP: Buttons = Buttons(0x0008);
    pub const L: Buttons = Buttons(0x0010);
    pub const R: Buttons = Buttons(0x0020);
    pub const ANALOG_RIGHT: Buttons = Buttons(0x0100);
    pub const ANALOG_LEFT: Buttons = Buttons(0x0200);
    pub const ANALOG_DOWN: Buttons = Buttons(0x0400);
    pub const ANALOG_UP: Buttons = Buttons(0x0800);
    pub const START: Buttons = Buttons(0x1000);
    pub const Z: Buttons = Buttons(0x2000);
    pub const B: Buttons = Buttons(0x4000);
    pub const A: Buttons = Buttons(0x8000);

    /// Full-deflection stick value.
    pub const STICK_MAX: i8 = 50;

    pub fn contains(self, other: Buttons) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn bits(self) -> u16 {
        self.0
    }

    /// Stick X/Y implied by the analog direction bits.
    pub fn stick(self) -> (i8, i8) {
        let axis = |pos: Buttons, neg: Buttons| {
            if self.contains(pos) {
                Self::STICK_MAX
            } else if self.contains(neg) {
                -Self::STICK_MAX
            } else {
                0
            }
        };
        (
            axis(Buttons::ANALOG_RIGHT, Buttons::ANALOG_LEFT),
            axis(Buttons::ANALOG_UP, Buttons::ANALOG_DOWN),
        )
    }
}

impl BitOr for Buttons {
    type Output = Buttons;

    fn bitor(self, rhs: Buttons) -> Buttons {
        Buttons(self.0 | rhs.0)
    }
}

impl BitOrAssign for Buttons {
    fn bitor_assign(&mut self, rhs: Buttons) {
        self.0 |= rhs.0;
    }
}

#[derive(Debug, Default)]
pub struct JoyController {
    state: Mutex<(Buttons, bool)>,
}

impl JoyController {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn append(&self, buttons: Buttons) {
        let mut state = self.state.lock();
        state.0 |= buttons;
        state.1 = true;
    }

    pub fn is_pending(&self) -> bool {
        self.state.lock().1
    }

    /// Read and clear the accumulated mask.
    pub fn take(&self) -> Buttons {
        let mut state = self.state.lock();
        let buttons = state.0;
        *state = (Buttons::NONE, false);
        buttons
    }
}
