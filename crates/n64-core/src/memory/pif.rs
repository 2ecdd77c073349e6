/// PIF (Peripheral Interface): handles boot ROM and controller communication.
///
/// Boot ROM: 1984 bytes at physical 0x1FC0_0000 (read-only)
/// PIF RAM:  64 bytes at physical 0x1FC0_07C0 (controller/EEPROM commands)
///
/// PIF RAM format for controller I/O:
///   Sequence of command blocks, each: [tx_len, rx_len, tx_data..., rx_data...]
///   Byte 63 (0x3F) is the PIF control byte.
///   tx_len = 0xFE ends the scan; 0x00 and 0xFF skip a channel.
///
/// Commands run as soon as a write covers the control byte, which is the
/// last byte an SI WR64B DMA stores.
use std::sync::Arc;

use parking_lot::Mutex;

use super::joybus::{Buttons, JoyController};
use crate::bus::{BusError, Device, DmaPort};

pub const PIF_ROM_SIZE: usize = 0x7C0;
pub const PIF_RAM_SIZE: usize = 0x40;
/// Physical address of PIF RAM.
pub const PIF_RAM_ADDR: u32 = 0x1FC0_07C0;
/// Device offset of the control byte.
const CONTROL_OFFSET: u32 = (PIF_ROM_SIZE + PIF_RAM_SIZE - 1) as u32;
const CONTROL: usize = PIF_RAM_SIZE - 1;

/// Control byte bits.
pub mod command {
    pub const JOYBUS: u8 = 0x01;
    pub const CHALLENGE: u8 = 0x02;
    pub const ALLOW_NORMAL_OPERATION: u8 = 0x08;
    pub const DISABLE_ROM: u8 = 0x10;
    pub const CHECKSUM_VERIFY: u8 = 0x20;
    pub const CLEAR_RAM: u8 = 0x40;
    pub const CHECKSUM_ACCEPTED: u8 = 0x80;
}

/// JoyBus command codes (first payload byte).
mod joy {
    pub const INFO: u8 = 0x00;
    pub const CONTROLLER_STATE: u8 = 0x01;
    pub const EEPROM_READ: u8 = 0x04;
    pub const EEPROM_WRITE: u8 = 0x05;
    pub const RESET: u8 = 0xFF;
}

/// Number of JoyBus channels: four controller ports plus the cartridge.
pub const JOYBUS_CHANNELS: usize = 5;

struct PifState {
    rom: Vec<u8>,
    ram: [u8; PIF_RAM_SIZE],
    rom_disabled: bool,
}

pub struct Pif {
    state: Mutex<PifState>,
    controllers: [Arc<JoyController>; 4],
}

impl Default for Pif {
    fn default() -> Self {
        Self::new()
    }
}

impl Pif {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(PifState {
                rom: vec![0u8; PIF_ROM_SIZE],
                ram: [0u8; PIF_RAM_SIZE],
                rom_disabled: false,
            }),
            controllers: std::array::from_fn(|_| Arc::new(JoyController::new())),
        }
    }

    /// Install a boot ROM image. Extra bytes are ignored.
    pub fn load_rom(&self, bytes: &[u8]) {
        let mut state = self.state.lock();
        let n = bytes.len().min(PIF_ROM_SIZE);
        state.rom[..n].copy_from_slice(&bytes[..n]);
        state.rom[n..].fill(0);
        state.rom_disabled = false;
    }

    pub fn controller(&self, slot: usize) -> Option<Arc<JoyController>> {
        self.controllers.get(slot).cloned()
    }

    pub fn ram(&self) -> [u8; PIF_RAM_SIZE] {
        self.state.lock().ram
    }

    pub fn rom_disabled(&self) -> bool {
        self.state.lock().rom_disabled
    }

    fn process_commands(&self) {
        let mut state = self.state.lock();
        let cmd = state.ram[CONTROL];
        log::trace!("PIF command byte {:#04X}", cmd);

        if cmd & command::JOYBUS != 0 {
            self.joybus_scan(&mut state.ram);
        }
        if cmd & command::CHALLENGE != 0 {
            log::debug!("PIF: challenge request ignored");
        }
        if cmd & command::DISABLE_ROM != 0 {
            log::debug!("PIF: boot ROM access disabled");
            state.rom_disabled = true;
        }
        if cmd & command::CLEAR_RAM != 0 {
            state.ram[..CONTROL].fill(0);
        }
        let accepted = cmd & (command::CHECKSUM_VERIFY | command::CHECKSUM_ACCEPTED) != 0;
        state.ram[CONTROL] = if accepted { command::CHECKSUM_ACCEPTED } else { 0 };
    }

    /// Walk the command blocks in PIF RAM, answering each in place.
    fn joybus_scan(&self, ram: &mut [u8; PIF_RAM_SIZE]) {
        let mut i = 0usize;
        let mut channel = 0usize;

        while i < CONTROL && channel < JOYBUS_CHANNELS {
            let tx_len = ram[i];
            match tx_len {
                0xFE => break,
                0x00 | 0xFF => {
                    i += 1;
                    channel += 1;
                    continue;
                }
                _ => {}
            }

            if i + 1 >= CONTROL {
                break;
            }
            let rx_len = ram[i + 1];
            if rx_len == 0xFE {
                break;
            }
            let tx = (tx_len & 0x3F) as usize;
            let rx = (rx_len & 0x3F) as usize;
            let payload = i + 2;
            let response = payload + tx;
            if response + rx > CONTROL {
                break;
            }

            if tx > 0 {
                let (head, tail) = ram.split_at_mut(response);
                self.dispatch(channel, &head[payload..], &mut tail[..rx]);
            }

            i += tx + rx + 2;
            channel += 1;
        }
    }

    fn dispatch(&self, channel: usize, payload: &[u8], response: &mut [u8]) {
        let mut answer = |bytes: &[u8]| {
            let n = bytes.len().min(response.len());
            response[..n].copy_from_slice(&bytes[..n]);
        };
        match payload[0] {
            joy::INFO | joy::RESET => match channel {
                0 => answer(&[0x05, 0x00, 0x02]),
                1..=3 => answer(&[0xFF, 0xFF, 0xFF]),
                _ => answer(&[0x00, 0x80, 0x00]),
            },
            joy::CONTROLLER_STATE => {
                if let Some(pad) = self.controllers.get(channel) {
                    let buttons: Buttons = pad.take();
                    let (x, y) = buttons.stick();
                    let [hi, lo] = buttons.bits().to_be_bytes();
                    answer(&[hi, lo, x as u8, y as u8]);
                }
            }
            joy::EEPROM_READ | joy::EEPROM_WRITE => {
                log::trace!("PIF: EEPROM command {:#04X} on channel {}", payload[0], channel);
            }
            other => {
                log::warn!("PIF: unknown JoyBus command {:#04X} on channel {}", other, channel);
            }
        }
    }
}

impl Device for Pif {
    fn name(&self) -> &'static str {
        "PIF"
    }

    fn read(&self, offset: u32, buf: &mut [u8]) -> Result<(), BusError> {
        let state = self.state.lock();
        for (i, byte) in buf.iter_mut().enumerate() {
            let at = offset as usize + i;
            *byte = if at < PIF_ROM_SIZE {
                if state.rom_disabled {
                    0
                } else {
                    state.rom[at]
                }
            } else if at < PIF_ROM_SIZE + PIF_RAM_SIZE {
                state.ram[at - PIF_ROM_SIZE]
            } else {
                0
            };
        }
        Ok(())
    }

    fn write(&self, offset: u32, data: &[u8]) -> Result<(), BusError> {
        let mut state = self.state.lock();
        for (i, byte) in data.iter().enumerate() {
            let at = offset as usize + i;
            if at < PIF_ROM_SIZE {
                log::warn!("PIF: write to boot ROM at {:#06X} dropped", at);
            } else if at < PIF_ROM_SIZE + PIF_RAM_SIZE {
                state.ram[at - PIF_ROM_SIZE] = *byte;
            }
        }
        Ok(())
    }

    fn post_write(&self, offset: u32, len: u32, _dma: &dyn DmaPort) -> Result<(), BusError> {
        if offset <= CONTROL_OFFSET && CONTROL_OFFSET < offset.saturating_add(len) {
            self.process_commands();
        }
        Ok(())
    }
}
