//! Paper-tape reader: a streamed byte source with a minimal four-
//! register interface, raising level 12.
//!
//! Grounded on `devicePapertape.c`.

use crate::bus::SystemBus;
use crate::device::{Device, InterruptBits};
use crate::error::DeviceError;
use std::io::Read;

const INTERRUPT_LEVEL: u8 = 12;

struct Table {
    start_addr: u16,
    ident_code: u8,
}

const TABLE: [Table; 2] = [
    Table { start_addr: 0o400, ident_code: 0o02 },
    Table { start_addr: 0o404, ident_code: 0o22 },
];

mod status {
    pub const IE: u16 = 1 << 0;
    pub const READ_ACTIVE: u16 = 1 << 1;
    pub const RFT: u16 = 1 << 7;
}

mod control {
    pub const IE: u16 = 1 << 0;
    pub const READ_ACTIVE: u16 = 1 << 1;
    pub const DEVICE_CLEAR: u16 = 1 << 3;
}

pub struct PaperTapeDevice {
    name: String,
    start_addr: u16,
    ident_code: u8,
    character_buffer: u8,
    status: u16,
    control: u16,
    interrupt_bits: InterruptBits,
    stream: Option<Box<dyn Read>>,
}

impl PaperTapeDevice {
    pub fn new(thumbwheel: u8) -> Result<Self, DeviceError> {
        let entry = TABLE
            .get(thumbwheel as usize)
            .ok_or(DeviceError::UnknownThumbwheel {
                device_type: "PAPER_TAPE",
                thumbwheel,
            })?;
        Ok(Self {
            name: format!("Paper Tape {}", thumbwheel),
            start_addr: entry.start_addr,
            ident_code: entry.ident_code,
            character_buffer: 0,
            status: 0,
            control: 0,
            interrupt_bits: InterruptBits::default(),
            stream: None,
        })
    }

    pub fn attach_stream(&mut self, stream: Box<dyn Read>) {
        self.stream = Some(stream);
    }

    /// Keeps the interrupt line synchronized with the current IE/RFT
    /// state, raising it on IE && RFT and lowering it otherwise so a
    /// stale interrupt doesn't survive a device_clear or IE going low.
    fn sync_interrupt_level(&mut self) {
        if self.status & status::IE != 0 && self.status & status::RFT != 0 {
            self.interrupt_bits.set(INTERRUPT_LEVEL);
        } else {
            self.interrupt_bits.clear(INTERRUPT_LEVEL);
        }
    }
}

impl Device for PaperTapeDevice {
    fn name(&self) -> &str {
        &self.name
    }

    fn start_addr(&self) -> u16 {
        self.start_addr
    }

    fn end_addr(&self) -> u16 {
        self.start_addr + 3
    }

    fn ident_code(&self) -> u8 {
        self.ident_code
    }

    fn interrupt_level(&self) -> u8 {
        INTERRUPT_LEVEL
    }

    fn device_class(&self) -> crate::device::DeviceClass {
        crate::device::DeviceClass::CharacterStream
    }

    fn interrupt_bits(&self) -> InterruptBits {
        self.interrupt_bits
    }

    fn reset(&mut self) {
        self.character_buffer = 0;
        self.status = 0;
        self.control = 0;
        self.interrupt_bits = InterruptBits::default();
    }

    fn tick(&mut self, _bus: &mut dyn SystemBus) {}

    fn read(&mut self, addr: u16) -> u16 {
        match self.register_address(addr) {
            0 => {
                let value = self.character_buffer as u16;
                self.status &= !status::RFT;
                value
            }
            2 => self.status,
            _ => 0,
        }
    }

    fn write(&mut self, addr: u16, value: u16, _bus: &mut dyn SystemBus) {
        match self.register_address(addr) {
            3 => {
                self.control = value;
                self.status = (self.status & !status::IE)
                    | if value & control::IE != 0 { status::IE } else { 0 };

                if value & control::DEVICE_CLEAR != 0 {
                    self.character_buffer = 0;
                    self.status = 0;
                }

                self.sync_interrupt_level();

                if value & control::READ_ACTIVE != 0 {
                    let mut byte = [0u8; 1];
                    let read_ok = self
                        .stream
                        .as_mut()
                        .map(|s| s.read_exact(&mut byte).is_ok())
                        .unwrap_or(false);
                    if read_ok {
                        self.character_buffer = byte[0];
                        self.status |= status::RFT;
                    }
                    self.control &= !control::READ_ACTIVE;
                }

                self.sync_interrupt_level();
            }
            _ => {}
        }
    }

    fn ident(&mut self, level: u8) -> Option<u8> {
        if level == INTERRUPT_LEVEL && self.interrupt_bits.is_set(level) {
            self.status &= !status::IE;
            self.interrupt_bits.clear(level);
            Some(self.ident_code)
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_log::test;
    use crate::bus::FlatMemory;
    use std::io::Cursor;

    #[test]
    fn reads_bytes_until_stream_exhausted() {
        let mut bus = FlatMemory::new(1);
        let mut tape = PaperTapeDevice::new(0).unwrap();
        tape.attach_stream(Box::new(Cursor::new(vec![0x12, 0x34])));

        tape.write(tape.start_addr() + 3, control::IE | control::READ_ACTIVE, &mut bus);
        assert_ne!(tape.read(tape.start_addr() + 2), 0);
        assert_eq!(tape.read(tape.start_addr()), 0x12);
        assert_eq!(tape.read(tape.start_addr() + 2) & status::RFT, 0);

        tape.write(tape.start_addr() + 3, control::IE | control::READ_ACTIVE, &mut bus);
        assert_eq!(tape.read(tape.start_addr()), 0x34);

        tape.write(tape.start_addr() + 3, control::IE | control::READ_ACTIVE, &mut bus);
        assert_eq!(tape.read(tape.start_addr() + 2) & status::RFT, 0);
    }
}
