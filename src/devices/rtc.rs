//! Real-time clock: a 20ms tick source with a programmable countdown,
//! raising level 13 on expiry.
//!
//! Grounded on `deviceRTC.c`: a down-counter reloaded from a constant
//! "adjusted for stability", a status/control register pair, and an
//! IDENT that reloads the counter and clears its own IE/pending bit.

use crate::bus::SystemBus;
use crate::device::{Device, InterruptBits};
use crate::error::DeviceError;
use log::trace;

/// Ticks per 20ms quantum. The original names this constant and notes
/// it was "adjusted for stability" rather than derived from a clean
/// divisor of the host tick rate; kept as a named constant per that
/// note rather than inlined.
pub const TICKS_20MS: u16 = 10550;

struct Table {
    start_addr: u16,
    ident_code: u8,
    logical_device: u8,
}

const TABLE: [Table; 3] = [
    Table { start_addr: 0o10, ident_code: 1, logical_device: 1 },
    Table { start_addr: 0o14, ident_code: 2, logical_device: 2 },
    Table { start_addr: 0o20, ident_code: 6, logical_device: 3 },
];

const INTERRUPT_LEVEL: u8 = 13;

mod status {
    pub const IE: u16 = 1 << 0;
    pub const EXT_HOLD_PULSE: u16 = 1 << 1;
    pub const RFT: u16 = 1 << 15;
}

mod control {
    pub const IE: u16 = 1 << 0;
    pub const CLEAR_RFT: u16 = 1 << 1;
    pub const CLEAR_EXT_HOLD: u16 = 1 << 2;
    pub const RESTART: u16 = 1 << 3;
}

pub struct RtcDevice {
    name: String,
    start_addr: u16,
    ident_code: u8,
    counter: u16,
    status: u16,
    control: u16,
    interrupt_bits: InterruptBits,
}

impl RtcDevice {
    pub fn new(thumbwheel: u8) -> Result<Self, DeviceError> {
        let entry = TABLE
            .get(thumbwheel as usize)
            .ok_or(DeviceError::UnknownThumbwheel {
                device_type: "RTC",
                thumbwheel,
            })?;
        Ok(Self {
            name: format!("RTC {}", entry.logical_device),
            start_addr: entry.start_addr,
            ident_code: entry.ident_code,
            counter: TICKS_20MS,
            status: 0,
            control: 0,
            interrupt_bits: InterruptBits::default(),
        })
    }
}

impl Device for RtcDevice {
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
        crate::device::DeviceClass::RealTimeClock
    }

    fn interrupt_bits(&self) -> InterruptBits {
        self.interrupt_bits
    }

    fn reset(&mut self) {
        self.counter = TICKS_20MS;
        self.status = 0;
        self.control = 0;
        self.interrupt_bits = InterruptBits::default();
    }

    fn tick(&mut self, _bus: &mut dyn SystemBus) {
        if self.counter == 0 {
            self.counter = TICKS_20MS;
        }
        self.counter -= 1;
        if self.counter == 0 {
            self.status |= status::RFT;
            self.counter = TICKS_20MS;
            if self.control & control::IE != 0 {
                trace!("{}: countdown expired, raising level {}", self.name, INTERRUPT_LEVEL);
                self.interrupt_bits.set(INTERRUPT_LEVEL);
            }
        }
    }

    fn read(&mut self, addr: u16) -> u16 {
        match self.register_address(addr) {
            0 => self.counter,
            1 => self.status,
            _ => 0,
        }
    }

    fn write(&mut self, addr: u16, value: u16, _bus: &mut dyn SystemBus) {
        match self.register_address(addr) {
            1 => {
                // "clear counter": reload, clear RFT and the pending interrupt.
                self.counter = TICKS_20MS;
                self.status &= !status::RFT;
                self.interrupt_bits.clear(INTERRUPT_LEVEL);
            }
            2 => {
                self.control = value;
                if value & control::IE != 0 {
                    self.status |= status::IE;
                } else {
                    self.status &= !status::IE;
                }
                if value & control::CLEAR_RFT != 0 {
                    self.status &= !status::RFT;
                    self.interrupt_bits.clear(INTERRUPT_LEVEL);
                }
                if value & control::RESTART != 0 {
                    self.counter = TICKS_20MS;
                }
                if value & control::CLEAR_EXT_HOLD != 0 {
                    self.status &= !status::EXT_HOLD_PULSE;
                }
            }
            _ => {}
        }
    }

    fn ident(&mut self, level: u8) -> Option<u8> {
        if level == INTERRUPT_LEVEL && self.interrupt_bits.is_set(level) {
            self.counter = TICKS_20MS;
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

    #[test]
    fn unknown_thumbwheel_is_rejected() {
        assert!(RtcDevice::new(9).is_err());
    }

    #[test]
    fn counts_down_and_raises_level_13_then_rearms() {
        let mut bus = FlatMemory::new(1);
        let mut rtc = RtcDevice::new(0).unwrap();
        rtc.write(rtc.start_addr() + 2, control::IE, &mut bus);

        for _ in 0..TICKS_20MS {
            rtc.tick(&mut bus);
        }
        assert!(rtc.interrupt_bits().is_set(13));

        let code = rtc.ident(13);
        assert_eq!(code, Some(1));
        assert!(!rtc.interrupt_bits().is_set(13));

        rtc.tick(&mut bus);
        assert!(!rtc.interrupt_bits().is_set(13));
    }

    #[test]
    fn three_instances_have_distinct_addresses_and_idents() {
        let a = RtcDevice::new(0).unwrap();
        let b = RtcDevice::new(1).unwrap();
        let c = RtcDevice::new(2).unwrap();
        assert_eq!((a.start_addr(), a.ident_code()), (0o10, 1));
        assert_eq!((b.start_addr(), b.ident_code()), (0o14, 2));
        assert_eq!((c.start_addr(), c.ident_code()), (0o20, 6));
    }
}
