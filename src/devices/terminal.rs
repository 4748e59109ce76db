//! Character terminal: a circular keystroke queue feeding a UART-style
//! input register, and a write-side that hands bytes to a host
//! callback (or, absent one, the host's standard output).
//!
//! Grounded on `deviceTerminal.c`. The 52-entry thumbwheel table is
//! reproduced verbatim; thumbwheel 0 and 1 both resolve to table index
//! 0 (the console) per the original factory's `if (thumbwheel > 0)
//! thumbwheel--;` pre-decrement, which is kept rather than "fixed"
//! since it is observable behaviour of the machines this emulates.

use crate::bus::SystemBus;
use crate::device::{Device, InterruptBits, IoDelay};
use crate::error::DeviceError;
use crate::parity::odd_parity;
use log::trace;
use std::collections::VecDeque;
use std::io::Write as _;

const QUEUE_CAPACITY: usize = 256;
const MAX_TICKS: u32 = 100;
const IODELAY_TERMINAL: u32 = 100;
const OUTPUT_LEVEL: u8 = 10;
const INPUT_LEVEL: u8 = 12;

struct TableEntry {
    start_addr: u16,
    ident_code: u8,
    logical_device: u16,
    label: &'static str,
}

macro_rules! e {
    ($addr:expr, $ident:expr, $logical:expr, $label:expr) => {
        TableEntry {
            start_addr: $addr,
            ident_code: $ident,
            logical_device: $logical,
            label: $label,
        }
    };
}

#[rustfmt::skip]
const TABLE: [TableEntry; 52] = [
    e!(0o300,  0o01,  1,    "CONSOLE TERMINAL - TERMINAL 1"),
    e!(0o310,  0o05,  11,   "TERMINAL 2/ TET15"),
    e!(0o320,  0o06,  42,   "TERMINAL 3/ TET14"),
    e!(0o330,  0o07,  43,   "TERMINAL 4/ TET15"),
    e!(0o340,  0o44,  44,   "TERMINAL 5/ TET12"),
    e!(0o350,  0o45,  45,   "TERMINAL 6/ TET11"),
    e!(0o360,  0o46,  46,   "TERMINAL 7/ TET10"),
    e!(0o370,  0o47,  47,   "TERMINAL 8/ TET9"),
    e!(0o1300, 0o50,  60,   "TERMINAL 9"),
    e!(0o1310, 0o51,  61,   "TERMINAL 10"),
    e!(0o1320, 0o52,  62,   "TERMINAL 11"),
    e!(0o1330, 0o53,  63,   "TERMINAL 12"),
    e!(0o1340, 0o54,  64,   "TERMINAL 13"),
    e!(0o1350, 0o55,  65,   "TERMINAL 14"),
    e!(0o1360, 0o56,  66,   "TERMINAL 15"),
    e!(0o1370, 0o57,  67,   "TERMINAL 16"),
    e!(0o200,  0o60,  7,    "TERMINAL 17"),
    e!(0o210,  0o61,  17,   "TERMINAL 18"),
    e!(0o220,  0o62,  52,   "TERMINAL 19"),
    e!(0o230,  0o63,  53,   "TERMINAL 20"),
    e!(0o240,  0o64,  54,   "TERMINAL 21"),
    e!(0o250,  0o65,  55,   "TERMINAL 22"),
    e!(0o260,  0o66,  56,   "TERMINAL 23"),
    e!(0o270,  0o67,  57,   "TERMINAL 24"),
    e!(0o1200, 0o70,  70,   "TERMINAL 25"),
    e!(0o1210, 0o71,  71,   "TERMINAL 26"),
    e!(0o1220, 0o72,  72,   "TERMINAL 27"),
    e!(0o1230, 0o73,  73,   "TERMINAL 28"),
    e!(0o1240, 0o74,  74,   "TERMINAL 29/PHOTOS.1"),
    e!(0o1250, 0o75,  75,   "TERMINAL 30/PHOTOS.2"),
    e!(0o1260, 0o76,  76,   "TERMINAL 31/PHOTOS.3"),
    e!(0o1270, 0o77,  77,   "TERMINAL 32/PHOTOS.4"),
    e!(0o640,  0o124, 1040, "TERMINAL 33"),
    e!(0o650,  0o125, 1041, "TERMINAL 34"),
    e!(0o660,  0o126, 1042, "TERMINAL 35"),
    e!(0o670,  0o127, 1043, "TERMINAL 36"),
    e!(0o1100, 0o130, 1044, "TERMINAL 37"),
    e!(0o1110, 0o131, 1045, "TERMINAL 38"),
    e!(0o1120, 0o132, 1046, "TERMINAL 39"),
    e!(0o1130, 0o133, 1047, "TERMINAL 40"),
    e!(0o1140, 0o134, 1050, "TERMINAL 41"),
    e!(0o1150, 0o135, 1051, "TERMINAL 42"),
    e!(0o1160, 0o136, 1052, "TERMINAL 43"),
    e!(0o1170, 0o137, 1053, "TERMINAL 44"),
    e!(0o1400, 0o140, 1054, "TERMINAL 45"),
    e!(0o1410, 0o141, 1055, "TERMINAL 46"),
    e!(0o1420, 0o142, 1056, "TERMINAL 47"),
    e!(0o1430, 0o143, 1057, "TERMINAL 48"),
    e!(0o1500, 0o144, 1060, "TERMINAL 49"),
    e!(0o1510, 0o145, 1061, "TERMINAL 50"),
    e!(0o1520, 0o146, 1062, "TERMINAL 51"),
    e!(0o1530, 0o147, 1063, "TERMINAL 52"),
];

mod in_ctl {
    pub const IE: u16 = 1 << 0;
    pub const DEVICE_ACTIVATED: u16 = 1 << 1;
    pub const TEST_MODE: u16 = 1 << 2;
    pub const DEVICE_CLEAR: u16 = 1 << 3;
    pub const CHAR_LEN_SHIFT: u16 = 4;
    pub const CHAR_LEN_MASK: u16 = 0x3;
    pub const PARITY_GEN: u16 = 1 << 6;
}

mod in_stat {
    pub const IE: u16 = 1 << 0;
    pub const DEVICE_ACTIVATED: u16 = 1 << 1;
    pub const RFT: u16 = 1 << 7;
    pub const OVERRUN_ERROR: u16 = 1 << 8;
    pub const PARITY_ERROR: u16 = 1 << 9;
    pub const FRAMING_ERROR: u16 = 1 << 10;
}

mod out_ctl {
    pub const IE: u16 = 1 << 0;
}

mod out_stat {
    pub const IE: u16 = 1 << 0;
    pub const RFT: u16 = 1 << 7;
}

/// Character lengths selected by the two `CHAR_LEN` control bits.
fn char_len_bits(sel: u16) -> u8 {
    match sel {
        0 => 8,
        1 => 7,
        2 => 6,
        _ => 5,
    }
}

#[derive(Debug, Clone, Copy)]
enum Completion {
    WriteEnd,
}

pub type OutputCallback = Box<dyn FnMut(u8)>;

pub struct TerminalDevice {
    name: String,
    start_addr: u16,
    ident_code: u8,
    input_queue: VecDeque<u8>,
    uart_input_buf: u8,
    check_input_queue_tick: u32,
    input_status: u16,
    input_control: u16,
    output_status: u16,
    output_control: u16,
    interrupt_bits: InterruptBits,
    delay: IoDelay<Completion>,
    output_cb: Option<OutputCallback>,
}

impl TerminalDevice {
    pub fn new(thumbwheel: u8) -> Result<Self, DeviceError> {
        // Thumbwheel 0 and 1 alias to the same table entry, matching
        // the original's pre-decrement-unless-zero indexing quirk.
        let index = if thumbwheel > 0 {
            (thumbwheel - 1) as usize
        } else {
            0
        };
        let entry = TABLE
            .get(index)
            .ok_or(DeviceError::UnknownThumbwheel {
                device_type: "TERMINAL",
                thumbwheel,
            })?;
        Ok(Self {
            name: format!("{} ({})", entry.label, entry.logical_device),
            start_addr: entry.start_addr,
            ident_code: entry.ident_code,
            input_queue: VecDeque::with_capacity(QUEUE_CAPACITY),
            uart_input_buf: 0,
            check_input_queue_tick: 0,
            input_status: in_stat::DEVICE_ACTIVATED,
            input_control: in_ctl::DEVICE_ACTIVATED,
            output_status: out_stat::RFT,
            output_control: 0,
            interrupt_bits: InterruptBits::default(),
            delay: IoDelay::new(),
            output_cb: None,
        })
    }

    pub fn set_output_callback(&mut self, cb: OutputCallback) {
        self.output_cb = Some(cb);
    }

    /// Enqueues a keystroke as if typed at the host keyboard. Silently
    /// drops the byte and marks overrun if the queue is already full.
    pub fn queue_key_code(&mut self, byte: u8) {
        if self.input_queue.len() >= QUEUE_CAPACITY {
            self.input_status |= in_stat::OVERRUN_ERROR;
            return;
        }
        self.input_queue.push_back(byte);
    }

    fn char_length(&self) -> u8 {
        char_len_bits((self.input_control >> in_ctl::CHAR_LEN_SHIFT) & in_ctl::CHAR_LEN_MASK)
    }

    fn frame(&self, byte: u8) -> u8 {
        match self.char_length() {
            8 => byte,
            7 => {
                let mut b = byte & 0x7F;
                if self.input_control & in_ctl::PARITY_GEN != 0 {
                    b |= odd_parity(b & 0x7F) << 7;
                }
                b
            }
            6 => byte & 0x3F,
            _ => byte & 0x1F,
        }
    }
}

impl Device for TerminalDevice {
    fn name(&self) -> &str {
        &self.name
    }

    fn start_addr(&self) -> u16 {
        self.start_addr
    }

    fn end_addr(&self) -> u16 {
        self.start_addr + 7
    }

    fn ident_code(&self) -> u8 {
        self.ident_code
    }

    fn interrupt_level(&self) -> u8 {
        OUTPUT_LEVEL
    }

    fn device_class(&self) -> crate::device::DeviceClass {
        crate::device::DeviceClass::CharacterStream
    }

    fn interrupt_bits(&self) -> InterruptBits {
        self.interrupt_bits
    }

    fn reset(&mut self) {
        self.input_queue.clear();
        self.uart_input_buf = 0;
        self.check_input_queue_tick = 0;
        self.input_status = in_stat::DEVICE_ACTIVATED;
        self.input_control = in_ctl::DEVICE_ACTIVATED;
        self.output_status = out_stat::RFT;
        self.output_control = 0;
        self.interrupt_bits = InterruptBits::default();
        self.delay.clear();
    }

    fn tick(&mut self, _bus: &mut dyn SystemBus) {
        self.check_input_queue_tick += 1;
        if self.check_input_queue_tick >= MAX_TICKS {
            self.check_input_queue_tick = 0;
            let rft_clear = self.input_status & in_stat::RFT == 0;
            let output_ready = self.output_status & out_stat::RFT != 0;
            if rft_clear && output_ready {
                if let Some(byte) = self.input_queue.pop_front() {
                    self.uart_input_buf = self.frame(byte);
                    self.input_status |= in_stat::RFT;
                    if self.input_control & in_ctl::IE != 0 {
                        self.interrupt_bits.set(INPUT_LEVEL);
                    }
                }
            }
        }

        for (level, completion) in self.delay.tick() {
            match completion {
                Completion::WriteEnd => {
                    self.output_status |= out_stat::RFT;
                    if self.output_control & out_ctl::IE != 0 {
                        self.interrupt_bits.set(level);
                    }
                }
            }
        }
    }

    fn read(&mut self, addr: u16) -> u16 {
        match self.register_address(addr) {
            0 => {
                let value = self.uart_input_buf as u16;
                self.uart_input_buf = 0;
                self.input_status &= !in_stat::RFT;
                self.interrupt_bits.clear(INPUT_LEVEL);
                value
            }
            2 => self.input_status,
            6 => self.output_status,
            _ => 0,
        }
    }

    fn write(&mut self, addr: u16, value: u16, _bus: &mut dyn SystemBus) {
        match self.register_address(addr) {
            3 => {
                self.input_control = value;
                self.input_status = (self.input_status & !(in_stat::IE | in_stat::DEVICE_ACTIVATED))
                    | (if value & in_ctl::IE != 0 { in_stat::IE } else { 0 })
                    | in_stat::DEVICE_ACTIVATED;
                if value & in_ctl::DEVICE_CLEAR != 0 {
                    self.input_status = in_stat::DEVICE_ACTIVATED;
                    self.output_status = out_stat::RFT;
                }
            }
            5 => {
                let byte = (value & 0x7F) as u8;
                if self.input_control & in_ctl::TEST_MODE != 0 {
                    self.queue_key_code(byte);
                } else if let Some(cb) = self.output_cb.as_mut() {
                    cb(byte);
                } else {
                    let _ = std::io::stdout().write_all(&[byte]);
                    trace!("{}: no output callback, wrote to stdout", self.name);
                }
                self.output_status &= !out_stat::RFT;
                self.delay.queue(IODELAY_TERMINAL as u32, OUTPUT_LEVEL, Completion::WriteEnd);
            }
            7 => {
                self.output_control = value;
            }
            _ => {}
        }
    }

    fn ident(&mut self, level: u8) -> Option<u8> {
        if level == INPUT_LEVEL && self.interrupt_bits.is_set(level) {
            self.input_control &= !in_ctl::IE;
            self.interrupt_bits.clear(level);
            Some(self.ident_code)
        } else if level == OUTPUT_LEVEL && self.interrupt_bits.is_set(level) {
            self.output_control &= !out_ctl::IE;
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
    fn thumbwheel_zero_and_one_alias_console() {
        let a = TerminalDevice::new(0).unwrap();
        let b = TerminalDevice::new(1).unwrap();
        assert_eq!(a.start_addr(), b.start_addr());
        assert_eq!(a.start_addr(), 0o300);
    }

    #[test]
    fn last_table_entry_is_terminal_52() {
        let t = TerminalDevice::new(52).unwrap();
        assert_eq!(t.start_addr(), 0o1530);
        assert_eq!(t.ident_code(), 0o147);
    }

    #[test]
    fn loopback_roundtrip() {
        let mut bus = FlatMemory::new(1);
        let mut term = TerminalDevice::new(1).unwrap();
        term.write(term.start_addr() + 3, in_ctl::TEST_MODE | in_ctl::IE, &mut bus);
        term.write(term.start_addr() + 5, 0x41, &mut bus);

        for _ in 0..(MAX_TICKS + 1) {
            term.tick(&mut bus);
        }

        assert_ne!(term.read(term.start_addr() + 2) & in_stat::RFT, 0);
        assert_eq!(term.read(term.start_addr()), 0x41);
        assert_eq!(term.uart_input_buf, 0);
    }

    #[test]
    fn queue_overrun_sets_error_and_drops() {
        let mut term = TerminalDevice::new(1).unwrap();
        for i in 0..QUEUE_CAPACITY {
            term.queue_key_code(i as u8);
        }
        term.queue_key_code(0xFF);
        assert_ne!(term.input_status & in_stat::OVERRUN_ERROR, 0);
        assert_eq!(term.input_queue.len(), QUEUE_CAPACITY);
    }
}
