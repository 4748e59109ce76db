//! PIO floppy controller: an 8-register state machine driving
//! sector-addressed host file I/O, with an embedded boot PROM and a
//! per-(track,sector) deleted-record map.
//!
//! Grounded on `deviceFloppyPIO.c`/`.h`. The command-select loop scans
//! the one-hot command byte from bit 0 upward without an early exit,
//! so when more than one bit is set the command actually executed is
//! the one at the *highest* set bit index — a quirk of the original
//! firmware driver, preserved here rather than "fixed" to a
//! first-match scan.

use crate::bus::SystemBus;
use crate::device::{buffer_read_word, buffer_write_word, word_from_be_bytes, Device, InterruptBits, IoDelay};
use crate::error::DeviceError;
use log::warn;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::PathBuf;

const IODELAY_FLOPPY: u32 = 300;
const INTERRUPT_LEVEL: u8 = 11;
const DATA_BUFFER_WORDS: usize = 1024;
const BOOT_LEN: usize = 388;
const TRACKS: usize = 100;
const SECTORS: usize = 100;

#[rustfmt::skip]
const FLOPPY_BOOT: [u8; BOOT_LEN] = [
    0xb1, 0x8d, 0x0a, 0x30, 0x30, 0x36, 0x30, 0x30, 0x30, 0x8d, 0x0a, 0xb1, 0x36, 0xb4, 0x33, 0xb1,
    0x36, 0x21, 0x0c, 0x00, 0x00, 0xb3, 0xf1, 0x00, 0xb2, 0x03, 0xd2, 0x40, 0xa8, 0x00, 0xf1, 0xff,
    0x08, 0x1b, 0x40, 0x1a, 0xa8, 0x02, 0xa8, 0x03, 0xf3, 0x31, 0xa8, 0x1a, 0x48, 0x16, 0xcc, 0x69,
    0xf1, 0x00, 0xf2, 0x03, 0xc3, 0xb0, 0x68, 0x12, 0xb2, 0x03, 0xf3, 0x32, 0xa8, 0x11, 0xcc, 0x4d,
    0x68, 0x0e, 0xb3, 0xfc, 0xf3, 0x00, 0x4c, 0x00, 0x0c, 0x00, 0xcd, 0x07, 0xcc, 0x7d, 0xb3, 0xfc,
    0xd0, 0x05, 0xd0, 0x0d, 0xa8, 0x23, 0x00, 0x00, 0x00, 0x11, 0x00, 0x05, 0x00, 0x02, 0x48, 0x1d,
    0xe8, 0xc3, 0xf2, 0x0d, 0xb8, 0x14, 0xf2, 0x0a, 0xb8, 0x12, 0xf2, 0x45, 0xb8, 0x10, 0xf2, 0x52,
    0xb8, 0x0e, 0xb8, 0x0d, 0xf2, 0x4f, 0xb8, 0x0b, 0xf2, 0x52, 0xb8, 0x09, 0xf2, 0x20, 0xb8, 0x07,
    0xcc, 0x7e, 0xb8, 0x05, 0xf2, 0x20, 0xb8, 0x03, 0xd2, 0x08, 0xa8, 0xc6, 0xe8, 0xc6, 0xfa, 0x9d,
    0xa8, 0xfe, 0xcc, 0x75, 0xe8, 0xc5, 0xcc, 0x62, 0x48, 0x04, 0xf1, 0xfb, 0x08, 0x49, 0xf1, 0x30,
    0xeb, 0x73, 0x48, 0x4e, 0xeb, 0x75, 0x00, 0x00, 0x00, 0x00, 0xeb, 0x72, 0xfa, 0x9d, 0xa8, 0xfe,
    0xfa, 0xa5, 0xa8, 0x0a, 0x08, 0x07, 0xeb, 0x74, 0xfa, 0x45, 0xa8, 0xf2, 0x08, 0x04, 0xf3, 0x33,
    0xa8, 0xcf, 0x00, 0x00, 0x00, 0x00, 0x48, 0x3d, 0xeb, 0x73, 0xeb, 0x72, 0xfa, 0x9d, 0xa8, 0xfe,
    0x48, 0x39, 0xeb, 0x77, 0x48, 0x38, 0xeb, 0x73, 0xeb, 0x72, 0xfa, 0x15, 0xa8, 0xfe, 0xfa, 0x25,
    0xa8, 0x20, 0xf1, 0x20, 0xeb, 0x73, 0xb8, 0x32, 0xf2, 0x21, 0x70, 0x2e, 0xc4, 0x2e, 0xa8, 0x04,
    0xcc, 0x4d, 0x08, 0x16, 0xa8, 0xf9, 0xb8, 0x1d, 0xcc, 0x6b, 0xb8, 0x1b, 0xcc, 0x6f, 0xcc, 0x41,
    0xb8, 0x18, 0xcc, 0x29, 0x09, 0x00, 0xcd, 0x03, 0xcc, 0x87, 0xc0, 0x07, 0xa8, 0xfa, 0xb8, 0x11,
    0xcd, 0x8d, 0xb3, 0x07, 0xeb, 0x70, 0x70, 0x19, 0xc0, 0x05, 0xd2, 0x00, 0xaa, 0x01, 0x00, 0x00,
    0x08, 0xd1, 0xeb, 0x74, 0x08, 0xd0, 0x40, 0x04, 0xa8, 0xbb, 0xf3, 0x34, 0xa8, 0x99, 0x00, 0x00,
    0xeb, 0x70, 0xdd, 0x08, 0xcc, 0x6e, 0xeb, 0x70, 0x70, 0x08, 0xcb, 0x35, 0xcc, 0x62, 0xc0, 0x01,
    0x40, 0x00, 0x01, 0x00, 0x10, 0x00, 0x00, 0x7f, 0x00, 0xff, 0x10, 0x14, 0xcc, 0x41, 0x50, 0x13,
    0xeb, 0x70, 0x70, 0x12, 0xc4, 0x35, 0xa8, 0xfd, 0x08, 0x0c, 0x68, 0x0f, 0xb1, 0x07, 0x68, 0x0e,
    0xb0, 0x05, 0x60, 0x0c, 0xdc, 0x83, 0xcb, 0x29, 0xa8, 0xf4, 0x48, 0x03, 0x50, 0x02, 0xcc, 0x62,
    0x00, 0x00, 0x00, 0x00, 0x00, 0x0a, 0x00, 0x7f, 0x00, 0x30, 0x00, 0x08, 0x54, 0xd4, 0x00, 0x00,
    0xf1, 0x00, 0x00, 0x00,
];

struct Table {
    start_addr: u16,
    ident_code: u8,
}

const TABLE: [Table; 2] = [
    Table { start_addr: 0o1560, ident_code: 0o21 },
    Table { start_addr: 0o1570, ident_code: 0o22 },
];

/// Status Register 1 (`FLOPPY_READ_STATUS_REGISTER1`).
mod status1 {
    pub const IE: u16 = 1 << 1;
    pub const DEVICE_BUSY: u16 = 1 << 2;
    pub const RFT: u16 = 1 << 3;
    pub const INCLUSIVE_OR_REG2: u16 = 1 << 4;
    pub const DELETED_RECORD: u16 = 1 << 5;
    pub const READ_WRITE_COMPLETE: u16 = 1 << 6;
    pub const SEEK_COMPLETE: u16 = 1 << 7;
}

/// Control Word (`FLOPPY_WRITE_CONTROL_WORD`).
mod control {
    pub const ENABLE_INTERRUPT: u16 = 1 << 1;
    pub const AUTOLOAD: u16 = 1 << 2;
    pub const TEST_MODE: u16 = 1 << 3;
    pub const DEVICE_CLEAR: u16 = 1 << 4;
    pub const CLEAR_BUFFER_ADDRESS: u16 = 1 << 5;
    pub const CMD_FORMAT_TRACK: u16 = 1 << 8;
    pub const CMD_WRITE_DATA: u16 = 1 << 9;
    pub const CMD_WRITE_DELETED: u16 = 1 << 10;
    pub const CMD_READ_ID: u16 = 1 << 11;
    pub const CMD_READ_DATA: u16 = 1 << 12;
    pub const CMD_SEEK: u16 = 1 << 13;
    pub const CMD_RECALIBRATE: u16 = 1 << 14;
    pub const CMD_CONTROL_RESET: u16 = 1 << 15;
}

/// Status Register 2 (`FLOPPY_READ_STATUS_REGISTER2`).
mod status2 {
    pub const DRIVE_NOT_READY: u16 = 1 << 8;
    pub const SECTOR_MISSING: u16 = 1 << 11;
}

#[derive(Debug, Clone, Copy)]
enum Completion {
    ReadWriteEnd,
    SeekEnd,
    RecalibrateEnd,
}

#[derive(Debug, Clone, Copy)]
enum Command {
    FormatTrack,
    WriteData,
    WriteDeleted,
    ReadId,
    ReadData,
    Seek,
    Recalibrate,
    ControlReset,
}

/// Takes the *highest* set command bit, matching the original's
/// ascending unconditional scan that keeps overwriting its result.
fn select_command(high_byte: u16) -> Option<Command> {
    let bits = [
        (1u16 << 0, Command::FormatTrack),
        (1u16 << 1, Command::WriteData),
        (1u16 << 2, Command::WriteDeleted),
        (1u16 << 3, Command::ReadId),
        (1u16 << 4, Command::ReadData),
        (1u16 << 5, Command::Seek),
        (1u16 << 6, Command::Recalibrate),
        (1u16 << 7, Command::ControlReset),
    ];
    let mut selected = None;
    for (mask, cmd) in bits {
        if high_byte & mask != 0 {
            selected = Some(cmd);
        }
    }
    selected
}

fn format_select(value: u16) -> (usize, usize) {
    match (value >> 14) & 0x3 {
        0 | 1 => (128, 26),
        2 => (256, 15),
        _ => (512, 8),
    }
}

pub struct FloppyPioDevice {
    name: String,
    start_addr: u16,
    ident_code: u8,
    sector: i32,
    track: i32,
    buffer_pointer: u16,
    data_buffer: Vec<u8>,
    deleted: Box<[[bool; SECTORS]; TRACKS]>,
    bytes_per_sector: usize,
    sectors_per_track: usize,
    status1: u16,
    status2: u16,
    control: u16,
    sector_auto_increment: bool,
    test_byte: u8,
    testmode_high_pending: bool,
    selected_drive: i32,
    interrupt_bits: InterruptBits,
    delay: IoDelay<Completion>,
    path: Option<PathBuf>,
    file: Option<File>,
}

impl FloppyPioDevice {
    pub fn new(thumbwheel: u8) -> Result<Self, DeviceError> {
        let entry = TABLE
            .get(thumbwheel as usize)
            .ok_or(DeviceError::UnknownThumbwheel {
                device_type: "FLOPPY_PIO",
                thumbwheel,
            })?;
        Ok(Self {
            name: format!("Floppy PIO {}", thumbwheel),
            start_addr: entry.start_addr,
            ident_code: entry.ident_code,
            sector: 0,
            track: 0,
            buffer_pointer: 0,
            data_buffer: vec![0u8; DATA_BUFFER_WORDS * 2],
            deleted: Box::new([[false; SECTORS]; TRACKS]),
            bytes_per_sector: 0,
            sectors_per_track: 0,
            status1: 0,
            status2: 0,
            control: 0,
            sector_auto_increment: false,
            test_byte: 0,
            testmode_high_pending: false,
            selected_drive: -1,
            interrupt_bits: InterruptBits::default(),
            delay: IoDelay::new(),
            path: None,
            file: None,
        })
    }

    pub fn attach_file(&mut self, path: PathBuf) -> Result<(), DeviceError> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(&path)
            .map_err(|e| DeviceError::Io { device: "FLOPPY_PIO", source: e })?;
        self.file = Some(file);
        self.path = Some(path);
        self.selected_drive = 0;
        Ok(())
    }

    fn sector_offset(&self, track: i32, sector: i32) -> u64 {
        (((sector - 1) as usize * self.bytes_per_sector)
            + (track as usize * self.bytes_per_sector * self.sectors_per_track)) as u64
    }

    fn set_sector_deleted(&mut self, sector: i32, track: i32, deleted: bool) {
        if (0..TRACKS as i32).contains(&track) && sector > 0 && sector as usize <= SECTORS {
            self.deleted[track as usize][(sector - 1) as usize] = deleted;
        }
    }

    fn sector_is_deleted(&self, sector: i32, track: i32) -> bool {
        if (0..TRACKS as i32).contains(&track) && sector > 0 && sector as usize <= SECTORS {
            self.deleted[track as usize][(sector - 1) as usize]
        } else {
            false
        }
    }

    fn sync_interrupt_line(&mut self) {
        let active = self.control & control::ENABLE_INTERRUPT != 0 && self.status1 & status1::RFT != 0;
        if active {
            self.interrupt_bits.set(INTERRUPT_LEVEL);
        } else {
            self.interrupt_bits.clear(INTERRUPT_LEVEL);
        }
    }

    fn execute_go(&mut self, command: Command) {
        self.status2 = 0;
        self.status1 &= !(status1::RFT | status1::READ_WRITE_COMPLETE | status1::SEEK_COMPLETE | status1::DELETED_RECORD);

        if self.sector <= 0 {
            self.sector = 1;
        }
        if self.sector as usize > self.sectors_per_track {
            self.status2 |= status2::SECTOR_MISSING;
            self.status1 |= status1::RFT;
            self.status1 &= !status1::DEVICE_BUSY;
            return;
        }
        if self.selected_drive < 0 || self.file.is_none() {
            self.status2 |= status2::DRIVE_NOT_READY;
            self.status1 &= !status1::DEVICE_BUSY;
            return;
        }

        let position = self.sector_offset(self.track, self.sector);

        match command {
            Command::FormatTrack => {
                let offset = self.sector_offset(self.track, 1);
                let mut ok = self.file.as_mut().map(|f| f.seek(SeekFrom::Start(offset)).is_ok()).unwrap_or(false);
                if ok {
                    let pattern = [0xAAu8, 0xFF];
                    'outer: for s in 1..=self.sectors_per_track {
                        for _ in 0..(self.bytes_per_sector / 2) {
                            if self.file.as_mut().map(|f| f.write_all(&pattern).is_err()).unwrap_or(true) {
                                self.status2 |= status2::DRIVE_NOT_READY;
                                self.status1 &= !status1::DEVICE_BUSY;
                                ok = false;
                                break 'outer;
                            }
                        }
                        self.set_sector_deleted(s as i32, self.track, false);
                    }
                } else {
                    self.status2 |= status2::SECTOR_MISSING;
                    self.status1 &= !status1::DEVICE_BUSY;
                }
                if ok {
                    self.delay.queue(IODELAY_FLOPPY, INTERRUPT_LEVEL, Completion::ReadWriteEnd);
                }
            }
            Command::WriteData | Command::WriteDeleted => {
                if matches!(command, Command::WriteDeleted) {
                    self.set_sector_deleted(self.sector, self.track, true);
                }
                if self.file.as_mut().map(|f| f.seek(SeekFrom::Start(position)).is_err()).unwrap_or(true) {
                    self.status2 |= status2::SECTOR_MISSING;
                    self.status1 &= !status1::DEVICE_BUSY;
                    return;
                }
                let words = self.bytes_per_sector / 2;
                let mut raw = vec![0u8; self.bytes_per_sector];
                for i in 0..words {
                    let word = buffer_read_word(&self.data_buffer, self.buffer_pointer as usize * 2);
                    raw[i * 2] = (word >> 8) as u8;
                    raw[i * 2 + 1] = (word & 0xFF) as u8;
                    self.buffer_pointer = (self.buffer_pointer + 1) & 0x3FF;
                }
                if self.file.as_mut().map(|f| f.write_all(&raw).is_err()).unwrap_or(true) {
                    self.status2 |= status2::DRIVE_NOT_READY;
                    self.status1 &= !status1::DEVICE_BUSY;
                    return;
                }
                if matches!(command, Command::WriteData) {
                    self.set_sector_deleted(self.sector, self.track, false);
                }
                self.delay.queue(IODELAY_FLOPPY, INTERRUPT_LEVEL, Completion::ReadWriteEnd);
            }
            Command::ReadId => {
                if self.sector_is_deleted(self.sector, self.track) {
                    buffer_write_word(&mut self.data_buffer, 0, 0xFF00);
                    buffer_write_word(&mut self.data_buffer, 2, 0xFF02);
                } else {
                    buffer_write_word(&mut self.data_buffer, 0, (self.track as u16) << 8);
                    buffer_write_word(&mut self.data_buffer, 2, (self.sector as u16) << 8);
                }
                self.buffer_pointer = 0;
                self.delay.queue(IODELAY_FLOPPY, INTERRUPT_LEVEL, Completion::ReadWriteEnd);
            }
            Command::ReadData => {
                if self.file.as_mut().map(|f| f.seek(SeekFrom::Start(position)).is_err()).unwrap_or(true) {
                    self.status2 |= status2::SECTOR_MISSING;
                    self.status1 &= !status1::DEVICE_BUSY;
                    return;
                }
                if self.sector_is_deleted(self.sector, self.track) {
                    self.status1 |= status1::DELETED_RECORD;
                }
                let words = self.bytes_per_sector / 2;
                let mut raw = vec![0u8; self.bytes_per_sector];
                if self.file.as_mut().map(|f| f.read_exact(&mut raw).is_err()).unwrap_or(true) {
                    self.status2 |= status2::DRIVE_NOT_READY;
                    self.status1 &= !status1::DEVICE_BUSY;
                    return;
                }
                for i in 0..words {
                    let word = word_from_be_bytes([raw[i * 2], raw[i * 2 + 1]]);
                    buffer_write_word(&mut self.data_buffer, self.buffer_pointer as usize * 2, word);
                    self.buffer_pointer = (self.buffer_pointer + 1) & 0x3FF;
                }
                self.delay.queue(IODELAY_FLOPPY, INTERRUPT_LEVEL, Completion::ReadWriteEnd);
            }
            Command::Seek => {
                if self.file.as_mut().map(|f| f.seek(SeekFrom::Start(position)).is_err()).unwrap_or(true) {
                    self.status2 |= status2::SECTOR_MISSING;
                    self.status1 &= !status1::DEVICE_BUSY;
                    return;
                }
                self.delay.queue(IODELAY_FLOPPY, INTERRUPT_LEVEL, Completion::SeekEnd);
            }
            Command::Recalibrate => {
                self.track = 0;
                self.sector = 1;
                self.delay.queue(IODELAY_FLOPPY, INTERRUPT_LEVEL, Completion::RecalibrateEnd);
            }
            Command::ControlReset => {
                self.status1 &= !status1::DEVICE_BUSY;
            }
        }
    }
}

impl Device for FloppyPioDevice {
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
        INTERRUPT_LEVEL
    }

    fn device_class(&self) -> crate::device::DeviceClass {
        crate::device::DeviceClass::Block
    }

    fn interrupt_bits(&self) -> InterruptBits {
        self.interrupt_bits
    }

    fn reset(&mut self) {
        self.status1 = status1::RFT;
        self.buffer_pointer = 0;
        self.testmode_high_pending = false;
        self.interrupt_bits = InterruptBits::default();
        self.selected_drive = -1;
        self.delay.clear();
    }

    fn tick(&mut self, _bus: &mut dyn SystemBus) {
        for (level, completion) in self.delay.tick() {
            self.status1 &= !status1::DEVICE_BUSY;
            self.status1 |= status1::RFT;
            match completion {
                Completion::ReadWriteEnd => {
                    self.status1 |= status1::READ_WRITE_COMPLETE;
                    if self.sector_auto_increment && self.sector as usize <= self.sectors_per_track {
                        self.sector += 1;
                    }
                }
                Completion::SeekEnd | Completion::RecalibrateEnd => {
                    self.status1 |= status1::SEEK_COMPLETE;
                }
            }
            if self.status1 & status1::IE != 0 {
                self.interrupt_bits.set(level);
            }
        }
    }

    fn read(&mut self, addr: u16) -> u16 {
        match self.register_address(addr) {
            0 => {
                let word = buffer_read_word(&self.data_buffer, self.buffer_pointer as usize * 2);
                self.buffer_pointer = (self.buffer_pointer + 1) & 0x3FF;
                word
            }
            2 => {
                if self.status2 != 0 {
                    self.status1 |= status1::INCLUSIVE_OR_REG2;
                } else {
                    self.status1 &= !status1::INCLUSIVE_OR_REG2;
                }
                let mut value = self.status1;
                // Undocumented firmware dependency: a test program relies on these
                // bits being derived from the low buffer-pointer bits on this read.
                let w = self.buffer_pointer;
                if w & (1 << 1) != 0 && w & (1 << 6) != 0 {
                    value |= 1 << 9;
                }
                if w & (1 << 1) != 0 && w & (1 << 7) != 0 {
                    value |= 1 << 10;
                }
                if w & (1 << 1) != 0 && w & (1 << 8) != 0 {
                    value |= 1 << 11;
                }
                value
            }
            4 => self.status2,
            6 => {
                // Register never latches `value`; it only mutates the data buffer
                // in place, so this read always returns 0 — preserved as-is.
                if self.control & control::TEST_MODE != 0 {
                    let word = buffer_read_word(&self.data_buffer, self.buffer_pointer as usize * 2);
                    if self.testmode_high_pending {
                        let merged = (word & 0xFF00) | self.test_byte as u16;
                        buffer_write_word(&mut self.data_buffer, self.buffer_pointer as usize * 2, merged);
                        self.buffer_pointer = (self.buffer_pointer + 1) & 0x3FF;
                        self.testmode_high_pending = false;
                    } else {
                        let merged = (word & 0x00FF) | ((self.test_byte as u16) << 8);
                        buffer_write_word(&mut self.data_buffer, self.buffer_pointer as usize * 2, merged);
                        self.testmode_high_pending = true;
                    }
                }
                0
            }
            _ => 0,
        }
    }

    fn write(&mut self, addr: u16, value: u16, _bus: &mut dyn SystemBus) {
        match self.register_address(addr) {
            1 => {
                buffer_write_word(&mut self.data_buffer, self.buffer_pointer as usize * 2, value);
                self.buffer_pointer = (self.buffer_pointer + 1) & 0x3FF;
            }
            3 => {
                self.control = value;
                if value & control::ENABLE_INTERRUPT != 0 {
                    self.status1 |= status1::IE;
                } else {
                    self.status1 &= !status1::IE;
                }

                if value & control::AUTOLOAD != 0 {
                    self.track = 0;
                    self.sector = 1;
                    self.buffer_pointer = 0;
                    self.status1 |= status1::RFT;
                    self.data_buffer[..FLOPPY_BOOT.len()].copy_from_slice(&FLOPPY_BOOT);
                }
                if value & control::DEVICE_CLEAR != 0 {
                    self.selected_drive = -1;
                    self.buffer_pointer = 0;
                    self.status1 |= status1::RFT;
                    self.status2 = 0;
                }
                if value & control::CLEAR_BUFFER_ADDRESS != 0 {
                    self.buffer_pointer = 0;
                    self.status1 |= status1::RFT;
                }

                let high_byte = (value >> 8) & 0xFF;
                if high_byte != 0 {
                    self.status1 |= status1::DEVICE_BUSY;
                    if let Some(command) = select_command(high_byte) {
                        self.execute_go(command);
                    }
                }

                self.sync_interrupt_line();
            }
            5 => {
                let mode_bit = value & 0x1 != 0;
                if mode_bit {
                    let drive_address = ((value >> 8) & 0x7) as i32;
                    let deselect = value & (1 << 11) != 0;
                    self.selected_drive = if deselect { -1 } else { drive_address };
                    let (bps, spt) = format_select(value);
                    self.bytes_per_sector = bps;
                    self.sectors_per_track = spt;
                } else {
                    let difference = ((value >> 8) & 0x7F) as i32;
                    let move_in = (value >> 15) & 0x1;
                    if move_in != 0 {
                        self.track += difference;
                    } else {
                        self.track -= difference;
                    }
                    self.track = self.track.clamp(0, 76);
                }
            }
            7 => {
                if self.control & control::TEST_MODE != 0 {
                    self.test_byte = ((value >> 8) & 0xFF) as u8;
                } else {
                    self.sector = ((value >> 8) & 0x7F) as i32;
                    self.sector_auto_increment = value & (1 << 15) != 0;
                }
            }
            _ => {}
        }
    }

    fn ident(&mut self, level: u8) -> Option<u8> {
        if level == INTERRUPT_LEVEL && self.interrupt_bits.is_set(level) {
            self.status1 &= !status1::IE;
            self.interrupt_bits.clear(level);
            Some(self.ident_code)
        } else {
            None
        }
    }

    fn boot(&mut self, _bus: &mut dyn SystemBus) -> i32 {
        if self.selected_drive < 0 {
            warn!("{}: boot requested with no drive selected, loading PROM snapshot", self.name);
        }
        self.track = 0;
        self.sector = 1;
        self.buffer_pointer = 0;
        self.data_buffer[..FLOPPY_BOOT.len()].copy_from_slice(&FLOPPY_BOOT);
        self.status1 |= status1::RFT;
        0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_log::test;
    use crate::bus::FlatMemory;
    use std::io::{Seek as _, Write as _};

    const FORMAT_512_8: u16 = 0b11 << 14;

    fn drive_with_blank_sector(bps: usize, spt: usize) -> (FloppyPioDevice, tempfile::NamedTempFile) {
        let mut tmp = tempfile::NamedTempFile::new().unwrap();
        let blank = vec![0u8; bps * spt * 2];
        tmp.write_all(&blank).unwrap();
        tmp.flush().unwrap();
        tmp.as_file_mut().rewind().unwrap();
        let mut dev = FloppyPioDevice::new(0).unwrap();
        dev.attach_file(tmp.path().to_path_buf()).unwrap();
        dev.bytes_per_sector = bps;
        dev.sectors_per_track = spt;
        (dev, tmp)
    }

    #[test]
    fn format_select_matches_boundary_table() {
        assert_eq!(format_select(0), (128, 26));
        assert_eq!(format_select(FORMAT_512_8), (512, 8));
    }

    #[test]
    fn highest_command_bit_wins_when_multiple_set() {
        let combo = (control::CMD_READ_DATA | control::CMD_SEEK) >> 8;
        assert!(matches!(select_command(combo), Some(Command::Seek)));
    }

    #[test]
    fn write_then_read_sector_round_trips() {
        let mut bus = FlatMemory::new(1);
        let (mut dev, _tmp) = drive_with_blank_sector(512, 8);
        dev.selected_drive = 0;
        for i in 0..256u16 {
            dev.write(dev.start_addr() + 1, i, &mut bus);
        }
        dev.buffer_pointer = 0;
        dev.write(dev.start_addr() + 3, control::CMD_WRITE_DATA, &mut bus);
        for _ in 0..(IODELAY_FLOPPY + 1) {
            dev.tick(&mut bus);
        }
        assert_ne!(dev.read(dev.start_addr() + 2) & status1::RFT, 0);

        dev.buffer_pointer = 0;
        dev.write(dev.start_addr() + 3, control::CMD_READ_DATA, &mut bus);
        for _ in 0..(IODELAY_FLOPPY + 1) {
            dev.tick(&mut bus);
        }
        assert_eq!(dev.data_buffer[0], 0x00);
        assert_eq!(dev.data_buffer[2], 0x00);
        assert_eq!(dev.data_buffer[3], 0x01);
    }

    #[test]
    fn write_deleted_then_read_id_yields_sentinel() {
        let mut bus = FlatMemory::new(1);
        let (mut dev, _tmp) = drive_with_blank_sector(128, 26);
        dev.selected_drive = 0;
        dev.write(dev.start_addr() + 3, control::CMD_WRITE_DELETED, &mut bus);
        for _ in 0..(IODELAY_FLOPPY + 1) {
            dev.tick(&mut bus);
        }
        dev.write(dev.start_addr() + 3, control::CMD_READ_ID, &mut bus);
        for _ in 0..(IODELAY_FLOPPY + 1) {
            dev.tick(&mut bus);
        }
        assert_eq!(buffer_read_word(&dev.data_buffer, 0), 0xFF00);
        assert_eq!(buffer_read_word(&dev.data_buffer, 2), 0xFF02);
    }

    #[test]
    fn sector_auto_increment_advances_after_completion() {
        let mut bus = FlatMemory::new(1);
        let (mut dev, _tmp) = drive_with_blank_sector(128, 26);
        dev.selected_drive = 0;
        dev.write(dev.start_addr() + 7, (1 << 8) | (1 << 15), &mut bus);
        assert_eq!(dev.sector, 1);
        assert!(dev.sector_auto_increment);

        dev.write(dev.start_addr() + 3, control::CMD_READ_DATA, &mut bus);
        for _ in 0..(IODELAY_FLOPPY + 1) {
            dev.tick(&mut bus);
        }
        assert_eq!(dev.sector, 2);
    }

    #[test]
    fn autoload_loads_prom_snapshot_and_resets_pointer() {
        let mut bus = FlatMemory::new(1);
        let mut dev = FloppyPioDevice::new(0).unwrap();
        dev.buffer_pointer = 17;
        dev.write(dev.start_addr() + 3, control::AUTOLOAD, &mut bus);
        assert_eq!(dev.buffer_pointer, 0);
        assert_eq!(&dev.data_buffer[..BOOT_LEN], &FLOPPY_BOOT[..]);
        assert_ne!(dev.status1 & status1::RFT, 0);
    }

    #[test]
    fn boot_loads_prom_snapshot() {
        let mut bus = FlatMemory::new(1);
        let mut dev = FloppyPioDevice::new(0).unwrap();
        assert_eq!(dev.boot(&mut bus), 0);
        assert_eq!(&dev.data_buffer[..BOOT_LEN], &FLOPPY_BOOT[..]);
    }
}
