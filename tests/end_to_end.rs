//! End-to-end scenarios driving each controller purely through its
//! register interface, the way the CPU host actually would: no direct
//! field pokes, just `read`/`write`/`tick`/`ident` and the public
//! attach/callback hooks.

use nd100_devices::bus::{FlatMemory, SystemBus};
use nd100_devices::devices::floppy_dma::FloppyDmaDevice;
use nd100_devices::devices::floppy_pio::FloppyPioDevice;
use nd100_devices::devices::paper_tape::PaperTapeDevice;
use nd100_devices::devices::smd::{DiskGeometry, SmdDevice};
use nd100_devices::devices::terminal::TerminalDevice;
use nd100_devices::{create_device, Device, DeviceKind, DeviceManager};
use std::io::{Cursor, Seek, Write};

const RTC_IE: u16 = 1;
const RTC_TICKS_PER_QUANTUM: u32 = 10550;

#[test]
fn rtc_tick_raises_level_13_and_rearms() {
    let mut mgr = DeviceManager::new();
    mgr.add_device(create_device(DeviceKind::Rtc, 0).unwrap()).unwrap();
    mgr.add_device(create_device(DeviceKind::Rtc, 1).unwrap()).unwrap();
    mgr.add_device(create_device(DeviceKind::Rtc, 2).unwrap()).unwrap();

    let mut bus = FlatMemory::new(1);
    let tw0_addr = mgr.devices()[0].start_addr();
    mgr.write(tw0_addr + 2, RTC_IE, &mut bus);

    let mut pending = 0u16;
    for _ in 0..RTC_TICKS_PER_QUANTUM {
        pending = mgr.tick(&mut bus);
    }
    assert_ne!(pending & (1 << 13), 0);

    assert_eq!(mgr.ident(13), 1);

    let pending = mgr.tick(&mut bus);
    assert_eq!(pending & (1 << 13), 0);
}

#[test]
fn terminal_loopback_echoes_and_clears_interrupt() {
    let mut bus = FlatMemory::new(1);
    let mut term = TerminalDevice::new(1).unwrap();
    let base = term.start_addr();

    const TEST_MODE: u16 = 1 << 2;
    const IE: u16 = 1 << 0;
    term.write(base + 3, TEST_MODE | IE, &mut bus);
    term.write(base + 5, 0x41, &mut bus);

    for _ in 0..200 {
        term.tick(&mut bus);
    }

    assert_ne!(term.read(base + 2) & (1 << 7), 0); // RFT
    assert_eq!(term.read(base), 0x41);
}

#[test]
fn paper_tape_read_drains_the_backing_stream() {
    let mut bus = FlatMemory::new(1);
    let mut tape = PaperTapeDevice::new(0).unwrap();
    tape.attach_stream(Box::new(Cursor::new(vec![0x12, 0x34])));
    let base = tape.start_addr();

    const IE: u16 = 1 << 0;
    const READ_ACTIVE: u16 = 1 << 1;

    tape.write(base + 3, IE | READ_ACTIVE, &mut bus);
    assert_ne!(tape.read(base + 2), 0);
    assert_eq!(tape.read(base), 0x12);
    assert_eq!(tape.read(base + 2) & (1 << 7), 0);

    tape.write(base + 3, IE | READ_ACTIVE, &mut bus);
    assert_eq!(tape.read(base), 0x34);

    tape.write(base + 3, IE | READ_ACTIVE, &mut bus);
    assert_eq!(tape.read(base + 2) & (1 << 7), 0);
}

#[test]
fn floppy_pio_single_sector_write_then_read_round_trips() {
    let mut bus = FlatMemory::new(1);
    let mut tmp = tempfile::NamedTempFile::new().unwrap();
    tmp.write_all(&vec![0u8; 512 * 8]).unwrap();
    tmp.flush().unwrap();
    tmp.as_file_mut().rewind().unwrap();

    let mut dev = FloppyPioDevice::new(0).unwrap();
    dev.attach_file(tmp.path().to_path_buf()).unwrap();
    let base = dev.start_addr();

    // Register 5, mode bit set: select drive 0, format-select 3 => (512, 8).
    const FORMAT_512_8_DRIVE0: u16 = 0x1 | (0b11 << 14);
    dev.write(base + 5, FORMAT_512_8_DRIVE0, &mut bus);

    // Sector register: sector 1, no auto-increment.
    dev.write(base + 7, 1 << 8, &mut bus);

    for i in 0..256u16 {
        dev.write(base + 1, i, &mut bus);
    }

    const CLEAR_BUFFER_ADDRESS: u16 = 1 << 5;
    const CMD_WRITE_DATA: u16 = 1 << 9;
    // Rewind the buffer pointer to 0 in the same write that issues the
    // command, so write-data starts from the sector's first word.
    dev.write(base + 3, CLEAR_BUFFER_ADDRESS | CMD_WRITE_DATA, &mut bus);
    for _ in 0..400 {
        dev.tick(&mut bus);
    }
    assert_ne!(dev.read(base + 2) & (1 << 3), 0); // RFT

    const CMD_READ_DATA: u16 = 1 << 12;
    dev.write(base + 3, CLEAR_BUFFER_ADDRESS | CMD_READ_DATA, &mut bus);
    for _ in 0..400 {
        dev.tick(&mut bus);
    }
    assert_ne!(dev.read(base + 2) & (1 << 3), 0); // RFT

    dev.write(base + 3, CLEAR_BUFFER_ADDRESS, &mut bus);
    assert_eq!(dev.read(base), 0x0000); // first word, re-read from pointer 0
    assert_eq!(dev.read(base), 0x0001); // second word
}

#[test]
fn floppy_dma_command_block_copies_a_sector_into_memory() {
    let mut tmp = tempfile::NamedTempFile::new().unwrap();
    let mut payload = Vec::new();
    for w in 0u16..256 {
        payload.extend_from_slice(&w.to_be_bytes());
    }
    tmp.write_all(&payload).unwrap();
    tmp.flush().unwrap();

    let mut dev = FloppyDmaDevice::new(0).unwrap();
    dev.attach_file(tmp.path().to_path_buf()).unwrap();
    let base = dev.start_addr();

    let mut bus = FlatMemory::new(0x3000);
    // commandWord = read-data, fmt 0 (512 B/sector); diskAddress = 0;
    // memoryAddressHi/Lo = 0/0x2000; options = word-count mode; wc = 256.
    let fields: [u16; 12] = [0x0000, 0, 0, 0x2000, 0x8000, 256, 0, 0, 0, 0, 0, 0];
    for (i, word) in fields.iter().enumerate() {
        bus.write_physical_memory(0x1000 + i as u32, *word, false);
    }

    const EXECUTE: u16 = 1 << 8;
    const IE: u16 = 1 << 1;
    dev.write(base + 5, 0, &mut bus); // pointer hi
    dev.write(base + 7, 0x1000, &mut bus); // pointer lo
    dev.write(base + 3, EXECUTE | IE, &mut bus); // control

    for _ in 0..301 {
        dev.tick(&mut bus);
    }

    for w in 0u32..256 {
        assert_eq!(bus.read_physical_memory(0x2000 + w, false), w as i32);
    }
    assert_eq!(bus.read_physical_memory(0x1000 + 10, false), 0); // remaining_words hi
    assert_eq!(bus.read_physical_memory(0x1000 + 11, false), 0); // remaining_words lo
    assert!(dev.interrupt_bits().is_set(11));
}

#[test]
fn smd_read_transfer_copies_a_sector_from_unit_zero() {
    let mut tmp = tempfile::NamedTempFile::new().unwrap();
    let mut payload = Vec::new();
    for w in 0u16..2048 {
        payload.extend_from_slice(&w.to_be_bytes());
    }
    tmp.write_all(&payload).unwrap();
    tmp.flush().unwrap();

    let mut dev = SmdDevice::new(0).unwrap();
    dev.attach_unit(0, tmp.path().to_path_buf(), DiskGeometry::Disk75Mb).unwrap();
    let base = dev.start_addr();
    let mut bus = FlatMemory::new(0x0300);

    // Mem address (flip-flop): low 0x0100, then high 0.
    dev.write(base + 1, 0x0100, &mut bus);
    dev.write(base + 1, 0, &mut bus);

    // BlockAddrI: head=0, sector=1. BlockAddrII (cylinder) stays 0 after reset.
    dev.write(base + 3, 1, &mut bus);

    // Word counter (flip-flop): low 512, then high 0.
    dev.write(base + 7, 512, &mut bus);
    dev.write(base + 7, 0, &mut bus);

    const ACTIVE: u16 = 1 << 2;
    const ENABLE_IE_NOT_ACTIVE: u16 = 1 << 0;
    // device_operation (bits 11-14) = 0 (M0, read transfer), unit_select (bits 7-9) = 0.
    dev.write(base + 5, ACTIVE | ENABLE_IE_NOT_ACTIVE, &mut bus);

    for _ in 0..11 {
        dev.tick(&mut bus);
    }

    // LBA for (cyl=0, head=0, sector=1) on a 75MB geometry (5 heads/cyl, 18 sec/track) is 1.
    let expected_start = 512u16; // word index at byte offset 1*1024
    for w in 0u32..512 {
        assert_eq!(
            bus.read_physical_memory(0x0100 + w, false),
            expected_start.wrapping_add(w as u16) as i32
        );
    }

    assert_eq!(dev.read(base + 4) & (1 << 13), 0); // disk_unit_not_ready clear
    assert_ne!(dev.read(base + 4) & (1 << 14), 0); // on_cylinder
    assert_eq!(dev.ident(11), Some(0o17));
}
