//! ND-100 peripheral I/O subsystem emulator core.
//!
//! This crate models the bus-resident device controllers of an ND-100
//! minicomputer: their registers, interrupt behavior, and (where they
//! have one) their DMA traffic with main memory. It has no CPU and no
//! knowledge of instruction execution; it is driven externally by
//! something that owns a [`SystemBus`] and calls into a
//! [`DeviceManager`] once per emulated bus cycle.
//!
//! # Architecture
//!
//! - `device`: the shared [`Device`] trait, the I/O-delay queue, and
//!   the big-endian word helpers every controller uses.
//! - `bus`: the [`SystemBus`] trait devices use for DMA, decoupling
//!   this crate from any particular memory implementation.
//! - `manager`: address-range routing, IDENT arbitration, and tick
//!   fan-out across every registered device.
//! - `devices`: one module per controller type (RTC, terminal, paper
//!   tape, floppy PIO/DMA, SMD).
//! - `factory`: a single `create_device(kind, thumbwheel)` entry point
//!   over the per-device constructors.
//! - `parity`, `error`: small shared utilities.

pub mod bus;
pub mod device;
pub mod devices;
pub mod error;
pub mod factory;
pub mod manager;
pub mod parity;

pub use bus::SystemBus;
pub use device::Device;
pub use error::DeviceError;
pub use factory::{create_device, DeviceKind};
pub use manager::DeviceManager;

#[cfg(test)]
mod tests {
    use super::*;
    use test_log::test;
    use crate::bus::FlatMemory;

    #[test]
    fn manager_routes_an_rtc_through_the_factory() {
        let mut mgr = DeviceManager::new();
        mgr.add_device(create_device(DeviceKind::Rtc, 0).unwrap()).unwrap();

        let addr = mgr.devices()[0].start_addr();
        let mut bus = FlatMemory::new(1);
        mgr.write(addr + 2, 1, &mut bus); // control: IE
        for _ in 0..11_000 {
            mgr.tick(&mut bus);
        }
        assert_ne!(mgr.ident(13), 0);
    }
}
