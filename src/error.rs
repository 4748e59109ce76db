//! Out-of-band error surface for host/setup failures.
//!
//! In-band device errors (disk I/O failure, address mismatch, illegal
//! register load while active) are never represented here: they are
//! recorded into the offending device's own status/error register, the
//! way real ND-100 software observes them. This type exists only for
//! failures that happen before or around normal bus traffic: opening a
//! backing file, wiring up a device manager, picking an out-of-range
//! thumbwheel at construction time.

use std::io;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum DeviceError {
    #[error("I/O error on device {device}: {source}")]
    Io {
        device: &'static str,
        #[source]
        source: io::Error,
    },

    #[error("no such thumbwheel position {thumbwheel} for device type {device_type}")]
    UnknownThumbwheel {
        device_type: &'static str,
        thumbwheel: u8,
    },

    #[error("device manager is full ({max} devices already registered)")]
    ManagerFull { max: usize },

    #[error("address range {start:#o}..={end:#o} overlaps an already-registered device")]
    OverlappingAddress { start: u16, end: u16 },
}
