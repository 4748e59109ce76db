//! A single dispatch surface over the six `Create*Device(thumbwheel)`
//! factories the original keeps as separate functions (one per
//! `deviceX.c`). Grounded on that shared shape: pick a type, hand it a
//! thumbwheel switch position, get back a boxed [`Device`].

use crate::device::Device;
use crate::devices::{floppy_dma, floppy_pio, paper_tape, rtc, smd, terminal};
use crate::error::DeviceError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceKind {
    Rtc,
    Terminal,
    PaperTape,
    FloppyPio,
    FloppyDma,
    Smd,
}

pub fn create_device(kind: DeviceKind, thumbwheel: u8) -> Result<Box<dyn Device>, DeviceError> {
    Ok(match kind {
        DeviceKind::Rtc => Box::new(rtc::RtcDevice::new(thumbwheel)?),
        DeviceKind::Terminal => Box::new(terminal::TerminalDevice::new(thumbwheel)?),
        DeviceKind::PaperTape => Box::new(paper_tape::PaperTapeDevice::new(thumbwheel)?),
        DeviceKind::FloppyPio => Box::new(floppy_pio::FloppyPioDevice::new(thumbwheel)?),
        DeviceKind::FloppyDma => Box::new(floppy_dma::FloppyDmaDevice::new(thumbwheel)?),
        DeviceKind::Smd => Box::new(smd::SmdDevice::new(thumbwheel)?),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_log::test;

    #[test]
    fn every_kind_builds_at_thumbwheel_zero() {
        for kind in [
            DeviceKind::Rtc,
            DeviceKind::Terminal,
            DeviceKind::PaperTape,
            DeviceKind::FloppyPio,
            DeviceKind::FloppyDma,
            DeviceKind::Smd,
        ] {
            assert!(create_device(kind, 0).is_ok());
        }
    }

    #[test]
    fn out_of_range_thumbwheel_is_rejected() {
        assert!(create_device(DeviceKind::Rtc, 200).is_err());
    }
}
