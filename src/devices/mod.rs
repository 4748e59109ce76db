//! Concrete device implementations: one module per controller type.

pub mod floppy_dma;
pub mod floppy_pio;
pub mod paper_tape;
pub mod rtc;
pub mod smd;
pub mod terminal;
