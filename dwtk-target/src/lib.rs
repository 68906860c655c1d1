//! MCU description schema
//!
//! debugWIRE sessions need a handful of per-chip facts that the protocol does not
//! report by itself: flash and page sizes, EEPROM size and the addresses of the
//! self-programming and EEPROM control registers. This crate holds the schema for
//! those descriptions and the table of built-in AVR devices, looked up by the
//! 16-bit signature the target reports.
#![warn(missing_docs)]

mod mcu;
mod registry;
pub(crate) mod serialize;

pub use mcu::{FirmwareError, FlashPage, Mcu};
pub use registry::{McuFamily, Registry, RegistryError};
