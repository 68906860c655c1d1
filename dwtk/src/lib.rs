//! # debugWIRE toolkit for AVR microcontrollers
//!
//! debugWIRE is the single wire debug interface of many small AVR devices, multiplexed
//! onto the RESET pin. This crate drives it: reading and writing registers, SRAM, flash
//! and EEPROM, setting breakpoints and controlling execution.
//!
//! # Examples
//!
//! ## Reading the fuses of the attached chip
//! ```no_run
//! use dwtk::adapter::{self, AdapterSelector};
//! use dwtk::DebugWire;
//! use dwtk_target::Registry;
//!
//! let registry = Registry::from_builtin_families()?;
//!
//! // Use the first adapter found.
//! let adapter = adapter::open(&AdapterSelector::default())?;
//! let mut dw = DebugWire::open(adapter, &registry)?;
//!
//! dw.reset()?;
//! let fuses = dw.read_fuses()?;
//! println!("{}: {}", dw.mcu().name, fuses);
//!
//! // Let the target run again.
//! dw.close(true)?;
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```
//!
//! ## Patching flash
//!
//! ```no_run
//! # use dwtk::DebugWireError;
//! # fn patch(dw: &mut dwtk::DebugWire) -> Result<(), DebugWireError> {
//! // Registers touched by the programming sequence are put back afterwards.
//! let mut cache = dw.cache_all()?;
//! cache.write_flash(0x0100, &[0x08, 0x95])?;
//! cache.release()?;
//! # Ok(())
//! # }
//! ```
#![warn(missing_docs)]

pub mod adapter;
pub mod avr;
mod breakpoints;
mod eeprom;
mod error;
mod flash;
mod fuses;
mod registers;
mod session;

pub use adapter::{Adapter, AdapterError};
pub use eeprom::EepromError;
pub use error::DebugWireError;
pub use flash::FlashError;
pub use fuses::Fuses;
pub use registers::{RegisterCache, RegisterSnapshot};
pub use session::DebugWire;
