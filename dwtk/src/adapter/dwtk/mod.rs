//! The dwtk USB adapters.
//!
//! Both run the debugWIRE protocol in their own firmware and take one vendor control
//! request per operation. The request and its arguments travel in `bRequest`, `wValue`
//! and `wIndex`, payloads in the data stage.

mod ice;
mod v1;

pub use ice::DwtkIceAdapter;
pub use v1::DwtkAdapter;

use std::fmt;
use std::time::Duration;

use itertools::Itertools;
use rusb::{DeviceHandle, Direction, GlobalContext, Recipient, RequestType};

use super::{AdapterError, AdapterSpecificError};

const USB_TIMEOUT: Duration = Duration::from_secs(5);

/// How often a running target is polled for a stop.
const WAIT_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Errors reported by the dwtk adapter firmwares.
#[derive(Debug, thiserror::Error, docsplay::Display)]
pub enum DwtkError {
    /// The adapter hardware is not initialized.
    NotInitialized,

    /// The adapter failed to detect the baud rate of the target.
    BaudrateDetection,

    /// Got unexpected byte echoed back by the target.
    EchoMismatch,

    /// Got unexpected byte echoed back: expected {expected:#04x}, got {got:#04x}
    EchoMismatchDetails {
        /// The byte that was sent.
        expected: u8,
        /// The byte that came back.
        got: u8,
    },

    /// Got unexpected break value from the target.
    BreakMismatch,

    /// Got unexpected break value: expected 0x55, got {0:#04x}
    BreakMismatchDetails(u8),

    /// Read or write data is too large for the adapter.
    TooLarge,

    /// The adapter firmware does not support this command.
    Unsupported,

    /// Unrecognized hardware error: {0:#04x}
    Unknown(u8),

    /// The adapter reported an invalid {0}.
    InvalidClock(&'static str),

    /// The adapter does not support debugWIRE. This is probably a connection problem.
    NoDebugWire,

    /// Short read for request {request:#04x}: expected {expected} bytes, got {got}
    ShortRead {
        /// The request.
        request: u8,
        /// The requested length.
        expected: usize,
        /// The received length.
        got: usize,
    },
}

impl AdapterSpecificError for DwtkError {}

/// Vendor control requests to a adapter.
pub(crate) trait ControlTransport: Send + fmt::Debug {
    /// Reads into `buf` and returns the received length.
    fn control_in(
        &mut self,
        request: u8,
        value: u16,
        index: u16,
        buf: &mut [u8],
    ) -> Result<usize, AdapterError>;

    fn control_out(
        &mut self,
        request: u8,
        value: u16,
        index: u16,
        data: &[u8],
    ) -> Result<(), AdapterError>;
}

/// An opened adapter with interface 0 claimed.
pub(crate) struct UsbDevice {
    handle: DeviceHandle<GlobalContext>,
    description: String,
}

impl fmt::Debug for UsbDevice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UsbDevice")
            .field("description", &self.description)
            .finish()
    }
}

impl UsbDevice {
    /// Opens the only device with the given ids.
    ///
    /// `filter` can reject candidates after opening, for adapters that share their ids with
    /// other devices.
    pub fn open(
        vendor_id: u16,
        product_id: u16,
        filter: impl Fn(&DeviceHandle<GlobalContext>, &rusb::DeviceDescriptor) -> bool,
    ) -> Result<(Self, rusb::DeviceDescriptor), AdapterError> {
        let mut found = Vec::new();

        for device in rusb::devices()?.iter() {
            let Ok(descriptor) = device.device_descriptor() else {
                continue;
            };
            if descriptor.vendor_id() != vendor_id || descriptor.product_id() != product_id {
                continue;
            }

            let handle = match device.open() {
                Ok(handle) => handle,
                Err(e) => {
                    tracing::warn!(
                        "Failed to open {:04x}:{:04x} at bus {} address {}: {}",
                        vendor_id,
                        product_id,
                        device.bus_number(),
                        device.address(),
                        e
                    );
                    continue;
                }
            };
            if !filter(&handle, &descriptor) {
                continue;
            }

            let description = format!(
                "{:04x}:{:04x} (bus {}, address {})",
                vendor_id,
                product_id,
                device.bus_number(),
                device.address()
            );
            found.push((handle, descriptor, description));
        }

        if found.len() > 1 {
            return Err(AdapterError::Ambiguous(
                found.iter().map(|(_, _, description)| description).join(", "),
            ));
        }
        let Some((handle, descriptor, description)) = found.pop() else {
            return Err(AdapterError::NotFound);
        };

        handle.claim_interface(0)?;
        tracing::debug!("Opened {}", description);

        Ok((
            Self {
                handle,
                description,
            },
            descriptor,
        ))
    }

    fn request_type(direction: Direction) -> u8 {
        rusb::request_type(direction, RequestType::Vendor, Recipient::Device)
    }
}

impl ControlTransport for UsbDevice {
    fn control_in(
        &mut self,
        request: u8,
        value: u16,
        index: u16,
        buf: &mut [u8],
    ) -> Result<usize, AdapterError> {
        Ok(self.handle.read_control(
            Self::request_type(Direction::In),
            request,
            value,
            index,
            buf,
            USB_TIMEOUT,
        )?)
    }

    fn control_out(
        &mut self,
        request: u8,
        value: u16,
        index: u16,
        data: &[u8],
    ) -> Result<(), AdapterError> {
        self.handle.write_control(
            Self::request_type(Direction::Out),
            request,
            value,
            index,
            data,
            USB_TIMEOUT,
        )?;
        Ok(())
    }
}

/// Reads exactly `buf.len()` bytes.
fn control_in_exact(
    transport: &mut dyn ControlTransport,
    request: u8,
    value: u16,
    index: u16,
    buf: &mut [u8],
) -> Result<(), AdapterError> {
    let got = transport.control_in(request, value, index, buf)?;
    if got != buf.len() {
        return Err(DwtkError::ShortRead {
            request,
            expected: buf.len(),
            got,
        }
        .into());
    }
    Ok(())
}

/// `wValue` and `wIndex` of a continue request.
fn continue_flags(hw_breakpoint: Option<u16>, timers: bool) -> (u16, u16) {
    let mut flags = 0;
    if hw_breakpoint.is_some() {
        flags |= 0b01;
    }
    if timers {
        flags |= 0b10;
    }
    (hw_breakpoint.unwrap_or(0), flags)
}
