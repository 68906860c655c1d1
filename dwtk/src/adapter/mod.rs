//! Hardware channels that speak debugWIRE to the target.
//!
//! The session engine only ever talks to an [`Adapter`]. Concrete backends:
//!
//! - [`usb_serial::UsbSerialAdapter`]: the RESET line wired to a USB serial converter, with
//!   debugWIRE bit-banged by the host.
//! - [`dwtk::DwtkAdapter`] and [`dwtk::DwtkIceAdapter`]: custom USB adapters that run the
//!   debugWIRE protocol in firmware and are driven with vendor control transfers.
//! - [`fake::FakeAdapter`]: a simulated target for tests.

#[cfg(feature = "dwtk-usb")]
pub mod dwtk;
pub mod fake;
#[cfg(feature = "usb-serial")]
pub mod usb_serial;

use std::fmt;
use std::str::FromStr;

use tokio_util::sync::CancellationToken;

/// The debugWIRE break synchronization byte.
pub const BREAK_SYNC: u8 = 0x55;

/// An abstract debugWIRE channel.
///
/// Program counter values are word addresses exactly as they travel on the wire. Callers
/// that want byte addresses and the post-break correction go through
/// [`DebugWire::pc`](crate::DebugWire::pc) instead.
///
/// Break related calls return the synchronization byte the target answered with. Checking
/// it is up to the caller.
pub trait Adapter: Send + fmt::Debug {
    /// Short backend name.
    fn name(&self) -> &'static str;

    /// Human readable description of the adapter and its link parameters.
    fn info(&self) -> String;

    /// Disables debugWIRE until the next power cycle.
    fn disable(&mut self) -> Result<(), AdapterError>;

    /// Resets the target, which halts it with a break.
    fn reset(&mut self) -> Result<u8, AdapterError>;

    /// Reads the device signature.
    fn read_signature(&mut self) -> Result<u16, AdapterError>;

    /// Halts the target by sending a break and returns the sync byte.
    fn send_break(&mut self) -> Result<u8, AdapterError>;

    /// Waits for the break the target sends when it halts on its own and returns the sync byte.
    fn recv_break(&mut self) -> Result<u8, AdapterError>;

    /// Resumes execution from the current program counter.
    fn go(&mut self) -> Result<(), AdapterError>;

    /// Executes one instruction and returns the sync byte of the break that follows.
    fn step(&mut self) -> Result<u8, AdapterError>;

    /// Resumes execution with an optional hardware breakpoint (byte address) armed.
    fn resume(&mut self, hw_breakpoint: Option<u16>, timers: bool) -> Result<(), AdapterError>;

    /// Blocks until the running target stops on its own.
    ///
    /// Returns `false` if `cancel` fired first. The stop break itself is left for
    /// [`Adapter::recv_break`].
    fn wait_for_stop(&mut self, cancel: &CancellationToken) -> Result<bool, AdapterError>;

    /// Executes a single instruction word as if it was fetched from flash.
    fn write_instruction(&mut self, instruction: u16) -> Result<(), AdapterError>;

    /// Sets the program counter (word address).
    fn write_pc(&mut self, pc: u16) -> Result<(), AdapterError>;

    /// Reads the raw program counter (word address).
    fn read_pc(&mut self) -> Result<u16, AdapterError>;

    /// Writes general purpose registers starting at `start`.
    fn write_registers(&mut self, start: u8, registers: &[u8]) -> Result<(), AdapterError>;

    /// Reads general purpose registers starting at `start`.
    fn read_registers(&mut self, start: u8, registers: &mut [u8]) -> Result<(), AdapterError>;

    /// Writes data space memory.
    fn write_sram(&mut self, address: u16, data: &[u8]) -> Result<(), AdapterError>;

    /// Reads data space memory.
    fn read_sram(&mut self, address: u16, data: &mut [u8]) -> Result<(), AdapterError>;

    /// Reads flash memory.
    fn read_flash(&mut self, address: u16, data: &mut [u8]) -> Result<(), AdapterError>;
}

/// Marker for backend specific error types, which get boxed into
/// [`AdapterError::AdapterSpecific`].
pub trait AdapterSpecificError: std::error::Error + Send + Sync + 'static {}

/// A boxed [`AdapterSpecificError`].
#[derive(Debug, thiserror::Error)]
#[error("{0}")]
pub struct BoxedAdapterError(Box<dyn AdapterSpecificError>);

impl BoxedAdapterError {
    /// Returns the inner error if it is of type `E`.
    pub fn downcast_ref<E: AdapterSpecificError>(&self) -> Option<&E> {
        let inner: &(dyn std::error::Error + 'static) = self.0.as_ref();
        inner.downcast_ref()
    }
}

impl<E: AdapterSpecificError> From<E> for BoxedAdapterError {
    fn from(value: E) -> Self {
        Self(Box::new(value))
    }
}

/// Errors reported by an [`Adapter`].
#[derive(Debug, thiserror::Error, docsplay::Display)]
pub enum AdapterError {
    /// An I/O error occurred on the transport.
    Io(#[from] std::io::Error),

    /// A serial port error occurred.
    #[cfg(feature = "usb-serial")]
    Serial(#[from] serialport::Error),

    /// A USB error occurred.
    #[cfg(feature = "dwtk-usb")]
    Usb(#[from] rusb::Error),

    /// Got unexpected byte echoed back: expected {expected:#04x}, got {got:#04x}
    #[ignore_extra_doc_attributes]
    ///
    /// The debugWIRE line is shared by both directions, so every byte the host sends
    /// comes back. A different byte means the line lost synchronization.
    EchoMismatch {
        /// The byte that was sent.
        expected: u8,
        /// The byte that came back.
        got: u8,
    },

    /// The link went quiet before the expected data arrived.
    UnexpectedEof,

    /// Operation not supported by this transport: {0}
    NotSupported(&'static str),

    /// No debugWIRE adapter found.
    NotFound,

    /// More than one adapter found, select one explicitly: {0}
    Ambiguous(String),

    /// An error specific to the adapter backend occurred.
    AdapterSpecific(#[source] BoxedAdapterError),
}

impl<E: AdapterSpecificError> From<E> for AdapterError {
    fn from(value: E) -> Self {
        Self::AdapterSpecific(value.into())
    }
}

/// The adapter backend to use.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum AdapterKind {
    /// Try every backend: dwtk-ice, then dwtk, then USB serial.
    #[default]
    Auto,
    /// Bit-banged USB serial converter.
    UsbSerial,
    /// dwtk USB adapter.
    Dwtk,
    /// dwtk-ice USB adapter.
    DwtkIce,
}

impl FromStr for AdapterKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "auto" => Ok(Self::Auto),
            "usb-serial" | "serial" => Ok(Self::UsbSerial),
            "dwtk" => Ok(Self::Dwtk),
            "dwtk-ice" | "ice" => Ok(Self::DwtkIce),
            _ => Err(format!(
                "unknown adapter '{s}', expected one of: auto, usb-serial, dwtk, dwtk-ice"
            )),
        }
    }
}

impl fmt::Display for AdapterKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Auto => "auto",
            Self::UsbSerial => "usb-serial",
            Self::Dwtk => "dwtk",
            Self::DwtkIce => "dwtk-ice",
        })
    }
}

/// How to find and configure an adapter.
#[derive(Debug, Clone, Default)]
pub struct AdapterSelector {
    /// Which backend to use.
    pub kind: AdapterKind,
    /// Serial port for the USB serial backend. Detected when unset.
    pub serial_port: Option<String>,
    /// debugWIRE baud rate. Detected when unset.
    pub baudrate: Option<u32>,
}

/// Opens the adapter described by `selector`.
///
/// With [`AdapterKind::Auto`] the USB adapters are tried first and the first backend whose
/// device is present wins.
pub fn open(selector: &AdapterSelector) -> Result<Box<dyn Adapter>, AdapterError> {
    tracing::debug!("Opening adapter: {:?}", selector);

    match selector.kind {
        #[cfg(feature = "dwtk-usb")]
        AdapterKind::DwtkIce => Ok(Box::new(dwtk::DwtkIceAdapter::open()?)),
        #[cfg(feature = "dwtk-usb")]
        AdapterKind::Dwtk => Ok(Box::new(dwtk::DwtkAdapter::open(selector.baudrate)?)),
        #[cfg(feature = "usb-serial")]
        AdapterKind::UsbSerial => Ok(Box::new(usb_serial::UsbSerialAdapter::open(
            selector.serial_port.as_deref(),
            selector.baudrate,
        )?)),
        AdapterKind::Auto => open_any(selector),
        #[allow(unreachable_patterns)]
        kind => Err(AdapterError::NotSupported(match kind {
            AdapterKind::UsbSerial => "usb-serial support was not compiled in",
            _ => "dwtk USB adapter support was not compiled in",
        })),
    }
}

fn open_any(selector: &AdapterSelector) -> Result<Box<dyn Adapter>, AdapterError> {
    #[cfg(feature = "dwtk-usb")]
    if selector.serial_port.is_none() {
        match dwtk::DwtkIceAdapter::open() {
            Ok(adapter) => return Ok(Box::new(adapter)),
            Err(AdapterError::NotFound) => {}
            Err(e) => return Err(e),
        }

        match dwtk::DwtkAdapter::open(selector.baudrate) {
            Ok(adapter) => return Ok(Box::new(adapter)),
            Err(AdapterError::NotFound) => {}
            Err(e) => return Err(e),
        }
    }

    #[cfg(feature = "usb-serial")]
    {
        Ok(Box::new(usb_serial::UsbSerialAdapter::open(
            selector.serial_port.as_deref(),
            selector.baudrate,
        )?))
    }

    #[cfg(not(feature = "usb-serial"))]
    {
        let _ = selector;
        Err(AdapterError::NotFound)
    }
}
