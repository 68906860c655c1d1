//! debugWIRE bit-banged over a USB serial converter.
//!
//! TX and RX of the converter are tied together (through a resistor on TX) and wired to
//! the RESET pin of the target. The host speaks the raw debugWIRE command set, so every
//! byte sent comes back as an echo.

mod port;

use std::time::Duration;

use serialport::SerialPortType;
use tokio_util::sync::CancellationToken;

use self::port::{Line, Port, SerialDevice};
use super::{Adapter, AdapterError, AdapterSpecificError, BREAK_SYNC};

/// Read timeout of the port. Longer than any frame, the echo of our own bytes always
/// arrives well within it.
const READ_TIMEOUT: Duration = Duration::from_millis(200);

/// Time the converter needs to settle after opening.
const SETTLE_TIME: Duration = Duration::from_millis(30);

const WAIT_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Errors specific to the USB serial backend.
#[derive(Debug, thiserror::Error, docsplay::Display)]
pub enum UsbSerialError {
    /// The target did not answer the initial break with 0x55, got {0:#04x}
    NoSync(u8),

    /// Failed to detect the baud rate on serial port {0}
    #[ignore_extra_doc_attributes]
    ///
    /// No rate between 20 MHz / 128 and 1 MHz / 128 got a break answered. The target may
    /// not have `DWEN` programmed, or runs from a clock slower than 1 MHz.
    BaudrateDetection(String),

    /// Transfer of {0} bytes does not fit in one debugWIRE command.
    TooLarge(usize),
}

impl AdapterSpecificError for UsbSerialError {}

/// The USB serial debugWIRE adapter.
#[derive(Debug)]
pub struct UsbSerialAdapter {
    line: Line<Box<dyn Port>>,
    port_name: String,
}

impl UsbSerialAdapter {
    /// Opens the adapter.
    ///
    /// Without a port name the only USB serial port present is used. Without a baud rate
    /// it is detected from the break response of the target.
    pub fn open(port_name: Option<&str>, baudrate: Option<u32>) -> Result<Self, AdapterError> {
        let port_name = match port_name {
            Some(name) => name.to_owned(),
            None => detect_port()?,
        };

        let baudrate = match baudrate {
            Some(baudrate) => baudrate,
            None => {
                let baudrate =
                    detect_baudrate(&port_name, |baudrate| open_port(&port_name, baudrate))?;
                tracing::debug!("Detected baud rate: {}", baudrate);
                baudrate
            }
        };

        let port = open_port(&port_name, baudrate)?;
        Self::with_port(port, port_name, baudrate)
    }

    /// Wraps an already open port and synchronizes with the target.
    pub(crate) fn with_port(
        port: Box<dyn Port>,
        port_name: String,
        baudrate: u32,
    ) -> Result<Self, AdapterError> {
        let mut adapter = Self {
            line: Line::new(port, baudrate),
            port_name,
        };

        let sync = adapter.send_break()?;
        if sync != BREAK_SYNC {
            return Err(UsbSerialError::NoSync(sync).into());
        }

        Ok(adapter)
    }

    /// Encodes a transfer length for the `d1` counter register.
    fn length(len: usize, scale: usize, extra: usize) -> Result<[u8; 2], AdapterError> {
        len.checked_mul(scale)
            .and_then(|l| l.checked_add(extra))
            .and_then(|l| u16::try_from(l).ok())
            .map(u16::to_be_bytes)
            .ok_or_else(|| UsbSerialError::TooLarge(len).into())
    }

    fn register_command(&mut self, start: u8, len: usize, mode: u8) -> Result<(), AdapterError> {
        let end = u8::try_from(usize::from(start) + len)
            .map_err(|_| AdapterError::from(UsbSerialError::TooLarge(len)))?;
        self.line
            .write(&[0x66, 0xd0, 0x00, start, 0xd1, 0x00, end, 0xc2, mode, 0x20]);
        Ok(())
    }

    /// Points Z at `address` and sets up a memory transfer.
    fn memory_command(
        &mut self,
        address: u16,
        direction: u8,
        length: [u8; 2],
        mode: u8,
    ) -> Result<(), AdapterError> {
        self.write_registers(30, &address.to_le_bytes())?;
        let [hi, lo] = length;
        self.line
            .write(&[0x66, 0xd0, 0x00, direction, 0xd1, hi, lo, 0xc2, mode, 0x20]);
        Ok(())
    }
}

impl Adapter for UsbSerialAdapter {
    fn name(&self) -> &'static str {
        "usb-serial"
    }

    fn info(&self) -> String {
        format!(
            "Serial Port (USB Serial): {}\nBaud Rate: {} bps",
            self.port_name,
            self.line.baudrate()
        )
    }

    fn disable(&mut self) -> Result<(), AdapterError> {
        self.line.write(&[0x06]);
        self.line.commit()
    }

    fn reset(&mut self) -> Result<u8, AdapterError> {
        self.send_break()?;
        self.line.write(&[0x07]);
        self.line.recv_break()
    }

    fn read_signature(&mut self) -> Result<u16, AdapterError> {
        self.line.write(&[0xf3]);
        self.line.read_word()
    }

    fn send_break(&mut self) -> Result<u8, AdapterError> {
        self.line.send_break()?;
        self.line.recv_break()
    }

    fn recv_break(&mut self) -> Result<u8, AdapterError> {
        self.line.recv_break()
    }

    fn go(&mut self) -> Result<(), AdapterError> {
        self.line.write(&[0x40, 0x30]);
        self.line.commit()
    }

    fn step(&mut self) -> Result<u8, AdapterError> {
        self.line.write(&[0x60, 0x31]);
        self.line.recv_break()
    }

    fn resume(&mut self, hw_breakpoint: Option<u16>, timers: bool) -> Result<(), AdapterError> {
        let mut control = 0x60;
        if let Some(address) = hw_breakpoint {
            let [hi, lo] = (address / 2).to_be_bytes();
            self.line.write(&[0xd1, hi, lo]);
            control = 0x61;
        }
        if timers {
            control -= 0x20;
        }
        self.line.write(&[control, 0x30]);
        self.line.commit()
    }

    fn wait_for_stop(&mut self, cancel: &CancellationToken) -> Result<bool, AdapterError> {
        loop {
            if cancel.is_cancelled() {
                return Ok(false);
            }
            if self.line.has_input()? {
                return Ok(true);
            }
            std::thread::sleep(WAIT_POLL_INTERVAL);
        }
    }

    fn write_instruction(&mut self, instruction: u16) -> Result<(), AdapterError> {
        let [hi, lo] = instruction.to_be_bytes();
        self.line.write(&[0x64, 0xd2, hi, lo, 0x23]);
        Ok(())
    }

    fn write_pc(&mut self, pc: u16) -> Result<(), AdapterError> {
        let [hi, lo] = pc.to_be_bytes();
        self.line.write(&[0xd0, hi, lo]);
        Ok(())
    }

    fn read_pc(&mut self) -> Result<u16, AdapterError> {
        self.line.write(&[0xf0]);
        self.line.read_word()
    }

    fn write_registers(&mut self, start: u8, registers: &[u8]) -> Result<(), AdapterError> {
        self.register_command(start, registers.len(), 0x05)?;
        self.line.write(registers);
        Ok(())
    }

    fn read_registers(&mut self, start: u8, registers: &mut [u8]) -> Result<(), AdapterError> {
        self.register_command(start, registers.len(), 0x01)?;
        self.line.read(registers)
    }

    fn write_sram(&mut self, address: u16, data: &[u8]) -> Result<(), AdapterError> {
        let length = Self::length(data.len(), 2, 1)?;
        self.memory_command(address, 0x01, length, 0x04)?;
        self.line.write(data);
        self.line.commit()
    }

    fn read_sram(&mut self, address: u16, data: &mut [u8]) -> Result<(), AdapterError> {
        let length = Self::length(data.len(), 2, 1)?;
        self.memory_command(address, 0x00, length, 0x00)?;
        self.line.read(data)
    }

    fn read_flash(&mut self, address: u16, data: &mut [u8]) -> Result<(), AdapterError> {
        let length = Self::length(data.len(), 2, 0)?;
        self.memory_command(address, 0x00, length, 0x02)?;
        self.line.read(data)
    }
}

/// Finds the single USB serial port of the system.
fn detect_port() -> Result<String, AdapterError> {
    let ports: Vec<String> = serialport::available_ports()?
        .into_iter()
        .filter(|port| matches!(port.port_type, SerialPortType::UsbPort(_)))
        .map(|port| port.port_name)
        // macOS lists every device twice, the call-out device is the one to use.
        .filter(|name| !cfg!(target_os = "macos") || name.contains("/cu."))
        .collect();

    match ports.as_slice() {
        [] => Err(AdapterError::NotFound),
        [port] => {
            tracing::debug!("Detected serial port: {}", port);
            Ok(port.clone())
        }
        _ => Err(AdapterError::Ambiguous(ports.join(", "))),
    }
}

fn open_port(port_name: &str, baudrate: u32) -> Result<Box<dyn Port>, AdapterError> {
    let serial = serialport::new(port_name, baudrate)
        .timeout(READ_TIMEOUT)
        .open()?;
    let mut device = SerialDevice(serial);

    std::thread::sleep(SETTLE_TIME);
    device.clear_input()?;

    Ok(Box::new(device))
}

/// Baud rates to try, fastest first. debugWIRE runs at the target clock divided by 128,
/// and targets up to 20 MHz are expected.
fn candidate_baudrates() -> impl Iterator<Item = u32> {
    (1..=20).rev().map(|mhz| mhz * 1_000_000 / 128)
}

/// Tries every candidate rate on a freshly opened port until a break is answered with
/// the sync byte.
fn detect_baudrate(
    port_name: &str,
    mut open: impl FnMut(u32) -> Result<Box<dyn Port>, AdapterError>,
) -> Result<u32, AdapterError> {
    for baudrate in candidate_baudrates() {
        let mut line = Line::new(open(baudrate)?, baudrate);
        line.send_break()?;

        // Targets on very slow clocks may not answer at all.
        match line.recv_break() {
            Ok(BREAK_SYNC) => return Ok(baudrate),
            Ok(sync) => tracing::trace!("No sync at {} bps, got {:#04x}", baudrate, sync),
            Err(AdapterError::UnexpectedEof) => tracing::trace!("No answer at {} bps", baudrate),
            Err(e) => return Err(e),
        }
    }

    Err(UsbSerialError::BaudrateDetection(port_name.to_owned()).into())
}
