//! dwtk-ice, the second generation adapter.
//!
//! Every IN transfer starts with a three byte status `{code, arg1, arg2}` in front of the
//! payload. OUT transfers are followed by a `GetError` request that returns the same
//! status.

use std::time::Duration;

use tokio_util::sync::CancellationToken;

use super::{
    continue_flags, control_in_exact, ControlTransport, DwtkError, UsbDevice, WAIT_POLL_INTERVAL,
};
use crate::adapter::{Adapter, AdapterError, BREAK_SYNC};

/// OpenMoko, Inc.
const VID: u16 = 0x1d50;
/// dwtk In-Circuit Emulator
const PID: u16 = 0x614c;

const CAPABILITY_DEBUGWIRE: u8 = 0b01;

/// The adapter detects the baud rate with interrupts disabled, and does not answer USB
/// requests meanwhile.
const DETECT_BAUDRATE_TIME: Duration = Duration::from_millis(30);

const STATUS_LEN: usize = 3;

#[derive(Debug, Clone, Copy)]
#[repr(u8)]
enum Request {
    GetError = 0x01,
    GetCapabilities = 0x02,
    DetectBaudrate = 0x40,
    GetBaudrate,
    Disable,
    Reset,
    ReadSignature,
    SendBreak,
    RecvBreak,
    Go,
    Step,
    Continue,
    Wait,
    WriteInstruction,
    SetPc,
    GetPc,
    Registers,
    Sram,
    ReadFlash,
}

fn check_status(status: [u8; STATUS_LEN]) -> Result<(), DwtkError> {
    let [code, arg1, arg2] = status;
    let error = match code {
        0x00 => return Ok(()),
        0x01 => DwtkError::Unsupported,
        0x40 => DwtkError::BaudrateDetection,
        0x41 => DwtkError::EchoMismatchDetails {
            expected: arg1,
            got: arg2,
        },
        0x42 => DwtkError::BreakMismatchDetails(arg1),
        0x43 => DwtkError::TooLarge,
        code => DwtkError::Unknown(code),
    };
    Err(error)
}

/// Baud rates of the link as reported by the adapter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct LinkClock {
    ubrr: u16,
    /// The rate measured from the target.
    target: u32,
    /// The rate the adapter UART actually runs at.
    actual: u32,
}

impl LinkClock {
    fn from_report(report: [u8; 6]) -> Result<Self, DwtkError> {
        let [frequency, prescaler, pulse_hi, pulse_lo, ubrr_hi, ubrr_lo] = report;
        let pulse_width = u16::from_be_bytes([pulse_hi, pulse_lo]);
        let ubrr = u16::from_be_bytes([ubrr_hi, ubrr_lo]);

        if prescaler == 0 {
            return Err(DwtkError::InvalidClock("baud rate prescaler"));
        }
        if pulse_width == 0 {
            return Err(DwtkError::InvalidClock("pulse width"));
        }

        let clock = u32::from(frequency) * 1_000_000;
        Ok(Self {
            ubrr,
            target: clock / u32::from(pulse_width),
            actual: clock / (u32::from(prescaler) * (u32::from(ubrr) + 1)),
        })
    }
}

/// The dwtk-ice adapter.
#[derive(Debug)]
pub struct DwtkIceAdapter {
    device: Box<dyn ControlTransport>,
    version: String,
    clock: LinkClock,
}

impl DwtkIceAdapter {
    /// Opens the adapter and lets it detect the baud rate of the target.
    pub fn open() -> Result<Self, AdapterError> {
        let (device, descriptor) = UsbDevice::open(VID, PID, |_, _| true)?;
        let version = descriptor.device_version();
        let version = format!(
            "{}.{}{}",
            version.major(),
            version.minor(),
            version.sub_minor()
        );
        tracing::debug!("Detected dwtk-ice {}", version);

        Self::with_device(Box::new(device), version)
    }

    pub(crate) fn with_device(
        mut device: Box<dyn ControlTransport>,
        version: String,
    ) -> Result<Self, AdapterError> {
        let mut capabilities = [0];
        control_in(device.as_mut(), Request::GetCapabilities, 0, 0, &mut capabilities)?;
        if capabilities[0] & CAPABILITY_DEBUGWIRE == 0 {
            return Err(DwtkError::NoDebugWire.into());
        }

        control_in(device.as_mut(), Request::DetectBaudrate, 0, 0, &mut [])?;
        std::thread::sleep(DETECT_BAUDRATE_TIME);
        check_error(device.as_mut())?;

        let mut report = [0; 6];
        control_in(device.as_mut(), Request::GetBaudrate, 0, 0, &mut report)?;
        let clock = LinkClock::from_report(report)?;
        tracing::debug!("dwtk-ice baud rate: {} bps", clock.actual);

        Ok(Self {
            device,
            version,
            clock,
        })
    }

    fn control_in(
        &mut self,
        request: Request,
        value: u16,
        index: u16,
        buf: &mut [u8],
    ) -> Result<(), AdapterError> {
        control_in(self.device.as_mut(), request, value, index, buf)
    }

    fn control_out(
        &mut self,
        request: Request,
        value: u16,
        data: &[u8],
    ) -> Result<(), AdapterError> {
        tracing::trace!(">>> {:?}({:#06x}) {:02x?}", request, value, data);
        self.device.control_out(request as u8, value, 0, data)?;
        check_error(self.device.as_mut())
    }

    fn read_word(&mut self, request: Request) -> Result<u16, AdapterError> {
        let mut word = [0; 2];
        self.control_in(request, 0, 0, &mut word)?;
        Ok(u16::from_be_bytes(word))
    }
}

fn control_in(
    device: &mut dyn ControlTransport,
    request: Request,
    value: u16,
    index: u16,
    buf: &mut [u8],
) -> Result<(), AdapterError> {
    tracing::trace!("<<< {:?}({:#06x}, {:#06x})", request, value, index);

    let mut response = vec![0; STATUS_LEN + buf.len()];
    control_in_exact(device, request as u8, value, index, &mut response)?;
    let (status, data) = response.split_at(STATUS_LEN);
    tracing::trace!("<<< status {:02x?} {:02x?}", status, data);

    check_status([status[0], status[1], status[2]])?;
    buf.copy_from_slice(data);
    Ok(())
}

fn check_error(device: &mut dyn ControlTransport) -> Result<(), AdapterError> {
    let mut status = [0; STATUS_LEN];
    control_in_exact(device, Request::GetError as u8, 0, 0, &mut status)?;
    Ok(check_status(status)?)
}

impl Adapter for DwtkIceAdapter {
    fn name(&self) -> &'static str {
        "dwtk-ice"
    }

    fn info(&self) -> String {
        format!(
            "dwtk-ice {}\nTarget baudrate: {} bps\nActual baudrate: {} bps\nBaudrate Register: {:#06x}",
            self.version, self.clock.target, self.clock.actual, self.clock.ubrr
        )
    }

    fn disable(&mut self) -> Result<(), AdapterError> {
        self.control_in(Request::Disable, 0, 0, &mut [])
    }

    fn reset(&mut self) -> Result<u8, AdapterError> {
        self.control_in(Request::Reset, 0, 0, &mut [])?;
        Ok(BREAK_SYNC)
    }

    fn read_signature(&mut self) -> Result<u16, AdapterError> {
        self.read_word(Request::ReadSignature)
    }

    // A bad sync byte comes back as a status code.
    fn send_break(&mut self) -> Result<u8, AdapterError> {
        self.control_in(Request::SendBreak, 0, 0, &mut [])?;
        Ok(BREAK_SYNC)
    }

    fn recv_break(&mut self) -> Result<u8, AdapterError> {
        self.control_in(Request::RecvBreak, 0, 0, &mut [])?;
        Ok(BREAK_SYNC)
    }

    fn go(&mut self) -> Result<(), AdapterError> {
        self.control_in(Request::Go, 0, 0, &mut [])
    }

    fn step(&mut self) -> Result<u8, AdapterError> {
        self.control_in(Request::Step, 0, 0, &mut [])?;
        Ok(BREAK_SYNC)
    }

    fn resume(&mut self, hw_breakpoint: Option<u16>, timers: bool) -> Result<(), AdapterError> {
        let (value, index) = continue_flags(hw_breakpoint, timers);
        self.control_in(Request::Continue, value, index, &mut [])
    }

    fn wait_for_stop(&mut self, cancel: &CancellationToken) -> Result<bool, AdapterError> {
        loop {
            if cancel.is_cancelled() {
                return Ok(false);
            }

            let mut stopped = [0];
            self.control_in(Request::Wait, 0, 0, &mut stopped)?;
            if stopped[0] != 0 {
                return Ok(true);
            }

            std::thread::sleep(WAIT_POLL_INTERVAL);
        }
    }

    fn write_instruction(&mut self, instruction: u16) -> Result<(), AdapterError> {
        self.control_in(Request::WriteInstruction, instruction, 0, &mut [])
    }

    fn write_pc(&mut self, pc: u16) -> Result<(), AdapterError> {
        self.control_in(Request::SetPc, pc, 0, &mut [])
    }

    fn read_pc(&mut self) -> Result<u16, AdapterError> {
        self.read_word(Request::GetPc)
    }

    fn write_registers(&mut self, start: u8, registers: &[u8]) -> Result<(), AdapterError> {
        self.control_out(Request::Registers, start.into(), registers)
    }

    fn read_registers(&mut self, start: u8, registers: &mut [u8]) -> Result<(), AdapterError> {
        self.control_in(Request::Registers, start.into(), 0, registers)
    }

    fn write_sram(&mut self, address: u16, data: &[u8]) -> Result<(), AdapterError> {
        self.control_out(Request::Sram, address, data)
    }

    fn read_sram(&mut self, address: u16, data: &mut [u8]) -> Result<(), AdapterError> {
        self.control_in(Request::Sram, address, 0, data)
    }

    fn read_flash(&mut self, address: u16, data: &mut [u8]) -> Result<(), AdapterError> {
        self.control_in(Request::ReadFlash, address, 0, data)
    }
}
