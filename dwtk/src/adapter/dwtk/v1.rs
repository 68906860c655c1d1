//! The first generation dwtk adapter.
//!
//! The firmware reports failures through a separate `GetError` request, which is issued
//! after every transfer.

use rusb::{DeviceDescriptor, DeviceHandle, GlobalContext};
use tokio_util::sync::CancellationToken;

use super::{
    continue_flags, control_in_exact, ControlTransport, DwtkError, UsbDevice, WAIT_POLL_INTERVAL,
};
use crate::adapter::{Adapter, AdapterError, BREAK_SYNC};

/// Shared V-USB ids, told apart by the strings below.
const VID: u16 = 0x16c0;
const PID: u16 = 0x05dc;
const MANUFACTURER: &str = "dwtk.rgm.io";
const PRODUCT: &str = "dwtk-hardware";

#[derive(Debug, Clone, Copy)]
#[repr(u8)]
enum Request {
    GetError = 0x40,
    GetBaudratePrescaler,
    DetectBaudrate,
    SetBaudrate,
    Disable,
    Reset,
    GetSignature,
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

/// The dwtk adapter.
#[derive(Debug)]
pub struct DwtkAdapter {
    device: Box<dyn ControlTransport>,
    ubrr: u16,
    baudrate: u32,
}

impl DwtkAdapter {
    /// Opens the adapter. Without a baud rate the adapter detects it.
    pub fn open(baudrate: Option<u32>) -> Result<Self, AdapterError> {
        let (device, _) = UsbDevice::open(VID, PID, is_dwtk)?;
        Self::with_device(Box::new(device), baudrate)
    }

    pub(crate) fn with_device(
        device: Box<dyn ControlTransport>,
        baudrate: Option<u32>,
    ) -> Result<Self, AdapterError> {
        let mut adapter = Self {
            device,
            ubrr: 0,
            baudrate: 0,
        };

        let (prescaler, frequency) = adapter.clock()?;
        adapter.ubrr = match baudrate {
            Some(baudrate) => {
                let ubrr = baudrate_to_ubrr(frequency, prescaler, baudrate);
                adapter.control_in(Request::SetBaudrate, ubrr, 0, &mut [])?;
                ubrr
            }
            None => {
                let mut ubrr = [0; 2];
                adapter.control_in(Request::DetectBaudrate, 0, 0, &mut ubrr)?;
                u16::from_be_bytes(ubrr)
            }
        };
        adapter.baudrate = ubrr_to_baudrate(frequency, prescaler, adapter.ubrr);
        tracing::debug!("dwtk baud rate: {} bps", adapter.baudrate);

        Ok(adapter)
    }

    /// Returns the UART prescaler and the oscillator frequency in MHz of the adapter.
    fn clock(&mut self) -> Result<(u8, u8), AdapterError> {
        let mut clock = [0; 2];
        self.control_in(Request::GetBaudratePrescaler, 0, 0, &mut clock)?;

        match clock {
            [0, _] => Err(DwtkError::InvalidClock("baud rate prescaler").into()),
            [_, 0] => Err(DwtkError::InvalidClock("oscillator frequency").into()),
            [prescaler, frequency] => Ok((prescaler, frequency)),
        }
    }

    fn control_in(
        &mut self,
        request: Request,
        value: u16,
        index: u16,
        buf: &mut [u8],
    ) -> Result<(), AdapterError> {
        tracing::trace!("<<< {:?}({:#06x}, {:#06x})", request, value, index);
        control_in_exact(self.device.as_mut(), request as u8, value, index, buf)?;
        if !buf.is_empty() {
            tracing::trace!("<<< {:02x?}", buf);
        }
        self.check_error()
    }

    fn control_out(
        &mut self,
        request: Request,
        value: u16,
        data: &[u8],
    ) -> Result<(), AdapterError> {
        tracing::trace!(">>> {:?}({:#06x}) {:02x?}", request, value, data);
        self.device.control_out(request as u8, value, 0, data)?;
        self.check_error()
    }

    fn check_error(&mut self) -> Result<(), AdapterError> {
        let mut code = [0];
        control_in_exact(
            self.device.as_mut(),
            Request::GetError as u8,
            0,
            0,
            &mut code,
        )?;

        let error = match code[0] {
            0 => return Ok(()),
            1 => DwtkError::NotInitialized,
            2 => DwtkError::BaudrateDetection,
            3 => DwtkError::EchoMismatch,
            4 => DwtkError::BreakMismatch,
            code => DwtkError::Unknown(code),
        };
        Err(error.into())
    }

    fn read_word(&mut self, request: Request) -> Result<u16, AdapterError> {
        let mut word = [0; 2];
        self.control_in(request, 0, 0, &mut word)?;
        Ok(u16::from_be_bytes(word))
    }
}

fn is_dwtk(handle: &DeviceHandle<GlobalContext>, descriptor: &DeviceDescriptor) -> bool {
    let manufacturer = handle.read_manufacturer_string_ascii(descriptor);
    let product = handle.read_product_string_ascii(descriptor);
    matches!((manufacturer, product), (Ok(m), Ok(p)) if m == MANUFACTURER && p == PRODUCT)
}

fn ubrr_to_baudrate(frequency: u8, prescaler: u8, ubrr: u16) -> u32 {
    u32::from(frequency) * 1_000_000 / (u32::from(prescaler) * (u32::from(ubrr) + 1))
}

fn baudrate_to_ubrr(frequency: u8, prescaler: u8, baudrate: u32) -> u16 {
    let divisor = (u32::from(prescaler) * baudrate).max(1);
    let ubrr = (u32::from(frequency) * 1_000_000 / divisor).saturating_sub(1);
    u16::try_from(ubrr).unwrap_or(u16::MAX)
}

impl Adapter for DwtkAdapter {
    fn name(&self) -> &'static str {
        "dwtk"
    }

    fn info(&self) -> String {
        format!(
            "dwtk custom hardware\nBaud Rate: {} bps\nBaud Rate Register: {:#06x}",
            self.baudrate, self.ubrr
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
        self.read_word(Request::GetSignature)
    }

    // The firmware checks the sync byte itself and reports a mismatch as an error.
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

#[cfg(test)]
mod tests {
    use super::super::mock::MockDevice;
    use super::*;
    use test_case::test_case;

    const GET_ERROR: u8 = Request::GetError as u8;

    fn adapter(baudrate: Option<u32>) -> (DwtkAdapter, MockDevice) {
        let device = MockDevice::default();
        // 16 MHz, double speed UART.
        device.respond(Request::GetBaudratePrescaler as u8, &[8, 16]);
        device.respond(Request::DetectBaudrate as u8, &[0x00, 0x1f]);
        let adapter = DwtkAdapter::with_device(Box::new(device.clone()), baudrate).unwrap();
        device.state().requests.clear();
        (adapter, device)
    }

    #[test_case(16, 8, 31 => 62_500)]
    #[test_case(16, 8, 0 => 2_000_000)]
    #[test_case(20, 16, 9 => 125_000)]
    fn baudrate_from_ubrr(frequency: u8, prescaler: u8, ubrr: u16) -> u32 {
        ubrr_to_baudrate(frequency, prescaler, ubrr)
    }

    #[test_case(16, 8, 62_500 => 31)]
    #[test_case(20, 16, 125_000 => 9)]
    #[test_case(16, 8, 0 => u16::MAX)]
    fn ubrr_from_baudrate(frequency: u8, prescaler: u8, baudrate: u32) -> u16 {
        baudrate_to_ubrr(frequency, prescaler, baudrate)
    }

    #[test]
    fn open_detects_baudrate() {
        let (adapter, _) = adapter(None);
        assert_eq!(
            adapter.info(),
            "dwtk custom hardware\nBaud Rate: 62500 bps\nBaud Rate Register: 0x001f"
        );
    }

    #[test]
    fn open_sets_baudrate() {
        let device = MockDevice::default();
        device.respond(Request::GetBaudratePrescaler as u8, &[8, 16]);
        DwtkAdapter::with_device(Box::new(device.clone()), Some(62_500)).unwrap();

        assert_eq!(
            device.sent(GET_ERROR),
            [
                (Request::GetBaudratePrescaler as u8, 0, 0),
                (Request::SetBaudrate as u8, 31, 0),
            ]
        );
    }

    #[test]
    fn invalid_clock() {
        let device = MockDevice::default();
        device.respond(Request::GetBaudratePrescaler as u8, &[8, 0]);
        let Err(AdapterError::AdapterSpecific(err)) =
            DwtkAdapter::with_device(Box::new(device), None)
        else {
            panic!("expected a clock error");
        };
        assert!(matches!(
            err.downcast_ref::<DwtkError>(),
            Some(DwtkError::InvalidClock("oscillator frequency"))
        ));
    }

    #[test]
    fn every_transfer_polls_the_error() {
        let (mut adapter, device) = adapter(None);
        adapter.write_registers(28, &[1, 2, 3, 4]).unwrap();

        let state = device.state();
        assert_eq!(state.requests.len(), 2);
        assert!(state.requests[0].out);
        assert_eq!(state.requests[0].value, 28);
        assert_eq!(state.requests[0].data, [1, 2, 3, 4]);
        assert_eq!(state.requests[1].request, GET_ERROR);
    }

    #[test_case(1 => matches DwtkError::NotInitialized)]
    #[test_case(3 => matches DwtkError::EchoMismatch)]
    #[test_case(4 => matches DwtkError::BreakMismatch)]
    #[test_case(9 => matches DwtkError::Unknown(9))]
    fn firmware_errors(code: u8) -> DwtkError {
        let (mut adapter, device) = adapter(None);
        device.respond(GET_ERROR, &[code]);

        let Err(AdapterError::AdapterSpecific(err)) = adapter.send_break() else {
            panic!("expected a firmware error");
        };
        match err.downcast_ref::<DwtkError>() {
            Some(DwtkError::NotInitialized) => DwtkError::NotInitialized,
            Some(DwtkError::EchoMismatch) => DwtkError::EchoMismatch,
            Some(DwtkError::BreakMismatch) => DwtkError::BreakMismatch,
            Some(DwtkError::Unknown(code)) => DwtkError::Unknown(*code),
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn resume_packs_breakpoint() {
        let (mut adapter, device) = adapter(None);
        adapter.resume(Some(0x0346), true).unwrap();
        assert_eq!(
            device.sent(GET_ERROR),
            [(Request::Continue as u8, 0x0346, 0b11)]
        );
    }

    #[test]
    fn pc_is_big_endian() {
        let (mut adapter, device) = adapter(None);
        device.respond(Request::GetPc as u8, &[0x01, 0x02]);
        assert_eq!(adapter.read_pc().unwrap(), 0x0102);
    }

    #[test]
    fn wait_polls_until_stopped() {
        let (mut adapter, device) = adapter(None);
        device.respond(Request::Wait as u8, &[0]);
        device.respond(Request::Wait as u8, &[1]);

        assert!(adapter.wait_for_stop(&CancellationToken::new()).unwrap());
        assert_eq!(device.sent(GET_ERROR).len(), 2);
    }
}
