//! A simulated debugWIRE target.
//!
//! This is not an instruction set simulator. It models the parts of an AVR that the
//! debugWIRE engine touches: the register file and data space, flash with its
//! temporary page buffer, EEPROM, fuses and the program counter, plus the handful of
//! instructions the engine injects (`IN`, `OUT`, `SPM`, `LPM` and `ADIW`).
//!
//! Resuming scans flash forward from the program counter for a `BREAK` opcode or the
//! hardware breakpoint, and stops there.
#![allow(missing_docs)]

use std::sync::Arc;
use std::time::Duration;

use dwtk_target::Mcu;
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

use super::{Adapter, AdapterError, AdapterSpecificError, BREAK_SYNC};
use crate::avr::{self, eecr, spmcsr};
use crate::Fuses;

/// Size of the simulated data space.
const DATA_SPACE_SIZE: usize = 0x1_0000;
/// First data space address of the I/O registers.
const IO_OFFSET: usize = 0x20;

/// Operations that can be told to fail with [`FakeTarget::fail_nth`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FakeOp {
    Disable,
    Reset,
    ReadSignature,
    SendBreak,
    RecvBreak,
    Go,
    Step,
    Resume,
    WaitForStop,
    WriteInstruction,
    WritePc,
    ReadPc,
    WriteRegisters,
    ReadRegisters,
    WriteSram,
    ReadSram,
    ReadFlash,
}

#[derive(Debug, thiserror::Error, docsplay::Display)]
pub enum FakeError {
    /// Injected failure of {0:?}
    Injected(FakeOp),
    /// Instruction {0:#06x} is not simulated
    UnsupportedInstruction(u16),
    /// The target is running
    Running,
    /// The target is halted, no break will arrive
    NotRunning,
    /// Access out of range: {address:#06x} + {len:#06x}
    OutOfRange { address: usize, len: usize },
    /// debugWIRE is disabled
    Disabled,
}

impl AdapterSpecificError for FakeError {}

/// State of the simulated MCU.
#[derive(Debug)]
pub struct FakeTarget {
    pub mcu: Mcu,
    /// Registers, I/O space and SRAM.
    pub data: Vec<u8>,
    pub flash: Vec<u8>,
    pub eeprom: Vec<u8>,
    pub fuses: Fuses,
    /// The sync byte answered on every break.
    pub break_sync: u8,

    /// Word address of the next instruction.
    pub pc: u16,
    /// Set on every break. The wire reports `pc + 1` until the PC is written.
    skewed: bool,
    running: bool,
    pending_stop: Option<u16>,
    pub timers: bool,
    pub disabled: bool,

    page_buffer: Vec<u8>,
    eempe_armed: bool,

    pub page_erases: usize,
    pub page_writes: usize,
    pub eeprom_writes: usize,
    pub breaks_sent: usize,
    pub resets: usize,

    failures: Vec<(FakeOp, usize)>,
}

impl FakeTarget {
    pub fn new(mcu: Mcu) -> Self {
        let page_size = usize::from(mcu.flash_page_size);
        let mut data = vec![0; DATA_SPACE_SIZE];

        // Stack pointer at the end of a small SRAM.
        data[usize::from(avr::SPL)] = 0x5f;
        data[usize::from(avr::SPL) + 1] = 0x02;

        Self {
            flash: vec![0xff; usize::from(mcu.flash_size)],
            eeprom: vec![0xff; usize::from(mcu.eeprom_size)],
            mcu,
            data,
            fuses: Fuses {
                low: 0x62,
                high: 0x9f,
                extended: 0xff,
                lock: 0xff,
            },
            break_sync: BREAK_SYNC,
            pc: 0,
            skewed: false,
            running: false,
            pending_stop: None,
            timers: false,
            disabled: false,
            page_buffer: vec![0xff; page_size],
            eempe_armed: false,
            page_erases: 0,
            page_writes: 0,
            eeprom_writes: 0,
            breaks_sent: 0,
            resets: 0,
            failures: Vec::new(),
        }
    }

    /// Makes the next call of `op` fail.
    pub fn fail_next(&mut self, op: FakeOp) {
        self.fail_nth(op, 0);
    }

    /// Makes the call of `op` after `skip` successful ones fail.
    pub fn fail_nth(&mut self, op: FakeOp, skip: usize) {
        self.failures.push((op, skip));
    }

    /// Stops the running target at word address `pc`, as if it hit a breakpoint.
    pub fn trigger_stop(&mut self, pc: u16) {
        self.pending_stop = Some(pc);
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    pub fn register(&self, index: u8) -> u8 {
        self.data[usize::from(index)]
    }

    pub fn set_register(&mut self, index: u8, value: u8) {
        self.data[usize::from(index)] = value;
    }

    pub fn sreg(&self) -> u8 {
        self.data[usize::from(avr::SREG)]
    }

    pub fn flash_word(&self, address: u16) -> u16 {
        let address = usize::from(address);
        u16::from_le_bytes([self.flash[address], self.flash[address + 1]])
    }

    fn enter(&mut self, op: FakeOp) -> Result<(), FakeError> {
        let mut failed = false;
        self.failures.retain_mut(|(failing, skip)| {
            if *failing != op || failed {
                return true;
            }
            if *skip == 0 {
                failed = true;
                false
            } else {
                *skip -= 1;
                true
            }
        });

        if failed {
            return Err(FakeError::Injected(op));
        }
        if self.disabled {
            return Err(FakeError::Disabled);
        }

        Ok(())
    }

    fn enter_halted(&mut self, op: FakeOp) -> Result<(), FakeError> {
        self.enter(op)?;
        if self.running {
            return Err(FakeError::Running);
        }
        Ok(())
    }

    fn halt(&mut self, pc: Option<u16>) {
        if let Some(pc) = pc {
            self.pc = pc;
        }
        self.running = false;
        self.pending_stop = None;
        self.skewed = true;
    }

    fn z(&self) -> u16 {
        u16::from_le_bytes([self.data[30], self.data[31]])
    }

    fn set_z(&mut self, z: u16) {
        [self.data[30], self.data[31]] = z.to_le_bytes();
    }

    fn io(&self, addr: u8) -> u8 {
        self.data[IO_OFFSET + usize::from(addr)]
    }

    fn check_range(address: usize, len: usize, size: usize) -> Result<(), FakeError> {
        if address + len > size {
            return Err(FakeError::OutOfRange { address, len });
        }
        Ok(())
    }

    fn run(&mut self, hw_breakpoint: Option<u16>) {
        self.running = true;
        self.pending_stop = None;

        let words = self.flash.len() / 2;
        for word in usize::from(self.pc)..words {
            let byte_address = (word * 2) as u16;
            if hw_breakpoint == Some(byte_address) || self.flash_word(byte_address) == avr::BREAK {
                self.pending_stop = Some(word as u16);
                break;
            }
        }
    }

    fn execute(&mut self, instruction: u16) -> Result<(), FakeError> {
        let arm_eeprom = self.eempe_armed;
        self.eempe_armed = false;

        if instruction & 0xf000 == 0xb000 {
            let addr = (((instruction >> 5) & 0x30) | (instruction & 0x0f)) as u8;
            let reg = usize::from(((instruction >> 4) & 0x1f) as u8);

            if instruction & 0x0800 != 0 {
                let value = self.data[reg];
                self.data[IO_OFFSET + usize::from(addr)] = value;
                if addr == self.mcu.eecr {
                    self.eeprom_control(value, arm_eeprom);
                }
            } else {
                self.data[reg] = self.io(addr);
            }
            return Ok(());
        }

        if instruction & 0xff00 == 0x9600 {
            let reg = 24 + 2 * usize::from(((instruction >> 4) & 0b11) as u8);
            let value = ((instruction >> 2) & 0x30) | (instruction & 0x0f);
            let pair = u16::from_le_bytes([self.data[reg], self.data[reg + 1]]);
            let (result, carry) = pair.overflowing_add(value);
            [self.data[reg], self.data[reg + 1]] = result.to_le_bytes();

            let sreg = &mut self.data[usize::from(avr::SREG)];
            *sreg &= !0b11;
            *sreg |= u8::from(carry) | (u8::from(result == 0) << 1);
            return Ok(());
        }

        if instruction & 0xfe0e == 0x9004 {
            let reg = usize::from(((instruction >> 4) & 0x1f) as u8);
            let z = self.z();
            let control = self.io(self.mcu.spmcsr);

            let value = if control & spmcsr::RFLB != 0 {
                self.data[IO_OFFSET + usize::from(self.mcu.spmcsr)] = 0;
                match z {
                    0 => self.fuses.low,
                    1 => self.fuses.lock,
                    2 => self.fuses.extended,
                    3 => self.fuses.high,
                    _ => 0xff,
                }
            } else {
                Self::check_range(usize::from(z), 1, self.flash.len())?;
                self.flash[usize::from(z)]
            };
            self.data[reg] = value;

            if instruction & 1 != 0 {
                self.set_z(z.wrapping_add(1));
            }
            return Ok(());
        }

        if instruction == avr::SPM {
            return self.store_program_memory();
        }

        Err(FakeError::UnsupportedInstruction(instruction))
    }

    fn store_program_memory(&mut self) -> Result<(), FakeError> {
        let control = self.io(self.mcu.spmcsr);
        self.data[IO_OFFSET + usize::from(self.mcu.spmcsr)] = 0;

        if control & spmcsr::SELFPRGEN == 0 {
            return Err(FakeError::UnsupportedInstruction(avr::SPM));
        }

        let page_size = usize::from(self.mcu.flash_page_size);
        let z = usize::from(self.z());
        Self::check_range(z, 1, self.flash.len())?;
        let page = z & !(page_size - 1);

        match control & !spmcsr::SELFPRGEN {
            spmcsr::CTPB => self.page_buffer.fill(0xff),
            spmcsr::PGERS => {
                self.flash[page..page + page_size].fill(0xff);
                self.page_erases += 1;
            }
            spmcsr::PGWRT => {
                // Programming only ever clears bits.
                for (cell, value) in self.flash[page..page + page_size]
                    .iter_mut()
                    .zip(&self.page_buffer)
                {
                    *cell &= value;
                }
                self.page_buffer.fill(0xff);
                self.page_writes += 1;
            }
            0 => {
                let offset = (z % page_size) & !1;
                self.page_buffer[offset] = self.data[0];
                self.page_buffer[offset + 1] = self.data[1];
            }
            _ => return Err(FakeError::UnsupportedInstruction(avr::SPM)),
        }

        Ok(())
    }

    fn eeprom_control(&mut self, value: u8, armed: bool) {
        let mut address = usize::from(self.io(self.mcu.eearl()));
        if let Some(eearh) = self.mcu.eearh() {
            address |= usize::from(self.io(eearh)) << 8;
        }
        address %= self.eeprom.len().max(1);

        if value & eecr::EEMPE != 0 {
            self.eempe_armed = true;
        }
        if value & eecr::EEPE != 0 && armed {
            self.eeprom[address] = self.io(self.mcu.eedr());
            self.eeprom_writes += 1;
        }
        if value & eecr::EERE != 0 {
            self.data[IO_OFFSET + usize::from(self.mcu.eedr())] = self.eeprom[address];
        }
    }
}

/// Shared handle to the simulated target, for inspecting it while an engine owns the adapter.
pub type FakeHandle = Arc<Mutex<FakeTarget>>;

/// An [`Adapter`] backed by a [`FakeTarget`].
#[derive(Debug, Clone)]
pub struct FakeAdapter {
    target: FakeHandle,
}

impl FakeAdapter {
    pub fn new(mcu: Mcu) -> Self {
        Self {
            target: Arc::new(Mutex::new(FakeTarget::new(mcu))),
        }
    }

    /// A handle to the simulated target.
    pub fn target(&self) -> FakeHandle {
        self.target.clone()
    }
}

impl Adapter for FakeAdapter {
    fn name(&self) -> &'static str {
        "fake"
    }

    fn info(&self) -> String {
        format!("Simulated {}", self.target.lock().mcu.name)
    }

    fn disable(&mut self) -> Result<(), AdapterError> {
        let mut target = self.target.lock();
        target.enter(FakeOp::Disable)?;
        target.disabled = true;
        Ok(())
    }

    fn reset(&mut self) -> Result<u8, AdapterError> {
        let mut target = self.target.lock();
        target.enter(FakeOp::Reset)?;
        target.resets += 1;
        target.halt(Some(0));
        Ok(target.break_sync)
    }

    fn read_signature(&mut self) -> Result<u16, AdapterError> {
        let mut target = self.target.lock();
        target.enter_halted(FakeOp::ReadSignature)?;
        Ok(target.mcu.signature)
    }

    fn send_break(&mut self) -> Result<u8, AdapterError> {
        let mut target = self.target.lock();
        target.enter(FakeOp::SendBreak)?;
        target.breaks_sent += 1;
        let stop = if target.running {
            target.pending_stop
        } else {
            None
        };
        target.halt(stop);
        Ok(target.break_sync)
    }

    fn recv_break(&mut self) -> Result<u8, AdapterError> {
        let mut target = self.target.lock();
        target.enter(FakeOp::RecvBreak)?;
        match (target.running, target.pending_stop) {
            (true, Some(pc)) => {
                target.halt(Some(pc));
                Ok(target.break_sync)
            }
            _ => Err(FakeError::NotRunning.into()),
        }
    }

    fn go(&mut self) -> Result<(), AdapterError> {
        let mut target = self.target.lock();
        target.enter_halted(FakeOp::Go)?;
        target.run(None);
        Ok(())
    }

    fn step(&mut self) -> Result<u8, AdapterError> {
        let mut target = self.target.lock();
        target.enter_halted(FakeOp::Step)?;
        let next = target.pc.wrapping_add(1);
        target.halt(Some(next));
        Ok(target.break_sync)
    }

    fn resume(&mut self, hw_breakpoint: Option<u16>, timers: bool) -> Result<(), AdapterError> {
        let mut target = self.target.lock();
        target.enter_halted(FakeOp::Resume)?;
        target.timers = timers;
        target.run(hw_breakpoint);
        Ok(())
    }

    fn wait_for_stop(&mut self, cancel: &CancellationToken) -> Result<bool, AdapterError> {
        self.target.lock().enter(FakeOp::WaitForStop)?;

        loop {
            {
                let target = self.target.lock();
                if !target.running {
                    return Err(FakeError::NotRunning.into());
                }
                if target.pending_stop.is_some() {
                    return Ok(true);
                }
            }

            if cancel.is_cancelled() {
                return Ok(false);
            }
            std::thread::sleep(Duration::from_millis(10));
        }
    }

    fn write_instruction(&mut self, instruction: u16) -> Result<(), AdapterError> {
        let mut target = self.target.lock();
        target.enter_halted(FakeOp::WriteInstruction)?;
        target.execute(instruction)?;
        Ok(())
    }

    fn write_pc(&mut self, pc: u16) -> Result<(), AdapterError> {
        let mut target = self.target.lock();
        target.enter_halted(FakeOp::WritePc)?;
        target.pc = pc;
        target.skewed = false;
        Ok(())
    }

    fn read_pc(&mut self) -> Result<u16, AdapterError> {
        let mut target = self.target.lock();
        target.enter_halted(FakeOp::ReadPc)?;
        Ok(target.pc.wrapping_add(u16::from(target.skewed)))
    }

    fn write_registers(&mut self, start: u8, registers: &[u8]) -> Result<(), AdapterError> {
        let mut target = self.target.lock();
        target.enter_halted(FakeOp::WriteRegisters)?;
        let start = usize::from(start);
        FakeTarget::check_range(start, registers.len(), usize::from(avr::NUM_REGISTERS))?;
        target.data[start..start + registers.len()].copy_from_slice(registers);
        Ok(())
    }

    fn read_registers(&mut self, start: u8, registers: &mut [u8]) -> Result<(), AdapterError> {
        let mut target = self.target.lock();
        target.enter_halted(FakeOp::ReadRegisters)?;
        let start = usize::from(start);
        FakeTarget::check_range(start, registers.len(), usize::from(avr::NUM_REGISTERS))?;
        registers.copy_from_slice(&target.data[start..start + registers.len()]);
        Ok(())
    }

    fn write_sram(&mut self, address: u16, data: &[u8]) -> Result<(), AdapterError> {
        let mut target = self.target.lock();
        target.enter_halted(FakeOp::WriteSram)?;
        let start = usize::from(address);
        FakeTarget::check_range(start, data.len(), DATA_SPACE_SIZE)?;
        target.data[start..start + data.len()].copy_from_slice(data);
        // The transfer runs through Z.
        target.set_z(address.wrapping_add(data.len() as u16));
        Ok(())
    }

    fn read_sram(&mut self, address: u16, data: &mut [u8]) -> Result<(), AdapterError> {
        let mut target = self.target.lock();
        target.enter_halted(FakeOp::ReadSram)?;
        let start = usize::from(address);
        FakeTarget::check_range(start, data.len(), DATA_SPACE_SIZE)?;
        data.copy_from_slice(&target.data[start..start + data.len()]);
        target.set_z(address.wrapping_add(data.len() as u16));
        Ok(())
    }

    fn read_flash(&mut self, address: u16, data: &mut [u8]) -> Result<(), AdapterError> {
        let mut target = self.target.lock();
        target.enter_halted(FakeOp::ReadFlash)?;
        let start = usize::from(address);
        FakeTarget::check_range(start, data.len(), target.flash.len())?;
        data.copy_from_slice(&target.flash[start..start + data.len()]);
        target.set_z(address.wrapping_add(data.len() as u16));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn mcu() -> Mcu {
        dwtk_target::Registry::from_builtin_families()
            .unwrap()
            .get_by_name("ATtiny85")
            .unwrap()
            .clone()
    }

    #[test]
    fn pc_is_skewed_after_break_until_written() {
        let mut adapter = FakeAdapter::new(mcu());
        adapter.target().lock().pc = 0x10;

        assert_eq!(adapter.send_break().unwrap(), 0x55);
        assert_eq!(adapter.read_pc().unwrap(), 0x11);
        assert_eq!(adapter.read_pc().unwrap(), 0x11);

        adapter.write_pc(0x10).unwrap();
        assert_eq!(adapter.read_pc().unwrap(), 0x10);
    }

    #[test]
    fn resume_stops_at_break_opcode() {
        let mut adapter = FakeAdapter::new(mcu());
        let target = adapter.target();
        target.lock().flash[0x20..0x22].copy_from_slice(&avr::BREAK.to_le_bytes());

        adapter.resume(None, false).unwrap();
        assert!(adapter
            .wait_for_stop(&CancellationToken::new())
            .unwrap());
        assert_eq!(adapter.recv_break().unwrap(), 0x55);
        assert_eq!(target.lock().pc, 0x10);
        assert!(!target.lock().is_running());
    }

    #[test]
    fn resume_stops_at_hardware_breakpoint() {
        let mut adapter = FakeAdapter::new(mcu());
        adapter.resume(Some(0x40), true).unwrap();
        assert!(adapter
            .wait_for_stop(&CancellationToken::new())
            .unwrap());
        adapter.recv_break().unwrap();
        assert_eq!(adapter.target().lock().pc, 0x20);
        assert!(adapter.target().lock().timers);
    }

    #[test]
    fn wait_is_cancellable() {
        let mut adapter = FakeAdapter::new(mcu());
        adapter.go().unwrap();

        let cancel = CancellationToken::new();
        cancel.cancel();
        assert!(!adapter.wait_for_stop(&cancel).unwrap());
    }

    #[test]
    fn halted_target_rejects_recv_break() {
        let mut adapter = FakeAdapter::new(mcu());
        assert!(adapter.recv_break().is_err());
    }

    #[test]
    fn running_target_rejects_memory_access() {
        let mut adapter = FakeAdapter::new(mcu());
        adapter.go().unwrap();
        let mut buf = [0; 2];
        assert!(adapter.read_flash(0, &mut buf).is_err());
    }

    #[test]
    fn injected_failure_happens_once() {
        let mut adapter = FakeAdapter::new(mcu());
        adapter.target().lock().fail_nth(FakeOp::ReadPc, 1);

        assert!(adapter.read_pc().is_ok());
        assert!(adapter.read_pc().is_err());
        assert!(adapter.read_pc().is_ok());
    }

    #[test]
    fn in_and_out_move_io_registers() {
        let mut adapter = FakeAdapter::new(mcu());
        adapter.write_registers(16, &[0xa5]).unwrap();
        adapter.write_instruction(avr::out(0x18, 16)).unwrap();
        adapter.write_instruction(avr::in_(0x18, 17)).unwrap();

        let mut reg = [0];
        adapter.read_registers(17, &mut reg).unwrap();
        assert_eq!(reg, [0xa5]);
    }

    #[test]
    fn adiw_updates_pair_and_flags() {
        let mut adapter = FakeAdapter::new(mcu());
        adapter.write_registers(30, &[0xfe, 0xff]).unwrap();
        adapter.write_instruction(avr::adiw(30, 2)).unwrap();

        let target = adapter.target();
        let target = target.lock();
        assert_eq!(target.register(30), 0);
        assert_eq!(target.register(31), 0);
        assert_eq!(target.sreg() & 0b11, 0b11);
    }

    #[test]
    fn unknown_instruction_is_rejected() {
        let mut adapter = FakeAdapter::new(mcu());
        assert!(adapter.write_instruction(0x0000).is_err());
    }
}
