use std::collections::BTreeMap;

use dwtk_target::{Mcu, Registry};
use tokio_util::sync::CancellationToken;

use crate::adapter::{Adapter, BREAK_SYNC};
use crate::DebugWireError;

/// A debugWIRE session with one target.
///
/// The session owns the [`Adapter`], the descriptor of the MCU found at the other end of
/// the wire and the breakpoint state. Everything that talks to the target goes through
/// it, one operation at a time.
#[derive(Debug)]
pub struct DebugWire {
    pub(crate) adapter: Box<dyn Adapter>,
    pub(crate) mcu: Mcu,
    pub(crate) timers: bool,
    pub(crate) hw_breakpoint: Option<u16>,
    pub(crate) sw_breakpoints: BTreeMap<u16, u16>,
    /// The next wire read of the PC is one word ahead.
    pub(crate) after_break: bool,
}

impl DebugWire {
    /// Starts a session by reading the signature of the attached target and looking it
    /// up in `registry`.
    pub fn open(mut adapter: Box<dyn Adapter>, registry: &Registry) -> Result<Self, DebugWireError> {
        let signature = adapter.read_signature()?;
        tracing::debug!("Target signature: {:#06x}", signature);

        let mcu = registry
            .get_by_signature(signature)
            .ok_or(DebugWireError::McuNotFound(signature))?
            .clone();
        tracing::info!("Detected MCU: {} ({:#06x})", mcu.name, signature);

        Ok(Self::new(adapter, mcu))
    }

    /// Starts a session for a known MCU, without checking the signature.
    pub fn new(adapter: Box<dyn Adapter>, mcu: Mcu) -> Self {
        Self {
            adapter,
            mcu,
            timers: false,
            hw_breakpoint: None,
            sw_breakpoints: BTreeMap::new(),
            after_break: false,
        }
    }

    /// The descriptor of the target MCU.
    pub fn mcu(&self) -> &Mcu {
        &self.mcu
    }

    /// Description of the adapter in use.
    pub fn info(&self) -> String {
        self.adapter.info()
    }

    /// Whether timers keep running while the target executes.
    pub fn timers(&self) -> bool {
        self.timers
    }

    /// Sets whether timers keep running while the target executes.
    pub fn set_timers(&mut self, timers: bool) {
        self.timers = timers;
    }

    /// Re-reads the device signature.
    pub fn signature(&mut self) -> Result<u16, DebugWireError> {
        Ok(self.adapter.read_signature()?)
    }

    /// Disables debugWIRE until the next power cycle, which makes ISP usable again.
    pub fn disable(&mut self) -> Result<(), DebugWireError> {
        tracing::info!("Disabling debugWIRE");
        Ok(self.adapter.disable()?)
    }

    /// Resets the target. It stays halted.
    pub fn reset(&mut self) -> Result<(), DebugWireError> {
        tracing::debug!("Resetting target");
        let sync = self.adapter.reset()?;
        self.synchronized(sync)
    }

    /// Halts a running target.
    pub fn send_break(&mut self) -> Result<(), DebugWireError> {
        let sync = self.adapter.send_break()?;
        self.synchronized(sync)
    }

    /// Consumes the break a target sends when it stops on its own.
    pub fn recv_break(&mut self) -> Result<(), DebugWireError> {
        let sync = self.adapter.recv_break()?;
        self.synchronized(sync)
    }

    fn synchronized(&mut self, sync: u8) -> Result<(), DebugWireError> {
        if sync != BREAK_SYNC {
            return Err(DebugWireError::BreakMismatch(sync));
        }
        self.after_break = true;
        Ok(())
    }

    /// Resumes the target, ignoring breakpoints.
    pub fn go(&mut self) -> Result<(), DebugWireError> {
        Ok(self.adapter.go()?)
    }

    /// Executes a single instruction.
    pub fn step(&mut self) -> Result<(), DebugWireError> {
        let sync = self.adapter.step()?;
        self.synchronized(sync)
    }

    /// Resumes the target with the hardware breakpoint and timer settings of the session.
    pub fn resume(&mut self) -> Result<(), DebugWireError> {
        tracing::debug!(
            "Continuing, hardware breakpoint: {:x?}, timers: {}",
            self.hw_breakpoint,
            self.timers
        );
        Ok(self.adapter.resume(self.hw_breakpoint, self.timers)?)
    }

    /// Blocks until the target stops on its own, or `cancel` fires.
    ///
    /// Returns `true` if the target stopped. The stop break still has to be consumed
    /// with [`DebugWire::recv_break`].
    pub fn wait_for_stop(&mut self, cancel: &CancellationToken) -> Result<bool, DebugWireError> {
        Ok(self.adapter.wait_for_stop(cancel)?)
    }

    /// Executes a raw instruction on the halted target.
    pub fn write_instruction(&mut self, instruction: u16) -> Result<(), DebugWireError> {
        tracing::trace!("Injecting instruction {:#06x}", instruction);
        Ok(self.adapter.write_instruction(instruction)?)
    }

    /// Reads the program counter as a byte address.
    ///
    /// Right after a break the wire reports one word past the instruction the target
    /// halted at. That is corrected here, once.
    pub fn pc(&mut self) -> Result<u16, DebugWireError> {
        let mut pc = self.adapter.read_pc()?;
        if self.after_break && pc > 0 {
            pc -= 1;
        }
        self.after_break = false;
        Ok(pc.wrapping_mul(2))
    }

    /// Sets the program counter from a byte address.
    pub fn set_pc(&mut self, pc: u16) -> Result<(), DebugWireError> {
        self.adapter.write_pc(pc / 2)?;
        self.after_break = false;
        Ok(())
    }

    /// Ends the session.
    ///
    /// Software breakpoints still patched into flash are removed first, after a reset
    /// that makes sure the target is halted. With `resume`, the target is then reset and
    /// left running. Every step is attempted, and all failures are reported together.
    pub fn close(mut self, resume: bool) -> Result<(), DebugWireError> {
        let mut errors = Vec::new();

        if self.has_sw_breakpoints() {
            tracing::info!(
                "Removing {} software breakpoint(s) before closing",
                self.sw_breakpoints.len()
            );
            if let Err(e) = self.reset() {
                errors.push(e);
            }
            if let Err(e) = self.clear_sw_breakpoints() {
                errors.push(e);
            }
        }

        if resume {
            if let Err(e) = self.reset().and_then(|()| self.go()) {
                errors.push(e);
            }
        }

        DebugWireError::join(errors)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::fake::{FakeAdapter, FakeOp};
    use pretty_assertions::assert_eq;

    fn session() -> (DebugWire, crate::adapter::fake::FakeHandle) {
        let registry = Registry::from_builtin_families().unwrap();
        let mcu = registry.get_by_name("ATtiny85").unwrap().clone();
        let adapter = FakeAdapter::new(mcu);
        let target = adapter.target();
        (DebugWire::open(Box::new(adapter), &registry).unwrap(), target)
    }

    #[test]
    fn open_detects_mcu() {
        let (dw, _) = session();
        assert_eq!(dw.mcu().name, "ATtiny85");
    }

    #[test]
    fn open_unknown_signature() {
        let registry = Registry::from_builtin_families().unwrap();
        let mut mcu = registry.get_by_name("ATtiny85").unwrap().clone();
        mcu.signature = 0x1234;

        let err = DebugWire::open(Box::new(FakeAdapter::new(mcu)), &registry).unwrap_err();
        assert!(matches!(err, DebugWireError::McuNotFound(0x1234)));
    }

    #[test]
    fn pc_is_corrected_once_after_break() {
        let (mut dw, target) = session();
        target.lock().pc = 0x20;

        dw.send_break().unwrap();
        assert_eq!(dw.pc().unwrap(), 0x40);
        // Raw value still carries the skew, but the correction is spent.
        assert_eq!(dw.pc().unwrap(), 0x42);
    }

    #[test]
    fn pc_zero_is_not_corrected() {
        let (mut dw, _) = session();
        dw.adapter.write_pc(0).unwrap();
        dw.after_break = true;

        assert_eq!(dw.pc().unwrap(), 0);
    }

    #[test]
    fn set_pc_clears_correction() {
        let (mut dw, _) = session();
        dw.reset().unwrap();
        dw.set_pc(0x100).unwrap();
        assert_eq!(dw.pc().unwrap(), 0x100);
    }

    #[test]
    fn step_advances_and_synchronizes() {
        let (mut dw, _) = session();
        dw.reset().unwrap();
        dw.set_pc(0x10).unwrap();
        dw.step().unwrap();
        assert_eq!(dw.pc().unwrap(), 0x12);
    }

    #[test]
    fn bad_sync_byte() {
        let (mut dw, target) = session();
        target.lock().break_sync = 0xf8;

        assert!(matches!(
            dw.send_break(),
            Err(DebugWireError::BreakMismatch(0xf8))
        ));
        assert!(!dw.after_break);
    }

    #[test]
    fn close_resumes_target() {
        let (dw, target) = session();
        dw.close(true).unwrap();

        let target = target.lock();
        assert_eq!(target.resets, 1);
        assert!(target.is_running());
    }

    #[test]
    fn close_without_resume_leaves_target_halted() {
        let (dw, target) = session();
        dw.close(false).unwrap();

        let target = target.lock();
        assert_eq!(target.resets, 0);
        assert!(!target.is_running());
    }

    #[test]
    fn close_reports_every_failure() {
        let (mut dw, target) = session();
        dw.set_sw_breakpoint(0x10).unwrap();

        target.lock().fail_nth(FakeOp::Reset, 0);
        target.lock().fail_nth(FakeOp::Go, 0);

        let err = dw.close(true).unwrap_err();
        let DebugWireError::Cleanup(errors) = err else {
            panic!("expected a joined error, got {err:?}");
        };
        assert_eq!(errors.len(), 2);
        // The breakpoint was removed despite the failed reset.
        assert_eq!(target.lock().flash_word(0x10), 0xffff);
    }
}
