use crate::avr;
use crate::{DebugWire, DebugWireError};

impl DebugWire {
    /// Arms the hardware breakpoint at byte address `address`.
    ///
    /// There is only one. Returns `false`, leaving it untouched, if it is already in use.
    pub fn set_hw_breakpoint(&mut self, address: u16) -> bool {
        if self.hw_breakpoint.is_some() {
            return false;
        }
        tracing::debug!("Setting hardware breakpoint at {:#06x}", address);
        self.hw_breakpoint = Some(address);
        true
    }

    /// Disarms the hardware breakpoint.
    pub fn clear_hw_breakpoint(&mut self) {
        self.hw_breakpoint = None;
    }

    /// The address of the hardware breakpoint, if armed.
    pub fn hw_breakpoint(&self) -> Option<u16> {
        self.hw_breakpoint
    }

    /// Patches a `BREAK` into flash at `address`, saving the instruction it replaces.
    pub fn set_sw_breakpoint(&mut self, address: u16) -> Result<(), DebugWireError> {
        let mut word = [0; 2];
        self.read_flash(address, &mut word)?;
        let original = u16::from_le_bytes(word);

        tracing::debug!(
            "Setting software breakpoint at {:#06x}, replacing {:#06x}",
            address,
            original
        );
        self.sw_breakpoints.insert(address, original);
        self.write_flash_instruction(address, avr::BREAK)
    }

    /// Restores the instruction a software breakpoint replaced. Unknown addresses are ignored.
    pub fn clear_sw_breakpoint(&mut self, address: u16) -> Result<(), DebugWireError> {
        let Some(&original) = self.sw_breakpoints.get(&address) else {
            return Ok(());
        };

        tracing::debug!("Clearing software breakpoint at {:#06x}", address);
        self.write_flash_instruction(address, original)?;
        self.sw_breakpoints.remove(&address);
        Ok(())
    }

    /// Removes every software breakpoint.
    ///
    /// Keeps going when one fails, and reports all failures at the end. Breakpoints
    /// that could not be removed stay tracked.
    pub fn clear_sw_breakpoints(&mut self) -> Result<(), DebugWireError> {
        let addresses: Vec<u16> = self.sw_breakpoints.keys().copied().collect();

        let errors = addresses
            .into_iter()
            .filter_map(|address| self.clear_sw_breakpoint(address).err())
            .collect();

        DebugWireError::join(errors)
    }

    /// Whether any software breakpoint is patched into flash.
    pub fn has_sw_breakpoints(&self) -> bool {
        !self.sw_breakpoints.is_empty()
    }
}
