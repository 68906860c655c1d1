//! EEPROM access through the EEPROM control registers.

use std::time::Duration;

use crate::avr::{self, eecr};
use crate::{DebugWire, DebugWireError};

/// Time the target needs to program one EEPROM byte.
const EEPROM_WRITE_TIME: Duration = Duration::from_millis(5);

/// Errors of EEPROM accesses.
#[derive(Debug, thiserror::Error, docsplay::Display)]
pub enum EepromError {
    /// Access out of eeprom space: {address:#06x} + {len:#06x} > {eeprom_size:#06x}
    OutOfRange {
        /// The requested address.
        address: u16,
        /// The requested length.
        len: usize,
        /// Size of the EEPROM.
        eeprom_size: u16,
    },
}

impl DebugWire {
    fn check_eeprom_range(&self, address: u16, len: usize) -> Result<(), EepromError> {
        if u32::from(address) + len as u32 > u32::from(self.mcu.eeprom_size) {
            return Err(EepromError::OutOfRange {
                address,
                len,
                eeprom_size: self.mcu.eeprom_size,
            });
        }
        Ok(())
    }

    /// Latches Z into `EEAR`.
    fn load_eeprom_address(&mut self) -> Result<(), DebugWireError> {
        self.write_instruction(avr::out(self.mcu.eearl(), 30))?;
        if let Some(eearh) = self.mcu.eearh() {
            self.write_instruction(avr::out(eearh, 31))?;
        }
        Ok(())
    }

    /// Writes EEPROM, one byte at a time. Clobbers R0 and R28-R31.
    pub fn write_eeprom(&mut self, address: u16, data: &[u8]) -> Result<(), DebugWireError> {
        self.check_eeprom_range(address, data.len())?;
        tracing::debug!("Writing {} EEPROM byte(s) at {:#06x}", data.len(), address);

        let [lo, hi] = address.to_le_bytes();
        self.write_registers(28, &[eecr::EEMPE, eecr::EEPE, lo, hi])?;

        for &byte in data {
            self.load_eeprom_address()?;
            self.write_registers(0, &[byte])?;
            self.write_instruction(avr::out(self.mcu.eedr(), 0))?;
            self.write_instruction(avr::adiw(30, 1))?;
            self.write_instruction(avr::out(self.mcu.eecr, 28))?;
            self.write_instruction(avr::out(self.mcu.eecr, 29))?;
            self.send_break()?;

            std::thread::sleep(EEPROM_WRITE_TIME);
        }

        Ok(())
    }

    /// Reads EEPROM. Clobbers R0 and R29-R31.
    pub fn read_eeprom(&mut self, address: u16, data: &mut [u8]) -> Result<(), DebugWireError> {
        self.check_eeprom_range(address, data.len())?;

        let [lo, hi] = address.to_le_bytes();
        self.write_registers(29, &[eecr::EERE, lo, hi])?;

        for byte in data.iter_mut() {
            self.load_eeprom_address()?;
            self.write_instruction(avr::out(self.mcu.eecr, 29))?;
            self.write_instruction(avr::adiw(30, 1))?;
            self.write_instruction(avr::in_(self.mcu.eedr(), 0))?;

            let mut value = [0];
            self.read_registers(0, &mut value)?;
            *byte = value[0];
        }

        Ok(())
    }

    /// Writes EEPROM, skipping bytes that already hold the wanted value.
    ///
    /// Returns the number of bytes actually written.
    pub fn update_eeprom(&mut self, address: u16, data: &[u8]) -> Result<usize, DebugWireError> {
        self.check_eeprom_range(address, data.len())?;

        let mut current = vec![0; data.len()];
        {
            let mut cache = self.cache(&[0, 29, 30, 31])?;
            cache.read_eeprom(address, &mut current)?;
            cache.release()?;
        }

        let mut written = 0;
        let mut offset = 0;
        while offset < data.len() {
            if current[offset] == data[offset] {
                offset += 1;
                continue;
            }

            let run = data[offset..]
                .iter()
                .zip(&current[offset..])
                .take_while(|(wanted, existing)| wanted != existing)
                .count();
            // Bounded by the range check above.
            self.write_eeprom(address + offset as u16, &data[offset..offset + run])?;
            written += run;
            offset += run;
        }

        tracing::debug!("Updated {} of {} EEPROM byte(s)", written, data.len());
        Ok(written)
    }
}
