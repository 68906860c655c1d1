use std::fmt;

use crate::avr::{self, spmcsr};
use crate::{DebugWire, DebugWireError};

/// Fuse and lock bytes of the target.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Fuses {
    /// Low fuse byte.
    pub low: u8,
    /// High fuse byte. Holds `DWEN`.
    pub high: u8,
    /// Extended fuse byte.
    pub extended: u8,
    /// Lock bits.
    pub lock: u8,
}

impl Fuses {
    /// Whether the `DWEN` fuse is programmed. Fuses are active low.
    pub fn dwen_programmed(&self, dwen_bit: u8) -> bool {
        self.high & dwen_bit == 0
    }
}

impl fmt::Display for Fuses {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "low={:#04x}, high={:#04x}, extended={:#04x}, lockbit={:#04x}",
            self.low, self.high, self.extended, self.lock
        )
    }
}

impl DebugWire {
    /// Reads the fuse and lock bytes with `LPM` in fuse read mode. Clobbers R28-R31.
    pub fn read_fuses(&mut self) -> Result<Fuses, DebugWireError> {
        self.write_registers(30, &[0, 0])?;

        // Z walks through low, lock, extended and high.
        let mut values = [0; 4];
        for value in &mut values {
            self.write_registers(29, &[spmcsr::RFLB | spmcsr::SELFPRGEN])?;
            self.write_instruction(avr::out(self.mcu.spmcsr, 29))?;
            self.write_instruction(avr::lpm(28, true))?;

            let mut register = [0];
            self.read_registers(28, &mut register)?;
            *value = register[0];
        }

        let [low, lock, extended, high] = values;
        Ok(Fuses {
            low,
            high,
            extended,
            lock,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::fake::FakeAdapter;
    use pretty_assertions::assert_eq;

    #[test]
    fn read_fuses() {
        let mcu = dwtk_target::Registry::from_builtin_families()
            .unwrap()
            .get_by_name("ATtiny85")
            .unwrap()
            .clone();
        let adapter = FakeAdapter::new(mcu.clone());
        adapter.target().lock().fuses = Fuses {
            low: 0xe2,
            high: 0x9f,
            extended: 0xfe,
            lock: 0xfc,
        };
        let mut dw = DebugWire::new(Box::new(adapter), mcu.clone());

        let fuses = dw.read_fuses().unwrap();

        assert_eq!(
            fuses,
            Fuses {
                low: 0xe2,
                high: 0x9f,
                extended: 0xfe,
                lock: 0xfc,
            }
        );
        assert!(fuses.dwen_programmed(mcu.dwen_bit));
    }

    #[test]
    fn display() {
        let fuses = Fuses {
            low: 0x62,
            high: 0x9f,
            extended: 0xff,
            lock: 0xff,
        };
        assert_eq!(
            fuses.to_string(),
            "low=0x62, high=0x9f, extended=0xff, lockbit=0xff"
        );
    }
}
