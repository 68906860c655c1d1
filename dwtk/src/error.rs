use itertools::Itertools;

use crate::adapter::AdapterError;
use crate::eeprom::EepromError;
use crate::flash::FlashError;

/// The overarching error type of a debugWIRE session.
#[derive(Debug, thiserror::Error)]
pub enum DebugWireError {
    /// The adapter failed.
    #[error(transparent)]
    Adapter(#[from] AdapterError),
    /// The target answered a break with something other than 0x55.
    #[error("Bad break response: expected 0x55, got {0:#04x}")]
    BreakMismatch(u8),
    /// The signature does not match any known MCU.
    #[error("MCU not found for signature 0x{0:04x}, please report it with the device name")]
    McuNotFound(u16),
    /// Registers past R31 were requested.
    #[error("Register range out of bounds: r{start} + {len} > r32")]
    #[allow(missing_docs)]
    RegisterRange { start: u8, len: usize },
    /// Invalid flash access.
    #[error(transparent)]
    Flash(#[from] FlashError),
    /// Invalid EEPROM access.
    #[error(transparent)]
    Eeprom(#[from] EepromError),
    /// Several steps of a cleanup failed.
    #[error("{}", .0.iter().join("; "))]
    Cleanup(Vec<DebugWireError>),
}

impl DebugWireError {
    /// Folds the errors of a best-effort cleanup into one.
    pub fn join(mut errors: Vec<DebugWireError>) -> Result<(), DebugWireError> {
        match errors.len() {
            0 => Ok(()),
            1 => Err(errors.remove(0)),
            _ => Err(DebugWireError::Cleanup(errors)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn signature_is_named() {
        assert_eq!(
            DebugWireError::McuNotFound(0x930b).to_string(),
            "MCU not found for signature 0x930b, please report it with the device name"
        );
    }

    #[test]
    fn cleanup_errors_are_joined() {
        let err = DebugWireError::join(vec![
            DebugWireError::BreakMismatch(0x00),
            DebugWireError::BreakMismatch(0xf0),
        ])
        .unwrap_err();

        assert_eq!(
            err.to_string(),
            "Bad break response: expected 0x55, got 0x00; Bad break response: expected 0x55, got 0xf0"
        );
    }

    #[test]
    fn single_error_is_not_wrapped() {
        let err = DebugWireError::join(vec![DebugWireError::BreakMismatch(0x01)]).unwrap_err();
        assert!(matches!(err, DebugWireError::BreakMismatch(0x01)));
        assert!(DebugWireError::join(vec![]).is_ok());
    }
}
