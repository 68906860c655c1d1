//! Flash programming through injected `SPM` sequences.

use std::collections::BTreeMap;

use crate::avr::{self, spmcsr};
use crate::{DebugWire, DebugWireError};

/// Errors of flash accesses, checked before anything is sent to the target.
#[derive(Debug, thiserror::Error, docsplay::Display)]
pub enum FlashError {
    /// Page size must be {expected:#06x} for {name}, got {got:#06x}
    PageSize {
        /// MCU name.
        name: String,
        /// The page size of the MCU.
        expected: u16,
        /// The size of the data that was given.
        got: usize,
    },
    /// Start address {address:#06x} must be aligned to page start (page size: {page_size:#06x})
    Misaligned {
        /// The requested address.
        address: u16,
        /// The page size of the MCU.
        page_size: u16,
    },
    /// Access out of flash space: {address:#06x} + {len:#06x} > {flash_size:#06x}
    OutOfRange {
        /// The requested address.
        address: u16,
        /// The requested length.
        len: usize,
        /// Size of the flash.
        flash_size: u16,
    },
    /// Bad page split at {0:#06x}
    BadPageSplit(u16),
}

impl DebugWire {
    fn check_flash_range(&self, address: u16, len: usize) -> Result<(), FlashError> {
        if u32::from(address) + len as u32 > u32::from(self.mcu.flash_size) {
            return Err(FlashError::OutOfRange {
                address,
                len,
                flash_size: self.mcu.flash_size,
            });
        }
        Ok(())
    }

    fn check_flash_page(&self, address: u16, len: usize) -> Result<(), FlashError> {
        let page_size = self.mcu.flash_page_size;

        if len != usize::from(page_size) {
            return Err(FlashError::PageSize {
                name: self.mcu.name.clone(),
                expected: page_size,
                got: len,
            });
        }
        if address % page_size != 0 {
            return Err(FlashError::Misaligned { address, page_size });
        }
        self.check_flash_range(address, len)
    }

    /// Loads R29 with `control` and Z with `z`, then runs `OUT SPMCSR, r29; SPM`.
    fn spm(&mut self, control: u8, z: Option<u16>) -> Result<(), DebugWireError> {
        match z {
            Some(z) => {
                let [lo, hi] = z.to_le_bytes();
                self.write_registers(29, &[control, lo, hi])?;
            }
            None => self.write_registers(29, &[control])?,
        }
        self.write_instruction(avr::out(self.mcu.spmcsr, 29))?;
        self.write_instruction(avr::SPM)
    }

    fn clear_and_erase_page(&mut self, address: u16) -> Result<(), DebugWireError> {
        self.spm(spmcsr::CTPB | spmcsr::SELFPRGEN, Some(address))?;
        self.send_break()?;

        self.spm(spmcsr::PGERS | spmcsr::SELFPRGEN, None)?;
        self.send_break()
    }

    /// Erases one flash page.
    pub fn erase_flash_page(&mut self, address: u16) -> Result<(), DebugWireError> {
        self.check_flash_page(address, usize::from(self.mcu.flash_page_size))?;
        tracing::debug!("Erasing flash page {:#06x}", address);
        self.clear_and_erase_page(address)
    }

    /// Writes one full flash page.
    ///
    /// The page is erased first, so this always starts from a clean page buffer and a
    /// clean page. Retrying a failed write is safe.
    pub fn write_flash_page(&mut self, address: u16, data: &[u8]) -> Result<(), DebugWireError> {
        self.check_flash_page(address, data.len())?;
        tracing::debug!("Writing flash page {:#06x}", address);

        self.clear_and_erase_page(address)?;

        // Z still points at the page start after the erase.
        self.write_registers(29, &[spmcsr::SELFPRGEN])?;
        for word in data.chunks_exact(2) {
            self.write_registers(0, word)?;
            self.write_instruction(avr::out(self.mcu.spmcsr, 29))?;
            self.write_instruction(avr::SPM)?;
            self.write_instruction(avr::adiw(30, 2))?;
        }

        self.spm(spmcsr::PGWRT | spmcsr::SELFPRGEN, Some(address))?;
        self.send_break()
    }

    /// Writes an arbitrary range of flash.
    ///
    /// Every page the range touches is read first, so bytes outside of the range keep
    /// their value.
    pub fn write_flash(&mut self, address: u16, data: &[u8]) -> Result<(), DebugWireError> {
        if data.is_empty() {
            return Ok(());
        }
        self.check_flash_range(address, data.len())?;

        let page_size = self.mcu.flash_page_size;
        let end = u32::from(address) + data.len() as u32;
        let first_page = address / page_size;
        // The range check above keeps this within flash.
        let last_page = ((end - 1) / u32::from(page_size)) as u16;

        let mut pages = BTreeMap::new();
        for page in first_page..=last_page {
            let page_address = page * page_size;
            let mut content = vec![0; usize::from(page_size)];
            self.read_flash(page_address, &mut content)?;
            pages.insert(page_address, content);
        }

        let mut remaining = data;
        for page in first_page..=last_page {
            let page_address = page * page_size;
            let content = pages
                .get_mut(&page_address)
                .ok_or(FlashError::BadPageSplit(page_address))?;

            let offset = usize::from(address.saturating_sub(page_address));
            let len = (content.len() - offset).min(remaining.len());
            content[offset..offset + len].copy_from_slice(&remaining[..len]);
            remaining = &remaining[len..];

            self.write_flash_page(page_address, content)?;
        }

        Ok(())
    }

    /// Writes a single instruction word to flash, rewriting the page that holds it.
    pub fn write_flash_instruction(&mut self, address: u16, instruction: u16) -> Result<(), DebugWireError> {
        self.write_flash(address, &instruction.to_le_bytes())
    }

    /// Reads flash.
    pub fn read_flash(&mut self, address: u16, data: &mut [u8]) -> Result<(), DebugWireError> {
        self.check_flash_range(address, data.len())?;
        Ok(self.adapter.read_flash(address, data)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::fake::{FakeAdapter, FakeHandle, FakeOp};
    use pretty_assertions::assert_eq;
    use test_case::test_case;

    fn session() -> (DebugWire, FakeHandle) {
        let mcu = dwtk_target::Registry::from_builtin_families()
            .unwrap()
            .get_by_name("ATtiny85")
            .unwrap()
            .clone();
        let adapter = FakeAdapter::new(mcu.clone());
        let target = adapter.target();
        (DebugWire::new(Box::new(adapter), mcu), target)
    }

    #[test]
    fn page_round_trip() {
        let (mut dw, target) = session();
        let page: Vec<u8> = (0..0x40).map(|i| i as u8 ^ 0x5a).collect();

        dw.write_flash_page(0x1fc0, &page).unwrap();

        let mut read = vec![0; 0x40];
        dw.read_flash(0x1fc0, &mut read).unwrap();
        assert_eq!(read, page);
        assert_eq!(target.lock().page_erases, 1);
        assert_eq!(target.lock().page_writes, 1);
    }

    #[test]
    fn page_rewrite_replaces_content() {
        let (mut dw, target) = session();
        dw.write_flash_page(0, &[0x00; 0x40]).unwrap();
        dw.write_flash_page(0, &[0xa5; 0x40]).unwrap();

        assert!(target.lock().flash[..0x40].iter().all(|&b| b == 0xa5));
    }

    #[test_case(0x0000, 0x3f; "short page")]
    #[test_case(0x0020, 0x40; "misaligned")]
    #[test_case(0x2000, 0x40; "past the end")]
    fn invalid_pages(address: u16, len: usize) {
        let (mut dw, target) = session();
        let err = dw.write_flash_page(address, &vec![0; len]).unwrap_err();

        assert!(matches!(err, DebugWireError::Flash(_)), "{err:?}");
        assert_eq!(target.lock().breaks_sent, 0);
    }

    #[test]
    fn partial_write_keeps_rest_of_page() {
        let (mut dw, target) = session();
        let before: Vec<u8> = (0..0x80).map(|i| i as u8).collect();
        target.lock().flash[..0x80].copy_from_slice(&before);

        dw.write_flash(0x3e, &[0xaa, 0xbb, 0xcc]).unwrap();

        let mut expected = before.clone();
        expected[0x3e..0x41].copy_from_slice(&[0xaa, 0xbb, 0xcc]);
        assert_eq!(target.lock().flash[..0x80], expected);
        assert_eq!(target.lock().page_writes, 2);
    }

    #[test]
    fn read_out_of_range() {
        let (mut dw, _) = session();
        let mut buf = [0; 4];
        assert!(matches!(
            dw.read_flash(0x1ffe, &mut buf),
            Err(DebugWireError::Flash(FlashError::OutOfRange { .. }))
        ));
    }

    #[test]
    fn erase_page() {
        let (mut dw, target) = session();
        target.lock().flash[0x40..0x80].fill(0);

        dw.erase_flash_page(0x40).unwrap();

        assert!(target.lock().flash[0x40..0x80].iter().all(|&b| b == 0xff));
        assert_eq!(target.lock().page_writes, 0);
    }

    #[test]
    fn failed_step_aborts_page() {
        let (mut dw, target) = session();
        target.lock().fail_nth(FakeOp::WriteInstruction, 10);

        assert!(dw.write_flash_page(0, &[0; 0x40]).is_err());
        assert_eq!(target.lock().page_writes, 0);
    }
}
