use crate::serialize::{hex_u_int, hex_u_int_de};
use serde::{Deserialize, Serialize};

/// A single debugWIRE capable MCU variant.
///
/// Register addresses are stored as I/O space addresses, the form used by
/// the `IN`/`OUT` instructions that get injected over debugWIRE.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Mcu {
    /// The name of the MCU, e.g. `ATtiny85`.
    pub name: String,
    /// The 16-bit device signature, as returned by the debugWIRE signature command.
    #[serde(serialize_with = "hex_u_int", deserialize_with = "hex_u_int_de")]
    pub signature: u16,
    /// Size of a flash page in bytes.
    #[serde(serialize_with = "hex_u_int", deserialize_with = "hex_u_int_de")]
    pub flash_page_size: u16,
    /// Size of the flash memory in bytes.
    #[serde(serialize_with = "hex_u_int", deserialize_with = "hex_u_int_de")]
    pub flash_size: u16,
    /// Size of the EEPROM in bytes.
    #[serde(serialize_with = "hex_u_int", deserialize_with = "hex_u_int_de")]
    pub eeprom_size: u16,
    /// I/O address of `SPMCSR`.
    #[serde(serialize_with = "hex_u_int", deserialize_with = "hex_u_int_de")]
    pub spmcsr: u8,
    /// I/O address of `EECR`. `EEDR`, `EEARL` and `EEARH` follow it.
    #[serde(serialize_with = "hex_u_int", deserialize_with = "hex_u_int_de")]
    pub eecr: u8,
    /// Whether the MCU has an `EEARH` register.
    #[serde(rename = "eearh")]
    pub has_eearh: bool,
    /// The `DWEN` bit mask in the high fuse byte.
    #[serde(serialize_with = "hex_u_int", deserialize_with = "hex_u_int_de")]
    pub dwen_bit: u8,
}

/// A page sized chunk of firmware, ready to be written to flash.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlashPage {
    /// Byte address of the first byte of the page.
    pub address: u16,
    /// Page contents, always exactly one page long.
    pub data: Vec<u8>,
}

/// Errors of the page split helpers.
#[derive(Debug, thiserror::Error, docsplay::Display)]
pub enum FirmwareError {
    /// Flash size ({flash_size:#06x}) of {name} is not a multiple of its page size ({page_size:#06x})
    UnevenPages {
        name: String,
        flash_size: u16,
        page_size: u16,
    },
    /// Firmware size ({size}) is bigger than {name} flash ({flash_size})
    TooLarge {
        name: String,
        size: usize,
        flash_size: u16,
    },
}

impl Mcu {
    /// Number of flash pages.
    pub fn num_flash_pages(&self) -> Result<u16, FirmwareError> {
        if self.flash_page_size == 0 || self.flash_size % self.flash_page_size != 0 {
            return Err(FirmwareError::UnevenPages {
                name: self.name.clone(),
                flash_size: self.flash_size,
                page_size: self.flash_page_size,
            });
        }

        Ok(self.flash_size / self.flash_page_size)
    }

    /// Splits a flat firmware image starting at address zero into flash pages.
    ///
    /// The last page is padded with `0xff`, the erased flash value, so that padding
    /// bytes read back the same as untouched flash.
    pub fn prepare_firmware(&self, data: &[u8]) -> Result<Vec<FlashPage>, FirmwareError> {
        self.num_flash_pages()?;

        if data.len() > usize::from(self.flash_size) {
            return Err(FirmwareError::TooLarge {
                name: self.name.clone(),
                size: data.len(),
                flash_size: self.flash_size,
            });
        }

        let page_size = usize::from(self.flash_page_size);
        let pages = data
            .chunks(page_size)
            .enumerate()
            .map(|(i, chunk)| {
                let mut page = vec![0xff; page_size];
                page[..chunk.len()].copy_from_slice(chunk);
                FlashPage {
                    // Bounded by the flash size check above.
                    address: (i * page_size) as u16,
                    data: page,
                }
            })
            .collect();

        Ok(pages)
    }

    /// The I/O address of `EEDR`.
    pub fn eedr(&self) -> u8 {
        self.eecr + 1
    }

    /// The I/O address of `EEARL`.
    pub fn eearl(&self) -> u8 {
        self.eecr + 2
    }

    /// The I/O address of `EEARH`, if the MCU has one.
    pub fn eearh(&self) -> Option<u8> {
        self.has_eearh.then_some(self.eecr + 3)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn tiny85() -> Mcu {
        Mcu {
            name: "ATtiny85".to_string(),
            signature: 0x930b,
            flash_page_size: 0x40,
            flash_size: 0x2000,
            eeprom_size: 0x200,
            spmcsr: 0x37,
            eecr: 0x1c,
            has_eearh: true,
            dwen_bit: 0x40,
        }
    }

    #[test]
    fn pages_are_padded_with_erased_value() {
        let mcu = tiny85();
        let data: Vec<u8> = (0..0x50).map(|i| i as u8).collect();

        let pages = mcu.prepare_firmware(&data).unwrap();

        assert_eq!(pages.len(), 2);
        assert_eq!(pages[0].address, 0x0000);
        assert_eq!(pages[0].data, data[..0x40]);
        assert_eq!(pages[1].address, 0x0040);
        assert_eq!(pages[1].data[..0x10], data[0x40..]);
        assert!(pages[1].data[0x10..].iter().all(|&b| b == 0xff));
    }

    #[test]
    fn empty_firmware_has_no_pages() {
        assert!(tiny85().prepare_firmware(&[]).unwrap().is_empty());
    }

    #[test]
    fn firmware_bigger_than_flash() {
        let mcu = tiny85();
        let data = vec![0u8; 0x2001];

        let err = mcu.prepare_firmware(&data).unwrap_err();
        assert_eq!(
            err.to_string(),
            "Firmware size (8193) is bigger than ATtiny85 flash (8192)"
        );
    }

    #[test]
    fn uneven_flash_is_rejected() {
        let mut mcu = tiny85();
        mcu.flash_size = 0x2010;

        assert!(matches!(
            mcu.num_flash_pages(),
            Err(FirmwareError::UnevenPages { .. })
        ));
    }

    #[test]
    fn eeprom_register_layout() {
        let mut mcu = tiny85();
        assert_eq!(mcu.eedr(), 0x1d);
        assert_eq!(mcu.eearl(), 0x1e);
        assert_eq!(mcu.eearh(), Some(0x1f));

        mcu.has_eearh = false;
        assert_eq!(mcu.eearh(), None);
    }

    #[test]
    fn hex_strings_deserialize() {
        let yaml = r#"
name: ATtiny85
signature: "0x930b"
flash_page_size: 64
flash_size: 0x2000
eeprom_size: "512"
spmcsr: 0x37
eecr: 0x1c
eearh: true
dwen_bit: 0x40
"#;
        let mcu: Mcu = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(mcu, tiny85());
    }
}
