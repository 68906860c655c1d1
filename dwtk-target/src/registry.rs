use crate::Mcu;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::io::Read;

/// A family of MCUs described together, e.g. `ATtiny25/45/85`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct McuFamily {
    /// The family name.
    pub name: String,
    /// All variants of the family.
    pub variants: Vec<Mcu>,
}

impl McuFamily {
    /// Validates the family so that the rest of dwtk can rely on the descriptor values.
    pub fn validate(&self) -> Result<(), String> {
        let mut seen = HashSet::new();

        for mcu in &self.variants {
            if !seen.insert(&mcu.name) {
                return Err(format!(
                    "MCU {} appears multiple times in {}",
                    mcu.name, self.name
                ));
            }

            if !mcu.flash_page_size.is_power_of_two() {
                return Err(format!(
                    "MCU {} has a flash page size of {:#x}, which is not a power of two",
                    mcu.name, mcu.flash_page_size
                ));
            }

            mcu.num_flash_pages().map_err(|e| e.to_string())?;

            // IN/OUT can only reach the first 64 I/O addresses.
            let last_eeprom_register = mcu.eearh().unwrap_or_else(|| mcu.eearl());
            if mcu.spmcsr > 0x3f || last_eeprom_register > 0x3f {
                return Err(format!(
                    "MCU {} has registers outside of the I/O space",
                    mcu.name
                ));
            }
        }

        Ok(())
    }
}

/// Errors while loading MCU descriptions.
#[derive(Debug, thiserror::Error, docsplay::Display)]
pub enum RegistryError {
    /// Failed to parse MCU description
    Yaml(#[from] serde_yaml::Error),
    /// Invalid MCU description: {0}
    Invalid(String),
    /// Failed to read MCU description
    Io(#[from] std::io::Error),
}

/// The set of known MCUs, keyed by signature and name.
#[derive(Debug, Clone)]
pub struct Registry {
    families: Vec<McuFamily>,
}

impl Registry {
    /// The MCUs that ship with dwtk.
    pub fn from_builtin_families() -> Result<Self, RegistryError> {
        Self::from_yaml_str(include_str!("../targets/AVR.yaml"))
    }

    /// Loads families from a YAML document holding a list of [`McuFamily`].
    pub fn from_yaml_str(yaml: &str) -> Result<Self, RegistryError> {
        let families: Vec<McuFamily> = serde_yaml::from_str(yaml)?;
        Self::from_families(families)
    }

    /// Loads families from a reader, e.g. a user supplied description file.
    pub fn from_yaml_reader(reader: impl Read) -> Result<Self, RegistryError> {
        let families: Vec<McuFamily> = serde_yaml::from_reader(reader)?;
        Self::from_families(families)
    }

    fn from_families(families: Vec<McuFamily>) -> Result<Self, RegistryError> {
        for family in &families {
            family.validate().map_err(RegistryError::Invalid)?;
        }

        Ok(Self { families })
    }

    /// Adds the families of another registry. Later additions take precedence on lookup.
    pub fn extend(&mut self, other: Registry) {
        let mut families = other.families;
        families.append(&mut self.families);
        self.families = families;
    }

    /// All known families.
    pub fn families(&self) -> &[McuFamily] {
        &self.families
    }

    /// Iterates over every known MCU.
    pub fn mcus(&self) -> impl Iterator<Item = &Mcu> {
        self.families.iter().flat_map(|family| family.variants.iter())
    }

    /// Looks up an MCU by its signature.
    pub fn get_by_signature(&self, signature: u16) -> Option<&Mcu> {
        self.mcus().find(|mcu| mcu.signature == signature)
    }

    /// Looks up an MCU by name, ignoring case.
    pub fn get_by_name(&self, name: &str) -> Option<&Mcu> {
        self.mcus().find(|mcu| mcu.name.eq_ignore_ascii_case(name))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use test_case::test_case;

    #[test]
    fn builtin_families_are_valid() {
        let registry = Registry::from_builtin_families().unwrap();
        assert!(registry.mcus().count() > 10);
    }

    #[test]
    fn signatures_are_unique() {
        let registry = Registry::from_builtin_families().unwrap();
        let mut seen = HashSet::new();
        for mcu in registry.mcus() {
            assert!(seen.insert(mcu.signature), "duplicate {:#06x}", mcu.signature);
        }
    }

    #[test_case(0x930b, "ATtiny85", 0x40, 0x2000; "attiny85")]
    #[test_case(0x910b, "ATtiny24", 0x20, 0x0800; "attiny24")]
    #[test_case(0x950f, "ATmega328P", 0x80, 0x8000; "atmega328p")]
    fn lookup_by_signature(signature: u16, name: &str, page_size: u16, flash_size: u16) {
        let registry = Registry::from_builtin_families().unwrap();
        let mcu = registry.get_by_signature(signature).unwrap();

        assert_eq!(mcu.name, name);
        assert_eq!(mcu.flash_page_size, page_size);
        assert_eq!(mcu.flash_size, flash_size);
    }

    #[test]
    fn unknown_signature() {
        let registry = Registry::from_builtin_families().unwrap();
        assert!(registry.get_by_signature(0x1e00).is_none());
    }

    #[test]
    fn lookup_by_name_ignores_case() {
        let registry = Registry::from_builtin_families().unwrap();
        assert_eq!(
            registry.get_by_name("attiny84").map(|mcu| mcu.signature),
            Some(0x930c)
        );
    }

    #[test]
    fn duplicate_names_are_rejected() {
        let yaml = r#"
- name: broken
  variants:
    - { name: X, signature: 1, flash_page_size: 0x40, flash_size: 0x2000, eeprom_size: 0, spmcsr: 0x37, eecr: 0x1c, eearh: false, dwen_bit: 0x40 }
    - { name: X, signature: 2, flash_page_size: 0x40, flash_size: 0x2000, eeprom_size: 0, spmcsr: 0x37, eecr: 0x1c, eearh: false, dwen_bit: 0x40 }
"#;
        assert!(matches!(
            Registry::from_yaml_str(yaml),
            Err(RegistryError::Invalid(_))
        ));
    }

    #[test]
    fn extended_registry_takes_precedence() {
        let yaml = r#"
- name: custom
  variants:
    - { name: ATtiny85-custom, signature: 0x930b, flash_page_size: 0x40, flash_size: 0x2000, eeprom_size: 0x200, spmcsr: 0x37, eecr: 0x1c, eearh: true, dwen_bit: 0x40 }
"#;
        let mut registry = Registry::from_builtin_families().unwrap();
        registry.extend(Registry::from_yaml_str(yaml).unwrap());

        assert_eq!(
            registry.get_by_signature(0x930b).unwrap().name,
            "ATtiny85-custom"
        );
    }
}
