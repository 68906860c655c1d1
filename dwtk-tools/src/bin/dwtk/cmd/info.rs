use dwtk::DebugWire;

use crate::util::common_options::{with_session, OnClose};
use crate::Config;

#[derive(clap::Parser)]
pub struct Cmd {}

impl Cmd {
    pub fn run(self, config: &Config) -> anyhow::Result<()> {
        with_session(config, OnClose::Resume, |dw| {
            for line in describe(dw)? {
                println!("{line}");
            }
            Ok(())
        })
    }
}

fn describe(dw: &mut DebugWire) -> anyhow::Result<Vec<String>> {
    let mcu = dw.mcu().clone();
    let mut lines = vec![
        format!("Adapter: {}", dw.info()),
        format!("Target:  {} (signature {:#06x})", mcu.name, mcu.signature),
        format!(
            "Flash:   {} bytes, {} pages of {} bytes",
            mcu.flash_size,
            mcu.num_flash_pages()?,
            mcu.flash_page_size
        ),
        format!("EEPROM:  {} bytes", mcu.eeprom_size),
    ];

    let mut cache = dw.cache(&super::fuses::CLOBBERED_REGISTERS)?;
    let fuses = cache.read_fuses()?;
    cache.release()?;
    lines.push(format!("Fuses:   {fuses}"));

    Ok(lines)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::util::common_options::tests::fake_session;
    use pretty_assertions::assert_eq;

    #[test]
    fn lists_target_and_fuses() {
        let (mut dw, _target) = fake_session("ATtiny85");

        let lines = describe(&mut dw).unwrap();

        assert_eq!(
            lines,
            [
                "Adapter: Simulated ATtiny85",
                "Target:  ATtiny85 (signature 0x930b)",
                "Flash:   8192 bytes, 128 pages of 64 bytes",
                "EEPROM:  512 bytes",
                "Fuses:   low=0x62, high=0x9f, extended=0xff, lockbit=0xff",
            ]
        );
    }
}
