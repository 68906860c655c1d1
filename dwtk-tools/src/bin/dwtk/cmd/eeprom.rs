use std::path::PathBuf;

use anyhow::Context;
use dwtk::DebugWire;

use crate::util::common_options::{with_session, OnClose};
use crate::util::{firmware, parse_u16, parse_u8};
use crate::Config;

/// Registers clobbered by EEPROM accesses.
const CLOBBERED_REGISTERS: [u8; 5] = [0, 28, 29, 30, 31];

#[derive(clap::Parser)]
pub struct Cmd {
    #[clap(subcommand)]
    action: Action,
}

#[derive(clap::Subcommand)]
enum Action {
    /// Write an Intel HEX file to EEPROM
    Write {
        path: PathBuf,

        /// Skip reading the EEPROM back after writing
        #[clap(long, short = 'n')]
        no_verify: bool,
    },
    /// Dump the EEPROM to an Intel HEX file
    Dump { path: PathBuf },
    /// Fill the EEPROM with 0xFF
    Erase,
    /// Write bytes given on the command line, starting at START
    Bytes {
        #[clap(value_parser = parse_u16)]
        start: u16,

        #[clap(value_parser = parse_u8, required = true)]
        bytes: Vec<u8>,

        /// Skip reading the EEPROM back after writing
        #[clap(long, short = 'n')]
        no_verify: bool,
    },
}

impl Cmd {
    pub fn run(self, config: &Config) -> anyhow::Result<()> {
        match self.action {
            Action::Write { path, no_verify } => {
                let data = firmware::load_hex(&path)
                    .with_context(|| format!("Failed to load {}", path.display()))?;
                with_session(config, OnClose::Resume, |dw| {
                    report(write(dw, 0, &data, !no_verify)?, data.len());
                    Ok(())
                })
            }
            Action::Dump { path } => {
                let data = with_session(config, OnClose::Resume, read_all)?;
                std::fs::write(&path, firmware::encode_hex(&data)?)
                    .with_context(|| format!("Failed to write {}", path.display()))?;
                println!("Dumped {} byte(s) to {}", data.len(), path.display());
                Ok(())
            }
            Action::Erase => with_session(config, OnClose::Resume, |dw| {
                let data = vec![0xff; usize::from(dw.mcu().eeprom_size)];
                report(write(dw, 0, &data, false)?, data.len());
                Ok(())
            }),
            Action::Bytes {
                start,
                bytes,
                no_verify,
            } => with_session(config, OnClose::Resume, |dw| {
                report(write(dw, start, &bytes, !no_verify)?, bytes.len());
                Ok(())
            }),
        }
    }
}

fn report(written: usize, len: usize) {
    println!("Wrote {written} of {len} EEPROM byte(s)");
}

/// Writes the bytes that differ and returns how many that were.
fn write(dw: &mut DebugWire, address: u16, data: &[u8], verify: bool) -> anyhow::Result<usize> {
    let mut cache = dw.cache(&CLOBBERED_REGISTERS)?;
    let written = cache.update_eeprom(address, data)?;

    if verify {
        let mut content = vec![0; data.len()];
        cache.read_eeprom(address, &mut content)?;
        if let Some(offset) = content.iter().zip(data).position(|(got, wanted)| got != wanted) {
            anyhow::bail!(
                "EEPROM verification failed at {:#06x}",
                usize::from(address) + offset
            );
        }
    }

    cache.release()?;
    Ok(written)
}

fn read_all(dw: &mut DebugWire) -> anyhow::Result<Vec<u8>> {
    let mut data = vec![0; usize::from(dw.mcu().eeprom_size)];

    let mut cache = dw.cache(&CLOBBERED_REGISTERS)?;
    cache.read_eeprom(0, &mut data)?;
    cache.release()?;

    Ok(data)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::util::common_options::tests::fake_session;
    use pretty_assertions::assert_eq;

    #[test]
    fn writes_only_changed_bytes() {
        let (mut dw, target) = fake_session("ATtiny85");
        target.lock().eeprom[0x11] = 0x02;

        let written = write(&mut dw, 0x10, &[0x01, 0x02, 0x03], true).unwrap();

        let target = target.lock();
        assert_eq!(written, 2);
        assert_eq!(target.eeprom_writes, 2);
        assert_eq!(target.eeprom[0x10..0x13], [0x01, 0x02, 0x03]);
    }

    #[test]
    fn keeps_registers() {
        let (mut dw, target) = fake_session("ATtiny85");
        target.lock().set_register(0, 0x5a);
        target.lock().set_register(31, 0xa5);

        write(&mut dw, 0, &[0x00], true).unwrap();

        let target = target.lock();
        assert_eq!(target.register(0), 0x5a);
        assert_eq!(target.register(31), 0xa5);
    }

    #[test]
    fn out_of_range() {
        let (mut dw, target) = fake_session("ATtiny85");

        assert!(write(&mut dw, 0x1ff, &[0x00, 0x00], false).is_err());
        assert_eq!(target.lock().eeprom_writes, 0);
    }

    #[test]
    fn reads_everything() {
        let (mut dw, target) = fake_session("ATtiny85");
        target.lock().eeprom[0x1ff] = 0x42;

        let data = read_all(&mut dw).unwrap();

        assert_eq!(data.len(), 0x200);
        assert_eq!(data[0x1ff], 0x42);
        assert_eq!(data[0], 0xff);
    }
}
