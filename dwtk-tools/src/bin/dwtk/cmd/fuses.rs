use crate::util::common_options::{with_session, OnClose};
use crate::Config;

/// Registers clobbered by reading the fuses.
pub(crate) const CLOBBERED_REGISTERS: [u8; 4] = [28, 29, 30, 31];

#[derive(clap::Parser)]
pub struct Cmd {}

impl Cmd {
    pub fn run(self, config: &Config) -> anyhow::Result<()> {
        with_session(config, OnClose::Resume, |dw| {
            let mut cache = dw.cache(&CLOBBERED_REGISTERS)?;
            let fuses = cache.read_fuses()?;
            cache.release()?;

            println!("{fuses}");
            Ok(())
        })
    }
}
