use std::path::PathBuf;

use anyhow::Context;

use crate::util::common_options::{with_session, OnClose};
use crate::util::firmware;
use crate::util::flash::{self, PageProgress};
use crate::Config;

#[derive(clap::Parser)]
pub struct Cmd {
    /// Intel HEX or ELF file to compare the flash with
    path: PathBuf,
}

impl Cmd {
    pub fn run(self, config: &Config) -> anyhow::Result<()> {
        let image = firmware::load(&self.path)
            .with_context(|| format!("Failed to load {}", self.path.display()))?;

        with_session(config, OnClose::Resume, |dw| {
            let pages = dw.mcu().prepare_firmware(&image)?;
            flash::verify(dw, &pages, PageProgress::for_pages("Verifying", &pages)?)?;

            println!("Verification successful");
            Ok(())
        })
    }
}
