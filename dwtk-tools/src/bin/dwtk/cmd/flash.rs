use std::path::PathBuf;

use anyhow::Context;

use crate::util::common_options::{with_session, OnClose};
use crate::util::firmware;
use crate::util::flash::{self, PageProgress};
use crate::Config;

#[derive(clap::Parser)]
pub struct Cmd {
    /// Intel HEX or ELF file to write to flash
    path: PathBuf,

    /// Skip reading the flash back after writing
    #[clap(long, short = 'n')]
    no_verify: bool,

    /// How many times a failed page is written again before giving up
    #[clap(long, default_value_t = 0)]
    retries: u32,
}

impl Cmd {
    pub fn run(self, config: &Config) -> anyhow::Result<()> {
        let image = firmware::load(&self.path)
            .with_context(|| format!("Failed to load {}", self.path.display()))?;

        with_session(config, OnClose::Resume, |dw| {
            let pages = dw.mcu().prepare_firmware(&image)?;
            tracing::info!(
                "Writing {} byte(s) in {} page(s) to {}",
                image.len(),
                pages.len(),
                dw.mcu().name
            );

            flash::program(
                dw,
                &pages,
                self.retries,
                PageProgress::for_pages("Programming", &pages)?,
            )?;

            if !self.no_verify {
                flash::verify(dw, &pages, PageProgress::for_pages("  Verifying", &pages)?)?;
            }

            println!("Flashed {} byte(s)", image.len());
            Ok(())
        })
    }
}
