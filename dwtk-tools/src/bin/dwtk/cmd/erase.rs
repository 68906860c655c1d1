use dwtk::DebugWire;

use crate::util::common_options::{with_session, OnClose};
use crate::util::flash::PageProgress;
use crate::Config;

/// Registers clobbered by a page erase.
const CLOBBERED_REGISTERS: [u8; 3] = [29, 30, 31];

#[derive(clap::Parser)]
pub struct Cmd {}

impl Cmd {
    pub fn run(self, config: &Config) -> anyhow::Result<()> {
        // A reset would start the now empty program.
        with_session(config, OnClose::Halt, |dw| {
            let progress = PageProgress::new("Erasing", u64::from(dw.mcu().flash_size))?;
            let result = erase(dw, &progress);
            progress.finish(result.is_ok());
            result
        })
    }
}

fn erase(dw: &mut DebugWire, progress: &PageProgress) -> anyhow::Result<()> {
    let pages = dw.mcu().num_flash_pages()?;
    let page_size = dw.mcu().flash_page_size;

    let mut cache = dw.cache(&CLOBBERED_REGISTERS)?;
    for page in 0..pages {
        cache.erase_flash_page(page * page_size)?;
        progress.inc(usize::from(page_size));
    }
    cache.release()?;

    Ok(())
}
