use std::path::PathBuf;

use anyhow::Context;
use dwtk::DebugWire;

use crate::util::common_options::{with_session, OnClose};
use crate::util::firmware;
use crate::util::flash::{PageProgress, READ_CLOBBERED_REGISTERS};
use crate::Config;

#[derive(clap::Parser)]
pub struct Cmd {
    /// Intel HEX file to write
    path: PathBuf,
}

impl Cmd {
    pub fn run(self, config: &Config) -> anyhow::Result<()> {
        let data = with_session(config, OnClose::Resume, |dw| {
            let progress = PageProgress::new("Reading", u64::from(dw.mcu().flash_size))?;
            let result = read_pages(dw, &progress);
            progress.finish(result.is_ok());
            result
        })?;

        std::fs::write(&self.path, firmware::encode_hex(&data)?)
            .with_context(|| format!("Failed to write {}", self.path.display()))?;
        println!("Dumped {} byte(s) to {}", data.len(), self.path.display());
        Ok(())
    }
}

/// Reads the whole flash, one page at a time from the lowest address.
fn read_pages(dw: &mut DebugWire, progress: &PageProgress) -> anyhow::Result<Vec<u8>> {
    let pages = dw.mcu().num_flash_pages()?;
    let page_size = dw.mcu().flash_page_size;
    let mut data = vec![0; usize::from(dw.mcu().flash_size)];

    let mut cache = dw.cache(&READ_CLOBBERED_REGISTERS)?;
    for (page, chunk) in (0..pages).zip(data.chunks_mut(usize::from(page_size))) {
        let address = page * page_size;
        cache
            .read_flash(address, chunk)
            .with_context(|| format!("Failed to read flash page {address:#06x}"))?;
        progress.inc(chunk.len());
    }
    cache.release()?;

    Ok(data)
}
