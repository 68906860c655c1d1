//! Page programming and verification with progress bars.

use std::time::Duration;

use anyhow::Context;
use dwtk::{DebugWire, DebugWireError};
use dwtk_target::FlashPage;
use indicatif::{MultiProgress, ProgressBar, ProgressStyle};

use crate::util::logging;

/// Registers clobbered by the page algorithms.
const CLOBBERED_REGISTERS: [u8; 6] = [0, 1, 28, 29, 30, 31];

/// Registers clobbered by flash reads.
pub const READ_CLOBBERED_REGISTERS: [u8; 2] = [30, 31];

/// A progress bar shown while a command works through flash pages.
pub struct PageProgress {
    bar: ProgressBar,
}

impl PageProgress {
    /// A bar over `length` bytes.
    pub fn new(message: &str, length: u64) -> anyhow::Result<Self> {
        let multi_progress = MultiProgress::new();
        logging::set_progress_bar(multi_progress.clone());

        let bar = multi_progress.add(ProgressBar::new(length));
        bar.set_style(
            ProgressStyle::with_template(
                "{msg:.green.bold} {spinner} {percent:>3}% [{bar:20}] {bytes:>10} @ {bytes_per_sec:>12} (ETA {eta})",
            )?
            .progress_chars("##-"),
        );
        bar.set_message(message.to_string());
        bar.enable_steady_tick(Duration::from_millis(100));

        Ok(Self { bar })
    }

    /// No output, for tests.
    #[cfg(test)]
    pub fn hidden() -> Self {
        Self {
            bar: ProgressBar::hidden(),
        }
    }

    /// A bar over the total size of `pages`.
    pub fn for_pages(message: &str, pages: &[FlashPage]) -> anyhow::Result<Self> {
        Self::new(message, pages.iter().map(|page| page.data.len() as u64).sum())
    }

    pub fn inc(&self, bytes: usize) {
        self.bar.inc(bytes as u64);
    }

    pub fn finish(self, ok: bool) {
        if ok {
            self.bar.finish();
        } else {
            self.bar.abandon();
        }
        logging::clear_progress_bar();
    }
}

/// Writes `pages` in ascending order, retrying a failed page up to `retries` times.
pub fn program(
    dw: &mut DebugWire,
    pages: &[FlashPage],
    retries: u32,
    progress: PageProgress,
) -> anyhow::Result<()> {
    let result = program_pages(dw, pages, retries, &progress);
    progress.finish(result.is_ok());
    result
}

fn program_pages(
    dw: &mut DebugWire,
    pages: &[FlashPage],
    retries: u32,
    progress: &PageProgress,
) -> anyhow::Result<()> {
    let mut cache = dw.cache(&CLOBBERED_REGISTERS)?;
    for page in pages {
        write_page(&mut cache, page, retries)
            .with_context(|| format!("Failed to write flash page {:#06x}", page.address))?;
        progress.inc(page.data.len());
    }
    cache.release()?;
    Ok(())
}

fn write_page(dw: &mut DebugWire, page: &FlashPage, retries: u32) -> Result<(), DebugWireError> {
    let mut attempt = 0;
    loop {
        match dw.write_flash_page(page.address, &page.data) {
            Ok(()) => return Ok(()),
            Err(e) if attempt < retries => {
                attempt += 1;
                tracing::warn!(
                    "Writing flash page {:#06x} failed, retrying ({}/{}): {}",
                    page.address,
                    attempt,
                    retries,
                    e
                );
                // Get back in sync before starting over.
                if let Err(e) = dw.send_break() {
                    tracing::warn!("Failed to resynchronize: {}", e);
                }
            }
            Err(e) => return Err(e),
        }
    }
}

/// Reads back every page and compares it. A mismatch names the first differing page.
pub fn verify(dw: &mut DebugWire, pages: &[FlashPage], progress: PageProgress) -> anyhow::Result<()> {
    let result = verify_pages(dw, pages, &progress);
    progress.finish(result.is_ok());
    result
}

fn verify_pages(
    dw: &mut DebugWire,
    pages: &[FlashPage],
    progress: &PageProgress,
) -> anyhow::Result<()> {
    let mut cache = dw.cache(&READ_CLOBBERED_REGISTERS)?;
    let mut content = Vec::new();
    for page in pages {
        content.resize(page.data.len(), 0);
        cache
            .read_flash(page.address, &mut content)
            .with_context(|| format!("Failed to read flash page {:#06x}", page.address))?;

        if content != page.data {
            anyhow::bail!("Verification failed at flash page {:#06x}", page.address);
        }
        progress.inc(page.data.len());
    }
    cache.release()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::util::common_options::tests::fake_session;
    use dwtk::adapter::fake::{FakeHandle, FakeOp};
    use pretty_assertions::assert_eq;

    fn session() -> (DebugWire, FakeHandle) {
        fake_session("ATtiny85")
    }

    fn firmware(dw: &DebugWire, len: usize) -> Vec<FlashPage> {
        let image: Vec<u8> = (0..len).map(|i| i as u8).collect();
        dw.mcu().prepare_firmware(&image).unwrap()
    }

    #[test]
    fn program_then_verify() {
        let (mut dw, target) = session();
        target.lock().set_register(30, 0x12);
        let pages = firmware(&dw, 100);

        program(&mut dw, &pages, 0, PageProgress::hidden()).unwrap();
        verify(&mut dw, &pages, PageProgress::hidden()).unwrap();

        let target = target.lock();
        assert_eq!(target.page_writes, 2);
        assert_eq!(target.flash_word(0x40), 0x4140);
        assert_eq!(target.flash_word(0x64), 0xffff);
        assert_eq!(target.register(30), 0x12);
    }

    #[test]
    fn retry_rewrites_the_page() {
        let (mut dw, target) = session();
        let pages = firmware(&dw, 0x40);
        target.lock().fail_nth(FakeOp::WriteInstruction, 5);

        program(&mut dw, &pages, 1, PageProgress::hidden()).unwrap();

        verify(&mut dw, &pages, PageProgress::hidden()).unwrap();
        assert_eq!(target.lock().page_writes, 1);
    }

    #[test]
    fn no_retries_fails() {
        let (mut dw, target) = session();
        let pages = firmware(&dw, 0x40);
        target.lock().fail_nth(FakeOp::WriteInstruction, 5);

        let err = program(&mut dw, &pages, 0, PageProgress::hidden()).unwrap_err();

        assert_eq!(err.to_string(), "Failed to write flash page 0x0000");
    }

    #[test]
    fn verify_keeps_z() {
        let (mut dw, target) = session();
        let pages = firmware(&dw, 0x40);
        program(&mut dw, &pages, 0, PageProgress::hidden()).unwrap();
        target.lock().set_register(30, 0x34);
        target.lock().set_register(31, 0x12);

        verify(&mut dw, &pages, PageProgress::hidden()).unwrap();

        let target = target.lock();
        assert_eq!(target.register(30), 0x34);
        assert_eq!(target.register(31), 0x12);
    }

    #[test]
    fn failed_verify_keeps_z() {
        let (mut dw, target) = session();
        let pages = firmware(&dw, 0x40);
        target.lock().set_register(30, 0x34);

        assert!(verify(&mut dw, &pages, PageProgress::hidden()).is_err());

        assert_eq!(target.lock().register(30), 0x34);
    }

    #[test]
    fn mismatch_names_the_page() {
        let (mut dw, _target) = session();
        let pages = firmware(&dw, 0x80);

        let err = verify(&mut dw, &pages, PageProgress::hidden()).unwrap_err();

        assert_eq!(err.to_string(), "Verification failed at flash page 0x0000");
    }

    #[test]
    fn mismatch_in_a_later_page() {
        let (mut dw, target) = session();
        let pages = firmware(&dw, 0x80);
        program(&mut dw, &pages, 0, PageProgress::hidden()).unwrap();
        target.lock().flash[0x41] ^= 0xff;

        let err = verify(&mut dw, &pages, PageProgress::hidden()).unwrap_err();

        assert_eq!(err.to_string(), "Verification failed at flash page 0x0040");
    }
}
