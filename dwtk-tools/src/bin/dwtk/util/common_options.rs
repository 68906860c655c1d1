use anyhow::Context;
use dwtk::adapter::{self, AdapterKind, AdapterSelector};
use dwtk::DebugWire;
use dwtk_target::Registry;
use serde::{Deserialize, Serialize};

use crate::Config;

/// The adapter backend, as selected on the command line or in the configuration.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub enum AdapterChoice {
    /// Try the USB adapters first, then a USB serial converter.
    #[default]
    Auto,
    /// RESET wired to a USB serial converter.
    UsbSerial,
    /// dwtk USB adapter.
    Dwtk,
    /// dwtk-ice USB adapter.
    DwtkIce,
}

impl From<AdapterChoice> for AdapterKind {
    fn from(choice: AdapterChoice) -> Self {
        match choice {
            AdapterChoice::Auto => AdapterKind::Auto,
            AdapterChoice::UsbSerial => AdapterKind::UsbSerial,
            AdapterChoice::Dwtk => AdapterKind::Dwtk,
            AdapterChoice::DwtkIce => AdapterKind::DwtkIce,
        }
    }
}

impl Config {
    /// How to find the adapter.
    pub fn adapter_selector(&self) -> AdapterSelector {
        AdapterSelector {
            kind: self.adapter.into(),
            serial_port: self.serial_port.clone(),
            baudrate: self.baudrate(),
        }
    }
}

/// What happens to the target once a command is done with it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OnClose {
    /// Reset it and let it run.
    Resume,
    /// Leave it halted.
    Halt,
}

/// Opens the adapter and starts a session with whatever MCU answers.
pub fn attach(config: &Config) -> anyhow::Result<DebugWire> {
    let selector = config.adapter_selector();
    let adapter = adapter::open(&selector).context("Failed to open the debugWIRE adapter")?;
    tracing::info!("Using {}", adapter.info());

    let registry = Registry::from_builtin_families().context("Failed to load the MCU table")?;
    DebugWire::open(adapter, &registry).context("Failed to start a debugWIRE session")
}

/// Runs `f` against a fresh session and closes it afterwards.
///
/// The target is reset and resumed on close when `on_close` asks for it, and always
/// after a failure. A failure of `f` is reported in favour of a failure to close.
pub fn with_session<T>(
    config: &Config,
    on_close: OnClose,
    f: impl FnOnce(&mut DebugWire) -> anyhow::Result<T>,
) -> anyhow::Result<T> {
    let dw = attach(config)?;
    run_and_close(dw, on_close, f)
}

fn run_and_close<T>(
    mut dw: DebugWire,
    on_close: OnClose,
    f: impl FnOnce(&mut DebugWire) -> anyhow::Result<T>,
) -> anyhow::Result<T> {
    let result = f(&mut dw);
    let resume = on_close == OnClose::Resume || result.is_err();
    let closed = dw.close(resume);

    match (result, closed) {
        (Ok(value), Ok(())) => Ok(value),
        (Ok(_), Err(e)) => Err(e).context("Failed to close the debugWIRE session"),
        (Err(e), closed) => {
            if let Err(close_error) = closed {
                tracing::warn!("Failed to close the debugWIRE session: {}", close_error);
            }
            Err(e)
        }
    }
}
