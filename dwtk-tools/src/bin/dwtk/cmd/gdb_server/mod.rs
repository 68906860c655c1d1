//! GDB server

mod commands;
mod packet;
mod stub;
mod wait;

use std::net::TcpListener;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use anyhow::Context;
use dwtk::{DebugWire, DebugWireError};
use signal_hook::consts::signal;

use crate::util::common_options::{with_session, OnClose};
use crate::Config;

use commands::Options;
use stub::GdbStub;

#[derive(clap::Parser)]
pub struct Cmd {
    /// Address to listen on for GDB. Defaults to `gdb.address` from the configuration,
    /// `localhost:8000` out of the box.
    #[clap(long, short = 'a')]
    addr: Option<String>,

    /// Keep the target's timers running while it executes.
    #[clap(long, short = 't')]
    run_timers: bool,

    /// Reply with an error to EEPROM accesses instead of performing them.
    #[clap(long)]
    no_eeprom: bool,
}

impl Cmd {
    pub fn run(self, config: &Config) -> anyhow::Result<()> {
        let address = self.addr.unwrap_or_else(|| config.gdb.address.clone());
        let run_timers = self.run_timers || config.gdb.run_timers;
        let options = Options {
            eeprom_access: config.gdb.eeprom_access && !self.no_eeprom,
        };

        with_session(config, OnClose::Resume, |dw| {
            serve(dw, &address, run_timers, options)
        })
    }
}

/// Serves exactly one GDB client.
fn serve(dw: &mut DebugWire, address: &str, run_timers: bool, options: Options) -> anyhow::Result<()> {
    let listener = TcpListener::bind(address)
        .with_context(|| format!("Failed to listen for GDB on {address}"))?;
    println!("Waiting for GDB on {}", listener.local_addr()?);

    let (stream, peer) = listener
        .accept()
        .context("Failed to accept a GDB connection")?;
    tracing::info!("GDB connected from {}", peer);
    stream.set_nodelay(true)?;
    drop(listener);

    let exit = Arc::new(AtomicBool::new(false));
    let sig_ids = [signal::SIGINT, signal::SIGTERM]
        .into_iter()
        .map(|sig| signal_hook::flag::register(sig, exit.clone()))
        .collect::<Result<Vec<_>, _>>()?;

    dw.set_timers(run_timers);
    let result = dw
        .reset()
        .map_err(Into::into)
        .and_then(|()| GdbStub::new(stream, options).serve(dw, &exit));

    for sig_id in sig_ids {
        signal_hook::low_level::unregister(sig_id);
    }
    // A second Ctrl-C while cleaning up terminates.
    signal_hook::flag::register_conditional_default(signal::SIGINT, exit)?;

    let cleanup = remove_sw_breakpoints(dw);
    match (result, cleanup) {
        (Ok(()), Ok(())) => Ok(()),
        (Err(e), Ok(())) => Err(e.into()),
        (Ok(()), Err(cleanup)) => Err(cleanup).context("Failed to remove software breakpoints"),
        (Err(e), Err(cleanup)) => Err(anyhow::anyhow!(
            "{:#}; failed to remove software breakpoints: {:#}",
            anyhow::Error::from(e),
            anyhow::Error::from(cleanup)
        )),
    }
}

/// Removes software breakpoints GDB left behind, halting the target with a reset first.
fn remove_sw_breakpoints(dw: &mut DebugWire) -> Result<(), DebugWireError> {
    if !dw.has_sw_breakpoints() {
        return Ok(());
    }

    tracing::info!("Removing software breakpoints left by GDB");
    let errors = [dw.reset(), dw.clear_sw_breakpoints()]
        .into_iter()
        .filter_map(Result::err)
        .collect();
    DebugWireError::join(errors)
}
