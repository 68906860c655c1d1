//! Waiting for a running target while watching the GDB connection.
//!
//! While the target runs, three things can end the wait: the target stops on a
//! breakpoint, GDB sends Ctrl-C (or hangs up), or the process is asked to exit. The
//! target side blocks inside the adapter, so it gets its own scoped thread and is
//! cancelled through a [`CancellationToken`] when the connection side wins. The
//! waiter is always joined before the session is used again.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use dwtk::DebugWire;
use tokio_util::sync::CancellationToken;

use super::packet::INTERRUPT;
use super::stub::{Connection, ServerError};

/// How long one poll of the connection blocks.
pub const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// How a continue ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// The target stopped on its own, on a breakpoint.
    Stopped,
    /// GDB asked for a halt.
    Interrupted,
    /// The server is shutting down.
    Cancelled,
    /// GDB went away.
    Disconnected,
}

impl StopReason {
    /// The stop reply GDB gets, if anyone is left to get it.
    pub fn reply(self) -> Option<&'static [u8]> {
        match self {
            Self::Stopped => Some(b"S05"),
            Self::Interrupted => Some(b"S02"),
            Self::Cancelled => Some(b"S00"),
            Self::Disconnected => None,
        }
    }
}

/// What woke up the connection side.
enum Wakeup {
    Target,
    Exit,
    Readable,
}

/// Blocks until the resumed target stops, GDB interrupts, or `exit` is raised.
///
/// A target that was interrupted is halted with a break before returning. A target
/// that stopped has its stop break consumed.
pub fn wait_for_stop<C: Connection>(
    dw: &mut DebugWire,
    conn: &mut C,
    exit: &AtomicBool,
) -> Result<StopReason, ServerError> {
    let cancel = CancellationToken::new();

    let (wakeup, stopped) = std::thread::scope(|scope| {
        let waiter = scope.spawn(|| dw.wait_for_stop(&cancel));

        let wakeup = loop {
            if waiter.is_finished() {
                break Ok(Wakeup::Target);
            }
            if exit.load(Ordering::SeqCst) {
                break Ok(Wakeup::Exit);
            }
            match conn.poll_readable(POLL_INTERVAL) {
                Ok(true) => break Ok(Wakeup::Readable),
                Ok(false) => {}
                Err(e) => break Err(e),
            }
        };

        cancel.cancel();
        let stopped = waiter
            .join()
            .unwrap_or_else(|panic| std::panic::resume_unwind(panic));
        (wakeup, stopped)
    });

    // A stop that raced with the connection still counts. Anything GDB sent stays
    // queued for the packet loop.
    if stopped? {
        dw.recv_break()?;
        tracing::debug!("Target stopped");
        return Ok(StopReason::Stopped);
    }

    match wakeup? {
        Wakeup::Target => Ok(StopReason::Cancelled),
        Wakeup::Exit => {
            tracing::info!("Shutting down while the target runs");
            Ok(StopReason::Cancelled)
        }
        Wakeup::Readable => match conn.peek_byte()? {
            None => {
                tracing::info!("GDB disconnected while the target runs");
                Ok(StopReason::Disconnected)
            }
            Some(byte) => {
                if byte == INTERRUPT {
                    conn.read_exact(&mut [0])?;
                }
                tracing::debug!("Interrupted by GDB");
                dw.send_break()?;
                Ok(StopReason::Interrupted)
            }
        },
    }
}
