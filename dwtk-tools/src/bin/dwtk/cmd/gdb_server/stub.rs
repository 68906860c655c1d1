use std::io::{self, Read, Write};
use std::net::TcpStream;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use dwtk::{DebugWire, DebugWireError};

use super::commands::{self, Options, Response};
use super::packet::{self, Event, PacketError, PacketReader};
use super::wait::{self, POLL_INTERVAL};

#[derive(Debug, thiserror::Error, docsplay::Display)]
pub enum ServerError {
    /// The connection to GDB failed
    Io(#[from] io::Error),

    /// Lost the packet framing
    Packet(#[from] PacketError),

    /// The target failed
    DebugWire(#[from] DebugWireError),
}

/// A byte stream to GDB that can be polled.
pub trait Connection: Read + Write {
    /// Waits up to `timeout` for incoming data. End of stream counts as readable.
    fn poll_readable(&mut self, timeout: Duration) -> io::Result<bool>;

    /// The next incoming byte, left in the stream. `None` at end of stream.
    fn peek_byte(&mut self) -> io::Result<Option<u8>>;
}

impl Connection for TcpStream {
    fn poll_readable(&mut self, timeout: Duration) -> io::Result<bool> {
        self.set_read_timeout(Some(timeout))?;
        let mut byte = [0];
        let readable = match self.peek(&mut byte) {
            Ok(_) => Ok(true),
            Err(e) if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut) => {
                Ok(false)
            }
            Err(e) => Err(e),
        };
        self.set_read_timeout(None)?;
        readable
    }

    fn peek_byte(&mut self) -> io::Result<Option<u8>> {
        let mut byte = [0];
        let read = self.peek(&mut byte)?;
        Ok((read > 0).then_some(byte[0]))
    }
}

/// One GDB client.
pub struct GdbStub<C> {
    conn: C,
    reader: PacketReader,
    /// Resent verbatim when GDB NACKs.
    last_reply: Vec<u8>,
    options: Options,
}

impl<C: Connection> GdbStub<C> {
    pub fn new(conn: C, options: Options) -> Self {
        Self {
            conn,
            reader: PacketReader::default(),
            last_reply: Vec::new(),
            options,
        }
    }

    /// Processes packets until GDB detaches or hangs up, or `exit` is raised.
    ///
    /// Framing errors and failures to halt or resynchronize the target end the session.
    /// Everything else is reported to GDB as an error reply.
    pub fn serve(&mut self, dw: &mut DebugWire, exit: &AtomicBool) -> Result<(), ServerError> {
        let mut byte = [0];

        while !exit.load(Ordering::SeqCst) {
            if !self.conn.poll_readable(POLL_INTERVAL)? {
                continue;
            }
            if self.conn.read(&mut byte)? == 0 {
                tracing::info!("GDB disconnected");
                return Ok(());
            }

            let Some(event) = self.reader.push(byte[0])? else {
                continue;
            };

            match event {
                Event::Ack => {}
                Event::Nack => {
                    tracing::debug!("GDB asked for a retransmission");
                    self.conn.write_all(&self.last_reply)?;
                }
                Event::Interrupt => {
                    tracing::debug!("Interrupt while the target is halted");
                    dw.send_break()?;
                }
                Event::Packet(payload) => {
                    tracing::trace!("<- {}", String::from_utf8_lossy(&payload));
                    self.conn.write_all(b"+")?;

                    match commands::dispatch(dw, &self.options, &payload) {
                        Response::Reply(reply) => self.send(&reply)?,
                        Response::Detach => {
                            self.send(b"OK")?;
                            tracing::info!("GDB detached");
                            return Ok(());
                        }
                        Response::Continue => {
                            let reason = wait::wait_for_stop(dw, &mut self.conn, exit)?;
                            match reason.reply() {
                                Some(reply) => self.send(reply)?,
                                None => return Ok(()),
                            }
                        }
                    }
                }
            }
        }

        Ok(())
    }

    fn send(&mut self, payload: &[u8]) -> Result<(), ServerError> {
        tracing::trace!("-> {}", String::from_utf8_lossy(payload));
        self.last_reply = packet::encode(payload);
        self.conn.write_all(&self.last_reply)?;
        self.conn.flush()?;
        Ok(())
    }
}
