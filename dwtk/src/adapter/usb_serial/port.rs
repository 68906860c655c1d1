//! Half duplex, echo checked debugWIRE line on top of a serial port.

use std::fmt;
use std::io::{self, Read, Write};
use std::time::Duration;

use serialport::{ClearBuffer, SerialPort};

use crate::adapter::AdapterError;

/// The operations the line needs from a serial port.
pub(crate) trait Port: Send + fmt::Debug {
    fn write_all(&mut self, data: &[u8]) -> io::Result<()>;
    /// Reads at least one byte, or times out.
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize>;
    fn bytes_to_read(&mut self) -> Result<u32, AdapterError>;
    fn set_break(&mut self) -> Result<(), AdapterError>;
    fn clear_break(&mut self) -> Result<(), AdapterError>;
    fn clear_input(&mut self) -> Result<(), AdapterError>;
}

impl<P: Port + ?Sized> Port for Box<P> {
    fn write_all(&mut self, data: &[u8]) -> io::Result<()> {
        (**self).write_all(data)
    }

    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        (**self).read(buf)
    }

    fn bytes_to_read(&mut self) -> Result<u32, AdapterError> {
        (**self).bytes_to_read()
    }

    fn set_break(&mut self) -> Result<(), AdapterError> {
        (**self).set_break()
    }

    fn clear_break(&mut self) -> Result<(), AdapterError> {
        (**self).clear_break()
    }

    fn clear_input(&mut self) -> Result<(), AdapterError> {
        (**self).clear_input()
    }
}

/// An open serial port.
pub(crate) struct SerialDevice(pub Box<dyn SerialPort>);

impl fmt::Debug for SerialDevice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("SerialDevice").field(&self.0.name()).finish()
    }
}

impl Port for SerialDevice {
    fn write_all(&mut self, data: &[u8]) -> io::Result<()> {
        Write::write_all(&mut self.0, data)?;
        Write::flush(&mut self.0)
    }

    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        Read::read(&mut self.0, buf)
    }

    fn bytes_to_read(&mut self) -> Result<u32, AdapterError> {
        Ok(self.0.bytes_to_read()?)
    }

    fn set_break(&mut self) -> Result<(), AdapterError> {
        Ok(self.0.set_break()?)
    }

    fn clear_break(&mut self) -> Result<(), AdapterError> {
        Ok(self.0.clear_break()?)
    }

    fn clear_input(&mut self) -> Result<(), AdapterError> {
        Ok(self.0.clear(ClearBuffer::All)?)
    }
}

/// A debugWIRE line.
///
/// TX and RX share the RESET pin, so every byte written comes back. Writes are staged
/// and only go out when something has to be read, which keeps multi command sequences
/// in one transfer. The echo is checked byte for byte.
#[derive(Debug)]
pub(crate) struct Line<P> {
    port: P,
    baudrate: u32,
    staged: Vec<u8>,
}

impl<P: Port> Line<P> {
    pub fn new(port: P, baudrate: u32) -> Self {
        Self {
            port,
            baudrate,
            staged: Vec::new(),
        }
    }

    pub fn baudrate(&self) -> u32 {
        self.baudrate
    }

    /// Stages bytes for the next commit.
    pub fn write(&mut self, data: &[u8]) {
        self.staged.extend_from_slice(data);
    }

    /// Sends the staged bytes and checks their echo.
    pub fn commit(&mut self) -> Result<(), AdapterError> {
        if self.staged.is_empty() {
            return Ok(());
        }

        let staged = std::mem::take(&mut self.staged);
        tracing::trace!(">>> {:02x?}", staged);
        self.port.write_all(&staged)?;

        let mut echo = vec![0; staged.len()];
        self.read_exact(&mut echo)?;

        match staged.iter().zip(&echo).find(|(sent, got)| sent != got) {
            Some((&expected, &got)) => Err(AdapterError::EchoMismatch { expected, got }),
            None => Ok(()),
        }
    }

    fn read_exact(&mut self, buf: &mut [u8]) -> Result<(), AdapterError> {
        let mut filled = 0;
        while filled < buf.len() {
            match self.port.read(&mut buf[filled..]) {
                Ok(0) => return Err(AdapterError::UnexpectedEof),
                Ok(n) => filled += n,
                Err(e) if e.kind() == io::ErrorKind::TimedOut => {
                    return Err(AdapterError::UnexpectedEof)
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e.into()),
            }
        }
        tracing::trace!("<<< {:02x?}", buf);
        Ok(())
    }

    /// Commits, then reads the answer.
    pub fn read(&mut self, buf: &mut [u8]) -> Result<(), AdapterError> {
        self.commit()?;
        self.read_exact(buf)
    }

    /// Commits, then reads a big endian word.
    pub fn read_word(&mut self) -> Result<u16, AdapterError> {
        let mut word = [0; 2];
        self.read(&mut word)?;
        Ok(u16::from_be_bytes(word))
    }

    /// Holds the line low for about two frames.
    pub fn send_break(&mut self) -> Result<(), AdapterError> {
        self.commit()?;
        tracing::trace!("> break");

        self.port.clear_input()?;
        self.port.set_break()?;
        std::thread::sleep(Duration::from_micros(20_000_000 / u64::from(self.baudrate)));
        self.port.clear_break()
    }

    /// Waits for the sync byte that follows a break. Line noise around the break is skipped.
    pub fn recv_break(&mut self) -> Result<u8, AdapterError> {
        self.commit()?;
        tracing::trace!("< break");

        let mut byte = [0];
        loop {
            self.read_exact(&mut byte)?;
            if byte[0] != 0x00 && byte[0] != 0xff {
                return Ok(byte[0]);
            }
        }
    }

    /// Whether the target sent something, usually the break of a stop.
    pub fn has_input(&mut self) -> Result<bool, AdapterError> {
        self.commit()?;
        Ok(self.port.bytes_to_read()? > 0)
    }
}

#[cfg(test)]
pub(crate) mod mock {
    use std::collections::VecDeque;
    use std::io;
    use std::sync::Arc;

    use parking_lot::{Mutex, MutexGuard};

    use super::Port;
    use crate::adapter::AdapterError;

    #[derive(Debug, Default)]
    pub struct MockState {
        pub written: Vec<u8>,
        pub input: VecDeque<u8>,
        /// Replies queued to show up after the next write, in order.
        pub replies: VecDeque<Vec<u8>>,
        pub corrupt_echo: bool,
        /// Breaks go unanswered, like a target clocked far below the baud rate.
        pub silent: bool,
        pub breaks: usize,
    }

    /// A port that echoes everything written and then plays back canned answers.
    ///
    /// Clones share their state, so a test can keep one while the line owns another.
    #[derive(Debug, Clone, Default)]
    pub struct MockPort(Arc<Mutex<MockState>>);

    impl MockPort {
        pub fn state(&self) -> MutexGuard<'_, MockState> {
            self.0.lock()
        }

        pub fn reply(&self, data: &[u8]) {
            self.state().replies.push_back(data.to_vec());
        }
    }

    impl Port for MockPort {
        fn write_all(&mut self, data: &[u8]) -> io::Result<()> {
            let mut state = self.state();
            state.written.extend_from_slice(data);
            let mut echo = data.to_vec();
            if state.corrupt_echo {
                if let Some(last) = echo.last_mut() {
                    *last ^= 0x01;
                }
            }
            state.input.extend(echo);
            if let Some(reply) = state.replies.pop_front() {
                state.input.extend(reply);
            }
            Ok(())
        }

        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            let mut state = self.state();
            let n = buf.len().min(state.input.len());
            if n == 0 {
                return Err(io::ErrorKind::TimedOut.into());
            }
            for (slot, byte) in buf.iter_mut().zip(state.input.drain(..n)) {
                *slot = byte;
            }
            Ok(n)
        }

        fn bytes_to_read(&mut self) -> Result<u32, AdapterError> {
            Ok(self.state().input.len() as u32)
        }

        fn set_break(&mut self) -> Result<(), AdapterError> {
            self.state().breaks += 1;
            Ok(())
        }

        fn clear_break(&mut self) -> Result<(), AdapterError> {
            let mut state = self.state();
            // The target answers a break with noise and the sync byte.
            if !state.silent {
                state.input.extend([0x00, 0x55]);
            }
            Ok(())
        }

        fn clear_input(&mut self) -> Result<(), AdapterError> {
            self.state().input.clear();
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::mock::MockPort;
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn writes_are_staged_until_read() {
        let port = MockPort::default();
        let mut line = Line::new(port.clone(), 125_000);
        line.write(&[0xd0, 0x00, 0x10]);
        line.write(&[0xf0]);
        assert!(port.state().written.is_empty());

        port.reply(&[0x00, 0x11]);
        assert_eq!(line.read_word().unwrap(), 0x0011);
        assert_eq!(port.state().written, [0xd0, 0x00, 0x10, 0xf0]);
    }

    #[test]
    fn echo_mismatch() {
        let port = MockPort::default();
        port.state().corrupt_echo = true;
        let mut line = Line::new(port, 125_000);
        line.write(&[0x40, 0x30]);

        assert!(matches!(
            line.commit(),
            Err(AdapterError::EchoMismatch {
                expected: 0x30,
                got: 0x31
            })
        ));
    }

    #[test]
    fn missing_answer_is_eof() {
        let mut line = Line::new(MockPort::default(), 125_000);
        let mut buf = [0; 2];
        assert!(matches!(line.read(&mut buf), Err(AdapterError::UnexpectedEof)));
    }

    #[test]
    fn break_skips_noise() {
        let port = MockPort::default();
        let mut line = Line::new(port.clone(), 1_000_000);
        line.send_break().unwrap();
        assert_eq!(line.recv_break().unwrap(), 0x55);
        assert_eq!(port.state().breaks, 1);
    }

    #[test]
    fn has_input_after_stop() {
        let port = MockPort::default();
        let mut line = Line::new(port.clone(), 125_000);
        assert!(!line.has_input().unwrap());
        port.state().input.push_back(0x55);
        assert!(line.has_input().unwrap());
    }
}
