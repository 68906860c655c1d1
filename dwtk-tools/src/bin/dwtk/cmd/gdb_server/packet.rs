//! Framing of GDB remote serial protocol packets.
//!
//! Packets have the form `$payload#cc`, where `cc` is the sum of the payload bytes
//! modulo 256 as two hex digits. Between packets the client sends `+` or `-` to
//! acknowledge the last reply, and a raw `0x03` to interrupt the target.

/// The interrupt byte GDB sends on Ctrl-C.
pub const INTERRUPT: u8 = 0x03;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    /// Between packets.
    Ack,
    /// Right after `$`.
    Start,
    Command,
    Checksum1,
    Checksum2,
}

/// Something the client sent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    /// The last reply arrived intact.
    Ack,
    /// The last reply arrived corrupted and has to be sent again.
    Nack,
    /// The user wants the target halted.
    Interrupt,
    /// A complete packet with a valid checksum.
    Packet(Vec<u8>),
}

#[derive(Debug, PartialEq, Eq, thiserror::Error, docsplay::Display)]
pub enum PacketError {
    /// Expected '+', '-' or '$' between packets, got {0:#04x}
    UnexpectedByte(u8),

    /// Invalid checksum digit {0:#04x}
    InvalidChecksumDigit(u8),

    /// Bad checksum: packet says {expected:#04x}, payload sums up to {got:#04x}
    BadChecksum {
        /// The checksum sent with the packet.
        expected: u8,
        /// The sum of the received payload.
        got: u8,
    },
}

/// Incremental packet parser, fed one byte at a time.
#[derive(Debug)]
pub struct PacketReader {
    state: State,
    payload: Vec<u8>,
    sum: u8,
    checksum: u8,
}

impl Default for PacketReader {
    fn default() -> Self {
        Self {
            state: State::Ack,
            payload: Vec::new(),
            sum: 0,
            checksum: 0,
        }
    }
}

impl PacketReader {
    /// Feeds one byte. Returns an event when one is complete.
    ///
    /// Errors mean the stream is out of sync and the connection should be dropped.
    pub fn push(&mut self, byte: u8) -> Result<Option<Event>, PacketError> {
        if byte == INTERRUPT {
            self.state = State::Ack;
            return Ok(Some(Event::Interrupt));
        }

        match (self.state, byte) {
            (State::Ack, b'+') => return Ok(Some(Event::Ack)),
            (State::Ack, b'-') => return Ok(Some(Event::Nack)),
            (State::Ack, b'$') => {
                self.payload.clear();
                self.sum = 0;
                self.state = State::Start;
            }
            (State::Ack, byte) => return Err(PacketError::UnexpectedByte(byte)),

            (State::Start | State::Command, b'#') => self.state = State::Checksum1,
            (State::Start | State::Command, byte) => {
                self.payload.push(byte);
                self.sum = self.sum.wrapping_add(byte);
                self.state = State::Command;
            }

            (State::Checksum1, byte) => {
                self.checksum = hex_digit(byte)? << 4;
                self.state = State::Checksum2;
            }
            (State::Checksum2, byte) => {
                self.checksum |= hex_digit(byte)?;
                self.state = State::Ack;

                if self.checksum != self.sum {
                    return Err(PacketError::BadChecksum {
                        expected: self.checksum,
                        got: self.sum,
                    });
                }
                return Ok(Some(Event::Packet(std::mem::take(&mut self.payload))));
            }
        }

        Ok(None)
    }
}

fn hex_digit(byte: u8) -> Result<u8, PacketError> {
    char::from(byte)
        .to_digit(16)
        .map(|digit| digit as u8)
        .ok_or(PacketError::InvalidChecksumDigit(byte))
}

/// Frames a reply payload.
pub fn encode(payload: &[u8]) -> Vec<u8> {
    let checksum = payload.iter().fold(0u8, |sum, byte| sum.wrapping_add(*byte));

    let mut packet = Vec::with_capacity(payload.len() + 4);
    packet.push(b'$');
    packet.extend_from_slice(payload);
    packet.extend_from_slice(format!("#{checksum:02x}").as_bytes());
    packet
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use test_case::test_case;

    fn feed(reader: &mut PacketReader, input: &[u8]) -> Result<Vec<Event>, PacketError> {
        let mut events = Vec::new();
        for byte in input {
            if let Some(event) = reader.push(*byte)? {
                events.push(event);
            }
        }
        Ok(events)
    }

    #[test_case(b"$qAttached#8f"; "lower case")]
    #[test_case(b"$qAttached#8F"; "upper case")]
    fn accepts_valid_checksum(input: &[u8]) {
        let mut reader = PacketReader::default();
        assert_eq!(
            feed(&mut reader, input).unwrap(),
            vec![Event::Packet(b"qAttached".to_vec())]
        );
    }

    #[test]
    fn rejects_bad_checksum() {
        let mut reader = PacketReader::default();
        assert_eq!(
            feed(&mut reader, b"$qAttached#90"),
            Err(PacketError::BadChecksum {
                expected: 0x90,
                got: 0x8f
            })
        );
    }

    #[test]
    fn rejects_non_hex_checksum() {
        let mut reader = PacketReader::default();
        assert_eq!(
            feed(&mut reader, b"$g#6z"),
            Err(PacketError::InvalidChecksumDigit(b'z'))
        );
    }

    #[test]
    fn acks_between_packets() {
        let mut reader = PacketReader::default();
        assert_eq!(
            feed(&mut reader, b"+$g#67-").unwrap(),
            vec![Event::Ack, Event::Packet(b"g".to_vec()), Event::Nack]
        );
    }

    #[test]
    fn garbage_between_packets() {
        let mut reader = PacketReader::default();
        assert_eq!(feed(&mut reader, b"x"), Err(PacketError::UnexpectedByte(b'x')));
    }

    #[test]
    fn interrupt_resets_framing() {
        let mut reader = PacketReader::default();
        assert_eq!(
            feed(&mut reader, b"$m00\x03$?#3f").unwrap(),
            vec![Event::Interrupt, Event::Packet(b"?".to_vec())]
        );
    }

    #[test]
    fn empty_packet() {
        let mut reader = PacketReader::default();
        assert_eq!(
            feed(&mut reader, b"$#00").unwrap(),
            vec![Event::Packet(Vec::new())]
        );
    }

    #[test_case(b"", b"$#00")]
    #[test_case(b"OK", b"$OK#9a")]
    #[test_case(b"S05", b"$S05#b8")]
    fn encodes(payload: &[u8], expected: &[u8]) {
        assert_eq!(encode(payload), expected);
    }
}
