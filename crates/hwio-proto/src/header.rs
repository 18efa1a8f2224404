use crate::{Command, CodecError, BUFFER_SIZE};

/// `command:u16, body_len:u16, dev_id:u32`, packed, host-endian.
pub const HEADER_SIZE: usize = 8;

/// Fixed packet header. Every frame on the wire starts with one of these.
///
/// `dev_id` is `0` for session-level commands (PING, QUERY, BYE, MSG);
/// otherwise it names the device handle the command targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    pub command: Command,
    pub body_len: u16,
    pub dev_id: u32,
}

impl Header {
    pub fn new(command: Command, body_len: u16, dev_id: u32) -> Self {
        Self { command, body_len, dev_id }
    }

    pub fn session(command: Command, body_len: u16) -> Self {
        Self::new(command, body_len, 0)
    }

    /// Encodes into an `[u8; HEADER_SIZE]`. No I/O, never fails: the only
    /// failure modes (unknown command, oversized body) are caught earlier,
    /// at construction or decode time.
    pub fn encode(&self) -> [u8; HEADER_SIZE] {
        let mut buf = [0u8; HEADER_SIZE];
        buf[0..2].copy_from_slice(&self.command.code().to_ne_bytes());
        buf[2..4].copy_from_slice(&self.body_len.to_ne_bytes());
        buf[4..8].copy_from_slice(&self.dev_id.to_ne_bytes());
        buf
    }

    /// Decodes a header from exactly `HEADER_SIZE` bytes.
    ///
    /// Rejects any `body_len` that would push the frame past
    /// [`BUFFER_SIZE`] and any command code outside the closed set.
    pub fn decode(buf: &[u8]) -> Result<Self, CodecError> {
        if buf.len() < HEADER_SIZE {
            return Err(CodecError::BufferTooSmall { need: HEADER_SIZE, have: buf.len() });
        }
        let command_code = u16::from_ne_bytes(buf[0..2].try_into().unwrap());
        let body_len = u16::from_ne_bytes(buf[2..4].try_into().unwrap());
        let dev_id = u32::from_ne_bytes(buf[4..8].try_into().unwrap());

        let max_body = BUFFER_SIZE - HEADER_SIZE;
        if body_len as usize > max_body {
            return Err(CodecError::BodyTooLarge(body_len, max_body));
        }
        let command = Command::try_from(command_code)?;

        Ok(Self { command, body_len, dev_id })
    }

    /// Extracts just the `body_len` field, without validating the command
    /// code. Lets a caller that got `CodecError::UnknownCommand` back from
    /// `decode` still learn how many body bytes to drain off the socket to
    /// keep framing intact for the next request, since that count was
    /// already range-checked before the command code was.
    pub fn peek_body_len(buf: &[u8]) -> u16 {
        u16::from_ne_bytes(buf[2..4].try_into().expect("buf has at least HEADER_SIZE bytes"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_every_valid_header() {
        for (cmd, dev_id) in [
            (Command::PingRequest, 0),
            (Command::Query, 0),
            (Command::Read, 42),
            (Command::Write, 7),
            (Command::ErrorMsg, 0),
        ] {
            let h = Header::new(cmd, 16, dev_id);
            let bytes = h.encode();
            assert_eq!(Header::decode(&bytes).unwrap(), h);
        }
    }

    #[test]
    fn rejects_body_larger_than_buffer_size() {
        let too_big = (BUFFER_SIZE - HEADER_SIZE + 1) as u16;
        let h = Header::new(Command::Write, too_big, 1);
        let bytes = h.encode();
        assert_eq!(
            Header::decode(&bytes),
            Err(CodecError::BodyTooLarge(too_big, BUFFER_SIZE - HEADER_SIZE))
        );
    }

    #[test]
    fn rejects_short_buffer() {
        assert_eq!(
            Header::decode(&[0u8; 3]),
            Err(CodecError::BufferTooSmall { need: HEADER_SIZE, have: 3 })
        );
    }

    #[test]
    fn rejects_unknown_command_code() {
        let mut bytes = Header::new(Command::Bye, 0, 0).encode();
        bytes[0..2].copy_from_slice(&999u16.to_ne_bytes());
        assert_eq!(Header::decode(&bytes), Err(CodecError::UnknownCommand(999)));
    }
}
