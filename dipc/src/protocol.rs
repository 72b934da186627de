//! Wire format for diagnostic commands.
//!
//! Every message starts with a fixed 14-byte header followed by an
//! opaque payload. All integers are little endian:
//!
//! ```text
//! offset  size  field
//! ------  ----  ----------------------------------------
//!      0     8  magic, "DIPC_V1\0"
//!      8     2  size of the whole message, header included
//!     10     1  command set
//!     11     1  command
//!     12     2  reserved, must be zero
//! ```
//!
//! The command set routes a message to a subsystem; the command selects an
//! operation within it. Set `0xFF` is reserved for the server itself and
//! carries its OK and error replies. An error reply's payload is a single
//! little-endian `u32` status code.

use std::time::Duration;

use crate::error::{Error, Result};
use crate::stream::IpcStream;

/// Magic bytes opening every message.
pub const MAGIC: [u8; 8] = *b"DIPC_V1\0";

/// Encoded size of a [`MessageHeader`].
pub const HEADER_SIZE: usize = 14;

/// Largest encodable message, header included.
pub const MAX_MESSAGE_SIZE: usize = u16::MAX as usize;

/// Reply code: the command set or command is not recognized.
pub const ERR_UNKNOWN_COMMAND: u32 = 0x8013_0001;

/// Reply code: the magic bytes did not match.
pub const ERR_UNKNOWN_MAGIC: u32 = 0x8013_0002;

/// Reply code: the header or payload was malformed.
pub const ERR_BAD_ENCODING: u32 = 0x8013_0003;

/// Server-set command byte of a success reply.
pub const SERVER_OK: u8 = 0x00;

/// Server-set command byte of an error reply.
pub const SERVER_ERROR: u8 = 0xFF;

/// Subsystems a command can be routed to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum CommandSet {
    /// Process dump requests.
    Dump = 0x01,

    /// Event streaming session control.
    EventPipe = 0x02,

    /// Profiler attach requests.
    Profiler = 0x03,

    /// Replies from the server itself.
    Server = 0xFF,
}

impl CommandSet {
    /// Maps a wire byte back to a command set.
    pub const fn from_u8(value: u8) -> Option<CommandSet> {
        match value {
            0x01 => Some(CommandSet::Dump),
            0x02 => Some(CommandSet::EventPipe),
            0x03 => Some(CommandSet::Profiler),
            0xFF => Some(CommandSet::Server),
            _ => None,
        }
    }
}

/// Fixed-size frame header preceding every payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MessageHeader {
    /// Protocol magic; see [`MAGIC`].
    pub magic: [u8; 8],

    /// Size of the whole message including this header.
    pub size: u16,

    /// Subsystem the message is addressed to.
    pub command_set: u8,

    /// Operation within the subsystem.
    pub command: u8,

    /// Reserved; zero on the wire.
    pub reserved: u16,
}

impl MessageHeader {
    /// Builds a header for a payload of `payload_len` bytes.
    pub fn new(command_set: u8, command: u8, payload_len: usize) -> Result<Self> {
        let total = HEADER_SIZE + payload_len;
        if total > MAX_MESSAGE_SIZE {
            return Err(Error::BadEncoding("payload too large for one message"));
        }
        Ok(Self {
            magic: MAGIC,
            size: total as u16,
            command_set,
            command,
            reserved: 0,
        })
    }

    /// Encodes the header in wire order.
    pub fn to_bytes(&self) -> [u8; HEADER_SIZE] {
        let mut bytes = [0u8; HEADER_SIZE];
        bytes[0..8].copy_from_slice(&self.magic);
        bytes[8..10].copy_from_slice(&self.size.to_le_bytes());
        bytes[10] = self.command_set;
        bytes[11] = self.command;
        bytes[12..14].copy_from_slice(&self.reserved.to_le_bytes());
        bytes
    }

    /// Decodes a header as-is, without validating it.
    pub fn from_bytes(bytes: &[u8; HEADER_SIZE]) -> Self {
        let mut magic = [0u8; 8];
        magic.copy_from_slice(&bytes[0..8]);
        Self {
            magic,
            size: u16::from_le_bytes([bytes[8], bytes[9]]),
            command_set: bytes[10],
            command: bytes[11],
            reserved: u16::from_le_bytes([bytes[12], bytes[13]]),
        }
    }

    /// True when the magic bytes match this protocol.
    pub fn magic_ok(&self) -> bool {
        self.magic == MAGIC
    }

    /// Checks the size field against the fixed header length.
    pub fn validate(&self) -> Result<()> {
        if (self.size as usize) < HEADER_SIZE {
            return Err(Error::BadEncoding("message size smaller than its header"));
        }
        Ok(())
    }

    /// Number of payload bytes following the header.
    pub fn payload_len(&self) -> usize {
        (self.size as usize).saturating_sub(HEADER_SIZE)
    }
}

/// A complete framed message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    /// Frame header.
    pub header: MessageHeader,

    /// Opaque payload; its meaning belongs to the command set.
    pub payload: Vec<u8>,
}

impl Message {
    /// Builds a message addressed to `command_set`.
    pub fn new(command_set: CommandSet, command: u8, payload: Vec<u8>) -> Result<Self> {
        let header = MessageHeader::new(command_set as u8, command, payload.len())?;
        Ok(Self { header, payload })
    }

    /// Encodes header and payload in wire order.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(HEADER_SIZE + self.payload.len());
        bytes.extend_from_slice(&self.header.to_bytes());
        bytes.extend_from_slice(&self.payload);
        bytes
    }
}

/// Reads one framed message. The timeout bounds each of the two reads,
/// header and payload, separately.
pub fn read_message(stream: &mut IpcStream, timeout: Option<Duration>) -> Result<Message> {
    let mut header_bytes = [0u8; HEADER_SIZE];
    stream.read_exact(&mut header_bytes, timeout)?;
    let header = MessageHeader::from_bytes(&header_bytes);
    if !header.magic_ok() {
        return Err(Error::InvalidMagic);
    }
    header.validate()?;

    let mut payload = vec![0u8; header.payload_len()];
    stream.read_exact(&mut payload, timeout)?;
    Ok(Message { header, payload })
}

/// Writes one framed message and flushes it.
pub fn write_message(
    stream: &mut IpcStream,
    message: &Message,
    timeout: Option<Duration>,
) -> Result<()> {
    stream.write_all(&message.to_bytes(), timeout)?;
    stream.flush()
}

/// Builds a success reply.
pub fn ok_message() -> Message {
    let header = MessageHeader {
        magic: MAGIC,
        size: HEADER_SIZE as u16,
        command_set: CommandSet::Server as u8,
        command: SERVER_OK,
        reserved: 0,
    };
    Message {
        header,
        payload: Vec::new(),
    }
}

/// Builds an error reply carrying `code` as its payload.
pub fn error_message(code: u32) -> Message {
    let payload = code.to_le_bytes().to_vec();
    let header = MessageHeader {
        magic: MAGIC,
        size: (HEADER_SIZE + payload.len()) as u16,
        command_set: CommandSet::Server as u8,
        command: SERVER_ERROR,
        reserved: 0,
    };
    Message { header, payload }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::Role;
    use std::os::unix::net::UnixStream;

    fn stream_pair() -> (IpcStream, IpcStream) {
        let (a, b) = UnixStream::pair().unwrap();
        let a = IpcStream::from_socket(a, Role::Listen, None).unwrap();
        let b = IpcStream::from_socket(b, Role::Connect, None).unwrap();
        (a, b)
    }

    #[test]
    fn test_protocol_header_roundtrip() {
        let header = MessageHeader::new(CommandSet::EventPipe as u8, 0x01, 5).unwrap();
        let decoded = MessageHeader::from_bytes(&header.to_bytes());
        assert_eq!(decoded, header);
        assert!(decoded.magic_ok());
        decoded.validate().unwrap();
        assert_eq!(decoded.payload_len(), 5);
        assert_eq!(decoded.size, (HEADER_SIZE + 5) as u16);
    }

    #[test]
    fn test_protocol_rejects_size_below_header() {
        let mut bytes = [0u8; HEADER_SIZE];
        bytes[0..8].copy_from_slice(&MAGIC);
        bytes[8..10].copy_from_slice(&7u16.to_le_bytes());
        let header = MessageHeader::from_bytes(&bytes);
        assert!(header.magic_ok());
        assert!(matches!(header.validate(), Err(Error::BadEncoding(_))));
    }

    #[test]
    fn test_protocol_rejects_oversized_payload() {
        let result = Message::new(CommandSet::Dump, 0x01, vec![0u8; MAX_MESSAGE_SIZE]);
        assert!(matches!(result, Err(Error::BadEncoding(_))));
    }

    #[test]
    fn test_protocol_error_reply_layout() {
        let message = error_message(ERR_UNKNOWN_MAGIC);
        let bytes = message.to_bytes();
        assert_eq!(bytes.len(), HEADER_SIZE + 4);
        assert_eq!(&bytes[0..8], &MAGIC);
        assert_eq!(
            u16::from_le_bytes([bytes[8], bytes[9]]) as usize,
            HEADER_SIZE + 4
        );
        assert_eq!(bytes[10], CommandSet::Server as u8);
        assert_eq!(bytes[11], SERVER_ERROR);
        assert_eq!(
            u32::from_le_bytes([bytes[14], bytes[15], bytes[16], bytes[17]]),
            ERR_UNKNOWN_MAGIC
        );
    }

    #[test]
    fn test_protocol_command_set_from_wire_byte() {
        assert_eq!(CommandSet::from_u8(0x01), Some(CommandSet::Dump));
        assert_eq!(CommandSet::from_u8(0x02), Some(CommandSet::EventPipe));
        assert_eq!(CommandSet::from_u8(0x03), Some(CommandSet::Profiler));
        assert_eq!(CommandSet::from_u8(0xFF), Some(CommandSet::Server));
        assert_eq!(CommandSet::from_u8(0x42), None);
    }

    #[test]
    fn test_protocol_message_roundtrip_over_stream() {
        let (mut server, mut client) = stream_pair();
        let sent = Message::new(CommandSet::Dump, 0x01, b"abc".to_vec()).unwrap();
        write_message(&mut client, &sent, Some(Duration::from_secs(5))).unwrap();

        let received = read_message(&mut server, Some(Duration::from_secs(5))).unwrap();
        assert_eq!(received, sent);
        assert_eq!(received.header.command_set, CommandSet::Dump as u8);
        assert_eq!(received.payload, b"abc");
    }

    #[test]
    fn test_protocol_read_rejects_bad_magic() {
        let (mut server, mut client) = stream_pair();
        let mut bytes = [0u8; HEADER_SIZE];
        bytes[0..8].copy_from_slice(b"BOGUS!!\0");
        bytes[8..10].copy_from_slice(&(HEADER_SIZE as u16).to_le_bytes());
        client
            .write_all(&bytes, Some(Duration::from_secs(5)))
            .unwrap();

        let result = read_message(&mut server, Some(Duration::from_secs(5)));
        assert!(matches!(result, Err(Error::InvalidMagic)));
    }

    #[test]
    fn test_protocol_read_times_out_on_silence() {
        let (mut server, _client) = stream_pair();
        let result = read_message(&mut server, Some(Duration::from_millis(50)));
        assert!(matches!(result, Err(Error::TimedOut)));
    }
}
