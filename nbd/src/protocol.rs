//! NBD oldstyle transmission constants and frame types.
//!
//! Only the fixed-size legacy request/reply frames are modelled here. All
//! multi-byte integers are big-endian and frames carry no padding.

use std::fmt;
use std::io;

use thiserror::Error;

// Magic values
pub const NBD_REQUEST_MAGIC: u32 = 0x25609513;
pub const NBD_REPLY_MAGIC: u32 = 0x67446698;

// Transmission flags
pub const NBD_FLAG_HAS_FLAGS: u16 = 1 << 0;
pub const NBD_FLAG_READ_ONLY: u16 = 1 << 1;
pub const NBD_FLAG_SEND_FLUSH: u16 = 1 << 2;
pub const NBD_FLAG_SEND_TRIM: u16 = 1 << 5;

/// Maximum payload size for READ/WRITE (32 MiB).
///
/// Bounds the buffers a single request may carry. TRIM describes a range
/// without transferring it and is not bounded by this limit.
pub const NBD_MAX_PAYLOAD_SIZE: u32 = 32 * 1024 * 1024;

// Commands
pub const NBD_CMD_READ: u32 = 0;
pub const NBD_CMD_WRITE: u32 = 1;
pub const NBD_CMD_DISC: u32 = 2;
pub const NBD_CMD_FLUSH: u32 = 3;
pub const NBD_CMD_TRIM: u32 = 4;

// Error codes
pub const NBD_OK: u32 = 0;
pub const NBD_EPERM: u32 = 1;
pub const NBD_EIO: u32 = 5;
pub const NBD_ENOMEM: u32 = 12;
pub const NBD_EINVAL: u32 = 22;
pub const NBD_ENOSPC: u32 = 28;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NbdCommand {
    Read,
    Write,
    Disconnect,
    Flush,
    Trim,
}

impl NbdCommand {
    pub fn from_u32(v: u32) -> Option<Self> {
        match v {
            NBD_CMD_READ => Some(Self::Read),
            NBD_CMD_WRITE => Some(Self::Write),
            NBD_CMD_DISC => Some(Self::Disconnect),
            NBD_CMD_FLUSH => Some(Self::Flush),
            NBD_CMD_TRIM => Some(Self::Trim),
            _ => None,
        }
    }

    pub fn to_u32(self) -> u32 {
        match self {
            Self::Read => NBD_CMD_READ,
            Self::Write => NBD_CMD_WRITE,
            Self::Disconnect => NBD_CMD_DISC,
            Self::Flush => NBD_CMD_FLUSH,
            Self::Trim => NBD_CMD_TRIM,
        }
    }

    /// Whether a request frame with this command is followed by payload.
    pub fn has_request_payload(self) -> bool {
        self == Self::Write
    }

    /// Whether a successful reply to this command is followed by payload.
    pub fn has_reply_payload(self) -> bool {
        self == Self::Read
    }
}

impl fmt::Display for NbdCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Read => "read",
            Self::Write => "write",
            Self::Disconnect => "disconnect",
            Self::Flush => "flush",
            Self::Trim => "trim",
        };
        f.write_str(name)
    }
}

/// Opaque 8-byte request identifier, echoed verbatim by the peer.
///
/// The engine fills it from a session-scoped counter; on the wire it is
/// the counter's big-endian encoding.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Handle(pub u64);

impl Handle {
    #[inline]
    pub fn to_bytes(self) -> [u8; 8] {
        self.0.to_be_bytes()
    }

    #[inline]
    pub fn from_bytes(bytes: [u8; 8]) -> Self {
        Self(u64::from_be_bytes(bytes))
    }
}

impl fmt::Display for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#018x}", self.0)
    }
}

/// Frame-level protocol violations.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("bad magic: expected 0x{expected:08x}, got 0x{actual:08x}")]
    BadMagic { expected: u32, actual: u32 },

    #[error("reply for unknown handle {handle}")]
    UnknownHandle { handle: Handle },

    #[error("unsupported command: {command}")]
    UnsupportedCommand { command: u32 },
}

/// Failures moving bytes over the stream.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("stream closed by peer")]
    Closed,

    #[error("partial transfer: {transferred} of {expected} bytes")]
    Partial { transferred: usize, expected: usize },

    #[error("stream i/o failed: {0}")]
    Underlying(#[from] io::Error),
}

/// NBD transmission errors.
#[derive(Debug, Error)]
pub enum NbdError {
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("server error: {code}")]
    ServerError { code: u32 },
}

impl From<io::Error> for NbdError {
    fn from(err: io::Error) -> Self {
        Self::Transport(TransportError::Underlying(err))
    }
}

impl NbdError {
    /// True when the peer closed the stream cleanly between frames.
    pub fn is_closed(&self) -> bool {
        matches!(self, Self::Transport(TransportError::Closed))
    }
}

/// NBD request header (28 bytes on wire).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NbdRequest {
    pub command: NbdCommand,
    pub handle: Handle,
    pub offset: u64,
    /// Byte count: payload size for Read/Write, range size for Trim, zero
    /// for Flush and Disconnect.
    pub length: u32,
}

impl NbdRequest {
    pub const SIZE_BYTES: usize = 28;

    /// Disconnect carries no offset, length or payload.
    pub fn disconnect(handle: Handle) -> Self {
        Self {
            command: NbdCommand::Disconnect,
            handle,
            offset: 0,
            length: 0,
        }
    }

    /// Serialize an NBD request header to bytes.
    pub fn to_bytes(&self) -> [u8; Self::SIZE_BYTES] {
        let mut buf = [0u8; Self::SIZE_BYTES];
        buf[0..4].copy_from_slice(&NBD_REQUEST_MAGIC.to_be_bytes());
        buf[4..8].copy_from_slice(&self.command.to_u32().to_be_bytes());
        buf[8..16].copy_from_slice(&self.handle.to_bytes());
        buf[16..24].copy_from_slice(&self.offset.to_be_bytes());
        buf[24..28].copy_from_slice(&self.length.to_be_bytes());
        buf
    }

    /// Parse an NBD request header.
    pub fn from_bytes(buf: &[u8; Self::SIZE_BYTES]) -> Result<Self, ProtocolError> {
        let magic = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]);
        if magic != NBD_REQUEST_MAGIC {
            return Err(ProtocolError::BadMagic {
                expected: NBD_REQUEST_MAGIC,
                actual: magic,
            });
        }

        let cmd = u32::from_be_bytes([buf[4], buf[5], buf[6], buf[7]]);
        let command =
            NbdCommand::from_u32(cmd).ok_or(ProtocolError::UnsupportedCommand { command: cmd })?;
        let handle = Handle::from_bytes(read_array(&buf[8..16]));
        let offset = u64::from_be_bytes(read_array(&buf[16..24]));
        let length = u32::from_be_bytes(read_array(&buf[24..28]));

        Ok(Self {
            command,
            handle,
            offset,
            length,
        })
    }
}

/// NBD reply header (16 bytes on wire).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NbdReply {
    pub error: u32,
    pub handle: Handle,
}

impl NbdReply {
    pub const SIZE_BYTES: usize = 16;

    pub fn ok(handle: Handle) -> Self {
        Self {
            error: NBD_OK,
            handle,
        }
    }

    pub fn error(handle: Handle, error: u32) -> Self {
        Self { error, handle }
    }

    pub fn is_ok(&self) -> bool {
        self.error == NBD_OK
    }

    pub fn to_bytes(&self) -> [u8; Self::SIZE_BYTES] {
        let mut buf = [0u8; Self::SIZE_BYTES];
        buf[0..4].copy_from_slice(&NBD_REPLY_MAGIC.to_be_bytes());
        buf[4..8].copy_from_slice(&self.error.to_be_bytes());
        buf[8..16].copy_from_slice(&self.handle.to_bytes());
        buf
    }

    /// Parse a reply header. The handle is returned as-is; matching it to a
    /// request is the caller's job.
    pub fn from_bytes(buf: &[u8; Self::SIZE_BYTES]) -> Result<Self, ProtocolError> {
        let magic = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]);
        if magic != NBD_REPLY_MAGIC {
            return Err(ProtocolError::BadMagic {
                expected: NBD_REPLY_MAGIC,
                actual: magic,
            });
        }

        let error = u32::from_be_bytes(read_array(&buf[4..8]));
        let handle = Handle::from_bytes(read_array(&buf[8..16]));
        Ok(Self { error, handle })
    }
}

#[inline]
fn read_array<const N: usize>(src: &[u8]) -> [u8; N] {
    let mut out = [0u8; N];
    out.copy_from_slice(src);
    out
}

const _: () = {
    assert!(NbdRequest::SIZE_BYTES == 28);
    assert!(NbdReply::SIZE_BYTES == 16);
};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_layout_is_big_endian() {
        let req = NbdRequest {
            command: NbdCommand::Write,
            handle: Handle(0x0102030405060708),
            offset: 0x1122334455667788,
            length: 4096,
        };
        let buf = req.to_bytes();
        assert_eq!(&buf[0..4], &[0x25, 0x60, 0x95, 0x13]);
        assert_eq!(&buf[4..8], &[0, 0, 0, 1]);
        assert_eq!(&buf[8..16], &[1, 2, 3, 4, 5, 6, 7, 8]);
        assert_eq!(
            &buf[16..24],
            &[0x11, 0x22, 0x33, 0x44, 0x55, 0x66, 0x77, 0x88]
        );
        assert_eq!(&buf[24..28], &[0, 0, 0x10, 0]);
    }

    #[test]
    fn request_roundtrip() {
        let req = NbdRequest {
            command: NbdCommand::Read,
            handle: Handle(12345),
            offset: 1024,
            length: 512,
        };
        let parsed = NbdRequest::from_bytes(&req.to_bytes()).unwrap();
        assert_eq!(parsed, req);
    }

    #[test]
    fn reply_roundtrip() {
        for reply in [
            NbdReply::ok(Handle(42)),
            NbdReply::error(Handle(u64::MAX), NBD_EIO),
        ] {
            let parsed = NbdReply::from_bytes(&reply.to_bytes()).unwrap();
            assert_eq!(parsed, reply);
        }
    }

    #[test]
    fn reply_layout() {
        let buf = NbdReply::error(Handle(7), NBD_EINVAL).to_bytes();
        assert_eq!(&buf[0..4], &[0x67, 0x44, 0x66, 0x98]);
        assert_eq!(&buf[4..8], &[0, 0, 0, 22]);
        assert_eq!(&buf[8..16], &[0, 0, 0, 0, 0, 0, 0, 7]);
    }

    #[test]
    fn reply_invalid_magic() {
        let mut buf = [0u8; NbdReply::SIZE_BYTES];
        buf[0..4].copy_from_slice(&0xDEADBEEFu32.to_be_bytes());
        let result = NbdReply::from_bytes(&buf);
        assert!(matches!(
            result,
            Err(ProtocolError::BadMagic {
                expected: NBD_REPLY_MAGIC,
                actual: 0xDEADBEEF
            })
        ));
    }

    #[test]
    fn request_magic_is_not_a_reply_magic() {
        let buf = NbdRequest::disconnect(Handle(1)).to_bytes();
        let mut reply = [0u8; NbdReply::SIZE_BYTES];
        reply.copy_from_slice(&buf[..NbdReply::SIZE_BYTES]);
        assert!(NbdReply::from_bytes(&reply).is_err());
    }

    #[test]
    fn request_unsupported_command() {
        let mut buf = [0u8; NbdRequest::SIZE_BYTES];
        buf[0..4].copy_from_slice(&NBD_REQUEST_MAGIC.to_be_bytes());
        buf[4..8].copy_from_slice(&99u32.to_be_bytes());
        let result = NbdRequest::from_bytes(&buf);
        assert!(matches!(
            result,
            Err(ProtocolError::UnsupportedCommand { command: 99 })
        ));
    }

    #[test]
    fn disconnect_has_no_range() {
        let req = NbdRequest::disconnect(Handle(9));
        let buf = req.to_bytes();
        assert_eq!(&buf[16..28], &[0u8; 12]);
    }

    #[test]
    fn all_commands_parse() {
        for (cmd, expected) in [
            (NbdCommand::Read, NBD_CMD_READ),
            (NbdCommand::Write, NBD_CMD_WRITE),
            (NbdCommand::Disconnect, NBD_CMD_DISC),
            (NbdCommand::Flush, NBD_CMD_FLUSH),
            (NbdCommand::Trim, NBD_CMD_TRIM),
        ] {
            assert_eq!(cmd.to_u32(), expected);
            assert_eq!(NbdCommand::from_u32(expected), Some(cmd));
        }
        assert_eq!(NbdCommand::from_u32(5), None);
    }

    #[test]
    fn payload_direction() {
        assert!(NbdCommand::Write.has_request_payload());
        assert!(!NbdCommand::Read.has_request_payload());
        assert!(NbdCommand::Read.has_reply_payload());
        for cmd in [NbdCommand::Flush, NbdCommand::Trim, NbdCommand::Disconnect] {
            assert!(!cmd.has_request_payload());
            assert!(!cmd.has_reply_payload());
        }
    }
}
