//! Core types for nbdlink.

use bytes::{Bytes, BytesMut};
use nbd::{NBD_FLAG_HAS_FLAGS, NBD_FLAG_READ_ONLY, NBD_MAX_PAYLOAD_SIZE, NbdCommand};

use crate::error::{OpError, SessionError};

/// Default block size in bytes.
pub const DEFAULT_BLOCK_SIZE: u32 = 4096;

/// Default disk size in bytes (1 GiB).
pub const DEFAULT_DISK_SIZE: u64 = 1024 * 1024 * 1024;

const _: () = {
    assert!(DEFAULT_BLOCK_SIZE.is_power_of_two());
    assert!(DEFAULT_DISK_SIZE % DEFAULT_BLOCK_SIZE as u64 == 0);
};

/// Disk geometry a session is attached with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceGeometry {
    pub block_size: u32,
    pub disk_size: u64,
    /// Transmission flags (`NBD_FLAG_*`).
    pub flags: u16,
}

impl Default for DeviceGeometry {
    fn default() -> Self {
        Self::new(DEFAULT_BLOCK_SIZE, DEFAULT_DISK_SIZE)
    }
}

impl DeviceGeometry {
    pub fn new(block_size: u32, disk_size: u64) -> Self {
        Self {
            block_size,
            disk_size,
            flags: NBD_FLAG_HAS_FLAGS,
        }
    }

    pub fn with_read_only(mut self, read_only: bool) -> Self {
        if read_only {
            self.flags |= NBD_FLAG_READ_ONLY;
        } else {
            self.flags &= !NBD_FLAG_READ_ONLY;
        }
        self
    }

    pub fn is_read_only(&self) -> bool {
        (self.flags & NBD_FLAG_READ_ONLY) != 0
    }

    /// Number of whole blocks on the disk; zero if no block size is set.
    pub fn block_count(&self) -> u64 {
        if self.block_size == 0 {
            0
        } else {
            self.disk_size / self.block_size as u64
        }
    }

    pub fn validate(&self) -> Result<(), SessionError> {
        if self.block_size == 0 {
            return Err(SessionError::InvalidGeometry {
                reason: "block size must be > 0",
            });
        }
        if !self.block_size.is_power_of_two() {
            return Err(SessionError::InvalidGeometry {
                reason: "block size must be a power of two",
            });
        }
        if self.disk_size == 0 {
            return Err(SessionError::InvalidGeometry {
                reason: "disk size must be > 0",
            });
        }
        Ok(())
    }

    /// Check a request against this geometry before it goes on the wire.
    pub fn check(&self, request: &BlockRequest) -> Result<(), OpError> {
        let length = request.byte_len();
        let command = request.command();

        if matches!(command, NbdCommand::Read | NbdCommand::Write)
            && length > NBD_MAX_PAYLOAD_SIZE as u64
        {
            return Err(OpError::RequestTooLarge {
                length_bytes: length,
                max_bytes: NBD_MAX_PAYLOAD_SIZE,
            });
        }
        if self.is_read_only() && matches!(command, NbdCommand::Write | NbdCommand::Trim) {
            return Err(OpError::ReadOnly);
        }
        if matches!(
            command,
            NbdCommand::Read | NbdCommand::Write | NbdCommand::Trim
        ) {
            let offset = request.offset();
            let end = offset.checked_add(length);
            if end.is_none_or(|end| end > self.disk_size) {
                return Err(OpError::OutOfRange {
                    offset,
                    length,
                    disk_size: self.disk_size,
                });
            }
        }
        Ok(())
    }
}

/// A block I/O operation submitted to a session.
///
/// Buffers are owned by the request while it is in flight. A read's
/// destination buffer is filled in place and handed back through
/// [`Completion::Data`].
#[derive(Debug)]
pub enum BlockRequest {
    Read { offset: u64, buf: BytesMut },
    Write { offset: u64, data: Bytes },
    Disconnect,
    Flush,
    Trim { offset: u64, length: u32 },
}

impl BlockRequest {
    /// Read `length` bytes into a freshly allocated buffer.
    pub fn read(offset: u64, length: u32) -> Self {
        let mut buf = BytesMut::with_capacity(length as usize);
        buf.resize(length as usize, 0);
        Self::Read { offset, buf }
    }

    /// Read `buf.len()` bytes into a caller-provided buffer.
    pub fn read_into(offset: u64, buf: BytesMut) -> Self {
        Self::Read { offset, buf }
    }

    pub fn write(offset: u64, data: impl Into<Bytes>) -> Self {
        Self::Write {
            offset,
            data: data.into(),
        }
    }

    pub fn trim(offset: u64, length: u32) -> Self {
        Self::Trim { offset, length }
    }

    pub fn command(&self) -> NbdCommand {
        match self {
            Self::Read { .. } => NbdCommand::Read,
            Self::Write { .. } => NbdCommand::Write,
            Self::Disconnect => NbdCommand::Disconnect,
            Self::Flush => NbdCommand::Flush,
            Self::Trim { .. } => NbdCommand::Trim,
        }
    }

    pub fn offset(&self) -> u64 {
        match self {
            Self::Read { offset, .. } | Self::Write { offset, .. } | Self::Trim { offset, .. } => {
                *offset
            }
            Self::Disconnect | Self::Flush => 0,
        }
    }

    /// Length in bytes, before narrowing to the wire's 32-bit field.
    pub fn byte_len(&self) -> u64 {
        match self {
            Self::Read { buf, .. } => buf.len() as u64,
            Self::Write { data, .. } => data.len() as u64,
            Self::Trim { length, .. } => *length as u64,
            Self::Disconnect | Self::Flush => 0,
        }
    }

    /// Wire length field. Only meaningful once [`DeviceGeometry::check`]
    /// has bounded payload sizes.
    pub fn length(&self) -> u32 {
        u32::try_from(self.byte_len()).unwrap_or(u32::MAX)
    }

    /// Payload bytes that follow the request header, if any.
    pub fn payload(&self) -> Option<&Bytes> {
        match self {
            Self::Write { data, .. } => Some(data),
            _ => None,
        }
    }
}

/// Successful outcome of an operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Completion {
    /// A read's destination buffer, filled.
    Data(BytesMut),
    /// Acknowledgement for write, flush, trim and disconnect.
    Ack,
}

impl Completion {
    pub fn into_data(self) -> Option<BytesMut> {
        match self {
            Self::Data(buf) => Some(buf),
            Self::Ack => None,
        }
    }
}

pub type OpResult = std::result::Result<Completion, OpError>;

/// Callback invoked exactly once with an operation's outcome.
pub type CompletionSink = Box<dyn FnOnce(OpResult) + Send + 'static>;
