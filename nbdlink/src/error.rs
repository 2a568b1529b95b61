//! Error types for nbdlink.

use std::io;
use thiserror::Error;

// Re-export the frame-level errors from the nbd crate
pub use nbd::{NbdError, ProtocolError, TransportError};

use crate::session::SessionState;

pub type Result<T> = std::result::Result<T, Error>;

/// Top-level error type.
#[derive(Debug, Error)]
pub enum Error {
    #[error("session error: {0}")]
    Session(#[from] SessionError),

    #[error("registry error: {0}")]
    Registry(#[from] RegistryError),

    #[error("nbd protocol error: {0}")]
    Nbd(#[from] NbdError),

    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

/// Outcome delivered to a single operation's completion sink.
///
/// None of these are session-fatal on their own.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum OpError {
    #[error("server reported error code {code}")]
    Server { code: u32 },

    #[error("operation aborted by session teardown")]
    Aborted,

    #[error("range out of bounds: offset {offset} + length {length} exceeds disk size {disk_size}")]
    OutOfRange {
        offset: u64,
        length: u64,
        disk_size: u64,
    },

    #[error("device is read-only")]
    ReadOnly,

    #[error("request too large: {length_bytes} bytes (max: {max_bytes})")]
    RequestTooLarge { length_bytes: u64, max_bytes: u32 },
}

/// Session-level errors.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("{operation} not allowed while session is {state}")]
    InvalidState {
        operation: &'static str,
        state: SessionState,
    },

    #[error("invalid geometry: {reason}")]
    InvalidGeometry { reason: &'static str },

    #[error("disconnect already sent")]
    Disconnected,

    #[error("operation failed: {0}")]
    Op(#[from] OpError),

    #[error("{0}")]
    Nbd(#[from] NbdError),
}

impl From<TransportError> for SessionError {
    fn from(err: TransportError) -> Self {
        Self::Nbd(NbdError::Transport(err))
    }
}

impl From<ProtocolError> for SessionError {
    fn from(err: ProtocolError) -> Self {
        Self::Nbd(NbdError::Protocol(err))
    }
}

/// Device registry errors.
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("no such device: unit {unit} (registry has {count} devices)")]
    NoSuchDevice { unit: usize, count: usize },

    #[error("device {unit} is busy")]
    Busy { unit: usize },

    #[error("device {unit} has no attached session")]
    NotAttached { unit: usize },

    #[error("session error: {0}")]
    Session(#[from] SessionError),
}

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    ReadError(io::Error),

    #[error("failed to parse config: {0}")]
    ParseError(String),

    #[error("invalid configuration: {field}: {reason}")]
    InvalidValue {
        field: &'static str,
        reason: &'static str,
    },
}
