//! nbdlink: client side of an NBD oldstyle transmission stream.
//!
//! A [`Session`] multiplexes block operations from any number of tasks over
//! one stream. Requests go out whole under a send lock; a single reply loop
//! matches replies to requests by handle and completes each operation exactly
//! once, even when the stream dies underneath it.
//!
//! # Library Usage
//!
//! ```ignore
//! use std::sync::Arc;
//! use nbdlink::{BlockRequest, DeviceGeometry, Session};
//!
//! let session = Arc::new(Session::new());
//! session.attach(stream, DeviceGeometry::default()).await?;
//! tokio::spawn({
//!     let session = Arc::clone(&session);
//!     async move { session.run().await }
//! });
//!
//! let block = session.execute(BlockRequest::read(0, 4096)).await?;
//! ```
//!
//! [`DeviceRegistry`] keeps a fixed set of numbered device slots for callers
//! that manage several streams.

pub mod config;
pub mod correlation;
pub mod error;
pub mod registry;
pub mod session;
pub mod types;

pub use config::{Config, DeviceConfig, PeerConfig, RegistryConfig};
pub use correlation::{CorrelationTable, PendingOperation};
pub use error::{
    ConfigError, Error, NbdError, OpError, ProtocolError, RegistryError, Result, SessionError,
    TransportError,
};
pub use registry::{DEFAULT_DEVICE_COUNT, DeviceRegistry};
pub use session::{PendingReply, Session, SessionState};
pub use types::{
    BlockRequest, Completion, CompletionSink, DEFAULT_BLOCK_SIZE, DEFAULT_DISK_SIZE,
    DeviceGeometry, OpResult,
};

pub use nbd;
