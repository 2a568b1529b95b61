//! NBD (Network Block Device) oldstyle transmission protocol.
//!
//! This crate provides the fixed-size legacy request/reply frames and the
//! stream helpers that move them whole. Negotiation and structured replies
//! are not covered.
//!
//! Based on https://github.com/NetworkBlockDevice/nbd/blob/master/doc/proto.md

mod protocol;
pub mod transport;

pub use protocol::*;
