//! Simulation harnesses for nbdlink.
//!
//! Harnesses provide the infrastructure for running deterministic simulations:
//! - A completion oracle that checks exactly-once delivery
//! - Action generators for random operation sequences
//! - Statistics tracking

pub mod oracle;
pub mod session;
pub mod teardown;

pub use oracle::{CompletionOracle, Expectation, OracleSummary};
pub use session::{SessionAction, SessionHarness, SessionStats, Workload};
pub use teardown::{TeardownHarness, TeardownMode, TeardownStats};

/// Error type for simulation failures.
#[derive(Debug, thiserror::Error)]
pub enum SimulationError {
    #[error("oracle mismatch: {context}")]
    Mismatch { context: String },

    #[error("timed out waiting for {waiting} completions")]
    Stalled { waiting: usize },

    #[error("unexpected error: {0}")]
    Unexpected(String),
}

impl SimulationError {
    pub(crate) fn unexpected(err: impl std::fmt::Display) -> Self {
        Self::Unexpected(err.to_string())
    }
}
