//! Deterministic Simulation Testing (DST) for nbdlink.
//!
//! This crate provides testing utilities that are intentionally separate from
//! the main nbdlink crate so the reference peer is never compiled into
//! production binaries.
//!
//! ## Crate Structure
//!
//! - `peer` - Conformance peer: zero-filled reads, discarded writes
//! - `harness` - Simulation harnesses and the completion oracle
//! - `simulation` - Runtime and simulation runners
//!
//! ## Running DST Tests
//!
//! ```bash
//! # PR-level quick tests
//! cargo test -p nbdlink-dst simulation
//!
//! # Nightly long-running tests
//! cargo test -p nbdlink-dst simulation -- --ignored
//!
//! # Replay a failure
//! DST_SEED=<seed> cargo test -p nbdlink-dst simulation
//! ```

pub mod harness;
pub mod peer;
pub mod simulation;

pub use harness::{
    CompletionOracle, Expectation, OracleSummary, SessionAction, SessionHarness, SessionStats,
    SimulationError, TeardownHarness, TeardownMode, TeardownStats, Workload,
};
pub use peer::{ConformancePeer, PeerOptions, PeerStats};
pub use simulation::{build_runtime, get_seed, run_session_simulation, run_teardown_simulation};
