//! Simulation runners and utilities.
//!
//! Every run is driven by a single seed. Set `DST_SEED` to replay a failing
//! run's workload:
//! ```bash
//! DST_SEED=1234 cargo test -p nbdlink-dst simulation
//! ```

use tracing::info;

use crate::harness::{SessionHarness, SimulationError, TeardownHarness};

/// Build a single-threaded tokio runtime for simulation.
///
/// The seed fixes the workload and the peer's reply order; scheduling on a
/// current-thread runtime is FIFO, so a seed replays the same interleaving.
pub fn build_runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .expect("failed to build runtime")
}

/// Run a session simulation with the given seed and number of operations.
pub async fn run_session_simulation(
    seed: u64,
    disk_size: u64,
    operations: u64,
) -> Result<(), SimulationError> {
    info!(seed, disk_size, operations, "session simulation");

    let mut harness = SessionHarness::new(seed, disk_size);
    let peer_stats = harness.run(operations).await?;

    info!(stats = ?harness.stats(), peer = ?peer_stats, "session simulation complete");
    Ok(())
}

/// Run a teardown simulation with the given seed and number of rounds.
pub async fn run_teardown_simulation(
    seed: u64,
    disk_size: u64,
    rounds: u64,
) -> Result<(), SimulationError> {
    info!(seed, disk_size, rounds, "teardown simulation");

    let mut harness = TeardownHarness::new(seed, disk_size);
    harness.run(rounds).await?;

    info!(stats = ?harness.stats(), "teardown simulation complete");
    Ok(())
}

/// Get the seed from environment or generate a random one.
pub fn get_seed() -> u64 {
    std::env::var("DST_SEED")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or_else(rand::random)
}

#[cfg(test)]
mod tests {
    use super::*;

    const MIB: u64 = 1024 * 1024;

    /// Quick session simulation (PR-level).
    #[test]
    fn session_simulation() {
        let seed = get_seed();
        eprintln!("DST_SEED={}", seed);
        let runtime = build_runtime();
        runtime.block_on(async {
            run_session_simulation(seed, 4 * MIB, 500).await.unwrap();
        });
    }

    /// Quick teardown simulation (PR-level).
    #[test]
    fn teardown_simulation() {
        let seed = get_seed();
        eprintln!("DST_SEED={}", seed);
        let runtime = build_runtime();
        runtime.block_on(async {
            run_teardown_simulation(seed, 4 * MIB, 50).await.unwrap();
        });
    }

    /// Teardown races on a multi-threaded runtime, where detach and the
    /// reply loop truly run in parallel.
    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn teardown_simulation_parallel() {
        let seed = get_seed();
        eprintln!("DST_SEED={}", seed);
        run_teardown_simulation(seed, 4 * MIB, 50).await.unwrap();
    }

    /// Long-running session simulation (nightly).
    #[test]
    #[ignore]
    fn session_simulation_long() {
        let seed = get_seed();
        eprintln!("DST_SEED={}", seed);
        let runtime = build_runtime();
        runtime.block_on(async {
            run_session_simulation(seed, 64 * MIB, 50_000).await.unwrap();
        });
    }

    /// Long-running teardown simulation (nightly).
    #[test]
    #[ignore]
    fn teardown_simulation_long() {
        let seed = get_seed();
        eprintln!("DST_SEED={}", seed);
        let runtime = build_runtime();
        runtime.block_on(async {
            run_teardown_simulation(seed, 64 * MIB, 2_000).await.unwrap();
        });
    }
}
