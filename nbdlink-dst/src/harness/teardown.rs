//! Sessions torn down while operations are in flight.
//!
//! Each round starts a session against the conformance peer, lets several
//! submitters race, and then either detaches the session or kills the peer
//! at a random point. Whatever was in flight must complete exactly once,
//! normally or with `Aborted`, and the session must end empty and
//! terminated.

use std::sync::Arc;

use nbdlink::{DeviceGeometry, Session, SessionError, SessionState};
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use tokio::io::duplex;

use super::SimulationError;
use super::oracle::CompletionOracle;
use super::session::{COMPLETION_DEADLINE, Workload};
use crate::peer::{ConformancePeer, PeerOptions};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TeardownMode {
    /// The host detaches the session.
    Detach,
    /// The peer vanishes and the stream closes under the session.
    PeerClose,
}

#[derive(Debug, Default, Clone)]
pub struct TeardownStats {
    pub rounds: u64,
    pub detaches: u64,
    pub peer_closes: u64,
    pub operations: u64,
    pub succeeded: u64,
    pub aborted: u64,
}

pub struct TeardownHarness {
    rng: SmallRng,
    workload: Workload,
    stats: TeardownStats,
}

impl TeardownHarness {
    pub fn new(seed: u64, disk_size: u64) -> Self {
        Self {
            rng: SmallRng::seed_from_u64(seed),
            workload: Workload::new(DeviceGeometry::new(512, disk_size), None),
            stats: TeardownStats::default(),
        }
    }

    pub async fn run(&mut self, rounds: u64) -> Result<(), SimulationError> {
        for _ in 0..rounds {
            let mode = if self.rng.random_bool(0.5) {
                TeardownMode::Detach
            } else {
                TeardownMode::PeerClose
            };
            self.round(mode).await?;
        }
        Ok(())
    }

    /// Run a single round ending in `mode`.
    pub async fn round(&mut self, mode: TeardownMode) -> Result<(), SimulationError> {
        let yields = self.rng.random_range(0..64);
        self.round_with_yields(mode, yields).await
    }

    /// Run a single round, yielding `yields` times before tearing down.
    pub async fn round_with_yields(
        &mut self,
        mode: TeardownMode,
        yields: u32,
    ) -> Result<(), SimulationError> {
        let mut oracle = CompletionOracle::new();

        let (client, server) = duplex(self.rng.random_range(64..=16 * 1024));
        let peer = ConformancePeer::with_options(PeerOptions {
            reorder_seed: Some(self.rng.random()),
            poisoned: None,
        });
        let peer_task = tokio::spawn(async move { peer.serve(server).await });

        let session = Arc::new(Session::new());
        session
            .attach(client, self.workload.geometry())
            .await
            .map_err(SimulationError::unexpected)?;
        let run = tokio::spawn({
            let session = Arc::clone(&session);
            async move { session.run().await }
        });

        let mut submitters = Vec::new();
        for _ in 0..self.rng.random_range(1..=8) {
            let count = self.rng.random_range(1..=32);
            let mut ops = Vec::with_capacity(count);
            for _ in 0..count {
                let action = self.workload.sample(&mut self.rng);
                let (request, expectation) = self.workload.prepare(&action);
                let (_, sink) = oracle.track(expectation);
                ops.push((request, sink));
            }

            let session = Arc::clone(&session);
            submitters.push(tokio::spawn(async move {
                for (request, sink) in ops {
                    // Refusals after teardown still reach the sink.
                    let _ = session.submit_with(request, sink).await;
                }
            }));
        }

        for _ in 0..yields {
            tokio::task::yield_now().await;
        }

        match mode {
            TeardownMode::Detach => {
                session
                    .detach()
                    .await
                    .map_err(SimulationError::unexpected)?;
                self.stats.detaches += 1;
            }
            TeardownMode::PeerClose => {
                peer_task.abort();
                self.stats.peer_closes += 1;
            }
        }

        for submitter in submitters {
            submitter.await.map_err(SimulationError::unexpected)?;
        }
        let finished = tokio::time::timeout(COMPLETION_DEADLINE, run)
            .await
            .map_err(|_| SimulationError::Unexpected("reply loop did not exit".into()))?
            .map_err(SimulationError::unexpected)?;
        check_loop_exit(mode, finished)?;

        if session.state() != SessionState::Terminated {
            return Err(SimulationError::Mismatch {
                context: format!("session left in state {}", session.state()),
            });
        }
        if session.pending() != 0 {
            return Err(SimulationError::Mismatch {
                context: format!("{} operations left pending", session.pending()),
            });
        }

        let summary = oracle.verify(true)?;
        self.stats.rounds += 1;
        self.stats.operations += summary.tracked;
        self.stats.succeeded += summary.succeeded;
        self.stats.aborted += summary.aborted;
        Ok(())
    }

    pub fn stats(&self) -> &TeardownStats {
        &self.stats
    }
}

/// How the reply loop may end for each teardown mode.
///
/// A detach can land before the spawned loop is first polled, in which case
/// `run` refuses to start on the terminated session. A peer close may end the
/// loop with any stream error.
fn check_loop_exit(
    mode: TeardownMode,
    finished: Result<(), SessionError>,
) -> Result<(), SimulationError> {
    match (mode, finished) {
        (TeardownMode::PeerClose, _) => Ok(()),
        (TeardownMode::Detach, Ok(()))
        | (
            TeardownMode::Detach,
            Err(SessionError::InvalidState {
                operation: "run",
                state: SessionState::Terminated,
            }),
        ) => Ok(()),
        (TeardownMode::Detach, Err(e)) => Err(SimulationError::unexpected(e)),
    }
}
