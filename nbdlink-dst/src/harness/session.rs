//! Concurrent workload through a session against the conformance peer.

use std::ops::Range;
use std::sync::Arc;
use std::time::Duration;

use bytes::BytesMut;
use nbd::NBD_EIO;
use nbdlink::{BlockRequest, DeviceGeometry, OpError, Session, SessionError};
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use tokio::io::{DuplexStream, duplex};

use super::SimulationError;
use super::oracle::{CompletionOracle, Expectation};
use crate::peer::{ConformancePeer, PeerOptions, PeerStats};

/// How long a batch may take to complete before the run is declared stuck.
pub(crate) const COMPLETION_DEADLINE: Duration = Duration::from_secs(10);

/// Actions that can be performed in a session simulation.
#[derive(Debug, Clone)]
pub enum SessionAction {
    Read { offset: u64, length: u32 },
    Write { offset: u64, length: u32, fill: u8 },
    Trim { offset: u64, length: u32 },
    Flush,
    /// A read that runs past the end of the disk.
    OutOfRange { offset: u64, length: u32 },
}

/// Generates actions for a disk and knows what each should produce.
#[derive(Debug, Clone)]
pub struct Workload {
    geometry: DeviceGeometry,
    poisoned: Option<Range<u64>>,
}

impl Workload {
    pub fn new(geometry: DeviceGeometry, poisoned: Option<Range<u64>>) -> Self {
        Self { geometry, poisoned }
    }

    pub fn geometry(&self) -> DeviceGeometry {
        self.geometry
    }

    pub fn sample(&self, rng: &mut SmallRng) -> SessionAction {
        let disk_size = self.geometry.disk_size;

        match rng.random_range(0..100) {
            0..40 => {
                let (offset, length) = sample_range(rng, disk_size, 32 * 1024);
                SessionAction::Read { offset, length }
            }
            40..75 => {
                let (offset, length) = sample_range(rng, disk_size, 32 * 1024);
                SessionAction::Write {
                    offset,
                    length,
                    fill: rng.random_range(1..=u8::MAX),
                }
            }
            75..85 => {
                let (offset, length) = sample_range(rng, disk_size, 64 * 1024);
                SessionAction::Trim { offset, length }
            }
            85..95 => SessionAction::Flush,
            _ => {
                let length = rng.random_range(1..=4096u32);
                let overshoot = rng.random_range(1..=4096u64);
                SessionAction::OutOfRange {
                    offset: disk_size.saturating_sub(length as u64) + overshoot,
                    length,
                }
            }
        }
    }

    fn touches_poison(&self, offset: u64, length: u32) -> bool {
        self.poisoned.as_ref().is_some_and(|poisoned| {
            offset < poisoned.end && poisoned.start < offset + length as u64
        })
    }

    fn ranged(&self, offset: u64, length: u32, success: Expectation) -> Expectation {
        if self.touches_poison(offset, length) {
            Expectation::Server { code: NBD_EIO }
        } else {
            success
        }
    }

    /// Build the request for `action` and its expected outcome.
    pub fn prepare(&self, action: &SessionAction) -> (BlockRequest, Expectation) {
        match *action {
            SessionAction::Read { offset, length } => {
                // Pre-dirty the buffer so a missing fill shows up.
                let buf = BytesMut::from(vec![0xEE; length as usize].as_slice());
                let expectation = self.ranged(
                    offset,
                    length,
                    Expectation::Zeroed {
                        length: length as usize,
                    },
                );
                (BlockRequest::read_into(offset, buf), expectation)
            }
            SessionAction::Write {
                offset,
                length,
                fill,
            } => (
                BlockRequest::write(offset, vec![fill; length as usize]),
                self.ranged(offset, length, Expectation::Ack),
            ),
            SessionAction::Trim { offset, length } => (
                BlockRequest::trim(offset, length),
                self.ranged(offset, length, Expectation::Ack),
            ),
            SessionAction::Flush => (BlockRequest::Flush, Expectation::Ack),
            SessionAction::OutOfRange { offset, length } => (
                BlockRequest::read(offset, length),
                Expectation::Rejected(OpError::OutOfRange {
                    offset,
                    length: length as u64,
                    disk_size: self.geometry.disk_size,
                }),
            ),
        }
    }
}

fn sample_range(rng: &mut SmallRng, disk_size: u64, max_len: u64) -> (u64, u32) {
    let length = rng.random_range(1..=max_len.min(disk_size));
    let offset = rng.random_range(0..=disk_size - length);
    (offset, length as u32)
}

/// Simulation statistics.
#[derive(Debug, Default, Clone)]
pub struct SessionStats {
    pub operations: u64,
    pub batches: u64,
    pub reads: u64,
    pub writes: u64,
    pub trims: u64,
    pub flushes: u64,
    pub rejected: u64,
    pub server_errors: u64,
}

/// Runs random batches of concurrent submissions through one session and
/// checks every completion against the oracle.
pub struct SessionHarness {
    rng: SmallRng,
    workload: Workload,
    oracle: CompletionOracle,
    stats: SessionStats,
}

impl SessionHarness {
    pub fn new(seed: u64, disk_size: u64) -> Self {
        let geometry = DeviceGeometry::new(512, disk_size);
        // The last eighth of the disk fails with EIO.
        let poisoned = disk_size - disk_size / 8..disk_size;
        Self {
            rng: SmallRng::seed_from_u64(seed),
            workload: Workload::new(geometry, Some(poisoned)),
            oracle: CompletionOracle::new(),
            stats: SessionStats::default(),
        }
    }

    /// Run `operations` operations, then disconnect.
    pub async fn run(&mut self, operations: u64) -> Result<PeerStats, SimulationError> {
        // A small pipe forces partial transfers on both sides.
        let (client, server) = duplex(self.rng.random_range(64..=64 * 1024));
        let peer = ConformancePeer::with_options(PeerOptions {
            reorder_seed: Some(self.rng.random()),
            poisoned: self.workload.poisoned.clone(),
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

        let mut remaining = operations;
        while remaining > 0 {
            let batch = self.rng.random_range(1..=16u64).min(remaining);
            remaining -= batch;
            self.run_batch(&session, batch).await?;
        }

        session
            .execute(BlockRequest::Disconnect)
            .await
            .map_err(SimulationError::unexpected)?;
        tokio::time::timeout(COMPLETION_DEADLINE, run)
            .await
            .map_err(|_| SimulationError::Unexpected("reply loop did not exit".into()))?
            .map_err(SimulationError::unexpected)?
            .map_err(SimulationError::unexpected)?;

        let peer_stats = peer_task
            .await
            .map_err(SimulationError::unexpected)?
            .map_err(SimulationError::unexpected)?;
        if !peer_stats.disconnected {
            return Err(SimulationError::Mismatch {
                context: "peer never saw the disconnect".into(),
            });
        }
        if session.pending() != 0 {
            return Err(SimulationError::Mismatch {
                context: format!("{} operations still pending", session.pending()),
            });
        }

        let summary = self.oracle.verify(false)?;
        if summary.server_errors != self.stats.server_errors
            || summary.rejected != self.stats.rejected
        {
            return Err(SimulationError::Mismatch {
                context: format!("summary {summary:?} disagrees with {:?}", self.stats),
            });
        }
        Ok(peer_stats)
    }

    async fn run_batch(
        &mut self,
        session: &Arc<Session<DuplexStream>>,
        count: u64,
    ) -> Result<(), SimulationError> {
        let mut submitters = Vec::with_capacity(count as usize);
        for _ in 0..count {
            let action = self.workload.sample(&mut self.rng);
            let (request, expectation) = self.workload.prepare(&action);
            self.record(&action, &expectation);

            let rejected = matches!(expectation, Expectation::Rejected(_));
            let (_, sink) = self.oracle.track(expectation);
            let session = Arc::clone(session);
            let submitter =
                tokio::spawn(async move { session.submit_with(request, sink).await });
            submitters.push((submitter, rejected));
        }

        for (submitter, rejected) in submitters {
            let result = submitter.await.map_err(SimulationError::unexpected)?;
            match (result, rejected) {
                (Ok(()), false) => {}
                (Err(SessionError::Op(OpError::OutOfRange { .. })), true) => {}
                (result, _) => {
                    return Err(SimulationError::Mismatch {
                        context: format!(
                            "submit returned {result:?}, rejection expected: {rejected}"
                        ),
                    });
                }
            }
        }

        self.oracle
            .wait_for(count as usize, COMPLETION_DEADLINE)
            .await?;
        self.stats.batches += 1;
        Ok(())
    }

    fn record(&mut self, action: &SessionAction, expectation: &Expectation) {
        self.stats.operations += 1;
        match action {
            SessionAction::Read { .. } => self.stats.reads += 1,
            SessionAction::Write { .. } => self.stats.writes += 1,
            SessionAction::Trim { .. } => self.stats.trims += 1,
            SessionAction::Flush => self.stats.flushes += 1,
            SessionAction::OutOfRange { .. } => {}
        }
        match expectation {
            Expectation::Server { .. } => self.stats.server_errors += 1,
            Expectation::Rejected(_) => self.stats.rejected += 1,
            _ => {}
        }
    }

    pub fn stats(&self) -> &SessionStats {
        &self.stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn workload() -> Workload {
        Workload::new(DeviceGeometry::new(512, 1024 * 1024), Some(4096..8192))
    }

    #[test]
    fn sampled_actions_stay_in_bounds() {
        let workload = workload();
        let mut rng = SmallRng::seed_from_u64(1);
        for _ in 0..1000 {
            match workload.sample(&mut rng) {
                SessionAction::Read { offset, length }
                | SessionAction::Write { offset, length, .. }
                | SessionAction::Trim { offset, length } => {
                    assert!(length > 0);
                    assert!(offset + length as u64 <= 1024 * 1024);
                }
                SessionAction::OutOfRange { offset, length } => {
                    assert!(offset + length as u64 > 1024 * 1024);
                }
                SessionAction::Flush => {}
            }
        }
    }

    #[test]
    fn poisoned_ranges_expect_server_errors() {
        let workload = workload();
        let (_, expectation) = workload.prepare(&SessionAction::Read {
            offset: 4000,
            length: 200,
        });
        assert_eq!(expectation, Expectation::Server { code: NBD_EIO });

        let (_, expectation) = workload.prepare(&SessionAction::Write {
            offset: 8192,
            length: 16,
            fill: 1,
        });
        assert_eq!(expectation, Expectation::Ack);

        let (request, expectation) = workload.prepare(&SessionAction::Read {
            offset: 0,
            length: 64,
        });
        assert_eq!(expectation, Expectation::Zeroed { length: 64 });
        assert_eq!(request.length(), 64);
    }

    #[tokio::test]
    async fn short_run_is_clean() {
        let mut harness = SessionHarness::new(42, 256 * 1024);
        let peer_stats = harness.run(64).await.unwrap();
        let stats = harness.stats();
        assert_eq!(stats.operations, 64);
        assert_eq!(peer_stats.requests, 64 - stats.rejected + 1);
    }
}
