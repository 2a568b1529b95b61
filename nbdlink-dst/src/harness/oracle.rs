//! Completion oracle: what every submitted operation should report, and what
//! it actually did.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use nbdlink::{Completion, CompletionSink, OpError, OpResult};
use parking_lot::Mutex;
use tokio::sync::mpsc;

use super::SimulationError;

/// Expected outcome of one operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Expectation {
    /// A read answered with `length` zero bytes.
    Zeroed { length: usize },
    Ack,
    Server { code: u32 },
    /// Refused before reaching the wire.
    Rejected(OpError),
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct OracleSummary {
    pub tracked: u64,
    pub succeeded: u64,
    pub server_errors: u64,
    pub rejected: u64,
    pub aborted: u64,
}

pub struct CompletionOracle {
    expected: HashMap<u64, Expectation>,
    outcomes: Arc<Mutex<HashMap<u64, Vec<OpResult>>>>,
    completed_tx: mpsc::UnboundedSender<u64>,
    completed_rx: mpsc::UnboundedReceiver<u64>,
    next_id: u64,
}

impl Default for CompletionOracle {
    fn default() -> Self {
        Self::new()
    }
}

impl CompletionOracle {
    pub fn new() -> Self {
        let (completed_tx, completed_rx) = mpsc::unbounded_channel();
        Self {
            expected: HashMap::new(),
            outcomes: Arc::new(Mutex::new(HashMap::new())),
            completed_tx,
            completed_rx,
            next_id: 0,
        }
    }

    /// Register an operation and get the sink that records its outcome.
    pub fn track(&mut self, expectation: Expectation) -> (u64, CompletionSink) {
        let id = self.next_id;
        self.next_id += 1;
        self.expected.insert(id, expectation);

        let outcomes = Arc::clone(&self.outcomes);
        let completed = self.completed_tx.clone();
        let sink: CompletionSink = Box::new(move |result| {
            outcomes.lock().entry(id).or_default().push(result);
            let _ = completed.send(id);
        });
        (id, sink)
    }

    pub fn tracked(&self) -> usize {
        self.expected.len()
    }

    /// Wait for `count` more sink invocations.
    pub async fn wait_for(
        &mut self,
        count: usize,
        deadline: Duration,
    ) -> Result<(), SimulationError> {
        let completed = &mut self.completed_rx;
        let wait = async {
            let mut received = 0;
            while received < count {
                if completed.recv().await.is_none() {
                    break;
                }
                received += 1;
            }
        };
        tokio::time::timeout(deadline, wait)
            .await
            .map_err(|_| SimulationError::Stalled { waiting: count })
    }

    /// Check that every tracked operation completed exactly once with its
    /// expected outcome, or with `Aborted` when `allow_aborted` is set.
    pub fn verify(&self, allow_aborted: bool) -> Result<OracleSummary, SimulationError> {
        let outcomes = self.outcomes.lock();
        if let Some(id) = outcomes.keys().find(|id| !self.expected.contains_key(id)) {
            return Err(SimulationError::Mismatch {
                context: format!("completion for untracked operation {id}"),
            });
        }

        let mut summary = OracleSummary {
            tracked: self.expected.len() as u64,
            ..Default::default()
        };
        for id in 0..self.next_id {
            let Some(expectation) = self.expected.get(&id) else {
                continue;
            };
            let results = outcomes.get(&id).map(Vec::as_slice).unwrap_or(&[]);
            let [result] = results else {
                return Err(SimulationError::Mismatch {
                    context: format!("operation {id} completed {} times", results.len()),
                });
            };

            match (expectation, result) {
                (_, Err(OpError::Aborted)) if allow_aborted => summary.aborted += 1,
                (Expectation::Zeroed { length }, Ok(Completion::Data(buf)))
                    if buf.len() == *length && buf.iter().all(|&b| b == 0) =>
                {
                    summary.succeeded += 1
                }
                (Expectation::Ack, Ok(Completion::Ack)) => summary.succeeded += 1,
                (Expectation::Server { code }, Err(OpError::Server { code: got }))
                    if got == code =>
                {
                    summary.server_errors += 1
                }
                (Expectation::Rejected(expected), Err(got)) if got == expected => {
                    summary.rejected += 1
                }
                (expectation, result) => {
                    return Err(SimulationError::Mismatch {
                        context: format!(
                            "operation {id}: expected {expectation:?}, got {}",
                            describe(result)
                        ),
                    });
                }
            }
        }
        Ok(summary)
    }
}

fn describe(result: &OpResult) -> String {
    match result {
        Ok(Completion::Data(buf)) => {
            let nonzero = buf.iter().filter(|&&b| b != 0).count();
            format!("{} bytes of data ({nonzero} nonzero)", buf.len())
        }
        Ok(Completion::Ack) => "ack".to_string(),
        Err(e) => format!("error: {e}"),
    }
}
