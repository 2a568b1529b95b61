//! Correlation of in-flight requests with their replies.
//!
//! Each submitted operation is parked in a [`CorrelationTable`] under a
//! session-scoped [`Handle`] until the reply carrying that handle arrives, or
//! until the session is torn down.

use std::collections::HashMap;
use std::fmt;

use bytes::BytesMut;
use nbd::{Handle, NbdCommand};
use parking_lot::Mutex;

use crate::error::OpError;
use crate::types::{BlockRequest, Completion, CompletionSink, OpResult};

/// An operation waiting for its reply.
///
/// The completion sink runs exactly once: through [`succeed`](Self::succeed)
/// or [`fail`](Self::fail), or with [`OpError::Aborted`] if the operation is
/// dropped unresolved.
pub struct PendingOperation {
    handle: Handle,
    request: BlockRequest,
    sink: Option<CompletionSink>,
}

impl PendingOperation {
    /// Wrap a request and its sink. The handle is assigned on registration.
    pub fn new(request: BlockRequest, sink: CompletionSink) -> Self {
        Self {
            handle: Handle::default(),
            request,
            sink: Some(sink),
        }
    }

    pub fn handle(&self) -> Handle {
        self.handle
    }

    pub fn request(&self) -> &BlockRequest {
        &self.request
    }

    pub fn command(&self) -> NbdCommand {
        self.request.command()
    }

    /// Destination buffer of a read, for the reply payload.
    pub fn read_buffer(&mut self) -> Option<&mut BytesMut> {
        match &mut self.request {
            BlockRequest::Read { buf, .. } => Some(buf),
            _ => None,
        }
    }

    /// Complete successfully. Reads hand back their filled buffer.
    pub fn succeed(mut self) {
        let completion = match &mut self.request {
            BlockRequest::Read { buf, .. } => Completion::Data(std::mem::take(buf)),
            _ => Completion::Ack,
        };
        self.finish(Ok(completion));
    }

    pub fn fail(mut self, err: OpError) {
        self.finish(Err(err));
    }

    fn finish(&mut self, result: OpResult) {
        if let Some(sink) = self.sink.take() {
            sink(result);
        }
    }
}

impl Drop for PendingOperation {
    fn drop(&mut self) {
        self.finish(Err(OpError::Aborted));
    }
}

impl fmt::Debug for PendingOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PendingOperation")
            .field("handle", &self.handle)
            .field("command", &self.request.command())
            .field("offset", &self.request.offset())
            .field("length", &self.request.byte_len())
            .field("completed", &self.sink.is_none())
            .finish()
    }
}

struct TableState {
    next: u64,
    pending: HashMap<Handle, PendingOperation>,
    closed: bool,
}

impl TableState {
    /// Next counter value not held by a pending operation.
    fn allocate(&mut self) -> Handle {
        loop {
            let handle = Handle(self.next);
            self.next = self.next.wrapping_add(1);
            if !self.pending.contains_key(&handle) {
                return handle;
            }
        }
    }
}

/// Map from in-flight handle to pending operation.
///
/// A single lock guards every method. Completion sinks are never run while
/// it is held: operations leave the table first and complete afterwards.
pub struct CorrelationTable {
    state: Mutex<TableState>,
}

impl Default for CorrelationTable {
    fn default() -> Self {
        Self::new()
    }
}

impl CorrelationTable {
    pub fn new() -> Self {
        Self::starting_at(0)
    }

    /// Start the handle counter at `next`.
    pub fn starting_at(next: u64) -> Self {
        Self {
            state: Mutex::new(TableState {
                next,
                pending: HashMap::new(),
                closed: false,
            }),
        }
    }

    /// Park an operation under a fresh handle.
    ///
    /// Fails once the table has been drained, handing the operation back so
    /// the caller can complete it outside the lock.
    pub fn register(&self, mut op: PendingOperation) -> Result<Handle, PendingOperation> {
        let mut state = self.state.lock();
        if state.closed {
            return Err(op);
        }
        let handle = state.allocate();
        op.handle = handle;
        state.pending.insert(handle, op);
        Ok(handle)
    }

    /// Allocate a handle for a request that expects no reply.
    pub fn next_handle(&self) -> Handle {
        self.state.lock().allocate()
    }

    /// Remove and return the operation parked under `handle`.
    pub fn resolve(&self, handle: Handle) -> Option<PendingOperation> {
        self.state.lock().pending.remove(&handle)
    }

    /// Remove every pending operation and close the table to new ones.
    pub fn drain_all(&self) -> Vec<PendingOperation> {
        let mut state = self.state.lock();
        state.closed = true;
        state.pending.drain().map(|(_, op)| op).collect()
    }

    pub fn len(&self) -> usize {
        self.state.lock().pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state.lock().pending.is_empty()
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    pub fn contains(&self, handle: Handle) -> bool {
        self.state.lock().pending.contains_key(&handle)
    }
}
