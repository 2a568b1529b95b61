//! NBD transmission session.
//!
//! A [`Session`] owns one duplex stream. Any number of tasks may
//! [`submit`](Session::submit) operations concurrently; each request frame is
//! written whole under a single send lock and the call returns without
//! waiting for the reply. Exactly one task drives [`run`](Session::run),
//! which reads reply frames, matches them to pending operations through the
//! [`CorrelationTable`] and completes them.
//!
//! # States
//!
//! ```text
//! Idle --attach--> Attached --run--> Running --(fatal error | detach)--> Terminated
//!                     |                                                      ^
//!                     +-------------------------detach-----------------------+
//! ```
//!
//! Leaving for `Terminated` drains the table and completes every pending
//! operation with [`OpError::Aborted`].

use std::fmt;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use bytes::BytesMut;
use nbd::transport;
use nbd::{NbdCommand, NbdError, NbdReply, NbdRequest, ProtocolError};
use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncWrite, ReadHalf, WriteHalf};
use tokio::sync::{oneshot, watch};
use tracing::{debug, error, info, warn};

use crate::correlation::{CorrelationTable, PendingOperation};
use crate::error::{OpError, SessionError};
use crate::types::{BlockRequest, Completion, CompletionSink, DeviceGeometry, OpResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// No stream attached.
    Idle,
    /// Stream attached, reply loop not started.
    Attached,
    /// Reply loop active.
    Running,
    /// Loop exited, stream released, table drained.
    Terminated,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Idle => "idle",
            Self::Attached => "attached",
            Self::Running => "running",
            Self::Terminated => "terminated",
        };
        f.write_str(name)
    }
}

/// Receiver side of [`Session::submit`].
#[derive(Debug)]
pub struct PendingReply {
    rx: oneshot::Receiver<OpResult>,
}

impl PendingReply {
    /// Wait for the operation to complete.
    pub async fn wait(self) -> OpResult {
        self.rx.await.unwrap_or(Err(OpError::Aborted))
    }
}

/// Client side of one NBD transmission stream.
pub struct Session<S> {
    state: Mutex<SessionState>,
    geometry: Mutex<DeviceGeometry>,
    table: CorrelationTable,
    /// Taken by `run` for the session's lifetime.
    reader: Mutex<Option<ReadHalf<S>>>,
    /// The send lock. Held for the duration of one whole frame.
    writer: tokio::sync::Mutex<Option<WriteHalf<S>>>,
    shutdown: watch::Sender<bool>,
    /// True while a `run` call owns the read half.
    loop_active: watch::Sender<bool>,
    disconnect_sent: AtomicBool,
    read_timeout: Option<Duration>,
}

impl<S> Default for Session<S> {
    fn default() -> Self {
        Self::new()
    }
}

impl<S> Session<S> {
    pub fn new() -> Self {
        let (shutdown, _) = watch::channel(false);
        let (loop_active, _) = watch::channel(false);
        Self {
            state: Mutex::new(SessionState::Idle),
            geometry: Mutex::new(DeviceGeometry::default()),
            table: CorrelationTable::new(),
            reader: Mutex::new(None),
            writer: tokio::sync::Mutex::new(None),
            shutdown,
            loop_active,
            disconnect_sent: AtomicBool::new(false),
            read_timeout: None,
        }
    }

    /// Bound how long the reply loop waits for a reply while operations are
    /// outstanding. Expiry is a fatal I/O error.
    pub fn with_read_timeout(mut self, read_timeout: Option<Duration>) -> Self {
        self.read_timeout = read_timeout;
        self
    }

    pub fn state(&self) -> SessionState {
        *self.state.lock()
    }

    pub fn geometry(&self) -> DeviceGeometry {
        *self.geometry.lock()
    }

    /// Change the block size used from now on. Disk size and flags are kept.
    pub fn set_block_size(&self, block_size: u32) -> Result<(), SessionError> {
        let mut geometry = self.geometry.lock();
        let updated = DeviceGeometry {
            block_size,
            ..*geometry
        };
        updated.validate()?;
        *geometry = updated;
        Ok(())
    }

    /// Number of operations awaiting a reply.
    pub fn pending(&self) -> usize {
        self.table.len()
    }

    pub fn is_terminated(&self) -> bool {
        self.state() == SessionState::Terminated
    }
}

impl<S> Session<S>
where
    S: AsyncRead + AsyncWrite,
{
    /// Bind a stream and geometry. Valid only from `Idle`.
    pub async fn attach(&self, stream: S, geometry: DeviceGeometry) -> Result<(), SessionError> {
        geometry.validate()?;

        let mut writer = self.writer.lock().await;
        let mut state = self.state.lock();
        if *state != SessionState::Idle {
            return Err(SessionError::InvalidState {
                operation: "attach",
                state: *state,
            });
        }

        let (read_half, write_half) = tokio::io::split(stream);
        *self.reader.lock() = Some(read_half);
        *writer = Some(write_half);
        *self.geometry.lock() = geometry;
        *state = SessionState::Attached;

        info!(
            block_size = geometry.block_size,
            disk_size = geometry.disk_size,
            flags = geometry.flags,
            "session attached"
        );
        Ok(())
    }

    /// Submit an operation and get a handle to await its outcome.
    pub async fn submit(&self, request: BlockRequest) -> Result<PendingReply, SessionError> {
        let (tx, rx) = oneshot::channel();
        self.submit_with(
            request,
            Box::new(move |result| {
                let _ = tx.send(result);
            }),
        )
        .await?;
        Ok(PendingReply { rx })
    }

    /// Submit an operation and wait for it to complete.
    pub async fn execute(&self, request: BlockRequest) -> Result<Completion, SessionError> {
        Ok(self.submit(request).await?.wait().await?)
    }

    /// Submit an operation whose outcome is delivered to `sink`.
    ///
    /// `sink` runs exactly once, whatever happens. It runs on the task
    /// driving [`run`](Self::run), or on the task that tears the session
    /// down, or synchronously here if the request is rejected.
    ///
    /// Returns once the request frame is fully written. A write failure
    /// terminates the session.
    pub async fn submit_with(
        &self,
        request: BlockRequest,
        sink: CompletionSink,
    ) -> Result<(), SessionError> {
        let op = PendingOperation::new(request, sink);

        let state = self.state();
        if !matches!(state, SessionState::Attached | SessionState::Running) {
            op.fail(OpError::Aborted);
            return Err(SessionError::InvalidState {
                operation: "submit",
                state,
            });
        }
        if self.disconnect_sent.load(Ordering::Acquire) {
            op.fail(OpError::Aborted);
            return Err(SessionError::Disconnected);
        }
        if let Err(e) = self.geometry().check(op.request()) {
            debug!(error = %e, "request rejected");
            op.fail(e.clone());
            return Err(e.into());
        }
        if op.command() == NbdCommand::Disconnect {
            return self.send_disconnect(op).await;
        }

        let command = op.command();
        let offset = op.request().offset();
        let length = op.request().length();
        let payload = op.request().payload().cloned();

        let handle = match self.table.register(op) {
            Ok(handle) => handle,
            Err(op) => {
                op.fail(OpError::Aborted);
                return Err(SessionError::InvalidState {
                    operation: "submit",
                    state: SessionState::Terminated,
                });
            }
        };
        debug!(%handle, %command, offset, length, "submit");

        let frame = NbdRequest {
            command,
            handle,
            offset,
            length,
        };
        if let Err(e) = self.send(&frame, payload.as_deref().unwrap_or(&[])).await {
            if !matches!(e, SessionError::InvalidState { .. }) {
                error!(%handle, %command, error = %e, "request write failed");
            }
            // The frame may be half-written; the stream cannot be trusted.
            self.teardown().await;
            return Err(e);
        }
        Ok(())
    }

    async fn send_disconnect(&self, op: PendingOperation) -> Result<(), SessionError> {
        if self.disconnect_sent.swap(true, Ordering::AcqRel) {
            op.fail(OpError::Aborted);
            return Err(SessionError::Disconnected);
        }

        let handle = self.table.next_handle();
        match self.send(&NbdRequest::disconnect(handle), &[]).await {
            Ok(()) => {
                info!(%handle, pending = self.table.len(), "disconnect sent");
                op.succeed();
                Ok(())
            }
            Err(e) => {
                op.fail(OpError::Aborted);
                self.teardown().await;
                Err(e)
            }
        }
    }

    /// Write one whole frame under the send lock.
    async fn send(&self, frame: &NbdRequest, payload: &[u8]) -> Result<(), SessionError> {
        let mut shutdown = self.shutdown.subscribe();
        let mut guard = FrameGuard {
            session: self,
            writer: self.writer.lock().await,
            armed: false,
        };
        let Some(stream) = guard.writer.as_mut() else {
            return Err(SessionError::InvalidState {
                operation: "submit",
                state: self.state(),
            });
        };

        guard.armed = true;
        let result = tokio::select! {
            biased;
            _ = stopped(&mut shutdown) => Err(SessionError::InvalidState {
                operation: "submit",
                state: SessionState::Terminated,
            }),
            result = transport::write_request(stream, frame, payload) => {
                result.map_err(SessionError::from)
            }
        };
        guard.armed = false;
        result
    }

    /// Drive the reply loop until the session ends.
    ///
    /// Valid only from `Attached`, so at most one caller ever owns the read
    /// side. Returns `Ok` when the session was detached, or when the peer
    /// closed the stream after a disconnect. Either way the session is
    /// `Terminated` on return.
    pub async fn run(&self) -> Result<(), SessionError> {
        let mut reader = {
            let mut state = self.state.lock();
            if *state != SessionState::Attached {
                return Err(SessionError::InvalidState {
                    operation: "run",
                    state: *state,
                });
            }
            let Some(reader) = self.reader.lock().take() else {
                return Err(SessionError::InvalidState {
                    operation: "run",
                    state: *state,
                });
            };
            *state = SessionState::Running;
            self.loop_active.send_replace(true);
            reader
        };
        let _active = LoopActive(&self.loop_active);
        info!("session running");

        let mut shutdown = self.shutdown.subscribe();
        let result = tokio::select! {
            biased;
            _ = stopped(&mut shutdown) => Ok(()),
            result = self.receive_loop(&mut reader) => result,
        };
        drop(reader);

        let result = match result {
            Err(SessionError::Nbd(e))
                if e.is_closed() && self.disconnect_sent.load(Ordering::Acquire) =>
            {
                Ok(())
            }
            other => other,
        };
        match &result {
            Ok(()) => info!("session loop finished"),
            Err(e) => error!(error = %e, "session loop failed"),
        }

        self.teardown().await;
        result
    }

    async fn receive_loop(&self, reader: &mut ReadHalf<S>) -> Result<(), SessionError> {
        loop {
            let reply = self.read_reply(reader).await?;
            let Some(mut op) = self.table.resolve(reply.handle) else {
                if self.table.is_closed() {
                    // Teardown drained it first; the shutdown signal is set.
                    return Ok(());
                }
                return Err(ProtocolError::UnknownHandle {
                    handle: reply.handle,
                }
                .into());
            };

            if !reply.is_ok() {
                warn!(
                    handle = %reply.handle,
                    command = %op.command(),
                    code = reply.error,
                    "server reported error"
                );
                op.fail(OpError::Server { code: reply.error });
                continue;
            }

            if let Some(buf) = op.read_buffer() {
                // On failure `op` is dropped here, which aborts it.
                self.read_payload(reader, buf).await?;
            }
            debug!(handle = %reply.handle, command = %op.command(), "complete");
            op.succeed();
        }
    }

    async fn read_reply(&self, reader: &mut ReadHalf<S>) -> Result<NbdReply, NbdError> {
        let Some(deadline) = self.read_timeout else {
            return transport::read_reply(reader).await;
        };
        loop {
            match tokio::time::timeout(deadline, transport::read_reply(reader)).await {
                Ok(result) => return result,
                // Nothing outstanding, so nothing is late.
                Err(_) if self.table.is_empty() => continue,
                Err(_) => return Err(deadline_expired()),
            }
        }
    }

    async fn read_payload(
        &self,
        reader: &mut ReadHalf<S>,
        buf: &mut BytesMut,
    ) -> Result<(), NbdError> {
        match self.read_timeout {
            None => Ok(transport::read_exact(reader, buf).await?),
            Some(deadline) => tokio::time::timeout(deadline, transport::read_exact(reader, buf))
                .await
                .map_err(|_| deadline_expired())?
                .map_err(NbdError::from),
        }
    }

    /// Terminate the session from any non-idle state.
    ///
    /// Every pending operation is completed with [`OpError::Aborted`] and a
    /// running reply loop has released the stream before this returns.
    pub async fn detach(&self) -> Result<(), SessionError> {
        let state = self.state();
        if state == SessionState::Idle {
            return Err(SessionError::InvalidState {
                operation: "detach",
                state,
            });
        }
        self.teardown().await;

        let mut active = self.loop_active.subscribe();
        let _ = active.wait_for(|active| !*active).await;
        Ok(())
    }

    async fn teardown(&self) {
        self.terminate();
        self.writer.lock().await.take();
    }
}

impl<S> Session<S> {
    /// Drain, signal shutdown and abort everything pending. The read half is
    /// dropped here unless a reply loop holds it; the write half is dropped
    /// by whoever holds the send lock next.
    fn terminate(&self) {
        let drained = self.table.drain_all();
        self.shutdown.send_replace(true);
        self.reader.lock().take();

        let previous = std::mem::replace(&mut *self.state.lock(), SessionState::Terminated);
        if previous != SessionState::Terminated {
            info!(from = %previous, pending = drained.len(), "session terminated");
        }
        if !drained.is_empty() {
            warn!(count = drained.len(), "aborting pending operations");
        }
        for op in drained {
            op.fail(OpError::Aborted);
        }
    }
}

/// Terminates the session if a submit is cancelled while its frame is only
/// partly on the wire.
struct FrameGuard<'a, S> {
    session: &'a Session<S>,
    writer: tokio::sync::MutexGuard<'a, Option<WriteHalf<S>>>,
    armed: bool,
}

impl<S> Drop for FrameGuard<'_, S> {
    fn drop(&mut self) {
        if self.armed {
            warn!("request write abandoned mid-frame");
            self.writer.take();
            self.session.terminate();
        }
    }
}

/// Clears the loop-active flag when `run` returns or is dropped.
struct LoopActive<'a>(&'a watch::Sender<bool>);

impl Drop for LoopActive<'_> {
    fn drop(&mut self) {
        self.0.send_replace(false);
    }
}

async fn stopped(shutdown: &mut watch::Receiver<bool>) {
    let _ = shutdown.wait_for(|stop| *stop).await;
}

fn deadline_expired() -> NbdError {
    NbdError::from(io::Error::new(
        io::ErrorKind::TimedOut,
        "reply read deadline expired",
    ))
}
