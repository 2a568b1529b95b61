//! Reference responder for the transmission phase.
//!
//! Replies to every read with zeros and acknowledges writes once their
//! payload has been consumed. Nothing is stored. Requests are read by one
//! future and answered by another, so replies can be held back and sent in
//! shuffled batches to exercise out-of-order correlation.

use std::io;
use std::ops::Range;

use nbd::transport::{read_exact, read_request, write_reply};
use nbd::{
    NBD_EINVAL, NBD_EIO, NBD_MAX_PAYLOAD_SIZE, NBD_OK, NbdCommand, NbdError, NbdReply, NbdRequest,
};
use rand::SeedableRng;
use rand::rngs::SmallRng;
use rand::seq::SliceRandom;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tracing::{debug, info};

#[derive(Debug, Clone, Default)]
pub struct PeerOptions {
    /// Shuffle each batch of queued replies with this seed.
    pub reorder_seed: Option<u64>,
    /// Byte range whose reads, writes and trims fail with `NBD_EIO`.
    pub poisoned: Option<Range<u64>>,
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct PeerStats {
    pub requests: u64,
    pub reads: u64,
    pub writes: u64,
    pub flushes: u64,
    pub trims: u64,
    pub errors: u64,
    pub bytes_read: u64,
    pub bytes_written: u64,
    pub disconnected: bool,
}

struct QueuedReply {
    reply: NbdReply,
    payload_len: usize,
}

#[derive(Debug, Clone, Default)]
pub struct ConformancePeer {
    options: PeerOptions,
}

impl ConformancePeer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_options(options: PeerOptions) -> Self {
        Self { options }
    }

    /// Serve one connection until the client disconnects or closes it.
    ///
    /// Returns once every queued reply has been written. The stream is
    /// dropped on return, which is how a disconnect is answered.
    pub async fn serve<S>(&self, stream: S) -> Result<PeerStats, NbdError>
    where
        S: AsyncRead + AsyncWrite,
    {
        let (mut reader, mut writer) = tokio::io::split(stream);
        let (tx, rx) = mpsc::unbounded_channel();

        let (stats, ()) = tokio::try_join!(
            self.receive(&mut reader, tx),
            self.reply(&mut writer, rx)
        )?;
        info!(
            requests = stats.requests,
            errors = stats.errors,
            disconnected = stats.disconnected,
            "connection finished"
        );
        Ok(stats)
    }

    fn is_poisoned(&self, req: &NbdRequest) -> bool {
        let Some(poisoned) = &self.options.poisoned else {
            return false;
        };
        if !matches!(
            req.command,
            NbdCommand::Read | NbdCommand::Write | NbdCommand::Trim
        ) {
            return false;
        }
        let end = req.offset.saturating_add(req.length as u64);
        req.offset < poisoned.end && poisoned.start < end
    }

    async fn receive<R>(
        &self,
        reader: &mut R,
        replies: mpsc::UnboundedSender<QueuedReply>,
    ) -> Result<PeerStats, NbdError>
    where
        R: AsyncRead + Unpin,
    {
        let mut stats = PeerStats::default();
        let mut payload = Vec::new();

        loop {
            let req = match read_request(reader).await {
                Ok(req) => req,
                Err(e) if e.is_closed() => return Ok(stats),
                Err(e) => return Err(e),
            };
            stats.requests += 1;
            debug!(
                handle = %req.handle,
                command = %req.command,
                offset = req.offset,
                length = req.length,
                "request"
            );

            if req.command.has_request_payload() {
                // Bound allocation; the client validates sizes before sending.
                if req.length > NBD_MAX_PAYLOAD_SIZE {
                    return Err(io::Error::new(
                        io::ErrorKind::InvalidData,
                        format!("write payload of {} bytes is too large", req.length),
                    )
                    .into());
                }
                payload.resize(req.length as usize, 0);
                read_exact(reader, &mut payload).await?;
                stats.bytes_written += req.length as u64;
            }

            let mut error = if self.is_poisoned(&req) { NBD_EIO } else { NBD_OK };
            let mut payload_len = 0;
            match req.command {
                NbdCommand::Read => {
                    stats.reads += 1;
                    if req.length > NBD_MAX_PAYLOAD_SIZE {
                        error = NBD_EINVAL;
                    }
                    if error == NBD_OK {
                        payload_len = req.length as usize;
                        stats.bytes_read += req.length as u64;
                    }
                }
                NbdCommand::Write => stats.writes += 1,
                NbdCommand::Flush => stats.flushes += 1,
                NbdCommand::Trim => stats.trims += 1,
                NbdCommand::Disconnect => {
                    stats.disconnected = true;
                    info!(handle = %req.handle, "client disconnected");
                    return Ok(stats);
                }
            }
            if error != NBD_OK {
                stats.errors += 1;
            }

            let queued = QueuedReply {
                reply: NbdReply::error(req.handle, error),
                payload_len,
            };
            if replies.send(queued).is_err() {
                return Ok(stats);
            }
        }
    }

    async fn reply<W>(
        &self,
        writer: &mut W,
        mut queue: mpsc::UnboundedReceiver<QueuedReply>,
    ) -> Result<(), NbdError>
    where
        W: AsyncWrite + Unpin,
    {
        let mut rng = self.options.reorder_seed.map(SmallRng::seed_from_u64);
        let mut zeros = Vec::new();
        let mut batch = Vec::new();

        while let Some(first) = queue.recv().await {
            batch.push(first);
            if rng.is_some() {
                // Let more requests queue up so there is something to shuffle.
                tokio::task::yield_now().await;
            }
            while let Ok(next) = queue.try_recv() {
                batch.push(next);
            }
            if let Some(rng) = rng.as_mut() {
                batch.shuffle(rng);
            }

            for queued in batch.drain(..) {
                if zeros.len() < queued.payload_len {
                    zeros.resize(queued.payload_len, 0);
                }
                write_reply(writer, &queued.reply, &zeros[..queued.payload_len]).await?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use nbd::transport::{read_reply, write_request};
    use nbd::{Handle, TransportError};
    use tokio::io::duplex;

    use super::*;

    fn request(command: NbdCommand, handle: u64, offset: u64, length: u32) -> NbdRequest {
        NbdRequest {
            command,
            handle: Handle(handle),
            offset,
            length,
        }
    }

    #[tokio::test]
    async fn read_gets_zeros_and_write_is_consumed() {
        let (mut client, server) = duplex(64 * 1024);
        let peer = tokio::spawn(async move { ConformancePeer::new().serve(server).await });

        write_request(&mut client, &request(NbdCommand::Read, 1, 0, 512), &[])
            .await
            .unwrap();
        let reply = read_reply(&mut client).await.unwrap();
        assert_eq!(reply, NbdReply::ok(Handle(1)));
        let mut data = [0xFFu8; 512];
        read_exact(&mut client, &mut data).await.unwrap();
        assert!(data.iter().all(|&b| b == 0));

        write_request(
            &mut client,
            &request(NbdCommand::Write, 2, 4096, 1024),
            &[0xAB; 1024],
        )
        .await
        .unwrap();
        assert_eq!(
            read_reply(&mut client).await.unwrap(),
            NbdReply::ok(Handle(2))
        );

        write_request(&mut client, &NbdRequest::disconnect(Handle(3)), &[])
            .await
            .unwrap();

        // The peer hangs up after a disconnect.
        let err = read_reply(&mut client).await.unwrap_err();
        assert!(err.is_closed());

        let stats = peer.await.unwrap().unwrap();
        assert_eq!(stats.requests, 3);
        assert_eq!(stats.reads, 1);
        assert_eq!(stats.writes, 1);
        assert_eq!(stats.bytes_read, 512);
        assert_eq!(stats.bytes_written, 1024);
        assert!(stats.disconnected);
    }

    #[tokio::test]
    async fn poisoned_range_fails_without_payload() {
        let (mut client, server) = duplex(64 * 1024);
        let options = PeerOptions {
            poisoned: Some(8192..12288),
            ..Default::default()
        };
        let peer = tokio::spawn(async move {
            ConformancePeer::with_options(options).serve(server).await
        });

        write_request(&mut client, &request(NbdCommand::Read, 7, 8000, 512), &[])
            .await
            .unwrap();
        write_request(&mut client, &request(NbdCommand::Flush, 8, 0, 0), &[])
            .await
            .unwrap();

        // No payload follows the failed read, so the flush reply is next.
        assert_eq!(
            read_reply(&mut client).await.unwrap(),
            NbdReply::error(Handle(7), NBD_EIO)
        );
        assert_eq!(
            read_reply(&mut client).await.unwrap(),
            NbdReply::ok(Handle(8))
        );

        drop(client);
        let stats = peer.await.unwrap().unwrap();
        assert_eq!(stats.errors, 1);
        assert!(!stats.disconnected);
    }

    #[tokio::test]
    async fn reordered_replies_cover_every_request() {
        let (mut client, server) = duplex(1024 * 1024);
        let options = PeerOptions {
            reorder_seed: Some(7),
            ..Default::default()
        };
        let peer = tokio::spawn(async move {
            ConformancePeer::with_options(options).serve(server).await
        });

        for handle in 0..64 {
            write_request(&mut client, &request(NbdCommand::Flush, handle, 0, 0), &[])
                .await
                .unwrap();
        }

        let mut seen = HashSet::new();
        for _ in 0..64 {
            let reply = read_reply(&mut client).await.unwrap();
            assert!(reply.is_ok());
            assert!(seen.insert(reply.handle));
        }
        assert_eq!(seen.len(), 64);

        drop(client);
        assert_eq!(peer.await.unwrap().unwrap().flushes, 64);
    }

    #[tokio::test]
    async fn truncated_write_payload_is_an_error() {
        let (mut client, server) = duplex(64 * 1024);
        let peer = tokio::spawn(async move { ConformancePeer::new().serve(server).await });

        let header = request(NbdCommand::Write, 1, 0, 4096).to_bytes();
        nbd::transport::write_exact(&mut client, &header)
            .await
            .unwrap();
        nbd::transport::write_exact(&mut client, &[0u8; 100])
            .await
            .unwrap();
        drop(client);

        let result = peer.await.unwrap();
        assert!(matches!(
            result,
            Err(NbdError::Transport(TransportError::Partial {
                transferred: 100,
                expected: 4096
            }))
        ));
    }
}
