//! Full-frame reads and writes over an async byte stream.
//!
//! Streams may transfer fewer bytes than requested per call. The helpers here
//! loop until a whole frame has moved and classify what went wrong when it
//! could not: a peer that closes between frames is [`TransportError::Closed`],
//! one that stops mid-frame is [`TransportError::Partial`].

use std::io;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::protocol::*;

/// Read exactly `buf.len()` bytes.
pub async fn read_exact<R>(reader: &mut R, buf: &mut [u8]) -> Result<(), TransportError>
where
    R: AsyncRead + Unpin,
{
    let expected = buf.len();
    let mut transferred = 0;

    while transferred < expected {
        match reader.read(&mut buf[transferred..]).await {
            Ok(0) if transferred == 0 => return Err(TransportError::Closed),
            Ok(0) => {
                return Err(TransportError::Partial {
                    transferred,
                    expected,
                });
            }
            Ok(n) => transferred += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(TransportError::Underlying(e)),
        }
    }

    Ok(())
}

/// Write exactly `buf.len()` bytes.
pub async fn write_exact<W>(writer: &mut W, buf: &[u8]) -> Result<(), TransportError>
where
    W: AsyncWrite + Unpin,
{
    let expected = buf.len();
    let mut transferred = 0;

    while transferred < expected {
        match writer.write(&buf[transferred..]).await {
            Ok(0) if transferred == 0 => return Err(TransportError::Closed),
            Ok(0) => {
                return Err(TransportError::Partial {
                    transferred,
                    expected,
                });
            }
            Ok(n) => transferred += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(TransportError::Underlying(e)),
        }
    }

    Ok(())
}

/// Write a request header followed by its payload, then flush.
///
/// Callers sharing a stream must serialize calls so header and payload stay
/// contiguous.
pub async fn write_request<W>(
    writer: &mut W,
    request: &NbdRequest,
    payload: &[u8],
) -> Result<(), TransportError>
where
    W: AsyncWrite + Unpin,
{
    debug_assert!(payload.is_empty() || request.command.has_request_payload());
    write_exact(writer, &request.to_bytes()).await?;
    if !payload.is_empty() {
        write_exact(writer, payload).await?;
    }
    writer.flush().await?;
    Ok(())
}

/// Read and validate one reply header.
pub async fn read_reply<R>(reader: &mut R) -> Result<NbdReply, NbdError>
where
    R: AsyncRead + Unpin,
{
    let mut buf = [0u8; NbdReply::SIZE_BYTES];
    read_exact(reader, &mut buf).await?;
    Ok(NbdReply::from_bytes(&buf)?)
}

/// Read and validate one request header.
pub async fn read_request<R>(reader: &mut R) -> Result<NbdRequest, NbdError>
where
    R: AsyncRead + Unpin,
{
    let mut buf = [0u8; NbdRequest::SIZE_BYTES];
    read_exact(reader, &mut buf).await?;
    Ok(NbdRequest::from_bytes(&buf)?)
}

/// Write a reply header followed by its payload, then flush.
pub async fn write_reply<W>(
    writer: &mut W,
    reply: &NbdReply,
    payload: &[u8],
) -> Result<(), TransportError>
where
    W: AsyncWrite + Unpin,
{
    write_exact(writer, &reply.to_bytes()).await?;
    if !payload.is_empty() {
        write_exact(writer, payload).await?;
    }
    writer.flush().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::duplex;

    #[tokio::test]
    async fn read_exact_absorbs_partial_reads() {
        // A one-byte pipe forces every transfer to be split.
        let (mut client, mut server) = duplex(1);
        let request = NbdRequest {
            command: NbdCommand::Write,
            handle: Handle(3),
            offset: 4096,
            length: 8,
        };

        let writer = tokio::spawn(async move {
            write_request(&mut client, &request, &[0xAB; 8])
                .await
                .unwrap();
            client
        });

        let parsed = read_request(&mut server).await.unwrap();
        assert_eq!(parsed, request);
        let mut payload = [0u8; 8];
        read_exact(&mut server, &mut payload).await.unwrap();
        assert_eq!(payload, [0xAB; 8]);
        writer.await.unwrap();
    }

    #[tokio::test]
    async fn read_at_frame_boundary_reports_closed() {
        let (client, mut server) = duplex(64);
        drop(client);

        let result = read_reply(&mut server).await;
        assert!(matches!(
            result,
            Err(NbdError::Transport(TransportError::Closed))
        ));
        assert!(result.unwrap_err().is_closed());
    }

    #[tokio::test]
    async fn read_mid_frame_reports_partial() {
        let (mut client, mut server) = duplex(64);
        let bytes = NbdReply::ok(Handle(1)).to_bytes();
        write_exact(&mut client, &bytes[..5]).await.unwrap();
        drop(client);

        let result = read_reply(&mut server).await;
        assert!(matches!(
            result,
            Err(NbdError::Transport(TransportError::Partial {
                transferred: 5,
                expected: 16
            }))
        ));
    }

    #[tokio::test]
    async fn read_reply_rejects_bad_magic() {
        let (mut client, mut server) = duplex(64);
        let mut bytes = NbdReply::ok(Handle(1)).to_bytes();
        bytes[0..4].copy_from_slice(&0xDEADBEEFu32.to_be_bytes());
        write_exact(&mut client, &bytes).await.unwrap();

        let result = read_reply(&mut server).await;
        assert!(matches!(
            result,
            Err(NbdError::Protocol(ProtocolError::BadMagic { .. }))
        ));
    }

    #[tokio::test]
    async fn write_to_dropped_peer_fails() {
        let (mut client, server) = duplex(64);
        drop(server);

        let result = write_exact(&mut client, &[1, 2, 3]).await;
        assert!(matches!(result, Err(TransportError::Underlying(_))));
    }

    #[tokio::test]
    async fn reply_with_payload_roundtrip() {
        let (mut client, mut server) = duplex(4);
        let reply = NbdReply::ok(Handle(77));

        let writer = tokio::spawn(async move {
            write_reply(&mut server, &reply, &[0u8; 32]).await.unwrap();
        });

        assert_eq!(read_reply(&mut client).await.unwrap(), reply);
        let mut payload = [0xFFu8; 32];
        read_exact(&mut client, &mut payload).await.unwrap();
        assert_eq!(payload, [0u8; 32]);
        writer.await.unwrap();
    }
}
