//! iroh QUIC connections as session transports
//!
//! One bidirectional stream carries the whole session. Frames are a four byte
//! big-endian length followed by the payload. QUIC only tells the acceptor
//! about a stream once bytes flow on it, so the dialer opens with an empty
//! frame that the acceptor consumes before handing the stream to a session.

use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use bytes::{BufMut, BytesMut};
use iroh::endpoint::{Connection, RecvStream, SendStream, VarInt};
use iroh::Endpoint;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::Mutex;

use common::crypto::PublicKey;
use common::protocol::ALPN;
use common::transport::{Transport, TransportError};

/// Largest frame either side will accept
pub const MAX_FRAME_SIZE: usize = 8 * 1024 * 1024;

/// How long a closing side waits for the remote to drain its stream
const CLOSE_GRACE_PERIOD: Duration = Duration::from_secs(2);

pub async fn write_frame<W>(writer: &mut W, frame: &[u8]) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    if frame.len() > MAX_FRAME_SIZE {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("frame of {} bytes exceeds {}", frame.len(), MAX_FRAME_SIZE),
        ));
    }
    let mut buf = BytesMut::with_capacity(4 + frame.len());
    buf.put_u32(frame.len() as u32);
    buf.put_slice(frame);
    writer.write_all(&buf).await?;
    writer.flush().await
}

/// Read one frame, `None` on a clean end of stream between frames
pub async fn read_frame<R>(reader: &mut R) -> io::Result<Option<Vec<u8>>>
where
    R: AsyncRead + Unpin,
{
    let mut header = [0u8; 4];
    let mut filled = 0;
    while filled < header.len() {
        let n = reader.read(&mut header[filled..]).await?;
        if n == 0 {
            if filled == 0 {
                return Ok(None);
            }
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "stream ended inside a frame header",
            ));
        }
        filled += n;
    }

    let len = u32::from_be_bytes(header) as usize;
    if len > MAX_FRAME_SIZE {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("frame of {} bytes exceeds {}", len, MAX_FRAME_SIZE),
        ));
    }
    let mut frame = vec![0u8; len];
    reader.read_exact(&mut frame).await?;
    Ok(Some(frame))
}

fn io_error(e: impl std::fmt::Display) -> TransportError {
    TransportError::Io(e.to_string())
}

/// A session transport over one iroh connection
#[derive(Debug)]
pub struct IrohTransport {
    remote: PublicKey,
    connection: Connection,
    send: Mutex<SendStream>,
    recv: Mutex<RecvStream>,
    closed: AtomicBool,
}

impl IrohTransport {
    /// Connect to `remote` by its node id and open the session stream
    pub async fn dial(endpoint: &Endpoint, remote: PublicKey) -> Result<Self, TransportError> {
        tracing::debug!(%remote, "dialing");
        let connection = endpoint
            .connect(iroh::PublicKey::from(remote), ALPN)
            .await
            .map_err(io_error)?;
        let (mut send, recv) = connection.open_bi().await.map_err(io_error)?;
        write_frame(&mut send, &[]).await.map_err(io_error)?;

        let authenticated = connection
            .remote_node_id()
            .map(PublicKey::from)
            .map_err(io_error)?;
        tracing::debug!(remote = %authenticated, "session stream opened");

        Ok(Self::new(authenticated, connection, send, recv))
    }

    /// Take an incoming connection and wait for the dialer's opening frame
    pub async fn accept(connection: Connection) -> Result<Self, TransportError> {
        let remote = connection
            .remote_node_id()
            .map(PublicKey::from)
            .map_err(io_error)?;
        let (send, mut recv) = connection.accept_bi().await.map_err(io_error)?;
        match read_frame(&mut recv).await.map_err(io_error)? {
            Some(frame) if frame.is_empty() => {}
            Some(_) => {
                return Err(TransportError::Codec(
                    "expected an empty opening frame".to_string(),
                ))
            }
            None => {
                return Err(TransportError::Closed(
                    "stream ended before opening".to_string(),
                ))
            }
        }
        tracing::debug!(%remote, "session stream accepted");
        Ok(Self::new(remote, connection, send, recv))
    }

    fn new(remote: PublicKey, connection: Connection, send: SendStream, recv: RecvStream) -> Self {
        Self {
            remote,
            connection,
            send: Mutex::new(send),
            recv: Mutex::new(recv),
            closed: AtomicBool::new(false),
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Transport for IrohTransport {
    fn remote_public_key(&self) -> PublicKey {
        self.remote
    }

    async fn send(&self, frame: Vec<u8>) -> Result<(), TransportError> {
        if self.is_closed() {
            return Err(TransportError::Closed("local end closed".to_string()));
        }
        let mut send = self.send.lock().await;
        write_frame(&mut *send, &frame).await.map_err(io_error)
    }

    async fn recv(&self) -> Result<Option<Vec<u8>>, TransportError> {
        let mut recv = self.recv.lock().await;
        match read_frame(&mut *recv).await {
            Ok(frame) => Ok(frame),
            Err(e) => match self.connection.close_reason() {
                Some(reason) => {
                    tracing::debug!(%reason, "connection gone");
                    Ok(None)
                }
                None => Err(io_error(e)),
            },
        }
    }

    async fn close(&self, reason: Option<String>) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let reason = reason.unwrap_or_default();
        tracing::debug!(remote = %self.remote, %reason, "closing iroh transport");

        let mut send = self.send.lock().await;
        if send.finish().is_ok() {
            let _ = tokio::time::timeout(CLOSE_GRACE_PERIOD, send.stopped()).await;
        }
        self.connection
            .close(VarInt::from_u32(0), reason.as_bytes());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_frames_over_a_duplex() {
        let (mut a, mut b) = tokio::io::duplex(64);

        let writer = tokio::spawn(async move {
            write_frame(&mut a, b"").await.unwrap();
            write_frame(&mut a, b"hello").await.unwrap();
            write_frame(&mut a, &vec![7u8; 1000]).await.unwrap();
        });

        assert_eq!(read_frame(&mut b).await.unwrap(), Some(Vec::new()));
        assert_eq!(read_frame(&mut b).await.unwrap(), Some(b"hello".to_vec()));
        assert_eq!(read_frame(&mut b).await.unwrap(), Some(vec![7u8; 1000]));
        writer.await.unwrap();

        // writer dropped between frames
        assert_eq!(read_frame(&mut b).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_truncated_header_is_an_error() {
        let (mut a, mut b) = tokio::io::duplex(64);
        a.write_all(&[0, 0]).await.unwrap();
        drop(a);

        let err = read_frame(&mut b).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
    }

    #[tokio::test]
    async fn test_oversized_frames_are_rejected() {
        let (mut a, mut b) = tokio::io::duplex(64);
        a.write_all(&(MAX_FRAME_SIZE as u32 + 1).to_be_bytes())
            .await
            .unwrap();

        let err = read_frame(&mut b).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);

        let too_big = vec![0u8; MAX_FRAME_SIZE + 1];
        let err = write_frame(&mut a, &too_big).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidInput);
    }
}
