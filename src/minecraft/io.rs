//! Connection driver: frame reads with an idle timeout on one side,
//! serialized pipeline writes on the other.
//!
//! The pipeline lives behind the same lock as the write half so a
//! packet's bytes are always ciphered and written as one unit, and so
//! stage mutations from the packet handler cannot race a write.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::BytesMut;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{Mutex, Notify};

use super::codec::{CodecError, PacketPipeline};
use super::packet::Packet;

const READ_CHUNK: usize = 4096;

#[derive(Debug, thiserror::Error)]
pub enum ConnError {
    #[error("connection closed by peer")]
    Closed,
    #[error("read timed out")]
    IdleTimeout,
    #[error(transparent)]
    Codec(#[from] CodecError),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

struct ConnInner {
    pipeline: PacketPipeline,
    write: OwnedWriteHalf,
}

/// Shared write/pipeline handle. Cloneable across tasks; all writes and
/// pipeline mutations serialize on the inner lock.
#[derive(Clone)]
pub struct ConnHandle {
    inner: Arc<Mutex<ConnInner>>,
    timeout_millis: Arc<AtomicU64>,
    closed: Arc<AtomicBool>,
    close_notify: Arc<Notify>,
}

impl ConnHandle {
    /// Serializes the packet through the pipeline and writes it out.
    /// The lock is held across both so concurrent writers cannot
    /// interleave cipher state and socket bytes.
    pub async fn write(&self, packet: &Packet) -> Result<(), ConnError> {
        let mut inner = self.inner.lock().await;
        let bytes = inner.pipeline.encode(packet)?;
        inner.write.write_all(&bytes).await?;
        Ok(())
    }

    /// Runs a closure against the pipeline, between frames.
    pub async fn with_pipeline<R>(&self, f: impl FnOnce(&mut PacketPipeline) -> R) -> R {
        let mut inner = self.inner.lock().await;
        f(&mut inner.pipeline)
    }

    /// (Re-)arms the idle read timeout.
    pub fn set_timeout(&self, timeout: Duration) {
        self.timeout_millis
            .store(timeout.as_millis() as u64, Ordering::Relaxed);
    }

    fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_millis.load(Ordering::Relaxed))
    }

    /// Shuts the write half down and wakes the read loop so it exits
    /// without waiting for the peer.
    pub async fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.close_notify.notify_one();
        let mut inner = self.inner.lock().await;
        let _ = inner.write.shutdown().await;
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

/// Owns the read half of one connection and drives frame decoding.
pub struct ConnCodec {
    read: OwnedReadHalf,
    handle: ConnHandle,
    /// Bytes exactly as received (possibly ciphered).
    raw: BytesMut,
    /// Deciphered bytes of the frame currently being assembled.
    frame: BytesMut,
}

impl ConnCodec {
    pub fn new(
        stream: TcpStream,
        pipeline: PacketPipeline,
        timeout: Duration,
    ) -> (Self, ConnHandle) {
        let (read, write) = stream.into_split();
        let handle = ConnHandle {
            inner: Arc::new(Mutex::new(ConnInner { pipeline, write })),
            timeout_millis: Arc::new(AtomicU64::new(timeout.as_millis() as u64)),
            closed: Arc::new(AtomicBool::new(false)),
            close_notify: Arc::new(Notify::new()),
        };
        let codec = Self {
            read,
            handle: handle.clone(),
            raw: BytesMut::new(),
            frame: BytesMut::new(),
        };
        (codec, handle)
    }

    pub fn handle(&self) -> ConnHandle {
        self.handle.clone()
    }

    /// Reads the next packet, waiting for more socket data as needed.
    /// A quiet socket past the idle timeout surfaces as
    /// [`ConnError::IdleTimeout`].
    pub async fn read_packet(&mut self) -> Result<Packet, ConnError> {
        loop {
            if self.handle.is_closed() {
                return Err(ConnError::Closed);
            }
            {
                let mut inner = self.handle.inner.lock().await;
                if let Some(packet) = inner.pipeline.decode_step(&mut self.raw, &mut self.frame)? {
                    return Ok(packet);
                }
            }
            let mut buf = [0u8; READ_CHUNK];
            tokio::select! {
                _ = self.handle.close_notify.notified() => return Err(ConnError::Closed),

                result = tokio::time::timeout(self.handle.timeout(), self.read.read(&mut buf)) => {
                    let read = result.map_err(|_| ConnError::IdleTimeout)??;
                    if read == 0 {
                        return Err(ConnError::Closed);
                    }
                    self.raw.extend_from_slice(&buf[..read]);
                }
            }
        }
    }
}
