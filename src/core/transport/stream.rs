//! Transport over any async byte stream

use super::{Transport, TransportError, TransportStats};
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, DuplexStream};
use tokio::time::Instant;

/// Transport wrapping an `AsyncRead + AsyncWrite` stream
pub struct StreamTransport<S> {
    stream: Option<S>,
    info: String,
    stats: TransportStats,
    opened_at: Instant,
}

impl<S> StreamTransport<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    /// Wrap an already connected stream
    pub fn new(stream: S, info: impl Into<String>) -> Self {
        Self {
            stream: Some(stream),
            info: info.into(),
            stats: TransportStats::default(),
            opened_at: Instant::now(),
        }
    }

    /// Borrow the underlying stream
    pub fn get_mut(&mut self) -> Option<&mut S> {
        self.stream.as_mut()
    }
}

#[async_trait]
impl<S> Transport for StreamTransport<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    async fn read(&mut self, max_bytes: usize, timeout: Duration) -> Result<Bytes, TransportError> {
        let stream = self.stream.as_mut().ok_or(TransportError::NotConnected)?;
        let mut buffer = BytesMut::zeroed(max_bytes.max(1));

        match tokio::time::timeout(timeout, stream.read(&mut buffer)).await {
            Err(_elapsed) => Ok(Bytes::new()),
            Ok(Ok(0)) => {
                self.stream = None;
                Err(TransportError::Disconnected)
            }
            Ok(Ok(n)) => {
                buffer.truncate(n);
                self.stats.bytes_received += n as u64;
                self.stats.reads += 1;
                Ok(buffer.freeze())
            }
            Ok(Err(e)) => {
                self.stats.errors += 1;
                Err(TransportError::IoError(e))
            }
        }
    }

    async fn write(&mut self, data: &[u8]) -> Result<usize, TransportError> {
        let stream = self.stream.as_mut().ok_or(TransportError::NotConnected)?;
        let result = async {
            stream.write_all(data).await?;
            stream.flush().await
        }
        .await;

        match result {
            Ok(()) => {
                self.stats.bytes_sent += data.len() as u64;
                self.stats.writes += 1;
                Ok(data.len())
            }
            Err(e) if e.kind() == std::io::ErrorKind::BrokenPipe => {
                self.stats.errors += 1;
                self.stream = None;
                Err(TransportError::Disconnected)
            }
            Err(e) => {
                self.stats.errors += 1;
                Err(TransportError::IoError(e))
            }
        }
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        if let Some(mut stream) = self.stream.take() {
            stream.shutdown().await?;
        }
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.stream.is_some()
    }

    fn connection_info(&self) -> String {
        self.info.clone()
    }

    fn stats(&self) -> TransportStats {
        let mut stats = self.stats.clone();
        stats.uptime_secs = self.opened_at.elapsed().as_secs();
        stats
    }
}

/// In-memory transport plus the device-side end of the pipe
pub fn memory_pair(capacity: usize) -> (StreamTransport<DuplexStream>, DuplexStream) {
    let (host, device) = tokio::io::duplex(capacity);
    (StreamTransport::new(host, "memory"), device)
}
