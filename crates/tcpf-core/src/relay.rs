//! ByteRelay pumps: one direction of a tunnel is a reader pump and a writer
//! pump joined by a handoff channel.
//!
//! The handoff has room for a single chunk and the reader reserves that room
//! before it reads, so it never pulls a chunk from its socket until the
//! writer has taken the previous one. That is the only backpressure the
//! forwarder applies.
//!
//! Both pumps also watch the tunnel's shutdown signal. Once it is raised the
//! pump returns, dropping its socket half; the socket itself closes when the
//! last half is gone.

use std::fmt;
use std::io;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, watch};

/// Maximum number of bytes moved per read.
pub const READ_CHUNK_SIZE: usize = 1024;

/// Why a pump stopped.
#[derive(Debug)]
pub enum RelayEnd {
    /// The source reached a clean end-of-stream.
    Eof,
    /// Reading from the source failed.
    ReadFailed(io::Error),
    /// Writing to the destination failed.
    WriteFailed(io::Error),
    /// The paired pump is gone.
    HandoffClosed,
    /// The tunnel asked every pump to stop.
    Shutdown,
}

impl fmt::Display for RelayEnd {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RelayEnd::Eof => f.write_str("end of stream"),
            RelayEnd::ReadFailed(e) => write!(f, "read failed: {e}"),
            RelayEnd::WriteFailed(e) => write!(f, "write failed: {e}"),
            RelayEnd::HandoffClosed => f.write_str("paired relay stopped"),
            RelayEnd::Shutdown => f.write_str("tunnel shut down"),
        }
    }
}

impl RelayEnd {
    /// Whether this termination is worth a warning in the logs.
    pub fn is_anomaly(&self) -> bool {
        matches!(self, RelayEnd::ReadFailed(_) | RelayEnd::WriteFailed(_))
    }
}

/// Create the handoff joining a reader pump to its writer pump.
pub fn handoff() -> (mpsc::Sender<Vec<u8>>, mpsc::Receiver<Vec<u8>>) {
    mpsc::channel(1)
}

/// Resolves once the shutdown flag is raised or its sender is gone.
async fn shutdown_requested(shutdown: &mut watch::Receiver<bool>) {
    let _ = shutdown.wait_for(|closed| *closed).await;
}

/// Read chunks of up to [`READ_CHUNK_SIZE`] bytes from `src` and hand each
/// non-empty chunk to `tx`, in order.
///
/// A handoff slot is reserved before every read, so at most one chunk has
/// been read ahead of the writer.
pub async fn read_pump<R>(
    mut src: R,
    tx: mpsc::Sender<Vec<u8>>,
    mut shutdown: watch::Receiver<bool>,
) -> RelayEnd
where
    R: AsyncRead + Unpin,
{
    let mut buf = vec![0u8; READ_CHUNK_SIZE];

    loop {
        let permit = tokio::select! {
            _ = shutdown_requested(&mut shutdown) => return RelayEnd::Shutdown,
            permit = tx.reserve() => match permit {
                Ok(permit) => permit,
                Err(_) => return RelayEnd::HandoffClosed,
            },
        };

        tokio::select! {
            _ = shutdown_requested(&mut shutdown) => return RelayEnd::Shutdown,
            result = src.read(&mut buf) => match result {
                Ok(0) => return RelayEnd::Eof,
                Ok(n) => permit.send(buf[..n].to_vec()),
                Err(e) => return RelayEnd::ReadFailed(e),
            }
        }
    }
}

/// Take chunks from `rx` and write each one fully to `dst`.
///
/// Chunks already sitting in the handoff are written before a shutdown is
/// honoured, so bytes read just before the source hit end-of-stream still
/// reach the destination.
pub async fn write_pump<W>(
    mut dst: W,
    mut rx: mpsc::Receiver<Vec<u8>>,
    mut shutdown: watch::Receiver<bool>,
) -> RelayEnd
where
    W: AsyncWrite + Unpin,
{
    let end = loop {
        tokio::select! {
            biased;
            chunk = rx.recv() => match chunk {
                Some(chunk) => {
                    tokio::select! {
                        biased;
                        result = dst.write_all(&chunk) => {
                            if let Err(e) = result {
                                break RelayEnd::WriteFailed(e);
                            }
                        }
                        _ = shutdown_requested(&mut shutdown) => break RelayEnd::Shutdown,
                    }
                }
                None => break RelayEnd::HandoffClosed,
            },
            _ = shutdown_requested(&mut shutdown) => break RelayEnd::Shutdown,
        }
    };

    // Cleanup
    let _ = dst.shutdown().await;
    end
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::pin::Pin;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::task::{Context, Poll};
    use std::time::Duration;
    use tokio::io::{duplex, ReadBuf};
    use tokio::time::timeout;

    async fn collect(mut rx: mpsc::Receiver<Vec<u8>>) -> Vec<Vec<u8>> {
        let mut chunks = Vec::new();
        while let Some(chunk) = rx.recv().await {
            chunks.push(chunk);
        }
        chunks
    }

    #[tokio::test]
    async fn read_pump_forwards_until_eof() {
        let (mut peer, src) = duplex(64);
        let (tx, rx) = handoff();
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);

        let pump = tokio::spawn(read_pump(src, tx, shutdown_rx));
        peer.write_all(b"hello").await.unwrap();
        drop(peer);

        let chunks = collect(rx).await;
        assert_eq!(chunks.concat(), b"hello");
        assert!(matches!(pump.await.unwrap(), RelayEnd::Eof));
    }

    #[tokio::test]
    async fn read_pump_caps_chunk_size() {
        let (mut peer, src) = duplex(8192);
        let (tx, rx) = handoff();
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);

        let payload: Vec<u8> = (0..3000u32).map(|i| (i % 251) as u8).collect();
        peer.write_all(&payload).await.unwrap();
        drop(peer);

        let pump = tokio::spawn(read_pump(src, tx, shutdown_rx));
        let chunks = collect(rx).await;
        assert!(chunks.len() >= 3);
        assert!(chunks.iter().all(|c| !c.is_empty() && c.len() <= READ_CHUNK_SIZE));
        assert_eq!(chunks.concat(), payload);
        assert!(matches!(pump.await.unwrap(), RelayEnd::Eof));
    }

    #[tokio::test]
    async fn write_pump_preserves_order() {
        let (dst, mut peer) = duplex(64);
        let (tx, rx) = handoff();
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);

        let pump = tokio::spawn(write_pump(dst, rx, shutdown_rx));
        for chunk in [&b"one "[..], b"two ", b"three"] {
            tx.send(chunk.to_vec()).await.unwrap();
        }
        drop(tx);

        let mut received = Vec::new();
        peer.read_to_end(&mut received).await.unwrap();
        assert_eq!(received, b"one two three");
        assert!(matches!(pump.await.unwrap(), RelayEnd::HandoffClosed));
    }

    #[tokio::test]
    async fn write_pump_reports_write_failure() {
        let (dst, peer) = duplex(64);
        drop(peer);
        let (tx, rx) = handoff();
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);

        let pump = tokio::spawn(write_pump(dst, rx, shutdown_rx));
        tx.send(b"lost".to_vec()).await.unwrap();

        let end = pump.await.unwrap();
        assert!(matches!(end, RelayEnd::WriteFailed(_)));
        assert!(end.is_anomaly());
    }

    #[tokio::test]
    async fn shutdown_stops_idle_pumps() {
        let (_peer_a, src) = duplex(64);
        let (dst, _peer_b) = duplex(64);
        let (tx, rx) = handoff();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let reader = tokio::spawn(read_pump(src, tx, shutdown_rx.clone()));
        let writer = tokio::spawn(write_pump(dst, rx, shutdown_rx));
        shutdown_tx.send_replace(true);

        let reader_end = timeout(Duration::from_secs(5), reader).await.unwrap().unwrap();
        let writer_end = timeout(Duration::from_secs(5), writer).await.unwrap().unwrap();
        assert!(matches!(reader_end, RelayEnd::Shutdown));
        assert!(!reader_end.is_anomaly());
        // The writer may see the handoff close first if the reader wins the race.
        assert!(matches!(
            writer_end,
            RelayEnd::Shutdown | RelayEnd::HandoffClosed
        ));
    }

    /// Counts the bytes handed out by the wrapped reader.
    struct CountingReader<R> {
        inner: R,
        pulled: Arc<AtomicUsize>,
    }

    impl<R: AsyncRead + Unpin> AsyncRead for CountingReader<R> {
        fn poll_read(
            mut self: Pin<&mut Self>,
            cx: &mut Context<'_>,
            buf: &mut ReadBuf<'_>,
        ) -> Poll<io::Result<()>> {
            let before = buf.filled().len();
            let poll = Pin::new(&mut self.inner).poll_read(cx, buf);
            let read = buf.filled().len() - before;
            self.pulled.fetch_add(read, Ordering::SeqCst);
            poll
        }
    }

    #[tokio::test]
    async fn reader_blocks_while_writer_is_stalled() {
        let (mut peer, src) = duplex(8192);
        let pulled = Arc::new(AtomicUsize::new(0));
        let src = CountingReader { inner: src, pulled: pulled.clone() };
        let (tx, mut rx) = handoff();
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);

        peer.write_all(&[7u8; 4 * READ_CHUNK_SIZE]).await.unwrap();
        let pump = tokio::spawn(read_pump(src, tx, shutdown_rx));

        // Nobody drains the handoff: one chunk is read, then the reader parks.
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(!pump.is_finished());
        assert_eq!(pulled.load(Ordering::SeqCst), READ_CHUNK_SIZE);

        // Taking the chunk lets exactly one more read happen.
        let first = rx.recv().await.unwrap();
        assert_eq!(first.len(), READ_CHUNK_SIZE);
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(pulled.load(Ordering::SeqCst), 2 * READ_CHUNK_SIZE);
        pump.abort();
    }

    #[test]
    fn only_socket_failures_are_anomalies() {
        let broken = || io::Error::new(io::ErrorKind::BrokenPipe, "broken pipe");
        assert!(RelayEnd::ReadFailed(broken()).is_anomaly());
        assert!(RelayEnd::WriteFailed(broken()).is_anomaly());
        assert!(!RelayEnd::Eof.is_anomaly());
        assert!(!RelayEnd::HandoffClosed.is_anomaly());
        assert!(!RelayEnd::Shutdown.is_anomaly());

        assert_eq!(RelayEnd::WriteFailed(broken()).to_string(), "write failed: broken pipe");
        assert_eq!(RelayEnd::Eof.to_string(), "end of stream");
    }
}
