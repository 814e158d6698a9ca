//! Byte accounting for relayed connections
//!
//! Counters observe traffic without buffering or reordering it: every
//! completed read/write on the wrapped stream bumps an atomic, and readers
//! take point-in-time snapshots. Counter state lives exactly as long as the
//! socket pair that owns it.

use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};

use pin_project_lite::pin_project;
use serde::Serialize;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

/// Bytes transferred on one connection, split by direction.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ByteCount {
    /// Bytes written to the wrapped stream
    pub sent: u64,
    /// Bytes read from the wrapped stream
    pub received: u64,
}

/// Monotonic per-connection byte counters, shared between the stream wrapper
/// and whoever reports on the relay.
#[derive(Debug, Default)]
pub struct ByteCounters {
    sent: AtomicU64,
    received: AtomicU64,
}

impl ByteCounters {
    pub fn add_sent(&self, n: u64) {
        self.sent.fetch_add(n, Ordering::Relaxed);
    }

    pub fn add_received(&self, n: u64) {
        self.received.fetch_add(n, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> ByteCount {
        ByteCount {
            sent: self.sent.load(Ordering::Relaxed),
            received: self.received.load(Ordering::Relaxed),
        }
    }
}

pin_project! {
    /// Observe-only wrapper that counts bytes crossing a stream.
    ///
    /// Reads and writes are delegated untouched; only the completed byte
    /// counts are recorded, so the wrapper adds no buffering delay.
    pub struct CountingStream<S> {
        #[pin]
        inner: S,
        counters: Arc<ByteCounters>,
    }
}

impl<S> CountingStream<S> {
    pub fn new(inner: S, counters: Arc<ByteCounters>) -> Self {
        Self { inner, counters }
    }

    pub fn counters(&self) -> Arc<ByteCounters> {
        self.counters.clone()
    }
}

impl<S: AsyncRead> AsyncRead for CountingStream<S> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        let this = self.project();
        let before = buf.filled().len();
        let result = this.inner.poll_read(cx, buf);
        if let Poll::Ready(Ok(())) = &result {
            this.counters.add_received((buf.filled().len() - before) as u64);
        }
        result
    }
}

impl<S: AsyncWrite> AsyncWrite for CountingStream<S> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        let this = self.project();
        let result = this.inner.poll_write(cx, buf);
        if let Poll::Ready(Ok(n)) = &result {
            this.counters.add_sent(*n as u64);
        }
        result
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        self.project().inner.poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        self.project().inner.poll_shutdown(cx)
    }
}

/// Aggregate statistics for one listening server instance.
///
/// Injected into the server rather than living in a global so that each
/// instance owns its own totals; increments are lock-free.
#[derive(Debug, Default)]
pub struct ServerStats {
    connections: AtomicU64,
    relays: AtomicU64,
    tunnels: AtomicU64,
    failures: AtomicU64,
    bytes_sent: AtomicU64,
    bytes_received: AtomicU64,
}

/// Point-in-time view of [`ServerStats`]
#[derive(Debug, Clone, Copy, Serialize)]
pub struct StatsSnapshot {
    pub connections: u64,
    pub relays: u64,
    pub tunnels: u64,
    pub failures: u64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
}

impl ServerStats {
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn inc_connections(&self) {
        self.connections.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn inc_relays(&self) {
        self.relays.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn inc_tunnels(&self) {
        self.tunnels.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn inc_failures(&self) {
        self.failures.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn add_bytes(&self, count: ByteCount) {
        self.bytes_sent.fetch_add(count.sent, Ordering::Relaxed);
        self.bytes_received
            .fetch_add(count.received, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            connections: self.connections.load(Ordering::Relaxed),
            relays: self.relays.load(Ordering::Relaxed),
            tunnels: self.tunnels.load(Ordering::Relaxed),
            failures: self.failures.load(Ordering::Relaxed),
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
        }
    }
}
