//! Traffic accounting for relayed streams and bodies.

use bytes::Buf;
use hyper::body::{Body, Frame, SizeHint};
use pin_project_lite::pin_project;
use std::future::Future;
use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::time::{Instant, Sleep};

/// Boxed error carried by bodies that can go idle.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Last time any byte moved through a session, shared by both legs.
#[derive(Debug)]
pub struct IdleClock {
    origin: Instant,
    last_ms: AtomicU64,
}

impl IdleClock {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            origin: Instant::now(),
            last_ms: AtomicU64::new(0),
        })
    }

    /// Record activity now.
    pub fn touch(&self) {
        let now = self.origin.elapsed().as_millis() as u64;
        self.last_ms.fetch_max(now, Ordering::Relaxed);
    }

    /// Time since the last recorded activity.
    pub fn idle_for(&self) -> Duration {
        let now = self.origin.elapsed().as_millis() as u64;
        let last = self.last_ms.load(Ordering::Relaxed);
        Duration::from_millis(now.saturating_sub(last))
    }

    /// Resolve once the session has been idle for at least `limit`.
    pub async fn expired(&self, limit: Duration) {
        loop {
            let idle = self.idle_for();
            if idle >= limit {
                return;
            }
            tokio::time::sleep(limit - idle).await;
        }
    }
}

pin_project! {
    /// Stream wrapper that touches an [`IdleClock`] on every successful
    /// read or write and counts the bytes written into it.
    pub struct Tracked<S> {
        #[pin]
        inner: S,
        clock: Arc<IdleClock>,
        written: Arc<AtomicU64>,
    }
}

impl<S> Tracked<S> {
    pub fn new(inner: S, clock: Arc<IdleClock>, written: Arc<AtomicU64>) -> Self {
        Self {
            inner,
            clock,
            written,
        }
    }
}

impl<S: AsyncRead> AsyncRead for Tracked<S> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.project();
        let before = buf.filled().len();
        let result = this.inner.poll_read(cx, buf);
        if let Poll::Ready(Ok(())) = result {
            if buf.filled().len() > before {
                this.clock.touch();
            }
        }
        result
    }
}

impl<S: AsyncWrite> AsyncWrite for Tracked<S> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.project();
        let result = this.inner.poll_write(cx, buf);
        if let Poll::Ready(Ok(n)) = result {
            if n > 0 {
                this.clock.touch();
                this.written.fetch_add(n as u64, Ordering::Relaxed);
            }
        }
        result
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.project().inner.poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.project().inner.poll_shutdown(cx)
    }
}

pin_project! {
    /// Body wrapper that fails once its [`IdleClock`] has been idle for
    /// `limit`, so a stalled origin cannot hold a response open.
    pub struct IdleBody<B> {
        #[pin]
        inner: B,
        clock: Arc<IdleClock>,
        limit: Duration,
        #[pin]
        deadline: Sleep,
    }
}

impl<B> IdleBody<B> {
    pub fn new(inner: B, clock: Arc<IdleClock>, limit: Duration) -> Self {
        Self {
            inner,
            clock,
            limit,
            deadline: tokio::time::sleep(limit),
        }
    }
}

impl<B> Body for IdleBody<B>
where
    B: Body,
    B::Data: Buf,
    B::Error: Into<BoxError>,
{
    type Data = B::Data;
    type Error = BoxError;

    fn poll_frame(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        let mut this = self.project();

        if let Poll::Ready(frame) = this.inner.poll_frame(cx) {
            return Poll::Ready(frame.map(|result| result.map_err(Into::into)));
        }

        loop {
            let idle = this.clock.idle_for();
            if idle >= *this.limit {
                let err = io::Error::new(io::ErrorKind::TimedOut, "origin idle");
                return Poll::Ready(Some(Err(err.into())));
            }
            this.deadline
                .as_mut()
                .reset(Instant::now() + (*this.limit - idle));
            if this.deadline.as_mut().poll(cx).is_pending() {
                return Poll::Pending;
            }
        }
    }

    fn is_end_stream(&self) -> bool {
        self.inner.is_end_stream()
    }

    fn size_hint(&self) -> SizeHint {
        self.inner.size_hint()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test(start_paused = true)]
    async fn test_idle_clock_expires_without_activity() {
        let clock = IdleClock::new();
        let start = Instant::now();
        clock.expired(Duration::from_secs(5)).await;
        assert!(start.elapsed() >= Duration::from_secs(5));
    }

    #[tokio::test(start_paused = true)]
    async fn test_touch_postpones_expiry() {
        let clock = IdleClock::new();
        tokio::time::sleep(Duration::from_secs(4)).await;
        clock.touch();
        assert!(clock.idle_for() < Duration::from_secs(1));

        let start = Instant::now();
        clock.expired(Duration::from_secs(5)).await;
        assert!(start.elapsed() >= Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_tracked_counts_written_bytes() {
        let (a, mut b) = tokio::io::duplex(64);
        let clock = IdleClock::new();
        let written = Arc::new(AtomicU64::new(0));
        let mut tracked = Tracked::new(a, Arc::clone(&clock), Arc::clone(&written));

        tracked.write_all(b"hello world").await.unwrap();
        let mut buf = [0u8; 11];
        b.read_exact(&mut buf).await.unwrap();

        assert_eq!(&buf, b"hello world");
        assert_eq!(written.load(Ordering::Relaxed), 11);
    }

    /// Body whose origin never sends another byte.
    struct Stalled;

    impl Body for Stalled {
        type Data = bytes::Bytes;
        type Error = io::Error;

        fn poll_frame(
            self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
        ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
            Poll::Pending
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_body_fails_when_origin_stalls() {
        use http_body_util::BodyExt;

        let clock = IdleClock::new();
        let mut body = Box::pin(IdleBody::new(Stalled, clock, Duration::from_secs(3)));

        let start = Instant::now();
        let frame = body.frame().await.unwrap();
        let err = frame.unwrap_err();
        assert!(start.elapsed() >= Duration::from_secs(3));
        assert!(err.to_string().contains("idle"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_body_passes_frames_through() {
        use http_body_util::{BodyExt, Full};

        let clock = IdleClock::new();
        let body = IdleBody::new(
            Full::new(bytes::Bytes::from_static(b"hello")),
            clock,
            Duration::from_secs(3),
        );

        let collected = body.collect().await.unwrap().to_bytes();
        assert_eq!(&collected[..], b"hello");
    }
}
