//! Token-bucket bandwidth limiter wrapping a work connection (spec §4.6,
//! §8 scenario 6). Layered around the connection in the fixed order the
//! spec prescribes: bandwidth limit, then encryption, then compression —
//! see [`crate::client::proxy`] for where this gets composed.

use parking_lot::Mutex;
use pin_project_lite::pin_project;
use std::future::Future;
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::time::Sleep;

/// `0` means unlimited. Shared via [`SharedLimiter`] so a proxy's limiter
/// can be reconfigured live in response to `GetProxyBandwidthLimitResp`.
pub struct TokenBucket {
    rate_bytes_per_sec: u64,
    tokens: f64,
    capacity: f64,
    last_refill: Instant,
}

impl TokenBucket {
    pub fn new(rate_bytes_per_sec: u64) -> Self {
        let capacity = (rate_bytes_per_sec as f64).max(1.0);
        TokenBucket {
            rate_bytes_per_sec,
            tokens: capacity,
            capacity,
            last_refill: Instant::now(),
        }
    }

    pub fn set_rate(&mut self, rate_bytes_per_sec: u64) {
        self.rate_bytes_per_sec = rate_bytes_per_sec;
        self.capacity = (rate_bytes_per_sec as f64).max(1.0);
        self.tokens = self.tokens.min(self.capacity);
    }

    pub fn rate(&self) -> u64 {
        self.rate_bytes_per_sec
    }

    fn refill(&mut self) {
        if self.rate_bytes_per_sec == 0 {
            return;
        }
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.rate_bytes_per_sec as f64).min(self.capacity);
        self.last_refill = now;
    }

    /// Either grants up to `want` bytes right now, or reports how long to
    /// wait before at least one byte's worth of tokens will be available.
    fn acquire(&mut self, want: usize) -> Result<usize, Duration> {
        if self.rate_bytes_per_sec == 0 || want == 0 {
            return Ok(want);
        }
        self.refill();
        if self.tokens >= 1.0 {
            let allowed = (self.tokens.floor() as usize).min(want).max(1);
            self.tokens -= allowed as f64;
            Ok(allowed)
        } else {
            let wait = Duration::from_secs_f64((1.0 - self.tokens) / self.rate_bytes_per_sec as f64);
            Err(wait)
        }
    }
}

/// Parses an frp-style bandwidth limit string ("1MB", "512KB", "2Mbps")
/// into a bytes-per-second rate. Returns `None` for an empty/unset limit,
/// meaning unlimited.
pub fn parse_rate(spec: &str) -> Option<u64> {
    let spec = spec.trim();
    if spec.is_empty() {
        return None;
    }
    let lower = spec.to_ascii_lowercase();
    let (digits, unit) = lower.split_at(lower.find(|c: char| !c.is_ascii_digit() && c != '.').unwrap_or(lower.len()));
    let value: f64 = digits.parse().ok()?;
    let multiplier: f64 = match unit {
        "" | "b" => 1.0,
        "kb" => 1024.0,
        "mb" => 1024.0 * 1024.0,
        "gb" => 1024.0 * 1024.0 * 1024.0,
        // *bps units are bits per second, not bytes
        "kbps" => 1024.0 / 8.0,
        "mbps" => 1024.0 * 1024.0 / 8.0,
        "gbps" => 1024.0 * 1024.0 * 1024.0 / 8.0,
        _ => return None,
    };
    Some((value * multiplier) as u64)
}

#[derive(Clone)]
pub struct SharedLimiter(Arc<Mutex<TokenBucket>>);

impl SharedLimiter {
    pub fn new(rate_bytes_per_sec: u64) -> Self {
        SharedLimiter(Arc::new(Mutex::new(TokenBucket::new(rate_bytes_per_sec))))
    }

    pub fn unlimited() -> Self {
        Self::new(0)
    }

    pub fn set_rate(&self, rate_bytes_per_sec: u64) {
        self.0.lock().set_rate(rate_bytes_per_sec);
    }

    pub fn rate(&self) -> u64 {
        self.0.lock().rate()
    }

    fn acquire(&self, want: usize) -> Result<usize, Duration> {
        self.0.lock().acquire(want)
    }
}

pin_project! {
    pub struct LimitedStream<S> {
        #[pin]
        inner: S,
        read_limiter: SharedLimiter,
        write_limiter: SharedLimiter,
        #[pin]
        read_sleep: Option<Sleep>,
        #[pin]
        write_sleep: Option<Sleep>,
    }
}

impl<S> LimitedStream<S> {
    pub fn new(inner: S, read_limiter: SharedLimiter, write_limiter: SharedLimiter) -> Self {
        LimitedStream {
            inner,
            read_limiter,
            write_limiter,
            read_sleep: None,
            write_sleep: None,
        }
    }
}

impl<S: AsyncRead> AsyncRead for LimitedStream<S> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let mut this = self.project();
        if let Some(sleep) = this.read_sleep.as_mut().as_pin_mut() {
            match sleep.poll(cx) {
                Poll::Pending => return Poll::Pending,
                Poll::Ready(()) => this.read_sleep.set(None),
            }
        }

        match this.read_limiter.acquire(buf.remaining()) {
            Ok(allowed) => {
                let mut limited = buf.take(allowed);
                let res = this.inner.poll_read(cx, &mut limited);
                let n = limited.filled().len();
                if let Poll::Ready(Ok(())) = res {
                    unsafe {
                        buf.assume_init(n);
                    }
                    buf.advance(n);
                }
                res
            }
            Err(wait) => {
                this.read_sleep.set(Some(tokio::time::sleep(wait)));
                match this.read_sleep.as_mut().as_pin_mut().unwrap().poll(cx) {
                    Poll::Pending => Poll::Pending,
                    Poll::Ready(()) => {
                        this.read_sleep.set(None);
                        cx.waker().wake_by_ref();
                        Poll::Pending
                    }
                }
            }
        }
    }
}

impl<S: AsyncWrite> AsyncWrite for LimitedStream<S> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let mut this = self.project();
        if let Some(sleep) = this.write_sleep.as_mut().as_pin_mut() {
            match sleep.poll(cx) {
                Poll::Pending => return Poll::Pending,
                Poll::Ready(()) => this.write_sleep.set(None),
            }
        }

        match this.write_limiter.acquire(buf.len()) {
            Ok(allowed) => this.inner.poll_write(cx, &buf[..allowed]),
            Err(wait) => {
                this.write_sleep.set(Some(tokio::time::sleep(wait)));
                match this.write_sleep.as_mut().as_pin_mut().unwrap().poll(cx) {
                    Poll::Pending => Poll::Pending,
                    Poll::Ready(()) => {
                        this.write_sleep.set(None);
                        cx.waker().wake_by_ref();
                        Poll::Pending
                    }
                }
            }
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.project().inner.poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.project().inner.poll_shutdown(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{duplex, AsyncReadExt, AsyncWriteExt};

    #[test]
    fn unlimited_bucket_always_grants_in_full() {
        let mut bucket = TokenBucket::new(0);
        assert_eq!(bucket.acquire(10_000_000), Ok(10_000_000));
    }

    #[test]
    fn limited_bucket_eventually_runs_dry() {
        let mut bucket = TokenBucket::new(100);
        let first = bucket.acquire(1000);
        assert!(matches!(first, Ok(n) if n <= 100));
    }

    #[test]
    fn parse_rate_understands_byte_and_bit_units() {
        assert_eq!(parse_rate(""), None);
        assert_eq!(parse_rate("1KB"), Some(1024));
        assert_eq!(parse_rate("1MB"), Some(1024 * 1024));
        assert_eq!(parse_rate("8Mbps"), Some(8 * 1024 * 1024 / 8));
    }

    #[tokio::test]
    async fn unlimited_stream_passes_data_through() {
        let (a, b) = duplex(64);
        let mut a = LimitedStream::new(a, SharedLimiter::unlimited(), SharedLimiter::unlimited());
        let mut b = b;

        a.write_all(b"hello").await.unwrap();
        let mut buf = [0u8; 5];
        b.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hello");
    }

    #[test]
    fn set_rate_reconfigures_live_limiter() {
        let limiter = SharedLimiter::new(10);
        limiter.set_rate(1_000_000);
        assert_eq!(limiter.acquire(1000), Ok(1000));
    }
}
