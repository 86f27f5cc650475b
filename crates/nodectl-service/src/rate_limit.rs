//! Downlink speed limiting with token buckets.
//!
//! A bucket holds up to one second worth of bytes (`burst == rate`). Writers
//! reserve tokens before each write and may drive the bucket into debt; the
//! debt is paid back by sleeping, so a single large write is delayed rather
//! than refused.

use std::io;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use nodectl_engine::LinkWriter;
use parking_lot::Mutex;
use tokio::time::Instant;

/// Effective per-user rate from the node-wide and user-specific caps.
///
/// A zero cap means "no cap", so if either side is zero the other one
/// applies; otherwise the stricter one does.
pub fn determine_rate(node_limit: u64, user_limit: u64) -> u64 {
    if node_limit == 0 || user_limit == 0 {
        node_limit.max(user_limit)
    } else {
        node_limit.min(user_limit)
    }
}

struct BucketState {
    rate: f64,
    tokens: f64,
    last: Instant,
}

impl BucketState {
    fn refill(&mut self, now: Instant) {
        if now > self.last {
            let elapsed = now.duration_since(self.last).as_secs_f64();
            self.tokens = (self.tokens + elapsed * self.rate).min(self.rate);
            self.last = now;
        }
    }
}

/// Thread-safe token bucket measured in bytes.
pub struct TokenBucket {
    state: Mutex<BucketState>,
}

impl TokenBucket {
    /// Creates a full bucket. A rate of zero is raised to one byte/second.
    pub fn new(bytes_per_sec: u64) -> Self {
        let rate = bytes_per_sec.max(1) as f64;
        Self {
            state: Mutex::new(BucketState {
                rate,
                tokens: rate,
                last: Instant::now(),
            }),
        }
    }

    pub fn rate(&self) -> u64 {
        self.state.lock().rate as u64
    }

    /// Changes the rate in place. Accumulated tokens are clamped to the
    /// new burst; outstanding debt is kept.
    pub fn set_rate(&self, bytes_per_sec: u64) {
        let mut state = self.state.lock();
        state.refill(Instant::now());
        state.rate = bytes_per_sec.max(1) as f64;
        state.tokens = state.tokens.min(state.rate);
    }

    /// Takes `n` tokens and returns how long the caller must wait before
    /// the bytes may be sent.
    pub fn reserve(&self, n: usize) -> Duration {
        self.reserve_at(n, Instant::now())
    }

    fn reserve_at(&self, n: usize, now: Instant) -> Duration {
        let mut state = self.state.lock();
        state.refill(now);
        state.tokens -= n as f64;
        if state.tokens >= 0.0 {
            Duration::ZERO
        } else {
            Duration::from_secs_f64(-state.tokens / state.rate)
        }
    }
}

/// The buckets one flow is metered against: the user's own bucket and,
/// if configured, the inbound-wide one.
#[derive(Clone, Default)]
pub struct RateBuckets {
    buckets: Vec<Arc<TokenBucket>>,
}

impl RateBuckets {
    pub fn push(&mut self, bucket: Arc<TokenBucket>) {
        self.buckets.push(bucket);
    }

    pub fn is_empty(&self) -> bool {
        self.buckets.is_empty()
    }

    pub fn len(&self) -> usize {
        self.buckets.len()
    }

    /// Reserves `n` tokens from every bucket; the wait is the longest one.
    pub fn reserve(&self, n: usize) -> Duration {
        self.buckets
            .iter()
            .map(|b| b.reserve(n))
            .max()
            .unwrap_or(Duration::ZERO)
    }
}

/// Link writer that meters every buffer against a set of buckets before
/// handing it to the underlying writer.
pub struct RateLimitedWriter {
    inner: Box<dyn LinkWriter>,
    buckets: RateBuckets,
}

impl RateLimitedWriter {
    pub fn new(inner: Box<dyn LinkWriter>, buckets: RateBuckets) -> Self {
        Self { inner, buckets }
    }
}

#[async_trait]
impl LinkWriter for RateLimitedWriter {
    async fn write_buffer(&mut self, buf: Vec<u8>) -> io::Result<()> {
        let wait = self.buckets.reserve(buf.len());
        if !wait.is_zero() {
            tokio::time::sleep(wait).await;
        }
        self.inner.write_buffer(buf).await
    }

    async fn close(&mut self) -> io::Result<()> {
        self.inner.close().await
    }
}
