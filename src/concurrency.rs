//! Pool settings for drivers without a socket pool
//!
//! The D1 REST API has no connections to pool, so its pool settings land
//! here instead:
//! - [`QueryConcurrencyPolicy`] caps in-flight requests (`set_max_open_conns`)
//!   and counts the callers that had to wait, for `stats()`
//! - [`HttpTransportPolicy`] holds the reqwest keep-alive pool, timeout and
//!   retry settings (feature `http`)

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// How long a waiting caller sleeps between permit attempts
const ACQUIRE_POLL_INTERVAL: Duration = Duration::from_micros(100);

/// In-flight request limit with wait accounting
///
/// A limit of 0 means unlimited. Clones share their counters and limit, and
/// the limit can change while permits are out.
///
/// # Example
///
/// ```
/// use sql_layers::concurrency::QueryConcurrencyPolicy;
///
/// let policy = QueryConcurrencyPolicy::new(1);
/// let permit = policy.try_acquire();
/// assert!(permit.is_some());
/// assert!(policy.try_acquire().is_none());
///
/// policy.set_max_concurrent_queries(0);
/// assert!(policy.try_acquire().is_some());
/// ```
#[derive(Debug, Clone)]
pub struct QueryConcurrencyPolicy {
    limit: Arc<AtomicUsize>,
    in_flight: Arc<AtomicUsize>,
    wait_count: Arc<AtomicU64>,
    wait_nanos: Arc<AtomicU64>,
}

impl QueryConcurrencyPolicy {
    /// Create a policy allowing `limit` requests at once (0 = unlimited)
    pub fn new(limit: usize) -> Self {
        Self {
            limit: Arc::new(AtomicUsize::new(limit)),
            in_flight: Arc::new(AtomicUsize::new(0)),
            wait_count: Arc::new(AtomicU64::new(0)),
            wait_nanos: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Create a policy without a limit
    pub fn unlimited() -> Self {
        Self::new(0)
    }

    /// Current limit (0 = unlimited)
    pub fn max_concurrent_queries(&self) -> usize {
        self.limit.load(Ordering::SeqCst)
    }

    /// Change the limit; permits already handed out stay valid
    pub fn set_max_concurrent_queries(&self, max: usize) {
        self.limit.store(max, Ordering::SeqCst);
    }

    /// Requests currently holding a permit
    pub fn current_in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    /// Number of acquisitions that had to wait for a permit
    pub fn wait_count(&self) -> u64 {
        self.wait_count.load(Ordering::SeqCst)
    }

    /// Total time spent waiting for permits
    pub fn wait_duration(&self) -> Duration {
        Duration::from_nanos(self.wait_nanos.load(Ordering::SeqCst))
    }

    /// Take a permit if the limit allows it
    pub fn try_acquire(&self) -> Option<ConcurrencyPermit> {
        loop {
            let max = self.max_concurrent_queries();
            let current = self.in_flight.load(Ordering::SeqCst);
            if max != 0 && current >= max {
                return None;
            }
            if self
                .in_flight
                .compare_exchange(current, current + 1, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
            {
                return Some(ConcurrencyPermit {
                    in_flight: Arc::clone(&self.in_flight),
                });
            }
        }
    }

    /// Take a permit, waiting until one is free
    ///
    /// Waits are added to [`wait_count`](Self::wait_count) and
    /// [`wait_duration`](Self::wait_duration).
    pub async fn acquire(&self) -> ConcurrencyPermit {
        if let Some(permit) = self.try_acquire() {
            return permit;
        }

        let started = Instant::now();
        let permit = loop {
            tokio::time::sleep(ACQUIRE_POLL_INTERVAL).await;
            if let Some(permit) = self.try_acquire() {
                break permit;
            }
        };

        let waited = u64::try_from(started.elapsed().as_nanos()).unwrap_or(u64::MAX);
        self.wait_count.fetch_add(1, Ordering::SeqCst);
        self.wait_nanos.fetch_add(waited, Ordering::SeqCst);
        permit
    }
}

/// One in-flight request; released on drop
#[derive(Debug)]
pub struct ConcurrencyPermit {
    in_flight: Arc<AtomicUsize>,
}

impl Drop for ConcurrencyPermit {
    fn drop(&mut self) {
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}

/// reqwest client settings for HTTP drivers
///
/// `pool_idle_connections` limits idle keep-alive connections per host; it
/// is not a concurrency cap.
///
/// # Example
///
/// ```
/// use sql_layers::concurrency::HttpTransportPolicy;
/// use std::time::Duration;
///
/// let policy = HttpTransportPolicy::default()
///     .with_request_timeout(Duration::from_secs(60))
///     .with_retries(5, Duration::from_millis(50));
/// assert!(policy.retry_enabled());
/// assert_eq!(policy.retry_delay(2), Duration::from_millis(200));
/// ```
#[cfg(feature = "http")]
#[derive(Debug, Clone)]
pub struct HttpTransportPolicy {
    pool_idle_connections: usize,
    pool_idle_timeout: Option<Duration>,
    request_timeout: Duration,
    retry_enabled: bool,
    max_retries: u32,
    retry_base_delay: Duration,
}

#[cfg(feature = "http")]
impl Default for HttpTransportPolicy {
    fn default() -> Self {
        Self {
            pool_idle_connections: 10,
            pool_idle_timeout: Some(Duration::from_secs(90)),
            request_timeout: Duration::from_secs(30),
            retry_enabled: false,
            max_retries: 3,
            retry_base_delay: Duration::from_millis(100),
        }
    }
}

#[cfg(feature = "http")]
impl HttpTransportPolicy {
    /// Set the per-request timeout
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Retry failed requests up to `max_retries` times with exponential backoff
    pub fn with_retries(mut self, max_retries: u32, base_delay: Duration) -> Self {
        self.retry_enabled = true;
        self.max_retries = max_retries;
        self.retry_base_delay = base_delay;
        self
    }

    /// Idle keep-alive connections kept per host
    pub fn pool_idle_connections(&self) -> usize {
        self.pool_idle_connections
    }

    /// How long idle keep-alive connections are kept (`None` = forever)
    pub fn pool_idle_timeout(&self) -> Option<Duration> {
        self.pool_idle_timeout
    }

    /// Check if retries are enabled
    pub fn retry_enabled(&self) -> bool {
        self.retry_enabled
    }

    /// Maximum number of retries after the first attempt
    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    /// Backoff before retry number `attempt` (starting at 0)
    pub fn retry_delay(&self, attempt: u32) -> Duration {
        self.retry_base_delay.saturating_mul(1u32 << attempt.min(16))
    }

    /// Change the idle connection limit
    pub fn set_pool_idle_connections(&mut self, max: usize) {
        self.pool_idle_connections = max;
    }

    /// Change how long idle connections are kept
    pub fn set_pool_idle_timeout(&mut self, timeout: Option<Duration>) {
        self.pool_idle_timeout = timeout;
    }

    /// Build a reqwest client from these settings
    pub fn create_client(&self) -> Result<reqwest::Client, reqwest::Error> {
        reqwest::Client::builder()
            .timeout(self.request_timeout)
            .pool_max_idle_per_host(self.pool_idle_connections)
            .pool_idle_timeout(self.pool_idle_timeout)
            .build()
    }
}
