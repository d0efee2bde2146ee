//! Bounded channel pool
//!
//! One pool per connection object. A `tokio` semaphore holds `max_open`
//! permits; every leased channel maps to one permit, and idle channels are
//! kept in a FIFO queue so the oldest released channel is reused first.
//! Returned channels are validated (`test_on_return` always, while-idle
//! validation during eviction, on-borrow validation when the driver opts
//! in); channels failing validation or reporting three consecutive errors
//! are destroyed instead of re-entering the queue.
//!
//! Ordering note: a returned channel is pushed onto the idle queue
//! *before* its permit is released, so a waiting borrower always finds
//! either the idle channel or room to create, never a phantom vacancy.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use chrono::Utc;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::{debug, warn};

use crate::dict::Dict;
use crate::error::{Error, Result};
use crate::metrics::MetricsRegistry;

use super::{Channel, ConnectionDriver};

/// Consecutive error count that invalidates a channel
const MAX_CHANNEL_ERRORS: u32 = 3;

/// A channel plus its pool bookkeeping
pub struct PooledChannel {
    channel: Arc<dyn Channel>,
    idle_since: AtomicI64,
    errors: AtomicU32,
    valid: AtomicBool,
}

impl PooledChannel {
    fn new(channel: Arc<dyn Channel>) -> Arc<Self> {
        Arc::new(Self {
            channel,
            idle_since: AtomicI64::new(Utc::now().timestamp_millis()),
            errors: AtomicU32::new(0),
            valid: AtomicBool::new(true),
        })
    }

    pub fn channel(&self) -> &Arc<dyn Channel> {
        &self.channel
    }

    /// Record an operation outcome; three consecutive failures invalidate
    pub fn report(&self, success: bool, message: Option<&str>) {
        if success {
            self.errors.store(0, Ordering::Release);
        } else {
            let errors = self.errors.fetch_add(1, Ordering::AcqRel) + 1;
            if let Some(msg) = message {
                debug!(errors, "channel error: {}", msg);
            }
            if errors >= MAX_CHANNEL_ERRORS {
                self.valid.store(false, Ordering::Release);
            }
        }
    }

    pub fn is_valid(&self) -> bool {
        self.valid.load(Ordering::Acquire)
    }

    pub fn invalidate(&self) {
        self.valid.store(false, Ordering::Release);
    }

    fn mark_idle(&self) {
        self.idle_since
            .store(Utc::now().timestamp_millis(), Ordering::Release);
    }

    fn idle_millis(&self) -> i64 {
        Utc::now().timestamp_millis() - self.idle_since.load(Ordering::Acquire)
    }
}

/// An exclusively held channel lease
///
/// Obtained from [`ChannelPool::borrow`] and handed back through
/// [`ChannelPool::give_back`] or [`ChannelPool::discard`]. Dropping a
/// lease without returning it (cancellation unwind) destroys the channel
/// rather than pooling it.
pub struct ChannelLease {
    pooled: Arc<PooledChannel>,
    pool: Arc<ChannelPool>,
    borrowed_at: Instant,
    permit: Option<OwnedSemaphorePermit>,
    returned: bool,
}

impl ChannelLease {
    pub fn channel(&self) -> &Arc<dyn Channel> {
        self.pooled.channel()
    }

    pub fn pooled(&self) -> &Arc<PooledChannel> {
        &self.pooled
    }

    pub fn connection_id(&self) -> &str {
        &self.pool.connection_id
    }

    /// The pool this lease must be returned to
    pub fn pool(&self) -> Arc<ChannelPool> {
        self.pool.clone()
    }

    /// True if nested reservations in the same call may reuse this lease
    pub fn is_shared(&self) -> bool {
        self.pooled.channel.is_shared()
    }
}

impl Drop for ChannelLease {
    fn drop(&mut self) {
        if self.returned {
            return;
        }
        // abandoned lease: never pool the channel again
        self.pooled.invalidate();
        self.pool.open.fetch_sub(1, Ordering::AcqRel);
        self.pool.leased.fetch_sub(1, Ordering::AcqRel);
        let driver = self.pool.driver.clone();
        let channel = self.pooled.channel.clone();
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(async move { driver.destroy_channel(channel).await });
        }
        // permit drops after the counters settle
    }
}

/// Bounded, validated channel pool for one connection
pub struct ChannelPool {
    connection_id: String,
    driver: Arc<dyn ConnectionDriver>,
    config: Dict,
    semaphore: Arc<Semaphore>,
    idle: Mutex<VecDeque<Arc<PooledChannel>>>,
    max_idle: Duration,
    max_wait: Duration,
    /// all existing channels (leased + idle)
    open: AtomicUsize,
    /// currently leased channels
    leased: AtomicUsize,
    last_used: AtomicI64,
    metrics: Arc<MetricsRegistry>,
    closed: AtomicBool,
}

impl ChannelPool {
    pub fn new(
        connection_id: impl Into<String>,
        driver: Arc<dyn ConnectionDriver>,
        config: Dict,
        max_open: usize,
        max_idle: Duration,
        max_wait: Duration,
        metrics: Arc<MetricsRegistry>,
    ) -> Arc<Self> {
        Arc::new(Self {
            connection_id: connection_id.into(),
            driver,
            config,
            semaphore: Arc::new(Semaphore::new(max_open.max(1))),
            idle: Mutex::new(VecDeque::new()),
            max_idle,
            max_wait,
            open: AtomicUsize::new(0),
            leased: AtomicUsize::new(0),
            last_used: AtomicI64::new(Utc::now().timestamp_millis()),
            metrics,
            closed: AtomicBool::new(false),
        })
    }

    pub fn connection_id(&self) -> &str {
        &self.connection_id
    }

    /// Existing channels (leased + idle)
    pub fn open_channels(&self) -> usize {
        self.open.load(Ordering::Acquire)
    }

    /// Channels currently leased out
    pub fn leased_channels(&self) -> usize {
        self.leased.load(Ordering::Acquire)
    }

    pub fn idle_channels(&self) -> usize {
        self.idle.lock().expect("idle queue lock poisoned").len()
    }

    /// Millis since the pool last leased or received a channel
    pub fn idle_millis(&self) -> i64 {
        Utc::now().timestamp_millis() - self.last_used.load(Ordering::Acquire)
    }

    fn touch(&self) {
        self.last_used
            .store(Utc::now().timestamp_millis(), Ordering::Release);
    }

    /// Lease a channel, waiting up to the pool's borrow limit
    ///
    /// Blocks for an idle channel or room to create one. On timeout the
    /// borrow fails with [`Error::PoolExhausted`].
    pub async fn borrow(self: &Arc<Self>) -> Result<ChannelLease> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::Channel(format!(
                "connection {} is closed",
                self.connection_id
            )));
        }
        let started = Instant::now();
        let permit = match tokio::time::timeout(
            self.max_wait,
            self.semaphore.clone().acquire_owned(),
        )
        .await
        {
            Ok(Ok(permit)) => permit,
            Ok(Err(_)) => {
                return Err(Error::Channel(format!(
                    "connection {} is closed",
                    self.connection_id
                )))
            }
            Err(_) => {
                self.metrics.report(
                    &self.connection_id,
                    started.elapsed(),
                    false,
                    Some("borrow timeout"),
                );
                return Err(Error::PoolExhausted(self.connection_id.clone()));
            }
        };
        self.touch();

        loop {
            let candidate = self
                .idle
                .lock()
                .expect("idle queue lock poisoned")
                .pop_front();
            let pooled = match candidate {
                Some(pooled) => {
                    if !pooled.is_valid() {
                        self.destroy_pooled(&pooled).await;
                        continue;
                    }
                    if self.driver.test_on_borrow() && !pooled.channel.validate().await {
                        self.destroy_pooled(&pooled).await;
                        continue;
                    }
                    pooled
                }
                None => match self.driver.create_channel(&self.config).await {
                    Ok(channel) => {
                        self.open.fetch_add(1, Ordering::AcqRel);
                        PooledChannel::new(channel)
                    }
                    Err(e) => {
                        self.metrics.report(
                            &self.connection_id,
                            started.elapsed(),
                            false,
                            Some(&e.to_string()),
                        );
                        return Err(Error::Channel(format!(
                            "connection {}: {}",
                            self.connection_id, e
                        )));
                    }
                },
            };

            if let Err(e) = pooled.channel.reserve().await {
                pooled.report(false, Some(&e.to_string()));
                self.destroy_pooled(&pooled).await;
                continue;
            }

            self.leased.fetch_add(1, Ordering::AcqRel);
            self.metrics
                .report(&self.connection_id, started.elapsed(), true, None);
            return Ok(ChannelLease {
                pooled,
                pool: self.clone(),
                borrowed_at: started,
                permit: Some(permit),
                returned: false,
            });
        }
    }

    /// Return a lease to the pool
    ///
    /// The channel re-enters the idle queue if it releases cleanly, is
    /// still valid and poolable; otherwise it is destroyed. Release
    /// failures are logged and count against the channel.
    pub async fn give_back(self: &Arc<Self>, mut lease: ChannelLease) {
        lease.returned = true;
        let pooled = lease.pooled.clone();
        let duration = lease.borrowed_at.elapsed();
        self.leased.fetch_sub(1, Ordering::AcqRel);
        self.touch();

        if let Err(e) = pooled.channel.release().await {
            warn!(connection = %self.connection_id, "channel release failed: {}", e);
            pooled.report(false, Some(&e.to_string()));
        }
        // test_on_return is unconditional; a closed pool takes nothing back
        let poolable = !self.closed.load(Ordering::Acquire)
            && pooled.is_valid()
            && pooled.channel.is_poolable()
            && pooled.channel.validate().await;
        if poolable {
            pooled.mark_idle();
            self.idle
                .lock()
                .expect("idle queue lock poisoned")
                .push_back(pooled);
        } else {
            self.destroy_pooled(&pooled).await;
        }
        self.metrics
            .report(&self.connection_id, duration, true, None);
        drop(lease.permit.take());
    }

    /// Destroy a lease outright (error and cancellation unwind)
    pub async fn discard(self: &Arc<Self>, mut lease: ChannelLease, reason: &str) {
        lease.returned = true;
        let pooled = lease.pooled.clone();
        let duration = lease.borrowed_at.elapsed();
        self.leased.fetch_sub(1, Ordering::AcqRel);
        self.touch();
        pooled.invalidate();
        self.destroy_pooled(&pooled).await;
        self.metrics
            .report(&self.connection_id, duration, false, Some(reason));
        drop(lease.permit.take());
    }

    async fn destroy_pooled(&self, pooled: &Arc<PooledChannel>) {
        self.open.fetch_sub(1, Ordering::AcqRel);
        self.driver.destroy_channel(pooled.channel.clone()).await;
    }

    /// Destroy idle channels past their idle lifetime, validate the rest
    pub async fn evict_idle(&self) {
        let mut keep = Vec::new();
        let expired: Vec<Arc<PooledChannel>> = {
            let mut idle = self.idle.lock().expect("idle queue lock poisoned");
            idle.drain(..).collect()
        };
        for pooled in expired {
            if pooled.idle_millis() >= self.max_idle.as_millis() as i64 {
                self.destroy_pooled(&pooled).await;
            } else if !pooled.is_valid() || !pooled.channel.validate().await {
                // test_while_idle
                self.destroy_pooled(&pooled).await;
            } else {
                keep.push(pooled);
            }
        }
        let mut idle = self.idle.lock().expect("idle queue lock poisoned");
        for pooled in keep {
            idle.push_back(pooled);
        }
    }

    /// Close the pool, destroying all idle channels
    ///
    /// Leased channels are destroyed as their leases return or drop.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.semaphore.close();
        let drained: Vec<Arc<PooledChannel>> = {
            let mut idle = self.idle.lock().expect("idle queue lock poisoned");
            idle.drain(..).collect()
        };
        if drained.is_empty() {
            return;
        }
        let driver = self.driver.clone();
        let open = drained.len();
        self.open.fetch_sub(open, Ordering::AcqRel);
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(async move {
                for pooled in drained {
                    driver.destroy_channel(pooled.channel.clone()).await;
                }
            });
        }
    }
}

impl std::fmt::Debug for ChannelPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChannelPool")
            .field("connection", &self.connection_id)
            .field("open", &self.open_channels())
            .field("leased", &self.leased_channels())
            .field("idle", &self.idle_channels())
            .finish()
    }
}
