//! Background scheduler
//!
//! Three periodic maintenance jobs keep the kernel tidy: the cache-clean
//! tick (which also drives per-connection idle eviction through
//! `passivate()` and flushes metrics), and the expired-session sweep.
//! Each job starts after a random delay inside its own interval so
//! several servers on one host do not fire in lockstep, and each job runs
//! strictly sequentially: the next round never starts before the previous
//! one returns.

use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::config::LimitsConfig;
use crate::metrics::MetricsRegistry;
use crate::session::Session;
use crate::storage::root::RootStorage;

/// Grace period for in-flight tasks at shutdown
const SHUTDOWN_WAIT: Duration = Duration::from_secs(10);

/// Owns the kernel's periodic maintenance tasks
pub struct Scheduler {
    cancel: CancellationToken,
    handles: Vec<JoinHandle<()>>,
}

impl Scheduler {
    /// Start the maintenance tasks
    pub fn start(
        root: Arc<RootStorage>,
        metrics: Arc<MetricsRegistry>,
        limits: &LimitsConfig,
    ) -> Self {
        let cancel = CancellationToken::new();
        let mut handles = Vec::new();

        let cache_interval = Duration::from_secs(limits.cache_clean_secs.max(1));
        let cache_root = root.clone();
        let cache_metrics = metrics.clone();
        handles.push(spawn_periodic(
            "cache-clean",
            cache_interval,
            cancel.clone(),
            move || {
                let root = cache_root.clone();
                let metrics = cache_metrics.clone();
                async move {
                    root.cache_clean(false).await;
                    if let Err(e) = metrics.flush(&root).await {
                        warn!("metrics flush failed: {}", e);
                    }
                }
            },
        ));

        let sweep_interval = Duration::from_secs(limits.session_sweep_secs.max(1));
        let sweep_root = root;
        handles.push(spawn_periodic(
            "session-sweep",
            sweep_interval,
            cancel.clone(),
            move || {
                let root = sweep_root.clone();
                async move {
                    match Session::remove_expired(&root).await {
                        Ok(0) => {}
                        Ok(n) => debug!(removed = n, "session sweep finished"),
                        Err(e) => warn!("session sweep failed: {}", e),
                    }
                }
            },
        ));

        Self { cancel, handles }
    }

    /// Signal shutdown and wait briefly for in-flight tasks
    pub async fn shutdown(mut self) {
        self.cancel.cancel();
        let drain = async {
            for handle in &mut self.handles {
                let _ = handle.await;
            }
        };
        if tokio::time::timeout(SHUTDOWN_WAIT, drain).await.is_err() {
            warn!("background tasks did not stop in time, aborting");
            for handle in &self.handles {
                handle.abort();
            }
        }
    }
}

impl std::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scheduler")
            .field("tasks", &self.handles.len())
            .finish()
    }
}

/// Run a job every `interval`, starting at a random point inside the
/// first interval; rounds never overlap
fn spawn_periodic<F, Fut>(
    name: &'static str,
    interval: Duration,
    cancel: CancellationToken,
    mut job: F,
) -> JoinHandle<()>
where
    F: FnMut() -> Fut + Send + 'static,
    Fut: std::future::Future<Output = ()> + Send,
{
    tokio::spawn(async move {
        let initial = interval.mul_f64(rand::rng().random_range(0.0..1.0));
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = tokio::time::sleep(initial) => {}
        }
        loop {
            debug!(task = name, "background task running");
            job().await;
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = tokio::time::sleep(interval) => {}
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LimitsConfig;
    use crate::storage::mem::MemStorage;
    use crate::storage::InitContext;
    use crate::types::TypeRegistry;

    fn root() -> Arc<RootStorage> {
        Arc::new(RootStorage::new(
            Arc::new(TypeRegistry::with_builtins()),
            InitContext::new(LimitsConfig::default()),
        ))
    }

    #[tokio::test]
    async fn test_start_and_shutdown() {
        let scheduler = Scheduler::start(
            root(),
            Arc::new(MetricsRegistry::new()),
            &LimitsConfig::default(),
        );
        scheduler.shutdown().await;
    }

    #[tokio::test]
    async fn test_periodic_job_runs_and_stops() {
        let counter = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let cancel = CancellationToken::new();
        let job_counter = counter.clone();
        let handle = spawn_periodic(
            "test",
            Duration::from_millis(10),
            cancel.clone(),
            move || {
                let counter = job_counter.clone();
                async move {
                    counter.fetch_add(1, std::sync::atomic::Ordering::AcqRel);
                }
            },
        );

        tokio::time::sleep(Duration::from_millis(100)).await;
        cancel.cancel();
        let _ = handle.await;
        let runs = counter.load(std::sync::atomic::Ordering::Acquire);
        assert!(runs >= 1, "job never ran");
    }

    #[tokio::test]
    async fn test_cache_clean_tick_evicts() {
        let root = root();
        let mem = Arc::new(MemStorage::new());
        let mut d = crate::dict::Dict::new();
        d.set("id", "x").set("type", "user");
        mem.seed("/user/x".parse::<crate::path::StoragePath>().unwrap(), d);
        root.mount(mem, "/storage/t/".parse().unwrap()).unwrap();
        root.remount(
            &"/storage/t/".parse().unwrap(),
            false,
            Some(crate::path::StoragePath::root()),
            0,
        )
        .unwrap();

        root.load(&"/user/x".parse().unwrap()).await.unwrap().unwrap();
        assert_eq!(root.cached_count(), 1);
        // force-flush behaves like a tick where everything has gone idle
        root.cache_clean(true).await;
        assert_eq!(root.cached_count(), 0);
    }
}
