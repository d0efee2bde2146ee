//! Usage metrics
//!
//! Moving-window aggregates of (count, duration, success, last error)
//! keyed by subject id: connection ids, user ids and procedure ids all
//! report into the same registry. Snapshots are plain dicts persisted
//! under `/.metrics/` by the background flush.

use std::collections::VecDeque;
use std::time::Duration;

use chrono::Utc;
use dashmap::DashMap;

use crate::dict::Dict;
use crate::error::Result;
use crate::path::StoragePath;
use crate::storage::root::RootStorage;

/// Number of one-minute buckets kept for the moving window
const WINDOW_MINUTES: i64 = 60;

#[derive(Debug, Default, Clone)]
struct Bucket {
    minute: i64,
    count: u64,
    errors: u64,
    millis: u64,
}

#[derive(Debug, Default)]
struct Series {
    count: u64,
    errors: u64,
    millis: u64,
    last_time: i64,
    last_error: Option<String>,
    window: VecDeque<Bucket>,
}

impl Series {
    fn report(&mut self, now_ms: i64, duration: Duration, success: bool, error: Option<&str>) {
        let millis = duration.as_millis() as u64;
        self.count += 1;
        self.millis += millis;
        self.last_time = now_ms;
        if !success {
            self.errors += 1;
            if let Some(msg) = error {
                self.last_error = Some(msg.to_string());
            }
        }

        let minute = now_ms / 60_000;
        match self.window.back_mut() {
            Some(bucket) if bucket.minute == minute => {
                bucket.count += 1;
                bucket.millis += millis;
                if !success {
                    bucket.errors += 1;
                }
            }
            _ => {
                self.window.push_back(Bucket {
                    minute,
                    count: 1,
                    errors: u64::from(!success),
                    millis,
                });
            }
        }
        while let Some(front) = self.window.front() {
            if minute - front.minute >= WINDOW_MINUTES {
                self.window.pop_front();
            } else {
                break;
            }
        }
    }

    fn snapshot(&self, subject: &str) -> Dict {
        let now_minute = Utc::now().timestamp_millis() / 60_000;
        let (mut w_count, mut w_errors, mut w_millis) = (0u64, 0u64, 0u64);
        for bucket in &self.window {
            if now_minute - bucket.minute < WINDOW_MINUTES {
                w_count += bucket.count;
                w_errors += bucket.errors;
                w_millis += bucket.millis;
            }
        }
        let mut window = Dict::new();
        window
            .set("count", w_count as i64)
            .set("errors", w_errors as i64)
            .set("avgMillis", average(w_millis, w_count));

        let mut dict = Dict::new();
        dict.set("id", subject)
            .set("type", "metrics")
            .set("count", self.count as i64)
            .set("errors", self.errors as i64)
            .set("avgMillis", average(self.millis, self.count))
            .set("lastTime", millis_to_time(self.last_time));
        if let Some(error) = &self.last_error {
            dict.set("lastError", error.as_str());
        }
        dict.set("window", window);
        dict
    }
}

fn average(total: u64, count: u64) -> i64 {
    if count == 0 {
        0
    } else {
        (total / count) as i64
    }
}

fn millis_to_time(ms: i64) -> chrono::DateTime<Utc> {
    use chrono::TimeZone;
    Utc.timestamp_millis_opt(ms)
        .single()
        .unwrap_or_else(|| chrono::DateTime::<Utc>::UNIX_EPOCH)
}

/// Process-wide metrics sink
#[derive(Debug, Default)]
pub struct MetricsRegistry {
    series: DashMap<String, Series>,
}

impl MetricsRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one observation against a subject id
    pub fn report(
        &self,
        subject: &str,
        duration: Duration,
        success: bool,
        error: Option<&str>,
    ) {
        let now_ms = Utc::now().timestamp_millis();
        self.series
            .entry(subject.to_string())
            .or_default()
            .report(now_ms, duration, success, error);
    }

    /// Snapshot for a single subject, if it has reported anything
    pub fn snapshot(&self, subject: &str) -> Option<Dict> {
        self.series.get(subject).map(|s| s.snapshot(subject))
    }

    /// All subject ids with data
    pub fn subjects(&self) -> Vec<String> {
        self.series.iter().map(|e| e.key().clone()).collect()
    }

    /// Persist every series under `/.metrics/`
    ///
    /// Failures on individual subjects are logged and do not stop the
    /// flush; metrics are best-effort.
    pub async fn flush(&self, root: &RootStorage) -> Result<()> {
        for subject in self.subjects() {
            let Some(dict) = self.snapshot(&subject) else {
                continue;
            };
            let Ok(path) = format!("/.metrics/{}", subject).parse::<StoragePath>() else {
                continue;
            };
            if let Err(e) = root.store(&path, dict).await {
                tracing::warn!(subject = %subject, error = %e, "metrics flush failed");
            }
        }
        Ok(())
    }
}
