//! Lock-free connector health counters.
//!
//! Mutated only by the owning connector's tasks; snapshotted without
//! locking by the server and engine.

use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};

use crate::models::HealthSnapshot;

#[derive(Debug, Default)]
pub struct HealthTracker {
    connected: AtomicBool,
    message_count: AtomicU64,
    error_count: AtomicU64,
    last_message_ms: AtomicI64,
    last_reconnect_ms: AtomicI64,
}

impl HealthTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::Relaxed);
    }

    pub fn record_message(&self) {
        self.message_count.fetch_add(1, Ordering::Relaxed);
        self.last_message_ms
            .store(Utc::now().timestamp_millis(), Ordering::Relaxed);
    }

    pub fn record_error(&self) {
        self.error_count.fetch_add(1, Ordering::Relaxed);
    }

    /// Refreshes the liveness stamp without counting a data message
    /// (pongs, venue heartbeats).
    pub fn touch(&self) {
        self.last_message_ms
            .store(Utc::now().timestamp_millis(), Ordering::Relaxed);
    }

    pub fn record_reconnect(&self) {
        self.last_reconnect_ms
            .store(Utc::now().timestamp_millis(), Ordering::Relaxed);
    }

    /// Time since the last liveness signal. `None` until the first
    /// message arrives.
    pub fn idle(&self) -> Option<Duration> {
        let last = self.last_message_ms.load(Ordering::Relaxed);
        if last == 0 {
            return None;
        }
        let elapsed_ms = Utc::now().timestamp_millis().saturating_sub(last);
        Some(Duration::from_millis(elapsed_ms.max(0) as u64))
    }

    pub fn snapshot(&self) -> HealthSnapshot {
        HealthSnapshot {
            connected: self.connected.load(Ordering::Relaxed),
            last_message_at: millis_to_datetime(self.last_message_ms.load(Ordering::Relaxed)),
            message_count: self.message_count.load(Ordering::Relaxed),
            error_count: self.error_count.load(Ordering::Relaxed),
            last_reconnect_at: millis_to_datetime(self.last_reconnect_ms.load(Ordering::Relaxed)),
        }
    }
}

fn millis_to_datetime(ms: i64) -> Option<DateTime<Utc>> {
    if ms == 0 {
        return None;
    }
    Utc.timestamp_millis_opt(ms).single()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_accumulate() {
        let health = HealthTracker::new();
        assert!(health.idle().is_none());

        health.set_connected(true);
        health.record_message();
        health.record_message();
        health.record_error();

        let snapshot = health.snapshot();
        assert!(snapshot.connected);
        assert_eq!(snapshot.message_count, 2);
        assert_eq!(snapshot.error_count, 1);
        assert!(snapshot.last_message_at.is_some());
        assert!(snapshot.last_reconnect_at.is_none());
        assert!(health.idle().unwrap() < Duration::from_secs(5));
    }

    #[test]
    fn reconnect_stamp_recorded() {
        let health = HealthTracker::new();
        health.record_reconnect();
        assert!(health.snapshot().last_reconnect_at.is_some());
    }
}
