//! Connector lifecycle: state machine, reconnect gating, and backoff.
//!
//! Idle -> Dialing -> Subscribing -> Syncing -> Streaming -> Reconnecting
//! -> Dialing, with Closed terminal from any state. Reconnect entry is
//! gated by an atomic one-shot so a read error and a heartbeat timeout
//! cannot spawn two concurrent reconnect chains.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{debug, info};

use crate::models::Venue;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectorState {
    Idle,
    Dialing,
    Subscribing,
    Syncing,
    Streaming,
    Reconnecting,
    Closed,
}

impl fmt::Display for ConnectorState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Idle => "idle",
            Self::Dialing => "dialing",
            Self::Subscribing => "subscribing",
            Self::Syncing => "syncing",
            Self::Streaming => "streaming",
            Self::Reconnecting => "reconnecting",
            Self::Closed => "closed",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransitionReason {
    Connect,
    TransportEstablished,
    SubscriptionSent,
    SnapshotSynced,
    ReadError,
    StaleConnection,
    SequenceGap,
    VenueDisconnect,
    Backoff,
    CloseRequested,
}

impl fmt::Display for TransitionReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Connect => "connect",
            Self::TransportEstablished => "transport_established",
            Self::SubscriptionSent => "subscription_sent",
            Self::SnapshotSynced => "snapshot_synced",
            Self::ReadError => "read_error",
            Self::StaleConnection => "stale_connection",
            Self::SequenceGap => "sequence_gap",
            Self::VenueDisconnect => "venue_disconnect",
            Self::Backoff => "backoff",
            Self::CloseRequested => "close_requested",
        };
        f.write_str(s)
    }
}

/// Reconnect delay law: `min(attempt * base, cap)`, a bounded number of
/// attempts, counter reset on every successful entry into Streaming.
#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub base: Duration,
    pub cap: Duration,
    pub max_attempts: u32,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(5),
            cap: Duration::from_secs(30),
            max_attempts: 10,
        }
    }
}

impl BackoffPolicy {
    pub fn delay(&self, attempt: u32) -> Duration {
        self.base.saturating_mul(attempt.max(1)).min(self.cap)
    }
}

pub struct Session {
    venue: Venue,
    state: Mutex<ConnectorState>,
    reconnecting: AtomicBool,
    attempt: AtomicU32,
    backoff: BackoffPolicy,
}

impl Session {
    pub fn new(venue: Venue) -> Self {
        Self {
            venue,
            state: Mutex::new(ConnectorState::Idle),
            reconnecting: AtomicBool::new(false),
            attempt: AtomicU32::new(0),
            backoff: BackoffPolicy::default(),
        }
    }

    pub fn state(&self) -> ConnectorState {
        *self.state.lock()
    }

    pub fn is_closed(&self) -> bool {
        self.state() == ConnectorState::Closed
    }

    /// Moves the state machine. Closed is terminal; any transition out of
    /// it is ignored. Entering Streaming resets the backoff counter.
    pub fn transition(&self, to: ConnectorState, reason: TransitionReason) {
        let mut state = self.state.lock();
        if *state == ConnectorState::Closed {
            return;
        }
        if *state == to {
            return;
        }
        debug!(
            venue = %self.venue,
            from = %*state,
            to = %to,
            reason = %reason,
            "connector transition"
        );
        *state = to;
        drop(state);

        if to == ConnectorState::Streaming {
            self.attempt.store(0, Ordering::Relaxed);
            info!(venue = %self.venue, "streaming");
        }
    }

    /// One-shot gate for the reconnect chain.
    pub fn try_begin_reconnect(&self) -> bool {
        self.reconnecting
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    pub fn end_reconnect(&self) {
        self.reconnecting.store(false, Ordering::SeqCst);
    }

    pub fn reconnect_in_flight(&self) -> bool {
        self.reconnecting.load(Ordering::SeqCst)
    }

    /// Bumps the attempt counter and returns the delay before the next
    /// dial, or `None` once the attempt budget is exhausted.
    pub fn next_backoff(&self) -> Option<Duration> {
        let attempt = self.attempt.fetch_add(1, Ordering::Relaxed) + 1;
        if attempt > self.backoff.max_attempts {
            return None;
        }
        Some(self.backoff.delay(attempt))
    }

    pub fn attempts(&self) -> u32 {
        self.attempt.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_grows_linearly_to_cap() {
        let policy = BackoffPolicy::default();
        assert_eq!(policy.delay(1), Duration::from_secs(5));
        assert_eq!(policy.delay(3), Duration::from_secs(15));
        assert_eq!(policy.delay(6), Duration::from_secs(30));
        assert_eq!(policy.delay(10), Duration::from_secs(30));
    }

    #[test]
    fn attempts_are_bounded_and_reset_on_streaming() {
        let session = Session::new(Venue::Kraken);
        for _ in 0..10 {
            assert!(session.next_backoff().is_some());
        }
        assert!(session.next_backoff().is_none());

        session.transition(ConnectorState::Streaming, TransitionReason::SnapshotSynced);
        assert_eq!(session.attempts(), 0);
        assert_eq!(session.next_backoff(), Some(Duration::from_secs(5)));
    }

    #[test]
    fn reconnect_gate_is_one_shot() {
        let session = Session::new(Venue::Kraken);
        assert!(session.try_begin_reconnect());
        assert!(session.reconnect_in_flight());
        assert!(!session.try_begin_reconnect());
        session.end_reconnect();
        assert!(!session.reconnect_in_flight());
        assert!(session.try_begin_reconnect());
    }

    #[test]
    fn closed_is_terminal() {
        let session = Session::new(Venue::Kraken);
        session.transition(ConnectorState::Closed, TransitionReason::CloseRequested);
        session.transition(ConnectorState::Dialing, TransitionReason::Connect);
        assert_eq!(session.state(), ConnectorState::Closed);
    }
}
