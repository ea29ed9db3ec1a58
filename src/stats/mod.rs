//! The `stats` module aggregates relay-wide counters and latency samples.
//!
//! Every component holds an `Arc<RelayStats>` and records into it; readers take a
//! [`StatsSnapshot`]. All state sits behind a
//! single read/write lock so a snapshot is always internally consistent.

use std::collections::VecDeque;
use std::sync::{PoisonError, RwLock, RwLockWriteGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;

/// Capacity of each rolling latency window.
pub const LATENCY_WINDOW: usize = 100;

#[derive(Debug)]
struct Counters {
    messages_published: u64,
    messages_received: u64,
    publish_failures: u64,
    active_subscriptions: u64,
    connection_attempts: u64,
    connection_failures: u64,
    connection_successes: u64,
    disconnections: u64,
    api_requests: u64,
    api_errors: u64,
    webhook_deliveries: u64,
    webhook_failures: u64,
    publish_latency: VecDeque<Duration>,
    subscribe_latency: VecDeque<Duration>,
    last_updated: DateTime<Utc>,
}

impl Default for Counters {
    fn default() -> Self {
        Self {
            messages_published: 0,
            messages_received: 0,
            publish_failures: 0,
            active_subscriptions: 0,
            connection_attempts: 0,
            connection_failures: 0,
            connection_successes: 0,
            disconnections: 0,
            api_requests: 0,
            api_errors: 0,
            webhook_deliveries: 0,
            webhook_failures: 0,
            publish_latency: VecDeque::with_capacity(LATENCY_WINDOW),
            subscribe_latency: VecDeque::with_capacity(LATENCY_WINDOW),
            last_updated: Utc::now(),
        }
    }
}

/// Point-in-time copy of the aggregated counters.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StatsSnapshot {
    pub messages_published: u64,
    pub messages_received: u64,
    pub publish_failures: u64,
    pub active_subscriptions: u64,
    pub connection_attempts: u64,
    pub connection_failures: u64,
    pub connection_successes: u64,
    pub disconnections: u64,
    pub api_requests: u64,
    pub api_errors: u64,
    pub webhook_deliveries: u64,
    pub webhook_failures: u64,
    pub avg_publish_latency_ms: f64,
    pub avg_subscribe_latency_ms: f64,
    pub publish_latency_samples: usize,
    pub subscribe_latency_samples: usize,
    pub last_updated: DateTime<Utc>,
}

/// Thread-safe status aggregator.
#[derive(Debug, Default)]
pub struct RelayStats {
    inner: RwLock<Counters>,
}

fn push_sample(window: &mut VecDeque<Duration>, sample: Duration) {
    if window.len() == LATENCY_WINDOW {
        window.pop_front();
    }
    window.push_back(sample);
}

fn average_ms(window: &VecDeque<Duration>) -> f64 {
    if window.is_empty() {
        return 0.0;
    }
    let total: Duration = window.iter().sum();
    total.as_secs_f64() * 1000.0 / window.len() as f64
}

impl RelayStats {
    pub fn new() -> Self {
        Self::default()
    }

    // A panic while holding the lock leaves plain counters behind, which are
    // still safe to read and update.
    fn update(&self, apply: impl FnOnce(&mut Counters)) {
        let mut guard: RwLockWriteGuard<'_, Counters> =
            self.inner.write().unwrap_or_else(PoisonError::into_inner);
        apply(&mut guard);
        guard.last_updated = Utc::now();
    }

    pub fn increment_published(&self) {
        self.update(|c| c.messages_published += 1);
    }

    pub fn increment_received(&self) {
        self.update(|c| c.messages_received += 1);
    }

    pub fn increment_publish_failures(&self) {
        self.update(|c| c.publish_failures += 1);
    }

    pub fn increment_subscriptions(&self) {
        self.update(|c| c.active_subscriptions += 1);
    }

    /// Saturates at zero.
    pub fn decrement_subscriptions(&self) {
        self.update(|c| c.active_subscriptions = c.active_subscriptions.saturating_sub(1));
    }

    pub fn increment_connection_attempts(&self) {
        self.update(|c| c.connection_attempts += 1);
    }

    pub fn increment_connection_failures(&self) {
        self.update(|c| c.connection_failures += 1);
    }

    pub fn increment_connection_successes(&self) {
        self.update(|c| c.connection_successes += 1);
    }

    pub fn increment_disconnections(&self) {
        self.update(|c| c.disconnections += 1);
    }

    pub fn increment_api_requests(&self) {
        self.update(|c| c.api_requests += 1);
    }

    pub fn increment_api_errors(&self) {
        self.update(|c| c.api_errors += 1);
    }

    pub fn increment_webhook_deliveries(&self) {
        self.update(|c| c.webhook_deliveries += 1);
    }

    /// A delivery that exhausted its retries.
    pub fn increment_webhook_failures(&self) {
        self.update(|c| c.webhook_failures += 1);
    }

    pub fn record_publish_latency(&self, latency: Duration) {
        self.update(|c| push_sample(&mut c.publish_latency, latency));
    }

    pub fn record_subscribe_latency(&self, latency: Duration) {
        self.update(|c| push_sample(&mut c.subscribe_latency, latency));
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        let c = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        StatsSnapshot {
            messages_published: c.messages_published,
            messages_received: c.messages_received,
            publish_failures: c.publish_failures,
            active_subscriptions: c.active_subscriptions,
            connection_attempts: c.connection_attempts,
            connection_failures: c.connection_failures,
            connection_successes: c.connection_successes,
            disconnections: c.disconnections,
            api_requests: c.api_requests,
            api_errors: c.api_errors,
            webhook_deliveries: c.webhook_deliveries,
            webhook_failures: c.webhook_failures,
            avg_publish_latency_ms: average_ms(&c.publish_latency),
            avg_subscribe_latency_ms: average_ms(&c.subscribe_latency),
            publish_latency_samples: c.publish_latency.len(),
            subscribe_latency_samples: c.subscribe_latency.len(),
            last_updated: c.last_updated,
        }
    }

    /// Zeroes every counter and empties both latency windows.
    pub fn reset(&self) {
        let mut guard = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        *guard = Counters::default();
    }
}
