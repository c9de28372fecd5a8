use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::{Instant, SystemTime, UNIX_EPOCH};

use serde::Serialize;

const DEFAULT_HISTORY_SIZE: usize = 32;
const MAX_MESSAGE_LEN: usize = 512;

/// Pool-wide counters, shared by the event-loop side and every worker.
#[derive(Clone)]
pub struct PoolMetrics {
    inner: Arc<MetricsInner>,
}

struct MetricsInner {
    started_at: Instant,
    started_at_ms: u64,
    history_size: usize,
    dispatched: AtomicU64,
    succeeded: AtomicU64,
    failed: AtomicU64,
    panicked: AtomicU64,
    rollbacks: AtomicU64,
    rollback_failures: AtomicU64,
    reconnects: AtomicU64,
    connections_opened: AtomicU64,
    connections_closed: AtomicU64,
    in_flight: AtomicU64,
    recent_errors: RwLock<VecDeque<ErrorEvent>>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ErrorEvent {
    pub timestamp_ms: u64,
    pub message: String,
    pub context: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    pub started_at_ms: u64,
    pub uptime_ms: u64,
    pub dispatched: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub panicked: u64,
    pub rollbacks: u64,
    pub rollback_failures: u64,
    pub reconnects: u64,
    pub connections_opened: u64,
    pub connections_closed: u64,
    pub in_flight: u64,
    pub recent_errors: Vec<ErrorEvent>,
}

/// Decrements the in-flight gauge when the task finishes, however it ends.
pub struct InFlightGuard {
    inner: Arc<MetricsInner>,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.inner.in_flight.fetch_sub(1, Ordering::Relaxed);
    }
}

impl PoolMetrics {
    pub fn new(history_size: usize) -> Self {
        let history_size = if history_size == 0 {
            DEFAULT_HISTORY_SIZE
        } else {
            history_size
        };
        Self {
            inner: Arc::new(MetricsInner {
                started_at: Instant::now(),
                started_at_ms: now_millis(),
                history_size,
                dispatched: AtomicU64::new(0),
                succeeded: AtomicU64::new(0),
                failed: AtomicU64::new(0),
                panicked: AtomicU64::new(0),
                rollbacks: AtomicU64::new(0),
                rollback_failures: AtomicU64::new(0),
                reconnects: AtomicU64::new(0),
                connections_opened: AtomicU64::new(0),
                connections_closed: AtomicU64::new(0),
                in_flight: AtomicU64::new(0),
                recent_errors: RwLock::new(VecDeque::with_capacity(history_size)),
            }),
        }
    }

    pub fn start_task(&self) -> InFlightGuard {
        self.inner.dispatched.fetch_add(1, Ordering::Relaxed);
        self.inner.in_flight.fetch_add(1, Ordering::Relaxed);
        InFlightGuard {
            inner: self.inner.clone(),
        }
    }

    pub fn record_success(&self) {
        self.inner.succeeded.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_failure(&self, context: &str, message: String) {
        self.inner.failed.fetch_add(1, Ordering::Relaxed);
        self.push_error(context, message);
    }

    pub fn record_panic(&self, context: &str, message: String) {
        self.inner.panicked.fetch_add(1, Ordering::Relaxed);
        self.push_error(context, message);
    }

    pub fn record_rollback(&self) {
        self.inner.rollbacks.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_rollback_failure(&self, message: String) {
        self.inner.rollback_failures.fetch_add(1, Ordering::Relaxed);
        self.push_error("rollback", message);
    }

    pub fn record_reconnect(&self) {
        self.inner.reconnects.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_connection_opened(&self) {
        self.inner.connections_opened.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_connection_closed(&self) {
        self.inner.connections_closed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let inner = &self.inner;
        let recent_errors = match inner.recent_errors.read() {
            Ok(errors) => errors.iter().cloned().collect(),
            Err(poisoned) => poisoned.into_inner().iter().cloned().collect(),
        };
        MetricsSnapshot {
            started_at_ms: inner.started_at_ms,
            uptime_ms: inner.started_at.elapsed().as_millis() as u64,
            dispatched: inner.dispatched.load(Ordering::Relaxed),
            succeeded: inner.succeeded.load(Ordering::Relaxed),
            failed: inner.failed.load(Ordering::Relaxed),
            panicked: inner.panicked.load(Ordering::Relaxed),
            rollbacks: inner.rollbacks.load(Ordering::Relaxed),
            rollback_failures: inner.rollback_failures.load(Ordering::Relaxed),
            reconnects: inner.reconnects.load(Ordering::Relaxed),
            connections_opened: inner.connections_opened.load(Ordering::Relaxed),
            connections_closed: inner.connections_closed.load(Ordering::Relaxed),
            in_flight: inner.in_flight.load(Ordering::Relaxed),
            recent_errors,
        }
    }

    fn push_error(&self, context: &str, message: String) {
        let event = ErrorEvent {
            timestamp_ms: now_millis(),
            message: truncate(message),
            context: context.to_string(),
        };
        let mut errors = match self.inner.recent_errors.write() {
            Ok(errors) => errors,
            Err(poisoned) => poisoned.into_inner(),
        };
        if errors.len() == self.inner.history_size {
            errors.pop_front();
        }
        errors.push_back(event);
    }
}

impl Default for PoolMetrics {
    fn default() -> Self {
        Self::new(DEFAULT_HISTORY_SIZE)
    }
}

fn truncate(mut message: String) -> String {
    if message.len() > MAX_MESSAGE_LEN {
        let mut cut = MAX_MESSAGE_LEN;
        while !message.is_char_boundary(cut) {
            cut -= 1;
        }
        message.truncate(cut);
        message.push_str("...");
    }
    message
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn in_flight_gauge_follows_guards() {
        let metrics = PoolMetrics::default();
        let first = metrics.start_task();
        let second = metrics.start_task();
        assert_eq!(metrics.snapshot().in_flight, 2);
        drop(first);
        drop(second);
        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.in_flight, 0);
        assert_eq!(snapshot.dispatched, 2);
    }

    #[test]
    fn error_history_is_bounded() {
        let metrics = PoolMetrics::new(2);
        metrics.record_failure("execute", "first".to_string());
        metrics.record_failure("execute", "second".to_string());
        metrics.record_rollback_failure("third".to_string());

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.failed, 2);
        assert_eq!(snapshot.rollback_failures, 1);
        let messages: Vec<_> = snapshot
            .recent_errors
            .iter()
            .map(|e| e.message.as_str())
            .collect();
        assert_eq!(messages, vec!["second", "third"]);
        assert_eq!(snapshot.recent_errors[1].context, "rollback");
    }

    #[test]
    fn long_messages_are_truncated_on_a_char_boundary() {
        let message = "é".repeat(MAX_MESSAGE_LEN);
        let truncated = truncate(message);
        assert!(truncated.ends_with("..."));
        assert!(truncated.len() <= MAX_MESSAGE_LEN + 3);
    }

    #[test]
    fn snapshot_serializes_to_json() {
        let metrics = PoolMetrics::default();
        metrics.record_connection_opened();
        let json = serde_json::to_value(metrics.snapshot()).unwrap();
        assert_eq!(json["connections_opened"], 1);
        assert_eq!(json["recent_errors"], serde_json::json!([]));
    }
}
