//! Structured events emitted while requests move through the governor and retry policy.
//!
//! Every decision point emits a [`ClientEvent`] into the client's [`EventSink`]. The default
//! [`LogSink`] forwards events to `tracing`; [`MemorySink`] keeps them for assertions.
//!
//! ```rust
//! use apiguard::telemetry::{ClientEvent, EventSink, MemorySink};
//!
//! let sink = MemorySink::new();
//! sink.record(&ClientEvent::Deduplicated { endpoint: "/api/customers".into() });
//! assert_eq!(sink.len(), 1);
//! ```

use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// How a logical call ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallOutcome {
    Success,
    Failure,
    /// The consumer went away or the call was aborted.
    Abandoned,
}

/// Events emitted by the client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientEvent {
    /// A physical attempt was admitted and is about to hit the transport.
    AttemptStarted { endpoint: String, attempt: usize },
    /// The first attempt hit the throttle window and will wait it out.
    ThrottleWait { endpoint: String, wait: Duration },
    /// The concurrency ceiling was reached; the attempt waits for a slot.
    SlotWait { endpoint: String, active: usize, limit: usize },
    /// A caller attached to an identical call already in flight.
    Deduplicated { endpoint: String },
    /// A retryable failure; the next attempt runs after `delay`.
    RetryScheduled { endpoint: String, attempt: usize, delay: Duration, error: String },
    /// Retries ran out.
    RetryExhausted { endpoint: String, attempts: usize },
    /// The logical call settled.
    Settled { endpoint: String, attempts: usize, outcome: CallOutcome },
}

impl fmt::Display for ClientEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ClientEvent::AttemptStarted { endpoint, attempt } => {
                write!(f, "attempt {} started: {}", attempt, endpoint)
            }
            ClientEvent::ThrottleWait { endpoint, wait } => {
                write!(f, "throttled {} for {:?}", endpoint, wait)
            }
            ClientEvent::SlotWait { endpoint, active, limit } => {
                write!(f, "waiting for slot ({}/{} active): {}", active, limit, endpoint)
            }
            ClientEvent::Deduplicated { endpoint } => write!(f, "joined in-flight call: {}", endpoint),
            ClientEvent::RetryScheduled { endpoint, attempt, delay, error } => {
                write!(f, "attempt {} failed ({}), retrying {} in {:?}", attempt, error, endpoint, delay)
            }
            ClientEvent::RetryExhausted { endpoint, attempts } => {
                write!(f, "retry exhausted after {} attempts: {}", attempts, endpoint)
            }
            ClientEvent::Settled { endpoint, attempts, outcome } => {
                write!(f, "{} settled {:?} after {} attempts", endpoint, outcome, attempts)
            }
        }
    }
}

/// Consumer of client events. Must not block.
pub trait EventSink: Send + Sync + fmt::Debug {
    fn record(&self, event: &ClientEvent);
}

/// Discards everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullSink;

impl EventSink for NullSink {
    fn record(&self, _event: &ClientEvent) {}
}

/// Forwards events to `tracing`, picking the level by how interesting the event is.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogSink;

impl EventSink for LogSink {
    fn record(&self, event: &ClientEvent) {
        match event {
            ClientEvent::RetryScheduled { .. } | ClientEvent::RetryExhausted { .. } => {
                tracing::warn!(event = %event, "client_event");
            }
            ClientEvent::Settled { outcome: CallOutcome::Failure, .. } => {
                tracing::info!(event = %event, "client_event");
            }
            _ => tracing::debug!(event = %event, "client_event"),
        }
    }
}

/// Keeps every event in memory.
#[derive(Debug, Clone, Default)]
pub struct MemorySink {
    events: Arc<Mutex<Vec<ClientEvent>>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of all recorded events.
    pub fn events(&self) -> Vec<ClientEvent> {
        self.events.lock().map(|e| e.clone()).unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.events.lock().map(|e| e.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of recorded events matching `pred`.
    pub fn count(&self, pred: impl Fn(&ClientEvent) -> bool) -> usize {
        self.events.lock().map(|e| e.iter().filter(|ev| pred(ev)).count()).unwrap_or(0)
    }

    pub fn clear(&self) {
        if let Ok(mut events) = self.events.lock() {
            events.clear();
        }
    }
}

impl EventSink for MemorySink {
    fn record(&self, event: &ClientEvent) {
        if let Ok(mut events) = self.events.lock() {
            events.push(event.clone());
        }
    }
}
