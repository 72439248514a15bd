//! Rate limiter event publication.
//!
//! Events reach two kinds of consumers: registered [`RateLimitListener`]s,
//! called synchronously and isolated from each other, and broadcast
//! subscribers that receive events over a `tokio` channel.

use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;
use tracing::warn;

use super::permission::{ApiErrorKind, DenyReason};

/// Capacity of the broadcast channel; slow subscribers lag past this.
const BROADCAST_CAPACITY: usize = 1024;

/// What happened.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    PermissionGranted,
    PermissionDenied,
    Success,
    Error,
    BackoffApplied,
}

/// A single observable limiter event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RateLimitEvent {
    #[serde(rename = "type")]
    pub kind: EventKind,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tokens: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delay_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_type: Option<ApiErrorKind>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<DenyReason>,
}

impl RateLimitEvent {
    pub fn new(kind: EventKind, timestamp: DateTime<Utc>) -> Self {
        Self {
            kind,
            timestamp,
            tokens: None,
            delay_ms: None,
            error_type: None,
            reason: None,
        }
    }

    pub fn with_tokens(mut self, tokens: u64) -> Self {
        self.tokens = Some(tokens);
        self
    }

    pub fn with_delay(mut self, delay_ms: u64) -> Self {
        self.delay_ms = Some(delay_ms);
        self
    }

    pub fn with_error(mut self, error_type: ApiErrorKind) -> Self {
        self.error_type = Some(error_type);
        self
    }

    pub fn with_reason(mut self, reason: DenyReason) -> Self {
        self.reason = Some(reason);
        self
    }
}

/// Synchronous event callback.
///
/// Errors and panics raised by one listener are logged and do not reach the
/// limiter or the other listeners.
pub trait RateLimitListener: Send + Sync {
    fn on_event(&self, event: &RateLimitEvent) -> anyhow::Result<()>;
}

impl<F> RateLimitListener for F
where
    F: Fn(&RateLimitEvent) -> anyhow::Result<()> + Send + Sync,
{
    fn on_event(&self, event: &RateLimitEvent) -> anyhow::Result<()> {
        self(event)
    }
}

/// Handle returned by [`EventBus::add_listener`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

/// Fan-out point for limiter events.
pub struct EventBus {
    listeners: RwLock<Vec<(ListenerId, Arc<dyn RateLimitListener>)>>,
    sender: broadcast::Sender<RateLimitEvent>,
    next_id: AtomicU64,
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("listeners", &self.listeners.read().len())
            .field("subscribers", &self.sender.receiver_count())
            .finish()
    }
}

impl EventBus {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(BROADCAST_CAPACITY);
        Self {
            listeners: RwLock::new(Vec::new()),
            sender,
            next_id: AtomicU64::new(0),
        }
    }

    /// Register a listener.
    pub fn add_listener(&self, listener: Arc<dyn RateLimitListener>) -> ListenerId {
        let id = ListenerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.listeners.write().push((id, listener));
        id
    }

    /// Unregister a listener. Returns `false` if it was not registered.
    pub fn remove_listener(&self, id: ListenerId) -> bool {
        let mut listeners = self.listeners.write();
        let before = listeners.len();
        listeners.retain(|(existing, _)| *existing != id);
        listeners.len() != before
    }

    pub fn listener_count(&self) -> usize {
        self.listeners.read().len()
    }

    /// Receive events over a broadcast channel.
    pub fn subscribe(&self) -> broadcast::Receiver<RateLimitEvent> {
        self.sender.subscribe()
    }

    /// Receive events as a `Stream`.
    pub fn stream(&self) -> BroadcastStream<RateLimitEvent> {
        BroadcastStream::new(self.sender.subscribe())
    }

    /// Deliver an event to every listener and subscriber.
    pub fn emit(&self, event: RateLimitEvent) {
        // Snapshot so listeners may (un)register from inside a callback
        let listeners: Vec<_> = self.listeners.read().clone();

        for (id, listener) in listeners {
            match panic::catch_unwind(AssertUnwindSafe(|| listener.on_event(&event))) {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    warn!(
                        listener = id.0,
                        kind = ?event.kind,
                        error = %e,
                        "Rate limit listener failed"
                    );
                }
                Err(_) => {
                    warn!(listener = id.0, kind = ?event.kind, "Rate limit listener panicked");
                }
            }
        }

        // No subscribers is not an error
        let _ = self.sender.send(event);
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
