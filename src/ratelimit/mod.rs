//! Process-local adaptive rate limiting.

mod events;
mod limiter;
mod metrics;
mod permission;
mod strategy;
mod window;

pub use events::{EventBus, EventKind, ListenerId, RateLimitEvent, RateLimitListener};
pub use limiter::{backoff_delay, AdaptiveRateLimiter, LimiterStatus, QuotaTracker};
pub use metrics::{AdaptiveMetrics, EMA_ALPHA};
pub use permission::{ApiErrorKind, DenyReason, Permission, RequestTicket};
pub use strategy::{ProcessingStrategy, RateLimitConfig};
pub use window::{RequestRecord, SlidingWindow};
