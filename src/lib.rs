//! Quotagate - adaptive rate limiting for rate-limited AI providers
//!
//! This crate gates outbound calls to a third-party AI provider during bulk
//! document processing. A process-local [`AdaptiveRateLimiter`] makes fast
//! admission decisions, a [`QuotaTrackingService`] keeps a durable per-minute
//! ledger shared by every worker using the same provider account, and the
//! [`RateLimitingManager`] composes both behind one API.
//!
//! [`AdaptiveRateLimiter`]: ratelimit::AdaptiveRateLimiter
//! [`QuotaTrackingService`]: quota::QuotaTrackingService
//! [`RateLimitingManager`]: manager::RateLimitingManager

pub mod clock;
pub mod config;
pub mod error;
pub mod manager;
pub mod quota;
pub mod ratelimit;
