//! Durable, cross-process quota ledger.

mod cache;
mod key;
mod store;
mod tracker;

pub use cache::TtlCache;
pub use key::{QuotaKey, QuotaType};
pub use store::{InMemoryQuotaStore, QuotaStore, QuotaUsage};
pub use tracker::{QuotaStatistics, QuotaTrackingService, DEFAULT_CACHE_TTL};
