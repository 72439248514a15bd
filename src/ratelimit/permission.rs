//! Admission decisions and outcome classification.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::QuotaGateError;

/// Handle identifying one admitted request inside the limiter that admitted it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RequestTicket(pub u64);

/// Why a permission was denied.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DenyReason {
    /// A rate-limit error put the limiter into backoff
    BackoffPeriod,
    /// Too many requests in flight
    ConcurrentLimit,
    /// Request ceiling for the trailing minute reached
    RequestsLimit,
    /// Token ceiling for the trailing minute would be exceeded
    TokensLimit,
    /// Requests arriving faster than pacing allows, burst allowance used up
    BurstLimit,
    /// The shared ledger flags the request quota for this window
    PersistentRequestsLimit,
    /// The shared ledger flags the token quota for this window
    PersistentTokensLimit,
    /// No requests left in the shared ledger for this window
    PersistentRequestsExhausted,
    /// Not enough tokens left in the shared ledger for this window
    PersistentTokensExhausted,
}

impl DenyReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            DenyReason::BackoffPeriod => "backoff_period",
            DenyReason::ConcurrentLimit => "concurrent_limit",
            DenyReason::RequestsLimit => "requests_limit",
            DenyReason::TokensLimit => "tokens_limit",
            DenyReason::BurstLimit => "burst_limit",
            DenyReason::PersistentRequestsLimit => "persistent_requests_limit",
            DenyReason::PersistentTokensLimit => "persistent_tokens_limit",
            DenyReason::PersistentRequestsExhausted => "persistent_requests_exhausted",
            DenyReason::PersistentTokensExhausted => "persistent_tokens_exhausted",
        }
    }

    /// Whether the denial came from the shared ledger rather than the local limiter.
    pub fn is_persistent(&self) -> bool {
        matches!(
            self,
            DenyReason::PersistentRequestsLimit
                | DenyReason::PersistentTokensLimit
                | DenyReason::PersistentRequestsExhausted
                | DenyReason::PersistentTokensExhausted
        )
    }
}

impl fmt::Display for DenyReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of asking for permission to call the provider.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Permission {
    pub allowed: bool,
    /// How long to wait before asking again; 0 when allowed
    pub delay_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<DenyReason>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ticket: Option<RequestTicket>,
}

impl Permission {
    /// A granted permission.
    pub fn granted(ticket: RequestTicket) -> Self {
        Self {
            allowed: true,
            delay_ms: 0,
            reason: None,
            ticket: Some(ticket),
        }
    }

    /// A denial with a retry hint.
    pub fn denied(reason: DenyReason, delay_ms: u64) -> Self {
        Self {
            allowed: false,
            delay_ms,
            reason: Some(reason),
            ticket: None,
        }
    }
}

/// Classification of a failed provider call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApiErrorKind {
    /// Provider-side throttling (HTTP 429 and friends)
    RateLimit,
    Timeout,
    ServerError,
}

impl ApiErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ApiErrorKind::RateLimit => "rate_limit",
            ApiErrorKind::Timeout => "timeout",
            ApiErrorKind::ServerError => "server_error",
        }
    }
}

impl fmt::Display for ApiErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ApiErrorKind {
    type Err = QuotaGateError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "rate_limit" => Ok(ApiErrorKind::RateLimit),
            "timeout" => Ok(ApiErrorKind::Timeout),
            "server_error" => Ok(ApiErrorKind::ServerError),
            other => Err(QuotaGateError::InvalidInput(format!(
                "unknown error type '{}'",
                other
            ))),
        }
    }
}
