//! Ledger row identity.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::clock::minute_floor;
use crate::error::QuotaGateError;

/// Which provider quota a ledger row counts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QuotaType {
    Requests,
    Tokens,
}

impl QuotaType {
    pub fn as_str(&self) -> &'static str {
        match self {
            QuotaType::Requests => "requests",
            QuotaType::Tokens => "tokens",
        }
    }
}

impl fmt::Display for QuotaType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for QuotaType {
    type Err = QuotaGateError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "requests" => Ok(QuotaType::Requests),
            "tokens" => Ok(QuotaType::Tokens),
            other => Err(QuotaGateError::InvalidInput(format!(
                "unknown quota type '{}'",
                other
            ))),
        }
    }
}

/// Key of one ledger row: provider, quota type and minute window.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct QuotaKey {
    pub api_provider: String,
    pub quota_type: QuotaType,
    /// Start of the minute window
    pub time_window: DateTime<Utc>,
}

impl QuotaKey {
    /// Key for the window containing `at`. The window is always floored to the minute.
    pub fn new(api_provider: &str, quota_type: QuotaType, at: DateTime<Utc>) -> Self {
        Self {
            api_provider: api_provider.to_string(),
            quota_type,
            time_window: minute_floor(at),
        }
    }
}

impl fmt::Display for QuotaKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}|{}|{}",
            self.api_provider,
            self.quota_type,
            self.time_window.timestamp()
        )
    }
}
