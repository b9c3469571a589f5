use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};

use crate::utils::format_remaining;

/// The unit of session state: bearer token, absolute expiry and subject.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credential {
    pub token: String,
    pub expires_at: DateTime<Utc>,
    pub subject_id: String,
}

impl Credential {
    pub fn new(token: impl Into<String>, expires_at: DateTime<Utc>, subject_id: impl Into<String>) -> Self {
        Self {
            token: token.into(),
            expires_at,
            subject_id: subject_id.into(),
        }
    }

    /// Build a credential from an expiry expressed in epoch milliseconds,
    /// the representation used on the wire and in persisted storage.
    pub fn from_epoch_millis(token: impl Into<String>, expires_at_ms: i64, subject_id: impl Into<String>) -> Option<Self> {
        let expires_at = Utc.timestamp_millis_opt(expires_at_ms).single()?;
        Some(Self::new(token, expires_at, subject_id))
    }

    pub fn expires_at_millis(&self) -> i64 {
        self.expires_at.timestamp_millis()
    }

    pub fn is_expired(&self) -> bool {
        Utc::now() >= self.expires_at
    }

    /// Time left before expiry, zero once expired.
    pub fn remaining(&self) -> Duration {
        (self.expires_at - Utc::now()).to_std().unwrap_or(Duration::ZERO)
    }

    /// Value for the `Authorization` header
    pub fn bearer(&self) -> String {
        format!("Bearer {}", self.token)
    }
}

/// Derived authentication status. Never persisted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthStatus {
    Unauthenticated,
    /// `remaining` is `None` when no expiry signal could be obtained.
    Authenticated { remaining: Option<Duration> },
    /// Resolution failed; the failure was absorbed.
    Unknown,
}

impl AuthStatus {
    pub fn is_authenticated(&self) -> bool {
        matches!(self, AuthStatus::Authenticated { .. })
    }

    /// Short human-readable label used to annotate request logs.
    pub fn label(&self) -> String {
        match self {
            AuthStatus::Unauthenticated => "Not Authenticated".to_string(),
            AuthStatus::Authenticated { remaining: None } => "Authenticated".to_string(),
            AuthStatus::Authenticated { remaining: Some(left) } => {
                format!("Authenticated ({})", format_remaining(*left))
            }
            AuthStatus::Unknown => "Auth Check Failed".to_string(),
        }
    }
}
