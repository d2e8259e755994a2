//! Short-lived Copilot access token (the upstream "artifact").

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Token returned by `copilot_internal/v2/token`.
///
/// Immutable once issued: a refresh produces a new value that replaces the old
/// one in the cache. GitHub sends more fields (`refresh_in`, feature flags, ...);
/// only the two the broker relies on are kept.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CopilotToken {
    pub token: String,
    /// Unix seconds.
    pub expires_at: i64,
}

impl CopilotToken {
    pub fn new(token: impl Into<String>, expires_at: DateTime<Utc>) -> Self {
        Self {
            token: token.into(),
            expires_at: expires_at.timestamp(),
        }
    }

    /// Expiry as an instant. An out-of-range timestamp reads as already expired.
    pub fn expiry(&self) -> DateTime<Utc> {
        DateTime::from_timestamp(self.expires_at, 0).unwrap_or(DateTime::<Utc>::MIN_UTC)
    }

    /// Instant from which the token must no longer be handed out.
    pub fn evict_at(&self, margin: chrono::Duration) -> DateTime<Utc> {
        self.expiry()
            .checked_sub_signed(margin)
            .unwrap_or(DateTime::<Utc>::MIN_UTC)
    }

    /// True while the remaining lifetime is strictly greater than `margin`.
    pub fn is_usable_at(&self, now: DateTime<Utc>, margin: chrono::Duration) -> bool {
        now < self.evict_at(margin)
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now >= self.expiry()
    }
}

/// Shortens a secret for log output: `ghu_…f3a9`.
pub fn mask(secret: &str) -> String {
    let chars: Vec<char> = secret.chars().collect();
    if chars.len() > 8 {
        let head: String = chars[..4].iter().collect();
        let tail: String = chars[chars.len() - 4..].iter().collect();
        format!("{}…{}", head, tail)
    } else {
        "****".to_string()
    }
}
