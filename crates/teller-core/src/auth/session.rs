use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::CredentialMaterial;

/// Minimal identity data cached for display. Not authoritative.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "ts", derive(ts_rs::TS), ts(export))]
pub struct UserProfile {
    pub id: String,
    pub display_name: String,
}

impl UserProfile {
    pub fn new(id: impl Into<String>, display_name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            display_name: display_name.into(),
        }
    }

    /// Extract a profile from a backend-owned user object.
    ///
    /// The id may be `id` or `_id`, string or number. The display name is
    /// the first of `name`, `displayName`, `username`, `email`, falling back
    /// to the id.
    pub fn from_json(value: &Value) -> Option<Self> {
        let id = ["id", "_id"].iter().find_map(|key| match value.get(key)? {
            Value::String(s) if !s.is_empty() => Some(s.clone()),
            Value::Number(n) => Some(n.to_string()),
            _ => None,
        })?;

        let display_name = ["name", "displayName", "username", "email"]
            .iter()
            .find_map(|key| {
                value
                    .get(key)
                    .and_then(Value::as_str)
                    .filter(|s| !s.trim().is_empty())
                    .map(str::to_string)
            })
            .unwrap_or_else(|| id.clone());

        Some(Self { id, display_name })
    }
}

/// The authenticated-state record held for the life of the process.
#[derive(Debug, Clone, PartialEq)]
pub struct Session {
    pub credential: CredentialMaterial,
    pub profile: Option<UserProfile>,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl Session {
    pub fn new(
        credential: CredentialMaterial,
        profile: Option<UserProfile>,
        created_at: DateTime<Utc>,
        lifetime: Duration,
    ) -> Self {
        Self {
            credential,
            profile,
            created_at,
            expires_at: created_at
                .checked_add_signed(lifetime)
                .unwrap_or(DateTime::<Utc>::MAX_UTC),
        }
    }

    /// Wall-clock check. The store itself never calls this on reads;
    /// expiry is driven by its timer.
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }

    pub fn time_until_expiry(&self, now: DateTime<Utc>) -> Duration {
        (self.expires_at - now).max(Duration::zero())
    }

    /// Get minutes remaining until expiry (for display)
    pub fn minutes_until_expiry(&self, now: DateTime<Utc>) -> i64 {
        self.time_until_expiry(now).num_minutes()
    }
}
