//! Durable, encrypted per-user OAuth credentials.
//!
//! ```text
//! ┌─────────────────────────────────────────┐
//! │       CredentialStore                    │
//! │  - get / upsert / delete by user_id      │
//! │  - conditional replace for refreshes     │
//! └─────────────────────────────────────────┘
//!          ↓ seal                ↑ open
//! ┌─────────────────────────────────────────┐
//! │       TokenCipher (AES-256-GCM)          │
//! └─────────────────────────────────────────┘
//!          ↓                    ↑
//! ┌─────────────────────────────────────────┐
//! │       SQLite (one row per user_id)       │
//! └─────────────────────────────────────────┘
//! ```
//!
//! # Usage
//!
//! ```no_run
//! use sheetgate::credentials::{CredentialRecord, CredentialStore};
//! use chrono::{Duration, Utc};
//!
//! # fn main() -> anyhow::Result<()> {
//! let key = std::env::var("SHEETGATE_ENCRYPTION_KEY")?;
//! let store = CredentialStore::new("credentials.db", &key)?;
//!
//! store.upsert(&CredentialRecord {
//!     user_id: "xyz".to_string(),
//!     access_token: "ya29.a0".to_string(),
//!     refresh_token: "1//0g".to_string(),
//!     expires_at: Utc::now() + Duration::hours(1),
//!     scope: "https://www.googleapis.com/auth/spreadsheets".to_string(),
//! })?;
//!
//! if let Some(record) = store.get("xyz")? {
//!     println!("expires at {}", record.expires_at);
//! }
//! # Ok(())
//! # }
//! ```

use chrono::{DateTime, Duration, Utc};
use std::fmt;

mod encryption;
mod storage;

pub use encryption::{decode_key, Sealed, TokenCipher};
pub use storage::CredentialStore;

/// The stored token set for one caller identifier.
///
/// There is at most one record per `user_id`; writes replace it in place.
#[derive(Clone, PartialEq, Eq)]
pub struct CredentialRecord {
    /// Caller-chosen opaque identifier (primary key)
    pub user_id: String,

    /// Short-lived bearer token
    pub access_token: String,

    /// Long-lived token used to mint new access tokens
    pub refresh_token: String,

    /// Instant after which `access_token` must not be served
    pub expires_at: DateTime<Utc>,

    /// Space-separated scopes granted at issuance
    pub scope: String,
}

impl CredentialRecord {
    /// True when the access token can still be handed out, keeping
    /// `safety_margin` in reserve before the real expiry.
    pub fn is_fresh(&self, now: DateTime<Utc>, safety_margin: Duration) -> bool {
        now < self.expires_at - safety_margin
    }
}

// Token material stays out of logs.
impl fmt::Debug for CredentialRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CredentialRecord")
            .field("user_id", &self.user_id)
            .field("access_token", &"<redacted>")
            .field("refresh_token", &"<redacted>")
            .field("expires_at", &self.expires_at)
            .field("scope", &self.scope)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(expires_at: DateTime<Utc>) -> CredentialRecord {
        CredentialRecord {
            user_id: "u1".to_string(),
            access_token: "access-secret".to_string(),
            refresh_token: "refresh-secret".to_string(),
            expires_at,
            scope: "s".to_string(),
        }
    }

    #[test]
    fn test_freshness_respects_margin() {
        let now = Utc::now();
        let margin = Duration::seconds(90);

        assert!(record(now + Duration::hours(1)).is_fresh(now, margin));
        assert!(!record(now + Duration::seconds(60)).is_fresh(now, margin));
        assert!(!record(now - Duration::seconds(1)).is_fresh(now, margin));
        assert!(!record(now + margin).is_fresh(now, margin));
    }

    #[test]
    fn test_debug_redacts_tokens() {
        let output = format!("{:?}", record(Utc::now()));
        assert!(output.contains("u1"));
        assert!(!output.contains("access-secret"));
        assert!(!output.contains("refresh-secret"));
    }
}
