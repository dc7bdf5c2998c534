//! Signed, short-lived `state` values binding a callback to a user identifier.
//!
//! A state is `base64url(payload).base64url(hmac)`. The payload names the
//! user, a random nonce and the issue time. Nothing is stored at issue time;
//! on the callback the signature and age are checked and the nonce is
//! recorded so the same state cannot be redeemed twice.

use base64::{engine::general_purpose::URL_SAFE_NO_PAD as B64URL, Engine};
use chrono::{DateTime, Duration, TimeZone, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use hmac::{Hmac, Mac};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use std::sync::Arc;
use thiserror::Error;
use uuid::Uuid;

type HmacSha256 = Hmac<Sha256>;

/// Tolerated clock drift for states that claim to be from the future.
const MAX_FUTURE_SKEW_SECONDS: i64 = 30;

#[derive(Serialize, Deserialize)]
struct StatePayload {
    #[serde(rename = "u")]
    user_id: String,
    #[serde(rename = "n")]
    nonce: String,
    #[serde(rename = "t")]
    issued_at: i64,
}

/// Why a state was refused.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum StateError {
    #[error("state parameter is malformed")]
    Malformed,
    #[error("state signature does not match")]
    BadSignature,
    #[error("state has expired")]
    Expired,
    #[error("state was already used")]
    Replayed,
}

/// Issues and verifies OAuth `state` values.
#[derive(Clone)]
pub struct StateManager {
    key: Arc<Vec<u8>>,
    /// Redeemed nonces and when they stop mattering
    consumed: Arc<DashMap<String, DateTime<Utc>>>,
    expiry_duration: Duration,
}

impl StateManager {
    /// Create a manager signing with `key`.
    ///
    /// # Arguments
    /// * `key` - HMAC key; any length, 32+ random bytes recommended
    /// * `expiry_seconds` - How long states remain valid (default: 600 = 10 minutes)
    pub fn new(key: &[u8], expiry_seconds: i64) -> Self {
        Self {
            key: Arc::new(key.to_vec()),
            consumed: Arc::new(DashMap::new()),
            expiry_duration: Duration::seconds(expiry_seconds),
        }
    }

    /// Create a manager with a random per-process key.
    pub fn with_random_key(expiry_seconds: i64) -> Self {
        let mut key = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut key);
        Self::new(&key, expiry_seconds)
    }

    /// Issue a state for `user_id`.
    pub fn issue(&self, user_id: &str) -> String {
        self.issue_at(user_id, Utc::now())
    }

    pub(crate) fn issue_at(&self, user_id: &str, issued_at: DateTime<Utc>) -> String {
        let payload = StatePayload {
            user_id: user_id.to_string(),
            nonce: Uuid::new_v4().simple().to_string(),
            issued_at: issued_at.timestamp(),
        };
        // Serializing a struct of strings and integers cannot fail
        let json = serde_json::to_vec(&payload).unwrap_or_default();
        let encoded = B64URL.encode(json);
        let signature = B64URL.encode(self.sign(encoded.as_bytes()));
        format!("{}.{}", encoded, signature)
    }

    /// Verify a state and mark it used.
    ///
    /// Returns the user identifier it was issued for.
    pub fn verify_and_consume(&self, state: &str) -> Result<String, StateError> {
        let (encoded, signature) = state.split_once('.').ok_or(StateError::Malformed)?;
        let signature = B64URL
            .decode(signature)
            .map_err(|_| StateError::Malformed)?;

        let mut mac = self.mac();
        mac.update(encoded.as_bytes());
        mac.verify_slice(&signature)
            .map_err(|_| StateError::BadSignature)?;

        let json = B64URL.decode(encoded).map_err(|_| StateError::Malformed)?;
        let payload: StatePayload =
            serde_json::from_slice(&json).map_err(|_| StateError::Malformed)?;

        let issued_at = Utc
            .timestamp_opt(payload.issued_at, 0)
            .single()
            .ok_or(StateError::Malformed)?;
        let now = Utc::now();
        if now - issued_at > self.expiry_duration
            || issued_at - now > Duration::seconds(MAX_FUTURE_SKEW_SECONDS)
        {
            return Err(StateError::Expired);
        }

        // Single-use
        match self.consumed.entry(payload.nonce) {
            Entry::Occupied(_) => Err(StateError::Replayed),
            Entry::Vacant(slot) => {
                slot.insert(issued_at + self.expiry_duration);
                Ok(payload.user_id)
            }
        }
    }

    /// Forget consumed nonces whose states have expired anyway.
    pub fn cleanup_expired(&self) {
        self.cleanup_expired_at(Utc::now());
    }

    fn cleanup_expired_at(&self, now: DateTime<Utc>) {
        self.consumed.retain(|_, expires_at| *expires_at >= now);
    }

    /// Number of remembered consumed states (for debugging/monitoring)
    pub fn count(&self) -> usize {
        self.consumed.len()
    }

    fn mac(&self) -> HmacSha256 {
        HmacSha256::new_from_slice(&self.key).expect("HMAC can take key of any size")
    }

    fn sign(&self, data: &[u8]) -> Vec<u8> {
        let mut mac = self.mac();
        mac.update(data);
        mac.finalize().into_bytes().to_vec()
    }
}

/// Background task to periodically prune consumed states
pub async fn run_state_cleanup(manager: StateManager, interval_seconds: u64) {
    let mut interval = tokio::time::interval(cleanup_period(interval_seconds));

    loop {
        interval.tick().await;
        manager.cleanup_expired();
        tracing::debug!(
            "OAuth state cleanup complete, {} consumed states remembered",
            manager.count()
        );
    }
}

/// Cleanup period; never zero, which `tokio::time::interval` rejects.
fn cleanup_period(interval_seconds: u64) -> std::time::Duration {
    std::time::Duration::from_secs(interval_seconds.max(1))
}
