//! Turns a user identifier into an access token that is safe to use right now.
//!
//! Fresh tokens are served straight from the store. Stale ones are refreshed
//! under a per-identifier lock, so concurrent callers for the same user share
//! one refresh while other users are never blocked. A refresh that fails is
//! shared the same way: callers that were already waiting get its error
//! instead of calling the provider again.

use crate::config::ResolverConfig;
use crate::credentials::{CredentialRecord, CredentialStore};
use crate::error::{GatewayError, GatewayResult};
use crate::oauth::{OAuthProvider, TokenEndpointError};
use anyhow::anyhow;
use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// How long a failed refresh is kept for callers that were waiting on it.
const FAILURE_RETENTION: std::time::Duration = std::time::Duration::from_secs(30);


/// Resolves identifiers to currently valid access tokens.
pub struct CredentialResolver {
    store: Arc<CredentialStore>,
    provider: Arc<OAuthProvider>,
    /// One lock per identifier with a refresh in flight or queued
    refresh_locks: DashMap<String, Arc<Mutex<()>>>,
    /// Last failed refresh per identifier
    failures: Arc<DashMap<String, FailedRefresh>>,
    safety_margin: Duration,
    max_write_attempts: u32,
}

impl CredentialResolver {
    pub fn new(
        store: Arc<CredentialStore>,
        provider: Arc<OAuthProvider>,
        config: &ResolverConfig,
    ) -> Self {
        Self {
            store,
            provider,
            refresh_locks: DashMap::new(),
            failures: Arc::new(DashMap::new()),
            safety_margin: Duration::seconds(config.safety_margin_seconds.max(0)),
            max_write_attempts: config.max_write_attempts.max(1),
        }
    }

    /// Return a usable access token for `user_id`.
    ///
    /// # Errors
    /// * `Unauthenticated` - no record; the user must authorize first
    /// * `ReauthorizationRequired` - the provider rejected the refresh token
    /// * `Provider` - the token endpoint was unreachable or misbehaved
    /// * `Internal` - storage failure or persistent write conflicts
    pub async fn resolve(&self, user_id: &str) -> GatewayResult<String> {
        let started = Instant::now();
        let record = self.load(user_id)?;
        if record.is_fresh(Utc::now(), self.safety_margin) {
            debug!(user_id = %user_id, "Serving stored access token");
            return Ok(record.access_token);
        }

        let lock = self.lock_for(user_id);
        let guard = lock.lock_owned().await;

        let refresh = RefreshJob {
            store: Arc::clone(&self.store),
            provider: Arc::clone(&self.provider),
            failures: Arc::clone(&self.failures),
            user_id: user_id.to_string(),
            observed_expires_at: record.expires_at,
            caller_started: started,
            safety_margin: self.safety_margin,
            max_write_attempts: self.max_write_attempts,
        };

        // The job owns the lock guard and runs to completion even if this
        // caller is dropped mid-await.
        let result = tokio::spawn(async move {
            let _guard = guard;
            refresh.run().await
        })
        .await
        .map_err(|e| GatewayError::Internal(anyhow!("token refresh task failed: {}", e)));

        self.prune_idle_locks();
        result?
    }

    /// Number of identifiers with a live refresh lock (for debugging/monitoring)
    pub fn active_locks(&self) -> usize {
        self.refresh_locks.len()
    }

    fn load(&self, user_id: &str) -> GatewayResult<CredentialRecord> {
        self.store
            .get(user_id)?
            .ok_or_else(|| GatewayError::Unauthenticated {
                user_id: user_id.to_string(),
            })
    }

    fn lock_for(&self, user_id: &str) -> Arc<Mutex<()>> {
        Arc::clone(
            self.refresh_locks
                .entry(user_id.to_string())
                .or_default()
                .value(),
        )
    }

    /// Drop locks that nobody holds or waits on. The map shard is locked
    /// during `retain`, so no caller can be cloning an entry being removed.
    fn prune_idle_locks(&self) {
        self.refresh_locks
            .retain(|_, lock| Arc::strong_count(lock) > 1);
        self.failures
            .retain(|_, failure| failure.finished_at.elapsed() < FAILURE_RETENTION);
    }
}

/// Outcome of a refresh that did not produce a token.
#[derive(Clone)]
struct FailedRefresh {
    /// `expires_at` of the record the refresh started from
    started_from: DateTime<Utc>,
    finished_at: Instant,
    rejected: bool,
    message: String,
}

impl FailedRefresh {
    fn to_error(&self, user_id: &str) -> GatewayError {
        if self.rejected {
            GatewayError::ReauthorizationRequired {
                user_id: user_id.to_string(),
            }
        } else {
            GatewayError::Provider(self.message.clone())
        }
    }
}

/// One "check expiry → refresh → conditional write" pass, run while holding
/// the identifier's refresh lock.
struct RefreshJob {
    store: Arc<CredentialStore>,
    provider: Arc<OAuthProvider>,
    failures: Arc<DashMap<String, FailedRefresh>>,
    user_id: String,
    /// `expires_at` the caller saw before queueing for the lock
    observed_expires_at: DateTime<Utc>,
    /// When the caller entered `resolve`
    caller_started: Instant,
    safety_margin: Duration,
    max_write_attempts: u32,
}

impl RefreshJob {
    async fn run(self) -> GatewayResult<String> {
        for attempt in 1..=self.max_write_attempts {
            let current = self
                .store
                .get(&self.user_id)?
                .ok_or_else(|| GatewayError::Unauthenticated {
                    user_id: self.user_id.clone(),
                })?;

            let now = Utc::now();
            if let Some(token) = self.joinable(&current, now) {
                debug!(user_id = %self.user_id, "Joined refresh completed by another caller");
                return Ok(token);
            }
            if let Some(error) = self.joinable_failure(&current) {
                debug!(user_id = %self.user_id, "Joined refresh that failed for another caller");
                return Err(error);
            }

            info!(user_id = %self.user_id, attempt, "Refreshing OAuth token");
            let grant = match self.provider.refresh(&current.refresh_token).await {
                Ok(grant) => grant,
                Err(e) => return Err(self.record_failure(&current, e)),
            };

            let expires_at = match grant.expires_at(Utc::now()) {
                Some(expires_at) if Utc::now() < expires_at => expires_at,
                _ => {
                    return Err(self.record_failure(
                        &current,
                        TokenEndpointError::Malformed(format!(
                            "refreshed token has no usable lifetime (expires_in {:?})",
                            grant.expires_in
                        )),
                    ))
                }
            };

            let refreshed = CredentialRecord {
                user_id: current.user_id.clone(),
                expires_at,
                access_token: grant.access_token,
                // Keep the existing refresh token if the provider did not rotate it
                refresh_token: grant
                    .refresh_token
                    .unwrap_or_else(|| current.refresh_token.clone()),
                scope: grant.scope.unwrap_or_else(|| current.scope.clone()),
            };

            if self
                .store
                .replace_if_unchanged(current.expires_at, &refreshed)?
            {
                self.failures.remove(&self.user_id);
                info!(
                    user_id = %self.user_id,
                    expires_at = %refreshed.expires_at,
                    "OAuth token refreshed successfully"
                );
                return Ok(refreshed.access_token);
            }

            warn!(
                user_id = %self.user_id,
                attempt,
                "Credential record changed during refresh, re-reading"
            );
        }

        Err(GatewayError::Internal(anyhow!(
            "credential record for '{}' kept changing during refresh ({} attempts)",
            self.user_id,
            self.max_write_attempts
        )))
    }

    /// A token someone else already produced: either comfortably fresh, or
    /// written since this caller looked and not yet past its real expiry.
    fn joinable(&self, current: &CredentialRecord, now: DateTime<Utc>) -> Option<String> {
        let replaced = current.expires_at != self.observed_expires_at && now < current.expires_at;
        if replaced || current.is_fresh(now, self.safety_margin) {
            Some(current.access_token.clone())
        } else {
            None
        }
    }

    /// The failure of a refresh that started from this same record while
    /// this caller was already in flight.
    fn joinable_failure(&self, current: &CredentialRecord) -> Option<GatewayError> {
        let failure = self.failures.get(&self.user_id)?;
        if failure.started_from == current.expires_at
            && self.caller_started <= failure.finished_at
        {
            Some(failure.to_error(&self.user_id))
        } else {
            None
        }
    }

    /// Remember a failed refresh for concurrent callers and map it to the
    /// error this caller sees.
    fn record_failure(&self, current: &CredentialRecord, error: TokenEndpointError) -> GatewayError {
        let rejected = matches!(error, TokenEndpointError::Rejected { .. });
        if rejected {
            warn!(
                user_id = %self.user_id,
                error = %error,
                "Refresh token rejected, user must re-authorize"
            );
        } else {
            warn!(user_id = %self.user_id, error = %error, "Token refresh failed");
        }

        let failure = FailedRefresh {
            started_from: current.expires_at,
            finished_at: Instant::now(),
            rejected,
            message: format!("token refresh failed: {}", error),
        };
        let mapped = failure.to_error(&self.user_id);
        self.failures.insert(self.user_id.clone(), failure);
        mapped
    }
}
