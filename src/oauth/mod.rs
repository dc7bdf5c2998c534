//! OAuth 2.0 authorization-code flow binding a user identifier to a Google account.
//!
//! 1. Client sends the user to `GET /auth/google?user_id=...`
//! 2. `begin_authorization` signs a `state` for that identifier → redirect to consent
//! 3. Google redirects to `/auth/google/callback?code=...&state=...`
//! 4. `complete_authorization` verifies the state, exchanges the code, and
//!    upserts the credential record. Nothing is written unless the exchange
//!    succeeded.

mod exchange;
mod provider;
mod state;

pub use exchange::{TokenEndpointError, TokenGrant};
pub use provider::OAuthProvider;
pub use state::{run_state_cleanup, StateError, StateManager};

use crate::credentials::{CredentialRecord, CredentialStore};
use crate::error::{GatewayError, GatewayResult};
use anyhow::anyhow;
use chrono::Utc;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Drives the consent round trip and persists the resulting tokens.
#[derive(Clone)]
pub struct OAuthFlow {
    provider: Arc<OAuthProvider>,
    states: StateManager,
    store: Arc<CredentialStore>,
}

impl OAuthFlow {
    pub fn new(
        provider: Arc<OAuthProvider>,
        states: StateManager,
        store: Arc<CredentialStore>,
    ) -> Self {
        Self {
            provider,
            states,
            store,
        }
    }

    pub fn states(&self) -> &StateManager {
        &self.states
    }

    /// Build the provider consent URL for `user_id`.
    pub fn begin_authorization(&self, user_id: &str) -> GatewayResult<String> {
        let user_id = user_id.trim();
        if user_id.is_empty() {
            return Err(GatewayError::InvalidRequest(
                "user_id must not be empty".to_string(),
            ));
        }

        let state = self.states.issue(user_id);
        debug!(user_id = %user_id, "Issued OAuth state");
        Ok(self.provider.build_auth_url(&state))
    }

    /// Finish the flow for a provider callback.
    ///
    /// The state is verified before the provider is contacted; a bad state
    /// never reaches the provider or the store. The exchange and the write run on their own
    /// task so a dropped browser connection cannot interrupt them halfway.
    pub async fn complete_authorization(
        &self,
        code: &str,
        state: &str,
    ) -> GatewayResult<CredentialRecord> {
        // Checked first so a blank code does not burn a valid state
        if code.is_empty() {
            return Err(GatewayError::InvalidRequest(
                "missing 'code' parameter".to_string(),
            ));
        }

        let user_id = self.states.verify_and_consume(state).map_err(|e| {
            warn!(error = %e, "Rejected OAuth state");
            GatewayError::Authorization(format!("invalid or expired OAuth state: {}", e))
        })?;

        let provider = Arc::clone(&self.provider);
        let store = Arc::clone(&self.store);
        let code = code.to_string();

        tokio::spawn(async move { exchange_and_store(&provider, &store, user_id, &code).await })
            .await
            .map_err(|e| GatewayError::Internal(anyhow!("authorization task failed: {}", e)))?
    }
}

async fn exchange_and_store(
    provider: &OAuthProvider,
    store: &CredentialStore,
    user_id: String,
    code: &str,
) -> GatewayResult<CredentialRecord> {
    debug!(user_id = %user_id, "Exchanging authorization code for token");
    let grant = provider.exchange_code(code).await.map_err(|e| {
        warn!(user_id = %user_id, error = %e, "Token exchange failed");
        GatewayError::Provider(format!("failed to exchange authorization code: {}", e))
    })?;

    let expires_at = grant.expires_at(Utc::now()).ok_or_else(|| {
        GatewayError::Provider(format!(
            "token response has an unusable expires_in: {:?}",
            grant.expires_in
        ))
    })?;

    // Google only returns a refresh token on first consent unless forced;
    // a re-authorization without one keeps the token already on file.
    let existing = store.get(&user_id)?;
    let refresh_token = match (grant.refresh_token, existing) {
        (Some(new_token), _) => new_token,
        (None, Some(existing)) => existing.refresh_token,
        (None, None) => {
            warn!(user_id = %user_id, "Provider granted no refresh token");
            return Err(GatewayError::Provider(
                "provider did not issue a refresh token; revoke the app's access and authorize again"
                    .to_string(),
            ));
        }
    };

    let record = CredentialRecord {
        user_id,
        access_token: grant.access_token,
        refresh_token,
        expires_at,
        scope: grant
            .scope
            .unwrap_or_else(|| provider.scope_string()),
    };

    store.upsert(&record)?;

    info!(
        user_id = %record.user_id,
        expires_at = %record.expires_at,
        "OAuth flow completed successfully"
    );

    Ok(record)
}
