//! Token endpoint calls: authorization-code exchange and refresh.

use super::provider::OAuthProvider;
use chrono::{DateTime, Duration, Utc};
use serde::Deserialize;
use thiserror::Error;

/// Lifetime assumed when the provider omits `expires_in`.
const DEFAULT_EXPIRES_IN: i64 = 3600;

/// Successful token endpoint response (standard OAuth 2.0)
#[derive(Deserialize)]
pub struct TokenGrant {
    pub access_token: String,
    #[serde(default)]
    pub refresh_token: Option<String>,
    #[serde(default)]
    pub expires_in: Option<i64>,
    #[serde(default)]
    pub scope: Option<String>,
    #[serde(default)]
    pub token_type: Option<String>,
}

impl TokenGrant {
    /// Absolute expiry of the granted access token.
    ///
    /// `None` when `expires_in` is not a positive, representable lifetime.
    pub fn expires_at(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let seconds = self.expires_in.unwrap_or(DEFAULT_EXPIRES_IN);
        if seconds <= 0 {
            return None;
        }
        Duration::try_seconds(seconds).and_then(|lifetime| now.checked_add_signed(lifetime))
    }
}

impl std::fmt::Debug for TokenGrant {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenGrant")
            .field("has_refresh_token", &self.refresh_token.is_some())
            .field("expires_in", &self.expires_in)
            .field("scope", &self.scope)
            .field("token_type", &self.token_type)
            .finish()
    }
}

/// OAuth error body (`{"error": "...", "error_description": "..."}`)
#[derive(Deserialize)]
struct ErrorBody {
    error: String,
    #[serde(default)]
    error_description: Option<String>,
}

/// Ways a token endpoint call can fail.
#[derive(Debug, Error)]
pub enum TokenEndpointError {
    /// The provider refused the grant (4xx), e.g. `invalid_grant` for a
    /// revoked refresh token or an already-used code.
    #[error("token request rejected ({status}): {error}{}", .description.as_ref().map(|d| format!(" - {}", d)).unwrap_or_default())]
    Rejected {
        status: u16,
        error: String,
        description: Option<String>,
    },

    /// Network failure or provider-side error (5xx)
    #[error("token endpoint unavailable: {0}")]
    Unavailable(String),

    /// 2xx response that is not a usable token grant
    #[error("malformed token response: {0}")]
    Malformed(String),
}

impl OAuthProvider {
    /// Exchange an authorization code for tokens.
    pub async fn exchange_code(&self, code: &str) -> Result<TokenGrant, TokenEndpointError> {
        let form = [
            ("grant_type", "authorization_code"),
            ("code", code),
            ("redirect_uri", self.redirect_uri.as_str()),
            ("client_id", self.client_id.as_str()),
            ("client_secret", self.client_secret.as_str()),
        ];

        tracing::debug!(token_url = %self.token_url, "Exchanging authorization code for token");
        self.post_token_request(&form).await
    }

    /// Mint a new access token from a refresh token.
    pub async fn refresh(&self, refresh_token: &str) -> Result<TokenGrant, TokenEndpointError> {
        let form = [
            ("grant_type", "refresh_token"),
            ("refresh_token", refresh_token),
            ("client_id", self.client_id.as_str()),
            ("client_secret", self.client_secret.as_str()),
        ];

        tracing::debug!(token_url = %self.token_url, "Refreshing access token");
        self.post_token_request(&form).await
    }

    async fn post_token_request(
        &self,
        form: &[(&str, &str)],
    ) -> Result<TokenGrant, TokenEndpointError> {
        let response = self
            .http_client
            .post(&self.token_url)
            .header("Accept", "application/json")
            .form(form)
            .send()
            .await
            .map_err(|e| TokenEndpointError::Unavailable(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "<failed to read body>".to_string());
            return Err(classify_failure(status, &body));
        }

        let body = response
            .text()
            .await
            .map_err(|e| TokenEndpointError::Unavailable(e.to_string()))?;
        let grant: TokenGrant = serde_json::from_str(&body)
            .map_err(|e| TokenEndpointError::Malformed(e.to_string()))?;

        if grant.access_token.is_empty() {
            return Err(TokenEndpointError::Malformed(
                "empty access_token".to_string(),
            ));
        }
        if grant.expires_at(Utc::now()).is_none() {
            return Err(TokenEndpointError::Malformed(format!(
                "unusable expires_in: {:?}",
                grant.expires_in
            )));
        }

        tracing::debug!(
            has_refresh_token = grant.refresh_token.is_some(),
            expires_in = ?grant.expires_in,
            "Token request successful"
        );

        Ok(grant)
    }
}

fn classify_failure(status: reqwest::StatusCode, body: &str) -> TokenEndpointError {
    if status.is_client_error() {
        let (error, description) = match serde_json::from_str::<ErrorBody>(body) {
            Ok(parsed) => (parsed.error, parsed.error_description),
            Err(_) => (format!("http_{}", status.as_u16()), Some(body.to_string())),
        };
        TokenEndpointError::Rejected {
            status: status.as_u16(),
            error,
            description,
        }
    } else {
        TokenEndpointError::Unavailable(format!("status {}: {}", status, body))
    }
}
