//! Browser-facing endpoints of the Google account connection flow.

use crate::error::GatewayError;
use crate::oauth::OAuthFlow;
use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::{Html, IntoResponse, Redirect, Response},
    routing::get,
    Router,
};
use serde::Deserialize;
use std::sync::Arc;
use tracing::{info, warn};

/// Shared application state for OAuth endpoints
#[derive(Clone)]
pub struct OAuthAppState {
    pub flow: OAuthFlow,
}

/// GET /auth/google query parameters
#[derive(Deserialize)]
pub struct AuthStart {
    user_id: Option<String>,
}

/// OAuth callback query parameters
#[derive(Deserialize)]
pub struct OAuthCallback {
    code: Option<String>,
    state: Option<String>,
    error: Option<String>,
    error_description: Option<String>,
}

/// Failures rendered as an HTML page in the user's browser
struct PageError(GatewayError);

impl From<GatewayError> for PageError {
    fn from(error: GatewayError) -> Self {
        Self(error)
    }
}

impl IntoResponse for PageError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            GatewayError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            GatewayError::Authorization(_) => StatusCode::UNAUTHORIZED,
            GatewayError::Provider(_) => StatusCode::BAD_GATEWAY,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        let body = page(
            "Connection failed",
            &format!(
                "<p>{}</p><p>Start again from your assistant to retry.</p>",
                escape_html(&self.0.to_string())
            ),
        );
        (status, Html(body)).into_response()
    }
}

/// Create OAuth API router
pub fn create_oauth_router(state: OAuthAppState) -> Router {
    Router::new()
        .route("/auth/google", get(auth_start))
        .route("/auth/google/callback", get(auth_callback))
        .with_state(Arc::new(state))
}

/// GET /auth/google?user_id=...
///
/// Redirects the browser to Google's consent screen.
async fn auth_start(
    State(state): State<Arc<OAuthAppState>>,
    Query(query): Query<AuthStart>,
) -> Result<Redirect, PageError> {
    let user_id = query.user_id.unwrap_or_default();
    let url = state.flow.begin_authorization(&user_id)?;

    info!(user_id = %user_id.trim(), "Redirecting to Google consent screen");
    Ok(Redirect::temporary(&url))
}

/// GET /auth/google/callback?code=...&state=...
async fn auth_callback(
    State(state): State<Arc<OAuthAppState>>,
    Query(callback): Query<OAuthCallback>,
) -> Result<Html<String>, PageError> {
    // Consent denied or provider-side failure
    if let Some(error) = callback.error {
        let description = callback
            .error_description
            .unwrap_or_else(|| "Unknown error".to_string());
        warn!(error = %error, description = %description, "OAuth authorization failed");
        return Err(GatewayError::Authorization(format!("{} - {}", error, description)).into());
    }

    let code = callback
        .code
        .ok_or_else(|| GatewayError::InvalidRequest("missing 'code' parameter".to_string()))?;
    let csrf_state = callback
        .state
        .ok_or_else(|| GatewayError::InvalidRequest("missing 'state' parameter".to_string()))?;

    let record = state.flow.complete_authorization(&code, &csrf_state).await?;

    Ok(Html(page(
        "Google Sheets connected",
        &format!(
            "<p>Google Sheets is now connected for <strong>{}</strong>.</p><p>You can close this window.</p>",
            escape_html(&record.user_id)
        ),
    )))
}

fn page(title: &str, body: &str) -> String {
    format!(
        "<!DOCTYPE html><html><head><meta charset=\"utf-8\"><title>{title}</title></head><body><h1>{title}</h1>{body}</body></html>",
        title = escape_html(title),
        body = body
    )
}

fn escape_html(text: &str) -> String {
    let mut escaped = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => escaped.push_str("&amp;"),
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            '"' => escaped.push_str("&quot;"),
            '\'' => escaped.push_str("&#x27;"),
            _ => escaped.push(c),
        }
    }
    escaped
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_oauth_callback_deserialization() {
        // Success case
        let query = "code=auth_code_123&state=signed.state";
        let callback: OAuthCallback = serde_urlencoded::from_str(query).unwrap();
        assert_eq!(callback.code, Some("auth_code_123".to_string()));
        assert_eq!(callback.state, Some("signed.state".to_string()));
        assert_eq!(callback.error, None);

        // Error case
        let query = "error=access_denied&error_description=User+cancelled";
        let callback: OAuthCallback = serde_urlencoded::from_str(query).unwrap();
        assert_eq!(callback.error, Some("access_denied".to_string()));
        assert_eq!(callback.error_description, Some("User cancelled".to_string()));
        assert_eq!(callback.code, None);
    }

    #[test]
    fn test_escape_html() {
        assert_eq!(
            escape_html("<script>alert('x')</script> & \"y\""),
            "&lt;script&gt;alert(&#x27;x&#x27;)&lt;/script&gt; &amp; &quot;y&quot;"
        );
        assert_eq!(escape_html("plain-user_1"), "plain-user_1");
    }

    #[test]
    fn test_error_statuses() {
        let status = |e: GatewayError| PageError(e).into_response().status();
        assert_eq!(status(GatewayError::InvalidRequest("x".into())), StatusCode::BAD_REQUEST);
        assert_eq!(status(GatewayError::Authorization("x".into())), StatusCode::UNAUTHORIZED);
        assert_eq!(status(GatewayError::Provider("x".into())), StatusCode::BAD_GATEWAY);
        assert_eq!(
            status(GatewayError::Internal(anyhow::anyhow!("db"))),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }
}
