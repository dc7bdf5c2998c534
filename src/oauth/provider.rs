//! OAuth provider endpoints and client registration.

use crate::config::{OAuthConfig, Secrets};

/// Google OAuth 2.0 client registration plus the endpoints it talks to.
#[derive(Clone)]
pub struct OAuthProvider {
    /// Authorization (consent screen) endpoint
    pub auth_url: String,

    /// Token endpoint for code exchange and refresh
    pub token_url: String,

    /// Requested scopes
    pub scopes: Vec<String>,

    pub client_id: String,

    pub client_secret: String,

    /// Callback URL registered with the provider
    pub redirect_uri: String,

    pub(crate) http_client: reqwest::Client,
}

impl OAuthProvider {
    pub fn new(
        auth_url: impl Into<String>,
        token_url: impl Into<String>,
        scopes: Vec<String>,
        client_id: impl Into<String>,
        client_secret: impl Into<String>,
        redirect_uri: impl Into<String>,
    ) -> Self {
        Self {
            auth_url: auth_url.into(),
            token_url: token_url.into(),
            scopes,
            client_id: client_id.into(),
            client_secret: client_secret.into(),
            redirect_uri: redirect_uri.into(),
            http_client: reqwest::Client::new(),
        }
    }

    /// Build from the loaded configuration and environment secrets.
    pub fn from_config(oauth: &OAuthConfig, secrets: &Secrets) -> Self {
        Self::new(
            oauth.auth_url.clone(),
            oauth.token_url.clone(),
            oauth.scopes.clone(),
            secrets.client_id.clone(),
            secrets.client_secret.clone(),
            secrets.redirect_uri(),
        )
    }

    /// Space-separated scope string as sent to and returned by the provider.
    pub fn scope_string(&self) -> String {
        self.scopes.join(" ")
    }

    /// Build the consent-screen URL for a signed `state`.
    ///
    /// Offline access with a forced consent prompt makes Google issue a
    /// refresh token even when the account was connected before.
    pub fn build_auth_url(&self, state: &str) -> String {
        format!(
            "{}?client_id={}&redirect_uri={}&response_type=code&scope={}&state={}&access_type=offline&prompt=consent&include_granted_scopes=true",
            self.auth_url,
            urlencoding::encode(&self.client_id),
            urlencoding::encode(&self.redirect_uri),
            urlencoding::encode(&self.scope_string()),
            urlencoding::encode(state)
        )
    }
}
