//! Process configuration.
//!
//! Tunables come from an optional TOML file; secrets and the public base URL
//! come from the environment. Both are read once at start-up and never change.

use anyhow::{anyhow, Context, Result};
use serde::Deserialize;
use std::fmt;
use std::path::Path;

pub const DEFAULT_CONFIG_PATH: &str = "sheetgate.toml";

/// Complete tunable configuration
#[derive(Debug, Clone, Default, Deserialize)]
pub struct GatewayConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub oauth: OAuthConfig,
    #[serde(default)]
    pub resolver: ResolverConfig,
    #[serde(default)]
    pub sheets: SheetsConfig,
}

/// HTTP listener and storage location
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,
    /// SQLite file holding encrypted credentials
    #[serde(default = "default_credentials_db")]
    pub credentials_db: String,
}

fn default_bind_addr() -> String {
    "0.0.0.0:8000".to_string()
}

fn default_credentials_db() -> String {
    "credentials.db".to_string()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: default_bind_addr(),
            credentials_db: default_credentials_db(),
        }
    }
}

/// Authorization-code flow settings
#[derive(Debug, Clone, Deserialize)]
pub struct OAuthConfig {
    #[serde(default = "default_auth_url")]
    pub auth_url: String,
    #[serde(default = "default_token_url")]
    pub token_url: String,
    #[serde(default = "default_scopes")]
    pub scopes: Vec<String>,
    /// How long a `state` value stays acceptable (seconds)
    #[serde(default = "default_state_ttl")]
    pub state_ttl_seconds: i64,
    /// How often consumed states are pruned (seconds)
    #[serde(default = "default_state_cleanup_interval")]
    pub state_cleanup_interval_seconds: u64,
}

fn default_auth_url() -> String {
    "https://accounts.google.com/o/oauth2/v2/auth".to_string()
}

fn default_token_url() -> String {
    "https://oauth2.googleapis.com/token".to_string()
}

fn default_scopes() -> Vec<String> {
    vec!["https://www.googleapis.com/auth/spreadsheets".to_string()]
}

fn default_state_ttl() -> i64 {
    600
}

fn default_state_cleanup_interval() -> u64 {
    60
}

impl Default for OAuthConfig {
    fn default() -> Self {
        Self {
            auth_url: default_auth_url(),
            token_url: default_token_url(),
            scopes: default_scopes(),
            state_ttl_seconds: default_state_ttl(),
            state_cleanup_interval_seconds: default_state_cleanup_interval(),
        }
    }
}

/// Credential resolution settings
#[derive(Debug, Clone, Deserialize)]
pub struct ResolverConfig {
    /// Tokens are treated as expired this many seconds early
    #[serde(default = "default_safety_margin")]
    pub safety_margin_seconds: i64,
    /// Attempts at the conditional store write before giving up
    #[serde(default = "default_max_write_attempts")]
    pub max_write_attempts: u32,
}

fn default_safety_margin() -> i64 {
    90
}

fn default_max_write_attempts() -> u32 {
    3
}

impl Default for ResolverConfig {
    fn default() -> Self {
        Self {
            safety_margin_seconds: default_safety_margin(),
            max_write_attempts: default_max_write_attempts(),
        }
    }
}

/// Spreadsheet API endpoint
#[derive(Debug, Clone, Deserialize)]
pub struct SheetsConfig {
    #[serde(default = "default_sheets_api_base_url")]
    pub api_base_url: String,
}

fn default_sheets_api_base_url() -> String {
    sheets_client::BASE_URL.to_string()
}

impl Default for SheetsConfig {
    fn default() -> Self {
        Self {
            api_base_url: default_sheets_api_base_url(),
        }
    }
}

/// Load configuration from a TOML file. A missing file yields the defaults.
pub fn load_config<P: AsRef<Path>>(path: P) -> Result<GatewayConfig> {
    let path = path.as_ref();
    if !path.exists() {
        return Ok(GatewayConfig::default());
    }
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file {}", path.display()))?;
    toml::from_str(&contents)
        .with_context(|| format!("Failed to parse config file {}", path.display()))
}

/// Values that must come from the deployment environment.
#[derive(Clone)]
pub struct Secrets {
    pub client_id: String,
    pub client_secret: String,
    /// Externally reachable origin, without trailing slash
    pub base_url: String,
    /// Base64 AES-256 key for the credential store
    pub encryption_key: String,
    /// HMAC key for OAuth `state`; `None` means generate one per process
    pub state_secret: Option<String>,
}

impl Secrets {
    /// Read from the process environment.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Read through an arbitrary lookup (the environment in production).
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let required = |name: &str| -> Result<String> {
            lookup(name)
                .filter(|v| !v.trim().is_empty())
                .ok_or_else(|| anyhow!("{} is required", name))
        };

        Ok(Self {
            client_id: required("GOOGLE_CLIENT_ID")?,
            client_secret: required("GOOGLE_CLIENT_SECRET")?,
            base_url: required("BASE_URL")?.trim_end_matches('/').to_string(),
            encryption_key: required("SHEETGATE_ENCRYPTION_KEY")
                .context("SHEETGATE_ENCRYPTION_KEY must be a base64-encoded 32-byte key")?,
            state_secret: lookup("SHEETGATE_STATE_SECRET").filter(|v| !v.is_empty()),
        })
    }

    /// Where the provider sends the browser back after consent.
    pub fn redirect_uri(&self) -> String {
        format!("{}/auth/google/callback", self.base_url)
    }
}

impl fmt::Debug for Secrets {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Secrets")
            .field("client_id", &self.client_id)
            .field("client_secret", &"<redacted>")
            .field("base_url", &self.base_url)
            .field("encryption_key", &"<redacted>")
            .field("state_secret", &self.state_secret.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}
