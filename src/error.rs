//! User-visible failure kinds.
//!
//! Every error a caller can see is one of these. Each carries a stable
//! `kind()` string so clients can tell "connect your account" apart from
//! "the spreadsheet call failed".

use thiserror::Error;

#[derive(Debug, Error)]
pub enum GatewayError {
    /// Malformed request or missing identifier (client bug)
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// No credential record for the identifier
    #[error("no Google account connected for user '{user_id}'")]
    Unauthenticated { user_id: String },

    /// The refresh token was rejected by the provider
    #[error("Google authorization for user '{user_id}' is no longer valid")]
    ReauthorizationRequired { user_id: String },

    /// The `state` parameter was tampered with, expired, or consent was denied
    #[error("authorization failed: {0}")]
    Authorization(String),

    /// The provider's token endpoint failed (bad code, outage, bad response)
    #[error("OAuth provider error: {0}")]
    Provider(String),

    /// The spreadsheet operation itself failed
    #[error("upstream error: {0}")]
    Upstream(String),

    #[error("internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl GatewayError {
    /// Machine-readable error kind.
    pub fn kind(&self) -> &'static str {
        match self {
            GatewayError::InvalidRequest(_) => "invalid_request",
            GatewayError::Unauthenticated { .. } => "unauthenticated",
            GatewayError::ReauthorizationRequired { .. } => "reauthorization_required",
            GatewayError::Authorization(_) => "authorization_error",
            GatewayError::Provider(_) => "provider_error",
            GatewayError::Upstream(_) => "upstream_error",
            GatewayError::Internal(_) => "internal_error",
        }
    }

    /// JSON-RPC error code used on the tool endpoint.
    ///
    /// Credential problems use 401 like the HTTP status they stand for;
    /// the rest sit in the implementation-defined server error range.
    pub fn rpc_code(&self) -> i64 {
        match self {
            GatewayError::InvalidRequest(_) => -32602,
            GatewayError::Unauthenticated { .. } => 401,
            GatewayError::ReauthorizationRequired { .. } => 401,
            GatewayError::Authorization(_) => -32001,
            GatewayError::Provider(_) => -32002,
            GatewayError::Upstream(_) => -32003,
            GatewayError::Internal(_) => -32603,
        }
    }

    /// True when the user has to (re)connect their account before retrying.
    pub fn requires_user_action(&self) -> bool {
        matches!(
            self,
            GatewayError::Unauthenticated { .. } | GatewayError::ReauthorizationRequired { .. }
        )
    }
}

pub type GatewayResult<T> = std::result::Result<T, GatewayError>;
