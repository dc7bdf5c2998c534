//! JSON-RPC 2.0 envelope as spoken on the tool endpoint.

use crate::error::GatewayError;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

pub const JSONRPC_VERSION: &str = "2.0";

// Standard JSON-RPC codes
pub const PARSE_ERROR: i64 = -32700;
pub const INVALID_REQUEST: i64 = -32600;
pub const METHOD_NOT_FOUND: i64 = -32601;

/// Inbound request envelope.
///
/// `meta.user_id` names the account the call acts for. Clients that follow
/// the MCP convention of `params._meta` are accepted too.
#[derive(Debug, Clone, Deserialize)]
pub struct RpcRequest {
    #[serde(default)]
    pub jsonrpc: Option<String>,
    #[serde(default)]
    pub id: Value,
    pub method: String,
    #[serde(default)]
    pub params: Value,
    #[serde(default)]
    pub meta: Option<RequestMeta>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RequestMeta {
    #[serde(default)]
    pub user_id: Option<String>,
}

impl RpcRequest {
    /// Caller identifier, trimmed. `None` when absent or blank.
    pub fn user_id(&self) -> Option<&str> {
        let from_meta = self.meta.as_ref().and_then(|m| m.user_id.as_deref());
        let from_params = self
            .params
            .get("_meta")
            .and_then(|m| m.get("user_id"))
            .and_then(Value::as_str);

        from_meta
            .or(from_params)
            .map(str::trim)
            .filter(|id| !id.is_empty())
    }
}

/// `tools/call` parameters
#[derive(Debug, Deserialize)]
pub struct CallToolParams {
    pub name: String,
    #[serde(default)]
    pub arguments: Value,
}

/// Outbound response envelope. Exactly one of `result`/`error` is set.
#[derive(Debug, Serialize)]
pub struct RpcResponse {
    pub jsonrpc: &'static str,
    pub id: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<RpcError>,
}

impl RpcResponse {
    pub fn success(id: Value, result: Value) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION,
            id,
            result: Some(result),
            error: None,
        }
    }

    pub fn failure(id: Value, error: RpcError) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION,
            id,
            result: None,
            error: Some(error),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcError {
    pub code: i64,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl RpcError {
    pub fn parse_error(detail: impl std::fmt::Display) -> Self {
        Self {
            code: PARSE_ERROR,
            message: format!("Parse error: {}", detail),
            data: None,
        }
    }

    pub fn invalid_request(detail: impl std::fmt::Display) -> Self {
        Self {
            code: INVALID_REQUEST,
            message: format!("Invalid Request: {}", detail),
            data: None,
        }
    }

    pub fn method_not_found(method: &str) -> Self {
        Self {
            code: METHOD_NOT_FOUND,
            message: format!("Method not found: {}", method),
            data: None,
        }
    }

    /// Map a gateway failure to a structured error.
    ///
    /// `data.kind` is the stable discriminator. Errors the user has to fix
    /// by connecting their account also carry the link to do so.
    pub fn from_gateway(error: &GatewayError, base_url: &str) -> Self {
        let mut data = json!({ "kind": error.kind() });

        let message = match error {
            GatewayError::Unauthenticated { user_id }
            | GatewayError::ReauthorizationRequired { user_id } => {
                let link = authorization_link(base_url, user_id);
                data["authorization_url"] = Value::String(link.clone());
                format!("{}. Visit {}", error, link)
            }
            _ => error.to_string(),
        };

        Self {
            code: error.rpc_code(),
            message,
            data: Some(data),
        }
    }
}

/// Where a user goes to (re)connect their Google account.
pub fn authorization_link(base_url: &str, user_id: &str) -> String {
    format!(
        "{}/auth/google?user_id={}",
        base_url,
        urlencoding::encode(user_id)
    )
}
