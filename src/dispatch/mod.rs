//! MCP tool dispatch: identifier → access token → spreadsheet operation.

pub mod protocol;
pub mod sheets;

pub use protocol::{RpcError, RpcRequest, RpcResponse};
pub use sheets::SheetsOperations;

use crate::error::{GatewayError, GatewayResult};
use crate::resolver::CredentialResolver;
use async_trait::async_trait;
use protocol::CallToolParams;
use serde::Serialize;
use serde_json::{json, Value};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, warn};


pub const SERVER_NAME: &str = "sheetgate";
pub const PROTOCOL_VERSION: &str = "2024-11-05";

/// A tool as advertised by `tools/list`.
#[derive(Debug, Clone, Serialize)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    #[serde(rename = "inputSchema")]
    pub input_schema: Value,
}

/// What a tool produced.
#[derive(Debug, Clone, PartialEq)]
pub enum ToolOutput {
    Json(Value),
    Text(String),
}

impl ToolOutput {
    /// MCP content item
    fn into_content(self) -> Value {
        match self {
            ToolOutput::Json(value) => json!({"type": "json", "json": value}),
            ToolOutput::Text(text) => json!({"type": "text", "text": text}),
        }
    }
}

#[derive(Debug, Error)]
pub enum OperationError {
    #[error("invalid arguments for {0}")]
    InvalidArguments(String),

    #[error("unknown tool '{0}'")]
    UnknownTool(String),

    /// The spreadsheet API failed; the message keeps its status and body
    #[error("{0:#}")]
    Api(#[from] anyhow::Error),
}

/// The spreadsheet side of a tool call. Receives a token that is valid for
/// the caller and never sees the identifier itself.
#[async_trait]
pub trait SpreadsheetOperations: Send + Sync {
    fn tools(&self) -> Vec<ToolDefinition>;

    async fn execute(
        &self,
        access_token: &str,
        tool: &str,
        arguments: Value,
    ) -> Result<ToolOutput, OperationError>;
}

/// Handles MCP requests for all users.
pub struct ToolDispatcher {
    resolver: Arc<CredentialResolver>,
    operations: Arc<dyn SpreadsheetOperations>,
    /// Public origin used in "connect your account" links
    base_url: String,
}

impl ToolDispatcher {
    pub fn new(
        resolver: Arc<CredentialResolver>,
        operations: Arc<dyn SpreadsheetOperations>,
        base_url: impl Into<String>,
    ) -> Self {
        Self {
            resolver,
            operations,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }

    /// Answer one JSON-RPC request. Failures become error responses.
    pub async fn handle(&self, request: RpcRequest) -> RpcResponse {
        let id = request.id.clone();
        debug!(method = %request.method, "MCP request");

        match request.method.as_str() {
            "initialize" => RpcResponse::success(id, self.server_info()),
            "ping" => RpcResponse::success(id, json!({})),
            "tools/list" => RpcResponse::success(id, json!({ "tools": self.operations.tools() })),
            "tools/call" => match self.call_tool(&request).await {
                Ok(result) => RpcResponse::success(id, result),
                Err(e) => {
                    warn!(kind = e.kind(), error = %e, "Tool call failed");
                    RpcResponse::failure(id, RpcError::from_gateway(&e, &self.base_url))
                }
            },
            other => RpcResponse::failure(id, RpcError::method_not_found(other)),
        }
    }

    /// Run `tools/call`: identifier check, tool lookup, resolve, forward.
    pub async fn call_tool(&self, request: &RpcRequest) -> GatewayResult<Value> {
        let user_id = request.user_id().ok_or_else(|| {
            GatewayError::InvalidRequest("meta.user_id is required for tools/call".to_string())
        })?;

        let params: CallToolParams = serde_json::from_value(request.params.clone())
            .map_err(|e| GatewayError::InvalidRequest(format!("invalid tools/call params: {}", e)))?;

        if !self.operations.tools().iter().any(|t| t.name == params.name) {
            return Err(GatewayError::InvalidRequest(format!(
                "unknown tool '{}'",
                params.name
            )));
        }

        let access_token = self.resolver.resolve(user_id).await?;

        info!(user_id = %user_id, tool = %params.name, "Forwarding tool call");
        let output = self
            .operations
            .execute(&access_token, &params.name, params.arguments)
            .await
            .map_err(|e| match e {
                OperationError::Api(_) => GatewayError::Upstream(e.to_string()),
                other => GatewayError::InvalidRequest(other.to_string()),
            })?;

        Ok(json!({ "content": [output.into_content()] }))
    }

    fn server_info(&self) -> Value {
        json!({
            "protocolVersion": PROTOCOL_VERSION,
            "capabilities": { "tools": { "listChanged": false } },
            "serverInfo": {
                "name": SERVER_NAME,
                "version": env!("CARGO_PKG_VERSION")
            }
        })
    }
}
