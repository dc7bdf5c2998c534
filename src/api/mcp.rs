use crate::dispatch::{RpcError, RpcRequest, RpcResponse, ToolDispatcher};
use axum::{
    body::Bytes,
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Json, Response},
    routing::post,
    Router,
};
use serde_json::Value;
use std::sync::Arc;
use tracing::warn;

/// Shared application state for the tool endpoint
#[derive(Clone)]
pub struct McpAppState {
    pub dispatcher: Arc<ToolDispatcher>,
}

/// Create MCP router
pub fn create_mcp_router(state: McpAppState) -> Router {
    Router::new()
        .route("/mcp", post(handle_mcp))
        .with_state(Arc::new(state))
}

/// POST /mcp - One JSON-RPC request per call
///
/// Protocol-level failures are answered with HTTP 200 and a JSON-RPC error;
/// only bodies that are not a request at all get HTTP 400.
async fn handle_mcp(State(state): State<Arc<McpAppState>>, body: Bytes) -> Response {
    let payload: Value = match serde_json::from_slice(&body) {
        Ok(payload) => payload,
        Err(e) => {
            warn!(error = %e, "Unparseable MCP request body");
            return reject(Value::Null, RpcError::parse_error(e));
        }
    };

    let id = payload.get("id").cloned().unwrap_or(Value::Null);
    let request: RpcRequest = match serde_json::from_value(payload) {
        Ok(request) => request,
        Err(e) => {
            warn!(error = %e, "Invalid MCP request envelope");
            return reject(id, RpcError::invalid_request(e));
        }
    };

    Json(state.dispatcher.handle(request).await).into_response()
}

fn reject(id: Value, error: RpcError) -> Response {
    (StatusCode::BAD_REQUEST, Json(RpcResponse::failure(id, error))).into_response()
}
