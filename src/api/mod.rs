// HTTP surface: health, Google account connection, MCP tool endpoint

pub mod mcp;
pub mod oauth;

pub use mcp::{create_mcp_router, McpAppState};
pub use oauth::{create_oauth_router, OAuthAppState};

use crate::dispatch::ToolDispatcher;
use crate::oauth::OAuthFlow;
use axum::{response::Json, routing::get, Router};
use serde_json::{json, Value};
use std::sync::Arc;
use tower_http::trace::TraceLayer;

/// Build the complete application router.
pub fn create_app(flow: OAuthFlow, dispatcher: Arc<ToolDispatcher>) -> Router {
    Router::new()
        .route("/", get(health))
        .merge(create_oauth_router(OAuthAppState { flow }))
        .merge(create_mcp_router(McpAppState { dispatcher }))
        .layer(TraceLayer::new_for_http())
}

/// GET /
async fn health() -> Json<Value> {
    Json(json!({ "status": "ok" }))
}
