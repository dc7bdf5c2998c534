// Integration tests for the MCP tool endpoint, end to end through OAuth,
// credential resolution and the Sheets API

use axum::{
    body::Body,
    http::{header, Request, StatusCode},
    Router,
};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use chrono::{Duration, Utc};
use mockito::{Matcher, Server, ServerGuard};
use serde_json::{json, Value};
use sheetgate::api::create_app;
use sheetgate::config::ResolverConfig;
use sheetgate::credentials::CredentialStore;
use sheetgate::dispatch::{SheetsOperations, ToolDispatcher};
use sheetgate::oauth::{OAuthFlow, OAuthProvider, StateManager};
use sheetgate::resolver::CredentialResolver;
use sheets_client::SheetsClient;
use std::sync::Arc;
use tower::ServiceExt;

fn create_test_app(server: &ServerGuard) -> (Router, Arc<CredentialStore>) {
    let key = BASE64.encode([0u8; 32]);
    let store = Arc::new(CredentialStore::new(":memory:", &key).unwrap());

    let provider = Arc::new(OAuthProvider::new(
        format!("{}/auth", server.url()),
        format!("{}/token", server.url()),
        vec!["https://www.googleapis.com/auth/spreadsheets".to_string()],
        "test-client",
        "test-secret",
        "http://localhost:8000/auth/google/callback",
    ));
    let flow = OAuthFlow::new(
        Arc::clone(&provider),
        StateManager::new(b"integration-secret", 600),
        Arc::clone(&store),
    );
    let resolver = Arc::new(CredentialResolver::new(
        Arc::clone(&store),
        provider,
        &ResolverConfig::default(),
    ));
    let dispatcher = Arc::new(ToolDispatcher::new(
        resolver,
        Arc::new(SheetsOperations::new(SheetsClient::with_base_url(server.url()))),
        "http://localhost:8000",
    ));

    (create_app(flow, dispatcher), store)
}

async fn post_mcp(app: &Router, body: &str) -> (StatusCode, Value) {
    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/mcp")
                .header("content-type", "application/json")
                .body(Body::from(body.to_string()))
                .unwrap(),
        )
        .await
        .unwrap();

    let status = response.status();
    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    (status, serde_json::from_slice(&body).unwrap())
}

fn read_range_call(id: u64, user_id: &str) -> String {
    json!({
        "jsonrpc": "2.0",
        "id": id,
        "method": "tools/call",
        "params": {
            "name": "sheets.read_range",
            "arguments": {"spreadsheet_id": "sheet-1", "range": "A1"}
        },
        "meta": {"user_id": user_id}
    })
    .to_string()
}

/// Run the consent round trip for `user_id` against the mocked token endpoint.
async fn authorize(app: &Router, user_id: &str, code: &str) {
    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .uri(format!("/auth/google?user_id={}", user_id))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    let location = response.headers()[header::LOCATION].to_str().unwrap();
    let pairs: Vec<(String, String)> =
        serde_urlencoded::from_str(location.split_once('?').unwrap().1).unwrap();
    let state = pairs.into_iter().find(|(k, _)| k == "state").unwrap().1;

    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .uri(format!(
                    "/auth/google/callback?code={}&state={}",
                    code,
                    urlencoding::encode(&state)
                ))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn test_authorize_then_call_then_refresh() {
    let mut server = Server::new_async().await;
    let exchange = server
        .mock("POST", "/token")
        .match_body(Matcher::AllOf(vec![
            Matcher::UrlEncoded("grant_type".into(), "authorization_code".into()),
            Matcher::UrlEncoded("code".into(), "abc123".into()),
        ]))
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(r#"{"access_token":"acc-1","refresh_token":"ref-1","expires_in":3600}"#)
        .expect(1)
        .create_async()
        .await;
    let refresh = server
        .mock("POST", "/token")
        .match_body(Matcher::AllOf(vec![
            Matcher::UrlEncoded("grant_type".into(), "refresh_token".into()),
            Matcher::UrlEncoded("refresh_token".into(), "ref-1".into()),
        ]))
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(r#"{"access_token":"acc-2","expires_in":3600}"#)
        .expect(1)
        .create_async()
        .await;
    let read_with_first = server
        .mock("GET", "/spreadsheets/sheet-1/values/A1")
        .match_header("authorization", "Bearer acc-1")
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(r#"{"values":[["first"]]}"#)
        .expect(1)
        .create_async()
        .await;
    let read_with_second = server
        .mock("GET", "/spreadsheets/sheet-1/values/A1")
        .match_header("authorization", "Bearer acc-2")
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(r#"{"values":[["second"]]}"#)
        .expect(1)
        .create_async()
        .await;

    let (app, store) = create_test_app(&server);

    // 1. Authorize: record expires about an hour from now
    authorize(&app, "xyz", "abc123").await;
    let record = store.get("xyz").unwrap().unwrap();
    let remaining = record.expires_at - Utc::now();
    assert!(remaining > Duration::seconds(3500) && remaining <= Duration::seconds(3600));

    // 2. Immediate call uses the stored token unchanged
    let (status, response) = post_mcp(&app, &read_range_call(1, "xyz")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(
        response["result"]["content"][0],
        json!({"type": "json", "json": [["first"]]})
    );

    // 3. Move past expiry: one refresh, then the new token is forwarded
    let mut expired = record.clone();
    expired.expires_at = Utc::now() - Duration::seconds(1);
    store.upsert(&expired).unwrap();

    let (_, response) = post_mcp(&app, &read_range_call(2, "xyz")).await;
    assert_eq!(response["id"], 2);
    assert_eq!(response["result"]["content"][0]["json"], json!([["second"]]));

    let record = store.get("xyz").unwrap().unwrap();
    assert_eq!(record.access_token, "acc-2");
    assert_eq!(record.refresh_token, "ref-1");

    // 4. Unknown identifier: no provider traffic at all
    let (status, response) = post_mcp(&app, &read_range_call(3, "unknown")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(response["error"]["code"], 401);
    assert_eq!(response["error"]["data"]["kind"], "unauthenticated");
    assert!(response["error"]["message"]
        .as_str()
        .unwrap()
        .contains("http://localhost:8000/auth/google?user_id=unknown"));

    exchange.assert_async().await;
    refresh.assert_async().await;
    read_with_first.assert_async().await;
    read_with_second.assert_async().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_calls_refresh_once() {
    let mut server = Server::new_async().await;
    let refresh = server
        .mock("POST", "/token")
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(r#"{"access_token":"acc-new","expires_in":3600}"#)
        .expect(1)
        .create_async()
        .await;
    let read = server
        .mock("GET", "/spreadsheets/sheet-1/values/A1")
        .match_header("authorization", "Bearer acc-new")
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(r#"{"values":[["ok"]]}"#)
        .expect(8)
        .create_async()
        .await;

    let (app, store) = create_test_app(&server);
    store
        .upsert(&sheetgate::credentials::CredentialRecord {
            user_id: "xyz".to_string(),
            access_token: "acc-old".to_string(),
            refresh_token: "ref".to_string(),
            expires_at: Utc::now() - Duration::minutes(5),
            scope: "s".to_string(),
        })
        .unwrap();

    let calls = (0..8u64).map(|i| {
        let app = app.clone();
        tokio::spawn(async move { post_mcp(&app, &read_range_call(i, "xyz")).await })
    });
    for joined in futures::future::join_all(calls).await {
        let (status, response) = joined.unwrap();
        assert_eq!(status, StatusCode::OK);
        assert_eq!(response["result"]["content"][0]["json"], json!([["ok"]]));
    }

    refresh.assert_async().await;
    read.assert_async().await;
}

#[tokio::test]
async fn test_initialize_and_tools_list() {
    let server = Server::new_async().await;
    let (app, _) = create_test_app(&server);

    let (status, response) =
        post_mcp(&app, r#"{"jsonrpc":"2.0","id":1,"method":"initialize"}"#).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(response["result"]["serverInfo"]["name"], "sheetgate");

    let (_, response) = post_mcp(&app, r#"{"jsonrpc":"2.0","id":2,"method":"tools/list"}"#).await;
    let names: Vec<&str> = response["result"]["tools"]
        .as_array()
        .unwrap()
        .iter()
        .map(|t| t["name"].as_str().unwrap())
        .collect();
    assert_eq!(
        names,
        vec!["sheets.read_range", "sheets.write_range", "sheets.append_row"]
    );
}

#[tokio::test]
async fn test_missing_user_id() {
    let server = Server::new_async().await;
    let (app, _) = create_test_app(&server);

    let body = json!({
        "jsonrpc": "2.0",
        "id": 5,
        "method": "tools/call",
        "params": {"name": "sheets.read_range", "arguments": {}}
    })
    .to_string();
    let (status, response) = post_mcp(&app, &body).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(response["id"], 5);
    assert_eq!(response["error"]["data"]["kind"], "invalid_request");
}

#[tokio::test]
async fn test_upstream_error_is_distinct() {
    let mut server = Server::new_async().await;
    let _read = server
        .mock("GET", "/spreadsheets/sheet-1/values/A1")
        .with_status(404)
        .with_body(r#"{"error":{"code":404,"message":"Requested entity was not found."}}"#)
        .create_async()
        .await;

    let (app, store) = create_test_app(&server);
    store
        .upsert(&sheetgate::credentials::CredentialRecord {
            user_id: "xyz".to_string(),
            access_token: "acc".to_string(),
            refresh_token: "ref".to_string(),
            expires_at: Utc::now() + Duration::hours(1),
            scope: "s".to_string(),
        })
        .unwrap();

    let (_, response) = post_mcp(&app, &read_range_call(9, "xyz")).await;
    assert_eq!(response["error"]["data"]["kind"], "upstream_error");
    assert!(response["error"]["message"]
        .as_str()
        .unwrap()
        .contains("Requested entity was not found."));
}

#[tokio::test]
async fn test_unparseable_body() {
    let server = Server::new_async().await;
    let (app, _) = create_test_app(&server);

    let (status, response) = post_mcp(&app, "{not json").await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(response["error"]["code"], -32700);
    assert!(response["id"].is_null());

    let (status, response) = post_mcp(&app, r#"{"jsonrpc":"2.0","id":3}"#).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(response["error"]["code"], -32600);
    assert_eq!(response["id"], 3);
}

#[tokio::test]
async fn test_unknown_method() {
    let server = Server::new_async().await;
    let (app, _) = create_test_app(&server);

    let (status, response) =
        post_mcp(&app, r#"{"jsonrpc":"2.0","id":4,"method":"prompts/list"}"#).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(response["error"]["code"], -32601);
}
