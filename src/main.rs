use anyhow::{Context, Result};
use sheetgate::api::create_app;
use sheetgate::config::{load_config, Secrets, DEFAULT_CONFIG_PATH};
use sheetgate::credentials::CredentialStore;
use sheetgate::dispatch::{SheetsOperations, ToolDispatcher};
use sheetgate::oauth::{run_state_cleanup, OAuthFlow, OAuthProvider, StateManager};
use sheetgate::resolver::CredentialResolver;
use sheets_client::SheetsClient;
use std::sync::Arc;
use tracing::{info, warn};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing subscriber
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "sheetgate=info,tower_http=info".into()),
        )
        .init();

    info!("Sheetgate starting...");

    let config_path =
        std::env::var("SHEETGATE_CONFIG").unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());
    let config = load_config(&config_path)?;
    let secrets = Secrets::from_env()?;

    info!(
        config_path = %config_path,
        base_url = %secrets.base_url,
        credentials_db = %config.server.credentials_db,
        safety_margin_seconds = config.resolver.safety_margin_seconds,
        "Configuration loaded"
    );

    let credential_store = Arc::new(
        CredentialStore::new(&config.server.credentials_db, &secrets.encryption_key)
            .context("Failed to initialize credential store")?,
    );
    let connected = credential_store
        .list_users()
        .context("Failed to list stored credentials")?
        .len();
    info!(users = connected, "Credential store initialized");

    let provider = Arc::new(OAuthProvider::from_config(&config.oauth, &secrets));

    let state_manager = match &secrets.state_secret {
        Some(secret) => StateManager::new(secret.as_bytes(), config.oauth.state_ttl_seconds),
        None => {
            warn!("SHEETGATE_STATE_SECRET not set; OAuth links will not survive a restart");
            StateManager::with_random_key(config.oauth.state_ttl_seconds)
        }
    };
    tokio::spawn(run_state_cleanup(
        state_manager.clone(),
        config.oauth.state_cleanup_interval_seconds,
    ));

    let flow = OAuthFlow::new(
        Arc::clone(&provider),
        state_manager,
        Arc::clone(&credential_store),
    );

    let resolver = Arc::new(CredentialResolver::new(
        Arc::clone(&credential_store),
        provider,
        &config.resolver,
    ));

    let operations = Arc::new(SheetsOperations::new(SheetsClient::with_base_url(
        config.sheets.api_base_url.clone(),
    )));
    let dispatcher = Arc::new(ToolDispatcher::new(
        resolver,
        operations,
        secrets.base_url.clone(),
    ));

    let app = create_app(flow, dispatcher);

    let listener = tokio::net::TcpListener::bind(config.server.bind_addr.as_str())
        .await
        .with_context(|| format!("Failed to bind {}", config.server.bind_addr))?;
    info!(addr = %config.server.bind_addr, "Sheetgate listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("HTTP server error")?;

    info!("Sheetgate stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "Failed to listen for ctrl_c signal");
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received");
}
