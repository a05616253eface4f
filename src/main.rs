use std::sync::Arc;

use sqlx::postgres::PgPoolOptions;

use chat_relay::analytics::Aggregator;
use chat_relay::build_app;
use chat_relay::dedup::DedupGuard;
use chat_relay::directory::TenantDirectory;
use chat_relay::gateway::{OpenAiGateway, PlatformDispatcher};
use chat_relay::store::Store;
use chat_relay::types::{AppState, RelayConfig};

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();

    let port = std::env::var("PORT")
        .ok()
        .and_then(|v| v.parse::<u16>().ok())
        .unwrap_or(4000);

    let store = match std::env::var("DATABASE_URL") {
        Ok(url) if !url.trim().is_empty() => {
            let pool = PgPoolOptions::new()
                .max_connections(8)
                .connect(&url)
                .await
                .expect("failed to connect to DATABASE_URL");
            let store = Store::postgres(pool);
            store
                .init_schema()
                .await
                .expect("failed to bootstrap database schema");
            store
        }
        _ => {
            eprintln!("[startup] DATABASE_URL not set, using in-memory store");
            Store::memory()
        }
    };

    let config = RelayConfig::from_env();
    if config.verify_token.is_empty() {
        eprintln!("[startup] WEBHOOK_VERIFY_TOKEN not set, webhook subscription will be rejected");
    }
    if config.app_secret.is_empty() {
        eprintln!("[startup] WEBHOOK_APP_SECRET not set, signature checking disabled");
    }

    let http_client = reqwest::Client::new();
    let state = Arc::new(AppState {
        store,
        dedup: DedupGuard::default(),
        directory: TenantDirectory::new(config.fallback_to_first_active),
        analytics: Aggregator::new(),
        gateway: Arc::new(OpenAiGateway::from_env(http_client.clone())),
        dispatcher: Arc::new(PlatformDispatcher::from_env(http_client)),
        config,
    });

    let app = build_app(state);
    let addr = format!("0.0.0.0:{port}");
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .expect("failed to bind TCP listener");

    eprintln!("[startup] chat relay listening on http://localhost:{port}");
    axum::serve(listener, app)
        .await
        .expect("server runtime failure");
}
