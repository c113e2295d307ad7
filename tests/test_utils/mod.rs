//! Test utilities for integration tests
#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use axum::{Router, body::Body};
use tempfile::TempDir;

use relay::api::AppState;
use relay::api::app;
use relay::chat::{HistoryStore, QueryService};
use relay::core::{AppConfig, ConfigStore};
use relay::llm::RelayClient;

pub const HI_THERE: &str = r#"{"choices":[{"message":{"role":"assistant","content":"Hi there"}}]}"#;

/// A test application wired to a model backend at `backend_url`.
///
/// The config file and history db live in the returned temporary
/// directory, which must be kept alive for the duration of the test.
pub async fn test_app(backend_url: &str) -> (Router, TempDir) {
    let dir = tempfile::tempdir().expect("Failed to create temp dir");
    let app = test_app_in(backend_url, &dir).await;
    (app, dir)
}

/// Like `test_app` but reuses an existing directory, which simulates
/// restarting the service against the same config and db.
pub async fn test_app_in(backend_url: &str, dir: &TempDir) -> Router {
    let config_path = dir.path().join("api.json");
    let config = match ConfigStore::load(&config_path) {
        Ok(config) => config,
        Err(_) => {
            let app_config = AppConfig {
                api_host: String::from("127.0.0.1"),
                api_port: 0,
                llm_host: String::from("127.0.0.1"),
                llm_port: 0,
                llm_maxtokens: 100,
                api_db: dir.path().join("history.db").display().to_string(),
                llm_timeout_secs: 5,
            };
            let mut config = ConfigStore::new(&config_path, app_config);
            // Write the file so restarts pick it up
            config
                .set_max_tokens(100)
                .await
                .expect("Failed to write config");
            config
        }
    };
    let store = HistoryStore::new(&config.config().api_db);
    let gateway = RelayClient::new(backend_url, Duration::from_secs(5))
        .expect("Failed to build relay client");
    let service = QueryService::restore(config, store, Box::new(gateway)).await;
    app(Arc::new(AppState::new(service)))
}

pub async fn body_to_string(body: Body) -> String {
    let bytes = axum::body::to_bytes(body, usize::MAX)
        .await
        .expect("Failed to read body");
    String::from_utf8(bytes.to_vec()).expect("Body is not utf-8")
}

/// An address nothing is listening on
pub fn unreachable_backend() -> String {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);
    format!("http://{}", addr)
}
