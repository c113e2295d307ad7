use anyhow::Result;

use super::build_service;
use crate::api;

pub async fn run(config_path: &str, host: Option<String>, port: Option<u16>) -> Result<()> {
    let service = build_service(config_path).await?;
    let config = service.config().await;
    let host = host.unwrap_or(config.api_host);
    let port = port.unwrap_or(config.api_port);
    api::serve(&host, port, service).await
}
