use anyhow::Result;

use super::build_service;

pub async fn run(config_path: &str, model: &str, prompt: &str) -> Result<()> {
    let service = build_service(config_path).await?;
    let reply = service.query(model, prompt).await?;
    println!("{}", reply);
    Ok(())
}
