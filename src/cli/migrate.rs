use anyhow::Result;

use crate::chat::HistoryStore;
use crate::core::ConfigStore;

pub async fn run(config_path: &str) -> Result<()> {
    let config = ConfigStore::load(config_path)?;
    let store = HistoryStore::new(&config.config().api_db);
    println!("Migrating db at {}...", store.path().display());
    store.ensure_schema().await?;
    println!("Finished migrating db");
    Ok(())
}
