use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Deserializer, Serialize};
use thiserror::Error;

const DEFAULT_LLM_TIMEOUT_SECS: u64 = 120;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Unable to read config file {}: {source}", .path.display())]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("Malformed config file {}: {source}", .path.display())]
    Parse {
        path: PathBuf,
        source: serde_json::Error,
    },
    #[error("Unable to write config file {}: {source}", .path.display())]
    Write {
        path: PathBuf,
        source: std::io::Error,
    },
}

/// Runtime parameters for the gateway. The field names match the keys
/// of the JSON config file.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct AppConfig {
    pub api_host: String,
    #[serde(deserialize_with = "number_or_string")]
    pub api_port: u16,
    pub llm_host: String,
    #[serde(deserialize_with = "number_or_string")]
    pub llm_port: u16,
    #[serde(deserialize_with = "number_or_string")]
    pub llm_maxtokens: u32,
    pub api_db: String,
    #[serde(default = "default_llm_timeout_secs")]
    pub llm_timeout_secs: u64,
}

fn default_llm_timeout_secs() -> u64 {
    DEFAULT_LLM_TIMEOUT_SECS
}

// Older config files store ports and token limits as strings
fn number_or_string<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: std::str::FromStr + Deserialize<'de>,
    T::Err: std::fmt::Display,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw<T> {
        Number(T),
        Text(String),
    }

    match Raw::<T>::deserialize(deserializer)? {
        Raw::Number(n) => Ok(n),
        Raw::Text(s) => s.trim().parse::<T>().map_err(serde::de::Error::custom),
    }
}

impl AppConfig {
    /// Base URL of the model backend, e.g. `http://127.0.0.1:8000`
    pub fn backend_url(&self) -> String {
        let host = self.llm_host.trim_end_matches('/');
        if host.starts_with("http://") || host.starts_with("https://") {
            format!("{}:{}", host, self.llm_port)
        } else {
            format!("http://{}:{}", host, self.llm_port)
        }
    }

    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.api_host, self.api_port)
    }

    pub fn llm_timeout(&self) -> Duration {
        Duration::from_secs(self.llm_timeout_secs)
    }
}

/// Holds the loaded config along with the file it came from so that
/// runtime changes can be written back.
#[derive(Debug)]
pub struct ConfigStore {
    path: PathBuf,
    config: AppConfig,
}

impl ConfigStore {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref().to_path_buf();
        let raw = fs::read_to_string(&path).map_err(|source| ConfigError::Read {
            path: path.clone(),
            source,
        })?;
        let config = serde_json::from_str(&raw).map_err(|source| ConfigError::Parse {
            path: path.clone(),
            source,
        })?;
        Ok(Self { path, config })
    }

    /// Wrap an in-memory config that will be persisted to `path` on
    /// the next update.
    pub fn new(path: impl AsRef<Path>, config: AppConfig) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            config,
        }
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn max_tokens(&self) -> u32 {
        self.config.llm_maxtokens
    }

    /// Update the default token limit and persist it. The in-memory
    /// value only changes once the file has been replaced.
    pub async fn set_max_tokens(&mut self, max_tokens: u32) -> Result<(), ConfigError> {
        let mut updated = self.config.clone();
        updated.llm_maxtokens = max_tokens;
        let contents = serde_json::to_string_pretty(&updated).map_err(|source| {
            ConfigError::Parse {
                path: self.path.clone(),
                source,
            }
        })?;

        let path = self.path.clone();
        tokio::task::spawn_blocking(move || write_atomic(&path, &contents))
            .await
            .map_err(std::io::Error::from)
            .and_then(|written| written)
            .map_err(|source| ConfigError::Write {
                path: self.path.clone(),
                source,
            })?;
        self.config = updated;
        Ok(())
    }
}

// Write to a sibling temp file and rename it over `path` so readers
// never see a partial file
fn write_atomic(path: &Path, contents: &str) -> std::io::Result<()> {
    let mut tmp_name = path.as_os_str().to_owned();
    tmp_name.push(".tmp");
    let tmp_path = PathBuf::from(tmp_name);

    let result = (|| {
        let mut file = fs::File::create(&tmp_path)?;
        file.write_all(contents.as_bytes())?;
        file.sync_all()?;
        fs::rename(&tmp_path, path)
    })();

    if result.is_err() {
        let _ = fs::remove_file(&tmp_path);
    }
    result
}
