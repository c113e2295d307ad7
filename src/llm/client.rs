use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;

use super::GatewayError;
use crate::chat::{Role, Turn};
use crate::core::AppConfig;

// Only role and content go over the wire. Model and token limit are
// request level fields.
#[derive(Serialize, Debug, PartialEq)]
pub struct Message<'a> {
    pub role: Role,
    pub content: &'a str,
}

// {
//     "model": "string",
//     "messages": [{"role": "system|user|assistant", "content": "string"}],
//     "max_tokens": integer
// }
#[derive(Serialize, Debug)]
pub struct ChatCompletionRequest<'a> {
    pub model: &'a str,
    pub messages: Vec<Message<'a>>,
    pub max_tokens: u32,
}

impl<'a> ChatCompletionRequest<'a> {
    pub fn new(model: &'a str, turns: &'a [Turn], max_tokens: u32) -> Self {
        let messages = turns
            .iter()
            .map(|t| Message {
                role: t.role,
                content: &t.content,
            })
            .collect();
        Self {
            model,
            messages,
            max_tokens,
        }
    }
}

/// Pulls `choices[0].message.content` out of a chat completion
/// response body.
pub fn extract_content(body: &str) -> Result<String, GatewayError> {
    let resp: Value = serde_json::from_str(body)
        .map_err(|e| GatewayError::ResponseShape(format!("Invalid JSON ({}): {}", e, body)))?;
    resp["choices"][0]["message"]["content"]
        .as_str()
        .map(String::from)
        .ok_or_else(|| {
            GatewayError::ResponseShape(format!(
                "Missing choices[0].message.content in {}",
                resp
            ))
        })
}

/// The two operations the gateway needs from a model backend.
#[async_trait]
pub trait ModelGateway: Send + Sync {
    /// Ask the backend to activate `model` for subsequent completions
    async fn switch_model(&self, model: &str) -> Result<(), GatewayError>;

    /// Send the conversation and return the reply text
    async fn complete(
        &self,
        model: &str,
        turns: &[Turn],
        max_tokens: u32,
    ) -> Result<String, GatewayError>;
}

pub type BoxedModelGateway = Box<dyn ModelGateway + 'static>;

/// HTTP client for a model relay exposing `/model/{id}` and an OpenAI
/// compatible `/relay/v1/chat/completions`.
#[derive(Clone, Debug)]
pub struct RelayClient {
    base_url: String,
    timeout: Duration,
    client: reqwest::Client,
}

impl RelayClient {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, GatewayError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(GatewayError::Client)?;
        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            timeout,
            client,
        })
    }

    pub fn from_config(config: &AppConfig) -> Result<Self, GatewayError> {
        Self::new(&config.backend_url(), config.llm_timeout())
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn model_url(&self, model: &str) -> String {
        format!("{}/model/{}", self.base_url, urlencoding::encode(model))
    }

    fn completions_url(&self) -> String {
        format!("{}/relay/v1/chat/completions", self.base_url)
    }

    fn request_error(&self, url: &str, err: reqwest::Error) -> GatewayError {
        if err.is_timeout() {
            GatewayError::Timeout {
                url: url.to_string(),
                timeout: self.timeout,
            }
        } else {
            GatewayError::Transport {
                url: url.to_string(),
                source: err,
            }
        }
    }

    /// Reads the body and fails on any non-2xx status
    async fn read_body(&self, url: &str, resp: reqwest::Response) -> Result<String, GatewayError> {
        let status = resp.status();
        let body = resp
            .text()
            .await
            .map_err(|e| self.request_error(url, e))?;
        if !status.is_success() {
            return Err(GatewayError::Status {
                url: url.to_string(),
                status: status.as_u16(),
                body,
            });
        }
        Ok(body)
    }
}

#[async_trait]
impl ModelGateway for RelayClient {
    async fn switch_model(&self, model: &str) -> Result<(), GatewayError> {
        let url = self.model_url(model);
        tracing::info!("Changing model to {} via {}", model, url);
        let resp = self
            .client
            .put(&url)
            .send()
            .await
            .map_err(|e| self.request_error(&url, e))?;
        self.read_body(&url, resp).await?;
        Ok(())
    }

    async fn complete(
        &self,
        model: &str,
        turns: &[Turn],
        max_tokens: u32,
    ) -> Result<String, GatewayError> {
        let url = self.completions_url();
        let payload = ChatCompletionRequest::new(model, turns, max_tokens);
        tracing::debug!(
            "Sending {} messages to {} (model={}, max_tokens={})",
            payload.messages.len(),
            url,
            model,
            max_tokens
        );
        let resp = self
            .client
            .post(&url)
            .json(&payload)
            .send()
            .await
            .map_err(|e| self.request_error(&url, e))?;
        let body = self.read_body(&url, resp).await?;
        extract_content(&body)
    }
}
