//! Runs a single query against the backend while keeping the
//! in-memory transcript and the history store in lockstep.
//!
//! The transcript lock is held for the whole query so that "append
//! user turn, call backend, append reply" happens as one unit with
//! respect to other queries and to clearing the history. Each query
//! runs on its own task, so a caller that goes away mid-query does not
//! leave a user turn behind without its reply.

use std::fmt;
use std::sync::Arc;
use std::time::Instant;

use tokio::sync::{Mutex, RwLock};

use super::db::{HistoryStore, PersistenceError};
use super::models::{Role, Transcript, Turn};
use crate::core::{AppConfig, ConfigError, ConfigStore};
use crate::llm::{BoxedModelGateway, GatewayError, ModelGateway};

/// Role recorded for the backend's reply
pub const REPLY_ROLE: Role = Role::System;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryState {
    Received,
    UserTurnPersisted,
    ModelSwitching,
    AwaitingCompletion,
    Completed,
    Failed,
}

impl fmt::Display for QueryState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            QueryState::Received => "received",
            QueryState::UserTurnPersisted => "user_turn_persisted",
            QueryState::ModelSwitching => "model_switching",
            QueryState::AwaitingCompletion => "awaiting_completion",
            QueryState::Completed => "completed",
            QueryState::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// Cheap to clone. Clones share the same config, transcript and
/// backend.
#[derive(Clone)]
pub struct QueryService {
    config: Arc<RwLock<ConfigStore>>,
    transcript: Arc<Mutex<Transcript>>,
    store: HistoryStore,
    gateway: Arc<dyn ModelGateway>,
}

impl QueryService {
    /// Create a service with an empty transcript
    pub fn new(config: ConfigStore, store: HistoryStore, gateway: BoxedModelGateway) -> Self {
        Self {
            config: Arc::new(RwLock::new(config)),
            transcript: Arc::new(Mutex::new(Transcript::new())),
            store,
            gateway: Arc::from(gateway),
        }
    }

    /// Create a service whose transcript is reloaded from the store. A
    /// store that can't be read is logged and the service starts with
    /// an empty transcript.
    pub async fn restore(
        config: ConfigStore,
        store: HistoryStore,
        gateway: BoxedModelGateway,
    ) -> Self {
        let transcript = match store.load_all().await {
            Ok(turns) => {
                tracing::info!(
                    "Loaded {} turns from {}",
                    turns.len(),
                    store.path().display()
                );
                Transcript::new_with_turns(turns)
            }
            Err(e) => {
                tracing::error!("Unable to retrieve conversation history: {}", e);
                Transcript::new()
            }
        };
        Self {
            config: Arc::new(RwLock::new(config)),
            transcript: Arc::new(Mutex::new(transcript)),
            store,
            gateway: Arc::from(gateway),
        }
    }

    pub async fn config(&self) -> AppConfig {
        self.config.read().await.config().clone()
    }

    pub async fn max_tokens(&self) -> u32 {
        self.config.read().await.max_tokens()
    }

    /// Update and persist the token limit used for subsequent queries
    pub async fn set_max_tokens(&self, max_tokens: u32) -> Result<(), ConfigError> {
        let mut config = self.config.write().await;
        config.set_max_tokens(max_tokens).await?;
        tracing::info!("Max tokens set to {}", max_tokens);
        Ok(())
    }

    /// Snapshot of the current transcript
    pub async fn history(&self) -> Vec<Turn> {
        self.transcript.lock().await.all().to_vec()
    }

    /// Truncate the store and then the transcript. If the store can't
    /// be cleared the transcript is left untouched.
    pub async fn clear_history(&self) -> Result<(), PersistenceError> {
        let mut transcript = self.transcript.lock().await;
        self.store.clear().await?;
        transcript.clear();
        tracing::info!("Conversation history cleared");
        Ok(())
    }

    /// Send `prompt` to `model` with the full conversation as context
    /// and return the reply.
    ///
    /// A failed model switch is logged and the completion is still
    /// attempted against whatever model is active. If the completion
    /// fails, the user turn is removed from both the transcript and the
    /// store. Store failures on their own never fail the query.
    ///
    /// Once polled, the query runs to completion even if the returned
    /// future is dropped.
    pub async fn query(&self, model: &str, prompt: &str) -> Result<String, GatewayError> {
        let service = self.clone();
        let model = model.to_string();
        let prompt = prompt.to_string();
        tokio::spawn(async move { service.run_query(&model, &prompt).await }).await?
    }

    async fn run_query(&self, model: &str, prompt: &str) -> Result<String, GatewayError> {
        let started = Instant::now();
        let mut transcript = self.transcript.lock().await;
        let max_tokens = self.max_tokens().await;

        let mut state = QueryState::Received;
        tracing::debug!("Query {}: model={} prompt={}", state, model, prompt);

        let mut user_turn = Turn::new(Role::User, prompt, model, max_tokens);
        user_turn.sequence = self.persist(&user_turn).await;
        let user_sequence = user_turn.sequence;
        transcript.push(user_turn);
        state = transition(state, QueryState::UserTurnPersisted);

        state = transition(state, QueryState::ModelSwitching);
        match self.gateway.switch_model(model).await {
            Ok(()) => tracing::info!("Model has been changed to {}", model),
            Err(e) => tracing::warn!("Unable to change model to {}: {}", model, e),
        }

        state = transition(state, QueryState::AwaitingCompletion);
        let result = self
            .gateway
            .complete(model, transcript.all(), max_tokens)
            .await;
        let reply = match result {
            Ok(reply) => reply,
            Err(e) => {
                transition(state, QueryState::Failed);
                tracing::error!("Query to {} failed: {}", model, e);
                transcript.pop();
                if let Some(sequence) = user_sequence {
                    if let Err(e) = self.store.remove(sequence).await {
                        tracing::error!(
                            "Unable to remove turn {} after failed query: {}",
                            sequence,
                            e
                        );
                    }
                }
                return Err(e);
            }
        };

        let mut reply_turn = Turn::new(REPLY_ROLE, &reply, model, max_tokens);
        reply_turn.sequence = self.persist(&reply_turn).await;
        transcript.push(reply_turn);
        transition(state, QueryState::Completed);

        tracing::info!("Response: {}", reply);
        tracing::debug!("Total time: {:?}", started.elapsed());
        Ok(reply)
    }

    /// Append to the store, logging rather than propagating failures
    async fn persist(&self, turn: &Turn) -> Option<i64> {
        match self.store.append(turn).await {
            Ok(sequence) => Some(sequence),
            Err(e) => {
                tracing::error!("Storage of {} turn failed: {}", turn.role, e);
                None
            }
        }
    }
}

fn transition(from: QueryState, to: QueryState) -> QueryState {
    tracing::trace!("Query state {} -> {}", from, to);
    to
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use mockito::{Matcher, Server};
    use serde_json::json;
    use tempfile::{TempDir, tempdir};

    use super::*;
    use crate::llm::RelayClient;

    const HI_THERE: &str = r#"{"choices":[{"message":{"role":"assistant","content":"Hi there"}}]}"#;

    fn test_config(dir: &TempDir) -> ConfigStore {
        let config = AppConfig {
            api_host: String::from("127.0.0.1"),
            api_port: 0,
            llm_host: String::from("127.0.0.1"),
            llm_port: 0,
            llm_maxtokens: 100,
            api_db: dir.path().join("history.db").display().to_string(),
            llm_timeout_secs: 5,
        };
        ConfigStore::new(dir.path().join("api.json"), config)
    }

    fn gateway(server: &Server) -> BoxedModelGateway {
        Box::new(RelayClient::new(&server.url(), Duration::from_secs(5)).unwrap())
    }

    fn service(server: &Server, dir: &TempDir) -> QueryService {
        let store = HistoryStore::new(dir.path().join("history.db"));
        QueryService::new(test_config(dir), store, gateway(server))
    }

    async fn mock_switch(server: &mut Server, model: &str, status: usize) -> mockito::Mock {
        server
            .mock("PUT", format!("/model/{}", model).as_str())
            .with_status(status)
            .expect_at_least(1)
            .create_async()
            .await
    }

    async fn mock_completion(server: &mut Server, status: usize, body: &str) -> mockito::Mock {
        server
            .mock("POST", "/relay/v1/chat/completions")
            .with_status(status)
            .with_header("content-type", "application/json")
            .with_body(body)
            .expect_at_least(1)
            .create_async()
            .await
    }

    // Replies only after `delay`, long after the caller gave up
    struct SlowGateway {
        delay: Duration,
    }

    #[async_trait::async_trait]
    impl ModelGateway for SlowGateway {
        async fn switch_model(&self, _model: &str) -> Result<(), GatewayError> {
            Ok(())
        }

        async fn complete(
            &self,
            _model: &str,
            _turns: &[Turn],
            _max_tokens: u32,
        ) -> Result<String, GatewayError> {
            tokio::time::sleep(self.delay).await;
            Ok(String::from("Sorry for the wait"))
        }
    }

    fn roles_and_contents(turns: &[Turn]) -> Vec<(Role, String)> {
        turns.iter().map(|t| (t.role, t.content.clone())).collect()
    }

    #[tokio::test]
    async fn it_relays_a_query_and_records_both_turns() {
        let mut server = Server::new_async().await;
        let switch = mock_switch(&mut server, "modelA", 200).await;
        let completion = server
            .mock("POST", "/relay/v1/chat/completions")
            .match_body(Matcher::Json(json!({
                "model": "modelA",
                "messages": [{"role": "user", "content": "Hello"}],
                "max_tokens": 100
            })))
            .with_status(200)
            .with_body(HI_THERE)
            .create_async()
            .await;
        let dir = tempdir().unwrap();
        let service = service(&server, &dir);

        let reply = service.query("modelA", "Hello").await.unwrap();

        switch.assert_async().await;
        completion.assert_async().await;
        assert_eq!(reply, "Hi there");

        let expected = vec![
            (Role::User, String::from("Hello")),
            (Role::System, String::from("Hi there")),
        ];
        assert_eq!(roles_and_contents(&service.history().await), expected);

        let stored = HistoryStore::new(dir.path().join("history.db"))
            .load_all()
            .await
            .unwrap();
        assert_eq!(roles_and_contents(&stored), expected);
        assert_eq!(stored[0].model, "modelA");
        assert_eq!(stored[0].max_tokens, 100);
        assert_eq!(service.history().await, stored);
    }

    #[tokio::test]
    async fn it_sends_prior_turns_as_context() {
        let mut server = Server::new_async().await;
        let _switch = mock_switch(&mut server, "modelA", 200).await;
        let first = server
            .mock("POST", "/relay/v1/chat/completions")
            .match_body(Matcher::Json(json!({
                "model": "modelA",
                "messages": [{"role": "user", "content": "Hello"}],
                "max_tokens": 100
            })))
            .with_body(HI_THERE)
            .create_async()
            .await;
        let second = server
            .mock("POST", "/relay/v1/chat/completions")
            .match_body(Matcher::Json(json!({
                "model": "modelA",
                "messages": [
                    {"role": "user", "content": "Hello"},
                    {"role": "system", "content": "Hi there"},
                    {"role": "user", "content": "And again"}
                ],
                "max_tokens": 100
            })))
            .with_body(r#"{"choices":[{"message":{"content":"Again"}}]}"#)
            .create_async()
            .await;
        let dir = tempdir().unwrap();
        let service = service(&server, &dir);

        service.query("modelA", "Hello").await.unwrap();
        let reply = service.query("modelA", "And again").await.unwrap();

        first.assert_async().await;
        second.assert_async().await;
        assert_eq!(reply, "Again");
        assert_eq!(service.history().await.len(), 4);
    }

    #[tokio::test]
    async fn it_completes_even_when_model_switch_fails() {
        let mut server = Server::new_async().await;
        let switch = mock_switch(&mut server, "modelA", 500).await;
        let completion = mock_completion(&mut server, 200, HI_THERE).await;
        let dir = tempdir().unwrap();
        let service = service(&server, &dir);

        let reply = service.query("modelA", "Hello").await.unwrap();

        switch.assert_async().await;
        completion.assert_async().await;
        assert_eq!(reply, "Hi there");
        assert_eq!(service.history().await.len(), 2);
    }

    #[tokio::test]
    async fn it_leaves_history_untouched_when_backend_fails() {
        let mut server = Server::new_async().await;
        let _switch = mock_switch(&mut server, "modelA", 200).await;
        let ok = mock_completion(&mut server, 200, HI_THERE).await;
        let dir = tempdir().unwrap();
        let service = service(&server, &dir);
        service.query("modelA", "Hello").await.unwrap();
        ok.remove_async().await;

        let _fail = mock_completion(&mut server, 503, "unavailable").await;
        let result = service.query("modelA", "Are you there?").await;

        assert!(matches!(result, Err(GatewayError::Status { status: 503, .. })));
        let expected = vec![
            (Role::User, String::from("Hello")),
            (Role::System, String::from("Hi there")),
        ];
        assert_eq!(roles_and_contents(&service.history().await), expected);
        let stored = HistoryStore::new(dir.path().join("history.db"))
            .load_all()
            .await
            .unwrap();
        assert_eq!(roles_and_contents(&stored), expected);
    }

    #[tokio::test]
    async fn it_fails_explicitly_on_malformed_reply() {
        let mut server = Server::new_async().await;
        let _switch = mock_switch(&mut server, "modelA", 200).await;
        let _completion = mock_completion(&mut server, 200, r#"{"choices":[]}"#).await;
        let dir = tempdir().unwrap();
        let service = service(&server, &dir);

        let result = service.query("modelA", "Hello").await;

        assert!(matches!(result, Err(GatewayError::ResponseShape(_))));
        assert!(service.history().await.is_empty());
    }

    #[tokio::test]
    async fn it_fails_explicitly_when_backend_is_unreachable() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let dir = tempdir().unwrap();
        let store = HistoryStore::new(dir.path().join("history.db"));
        let gateway =
            RelayClient::new(&format!("http://{}", addr), Duration::from_secs(2)).unwrap();
        let service = QueryService::new(test_config(&dir), store.clone(), Box::new(gateway));

        let result = service.query("modelA", "Hello").await;

        assert!(result.unwrap_err().is_transport());
        assert!(service.history().await.is_empty());
        assert!(store.load_all().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn it_returns_reply_when_persistence_fails() {
        let mut server = Server::new_async().await;
        let _switch = mock_switch(&mut server, "modelA", 200).await;
        let _completion = mock_completion(&mut server, 200, HI_THERE).await;
        let dir = tempdir().unwrap();
        let store = HistoryStore::new(dir.path().join("missing").join("history.db"));
        let service = QueryService::new(test_config(&dir), store, gateway(&server));

        let reply = service.query("modelA", "Hello").await.unwrap();

        assert_eq!(reply, "Hi there");
        let history = service.history().await;
        assert_eq!(history.len(), 2);
        assert!(history.iter().all(|t| t.sequence.is_none()));
    }

    #[tokio::test]
    async fn it_restores_history_after_restart() {
        let mut server = Server::new_async().await;
        let _switch = mock_switch(&mut server, "modelA", 200).await;
        let _completion = mock_completion(&mut server, 200, HI_THERE).await;
        let dir = tempdir().unwrap();

        let before = {
            let service = service(&server, &dir);
            service.query("modelA", "Hello").await.unwrap();
            service.query("modelA", "Tell me \"more\"").await.unwrap();
            service.history().await
        };

        let store = HistoryStore::new(dir.path().join("history.db"));
        let restarted = QueryService::restore(test_config(&dir), store, gateway(&server)).await;

        assert_eq!(restarted.history().await, before);
        assert_eq!(before.len(), 4);
    }

    #[tokio::test]
    async fn it_clears_memory_and_store() {
        let mut server = Server::new_async().await;
        let _switch = mock_switch(&mut server, "modelA", 200).await;
        let _completion = mock_completion(&mut server, 200, HI_THERE).await;
        let dir = tempdir().unwrap();
        let service = service(&server, &dir);
        service.query("modelA", "Hello").await.unwrap();

        service.clear_history().await.unwrap();

        assert!(service.history().await.is_empty());
        let store = HistoryStore::new(dir.path().join("history.db"));
        let restarted = QueryService::restore(test_config(&dir), store, gateway(&server)).await;
        assert!(restarted.history().await.is_empty());
    }

    #[tokio::test]
    async fn it_keeps_transcript_when_store_cannot_be_cleared() {
        let mut server = Server::new_async().await;
        let _switch = mock_switch(&mut server, "modelA", 200).await;
        let _completion = mock_completion(&mut server, 200, HI_THERE).await;
        let dir = tempdir().unwrap();
        let store = HistoryStore::new(dir.path().join("missing").join("history.db"));
        let service = QueryService::new(test_config(&dir), store, gateway(&server));
        service.query("modelA", "Hello").await.unwrap();

        assert!(service.clear_history().await.is_err());
        assert_eq!(service.history().await.len(), 2);
    }

    #[tokio::test]
    async fn it_uses_updated_max_tokens() {
        let mut server = Server::new_async().await;
        let _switch = mock_switch(&mut server, "modelA", 200).await;
        let completion = server
            .mock("POST", "/relay/v1/chat/completions")
            .match_body(Matcher::PartialJson(json!({"max_tokens": 50})))
            .with_body(HI_THERE)
            .create_async()
            .await;
        let dir = tempdir().unwrap();
        let service = service(&server, &dir);

        service.set_max_tokens(50).await.unwrap();
        service.query("modelA", "Hello").await.unwrap();

        completion.assert_async().await;
        assert_eq!(service.max_tokens().await, 50);
        assert!(service.history().await.iter().all(|t| t.max_tokens == 50));
        let reloaded = ConfigStore::load(dir.path().join("api.json")).unwrap();
        assert_eq!(reloaded.max_tokens(), 50);
    }

    #[tokio::test]
    async fn it_finishes_a_query_when_the_caller_goes_away() {
        let dir = tempdir().unwrap();
        let store = HistoryStore::new(dir.path().join("history.db"));
        let gateway = SlowGateway {
            delay: Duration::from_millis(300),
        };
        let service = QueryService::new(test_config(&dir), store.clone(), Box::new(gateway));

        let abandoned =
            tokio::time::timeout(Duration::from_millis(50), service.query("modelA", "Hello")).await;
        assert!(abandoned.is_err());

        // Waits on the transcript lock until the query has finished
        let expected = vec![
            (Role::User, String::from("Hello")),
            (Role::System, String::from("Sorry for the wait")),
        ];
        assert_eq!(roles_and_contents(&service.history().await), expected);
        assert_eq!(roles_and_contents(&store.load_all().await.unwrap()), expected);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn it_serializes_concurrent_queries() {
        let mut server = Server::new_async().await;
        let _switch = server
            .mock("PUT", Matcher::Regex(String::from(r"^/model/.+$")))
            .with_status(200)
            .create_async()
            .await;
        let _completion = mock_completion(&mut server, 200, HI_THERE).await;
        let dir = tempdir().unwrap();
        let service = Arc::new(service(&server, &dir));

        let mut tasks = tokio::task::JoinSet::new();
        for i in 0..6 {
            let service = Arc::clone(&service);
            tasks.spawn(async move { service.query("modelA", &format!("prompt {}", i)).await });
        }
        while let Some(result) = tasks.join_next().await {
            assert_eq!(result.unwrap().unwrap(), "Hi there");
        }

        let stored = HistoryStore::new(dir.path().join("history.db"))
            .load_all()
            .await
            .unwrap();
        assert_eq!(stored.len(), 12);
        // Every user turn is immediately followed by its reply
        for pair in stored.chunks(2) {
            assert_eq!(pair[0].role, Role::User);
            assert_eq!(pair[1].role, Role::System);
        }
        let sequences: Vec<i64> = stored.iter().filter_map(|t| t.sequence).collect();
        assert!(sequences.windows(2).all(|w| w[0] < w[1]));
        assert_eq!(service.history().await, stored);
    }
}
