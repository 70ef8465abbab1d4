//! Model provider seam and the OpenAI-compatible HTTP client.
//!
//! One turn makes exactly one completion call (plus at most one
//! regeneration driven by the enforcement gate). There is no retry
//! loop here; provider failures surface as `LlmError` and the caller
//! degrades to a static fallback reply.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use parley_core::config::LlmConfig;
use secrecy::ExposeSecret;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatRole {
    User,
    Assistant,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: ChatRole,
    pub content: String,
}

impl ChatMessage {
    pub fn user(content: impl Into<String>) -> Self {
        Self { role: ChatRole::User, content: content.into() }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self { role: ChatRole::Assistant, content: content.into() }
    }
}

#[derive(Debug, Error)]
pub enum LlmError {
    #[error("provider transport error: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("provider returned status {status}: {body}")]
    Provider { status: u16, body: String },
    #[error("provider returned an empty completion")]
    EmptyCompletion,
    #[error("llm client misconfigured: {0}")]
    Configuration(String),
    #[error("scripted client exhausted")]
    Exhausted,
}

#[async_trait]
pub trait LlmClient: Send + Sync {
    /// One blocking completion call. `instructions` is the system
    /// block; `messages` carries the capped history plus the new
    /// utterance.
    async fn complete(
        &self,
        instructions: &str,
        messages: &[ChatMessage],
    ) -> Result<String, LlmError>;
}

/// HTTP client for any provider speaking the OpenAI chat-completions
/// wire shape (OpenAI itself, Ollama's `/v1` endpoint, gateways).
pub struct OpenAiCompatClient {
    http: reqwest::Client,
    base_url: String,
    model: String,
    api_key: Option<String>,
}

#[derive(Serialize)]
struct WireMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Serialize)]
struct CompletionRequest<'a> {
    model: &'a str,
    messages: Vec<WireMessage<'a>>,
}

#[derive(Deserialize)]
struct CompletionResponse {
    choices: Vec<CompletionChoice>,
}

#[derive(Deserialize)]
struct CompletionChoice {
    message: CompletionMessage,
}

#[derive(Deserialize)]
struct CompletionMessage {
    content: Option<String>,
}

impl OpenAiCompatClient {
    pub fn from_config(config: &LlmConfig) -> Result<Self, LlmError> {
        let base_url = config
            .base_url
            .as_deref()
            .map(str::trim)
            .filter(|url| !url.is_empty())
            .ok_or_else(|| LlmError::Configuration("llm.base_url is not set".to_string()))?
            .trim_end_matches('/')
            .to_string();

        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;

        Ok(Self {
            http,
            base_url,
            model: config.model.clone(),
            api_key: config.api_key.as_ref().map(|key| key.expose_secret().to_string()),
        })
    }
}

#[async_trait]
impl LlmClient for OpenAiCompatClient {
    async fn complete(
        &self,
        instructions: &str,
        messages: &[ChatMessage],
    ) -> Result<String, LlmError> {
        let mut wire = Vec::with_capacity(messages.len() + 1);
        wire.push(WireMessage { role: "system", content: instructions });
        for message in messages {
            let role = match message.role {
                ChatRole::User => "user",
                ChatRole::Assistant => "assistant",
            };
            wire.push(WireMessage { role, content: &message.content });
        }

        let url = format!("{}/v1/chat/completions", self.base_url);
        let mut request = self
            .http
            .post(&url)
            .json(&CompletionRequest { model: &self.model, messages: wire });
        if let Some(api_key) = &self.api_key {
            request = request.bearer_auth(api_key);
        }

        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(LlmError::Provider { status: status.as_u16(), body });
        }

        let completion: CompletionResponse = response.json().await?;
        completion
            .choices
            .into_iter()
            .next()
            .and_then(|choice| choice.message.content)
            .filter(|content| !content.trim().is_empty())
            .ok_or(LlmError::EmptyCompletion)
    }
}

/// Test double that replays a fixed sequence of drafts. A `None` entry
/// simulates a provider outage for that call.
#[derive(Default)]
pub struct ScriptedLlmClient {
    replies: Mutex<VecDeque<Option<String>>>,
}

impl ScriptedLlmClient {
    pub fn new(replies: impl IntoIterator<Item = &'static str>) -> Self {
        Self {
            replies: Mutex::new(replies.into_iter().map(|reply| Some(reply.to_string())).collect()),
        }
    }

    pub fn failing() -> Self {
        Self { replies: Mutex::new(VecDeque::from([None])) }
    }

    pub fn push_failure(&self) {
        self.replies.lock().expect("lock").push_back(None);
    }

    pub fn push_reply(&self, reply: impl Into<String>) {
        self.replies.lock().expect("lock").push_back(Some(reply.into()));
    }
}

#[async_trait]
impl LlmClient for ScriptedLlmClient {
    async fn complete(
        &self,
        _instructions: &str,
        _messages: &[ChatMessage],
    ) -> Result<String, LlmError> {
        match self.replies.lock().expect("lock").pop_front() {
            Some(Some(reply)) => Ok(reply),
            Some(None) => Err(LlmError::Provider { status: 503, body: "scripted outage".into() }),
            None => Err(LlmError::Exhausted),
        }
    }
}

#[cfg(test)]
mod tests {
    use parley_core::config::{LlmConfig, LlmProvider};

    use super::{LlmClient, LlmError, OpenAiCompatClient, ScriptedLlmClient};

    #[test]
    fn client_requires_a_base_url() {
        let config = LlmConfig {
            provider: LlmProvider::Ollama,
            api_key: None,
            base_url: None,
            model: "llama3.1".to_string(),
            timeout_secs: 30,
        };
        assert!(matches!(
            OpenAiCompatClient::from_config(&config),
            Err(LlmError::Configuration(_))
        ));
    }

    #[tokio::test]
    async fn scripted_client_replays_in_order_then_exhausts() {
        let client = ScriptedLlmClient::new(["first", "second"]);
        assert_eq!(client.complete("", &[]).await.expect("first"), "first");
        assert_eq!(client.complete("", &[]).await.expect("second"), "second");
        assert!(matches!(client.complete("", &[]).await, Err(LlmError::Exhausted)));
    }
}
