//! Language model capability
//!
//! [`OpenAiCompatibleModel`] talks to any OpenAI-style chat completions
//! endpoint through `async-openai`; a local Ollama server exposes one at
//! `http://localhost:11434/v1`.

use crate::config::LlmConfig;
use crate::error::{AgentError, Result};
use async_openai::types::{
    ChatCompletionRequestMessage, ChatCompletionRequestSystemMessage,
    ChatCompletionRequestSystemMessageContent, ChatCompletionRequestUserMessage,
    ChatCompletionRequestUserMessageContent, CreateChatCompletionRequestArgs,
};
use async_openai::{Client, config::OpenAIConfig};
use async_trait::async_trait;
use std::time::Duration;

/// Timeout for the server health probe
const HEALTH_CHECK_TIMEOUT: Duration = Duration::from_secs(2);

/// A system instruction plus the user message
#[derive(Debug, Clone, PartialEq)]
pub struct Prompt {
    pub system: String,
    pub user: String,
}

impl Prompt {
    pub fn new(system: impl Into<String>, user: impl Into<String>) -> Self {
        Self {
            system: system.into(),
            user: user.into(),
        }
    }

    pub fn char_len(&self) -> usize {
        self.system.chars().count() + self.user.chars().count()
    }
}

/// Sampling parameters for one completion
#[derive(Debug, Clone, PartialEq)]
pub struct GenerationParams {
    pub max_tokens: u32,
    pub temperature: f32,
}

impl Default for GenerationParams {
    fn default() -> Self {
        Self {
            max_tokens: 500,
            temperature: 0.7,
        }
    }
}

impl From<&LlmConfig> for GenerationParams {
    fn from(config: &LlmConfig) -> Self {
        Self {
            max_tokens: config.max_tokens,
            temperature: config.temperature,
        }
    }
}

/// Text generation capability
#[async_trait]
pub trait LanguageModel: Send + Sync {
    /// Generate a completion for `prompt`
    async fn complete(&self, prompt: &Prompt, params: &GenerationParams) -> Result<String>;

    /// Cheap reachability probe
    async fn health_check(&self) -> Result<()>;

    /// Human-readable model name
    fn name(&self) -> String;
}

/// Run one completion, mapping expiry of `timeout` to `GenerationFailed`
pub async fn complete_with_timeout(
    model: &dyn LanguageModel,
    prompt: &Prompt,
    params: &GenerationParams,
    timeout: Duration,
) -> Result<String> {
    match tokio::time::timeout(timeout, model.complete(prompt, params)).await {
        Ok(result) => result,
        Err(_) => Err(AgentError::GenerationFailed(format!(
            "{} did not answer within {:?}",
            model.name(),
            timeout
        ))),
    }
}

/// Chat-completions client for OpenAI-compatible servers
pub struct OpenAiCompatibleModel {
    client: Client<OpenAIConfig>,
    http: reqwest::Client,
    base_url: String,
    model: String,
}

impl OpenAiCompatibleModel {
    pub fn new(config: &LlmConfig) -> Result<Self> {
        if config.model.trim().is_empty() {
            return Err(AgentError::InvalidConfiguration(
                "llm.model must not be empty".to_string(),
            ));
        }
        let openai = OpenAIConfig::new()
            .with_api_key(config.api_key.clone())
            .with_api_base(config.base_url.clone());
        let http = reqwest::Client::builder()
            .timeout(HEALTH_CHECK_TIMEOUT)
            .build()
            .map_err(|e| AgentError::InvalidConfiguration(format!("HTTP client: {}", e)))?;

        Ok(Self {
            client: Client::with_config(openai),
            http,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            model: config.model.clone(),
        })
    }

    /// Server root, without the `/v1` API suffix
    fn server_root(&self) -> &str {
        self.base_url
            .strip_suffix("/v1")
            .unwrap_or(self.base_url.as_str())
    }
}

#[async_trait]
impl LanguageModel for OpenAiCompatibleModel {
    async fn complete(&self, prompt: &Prompt, params: &GenerationParams) -> Result<String> {
        let messages = vec![
            ChatCompletionRequestMessage::System(ChatCompletionRequestSystemMessage {
                content: ChatCompletionRequestSystemMessageContent::Text(prompt.system.clone()),
                name: None,
            }),
            ChatCompletionRequestMessage::User(ChatCompletionRequestUserMessage {
                content: ChatCompletionRequestUserMessageContent::Text(prompt.user.clone()),
                name: None,
            }),
        ];

        let request = CreateChatCompletionRequestArgs::default()
            .model(self.model.as_str())
            .messages(messages)
            .max_tokens(params.max_tokens)
            .temperature(params.temperature)
            .build()
            .map_err(|e| AgentError::GenerationFailed(format!("bad request: {}", e)))?;

        let response = self.client.chat().create(request).await.map_err(|e| {
            log::error!("Chat completion against {} failed: {}", self.base_url, e);
            AgentError::GenerationFailed(e.to_string())
        })?;

        let content = response
            .choices
            .first()
            .and_then(|choice| choice.message.content.as_ref())
            .map(|c| c.trim().to_string())
            .filter(|c| !c.is_empty())
            .ok_or_else(|| {
                log::error!("No content in chat response from {}", self.model);
                AgentError::GenerationFailed("empty response from model".to_string())
            })?;

        Ok(content)
    }

    async fn health_check(&self) -> Result<()> {
        let url = self.server_root().to_string();
        let response = self
            .http
            .get(&url)
            .send()
            .await
            .map_err(|e| AgentError::ExternalService(format!("{} unreachable: {}", url, e)))?;
        if response.status().is_success() {
            Ok(())
        } else {
            Err(AgentError::ExternalService(format!(
                "{} returned {}",
                url,
                response.status()
            )))
        }
    }

    fn name(&self) -> String {
        self.model.clone()
    }
}
