use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::{Client, Url};
use serde_json::json;

use super::factory::ModelParameters;

#[async_trait]
pub trait LLMProvider: Send + Sync {
    async fn generate(&self, model: &str, prompt: String, system: Option<String>) -> Result<String>;
}

/// Builds provider clients for one provider id.
///
/// The model factory calls `connect` at most once per distinct
/// (provider, model, parameters) key; failures are reported back to every
/// caller waiting on that key and are never cached.
#[async_trait]
pub trait ProviderConnector: Send + Sync {
    fn provider_id(&self) -> &str;

    async fn connect(&self, model: &str, parameters: &ModelParameters) -> Result<Arc<dyn LLMProvider>>;
}

pub struct OllamaProvider {
    client: ollama_rs::Ollama,
}

impl OllamaProvider {
    pub fn new(client: ollama_rs::Ollama) -> Self {
        Self { client }
    }
}

#[async_trait]
impl LLMProvider for OllamaProvider {
    async fn generate(&self, model: &str, prompt: String, system: Option<String>) -> Result<String> {
        use ollama_rs::generation::chat::{request::ChatMessageRequest, ChatMessage};

        let mut messages = Vec::new();
        if let Some(sys) = system {
            messages.push(ChatMessage::system(sys));
        }
        messages.push(ChatMessage::user(prompt));

        let res = self
            .client
            .send_chat_messages(ChatMessageRequest::new(model.to_string(), messages))
            .await?;

        Ok(res.message.content)
    }
}

pub struct OpenAICompatibleProvider {
    client: Client,
    base_url: String,
    api_key: Option<String>,
    parameters: ModelParameters,
}

impl OpenAICompatibleProvider {
    pub fn new(base_url: String, api_key: Option<String>) -> Self {
        Self {
            client: Client::new(),
            base_url,
            api_key,
            parameters: ModelParameters::default(),
        }
    }

    pub fn with_parameters(mut self, parameters: ModelParameters) -> Self {
        self.parameters = parameters;
        self
    }
}

#[async_trait]
impl LLMProvider for OpenAICompatibleProvider {
    async fn generate(&self, model: &str, prompt: String, system: Option<String>) -> Result<String> {
        let mut messages = Vec::new();
        if let Some(sys) = system {
            messages.push(json!({ "role": "system", "content": sys }));
        }
        messages.push(json!({ "role": "user", "content": prompt }));

        let mut body = json!({
            "model": model,
            "messages": messages,
            "temperature": self.parameters.temperature.unwrap_or(0.7),
        });
        if let Some(max_tokens) = self.parameters.max_tokens {
            body["max_tokens"] = json!(max_tokens);
        }
        for (key, value) in &self.parameters.additional {
            body[key.as_str()] = value.clone();
        }

        let mut request = self
            .client
            .post(format!("{}/chat/completions", self.base_url.trim_end_matches('/')))
            .json(&body);

        if let Some(ref key) = self.api_key {
            request = request.bearer_auth(key);
        }

        let res = request.send().await?.error_for_status()?;
        let json: serde_json::Value = res.json().await?;

        let content = json["choices"][0]["message"]["content"]
            .as_str()
            .context("Failed to parse content from OpenAI response")?;

        Ok(content.to_string())
    }
}

pub struct OllamaConnector {
    base_url: String,
}

impl OllamaConnector {
    pub const DEFAULT_URL: &'static str = "http://localhost:11434";

    pub fn new(base_url: Option<String>) -> Self {
        Self {
            base_url: base_url.unwrap_or_else(|| Self::DEFAULT_URL.to_string()),
        }
    }
}

#[async_trait]
impl ProviderConnector for OllamaConnector {
    fn provider_id(&self) -> &str {
        "ollama"
    }

    async fn connect(&self, model: &str, _parameters: &ModelParameters) -> Result<Arc<dyn LLMProvider>> {
        if model.trim().is_empty() {
            anyhow::bail!("ollama requires a model name");
        }
        // ollama-rs panics on malformed hosts, so reject them here.
        let url = Url::parse(&self.base_url)
            .with_context(|| format!("invalid ollama base_url '{}'", self.base_url))?;
        let host = url
            .host_str()
            .with_context(|| format!("ollama base_url '{}' has no host", self.base_url))?;
        let port = url.port_or_known_default().unwrap_or(11434);
        let client = ollama_rs::Ollama::new(format!("{}://{}", url.scheme(), host), port);
        Ok(Arc::new(OllamaProvider::new(client)))
    }
}

pub struct OpenAIConnector {
    base_url: String,
    api_key: Option<String>,
}

impl OpenAIConnector {
    pub const DEFAULT_URL: &'static str = "https://api.openai.com/v1";

    pub fn new(base_url: Option<String>, api_key: Option<String>) -> Self {
        Self {
            base_url: base_url.unwrap_or_else(|| Self::DEFAULT_URL.to_string()),
            api_key,
        }
    }
}

#[async_trait]
impl ProviderConnector for OpenAIConnector {
    fn provider_id(&self) -> &str {
        "openai"
    }

    async fn connect(&self, model: &str, parameters: &ModelParameters) -> Result<Arc<dyn LLMProvider>> {
        let api_key = self
            .api_key
            .clone()
            .filter(|key| !key.trim().is_empty())
            .context("an api_key is required for the openai provider")?;
        if model.trim().is_empty() {
            anyhow::bail!("openai requires a model name");
        }
        Url::parse(&self.base_url)
            .with_context(|| format!("invalid openai base_url '{}'", self.base_url))?;

        let provider = OpenAICompatibleProvider::new(self.base_url.clone(), Some(api_key))
            .with_parameters(parameters.clone());
        Ok(Arc::new(provider))
    }
}
