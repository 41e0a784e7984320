use super::models::{ModelRole, Usage};
use crate::config::{ConfigError, UserConfig};
use crate::util::{redact_secrets, truncate};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::debug;
use url::Url;

/// One generative-model invocation.
#[derive(Debug, Clone)]
pub struct ModelRequest {
    pub role: ModelRole,
    pub system: String,
    pub user: String,
    pub max_tokens: u32,
    pub temperature: f32,
}

/// Response from the model including latency and usage stats
#[derive(Debug, Clone)]
pub struct ModelResponse {
    pub content: String,
    pub latency: Duration,
    pub usage: Option<Usage>,
    pub model: String,
}

/// Failures at the model-call boundary. Messages never carry credentials.
#[derive(Debug, Clone, Error)]
pub enum ModelError {
    #[error("no API key configured")]
    MissingApiKey,

    #[error("transport failure: {0}")]
    Transport(String),

    #[error("model API returned {status}: {message}")]
    Status { status: u16, message: String },

    #[error("model call timed out after {0:?}")]
    Timeout(Duration),

    #[error("could not decode model response: {0}")]
    Decode(String),

    #[error("model returned an empty response")]
    Empty,
}

/// Generative-model capability, injected at startup.
#[async_trait]
pub trait ModelClient: Send + Sync {
    async fn invoke(&self, request: ModelRequest) -> Result<ModelResponse, ModelError>;
}

/// Invoke the model under a hard deadline. Exceeding it is a transport
/// failure like any other; there is no hidden retry.
pub async fn invoke_with_timeout(
    client: &dyn ModelClient,
    request: ModelRequest,
    timeout: Duration,
) -> Result<ModelResponse, ModelError> {
    match tokio::time::timeout(timeout, client.invoke(request)).await {
        Ok(result) => result,
        Err(_) => Err(ModelError::Timeout(timeout)),
    }
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<Message<'a>>,
    max_tokens: u32,
    temperature: f32,
    stream: bool,
}

#[derive(Serialize)]
struct Message<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Deserialize)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<Choice>,
    usage: Option<Usage>,
    model: Option<String>,
}

#[derive(Deserialize)]
struct Choice {
    message: MessageContent,
}

#[derive(Deserialize)]
struct MessageContent {
    #[serde(default)]
    content: Option<String>,
}

/// OpenRouter chat-completions client (BYOK).
pub struct OpenRouterClient {
    http: reqwest::Client,
    endpoint: Url,
    api_key: String,
    generator_model: String,
    healer_model: String,
}

impl std::fmt::Debug for OpenRouterClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OpenRouterClient")
            .field("endpoint", &self.endpoint.as_str())
            .field("generator_model", &self.generator_model)
            .field("healer_model", &self.healer_model)
            .finish_non_exhaustive()
    }
}

impl OpenRouterClient {
    pub fn new(config: &UserConfig, api_key: String) -> Result<Self, ConfigError> {
        let endpoint = config
            .api_base()?
            .join("chat/completions")
            .map_err(|e| ConfigError::Invalid(format!("api_base_url: {}", e)))?;
        let http = reqwest::Client::builder()
            .user_agent(concat!("mend/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| ConfigError::Invalid(format!("http client: {}", e)))?;
        Ok(Self {
            http,
            endpoint,
            api_key,
            generator_model: config.generator_model.clone(),
            healer_model: config.healer_model.clone(),
        })
    }

    /// Construct from user config, resolving the API key from env or keychain.
    pub fn from_user_config(config: &UserConfig) -> Result<Self, ConfigError> {
        let key = config.api_key()?;
        Self::new(config, key)
    }

    fn model_for(&self, role: ModelRole) -> &str {
        match role {
            ModelRole::Generator => &self.generator_model,
            ModelRole::Healer => &self.healer_model,
        }
    }
}

#[async_trait]
impl ModelClient for OpenRouterClient {
    async fn invoke(&self, request: ModelRequest) -> Result<ModelResponse, ModelError> {
        if self.api_key.trim().is_empty() {
            return Err(ModelError::MissingApiKey);
        }

        let model = self.model_for(request.role);
        let body = ChatRequest {
            model,
            messages: vec![
                Message {
                    role: "system",
                    content: &request.system,
                },
                Message {
                    role: "user",
                    content: &request.user,
                },
            ],
            max_tokens: request.max_tokens,
            temperature: request.temperature,
            stream: false,
        };

        let started = Instant::now();
        let response = self
            .http
            .post(self.endpoint.clone())
            .headers(attribution_headers())
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(transport_error)?;

        let status = response.status();
        let text = response.text().await.map_err(transport_error)?;
        let latency = started.elapsed();
        debug!(role = %request.role, model, status = status.as_u16(), ?latency, "model call finished");

        if !status.is_success() {
            return Err(status_error(status.as_u16(), &text));
        }

        let (content, usage, reported_model) = decode_chat_response(&text)?;
        Ok(ModelResponse {
            content,
            latency,
            usage,
            model: reported_model.unwrap_or_else(|| model.to_string()),
        })
    }
}

fn transport_error(err: reqwest::Error) -> ModelError {
    if err.is_timeout() {
        return ModelError::Transport("request timed out".to_string());
    }
    ModelError::Transport(redact_secrets(&err.without_url().to_string()))
}

fn status_error(status: u16, body: &str) -> ModelError {
    let message = match status {
        401 | 403 => "API key was rejected".to_string(),
        429 => "rate limited by provider".to_string(),
        500..=599 => "provider is temporarily unavailable".to_string(),
        _ => redact_secrets(&truncate(body.trim(), 200)),
    };
    ModelError::Status { status, message }
}

fn decode_chat_response(
    text: &str,
) -> Result<(String, Option<Usage>, Option<String>), ModelError> {
    let parsed: ChatResponse =
        serde_json::from_str(text).map_err(|e| ModelError::Decode(e.to_string()))?;
    let content = parsed
        .choices
        .into_iter()
        .next()
        .and_then(|c| c.message.content)
        .unwrap_or_default();
    if content.trim().is_empty() {
        return Err(ModelError::Empty);
    }
    Ok((content, parsed.usage, parsed.model))
}

/// OpenRouter app attribution. Only the title is sent; mend has no public
/// homepage to put in `HTTP-Referer`.
fn attribution_headers() -> reqwest::header::HeaderMap {
    let mut headers = reqwest::header::HeaderMap::new();
    headers.insert("X-Title", reqwest::header::HeaderValue::from_static("mend"));
    headers
}
