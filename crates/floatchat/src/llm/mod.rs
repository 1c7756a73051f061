use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::CompletionError;
use crate::utils::redaction::redact_and_truncate_text;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelParams {
    pub model: String,

    #[serde(default)]
    pub temperature: f32,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CompletionRequest {
    pub system_prompt: String,
    pub user_prompt: String,
    pub params: ModelParams,
}

/// `complete(system_prompt, user_prompt, model_params) -> text`.
#[async_trait]
pub trait CompletionClient: Send + Sync {
    async fn complete(&self, request: &CompletionRequest) -> Result<String, CompletionError>;
}

/// One call plus at most `max_transport_retries` repeats, each under
/// `timeout`. Only transport failures (including timeouts) are repeated;
/// anything the service actually answered is final.
pub async fn complete_with_retry(
    client: &dyn CompletionClient,
    request: &CompletionRequest,
    timeout: Duration,
    max_transport_retries: u32,
) -> Result<String, CompletionError> {
    let mut attempt = 0;
    loop {
        let outcome = match tokio::time::timeout(timeout, client.complete(request)).await {
            Ok(result) => result,
            Err(_) => Err(CompletionError::Transport(format!(
                "timed out after {} ms",
                timeout.as_millis()
            ))),
        };

        match outcome {
            Ok(text) if text.trim().is_empty() => return Err(CompletionError::EmptyContent),
            Ok(text) => return Ok(text),
            Err(error) if error.is_transport() && attempt < max_transport_retries => {
                attempt += 1;
                warn!(
                    model = %request.params.model,
                    attempt,
                    error = %error,
                    "generation transport failure; retrying"
                );
            }
            Err(error) => return Err(error),
        }
    }
}

#[derive(Debug, Serialize)]
struct ChatMessage<'a> {
    role: &'static str,
    content: &'a str,
}

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    temperature: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
    messages: Vec<ChatMessage<'a>>,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatChoiceMessage,
}

#[derive(Debug, Deserialize)]
struct ChatChoiceMessage {
    #[serde(default)]
    content: Option<String>,
}

/// OpenAI-compatible `chat/completions` backend.
#[derive(Debug, Clone)]
pub struct ChatCompletionsClient {
    client: reqwest::Client,
    endpoint: String,
    api_key: Option<String>,
}

impl ChatCompletionsClient {
    pub fn new(
        endpoint: impl Into<String>,
        api_key: Option<String>,
        timeout: Duration,
    ) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|error| anyhow::anyhow!("failed to build generation client: {error}"))?;
        Ok(Self {
            client,
            endpoint: endpoint.into(),
            api_key,
        })
    }
}

#[async_trait]
impl CompletionClient for ChatCompletionsClient {
    async fn complete(&self, request: &CompletionRequest) -> Result<String, CompletionError> {
        let body = build_chat_request(request);
        let mut builder = self.client.post(&self.endpoint).json(&body);
        if let Some(api_key) = self.api_key.as_deref() {
            builder = builder.bearer_auth(api_key);
        }

        let response = builder
            .send()
            .await
            .map_err(|error| CompletionError::Transport(error.to_string()))?;
        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|error| CompletionError::Transport(error.to_string()))?;
        debug!(status = status.as_u16(), bytes = text.len(), "generation response received");

        if status.is_server_error() || status.as_u16() == 429 {
            return Err(CompletionError::Transport(format!(
                "service responded with status {}",
                status.as_u16()
            )));
        }
        if !status.is_success() {
            return Err(CompletionError::Rejected {
                status: status.as_u16(),
                body: redact_and_truncate_text(&text, 300).text,
            });
        }
        parse_chat_response(&text)
    }
}

fn build_chat_request(request: &CompletionRequest) -> ChatRequest<'_> {
    ChatRequest {
        model: &request.params.model,
        temperature: request.params.temperature,
        max_tokens: request.params.max_tokens,
        messages: vec![
            ChatMessage {
                role: "system",
                content: &request.system_prompt,
            },
            ChatMessage {
                role: "user",
                content: &request.user_prompt,
            },
        ],
    }
}

fn parse_chat_response(body: &str) -> Result<String, CompletionError> {
    let response: ChatResponse =
        serde_json::from_str(body).map_err(|error| CompletionError::Decode(error.to_string()))?;
    response
        .choices
        .into_iter()
        .next()
        .and_then(|choice| choice.message.content)
        .filter(|content| !content.trim().is_empty())
        .ok_or(CompletionError::EmptyContent)
}
