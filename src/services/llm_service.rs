use crate::config::LlmConfig;
use crate::models::PipelineError;
use reqwest::Client as HttpClient;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

/// One message of a chat-style prompt
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".to_string(),
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: "assistant".to_string(),
            content: content.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct CompletionRequest {
    pub system: String,
    pub messages: Vec<ChatMessage>,
    pub max_tokens: u32,
    pub temperature: f32,
}

impl CompletionRequest {
    pub fn new(system: impl Into<String>, user: impl Into<String>) -> Self {
        Self {
            system: system.into(),
            messages: vec![ChatMessage::user(user)],
            max_tokens: 1024,
            temperature: 0.1,
        }
    }

    pub fn with_messages(system: impl Into<String>, messages: Vec<ChatMessage>) -> Self {
        Self {
            system: system.into(),
            messages,
            max_tokens: 1024,
            temperature: 0.1,
        }
    }

    /// Flatten to a single prompt for completion-style gateways
    pub fn to_prompt(&self) -> String {
        let mut prompt = String::new();
        if !self.system.is_empty() {
            prompt.push_str(&self.system);
            prompt.push_str("\n\n");
        }
        for message in &self.messages {
            if self.messages.len() > 1 {
                prompt.push_str(&format!("{}: {}\n", message.role, message.content));
            } else {
                prompt.push_str(&message.content);
            }
        }
        prompt
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct TokenUsage {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CompletionResponse {
    pub text: String,
    pub usage: Option<TokenUsage>,
}

/// Text-generation collaborator. Implementations do not retry.
#[async_trait::async_trait]
pub trait LlmClient: Send + Sync {
    async fn complete(&self, request: &CompletionRequest) -> Result<CompletionResponse, PipelineError>;

    fn provider(&self) -> &str;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LlmProvider {
    /// Completion gateway taking `{prompt, max_tokens, temperature}`
    Gateway,
    /// OpenAI-compatible `/chat/completions`
    OpenAi,
}

impl LlmProvider {
    pub fn from_str(s: &str) -> Result<Self, PipelineError> {
        match s.to_lowercase().as_str() {
            "gateway" => Ok(LlmProvider::Gateway),
            "openai" | "open_ai" => Ok(LlmProvider::OpenAi),
            _ => Err(PipelineError::ModelUnavailable(format!(
                "Unsupported LLM provider: {}",
                s
            ))),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            LlmProvider::Gateway => "gateway",
            LlmProvider::OpenAi => "openai",
        }
    }
}

/// HTTP client for the configured provider
pub struct HttpLlmClient {
    provider: LlmProvider,
    gateway_url: String,
    api_key: Option<String>,
    model: String,
    http_client: HttpClient,
}

impl HttpLlmClient {
    pub fn new(config: &LlmConfig, request_timeout: Duration) -> Result<Self, PipelineError> {
        let provider = LlmProvider::from_str(&config.provider)?;
        let http_client = HttpClient::builder()
            .timeout(request_timeout)
            .build()
            .map_err(|e| PipelineError::ModelUnavailable(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self {
            provider,
            gateway_url: config.gateway_url.trim_end_matches('/').to_string(),
            api_key: config.api_key.clone(),
            model: config.model.clone(),
            http_client,
        })
    }

    fn endpoint(&self) -> String {
        match self.provider {
            LlmProvider::Gateway => self.gateway_url.clone(),
            LlmProvider::OpenAi => format!("{}/chat/completions", self.gateway_url),
        }
    }

    fn request_body(&self, request: &CompletionRequest) -> serde_json::Value {
        match self.provider {
            LlmProvider::Gateway => json!({
                "prompt": request.to_prompt(),
                "max_tokens": request.max_tokens,
                "temperature": request.temperature,
            }),
            LlmProvider::OpenAi => {
                let mut messages = Vec::with_capacity(request.messages.len() + 1);
                if !request.system.is_empty() {
                    messages.push(json!({"role": "system", "content": request.system}));
                }
                for message in &request.messages {
                    messages.push(json!({"role": message.role, "content": message.content}));
                }
                json!({
                    "model": self.model,
                    "messages": messages,
                    "max_tokens": request.max_tokens,
                    "temperature": request.temperature,
                })
            }
        }
    }

    fn parse_response(&self, result: &serde_json::Value) -> Result<CompletionResponse, PipelineError> {
        let text = match self.provider {
            LlmProvider::Gateway => result["text"]
                .as_str()
                .or_else(|| result["content"].as_str())
                .or_else(|| result["response"].as_str()),
            LlmProvider::OpenAi => result["choices"][0]["message"]["content"].as_str(),
        }
        .ok_or_else(|| PipelineError::ModelUnavailable("LLM response does not contain text".to_string()))?;

        let usage = result.get("usage").and_then(|usage| {
            Some(TokenUsage {
                prompt_tokens: usage["prompt_tokens"].as_u64()?,
                completion_tokens: usage["completion_tokens"].as_u64()?,
            })
        });

        Ok(CompletionResponse {
            text: text.trim().to_string(),
            usage,
        })
    }
}

#[async_trait::async_trait]
impl LlmClient for HttpLlmClient {
    async fn complete(&self, request: &CompletionRequest) -> Result<CompletionResponse, PipelineError> {
        if self.gateway_url.is_empty() {
            return Err(PipelineError::ModelUnavailable(
                "LLM gateway is not configured; set LLM_GATEWAY_URL".to_string(),
            ));
        }

        let mut http_request = self
            .http_client
            .post(self.endpoint())
            .json(&self.request_body(request));

        // Add API key if available
        if let Some(api_key) = &self.api_key {
            http_request = http_request.header("Authorization", format!("Bearer {}", api_key));
        }

        let response = http_request
            .send()
            .await
            .map_err(|e| PipelineError::ModelUnavailable(format!("Failed to call LLM service: {}", e)))?;

        if !response.status().is_success() {
            let status = response.status();
            let error_text = response.text().await.unwrap_or_else(|_| "Unknown error".to_string());
            return Err(PipelineError::ModelUnavailable(format!(
                "LLM service returned error {}: {}",
                status, error_text
            )));
        }

        let result: serde_json::Value = response
            .json()
            .await
            .map_err(|e| PipelineError::ModelUnavailable(format!("Failed to parse LLM response: {}", e)))?;

        let completion = self.parse_response(&result)?;
        if let Some(usage) = &completion.usage {
            tracing::debug!(
                "LLM usage: {} prompt tokens, {} completion tokens",
                usage.prompt_tokens,
                usage.completion_tokens
            );
        }
        Ok(completion)
    }

    fn provider(&self) -> &str {
        self.provider.as_str()
    }
}

/// Shared entry point to the language model.
///
/// A failed call is retried once after `retry_backoff`; a second failure
/// surfaces as `ModelUnavailable`.
#[derive(Clone)]
pub struct LlmService {
    client: Arc<dyn LlmClient>,
    retry_backoff: Duration,
    max_tokens: u32,
    temperature: f32,
}

impl LlmService {
    pub fn new(client: Arc<dyn LlmClient>, config: &LlmConfig) -> Self {
        Self {
            client,
            retry_backoff: Duration::from_millis(config.retry_backoff_ms),
            max_tokens: config.max_tokens,
            temperature: config.temperature,
        }
    }

    pub fn with_backoff(client: Arc<dyn LlmClient>, retry_backoff: Duration) -> Self {
        Self {
            client,
            retry_backoff,
            max_tokens: 1024,
            temperature: 0.1,
        }
    }

    pub fn provider(&self) -> &str {
        self.client.provider()
    }

    pub async fn complete(&self, mut request: CompletionRequest) -> Result<CompletionResponse, PipelineError> {
        request.max_tokens = self.max_tokens;
        request.temperature = self.temperature;

        match self.client.complete(&request).await {
            Ok(response) => Ok(response),
            Err(first) => {
                tracing::warn!(
                    "LLM call failed ({}), retrying once after {} ms",
                    first,
                    self.retry_backoff.as_millis()
                );
                tokio::time::sleep(self.retry_backoff).await;
                self.client.complete(&request).await.map_err(|e| {
                    tracing::error!("LLM call failed after retry: {}", e);
                    match e {
                        PipelineError::ModelUnavailable(_) => e,
                        other => PipelineError::ModelUnavailable(other.to_string()),
                    }
                })
            }
        }
    }
}

/// Slice out the JSON object embedded in model output (markdown fences and
/// surrounding prose are dropped)
pub fn extract_json(text: &str) -> Option<&str> {
    let start = text.find('{')?;
    let end = text.rfind('}')?;
    if end < start {
        return None;
    }
    Some(&text[start..=end])
}

/// Clean up SQL (remove markdown code blocks if present)
pub fn clean_sql(sql: &str) -> String {
    sql.trim()
        .trim_start_matches("```sql")
        .trim_start_matches("```")
        .trim_end_matches("```")
        .trim()
        .to_string()
}
