//! OpenAI chat completions and compatible APIs

use super::{api_key, error_message, Provider, ProviderError, ProviderRequest, ProviderResponse};
use crate::config::ProviderConfig;
use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::debug;

pub struct OpenAIProvider {
    name: String,
    config: ProviderConfig,
    client: reqwest::Client,
}

impl OpenAIProvider {
    pub fn new(name: impl Into<String>, config: ProviderConfig, client: reqwest::Client) -> Self {
        Self {
            name: name.into(),
            config,
            client,
        }
    }

    fn build_body(&self, request: &ProviderRequest) -> Value {
        let mut body = json!({
            "model": request.model,
            "messages": request.messages,
            "max_tokens": request.max_tokens,
        });
        if let Some(temperature) = request.temperature {
            body["temperature"] = json!(temperature);
        }
        body
    }
}

fn parse_response(body: &Value, requested_model: &str) -> Result<ProviderResponse, ProviderError> {
    let content = body
        .pointer("/choices/0/message/content")
        .and_then(Value::as_str)
        .ok_or_else(|| ProviderError::InvalidResponse("missing choices[0].message.content".into()))?;

    let tokens = |field: &str| {
        body.pointer(&format!("/usage/{}", field))
            .and_then(Value::as_u64)
            .unwrap_or(0) as u32
    };

    Ok(ProviderResponse {
        content: content.to_string(),
        model: body
            .get("model")
            .and_then(Value::as_str)
            .unwrap_or(requested_model)
            .to_string(),
        prompt_tokens: tokens("prompt_tokens"),
        completion_tokens: tokens("completion_tokens"),
    })
}

#[async_trait]
impl Provider for OpenAIProvider {
    fn name(&self) -> &str {
        &self.name
    }

    async fn complete(&self, request: &ProviderRequest) -> Result<ProviderResponse, ProviderError> {
        let key = api_key(&self.config, "OPENAI_API_KEY")?;
        let url = format!(
            "{}/v1/chat/completions",
            self.config.base_url.trim_end_matches('/')
        );

        debug!(provider = %self.name, model = %request.model, request_id = %request.request_id, "Calling upstream");

        let response = self
            .client
            .post(&url)
            .bearer_auth(key)
            .header("X-Request-Id", &request.request_id)
            .json(&self.build_body(request))
            .send()
            .await?;

        let status = response.status();
        let text = response.text().await?;
        if !status.is_success() {
            return Err(ProviderError::Status {
                status: status.as_u16(),
                message: error_message(&text),
            });
        }

        let body: Value = serde_json::from_str(&text)
            .map_err(|e| ProviderError::InvalidResponse(e.to_string()))?;
        parse_response(&body, &request.model)
    }
}
