//! Anthropic messages API

use super::{api_key, error_message, Provider, ProviderError, ProviderRequest, ProviderResponse};
use crate::config::ProviderConfig;
use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::debug;

const API_VERSION: &str = "2023-06-01";

pub struct AnthropicProvider {
    name: String,
    config: ProviderConfig,
    client: reqwest::Client,
}

impl AnthropicProvider {
    pub fn new(name: impl Into<String>, config: ProviderConfig, client: reqwest::Client) -> Self {
        Self {
            name: name.into(),
            config,
            client,
        }
    }

    /// System turns move to the top-level `system` field
    fn build_body(&self, request: &ProviderRequest) -> Value {
        let system: Vec<&str> = request
            .messages
            .iter()
            .filter(|m| m.role == "system")
            .map(|m| m.content.as_str())
            .collect();
        let messages: Vec<Value> = request
            .messages
            .iter()
            .filter(|m| m.role != "system")
            .map(|m| json!({"role": m.role, "content": m.content}))
            .collect();

        let mut body = json!({
            "model": request.model,
            "max_tokens": request.max_tokens,
            "messages": messages,
        });
        if !system.is_empty() {
            body["system"] = json!(system.join("\n"));
        }
        if let Some(temperature) = request.temperature {
            body["temperature"] = json!(temperature);
        }
        body
    }
}

fn parse_response(body: &Value, requested_model: &str) -> Result<ProviderResponse, ProviderError> {
    let blocks = body
        .get("content")
        .and_then(Value::as_array)
        .ok_or_else(|| ProviderError::InvalidResponse("missing content blocks".into()))?;

    let content: String = blocks
        .iter()
        .filter(|b| b.get("type").and_then(Value::as_str) == Some("text"))
        .filter_map(|b| b.get("text").and_then(Value::as_str))
        .collect::<Vec<_>>()
        .join("");

    let tokens = |field: &str| {
        body.pointer(&format!("/usage/{}", field))
            .and_then(Value::as_u64)
            .unwrap_or(0) as u32
    };

    Ok(ProviderResponse {
        content,
        model: body
            .get("model")
            .and_then(Value::as_str)
            .unwrap_or(requested_model)
            .to_string(),
        prompt_tokens: tokens("input_tokens"),
        completion_tokens: tokens("output_tokens"),
    })
}

#[async_trait]
impl Provider for AnthropicProvider {
    fn name(&self) -> &str {
        &self.name
    }

    async fn complete(&self, request: &ProviderRequest) -> Result<ProviderResponse, ProviderError> {
        let key = api_key(&self.config, "ANTHROPIC_API_KEY")?;
        let url = format!("{}/v1/messages", self.config.base_url.trim_end_matches('/'));

        debug!(provider = %self.name, model = %request.model, request_id = %request.request_id, "Calling upstream");

        let response = self
            .client
            .post(&url)
            .header("x-api-key", key)
            .header("anthropic-version", API_VERSION)
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
