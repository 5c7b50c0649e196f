//! Google Gemini generateContent API

use super::pricing::estimate_tokens;
use super::{api_key, error_message, Provider, ProviderError, ProviderRequest, ProviderResponse};
use crate::config::ProviderConfig;
use crate::gateway::Message;
use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::debug;

pub struct GoogleProvider {
    name: String,
    config: ProviderConfig,
    client: reqwest::Client,
}

impl GoogleProvider {
    pub fn new(name: impl Into<String>, config: ProviderConfig, client: reqwest::Client) -> Self {
        Self {
            name: name.into(),
            config,
            client,
        }
    }

    /// System turns become `systemInstruction`; assistant turns are `model`
    fn build_body(&self, request: &ProviderRequest) -> Value {
        let system: Vec<&str> = request
            .messages
            .iter()
            .filter(|m| m.role == "system")
            .map(|m| m.content.as_str())
            .collect();
        let contents: Vec<Value> = request
            .messages
            .iter()
            .filter(|m| m.role != "system")
            .map(|m| {
                let role = if m.role == "assistant" { "model" } else { "user" };
                json!({"role": role, "parts": [{"text": m.content}]})
            })
            .collect();

        let mut generation = json!({ "maxOutputTokens": request.max_tokens });
        if let Some(temperature) = request.temperature {
            generation["temperature"] = json!(temperature);
        }

        let mut body = json!({
            "contents": contents,
            "generationConfig": generation,
        });
        if !system.is_empty() {
            body["systemInstruction"] = json!({"parts": [{"text": system.join("\n")}]});
        }
        body
    }
}

/// Missing usage metadata falls back to the character estimate
fn parse_response(body: &Value, request: &ProviderRequest) -> Result<ProviderResponse, ProviderError> {
    let parts = body
        .pointer("/candidates/0/content/parts")
        .and_then(Value::as_array)
        .ok_or_else(|| ProviderError::InvalidResponse("missing candidates[0].content.parts".into()))?;

    let content: String = parts
        .iter()
        .filter_map(|p| p.get("text").and_then(Value::as_str))
        .collect::<Vec<_>>()
        .join("");

    let tokens = |field: &str| {
        body.pointer(&format!("/usageMetadata/{}", field))
            .and_then(Value::as_u64)
            .map(|n| n as u32)
    };
    let prompt_tokens = tokens("promptTokenCount").unwrap_or_else(|| estimate_tokens(&request.messages));
    let completion_tokens = tokens("candidatesTokenCount")
        .unwrap_or_else(|| estimate_tokens(&[Message::new("", content.as_str())]));

    Ok(ProviderResponse {
        model: body
            .get("modelVersion")
            .and_then(Value::as_str)
            .unwrap_or(&request.model)
            .to_string(),
        content,
        prompt_tokens,
        completion_tokens,
    })
}

#[async_trait]
impl Provider for GoogleProvider {
    fn name(&self) -> &str {
        &self.name
    }

    async fn complete(&self, request: &ProviderRequest) -> Result<ProviderResponse, ProviderError> {
        let key = api_key(&self.config, "GOOGLE_API_KEY")?;
        let url = format!(
            "{}/v1beta/models/{}:generateContent",
            self.config.base_url.trim_end_matches('/'),
            request.model
        );

        debug!(provider = %self.name, model = %request.model, request_id = %request.request_id, "Calling upstream");

        let response = self
            .client
            .post(&url)
            .header("x-goog-api-key", key)
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
        parse_response(&body, request)
    }
}
