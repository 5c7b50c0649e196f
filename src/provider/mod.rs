//! Upstream LLM providers
//!
//! A provider turns a [`ProviderRequest`] into one HTTP call and reports
//! either a completion or a typed [`ProviderError`]. Retry, fallback and
//! breaker bookkeeping live in the router; providers make exactly one attempt.

mod anthropic;
mod google;
mod openai;
pub mod pricing;

pub use anthropic::AnthropicProvider;
pub use google::GoogleProvider;
pub use openai::OpenAIProvider;
pub use pricing::{CostEstimator, PriceTable};

use crate::config::{ProviderConfig, ProviderKind};
use crate::error::{GatewayError, Result};
use crate::gateway::Message;
use async_trait::async_trait;
use std::sync::Arc;
use thiserror::Error;

/// Payload sent to a provider
#[derive(Debug, Clone, PartialEq)]
pub struct ProviderRequest {
    pub request_id: String,
    pub model: String,
    pub messages: Vec<Message>,
    pub max_tokens: u32,
    pub temperature: Option<f32>,
}

/// Completion returned by a provider
#[derive(Debug, Clone, PartialEq)]
pub struct ProviderResponse {
    pub content: String,
    /// Model reported by the upstream, which may be more specific than requested
    pub model: String,
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
}

/// Failure of a single upstream attempt
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ProviderError {
    #[error("upstream request timed out")]
    Timeout,

    #[error("connection failed: {0}")]
    Connection(String),

    #[error("upstream returned status {status}: {message}")]
    Status { status: u16, message: String },

    #[error("invalid upstream response: {0}")]
    InvalidResponse(String),

    #[error("provider misconfigured: {0}")]
    Config(String),
}

impl ProviderError {
    /// Transient failures are retried; everything else fails the attempt chain
    pub fn is_transient(&self) -> bool {
        match self {
            ProviderError::Timeout | ProviderError::Connection(_) => true,
            ProviderError::Status { status, .. } => *status >= 500,
            ProviderError::InvalidResponse(_) | ProviderError::Config(_) => false,
        }
    }

    /// Whether the failure says something about the provider's health.
    /// Client errors are the caller's fault and leave the breaker alone.
    pub fn counts_against_provider(&self) -> bool {
        match self {
            ProviderError::Status { status, .. } => *status >= 500,
            ProviderError::Config(_) => false,
            _ => true,
        }
    }
}

impl From<reqwest::Error> for ProviderError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            ProviderError::Timeout
        } else if err.is_decode() {
            ProviderError::InvalidResponse(err.to_string())
        } else {
            ProviderError::Connection(err.to_string())
        }
    }
}

/// An upstream LLM service
#[async_trait]
pub trait Provider: Send + Sync {
    /// Name the provider is registered under
    fn name(&self) -> &str;

    /// Make one completion call
    async fn complete(
        &self,
        request: &ProviderRequest,
    ) -> std::result::Result<ProviderResponse, ProviderError>;
}

/// Build the HTTP provider for a configured upstream
pub fn create_provider(name: &str, config: &ProviderConfig) -> Result<Arc<dyn Provider>> {
    let client = reqwest::Client::builder()
        .timeout(config.timeout)
        .build()
        .map_err(|e| GatewayError::Config(format!("HTTP client for '{}': {}", name, e)))?;

    let provider: Arc<dyn Provider> = match config.kind {
        ProviderKind::OpenAI => Arc::new(OpenAIProvider::new(name, config.clone(), client)),
        ProviderKind::Anthropic => Arc::new(AnthropicProvider::new(name, config.clone(), client)),
        ProviderKind::Google => Arc::new(GoogleProvider::new(name, config.clone(), client)),
    };
    Ok(provider)
}

/// Resolve the configured key, falling back to a well-known variable
fn api_key(config: &ProviderConfig, fallback_var: &str) -> std::result::Result<String, ProviderError> {
    match &config.api_key {
        Some(key) => crate::config::resolve_secret(key).map_err(|e| ProviderError::Config(e.to_string())),
        None => std::env::var(fallback_var)
            .map_err(|_| ProviderError::Config(format!("no api_key configured and {} is not set", fallback_var))),
    }
}

/// Upstream error text, trimmed so a large HTML error page stays out of logs
fn error_message(body: &str) -> String {
    let message = serde_json::from_str::<serde_json::Value>(body)
        .ok()
        .and_then(|v| {
            v.pointer("/error/message")
                .and_then(|m| m.as_str())
                .map(str::to_string)
        })
        .unwrap_or_else(|| body.trim().to_string());
    message.chars().take(200).collect()
}
