//! OPA-style HTTP evaluator
//!
//! `POST {url}{path}` with `{"input": <DecisionInput>}`; the answer is read
//! from `result.allow` and `result.violations`.

use super::{DecisionInput, PolicyDecision, PolicyEvaluator};
use crate::error::{GatewayError, Result};
use async_trait::async_trait;
use serde::Deserialize;
use std::time::Duration;
use tracing::{debug, warn};

#[derive(Debug, Deserialize)]
struct EngineResponse {
    result: Option<PolicyDecision>,
}

pub struct HttpPolicyEvaluator {
    client: reqwest::Client,
    endpoint: String,
}

impl HttpPolicyEvaluator {
    pub fn new(url: &str, path: &str, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| GatewayError::Config(format!("policy HTTP client: {}", e)))?;
        Ok(Self {
            client,
            endpoint: format!("{}{}", url.trim_end_matches('/'), path),
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

fn unavailable(reason: impl Into<String>) -> GatewayError {
    let reason = reason.into();
    warn!(reason = %reason, "Policy engine unavailable");
    GatewayError::PolicyEvaluationUnavailable(reason)
}

#[async_trait]
impl PolicyEvaluator for HttpPolicyEvaluator {
    async fn evaluate(&self, input: &DecisionInput) -> Result<PolicyDecision> {
        let response = self
            .client
            .post(&self.endpoint)
            .json(&serde_json::json!({ "input": input }))
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    unavailable("policy engine timed out")
                } else {
                    unavailable(format!("policy engine unreachable: {}", e))
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            return Err(unavailable(format!("policy engine returned {}", status)));
        }

        let body: EngineResponse = response
            .json()
            .await
            .map_err(|e| unavailable(format!("malformed policy response: {}", e)))?;

        // An undefined decision is not an allow
        let decision = body
            .result
            .ok_or_else(|| unavailable("policy engine returned no result"))?;

        debug!(
            request_id = %input.request_id,
            allow = decision.allow,
            violations = decision.violations.len(),
            "Policy decision"
        );
        Ok(decision)
    }
}
