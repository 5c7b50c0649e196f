//! Policy engine adapter
//!
//! The gateway never decides governance questions itself. It shapes a
//! [`DecisionInput`], hands it to a [`PolicyEvaluator`], and obeys the
//! answer. Evaluators must report every failure to produce a decision as
//! [`GatewayError::PolicyEvaluationUnavailable`]; the orchestrator treats
//! that as fatal for the request.

mod http;

pub use http::HttpPolicyEvaluator;

use crate::budget::BudgetSnapshot;
use crate::config::PolicyConfig;
use crate::error::{GatewayError, Result};
use crate::gateway::{Message, Scope};
use crate::router::AbArm;
use crate::safety::Finding;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::info;

/// A rule the request broke
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Violation {
    #[serde(rename = "type")]
    pub kind: String,
    pub message: String,
}

impl Violation {
    pub fn new(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            message: message.into(),
        }
    }
}

/// Evaluator verdict
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PolicyDecision {
    pub allow: bool,
    #[serde(default)]
    pub violations: Vec<Violation>,
}

impl PolicyDecision {
    pub fn allow() -> Self {
        Self {
            allow: true,
            violations: Vec::new(),
        }
    }

    pub fn deny(violations: Vec<Violation>) -> Self {
        Self {
            allow: false,
            violations,
        }
    }
}

/// Facts about a request, as seen by the policy engine
#[derive(Debug, Clone, Serialize)]
pub struct DecisionInput {
    pub request_id: String,
    pub model: String,
    pub provider: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ab_arm: Option<AbArm>,
    pub max_tokens: u32,
    pub estimated_prompt_tokens: u32,
    pub estimated_cost: f64,
    pub scope: Scope,
    pub budgets: Vec<BudgetSnapshot>,
    /// Input findings; the messages below are already redacted
    pub findings: Vec<Finding>,
    pub messages: Vec<Message>,
}

/// External decision function
#[async_trait]
pub trait PolicyEvaluator: Send + Sync {
    async fn evaluate(&self, input: &DecisionInput) -> Result<PolicyDecision>;
}

/// Returns the same decision for every request
///
/// Used when policy evaluation is switched off, and in tests.
#[derive(Debug, Clone)]
pub struct StaticEvaluator {
    decision: PolicyDecision,
}

impl StaticEvaluator {
    pub fn allow() -> Self {
        Self {
            decision: PolicyDecision::allow(),
        }
    }

    pub fn deny(violations: Vec<Violation>) -> Self {
        Self {
            decision: PolicyDecision::deny(violations),
        }
    }
}

#[async_trait]
impl PolicyEvaluator for StaticEvaluator {
    async fn evaluate(&self, _input: &DecisionInput) -> Result<PolicyDecision> {
        Ok(self.decision.clone())
    }
}

/// Evaluator for a policy configuration section
pub fn build_evaluator(config: &PolicyConfig) -> Result<Arc<dyn PolicyEvaluator>> {
    if !config.enabled {
        info!("Policy evaluation disabled; every request is allowed");
        return Ok(Arc::new(StaticEvaluator::allow()));
    }
    let url = config.url.as_deref().ok_or_else(|| {
        GatewayError::Config("policy.url is required when policy evaluation is enabled".into())
    })?;
    Ok(Arc::new(HttpPolicyEvaluator::new(url, &config.path, config.timeout)?))
}
