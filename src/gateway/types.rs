//! Request and response data model

use crate::safety::Finding;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// One chat turn
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub role: String,
    pub content: String,
}

impl Message {
    pub fn new(role: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: role.into(),
            content: content.into(),
        }
    }
}

/// Billing and governance identifiers attached to a request
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Scope {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub project_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub org_id: Option<String>,
}

impl Scope {
    pub fn user(id: impl Into<String>) -> Self {
        Self {
            user_id: Some(id.into()),
            ..Self::default()
        }
    }

    pub fn project(id: impl Into<String>) -> Self {
        Self {
            project_id: Some(id.into()),
            ..Self::default()
        }
    }

    pub fn with_user(mut self, id: impl Into<String>) -> Self {
        self.user_id = Some(id.into());
        self
    }

    pub fn with_project(mut self, id: impl Into<String>) -> Self {
        self.project_id = Some(id.into());
        self
    }

    pub fn with_org(mut self, id: impl Into<String>) -> Self {
        self.org_id = Some(id.into());
        self
    }

    /// Every ledger key this scope is charged against, in lock order
    pub fn keys(&self) -> Vec<ScopeKey> {
        let mut keys: Vec<ScopeKey> = [
            self.user_id.clone().map(ScopeKey::User),
            self.project_id.clone().map(ScopeKey::Project),
            self.org_id.clone().map(ScopeKey::Org),
        ]
        .into_iter()
        .flatten()
        .collect();
        keys.sort();
        keys
    }

    pub fn is_empty(&self) -> bool {
        self.user_id.is_none() && self.project_id.is_none() && self.org_id.is_none()
    }
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let keys: Vec<String> = self.keys().iter().map(ToString::to_string).collect();
        f.write_str(&keys.join(","))
    }
}

/// A single ledger account, rendered as `user:<id>`, `project:<id>` or `org:<id>`
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ScopeKey {
    User(String),
    Project(String),
    Org(String),
}

impl fmt::Display for ScopeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ScopeKey::User(id) => write!(f, "user:{}", id),
            ScopeKey::Project(id) => write!(f, "project:{}", id),
            ScopeKey::Org(id) => write!(f, "org:{}", id),
        }
    }
}

impl FromStr for ScopeKey {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (kind, id) = s
            .split_once(':')
            .ok_or_else(|| format!("scope '{}' is missing a kind prefix", s))?;
        if id.is_empty() {
            return Err(format!("scope '{}' has an empty id", s));
        }
        match kind {
            "user" => Ok(ScopeKey::User(id.to_string())),
            "project" => Ok(ScopeKey::Project(id.to_string())),
            "org" => Ok(ScopeKey::Org(id.to_string())),
            other => Err(format!("unknown scope kind '{}'", other)),
        }
    }
}

/// A chat completion submitted to the gateway
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Request {
    /// Idempotency key for billing
    pub id: String,
    pub messages: Vec<Message>,
    pub model: String,
    /// Explicit provider; bypasses mapping and A/B assignment
    pub provider: Option<String>,
    pub max_tokens: u32,
    pub temperature: Option<f32>,
    pub scope: Scope,
}

impl Request {
    pub fn new(model: impl Into<String>, messages: Vec<Message>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            messages,
            model: model.into(),
            provider: None,
            max_tokens: 1000,
            temperature: None,
            scope: Scope::default(),
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    pub fn with_provider(mut self, provider: impl Into<String>) -> Self {
        self.provider = Some(provider.into());
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = max_tokens;
        self
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = Some(temperature);
        self
    }

    pub fn with_scope(mut self, scope: Scope) -> Self {
        self.scope = scope;
        self
    }
}

/// Token counts and billed cost
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Usage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub total_tokens: u32,
    pub total_cost: f64,
}

impl Usage {
    pub fn new(prompt_tokens: u32, completion_tokens: u32, total_cost: f64) -> Self {
        Self {
            prompt_tokens,
            completion_tokens,
            total_tokens: prompt_tokens + completion_tokens,
            total_cost,
        }
    }
}

/// Decision outcome code returned to callers and recorded in audit
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Completed,
    Cached,
    SafetyRejected,
    PolicyDenied,
    PolicyUnavailable,
    BudgetExceeded,
    ProviderUnavailable,
    DispatchFailed,
    Timeout,
    InvalidRequest,
    InternalError,
}

impl Outcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Outcome::Completed => "completed",
            Outcome::Cached => "cached",
            Outcome::SafetyRejected => "safety_rejected",
            Outcome::PolicyDenied => "policy_denied",
            Outcome::PolicyUnavailable => "policy_unavailable",
            Outcome::BudgetExceeded => "budget_exceeded",
            Outcome::ProviderUnavailable => "provider_unavailable",
            Outcome::DispatchFailed => "dispatch_failed",
            Outcome::Timeout => "timeout",
            Outcome::InvalidRequest => "invalid_request",
            Outcome::InternalError => "internal_error",
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Outcome::Completed | Outcome::Cached)
    }
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Successful pipeline result
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
    pub request_id: String,
    pub content: String,
    pub model: String,
    pub provider: String,
    pub usage: Usage,
    pub outcome: Outcome,
    pub cached: bool,
    /// Non-blocking findings from both scan passes
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub findings: Vec<Finding>,
}
