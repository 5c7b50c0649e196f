//! Error types for the Warden gateway

use crate::budget::Period;
use crate::gateway::Outcome;
use crate::policy::Violation;
use crate::safety::Direction;
use std::io;
use thiserror::Error;

/// Result type alias for gateway operations
pub type Result<T> = std::result::Result<T, GatewayError>;

/// Main error type for the gateway
///
/// The first group of variants are terminal request outcomes: each one is
/// returned to the caller and recorded in exactly one audit record. The
/// remaining variants cover startup and infrastructure failures.
#[derive(Error, Debug)]
pub enum GatewayError {
    /// A critical safety finding on the request or the provider output
    #[error("Content rejected by {direction} safety screen: {reason}")]
    SafetyRejected { direction: Direction, reason: String },

    /// Governance rules rejected the request
    #[error("Request denied by policy: {}", format_violations(.violations))]
    PolicyDenied { violations: Vec<Violation> },

    /// The policy engine could not produce a decision
    #[error("Policy evaluation unavailable: {0}")]
    PolicyEvaluationUnavailable(String),

    /// The scope cannot afford the estimated cost
    #[error(
        "Budget exceeded for {scope}: {period} limit {limit:.4}, committed {spent:.4}, \
         reserved {reserved:.4}, requested {requested:.4}"
    )]
    BudgetExceeded {
        scope: String,
        period: Period,
        limit: f64,
        spent: f64,
        reserved: f64,
        requested: f64,
    },

    /// Breaker open (or no provider configured) and no fallback left
    #[error("Provider unavailable: {0}")]
    ProviderUnavailable(String),

    /// Upstream call failed after retries, or failed permanently
    #[error("Dispatch to {provider} failed after {attempts} attempt(s): {message}")]
    Dispatch {
        provider: String,
        attempts: u32,
        message: String,
    },

    /// Request-level deadline elapsed
    #[error("Request timeout")]
    Timeout,

    /// Unexpected internal failure
    #[error("Internal error: {0}")]
    Internal(String),

    /// Malformed inbound request
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Configuration file parsing errors
    #[error("Failed to parse configuration: {0}")]
    ConfigParse(String),

    /// Configuration validation errors
    #[error("Configuration validation failed: {0}")]
    ConfigValidation(String),

    /// IO errors
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

fn format_violations(violations: &[Violation]) -> String {
    if violations.is_empty() {
        return "no reason given".to_string();
    }
    violations
        .iter()
        .map(|v| format!("{} ({})", v.message, v.kind))
        .collect::<Vec<_>>()
        .join("; ")
}

impl GatewayError {
    /// Outcome code reported to callers and written to the audit trail
    pub fn outcome(&self) -> Outcome {
        match self {
            GatewayError::SafetyRejected { .. } => Outcome::SafetyRejected,
            GatewayError::PolicyDenied { .. } => Outcome::PolicyDenied,
            GatewayError::PolicyEvaluationUnavailable(_) => Outcome::PolicyUnavailable,
            GatewayError::BudgetExceeded { .. } => Outcome::BudgetExceeded,
            GatewayError::ProviderUnavailable(_) => Outcome::ProviderUnavailable,
            GatewayError::Dispatch { .. } => Outcome::DispatchFailed,
            GatewayError::Timeout => Outcome::Timeout,
            GatewayError::InvalidRequest(_) => Outcome::InvalidRequest,
            _ => Outcome::InternalError,
        }
    }
}

impl From<serde_yaml::Error> for GatewayError {
    fn from(err: serde_yaml::Error) -> Self {
        GatewayError::ConfigParse(err.to_string())
    }
}

impl From<toml::de::Error> for GatewayError {
    fn from(err: toml::de::Error) -> Self {
        GatewayError::ConfigParse(err.to_string())
    }
}

impl From<serde_json::Error> for GatewayError {
    fn from(err: serde_json::Error) -> Self {
        GatewayError::InvalidRequest(err.to_string())
    }
}

impl From<hyper::Error> for GatewayError {
    fn from(err: hyper::Error) -> Self {
        GatewayError::Internal(format!("HTTP server error: {}", err))
    }
}

/// Error response that can be converted to HTTP response
#[derive(Debug, Clone)]
pub struct ErrorResponse {
    pub status: u16,
    pub message: String,
}

impl From<&GatewayError> for ErrorResponse {
    fn from(err: &GatewayError) -> Self {
        let status = match err {
            GatewayError::InvalidRequest(_) => 400,
            GatewayError::BudgetExceeded { .. } => 402,
            GatewayError::PolicyDenied { .. } => 403,
            GatewayError::SafetyRejected { .. } => 422,
            GatewayError::Dispatch { .. } => 502,
            GatewayError::PolicyEvaluationUnavailable(_) | GatewayError::ProviderUnavailable(_) => 503,
            GatewayError::Timeout => 504,
            _ => 500,
        };

        // Internal details stay in the logs
        let message = match err {
            GatewayError::Internal(_)
            | GatewayError::Io(_)
            | GatewayError::Config(_)
            | GatewayError::ConfigParse(_)
            | GatewayError::ConfigValidation(_) => "Internal Server Error".to_string(),
            GatewayError::Timeout => "Gateway Timeout".to_string(),
            other => other.to_string(),
        };

        ErrorResponse { status, message }
    }
}
