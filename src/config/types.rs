//! Configuration types for the Warden gateway

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

/// Root configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Inbound HTTP listener
    #[serde(default)]
    pub server: ServerConfig,

    /// Pipeline-wide settings
    #[serde(default)]
    pub gateway: GatewayConfig,

    /// Upstream LLM providers by name
    #[serde(default)]
    pub providers: HashMap<String, ProviderConfig>,

    /// Provider selection
    #[serde(default)]
    pub routing: RoutingConfig,

    /// Upstream retry policy
    #[serde(default)]
    pub retry: RetryConfig,

    /// Per-provider circuit breaker thresholds
    #[serde(default)]
    pub circuit_breaker: CircuitBreakerConfig,

    /// Response cache
    #[serde(default)]
    pub cache: CacheConfig,

    /// Safety screening
    #[serde(default)]
    pub safety: SafetyConfig,

    /// External policy engine
    #[serde(default)]
    pub policy: PolicyConfig,

    /// Spend limits
    #[serde(default)]
    pub budget: BudgetConfig,

    /// Audit trail destination
    #[serde(default)]
    pub audit: AuditConfig,
}

/// Inbound server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ServerConfig {
    /// Bind address
    #[serde(default = "default_address")]
    pub address: String,

    /// Maximum accepted request body
    #[serde(default = "default_max_body_size")]
    pub max_body_size: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            address: default_address(),
            max_body_size: default_max_body_size(),
        }
    }
}

fn default_address() -> String {
    "0.0.0.0:8080".to_string()
}

fn default_max_body_size() -> usize {
    1024 * 1024 // 1MB
}

/// Pipeline-wide settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct GatewayConfig {
    /// Upper bound on one request's total pipeline latency
    #[serde(default = "default_request_timeout", with = "humantime_serde")]
    pub request_timeout: Duration,

    /// Applied when the caller omits max_tokens
    #[serde(default = "default_max_tokens")]
    pub default_max_tokens: u32,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            request_timeout: default_request_timeout(),
            default_max_tokens: default_max_tokens(),
        }
    }
}

fn default_request_timeout() -> Duration {
    Duration::from_secs(60)
}

fn default_max_tokens() -> u32 {
    1000
}

/// Wire protocol spoken by an upstream provider
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    /// OpenAI chat completions and compatible APIs
    #[default]
    OpenAI,
    /// Anthropic messages API
    Anthropic,
    /// Google Gemini generateContent API
    Google,
}

/// A single upstream provider
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ProviderConfig {
    /// API flavour
    #[serde(default)]
    pub kind: ProviderKind,

    /// Base URL, e.g. https://api.openai.com
    pub base_url: String,

    /// API key; `${VAR}` is resolved from the environment at call time
    pub api_key: Option<String>,

    /// Per-attempt upstream timeout
    #[serde(default = "default_provider_timeout", with = "humantime_serde")]
    pub timeout: Duration,

    /// Price overrides per model
    #[serde(default)]
    pub models: HashMap<String, ModelPrice>,
}

fn default_provider_timeout() -> Duration {
    Duration::from_secs(30)
}

/// USD price per 1000 tokens
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct ModelPrice {
    pub input_per_1k: f64,
    pub output_per_1k: f64,
}

/// Provider selection configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RoutingConfig {
    /// Used when neither the request nor the model mapping names a provider
    pub default_provider: Option<String>,

    /// Model name (or prefix ending in `*`) to provider name
    #[serde(default)]
    pub model_mapping: HashMap<String, String>,

    /// Tried in order when the selected provider is unavailable
    #[serde(default)]
    pub fallback_providers: Vec<String>,

    /// Optional A/B split
    pub ab_test: Option<AbTestConfig>,
}

/// A/B split configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AbTestConfig {
    /// Disable without removing the section
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Share of eligible traffic sent to the variant (0.0 - 1.0)
    #[serde(default = "default_ab_ratio")]
    pub ratio: f64,

    /// Variant provider; keeps the selected provider when unset
    pub variant_provider: Option<String>,

    /// Variant model; keeps the requested model when unset
    pub variant_model: Option<String>,

    /// Width of the time bucket mixed into the assignment hash
    #[serde(default = "default_ab_bucket", with = "humantime_serde")]
    pub bucket: Duration,
}

fn default_ab_ratio() -> f64 {
    0.1
}

fn default_ab_bucket() -> Duration {
    Duration::from_secs(3600)
}

/// Retry configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RetryConfig {
    /// Total attempts per provider, including the first
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Backoff before the second attempt
    #[serde(default = "default_initial_backoff", with = "humantime_serde")]
    pub initial_backoff: Duration,

    /// Backoff ceiling
    #[serde(default = "default_max_backoff", with = "humantime_serde")]
    pub max_backoff: Duration,

    /// Random spread applied to each delay, as a fraction (0.0 - 1.0)
    #[serde(default = "default_jitter")]
    pub jitter: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_backoff: default_initial_backoff(),
            max_backoff: default_max_backoff(),
            jitter: default_jitter(),
        }
    }
}

fn default_max_attempts() -> u32 {
    3
}

fn default_initial_backoff() -> Duration {
    Duration::from_millis(500)
}

fn default_max_backoff() -> Duration {
    Duration::from_secs(10)
}

fn default_jitter() -> f64 {
    0.2
}

/// Circuit breaker configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures that open the breaker
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,

    /// Failures older than this no longer count toward the threshold
    #[serde(default = "default_failure_window", with = "humantime_serde")]
    pub window: Duration,

    /// First open period
    #[serde(default = "default_cooldown", with = "humantime_serde")]
    pub cooldown: Duration,

    /// Open period ceiling after repeated half-open failures
    #[serde(default = "default_max_cooldown", with = "humantime_serde")]
    pub max_cooldown: Duration,

    /// Cooldown growth per failed trial
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            window: default_failure_window(),
            cooldown: default_cooldown(),
            max_cooldown: default_max_cooldown(),
            backoff_multiplier: default_backoff_multiplier(),
        }
    }
}

fn default_failure_threshold() -> u32 {
    5
}

fn default_failure_window() -> Duration {
    Duration::from_secs(60)
}

fn default_cooldown() -> Duration {
    Duration::from_secs(60)
}

fn default_max_cooldown() -> Duration {
    Duration::from_secs(600)
}

fn default_backoff_multiplier() -> f64 {
    2.0
}

/// Response cache configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CacheConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Lifetime of a stored response
    #[serde(default = "default_cache_ttl", with = "humantime_serde")]
    pub ttl: Duration,

    /// LRU bound
    #[serde(default = "default_max_entries")]
    pub max_entries: usize,

    /// Interval of the background expiry sweep
    #[serde(default = "default_sweep_interval", with = "humantime_serde")]
    pub sweep_interval: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            ttl: default_cache_ttl(),
            max_entries: default_max_entries(),
            sweep_interval: default_sweep_interval(),
        }
    }
}

fn default_cache_ttl() -> Duration {
    Duration::from_secs(3600)
}

fn default_max_entries() -> usize {
    10_000
}

fn default_sweep_interval() -> Duration {
    Duration::from_secs(60)
}

/// Safety screening configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SafetyConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default = "default_true")]
    pub pii: bool,

    #[serde(default = "default_true")]
    pub toxicity: bool,

    #[serde(default = "default_true")]
    pub jailbreak: bool,

    #[serde(default = "default_true")]
    pub bias: bool,
}

impl Default for SafetyConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            pii: true,
            toxicity: true,
            jailbreak: true,
            bias: true,
        }
    }
}

/// Policy engine configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PolicyConfig {
    /// When false, every request receives an unconditional allow decision
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Engine base URL, e.g. http://localhost:8181
    pub url: Option<String>,

    /// Decision document path
    #[serde(default = "default_policy_path")]
    pub path: String,

    /// Evaluation timeout
    #[serde(default = "default_policy_timeout", with = "humantime_serde")]
    pub timeout: Duration,
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            url: None,
            path: default_policy_path(),
            timeout: default_policy_timeout(),
        }
    }
}

fn default_policy_path() -> String {
    "/v1/data/governance".to_string()
}

fn default_policy_timeout() -> Duration {
    Duration::from_secs(5)
}

/// Spend limits
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BudgetConfig {
    /// Limits for scopes without an explicit entry
    #[serde(default)]
    pub default: BudgetLimits,

    /// Explicit limits keyed by scope (`user:alice`, `project:p1`, `org:acme`)
    #[serde(default)]
    pub scopes: HashMap<String, BudgetLimits>,
}

/// Daily and monthly caps in USD
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct BudgetLimits {
    #[serde(default = "default_daily_limit")]
    pub daily_limit: f64,

    #[serde(default = "default_monthly_limit")]
    pub monthly_limit: f64,
}

impl Default for BudgetLimits {
    fn default() -> Self {
        Self {
            daily_limit: default_daily_limit(),
            monthly_limit: default_monthly_limit(),
        }
    }
}

fn default_daily_limit() -> f64 {
    100.0
}

fn default_monthly_limit() -> f64 {
    1000.0
}

/// Where audit records go
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum AuditSinkKind {
    /// Structured tracing events on the `audit` target
    #[default]
    Tracing,
    /// JSON lines appended to a file
    File,
    /// Both of the above
    Both,
}

/// Audit configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AuditConfig {
    #[serde(default)]
    pub sink: AuditSinkKind,

    /// Required for the file sink
    pub path: Option<PathBuf>,
}

fn default_true() -> bool {
    true
}

/// Human-readable durations ("30s", "5m", "1h 30m")
mod humantime_serde {
    use serde::{self, Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&humantime::format_duration(*duration).to_string())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        humantime::parse_duration(&s).map_err(serde::de::Error::custom)
    }
}
