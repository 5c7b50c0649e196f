//! End-to-end pipeline tests for Warden
//!
//! Providers and the policy engine are scripted in-process; everything else
//! is the real pipeline.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use warden::audit::{MemorySink, Stage};
use warden::breaker::BreakerState;
use warden::config::{AbTestConfig, Config, ProviderConfig, ProviderKind, RetryConfig};
use warden::gateway::ScopeKey;
use warden::policy::{DecisionInput, PolicyDecision, PolicyEvaluator, Violation};
use warden::provider::{CostEstimator, Provider, ProviderError, ProviderRequest, ProviderResponse};
use warden::safety::{Category, Direction, Severity, WITHHELD_NOTICE};
use warden::server::error_body;
use warden::{Gateway, GatewayError, Message, Outcome, Request, Scope};

// ============================================================================
// Test doubles
// ============================================================================

type Step = Result<ProviderResponse, ProviderError>;

struct MockProvider {
    name: String,
    script: Mutex<VecDeque<Step>>,
    delay: Duration,
    calls: AtomicU32,
    last: Mutex<Option<ProviderRequest>>,
}

impl MockProvider {
    fn new(name: &str, script: Vec<Step>) -> Arc<Self> {
        Self::delayed(name, script, Duration::ZERO)
    }

    fn delayed(name: &str, script: Vec<Step>, delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            script: Mutex::new(script.into()),
            delay,
            calls: AtomicU32::new(0),
            last: Mutex::new(None),
        })
    }

    fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }

    fn last_request(&self) -> ProviderRequest {
        self.last.lock().clone().expect("provider was called")
    }
}

#[async_trait]
impl Provider for MockProvider {
    fn name(&self) -> &str {
        &self.name
    }

    async fn complete(&self, request: &ProviderRequest) -> Step {
        self.calls.fetch_add(1, Ordering::SeqCst);
        *self.last.lock() = Some(request.clone());
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        let step = {
            let mut script = self.script.lock();
            if script.len() > 1 {
                script.pop_front()
            } else {
                script.front().cloned()
            }
        };
        step.expect("scripted step")
    }
}

/// Provider that panics mid-call
struct PanickingProvider;

#[async_trait]
impl Provider for PanickingProvider {
    fn name(&self) -> &str {
        "openai"
    }

    async fn complete(&self, _request: &ProviderRequest) -> Step {
        panic!("provider bug")
    }
}

enum PolicyMode {
    Allow,
    Deny(Vec<Violation>),
    Unavailable,
    Broken,
}

struct MockPolicy {
    mode: PolicyMode,
    calls: AtomicU32,
    last: Mutex<Option<DecisionInput>>,
}

impl MockPolicy {
    fn new(mode: PolicyMode) -> Arc<Self> {
        Arc::new(Self {
            mode,
            calls: AtomicU32::new(0),
            last: Mutex::new(None),
        })
    }

    fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl PolicyEvaluator for MockPolicy {
    async fn evaluate(&self, input: &DecisionInput) -> warden::Result<PolicyDecision> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        *self.last.lock() = Some(input.clone());
        match &self.mode {
            PolicyMode::Allow => Ok(PolicyDecision::allow()),
            PolicyMode::Deny(violations) => Ok(PolicyDecision::deny(violations.clone())),
            PolicyMode::Unavailable => Err(GatewayError::PolicyEvaluationUnavailable(
                "connection refused".into(),
            )),
            PolicyMode::Broken => Err(GatewayError::Internal("decoder exploded".into())),
        }
    }
}

/// Flat prices so budget arithmetic is exact
struct FixedEstimator {
    estimate: f64,
    actual: f64,
}

impl CostEstimator for FixedEstimator {
    fn estimate(&self, _: &str, _: &str, _: &[Message], _: u32) -> f64 {
        self.estimate
    }

    fn actual(&self, _: &str, _: &str, _: u32, _: u32) -> f64 {
        self.actual
    }
}

// ============================================================================
// Helpers
// ============================================================================

fn reply(content: &str) -> Step {
    Ok(ProviderResponse {
        content: content.to_string(),
        model: "gpt-4".to_string(),
        prompt_tokens: 12,
        completion_tokens: 8,
    })
}

fn status(code: u16) -> Step {
    Err(ProviderError::Status {
        status: code,
        message: format!("status {}", code),
    })
}

fn provider_config() -> ProviderConfig {
    ProviderConfig {
        kind: ProviderKind::OpenAI,
        base_url: "http://127.0.0.1:1".to_string(),
        api_key: Some("unused".to_string()),
        timeout: Duration::from_secs(5),
        models: Default::default(),
    }
}

fn test_config() -> Config {
    let mut config = Config::default();
    config.providers.insert("openai".into(), provider_config());
    config.routing.default_provider = Some("openai".into());
    config.policy.enabled = false;
    config.retry = RetryConfig {
        max_attempts: 1,
        initial_backoff: Duration::from_millis(10),
        max_backoff: Duration::from_millis(100),
        jitter: 0.0,
    };
    config.gateway.request_timeout = Duration::from_secs(10);
    config
}

struct Harness {
    gateway: Gateway,
    provider: Arc<MockProvider>,
    policy: Arc<MockPolicy>,
    audit: Arc<MemorySink>,
}

impl Harness {
    fn new(config: Config, provider: Arc<MockProvider>, policy: Arc<MockPolicy>) -> Self {
        Self::with_estimator(config, provider, policy, 0.05, 0.04)
    }

    fn with_estimator(
        config: Config,
        provider: Arc<MockProvider>,
        policy: Arc<MockPolicy>,
        estimate: f64,
        actual: f64,
    ) -> Self {
        let audit = Arc::new(MemorySink::new());
        let gateway = Gateway::builder(config)
            .with_provider("openai", provider.clone())
            .with_policy(policy.clone())
            .with_audit_sink(audit.clone())
            .with_estimator(Arc::new(FixedEstimator { estimate, actual }))
            .build()
            .unwrap();
        Self {
            gateway,
            provider,
            policy,
            audit,
        }
    }

    fn allowing(script: Vec<Step>) -> Self {
        Self::new(
            test_config(),
            MockProvider::new("openai", script),
            MockPolicy::new(PolicyMode::Allow),
        )
    }
}

fn project() -> ScopeKey {
    ScopeKey::Project("p1".into())
}

fn request(content: &str) -> Request {
    Request::new("gpt-4", vec![Message::new("user", content)]).with_scope(Scope::project("p1"))
}

// ============================================================================
// Cache
// ============================================================================

#[tokio::test]
async fn test_cache_hit_skips_policy_and_provider() {
    let h = Harness::allowing(vec![reply("Rust is a systems language.")]);

    let first = h.gateway.handle(request("What is Rust?")).await.unwrap();
    assert_eq!(first.outcome, Outcome::Completed);
    assert!(!first.cached);

    let second = h.gateway.handle(request("  What is   Rust? ")).await.unwrap();
    assert_eq!(second.outcome, Outcome::Cached);
    assert!(second.cached);
    assert_eq!(second.content, first.content);
    assert_eq!(second.usage.total_cost, 0.0);

    assert_eq!(h.provider.calls(), 1);
    assert_eq!(h.policy.calls(), 1);
    // Only the first call was billed
    assert_eq!(h.gateway.ledger().snapshot(&project()).daily_spent, 0.04);

    let records = h.audit.records();
    assert_eq!(records.len(), 2);
    assert_eq!(records[1].outcome, Outcome::Cached);
    assert_eq!(records[1].stage, Stage::Complete);
    assert!(records[1].cached);
}

#[tokio::test]
async fn test_cache_disabled_always_dispatches() {
    let mut config = test_config();
    config.cache.enabled = false;
    let h = Harness::new(
        config,
        MockProvider::new("openai", vec![reply("ok")]),
        MockPolicy::new(PolicyMode::Allow),
    );

    h.gateway.handle(request("same")).await.unwrap();
    let again = h.gateway.handle(request("same")).await.unwrap();
    assert!(!again.cached);
    assert_eq!(h.provider.calls(), 2);
}

#[tokio::test]
async fn test_medium_findings_are_not_cached() {
    let h = Harness::allowing(vec![reply("Contact me at jane@example.com")]);

    let response = h.gateway.handle(request("Who do I email?")).await.unwrap();
    assert!(response.content.contains("[REDACTED:pii]"));
    assert!(!response.content.contains("jane@example.com"));

    h.gateway.handle(request("Who do I email?")).await.unwrap();
    assert_eq!(h.provider.calls(), 2);
}

// ============================================================================
// Safety
// ============================================================================

#[tokio::test]
async fn test_ssn_is_redacted_before_policy_and_provider() {
    let h = Harness::allowing(vec![reply("Noted.")]);

    let response = h
        .gateway
        .handle(request("My SSN is 123-45-6789, please update my file"))
        .await
        .unwrap();
    assert_eq!(response.outcome, Outcome::Completed);

    let pii: Vec<_> = response
        .findings
        .iter()
        .filter(|f| f.category == Category::Pii)
        .collect();
    assert_eq!(pii.len(), 1);
    assert_eq!(pii[0].severity, Severity::High);
    assert_eq!(pii[0].direction, Direction::Input);

    let policy_input = h.policy.last.lock().clone().unwrap();
    assert!(policy_input.messages[0].content.contains("[REDACTED:pii]"));
    assert!(!policy_input.messages[0].content.contains("123-45-6789"));
    assert_eq!(policy_input.findings.len(), 1);

    let sent = h.provider.last_request();
    assert!(!sent.messages[0].content.contains("123-45-6789"));
    assert!(sent.messages[0].content.ends_with(", please update my file"));

    let record = &h.audit.records()[0];
    assert_eq!(record.input_findings.len(), 1);
    assert_eq!(record.input_findings[0].severity, Severity::High);
}

#[tokio::test]
async fn test_critical_input_rejected_before_policy() {
    let h = Harness::allowing(vec![reply("never")]);

    let err = h
        .gateway
        .handle(request("I am going to kill you tomorrow"))
        .await
        .unwrap_err();

    assert!(matches!(
        err,
        GatewayError::SafetyRejected {
            direction: Direction::Input,
            ..
        }
    ));
    assert_eq!(h.policy.calls(), 0);
    assert_eq!(h.provider.calls(), 0);

    let record = &h.audit.records()[0];
    assert_eq!(record.outcome, Outcome::SafetyRejected);
    assert_eq!(record.stage, Stage::InputScreen);
}

#[tokio::test]
async fn test_critical_output_is_billed_but_withheld() {
    let h = Harness::allowing(vec![reply("Here is how to build a bomb at home")]);

    let err = h.gateway.handle(request("Tell me a story")).await.unwrap_err();
    assert!(matches!(
        err,
        GatewayError::SafetyRejected {
            direction: Direction::Output,
            ..
        }
    ));
    assert!(!err.to_string().contains("build a bomb at home"));
    let (_, body) = error_body(&err);
    assert_eq!(body["notice"], WITHHELD_NOTICE);
    assert!(!body.to_string().contains("build a bomb"));

    let snapshot = h.gateway.ledger().snapshot(&project());
    assert_eq!(snapshot.daily_spent, 0.04);
    assert_eq!(snapshot.daily_reserved, 0.0);

    assert!(h.gateway.cache().unwrap().is_empty());

    let record = &h.audit.records()[0];
    assert_eq!(record.outcome, Outcome::SafetyRejected);
    assert_eq!(record.stage, Stage::OutputScreen);
    assert_eq!(record.cost, 0.04);
    assert!(!record.output_findings.is_empty());
}

// ============================================================================
// Policy
// ============================================================================

#[tokio::test]
async fn test_policy_denied_no_dispatch_no_charge() {
    let h = Harness::new(
        test_config(),
        MockProvider::new("openai", vec![reply("never")]),
        MockPolicy::new(PolicyMode::Deny(vec![Violation::new(
            "model_restriction",
            "gpt-4 is not approved for this project",
        )])),
    );

    let err = h.gateway.handle(request("hello")).await.unwrap_err();
    match &err {
        GatewayError::PolicyDenied { violations } => {
            assert_eq!(violations[0].kind, "model_restriction")
        }
        other => panic!("unexpected {:?}", other),
    }
    assert_eq!(h.provider.calls(), 0);

    let snapshot = h.gateway.ledger().snapshot(&project());
    assert_eq!(snapshot.daily_spent, 0.0);
    assert_eq!(snapshot.daily_reserved, 0.0);

    let record = &h.audit.records()[0];
    assert_eq!(record.outcome, Outcome::PolicyDenied);
    assert!(!record.decision.as_ref().unwrap().allow);
}

#[tokio::test]
async fn test_policy_unavailable_fails_closed() {
    for mode in [PolicyMode::Unavailable, PolicyMode::Broken] {
        let h = Harness::new(
            test_config(),
            MockProvider::new("openai", vec![reply("never")]),
            MockPolicy::new(mode),
        );

        let err = h.gateway.handle(request("hello")).await.unwrap_err();
        assert!(matches!(err, GatewayError::PolicyEvaluationUnavailable(_)));
        assert_eq!(h.provider.calls(), 0);
        assert_eq!(h.audit.records()[0].outcome, Outcome::PolicyUnavailable);
    }
}

#[tokio::test]
async fn test_policy_input_carries_estimate_and_budget() {
    let h = Harness::allowing(vec![reply("ok")]);
    h.gateway
        .handle(request("hi").with_scope(Scope::project("p1").with_user("alice")))
        .await
        .unwrap();

    let input = h.policy.last.lock().clone().unwrap();
    assert_eq!(input.estimated_cost, 0.05);
    assert_eq!(input.provider, "openai");
    assert_eq!(input.budgets.len(), 2);
    assert_eq!(input.budgets[0].scope, "user:alice");
    assert_eq!(input.budgets[1].daily_limit, 100.0);
}

// ============================================================================
// Budget
// ============================================================================

#[tokio::test]
async fn test_budget_exceeded_never_reaches_provider() {
    let mut config = test_config();
    config.budget.scopes.insert(
        "project:p1".into(),
        warden::config::BudgetLimits {
            daily_limit: 10.0,
            monthly_limit: 1000.0,
        },
    );
    let h = Harness::with_estimator(
        config,
        MockProvider::new("openai", vec![reply("never")]),
        MockPolicy::new(PolicyMode::Allow),
        1.0,
        1.0,
    );
    h.gateway.ledger().commit(&[project()], "earlier", 9.5);

    let err = h.gateway.handle(request("expensive")).await.unwrap_err();
    assert!(matches!(err, GatewayError::BudgetExceeded { .. }));
    assert_eq!(h.provider.calls(), 0);

    let snapshot = h.gateway.ledger().snapshot(&project());
    assert_eq!(snapshot.daily_spent, 9.5);
    assert_eq!(snapshot.daily_reserved, 0.0);

    let record = &h.audit.records()[0];
    assert_eq!(record.outcome, Outcome::BudgetExceeded);
    assert_eq!(record.stage, Stage::Budget);
}

#[tokio::test]
async fn test_reservation_released_after_dispatch_failure() {
    let h = Harness::allowing(vec![status(400)]);

    let err = h.gateway.handle(request("hello")).await.unwrap_err();
    assert!(matches!(err, GatewayError::Dispatch { attempts: 1, .. }));

    assert_eq!(h.gateway.ledger().reserved_total(&project()), 0.0);
    assert_eq!(h.gateway.ledger().snapshot(&project()).daily_spent, 0.0);
    assert_eq!(h.audit.records()[0].stage, Stage::Dispatch);
}

fn exhausted_budget(limit: f64) -> Config {
    let mut config = test_config();
    config.cache.enabled = false;
    config.budget.scopes.insert(
        "project:p1".into(),
        warden::config::BudgetLimits {
            daily_limit: limit,
            monthly_limit: 100.0,
        },
    );
    config
}

#[tokio::test]
async fn test_reused_request_id_cannot_bypass_budget() {
    let h = Harness::with_estimator(
        exhausted_budget(1.0),
        MockProvider::new("openai", vec![reply("ok")]),
        MockPolicy::new(PolicyMode::Allow),
        1.0,
        1.0,
    );

    h.gateway.handle(request("first").with_id("x")).await.unwrap();
    let err = h.gateway.handle(request("second").with_id("y")).await.unwrap_err();
    assert!(matches!(err, GatewayError::BudgetExceeded { .. }));

    for i in 0..5 {
        let err = h
            .gateway
            .handle(request(&format!("prompt {}", i)).with_id("x"))
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::BudgetExceeded { .. }));
    }

    assert_eq!(h.provider.calls(), 1);
    assert_eq!(h.gateway.ledger().snapshot(&project()).daily_spent, 1.0);
    assert_eq!(h.gateway.ledger().reserved_total(&project()), 0.0);
}

#[tokio::test]
async fn test_replayed_request_is_not_dispatched_again() {
    let h = Harness::with_estimator(
        exhausted_budget(10.0),
        MockProvider::new("openai", vec![reply("ok")]),
        MockPolicy::new(PolicyMode::Allow),
        1.0,
        1.0,
    );

    let req = request("bill me once").with_id("idem-1");
    h.gateway.handle(req.clone()).await.unwrap();
    let err = h.gateway.handle(req).await.unwrap_err();

    assert!(matches!(err, GatewayError::InvalidRequest(_)));
    assert_eq!(h.provider.calls(), 1);
    assert_eq!(h.gateway.ledger().snapshot(&project()).daily_spent, 1.0);
    assert_eq!(h.audit.records()[1].outcome, Outcome::InvalidRequest);
}

#[tokio::test]
async fn test_in_flight_duplicate_keeps_original_reservation() {
    let h = Arc::new(Harness::with_estimator(
        exhausted_budget(10.0),
        MockProvider::delayed("openai", vec![reply("ok")], Duration::from_millis(50)),
        MockPolicy::new(PolicyMode::Allow),
        1.0,
        1.0,
    ));

    let req = request("slow one").with_id("dup");
    let original = {
        let h = h.clone();
        let req = req.clone();
        tokio::spawn(async move { h.gateway.handle(req).await })
    };
    tokio::time::sleep(Duration::from_millis(10)).await;

    let err = h.gateway.handle(req).await.unwrap_err();
    assert!(matches!(err, GatewayError::InvalidRequest(_)));
    // The duplicate must not have released the original's hold
    assert_eq!(h.gateway.ledger().reserved_total(&project()), 1.0);

    original.await.unwrap().unwrap();
    assert_eq!(h.provider.calls(), 1);
    assert_eq!(h.gateway.ledger().snapshot(&project()).daily_spent, 1.0);
    assert_eq!(h.gateway.ledger().reserved_total(&project()), 0.0);
}

#[tokio::test]
async fn test_context_exposed_by_redaction_is_redacted_too() {
    let h = Harness::allowing(vec![reply("Noted.")]);
    let text = format!("call {}@example.com 555-123-4567", "a".repeat(50));

    h.gateway.handle(request(&text)).await.unwrap();

    let sent = h.provider.last_request();
    assert_eq!(sent.messages[0].content, "call [REDACTED:pii] [REDACTED:pii]");
    let policy_input = h.policy.last.lock().clone().unwrap();
    assert_eq!(policy_input.messages[0].content, sent.messages[0].content);

    let rules: Vec<String> = h.audit.records()[0]
        .input_findings
        .iter()
        .map(|f| f.rule.clone())
        .collect();
    assert!(rules.contains(&"email".to_string()));
    assert!(rules.contains(&"phone".to_string()));
}

#[tokio::test]
async fn test_output_redaction_reaches_fixed_point() {
    let text = format!("call {}@example.com 555-123-4567", "b".repeat(50));
    let h = Harness::allowing(vec![reply(&text)]);

    let response = h.gateway.handle(request("Who do I contact?")).await.unwrap();
    assert_eq!(response.content, "call [REDACTED:pii] [REDACTED:pii]");

    let rules: Vec<String> = h.audit.records()[0]
        .output_findings
        .iter()
        .map(|f| f.rule.clone())
        .collect();
    assert!(rules.contains(&"email".to_string()));
    assert!(rules.contains(&"phone".to_string()));
}

#[tokio::test]
async fn test_missing_scope_is_invalid() {
    let h = Harness::allowing(vec![reply("ok")]);
    let err = h
        .gateway
        .handle(Request::new("gpt-4", vec![Message::new("user", "hi")]))
        .await
        .unwrap_err();
    assert!(matches!(err, GatewayError::InvalidRequest(_)));
    assert_eq!(h.audit.records()[0].outcome, Outcome::InvalidRequest);
}

// ============================================================================
// Breakers, retry, fallback
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_breaker_opens_and_blocks_dispatch() {
    let mut config = test_config();
    config.circuit_breaker.failure_threshold = 2;
    config.circuit_breaker.cooldown = Duration::from_secs(30);
    let h = Harness::new(
        config,
        MockProvider::new("openai", vec![status(503), status(503), reply("recovered")]),
        MockPolicy::new(PolicyMode::Allow),
    );

    for i in 0..2 {
        let err = h.gateway.handle(request(&format!("q{}", i))).await.unwrap_err();
        assert!(matches!(err, GatewayError::Dispatch { .. }));
    }
    let breaker = h.gateway.router().breakers().get("openai").unwrap();
    assert_eq!(breaker.state(), BreakerState::Open);

    // Open: rejected without an attempt
    let err = h.gateway.handle(request("q2")).await.unwrap_err();
    assert!(matches!(err, GatewayError::ProviderUnavailable(_)));
    assert_eq!(h.provider.calls(), 2);
    let record = h.audit.records().pop().unwrap();
    assert_eq!(record.outcome, Outcome::ProviderUnavailable);
    assert_eq!(record.attempts, 0);
    assert_eq!(h.gateway.ledger().reserved_total(&project()), 0.0);

    // Cooldown elapsed: one trial call closes the breaker
    tokio::time::advance(Duration::from_secs(30)).await;
    let response = h.gateway.handle(request("q3")).await.unwrap();
    assert_eq!(response.content, "recovered");
    assert_eq!(breaker.state(), BreakerState::Closed);

    let transitions: Vec<_> = h
        .audit
        .breaker_events()
        .iter()
        .map(|e| (e.from, e.to))
        .collect();
    assert_eq!(
        transitions,
        vec![
            (BreakerState::Closed, BreakerState::Open),
            (BreakerState::Open, BreakerState::HalfOpen),
            (BreakerState::HalfOpen, BreakerState::Closed),
        ]
    );
}

#[tokio::test(start_paused = true)]
async fn test_transient_errors_retried() {
    let mut config = test_config();
    config.retry.max_attempts = 3;
    let h = Harness::new(
        config,
        MockProvider::new("openai", vec![status(502), Err(ProviderError::Timeout), reply("third")]),
        MockPolicy::new(PolicyMode::Allow),
    );

    let response = h.gateway.handle(request("retry me")).await.unwrap();
    assert_eq!(response.content, "third");
    assert_eq!(h.provider.calls(), 3);
    assert_eq!(h.audit.records()[0].attempts, 3);
}

#[tokio::test(start_paused = true)]
async fn test_fallback_provider_serves_request() {
    let mut config = test_config();
    config.providers.insert("backup".into(), provider_config());
    config.routing.fallback_providers = vec!["backup".into()];
    config.retry.max_attempts = 2;

    let backup = MockProvider::new("backup", vec![reply("from backup")]);
    let audit = Arc::new(MemorySink::new());
    let primary = MockProvider::new("openai", vec![status(503)]);
    let gateway = Gateway::builder(config)
        .with_provider("openai", primary.clone())
        .with_provider("backup", backup.clone())
        .with_policy(MockPolicy::new(PolicyMode::Allow))
        .with_audit_sink(audit.clone())
        .build()
        .unwrap();

    let response = gateway.handle(request("hello")).await.unwrap();
    assert_eq!(response.provider, "backup");
    assert_eq!(primary.calls(), 2);
    assert_eq!(backup.calls(), 1);

    let record = &audit.records()[0];
    assert_eq!(record.provider.as_deref(), Some("backup"));
    assert_eq!(record.attempts, 3);
}

#[tokio::test]
async fn test_ab_variant_routing() {
    let mut config = test_config();
    config.providers.insert("anthropic".into(), provider_config());
    config.routing.ab_test = Some(AbTestConfig {
        enabled: true,
        ratio: 1.0,
        variant_provider: Some("anthropic".into()),
        variant_model: Some("claude-3-haiku".into()),
        bucket: Duration::from_secs(3600),
    });

    let variant = MockProvider::new("anthropic", vec![reply("from variant")]);
    let audit = Arc::new(MemorySink::new());
    let gateway = Gateway::builder(config)
        .with_provider("openai", MockProvider::new("openai", vec![reply("control")]))
        .with_provider("anthropic", variant.clone())
        .with_policy(MockPolicy::new(PolicyMode::Allow))
        .with_audit_sink(audit.clone())
        .build()
        .unwrap();

    let response = gateway.handle(request("hello")).await.unwrap();
    assert_eq!(response.provider, "anthropic");
    assert_eq!(variant.last_request().model, "claude-3-haiku");
    assert_eq!(
        audit.records()[0].ab_arm,
        Some(warden::router::AbArm::Variant)
    );
}

// ============================================================================
// Deadlines and internal errors
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_timeout_cancels_and_releases() {
    let mut config = test_config();
    config.gateway.request_timeout = Duration::from_millis(200);
    let h = Harness::new(
        config,
        MockProvider::delayed("openai", vec![reply("too late")], Duration::from_secs(5)),
        MockPolicy::new(PolicyMode::Allow),
    );

    let err = h.gateway.handle(request("slow")).await.unwrap_err();
    assert!(matches!(err, GatewayError::Timeout));
    assert_eq!(h.gateway.ledger().reserved_total(&project()), 0.0);
    assert_eq!(h.gateway.ledger().snapshot(&project()).daily_spent, 0.0);

    let records = h.audit.records();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].outcome, Outcome::Timeout);
    assert_eq!(records[0].stage, Stage::Dispatch);
}

#[tokio::test]
async fn test_panic_maps_to_internal_error() {
    let audit = Arc::new(MemorySink::new());
    let gateway = Gateway::builder(test_config())
        .with_provider("openai", Arc::new(PanickingProvider))
        .with_policy(MockPolicy::new(PolicyMode::Allow))
        .with_audit_sink(audit.clone())
        .build()
        .unwrap();

    let err = gateway.handle(request("boom")).await.unwrap_err();
    assert!(matches!(err, GatewayError::Internal(_)));
    assert_eq!(gateway.ledger().reserved_total(&project()), 0.0);
    assert_eq!(audit.records()[0].outcome, Outcome::InternalError);
}

#[tokio::test]
async fn test_one_audit_record_per_request() {
    let h = Harness::allowing(vec![reply("fine")]);

    let _ = h.gateway.handle(request("a")).await;
    let _ = h.gateway.handle(request("a")).await;
    let _ = h.gateway.handle(request("kill you now")).await;
    let _ = h
        .gateway
        .handle(Request::new("gpt-4", vec![]).with_scope(Scope::user("u")))
        .await;

    let records = h.audit.records();
    assert_eq!(records.len(), 4);
    let outcomes: Vec<Outcome> = records.iter().map(|r| r.outcome).collect();
    assert_eq!(
        outcomes,
        vec![
            Outcome::Completed,
            Outcome::Cached,
            Outcome::SafetyRejected,
            Outcome::InvalidRequest
        ]
    );
}

#[tokio::test]
async fn test_concurrent_requests_respect_budget() {
    let mut config = test_config();
    config.cache.enabled = false;
    config.budget.scopes.insert(
        "project:p1".into(),
        warden::config::BudgetLimits {
            daily_limit: 3.0,
            monthly_limit: 100.0,
        },
    );
    let h = Arc::new(Harness::with_estimator(
        config,
        MockProvider::delayed("openai", vec![reply("ok")], Duration::from_millis(20)),
        MockPolicy::new(PolicyMode::Allow),
        1.0,
        1.0,
    ));

    let mut handles = Vec::new();
    for i in 0..10 {
        let h = h.clone();
        handles.push(tokio::spawn(async move {
            h.gateway.handle(request(&format!("req {}", i))).await
        }));
    }

    let mut completed = 0;
    for handle in handles {
        if handle.await.unwrap().is_ok() {
            completed += 1;
        }
    }
    assert_eq!(completed, 3);
    assert_eq!(h.gateway.ledger().snapshot(&project()).daily_spent, 3.0);
    assert_eq!(h.gateway.ledger().reserved_total(&project()), 0.0);
}

// ============================================================================
// HTTP surface
// ============================================================================

#[tokio::test]
async fn test_http_chat_and_health() {
    let audit = Arc::new(MemorySink::new());
    let gateway = Arc::new(
        Gateway::builder(test_config())
            .with_provider("openai", MockProvider::new("openai", vec![reply("Hi there")]))
            .with_policy(MockPolicy::new(PolicyMode::Allow))
            .with_audit_sink(audit.clone())
            .build()
            .unwrap(),
    );

    let server = warden::Server::bind(gateway, "127.0.0.1:0", 1024 * 1024)
        .await
        .unwrap();
    let base = format!("http://{}", server.local_addr().unwrap());
    let (stop_tx, stop_rx) = tokio::sync::oneshot::channel::<()>();
    let running = tokio::spawn(server.run(async {
        let _ = stop_rx.await;
    }));

    let client = reqwest::Client::new();
    let body: serde_json::Value = client
        .post(format!("{}/v1/chat/completions", base))
        .header("X-Request-Id", "http-1")
        .json(&serde_json::json!({
            "model": "gpt-4",
            "messages": [{"role": "user", "content": "Hello"}],
            "project_id": "p1"
        }))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(body["id"], "http-1");
    assert_eq!(body["content"], "Hi there");
    assert_eq!(body["outcome"], "completed");
    assert_eq!(body["usage"]["total_tokens"], 20);

    let denied = client
        .post(format!("{}/v1/chat/completions", base))
        .json(&serde_json::json!({
            "model": "gpt-4",
            "messages": [{"role": "user", "content": "Hello"}]
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(denied.status().as_u16(), 400);
    let body: serde_json::Value = denied.json().await.unwrap();
    assert_eq!(body["outcome"], "invalid_request");

    let health: serde_json::Value = client
        .get(format!("{}/health", base))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(health["status"], "ok");
    assert_eq!(health["providers"]["openai"], "closed");

    let missing = client.get(format!("{}/nope", base)).send().await.unwrap();
    assert_eq!(missing.status().as_u16(), 404);

    stop_tx.send(()).unwrap();
    running.await.unwrap().unwrap();
    assert_eq!(audit.records().len(), 2);
}
