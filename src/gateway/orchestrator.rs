//! Gateway orchestrator

use super::fingerprint::{fingerprint, Fingerprint};
use super::types::{Outcome, Request, Response, ScopeKey, Usage};
use crate::audit::{build_sink, AuditEvent, AuditRecord, AuditSink, Stage};
use crate::breaker::{BreakerEvent, BreakerRegistry, TransitionHook};
use crate::budget::{BudgetLedger, Clock, Hold, SystemClock};
use crate::cache::{spawn_sweeper, CachedResponse, ResponseCache};
use crate::config::Config;
use crate::error::{GatewayError, Result};
use crate::policy::{build_evaluator, DecisionInput, PolicyEvaluator};
use crate::provider::pricing::estimate_tokens;
use crate::provider::{create_provider, CostEstimator, PriceTable, Provider, ProviderRequest};
use crate::router::{ProviderRouter, RetryPolicy};
use crate::safety::{Direction, SafetyScreener, ScanReport, Severity};
use futures::FutureExt;
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// The governed LLM request pipeline
pub struct Gateway {
    cache: Option<Arc<ResponseCache>>,
    cache_sweep: Duration,
    screener: SafetyScreener,
    estimator: Arc<dyn CostEstimator>,
    policy: Arc<dyn PolicyEvaluator>,
    ledger: Arc<BudgetLedger>,
    router: ProviderRouter,
    audit: Arc<dyn AuditSink>,
    request_timeout: Duration,
    default_max_tokens: u32,
}

/// Assembles a [`Gateway`] from configuration, with optional overrides
pub struct GatewayBuilder {
    config: Config,
    providers: HashMap<String, Arc<dyn Provider>>,
    policy: Option<Arc<dyn PolicyEvaluator>>,
    audit: Option<Arc<dyn AuditSink>>,
    clock: Option<Arc<dyn Clock>>,
    estimator: Option<Arc<dyn CostEstimator>>,
}

impl GatewayBuilder {
    /// Use `provider` instead of building one from `providers.<name>`
    pub fn with_provider(mut self, name: impl Into<String>, provider: Arc<dyn Provider>) -> Self {
        self.providers.insert(name.into(), provider);
        self
    }

    pub fn with_policy(mut self, policy: Arc<dyn PolicyEvaluator>) -> Self {
        self.policy = Some(policy);
        self
    }

    pub fn with_audit_sink(mut self, sink: Arc<dyn AuditSink>) -> Self {
        self.audit = Some(sink);
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    pub fn with_estimator(mut self, estimator: Arc<dyn CostEstimator>) -> Self {
        self.estimator = Some(estimator);
        self
    }

    pub fn build(self) -> Result<Gateway> {
        let config = self.config;

        let mut providers = self.providers;
        for (name, provider_config) in &config.providers {
            if !providers.contains_key(name) {
                providers.insert(name.clone(), create_provider(name, provider_config)?);
            }
        }

        let audit = match self.audit {
            Some(sink) => sink,
            None => build_sink(&config.audit)?,
        };
        let policy = match self.policy {
            Some(policy) => policy,
            None => build_evaluator(&config.policy)?,
        };
        let estimator = self
            .estimator
            .unwrap_or_else(|| Arc::new(PriceTable::from_providers(&config.providers)));
        let clock = self.clock.unwrap_or_else(|| Arc::new(SystemClock));

        let hook_sink = audit.clone();
        let hook: TransitionHook = Arc::new(move |event: &BreakerEvent| {
            hook_sink.emit(&AuditEvent::Breaker(event.clone()));
        });
        let breakers = Arc::new(BreakerRegistry::with_hook(config.circuit_breaker.clone(), hook));

        let router = ProviderRouter::new(
            providers,
            config.routing.clone(),
            RetryPolicy::from_config(&config.retry),
            breakers,
        );

        let cache = config
            .cache
            .enabled
            .then(|| Arc::new(ResponseCache::new(&config.cache)));

        info!(
            providers = ?router.provider_names(),
            cache = cache.is_some(),
            timeout = ?config.gateway.request_timeout,
            "Gateway ready"
        );

        Ok(Gateway {
            cache,
            cache_sweep: config.cache.sweep_interval,
            screener: SafetyScreener::new(config.safety.clone()),
            estimator,
            policy,
            ledger: Arc::new(BudgetLedger::with_clock(config.budget.clone(), clock)),
            router,
            audit,
            request_timeout: config.gateway.request_timeout,
            default_max_tokens: config.gateway.default_max_tokens,
        })
    }
}

/// What the pipeline learned before it stopped, for the audit record
struct Trace {
    record: AuditRecord,
    scopes: Vec<ScopeKey>,
    /// Ledger key; set once the fingerprint is known
    billing_key: String,
    /// True only while this request owns a reservation under `billing_key`
    reserved: bool,
}

impl Trace {
    fn new(request: &Request) -> Self {
        let mut record = AuditRecord::new(&request.id, &request.model, request.scope.clone());
        record.requested_provider = request.provider.clone();
        Self {
            record,
            scopes: request.scope.keys(),
            billing_key: request.id.clone(),
            reserved: false,
        }
    }

    fn stage(&mut self, stage: Stage) {
        self.record.stage = stage;
    }
}

impl Gateway {
    pub fn builder(config: Config) -> GatewayBuilder {
        GatewayBuilder {
            config,
            providers: HashMap::new(),
            policy: None,
            audit: None,
            clock: None,
            estimator: None,
        }
    }

    pub fn from_config(config: Config) -> Result<Self> {
        Self::builder(config).build()
    }

    pub fn ledger(&self) -> &Arc<BudgetLedger> {
        &self.ledger
    }

    pub fn cache(&self) -> Option<&Arc<ResponseCache>> {
        self.cache.as_ref()
    }

    pub fn router(&self) -> &ProviderRouter {
        &self.router
    }

    pub fn screener(&self) -> &SafetyScreener {
        &self.screener
    }

    pub fn default_max_tokens(&self) -> u32 {
        self.default_max_tokens
    }

    /// Start the cache sweeper, if caching is on
    pub fn spawn_background(&self) -> Option<JoinHandle<()>> {
        self.cache
            .as_ref()
            .map(|cache| spawn_sweeper(cache.clone(), self.cache_sweep))
    }

    /// Run one request through the pipeline
    ///
    /// Always writes exactly one audit record and never leaves budget
    /// reserved once it returns.
    pub async fn handle(&self, request: Request) -> Result<Response> {
        let started = Instant::now();
        let deadline = started + self.request_timeout;
        let mut trace = Trace::new(&request);

        let result = {
            let pipeline = AssertUnwindSafe(self.run(&request, &mut trace, deadline)).catch_unwind();
            match tokio::time::timeout_at(deadline, pipeline).await {
                Ok(Ok(result)) => result,
                Ok(Err(panic)) => Err(GatewayError::Internal(panic_message(panic.as_ref()))),
                Err(_) => Err(GatewayError::Timeout),
            }
        };

        if result.is_err() && trace.reserved {
            self.ledger.release(&trace.scopes, &trace.billing_key);
        }

        let mut record = trace.record;
        record.latency_ms = started.elapsed().as_millis() as u64;
        match &result {
            Ok(response) => {
                record.outcome = response.outcome;
                info!(
                    request_id = %request.id,
                    provider = %response.provider,
                    model = %response.model,
                    outcome = %response.outcome,
                    cost = response.usage.total_cost,
                    latency_ms = record.latency_ms,
                    "Request completed"
                );
            }
            Err(err) => {
                record.outcome = err.outcome();
                record.error = Some(err.to_string());
                warn!(
                    request_id = %request.id,
                    outcome = %record.outcome,
                    stage = %record.stage,
                    error = %err,
                    latency_ms = record.latency_ms,
                    "Request failed"
                );
            }
        }
        self.audit.emit(&AuditEvent::Request(record));

        result
    }

    async fn run(&self, request: &Request, trace: &mut Trace, deadline: Instant) -> Result<Response> {
        trace.stage(Stage::Validate);
        validate(request)?;

        trace.stage(Stage::Cache);
        let fp = fingerprint(request);
        trace.record.fingerprint = Some(fp.to_string());
        trace.billing_key = billing_key(&request.id, &fp);
        if let Some(entry) = self.cache.as_ref().and_then(|cache| cache.get(&fp)) {
            debug!(request_id = %request.id, fingerprint = %fp, "Serving from cache");
            let usage = Usage {
                total_cost: 0.0,
                ..entry.response.usage
            };
            trace.record.cached = true;
            trace.record.provider = Some(entry.response.provider.clone());
            trace.record.usage = Some(usage);
            trace.stage(Stage::Complete);
            return Ok(Response {
                request_id: request.id.clone(),
                content: entry.response.content,
                model: entry.response.model,
                provider: entry.response.provider,
                usage,
                outcome: Outcome::Cached,
                cached: true,
                findings: Vec::new(),
            });
        }

        trace.stage(Stage::InputScreen);
        let (messages, input_findings) = self
            .screener
            .redact_messages(&request.messages, Direction::Input);
        trace.record.input_findings = input_findings.clone();
        let input_report = ScanReport::new(input_findings.clone());
        if input_report.is_blocking() {
            return Err(GatewayError::SafetyRejected {
                direction: Direction::Input,
                reason: input_report.blocking_reason(),
            });
        }

        trace.stage(Stage::Route);
        let selection = self.router.select(request, self.ledger.now())?;
        trace.record.provider = Some(selection.provider.clone());
        trace.record.ab_arm = selection.arm;
        let estimate = self.estimator.estimate(
            &selection.provider,
            &selection.model,
            &messages,
            request.max_tokens,
        );
        trace.record.estimated_cost = Some(estimate);

        trace.stage(Stage::Policy);
        let input = DecisionInput {
            request_id: request.id.clone(),
            model: selection.model.clone(),
            provider: selection.provider.clone(),
            ab_arm: selection.arm,
            max_tokens: request.max_tokens,
            estimated_prompt_tokens: estimate_tokens(&messages),
            estimated_cost: estimate,
            scope: request.scope.clone(),
            budgets: self.ledger.snapshots(&trace.scopes),
            findings: input_findings.clone(),
            messages: messages.clone(),
        };
        let decision = self.policy.evaluate(&input).await.map_err(|err| match err {
            GatewayError::PolicyEvaluationUnavailable(_) => err,
            other => GatewayError::PolicyEvaluationUnavailable(other.to_string()),
        })?;
        trace.record.decision = Some(decision.clone());
        if !decision.allow {
            return Err(GatewayError::PolicyDenied {
                violations: decision.violations,
            });
        }

        // Authoritative gate; the policy saw a snapshot that may already be stale
        trace.stage(Stage::Budget);
        match self.ledger.reserve(&trace.scopes, &trace.billing_key, estimate)? {
            Hold::Created => trace.reserved = true,
            Hold::InFlight => {
                return Err(GatewayError::InvalidRequest(format!(
                    "request '{}' is already in flight",
                    request.id
                )))
            }
            Hold::Committed => {
                return Err(GatewayError::InvalidRequest(format!(
                    "request '{}' was already processed",
                    request.id
                )))
            }
        }

        trace.stage(Stage::Dispatch);
        let provider_request = ProviderRequest {
            request_id: request.id.clone(),
            model: selection.model.clone(),
            messages,
            max_tokens: request.max_tokens,
            temperature: request.temperature,
        };
        let dispatched = match self.router.dispatch(&provider_request, &selection, deadline).await {
            Ok(dispatched) => dispatched,
            Err(err) => {
                if let GatewayError::Dispatch { attempts, .. } = &err {
                    trace.record.attempts = *attempts;
                }
                return Err(err);
            }
        };
        trace.record.attempts = dispatched.attempts;
        trace.record.provider = Some(dispatched.provider.clone());

        let reply = dispatched.response;
        let cost = self.estimator.actual(
            &dispatched.provider,
            &dispatched.model,
            reply.prompt_tokens,
            reply.completion_tokens,
        );
        let usage = Usage::new(reply.prompt_tokens, reply.completion_tokens, cost);
        trace.record.usage = Some(usage);

        trace.stage(Stage::OutputScreen);
        let (content, output_findings) = self.screener.redact_text(&reply.content, Direction::Output);
        trace.record.output_findings = output_findings.clone();
        let output_report = ScanReport::new(output_findings.clone());

        // The call happened, so it is billed even if the content is withheld
        trace.stage(Stage::Commit);
        self.ledger.commit(&trace.scopes, &trace.billing_key, cost);
        trace.reserved = false;
        trace.record.cost = cost;

        if output_report.is_blocking() {
            trace.stage(Stage::OutputScreen);
            return Err(GatewayError::SafetyRejected {
                direction: Direction::Output,
                reason: output_report.blocking_reason(),
            });
        }

        let mut findings = input_findings;
        findings.extend(output_findings);

        if let Some(cache) = &self.cache {
            if findings.iter().all(|f| f.severity <= Severity::Low) {
                cache.put(
                    fp,
                    CachedResponse {
                        content: content.clone(),
                        model: reply.model.clone(),
                        provider: dispatched.provider.clone(),
                        usage,
                    },
                    cost,
                    cache.default_ttl(),
                );
            }
        }

        trace.stage(Stage::Complete);
        Ok(Response {
            request_id: request.id.clone(),
            content,
            model: reply.model,
            provider: dispatched.provider,
            usage,
            outcome: Outcome::Completed,
            cached: false,
            findings,
        })
    }
}

fn validate(request: &Request) -> Result<()> {
    if request.id.trim().is_empty() {
        return Err(GatewayError::InvalidRequest("request id is empty".into()));
    }
    if request.model.trim().is_empty() {
        return Err(GatewayError::InvalidRequest("model is required".into()));
    }
    if request.messages.is_empty() {
        return Err(GatewayError::InvalidRequest("at least one message is required".into()));
    }
    if request.max_tokens == 0 {
        return Err(GatewayError::InvalidRequest("max_tokens must be positive".into()));
    }
    if request.scope.is_empty() {
        return Err(GatewayError::InvalidRequest(
            "a user, project or org scope is required".into(),
        ));
    }
    Ok(())
}

/// Billing idempotency is per request id and content, so a reused id with
/// a different prompt is a new charge
fn billing_key(request_id: &str, fp: &Fingerprint) -> String {
    format!("{}:{}", request_id, fp)
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        format!("pipeline panicked: {}", message)
    } else if let Some(message) = payload.downcast_ref::<String>() {
        format!("pipeline panicked: {}", message)
    } else {
        "pipeline panicked".to_string()
    }
}
