//! Audit trail
//!
//! Every request produces exactly one [`AuditRecord`], whatever its outcome.
//! Breaker transitions are recorded alongside as [`AuditEvent::Breaker`].
//! Sinks are append-only and never fail the request: write errors are logged
//! and dropped.

use crate::breaker::BreakerEvent;
use crate::config::{AuditConfig, AuditSinkKind};
use crate::error::{GatewayError, Result};
use crate::gateway::{Outcome, Scope, Usage};
use crate::policy::PolicyDecision;
use crate::router::AbArm;
use crate::safety::Finding;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::Path;
use std::sync::Arc;
use tracing::{error, info};

/// Pipeline stage, recorded as the point where a request stopped
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Validate,
    Cache,
    InputScreen,
    Route,
    Policy,
    Budget,
    Dispatch,
    OutputScreen,
    Commit,
    Complete,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::Validate => "validate",
            Stage::Cache => "cache",
            Stage::InputScreen => "input_screen",
            Stage::Route => "route",
            Stage::Policy => "policy",
            Stage::Budget => "budget",
            Stage::Dispatch => "dispatch",
            Stage::OutputScreen => "output_screen",
            Stage::Commit => "commit",
            Stage::Complete => "complete",
        };
        f.write_str(name)
    }
}

/// Immutable record of one request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditRecord {
    pub request_id: String,
    pub timestamp: DateTime<Utc>,
    pub model: String,
    pub requested_provider: Option<String>,
    /// Provider that served the request, if any did
    pub provider: Option<String>,
    pub scope: Scope,
    pub fingerprint: Option<String>,
    pub outcome: Outcome,
    pub stage: Stage,
    pub error: Option<String>,
    pub decision: Option<PolicyDecision>,
    #[serde(default)]
    pub input_findings: Vec<Finding>,
    #[serde(default)]
    pub output_findings: Vec<Finding>,
    pub estimated_cost: Option<f64>,
    /// Amount committed to the ledger
    pub cost: f64,
    pub usage: Option<Usage>,
    pub latency_ms: u64,
    pub attempts: u32,
    pub cached: bool,
    pub ab_arm: Option<AbArm>,
}

impl AuditRecord {
    pub fn new(request_id: impl Into<String>, model: impl Into<String>, scope: Scope) -> Self {
        Self {
            request_id: request_id.into(),
            timestamp: Utc::now(),
            model: model.into(),
            requested_provider: None,
            provider: None,
            scope,
            fingerprint: None,
            outcome: Outcome::InternalError,
            stage: Stage::Validate,
            error: None,
            decision: None,
            input_findings: Vec::new(),
            output_findings: Vec::new(),
            estimated_cost: None,
            cost: 0.0,
            usage: None,
            latency_ms: 0,
            attempts: 0,
            cached: false,
            ab_arm: None,
        }
    }
}

/// Anything written to the audit trail
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum AuditEvent {
    Request(AuditRecord),
    Breaker(BreakerEvent),
}

/// Append-only audit destination
pub trait AuditSink: Send + Sync {
    fn emit(&self, event: &AuditEvent);

    fn flush(&self) {}
}

/// Emits each event as a structured log line on the `audit` target
#[derive(Debug, Default)]
pub struct TracingSink;

impl AuditSink for TracingSink {
    fn emit(&self, event: &AuditEvent) {
        match event {
            AuditEvent::Request(record) => info!(
                target: "audit",
                request_id = %record.request_id,
                model = %record.model,
                provider = record.provider.as_deref().unwrap_or("-"),
                scope = %record.scope,
                outcome = %record.outcome,
                stage = %record.stage,
                cost = record.cost,
                latency_ms = record.latency_ms,
                attempts = record.attempts,
                cached = record.cached,
                input_findings = record.input_findings.len(),
                output_findings = record.output_findings.len(),
                error = record.error.as_deref().unwrap_or(""),
                "request audited"
            ),
            AuditEvent::Breaker(event) => info!(
                target: "audit",
                provider = %event.provider,
                from = %event.from,
                to = %event.to,
                cooldown_ms = event.cooldown_ms,
                "breaker transition"
            ),
        }
    }
}

/// JSON-lines file, opened for append
pub struct FileSink {
    writer: Mutex<BufWriter<File>>,
}

impl FileSink {
    pub fn open(path: &Path) -> Result<Self> {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .map_err(|e| {
                GatewayError::Config(format!("Failed to open audit log {:?}: {}", path, e))
            })?;
        Ok(Self {
            writer: Mutex::new(BufWriter::new(file)),
        })
    }
}

impl AuditSink for FileSink {
    fn emit(&self, event: &AuditEvent) {
        let line = match serde_json::to_string(event) {
            Ok(line) => line,
            Err(e) => {
                error!(error = %e, "Failed to serialise audit event");
                return;
            }
        };
        let mut writer = self.writer.lock();
        if let Err(e) = writeln!(writer, "{}", line).and_then(|_| writer.flush()) {
            error!(error = %e, "Failed to write audit event");
        }
    }

    fn flush(&self) {
        let _ = self.writer.lock().flush();
    }
}

/// Keeps events in memory
#[derive(Debug, Default)]
pub struct MemorySink {
    events: Mutex<Vec<AuditEvent>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<AuditEvent> {
        self.events.lock().clone()
    }

    pub fn records(&self) -> Vec<AuditRecord> {
        self.events
            .lock()
            .iter()
            .filter_map(|e| match e {
                AuditEvent::Request(record) => Some(record.clone()),
                AuditEvent::Breaker(_) => None,
            })
            .collect()
    }

    pub fn breaker_events(&self) -> Vec<BreakerEvent> {
        self.events
            .lock()
            .iter()
            .filter_map(|e| match e {
                AuditEvent::Breaker(event) => Some(event.clone()),
                AuditEvent::Request(_) => None,
            })
            .collect()
    }

    pub fn clear(&self) {
        self.events.lock().clear();
    }
}

impl AuditSink for MemorySink {
    fn emit(&self, event: &AuditEvent) {
        self.events.lock().push(event.clone());
    }
}

/// Forwards every event to each inner sink in order
pub struct FanoutSink {
    sinks: Vec<Arc<dyn AuditSink>>,
}

impl FanoutSink {
    pub fn new(sinks: Vec<Arc<dyn AuditSink>>) -> Self {
        Self { sinks }
    }
}

impl AuditSink for FanoutSink {
    fn emit(&self, event: &AuditEvent) {
        for sink in &self.sinks {
            sink.emit(event);
        }
    }

    fn flush(&self) {
        for sink in &self.sinks {
            sink.flush();
        }
    }
}

/// Sink for an audit configuration section
pub fn build_sink(config: &AuditConfig) -> Result<Arc<dyn AuditSink>> {
    let file = || -> Result<Arc<dyn AuditSink>> {
        let path = config.path.as_deref().ok_or_else(|| {
            GatewayError::Config("audit.path is required for the file sink".into())
        })?;
        Ok(Arc::new(FileSink::open(path)?))
    };

    Ok(match config.sink {
        AuditSinkKind::Tracing => Arc::new(TracingSink),
        AuditSinkKind::File => file()?,
        AuditSinkKind::Both => Arc::new(FanoutSink::new(vec![Arc::new(TracingSink), file()?])),
    })
}
