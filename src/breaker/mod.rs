//! Per-provider circuit breakers
//!
//! State is a single `AtomicU8` moved only by compare-and-swap, so the gate
//! check on the dispatch path never takes a lock.
//!
//! ```text
//! closed --N failures in window--> open --cooldown--> half_open
//!    ^                               ^                    |
//!    +----------trial succeeds-------|----trial fails-----+
//!                                  (cooldown *= multiplier, capped)
//! ```
//!
//! Only the caller that wins the open to half_open swap gets the trial
//! permit. A trial permit dropped without an outcome counts as a failure,
//! so a cancelled trial cannot wedge the breaker in half_open.

use crate::config::CircuitBreakerConfig;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use std::fmt;
use std::sync::atomic::{AtomicU32, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{info, warn};

const STATE_CLOSED: u8 = 0;
const STATE_OPEN: u8 = 1;
const STATE_HALF_OPEN: u8 = 2;

/// Breaker state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

impl BreakerState {
    fn from_u8(value: u8) -> Self {
        match value {
            STATE_OPEN => BreakerState::Open,
            STATE_HALF_OPEN => BreakerState::HalfOpen,
            _ => BreakerState::Closed,
        }
    }
}

impl fmt::Display for BreakerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            BreakerState::Closed => "closed",
            BreakerState::Open => "open",
            BreakerState::HalfOpen => "half_open",
        })
    }
}

/// A state transition, forwarded to the audit trail
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BreakerEvent {
    pub provider: String,
    pub from: BreakerState,
    pub to: BreakerState,
    pub at: DateTime<Utc>,
    pub consecutive_failures: u32,
    pub cooldown_ms: u64,
}

/// Callback invoked on every transition
pub type TransitionHook = Arc<dyn Fn(&BreakerEvent) + Send + Sync>;

/// Circuit breaker for one provider
pub struct CircuitBreaker {
    name: String,
    failure_threshold: u32,
    window_ms: u64,
    base_cooldown_ms: u64,
    max_cooldown_ms: u64,
    multiplier: f64,
    state: AtomicU8,
    consecutive_failures: AtomicU32,
    window_start_ms: AtomicU64,
    last_failure_ms: AtomicU64,
    open_until_ms: AtomicU64,
    cooldown_ms: AtomicU64,
    epoch: Instant,
    hook: Option<TransitionHook>,
}

impl fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("name", &self.name)
            .field("state", &self.state())
            .field("consecutive_failures", &self.consecutive_failures())
            .finish()
    }
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: &CircuitBreakerConfig) -> Self {
        let base_cooldown_ms = config.cooldown.as_millis() as u64;
        Self {
            name: name.into(),
            failure_threshold: config.failure_threshold.max(1),
            window_ms: config.window.as_millis() as u64,
            base_cooldown_ms,
            max_cooldown_ms: (config.max_cooldown.as_millis() as u64).max(base_cooldown_ms),
            multiplier: config.backoff_multiplier.max(1.0),
            state: AtomicU8::new(STATE_CLOSED),
            consecutive_failures: AtomicU32::new(0),
            window_start_ms: AtomicU64::new(0),
            last_failure_ms: AtomicU64::new(0),
            open_until_ms: AtomicU64::new(0),
            cooldown_ms: AtomicU64::new(base_cooldown_ms),
            epoch: Instant::now(),
            hook: None,
        }
    }

    pub fn with_hook(mut self, hook: TransitionHook) -> Self {
        self.hook = Some(hook);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> BreakerState {
        BreakerState::from_u8(self.state.load(Ordering::SeqCst))
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures.load(Ordering::SeqCst)
    }

    /// Current open period; grows while trials keep failing
    pub fn cooldown(&self) -> Duration {
        Duration::from_millis(self.cooldown_ms.load(Ordering::SeqCst))
    }

    /// Time until an open breaker admits a trial
    pub fn retry_after(&self) -> Option<Duration> {
        if self.state() != BreakerState::Open {
            return None;
        }
        let until = self.open_until_ms.load(Ordering::SeqCst);
        Some(Duration::from_millis(until.saturating_sub(self.now_ms())))
    }

    fn now_ms(&self) -> u64 {
        self.epoch.elapsed().as_millis() as u64
    }

    /// Ask to make a call. `None` means the breaker rejects it without an attempt.
    pub fn try_acquire(self: &Arc<Self>) -> Option<Permit> {
        match self.state.load(Ordering::SeqCst) {
            STATE_CLOSED => Some(Permit::new(self.clone(), false)),
            STATE_OPEN => {
                if self.now_ms() < self.open_until_ms.load(Ordering::SeqCst) {
                    return None;
                }
                if self.transition(STATE_OPEN, STATE_HALF_OPEN) {
                    Some(Permit::new(self.clone(), true))
                } else {
                    None
                }
            }
            _ => None,
        }
    }

    fn on_success(&self, trial: bool) {
        self.consecutive_failures.store(0, Ordering::SeqCst);
        if trial {
            self.cooldown_ms
                .store(self.base_cooldown_ms, Ordering::SeqCst);
            self.transition(STATE_HALF_OPEN, STATE_CLOSED);
        }
    }

    fn on_failure(&self, trial: bool) {
        let now = self.now_ms();
        self.last_failure_ms.store(now, Ordering::SeqCst);

        if trial {
            let current = self.cooldown_ms.load(Ordering::SeqCst);
            let next = ((current as f64 * self.multiplier) as u64).min(self.max_cooldown_ms);
            self.cooldown_ms.store(next, Ordering::SeqCst);
            self.open_until_ms.store(now + next, Ordering::SeqCst);
            self.transition(STATE_HALF_OPEN, STATE_OPEN);
            return;
        }

        if self.state.load(Ordering::SeqCst) != STATE_CLOSED {
            return;
        }

        let window_start = self.window_start_ms.load(Ordering::SeqCst);
        let count = if now.saturating_sub(window_start) > self.window_ms {
            self.window_start_ms.store(now, Ordering::SeqCst);
            self.consecutive_failures.store(1, Ordering::SeqCst);
            1
        } else {
            let count = self.consecutive_failures.fetch_add(1, Ordering::SeqCst) + 1;
            if count == 1 {
                self.window_start_ms.store(now, Ordering::SeqCst);
            }
            count
        };

        if count >= self.failure_threshold {
            self.cooldown_ms
                .store(self.base_cooldown_ms, Ordering::SeqCst);
            self.open_until_ms
                .store(now + self.base_cooldown_ms, Ordering::SeqCst);
            self.transition(STATE_CLOSED, STATE_OPEN);
        }
    }

    /// CAS `from -> to`; the winner reports the event
    fn transition(&self, from: u8, to: u8) -> bool {
        if self
            .state
            .compare_exchange(from, to, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return false;
        }

        let event = BreakerEvent {
            provider: self.name.clone(),
            from: BreakerState::from_u8(from),
            to: BreakerState::from_u8(to),
            at: Utc::now(),
            consecutive_failures: self.consecutive_failures(),
            cooldown_ms: self.cooldown_ms.load(Ordering::SeqCst),
        };

        if to == STATE_OPEN {
            warn!(
                provider = %self.name,
                from = %event.from,
                failures = event.consecutive_failures,
                cooldown_ms = event.cooldown_ms,
                "Circuit breaker opened"
            );
        } else {
            info!(provider = %self.name, from = %event.from, to = %event.to, "Circuit breaker transition");
        }

        if let Some(hook) = &self.hook {
            hook(&event);
        }
        true
    }
}

/// Permission to make one upstream call
///
/// Report the outcome with [`Permit::success`] or [`Permit::failure`].
#[must_use = "report the call outcome on the permit"]
pub struct Permit {
    breaker: Arc<CircuitBreaker>,
    trial: bool,
    resolved: bool,
}

impl Permit {
    fn new(breaker: Arc<CircuitBreaker>, trial: bool) -> Self {
        Self {
            breaker,
            trial,
            resolved: false,
        }
    }

    /// True for the single half-open trial call
    pub fn is_trial(&self) -> bool {
        self.trial
    }

    pub fn success(mut self) {
        self.resolved = true;
        self.breaker.on_success(self.trial);
    }

    pub fn failure(mut self) {
        self.resolved = true;
        self.breaker.on_failure(self.trial);
    }
}

impl Drop for Permit {
    fn drop(&mut self) {
        if !self.resolved && self.trial {
            self.breaker.on_failure(true);
        }
    }
}

/// Lazily created breakers keyed by provider name
pub struct BreakerRegistry {
    config: CircuitBreakerConfig,
    breakers: DashMap<String, Arc<CircuitBreaker>>,
    hook: Option<TransitionHook>,
}

impl BreakerRegistry {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            breakers: DashMap::new(),
            hook: None,
        }
    }

    pub fn with_hook(config: CircuitBreakerConfig, hook: TransitionHook) -> Self {
        Self {
            config,
            breakers: DashMap::new(),
            hook: Some(hook),
        }
    }

    pub fn get_or_create(&self, provider: &str) -> Arc<CircuitBreaker> {
        if let Some(breaker) = self.breakers.get(provider) {
            return breaker.clone();
        }
        self.breakers
            .entry(provider.to_string())
            .or_insert_with(|| {
                let breaker = CircuitBreaker::new(provider, &self.config);
                Arc::new(match &self.hook {
                    Some(hook) => breaker.with_hook(hook.clone()),
                    None => breaker,
                })
            })
            .clone()
    }

    pub fn get(&self, provider: &str) -> Option<Arc<CircuitBreaker>> {
        self.breakers.get(provider).map(|b| b.clone())
    }

    /// Current state of every breaker, sorted by provider
    pub fn states(&self) -> Vec<(String, BreakerState)> {
        let mut states: Vec<_> = self
            .breakers
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().state()))
            .collect();
        states.sort_by(|a, b| a.0.cmp(&b.0));
        states
    }
}
