//! Provider selection and dispatch
//!
//! Selection order for a request:
//! 1. the explicit provider on the request
//! 2. `model_mapping`, exact model name first, then the longest `prefix*` key
//! 3. `default_provider`
//! 4. the only configured provider, if there is exactly one
//!
//! Requests without an explicit provider are eligible for the A/B split.
//!
//! Dispatch walks the primary and then each fallback provider. A provider
//! whose breaker is open is skipped without an attempt. Transient errors are
//! retried on the same provider with backoff, then fall through to the next
//! candidate; a permanent error ends dispatch immediately.

pub mod retry;

pub use retry::RetryPolicy;

use crate::breaker::BreakerRegistry;
use crate::config::RoutingConfig;
use crate::error::{GatewayError, Result};
use crate::gateway::Request;
use crate::provider::{Provider, ProviderError, ProviderRequest, ProviderResponse};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Which side of the A/B split a request landed on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AbArm {
    Control,
    Variant,
}

/// Routing decision for one request
#[derive(Debug, Clone, PartialEq)]
pub struct Selection {
    pub provider: String,
    pub model: String,
    /// `None` when no split applies
    pub arm: Option<AbArm>,
}

/// A completed upstream call
#[derive(Debug, Clone)]
pub struct Dispatched {
    /// Provider that produced the response, possibly a fallback
    pub provider: String,
    pub model: String,
    pub response: ProviderResponse,
    /// Upstream attempts across all providers
    pub attempts: u32,
}

/// A/B bucket in `0..100` for a scope at a point in time
///
/// Stable for every request from the same scope within one time bucket.
pub fn ab_bucket(scope: &str, at: DateTime<Utc>, bucket: Duration) -> u8 {
    let width = bucket.as_secs().max(1) as i64;
    let slot = at.timestamp().div_euclid(width);

    let mut hasher = Sha256::new();
    hasher.update(scope.as_bytes());
    hasher.update(b":");
    hasher.update(slot.to_be_bytes());
    let digest = hasher.finalize();

    let mut head = [0u8; 8];
    head.copy_from_slice(&digest[..8]);
    (u64::from_be_bytes(head) % 100) as u8
}

pub struct ProviderRouter {
    providers: HashMap<String, Arc<dyn Provider>>,
    routing: RoutingConfig,
    retry: RetryPolicy,
    breakers: Arc<BreakerRegistry>,
}

impl ProviderRouter {
    pub fn new(
        providers: HashMap<String, Arc<dyn Provider>>,
        routing: RoutingConfig,
        retry: RetryPolicy,
        breakers: Arc<BreakerRegistry>,
    ) -> Self {
        Self {
            providers,
            routing,
            retry,
            breakers,
        }
    }

    pub fn breakers(&self) -> &Arc<BreakerRegistry> {
        &self.breakers
    }

    pub fn provider_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.providers.keys().cloned().collect();
        names.sort();
        names
    }

    /// Pick provider and model for `request`
    pub fn select(&self, request: &Request, now: DateTime<Utc>) -> Result<Selection> {
        if let Some(explicit) = &request.provider {
            if !self.providers.contains_key(explicit) {
                return Err(GatewayError::InvalidRequest(format!(
                    "unknown provider '{}'",
                    explicit
                )));
            }
            return Ok(Selection {
                provider: explicit.clone(),
                model: request.model.clone(),
                arm: None,
            });
        }

        let primary = self.mapped_provider(&request.model).ok_or_else(|| {
            GatewayError::ProviderUnavailable(format!(
                "no provider configured for model '{}'",
                request.model
            ))
        })?;

        let mut selection = Selection {
            provider: primary,
            model: request.model.clone(),
            arm: None,
        };

        if let Some(ab) = self.routing.ab_test.as_ref().filter(|ab| ab.enabled) {
            let bucket = ab_bucket(&request.scope.to_string(), now, ab.bucket);
            if (bucket as f64) < ab.ratio * 100.0 {
                if let Some(provider) = &ab.variant_provider {
                    selection.provider = provider.clone();
                }
                if let Some(model) = &ab.variant_model {
                    selection.model = model.clone();
                }
                selection.arm = Some(AbArm::Variant);
            } else {
                selection.arm = Some(AbArm::Control);
            }
            debug!(bucket, arm = ?selection.arm, provider = %selection.provider, "A/B assignment");
        }

        Ok(selection)
    }

    fn mapped_provider(&self, model: &str) -> Option<String> {
        let mapping = &self.routing.model_mapping;
        if let Some(provider) = mapping.get(model) {
            return Some(provider.clone());
        }

        let by_prefix = mapping
            .iter()
            .filter_map(|(pattern, provider)| {
                pattern
                    .strip_suffix('*')
                    .filter(|prefix| model.starts_with(prefix))
                    .map(|prefix| (prefix.len(), provider))
            })
            .max_by_key(|(len, _)| *len)
            .map(|(_, provider)| provider.clone());
        if by_prefix.is_some() {
            return by_prefix;
        }

        if let Some(default) = &self.routing.default_provider {
            return Some(default.clone());
        }

        if self.providers.len() == 1 {
            return self.providers.keys().next().cloned();
        }
        None
    }

    /// Primary followed by configured fallbacks, without repeats
    pub fn candidates(&self, selection: &Selection) -> Vec<String> {
        let mut candidates = vec![selection.provider.clone()];
        for name in &self.routing.fallback_providers {
            if !candidates.contains(name) && self.providers.contains_key(name) {
                candidates.push(name.clone());
            }
        }
        candidates
    }

    /// Call upstream, honouring breakers, retrying transient failures and
    /// falling back in order. Backoff never sleeps past `deadline`.
    pub async fn dispatch(
        &self,
        request: &ProviderRequest,
        selection: &Selection,
        deadline: Instant,
    ) -> Result<Dispatched> {
        let mut attempts = 0u32;
        let mut skipped: Vec<String> = Vec::new();
        let mut last_error: Option<(String, ProviderError)> = None;

        for name in self.candidates(selection) {
            let Some(provider) = self.providers.get(&name) else {
                warn!(provider = %name, "Selected provider is not configured");
                skipped.push(name);
                continue;
            };
            let breaker = self.breakers.get_or_create(&name);

            if name != selection.provider {
                info!(provider = %name, primary = %selection.provider, "Falling back");
            }

            let mut provider_attempts = 0u32;
            loop {
                let Some(permit) = breaker.try_acquire() else {
                    debug!(provider = %name, "Circuit open, skipping provider");
                    skipped.push(name.clone());
                    break;
                };

                attempts += 1;
                provider_attempts += 1;

                match provider.complete(request).await {
                    Ok(response) => {
                        permit.success();
                        return Ok(Dispatched {
                            provider: name,
                            model: request.model.clone(),
                            response,
                            attempts,
                        });
                    }
                    Err(err) => {
                        if err.counts_against_provider() {
                            permit.failure();
                        } else {
                            permit.success();
                        }

                        if !err.is_transient() {
                            warn!(provider = %name, error = %err, "Permanent upstream error");
                            return Err(GatewayError::Dispatch {
                                provider: name,
                                attempts,
                                message: err.to_string(),
                            });
                        }

                        let retry = self.retry.should_retry(&err, provider_attempts);
                        warn!(
                            provider = %name,
                            attempt = provider_attempts,
                            error = %err,
                            retry,
                            "Transient upstream error"
                        );
                        last_error = Some((name.clone(), err));
                        if !retry {
                            break;
                        }

                        let delay = self.retry.delay_for_attempt(provider_attempts - 1);
                        if Instant::now() + delay >= deadline {
                            return Err(GatewayError::Timeout);
                        }
                        tokio::time::sleep(delay).await;
                    }
                }
            }
        }

        match last_error {
            Some((provider, err)) => Err(GatewayError::Dispatch {
                provider,
                attempts,
                message: err.to_string(),
            }),
            None => Err(GatewayError::ProviderUnavailable(format!(
                "circuit open for {}",
                skipped.join(", ")
            ))),
        }
    }
}
