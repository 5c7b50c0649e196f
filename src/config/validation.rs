//! Configuration validation

use super::types::*;
use crate::error::{GatewayError, Result};
use std::collections::HashMap;
use std::net::SocketAddr;

/// Validate the entire configuration
pub fn validate_config(config: &Config) -> Result<()> {
    validate_server(&config.server)?;
    validate_providers(&config.providers)?;
    validate_routing(&config.routing, &config.providers)?;
    validate_retry(&config.retry)?;
    validate_circuit_breaker(&config.circuit_breaker)?;
    validate_cache(&config.cache)?;
    validate_policy(&config.policy)?;
    validate_budget(&config.budget)?;
    validate_audit(&config.audit)?;

    if config.gateway.request_timeout.is_zero() {
        return Err(invalid("gateway.request_timeout must be greater than 0"));
    }

    Ok(())
}

fn invalid(msg: impl Into<String>) -> GatewayError {
    GatewayError::ConfigValidation(msg.into())
}

fn validate_server(server: &ServerConfig) -> Result<()> {
    server.address.parse::<SocketAddr>().map_err(|e| {
        invalid(format!(
            "Invalid server address '{}': {}",
            server.address, e
        ))
    })?;

    if server.max_body_size == 0 {
        return Err(invalid("server.max_body_size must be greater than 0"));
    }

    Ok(())
}

fn validate_providers(providers: &HashMap<String, ProviderConfig>) -> Result<()> {
    if providers.is_empty() {
        return Err(invalid("At least one provider is required"));
    }

    for (name, provider) in providers {
        if !provider.base_url.starts_with("http://") && !provider.base_url.starts_with("https://")
        {
            return Err(invalid(format!(
                "Provider '{}' base_url must start with http:// or https://",
                name
            )));
        }

        for (model, price) in &provider.models {
            if price.input_per_1k < 0.0 || price.output_per_1k < 0.0 {
                return Err(invalid(format!(
                    "Provider '{}' model '{}' has a negative price",
                    name, model
                )));
            }
        }
    }

    Ok(())
}

fn validate_routing(
    routing: &RoutingConfig,
    providers: &HashMap<String, ProviderConfig>,
) -> Result<()> {
    let known = |name: &str, field: &str| -> Result<()> {
        if providers.contains_key(name) {
            Ok(())
        } else {
            Err(invalid(format!(
                "routing.{} references unknown provider '{}'",
                field, name
            )))
        }
    };

    if let Some(default) = &routing.default_provider {
        known(default, "default_provider")?;
    }

    for provider in routing.model_mapping.values() {
        known(provider, "model_mapping")?;
    }

    for provider in &routing.fallback_providers {
        known(provider, "fallback_providers")?;
    }

    if let Some(ab) = &routing.ab_test {
        if !(0.0..=1.0).contains(&ab.ratio) {
            return Err(invalid(format!(
                "routing.ab_test.ratio must be between 0 and 1, got {}",
                ab.ratio
            )));
        }
        if ab.variant_provider.is_none() && ab.variant_model.is_none() {
            return Err(invalid(
                "routing.ab_test needs a variant_provider or variant_model",
            ));
        }
        if let Some(variant) = &ab.variant_provider {
            known(variant, "ab_test.variant_provider")?;
        }
        if ab.bucket.is_zero() {
            return Err(invalid("routing.ab_test.bucket must be greater than 0"));
        }
    }

    Ok(())
}

fn validate_retry(retry: &RetryConfig) -> Result<()> {
    if retry.max_attempts == 0 {
        return Err(invalid("retry.max_attempts must be at least 1"));
    }
    if retry.max_backoff < retry.initial_backoff {
        return Err(invalid(
            "retry.max_backoff must not be shorter than retry.initial_backoff",
        ));
    }
    if !(0.0..=1.0).contains(&retry.jitter) {
        return Err(invalid("retry.jitter must be between 0 and 1"));
    }
    Ok(())
}

fn validate_circuit_breaker(cb: &CircuitBreakerConfig) -> Result<()> {
    if cb.failure_threshold == 0 {
        return Err(invalid(
            "circuit_breaker.failure_threshold must be greater than 0",
        ));
    }
    if cb.max_cooldown < cb.cooldown {
        return Err(invalid(
            "circuit_breaker.max_cooldown must not be shorter than circuit_breaker.cooldown",
        ));
    }
    if cb.backoff_multiplier < 1.0 {
        return Err(invalid(
            "circuit_breaker.backoff_multiplier must be at least 1.0",
        ));
    }
    Ok(())
}

fn validate_cache(cache: &CacheConfig) -> Result<()> {
    if cache.enabled && cache.max_entries == 0 {
        return Err(invalid("cache.max_entries must be greater than 0"));
    }
    Ok(())
}

fn validate_policy(policy: &PolicyConfig) -> Result<()> {
    if policy.enabled && policy.url.as_deref().map_or(true, str::is_empty) {
        return Err(invalid(
            "policy.url is required unless policy.enabled is false",
        ));
    }
    if !policy.path.starts_with('/') {
        return Err(invalid("policy.path must start with '/'"));
    }
    Ok(())
}

fn validate_budget(budget: &BudgetConfig) -> Result<()> {
    let check = |name: &str, limits: &BudgetLimits| -> Result<()> {
        if limits.daily_limit < 0.0 || limits.monthly_limit < 0.0 {
            return Err(invalid(format!("budget '{}' has a negative limit", name)));
        }
        Ok(())
    };

    check("default", &budget.default)?;
    for (scope, limits) in &budget.scopes {
        if !["user:", "project:", "org:"]
            .iter()
            .any(|prefix| scope.starts_with(prefix))
        {
            return Err(invalid(format!(
                "budget scope '{}' must start with user:, project: or org:",
                scope
            )));
        }
        check(scope, limits)?;
    }
    Ok(())
}

fn validate_audit(audit: &AuditConfig) -> Result<()> {
    if matches!(audit.sink, AuditSinkKind::File | AuditSinkKind::Both) && audit.path.is_none() {
        return Err(invalid("audit.path is required for the file sink"));
    }
    Ok(())
}
