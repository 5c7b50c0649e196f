//! Environment variable interpolation for configuration files
//!
//! Recognised forms:
//! - `${VAR}` fails when unset
//! - `${VAR:-default}` falls back to `default`
//! - `${VAR:?message}` fails with `message`
//! - `$VAR` behaves like `${VAR}`

use crate::error::{GatewayError, Result};
use regex::{Captures, Regex};
use std::collections::HashMap;
use std::sync::LazyLock;

static REFERENCE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)(?:(:[-?])([^}]*))?\}|\$([A-Za-z_][A-Za-z0-9_]*)")
        .expect("env reference pattern is valid")
});

/// Resolves `${...}` references against the process environment or a fixed map
#[derive(Debug, Default)]
pub struct EnvExpander {
    overrides: Option<HashMap<String, String>>,
}

impl EnvExpander {
    /// Expander that reads the process environment
    pub fn new() -> Self {
        Self::default()
    }

    /// Expander that only sees the given variables
    pub fn with_vars<I, K, V>(vars: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        Self {
            overrides: Some(
                vars.into_iter()
                    .map(|(k, v)| (k.into(), v.into()))
                    .collect(),
            ),
        }
    }

    fn lookup(&self, name: &str) -> Option<String> {
        match &self.overrides {
            Some(vars) => vars.get(name).cloned(),
            None => std::env::var(name).ok(),
        }
    }

    /// Expand every reference; all missing variables are reported together
    pub fn expand(&self, input: &str) -> Result<String> {
        let mut missing: Vec<String> = Vec::new();

        let expanded = REFERENCE.replace_all(input, |caps: &Captures| {
            let (name, modifier, argument) = match caps.get(1) {
                Some(name) => (
                    name.as_str(),
                    caps.get(2).map(|m| m.as_str()),
                    caps.get(3).map_or("", |m| m.as_str()),
                ),
                None => (caps.get(4).map_or("", |m| m.as_str()), None, ""),
            };

            if let Some(value) = self.lookup(name) {
                return value;
            }

            match modifier {
                Some(":-") => argument.to_string(),
                Some(":?") if !argument.is_empty() => {
                    missing.push(argument.to_string());
                    String::new()
                }
                _ => {
                    missing.push(format!("environment variable '{}' is not set", name));
                    String::new()
                }
            }
        });

        if missing.is_empty() {
            Ok(expanded.into_owned())
        } else {
            Err(GatewayError::Config(format!(
                "Environment variable errors:\n  - {}",
                missing.join("\n  - ")
            )))
        }
    }
}

/// Expand references against the process environment
pub fn expand_env_vars(input: &str) -> Result<String> {
    EnvExpander::new().expand(input)
}

/// Resolve a single secret value: `${VAR}` / `$VAR` read the environment, anything else is literal
pub fn resolve_secret(value: &str) -> Result<String> {
    if value.starts_with('$') {
        expand_env_vars(value)
    } else {
        Ok(value.to_string())
    }
}
