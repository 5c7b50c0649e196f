//! Request fingerprints used as cache keys
//!
//! Message content is normalised before hashing: leading and trailing
//! whitespace is dropped and internal runs of whitespace collapse to one
//! space; roles are lowercased. Model, explicit provider, `max_tokens` and
//! temperature are part of the key, scope is not.

use super::types::Request;
use sha2::{Digest, Sha256};
use std::fmt;

/// Hex-encoded SHA-256 digest of a normalised request
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Fingerprint(String);

impl Fingerprint {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Compute the fingerprint of a request
pub fn fingerprint(request: &Request) -> Fingerprint {
    let mut hasher = Sha256::new();

    field(&mut hasher, request.provider.as_deref().unwrap_or("*"));
    field(&mut hasher, request.model.trim());
    field(&mut hasher, &request.max_tokens.to_string());
    field(
        &mut hasher,
        &request
            .temperature
            .map(|t| format!("{:.2}", t))
            .unwrap_or_default(),
    );

    for message in &request.messages {
        field(&mut hasher, &message.role.trim().to_lowercase());
        field(&mut hasher, &normalize(&message.content));
    }

    Fingerprint(hex::encode(hasher.finalize()))
}

/// Length-prefixed so adjacent fields cannot run together
fn field(hasher: &mut Sha256, value: &str) {
    hasher.update((value.len() as u64).to_be_bytes());
    hasher.update(value.as_bytes());
}

/// Collapse whitespace runs and trim
pub fn normalize(content: &str) -> String {
    content.split_whitespace().collect::<Vec<_>>().join(" ")
}
