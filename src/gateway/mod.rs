//! Request pipeline
//!
//! [`Gateway::handle`] runs one request through cache lookup, input
//! screening, routing and estimation, policy, budget reservation, dispatch,
//! output screening, commit and cache store, then writes one audit record.

mod fingerprint;
mod orchestrator;
mod types;

pub use fingerprint::{fingerprint, normalize, Fingerprint};
pub use orchestrator::{Gateway, GatewayBuilder};
pub use types::{Message, Outcome, Request, Response, Scope, ScopeKey, Usage};
