//! Warden - Governed LLM Gateway
//!
//! A proxy that sits between applications and LLM providers and runs every
//! request through one pipeline:
//!
//! - **Cache**: fingerprint-keyed responses, served without re-evaluation
//! - **Safety**: PII, toxicity, jailbreak and bias screening with redaction
//! - **Policy**: fail-closed calls to an external policy engine
//! - **Budget**: per-scope daily and monthly spend with reservations
//! - **Routing**: A/B split, fallback, retry with backoff, circuit breakers
//! - **Audit**: exactly one record per request
//!
//! # Quick Start
//!
//! ```no_run
//! use warden::{Gateway, Message, Request, Scope};
//!
//! #[tokio::main]
//! async fn main() -> warden::Result<()> {
//!     let config = warden::config::load_config("warden.yaml")?;
//!     let gateway = Gateway::from_config(config)?;
//!
//!     let request = Request::new("gpt-4", vec![Message::new("user", "Hello")])
//!         .with_scope(Scope::project("research"));
//!     let response = gateway.handle(request).await?;
//!     println!("{}", response.content);
//!     Ok(())
//! }
//! ```
//!
//! # Configuration
//!
//! ```yaml
//! providers:
//!   openai:
//!     kind: openai
//!     base_url: "https://api.openai.com"
//!     api_key: "${OPENAI_API_KEY}"
//!
//! routing:
//!   default_provider: openai
//!
//! policy:
//!   url: "http://localhost:8181"
//!
//! budget:
//!   default:
//!     daily_limit: 50.0
//!     monthly_limit: 500.0
//! ```

pub mod audit;
pub mod breaker;
pub mod budget;
pub mod cache;
pub mod config;
pub mod error;
pub mod gateway;
pub mod policy;
pub mod provider;
pub mod router;
pub mod safety;
pub mod server;

#[cfg(test)]
pub(crate) mod test_support;

pub use config::Config;
pub use error::{GatewayError, Result};
pub use gateway::{Gateway, Message, Outcome, Request, Response, Scope, Usage};
pub use server::Server;

/// Warden version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Warden name
pub const NAME: &str = env!("CARGO_PKG_NAME");
