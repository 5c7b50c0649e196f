//! HTTP request handling
//!
//! - `POST /v1/chat/completions` runs a request through the gateway
//! - `GET /health` reports liveness and breaker states

use crate::error::{ErrorResponse, GatewayError};
use crate::gateway::{Gateway, Message, Request, Scope};
use crate::safety::{Direction, WITHHELD_NOTICE};
use bytes::Bytes;
use http::{header, Method, StatusCode};
use http_body_util::{BodyExt, Full, Limited};
use hyper::body::Incoming;
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::debug;

pub type HttpResponse = hyper::Response<Full<Bytes>>;

/// Inbound chat completion body
#[derive(Debug, Deserialize)]
pub struct ChatCompletionRequest {
    pub messages: Vec<Message>,
    pub model: String,
    #[serde(default)]
    pub provider: Option<String>,
    #[serde(default)]
    pub max_tokens: Option<u32>,
    #[serde(default)]
    pub temperature: Option<f32>,
    #[serde(default)]
    pub user_id: Option<String>,
    #[serde(default)]
    pub project_id: Option<String>,
    #[serde(default)]
    pub org_id: Option<String>,
}

/// Decode a chat body; `request_id` comes from the `X-Request-Id` header when present
pub fn parse_chat_request(
    body: &[u8],
    request_id: Option<&str>,
    default_max_tokens: u32,
) -> crate::error::Result<Request> {
    let chat: ChatCompletionRequest = serde_json::from_slice(body)?;

    let mut request = Request::new(chat.model, chat.messages)
        .with_max_tokens(chat.max_tokens.unwrap_or(default_max_tokens))
        .with_scope(Scope {
            user_id: chat.user_id,
            project_id: chat.project_id,
            org_id: chat.org_id,
        });
    if let Some(id) = request_id.filter(|id| !id.trim().is_empty()) {
        request = request.with_id(id.trim());
    }
    if let Some(provider) = chat.provider {
        request = request.with_provider(provider);
    }
    if let Some(temperature) = chat.temperature {
        request = request.with_temperature(temperature);
    }
    Ok(request)
}

/// Status and JSON body for a terminal error
pub fn error_body(err: &GatewayError) -> (StatusCode, Value) {
    let response = ErrorResponse::from(err);
    let mut body = json!({
        "error": response.message,
        "outcome": err.outcome(),
    });
    match err {
        GatewayError::PolicyDenied { violations } => body["violations"] = json!(violations),
        GatewayError::SafetyRejected {
            direction: Direction::Output,
            ..
        } => body["notice"] = json!(WITHHELD_NOTICE),
        _ => {}
    }
    let status =
        StatusCode::from_u16(response.status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    (status, body)
}

fn json_response(status: StatusCode, body: &Value) -> HttpResponse {
    let mut response = hyper::Response::new(Full::new(Bytes::from(body.to_string())));
    *response.status_mut() = status;
    response.headers_mut().insert(
        header::CONTENT_TYPE,
        header::HeaderValue::from_static("application/json"),
    );
    response
}

fn error_response(err: &GatewayError) -> HttpResponse {
    let (status, body) = error_body(err);
    json_response(status, &body)
}

pub async fn handle_request(
    req: hyper::Request<Incoming>,
    gateway: Arc<Gateway>,
    max_body_size: usize,
) -> Result<HttpResponse, hyper::Error> {
    let method = req.method().clone();
    let path = req.uri().path().to_string();
    debug!(method = %method, path = %path, "Processing request");

    let response = match (method, path.as_str()) {
        (Method::GET, "/health") => health(&gateway),
        (Method::POST, "/v1/chat/completions") => chat(req, &gateway, max_body_size).await,
        (_, "/health") | (_, "/v1/chat/completions") => json_response(
            StatusCode::METHOD_NOT_ALLOWED,
            &json!({"error": "method not allowed"}),
        ),
        _ => json_response(StatusCode::NOT_FOUND, &json!({"error": "not found"})),
    };
    Ok(response)
}

async fn chat(req: hyper::Request<Incoming>, gateway: &Gateway, max_body_size: usize) -> HttpResponse {
    let request_id = req
        .headers()
        .get("x-request-id")
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);

    let body = match Limited::new(req.into_body(), max_body_size).collect().await {
        Ok(collected) => collected.to_bytes(),
        Err(e) => {
            return json_response(
                StatusCode::PAYLOAD_TOO_LARGE,
                &json!({"error": format!("request body rejected: {}", e), "outcome": "invalid_request"}),
            )
        }
    };

    let request = match parse_chat_request(&body, request_id.as_deref(), gateway.default_max_tokens()) {
        Ok(request) => request,
        Err(err) => return error_response(&err),
    };

    match gateway.handle(request).await {
        Ok(response) => json_response(
            StatusCode::OK,
            &json!({
                "id": response.request_id,
                "model": response.model,
                "provider": response.provider,
                "content": response.content,
                "usage": response.usage,
                "outcome": response.outcome,
                "cached": response.cached,
            }),
        ),
        Err(err) => error_response(&err),
    }
}

fn health(gateway: &Gateway) -> HttpResponse {
    let breakers: serde_json::Map<String, Value> = gateway
        .router()
        .provider_names()
        .into_iter()
        .map(|name| {
            let state = gateway
                .router()
                .breakers()
                .get(&name)
                .map(|b| b.state().to_string())
                .unwrap_or_else(|| "closed".to_string());
            (name, Value::String(state))
        })
        .collect();

    json_response(
        StatusCode::OK,
        &json!({
            "status": "ok",
            "version": crate::VERSION,
            "providers": breakers,
        }),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::Violation;

    #[test]
    fn test_parse_chat_request() {
        let body = br#"{
            "model": "gpt-4",
            "messages": [{"role": "user", "content": "hi"}],
            "project_id": "p1",
            "temperature": 0.3,
            "stream": false
        }"#;
        let request = parse_chat_request(body, Some("abc-123"), 256).unwrap();
        assert_eq!(request.id, "abc-123");
        assert_eq!(request.max_tokens, 256);
        assert_eq!(request.scope.project_id.as_deref(), Some("p1"));
        assert_eq!(request.temperature, Some(0.3));
        assert!(request.provider.is_none());
    }

    #[test]
    fn test_generated_id_without_header() {
        let body = br#"{"model": "gpt-4", "messages": [], "max_tokens": 10}"#;
        let request = parse_chat_request(body, None, 1000).unwrap();
        assert!(!request.id.is_empty());
        assert_eq!(request.max_tokens, 10);
    }

    #[test]
    fn test_malformed_body_is_bad_request() {
        let err = parse_chat_request(b"{not json", None, 1000).unwrap_err();
        let (status, body) = error_body(&err);
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["outcome"], "invalid_request");
    }

    #[test]
    fn test_policy_denied_body_lists_violations() {
        let err = GatewayError::PolicyDenied {
            violations: vec![Violation::new("model", "not allowed")],
        };
        let (status, body) = error_body(&err);
        assert_eq!(status, StatusCode::FORBIDDEN);
        assert_eq!(body["outcome"], "policy_denied");
        assert_eq!(body["violations"][0]["type"], "model");
    }

    #[test]
    fn test_withheld_output_carries_notice() {
        let err = GatewayError::SafetyRejected {
            direction: Direction::Output,
            reason: "toxicity (critical)".into(),
        };
        let (status, body) = error_body(&err);
        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
        assert_eq!(body["outcome"], "safety_rejected");
        assert_eq!(body["notice"], WITHHELD_NOTICE);

        let err = GatewayError::SafetyRejected {
            direction: Direction::Input,
            reason: "jailbreak (critical)".into(),
        };
        assert!(error_body(&err).1.get("notice").is_none());
    }

    #[test]
    fn test_timeout_body() {
        let (status, body) = error_body(&GatewayError::Timeout);
        assert_eq!(status, StatusCode::GATEWAY_TIMEOUT);
        assert_eq!(body["outcome"], "timeout");
        assert!(body.get("violations").is_none());
    }
}
