//! JSON-RPC over HTTP transport to downstream MCP servers.
//!
//! Requests go through the platform's datasource proxy:
//! `POST <platform>/api/datasources/proxy/<id>/api/mcp`.
//! - The session token is round-tripped in `Mcp-Session-Id` when known
//! - Plain-text "Invalid session ID" / "No session" bodies invalidate the session
//! - Server-sent-event framed responses are unwrapped before decoding

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{HeaderMap, ACCEPT, CACHE_CONTROL, CONTENT_TYPE, SET_COOKIE};
use reqwest::Client as HttpClient;

use super::discovery::ServiceDirectory;
use super::errors::ProxyError;
use super::session::SessionStore;
use super::types::{error_codes, JsonRpcRequest, JsonRpcResponse};

// ─── Request ID Generator ────────────────────────────────────────────────────

/// Global monotonic request ID counter.
static NEXT_REQUEST_ID: AtomicU64 = AtomicU64::new(1);

/// Generate a unique request ID.
pub fn next_request_id() -> u64 {
    NEXT_REQUEST_ID.fetch_add(1, Ordering::Relaxed)
}

/// Header carrying the MCP session token in both directions.
pub const SESSION_HEADER: &str = "mcp-session-id";

/// Fallback response header some servers use for the session token.
const ALT_SESSION_HEADER: &str = "x-session-id";

/// Cookie name carrying the session token.
const SESSION_COOKIE: &str = "session_id=";

/// Body prefixes that mean the server dropped our session.
const SESSION_INVALID_PREFIXES: &[&str] = &["Invalid session ID", "No session"];

// ─── Transport Trait ─────────────────────────────────────────────────────────

/// One JSON-RPC exchange with a downstream service, addressed by UID.
#[async_trait]
pub trait McpTransport: Send + Sync {
    /// Send a request and return its `result` payload.
    async fn call(
        &self,
        service_uid: &str,
        method: &str,
        params: Option<serde_json::Value>,
    ) -> Result<serde_json::Value, ProxyError>;

    /// Send a notification (no response expected).
    async fn notify(
        &self,
        service_uid: &str,
        method: &str,
        params: Option<serde_json::Value>,
    ) -> Result<(), ProxyError>;
}

// ─── HTTP Client ─────────────────────────────────────────────────────────────

/// JSON-RPC client that reaches downstream services through the platform proxy.
pub struct ProxyRpcClient {
    http: HttpClient,
    base_url: String,
    api_key: Option<String>,
    sessions: Arc<SessionStore>,
    directory: Arc<ServiceDirectory>,
}

impl ProxyRpcClient {
    /// Create a client with a bounded per-call timeout.
    pub fn new(
        base_url: &str,
        api_key: Option<String>,
        timeout: Duration,
        sessions: Arc<SessionStore>,
        directory: Arc<ServiceDirectory>,
    ) -> Result<Self, ProxyError> {
        let http = HttpClient::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ProxyError::Config {
                reason: format!("failed to build HTTP client: {e}"),
            })?;
        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key,
            sessions,
            directory,
        })
    }

    /// Proxy endpoint for the datasource with numeric id `id`.
    fn endpoint(&self, id: i64) -> String {
        format!("{}/api/datasources/proxy/{id}/api/mcp", self.base_url)
    }

    /// POST one JSON body and return status, headers and raw body text.
    async fn post(
        &self,
        service_uid: &str,
        body: &serde_json::Value,
    ) -> Result<(reqwest::StatusCode, HeaderMap, String), ProxyError> {
        let service = self.directory.resolve(service_uid).await?;
        let session = self.sessions.get_or_create(service_uid);

        let mut request = self
            .http
            .post(self.endpoint(service.id))
            .header(CONTENT_TYPE, "application/json")
            .header(ACCEPT, "application/json, text/event-stream")
            .header(CACHE_CONTROL, "no-cache")
            .json(body);
        if !session.token.is_empty() {
            request = request.header(SESSION_HEADER, session.token.as_str());
        }
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }

        let response = request.send().await.map_err(|e| ProxyError::Transport {
            service: service_uid.to_string(),
            reason: format!("request failed: {e}"),
        })?;

        let status = response.status();
        let headers = response.headers().clone();
        let text = response.text().await.map_err(|e| ProxyError::Transport {
            service: service_uid.to_string(),
            reason: format!("failed to read response: {e}"),
        })?;

        if is_session_invalid(&text) {
            tracing::info!(service_uid, "downstream session expired, clearing token");
            self.sessions.invalidate(service_uid);
            return Err(ProxyError::SessionExpired {
                service: service_uid.to_string(),
                body: text.trim().to_string(),
            });
        }

        Ok((status, headers, text))
    }
}

#[async_trait]
impl McpTransport for ProxyRpcClient {
    async fn call(
        &self,
        service_uid: &str,
        method: &str,
        params: Option<serde_json::Value>,
    ) -> Result<serde_json::Value, ProxyError> {
        let req = JsonRpcRequest::new(next_request_id(), method, params);
        let body = serde_json::to_value(&req).map_err(|e| ProxyError::Transport {
            service: service_uid.to_string(),
            reason: format!("failed to serialize request: {e}"),
        })?;

        tracing::debug!(service_uid, method, id = req.id, "sending downstream request");
        let (status, headers, text) = self.post(service_uid, &body).await?;

        let payload = sse_payload(&text).unwrap_or_else(|| text.clone());
        let response: JsonRpcResponse = match serde_json::from_str(&payload) {
            Ok(resp) => resp,
            Err(_) if !status.is_success() => {
                return Err(ProxyError::Http {
                    endpoint: service_uid.to_string(),
                    status: status.as_u16(),
                    body: text,
                });
            }
            Err(e) => {
                tracing::warn!(service_uid, method, body = %text, "undecodable downstream response");
                return Err(ProxyError::Decode {
                    service: service_uid.to_string(),
                    reason: e.to_string(),
                    body: text,
                });
            }
        };

        if response.error.is_none() && !status.is_success() {
            return Err(ProxyError::Http {
                endpoint: service_uid.to_string(),
                status: status.as_u16(),
                body: text,
            });
        }

        if method == "initialize" {
            if let Some(token) = session_token_from_headers(&headers) {
                tracing::debug!(service_uid, "stored downstream session token");
                self.sessions.set_token(service_uid, &token);
            }
        }

        extract_result(service_uid, response)
    }

    async fn notify(
        &self,
        service_uid: &str,
        method: &str,
        params: Option<serde_json::Value>,
    ) -> Result<(), ProxyError> {
        let mut notification = serde_json::json!({
            "jsonrpc": "2.0",
            "method": method,
        });
        if let Some(params) = params {
            notification["params"] = params;
        }

        let (status, _, text) = self.post(service_uid, &notification).await?;
        if !status.is_success() {
            return Err(ProxyError::Http {
                endpoint: service_uid.to_string(),
                status: status.as_u16(),
                body: text,
            });
        }
        Ok(())
    }
}

// ─── Response Helpers ────────────────────────────────────────────────────────

/// Extract the result from a JSON-RPC response, converting errors to `ProxyError`.
pub fn extract_result(
    service_uid: &str,
    response: JsonRpcResponse,
) -> Result<serde_json::Value, ProxyError> {
    if let Some(err) = response.error {
        return Err(ProxyError::Rpc {
            service: service_uid.to_string(),
            code: err.code,
            message: err.message,
        });
    }

    response.result.ok_or_else(|| ProxyError::Rpc {
        service: service_uid.to_string(),
        code: error_codes::INTERNAL_ERROR,
        message: "response missing both result and error".into(),
    })
}

fn is_session_invalid(body: &str) -> bool {
    let body = body.trim_start();
    SESSION_INVALID_PREFIXES
        .iter()
        .any(|prefix| body.starts_with(prefix))
}

/// Pull the session token out of an `initialize` response.
///
/// Checked in order: `Mcp-Session-Id`, a `session_id=` cookie, `X-Session-ID`.
fn session_token_from_headers(headers: &HeaderMap) -> Option<String> {
    let header = |name: &str| {
        headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .map(str::to_string)
    };

    if let Some(token) = header(SESSION_HEADER) {
        return Some(token);
    }

    let from_cookie = headers
        .get_all(SET_COOKIE)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .find_map(|cookie| {
            let (_, rest) = cookie.split_once(SESSION_COOKIE)?;
            let value = rest.split(';').next().unwrap_or_default().trim();
            (!value.is_empty()).then(|| value.to_string())
        });
    if from_cookie.is_some() {
        return from_cookie;
    }

    header(ALT_SESSION_HEADER)
}

/// Data of the last event in a server-sent-event stream, or `None` when the
/// body is not SSE framed.
fn sse_payload(body: &str) -> Option<String> {
    let mut last: Option<String> = None;
    let mut current: Vec<&str> = Vec::new();

    for line in body.lines() {
        if let Some(data) = line.strip_prefix("data:") {
            current.push(data.strip_prefix(' ').unwrap_or(data));
        } else if line.trim().is_empty() && !current.is_empty() {
            last = Some(current.join("\n"));
            current.clear();
        }
    }
    if !current.is_empty() {
        last = Some(current.join("\n"));
    }
    last
}

// ─── Tests ───────────────────────────────────────────────────────────────────
