//! Proxy error types.
//!
//! One enum covers the whole subsystem. Callers branch on the variant rather
//! than on message text: session expiry in particular is a distinct variant so
//! the initialize sequence can be retried without string matching.

use thiserror::Error;

/// Errors that can occur while discovering, registering or calling proxied tools.
#[derive(Debug, Error)]
pub enum ProxyError {
    /// Network failure, timeout, or any other error below the HTTP layer.
    #[error("transport error for service '{service}': {reason}")]
    Transport { service: String, reason: String },

    /// The downstream service no longer recognizes our session token.
    #[error("session expired for service '{service}': {body}")]
    SessionExpired { service: String, body: String },

    /// The response body was not a valid JSON-RPC envelope.
    #[error("failed to decode response from '{service}': {reason} (body: {body})")]
    Decode {
        service: String,
        reason: String,
        body: String,
    },

    /// The downstream service returned a JSON-RPC error object.
    #[error("rpc error from '{service}' [{code}]: {message}")]
    Rpc {
        service: String,
        code: i64,
        message: String,
    },

    /// Non-2xx HTTP response that carried no usable envelope.
    #[error("HTTP {status} from '{endpoint}': {body}")]
    Http {
        endpoint: String,
        status: u16,
        body: String,
    },

    /// The listing API answered, but no services of the requested type exist.
    #[error("no {service_type} datasources found")]
    NoServices { service_type: String },

    /// A service UID could not be resolved even after refreshing the directory.
    #[error("{service_type} datasource with UID '{uid}' not found")]
    ServiceNotFound { service_type: String, uid: String },

    /// A tool was invoked against a service that does not back it.
    #[error("datasource {service_uid} does not provide tool {tool}")]
    NotABacker { tool: String, service_uid: String },

    /// A tool was invoked without a service UID.
    #[error("datasource_uid is required for tool {tool}")]
    MissingServiceUid { tool: String },

    /// The tool is not (or no longer) registered.
    #[error("tool {name} not found in registry")]
    UnknownTool { name: String },

    /// The downstream tool ran but reported failure.
    #[error("tool '{tool}' failed: {reason}")]
    ToolFailed { tool: String, reason: String },

    /// The initialize sequence kept hitting expired sessions.
    #[error("failed to initialize session for '{service}' after {attempts} attempts: {reason}")]
    InitFailed {
        service: String,
        attempts: u32,
        reason: String,
    },

    /// Configuration loading or validation error.
    #[error("config error: {reason}")]
    Config { reason: String },

    /// The proxy that registered this tool has been shut down.
    #[error("proxy for tool '{tool}' has been shut down")]
    ShutDown { tool: String },
}

impl ProxyError {
    /// Whether this error means the session must be re-initialized.
    pub fn is_session_expired(&self) -> bool {
        matches!(self, ProxyError::SessionExpired { .. })
    }

    /// Whether the listing API simply had no services of the requested type.
    pub fn is_no_services(&self) -> bool {
        matches!(self, ProxyError::NoServices { .. })
    }
}
