//! Discovery engine: one pass of "find services, list tools, reconcile".
//!
//! Also owns the invocation path used by the handlers it registers:
//! backer validation, session setup on demand, and the `tools/call` RPC.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use chrono::Utc;
use futures::FutureExt;
use tokio::time::sleep;

use super::config::{ProxyConfig, RetryPolicy};
use super::discovery::ServiceDirectory;
use super::errors::ProxyError;
use super::family::ProxyFamily;
use super::registry::{group_by_hash, ToolDiscovery, ToolRegistry};
use super::session::SessionStore;
use super::transport::McpTransport;
use super::types::{AdvertisedTool, CallToolParams, CallToolResult, InitializeParams, ListToolsResult};
use crate::host::{ToolHandler, ToolHost, ToolInvocation};

/// Counts for one discovery pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PassMetrics {
    /// Services returned by the listing API.
    pub total: usize,
    /// Services queried this pass.
    pub checked: usize,
    /// Services skipped by the freshness policy.
    pub skipped: usize,
    pub failed: usize,
    pub successful: usize,
    pub duration: Duration,
}

// ─── ProxyEngine ─────────────────────────────────────────────────────────────

/// Discovery, registration and invocation for one proxy family.
pub struct ProxyEngine {
    family: ProxyFamily,
    directory: Arc<ServiceDirectory>,
    transport: Arc<dyn McpTransport>,
    sessions: Arc<SessionStore>,
    registry: ToolRegistry,
    retry: RetryPolicy,
    self_ref: Weak<ProxyEngine>,
}

impl ProxyEngine {
    /// Build an engine that registers into `host`.
    pub fn new(
        family: ProxyFamily,
        config: &ProxyConfig,
        directory: Arc<ServiceDirectory>,
        transport: Arc<dyn McpTransport>,
        sessions: Arc<SessionStore>,
        host: Arc<dyn ToolHost>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|self_ref| Self {
            family,
            directory,
            transport,
            sessions,
            registry: ToolRegistry::new(family, host, config.freshness_window),
            retry: config.init_retry,
            self_ref: self_ref.clone(),
        })
    }

    pub fn family(&self) -> ProxyFamily {
        self.family
    }

    pub fn registry(&self) -> &ToolRegistry {
        &self.registry
    }

    pub fn sessions(&self) -> &SessionStore {
        &self.sessions
    }

    // ─── Discovery ───────────────────────────────────────────────────────

    /// Run one discovery pass and reconcile the registry with its result.
    ///
    /// A listing that finds no services of this family unregisters every
    /// tool and succeeds. Per-service failures are logged and counted; they
    /// never abort the pass.
    pub async fn discover_and_update_tools(self: &Arc<Self>) -> Result<PassMetrics, ProxyError> {
        let started = Instant::now();
        let family = self.family;

        let services = match self.directory.refresh().await {
            Ok(services) => services,
            Err(e) if e.is_no_services() => {
                let removed = self.registry.unregister_all();
                tracing::info!(%family, removed, "no datasources of this type, proxied tools cleared");
                return Ok(PassMetrics {
                    duration: started.elapsed(),
                    ..PassMetrics::default()
                });
            }
            Err(e) => return Err(e),
        };

        let mut metrics = PassMetrics {
            total: services.len(),
            ..PassMetrics::default()
        };
        tracing::info!(%family, datasource_count = services.len(), "starting proxied tool discovery");

        let seen: HashSet<String> = services.keys().cloned().collect();

        // Fan out: one task per service that is due for a check.
        let mut handles: Vec<(String, String, _)> = Vec::new();
        for (uid, service) in services {
            if !self.registry.should_rediscover(&uid) {
                tracing::debug!(service_uid = %uid, "skipping recently checked datasource");
                metrics.skipped += 1;
                continue;
            }
            metrics.checked += 1;
            let engine = Arc::clone(self);
            let task_uid = uid.clone();
            handles.push((
                uid,
                service.name,
                tokio::spawn(async move { engine.fetch_tools(&task_uid).await }),
            ));
        }

        // Fan in before touching the registry.
        let mut discoveries = Vec::new();
        let mut answered = Vec::new();
        for (uid, name, handle) in handles {
            let outcome = match handle.await {
                Ok(outcome) => outcome,
                Err(e) => Err(ProxyError::Transport {
                    service: uid.clone(),
                    reason: format!("join error: {e}"),
                }),
            };
            match outcome {
                Ok(tools) => {
                    metrics.successful += 1;
                    discoveries.extend(tools.into_iter().map(|tool| ToolDiscovery {
                        tool,
                        service_uid: uid.clone(),
                        service_name: name.clone(),
                    }));
                    answered.push(uid);
                }
                Err(e) => {
                    metrics.failed += 1;
                    tracing::warn!(service_uid = %uid, error = %e, "failed to discover tools for datasource");
                }
            }
        }

        let checked_at = Utc::now();
        let successful: HashMap<String, _> =
            answered.into_iter().map(|uid| (uid, checked_at)).collect();

        let make_handler = |name: &str| self.handler_for(name);
        let summary = self.registry.reconcile(
            group_by_hash(discoveries),
            &successful,
            &seen,
            &make_handler,
        );
        self.registry.cleanup_removed_services(&seen);

        metrics.duration = started.elapsed();
        tracing::info!(
            %family,
            total = metrics.total,
            checked = metrics.checked,
            skipped = metrics.skipped,
            failed = metrics.failed,
            successful = metrics.successful,
            registered = summary.registered,
            updated = summary.updated,
            unregistered = summary.unregistered,
            duration_ms = metrics.duration.as_millis() as u64,
            "proxied tool discovery completed"
        );
        Ok(metrics)
    }

    /// Current tool list of a service, re-listed over a live session.
    async fn fetch_tools(&self, uid: &str) -> Result<Vec<AdvertisedTool>, ProxyError> {
        if !self.sessions.get_or_create(uid).initialized {
            return self.ensure_session(uid).await;
        }
        match self.list_tools(uid).await {
            Ok(tools) => {
                self.sessions.set_tools(uid, tools.clone());
                Ok(tools)
            }
            Err(e) if e.is_session_expired() => self.ensure_session(uid).await,
            Err(e) => Err(e),
        }
    }

    // ─── Sessions ────────────────────────────────────────────────────────

    /// Initialize the session for `uid` unless already initialized.
    ///
    /// Session expiry during the sequence restarts it from `initialize`, with
    /// exponential backoff, up to the configured number of attempts. Other
    /// errors are returned immediately.
    pub async fn ensure_session(&self, uid: &str) -> Result<Vec<AdvertisedTool>, ProxyError> {
        let session = self.sessions.get_or_create(uid);
        if session.initialized {
            return Ok(session.tools);
        }

        let attempts = self.retry.max_attempts.max(1);
        let mut last_error: Option<ProxyError> = None;
        for attempt in 0..attempts {
            let delay = self.retry.delay_before(attempt);
            if !delay.is_zero() {
                sleep(delay).await;
            }

            match self.initialize_session(uid).await {
                Ok(tools) => return Ok(tools),
                Err(e) if e.is_session_expired() => {
                    tracing::warn!(
                        service_uid = uid,
                        attempt = attempt + 1,
                        "session expired during initialize, retrying"
                    );
                    last_error = Some(e);
                }
                Err(e) => return Err(e),
            }
        }

        Err(ProxyError::InitFailed {
            service: uid.to_string(),
            attempts,
            reason: last_error
                .map(|e| e.to_string())
                .unwrap_or_else(|| "no attempts made".into()),
        })
    }

    /// `initialize` → `notifications/initialized` → `tools/list`.
    async fn initialize_session(&self, uid: &str) -> Result<Vec<AdvertisedTool>, ProxyError> {
        let params =
            serde_json::to_value(InitializeParams::default()).map_err(|e| ProxyError::Transport {
                service: uid.to_string(),
                reason: format!("failed to serialize initialize params: {e}"),
            })?;
        self.transport.call(uid, "initialize", Some(params)).await?;

        if let Err(e) = self
            .transport
            .notify(uid, "notifications/initialized", None)
            .await
        {
            tracing::debug!(service_uid = uid, error = %e, "initialized notification failed");
        }

        let tools = self.list_tools(uid).await?;
        self.sessions.set_tools(uid, tools.clone());
        tracing::debug!(service_uid = uid, tool_count = tools.len(), "downstream session initialized");
        Ok(tools)
    }

    async fn list_tools(&self, uid: &str) -> Result<Vec<AdvertisedTool>, ProxyError> {
        let result = self.transport.call(uid, "tools/list", None).await?;
        let listed: ListToolsResult =
            serde_json::from_value(result.clone()).map_err(|e| ProxyError::Decode {
                service: uid.to_string(),
                reason: format!("invalid tools/list result: {e}"),
                body: result.to_string(),
            })?;
        Ok(listed.tools)
    }

    // ─── Invocation ──────────────────────────────────────────────────────

    /// Handler registered with the host for the external tool `tool`.
    fn handler_for(&self, tool: &str) -> ToolHandler {
        let engine = self.self_ref.clone();
        let tool = tool.to_string();
        Arc::new(move |invocation: ToolInvocation| {
            let engine = engine.clone();
            let tool = tool.clone();
            async move {
                let engine = engine
                    .upgrade()
                    .ok_or_else(|| ProxyError::ShutDown { tool: tool.clone() })?;
                engine.invoke(&tool, invocation).await
            }
            .boxed()
        })
    }

    /// Forward a call of the external tool `tool` to the chosen backer.
    pub async fn invoke(&self, tool: &str, invocation: ToolInvocation) -> Result<String, ProxyError> {
        let uid = invocation.datasource_uid.as_str();
        if uid.is_empty() {
            return Err(ProxyError::MissingServiceUid {
                tool: tool.to_string(),
            });
        }

        self.registry.check_backer(tool, uid)?;
        self.registry.mark_unverified(tool, uid);

        self.ensure_session(uid).await?;

        let original = self
            .registry
            .original_name(tool)
            .ok_or_else(|| ProxyError::UnknownTool {
                name: tool.to_string(),
            })?;
        let params = serde_json::to_value(CallToolParams {
            name: original.clone(),
            arguments: invocation.arguments,
        })
        .map_err(|e| ProxyError::ToolFailed {
            tool: tool.to_string(),
            reason: format!("failed to serialize arguments: {e}"),
        })?;

        tracing::debug!(tool_name = tool, original_name = %original, service_uid = uid, "forwarding tool call");
        let result = match self.transport.call(uid, "tools/call", Some(params.clone())).await {
            Err(e) if e.is_session_expired() => {
                self.ensure_session(uid).await?;
                self.transport.call(uid, "tools/call", Some(params)).await?
            }
            other => other?,
        };

        let call: CallToolResult =
            serde_json::from_value(result.clone()).map_err(|e| ProxyError::Decode {
                service: uid.to_string(),
                reason: format!("invalid tools/call result: {e}"),
                body: result.to_string(),
            })?;
        if call.is_error {
            return Err(ProxyError::ToolFailed {
                tool: tool.to_string(),
                reason: call.text(),
            });
        }
        Ok(format!(
            "Proxied call to {original} via datasource {uid}: {}",
            call.text()
        ))
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
