//! Proxy handler: lifecycle façade for one proxy family.
//!
//! `initialize` wires the HTTP collaborators, runs one synchronous discovery
//! pass so the catalog is populated before the host accepts calls, then hands
//! off to the poller. `shutdown` stops the poller and unregisters everything
//! this handler registered, in that order.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

use super::config::ProxyConfig;
use super::discovery::{PlatformDatasourceLister, ServiceDirectory};
use super::engine::ProxyEngine;
use super::errors::ProxyError;
use super::family::ProxyFamily;
use super::poller::Poller;
use super::session::SessionStore;
use super::transport::ProxyRpcClient;
use crate::host::ToolHost;

struct ActiveProxy {
    engine: Arc<ProxyEngine>,
    poller: Poller,
}

enum ProxyState {
    Idle,
    /// Reserved by an `activate` that is running its startup pass.
    Starting,
    Active(ActiveProxy),
}

// ─── ProxyHandler ────────────────────────────────────────────────────────────

/// Owns the engine and poller of one family between `initialize` and `shutdown`.
pub struct ProxyHandler {
    family: ProxyFamily,
    state: Mutex<ProxyState>,
}

impl ProxyHandler {
    pub fn new(family: ProxyFamily) -> Self {
        Self {
            family,
            state: Mutex::new(ProxyState::Idle),
        }
    }

    pub fn family(&self) -> ProxyFamily {
        self.family
    }

    /// Start proxying this family's tools into `host`.
    ///
    /// Returns `false` without touching the host when the family is disabled
    /// or no platform URL is configured. Setup failures are logged, not
    /// returned: the surrounding application keeps running without the proxy.
    pub async fn initialize(
        &self,
        config: &ProxyConfig,
        host: Arc<dyn ToolHost>,
        cancel: &CancellationToken,
    ) -> bool {
        let family = self.family;
        if !config.family(family).enabled {
            tracing::info!(%family, "proxy disabled");
            return false;
        }
        let Some(platform_url) = config.platform_url.as_deref().filter(|u| !u.is_empty()) else {
            tracing::info!(%family, "platform URL not set, skipping proxied tool discovery");
            return false;
        };

        let engine = match build_engine(family, config, platform_url, host) {
            Ok(engine) => engine,
            Err(e) => {
                tracing::error!(%family, error = %e, "failed to set up proxy");
                return false;
            }
        };
        self.activate(engine, config, cancel).await
    }

    /// Run the startup pass for `engine` and start polling.
    ///
    /// The handler is reserved before the startup pass, so a concurrent
    /// second activation is a no-op instead of a second poller.
    pub async fn activate(
        &self,
        engine: Arc<ProxyEngine>,
        config: &ProxyConfig,
        cancel: &CancellationToken,
    ) -> bool {
        let family = self.family;
        {
            let mut state = self.state.lock();
            if !matches!(*state, ProxyState::Idle) {
                tracing::warn!(%family, "proxy already initialized");
                return true;
            }
            *state = ProxyState::Starting;
        }

        if let Err(e) = engine.discover_and_update_tools().await {
            tracing::error!(%family, error = %e, "initial proxied tool discovery failed");
        }

        let interval = config.family(family).polling_interval;
        let session_max_age = config.session_max_age;
        let poller = Poller::new();
        let tick_engine = Arc::clone(&engine);
        poller.start(cancel, interval, move || {
            let engine = Arc::clone(&tick_engine);
            async move { poll_once(&engine, session_max_age).await }
        });

        let active = ActiveProxy { engine, poller };
        let abandoned = {
            let mut state = self.state.lock();
            if matches!(*state, ProxyState::Starting) {
                *state = ProxyState::Active(active);
                None
            } else {
                Some(active)
            }
        };
        if let Some(active) = abandoned {
            // Shut down while starting.
            active.poller.stop().await;
            active.engine.registry().unregister_all();
            tracing::info!(%family, "proxy shut down during startup");
            return false;
        }

        tracing::info!(
            %family,
            polling_interval_ms = interval.as_millis() as u64,
            "proxy initialized"
        );
        true
    }

    /// Stop polling, then unregister every tool. A no-op when not active.
    pub async fn shutdown(&self) {
        let previous = std::mem::replace(&mut *self.state.lock(), ProxyState::Idle);
        let ProxyState::Active(active) = previous else {
            return;
        };
        active.poller.stop().await;
        let removed = active.engine.registry().unregister_all();
        tracing::info!(family = %self.family, removed, "proxy shutdown complete");
    }

    /// The running engine, if initialized.
    pub fn engine(&self) -> Option<Arc<ProxyEngine>> {
        match &*self.state.lock() {
            ProxyState::Active(active) => Some(Arc::clone(&active.engine)),
            _ => None,
        }
    }

    /// Whether the background poller is running.
    pub fn is_polling(&self) -> bool {
        match &*self.state.lock() {
            ProxyState::Active(active) => active.poller.is_running(),
            _ => false,
        }
    }
}

/// One poll tick: evict idle sessions, then run a discovery pass.
async fn poll_once(engine: &Arc<ProxyEngine>, session_max_age: Duration) {
    let evicted = engine.sessions().evict_older_than(session_max_age);
    if evicted > 0 {
        tracing::debug!(family = %engine.family(), evicted, "evicted idle sessions");
    }
    if let Err(e) = engine.discover_and_update_tools().await {
        tracing::error!(family = %engine.family(), error = %e, "periodic proxied tool discovery failed");
    }
}

fn build_engine(
    family: ProxyFamily,
    config: &ProxyConfig,
    platform_url: &str,
    host: Arc<dyn ToolHost>,
) -> Result<Arc<ProxyEngine>, ProxyError> {
    let lister = PlatformDatasourceLister::new(
        platform_url,
        config.api_key.clone(),
        config.call_timeout,
    )?;
    let directory = Arc::new(ServiceDirectory::new(family, Arc::new(lister)));
    let sessions = Arc::new(SessionStore::new());
    let transport = ProxyRpcClient::new(
        platform_url,
        config.api_key.clone(),
        config.call_timeout,
        Arc::clone(&sessions),
        Arc::clone(&directory),
    )?;
    Ok(ProxyEngine::new(
        family,
        config,
        directory,
        Arc::new(transport),
        sessions,
        host,
    ))
}

// ─── ProxyManager ────────────────────────────────────────────────────────────

/// One handler per supported family.
pub struct ProxyManager {
    handlers: Vec<ProxyHandler>,
}

impl ProxyManager {
    /// Initialize every family against `host`.
    pub async fn start(
        config: &ProxyConfig,
        host: Arc<dyn ToolHost>,
        cancel: &CancellationToken,
    ) -> Self {
        let mut handlers = Vec::with_capacity(ProxyFamily::ALL.len());
        for family in ProxyFamily::ALL {
            let handler = ProxyHandler::new(*family);
            handler.initialize(config, Arc::clone(&host), cancel).await;
            handlers.push(handler);
        }
        Self { handlers }
    }

    /// Shut down every family.
    pub async fn shutdown(&self) {
        for handler in &self.handlers {
            handler.shutdown().await;
        }
    }

    pub fn handlers(&self) -> &[ProxyHandler] {
        &self.handlers
    }

    /// Handler for `family`, if it exists.
    pub fn handler(&self, family: ProxyFamily) -> Option<&ProxyHandler> {
        self.handlers.iter().find(|h| h.family() == family)
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::InMemoryToolHost;
    use crate::proxy::config::FamilyConfig;
    use crate::proxy::engine::tests::fixture;

    fn config(enabled: bool, url: Option<&str>) -> ProxyConfig {
        let mut config = ProxyConfig {
            platform_url: url.map(str::to_string),
            ..ProxyConfig::default()
        };
        config.families.insert(
            "tempo".into(),
            FamilyConfig {
                enabled,
                polling_interval: Duration::from_secs(60),
            },
        );
        config
    }

    #[tokio::test]
    async fn test_disabled_family_touches_nothing() {
        let host = Arc::new(InMemoryToolHost::new());
        let handler = ProxyHandler::new(ProxyFamily::Tempo);
        let active = handler
            .initialize(
                &config(false, Some("http://localhost:3000")),
                host.clone(),
                &CancellationToken::new(),
            )
            .await;
        assert!(!active);
        assert!(handler.engine().is_none());
        assert!(host.is_empty());
    }

    #[tokio::test]
    async fn test_missing_platform_url_is_noop() {
        let host = Arc::new(InMemoryToolHost::new());
        let handler = ProxyHandler::new(ProxyFamily::Tempo);
        assert!(
            !handler
                .initialize(&config(true, None), host, &CancellationToken::new())
                .await
        );
        assert!(!handler.is_polling());
        handler.shutdown().await;
    }

    #[tokio::test]
    async fn test_activate_populates_catalog_then_polls() {
        let fx = fixture();
        let handler = ProxyHandler::new(ProxyFamily::Tempo);
        let cancel = CancellationToken::new();

        assert!(handler.activate(fx.engine.clone(), &config(true, None), &cancel).await);
        assert_eq!(fx.host.tool_names(), vec!["tempo_broken", "tempo_t1", "tempo_t2"]);
        assert!(handler.is_polling());

        handler.shutdown().await;
        assert!(!handler.is_polling());
        assert!(fx.host.is_empty());
        assert!(handler.engine().is_none());

        // Second shutdown is a no-op.
        handler.shutdown().await;
    }

    #[tokio::test]
    async fn test_concurrent_activation_starts_one_poller() {
        let first = fixture();
        let second = fixture();
        let handler = ProxyHandler::new(ProxyFamily::Tempo);
        let cancel = CancellationToken::new();
        let config = config(true, None);

        let (a, b) = tokio::join!(
            handler.activate(first.engine.clone(), &config, &cancel),
            handler.activate(second.engine.clone(), &config, &cancel),
        );
        assert!(a && b);
        assert!(Arc::ptr_eq(&handler.engine().unwrap(), &first.engine));
        assert!(second.host.is_empty());
        assert_eq!(second.transport.count("svc-a", "initialize"), 0);

        handler.shutdown().await;
        assert!(!handler.is_polling());
        assert!(first.host.is_empty());
    }

    #[tokio::test]
    async fn test_cancellation_stops_polling() {
        let fx = fixture();
        let handler = ProxyHandler::new(ProxyFamily::Tempo);
        let cancel = CancellationToken::new();
        handler.activate(fx.engine.clone(), &config(true, None), &cancel).await;

        cancel.cancel();
        assert!(!handler.is_polling());
        handler.shutdown().await;
    }

    #[tokio::test]
    async fn test_manager_with_disabled_families() {
        let host = Arc::new(InMemoryToolHost::new());
        let manager =
            ProxyManager::start(&config(false, None), host.clone(), &CancellationToken::new())
                .await;
        assert_eq!(manager.handlers().len(), ProxyFamily::ALL.len());
        assert!(manager.handler(ProxyFamily::Tempo).is_some());
        manager.shutdown().await;
        assert!(host.is_empty());
    }
}
