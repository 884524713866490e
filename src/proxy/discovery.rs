//! Datasource discovery: find proxy-capable services through the platform API.
//!
//! `discover_services` is a pure read against the listing API, filtered by
//! type tag (case-insensitive). `ServiceDirectory` layers a per-family cache on
//! top so the RPC client can resolve a UID to its numeric proxy id without a
//! listing call on every request.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::RwLock;
use reqwest::Client as HttpClient;

use super::errors::ProxyError;
use super::family::ProxyFamily;
use super::types::DownstreamService;

// ─── Listing API ─────────────────────────────────────────────────────────────

/// Source of datasource records (the platform's listing API).
#[async_trait]
pub trait DatasourceLister: Send + Sync {
    /// Return every datasource the platform knows about, of any type.
    async fn list_datasources(&self) -> Result<Vec<DownstreamService>, ProxyError>;
}

/// `GET <platform>/api/datasources` over HTTP.
pub struct PlatformDatasourceLister {
    http: HttpClient,
    base_url: String,
    api_key: Option<String>,
}

impl PlatformDatasourceLister {
    /// Create a lister for the given platform base URL.
    pub fn new(
        base_url: &str,
        api_key: Option<String>,
        timeout: Duration,
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
        })
    }
}

#[async_trait]
impl DatasourceLister for PlatformDatasourceLister {
    async fn list_datasources(&self) -> Result<Vec<DownstreamService>, ProxyError> {
        let url = format!("{}/api/datasources", self.base_url);
        let mut request = self.http.get(&url).header("Accept", "application/json");
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }

        let response = request.send().await.map_err(|e| ProxyError::Transport {
            service: url.clone(),
            reason: format!("failed to list datasources: {e}"),
        })?;

        let status = response.status();
        let body = response.text().await.map_err(|e| ProxyError::Transport {
            service: url.clone(),
            reason: format!("failed to read datasource list: {e}"),
        })?;

        if !status.is_success() {
            return Err(ProxyError::Http {
                endpoint: url,
                status: status.as_u16(),
                body,
            });
        }

        serde_json::from_str(&body).map_err(|e| ProxyError::Decode {
            service: url,
            reason: e.to_string(),
            body,
        })
    }
}

/// List datasources and keep those whose type matches `service_type`.
///
/// Fails with [`ProxyError::NoServices`] when the listing succeeded but nothing
/// matched, so callers can tell "none configured" apart from a transport error.
pub async fn discover_services(
    lister: &dyn DatasourceLister,
    service_type: &str,
) -> Result<HashMap<String, DownstreamService>, ProxyError> {
    let all = lister.list_datasources().await?;

    let services: HashMap<String, DownstreamService> = all
        .into_iter()
        .filter(|ds| ds.service_type.eq_ignore_ascii_case(service_type))
        .map(|ds| (ds.uid.clone(), ds))
        .collect();

    if services.is_empty() {
        return Err(ProxyError::NoServices {
            service_type: service_type.to_string(),
        });
    }

    Ok(services)
}

// ─── ServiceDirectory ────────────────────────────────────────────────────────

/// Cached view of one family's datasources, replaced wholesale on each pass.
pub struct ServiceDirectory {
    family: ProxyFamily,
    lister: Arc<dyn DatasourceLister>,
    services: RwLock<HashMap<String, DownstreamService>>,
}

impl ServiceDirectory {
    /// Create an empty directory for `family`.
    pub fn new(family: ProxyFamily, lister: Arc<dyn DatasourceLister>) -> Self {
        Self {
            family,
            lister,
            services: RwLock::new(HashMap::new()),
        }
    }

    /// Run discovery and replace the cache with the result.
    ///
    /// When no services of this family exist, the cache is cleared and the
    /// `NoServices` error is returned to the caller.
    pub async fn refresh(&self) -> Result<HashMap<String, DownstreamService>, ProxyError> {
        match discover_services(self.lister.as_ref(), self.family.type_tag()).await {
            Ok(services) => {
                *self.services.write() = services.clone();
                Ok(services)
            }
            Err(e) => {
                if e.is_no_services() {
                    self.services.write().clear();
                }
                Err(e)
            }
        }
    }

    /// Resolve a UID, refreshing the cache once on a miss.
    pub async fn resolve(&self, uid: &str) -> Result<DownstreamService, ProxyError> {
        if let Some(ds) = self.services.read().get(uid) {
            return Ok(ds.clone());
        }

        let discovered = self.refresh().await?;
        discovered
            .get(uid)
            .cloned()
            .ok_or_else(|| ProxyError::ServiceNotFound {
                service_type: self.family.type_tag().to_string(),
                uid: uid.to_string(),
            })
    }

    /// Snapshot of the cached services.
    pub fn cached(&self) -> HashMap<String, DownstreamService> {
        self.services.read().clone()
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Lister returning a mutable, scripted datasource list.
    pub(crate) struct FakeLister {
        pub datasources: parking_lot::Mutex<Vec<DownstreamService>>,
        pub calls: AtomicUsize,
    }

    impl FakeLister {
        pub(crate) fn new(datasources: Vec<DownstreamService>) -> Self {
            Self {
                datasources: parking_lot::Mutex::new(datasources),
                calls: AtomicUsize::new(0),
            }
        }

        pub(crate) fn set(&self, datasources: Vec<DownstreamService>) {
            *self.datasources.lock() = datasources;
        }
    }

    #[async_trait]
    impl DatasourceLister for FakeLister {
        async fn list_datasources(&self) -> Result<Vec<DownstreamService>, ProxyError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(self.datasources.lock().clone())
        }
    }

    pub(crate) fn service(id: i64, uid: &str, name: &str, kind: &str) -> DownstreamService {
        DownstreamService {
            id,
            uid: uid.into(),
            name: name.into(),
            url: format!("http://{uid}:3200"),
            service_type: kind.into(),
        }
    }

    #[tokio::test]
    async fn test_discover_filters_case_insensitively() {
        let lister = FakeLister::new(vec![
            service(1, "t1", "Tempo A", "tempo"),
            service(2, "t2", "Tempo B", "Tempo"),
            service(3, "p1", "Prometheus", "prometheus"),
        ]);
        let found = discover_services(&lister, "TEMPO").await.unwrap();
        assert_eq!(found.len(), 2);
        assert!(found.contains_key("t1"));
        assert!(found.contains_key("t2"));
    }

    #[tokio::test]
    async fn test_discover_empty_is_no_services() {
        let lister = FakeLister::new(vec![service(3, "p1", "Prometheus", "prometheus")]);
        let err = discover_services(&lister, "tempo").await.unwrap_err();
        assert!(err.is_no_services());
    }

    #[tokio::test]
    async fn test_directory_resolves_from_cache() {
        let lister = Arc::new(FakeLister::new(vec![service(1, "t1", "Tempo A", "tempo")]));
        let directory = ServiceDirectory::new(ProxyFamily::Tempo, lister.clone());

        let first = directory.resolve("t1").await.unwrap();
        let second = directory.resolve("t1").await.unwrap();
        assert_eq!(first, second);
        assert_eq!(lister.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_directory_unknown_uid() {
        let lister = Arc::new(FakeLister::new(vec![service(1, "t1", "Tempo A", "tempo")]));
        let directory = ServiceDirectory::new(ProxyFamily::Tempo, lister);
        let err = directory.resolve("nope").await.unwrap_err();
        assert!(matches!(err, ProxyError::ServiceNotFound { .. }));
    }

    #[tokio::test]
    async fn test_directory_cleared_when_services_vanish() {
        let lister = Arc::new(FakeLister::new(vec![service(1, "t1", "Tempo A", "tempo")]));
        let directory = ServiceDirectory::new(ProxyFamily::Tempo, lister.clone());
        directory.refresh().await.unwrap();
        assert_eq!(directory.cached().len(), 1);

        lister.set(vec![]);
        assert!(directory.refresh().await.unwrap_err().is_no_services());
        assert!(directory.cached().is_empty());
    }

    #[tokio::test]
    async fn test_platform_lister_decodes_and_sends_bearer() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("GET", "/api/datasources")
            .match_header("authorization", "Bearer secret")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(
                r#"[{"id":7,"uid":"tempo-prod","name":"Tempo Prod","url":"http://tempo","type":"tempo"},
                    {"id":8,"uid":"loki","name":"Loki","url":"http://loki","type":"loki"}]"#,
            )
            .create_async()
            .await;

        let lister = PlatformDatasourceLister::new(
            &format!("{}/", server.url()),
            Some("secret".into()),
            Duration::from_secs(5),
        )
        .unwrap();
        let found = discover_services(&lister, "tempo").await.unwrap();
        assert_eq!(found["tempo-prod"].id, 7);
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_platform_lister_http_error() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("GET", "/api/datasources")
            .with_status(401)
            .with_body("unauthorized")
            .create_async()
            .await;

        let lister =
            PlatformDatasourceLister::new(&server.url(), None, Duration::from_secs(5)).unwrap();
        let err = lister.list_datasources().await.unwrap_err();
        match err {
            ProxyError::Http { status, body, .. } => {
                assert_eq!(status, 401);
                assert_eq!(body, "unauthorized");
            }
            other => panic!("expected Http error, got {other:?}"),
        }
    }
}
