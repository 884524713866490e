//! Dynamic tool proxy: mirrors tools of datasource-hosted MCP servers.
//!
//! This module handles:
//! - Discovering proxy-capable datasources through the platform listing API
//! - JSON-RPC over HTTP to each datasource through the platform proxy path
//! - Per-datasource session state with expiry recovery
//! - Reconciling downstream tool catalogs into the host under collision-safe names
//! - Periodic re-discovery on a cancellable background poller

pub mod config;
pub mod discovery;
pub mod engine;
pub mod errors;
pub mod family;
pub mod handler;
pub mod poller;
pub mod registry;
pub mod session;
pub mod transport;
pub mod types;

// Re-exports for convenience
pub use config::{FamilyConfig, ProxyConfig, RetryPolicy};
pub use discovery::{DatasourceLister, PlatformDatasourceLister, ServiceDirectory};
pub use engine::{PassMetrics, ProxyEngine};
pub use errors::ProxyError;
pub use family::ProxyFamily;
pub use handler::{ProxyHandler, ProxyManager};
pub use registry::{ToolRegistry, ToolSnapshot};
pub use session::SessionStore;
pub use transport::{McpTransport, ProxyRpcClient};
pub use types::{AdvertisedTool, DownstreamService};
