pub mod host;
pub mod proxy;

pub use host::{InMemoryToolHost, ToolHandler, ToolHost, ToolInvocation, ToolRegistration};
pub use proxy::{ProxyConfig, ProxyError, ProxyFamily, ProxyHandler, ProxyManager};

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    /// Human-readable lines.
    #[default]
    Human,
    /// One JSON object per line.
    Json,
}

impl std::str::FromStr for LogFormat {
    type Err = ProxyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "" | "human" | "text" => Ok(LogFormat::Human),
            "json" => Ok(LogFormat::Json),
            other => Err(ProxyError::Config {
                reason: format!("unknown log format '{other}'"),
            }),
        }
    }
}

/// Initialize the tracing subscriber on stderr.
///
/// `RUST_LOG` overrides the default filter (`proxied_tools=info,warn`).
/// Calling this twice is harmless; the second call leaves the first
/// subscriber in place.
pub fn init_tracing(format: LogFormat) {
    use tracing_subscriber::fmt;
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("proxied_tools=info,warn"));

    let builder = fmt::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(true)
        .with_thread_ids(false);

    let installed = match format {
        LogFormat::Human => builder.try_init(),
        LogFormat::Json => builder.json().try_init(),
    };

    if installed.is_ok() {
        tracing::info!(
            version = env!("CARGO_PKG_VERSION"),
            pid = std::process::id(),
            "=== proxied-tools starting ==="
        );
    }
}
