//! Proxy configuration loading.
//!
//! Configuration comes from the environment (`GRAFANA_URL`,
//! `TEMPO_PROXY_ENABLED`, `TEMPO_POLLING_INTERVAL`, ...) or from a YAML file
//! whose string values may reference `${VAR}` / `${VAR:-default}`.
//! Durations use the compact `30s` / `5m` / `1h30m` notation.

use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

use super::errors::ProxyError;
use super::family::ProxyFamily;

// ─── Defaults ────────────────────────────────────────────────────────────────

/// Default interval between discovery passes.
pub const DEFAULT_POLLING_INTERVAL: Duration = Duration::from_secs(5 * 60);

/// Services checked within this window are not re-discovered.
///
/// Shorter than the polling interval so a service is never skipped on two
/// consecutive polls.
pub const DEFAULT_FRESHNESS_WINDOW: Duration = Duration::from_secs(4 * 60);

/// Sessions idle for longer than this are evicted.
pub const DEFAULT_SESSION_MAX_AGE: Duration = Duration::from_secs(60 * 60);

/// Per-request timeout for downstream RPC calls and the listing API.
pub const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(30);

// ─── Public Types ────────────────────────────────────────────────────────────

/// Top-level proxy configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ProxyConfig {
    /// Base URL of the monitoring platform. Discovery is skipped when unset.
    #[serde(default)]
    pub platform_url: Option<String>,
    /// Bearer token for the platform API.
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default = "default_call_timeout", deserialize_with = "de_duration")]
    pub call_timeout: Duration,
    #[serde(default = "default_session_max_age", deserialize_with = "de_duration")]
    pub session_max_age: Duration,
    #[serde(default = "default_freshness_window", deserialize_with = "de_duration")]
    pub freshness_window: Duration,
    #[serde(default)]
    pub init_retry: RetryPolicy,
    /// Per-family settings keyed by type tag (`tempo`).
    #[serde(default)]
    pub families: HashMap<String, FamilyConfig>,
}

/// Settings for one proxy family.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct FamilyConfig {
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default = "default_polling_interval", deserialize_with = "de_duration")]
    pub polling_interval: Duration,
}

impl Default for FamilyConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            polling_interval: DEFAULT_POLLING_INTERVAL,
        }
    }
}

/// Retry policy for the initialize sequence after a session expiry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct RetryPolicy {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_base_delay", deserialize_with = "de_duration")]
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay: default_base_delay(),
        }
    }
}

impl RetryPolicy {
    /// Delay before the given attempt (0-based). The first attempt is immediate,
    /// then the delay doubles: 1s, 2s, 4s, ...
    pub fn delay_before(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }
        self.base_delay
            .saturating_mul(2u32.saturating_pow(attempt - 1))
    }
}

fn default_enabled() -> bool {
    true
}
fn default_polling_interval() -> Duration {
    DEFAULT_POLLING_INTERVAL
}
fn default_call_timeout() -> Duration {
    DEFAULT_CALL_TIMEOUT
}
fn default_session_max_age() -> Duration {
    DEFAULT_SESSION_MAX_AGE
}
fn default_freshness_window() -> Duration {
    DEFAULT_FRESHNESS_WINDOW
}
fn default_max_attempts() -> u32 {
    3
}
fn default_base_delay() -> Duration {
    Duration::from_secs(1)
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            platform_url: None,
            api_key: None,
            call_timeout: DEFAULT_CALL_TIMEOUT,
            session_max_age: DEFAULT_SESSION_MAX_AGE,
            freshness_window: DEFAULT_FRESHNESS_WINDOW,
            init_retry: RetryPolicy::default(),
            families: HashMap::new(),
        }
    }
}

impl ProxyConfig {
    /// Build the configuration from process environment variables.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build the configuration from an arbitrary variable lookup.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = ProxyConfig {
            platform_url: lookup("GRAFANA_URL").filter(|v| !v.is_empty()),
            api_key: lookup("GRAFANA_API_KEY").filter(|v| !v.is_empty()),
            ..ProxyConfig::default()
        };

        for family in ProxyFamily::ALL {
            let prefix = family.env_prefix();
            let enabled = lookup(&format!("{prefix}_PROXY_ENABLED"))
                .map(|v| v != "false")
                .unwrap_or(true);
            let polling_interval =
                polling_interval_or_default(lookup(&format!("{prefix}_POLLING_INTERVAL")));
            config.families.insert(
                family.type_tag().to_string(),
                FamilyConfig {
                    enabled,
                    polling_interval,
                },
            );
        }

        config
    }

    /// Load a YAML configuration file, interpolating environment variables.
    pub fn load(path: &Path) -> Result<Self, ProxyError> {
        let raw = std::fs::read_to_string(path).map_err(|e| ProxyError::Config {
            reason: format!("failed to read {}: {e}", path.display()),
        })?;
        Self::parse_yaml(&raw, |key| std::env::var(key).ok())
    }

    /// Parse YAML text after `${VAR}` interpolation through `lookup`.
    pub fn parse_yaml(
        raw: &str,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<Self, ProxyError> {
        let interpolated = interpolate_vars(raw, &lookup);
        let mut config: ProxyConfig =
            serde_yaml::from_str(&interpolated).map_err(|e| ProxyError::Config {
                reason: format!("failed to parse config: {e}"),
            })?;
        if config.platform_url.as_deref() == Some("") {
            config.platform_url = None;
        }
        Ok(config)
    }

    /// Settings for a family, falling back to defaults when not configured.
    pub fn family(&self, family: ProxyFamily) -> FamilyConfig {
        let mut settings = self
            .families
            .get(family.type_tag())
            .copied()
            .unwrap_or_default();
        if settings.polling_interval.is_zero() {
            settings.polling_interval = DEFAULT_POLLING_INTERVAL;
        }
        settings
    }
}

fn polling_interval_or_default(raw: Option<String>) -> Duration {
    let Some(raw) = raw.filter(|v| !v.trim().is_empty()) else {
        return DEFAULT_POLLING_INTERVAL;
    };
    match parse_duration(&raw) {
        Ok(d) if !d.is_zero() => d,
        Ok(_) => DEFAULT_POLLING_INTERVAL,
        Err(e) => {
            tracing::warn!(value = %raw, error = %e, "invalid polling interval, using default");
            DEFAULT_POLLING_INTERVAL
        }
    }
}

// ─── Durations ───────────────────────────────────────────────────────────────

/// Parse a compact duration such as `250ms`, `30s`, `5m`, `1h30m` or `1.5h`.
pub fn parse_duration(input: &str) -> Result<Duration, ProxyError> {
    let invalid = || ProxyError::Config {
        reason: format!("invalid duration '{input}'"),
    };

    let s = input.trim();
    if s.is_empty() {
        return Err(invalid());
    }
    if s == "0" {
        return Ok(Duration::ZERO);
    }

    let mut total = Duration::ZERO;
    let mut rest = s;
    while !rest.is_empty() {
        let num_len = rest
            .find(|c: char| !(c.is_ascii_digit() || c == '.'))
            .unwrap_or(rest.len());
        if num_len == 0 {
            return Err(invalid());
        }
        let value: f64 = rest[..num_len].parse().map_err(|_| invalid())?;
        rest = &rest[num_len..];

        let unit_len = rest
            .find(|c: char| c.is_ascii_digit() || c == '.')
            .unwrap_or(rest.len());
        let scale = match &rest[..unit_len] {
            "ns" => 1e-9,
            "us" | "µs" => 1e-6,
            "ms" => 1e-3,
            "s" => 1.0,
            "m" => 60.0,
            "h" => 3600.0,
            _ => return Err(invalid()),
        };
        rest = &rest[unit_len..];

        total += Duration::try_from_secs_f64(value * scale).map_err(|_| invalid())?;
    }

    Ok(total)
}

fn de_duration<'de, D>(deserializer: D) -> Result<Duration, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let raw = String::deserialize(deserializer)?;
    parse_duration(&raw).map_err(serde::de::Error::custom)
}

// ─── Env-var interpolation ───────────────────────────────────────────────────

/// Replace `${VAR}` and `${VAR:-default}` in a string.
fn interpolate_vars(input: &str, lookup: &impl Fn(&str) -> Option<String>) -> String {
    let mut result = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(ch) = chars.next() {
        if ch == '$' && chars.peek() == Some(&'{') {
            chars.next();
            let mut var_expr = String::new();
            for c in chars.by_ref() {
                if c == '}' {
                    break;
                }
                var_expr.push(c);
            }
            result.push_str(&resolve_var_expr(&var_expr, lookup));
        } else {
            result.push(ch);
        }
    }

    result
}

/// Resolve a variable expression like `VAR` or `VAR:-default`.
fn resolve_var_expr(expr: &str, lookup: &impl Fn(&str) -> Option<String>) -> String {
    match expr.split_once(":-") {
        Some((name, default)) => lookup(name).unwrap_or_else(|| default.to_string()),
        None => lookup(expr).unwrap_or_default(),
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
