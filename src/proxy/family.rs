//! Proxy families: the closed set of downstream service types we mirror.
//!
//! Each family knows its datasource type tag, the prefix its external tool
//! names carry, and how descriptions mention the backing datasources.

use std::fmt;

/// A supported downstream service family.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProxyFamily {
    /// Grafana Tempo datasources exposing an MCP endpoint.
    Tempo,
}

impl ProxyFamily {
    /// Every supported family, in initialization order.
    pub const ALL: &'static [ProxyFamily] = &[ProxyFamily::Tempo];

    /// Datasource type tag as reported by the listing API.
    pub fn type_tag(self) -> &'static str {
        match self {
            ProxyFamily::Tempo => "tempo",
        }
    }

    /// Prefix prepended to every external tool name of this family.
    pub fn tool_prefix(self) -> &'static str {
        match self {
            ProxyFamily::Tempo => "tempo",
        }
    }

    /// Human-readable family name used in tool descriptions and logs.
    pub fn display_name(self) -> &'static str {
        match self {
            ProxyFamily::Tempo => "Tempo",
        }
    }

    /// Prefix for this family's environment variables (`TEMPO_PROXY_ENABLED`).
    pub fn env_prefix(self) -> &'static str {
        match self {
            ProxyFamily::Tempo => "TEMPO",
        }
    }

    /// Map a downstream tool name to its external name.
    ///
    /// `trace-search` → `tempo_trace_search`.
    pub fn normalize_tool_name(self, original: &str) -> String {
        format!("{}_{}", self.tool_prefix(), original.replace('-', "_"))
    }

    /// Discriminate an external name by the datasource that provides it.
    ///
    /// `tempo_trace_search` + `Tempo Prod-1` → `tempo_trace_search_tempo_prod_1`.
    pub fn unique_tool_name(self, base: &str, service_name: &str) -> String {
        let safe = service_name
            .replace(['-', ' '], "_")
            .to_lowercase();
        format!("{base}_{safe}")
    }

    /// Build the external description listing the backing datasources.
    pub fn describe(self, description: &str, service_names: &[String]) -> String {
        if service_names.len() > 1 {
            format!(
                "{description} (via {} datasources: {})",
                self.display_name(),
                service_names.join(", ")
            )
        } else {
            format!(
                "{description} (via {} datasource: {})",
                self.display_name(),
                service_names.first().map(String::as_str).unwrap_or("unknown")
            )
        }
    }
}

impl fmt::Display for ProxyFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.type_tag())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_tool_name() {
        let cases = [
            ("trace-search", "tempo_trace_search"),
            ("trace_search", "tempo_trace_search"),
            ("trace-ql-metrics-range", "tempo_trace_ql_metrics_range"),
            ("search", "tempo_search"),
        ];
        for (input, expected) in cases {
            assert_eq!(ProxyFamily::Tempo.normalize_tool_name(input), expected);
        }
    }

    #[test]
    fn test_unique_tool_name() {
        let base = "tempo_trace_search";
        let cases = [
            ("Tempo", "tempo_trace_search_tempo"),
            ("Tempo Production", "tempo_trace_search_tempo_production"),
            ("tempo-prod-1", "tempo_trace_search_tempo_prod_1"),
            ("TeMpO-PrOd", "tempo_trace_search_tempo_prod"),
        ];
        for (service, expected) in cases {
            assert_eq!(ProxyFamily::Tempo.unique_tool_name(base, service), expected);
        }
    }

    #[test]
    fn test_describe_single_and_multiple() {
        let one = ProxyFamily::Tempo.describe("Search traces", &["Tempo A".into()]);
        assert_eq!(one, "Search traces (via Tempo datasource: Tempo A)");

        let many = ProxyFamily::Tempo
            .describe("Search traces", &["Tempo A".into(), "Tempo B".into()]);
        assert_eq!(many, "Search traces (via Tempo datasources: Tempo A, Tempo B)");
    }

    #[test]
    fn test_all_families_have_distinct_tags() {
        let mut tags: Vec<&str> = ProxyFamily::ALL.iter().map(|f| f.type_tag()).collect();
        tags.sort();
        tags.dedup();
        assert_eq!(tags.len(), ProxyFamily::ALL.len());
    }
}
