//! Tool registry: mirrors downstream tool catalogs into the host framework.
//!
//! Provides:
//! - Grouping of discovered tools by content hash, with collision-safe naming
//! - Reconciliation of one discovery pass against the registered set
//! - Backer validation and re-verification marks for the invocation path
//! - The skip policy used by the discovery engine
//!
//! All state lives behind one mutex. The registered tools, the
//! service → tools map and the tool → services map are always updated
//! together inside one critical section. Host registration calls are
//! synchronous and happen under the same lock.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;

use super::errors::ProxyError;
use super::family::ProxyFamily;
use super::types::AdvertisedTool;
use crate::host::{ToolHandler, ToolHost, ToolRegistration};

// ─── Discovery Input ─────────────────────────────────────────────────────────

/// One tool advertised by one service during a discovery pass.
#[derive(Debug, Clone)]
pub struct ToolDiscovery {
    pub tool: AdvertisedTool,
    pub service_uid: String,
    pub service_name: String,
}

/// Group discoveries by content hash. Entries inside a group are ordered by
/// service UID so the outcome does not depend on fan-out completion order.
pub fn group_by_hash(discoveries: Vec<ToolDiscovery>) -> BTreeMap<String, Vec<ToolDiscovery>> {
    let mut groups: BTreeMap<String, Vec<ToolDiscovery>> = BTreeMap::new();
    for discovery in discoveries {
        groups
            .entry(discovery.tool.content_hash())
            .or_default()
            .push(discovery);
    }
    for entries in groups.values_mut() {
        sort_entries(entries);
    }
    groups
}

fn sort_entries(entries: &mut [ToolDiscovery]) {
    entries.sort_by(|a, b| {
        a.service_uid
            .cmp(&b.service_uid)
            .then_with(|| a.tool.name.cmp(&b.tool.name))
    });
}

/// Counts reported by one reconciliation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReconcileSummary {
    pub registered: usize,
    pub updated: usize,
    pub unchanged: usize,
    pub unregistered: usize,
}

/// Read-only view of one registered tool.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolSnapshot {
    pub name: String,
    pub original_name: String,
    pub description: String,
    pub schema_hash: String,
    /// Backing service UIDs, sorted.
    pub backers: Vec<String>,
}

// ─── Internal State ──────────────────────────────────────────────────────────

struct RegisteredTool {
    original_name: String,
    base_description: String,
    downstream_schema: serde_json::Value,
    schema_hash: String,
    /// `service_uid → service_name`.
    backers: BTreeMap<String, String>,
    /// `None` means "must be re-verified on the next pass".
    last_checked: HashMap<String, Option<DateTime<Utc>>>,
    description: String,
    handler: ToolHandler,
}

impl RegisteredTool {
    fn registration(&self, name: &str, family: ProxyFamily) -> ToolRegistration {
        ToolRegistration {
            name: name.to_string(),
            description: self.description.clone(),
            input_schema: proxy_input_schema(family, &self.downstream_schema),
            handler: self.handler.clone(),
        }
    }

    fn render_description(&self, family: ProxyFamily) -> String {
        let names: Vec<String> = self.backers.values().cloned().collect();
        family.describe(&self.base_description, &names)
    }
}

#[derive(Default)]
struct RegistryState {
    tools: HashMap<String, RegisteredTool>,
    service_tools: HashMap<String, BTreeSet<String>>,
    tool_services: HashMap<String, BTreeSet<String>>,
}

impl RegistryState {
    /// Point `tool` at exactly `uids` in both mapping directions.
    fn set_mappings(&mut self, tool: &str, uids: BTreeSet<String>) {
        if let Some(old) = self.tool_services.remove(tool) {
            for uid in old {
                self.drop_service_tool(&uid, tool);
            }
        }
        for uid in &uids {
            self.service_tools
                .entry(uid.clone())
                .or_default()
                .insert(tool.to_string());
        }
        self.tool_services.insert(tool.to_string(), uids);
    }

    /// Add the last known tools of `carried` services to `groups`.
    ///
    /// Names are then planned as if those services had answered with the
    /// catalog they reported last, so a service that failed or was skipped
    /// does not rename the tools of the others.
    fn add_carried_entries(
        &self,
        groups: &mut BTreeMap<String, Vec<ToolDiscovery>>,
        carried: &HashSet<&String>,
    ) {
        let mut touched = BTreeSet::new();
        for tool in self.tools.values() {
            for (uid, service_name) in &tool.backers {
                if !carried.contains(uid) {
                    continue;
                }
                groups
                    .entry(tool.schema_hash.clone())
                    .or_default()
                    .push(ToolDiscovery {
                        tool: AdvertisedTool {
                            name: tool.original_name.clone(),
                            description: tool.base_description.clone(),
                            input_schema: tool.downstream_schema.clone(),
                        },
                        service_uid: uid.clone(),
                        service_name: service_name.clone(),
                    });
                touched.insert(tool.schema_hash.clone());
            }
        }
        for hash in touched {
            if let Some(entries) = groups.get_mut(&hash) {
                sort_entries(entries);
            }
        }
    }

    fn drop_service_tool(&mut self, uid: &str, tool: &str) {
        if let Some(tools) = self.service_tools.get_mut(uid) {
            tools.remove(tool);
            if tools.is_empty() {
                self.service_tools.remove(uid);
            }
        }
    }

    fn unregister(&mut self, host: &dyn ToolHost, name: &str) -> bool {
        if self.tools.remove(name).is_none() {
            return false;
        }
        host.unregister_tool(name);
        if let Some(uids) = self.tool_services.remove(name) {
            for uid in uids {
                self.drop_service_tool(&uid, name);
            }
        }
        tracing::info!(tool_name = name, "unregistered proxied tool");
        true
    }

    /// Replace a tool's backers, keeping verification marks only for backers
    /// that remain. Re-registers with the host when the exposed shape changed.
    fn retarget(
        &mut self,
        host: &dyn ToolHost,
        family: ProxyFamily,
        name: &str,
        backers: BTreeMap<String, String>,
    ) -> bool {
        let Some(tool) = self.tools.get_mut(name) else {
            return false;
        };
        tool.last_checked.retain(|uid, _| backers.contains_key(uid));
        tool.backers = backers;
        let description = tool.render_description(family);
        let changed = description != tool.description;
        if changed {
            tool.description = description;
            host.register_tool(tool.registration(name, family));
        }
        let uids = tool.backers.keys().cloned().collect();
        self.set_mappings(name, uids);
        changed
    }
}

/// Planned external tool produced from the hash grouping.
struct PlannedTool {
    hash: String,
    entries: Vec<ToolDiscovery>,
}

// ─── ToolRegistry ────────────────────────────────────────────────────────────

/// Registered proxied tools of one family.
pub struct ToolRegistry {
    family: ProxyFamily,
    host: Arc<dyn ToolHost>,
    freshness_window: Duration,
    state: Mutex<RegistryState>,
}

impl ToolRegistry {
    /// Create an empty registry that registers into `host`.
    pub fn new(family: ProxyFamily, host: Arc<dyn ToolHost>, freshness_window: Duration) -> Self {
        Self {
            family,
            host,
            freshness_window,
            state: Mutex::new(RegistryState::default()),
        }
    }

    /// Apply one discovery pass.
    ///
    /// `successful` holds the services that answered this pass, with their
    /// check time. `seen` is the full discovery set; services in it that did
    /// not answer (skipped or failed) keep their last reported tools and
    /// count toward collision naming as before. Any tool left without a
    /// backer is unregistered.
    pub fn reconcile(
        &self,
        mut groups: BTreeMap<String, Vec<ToolDiscovery>>,
        successful: &HashMap<String, DateTime<Utc>>,
        seen: &HashSet<String>,
        make_handler: &dyn Fn(&str) -> ToolHandler,
    ) -> ReconcileSummary {
        let carried: HashSet<&String> = seen
            .iter()
            .filter(|uid| !successful.contains_key(*uid))
            .collect();
        let host = self.host.as_ref();
        let family = self.family;

        let mut summary = ReconcileSummary::default();
        let mut state = self.state.lock();
        state.add_carried_entries(&mut groups, &carried);
        let planned = self.plan(groups);

        for (name, plan) in &planned {
            let Some(first) = plan.entries.first() else {
                continue;
            };
            let backers: BTreeMap<String, String> = plan
                .entries
                .iter()
                .map(|d| (d.service_uid.clone(), d.service_name.clone()))
                .collect();

            match state.tools.get_mut(name) {
                Some(existing) => {
                    existing
                        .last_checked
                        .retain(|uid, _| backers.contains_key(uid));
                    for uid in backers.keys() {
                        if let Some(at) = successful.get(uid) {
                            existing.last_checked.insert(uid.clone(), Some(*at));
                        }
                    }

                    existing.schema_hash = plan.hash.clone();
                    existing.original_name = first.tool.name.clone();
                    existing.base_description = first.tool.description.clone();
                    existing.backers = backers;

                    let description = existing.render_description(family);
                    let shape_changed = description != existing.description
                        || existing.downstream_schema != first.tool.input_schema;
                    if shape_changed {
                        existing.description = description;
                        existing.downstream_schema = first.tool.input_schema.clone();
                        host.register_tool(existing.registration(name, family));
                        tracing::info!(tool_name = %name, "updated proxied tool");
                        summary.updated += 1;
                    } else {
                        summary.unchanged += 1;
                    }

                    let uids = existing.backers.keys().cloned().collect();
                    state.set_mappings(name, uids);
                }
                None => {
                    let last_checked = backers
                        .keys()
                        .map(|uid| (uid.clone(), successful.get(uid).copied()))
                        .collect();
                    let mut tool = RegisteredTool {
                        original_name: first.tool.name.clone(),
                        base_description: first.tool.description.clone(),
                        downstream_schema: first.tool.input_schema.clone(),
                        schema_hash: plan.hash.clone(),
                        backers,
                        last_checked,
                        description: String::new(),
                        handler: make_handler(name),
                    };
                    tool.description = tool.render_description(family);
                    host.register_tool(tool.registration(name, family));

                    let uids = tool.backers.keys().cloned().collect();
                    tracing::info!(
                        tool_name = %name,
                        original_name = %tool.original_name,
                        backers = tool.backers.len(),
                        "registered proxied tool"
                    );
                    state.tools.insert(name.clone(), tool);
                    state.set_mappings(name, uids);
                    summary.registered += 1;
                }
            }
        }

        let placed: HashSet<(&str, &str)> = planned
            .values()
            .flat_map(|p| {
                p.entries
                    .iter()
                    .map(move |d| (d.service_uid.as_str(), p.hash.as_str()))
            })
            .collect();
        let untouched: Vec<String> = state
            .tools
            .keys()
            .filter(|name| !planned.contains_key(*name))
            .cloned()
            .collect();
        for name in untouched {
            let tool = &state.tools[&name];
            let retained: BTreeMap<String, String> = tool
                .backers
                .iter()
                .filter(|(uid, _)| {
                    carried.contains(uid)
                        && !placed.contains(&(uid.as_str(), tool.schema_hash.as_str()))
                })
                .map(|(uid, n)| (uid.clone(), n.clone()))
                .collect();

            if retained.is_empty() {
                if state.unregister(host, &name) {
                    summary.unregistered += 1;
                }
            } else if state.retarget(host, family, &name, retained) {
                summary.updated += 1;
            } else {
                summary.unchanged += 1;
            }
        }

        summary
    }

    /// Turn hash groups into external names.
    ///
    /// A group whose entries share one original name becomes one tool backed
    /// by every entry. Entries are discriminated by service name when their
    /// group mixes names, or when several groups claim the same base name.
    fn plan(&self, groups: BTreeMap<String, Vec<ToolDiscovery>>) -> BTreeMap<String, PlannedTool> {
        let mut claims: HashMap<String, usize> = HashMap::new();
        for entries in groups.values() {
            if let Some(base) = shared_name(entries) {
                *claims.entry(self.family.normalize_tool_name(base)).or_default() += 1;
            }
        }

        let mut planned: BTreeMap<String, PlannedTool> = BTreeMap::new();
        for (hash, entries) in groups {
            let shared = shared_name(&entries).map(|n| self.family.normalize_tool_name(n));
            match shared {
                Some(base) if claims.get(&base).copied().unwrap_or(0) <= 1 => {
                    planned.insert(base, PlannedTool { hash, entries });
                }
                _ => {
                    for entry in entries {
                        let base = self.family.normalize_tool_name(&entry.tool.name);
                        let name = self.family.unique_tool_name(&base, &entry.service_name);
                        if planned.contains_key(&name) {
                            tracing::warn!(
                                tool_name = %name,
                                service_uid = %entry.service_uid,
                                "discriminated tool name already taken, skipping"
                            );
                            continue;
                        }
                        planned.insert(
                            name,
                            PlannedTool {
                                hash: hash.clone(),
                                entries: vec![entry],
                            },
                        );
                    }
                }
            }
        }
        planned
    }

    /// Drop services that are no longer in the full discovery set.
    ///
    /// Tools backed by other services too are trimmed; tools left without
    /// backers are unregistered. Returns the number of services removed.
    pub fn cleanup_removed_services(&self, seen: &HashSet<String>) -> usize {
        let host = self.host.as_ref();
        let mut state = self.state.lock();
        let removed: Vec<String> = state
            .service_tools
            .keys()
            .filter(|uid| !seen.contains(*uid))
            .cloned()
            .collect();

        for uid in &removed {
            let tools: Vec<String> = state
                .service_tools
                .get(uid)
                .map(|t| t.iter().cloned().collect())
                .unwrap_or_default();
            for name in tools {
                let remaining: BTreeMap<String, String> = match state.tools.get(&name) {
                    Some(tool) => tool
                        .backers
                        .iter()
                        .filter(|(backer, _)| *backer != uid)
                        .map(|(b, n)| (b.clone(), n.clone()))
                        .collect(),
                    None => continue,
                };
                if remaining.is_empty() {
                    state.unregister(host, &name);
                } else {
                    state.retarget(host, self.family, &name, remaining);
                }
            }
            state.service_tools.remove(uid);
            tracing::info!(service_uid = %uid, "removed vanished service from proxied tools");
        }
        removed.len()
    }

    /// Unregister every tool. Returns how many were removed.
    pub fn unregister_all(&self) -> usize {
        let host = self.host.as_ref();
        let mut state = self.state.lock();
        let names: Vec<String> = state.tools.keys().cloned().collect();
        let mut removed = 0;
        for name in names {
            if state.unregister(host, &name) {
                removed += 1;
            }
        }
        removed
    }

    /// Whether `uid` must be queried again in this pass.
    pub fn should_rediscover(&self, uid: &str) -> bool {
        self.should_rediscover_at(uid, Utc::now())
    }

    /// Skip policy evaluated at `now`.
    ///
    /// A service is skipped only if it backs at least one tool and every such
    /// tool recorded a successful check for it inside the freshness window.
    pub fn should_rediscover_at(&self, uid: &str, now: DateTime<Utc>) -> bool {
        let state = self.state.lock();
        let Some(tools) = state.service_tools.get(uid) else {
            return true;
        };
        if tools.is_empty() {
            return true;
        }

        let window = self.freshness_window;
        let all_fresh = tools.iter().all(|name| {
            let checked = state
                .tools
                .get(name)
                .and_then(|t| t.last_checked.get(uid).copied().flatten());
            match checked {
                Some(at) => now
                    .signed_duration_since(at)
                    .to_std()
                    .map_or(true, |age| age < window),
                None => false,
            }
        });
        !all_fresh
    }

    /// Force re-verification of `uid` for `tool` on the next pass.
    pub fn mark_unverified(&self, tool: &str, uid: &str) {
        let mut state = self.state.lock();
        if let Some(registered) = state.tools.get_mut(tool) {
            if registered.backers.contains_key(uid) {
                registered.last_checked.insert(uid.to_string(), None);
            }
        }
    }

    /// Check that `uid` currently backs `tool`, returning the downstream name.
    pub fn check_backer(&self, tool: &str, uid: &str) -> Result<String, ProxyError> {
        let state = self.state.lock();
        let registered = state.tools.get(tool).ok_or_else(|| ProxyError::UnknownTool {
            name: tool.to_string(),
        })?;
        if !registered.backers.contains_key(uid) {
            return Err(ProxyError::NotABacker {
                tool: tool.to_string(),
                service_uid: uid.to_string(),
            });
        }
        Ok(registered.original_name.clone())
    }

    /// Downstream name of a registered tool.
    pub fn original_name(&self, tool: &str) -> Option<String> {
        self.state
            .lock()
            .tools
            .get(tool)
            .map(|t| t.original_name.clone())
    }

    /// Tools backed by `uid`, sorted.
    pub fn tools_for_service(&self, uid: &str) -> Vec<String> {
        self.state
            .lock()
            .service_tools
            .get(uid)
            .map(|t| t.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Sorted view of every registered tool.
    pub fn snapshot(&self) -> Vec<ToolSnapshot> {
        let state = self.state.lock();
        let mut tools: Vec<ToolSnapshot> = state
            .tools
            .iter()
            .map(|(name, t)| ToolSnapshot {
                name: name.clone(),
                original_name: t.original_name.clone(),
                description: t.description.clone(),
                schema_hash: t.schema_hash.clone(),
                backers: t.backers.keys().cloned().collect(),
            })
            .collect();
        tools.sort_by(|a, b| a.name.cmp(&b.name));
        tools
    }

    /// Number of registered tools.
    pub fn len(&self) -> usize {
        self.state.lock().tools.len()
    }

    /// Whether no tools are registered.
    pub fn is_empty(&self) -> bool {
        self.state.lock().tools.is_empty()
    }
}

/// The original name every entry shares, if any.
fn shared_name(entries: &[ToolDiscovery]) -> Option<&str> {
    let first = entries.first()?;
    entries
        .iter()
        .all(|d| d.tool.name == first.tool.name)
        .then_some(first.tool.name.as_str())
}

/// Exposed input schema: the service selector plus the downstream arguments.
pub fn proxy_input_schema(family: ProxyFamily, downstream: &serde_json::Value) -> serde_json::Value {
    let arguments = if downstream.is_object() {
        downstream.clone()
    } else {
        serde_json::json!({"type": "object"})
    };
    serde_json::json!({
        "type": "object",
        "properties": {
            "datasource_uid": {
                "type": "string",
                "description": format!("UID of the {} datasource to query", family.display_name()),
            },
            "arguments": arguments,
        },
        "required": ["datasource_uid"],
    })
}

// ─── Tests ───────────────────────────────────────────────────────────────────
