//! Per-datasource MCP session state.
//!
//! One `Session` per downstream service UID, created lazily and evicted
//! only when idle for longer than the configured maximum age. A single mutex
//! guards the whole map; the store holds dozens of entries, not millions.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use super::types::AdvertisedTool;

/// Session state for one downstream service.
#[derive(Debug, Clone)]
pub struct Session {
    /// Opaque session token; empty until the first successful `initialize`.
    pub token: String,
    /// Tools advertised by the service. Only trusted when `initialized`.
    pub tools: Vec<AdvertisedTool>,
    pub initialized: bool,
    pub last_used: Instant,
}

impl Session {
    fn new(now: Instant) -> Self {
        Self {
            token: String::new(),
            tools: Vec::new(),
            initialized: false,
            last_used: now,
        }
    }
}

/// In-memory map from service UID to session state.
#[derive(Debug, Default)]
pub struct SessionStore {
    sessions: Mutex<HashMap<String, Session>>,
}

impl SessionStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the session for `uid`, creating it if needed.
    ///
    /// Refreshes the last-used timestamp. The returned value is a snapshot.
    pub fn get_or_create(&self, uid: &str) -> Session {
        let now = Instant::now();
        let mut sessions = self.sessions.lock();
        let session = sessions
            .entry(uid.to_string())
            .or_insert_with(|| Session::new(now));
        session.last_used = now;
        session.clone()
    }

    /// Current session token for `uid`, if one is known.
    pub fn token(&self, uid: &str) -> Option<String> {
        self.sessions
            .lock()
            .get(uid)
            .map(|s| s.token.clone())
            .filter(|t| !t.is_empty())
    }

    /// Store a session token obtained from `initialize`.
    pub fn set_token(&self, uid: &str, token: &str) {
        let now = Instant::now();
        let mut sessions = self.sessions.lock();
        let session = sessions
            .entry(uid.to_string())
            .or_insert_with(|| Session::new(now));
        session.token = token.to_string();
    }

    /// Forget the token and mark the session uninitialized.
    pub fn invalidate(&self, uid: &str) {
        if let Some(session) = self.sessions.lock().get_mut(uid) {
            session.token.clear();
            session.initialized = false;
        }
    }

    /// Replace the advertised tool list and mark the session initialized.
    pub fn set_tools(&self, uid: &str, tools: Vec<AdvertisedTool>) {
        let now = Instant::now();
        let mut sessions = self.sessions.lock();
        let session = sessions
            .entry(uid.to_string())
            .or_insert_with(|| Session::new(now));
        session.tools = tools;
        session.initialized = true;
    }

    /// Remove sessions idle for longer than `max_age`. Returns how many were removed.
    pub fn evict_older_than(&self, max_age: Duration) -> usize {
        self.evict_idle_at(Instant::now(), max_age)
    }

    fn evict_idle_at(&self, now: Instant, max_age: Duration) -> usize {
        let mut sessions = self.sessions.lock();
        let before = sessions.len();
        sessions.retain(|_, s| now.saturating_duration_since(s.last_used) <= max_age);
        let evicted = before - sessions.len();
        if evicted > 0 {
            tracing::debug!(evicted, remaining = sessions.len(), "evicted idle proxy sessions");
        }
        evicted
    }

    /// Number of tracked sessions.
    pub fn len(&self) -> usize {
        self.sessions.lock().len()
    }

    /// Whether no sessions are tracked.
    pub fn is_empty(&self) -> bool {
        self.sessions.lock().is_empty()
    }
}
