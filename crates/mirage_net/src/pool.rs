use std::collections::HashMap;
use std::sync::Arc;

use dashmap::{DashMap, DashSet};
use parking_lot::RwLock;
use tokio::sync::Mutex;

use crate::session::H2Session;

/// Live HTTP/2 sessions keyed by `host:port`.
///
/// The map sits behind one coarse lock that is never held across an await.
/// Session creation is serialized per key through a dial gate so concurrent
/// first requests share one handshake.
#[derive(Default)]
pub struct H2Pool {
    sessions: RwLock<HashMap<String, H2Session>>,
    gates: DashMap<String, Arc<Mutex<()>>>,
    http1: DashSet<String>,
}

impl H2Pool {
    pub fn new() -> Self {
        Self::default()
    }

    /// A pooled session for `key` that can take another stream.
    pub fn get(&self, key: &str) -> Option<H2Session> {
        self.sessions
            .read()
            .get(key)
            .filter(|s| s.has_capacity())
            .cloned()
    }

    /// Installs `session`, dropping whatever was there before.
    pub fn insert(&self, key: &str, session: H2Session) {
        let previous = self.sessions.write().insert(key.to_string(), session);
        if previous.is_some() {
            tracing::debug!(%key, "replaced pooled HTTP/2 session");
        }
        self.http1.remove(key);
    }

    /// Removes the entry for `key` only if it is still `session`; a
    /// replacement installed meanwhile is left alone.
    pub fn evict(&self, key: &str, session: &H2Session) -> bool {
        let mut sessions = self.sessions.write();
        match sessions.get(key) {
            Some(current) if current.same_connection(session) => {
                sessions.remove(key);
                tracing::debug!(%key, "evicted failed HTTP/2 session");
                true
            }
            _ => false,
        }
    }

    /// Per-key lock taken around dial + insert.
    pub fn gate(&self, key: &str) -> Arc<Mutex<()>> {
        self.gates
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Hands back a gate taken with [`gate`](Self::gate). The map entry is
    /// dropped once nobody else holds or waits on it.
    pub fn release_gate(&self, key: &str, gate: Arc<Mutex<()>>) {
        drop(gate);
        self.gates
            .remove_if(key, |_, current| Arc::strong_count(current) == 1);
    }

    /// Number of dial gates currently tracked.
    pub fn gate_count(&self) -> usize {
        self.gates.len()
    }

    /// Remembers that `key` answered with HTTP/1.1; those dials skip the gate.
    pub fn mark_http1(&self, key: &str) {
        self.http1.insert(key.to_string());
    }

    pub fn is_http1(&self, key: &str) -> bool {
        self.http1.contains(key)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.sessions.read().contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.sessions.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
