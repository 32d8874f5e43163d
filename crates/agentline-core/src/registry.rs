//! In-flight query tracking
//!
//! Maps query ids to their cancellation tokens so an out-of-band cancel
//! request or a disconnect watcher can stop a running query. Every operation
//! runs under one mutex and never blocks on I/O.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use tokio_util::sync::CancellationToken;

pub type QueryId = String;

/// Snapshot of one registered query
#[derive(Debug, Clone)]
pub struct QueryEntry {
    pub query_id: QueryId,
    pub session_id: Option<String>,
    /// User id of the principal that submitted the query
    pub principal: String,
    pub cancel: CancellationToken,
    pub created_at: DateTime<Utc>,
    generation: u64,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct RegistryStats {
    pub active_queries: usize,
    pub query_ids: Vec<QueryId>,
}

/// Registry of running queries, shared by handle
#[derive(Clone)]
pub struct QueryRegistry {
    queries: Arc<Mutex<HashMap<QueryId, QueryEntry>>>,
    next_generation: Arc<AtomicU64>,
}

impl Default for QueryRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl QueryRegistry {
    pub fn new() -> Self {
        Self {
            queries: Arc::new(Mutex::new(HashMap::new())),
            next_generation: Arc::new(AtomicU64::new(1)),
        }
    }

    /// Store an entry. A duplicate id replaces the previous entry.
    pub fn register(
        &self,
        query_id: &str,
        session_id: Option<String>,
        principal: &str,
        cancel: CancellationToken,
    ) -> Registration {
        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
        let entry = QueryEntry {
            query_id: query_id.to_string(),
            session_id,
            principal: principal.to_string(),
            cancel,
            created_at: Utc::now(),
            generation,
        };

        let replaced = self.queries.lock().insert(query_id.to_string(), entry);
        if replaced.is_some() {
            tracing::warn!("Query {} registered twice, replacing previous entry", query_id);
        }
        tracing::debug!("Registered query {}", query_id);

        Registration {
            registry: self.clone(),
            query_id: query_id.to_string(),
            generation,
        }
    }

    pub fn get(&self, query_id: &str) -> Option<QueryEntry> {
        self.queries.lock().get(query_id).cloned()
    }

    pub fn contains(&self, query_id: &str) -> bool {
        self.queries.lock().contains_key(query_id)
    }

    /// Set the query's cancellation token. Returns false when the id is unknown.
    pub fn request_cancel(&self, query_id: &str) -> bool {
        let token = self
            .queries
            .lock()
            .get(query_id)
            .map(|entry| entry.cancel.clone());

        match token {
            Some(token) => {
                token.cancel();
                tracing::info!("Cancellation requested for query {}", query_id);
                true
            }
            None => {
                tracing::debug!("Cancel requested for unknown query {}", query_id);
                false
            }
        }
    }

    /// Remove an entry. Unknown ids are ignored.
    pub fn unregister(&self, query_id: &str) {
        if self.queries.lock().remove(query_id).is_some() {
            tracing::debug!("Unregistered query {}", query_id);
        }
    }

    /// Session bound to a query, if any
    pub fn session_id(&self, query_id: &str) -> Option<String> {
        self.queries
            .lock()
            .get(query_id)
            .and_then(|entry| entry.session_id.clone())
    }

    /// Record the session a query ended up bound to
    pub fn set_session(&self, query_id: &str, session_id: Option<String>) {
        if let Some(entry) = self.queries.lock().get_mut(query_id) {
            entry.session_id = session_id;
        }
    }

    /// Number of in-flight queries submitted by one principal
    pub fn active_for(&self, principal: &str) -> usize {
        self.queries
            .lock()
            .values()
            .filter(|entry| entry.principal == principal)
            .count()
    }

    pub fn stats(&self) -> RegistryStats {
        let queries = self.queries.lock();
        let mut query_ids: Vec<QueryId> = queries.keys().cloned().collect();
        query_ids.sort();
        RegistryStats {
            active_queries: queries.len(),
            query_ids,
        }
    }

    fn release(&self, query_id: &str, generation: u64) {
        let mut queries = self.queries.lock();
        if queries
            .get(query_id)
            .is_some_and(|entry| entry.generation == generation)
        {
            queries.remove(query_id);
            tracing::debug!("Released query {}", query_id);
        }
    }
}

/// Removes its registry entry when dropped.
///
/// Only the entry created by the matching `register` call is removed, so a
/// later registration under the same id survives an older guard.
#[must_use = "dropping the registration unregisters the query immediately"]
pub struct Registration {
    registry: QueryRegistry,
    query_id: QueryId,
    generation: u64,
}

impl Drop for Registration {
    fn drop(&mut self) {
        self.registry.release(&self.query_id, self.generation);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn register_and_get() {
        let registry = QueryRegistry::new();
        let _reg = registry.register(
            "q1",
            Some("s1".to_string()),
            "user-1",
            CancellationToken::new(),
        );

        let entry = registry.get("q1").expect("entry should exist");
        assert_eq!(entry.session_id.as_deref(), Some("s1"));
        assert_eq!(entry.principal, "user-1");
        assert_eq!(registry.session_id("q1").as_deref(), Some("s1"));
        assert!(registry.get("missing").is_none());
    }

    #[test]
    fn request_cancel_sets_token() {
        let registry = QueryRegistry::new();
        let token = CancellationToken::new();
        let _reg = registry.register("q1", None, "user-1", token.clone());

        assert!(registry.request_cancel("q1"));
        assert!(token.is_cancelled());
        assert!(!registry.request_cancel("nope"));
    }

    #[test]
    fn unregister_is_idempotent() {
        let registry = QueryRegistry::new();
        let reg = registry.register("q1", None, "user-1", CancellationToken::new());
        registry.unregister("q1");
        registry.unregister("q1");
        assert!(!registry.contains("q1"));
        drop(reg);
        assert_eq!(registry.stats().active_queries, 0);
    }

    #[test]
    fn dropping_registration_removes_entry() {
        let registry = QueryRegistry::new();
        {
            let _reg = registry.register("q1", None, "user-1", CancellationToken::new());
            assert!(registry.contains("q1"));
        }
        assert!(!registry.contains("q1"));
    }

    #[test]
    fn duplicate_register_is_last_write_wins() {
        let registry = QueryRegistry::new();
        let first = registry.register("q1", Some("old".into()), "user-1", CancellationToken::new());
        let _second = registry.register("q1", Some("new".into()), "user-1", CancellationToken::new());

        assert_eq!(registry.session_id("q1").as_deref(), Some("new"));
        drop(first);
        assert!(
            registry.contains("q1"),
            "stale guard must not remove the newer entry"
        );
    }

    #[test]
    fn counts_active_queries_per_principal() {
        let registry = QueryRegistry::new();
        let _a = registry.register("q1", None, "alice", CancellationToken::new());
        let _b = registry.register("q2", None, "alice", CancellationToken::new());
        let _c = registry.register("q3", None, "bob", CancellationToken::new());

        assert_eq!(registry.active_for("alice"), 2);
        assert_eq!(registry.active_for("bob"), 1);
        assert_eq!(registry.active_for("carol"), 0);

        let stats = registry.stats();
        assert_eq!(stats.active_queries, 3);
        assert_eq!(stats.query_ids, vec!["q1", "q2", "q3"]);
    }

    #[test]
    fn cancel_from_another_thread_is_visible() {
        let registry = QueryRegistry::new();
        let token = CancellationToken::new();
        let _reg = registry.register("q1", None, "user-1", token.clone());

        let remote = registry.clone();
        std::thread::spawn(move || remote.request_cancel("q1"))
            .join()
            .expect("cancel thread panicked");
        assert!(token.is_cancelled());
    }

    #[test]
    fn session_can_be_bound_after_registration() {
        let registry = QueryRegistry::new();
        let _reg = registry.register("q1", None, "user-1", CancellationToken::new());
        assert_eq!(registry.session_id("q1"), None);

        registry.set_session("q1", Some("s-9".into()));
        assert_eq!(registry.session_id("q1").as_deref(), Some("s-9"));

        registry.set_session("missing", Some("s-1".into()));
        assert!(!registry.contains("missing"));
    }
}
