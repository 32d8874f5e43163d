//! Collaborators the query orchestrator depends on
//!
//! Accounts, chat persistence, audit and metrics live behind these traits so
//! the orchestrator can be driven against in-memory fakes. Default
//! implementations back each one with local state.

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::types::{Account, Principal, ResourceKind, ResourceSelection};

mod audit;
mod chat_store;
mod directory;
mod metrics;

pub use audit::TracingAuditSink;
pub use chat_store::SqliteChatStore;
pub use directory::StaticDirectory;
pub use metrics::{InMemoryMetrics, MetricsSnapshot};

/// Outcome of looking up a principal's accounts
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Resolution {
    /// Requested ids the principal may not use
    pub denied: Vec<String>,
    /// Every account visible to the principal, in directory order
    pub resources: Vec<Account>,
}

impl Resolution {
    pub fn allowed(&self) -> bool {
        self.denied.is_empty()
    }
}

#[async_trait]
pub trait AccountDirectory: Send + Sync {
    async fn resolve(
        &self,
        principal: &Principal,
        selection: &ResourceSelection,
    ) -> Result<Resolution>;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatSession {
    pub id: String,
    pub user_id: String,
    pub org_id: Option<String>,
    pub title: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub message_count: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    User,
    Assistant,
}

impl MessageRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Assistant => "assistant",
        }
    }
}

/// One persisted conversation turn
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub session_id: String,
    pub user_id: String,
    pub role: MessageRole,
    pub content: String,
    pub metadata: Value,
}

/// Blocking chat persistence. Async callers go through `spawn_blocking`.
pub trait ChatStore: Send + Sync {
    /// Create a session. `session_id` lets the caller pick the id.
    fn create_session(
        &self,
        owner: &Principal,
        title: &str,
        session_id: Option<&str>,
    ) -> Result<ChatSession>;

    fn get_session(&self, session_id: &str) -> Result<Option<ChatSession>>;

    fn save_message(&self, message: &ChatMessage) -> Result<()>;
}

/// Record of a query submission for the audit trail
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AuditEntry {
    pub user_id: String,
    pub org_id: Option<String>,
    pub action: &'static str,
    pub resource_type: String,
    /// Comma-joined ids, at most three
    pub resource_id: Option<String>,
    pub session_id: Option<String>,
}

impl AuditEntry {
    pub fn query(
        principal: &Principal,
        kind: ResourceKind,
        ids: &[String],
        session_id: Option<&str>,
    ) -> Self {
        Self {
            user_id: principal.user_id.clone(),
            org_id: principal.org_id.clone(),
            action: "query",
            resource_type: format!("{}_account", kind.as_str()),
            resource_id: (!ids.is_empty()).then(|| {
                ids.iter()
                    .take(3)
                    .map(String::as_str)
                    .collect::<Vec<_>>()
                    .join(",")
            }),
            session_id: session_id.map(str::to_string),
        }
    }
}

/// Fire-and-forget audit trail
pub trait AuditSink: Send + Sync {
    fn record(&self, entry: AuditEntry);
}

pub trait MetricsSink: Send + Sync {
    fn record_query(&self, resource_id: &str, duration: std::time::Duration);
}
