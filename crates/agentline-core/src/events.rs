//! Normalized query events
//!
//! Everything a client sees for one query. Serialized with a `type` tag and
//! wrapped in an [`EventEnvelope`] carrying the timestamp and session id.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Token accounting reported by the runtime
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TokenUsage {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cache_read_tokens: u64,
    pub cache_write_tokens: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub input_cache_hit_rate: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output_cache_hit_rate: Option<f64>,
}

/// Timing and size figures attached to a completion
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CompletionMeta {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub query_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response_length: Option<usize>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StatusKind {
    Initializing,
    Processing,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum QueryEvent {
    /// Text increment from the model
    Chunk { content: String },
    /// A tool invocation was detected; `update` marks a corrected argument set
    ToolCallStart {
        tool_id: String,
        tool_name: String,
        args: Map<String, Value>,
        #[serde(skip_serializing_if = "Option::is_none")]
        update: Option<bool>,
    },
    ToolCallResult {
        tool_use_id: String,
        result: Value,
        status: String,
    },
    TokenUsage { usage: TokenUsage },
    SessionCreated { session_id: String },
    Status {
        status_type: StatusKind,
        message: String,
    },
    /// User-facing guidance; not an error
    Response { content: String },
    Complete {
        success: bool,
        #[serde(skip_serializing_if = "Option::is_none")]
        stop_reason: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
        meta: CompletionMeta,
        #[serde(skip_serializing_if = "Option::is_none")]
        token_usage: Option<TokenUsage>,
    },
    Error { content: String },
    GenerationCancelled { query_id: String, message: String },
}

impl QueryEvent {
    pub fn chunk(content: impl Into<String>) -> Self {
        Self::Chunk {
            content: content.into(),
        }
    }

    pub fn error(content: impl Into<String>) -> Self {
        Self::Error {
            content: content.into(),
        }
    }

    /// Error, completion, and cancellation ack end a query's visible output.
    /// Guidance also ends it, as a successful no-op.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Complete { .. }
                | Self::Error { .. }
                | Self::GenerationCancelled { .. }
                | Self::Response { .. }
        )
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Chunk { .. } => "chunk",
            Self::ToolCallStart { .. } => "tool_call_start",
            Self::ToolCallResult { .. } => "tool_call_result",
            Self::TokenUsage { .. } => "token_usage",
            Self::SessionCreated { .. } => "session_created",
            Self::Status { .. } => "status",
            Self::Response { .. } => "response",
            Self::Complete { .. } => "complete",
            Self::Error { .. } => "error",
            Self::GenerationCancelled { .. } => "generation_cancelled",
        }
    }
}

/// Wire form of an event: `{type, ...fields, timestamp, session_id?}`
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EventEnvelope {
    #[serde(flatten)]
    pub event: QueryEvent,
    /// Seconds since the Unix epoch
    pub timestamp: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
}

impl EventEnvelope {
    pub fn new(event: QueryEvent, session_id: Option<String>) -> Self {
        let now = chrono::Utc::now();
        Self {
            event,
            timestamp: now.timestamp_millis() as f64 / 1000.0,
            session_id,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn chunk_serializes_with_type_tag() {
        let envelope = EventEnvelope::new(QueryEvent::chunk("hi"), None);
        let value = serde_json::to_value(&envelope).expect("serialize");
        assert_eq!(value["type"], "chunk");
        assert_eq!(value["content"], "hi");
        assert!(value["timestamp"].as_f64().is_some());
        assert!(value.get("session_id").is_none());
    }

    #[test]
    fn tool_call_start_omits_update_unless_set() {
        let mut args = Map::new();
        args.insert("region".into(), json!("us-east-1"));
        let event = QueryEvent::ToolCallStart {
            tool_id: "tool_x".into(),
            tool_name: "get_cost".into(),
            args,
            update: None,
        };
        let value = serde_json::to_value(&event).expect("serialize");
        assert_eq!(value["type"], "tool_call_start");
        assert_eq!(value["args"]["region"], "us-east-1");
        assert!(value.get("update").is_none());
    }

    #[test]
    fn envelope_carries_session_id() {
        let envelope = EventEnvelope::new(
            QueryEvent::Status {
                status_type: StatusKind::Processing,
                message: "working".into(),
            },
            Some("sess-1".into()),
        );
        let value = serde_json::to_value(&envelope).expect("serialize");
        assert_eq!(value["type"], "status");
        assert_eq!(value["status_type"], "processing");
        assert_eq!(value["session_id"], "sess-1");
    }

    #[test]
    fn terminal_kinds() {
        assert!(QueryEvent::error("x").is_terminal());
        assert!(!QueryEvent::chunk("x").is_terminal());
        assert!(QueryEvent::GenerationCancelled {
            query_id: "q".into(),
            message: "stopped".into()
        }
        .is_terminal());
    }
}
