//! Agent runtime access
//!
//! The runtime is an external service with a blocking, streaming invocation
//! call. [`AgentRuntime`] is the seam; [`RuntimeBridge`] moves the blocking
//! call onto a worker thread and hands frames to async code.

use std::io::Read;

use serde::Serialize;

use crate::constants;
use crate::error::RuntimeError;
use crate::types::{Attachment, ResourceKind};

mod bridge;
pub mod frames;
mod http;

pub use bridge::{FrameStream, RuntimeBridge};
pub use frames::{RawFrame, StopReason, ToolResult, ToolUseStart};
pub use http::HttpAgentRuntime;

/// Parameters of one streaming invocation
#[derive(Debug, Clone, Serialize)]
pub struct InvokeRequest {
    pub prompt: String,
    #[serde(rename = "account_id")]
    pub resource_id: String,
    #[serde(rename = "account_type")]
    pub resource_kind: ResourceKind,
    pub prompt_type: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    pub user_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub org_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model_id: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub attachments: Vec<Attachment>,
}

impl InvokeRequest {
    pub fn new(
        prompt: impl Into<String>,
        resource_id: impl Into<String>,
        resource_kind: ResourceKind,
        user_id: impl Into<String>,
    ) -> Self {
        Self {
            prompt: prompt.into(),
            resource_id: resource_id.into(),
            resource_kind,
            prompt_type: constants::runtime::PROMPT_TYPE,
            session_id: None,
            user_id: user_id.into(),
            org_id: None,
            model_id: None,
            attachments: Vec::new(),
        }
    }
}

/// Streaming body returned by the runtime
pub struct RuntimeResponse {
    pub content_type: String,
    pub body: Box<dyn Read + Send>,
}

impl RuntimeResponse {
    pub fn event_stream(body: impl Read + Send + 'static) -> Self {
        Self {
            content_type: "text/event-stream".to_string(),
            body: Box::new(body),
        }
    }

    pub fn is_event_stream(&self) -> bool {
        self.content_type.contains("text/event-stream")
    }
}

/// Blocking client for the agent runtime.
///
/// Both calls block the calling thread; async code must go through
/// [`RuntimeBridge`] or `spawn_blocking`.
pub trait AgentRuntime: Send + Sync {
    fn invoke(&self, request: &InvokeRequest) -> Result<RuntimeResponse, RuntimeError>;

    /// Ask the runtime to stop a session. `Ok(false)` when the session is unknown.
    fn stop_session(&self, session_id: &str) -> Result<bool, RuntimeError>;
}
