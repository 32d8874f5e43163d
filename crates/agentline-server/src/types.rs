//! Request and response types for the API

use serde::{Deserialize, Serialize};

use agentline_core::collab::MetricsSnapshot;
use agentline_core::registry::RegistryStats;
use agentline_core::types::{Attachment, ResourceSelection};

// ============================================================================
// Query Types
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct QueryBody {
    #[serde(alias = "query")]
    pub query_text: String,
    pub query_id: Option<String>,
    pub session_id: Option<String>,
    #[serde(default, alias = "account_ids")]
    pub resource_ids: Option<Vec<String>>,
    #[serde(default, alias = "gcp_account_ids")]
    pub gcp_resource_ids: Option<Vec<String>>,
    pub model_id: Option<String>,
    #[serde(default)]
    pub attachments: Vec<Attachment>,
    /// Image attachments sent separately by older clients
    #[serde(default)]
    pub images: Vec<Attachment>,
    /// Spreadsheet and document attachments sent separately by older clients
    #[serde(default)]
    pub files: Vec<Attachment>,
}

impl QueryBody {
    pub fn selection(&self) -> ResourceSelection {
        ResourceSelection {
            aws: self.resource_ids.clone().unwrap_or_default(),
            gcp: self.gcp_resource_ids.clone().unwrap_or_default(),
        }
    }

    /// All attachments in arrival order: explicit list, then images, then files
    pub fn into_attachments(self) -> Vec<Attachment> {
        let mut all = self.attachments;
        all.extend(self.images);
        all.extend(self.files);
        all
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct CancelBody {
    pub reason: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct CancelResponse {
    pub success: bool,
    pub query_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

// ============================================================================
// Stats Types
// ============================================================================

#[derive(Debug, Serialize)]
pub struct StatsResponse {
    #[serde(flatten)]
    pub registry: RegistryStats,
    pub metrics: MetricsSnapshot,
}
