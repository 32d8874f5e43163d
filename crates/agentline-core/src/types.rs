//! Domain types shared by the orchestrator and its collaborators

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Admin,
    #[default]
    Member,
}

impl Role {
    pub fn parse(raw: &str) -> Self {
        match raw.trim().to_ascii_lowercase().as_str() {
            "admin" | "super_admin" => Self::Admin,
            _ => Self::Member,
        }
    }
}

/// The user a query runs on behalf of
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Principal {
    pub user_id: String,
    pub org_id: Option<String>,
    pub username: Option<String>,
    #[serde(default)]
    pub role: Role,
}

impl Principal {
    pub fn new(user_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            org_id: None,
            username: None,
            role: Role::Member,
        }
    }

    /// Elevated principals bypass per-resource permission checks
    pub fn is_elevated(&self) -> bool {
        self.role == Role::Admin
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResourceKind {
    Aws,
    Gcp,
}

impl ResourceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Aws => "aws",
            Self::Gcp => "gcp",
        }
    }
}

/// Cloud accounts requested for a query
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceSelection {
    #[serde(default)]
    pub aws: Vec<String>,
    #[serde(default)]
    pub gcp: Vec<String>,
}

impl ResourceSelection {
    pub fn is_empty(&self) -> bool {
        self.aws.is_empty() && self.gcp.is_empty()
    }

    /// Requested ids in priority order: AWS first, then GCP
    pub fn ids(&self) -> impl Iterator<Item = (&str, ResourceKind)> {
        self.aws
            .iter()
            .map(|id| (id.as_str(), ResourceKind::Aws))
            .chain(self.gcp.iter().map(|id| (id.as_str(), ResourceKind::Gcp)))
    }
}

/// A cloud account the runtime can query
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Account {
    pub id: String,
    pub kind: ResourceKind,
    pub display_name: String,
    /// 12-digit AWS account id or GCP project id
    pub external_id: Option<String>,
    pub organization_id: Option<String>,
}

/// File or image sent along with a query, base64 encoded
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attachment {
    pub file_name: String,
    pub mime_type: String,
    pub base64_data: String,
}
