//! Account directory loaded from a TOML file
//!
//! ```toml
//! [[accounts]]
//! id = "aws-prod"
//! kind = "aws"
//! display_name = "Production"
//! external_id = "123456789012"
//! org_id = "acme"
//!
//! [[grants]]
//! user_id = "u-1"
//! accounts = ["aws-prod"]
//! ```

use std::collections::{HashMap, HashSet};
use std::path::Path;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::Deserialize;

use super::{AccountDirectory, Resolution};
use crate::types::{Account, Principal, ResourceKind, ResourceSelection};

#[derive(Debug, Default, Deserialize)]
struct DirectoryFile {
    #[serde(default)]
    accounts: Vec<AccountEntry>,
    #[serde(default)]
    grants: Vec<GrantEntry>,
}

#[derive(Debug, Deserialize)]
struct AccountEntry {
    id: String,
    kind: ResourceKind,
    display_name: String,
    external_id: Option<String>,
    organization_id: Option<String>,
    /// Tenant that owns the account; unset means every tenant
    org_id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct GrantEntry {
    user_id: String,
    #[serde(default)]
    accounts: Vec<String>,
}

/// Accounts and per-user grants held in memory.
///
/// Admins see every account of their tenant. Other users see only the
/// accounts granted to them.
#[derive(Debug, Default)]
pub struct StaticDirectory {
    accounts: Vec<(Option<String>, Account)>,
    grants: HashMap<String, HashSet<String>>,
}

impl StaticDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load from a TOML file. A missing file yields an empty directory.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            tracing::warn!("Account directory {} not found, no accounts configured", path.display());
            return Ok(Self::new());
        }
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read account directory {}", path.display()))?;
        Self::from_toml(&raw)
            .with_context(|| format!("Failed to parse account directory {}", path.display()))
    }

    pub fn from_toml(raw: &str) -> Result<Self> {
        let file: DirectoryFile = toml::from_str(raw)?;
        let mut directory = Self::new();
        for entry in file.accounts {
            directory.add_account(
                entry.org_id.as_deref(),
                Account {
                    id: entry.id,
                    kind: entry.kind,
                    display_name: entry.display_name,
                    external_id: entry.external_id,
                    organization_id: entry.organization_id,
                },
            );
        }
        for grant in file.grants {
            for account_id in grant.accounts {
                directory.grant(&grant.user_id, &account_id);
            }
        }
        tracing::info!(
            "Loaded {} accounts and {} user grants",
            directory.accounts.len(),
            directory.grants.len()
        );
        Ok(directory)
    }

    pub fn add_account(&mut self, org_id: Option<&str>, account: Account) {
        self.accounts.push((org_id.map(str::to_string), account));
    }

    pub fn grant(&mut self, user_id: &str, account_id: &str) {
        self.grants
            .entry(user_id.to_string())
            .or_default()
            .insert(account_id.to_string());
    }

    fn visible_to(&self, principal: &Principal) -> Vec<Account> {
        let granted = self.grants.get(&principal.user_id);
        self.accounts
            .iter()
            .filter(|(tenant, _)| match (tenant, &principal.org_id) {
                (Some(tenant), Some(org)) => tenant == org,
                _ => true,
            })
            .filter(|(_, account)| {
                principal.is_elevated() || granted.is_some_and(|ids| ids.contains(&account.id))
            })
            .map(|(_, account)| account.clone())
            .collect()
    }
}

#[async_trait]
impl AccountDirectory for StaticDirectory {
    async fn resolve(
        &self,
        principal: &Principal,
        selection: &ResourceSelection,
    ) -> Result<Resolution> {
        let resources = self.visible_to(principal);
        let denied = if principal.is_elevated() {
            Vec::new()
        } else {
            selection
                .ids()
                .filter(|(id, kind)| !resources.iter().any(|a| a.id == *id && a.kind == *kind))
                .map(|(id, _)| id.to_string())
                .collect()
        };
        Ok(Resolution { denied, resources })
    }
}
