//! ---
//! kvr_section: "08-reconciliation-engine"
//! kvr_subsection: "module"
//! kvr_type: "source"
//! kvr_scope: "code"
//! kvr_description: "Live-state collection, diffing and application of vault access policies."
//! kvr_version: "v0.0.0-prealpha"
//! kvr_owner: "tbd"
//! ---
use std::fmt;
use std::hash::{Hash, Hasher};

use indexmap::IndexMap;
use kvr_security::{
    names_match, vault_path, PermissionCategory, PermissionError, PermissionSet, PrincipalType,
    ShorthandTable,
};
use serde::{Deserialize, Serialize};

/// `(subscription, resource group, vault name)`. Comparison ignores ASCII case.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VaultId {
    pub subscription_id: String,
    pub resource_group: String,
    pub vault_name: String,
}

impl VaultId {
    pub fn new(
        subscription_id: impl Into<String>,
        resource_group: impl Into<String>,
        vault_name: impl Into<String>,
    ) -> Self {
        Self {
            subscription_id: subscription_id.into(),
            resource_group: resource_group.into(),
            vault_name: vault_name.into(),
        }
    }

    /// Full ARM scope path of the vault.
    pub fn scope_path(&self) -> String {
        vault_path(&self.subscription_id, &self.resource_group, &self.vault_name)
    }

    fn folded(&self) -> [String; 3] {
        [
            self.subscription_id.to_ascii_lowercase(),
            self.resource_group.to_ascii_lowercase(),
            self.vault_name.to_ascii_lowercase(),
        ]
    }
}

impl PartialEq for VaultId {
    fn eq(&self, other: &Self) -> bool {
        self.subscription_id.eq_ignore_ascii_case(&other.subscription_id)
            && self.resource_group.eq_ignore_ascii_case(&other.resource_group)
            && self.vault_name.eq_ignore_ascii_case(&other.vault_name)
    }
}

impl Eq for VaultId {}

impl Hash for VaultId {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.folded().hash(state);
    }
}

impl fmt::Display for VaultId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{}/{}",
            self.subscription_id, self.resource_group, self.vault_name
        )
    }
}

/// Who a policy is granted to.
///
/// Live principals carry the object id reported by the vault; desired
/// principals are authored by name and leave it empty.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrincipalIdentity {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub object_id: Option<String>,
    pub kind: PrincipalType,
    pub display_name: String,
    #[serde(default)]
    pub alias: String,
}

impl PrincipalIdentity {
    pub fn named(kind: PrincipalType, display_name: impl Into<String>, alias: impl Into<String>) -> Self {
        Self {
            object_id: None,
            kind,
            display_name: display_name.into(),
            alias: alias.into(),
        }
    }

    /// Whether two principals denote the same grantee.
    ///
    /// Display names compare case-insensitively. Aliases take part whenever
    /// either side is a user or group, or neither side is an application
    /// kind; two application-like principals match on name alone.
    pub fn same_identity(&self, other: &PrincipalIdentity) -> bool {
        if !names_match(&self.display_name, &other.display_name) {
            return false;
        }
        let app_like = |kind: PrincipalType| {
            matches!(kind, PrincipalType::App | PrincipalType::ServicePrincipal)
        };
        if app_like(self.kind) && app_like(other.kind) {
            return true;
        }
        names_match(&self.alias, &other.alias)
    }

    /// Label used in logs and reports.
    pub fn label(&self) -> &str {
        if !self.display_name.is_empty() {
            &self.display_name
        } else {
            self.object_id.as_deref().unwrap_or("<unnamed>")
        }
    }
}

/// Normalised permissions across the three categories.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PermissionSets {
    #[serde(default)]
    pub keys: PermissionSet,
    #[serde(default)]
    pub secrets: PermissionSet,
    #[serde(default)]
    pub certificates: PermissionSet,
}

impl PermissionSets {
    /// Normalise raw per-category token lists. The first unknown token wins.
    pub fn normalize<S: AsRef<str>>(
        table: &ShorthandTable,
        keys: Option<&[S]>,
        secrets: Option<&[S]>,
        certificates: Option<&[S]>,
    ) -> Result<Self, PermissionError> {
        Ok(Self {
            keys: table.normalize(PermissionCategory::Keys, keys)?,
            secrets: table.normalize(PermissionCategory::Secrets, secrets)?,
            certificates: table.normalize(PermissionCategory::Certificates, certificates)?,
        })
    }

    pub fn get(&self, category: PermissionCategory) -> &PermissionSet {
        match category {
            PermissionCategory::Keys => &self.keys,
            PermissionCategory::Secrets => &self.secrets,
            PermissionCategory::Certificates => &self.certificates,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty() && self.secrets.is_empty() && self.certificates.is_empty()
    }

    /// Categories whose sets differ from `other`.
    pub fn changed_categories(&self, other: &PermissionSets) -> Vec<PermissionCategory> {
        kvr_security::categories()
            .filter(|category| self.get(*category) != other.get(*category))
            .collect()
    }

    /// Sorted token lists, as written back to a vault.
    pub fn to_lists(&self) -> [Vec<String>; 3] {
        [
            self.keys.iter().cloned().collect(),
            self.secrets.iter().cloned().collect(),
            self.certificates.iter().cloned().collect(),
        ]
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessPolicy {
    pub principal: PrincipalIdentity,
    pub permissions: PermissionSets,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Vault {
    pub id: VaultId,
    #[serde(default)]
    pub location: String,
    #[serde(default)]
    pub tenant_id: String,
    #[serde(default)]
    pub policies: Vec<AccessPolicy>,
}

impl Vault {
    pub fn new(id: VaultId) -> Self {
        Self {
            id,
            location: String::new(),
            tenant_id: String::new(),
            policies: Vec::new(),
        }
    }
}

/// Vaults keyed by identity, in insertion order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct VaultModel {
    vaults: IndexMap<VaultId, Vault>,
}

impl VaultModel {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a vault, returning the one it replaced.
    pub fn insert(&mut self, vault: Vault) -> Option<Vault> {
        self.vaults.insert(vault.id.clone(), vault)
    }

    pub fn get(&self, id: &VaultId) -> Option<&Vault> {
        self.vaults.get(id)
    }

    pub fn contains(&self, id: &VaultId) -> bool {
        self.vaults.contains_key(id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Vault> {
        self.vaults.values()
    }

    pub fn len(&self) -> usize {
        self.vaults.len()
    }

    pub fn is_empty(&self) -> bool {
        self.vaults.is_empty()
    }
}

impl FromIterator<Vault> for VaultModel {
    fn from_iter<T: IntoIterator<Item = Vault>>(iter: T) -> Self {
        let mut model = VaultModel::new();
        for vault in iter {
            model.insert(vault);
        }
        model
    }
}
