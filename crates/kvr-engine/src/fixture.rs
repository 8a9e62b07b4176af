//! ---
//! kvr_section: "08-reconciliation-engine"
//! kvr_subsection: "module"
//! kvr_type: "source"
//! kvr_scope: "code"
//! kvr_description: "Live-state collection, diffing and application of vault access policies."
//! kvr_version: "v0.0.0-prealpha"
//! kvr_owner: "tbd"
//! ---
//! File-backed stand-in for the cloud APIs.
//!
//! A snapshot document describes subscriptions, vaults, directory objects
//! and the caller's role assignments. [`FixtureCloud`] serves it through every
//! collaborator trait and records the writes made against it.
use std::{fs, path::Path};

use kvr_security::{
    subscription_path, DirectorySnapshot, InMemoryDirectory, PrincipalResolver, ProviderError,
    RoleAssignment, RoleAssignmentLookup,
};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::{
    apply::PolicyWriter,
    errors::{EngineError, Result},
    inventory::{RawAccessPolicy, RawPermissions, RawVault, VaultInventory, VaultPage},
    model::{PermissionSets, VaultId},
};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CloudSnapshot {
    /// Subscriptions that exist even without vaults.
    #[serde(default)]
    pub subscriptions: Vec<String>,
    #[serde(default)]
    pub vaults: Vec<RawVault>,
    #[serde(default)]
    pub directory: DirectorySnapshot,
    /// Assignments held by the caller.
    #[serde(default)]
    pub role_assignments: Vec<RoleAssignment>,
    /// Listing page size; everything on one page when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub page_size: Option<usize>,
    /// Object ids whose writes are rejected.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub rejected_object_ids: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriteCall {
    Set { vault: String, object_id: String },
    Revoke { vault: String, object_id: String },
}

pub struct FixtureCloud {
    state: RwLock<CloudSnapshot>,
    directory: InMemoryDirectory,
    writes: Mutex<Vec<WriteCall>>,
}

impl FixtureCloud {
    pub fn from_snapshot(snapshot: CloudSnapshot) -> Self {
        let directory = InMemoryDirectory::from_snapshot(snapshot.directory.clone());
        Self {
            state: RwLock::new(snapshot),
            directory,
            writes: Mutex::new(Vec::new()),
        }
    }

    /// Load a snapshot; JSON when it opens with `{`, YAML otherwise.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let data = fs::read_to_string(path)?;
        let snapshot: CloudSnapshot = if data.trim_start().starts_with('{') {
            let mut de = serde_json::Deserializer::from_str(&data);
            serde_path_to_error::deserialize(&mut de).map_err(|err| {
                EngineError::Configuration(format!(
                    "{}: {} at `{}`",
                    path.display(),
                    err.inner(),
                    err.path()
                ))
            })?
        } else {
            serde_path_to_error::deserialize(serde_yaml::Deserializer::from_str(&data)).map_err(
                |err| {
                    EngineError::Configuration(format!(
                        "{}: {} at `{}`",
                        path.display(),
                        err.inner(),
                        err.path()
                    ))
                },
            )?
        };
        Ok(Self::from_snapshot(snapshot))
    }

    /// Current state, including every write applied so far.
    pub fn snapshot(&self) -> CloudSnapshot {
        let mut snapshot = self.state.read().clone();
        snapshot.directory = self.directory.snapshot();
        snapshot
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let snapshot = self.snapshot();
        let rendered = match path.extension().and_then(|ext| ext.to_str()) {
            Some("yaml" | "yml") => serde_yaml::to_string(&snapshot)?,
            _ => serde_json::to_string_pretty(&snapshot)?,
        };
        fs::write(path, rendered)?;
        Ok(())
    }

    pub fn directory(&self) -> &InMemoryDirectory {
        &self.directory
    }

    pub fn resolver(&self) -> PrincipalResolver {
        self.directory.resolver()
    }

    pub fn write_calls(&self) -> Vec<WriteCall> {
        self.writes.lock().clone()
    }

    pub fn vault(&self, id: &VaultId) -> Option<RawVault> {
        self.state
            .read()
            .vaults
            .iter()
            .find(|vault| vault.id() == *id)
            .cloned()
    }

    fn subscription_exists(&self, subscription_id: &str) -> bool {
        let state = self.state.read();
        state
            .subscriptions
            .iter()
            .any(|sub| sub.eq_ignore_ascii_case(subscription_id))
            || state
                .vaults
                .iter()
                .any(|vault| vault.subscription_id.eq_ignore_ascii_case(subscription_id))
    }

    fn require_subscription(&self, subscription_id: &str) -> std::result::Result<(), ProviderError> {
        if self.subscription_exists(subscription_id) {
            Ok(())
        } else {
            Err(ProviderError::NotFound {
                resource: subscription_path(subscription_id),
                message: format!("SubscriptionNotFound: The subscription '{subscription_id}' could not be found."),
            })
        }
    }

    fn page<F>(&self, filter: F, page: Option<&str>) -> std::result::Result<VaultPage, ProviderError>
    where
        F: Fn(&RawVault) -> bool,
    {
        let state = self.state.read();
        let matching: Vec<RawVault> = state.vaults.iter().filter(|v| filter(v)).cloned().collect();
        let start = match page {
            Some(token) => token
                .parse::<usize>()
                .map_err(|_| ProviderError::Request(format!("invalid continuation token '{token}'")))?,
            None => 0,
        };
        let size = state.page_size.unwrap_or(usize::MAX).max(1);
        let end = start.saturating_add(size).min(matching.len());
        let vaults = matching.get(start..end).map(<[RawVault]>::to_vec).unwrap_or_default();
        Ok(VaultPage {
            vaults,
            next_page: (end < matching.len()).then(|| end.to_string()),
        })
    }

    fn not_found(id: &VaultId) -> ProviderError {
        ProviderError::NotFound {
            resource: id.scope_path(),
            message: format!(
                "ResourceNotFound: The Resource 'Microsoft.KeyVault/vaults/{}' under resource group '{}' was not found.",
                id.vault_name, id.resource_group
            ),
        }
    }

    fn with_vault<T>(
        &self,
        id: &VaultId,
        update: impl FnOnce(&mut RawVault) -> std::result::Result<T, ProviderError>,
    ) -> std::result::Result<T, ProviderError> {
        let mut state = self.state.write();
        let vault = state
            .vaults
            .iter_mut()
            .find(|vault| vault.id() == *id)
            .ok_or_else(|| Self::not_found(id))?;
        update(vault)
    }

    fn rejects(&self, object_id: &str) -> bool {
        self.state
            .read()
            .rejected_object_ids
            .iter()
            .any(|rejected| rejected == object_id)
    }
}

impl VaultInventory for FixtureCloud {
    fn list_by_subscription(
        &self,
        subscription_id: &str,
        page: Option<&str>,
    ) -> std::result::Result<VaultPage, ProviderError> {
        self.require_subscription(subscription_id)?;
        self.page(
            |vault| vault.subscription_id.eq_ignore_ascii_case(subscription_id),
            page,
        )
    }

    fn list_by_resource_group(
        &self,
        subscription_id: &str,
        resource_group: &str,
        page: Option<&str>,
    ) -> std::result::Result<VaultPage, ProviderError> {
        self.require_subscription(subscription_id)?;
        self.page(
            |vault| {
                vault.subscription_id.eq_ignore_ascii_case(subscription_id)
                    && vault.resource_group.eq_ignore_ascii_case(resource_group)
            },
            page,
        )
    }

    fn get_vault(
        &self,
        subscription_id: &str,
        resource_group: &str,
        vault_name: &str,
    ) -> std::result::Result<RawVault, ProviderError> {
        self.require_subscription(subscription_id)?;
        let id = VaultId::new(subscription_id, resource_group, vault_name);
        self.vault(&id).ok_or_else(|| Self::not_found(&id))
    }
}

impl RoleAssignmentLookup for FixtureCloud {
    fn list_for_scope(&self, scope: &str) -> std::result::Result<Vec<RoleAssignment>, ProviderError> {
        let subscription_id = scope.split('/').nth(2).unwrap_or_default();
        self.require_subscription(subscription_id)?;
        Ok(self
            .state
            .read()
            .role_assignments
            .iter()
            .filter(|assignment| assignment.scope.eq_ignore_ascii_case(scope))
            .cloned()
            .collect())
    }
}

impl PolicyWriter for FixtureCloud {
    fn set_policy(
        &self,
        vault: &VaultId,
        object_id: &str,
        permissions: &PermissionSets,
    ) -> std::result::Result<(), ProviderError> {
        self.writes.lock().push(WriteCall::Set {
            vault: vault.to_string(),
            object_id: object_id.to_owned(),
        });
        if self.rejects(object_id) {
            return Err(ProviderError::Request(format!(
                "403 Forbidden: caller may not grant access to '{object_id}'"
            )));
        }
        let [keys, secrets, certificates] = permissions.to_lists();
        let raw = RawPermissions {
            keys: Some(keys),
            secrets: Some(secrets),
            certificates: Some(certificates),
        };
        self.with_vault(vault, |current| {
            match current
                .access_policies
                .iter_mut()
                .find(|policy| policy.object_id == object_id)
            {
                Some(policy) => policy.permissions = raw,
                None => current.access_policies.push(RawAccessPolicy {
                    object_id: object_id.to_owned(),
                    tenant_id: current.tenant_id.clone(),
                    permissions: raw,
                }),
            }
            Ok(())
        })?;
        debug!(vault = %vault, object_id, "policy set");
        Ok(())
    }

    fn revoke_policy(&self, vault: &VaultId, object_id: &str) -> std::result::Result<(), ProviderError> {
        self.writes.lock().push(WriteCall::Revoke {
            vault: vault.to_string(),
            object_id: object_id.to_owned(),
        });
        if self.rejects(object_id) {
            return Err(ProviderError::Request(format!(
                "403 Forbidden: caller may not revoke access for '{object_id}'"
            )));
        }
        self.with_vault(vault, |current| {
            let before = current.access_policies.len();
            current
                .access_policies
                .retain(|policy| policy.object_id != object_id);
            if current.access_policies.len() == before {
                return Err(ProviderError::NotFound {
                    resource: vault.scope_path(),
                    message: format!("no access policy for object '{object_id}'"),
                });
            }
            Ok(())
        })?;
        debug!(vault = %vault, object_id, "policy revoked");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kvr_security::ShorthandTable;

    const SNAPSHOT: &str = r#"
subscriptions: [empty-sub]
page_size: 1
vaults:
  - subscription_id: s1
    resource_group: rg
    name: kv-a
    tenant_id: t
    access_policies:
      - object_id: u1
        permissions: { keys: [get] }
  - subscription_id: s1
    resource_group: rg
    name: kv-b
directory:
  users:
    - object_id: u1
      display_name: Alice
      user_principal_name: alice@contoso.com
role_assignments:
  - scope: /subscriptions/s1
    role_definition_id: 00482a5a-887f-4fb3-b363-3b7fe8e74483
"#;

    fn cloud() -> FixtureCloud {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cloud.yaml");
        fs::write(&path, SNAPSHOT).unwrap();
        FixtureCloud::load(&path).unwrap()
    }

    #[test]
    fn listings_are_paged() {
        let cloud = cloud();
        let first = cloud.list_by_subscription("s1", None).unwrap();
        assert_eq!(first.vaults.len(), 1);
        let second = cloud
            .list_by_subscription("s1", first.next_page.as_deref())
            .unwrap();
        assert_eq!(second.vaults[0].name, "kv-b");
        assert!(second.next_page.is_none());
        assert!(cloud.list_by_subscription("empty-sub", None).unwrap().vaults.is_empty());
        assert!(cloud.list_by_subscription("nope", None).unwrap_err().is_not_found());
    }

    #[test]
    fn role_assignments_match_exact_scope() {
        let cloud = cloud();
        assert_eq!(cloud.list_for_scope("/subscriptions/S1").unwrap().len(), 1);
        assert!(cloud
            .list_for_scope("/subscriptions/s1/resourceGroups/rg")
            .unwrap()
            .is_empty());
        assert!(cloud.list_for_scope("/subscriptions/other").is_err());
    }

    #[test]
    fn writes_change_state_and_survive_save() {
        let cloud = cloud();
        let id = VaultId::new("s1", "rg", "kv-b");
        let permissions = PermissionSets::normalize(
            &ShorthandTable::standard(),
            None,
            Some(&["read"][..]),
            None,
        )
        .unwrap();
        cloud.set_policy(&id, "u1", &permissions).unwrap();
        cloud
            .revoke_policy(&VaultId::new("s1", "rg", "kv-a"), "u1")
            .unwrap();
        assert!(cloud
            .revoke_policy(&VaultId::new("s1", "rg", "kv-a"), "u1")
            .unwrap_err()
            .is_not_found());
        assert_eq!(cloud.write_calls().len(), 3);

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("after.json");
        cloud.save(&path).unwrap();
        let reloaded = FixtureCloud::load(&path).unwrap();
        let vault = reloaded.vault(&id).unwrap();
        assert_eq!(
            vault.access_policies[0].permissions.secrets,
            Some(vec!["get".to_string(), "list".to_string()])
        );
        assert_eq!(reloaded.snapshot().directory.users.len(), 1);
    }
}
