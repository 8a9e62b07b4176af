//! ---
//! kvr_section: "08-reconciliation-engine"
//! kvr_subsection: "module"
//! kvr_type: "source"
//! kvr_scope: "code"
//! kvr_description: "Live-state collection, diffing and application of vault access policies."
//! kvr_version: "v0.0.0-prealpha"
//! kvr_owner: "tbd"
//! ---
use std::collections::HashSet;

use kvr_logging::kvr_info;
use kvr_security::{
    resource_group_path, subscription_path, MissingScope, PrincipalResolver, ProviderError,
    ScopeRequest, ShorthandTable,
};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::{
    errors::{EngineError, Result},
    model::{AccessPolicy, PermissionSets, PrincipalIdentity, Vault, VaultId, VaultModel},
};

/// Permissions exactly as a vault reports them, before normalisation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawPermissions {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub keys: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secrets: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub certificates: Option<Vec<String>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawAccessPolicy {
    pub object_id: String,
    #[serde(default)]
    pub tenant_id: String,
    #[serde(default)]
    pub permissions: RawPermissions,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawVault {
    pub subscription_id: String,
    pub resource_group: String,
    pub name: String,
    #[serde(default)]
    pub location: String,
    #[serde(default)]
    pub tenant_id: String,
    #[serde(default)]
    pub access_policies: Vec<RawAccessPolicy>,
}

impl RawVault {
    pub fn id(&self) -> VaultId {
        VaultId::new(&self.subscription_id, &self.resource_group, &self.name)
    }
}

/// One page of a vault listing; `next_page` is an opaque continuation token.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VaultPage {
    pub vaults: Vec<RawVault>,
    pub next_page: Option<String>,
}

/// Read-only access to the vaults of a cloud tenant.
pub trait VaultInventory {
    fn list_by_subscription(
        &self,
        subscription_id: &str,
        page: Option<&str>,
    ) -> std::result::Result<VaultPage, ProviderError>;

    fn list_by_resource_group(
        &self,
        subscription_id: &str,
        resource_group: &str,
        page: Option<&str>,
    ) -> std::result::Result<VaultPage, ProviderError>;

    fn get_vault(
        &self,
        subscription_id: &str,
        resource_group: &str,
        vault_name: &str,
    ) -> std::result::Result<RawVault, ProviderError>;
}

/// Live vaults plus the scopes that were skipped as missing.
#[derive(Debug, Clone, Default)]
pub struct Collection {
    pub model: VaultModel,
    pub missing: Vec<MissingScope>,
}

/// Builds the live [`VaultModel`] for a scope request.
pub struct InventoryCollector<'a> {
    inventory: &'a dyn VaultInventory,
    resolver: &'a PrincipalResolver,
    table: &'a ShorthandTable,
}

impl<'a> InventoryCollector<'a> {
    pub fn new(
        inventory: &'a dyn VaultInventory,
        resolver: &'a PrincipalResolver,
        table: &'a ShorthandTable,
    ) -> Self {
        Self {
            inventory,
            resolver,
            table,
        }
    }

    /// Collect every vault the request names. Missing scopes are recorded and skipped;
    /// any other provider error aborts.
    pub fn collect(&self, request: &ScopeRequest) -> Result<Collection> {
        let mut collection = Collection::default();

        for (subscription_id, groups) in &request.subscriptions {
            if groups.is_empty() {
                let listed = drain(|page| self.inventory.list_by_subscription(subscription_id, page));
                self.absorb(listed, subscription_path(subscription_id), &mut collection)?;
                continue;
            }
            for (resource_group, vaults) in groups {
                if vaults.is_empty() {
                    let listed = drain(|page| {
                        self.inventory
                            .list_by_resource_group(subscription_id, resource_group, page)
                    });
                    self.absorb(
                        listed,
                        resource_group_path(subscription_id, resource_group),
                        &mut collection,
                    )?;
                    continue;
                }
                for vault_name in vaults {
                    let id = VaultId::new(subscription_id, resource_group, vault_name);
                    let fetched = self
                        .inventory
                        .get_vault(subscription_id, resource_group, vault_name)
                        .map(|vault| vec![vault]);
                    self.absorb(fetched, id.scope_path(), &mut collection)?;
                }
            }
        }

        kvr_info!(
            "collected {} vault(s), {} scope(s) missing",
            collection.model.len(),
            collection.missing.len()
        );
        Ok(collection)
    }

    fn absorb(
        &self,
        fetched: std::result::Result<Vec<RawVault>, ProviderError>,
        scope: String,
        collection: &mut Collection,
    ) -> Result<()> {
        match fetched {
            Ok(vaults) => {
                for raw in vaults {
                    let vault = self.normalize_vault(raw)?;
                    collection.model.insert(vault);
                }
                Ok(())
            }
            Err(ProviderError::NotFound { message, .. }) => {
                warn!(%scope, %message, "scope not found; skipping");
                collection.missing.push(MissingScope { scope, message });
                Ok(())
            }
            Err(err) => Err(EngineError::Provider(err)),
        }
    }

    /// Resolve every principal and normalise every permission list of one vault.
    pub fn normalize_vault(&self, raw: RawVault) -> Result<Vault> {
        let id = raw.id();
        let mut vault = Vault::new(id.clone());
        vault.location = raw.location;
        vault.tenant_id = raw.tenant_id;

        for policy in raw.access_policies {
            let resolved = self.resolver.resolve(&policy.object_id);
            let principal = PrincipalIdentity {
                object_id: Some(policy.object_id),
                kind: resolved.kind,
                display_name: resolved.display_name,
                alias: resolved.alias,
            };
            let permissions = PermissionSets::normalize(
                self.table,
                policy.permissions.keys.as_deref(),
                policy.permissions.secrets.as_deref(),
                policy.permissions.certificates.as_deref(),
            )
            .map_err(|source| EngineError::UnknownPermissionToken {
                vault: id.to_string(),
                principal: principal.label().to_owned(),
                source,
            })?;
            vault.policies.push(AccessPolicy {
                principal,
                permissions,
            });
        }
        debug!(vault = %id, policies = vault.policies.len(), "vault normalised");
        Ok(vault)
    }
}

/// Follow continuation tokens until the listing is exhausted.
///
/// A token seen before means the provider is cycling; that is an error.
fn drain<F>(mut fetch: F) -> std::result::Result<Vec<RawVault>, ProviderError>
where
    F: FnMut(Option<&str>) -> std::result::Result<VaultPage, ProviderError>,
{
    let mut vaults = Vec::new();
    let mut seen: HashSet<String> = HashSet::new();
    let mut token: Option<String> = None;
    loop {
        let page = fetch(token.as_deref())?;
        vaults.extend(page.vaults);
        match page.next_page {
            Some(next) if seen.insert(next.clone()) => token = Some(next),
            Some(next) => {
                return Err(ProviderError::Request(format!(
                    "listing returned continuation token {next} more than once"
                )))
            }
            None => return Ok(vaults),
        }
    }
}
