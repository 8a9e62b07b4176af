//! ---
//! kvr_section: "08-reconciliation-engine"
//! kvr_subsection: "module"
//! kvr_type: "source"
//! kvr_scope: "code"
//! kvr_description: "Live-state collection, diffing and application of vault access policies."
//! kvr_version: "v0.0.0-prealpha"
//! kvr_owner: "tbd"
//! ---
use kvr_common::ReconcileConfig;
use kvr_security::PermissionCategory;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::{
    errors::{EngineError, Result},
    model::{AccessPolicy, PermissionSets, PrincipalIdentity, VaultId, VaultModel},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, strum::Display)]
#[serde(rename_all = "UPPERCASE")]
#[strum(serialize_all = "UPPERCASE")]
pub enum OperationKind {
    Add,
    Modify,
    Remove,
}

/// One planned change to one principal's grant on one vault.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyOperation {
    pub kind: OperationKind,
    pub vault: VaultId,
    pub principal: PrincipalIdentity,
    /// Live permissions (absent for ADD).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub before: Option<PermissionSets>,
    /// Desired permissions (absent for REMOVE).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub after: Option<PermissionSets>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub changed: Vec<PermissionCategory>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VaultPlan {
    pub vault: VaultId,
    /// Principals holding a live policy before the plan runs.
    pub live_principals: usize,
    /// ADDs first, then MODIFYs, then REMOVEs.
    pub operations: Vec<PolicyOperation>,
}

impl VaultPlan {
    fn count(&self, kind: OperationKind) -> usize {
        self.operations.iter().filter(|op| op.kind == kind).count()
    }

    /// Live principals that survive the REMOVEs.
    ///
    /// Planned ADDs are not counted: a failed ADD does not stop the REMOVEs
    /// queued behind it.
    pub fn remaining_principals(&self) -> usize {
        self.live_principals
            .saturating_sub(self.count(OperationKind::Remove))
    }
}

/// A grant about to be revoked, retained for audit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemovalRecord {
    pub vault: VaultId,
    pub principal: PrincipalIdentity,
    pub permissions: PermissionSets,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeCounts {
    pub add: usize,
    pub modify: usize,
    pub remove: usize,
}

impl ChangeCounts {
    pub fn total(&self) -> usize {
        self.add + self.modify + self.remove
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconcilePlan {
    /// Vaults with at least one change, in desired-document order.
    pub vaults: Vec<VaultPlan>,
    /// Every planned REMOVE with the permissions it takes away.
    pub removals: Vec<RemovalRecord>,
    /// Desired vaults that were not found live.
    pub skipped_vaults: Vec<VaultId>,
    /// Live vaults absent from the desired state; left untouched.
    pub unmanaged_vaults: Vec<VaultId>,
}

impl ReconcilePlan {
    pub fn operations(&self) -> impl Iterator<Item = &PolicyOperation> {
        self.vaults.iter().flat_map(|vault| vault.operations.iter())
    }

    pub fn counts(&self) -> ChangeCounts {
        let mut counts = ChangeCounts::default();
        for op in self.operations() {
            match op.kind {
                OperationKind::Add => counts.add += 1,
                OperationKind::Modify => counts.modify += 1,
                OperationKind::Remove => counts.remove += 1,
            }
        }
        counts
    }

    pub fn total_changes(&self) -> usize {
        self.operations().count()
    }

    pub fn is_empty(&self) -> bool {
        self.vaults.is_empty()
    }

    /// Refuse the plan when it is too large or would strip a vault bare.
    ///
    /// The change budget is checked first. The principal floor only applies to
    /// vaults the plan removes something from.
    pub fn check_guards(&self, limits: &ReconcileLimits) -> Result<()> {
        let count = self.total_changes();
        if count > limits.max_changes {
            return Err(EngineError::ChangeVolumeExceeded {
                count,
                max: limits.max_changes,
            });
        }
        for vault in &self.vaults {
            if vault.count(OperationKind::Remove) == 0 {
                continue;
            }
            let remaining = vault.remaining_principals();
            if remaining < limits.min_principals_per_vault {
                return Err(EngineError::MinimumPrincipalFloor {
                    vault: vault.vault.to_string(),
                    remaining,
                    minimum: limits.min_principals_per_vault,
                });
            }
        }
        Ok(())
    }
}

/// Safety limits checked before anything is written.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconcileLimits {
    pub max_changes: usize,
    pub min_principals_per_vault: usize,
}

impl Default for ReconcileLimits {
    fn default() -> Self {
        Self::from(&ReconcileConfig::default())
    }
}

impl From<&ReconcileConfig> for ReconcileLimits {
    fn from(config: &ReconcileConfig) -> Self {
        Self {
            max_changes: config.max_changes,
            min_principals_per_vault: config.min_principals_per_vault,
        }
    }
}

/// Compare live and desired state.
///
/// Pure: the result depends only on the two models, not on the order of
/// policies inside a vault.
pub fn diff(live: &VaultModel, desired: &VaultModel) -> ReconcilePlan {
    let mut plan = ReconcilePlan::default();

    for wanted in desired.iter() {
        let Some(current) = live.get(&wanted.id) else {
            debug!(vault = %wanted.id, "desired vault not present live");
            plan.skipped_vaults.push(wanted.id.clone());
            continue;
        };

        let mut claimed = vec![false; current.policies.len()];
        let mut adds = Vec::new();
        let mut modifies = Vec::new();

        for desired_policy in &wanted.policies {
            let matched = current.policies.iter().enumerate().find(|(index, live_policy)| {
                !claimed[*index] && live_policy.principal.same_identity(&desired_policy.principal)
            });
            match matched {
                Some((index, live_policy)) => {
                    claimed[index] = true;
                    let changed = live_policy
                        .permissions
                        .changed_categories(&desired_policy.permissions);
                    if !changed.is_empty() {
                        modifies.push(modify(&wanted.id, live_policy, desired_policy, changed));
                    }
                }
                None => adds.push(PolicyOperation {
                    kind: OperationKind::Add,
                    vault: wanted.id.clone(),
                    principal: desired_policy.principal.clone(),
                    before: None,
                    after: Some(desired_policy.permissions.clone()),
                    changed: Vec::new(),
                }),
            }
        }

        let mut removes = Vec::new();
        for (live_policy, _) in current
            .policies
            .iter()
            .zip(&claimed)
            .filter(|(_, claimed)| !**claimed)
        {
            plan.removals.push(RemovalRecord {
                vault: wanted.id.clone(),
                principal: live_policy.principal.clone(),
                permissions: live_policy.permissions.clone(),
            });
            removes.push(PolicyOperation {
                kind: OperationKind::Remove,
                vault: wanted.id.clone(),
                principal: live_policy.principal.clone(),
                before: Some(live_policy.permissions.clone()),
                after: None,
                changed: Vec::new(),
            });
        }

        let operations: Vec<PolicyOperation> =
            adds.into_iter().chain(modifies).chain(removes).collect();
        if operations.is_empty() {
            continue;
        }
        plan.vaults.push(VaultPlan {
            vault: wanted.id.clone(),
            live_principals: current.policies.len(),
            operations,
        });
    }

    for current in live.iter() {
        if !desired.contains(&current.id) {
            info!(vault = %current.id, "vault not in desired state; left untouched");
            plan.unmanaged_vaults.push(current.id.clone());
        }
    }

    plan
}

fn modify(
    vault: &VaultId,
    live: &AccessPolicy,
    desired: &AccessPolicy,
    changed: Vec<PermissionCategory>,
) -> PolicyOperation {
    PolicyOperation {
        kind: OperationKind::Modify,
        vault: vault.clone(),
        // Keep the live object id; the desired side is authored by name.
        principal: live.principal.clone(),
        before: Some(live.permissions.clone()),
        after: Some(desired.permissions.clone()),
        changed,
    }
}
