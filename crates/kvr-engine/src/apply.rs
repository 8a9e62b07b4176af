//! ---
//! kvr_section: "08-reconciliation-engine"
//! kvr_subsection: "module"
//! kvr_type: "source"
//! kvr_scope: "code"
//! kvr_description: "Live-state collection, diffing and application of vault access policies."
//! kvr_version: "v0.0.0-prealpha"
//! kvr_owner: "tbd"
//! ---
use kvr_logging::{kvr_info, kvr_warn, LogContext};
use kvr_security::{PrincipalResolver, ProviderError};
use serde::{Deserialize, Serialize};

use crate::{
    diff::{OperationKind, PolicyOperation, ReconcilePlan, RemovalRecord},
    metrics::ReconcileMetrics,
    model::{PermissionSets, VaultId},
};

/// Write side of the vault API.
pub trait PolicyWriter {
    /// Create or replace the grant for `object_id`.
    fn set_policy(
        &self,
        vault: &VaultId,
        object_id: &str,
        permissions: &PermissionSets,
    ) -> Result<(), ProviderError>;

    /// Delete the grant for `object_id`.
    fn revoke_policy(&self, vault: &VaultId, object_id: &str) -> Result<(), ProviderError>;
}

/// A single operation that could not be applied.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApplyFailure {
    pub kind: OperationKind,
    pub vault: VaultId,
    pub principal: String,
    pub message: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApplyReport {
    /// Operations that completed.
    pub applied: Vec<PolicyOperation>,
    /// Removals that completed, with the permissions they revoked.
    pub removals: Vec<RemovalRecord>,
    pub failures: Vec<ApplyFailure>,
}

impl ApplyReport {
    pub fn succeeded(&self) -> bool {
        self.failures.is_empty()
    }
}

/// Pushes a guarded plan to a [`PolicyWriter`], one operation at a time.
///
/// A failed operation is recorded and the queue carries on.
pub struct Applier<'a> {
    writer: &'a dyn PolicyWriter,
    resolver: &'a PrincipalResolver,
    metrics: Option<&'a ReconcileMetrics>,
}

impl<'a> Applier<'a> {
    pub fn new(writer: &'a dyn PolicyWriter, resolver: &'a PrincipalResolver) -> Self {
        Self {
            writer,
            resolver,
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: &'a ReconcileMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn apply(&self, plan: &ReconcilePlan) -> ApplyReport {
        let mut report = ApplyReport::default();

        for operation in plan.operations() {
            let context = LogContext::new()
                .with_subscription(&operation.vault.subscription_id)
                .with_resource_group(&operation.vault.resource_group)
                .with_vault(&operation.vault.vault_name)
                .with_principal(operation.principal.label());

            match self.apply_one(operation) {
                Ok(()) => {
                    kvr_info!(context = context, "{} applied", operation.kind);
                    if operation.kind == OperationKind::Remove {
                        report.removals.push(RemovalRecord {
                            vault: operation.vault.clone(),
                            principal: operation.principal.clone(),
                            permissions: operation.before.clone().unwrap_or_default(),
                        });
                    }
                    report.applied.push(operation.clone());
                    if let Some(metrics) = self.metrics {
                        metrics.inc_applied();
                    }
                }
                Err(message) => {
                    kvr_warn!(context = context, "{} failed: {}", operation.kind, message);
                    report.failures.push(ApplyFailure {
                        kind: operation.kind,
                        vault: operation.vault.clone(),
                        principal: operation.principal.label().to_owned(),
                        message,
                    });
                    if let Some(metrics) = self.metrics {
                        metrics.inc_failed();
                    }
                }
            }
        }

        report
    }

    fn apply_one(&self, operation: &PolicyOperation) -> Result<(), String> {
        let object_id = match operation.kind {
            OperationKind::Add => self.lookup_object_id(operation)?,
            OperationKind::Modify | OperationKind::Remove => operation
                .principal
                .object_id
                .clone()
                .ok_or_else(|| "live policy carries no object id".to_owned())?,
        };

        let result = match (&operation.kind, &operation.after) {
            (OperationKind::Remove, _) => self.writer.revoke_policy(&operation.vault, &object_id),
            (_, Some(after)) => self.writer.set_policy(&operation.vault, &object_id, after),
            (_, None) => return Err("operation carries no target permissions".to_owned()),
        };
        result.map_err(|err| err.to_string())
    }

    fn lookup_object_id(&self, operation: &PolicyOperation) -> Result<String, String> {
        let principal = &operation.principal;
        match self
            .resolver
            .object_id_for(principal.kind, &principal.display_name, &principal.alias)
        {
            Ok(Some(object_id)) => Ok(object_id),
            Ok(None) => Err(format!(
                "{} '{}' not found in directory",
                principal.kind,
                principal.label()
            )),
            Err(err) => Err(err.to_string()),
        }
    }
}
