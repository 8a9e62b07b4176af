//! ---
//! kvr_section: "08-reconciliation-engine"
//! kvr_subsection: "module"
//! kvr_type: "source"
//! kvr_scope: "code"
//! kvr_description: "Live-state collection, diffing and application of vault access policies."
//! kvr_version: "v0.0.0-prealpha"
//! kvr_owner: "tbd"
//! ---
pub mod apply;
pub mod diff;
pub mod errors;
pub mod fixture;
pub mod inventory;
pub mod io;
pub mod metrics;
pub mod model;
pub mod reports;

use kvr_logging::{log_system_event, SystemEventOutcome};
use kvr_security::{
    AssignmentPolicy, AuditLog, MissingScope, PrincipalResolver, RoleAssignmentLookup,
    ScopeCheckReport, ScopeChecker, ScopeRequest, ShorthandTable,
};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::{
    apply::{Applier, ApplyReport, PolicyWriter},
    diff::{diff, ReconcileLimits, ReconcilePlan},
    inventory::{Collection, InventoryCollector, VaultInventory},
    io::VaultDocument,
    metrics::ReconcileMetrics,
};

pub use errors::{EngineError, Result};

/// Everything `plan` produced, ready to be exported or applied.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PlanOutcome {
    pub run_id: String,
    pub access: ScopeCheckReport,
    /// Scopes skipped during collection because they no longer exist.
    pub missing: Vec<MissingScope>,
    pub plan: ReconcilePlan,
}

/// Drives check → collect → diff → guard → apply against one cloud.
pub struct Reconciler<'a, C> {
    cloud: &'a C,
    resolver: &'a PrincipalResolver,
    table: &'a ShorthandTable,
    policy: AssignmentPolicy,
    limits: ReconcileLimits,
    metrics: Option<&'a ReconcileMetrics>,
    run_id: String,
}

impl<'a, C> Reconciler<'a, C>
where
    C: VaultInventory + RoleAssignmentLookup + PolicyWriter,
{
    pub fn new(cloud: &'a C, resolver: &'a PrincipalResolver, table: &'a ShorthandTable) -> Self {
        Self {
            cloud,
            resolver,
            table,
            policy: AssignmentPolicy::default(),
            limits: ReconcileLimits::default(),
            metrics: None,
            run_id: uuid::Uuid::new_v4().to_string(),
        }
    }

    pub fn with_policy(mut self, policy: AssignmentPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_limits(mut self, limits: ReconcileLimits) -> Self {
        self.limits = limits;
        self
    }

    pub fn with_metrics(mut self, metrics: &'a ReconcileMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn with_run_id(mut self, run_id: impl Into<String>) -> Self {
        self.run_id = run_id.into();
        self
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    /// Authorisation cascade; every insufficient scope is reported at once.
    pub fn check_access(&self, request: &ScopeRequest) -> Result<ScopeCheckReport> {
        let report = ScopeChecker::with_policy(self.cloud, self.policy.clone()).check(request)?;
        match report.into_result() {
            Ok(report) => {
                log_system_event(
                    None,
                    "reconcile.check",
                    &format!(
                        "access confirmed at {} scope(s) with {} queries",
                        report.authorized.len(),
                        report.queries
                    ),
                    SystemEventOutcome::Success,
                );
                Ok(report)
            }
            Err(err) => {
                log_system_event(
                    None,
                    "reconcile.check",
                    &err.to_string(),
                    SystemEventOutcome::Fault,
                );
                Err(err.into())
            }
        }
    }

    pub fn collect(&self, request: &ScopeRequest) -> Result<Collection> {
        let collection =
            InventoryCollector::new(self.cloud, self.resolver, self.table).collect(request)?;
        if let Some(metrics) = self.metrics {
            metrics.add_collected(collection.model.len());
        }
        Ok(collection)
    }

    /// Live state for `request`, rendered as desired-state documents.
    pub fn export(&self, request: &ScopeRequest) -> Result<Vec<VaultDocument>> {
        self.check_access(request)?;
        let collection = self.collect(request)?;
        Ok(io::to_documents(&collection.model))
    }

    /// Validate the desired documents, then check, collect and diff.
    pub fn plan(&self, documents: &[VaultDocument]) -> Result<PlanOutcome> {
        let desired = io::desired_model(documents, self.table)?;
        let request = io::scope_request(documents);
        let access = self.check_access(&request)?;
        let collection = self.collect(&request)?;
        let plan = diff(&collection.model, &desired);

        let counts = plan.counts();
        if let Some(metrics) = self.metrics {
            metrics.record_plan(&counts);
        }
        let outcome = if collection.missing.is_empty() {
            SystemEventOutcome::Success
        } else {
            SystemEventOutcome::Degraded
        };
        log_system_event(
            None,
            "reconcile.plan",
            &format!(
                "{} add, {} modify, {} remove across {} vault(s); {} scope(s) missing",
                counts.add,
                counts.modify,
                counts.remove,
                plan.vaults.len(),
                collection.missing.len()
            ),
            outcome,
        );

        Ok(PlanOutcome {
            run_id: self.run_id.clone(),
            access,
            missing: collection.missing,
            plan,
        })
    }

    /// Guard the plan, push it, and append removals and failures to `audit`.
    ///
    /// A guard violation aborts before any write is issued.
    pub fn apply(&self, plan: &ReconcilePlan, audit: Option<&mut AuditLog>) -> Result<ApplyReport> {
        if let Err(err) = plan.check_guards(&self.limits) {
            if let Some(metrics) = self.metrics {
                metrics.inc_guard_rejection();
            }
            log_system_event(
                None,
                "reconcile.apply",
                &err.to_string(),
                SystemEventOutcome::Fault,
            );
            return Err(err);
        }

        let mut applier = Applier::new(self.cloud, self.resolver);
        if let Some(metrics) = self.metrics {
            applier = applier.with_metrics(metrics);
        }
        let report = applier.apply(plan);

        if let Some(log) = audit {
            let written = reports::record_audit(log, &self.run_id, &report)?;
            info!(entries = written, path = %log.path().display(), "audit log updated");
        }

        let outcome = if report.succeeded() {
            SystemEventOutcome::Success
        } else {
            SystemEventOutcome::Degraded
        };
        log_system_event(
            None,
            "reconcile.apply",
            &format!(
                "{} applied, {} failed",
                report.applied.len(),
                report.failures.len()
            ),
            outcome,
        );
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixture::{CloudSnapshot, FixtureCloud};
    use crate::inventory::{RawAccessPolicy, RawPermissions, RawVault};
    use kvr_security::{DirectoryRecord, DirectorySnapshot, RoleAssignment};

    fn cloud(granted_scope: &str) -> FixtureCloud {
        FixtureCloud::from_snapshot(CloudSnapshot {
            vaults: vec![RawVault {
                subscription_id: "s".into(),
                resource_group: "rg".into(),
                name: "kv".into(),
                location: "westeurope".into(),
                tenant_id: "t".into(),
                access_policies: vec![RawAccessPolicy {
                    object_id: "u1".into(),
                    tenant_id: "t".into(),
                    permissions: RawPermissions {
                        secrets: Some(vec!["get".into()]),
                        ..RawPermissions::default()
                    },
                }],
            }],
            directory: DirectorySnapshot {
                users: vec![DirectoryRecord {
                    object_id: "u1".into(),
                    display_name: "Alice".into(),
                    user_principal_name: Some("alice@contoso.com".into()),
                    mail: None,
                }],
                ..DirectorySnapshot::default()
            },
            role_assignments: vec![RoleAssignment {
                id: String::new(),
                scope: granted_scope.into(),
                role_definition_id: "role".into(),
                principal_id: "caller".into(),
            }],
            ..CloudSnapshot::default()
        })
    }

    fn documents() -> Vec<VaultDocument> {
        io::parse_documents(
            r#"[{"VaultName":"kv","ResourceGroupName":"rg","SubscriptionId":"s",
                 "AccessPolicies":[{"Type":"User","DisplayName":"Alice",
                   "Alias":"alice@contoso.com","PermissionsToSecrets":["read"]}]}]"#,
        )
        .unwrap()
    }

    #[test]
    fn plan_modifies_drifted_grant() {
        let cloud = cloud("/subscriptions/s");
        let resolver = cloud.resolver();
        let table = ShorthandTable::standard();
        let outcome = Reconciler::new(&cloud, &resolver, &table)
            .with_run_id("run-1")
            .plan(&documents())
            .unwrap();
        assert_eq!(outcome.run_id, "run-1");
        assert_eq!(outcome.plan.counts().modify, 1);
        assert_eq!(outcome.access.queries, 1);
    }

    #[test]
    fn insufficient_access_aborts_before_collection() {
        let cloud = cloud("/subscriptions/elsewhere");
        let resolver = cloud.resolver();
        let table = ShorthandTable::standard();
        let err = Reconciler::new(&cloud, &resolver, &table)
            .plan(&documents())
            .unwrap_err();
        assert!(matches!(err, EngineError::Authorization(_)));
        assert_eq!(resolver.cached(), 0);
    }

    #[test]
    fn apply_writes_and_is_idempotent() {
        let cloud = cloud("/subscriptions/s");
        let resolver = cloud.resolver();
        let table = ShorthandTable::standard();
        let reconciler = Reconciler::new(&cloud, &resolver, &table);
        let outcome = reconciler.plan(&documents()).unwrap();
        let report = reconciler.apply(&outcome.plan, None).unwrap();
        assert!(report.succeeded());
        assert_eq!(cloud.write_calls().len(), 1);

        let again = reconciler.plan(&documents()).unwrap();
        assert!(again.plan.is_empty());
    }
}
