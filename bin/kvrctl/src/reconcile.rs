//! ---
//! kvr_section: "05-networking-external-interfaces"
//! kvr_subsection: "binary"
//! kvr_type: "source"
//! kvr_scope: "code"
//! kvr_description: "Operator CLI driving access-policy reconciliation runs."
//! kvr_version: "v0.0.0-prealpha"
//! kvr_owner: "tbd"
//! ---
use std::path::PathBuf;

use anyhow::{bail, Result};
use clap::Args;
use kvr_engine::{
    diff::{PolicyOperation, ReconcilePlan},
    io::{load_documents_from_file, scope_request},
    model::PermissionSets,
    reports::{ReportExporter, AUDIT_FILE},
};
use kvr_logging::{log_system_event, SystemEventOutcome};
use kvr_security::AuditLog;

use crate::session::Session;

#[derive(Debug, Args)]
pub struct CheckCommand {
    /// Desired-state document (JSON or YAML).
    #[arg(long, value_name = "FILE")]
    desired: PathBuf,
}

#[derive(Debug, Args)]
pub struct PlanCommand {
    /// Desired-state document (JSON or YAML).
    #[arg(long, value_name = "FILE")]
    desired: PathBuf,
}

#[derive(Debug, Args)]
pub struct ApplyCommand {
    /// Desired-state document (JSON or YAML).
    #[arg(long, value_name = "FILE")]
    desired: PathBuf,

    /// Refuse plans with more changes than this (overrides the config file).
    #[arg(long = "max-changes", value_name = "N")]
    max_changes: Option<usize>,

    /// Refuse plans leaving a vault with fewer principals (overrides the config file).
    #[arg(long = "min-principals", value_name = "N")]
    min_principals: Option<usize>,

    /// Persist the updated cloud snapshot back to the --cloud file.
    #[arg(long = "write-back", action = clap::ArgAction::SetTrue)]
    write_back: bool,
}

impl CheckCommand {
    pub fn execute(self, session: &Session) -> Result<()> {
        let documents = load_documents_from_file(&self.desired)?;
        let resolver = session.cloud.resolver();
        let report = session
            .reconciler(&resolver, session.limits())
            .check_access(&scope_request(&documents))?;

        println!(
            "access confirmed: {} scope(s) authorised, {} missing, {} quer{}",
            report.authorized.len(),
            report.missing.len(),
            report.queries,
            if report.queries == 1 { "y" } else { "ies" }
        );
        for missing in &report.missing {
            println!("  missing {}: {}", missing.scope, missing.message);
        }
        Ok(())
    }
}

impl PlanCommand {
    pub fn execute(self, session: &Session) -> Result<()> {
        let documents = load_documents_from_file(&self.desired)?;
        let resolver = session.cloud.resolver();
        let limits = session.limits();
        let reconciler = session.reconciler(&resolver, limits);
        let outcome = reconciler.plan(&documents)?;

        print_plan(&outcome.plan);
        match outcome.plan.check_guards(&limits) {
            Ok(()) => println!("guards: passed"),
            Err(err) => println!("guards: {err}"),
        }
        let written = ReportExporter::new(reconciler.run_id(), session.output_dir())
            .export_plan(&outcome.plan)?;
        for path in written {
            println!("wrote {}", path.display());
        }
        Ok(())
    }
}

impl ApplyCommand {
    pub fn execute(self, session: &Session) -> Result<()> {
        let documents = load_documents_from_file(&self.desired)?;
        let mut limits = session.limits();
        if let Some(max) = self.max_changes {
            limits.max_changes = max;
        }
        if let Some(min) = self.min_principals {
            limits.min_principals_per_vault = min;
        }

        let resolver = session.cloud.resolver();
        let reconciler = session.reconciler(&resolver, limits);
        let outcome = reconciler.plan(&documents)?;
        print_plan(&outcome.plan);

        let exporter = ReportExporter::new(reconciler.run_id(), session.output_dir());
        exporter.export_plan(&outcome.plan)?;

        let mut audit = AuditLog::new(session.output_path(AUDIT_FILE))?;
        let report = reconciler.apply(&outcome.plan, Some(&mut audit))?;
        let report_path = exporter.export_apply(&report)?;

        if self.write_back {
            session.cloud.save(&session.cloud_path)?;
            log_system_event(
                None,
                "reconcile.write_back",
                &format!("snapshot saved to {}", session.cloud_path.display()),
                SystemEventOutcome::Success,
            );
        }

        println!(
            "applied {} operation(s), {} failed; report at {}",
            report.applied.len(),
            report.failures.len(),
            report_path.display()
        );
        for failure in &report.failures {
            println!(
                "  FAILED {} {} {}: {}",
                failure.kind, failure.vault, failure.principal, failure.message
            );
        }
        if !report.succeeded() {
            bail!("{} operation(s) failed", report.failures.len());
        }
        Ok(())
    }
}

fn print_plan(plan: &ReconcilePlan) {
    let counts = plan.counts();
    println!(
        "plan: {} add, {} modify, {} remove across {} vault(s)",
        counts.add,
        counts.modify,
        counts.remove,
        plan.vaults.len()
    );
    for operation in plan.operations() {
        println!("  {}", describe(operation));
    }
    for vault in &plan.skipped_vaults {
        println!("  skipped {vault}: not found");
    }
    for vault in &plan.unmanaged_vaults {
        println!("  unmanaged {vault}: left untouched");
    }
}

fn describe(operation: &PolicyOperation) -> String {
    let target = operation
        .after
        .as_ref()
        .or(operation.before.as_ref())
        .map(summarize)
        .unwrap_or_default();
    format!(
        "{:<6} {} {} [{}]",
        operation.kind.to_string(),
        operation.vault,
        operation.principal.label(),
        target
    )
}

fn summarize(permissions: &PermissionSets) -> String {
    [
        ("keys", &permissions.keys),
        ("secrets", &permissions.secrets),
        ("certificates", &permissions.certificates),
    ]
    .into_iter()
    .filter(|(_, set)| !set.is_empty())
    .map(|(name, set)| {
        format!(
            "{name}: {}",
            set.iter().map(String::as_str).collect::<Vec<_>>().join(",")
        )
    })
    .collect::<Vec<_>>()
    .join("; ")
}
