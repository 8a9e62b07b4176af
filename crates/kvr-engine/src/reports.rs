//! ---
//! kvr_section: "08-reconciliation-engine"
//! kvr_subsection: "module"
//! kvr_type: "source"
//! kvr_scope: "code"
//! kvr_description: "Live-state collection, diffing and application of vault access policies."
//! kvr_version: "v0.0.0-prealpha"
//! kvr_owner: "tbd"
//! ---
use std::{
    fs,
    path::{Path, PathBuf},
};

use chrono::{DateTime, Utc};
use kvr_security::{AuditLog, AuditRecord};
use serde::Serialize;
use serde_json::json;
use tracing::info;

use crate::{
    apply::ApplyReport,
    diff::{ReconcilePlan, RemovalRecord},
    errors::{EngineError, Result},
};

pub const PLAN_FILE: &str = "plan.json";
pub const REMOVALS_FILE: &str = "removals.json";
pub const APPLY_FILE: &str = "apply.json";
pub const AUDIT_FILE: &str = "audit.log";

/// Writes run artefacts into one output directory.
#[derive(Debug)]
pub struct ReportExporter<'a> {
    run_id: &'a str,
    timestamp: DateTime<Utc>,
    output_dir: &'a Path,
}

impl<'a> ReportExporter<'a> {
    pub fn new(run_id: &'a str, output_dir: &'a Path) -> Self {
        Self {
            run_id,
            timestamp: Utc::now(),
            output_dir,
        }
    }

    /// `plan.json` and `removals.json`; the removal list is written even when empty.
    pub fn export_plan(&self, plan: &ReconcilePlan) -> Result<Vec<PathBuf>> {
        let plan_path = self.write(PLAN_FILE, plan_schema(), plan)?;
        let removals_path = self.write(REMOVALS_FILE, removals_schema(), &plan.removals)?;
        info!("Plan exported to {}", self.output_dir.display());
        Ok(vec![plan_path, removals_path])
    }

    pub fn export_apply(&self, report: &ApplyReport) -> Result<PathBuf> {
        let path = self.write(APPLY_FILE, apply_schema(), report)?;
        info!("Apply report exported to {}", path.display());
        Ok(path)
    }

    fn write<T: Serialize>(
        &self,
        file_name: &str,
        schema: serde_json::Value,
        data: &T,
    ) -> Result<PathBuf> {
        if !self.output_dir.exists() {
            fs::create_dir_all(self.output_dir)?;
        }
        let timestamp = self.timestamp.to_rfc3339();
        let envelope = ReportEnvelope {
            timestamp: &timestamp,
            run_id: self.run_id,
            schema,
            data,
        };
        let path = self.output_dir.join(file_name);
        write_json(&path, &envelope)?;
        Ok(path)
    }
}

#[derive(Debug, Serialize)]
struct ReportEnvelope<'a, T: Serialize> {
    timestamp: &'a str,
    run_id: &'a str,
    schema: serde_json::Value,
    data: &'a T,
}

fn write_json<T: Serialize>(path: impl AsRef<Path>, value: &T) -> Result<()> {
    let serialized = serde_json::to_string_pretty(value)?;
    fs::write(path, serialized)?;
    Ok(())
}

/// Append one hash-chained entry per applied removal and per failure.
pub fn record_audit(log: &mut AuditLog, run_id: &str, report: &ApplyReport) -> Result<usize> {
    let mut written = 0;
    for removal in &report.removals {
        log.append(removal_record(run_id, removal))
            .map_err(EngineError::Audit)?;
        written += 1;
    }
    for failure in &report.failures {
        log.append(AuditRecord {
            run_id: run_id.to_owned(),
            action: "policy.apply_failed".into(),
            scope: failure.vault.scope_path(),
            principal: failure.principal.clone(),
            details: json!({ "kind": failure.kind, "message": failure.message }),
        })
        .map_err(EngineError::Audit)?;
        written += 1;
    }
    Ok(written)
}

fn removal_record(run_id: &str, removal: &RemovalRecord) -> AuditRecord {
    AuditRecord {
        run_id: run_id.to_owned(),
        action: "policy.revoke".into(),
        scope: removal.vault.scope_path(),
        principal: removal.principal.label().to_owned(),
        details: json!({
            "object_id": removal.principal.object_id,
            "kind": removal.principal.kind,
            "alias": removal.principal.alias,
            "permissions": removal.permissions,
        }),
    }
}

fn plan_schema() -> serde_json::Value {
    json!({
        "$schema": "https://json-schema.org/draft/2020-12/schema",
        "title": "ReconcilePlan",
        "type": "object",
        "properties": {
            "vaults": {"type": "array"},
            "removals": {"type": "array"},
            "skipped_vaults": {"type": "array"},
            "unmanaged_vaults": {"type": "array"}
        },
        "required": ["vaults", "removals"],
    })
}

fn removals_schema() -> serde_json::Value {
    json!({
        "$schema": "https://json-schema.org/draft/2020-12/schema",
        "title": "Removals",
        "type": "array",
        "items": {
            "type": "object",
            "properties": {
                "vault": {"type": "object"},
                "principal": {"type": "object"},
                "permissions": {"type": "object"}
            },
            "required": ["vault", "principal", "permissions"]
        }
    })
}

fn apply_schema() -> serde_json::Value {
    json!({
        "$schema": "https://json-schema.org/draft/2020-12/schema",
        "title": "ApplyReport",
        "type": "object",
        "properties": {
            "applied": {"type": "array"},
            "removals": {"type": "array"},
            "failures": {"type": "array"}
        },
        "required": ["applied", "removals", "failures"],
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::apply::ApplyFailure;
    use crate::diff::OperationKind;
    use crate::model::{PermissionSets, PrincipalIdentity, VaultId};
    use kvr_security::PrincipalType;
    use tempfile::tempdir;

    fn removal() -> RemovalRecord {
        RemovalRecord {
            vault: VaultId::new("s", "rg", "kv"),
            principal: PrincipalIdentity {
                object_id: Some("q-1".into()),
                ..PrincipalIdentity::named(PrincipalType::User, "Quinn", "quinn@contoso.com")
            },
            permissions: PermissionSets::default(),
        }
    }

    #[test]
    fn plan_export_writes_both_files() {
        let dir = tempdir().unwrap();
        let plan = ReconcilePlan {
            removals: vec![removal()],
            ..ReconcilePlan::default()
        };
        let paths = ReportExporter::new("run-1", dir.path())
            .export_plan(&plan)
            .unwrap();
        assert_eq!(paths.len(), 2);

        let removals: serde_json::Value =
            serde_json::from_str(&fs::read_to_string(dir.path().join(REMOVALS_FILE)).unwrap())
                .unwrap();
        assert_eq!(removals["run_id"], "run-1");
        assert_eq!(removals["data"][0]["principal"]["display_name"], "Quinn");
    }

    #[test]
    fn audit_records_removals_and_failures() {
        let dir = tempdir().unwrap();
        let mut log = AuditLog::new(dir.path().join(AUDIT_FILE)).unwrap();
        let report = ApplyReport {
            applied: Vec::new(),
            removals: vec![removal()],
            failures: vec![ApplyFailure {
                kind: OperationKind::Add,
                vault: VaultId::new("s", "rg", "kv"),
                principal: "bob".into(),
                message: "not found".into(),
            }],
        };
        assert_eq!(record_audit(&mut log, "run-1", &report).unwrap(), 2);
        let entries = log.entries().unwrap();
        assert_eq!(entries[0].record.action, "policy.revoke");
        assert_eq!(entries[0].record.details["object_id"], "q-1");
        assert_eq!(entries[1].record.action, "policy.apply_failed");
        assert!(log.verify().unwrap());
    }
}
