//! ---
//! kvr_section: "15-testing-qa-runbook"
//! kvr_subsection: "module"
//! kvr_type: "source"
//! kvr_scope: "code"
//! kvr_description: "End-to-end checks of the kvrctl binary against a cloud snapshot."
//! kvr_version: "v0.0.0-prealpha"
//! kvr_owner: "tbd"
//! ---
use std::fs;
use std::path::{Path, PathBuf};

use assert_cmd::Command;
use predicates::prelude::*;
use tempfile::{tempdir, TempDir};

const CLOUD: &str = r#"{
  "vaults": [
    {
      "subscription_id": "sub-1",
      "resource_group": "rg-app",
      "name": "kv-app",
      "location": "westeurope",
      "tenant_id": "tenant",
      "access_policies": [
        { "object_id": "p-1", "permissions": { "keys": ["get"] } },
        { "object_id": "q-1", "permissions": { "keys": ["get", "list"] } }
      ]
    }
  ],
  "directory": {
    "users": [
      { "object_id": "p-1", "display_name": "Pat", "user_principal_name": "pat@contoso.com" },
      { "object_id": "q-1", "display_name": "Quinn", "user_principal_name": "quinn@contoso.com" }
    ],
    "groups": [
      { "object_id": "g-1", "display_name": "Ops", "mail": "ops@contoso.com" }
    ]
  },
  "role_assignments": [
    { "scope": "/subscriptions/sub-1/resourceGroups/rg-app", "role_definition_id": "f25e0fa2-a7c8-4377-a976-54943a77a395" }
  ]
}"#;

const DESIRED: &str = r#"
- VaultName: kv-app
  ResourceGroupName: rg-app
  SubscriptionId: sub-1
  AccessPolicies:
    - Type: User
      DisplayName: Pat
      Alias: pat@contoso.com
      PermissionsToKeys: [read]
    - Type: Group
      DisplayName: Ops
      Alias: ops@contoso.com
      PermissionsToSecrets: [read]
"#;

struct Workspace {
    dir: TempDir,
}

impl Workspace {
    fn new() -> Self {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("cloud.json"), CLOUD).unwrap();
        fs::write(dir.path().join("desired.yaml"), DESIRED).unwrap();
        Self { dir }
    }

    fn path(&self, name: &str) -> PathBuf {
        self.dir.path().join(name)
    }

    fn out(&self) -> PathBuf {
        self.path("out")
    }

    fn kvrctl(&self) -> Command {
        let mut cmd = Command::cargo_bin("kvrctl").unwrap();
        cmd.current_dir(self.dir.path())
            .env_remove("KVR_CONFIG")
            .env_remove("KVR_CLOUD_FIXTURE")
            .env("KVR_LOG", "warn")
            .arg("--cloud")
            .arg(self.path("cloud.json"))
            .arg("--output-dir")
            .arg(self.out());
        cmd
    }
}

fn read_json(path: &Path) -> serde_json::Value {
    serde_json::from_str(&fs::read_to_string(path).unwrap()).unwrap()
}

#[test]
fn check_reports_authorised_scopes() {
    let ws = Workspace::new();
    ws.kvrctl()
        .args(["check", "--desired", "desired.yaml"])
        .assert()
        .success()
        .stdout(predicate::str::contains("access confirmed: 1 scope(s) authorised"));
}

#[test]
fn check_fails_when_roles_are_required_but_absent() {
    let ws = Workspace::new();
    fs::write(
        ws.path("kvr.toml"),
        "[authorization]\nrequired_role_definitions = [\"00000000-0000-0000-0000-000000000000\"]\n",
    )
    .unwrap();
    ws.kvrctl()
        .args(["check", "--desired", "desired.yaml"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("insufficient access"));
}

#[test]
fn plan_writes_reports_without_touching_the_cloud() {
    let ws = Workspace::new();
    ws.kvrctl()
        .args(["plan", "--desired", "desired.yaml"])
        .assert()
        .success()
        .stdout(predicate::str::contains("plan: 1 add, 1 modify, 1 remove"))
        .stdout(predicate::str::contains("guards: passed"));

    let removals = read_json(&ws.out().join("removals.json"));
    assert_eq!(removals["data"][0]["principal"]["display_name"], "Quinn");
    assert!(ws.out().join("plan.json").exists());
    assert_eq!(fs::read_to_string(ws.path("cloud.json")).unwrap(), CLOUD);
}

#[test]
fn apply_with_write_back_converges() {
    let ws = Workspace::new();
    ws.kvrctl()
        .args(["apply", "--desired", "desired.yaml", "--write-back"])
        .assert()
        .success()
        .stdout(predicate::str::contains("applied 3 operation(s), 0 failed"));

    let audit = fs::read_to_string(ws.out().join("audit.log")).unwrap();
    assert_eq!(audit.lines().count(), 1);
    assert!(audit.contains("policy.revoke"));

    ws.kvrctl()
        .args(["plan", "--desired", "desired.yaml"])
        .assert()
        .success()
        .stdout(predicate::str::contains("plan: 0 add, 0 modify, 0 remove"));
}

#[test]
fn apply_refuses_oversized_plans() {
    let ws = Workspace::new();
    ws.kvrctl()
        .args(["apply", "--desired", "desired.yaml", "--max-changes", "2"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("above the configured maximum of 2"));
    assert!(!ws.out().join("audit.log").exists());
}

#[test]
fn export_round_trips_through_plan() {
    let ws = Workspace::new();
    ws.kvrctl()
        .args(["export", "--scope", "sub-1/rg-app", "--out", "live.yaml"])
        .assert()
        .success()
        .stdout(predicate::str::contains("exported 1 vault(s)"));

    ws.kvrctl()
        .args(["plan", "--desired", "live.yaml"])
        .assert()
        .success()
        .stdout(predicate::str::contains("plan: 0 add, 0 modify, 0 remove"));
}

#[test]
fn unknown_permission_tokens_are_fatal() {
    let ws = Workspace::new();
    fs::write(
        ws.path("bad.yaml"),
        DESIRED.replace("PermissionsToSecrets: [read]", "PermissionsToSecrets: [sign]"),
    )
    .unwrap();
    ws.kvrctl()
        .args(["plan", "--desired", "bad.yaml"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("unknown secrets permission token 'sign'"))
        .stderr(predicate::str::contains("shorthands: all, read, storage, write"));
}

#[test]
fn missing_cloud_snapshot_is_reported() {
    Command::cargo_bin("kvrctl")
        .unwrap()
        .env_remove("KVR_CLOUD_FIXTURE")
        .env_remove("KVR_CONFIG")
        .args(["check", "--desired", "desired.yaml"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("no cloud snapshot given"));
}
