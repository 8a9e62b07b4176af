//! ---
//! kvr_section: "08-reconciliation-engine"
//! kvr_subsection: "module"
//! kvr_type: "source"
//! kvr_scope: "code"
//! kvr_description: "Live-state collection, diffing and application of vault access policies."
//! kvr_version: "v0.0.0-prealpha"
//! kvr_owner: "tbd"
//! ---
use std::{fs, path::Path};

use kvr_security::{PrincipalType, ScopeRequest, ShorthandTable};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::{
    errors::{EngineError, Result},
    model::{AccessPolicy, PermissionSets, PrincipalIdentity, Vault, VaultId, VaultModel},
};

/// One vault as authored in a desired-state document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct VaultDocument {
    pub vault_name: String,
    pub resource_group_name: String,
    pub subscription_id: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub location: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub tenant_id: String,
    #[serde(default)]
    pub access_policies: Vec<PolicyDocument>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct PolicyDocument {
    #[serde(rename = "Type", default)]
    pub kind: PrincipalType,
    pub display_name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub alias: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub permissions_to_keys: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub permissions_to_secrets: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub permissions_to_certificates: Option<Vec<String>>,
}

impl VaultDocument {
    pub fn vault_id(&self) -> VaultId {
        VaultId::new(
            &self.subscription_id,
            &self.resource_group_name,
            &self.vault_name,
        )
    }
}

impl PolicyDocument {
    fn principal(&self) -> PrincipalIdentity {
        PrincipalIdentity::named(self.kind, self.display_name.trim(), self.alias.trim())
    }
}

/// Load a desired-state document. JSON when it opens with `[` or `{`, YAML otherwise.
pub fn load_documents_from_file(path: impl AsRef<Path>) -> Result<Vec<VaultDocument>> {
    let path = path.as_ref();
    let data = fs::read_to_string(path)?;
    parse_documents(&data).map_err(|err| match err {
        EngineError::Configuration(message) => {
            EngineError::Configuration(format!("{}: {message}", path.display()))
        }
        other => other,
    })
}

/// Parse a desired-state document, reporting the failing field path on error.
///
/// JSON may hold a single vault object or a list; YAML must be a list.
pub fn parse_documents(data: &str) -> Result<Vec<VaultDocument>> {
    let trimmed = data.trim_start();
    if trimmed.starts_with('{') {
        let mut de = serde_json::Deserializer::from_str(data);
        let document: VaultDocument = serde_path_to_error::deserialize(&mut de).map_err(describe)?;
        Ok(vec![document])
    } else if trimmed.starts_with('[') {
        let mut de = serde_json::Deserializer::from_str(data);
        serde_path_to_error::deserialize(&mut de).map_err(describe)
    } else {
        serde_path_to_error::deserialize(serde_yaml::Deserializer::from_str(data))
            .map_err(describe)
    }
}

fn describe<E: std::fmt::Display>(err: serde_path_to_error::Error<E>) -> EngineError {
    EngineError::Configuration(format!("{} at `{}`", err.inner(), err.path()))
}

/// Structural checks that must pass before any provider call is made.
pub fn validate_documents(documents: &[VaultDocument]) -> Result<()> {
    let mut problems = Vec::new();
    let mut seen: Vec<VaultId> = Vec::new();

    for (index, document) in documents.iter().enumerate() {
        let label = format!("vault[{index}]");
        for (field, value) in [
            ("VaultName", &document.vault_name),
            ("ResourceGroupName", &document.resource_group_name),
            ("SubscriptionId", &document.subscription_id),
        ] {
            if value.trim().is_empty() {
                problems.push(format!("{label}: {field} must not be empty"));
            }
        }

        let id = document.vault_id();
        if seen.contains(&id) {
            problems.push(format!("{label}: vault {id} is declared more than once"));
        } else {
            seen.push(id.clone());
        }

        let mut principals: Vec<PrincipalIdentity> = Vec::new();
        for (policy_index, policy) in document.access_policies.iter().enumerate() {
            let policy_label = format!("{id} policy[{policy_index}]");
            if policy.display_name.trim().is_empty() {
                problems.push(format!("{policy_label}: DisplayName must not be empty"));
                continue;
            }
            if policy.kind == PrincipalType::Unknown {
                problems.push(format!(
                    "{policy_label}: Type must be User, Group, App or ServicePrincipal"
                ));
            }
            if policy.kind.has_alias() && policy.alias.trim().is_empty() {
                problems.push(format!(
                    "{policy_label}: {} '{}' requires an Alias",
                    policy.kind, policy.display_name
                ));
            }
            let principal = policy.principal();
            if principals.iter().any(|p| p.same_identity(&principal)) {
                problems.push(format!(
                    "{policy_label}: principal '{}' appears more than once",
                    principal.label()
                ));
            } else {
                principals.push(principal);
            }
        }
    }

    if problems.is_empty() {
        Ok(())
    } else {
        Err(EngineError::Configuration(problems.join("; ")))
    }
}

/// Validate and normalise documents into the desired model.
pub fn desired_model(documents: &[VaultDocument], table: &ShorthandTable) -> Result<VaultModel> {
    validate_documents(documents)?;
    let mut model = VaultModel::new();
    for document in documents {
        let id = document.vault_id();
        let mut vault = Vault::new(id.clone());
        vault.location = document.location.clone();
        vault.tenant_id = document.tenant_id.clone();
        for policy in &document.access_policies {
            let principal = policy.principal();
            let permissions = PermissionSets::normalize(
                table,
                policy.permissions_to_keys.as_deref(),
                policy.permissions_to_secrets.as_deref(),
                policy.permissions_to_certificates.as_deref(),
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
        model.insert(vault);
    }
    Ok(model)
}

/// Scopes the documents touch, down to individual vaults.
pub fn scope_request(documents: &[VaultDocument]) -> ScopeRequest {
    let mut request = ScopeRequest::new();
    for document in documents {
        request.add_vault(
            &document.subscription_id,
            &document.resource_group_name,
            &document.vault_name,
        );
    }
    request
}

/// Render a model in the desired-state document shape (used by `export`).
///
/// Principals the directory could not resolve have no name to author them by
/// and are left out.
pub fn to_documents(model: &VaultModel) -> Vec<VaultDocument> {
    model
        .iter()
        .map(|vault| VaultDocument {
            vault_name: vault.id.vault_name.clone(),
            resource_group_name: vault.id.resource_group.clone(),
            subscription_id: vault.id.subscription_id.clone(),
            location: vault.location.clone(),
            tenant_id: vault.tenant_id.clone(),
            access_policies: vault
                .policies
                .iter()
                .filter(|policy| {
                    let resolved = policy.principal.kind != PrincipalType::Unknown
                        && !policy.principal.display_name.is_empty();
                    if !resolved {
                        warn!(
                            vault = %vault.id,
                            object_id = policy.principal.object_id.as_deref().unwrap_or_default(),
                            "unresolved principal left out of export"
                        );
                    }
                    resolved
                })
                .map(|policy| {
                    let [keys, secrets, certificates] = policy.permissions.to_lists();
                    let non_empty = |list: Vec<String>| (!list.is_empty()).then_some(list);
                    PolicyDocument {
                        kind: policy.principal.kind,
                        display_name: policy.principal.display_name.clone(),
                        alias: policy.principal.alias.clone(),
                        permissions_to_keys: non_empty(keys),
                        permissions_to_secrets: non_empty(secrets),
                        permissions_to_certificates: non_empty(certificates),
                    }
                })
                .collect(),
        })
        .collect()
}

/// Write documents as YAML when the extension says so, JSON otherwise.
pub fn write_documents(path: impl AsRef<Path>, documents: &[VaultDocument]) -> Result<()> {
    let path = path.as_ref();
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }
    let is_yaml = matches!(
        path.extension().and_then(|ext| ext.to_str()),
        Some("yaml" | "yml")
    );
    let rendered = if is_yaml {
        serde_yaml::to_string(documents)?
    } else {
        serde_json::to_string_pretty(documents)?
    };
    fs::write(path, rendered)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const YAML: &str = r#"
- VaultName: kv-app
  ResourceGroupName: rg-app
  SubscriptionId: sub-1
  AccessPolicies:
    - Type: User
      DisplayName: Alice
      Alias: alice@contoso.com
      PermissionsToKeys: [read]
    - Type: Application
      DisplayName: deploy-bot
      PermissionsToSecrets: [" Get ", all]
"#;

    #[test]
    fn yaml_documents_normalise_into_the_desired_model() {
        let documents = parse_documents(YAML).unwrap();
        let model = desired_model(&documents, &ShorthandTable::standard()).unwrap();
        let vault = model
            .get(&VaultId::new("sub-1", "rg-app", "kv-app"))
            .unwrap();
        assert_eq!(vault.policies.len(), 2);
        assert_eq!(
            vault.policies[0].permissions.keys.iter().collect::<Vec<_>>(),
            vec!["get", "list"]
        );
        assert_eq!(vault.policies[1].principal.kind, PrincipalType::App);
        assert_eq!(vault.policies[1].permissions.secrets.len(), 8);
    }

    #[test]
    fn single_json_object_is_accepted() {
        let documents = parse_documents(
            r#"{"VaultName":"kv","ResourceGroupName":"rg","SubscriptionId":"s"}"#,
        )
        .unwrap();
        assert_eq!(documents.len(), 1);
        assert!(documents[0].access_policies.is_empty());
    }

    #[test]
    fn parse_errors_name_the_field() {
        let err = parse_documents(r#"[{"VaultName": 4}]"#).unwrap_err();
        assert!(
            matches!(err, EngineError::Configuration(ref msg) if msg.contains("VaultName")),
            "{err}"
        );
    }

    #[test]
    fn users_without_alias_are_rejected() {
        let documents = parse_documents(
            r#"[{"VaultName":"kv","ResourceGroupName":"rg","SubscriptionId":"s",
                 "AccessPolicies":[{"Type":"User","DisplayName":"Alice"}]}]"#,
        )
        .unwrap();
        let err = validate_documents(&documents).unwrap_err();
        assert!(matches!(err, EngineError::Configuration(ref msg) if msg.contains("Alias")));
    }

    #[test]
    fn duplicate_vaults_and_principals_are_rejected() {
        let documents = parse_documents(
            r#"[{"VaultName":"kv","ResourceGroupName":"rg","SubscriptionId":"s",
                 "AccessPolicies":[
                   {"Type":"App","DisplayName":"bot"},
                   {"Type":"App","DisplayName":"BOT"}]},
                {"VaultName":"KV","ResourceGroupName":"rg","SubscriptionId":"s"}]"#,
        )
        .unwrap();
        let EngineError::Configuration(message) = validate_documents(&documents).unwrap_err()
        else {
            panic!("expected configuration error");
        };
        assert!(message.contains("more than once"));
        assert_eq!(message.matches("more than once").count(), 2);
    }

    #[test]
    fn unknown_tokens_carry_vault_and_principal() {
        let documents = parse_documents(
            r#"[{"VaultName":"kv","ResourceGroupName":"rg","SubscriptionId":"s",
                 "AccessPolicies":[{"Type":"App","DisplayName":"bot",
                   "PermissionsToSecrets":["sign"]}]}]"#,
        )
        .unwrap();
        let err = desired_model(&documents, &ShorthandTable::standard()).unwrap_err();
        match err {
            EngineError::UnknownPermissionToken { vault, principal, .. } => {
                assert_eq!(vault, "s/rg/kv");
                assert_eq!(principal, "bot");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn exported_documents_reload() {
        let documents = parse_documents(YAML).unwrap();
        let table = ShorthandTable::standard();
        let model = desired_model(&documents, &table).unwrap();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("export.yaml");
        write_documents(&path, &to_documents(&model)).unwrap();
        let reloaded = desired_model(&load_documents_from_file(&path).unwrap(), &table).unwrap();
        assert_eq!(reloaded, model);
    }

    #[test]
    fn export_leaves_out_unresolved_principals() {
        let documents = parse_documents(YAML).unwrap();
        let table = ShorthandTable::standard();
        let mut model = desired_model(&documents, &table).unwrap();
        let id = VaultId::new("sub-1", "rg-app", "kv-app");
        let mut vault = model.get(&id).unwrap().clone();
        vault.policies.push(AccessPolicy {
            principal: PrincipalIdentity {
                object_id: Some("deleted-user".into()),
                ..PrincipalIdentity::default()
            },
            permissions: PermissionSets::default(),
        });
        model.insert(vault);

        let exported = to_documents(&model);
        assert_eq!(exported[0].access_policies.len(), 2);
        validate_documents(&exported).unwrap();
        let reloaded = desired_model(&exported, &table).unwrap();
        assert_eq!(reloaded.get(&id).unwrap().policies.len(), 2);
    }
}
