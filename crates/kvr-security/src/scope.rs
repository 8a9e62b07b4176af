//! ---
//! kvr_section: "06-security-access-control"
//! kvr_subsection: "module"
//! kvr_type: "source"
//! kvr_scope: "code"
//! kvr_description: "Permission vocabularies, principal identity and scope authorisation."
//! kvr_version: "v0.0.0-prealpha"
//! kvr_owner: "tbd"
//! ---
use std::collections::BTreeSet;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

/// ARM path of a subscription.
pub fn subscription_path(subscription_id: &str) -> String {
    format!("/subscriptions/{}", subscription_id)
}

/// ARM path of a resource group.
pub fn resource_group_path(subscription_id: &str, resource_group: &str) -> String {
    format!(
        "{}/resourceGroups/{}",
        subscription_path(subscription_id),
        resource_group
    )
}

/// ARM path of a key vault.
pub fn vault_path(subscription_id: &str, resource_group: &str, vault_name: &str) -> String {
    format!(
        "{}/providers/Microsoft.KeyVault/vaults/{}",
        resource_group_path(subscription_id, resource_group),
        vault_name
    )
}

/// Errors raised by cloud-side collaborators (listing, role assignments, writes).
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ProviderError {
    /// Subscription, resource group or vault does not exist.
    #[error("{resource} not found: {message}")]
    NotFound {
        /// Scope path or resource description.
        resource: String,
        /// Original provider message.
        message: String,
    },
    /// Any other provider failure.
    #[error("provider request failed: {0}")]
    Request(String),
}

impl ProviderError {
    /// Whether the error is a per-item "not found" that callers may skip.
    pub fn is_not_found(&self) -> bool {
        matches!(self, ProviderError::NotFound { .. })
    }
}

/// A role assignment held by the caller at some scope.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoleAssignment {
    /// Assignment resource id.
    #[serde(default)]
    pub id: String,
    /// Scope path the assignment was made at.
    pub scope: String,
    /// Role definition id (GUID or full resource id).
    pub role_definition_id: String,
    /// Principal the role is assigned to.
    #[serde(default)]
    pub principal_id: String,
}

/// Lists the caller's role assignments at an exact scope path.
pub trait RoleAssignmentLookup {
    /// Assignments effective at `scope`; empty when the caller holds none.
    fn list_for_scope(&self, scope: &str) -> Result<Vec<RoleAssignment>, ProviderError>;
}

/// Which assignments count as sufficient access.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum AssignmentPolicy {
    /// Any assignment at the scope is sufficient.
    #[default]
    Lenient,
    /// Only assignments of one of these role definitions (matched on the trailing GUID).
    RequireRoles(BTreeSet<String>),
}

impl AssignmentPolicy {
    /// `Lenient` when no ids are given, otherwise `RequireRoles`.
    pub fn from_role_definitions<I, S>(ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let ids: BTreeSet<String> = ids
            .into_iter()
            .map(|id| role_guid(id.as_ref()).to_lowercase())
            .filter(|id| !id.is_empty())
            .collect();
        if ids.is_empty() {
            AssignmentPolicy::Lenient
        } else {
            AssignmentPolicy::RequireRoles(ids)
        }
    }

    /// Whether a single assignment satisfies the policy.
    pub fn accepts(&self, assignment: &RoleAssignment) -> bool {
        match self {
            AssignmentPolicy::Lenient => true,
            AssignmentPolicy::RequireRoles(ids) => {
                ids.contains(&role_guid(&assignment.role_definition_id).to_lowercase())
            }
        }
    }
}

fn role_guid(id: &str) -> &str {
    id.trim().trim_end_matches('/').rsplit('/').next().unwrap_or_default()
}

/// Subscription → resource group → vault tree to authorise or collect.
///
/// An empty resource-group map means every group in the subscription; an
/// empty vault list means every vault in the group.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScopeRequest {
    /// Requested subscriptions in insertion order.
    pub subscriptions: IndexMap<String, IndexMap<String, Vec<String>>>,
}

impl ScopeRequest {
    /// Create an empty request.
    pub fn new() -> Self {
        Self::default()
    }

    /// Request a whole subscription.
    pub fn add_subscription(&mut self, subscription_id: &str) -> &mut Self {
        self.subscriptions
            .entry(subscription_id.to_owned())
            .or_default();
        self
    }

    /// Request a whole resource group.
    pub fn add_resource_group(&mut self, subscription_id: &str, resource_group: &str) -> &mut Self {
        self.subscriptions
            .entry(subscription_id.to_owned())
            .or_default()
            .entry(resource_group.to_owned())
            .or_default();
        self
    }

    /// Request a single vault. Duplicate names are ignored.
    pub fn add_vault(
        &mut self,
        subscription_id: &str,
        resource_group: &str,
        vault_name: &str,
    ) -> &mut Self {
        let vaults = self
            .subscriptions
            .entry(subscription_id.to_owned())
            .or_default()
            .entry(resource_group.to_owned())
            .or_default();
        if !vaults.iter().any(|v| v.eq_ignore_ascii_case(vault_name)) {
            vaults.push(vault_name.to_owned());
        }
        self
    }

    /// Parse `SUB`, `SUB/RG` or `SUB/RG/VAULT` selectors.
    pub fn from_selectors<I, S>(selectors: I) -> Result<Self, SelectorError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut request = Self::new();
        for selector in selectors {
            let selector = selector.as_ref();
            let parts: Vec<&str> = selector
                .trim()
                .trim_matches('/')
                .split('/')
                .map(str::trim)
                .collect();
            let invalid = || SelectorError {
                selector: selector.to_owned(),
            };
            if parts.iter().any(|part| part.is_empty()) {
                return Err(invalid());
            }
            match parts.as_slice() {
                [sub] => request.add_subscription(sub),
                [sub, rg] => request.add_resource_group(sub, rg),
                [sub, rg, vault] => request.add_vault(sub, rg, vault),
                _ => return Err(invalid()),
            };
        }
        Ok(request)
    }

    /// Whether nothing was requested.
    pub fn is_empty(&self) -> bool {
        self.subscriptions.is_empty()
    }
}

/// A selector that is not `SUB`, `SUB/RG` or `SUB/RG/VAULT`.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("invalid scope selector '{selector}'")]
pub struct SelectorError {
    /// The selector as given.
    pub selector: String,
}

/// A scope skipped because the provider reported it missing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MissingScope {
    /// Scope path queried.
    pub scope: String,
    /// Original provider message.
    pub message: String,
}

/// Outcome of the authorisation cascade.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScopeCheckReport {
    /// Scopes at which sufficient access was found.
    pub authorized: Vec<String>,
    /// Scopes lacking access.
    pub insufficient: Vec<String>,
    /// Scopes skipped as not found.
    pub missing: Vec<MissingScope>,
    /// Number of role-assignment queries issued.
    pub queries: usize,
}

impl ScopeCheckReport {
    /// Whether every requested scope is authorised.
    pub fn passed(&self) -> bool {
        self.insufficient.is_empty()
    }

    /// Convert into an error listing every insufficient scope.
    pub fn into_result(self) -> Result<Self, AuthorizationError> {
        if self.passed() {
            Ok(self)
        } else {
            Err(AuthorizationError::InsufficientAccess {
                scopes: self.insufficient,
            })
        }
    }
}

/// Fatal authorisation failure.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum AuthorizationError {
    /// The caller lacks access at one or more scopes.
    #[error("insufficient access at {} scope(s): {}", .scopes.len(), .scopes.join(", "))]
    InsufficientAccess {
        /// Every scope path lacking access.
        scopes: Vec<String>,
    },
    /// The role-assignment collaborator failed outright.
    #[error("role assignment lookup failed: {0}")]
    Provider(#[from] ProviderError),
}

enum Probe {
    Granted,
    Denied,
    Missing,
}

/// Walks a [`ScopeRequest`] from the subscription down and records every scope lacking access.
pub struct ScopeChecker<'a> {
    lookup: &'a dyn RoleAssignmentLookup,
    policy: AssignmentPolicy,
}

impl<'a> ScopeChecker<'a> {
    /// Create a checker with the lenient policy.
    pub fn new(lookup: &'a dyn RoleAssignmentLookup) -> Self {
        Self::with_policy(lookup, AssignmentPolicy::Lenient)
    }

    /// Create a checker with an explicit assignment policy.
    pub fn with_policy(lookup: &'a dyn RoleAssignmentLookup, policy: AssignmentPolicy) -> Self {
        Self { lookup, policy }
    }

    fn probe(&self, scope: &str, report: &mut ScopeCheckReport) -> Result<Probe, ProviderError> {
        report.queries += 1;
        match self.lookup.list_for_scope(scope) {
            Ok(assignments) => {
                if assignments.iter().any(|a| self.policy.accepts(a)) {
                    debug!(scope, "access granted");
                    report.authorized.push(scope.to_owned());
                    Ok(Probe::Granted)
                } else {
                    Ok(Probe::Denied)
                }
            }
            Err(ProviderError::NotFound { message, .. }) => {
                warn!(scope, %message, "scope not found; skipping");
                report.missing.push(MissingScope {
                    scope: scope.to_owned(),
                    message,
                });
                Ok(Probe::Missing)
            }
            Err(err) => Err(err),
        }
    }

    /// Run the cascade. All insufficient scopes are collected before returning.
    pub fn check(&self, request: &ScopeRequest) -> Result<ScopeCheckReport, AuthorizationError> {
        let mut report = ScopeCheckReport::default();

        for (subscription_id, groups) in &request.subscriptions {
            let sub_scope = subscription_path(subscription_id);
            match self.probe(&sub_scope, &mut report)? {
                Probe::Granted | Probe::Missing => continue,
                Probe::Denied => {}
            }
            if groups.is_empty() {
                report.insufficient.push(sub_scope);
                continue;
            }

            for (resource_group, vaults) in groups {
                let group_scope = resource_group_path(subscription_id, resource_group);
                match self.probe(&group_scope, &mut report)? {
                    Probe::Granted | Probe::Missing => continue,
                    Probe::Denied => {}
                }
                // Unlisted vaults cannot be checked one by one.
                if vaults.is_empty() {
                    report.insufficient.push(group_scope);
                    continue;
                }

                for vault_name in vaults {
                    let scope = vault_path(subscription_id, resource_group, vault_name);
                    if let Probe::Denied = self.probe(&scope, &mut report)? {
                        report.insufficient.push(scope);
                    }
                }
            }
        }

        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::collections::HashMap;

    #[derive(Default)]
    struct FakeAssignments {
        by_scope: HashMap<String, Vec<RoleAssignment>>,
        missing: HashMap<String, String>,
        queried: RefCell<Vec<String>>,
    }

    impl FakeAssignments {
        fn grant(&mut self, scope: String, role: &str) {
            self.by_scope
                .entry(scope.clone())
                .or_default()
                .push(RoleAssignment {
                    id: format!("{}/ra", scope),
                    scope,
                    role_definition_id: format!(
                        "/providers/Microsoft.Authorization/roleDefinitions/{}",
                        role
                    ),
                    principal_id: "caller".into(),
                });
        }
    }

    impl RoleAssignmentLookup for FakeAssignments {
        fn list_for_scope(&self, scope: &str) -> Result<Vec<RoleAssignment>, ProviderError> {
            self.queried.borrow_mut().push(scope.to_owned());
            if let Some(message) = self.missing.get(scope) {
                return Err(ProviderError::NotFound {
                    resource: scope.to_owned(),
                    message: message.clone(),
                });
            }
            Ok(self.by_scope.get(scope).cloned().unwrap_or_default())
        }
    }

    fn request() -> ScopeRequest {
        let mut request = ScopeRequest::new();
        request
            .add_vault("sub-1", "rg-a", "kv-1")
            .add_vault("sub-1", "rg-a", "kv-2")
            .add_resource_group("sub-1", "rg-b");
        request
    }

    #[test]
    fn subscription_assignment_authorises_subtree_without_further_queries() {
        let mut fake = FakeAssignments::default();
        fake.grant(subscription_path("sub-1"), "owner");
        let report = ScopeChecker::new(&fake).check(&request()).unwrap();
        assert!(report.passed());
        assert_eq!(report.queries, 1);
        assert_eq!(*fake.queried.borrow(), vec!["/subscriptions/sub-1".to_string()]);
    }

    #[test]
    fn vault_assignment_authorises_only_that_vault() {
        let mut fake = FakeAssignments::default();
        fake.grant(vault_path("sub-1", "rg-a", "kv-1"), "kv-admin");
        let report = ScopeChecker::new(&fake).check(&request()).unwrap();
        assert_eq!(
            report.insufficient,
            vec![
                vault_path("sub-1", "rg-a", "kv-2"),
                resource_group_path("sub-1", "rg-b"),
            ]
        );
        let err = report.into_result().unwrap_err();
        assert!(err.to_string().starts_with("insufficient access at 2 scope(s)"));
    }

    #[test]
    fn group_assignment_skips_vault_queries() {
        let mut fake = FakeAssignments::default();
        fake.grant(resource_group_path("sub-1", "rg-a"), "contributor");
        fake.grant(resource_group_path("sub-1", "rg-b"), "contributor");
        let report = ScopeChecker::new(&fake).check(&request()).unwrap();
        assert!(report.passed());
        assert_eq!(report.queries, 3);
    }

    #[test]
    fn missing_subscription_does_not_abort_siblings() {
        let mut fake = FakeAssignments::default();
        fake.missing.insert(
            subscription_path("sub-gone"),
            "SubscriptionNotFound: The subscription 'sub-gone' could not be found.".into(),
        );
        let mut request = request();
        request.add_vault("sub-gone", "rg", "kv");
        let report = ScopeChecker::new(&fake).check(&request).unwrap();
        assert_eq!(report.missing.len(), 1);
        assert!(report.missing[0].message.starts_with("SubscriptionNotFound"));
        assert_eq!(report.insufficient.len(), 3, "sub-1 siblings still checked");
    }

    #[test]
    fn role_policy_ignores_unlisted_roles() {
        let mut fake = FakeAssignments::default();
        fake.grant(subscription_path("sub-1"), "reader");
        let policy = AssignmentPolicy::from_role_definitions(["/roleDefinitions/KV-ADMIN"]);
        let report = ScopeChecker::with_policy(&fake, policy.clone())
            .check(&request())
            .unwrap();
        assert!(!report.passed());

        fake.grant(vault_path("sub-1", "rg-a", "kv-1"), "kv-admin");
        fake.grant(vault_path("sub-1", "rg-a", "kv-2"), "kv-admin");
        fake.grant(resource_group_path("sub-1", "rg-b"), "kv-admin");
        let report = ScopeChecker::with_policy(&fake, policy).check(&request()).unwrap();
        assert!(report.passed());
    }

    #[test]
    fn whole_subscription_request_is_reported_at_subscription_scope() {
        let fake = FakeAssignments::default();
        let request = ScopeRequest::from_selectors(["sub-9"]).unwrap();
        let report = ScopeChecker::new(&fake).check(&request).unwrap();
        assert_eq!(report.insufficient, vec![subscription_path("sub-9")]);
    }

    #[test]
    fn selectors_parse_every_depth() {
        let request =
            ScopeRequest::from_selectors(["sub-1", "sub-2/rg", "/sub-3/rg/kv/"]).unwrap();
        assert!(request.subscriptions["sub-1"].is_empty());
        assert!(request.subscriptions["sub-2"]["rg"].is_empty());
        assert_eq!(request.subscriptions["sub-3"]["rg"], vec!["kv".to_string()]);
        assert_eq!(
            ScopeRequest::from_selectors(["a/b/c/d"]).unwrap_err(),
            SelectorError {
                selector: "a/b/c/d".into()
            }
        );
        assert!(ScopeRequest::from_selectors(["a//c"]).is_err());
    }
}
