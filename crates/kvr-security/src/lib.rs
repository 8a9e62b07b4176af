//! ---
//! kvr_section: "06-security-access-control"
//! kvr_subsection: "module"
//! kvr_type: "source"
//! kvr_scope: "code"
//! kvr_description: "Permission vocabularies, principal identity and scope authorisation."
//! kvr_version: "v0.0.0-prealpha"
//! kvr_owner: "tbd"
//! ---
#![warn(missing_docs)]

pub mod audit;
pub mod identity;
pub mod permissions;
pub mod scope;

pub use audit::{AuditEntry, AuditLog, AuditRecord};
pub use identity::{
    names_match, DirectoryError, DirectoryRecord, DirectorySnapshot, InMemoryDirectory,
    PrincipalLookup, PrincipalResolver, PrincipalType, ResolvedPrincipal,
};
pub use permissions::{
    categories, PermissionCategory, PermissionError, PermissionSet, ShorthandTable,
};
pub use scope::{
    resource_group_path, subscription_path, vault_path, AssignmentPolicy, AuthorizationError,
    MissingScope, ProviderError, RoleAssignment, RoleAssignmentLookup, ScopeCheckReport,
    ScopeChecker, ScopeRequest, SelectorError,
};
