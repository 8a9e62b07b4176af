//! ---
//! kvr_section: "06-security-access-control"
//! kvr_subsection: "module"
//! kvr_type: "source"
//! kvr_scope: "code"
//! kvr_description: "Permission vocabularies, principal identity and scope authorisation."
//! kvr_version: "v0.0.0-prealpha"
//! kvr_owner: "tbd"
//! ---
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

/// Kind of directory object an access policy is granted to.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    Default,
    Serialize,
    Deserialize,
    strum::Display,
)]
pub enum PrincipalType {
    /// Directory user.
    User,
    /// Security or mail-enabled group.
    Group,
    /// Application registration.
    #[serde(alias = "Application")]
    App,
    /// Service principal (enterprise application, managed identity).
    ServicePrincipal,
    /// No directory lookup matched.
    #[default]
    Unknown,
}

impl PrincipalType {
    /// Users and groups carry an alias (UPN / mail) that takes part in identity matching.
    pub fn has_alias(&self) -> bool {
        matches!(self, PrincipalType::User | PrincipalType::Group)
    }
}

/// Raw record returned by a directory lookup.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirectoryRecord {
    /// Directory object id.
    pub object_id: String,
    /// Display name.
    pub display_name: String,
    /// User principal name (users only).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_principal_name: Option<String>,
    /// Primary mail address (groups only).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mail: Option<String>,
}

/// Errors reported by a directory lookup. The resolver treats them as "no match".
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum DirectoryError {
    /// The directory could not be queried.
    #[error("{kind} directory unavailable: {message}")]
    Unavailable {
        /// Lookup that failed.
        kind: PrincipalType,
        /// Provider message.
        message: String,
    },
}

/// One typed, read-only directory lookup capability.
pub trait PrincipalLookup {
    /// Object kind this lookup answers for.
    fn kind(&self) -> PrincipalType;

    /// Find an object by id; `Ok(None)` when the id is not of this kind.
    fn find(&self, object_id: &str) -> Result<Option<DirectoryRecord>, DirectoryError>;

    /// Find an object by display name and alias, used to place new grants.
    fn search(
        &self,
        display_name: &str,
        alias: &str,
    ) -> Result<Option<DirectoryRecord>, DirectoryError>;
}

/// Fully resolved principal metadata. Always populated, never null.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolvedPrincipal {
    /// Resolved kind (`Unknown` when nothing matched).
    pub kind: PrincipalType,
    /// Display name or empty string.
    pub display_name: String,
    /// UPN for users, mail for groups, empty otherwise.
    pub alias: String,
}

impl ResolvedPrincipal {
    fn from_record(kind: PrincipalType, record: DirectoryRecord) -> Self {
        let alias = match kind {
            PrincipalType::User => record.user_principal_name.unwrap_or_default(),
            PrincipalType::Group => record.mail.unwrap_or_default(),
            _ => String::new(),
        };
        Self {
            kind,
            display_name: record.display_name,
            alias,
        }
    }
}

/// Case-insensitive name comparison using full Unicode lowercase mapping.
pub fn names_match(left: &str, right: &str) -> bool {
    left.chars()
        .flat_map(char::to_lowercase)
        .eq(right.chars().flat_map(char::to_lowercase))
}

fn priority(kind: PrincipalType) -> u8 {
    match kind {
        PrincipalType::User => 0,
        PrincipalType::Group => 1,
        PrincipalType::App => 2,
        PrincipalType::ServicePrincipal => 3,
        PrincipalType::Unknown => u8::MAX,
    }
}

/// Maps opaque object ids to `{kind, display name, alias}`.
///
/// Lookups are tried in the fixed order User, Group, App, ServicePrincipal
/// regardless of the order they were supplied in; the first hit wins. Results
/// are memoised per object id for the lifetime of the resolver.
pub struct PrincipalResolver {
    lookups: Vec<Box<dyn PrincipalLookup>>,
    cache: Mutex<HashMap<String, ResolvedPrincipal>>,
}

impl std::fmt::Debug for PrincipalResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PrincipalResolver")
            .field(
                "lookups",
                &self.lookups.iter().map(|l| l.kind()).collect::<Vec<_>>(),
            )
            .field("cached", &self.cache.lock().len())
            .finish()
    }
}

impl PrincipalResolver {
    /// Build a resolver over the supplied lookup capabilities.
    pub fn new(mut lookups: Vec<Box<dyn PrincipalLookup>>) -> Self {
        lookups.sort_by_key(|lookup| priority(lookup.kind()));
        Self {
            lookups,
            cache: Mutex::new(HashMap::new()),
        }
    }

    /// Resolve an object id. Never fails: unmatched ids resolve to `Unknown`.
    pub fn resolve(&self, object_id: &str) -> ResolvedPrincipal {
        if let Some(hit) = self.cache.lock().get(object_id) {
            return hit.clone();
        }

        let resolved = self.resolve_uncached(object_id);
        self.cache
            .lock()
            .insert(object_id.to_owned(), resolved.clone());
        resolved
    }

    fn resolve_uncached(&self, object_id: &str) -> ResolvedPrincipal {
        for lookup in &self.lookups {
            match lookup.find(object_id) {
                Ok(Some(record)) => {
                    return ResolvedPrincipal::from_record(lookup.kind(), record);
                }
                Ok(None) => {}
                Err(err) => {
                    debug!(object_id, kind = %lookup.kind(), error = %err, "lookup failed; treating as no match");
                }
            }
        }
        debug!(object_id, "principal did not match any directory lookup");
        ResolvedPrincipal::default()
    }

    /// Find the object id for a principal authored by name.
    ///
    /// Only lookups of the requested kind are consulted; `Unknown` never resolves.
    pub fn object_id_for(
        &self,
        kind: PrincipalType,
        display_name: &str,
        alias: &str,
    ) -> Result<Option<String>, DirectoryError> {
        for lookup in self.lookups.iter().filter(|lookup| lookup.kind() == kind) {
            if let Some(record) = lookup.search(display_name, alias)? {
                return Ok(Some(record.object_id));
            }
        }
        Ok(None)
    }

    /// Number of distinct object ids resolved so far.
    pub fn cached(&self) -> usize {
        self.cache.lock().len()
    }
}

/// Serializable contents of an [`InMemoryDirectory`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirectorySnapshot {
    /// User objects.
    #[serde(default)]
    pub users: Vec<DirectoryRecord>,
    /// Group objects.
    #[serde(default)]
    pub groups: Vec<DirectoryRecord>,
    /// Application registrations.
    #[serde(default)]
    pub applications: Vec<DirectoryRecord>,
    /// Service principals.
    #[serde(default)]
    pub service_principals: Vec<DirectoryRecord>,
}

#[derive(Debug, Default)]
struct DirectoryTables {
    tables: HashMap<PrincipalType, BTreeMap<String, DirectoryRecord>>,
}

/// In-memory directory suitable for tests and file-backed runs.
#[derive(Debug, Default, Clone)]
pub struct InMemoryDirectory {
    inner: Arc<RwLock<DirectoryTables>>,
}

impl InMemoryDirectory {
    /// Create an empty directory.
    pub fn new() -> Self {
        Self::default()
    }

    /// Populate a directory from a snapshot.
    pub fn from_snapshot(snapshot: DirectorySnapshot) -> Self {
        let directory = Self::new();
        let kinds = [
            (PrincipalType::User, snapshot.users),
            (PrincipalType::Group, snapshot.groups),
            (PrincipalType::App, snapshot.applications),
            (PrincipalType::ServicePrincipal, snapshot.service_principals),
        ];
        for (kind, records) in kinds {
            for record in records {
                directory.insert(kind, record);
            }
        }
        directory
    }

    /// Export the directory contents.
    pub fn snapshot(&self) -> DirectorySnapshot {
        let tables = self.inner.read();
        let records = |kind: PrincipalType| -> Vec<DirectoryRecord> {
            tables
                .tables
                .get(&kind)
                .map(|table| table.values().cloned().collect())
                .unwrap_or_default()
        };
        DirectorySnapshot {
            users: records(PrincipalType::User),
            groups: records(PrincipalType::Group),
            applications: records(PrincipalType::App),
            service_principals: records(PrincipalType::ServicePrincipal),
        }
    }

    /// Insert or replace a record of the given kind.
    pub fn insert(&self, kind: PrincipalType, record: DirectoryRecord) {
        self.inner
            .write()
            .tables
            .entry(kind)
            .or_default()
            .insert(record.object_id.clone(), record);
    }

    /// Insert a user with its user principal name.
    pub fn insert_user(&self, object_id: &str, display_name: &str, upn: &str) {
        self.insert(
            PrincipalType::User,
            DirectoryRecord {
                object_id: object_id.into(),
                display_name: display_name.into(),
                user_principal_name: Some(upn.into()),
                mail: None,
            },
        );
    }

    /// Insert a group with its mail address.
    pub fn insert_group(&self, object_id: &str, display_name: &str, mail: &str) {
        self.insert(
            PrincipalType::Group,
            DirectoryRecord {
                object_id: object_id.into(),
                display_name: display_name.into(),
                user_principal_name: None,
                mail: Some(mail.into()),
            },
        );
    }

    /// Insert an application registration or service principal.
    pub fn insert_named(&self, kind: PrincipalType, object_id: &str, display_name: &str) {
        self.insert(
            kind,
            DirectoryRecord {
                object_id: object_id.into(),
                display_name: display_name.into(),
                ..DirectoryRecord::default()
            },
        );
    }

    /// One lookup capability per kind, sharing this directory's storage.
    pub fn lookups(&self) -> Vec<Box<dyn PrincipalLookup>> {
        [
            PrincipalType::User,
            PrincipalType::Group,
            PrincipalType::App,
            PrincipalType::ServicePrincipal,
        ]
        .into_iter()
        .map(|kind| {
            Box::new(DirectoryTable {
                kind,
                directory: self.clone(),
            }) as Box<dyn PrincipalLookup>
        })
        .collect()
    }

    /// Convenience: a resolver over this directory.
    pub fn resolver(&self) -> PrincipalResolver {
        PrincipalResolver::new(self.lookups())
    }
}

struct DirectoryTable {
    kind: PrincipalType,
    directory: InMemoryDirectory,
}

impl PrincipalLookup for DirectoryTable {
    fn kind(&self) -> PrincipalType {
        self.kind
    }

    fn find(&self, object_id: &str) -> Result<Option<DirectoryRecord>, DirectoryError> {
        Ok(self
            .directory
            .inner
            .read()
            .tables
            .get(&self.kind)
            .and_then(|table| table.get(object_id))
            .cloned())
    }

    fn search(
        &self,
        display_name: &str,
        alias: &str,
    ) -> Result<Option<DirectoryRecord>, DirectoryError> {
        let tables = self.directory.inner.read();
        let Some(table) = tables.tables.get(&self.kind) else {
            return Ok(None);
        };
        let found = table.values().find(|record| {
            if !names_match(&record.display_name, display_name) {
                return false;
            }
            let record_alias = match self.kind {
                PrincipalType::User => record.user_principal_name.as_deref(),
                PrincipalType::Group => record.mail.as_deref(),
                _ => return true,
            };
            names_match(record_alias.unwrap_or_default(), alias)
        });
        Ok(found.cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingLookup {
        kind: PrincipalType,
        hits: Vec<&'static str>,
        calls: Arc<AtomicUsize>,
        fail: bool,
    }

    impl PrincipalLookup for CountingLookup {
        fn kind(&self) -> PrincipalType {
            self.kind
        }

        fn find(&self, object_id: &str) -> Result<Option<DirectoryRecord>, DirectoryError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(DirectoryError::Unavailable {
                    kind: self.kind,
                    message: "throttled".into(),
                });
            }
            Ok(self.hits.iter().any(|hit| *hit == object_id).then(|| DirectoryRecord {
                object_id: object_id.into(),
                display_name: format!("{} stub", self.kind),
                user_principal_name: Some("stub@contoso.com".into()),
                mail: Some("stub-group@contoso.com".into()),
            }))
        }

        fn search(
            &self,
            _display_name: &str,
            _alias: &str,
        ) -> Result<Option<DirectoryRecord>, DirectoryError> {
            Ok(None)
        }
    }

    fn counting(
        kind: PrincipalType,
        hits: Vec<&'static str>,
        calls: &Arc<AtomicUsize>,
    ) -> Box<dyn PrincipalLookup> {
        Box::new(CountingLookup {
            kind,
            hits,
            calls: calls.clone(),
            fail: false,
        })
    }

    #[test]
    fn user_wins_over_group_even_when_supplied_later() {
        let calls = Arc::new(AtomicUsize::new(0));
        let resolver = PrincipalResolver::new(vec![
            counting(PrincipalType::Group, vec!["id-1"], &calls),
            counting(PrincipalType::User, vec!["id-1"], &calls),
        ]);
        let resolved = resolver.resolve("id-1");
        assert_eq!(resolved.kind, PrincipalType::User);
        assert_eq!(resolved.alias, "stub@contoso.com");
        assert_eq!(calls.load(Ordering::SeqCst), 1, "group lookup must be skipped");
    }

    #[test]
    fn errors_are_treated_as_no_match() {
        let calls = Arc::new(AtomicUsize::new(0));
        let resolver = PrincipalResolver::new(vec![
            Box::new(CountingLookup {
                kind: PrincipalType::User,
                hits: vec!["id-2"],
                calls: calls.clone(),
                fail: true,
            }),
            counting(PrincipalType::ServicePrincipal, vec!["id-2"], &calls),
        ]);
        let resolved = resolver.resolve("id-2");
        assert_eq!(resolved.kind, PrincipalType::ServicePrincipal);
        assert_eq!(resolved.alias, "", "service principals never carry an alias");
    }

    #[test]
    fn unmatched_ids_resolve_to_unknown() {
        let resolver = InMemoryDirectory::new().resolver();
        assert_eq!(resolver.resolve("ghost"), ResolvedPrincipal::default());
    }

    #[test]
    fn repeated_ids_resolve_once() {
        let calls = Arc::new(AtomicUsize::new(0));
        let resolver = PrincipalResolver::new(vec![
            counting(PrincipalType::User, vec![], &calls),
            counting(PrincipalType::Group, vec!["g"], &calls),
        ]);
        let first = resolver.resolve("g");
        let second = resolver.resolve("g");
        assert_eq!(first, second);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(resolver.cached(), 1);
    }

    #[test]
    fn group_alias_comes_from_mail() {
        let directory = InMemoryDirectory::new();
        directory.insert_group("g-1", "Vault Admins", "vault-admins@contoso.com");
        let resolved = directory.resolver().resolve("g-1");
        assert_eq!(resolved.kind, PrincipalType::Group);
        assert_eq!(resolved.display_name, "Vault Admins");
        assert_eq!(resolved.alias, "vault-admins@contoso.com");
    }

    #[test]
    fn object_id_search_respects_kind_and_alias() {
        let directory = InMemoryDirectory::new();
        directory.insert_user("u-1", "Alice", "alice@contoso.com");
        directory.insert_named(PrincipalType::ServicePrincipal, "sp-1", "deploy-bot");
        let resolver = directory.resolver();

        assert_eq!(
            resolver
                .object_id_for(PrincipalType::User, "alice", "ALICE@contoso.com")
                .unwrap(),
            Some("u-1".into())
        );
        assert_eq!(
            resolver
                .object_id_for(PrincipalType::User, "Alice", "other@contoso.com")
                .unwrap(),
            None
        );
        assert_eq!(
            resolver
                .object_id_for(PrincipalType::ServicePrincipal, "Deploy-Bot", "")
                .unwrap(),
            Some("sp-1".into())
        );
        assert_eq!(
            resolver
                .object_id_for(PrincipalType::Unknown, "Alice", "alice@contoso.com")
                .unwrap(),
            None
        );
    }

    #[test]
    fn object_id_search_folds_non_ascii_case() {
        let directory = InMemoryDirectory::new();
        directory.insert_user("u-1", "Ørjan Åsen", "ørjan.åsen@contoso.com");
        let resolver = directory.resolver();
        assert_eq!(
            resolver
                .object_id_for(PrincipalType::User, "øRJAN åSEN", "ØRJAN.ÅSEN@contoso.com")
                .unwrap(),
            Some("u-1".into())
        );
        assert!(names_match("STRASSE", "strasse"));
        assert!(!names_match("Ørjan", "Orjan"));
    }

    #[test]
    fn snapshot_restores_every_kind() {
        let directory = InMemoryDirectory::new();
        directory.insert_user("u-1", "Alice", "alice@contoso.com");
        directory.insert_named(PrincipalType::App, "a-1", "billing-app");
        let restored = InMemoryDirectory::from_snapshot(directory.snapshot());
        assert_eq!(restored.snapshot(), directory.snapshot());
        assert_eq!(restored.resolver().resolve("a-1").kind, PrincipalType::App);
    }
}
