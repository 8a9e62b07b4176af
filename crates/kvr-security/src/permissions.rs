//! ---
//! kvr_section: "06-security-access-control"
//! kvr_subsection: "module"
//! kvr_type: "source"
//! kvr_scope: "code"
//! kvr_description: "Permission vocabularies, principal identity and scope authorisation."
//! kvr_version: "v0.0.0-prealpha"
//! kvr_owner: "tbd"
//! ---
use std::collections::{BTreeMap, BTreeSet, HashMap};

use serde::{Deserialize, Serialize};
use strum::IntoEnumIterator;
use thiserror::Error;

/// Normalised, deduplicated permission tokens for one category.
pub type PermissionSet = BTreeSet<String>;

/// The three permission families a vault access policy grants.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumIter,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum PermissionCategory {
    /// Key operations.
    Keys,
    /// Secret operations.
    Secrets,
    /// Certificate operations.
    Certificates,
}

const KEY_PERMISSIONS: &[&str] = &[
    "get", "list", "update", "create", "import", "delete", "recover", "backup", "restore",
    "decrypt", "encrypt", "unwrapkey", "wrapkey", "verify", "sign", "purge",
];

const SECRET_PERMISSIONS: &[&str] = &[
    "get", "list", "set", "delete", "recover", "backup", "restore", "purge",
];

const CERTIFICATE_PERMISSIONS: &[&str] = &[
    "get",
    "list",
    "update",
    "create",
    "import",
    "delete",
    "recover",
    "backup",
    "restore",
    "managecontacts",
    "manageissuers",
    "getissuers",
    "listissuers",
    "setissuers",
    "deleteissuers",
    "purge",
];

const ALL_KEYWORD: &str = "all";

impl PermissionCategory {
    /// Every concrete permission token the category accepts.
    pub fn concrete_permissions(&self) -> &'static [&'static str] {
        match self {
            PermissionCategory::Keys => KEY_PERMISSIONS,
            PermissionCategory::Secrets => SECRET_PERMISSIONS,
            PermissionCategory::Certificates => CERTIFICATE_PERMISSIONS,
        }
    }
}

/// Errors raised while normalising raw permission tokens.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum PermissionError {
    /// Token is neither a concrete permission nor a shorthand keyword.
    #[error("unknown {category} permission token '{token}' (shorthands: {shorthands})")]
    UnknownToken {
        /// Category the token was listed under.
        category: PermissionCategory,
        /// Token after trimming and lowercasing.
        token: String,
        /// Shorthand keywords accepted for the category, comma separated.
        shorthands: String,
    },
}

#[derive(Debug, Clone)]
struct Vocabulary {
    concrete: BTreeSet<&'static str>,
    shorthands: BTreeMap<&'static str, BTreeSet<&'static str>>,
}

/// Immutable mapping of `(category, keyword)` to the concrete tokens the keyword stands for.
///
/// Built once at startup and passed by reference; there is no way to mutate it afterwards.
#[derive(Debug, Clone)]
pub struct ShorthandTable {
    vocabularies: HashMap<PermissionCategory, Vocabulary>,
}

impl Default for ShorthandTable {
    fn default() -> Self {
        Self::standard()
    }
}

impl ShorthandTable {
    /// The standard key-vault shorthand table.
    pub fn standard() -> Self {
        let read = ["get", "list"];
        let write_keys = ["update", "create", "delete"];
        let storage_keys = ["import", "recover", "backup", "restore"];

        let mut vocabularies = HashMap::new();
        vocabularies.insert(
            PermissionCategory::Keys,
            Vocabulary::new(
                PermissionCategory::Keys,
                [
                    ("read", &read[..]),
                    ("write", &write_keys[..]),
                    ("storage", &storage_keys[..]),
                    (
                        "crypto",
                        &["decrypt", "encrypt", "unwrapkey", "wrapkey", "verify", "sign"][..],
                    ),
                ],
            ),
        );
        vocabularies.insert(
            PermissionCategory::Secrets,
            Vocabulary::new(
                PermissionCategory::Secrets,
                [
                    ("read", &read[..]),
                    ("write", &["set", "delete"][..]),
                    ("storage", &["recover", "backup", "restore"][..]),
                ],
            ),
        );
        vocabularies.insert(
            PermissionCategory::Certificates,
            Vocabulary::new(
                PermissionCategory::Certificates,
                [
                    ("read", &read[..]),
                    ("write", &write_keys[..]),
                    ("storage", &storage_keys[..]),
                    (
                        "management",
                        &[
                            "managecontacts",
                            "manageissuers",
                            "getissuers",
                            "listissuers",
                            "setissuers",
                            "deleteissuers",
                        ][..],
                    ),
                ],
            ),
        );
        Self { vocabularies }
    }

    fn vocabulary(&self, category: PermissionCategory) -> &Vocabulary {
        // `standard()` populates every category and nothing removes entries.
        &self.vocabularies[&category]
    }

    /// Whether `token` is a concrete permission for the category.
    pub fn is_concrete(&self, category: PermissionCategory, token: &str) -> bool {
        self.vocabulary(category).concrete.contains(token)
    }

    /// Whether `token` is a shorthand keyword for the category.
    pub fn is_shorthand(&self, category: PermissionCategory, token: &str) -> bool {
        self.vocabulary(category).shorthands.contains_key(token)
    }

    /// Keywords recognised for the category, in lexical order.
    pub fn keywords(&self, category: PermissionCategory) -> impl Iterator<Item = &'static str> + '_ {
        self.vocabulary(category).shorthands.keys().copied()
    }

    /// Concrete tokens a keyword expands to, if the keyword exists.
    pub fn expand(
        &self,
        category: PermissionCategory,
        keyword: &str,
    ) -> Option<impl Iterator<Item = &'static str> + '_> {
        self.vocabulary(category)
            .shorthands
            .get(keyword)
            .map(|tokens| tokens.iter().copied())
    }

    /// Full concrete permission set of a category (the expansion of `all`).
    pub fn all(&self, category: PermissionCategory) -> PermissionSet {
        self.vocabulary(category)
            .concrete
            .iter()
            .map(|token| token.to_string())
            .collect()
    }

    /// Normalise a raw token list for one category.
    ///
    /// Tokens are trimmed and lowercased, validated against the category's
    /// vocabulary, shorthand keywords are expanded, and the result is unioned
    /// into a deduplicated set. A missing list is an empty set.
    pub fn normalize<S: AsRef<str>>(
        &self,
        category: PermissionCategory,
        raw: Option<&[S]>,
    ) -> Result<PermissionSet, PermissionError> {
        let Some(raw) = raw else {
            return Ok(PermissionSet::new());
        };

        let tokens: Vec<String> = raw
            .iter()
            .map(|token| token.as_ref().trim().to_lowercase())
            .collect();

        // Validate everything before expanding anything.
        if let Some(unknown) = tokens
            .iter()
            .find(|token| !self.is_concrete(category, token) && !self.is_shorthand(category, token))
        {
            return Err(PermissionError::UnknownToken {
                category,
                token: unknown.clone(),
                shorthands: self.keywords(category).collect::<Vec<_>>().join(", "),
            });
        }

        let mut normalized = PermissionSet::new();
        for token in tokens {
            match self.expand(category, &token) {
                Some(expansion) => normalized.extend(expansion.map(str::to_owned)),
                None => {
                    normalized.insert(token);
                }
            }
        }
        Ok(normalized)
    }
}

impl Vocabulary {
    fn new<const N: usize>(
        category: PermissionCategory,
        shorthands: [(&'static str, &[&'static str]); N],
    ) -> Self {
        let concrete: BTreeSet<&'static str> =
            category.concrete_permissions().iter().copied().collect();
        let mut table: BTreeMap<&'static str, BTreeSet<&'static str>> = shorthands
            .into_iter()
            .map(|(keyword, tokens)| (keyword, tokens.iter().copied().collect()))
            .collect();
        table.insert(ALL_KEYWORD, concrete.clone());
        Self {
            concrete,
            shorthands: table,
        }
    }
}

/// Iterate every permission category in declaration order.
pub fn categories() -> impl Iterator<Item = PermissionCategory> {
    PermissionCategory::iter()
}
