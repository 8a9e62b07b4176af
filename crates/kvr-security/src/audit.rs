//! ---
//! kvr_section: "06-security-access-control"
//! kvr_subsection: "module"
//! kvr_type: "source"
//! kvr_scope: "code"
//! kvr_description: "Permission vocabularies, principal identity and scope authorisation."
//! kvr_version: "v0.0.0-prealpha"
//! kvr_owner: "tbd"
//! ---
use std::fs::{self, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

const GENESIS_HASH_LEN: usize = 64;

/// One change to a vault access policy worth keeping a tamper-evident record of.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditRecord {
    /// Identifier of the reconciliation run.
    pub run_id: String,
    /// Event type (`policy.revoke`, `policy.apply_failed`, ...).
    pub action: String,
    /// Vault scope path the change targeted.
    pub scope: String,
    /// Principal display name (or object id when unresolved).
    pub principal: String,
    /// Additional context (permission sets, error message).
    pub details: serde_json::Value,
}

/// Entry recorded in the audit log.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AuditEntry {
    /// Timestamp when the event was recorded.
    pub timestamp: DateTime<Utc>,
    /// Recorded change.
    #[serde(flatten)]
    pub record: AuditRecord,
    /// SHA-256 over the entry contents and the previous hash.
    pub hash: String,
    /// Hash of the previous entry (zeros for the first entry).
    pub previous_hash: String,
}

impl AuditEntry {
    fn compute_hash(
        timestamp: DateTime<Utc>,
        record: &AuditRecord,
        previous_hash: &str,
    ) -> String {
        let mut hasher = Sha256::new();
        hasher.update(
            timestamp
                .timestamp_nanos_opt()
                .unwrap_or_default()
                .to_be_bytes(),
        );
        for field in [
            &record.run_id,
            &record.action,
            &record.scope,
            &record.principal,
        ] {
            hasher.update((field.len() as u64).to_be_bytes());
            hasher.update(field.as_bytes());
        }
        hasher.update(record.details.to_string().as_bytes());
        hasher.update(previous_hash.as_bytes());
        hex::encode(hasher.finalize())
    }
}

/// Append-only audit log backed by a newline-delimited JSON file.
#[derive(Debug, Clone)]
pub struct AuditLog {
    path: PathBuf,
    last_hash: String,
}

impl AuditLog {
    /// Open (or create on first append) the log at `path`, resuming the hash chain.
    pub fn new(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let last_hash = read_entries(&path)?
            .last()
            .map(|entry| entry.hash.clone())
            .unwrap_or_else(|| "0".repeat(GENESIS_HASH_LEN));
        Ok(Self { path, last_hash })
    }

    /// Location of the log file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append a record to the log.
    pub fn append(&mut self, record: AuditRecord) -> Result<AuditEntry> {
        let timestamp = Utc::now();
        let hash = AuditEntry::compute_hash(timestamp, &record, &self.last_hash);
        let entry = AuditEntry {
            timestamp,
            record,
            hash: hash.clone(),
            previous_hash: self.last_hash.clone(),
        };

        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).with_context(|| {
                    format!("unable to create audit directory {}", parent.display())
                })?;
            }
        }
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .with_context(|| format!("unable to open audit log {}", self.path.display()))?;
        file.write_all(serde_json::to_string(&entry)?.as_bytes())?;
        file.write_all(b"\n")?;
        file.flush()?;
        self.last_hash = hash;
        Ok(entry)
    }

    /// Read every entry back in order.
    pub fn entries(&self) -> Result<Vec<AuditEntry>> {
        read_entries(&self.path)
    }

    /// Verify integrity of the log (detect tampering).
    pub fn verify(&self) -> Result<bool> {
        let mut previous = "0".repeat(GENESIS_HASH_LEN);
        for entry in read_entries(&self.path)? {
            if entry.previous_hash != previous {
                return Ok(false);
            }
            let expected = AuditEntry::compute_hash(entry.timestamp, &entry.record, &previous);
            if expected != entry.hash {
                return Ok(false);
            }
            previous = entry.hash;
        }
        Ok(true)
    }
}

fn read_entries(path: &Path) -> Result<Vec<AuditEntry>> {
    if !path.exists() {
        return Ok(Vec::new());
    }
    let mut entries = Vec::new();
    let file = fs::File::open(path)
        .with_context(|| format!("unable to open audit log {}", path.display()))?;
    for (index, line) in BufReader::new(file).lines().enumerate() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let entry: AuditEntry = serde_json::from_str(&line).with_context(|| {
            format!("corrupt audit entry at {}:{}", path.display(), index + 1)
        })?;
        entries.push(entry);
    }
    Ok(entries)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Seek, SeekFrom};
    use tempfile::tempdir;

    fn revoke(principal: &str) -> AuditRecord {
        AuditRecord {
            run_id: "run-1".into(),
            action: "policy.revoke".into(),
            scope: "/subscriptions/s/resourceGroups/rg/providers/Microsoft.KeyVault/vaults/kv"
                .into(),
            principal: principal.into(),
            details: serde_json::json!({"keys": ["get", "list"]}),
        }
    }

    #[test]
    fn chain_resumes_across_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested/audit.log");
        let mut log = AuditLog::new(&path).unwrap();
        let first = log.append(revoke("alice")).unwrap();

        let mut reopened = AuditLog::new(&path).unwrap();
        let second = reopened.append(revoke("bob")).unwrap();
        assert_eq!(second.previous_hash, first.hash);
        assert_eq!(reopened.entries().unwrap().len(), 2);
        assert!(reopened.verify().unwrap());
    }

    #[test]
    fn audit_log_detects_tampering() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("audit.log");
        let mut log = AuditLog::new(&path).unwrap();
        log.append(revoke("alice")).unwrap();
        log.append(revoke("bob")).unwrap();
        assert!(log.verify().unwrap());

        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(&path)
            .unwrap();
        let mut contents = String::new();
        file.read_to_string(&mut contents).unwrap();
        let mut entries: Vec<serde_json::Value> = contents
            .lines()
            .filter(|line| !line.is_empty())
            .map(|line| serde_json::from_str(line).unwrap())
            .collect();
        entries[1]["principal"] = serde_json::json!("mallory");
        file.set_len(0).unwrap();
        file.seek(SeekFrom::Start(0)).unwrap();
        for value in entries {
            file.write_all(value.to_string().as_bytes()).unwrap();
            file.write_all(b"\n").unwrap();
        }
        assert!(!AuditLog::new(&path).unwrap().verify().unwrap());
    }
}
