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

use anyhow::Result;
use clap::Args;
use kvr_engine::io::write_documents;
use kvr_security::ScopeRequest;

use crate::session::Session;

#[derive(Debug, Args)]
pub struct ExportCommand {
    /// Scope to read: SUBSCRIPTION, SUBSCRIPTION/GROUP or SUBSCRIPTION/GROUP/VAULT.
    #[arg(long = "scope", value_name = "SELECTOR", required = true, num_args = 1..)]
    scopes: Vec<String>,

    /// Destination file; YAML when it ends in .yaml/.yml, JSON otherwise.
    #[arg(long = "out", value_name = "FILE")]
    out: PathBuf,
}

impl ExportCommand {
    pub fn execute(self, session: &Session) -> Result<()> {
        let request = ScopeRequest::from_selectors(&self.scopes)?;
        let resolver = session.cloud.resolver();
        let documents = session
            .reconciler(&resolver, session.limits())
            .export(&request)?;
        write_documents(&self.out, &documents)?;
        println!(
            "exported {} vault(s) to {}",
            documents.len(),
            self.out.display()
        );
        Ok(())
    }
}
