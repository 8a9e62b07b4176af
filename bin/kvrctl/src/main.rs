//! ---
//! kvr_section: "05-networking-external-interfaces"
//! kvr_subsection: "binary"
//! kvr_type: "source"
//! kvr_scope: "code"
//! kvr_description: "Operator CLI driving access-policy reconciliation runs."
//! kvr_version: "v0.0.0-prealpha"
//! kvr_owner: "tbd"
//! ---
use anyhow::Result;
use clap::{Parser, Subcommand};

mod export;
mod reconcile;
mod session;

use session::{GlobalArgs, Session};

#[derive(Debug, Parser)]
#[command(
    author,
    version,
    about = "Key-vault access-policy reconciler",
    long_about = None
)]
struct Cli {
    #[command(flatten)]
    global: GlobalArgs,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Verify the caller may manage every vault in a desired-state file.
    Check(reconcile::CheckCommand),
    /// Write live access policies in the desired-state document format.
    Export(export::ExportCommand),
    /// Compute the changes needed to reach the desired state.
    Plan(reconcile::PlanCommand),
    /// Plan, guard and apply the desired state.
    Apply(reconcile::ApplyCommand),
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let session = Session::open(&cli.global)?;
    let result = match cli.command {
        Commands::Check(cmd) => cmd.execute(&session),
        Commands::Export(cmd) => cmd.execute(&session),
        Commands::Plan(cmd) => cmd.execute(&session),
        Commands::Apply(cmd) => cmd.execute(&session),
    };
    session.report_metrics()?;
    result
}
