//! ---
//! kvr_section: "05-networking-external-interfaces"
//! kvr_subsection: "binary"
//! kvr_type: "source"
//! kvr_scope: "code"
//! kvr_description: "Operator CLI driving access-policy reconciliation runs."
//! kvr_version: "v0.0.0-prealpha"
//! kvr_owner: "tbd"
//! ---
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use clap::{ArgAction, Args};
use kvr_common::config::AppConfig;
use kvr_common::logging::{init_tracing, LogFormat};
use kvr_engine::{
    diff::ReconcileLimits, fixture::FixtureCloud, metrics::ReconcileMetrics, Reconciler,
};
use kvr_security::{AssignmentPolicy, PrincipalResolver, ShorthandTable};
use prometheus::{Encoder, Registry, TextEncoder};
use tracing::info;

/// Flags shared by every subcommand.
#[derive(Debug, Args)]
pub struct GlobalArgs {
    /// Configuration file (TOML). Falls back to kvr.toml / configs/kvr.toml.
    #[arg(long, global = true, value_name = "FILE", env = "KVR_CONFIG")]
    pub config: Option<PathBuf>,

    /// Cloud snapshot served in place of the provider APIs.
    #[arg(long, global = true, value_name = "FILE", env = "KVR_CLOUD_FIXTURE")]
    pub cloud: Option<PathBuf>,

    /// Override the configured stderr log format.
    #[arg(long = "log-format", global = true, value_enum)]
    pub log_format: Option<LogFormat>,

    /// Override the configured report directory.
    #[arg(long = "output-dir", global = true, value_name = "DIR")]
    pub output_dir: Option<PathBuf>,

    /// Print Prometheus counters to stderr when the command finishes.
    #[arg(long, global = true, action = ArgAction::SetTrue)]
    pub metrics: bool,
}

/// Loaded configuration plus the collaborators a command needs.
pub struct Session {
    pub config: AppConfig,
    pub cloud: FixtureCloud,
    pub cloud_path: PathBuf,
    pub table: ShorthandTable,
    output_dir: PathBuf,
    metrics: Option<ReconcileMetrics>,
}

impl Session {
    pub fn open(args: &GlobalArgs) -> Result<Self> {
        let mut config = match &args.config {
            Some(path) => AppConfig::from_path(path)?,
            None => AppConfig::load(&AppConfig::DEFAULT_CANDIDATES[..])?,
        };
        if let Some(format) = args.log_format {
            config.logging.format = format;
        }
        init_tracing("kvrctl", &config.logging)?;

        let cloud_path = args
            .cloud
            .clone()
            .ok_or_else(|| anyhow!("no cloud snapshot given; pass --cloud or set KVR_CLOUD_FIXTURE"))?;
        let cloud = FixtureCloud::load(&cloud_path)
            .with_context(|| format!("unable to load cloud snapshot {}", cloud_path.display()))?;
        info!(cloud = %cloud_path.display(), "cloud snapshot loaded");

        let output_dir = args
            .output_dir
            .clone()
            .unwrap_or_else(|| config.output.directory.clone());
        let metrics = if args.metrics {
            Some(ReconcileMetrics::new(Arc::new(Registry::new()))?)
        } else {
            None
        };

        Ok(Self {
            config,
            cloud,
            cloud_path,
            table: ShorthandTable::standard(),
            output_dir,
            metrics,
        })
    }

    pub fn limits(&self) -> ReconcileLimits {
        ReconcileLimits::from(&self.config.reconcile)
    }

    /// A reconciler wired to this session's cloud, policy and metrics.
    pub fn reconciler<'a>(
        &'a self,
        resolver: &'a PrincipalResolver,
        limits: ReconcileLimits,
    ) -> Reconciler<'a, FixtureCloud> {
        let policy =
            AssignmentPolicy::from_role_definitions(&self.config.authorization.required_role_definitions);
        let reconciler = Reconciler::new(&self.cloud, resolver, &self.table)
            .with_policy(policy)
            .with_limits(limits);
        match &self.metrics {
            Some(metrics) => reconciler.with_metrics(metrics),
            None => reconciler,
        }
    }

    pub fn output_path(&self, file_name: &str) -> PathBuf {
        self.output_dir.join(file_name)
    }

    pub fn output_dir(&self) -> &Path {
        &self.output_dir
    }

    pub fn report_metrics(&self) -> Result<()> {
        let Some(metrics) = &self.metrics else {
            return Ok(());
        };
        let mut buffer = Vec::new();
        TextEncoder::new().encode(&metrics.registry().gather(), &mut buffer)?;
        eprint!("{}", String::from_utf8_lossy(&buffer));
        Ok(())
    }
}
