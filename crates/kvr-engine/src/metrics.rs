//! ---
//! kvr_section: "08-reconciliation-engine"
//! kvr_subsection: "module"
//! kvr_type: "source"
//! kvr_scope: "code"
//! kvr_description: "Live-state collection, diffing and application of vault access policies."
//! kvr_version: "v0.0.0-prealpha"
//! kvr_owner: "tbd"
//! ---
use prometheus::{IntCounter, IntCounterVec, Opts, Registry};
use std::sync::Arc;

use crate::diff::{ChangeCounts, OperationKind};

/// Reconciliation counters exported via Prometheus.
#[derive(Clone)]
pub struct ReconcileMetrics {
    registry: Arc<Registry>,
    vaults_collected_total: IntCounter,
    planned_operations_total: IntCounterVec,
    applied_operations_total: IntCounter,
    failed_operations_total: IntCounter,
    guard_rejections_total: IntCounter,
}

impl ReconcileMetrics {
    /// Register metrics with the provided registry.
    pub fn new(registry: Arc<Registry>) -> anyhow::Result<Self> {
        let vaults_collected_total =
            IntCounter::new("kvr_vaults_collected_total", "Vaults read from the provider")?;
        let planned_operations_total = IntCounterVec::new(
            Opts::new("kvr_planned_operations_total", "Planned policy operations"),
            &["kind"],
        )?;
        let applied_operations_total =
            IntCounter::new("kvr_applied_operations_total", "Policy operations applied")?;
        let failed_operations_total =
            IntCounter::new("kvr_failed_operations_total", "Policy operations that failed")?;
        let guard_rejections_total = IntCounter::new(
            "kvr_guard_rejections_total",
            "Plans refused by a safety guard",
        )?;

        registry.register(Box::new(vaults_collected_total.clone()))?;
        registry.register(Box::new(planned_operations_total.clone()))?;
        registry.register(Box::new(applied_operations_total.clone()))?;
        registry.register(Box::new(failed_operations_total.clone()))?;
        registry.register(Box::new(guard_rejections_total.clone()))?;

        Ok(Self {
            registry,
            vaults_collected_total,
            planned_operations_total,
            applied_operations_total,
            failed_operations_total,
            guard_rejections_total,
        })
    }

    pub fn registry(&self) -> Arc<Registry> {
        self.registry.clone()
    }

    pub fn add_collected(&self, vaults: usize) {
        self.vaults_collected_total.inc_by(vaults as u64);
    }

    pub fn record_plan(&self, counts: &ChangeCounts) {
        for (kind, count) in [
            (OperationKind::Add, counts.add),
            (OperationKind::Modify, counts.modify),
            (OperationKind::Remove, counts.remove),
        ] {
            let label = kind.to_string();
            self.planned_operations_total
                .with_label_values(&[label.as_str()])
                .inc_by(count as u64);
        }
    }

    pub fn inc_applied(&self) {
        self.applied_operations_total.inc();
    }

    pub fn inc_failed(&self) {
        self.failed_operations_total.inc();
    }

    pub fn inc_guard_rejection(&self) {
        self.guard_rejections_total.inc();
    }
}
