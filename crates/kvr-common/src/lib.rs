//! ---
//! kvr_section: "01-core-functionality"
//! kvr_subsection: "module"
//! kvr_type: "source"
//! kvr_scope: "code"
//! kvr_description: "Shared primitives and utilities for the reconciler."
//! kvr_version: "v0.0.0-prealpha"
//! kvr_owner: "tbd"
//! ---
//! Shared primitives for the KVR workspace.
//! This crate exposes configuration loading and tracing initialisation
//! consumed by the engine and the control CLI.

pub mod config;
pub mod logging;

pub use config::{
    AppConfig, AuthorizationConfig, LoadedAppConfig, LoggingConfig, OutputConfig, ReconcileConfig,
};
pub use logging::{init_tracing, LogFormat};
