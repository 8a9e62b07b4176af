//! ---
//! kvr_section: "03-persistence-logging"
//! kvr_subsection: "module"
//! kvr_type: "source"
//! kvr_scope: "code"
//! kvr_description: "Structured logging adapters and sinks."
//! kvr_version: "v0.0.0-prealpha"
//! kvr_owner: "tbd"
//! ---
#![warn(missing_docs)]

use tracing::Level;

pub mod macros;

/// Scope coordinates propagated by the convenience macros.
#[derive(Debug, Default, Clone)]
pub struct LogContext<'a> {
    /// Subscription identifier.
    pub subscription: Option<&'a str>,
    /// Resource group name.
    pub resource_group: Option<&'a str>,
    /// Vault name.
    pub vault: Option<&'a str>,
    /// Principal display name or object id.
    pub principal: Option<&'a str>,
}

impl<'a> LogContext<'a> {
    /// Create an empty logging context.
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach a subscription identifier.
    pub fn with_subscription(mut self, subscription: &'a str) -> Self {
        self.subscription = Some(subscription);
        self
    }

    /// Attach a resource group name.
    pub fn with_resource_group(mut self, resource_group: &'a str) -> Self {
        self.resource_group = Some(resource_group);
        self
    }

    /// Attach a vault name.
    pub fn with_vault(mut self, vault: &'a str) -> Self {
        self.vault = Some(vault);
        self
    }

    /// Attach a principal.
    pub fn with_principal(mut self, principal: &'a str) -> Self {
        self.principal = Some(principal);
        self
    }
}

/// High-level outcome used when emitting lifecycle log events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SystemEventOutcome {
    /// The step completed successfully.
    Success,
    /// The step completed with recoverable problems.
    Degraded,
    /// The step failed or was aborted.
    Fault,
}

impl SystemEventOutcome {
    fn as_str(&self) -> &'static str {
        match self {
            SystemEventOutcome::Success => "success",
            SystemEventOutcome::Degraded => "degraded",
            SystemEventOutcome::Fault => "fault",
        }
    }
}

/// Emit a standardized run event (`reconcile.plan`, `reconcile.apply`, ...).
pub fn log_system_event(
    context: Option<&LogContext>,
    event: &str,
    message: &str,
    outcome: SystemEventOutcome,
) {
    let default_ctx = LogContext::default();
    let ctx = context.unwrap_or(&default_ctx);
    macro_rules! emit {
        ($level:expr) => {
            tracing::event!(
                $level,
                event = %event,
                outcome = outcome.as_str(),
                subscription = ctx.subscription.unwrap_or(""),
                resource_group = ctx.resource_group.unwrap_or(""),
                vault = ctx.vault.unwrap_or(""),
                principal = ctx.principal.unwrap_or(""),
                message = %message
            )
        };
    }
    match outcome {
        SystemEventOutcome::Success => emit!(Level::INFO),
        SystemEventOutcome::Degraded => emit!(Level::WARN),
        SystemEventOutcome::Fault => emit!(Level::ERROR),
    }
}
