//! ---
//! kvr_section: "03-persistence-logging"
//! kvr_subsection: "module"
//! kvr_type: "source"
//! kvr_scope: "code"
//! kvr_description: "Structured logging adapters and sinks."
//! kvr_version: "v0.0.0-prealpha"
//! kvr_owner: "tbd"
//! ---
/// Shared expansion for the level-specific macros.
#[doc(hidden)]
#[macro_export]
macro_rules! __kvr_event {
    ($level:expr, $ctx:expr, $($arg:tt)+) => {{
        let ctx = &$ctx;
        tracing::event!(
            $level,
            subscription = ctx.subscription.unwrap_or(""),
            resource_group = ctx.resource_group.unwrap_or(""),
            vault = ctx.vault.unwrap_or(""),
            principal = ctx.principal.unwrap_or(""),
            message = %format_args!($($arg)+)
        );
    }};
}

/// Emit an informational log enriched with vault scope context.
#[macro_export]
macro_rules! kvr_info {
    (context = $ctx:expr, $($arg:tt)+) => {
        $crate::__kvr_event!(tracing::Level::INFO, $ctx, $($arg)+)
    };
    ($($arg:tt)+) => {
        $crate::__kvr_event!(tracing::Level::INFO, $crate::LogContext::default(), $($arg)+)
    };
}

/// Emit a debug log enriched with vault scope context.
#[macro_export]
macro_rules! kvr_debug {
    (context = $ctx:expr, $($arg:tt)+) => {
        $crate::__kvr_event!(tracing::Level::DEBUG, $ctx, $($arg)+)
    };
    ($($arg:tt)+) => {
        $crate::__kvr_event!(tracing::Level::DEBUG, $crate::LogContext::default(), $($arg)+)
    };
}

/// Emit a warning enriched with vault scope context.
#[macro_export]
macro_rules! kvr_warn {
    (context = $ctx:expr, $($arg:tt)+) => {
        $crate::__kvr_event!(tracing::Level::WARN, $ctx, $($arg)+)
    };
    ($($arg:tt)+) => {
        $crate::__kvr_event!(tracing::Level::WARN, $crate::LogContext::default(), $($arg)+)
    };
}
