//! ---
//! ems_section: "03-persistence-logging"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Structured logging adapters and sinks."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
/// Emit an informational log enriched with link context.
#[macro_export]
macro_rules! helmet_info {
    (context = $ctx:expr, $($arg:tt)+) => {{
        let ctx = &$ctx;
        tracing::event!(
            tracing::Level::INFO,
            broker = ctx.broker.unwrap_or(""),
            device = ctx.device.unwrap_or(""),
            topic = ctx.topic.unwrap_or(""),
            session = ctx.session.unwrap_or_default(),
            message = %format_args!($($arg)+)
        );
    }};
    ($($arg:tt)+) => {{
        $crate::helmet_info!(context = $crate::LogContext::default(), $($arg)+)
    }};
}

/// Emit a warning enriched with link context.
#[macro_export]
macro_rules! helmet_warn {
    (context = $ctx:expr, $($arg:tt)+) => {{
        let ctx = &$ctx;
        tracing::event!(
            tracing::Level::WARN,
            broker = ctx.broker.unwrap_or(""),
            device = ctx.device.unwrap_or(""),
            topic = ctx.topic.unwrap_or(""),
            session = ctx.session.unwrap_or_default(),
            message = %format_args!($($arg)+)
        );
    }};
    ($($arg:tt)+) => {{
        $crate::helmet_warn!(context = $crate::LogContext::default(), $($arg)+)
    }};
}

/// Emit an error log enriched with link context.
#[macro_export]
macro_rules! helmet_error {
    (context = $ctx:expr, $($arg:tt)+) => {{
        let ctx = &$ctx;
        tracing::event!(
            tracing::Level::ERROR,
            broker = ctx.broker.unwrap_or(""),
            device = ctx.device.unwrap_or(""),
            topic = ctx.topic.unwrap_or(""),
            session = ctx.session.unwrap_or_default(),
            message = %format_args!($($arg)+)
        );
    }};
    ($($arg:tt)+) => {{
        $crate::helmet_error!(context = $crate::LogContext::default(), $($arg)+)
    }};
}
