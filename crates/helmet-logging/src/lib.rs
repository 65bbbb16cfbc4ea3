//! ---
//! ems_section: "03-persistence-logging"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Structured logging adapters and sinks."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
#![warn(missing_docs)]

use std::path::PathBuf;

use once_cell::sync::OnceCell;
use serde::{Deserialize, Serialize};
use tracing::Level;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::daily;
use tracing_subscriber::filter::EnvFilter;
use tracing_subscriber::fmt as subscriber_fmt;
use tracing_subscriber::layer::{Layer, SubscriberExt};
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::Registry;

pub mod macros;

/// Environment variable consulted before `RUST_LOG`.
pub const LOG_ENV: &str = "HELMET_LOG";

static FILE_GUARD: OnceCell<WorkerGuard> = OnceCell::new();

/// Output format for the stdout layer.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "kebab-case")]
pub enum LogFormat {
    /// Human readable single-line output.
    #[default]
    Pretty,
    /// One JSON object per event.
    StructuredJson,
}

/// Logging section of the client configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LoggingConfig {
    /// Stdout format.
    #[serde(default)]
    pub format: LogFormat,
    /// Directive used when neither `HELMET_LOG` nor `RUST_LOG` is set.
    #[serde(default = "LoggingConfig::default_filter")]
    pub filter: String,
    /// When set, a daily rolling JSON log is written into this directory.
    #[serde(default)]
    pub directory: Option<PathBuf>,
    /// File name prefix for the rolling log; defaults to the service name.
    #[serde(default)]
    pub file_prefix: Option<String>,
}

impl LoggingConfig {
    fn default_filter() -> String {
        "info".to_owned()
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            format: LogFormat::default(),
            filter: Self::default_filter(),
            directory: None,
            file_prefix: None,
        }
    }
}

/// Initialize a baseline tracing subscriber suitable for development.
pub fn init() {
    let _ = Registry::default()
        .with(EnvFilter::from_default_env().add_directive(Level::INFO.into()))
        .with(subscriber_fmt::layer())
        .try_init();
}

/// Initialize tracing from configuration.
///
/// `HELMET_LOG` wins over `RUST_LOG`, which wins over `config.filter`. A second
/// call is harmless: the global subscriber is only installed once.
pub fn init_tracing(service_name: &str, config: &LoggingConfig) -> std::io::Result<()> {
    let filter = resolve_filter(&config.filter);

    let stdout_layer = match config.format {
        LogFormat::Pretty => subscriber_fmt::layer().with_target(true).boxed(),
        LogFormat::StructuredJson => subscriber_fmt::layer()
            .with_target(false)
            .json()
            .boxed(),
    };

    let file_layer = match &config.directory {
        Some(directory) => {
            std::fs::create_dir_all(directory)?;
            let prefix = config
                .file_prefix
                .clone()
                .unwrap_or_else(|| service_name.to_owned());
            let appender = daily(directory, format!("{prefix}.log"));
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let _ = FILE_GUARD.set(guard);
            Some(
                subscriber_fmt::layer()
                    .with_target(true)
                    .json()
                    .with_writer(writer)
                    .boxed(),
            )
        }
        None => None,
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(stdout_layer)
        .with(file_layer)
        .try_init()
        .ok();

    tracing::info!(service = %service_name, format = ?config.format, "tracing initialised");
    Ok(())
}

fn resolve_filter(fallback: &str) -> EnvFilter {
    let directive = std::env::var(LOG_ENV)
        .ok()
        .or_else(|| std::env::var("RUST_LOG").ok())
        .filter(|value| !value.trim().is_empty());
    match directive {
        Some(directive) => EnvFilter::try_new(&directive).unwrap_or_else(|err| {
            eprintln!("invalid log directive {directive:?} ({err}); using {fallback:?}");
            EnvFilter::new(fallback)
        }),
        None => EnvFilter::try_new(fallback).unwrap_or_else(|_| EnvFilter::new("info")),
    }
}

/// Structured logging context propagated by the convenience macros.
#[derive(Debug, Default, Clone)]
pub struct LogContext<'a> {
    /// Broker address the event relates to.
    pub broker: Option<&'a str>,
    /// Helmet identifier carried by the frame.
    pub device: Option<&'a str>,
    /// Wire topic.
    pub topic: Option<&'a str>,
    /// Connection generation; bumps on every connect/disconnect cycle.
    pub session: Option<u64>,
}

impl<'a> LogContext<'a> {
    /// Create an empty logging context.
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach a broker address.
    pub fn with_broker(mut self, broker: &'a str) -> Self {
        self.broker = Some(broker);
        self
    }

    /// Attach a helmet identifier.
    pub fn with_device(mut self, device: &'a str) -> Self {
        self.device = Some(device);
        self
    }

    /// Attach a wire topic.
    pub fn with_topic(mut self, topic: &'a str) -> Self {
        self.topic = Some(topic);
        self
    }

    /// Attach a connection generation.
    pub fn with_session(mut self, session: u64) -> Self {
        self.session = Some(session);
        self
    }
}

/// Outcome attached to link lifecycle events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkEventOutcome {
    /// Transition completed as intended.
    Success,
    /// Transition was caused by, or ended in, a failure.
    Fault,
}

impl LinkEventOutcome {
    fn as_str(&self) -> &'static str {
        match self {
            LinkEventOutcome::Success => "success",
            LinkEventOutcome::Fault => "fault",
        }
    }
}

/// Emit a standardized link lifecycle event.
pub fn log_link_event(
    context: Option<&LogContext>,
    event: &str,
    message: &str,
    outcome: LinkEventOutcome,
) {
    let fallback = LogContext::default();
    let ctx = context.unwrap_or(&fallback);
    let broker = ctx.broker.unwrap_or("");
    let session = ctx.session.unwrap_or_default();
    // `tracing::event!` needs a constant level, hence the split.
    match outcome {
        LinkEventOutcome::Success => tracing::info!(
            event,
            outcome = outcome.as_str(),
            broker,
            session,
            message = %message
        ),
        LinkEventOutcome::Fault => tracing::error!(
            event,
            outcome = outcome.as_str(),
            broker,
            session,
            message = %message
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn macros_emit_without_panic() {
        init();
        let ctx = LogContext::new().with_device("H-01").with_topic("data");
        helmet_info!(context = ctx.clone(), "frame accepted");
        helmet_warn!("frame with {} fields dropped", 5);
        helmet_error!(context = ctx, "observer failed: {}", "boom");
    }

    #[test]
    fn link_event_helper_emits() {
        init();
        let ctx = LogContext::new()
            .with_broker("ws://localhost:9001")
            .with_session(3);
        log_link_event(
            Some(&ctx),
            "link.connected",
            "subscriptions acknowledged",
            LinkEventOutcome::Success,
        );
        log_link_event(
            None,
            "link.exhausted",
            "reconnect attempts exhausted",
            LinkEventOutcome::Fault,
        );
    }

    #[test]
    fn logging_config_defaults_when_fields_missing() {
        let config: LoggingConfig = serde_json::from_str("{}").expect("empty section parses");
        assert_eq!(config, LoggingConfig::default());
        assert_eq!(config.filter, "info");

        let json: LoggingConfig =
            serde_json::from_str(r#"{"format":"structured-json","filter":"debug"}"#)
                .expect("explicit section parses");
        assert_eq!(json.format, LogFormat::StructuredJson);
        assert_eq!(json.filter, "debug");
    }

    #[test]
    fn init_tracing_creates_log_directory() {
        let dir = tempfile::tempdir().expect("temp dir");
        let target = dir.path().join("logs");
        let config = LoggingConfig {
            directory: Some(target.clone()),
            ..LoggingConfig::default()
        };
        init_tracing("helmet-test", &config).expect("init succeeds");
        assert!(target.is_dir());
    }
}
