//! Tracing setup for the relay daemon.
//!
//! A `RUST_LOG` value takes precedence; otherwise the filter is built from
//! the configured level, with the relay crates raised to `debug` when
//! message-flow diagnostics are enabled.

use serde::{Deserialize, Serialize};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{reload, EnvFilter};

#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum LogLevel {
    Error,
    Warn,
    #[default]
    Info,
    Debug,
    Trace,
}

impl LogLevel {
    pub fn as_directive(self) -> &'static str {
        match self {
            Self::Error => "error",
            Self::Warn => "warn",
            Self::Info => "info",
            Self::Debug => "debug",
            Self::Trace => "trace",
        }
    }
}

#[derive(Clone, Debug, Default)]
pub struct LoggingConfig {
    pub level: LogLevel,
    /// Raise the relay crates to debug for per-message flow diagnostics
    /// (`MESSAGE_FLOW_LOG`).
    pub message_flow: bool,
}

#[derive(Debug, thiserror::Error)]
#[error("logging init failed: {0}")]
pub struct LoggingError(String);

#[derive(Clone)]
pub struct LoggingHandle {
    filter: reload::Handle<EnvFilter, tracing_subscriber::Registry>,
}

impl LoggingHandle {
    pub fn set_level(&self, level: LogLevel) -> Result<(), LoggingError> {
        self.filter
            .modify(|filter| {
                *filter = EnvFilter::new(level.as_directive());
            })
            .map_err(|err| LoggingError(format!("reload filter failed: {err}")))
    }
}

pub fn init_logging(config: LoggingConfig) -> Result<LoggingHandle, LoggingError> {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(build_directives(&config)));
    let (filter_layer, filter_handle) = reload::Layer::new(env_filter);

    tracing_subscriber::registry()
        .with(filter_layer)
        .with(tracing_subscriber::fmt::layer().with_target(true))
        .try_init()
        .map_err(|err| LoggingError(err.to_string()))?;

    Ok(LoggingHandle {
        filter: filter_handle,
    })
}

fn build_directives(config: &LoggingConfig) -> String {
    let base = config.level.as_directive();
    if config.message_flow {
        format!("{base},relayd=debug,gateway=debug,common=debug")
    } else {
        base.to_string()
    }
}
