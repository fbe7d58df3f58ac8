//! Subscriber setup for hosts embedding the worker.
//!
//! The worker crates log under their own targets ([`WORKER_TARGETS`]). A
//! [`LogConfig`] gives those targets one level and everything else (the HTTP
//! client, the host) a quieter one. `RUST_LOG`, when set, overrides both.

use thiserror::Error;
use tracing::Level;
use tracing_subscriber::{
    filter::ParseError,
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::{SubscriberInitExt, TryInitError},
    EnvFilter,
};

/// Targets the worker crates emit under.
pub const WORKER_TARGETS: [&str; 2] = ["swkit_sw", "swkit_net"];

#[derive(Error, Debug)]
pub enum LoggingError {
    #[error("Invalid log directive: {0}")]
    Directive(#[from] ParseError),

    #[error("Subscriber already installed: {0}")]
    AlreadyInstalled(#[from] TryInitError),
}

/// Log output format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LogFormat {
    /// Human-readable, for development.
    #[default]
    Pretty,
    /// One JSON object per line, for log shipping.
    Json,
}

/// Logging configuration.
#[derive(Debug, Clone)]
pub struct LogConfig {
    /// Level for the worker's own targets.
    pub worker_level: Level,
    /// Level for every other target.
    pub default_level: Level,
    pub format: LogFormat,
    /// Report when the per-generation worker span opens and closes.
    pub lifecycle_spans: bool,
    /// Directives appended after the generated ones, e.g. `"hyper=error"`.
    pub extra_directives: Vec<String>,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            worker_level: Level::INFO,
            default_level: Level::WARN,
            format: LogFormat::Pretty,
            lifecycle_spans: false,
            extra_directives: Vec::new(),
        }
    }
}

impl LogConfig {
    /// Routing decisions and cache hits/misses, with lifecycle spans.
    pub fn verbose() -> Self {
        Self {
            worker_level: Level::DEBUG,
            lifecycle_spans: true,
            ..Default::default()
        }
    }

    pub fn production() -> Self {
        Self {
            format: LogFormat::Json,
            ..Default::default()
        }
    }

    pub fn with_directive(mut self, directive: impl Into<String>) -> Self {
        self.extra_directives.push(directive.into());
        self
    }

    /// Filter directives for this config, as `RUST_LOG` would spell them.
    pub fn directives(&self) -> String {
        let worker = self.worker_level.as_str().to_ascii_lowercase();
        let mut parts = vec![self.default_level.as_str().to_ascii_lowercase()];
        parts.extend(WORKER_TARGETS.iter().map(|target| format!("{target}={worker}")));
        parts.extend(self.extra_directives.iter().cloned());
        parts.join(",")
    }

    fn configured_filter(&self) -> Result<EnvFilter, ParseError> {
        EnvFilter::try_new(self.directives())
    }
}

/// Install the global subscriber described by `config`.
///
/// Fails with [`LoggingError::AlreadyInstalled`] when a subscriber is
/// already set; test harnesses call this repeatedly and ignore that.
pub fn init_logging(config: LogConfig) -> Result<(), LoggingError> {
    let filter = match EnvFilter::try_from_default_env() {
        Ok(from_env) => from_env,
        Err(_) => config.configured_filter()?,
    };

    let span_events = if config.lifecycle_spans {
        FmtSpan::NEW | FmtSpan::CLOSE
    } else {
        FmtSpan::NONE
    };

    let registry = tracing_subscriber::registry().with(filter);
    match config.format {
        LogFormat::Pretty => registry
            .with(fmt::layer().with_target(true).with_span_events(span_events))
            .try_init()?,
        LogFormat::Json => registry
            .with(fmt::layer().json().with_span_events(span_events))
            .try_init()?,
    }
    Ok(())
}
