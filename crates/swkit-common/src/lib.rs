//! # swkit Common
//!
//! Logging configuration shared by the swkit crates.
//!
//! The worker crates only emit `tracing` events; installing a subscriber is
//! the embedding host's job, done once at startup with [`init_logging`].

pub mod logging;

pub use logging::{init_logging, LogConfig, LogFormat, LoggingError, WORKER_TARGETS};
