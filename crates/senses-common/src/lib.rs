//! # Senses Common
//!
//! Logging configuration shared by the offline worker crates and tools.
//!
//! Every crate logs through `tracing` macros; binaries call [`init_logging`]
//! once at startup to install a subscriber.

pub mod logging;

pub use logging::{init_logging, LogConfig, LogFormat};
