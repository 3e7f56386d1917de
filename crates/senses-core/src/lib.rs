//! Senses Core Library
//!
//! This crate provides the worker configuration and the errors raised while
//! loading it.

pub mod config;
pub mod error;

pub use config::{EvictionPolicy, WorkerConfig};
pub use error::{SensesError, SensesResult};
