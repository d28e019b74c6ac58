//! Core functionality shared across the trustforge workspace.
//!
//! This crate provides configuration loading, logging initialization, the
//! shared error type and clock helpers used by the identity and registry
//! crates.

pub mod clock;
pub mod config;
pub mod error;
pub mod logging;

pub use config::{Config, DataStoreConfig, GlobalConfig, PluginSection};
pub use error::{CoreError, Result};
