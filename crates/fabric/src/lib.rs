//! Fabric Manager
//!
//! Application side of the fabric runtime:
//! - Manager configuration (file, environment, CLI)
//! - Built-in apps and the catalog that resolves them

pub use fabric_runtime;

// Manager configuration
pub mod config;

// Built-in apps
pub mod apps;
