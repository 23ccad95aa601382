//! # Configuration
//!
//! Server configuration: defaults, file loading (YAML or JSON), environment
//! overrides and validation.

pub mod server;
