//! # Configuration
//!
//! Server configuration: structures, defaults, file loading and environment
//! overrides.

pub mod server;
