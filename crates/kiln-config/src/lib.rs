//! # Kiln Config
//!
//! Configuration management for Kiln.
//! Supports layered configuration from files, environment variables,
//! and runtime reload.

mod app_config;
mod loader;

pub use app_config::*;
pub use loader::*;
