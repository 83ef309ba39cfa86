//! # Kiln Server Library
//!
//! The worker process: application job types and startup wiring.

pub mod startup;
pub mod tasks;
