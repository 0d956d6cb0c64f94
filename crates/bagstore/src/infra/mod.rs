//! Infrastructure adapters for bag files and configuration.

pub mod config;
pub mod store;
