//! Application layer: bag lifecycle and features built on top of bag entries.

pub mod bag;
pub mod env_export;
