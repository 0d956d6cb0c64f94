//! User-facing entry points.

pub mod cli;
