//! Core bag types shared by the application and infrastructure layers.

pub mod errors;
pub mod model;
