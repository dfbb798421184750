//! Configuration module
//!
//! Handles loading relay server settings.

mod relay;

pub use relay::*;
