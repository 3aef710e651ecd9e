//! Strata Common - Shared types and utilities
//!
//! This crate provides the error taxonomy, configuration, logical clock,
//! bucket path type and checksummed file framing used across all Strata
//! components.

pub mod config;
pub mod error;
pub mod persist;
pub mod timestamp;
pub mod types;

pub use config::Config;
pub use error::{Error, Result};
pub use timestamp::{Timestamp, TimestampGenerator};
pub use types::*;
