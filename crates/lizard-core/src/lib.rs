//! Lizard Tap Core Library
//!
//! This crate provides the shared configuration and top-level error type for
//! the offline cache crates.

pub mod config;
pub mod error;

pub use config::{NotificationConfig, OfflineConfig};
pub use error::{LizardError, LizardResult};
