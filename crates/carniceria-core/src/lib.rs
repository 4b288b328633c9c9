//! Carnicería Core Library
//!
//! This crate provides the offline worker configuration and its errors.

pub mod config;
pub mod error;

pub use config::{NotificationConfig, WorkerConfig, DEFAULT_CACHE_NAME};
pub use error::{ConfigError, ConfigResult};
