//! Shared configuration, error types, scratch identifiers, and metrics for nanoquery crates.
//!
//! Architecture role:
//! - defines engine configuration passed across storage/join/planner/executor layers
//! - provides the common [`NqError`] / [`Result`] contracts
//! - hosts the prometheus-backed metrics registry
//!
//! Key modules:
//! - [`config`]
//! - [`error`]
//! - [`ids`]
//! - [`metrics`]

pub mod config;
pub mod error;
pub mod ids;
pub mod metrics;

pub use config::EngineConfig;
pub use error::{NqError, Result};
pub use ids::*;
pub use metrics::{global_metrics, MetricsRegistry};
