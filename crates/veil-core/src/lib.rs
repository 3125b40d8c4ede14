//! Veil Core Library
//!
//! Shared functionality for the Veil browser shell:
//! - Configuration resolution and hierarchy
//! - Ad/tracker filter rules
//! - Durable permission preference store
//! - Common error types

pub mod config;
pub mod error;
pub mod filter;
#[cfg(feature = "metrics")]
pub mod metrics;
pub mod store;
pub mod tracing_init;

pub use config::Config;
pub use error::{Error, Result};
pub use filter::{FilterRule, FilterRuleSet, InterceptDecision, ResourceKind, RuleKind};
pub use store::{JsonFileStore, MemoryStore, PermissionKey, PermissionMap, PermissionStore, StoreError};
