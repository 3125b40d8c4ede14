//! Veil Shell Library
//!
//! Runtime core of the Veil browser shell:
//! - Request interception (header policy and ad/tracker blocking)
//! - Per-origin permission decisions with a durable store
//! - Download lifecycle tracking
//! - Event fan-out to the presentation layer
//! - Newline-delimited JSON bridge to the embedding host

pub mod bridge;
pub mod download;
pub mod events;
pub mod interceptor;
pub mod permission;
pub mod shell;

pub use shell::{ExtensionLoader, Shell};

/// Current wall-clock time in Unix milliseconds.
pub(crate) fn unix_millis() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| i64::try_from(d.as_millis()).unwrap_or(i64::MAX))
        .unwrap_or_default()
}
