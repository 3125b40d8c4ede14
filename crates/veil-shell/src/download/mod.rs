//! Download lifecycle tracking.
//!
//! Owns the state machine of every transfer the host starts, holds the live
//! transfer handles in a side table, and evicts finished records after a
//! grace period.

mod format;
mod tracker;
mod types;

pub use format::{format_bytes, format_duration};
pub use tracker::{DownloadTracker, TrackerConfig};
pub use types::{
    DoneState, DownloadError, DownloadProgress, DownloadRecord, DownloadStart, DownloadState,
    HostTransferState, TransferHandle,
};
