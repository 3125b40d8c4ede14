//! Download tracker types.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Externally visible state of a download.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DownloadState {
    Pending,
    InProgress,
    Paused,
    Interrupted,
    Completed,
    Cancelled,
}

impl DownloadState {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::InProgress => "in-progress",
            Self::Paused => "paused",
            Self::Interrupted => "interrupted",
            Self::Completed => "completed",
            Self::Cancelled => "cancelled",
        }
    }
}

/// Presentation record of one download.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DownloadRecord {
    pub id: String,
    pub filename: String,
    pub url: String,
    pub save_path: PathBuf,
    /// Zero when the host does not know the size.
    pub total_bytes: u64,
    pub received_bytes: u64,
    pub state: DownloadState,
    /// True while no bytes are being received (paused or interrupted).
    pub paused: bool,
    /// Unix milliseconds.
    pub started_at: i64,
    /// Unix milliseconds; set once the download is terminal.
    pub ended_at: Option<i64>,
    pub duration_ms: Option<u64>,
}

impl DownloadRecord {
    /// A record is terminal once it has an end stamp. `interrupted` is only
    /// terminal when the host reported it as the final state.
    pub const fn is_terminal(&self) -> bool {
        self.ended_at.is_some()
    }

    /// Completion percentage, if the total size is known.
    #[allow(clippy::cast_precision_loss)]
    pub fn progress_percent(&self) -> Option<f64> {
        (self.total_bytes > 0)
            .then(|| (self.received_bytes as f64 / self.total_bytes as f64 * 100.0).min(100.0))
    }
}

/// Host event: a transfer was created.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DownloadStart {
    pub url: String,
    pub filename: String,
    #[serde(default)]
    pub total_bytes: u64,
}

/// Transfer state as reported on a progress tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HostTransferState {
    Progressing,
    Interrupted,
}

/// Host event: a progress tick.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DownloadProgress {
    pub received_bytes: u64,
    pub state: HostTransferState,
    #[serde(default)]
    pub paused: bool,
}

/// Final state reported by the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DoneState {
    Completed,
    Cancelled,
    Interrupted,
}

/// Live control over a host transfer.
///
/// Cancellation is fire-and-forget; the resulting terminal state is observed
/// through notifications.
pub trait TransferHandle: Send + Sync {
    fn cancel(&self);

    /// Whether the host offers pause/resume for this transfer.
    fn can_pause(&self) -> bool {
        false
    }

    fn pause(&self) {}

    fn resume(&self) {}
}

/// Download operation errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DownloadError {
    #[error("Download not found: {id}")]
    NotFound { id: String },

    #[error("Download {id} already finished ({state})")]
    AlreadyTerminal { id: String, state: &'static str },

    #[error("Download {id} does not support {operation}")]
    Unsupported { id: String, operation: &'static str },
}
