//! Event payloads delivered to observers.

use serde::{Deserialize, Serialize};

use crate::download::DownloadRecord;
use crate::permission::PermissionPrompt;

/// A state change published to the presentation layer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ShellEvent {
    /// A prompt needs a human decision.
    PermissionRequest(PermissionPrompt),
    /// A prompt was answered or timed out.
    PermissionResolved(PermissionResolved),
    DownloadStarted(DownloadRecord),
    DownloadUpdated(DownloadRecord),
    /// Terminal notification: completed, cancelled or interrupted.
    DownloadCompleted(DownloadRecord),
    /// User-visible notice, e.g. a finished download.
    Notice(Notice),
    RequestBlocked(BlockedRequest),
}

impl ShellEvent {
    /// Download id for download lifecycle events.
    pub fn download_id(&self) -> Option<&str> {
        match self {
            Self::DownloadStarted(r) | Self::DownloadUpdated(r) | Self::DownloadCompleted(r) => {
                Some(&r.id)
            }
            _ => None,
        }
    }

    pub const fn is_terminal_download_event(&self) -> bool {
        matches!(self, Self::DownloadCompleted(_))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PermissionResolved {
    pub id: String,
    pub origin: String,
    pub permission: String,
    pub allowed: bool,
    /// True when the prompt timed out without an answer.
    pub expired: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Notice {
    pub title: String,
    pub body: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BlockedRequest {
    pub url: String,
    pub resource_kind: String,
    pub rule_id: Option<String>,
}
