//! Bridge wire format.

use std::collections::BTreeMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::download::{DoneState, HostTransferState};
use crate::interceptor::OutgoingRequest;
use crate::permission::PermissionResponse;

/// Bridge errors.
#[derive(Debug, thiserror::Error)]
pub enum BridgeError {
    #[error("Malformed bridge message: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("Bridge message is missing its 'type' field")]
    MissingType,

    #[error("Bridge I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// A message from the host.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum HostMessage {
    /// Outbound request awaiting header rewrite and a verdict.
    Request(OutgoingRequest),
    DownloadStarted {
        transfer_id: String,
        url: String,
        filename: String,
        #[serde(default)]
        total_bytes: u64,
        /// Whether the host can pause and resume this transfer.
        #[serde(default)]
        can_pause: bool,
    },
    DownloadProgress {
        transfer_id: String,
        received_bytes: u64,
        state: HostTransferState,
        #[serde(default)]
        paused: bool,
    },
    DownloadDone {
        transfer_id: String,
        state: DoneState,
    },
    PermissionRequest {
        /// Host correlation id, echoed in the decision.
        request_id: String,
        url: String,
        permission: String,
    },
    PermissionResponse(PermissionResponse),
    CancelDownload {
        id: String,
    },
    PauseDownload {
        id: String,
    },
    ResumeDownload {
        id: String,
    },
    ClearCompletedDownloads,
    ListDownloads,
    GetPermissionPreferences,
    SetPermissionPreference {
        origin: String,
        permission: String,
        allowed: bool,
    },
    RemovePermissionPreference {
        key: String,
    },
    ClearPermissionPreferences,
    #[serde(other)]
    Unknown,
}

/// Command for a host transfer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "action", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum TransferCommand {
    SetSavePath { path: PathBuf },
    Cancel,
    Pause,
    Resume,
}

/// A reply to the host. Shell events are written alongside these.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum HostReply {
    RequestVerdict {
        id: String,
        cancel: bool,
        reason: String,
        rule_id: Option<String>,
        request_headers: BTreeMap<String, String>,
    },
    PermissionDecision {
        request_id: String,
        allowed: bool,
        expired: bool,
    },
    TransferCommand {
        transfer_id: String,
        download_id: String,
        command: TransferCommand,
    },
    CommandResult {
        command: String,
        ok: bool,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        data: Option<serde_json::Value>,
    },
}

/// Parse one input line. Blank lines yield `None`.
pub fn parse_line(line: &str) -> Result<Option<HostMessage>, BridgeError> {
    let line = line.trim();
    if line.is_empty() {
        return Ok(None);
    }
    let raw: serde_json::Value = serde_json::from_str(line)?;
    if raw.get("type").and_then(serde_json::Value::as_str).is_none() {
        return Err(BridgeError::MissingType);
    }
    Ok(Some(serde_json::from_value(raw)?))
}
