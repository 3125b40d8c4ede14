//! Permission cache types.

use serde::{Deserialize, Serialize};
use url::Url;

/// Origin used for URLs without a tuple origin (`data:`, `file:`, garbage).
/// Decisions for it are never read from or written to the store.
pub const OPAQUE_ORIGIN: &str = "null";

/// A page asking for a capability.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PermissionRequest {
    /// URL of the requesting page.
    pub url: String,
    /// Permission kind, e.g. `geolocation`.
    pub permission: String,
}

/// A prompt shown to the user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PermissionPrompt {
    pub id: String,
    pub origin: String,
    pub permission: String,
    pub url: String,
    /// Display name of the permission kind.
    pub label: String,
}

/// Human answer to a prompt.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PermissionResponse {
    pub request_id: String,
    pub allowed: bool,
    /// Persist the decision for later requests from the same origin.
    #[serde(default)]
    pub remember: bool,
}

/// A remembered decision.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PermissionRecord {
    pub origin: String,
    pub permission: String,
    pub allowed: bool,
    /// Unix milliseconds at which the decision was recorded.
    pub recorded_at: i64,
}

/// How a permission request was resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PermissionOutcome {
    /// Answered by the store (`cached`) or by a human.
    Decided { allowed: bool, cached: bool },
    /// Nobody answered before the deadline. Treated as a denial.
    Expired,
}

impl PermissionOutcome {
    pub const fn allowed(self) -> bool {
        match self {
            Self::Decided { allowed, .. } => allowed,
            Self::Expired => false,
        }
    }
}

/// Result of processing a human response.
#[derive(Debug)]
pub struct ProcessedResponse {
    /// The prompt that was answered.
    pub prompt: PermissionPrompt,
    pub allowed: bool,
    /// The stored record, when the answer was remembered and persisted.
    pub record: Option<PermissionRecord>,
}

/// Permission cache errors.
#[derive(Debug, thiserror::Error)]
pub enum PermissionError {
    #[error("Permission request not found: {request_id}")]
    RequestNotFound { request_id: String },

    #[error("Permission storage error: {0}")]
    Storage(String),

    #[error("Invalid permission key: {0}")]
    InvalidKey(String),
}

/// Derive `scheme://host[:port]` from a page URL.
///
/// Returns `None` for opaque origins.
pub fn origin_of(url: &str) -> Option<String> {
    let origin = Url::parse(url).ok()?.origin();
    origin.is_tuple().then(|| origin.ascii_serialization())
}

/// Display name for a permission kind.
pub fn permission_label(permission: &str) -> &str {
    match permission {
        "notifications" => "Notifications",
        "geolocation" => "Location",
        "media" => "Camera/Microphone",
        "midi" | "midiSysex" => "MIDI",
        "pointerLock" => "Pointer Lock",
        "fullscreen" => "Fullscreen",
        "openExternal" => "Open External Links",
        "clipboard-read" => "Clipboard",
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn origin_keeps_non_default_port() {
        assert_eq!(
            origin_of("https://maps.example.com:8443/place?q=1").as_deref(),
            Some("https://maps.example.com:8443")
        );
        assert_eq!(
            origin_of("https://maps.example.com:443/x").as_deref(),
            Some("https://maps.example.com")
        );
    }

    #[test]
    fn opaque_urls_have_no_origin() {
        assert_eq!(origin_of("data:text/html,hi"), None);
        assert_eq!(origin_of("not a url"), None);
    }

    #[test]
    fn labels_fall_back_to_the_kind() {
        assert_eq!(permission_label("geolocation"), "Location");
        assert_eq!(permission_label("media"), "Camera/Microphone");
        assert_eq!(permission_label("bluetooth"), "bluetooth");
    }

    #[test]
    fn expired_counts_as_denied() {
        assert!(!PermissionOutcome::Expired.allowed());
        assert!(
            PermissionOutcome::Decided {
                allowed: true,
                cached: false
            }
            .allowed()
        );
    }
}
