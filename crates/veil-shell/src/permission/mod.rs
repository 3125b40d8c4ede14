//! Permission decision cache.
//!
//! Remembers per-origin permission decisions in a durable store and prompts
//! the user, through the event bus, when nothing is stored.

mod engine;
mod pending;
mod types;

pub use engine::PermissionCache;
pub use pending::{PendingManager, PendingPrompt, Registration};
pub use types::{
    OPAQUE_ORIGIN, PermissionError, PermissionOutcome, PermissionPrompt, PermissionRecord,
    PermissionRequest, PermissionResponse, ProcessedResponse, origin_of, permission_label,
};
