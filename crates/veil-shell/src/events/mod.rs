//! Notification fan-out.
//!
//! State transitions of the interceptor, permission cache and download
//! tracker are published here and delivered to every subscriber.

mod bus;
mod types;

pub use bus::EventBus;
pub use types::{BlockedRequest, Notice, PermissionResolved, ShellEvent};
