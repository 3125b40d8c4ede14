//! Newline-delimited JSON bridge to the embedding host.
//!
//! The host feeds requests, transfer events and presentation commands in on
//! one stream; verdicts, transfer commands, command results and every shell
//! event come back out on the other.

mod host;
mod protocol;

pub use host::{BridgeTransfer, HostBridge, Outbox};
pub use protocol::{BridgeError, HostMessage, HostReply, TransferCommand, parse_line};
