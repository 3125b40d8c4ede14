//! Outgoing request interception: header rewriting and ad/tracker blocking.

mod pipeline;
mod types;

pub use pipeline::RequestInterceptor;
pub use types::{HeaderPolicy, InterceptorStats, OutgoingRequest, RequestVerdict, ThirdPartyBlocker};
