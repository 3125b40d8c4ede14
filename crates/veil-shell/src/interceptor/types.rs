//! Interceptor types.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use veil_core::InterceptDecision;
use veil_core::config::ShellConfig;

/// An outbound request as delivered by the host request pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutgoingRequest {
    /// Host-assigned id, echoed back in the verdict.
    #[serde(default)]
    pub id: String,
    pub url: String,
    #[serde(default = "default_method")]
    pub method: String,
    /// Host resource type name, e.g. `image` or `mainFrame`.
    #[serde(default)]
    pub resource_kind: String,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
}

fn default_method() -> String {
    "GET".to_string()
}

/// Allow/cancel answer for one request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestVerdict {
    pub cancel: bool,
    pub decision: InterceptDecision,
}

/// Header rewrite applied to every request.
#[derive(Debug, Clone)]
pub struct HeaderPolicy {
    pub user_agent: String,
    /// Removed case-insensitively.
    pub stripped: Vec<String>,
}

impl HeaderPolicy {
    pub fn from_config(config: &ShellConfig) -> Self {
        Self {
            user_agent: config.user_agent.clone(),
            stripped: config.stripped_headers.clone(),
        }
    }
}

impl Default for HeaderPolicy {
    fn default() -> Self {
        Self::from_config(&ShellConfig::default())
    }
}

/// Snapshot of interceptor counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InterceptorStats {
    pub inspected: u64,
    pub blocked: u64,
}

/// External blocklist engine layered on top of the built-in rules.
pub trait ThirdPartyBlocker: Send + Sync {
    fn name(&self) -> &str;

    /// Attach the engine to a browsing session.
    fn enable(&self, session_scope: &str) -> anyhow::Result<()>;
}
