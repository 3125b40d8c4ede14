//! Request interceptor.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};

use tracing::{debug, info, warn};

use veil_core::config::Config;
use veil_core::{FilterRuleSet, InterceptDecision, ResourceKind};

use super::types::{
    HeaderPolicy, InterceptorStats, OutgoingRequest, RequestVerdict, ThirdPartyBlocker,
};
use crate::events::{BlockedRequest, EventBus, ShellEvent};

/// Applies the header policy and the filter rules to outgoing requests.
pub struct RequestInterceptor {
    rules: FilterRuleSet,
    headers: HeaderPolicy,
    enabled: bool,
    inspected: AtomicU64,
    blocked: AtomicU64,
    events: EventBus,
}

impl RequestInterceptor {
    pub fn new(rules: FilterRuleSet, headers: HeaderPolicy, events: EventBus) -> Self {
        Self {
            rules,
            headers,
            enabled: true,
            inspected: AtomicU64::new(0),
            blocked: AtomicU64::new(0),
            events,
        }
    }

    /// Build from configuration: built-in rules plus configured extras.
    pub fn from_config(config: &Config, events: EventBus) -> veil_core::Result<Self> {
        let rules = FilterRuleSet::with_extra(&config.filters.extra_rules)?;
        info!(
            rules = rules.len(),
            enabled = config.filters.enabled,
            "Request filter ready"
        );
        let mut interceptor =
            Self::new(rules, HeaderPolicy::from_config(&config.shell), events);
        interceptor.enabled = config.filters.enabled;
        Ok(interceptor)
    }

    /// Rewrite request headers: force the configured User-Agent and drop the
    /// client-hint headers. Applies to every request.
    pub fn on_before_send_headers(
        &self,
        mut headers: BTreeMap<String, String>,
    ) -> BTreeMap<String, String> {
        headers.retain(|name, _| {
            !name.eq_ignore_ascii_case("user-agent")
                && !self
                    .headers
                    .stripped
                    .iter()
                    .any(|h| h.eq_ignore_ascii_case(name))
        });
        headers.insert("User-Agent".to_string(), self.headers.user_agent.clone());
        headers
    }

    /// Decide whether a request goes out.
    pub fn on_before_request(&self, request: &OutgoingRequest) -> RequestVerdict {
        self.inspected.fetch_add(1, Ordering::Relaxed);

        if !self.enabled {
            return RequestVerdict {
                cancel: false,
                decision: InterceptDecision::allow("filtering disabled"),
            };
        }

        let kind = ResourceKind::parse(&request.resource_kind);
        let decision = self.rules.classify(&request.url, kind);

        if decision.block {
            let total = self.blocked.fetch_add(1, Ordering::Relaxed) + 1;
            let rule_id = decision.rule_id.as_deref().unwrap_or_default();
            info!(
                url = %request.url,
                resource_kind = ?kind,
                rule_id,
                total,
                "Blocked request"
            );
            #[cfg(feature = "metrics")]
            veil_core::metrics::record_blocked_request(rule_id);
            self.events.publish(ShellEvent::RequestBlocked(BlockedRequest {
                url: request.url.clone(),
                resource_kind: request.resource_kind.clone(),
                rule_id: decision.rule_id.clone(),
            }));
        } else {
            debug!(url = %request.url, reason = %decision.reason, "Request allowed");
        }

        RequestVerdict {
            cancel: decision.block,
            decision,
        }
    }

    /// Hand the session to an external blocklist engine. Failures are logged
    /// and leave the built-in rules in charge.
    pub fn enable_third_party_blocking(
        &self,
        blocker: &dyn ThirdPartyBlocker,
        session_scope: &str,
    ) -> bool {
        match blocker.enable(session_scope) {
            Ok(()) => {
                info!(engine = blocker.name(), session_scope, "Third-party blocking enabled");
                true
            }
            Err(e) => {
                warn!(
                    engine = blocker.name(),
                    session_scope,
                    error = %e,
                    "Third-party blocking unavailable, using built-in rules only"
                );
                false
            }
        }
    }

    pub fn stats(&self) -> InterceptorStats {
        InterceptorStats {
            inspected: self.inspected.load(Ordering::Relaxed),
            blocked: self.blocked.load(Ordering::Relaxed),
        }
    }

    pub const fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub const fn rules(&self) -> &FilterRuleSet {
        &self.rules
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;
    use veil_core::config::DEFAULT_USER_AGENT;

    fn interceptor() -> (RequestInterceptor, EventBus) {
        let events = EventBus::new(16);
        let interceptor = RequestInterceptor::new(
            FilterRuleSet::builtin(),
            HeaderPolicy::default(),
            events.clone(),
        );
        (interceptor, events)
    }

    fn request(url: &str, kind: &str) -> OutgoingRequest {
        OutgoingRequest {
            id: "1".into(),
            url: url.into(),
            method: "GET".into(),
            resource_kind: kind.into(),
            headers: BTreeMap::new(),
        }
    }

    #[test]
    fn ad_image_is_cancelled_and_reported() {
        let (interceptor, events) = interceptor();
        let mut rx = events.subscribe();

        let verdict =
            interceptor.on_before_request(&request("https://ad.doubleclick.net/x.gif", "image"));

        assert!(verdict.cancel);
        assert_eq!(verdict.decision.rule_id.as_deref(), Some("builtin-doubleclick"));
        assert_eq!(interceptor.stats(), InterceptorStats { inspected: 1, blocked: 1 });
        match rx.try_recv().unwrap() {
            ShellEvent::RequestBlocked(blocked) => {
                assert_eq!(blocked.url, "https://ad.doubleclick.net/x.gif");
                assert_eq!(blocked.rule_id.as_deref(), Some("builtin-doubleclick"));
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn documents_are_never_cancelled() {
        let (interceptor, events) = interceptor();
        let mut rx = events.subscribe();

        let verdict = interceptor
            .on_before_request(&request("https://ad.doubleclick.net/page", "mainFrame"));

        assert!(!verdict.cancel);
        assert_eq!(interceptor.stats().blocked, 0);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn disabled_filter_allows_everything() {
        let mut config = Config::default();
        config.filters.enabled = false;
        let interceptor = RequestInterceptor::from_config(&config, EventBus::new(4)).unwrap();

        let verdict =
            interceptor.on_before_request(&request("https://ad.doubleclick.net/x.gif", "image"));
        assert!(!verdict.cancel);
        assert_eq!(verdict.decision.reason, "filtering disabled");
        assert_eq!(interceptor.stats().inspected, 1);
    }

    #[test]
    fn headers_are_rewritten_case_insensitively() {
        let (interceptor, _events) = interceptor();
        let mut headers = BTreeMap::new();
        headers.insert("user-agent".to_string(), "Chrome/120".to_string());
        headers.insert("sec-ch-ua".to_string(), "\"Chromium\"".to_string());
        headers.insert("SEC-CH-UA-PLATFORM".to_string(), "\"Windows\"".to_string());
        headers.insert("Accept".to_string(), "*/*".to_string());

        let rewritten = interceptor.on_before_send_headers(headers);

        assert_eq!(rewritten.len(), 2);
        assert_eq!(rewritten.get("User-Agent").map(String::as_str), Some(DEFAULT_USER_AGENT));
        assert_eq!(rewritten.get("Accept").map(String::as_str), Some("*/*"));
    }

    #[test]
    fn user_agent_is_added_when_missing() {
        let (interceptor, _events) = interceptor();
        let rewritten = interceptor.on_before_send_headers(BTreeMap::new());
        assert_eq!(rewritten.get("User-Agent").map(String::as_str), Some(DEFAULT_USER_AGENT));
    }

    struct Blocker {
        fail: bool,
        enabled: AtomicBool,
    }

    impl ThirdPartyBlocker for Blocker {
        fn name(&self) -> &str {
            "test-blocklist"
        }

        fn enable(&self, _session_scope: &str) -> anyhow::Result<()> {
            if self.fail {
                anyhow::bail!("lists could not be fetched");
            }
            self.enabled.store(true, Ordering::SeqCst);
            Ok(())
        }
    }

    #[test]
    fn third_party_failure_is_not_fatal() {
        let (interceptor, _events) = interceptor();
        let failing = Blocker {
            fail: true,
            enabled: AtomicBool::new(false),
        };
        let working = Blocker {
            fail: false,
            enabled: AtomicBool::new(false),
        };

        assert!(!interceptor.enable_third_party_blocking(&failing, "persist:main"));
        assert!(interceptor.enable_third_party_blocking(&working, "persist:main"));
        assert!(working.enabled.load(Ordering::SeqCst));

        // Built-in rules keep working either way.
        let verdict =
            interceptor.on_before_request(&request("https://ad.doubleclick.net/x.gif", "image"));
        assert!(verdict.cancel);
    }
}
