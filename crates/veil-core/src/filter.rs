//! Ad/tracker request filter rules.
//!
//! Classifies outgoing requests against a fixed rule set. Structural
//! resources (documents, stylesheets, scripts, data fetches) are never
//! blocked so pages keep working. For everything else rules are tested
//! cheapest first (domain, then URL substring, then regex) and the first
//! match wins.

use regex::{Regex, RegexBuilder};
use serde::{Deserialize, Serialize};
use tracing::warn;
use url::Url;

use crate::error::{Error, Result};

/// Kind of pattern a rule carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum RuleKind {
    /// Substring of the request host.
    Domain,
    /// Literal substring of the request path and query.
    UrlSubstring,
    /// Regular expression over the whole lowercased URL.
    Regex,
}

/// Filter rule definition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FilterRule {
    /// Rule identifier, reported in decisions for diagnostics.
    pub id: String,
    pub kind: RuleKind,
    pub pattern: String,
}

impl FilterRule {
    fn new(id: &str, kind: RuleKind, pattern: &str) -> Self {
        Self {
            id: id.to_string(),
            kind,
            pattern: pattern.to_string(),
        }
    }
}

/// Resource type reported by the host for a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ResourceKind {
    Document,
    SubFrame,
    Stylesheet,
    Script,
    Xhr,
    Image,
    Font,
    Media,
    Object,
    Ping,
    WebSocket,
    CspReport,
    Other,
}

impl ResourceKind {
    /// Parse a host resource type name. Unknown names map to [`Self::Other`].
    pub fn parse(name: &str) -> Self {
        match name.to_ascii_lowercase().replace(['-', '_'], "").as_str() {
            "document" | "mainframe" => Self::Document,
            "subframe" | "iframe" => Self::SubFrame,
            "stylesheet" | "style" => Self::Stylesheet,
            "script" => Self::Script,
            "xhr" | "fetch" | "xmlhttprequest" => Self::Xhr,
            "image" | "img" => Self::Image,
            "font" => Self::Font,
            "media" => Self::Media,
            "object" => Self::Object,
            "ping" | "beacon" => Self::Ping,
            "websocket" => Self::WebSocket,
            "cspreport" => Self::CspReport,
            _ => Self::Other,
        }
    }

    /// Structural resources are exempt from ad-pattern blocking.
    pub const fn is_structural(self) -> bool {
        matches!(
            self,
            Self::Document | Self::Stylesheet | Self::Script | Self::Xhr
        )
    }
}

/// Result of classifying one request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InterceptDecision {
    pub block: bool,
    pub reason: String,
    /// Rule that matched, if the request was blocked.
    pub rule_id: Option<String>,
}

impl InterceptDecision {
    pub fn allow(reason: impl Into<String>) -> Self {
        Self {
            block: false,
            reason: reason.into(),
            rule_id: None,
        }
    }

    fn block(rule: &CompiledRule) -> Self {
        Self {
            block: true,
            reason: format!("matched {} rule", rule.kind_name()),
            rule_id: Some(rule.id.clone()),
        }
    }
}

#[derive(Debug)]
enum Matcher {
    Domain(String),
    UrlSubstring(String),
    Regex(Regex),
}

#[derive(Debug)]
struct CompiledRule {
    id: String,
    matcher: Matcher,
}

impl CompiledRule {
    fn compile(rule: &FilterRule) -> Result<Self> {
        let pattern = rule.pattern.to_ascii_lowercase();
        let matcher = match rule.kind {
            RuleKind::Domain => Matcher::Domain(pattern),
            RuleKind::UrlSubstring => Matcher::UrlSubstring(pattern),
            RuleKind::Regex => {
                // Matched against the lowercased URL.
                let re = RegexBuilder::new(&rule.pattern)
                    .case_insensitive(true)
                    .build()
                    .map_err(|e| Error::FilterRule {
                        rule_id: rule.id.clone(),
                        reason: e.to_string(),
                    })?;
                Matcher::Regex(re)
            }
        };
        Ok(Self {
            id: rule.id.clone(),
            matcher,
        })
    }

    const fn kind_name(&self) -> &'static str {
        match self.matcher {
            Matcher::Domain(_) => "domain",
            Matcher::UrlSubstring(_) => "urlSubstring",
            Matcher::Regex(_) => "regex",
        }
    }

    fn matches(&self, host: &str, path_and_query: &str, full: &str) -> bool {
        match &self.matcher {
            Matcher::Domain(p) => !host.is_empty() && host.contains(p.as_str()),
            Matcher::UrlSubstring(p) => path_and_query.contains(p.as_str()),
            Matcher::Regex(re) => re.is_match(full),
        }
    }
}

/// Immutable, compiled set of filter rules.
#[derive(Debug)]
pub struct FilterRuleSet {
    rules: Vec<CompiledRule>,
}

impl Default for FilterRuleSet {
    fn default() -> Self {
        Self::builtin()
    }
}

impl FilterRuleSet {
    /// Rule set holding only the built-in rules.
    pub fn builtin() -> Self {
        let mut rules = default_rules();
        rules.sort_by_key(|r| r.kind);
        let rules = rules
            .iter()
            .filter_map(|r| match CompiledRule::compile(r) {
                Ok(c) => Some(c),
                Err(e) => {
                    warn!(rule_id = %r.id, error = %e, "Skipping built-in filter rule");
                    None
                }
            })
            .collect();
        Self { rules }
    }

    /// Compile an explicit rule list. Fails on the first invalid regex.
    pub fn with_rules(mut rules: Vec<FilterRule>) -> Result<Self> {
        rules.sort_by_key(|r| r.kind);
        let rules = rules
            .iter()
            .map(CompiledRule::compile)
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { rules })
    }

    /// Built-in rules followed by `extra`.
    pub fn with_extra(extra: &[FilterRule]) -> Result<Self> {
        let mut rules = default_rules();
        rules.extend_from_slice(extra);
        Self::with_rules(rules)
    }

    /// Classify a request.
    pub fn classify(&self, url: &str, kind: ResourceKind) -> InterceptDecision {
        if kind.is_structural() {
            return InterceptDecision::allow("structural resource");
        }

        let normalized = url.to_ascii_lowercase();
        let parsed = match Url::parse(&normalized) {
            Ok(u) => u,
            Err(e) => return InterceptDecision::allow(format!("unparseable url: {e}")),
        };

        let host = parsed.host_str().unwrap_or_default();
        let path_and_query = match parsed.query() {
            Some(q) => format!("{}?{}", parsed.path(), q),
            None => parsed.path().to_string(),
        };

        self.rules
            .iter()
            .find(|r| r.matches(host, &path_and_query, &normalized))
            .map_or_else(|| InterceptDecision::allow("no rule matched"), InterceptDecision::block)
    }

    /// Classify using a host resource type name.
    pub fn classify_named(&self, url: &str, resource_kind: &str) -> InterceptDecision {
        self.classify(url, ResourceKind::parse(resource_kind))
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }
}

/// Built-in block list.
fn default_rules() -> Vec<FilterRule> {
    const DOMAINS: &[(&str, &str)] = &[
        ("builtin-doubleclick", "doubleclick.net"),
        ("builtin-googlesyndication", "googlesyndication.com"),
        ("builtin-googleadservices", "googleadservices.com"),
        ("builtin-google-analytics", "google-analytics.com"),
        ("builtin-adservice-google", "adservice.google."),
        ("builtin-imasdk", "imasdk.googleapis.com"),
        ("builtin-2mdn", "2mdn.net"),
        ("builtin-fundingchoices", "fundingchoices.google.com"),
        ("builtin-amazon-adsystem", "amazon-adsystem.com"),
        ("builtin-adnxs", "adnxs.com"),
        ("builtin-criteo", "criteo.com"),
        ("builtin-taboola", "taboola.com"),
        ("builtin-outbrain", "outbrain.com"),
        ("builtin-scorecardresearch", "scorecardresearch.com"),
    ];
    const URL_SUBSTRINGS: &[(&str, &str)] = &[
        ("builtin-pagead", "/pagead/"),
        ("builtin-ptracking", "/ptracking"),
        ("builtin-stats-ads", "/api/stats/ads"),
        ("builtin-ads-dir", "/ads/"),
        ("builtin-adunit", "adunit"),
        ("builtin-adserver", "/adserver"),
    ];
    const REGEXES: &[(&str, &str)] = &[
        (
            "builtin-edge-ad-video",
            r"^https?://r\d+---sn-[a-z0-9-]+\.googlevideo\.com/videoplayback\?.*\b(oad|ctier)=",
        ),
        ("builtin-numbered-ad-host", r"^https?://ad[sx]?\d+\.[a-z0-9.-]+/"),
        ("builtin-ytads-thumb", r"^https?://yt\d*\.ggpht\.com/.*=ytads"),
    ];

    DOMAINS
        .iter()
        .map(|(id, p)| FilterRule::new(id, RuleKind::Domain, p))
        .chain(
            URL_SUBSTRINGS
                .iter()
                .map(|(id, p)| FilterRule::new(id, RuleKind::UrlSubstring, p)),
        )
        .chain(
            REGEXES
                .iter()
                .map(|(id, p)| FilterRule::new(id, RuleKind::Regex, p)),
        )
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blocks_doubleclick_image() {
        let rules = FilterRuleSet::builtin();
        let decision = rules.classify("https://doubleclick.net/ad.js", ResourceKind::Image);
        assert!(decision.block);
        assert_eq!(decision.rule_id.as_deref(), Some("builtin-doubleclick"));
    }

    #[test]
    fn allows_doubleclick_document() {
        let rules = FilterRuleSet::builtin();
        let decision = rules.classify("https://doubleclick.net/ad.js", ResourceKind::Document);
        assert!(!decision.block);
        assert_eq!(decision.reason, "structural resource");
    }

    #[test]
    fn structural_kinds_are_never_blocked() {
        let rules = FilterRuleSet::builtin();
        for kind in ["document", "mainFrame", "stylesheet", "script", "xhr", "fetch"] {
            let decision =
                rules.classify_named("https://pagead2.googlesyndication.com/pagead/x", kind);
            assert!(!decision.block, "{kind} must be exempt");
        }
    }

    #[test]
    fn ad_frames_are_not_exempt() {
        let rules = FilterRuleSet::builtin();
        let decision = rules.classify_named("https://ad.doubleclick.net/frame.html", "subFrame");
        assert!(decision.block);
    }

    #[test]
    fn configured_regex_ignores_case() {
        let rules = FilterRuleSet::with_extra(&[FilterRule::new(
            "ad-server",
            RuleKind::Regex,
            r"/AdServer\d+/",
        )])
        .unwrap();
        let decision = rules.classify(
            "https://cdn.example/AdServer7/banner.png",
            ResourceKind::Image,
        );
        assert!(decision.block);
        assert_eq!(decision.rule_id.as_deref(), Some("ad-server"));
    }

    #[test]
    fn url_is_lowercased_before_matching() {
        let rules = FilterRuleSet::builtin();
        let decision = rules.classify("HTTPS://STATIC.DoubleClick.NET/x.gif", ResourceKind::Image);
        assert!(decision.block);
    }

    #[test]
    fn path_substring_matches() {
        let rules = FilterRuleSet::builtin();
        let decision = rules.classify(
            "https://www.youtube.com/api/stats/ads?ver=2",
            ResourceKind::Ping,
        );
        assert!(decision.block);
        assert_eq!(decision.rule_id.as_deref(), Some("builtin-stats-ads"));
    }

    #[test]
    fn regex_matches_numbered_edge_server() {
        let rules = FilterRuleSet::builtin();
        let decision = rules.classify(
            "https://r4---sn-abc123.googlevideo.com/videoplayback?id=1&oad=1",
            ResourceKind::Media,
        );
        assert!(decision.block);
        assert_eq!(decision.rule_id.as_deref(), Some("builtin-edge-ad-video"));

        let decision = rules.classify(
            "https://r4---sn-abc123.googlevideo.com/videoplayback?id=1",
            ResourceKind::Media,
        );
        assert!(!decision.block);
    }

    #[test]
    fn malformed_url_is_allowed() {
        let rules = FilterRuleSet::builtin();
        let decision = rules.classify("not a url at all doubleclick", ResourceKind::Image);
        assert!(!decision.block);
        assert!(decision.reason.starts_with("unparseable url"));
    }

    #[test]
    fn unmatched_request_is_allowed() {
        let rules = FilterRuleSet::builtin();
        let decision = rules.classify("https://example.com/logo.png", ResourceKind::Image);
        assert_eq!(decision, InterceptDecision::allow("no rule matched"));
    }

    #[test]
    fn domain_rule_only_checks_host() {
        let rules = FilterRuleSet::with_rules(vec![FilterRule::new(
            "d",
            RuleKind::Domain,
            "tracker.example",
        )])
        .unwrap();
        assert!(
            !rules
                .classify("https://example.com/?ref=tracker.example", ResourceKind::Image)
                .block
        );
        assert!(
            rules
                .classify("https://cdn.tracker.example/p.gif", ResourceKind::Image)
                .block
        );
    }

    #[test]
    fn cheaper_rule_kinds_win() {
        let rules = FilterRuleSet::with_rules(vec![
            FilterRule::new("re", RuleKind::Regex, "ads"),
            FilterRule::new("dom", RuleKind::Domain, "ads.example"),
        ])
        .unwrap();
        let decision = rules.classify("https://ads.example/banner.png", ResourceKind::Image);
        assert_eq!(decision.rule_id.as_deref(), Some("dom"));
    }

    #[test]
    fn invalid_regex_is_rejected() {
        let err = FilterRuleSet::with_extra(&[FilterRule::new("bad", RuleKind::Regex, "(")])
            .unwrap_err();
        assert!(matches!(err, Error::FilterRule { ref rule_id, .. } if rule_id == "bad"));
    }

    #[test]
    fn extra_rules_extend_builtin() {
        let rules = FilterRuleSet::with_extra(&[FilterRule::new(
            "x",
            RuleKind::UrlSubstring,
            "/collect",
        )])
        .unwrap();
        assert_eq!(rules.len(), FilterRuleSet::builtin().len() + 1);
        assert!(
            rules
                .classify("https://stats.example/collect?v=1", ResourceKind::Ping)
                .block
        );
    }

    #[test]
    fn parses_host_resource_names() {
        assert_eq!(ResourceKind::parse("mainFrame"), ResourceKind::Document);
        assert_eq!(ResourceKind::parse("sub_frame"), ResourceKind::SubFrame);
        assert_eq!(ResourceKind::parse("XHR"), ResourceKind::Xhr);
        assert_eq!(ResourceKind::parse("webSocket"), ResourceKind::WebSocket);
        assert_eq!(ResourceKind::parse("weird"), ResourceKind::Other);
    }
}
