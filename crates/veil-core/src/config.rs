//! Configuration resolution for Veil.
//!
//! Implements hierarchical config resolution:
//! 1. Built-in defaults
//! 2. Global config (~/.config/veil/settings.json)
//! 3. Project config (.veil/settings.json)
//! 4. Environment variables
//! 5. CLI arguments (highest priority, applied by the binary)

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{Error, Result};
use crate::filter::FilterRule;

/// User agent sent on every outgoing request of the managed session.
pub const DEFAULT_USER_AGENT: &str =
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64; rv:115.0) Gecko/20100101 Firefox/115.0";

/// Client-hint headers removed from every outgoing request.
pub const DEFAULT_STRIPPED_HEADERS: &[&str] = &[
    "Sec-CH-UA",
    "Sec-CH-UA-Mobile",
    "Sec-CH-UA-Platform",
    "Sec-CH-UA-Full-Version-List",
];

/// Complete Veil configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub shell: ShellConfig,
    #[serde(default)]
    pub downloads: DownloadConfig,
    #[serde(default)]
    pub permissions: PermissionConfig,
    #[serde(default)]
    pub filters: FilterConfig,
    #[serde(default)]
    pub feature_flags: std::collections::HashMap<String, bool>,
}

/// Shell-wide settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShellConfig {
    pub log_level: String,
    /// Session partition the interceptor and blockers attach to.
    pub session_partition: String,
    pub user_agent: String,
    pub stripped_headers: Vec<String>,
    /// Event fan-out channel capacity.
    pub event_capacity: usize,
}

impl Default for ShellConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            session_partition: "persist:main".to_string(),
            user_agent: DEFAULT_USER_AGENT.to_string(),
            stripped_headers: DEFAULT_STRIPPED_HEADERS
                .iter()
                .map(|h| (*h).to_string())
                .collect(),
            event_capacity: 256,
        }
    }
}

/// Download tracking configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DownloadConfig {
    /// Directory new downloads are saved into. Defaults to the platform
    /// downloads directory.
    pub directory: Option<PathBuf>,
    /// Seconds a finished download stays visible before eviction.
    pub grace_period_secs: u64,
}

impl Default for DownloadConfig {
    fn default() -> Self {
        Self {
            directory: None,
            grace_period_secs: 60,
        }
    }
}

impl DownloadConfig {
    pub const fn grace_period(&self) -> Duration {
        Duration::from_secs(self.grace_period_secs)
    }

    /// Resolve the downloads directory, falling back to the platform default
    /// and finally to the temp directory.
    pub fn resolved_directory(&self) -> PathBuf {
        self.directory
            .clone()
            .or_else(dirs::download_dir)
            .or_else(|| dirs::home_dir().map(|h| h.join("Downloads")))
            .unwrap_or_else(std::env::temp_dir)
    }
}

/// Permission prompt configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PermissionConfig {
    /// Seconds to wait for a human answer before implicitly denying.
    pub prompt_timeout_secs: u64,
    /// Path of the JSON preference file.
    pub store_path: Option<PathBuf>,
}

impl Default for PermissionConfig {
    fn default() -> Self {
        Self {
            prompt_timeout_secs: 30,
            store_path: None,
        }
    }
}

impl PermissionConfig {
    pub const fn prompt_timeout(&self) -> Duration {
        Duration::from_secs(self.prompt_timeout_secs)
    }

    pub fn resolved_store_path(&self) -> Option<PathBuf> {
        self.store_path
            .clone()
            .or_else(|| data_dir().map(|d| d.join("permissions.json")))
    }
}

/// Request filter configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FilterConfig {
    /// When false, every request is allowed without classification.
    pub enabled: bool,
    /// Rules appended after the built-in set.
    #[serde(default)]
    pub extra_rules: Vec<FilterRule>,
}

impl Default for FilterConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            extra_rules: Vec::new(),
        }
    }
}

/// Load configuration with hierarchical resolution.
pub fn load_config(project_dir: Option<&Path>) -> Result<Config> {
    let mut config = Config::default();

    if let Some(global_path) = global_config_path()
        && global_path.exists()
    {
        let global = load_config_file(&global_path)?;
        merge_config(&mut config, global);
    }

    if let Some(dir) = project_dir {
        let project_path = dir.join(".veil").join("settings.json");
        if project_path.exists() {
            let project = load_config_file(&project_path)?;
            merge_config(&mut config, project);
        }
    }

    apply_env_overrides(&mut config);

    Ok(config)
}

/// Get the global config file path.
pub fn global_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|p| p.join("veil").join("settings.json"))
}

/// Directory for persisted shell state.
pub fn data_dir() -> Option<PathBuf> {
    dirs::data_dir().map(|p| p.join("veil"))
}

/// Read a single config file.
pub fn load_config_file(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path).map_err(|e| {
        Error::Config(format!("Failed to read config file {}: {}", path.display(), e))
    })?;
    serde_json::from_str(&content).map_err(|e| {
        Error::Config(format!("Failed to parse config file {}: {}", path.display(), e))
    })
}

/// Overlay `overlay` onto `base`. Extra filter rules and feature flags accumulate.
pub fn merge_config(base: &mut Config, overlay: Config) {
    base.shell = overlay.shell;

    if overlay.downloads.directory.is_some() {
        base.downloads.directory = overlay.downloads.directory;
    }
    base.downloads.grace_period_secs = overlay.downloads.grace_period_secs;

    if overlay.permissions.store_path.is_some() {
        base.permissions.store_path = overlay.permissions.store_path;
    }
    base.permissions.prompt_timeout_secs = overlay.permissions.prompt_timeout_secs;

    base.filters.enabled = overlay.filters.enabled;
    base.filters.extra_rules.extend(overlay.filters.extra_rules);

    base.feature_flags.extend(overlay.feature_flags);
}

fn apply_env_overrides(config: &mut Config) {
    if let Ok(val) = std::env::var("VEIL_LOG_LEVEL") {
        config.shell.log_level = val;
    }
    if let Ok(val) = std::env::var("VEIL_USER_AGENT") {
        config.shell.user_agent = val;
    }
    if let Ok(val) = std::env::var("VEIL_DOWNLOADS_DIR") {
        config.downloads.directory = Some(PathBuf::from(val));
    }
    if let Ok(val) = std::env::var("VEIL_PROMPT_TIMEOUT")
        && let Ok(n) = val.parse()
    {
        config.permissions.prompt_timeout_secs = n;
    }
    if let Ok(val) = std::env::var("VEIL_PERMISSIONS_FILE") {
        config.permissions.store_path = Some(PathBuf::from(val));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filter::RuleKind;

    #[test]
    fn default_config_has_30s_prompt_timeout() {
        let config = Config::default();
        assert_eq!(config.permissions.prompt_timeout(), Duration::from_secs(30));
    }

    #[test]
    fn default_config_has_60s_grace_period() {
        let config = Config::default();
        assert_eq!(config.downloads.grace_period(), Duration::from_secs(60));
    }

    #[test]
    fn default_shell_strips_client_hints() {
        let config = Config::default();
        assert_eq!(config.shell.stripped_headers.len(), 4);
        assert!(config.shell.user_agent.contains("Firefox/115.0"));
        assert_eq!(config.shell.session_partition, "persist:main");
    }

    #[test]
    fn explicit_download_directory_wins() {
        let config = DownloadConfig {
            directory: Some(PathBuf::from("/srv/dl")),
            ..Default::default()
        };
        assert_eq!(config.resolved_directory(), PathBuf::from("/srv/dl"));
    }

    #[test]
    fn partial_file_uses_defaults_for_missing_sections() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(
            &path,
            r#"{
                "permissions": { "prompt_timeout_secs": 5, "store_path": null },
                "filters": {
                    "enabled": true,
                    "extra_rules": [
                        { "id": "x-tracker", "kind": "domain", "pattern": "tracker.example" }
                    ]
                }
            }"#,
        )
        .unwrap();

        let config = load_config_file(&path).unwrap();
        assert_eq!(config.permissions.prompt_timeout_secs, 5);
        assert_eq!(config.downloads.grace_period_secs, 60);
        assert_eq!(config.filters.extra_rules.len(), 1);
        assert_eq!(config.filters.extra_rules[0].kind, RuleKind::Domain);
    }

    #[test]
    fn malformed_file_is_config_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(&path, "{ nope").unwrap();

        let err = load_config_file(&path).unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn merge_appends_extra_rules() {
        let mut base = Config::default();
        let mut overlay = Config::default();
        overlay.filters.extra_rules.push(FilterRule {
            id: "a".into(),
            kind: RuleKind::UrlSubstring,
            pattern: "/beacon".into(),
        });
        overlay.downloads.directory = Some(PathBuf::from("/tmp/x"));
        merge_config(&mut base, overlay);

        assert_eq!(base.filters.extra_rules.len(), 1);
        assert_eq!(base.downloads.directory, Some(PathBuf::from("/tmp/x")));
    }
}
