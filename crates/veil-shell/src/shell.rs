//! The shell service object.
//!
//! One `Shell` owns the interceptor, the permission cache, the download
//! tracker and the event bus they publish on. Tests build a fresh one each.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use veil_core::config::Config;
use veil_core::{JsonFileStore, MemoryStore, PermissionStore};

use crate::download::{DownloadTracker, TrackerConfig};
use crate::events::{EventBus, ShellEvent};
use crate::interceptor::{RequestInterceptor, ThirdPartyBlocker};
use crate::permission::{PendingManager, PermissionCache};

/// How often expired prompts and download records are swept.
const MAINTENANCE_INTERVAL: Duration = Duration::from_secs(10);

/// Installs unpacked browser extensions into a session.
pub trait ExtensionLoader: Send + Sync {
    /// Load the extension at `path`, returning its id.
    fn load(&self, session_scope: &str, path: &Path) -> anyhow::Result<String>;
}

pub struct Shell {
    config: Config,
    events: EventBus,
    interceptor: RequestInterceptor,
    permissions: PermissionCache,
    downloads: DownloadTracker,
}

impl Shell {
    pub fn new(config: Config, store: Arc<dyn PermissionStore>) -> veil_core::Result<Self> {
        let events = EventBus::new(config.shell.event_capacity);
        let interceptor = RequestInterceptor::from_config(&config, events.clone())?;
        let permissions = PermissionCache::new(
            store,
            PendingManager::new(config.permissions.prompt_timeout()),
            events.clone(),
        );
        let downloads =
            DownloadTracker::new(TrackerConfig::from_config(&config.downloads), events.clone());

        info!(
            session = %config.shell.session_partition,
            downloads_dir = %downloads.downloads_dir().display(),
            prompt_timeout_secs = config.permissions.prompt_timeout_secs,
            "Shell initialized"
        );

        Ok(Self {
            config,
            events,
            interceptor,
            permissions,
            downloads,
        })
    }

    /// Build with the permission store the configuration points at.
    pub fn from_config(config: Config) -> veil_core::Result<Self> {
        let store: Arc<dyn PermissionStore> = match config.permissions.resolved_store_path() {
            Some(path) => {
                info!(path = %path.display(), "Using permission preference file");
                Arc::new(JsonFileStore::new(path))
            }
            None => {
                warn!("No data directory available, permission preferences will not persist");
                Arc::new(MemoryStore::new())
            }
        };
        Self::new(config, store)
    }

    pub const fn config(&self) -> &Config {
        &self.config
    }

    pub const fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ShellEvent> {
        self.events.subscribe()
    }

    pub const fn interceptor(&self) -> &RequestInterceptor {
        &self.interceptor
    }

    pub const fn permissions(&self) -> &PermissionCache {
        &self.permissions
    }

    pub const fn downloads(&self) -> &DownloadTracker {
        &self.downloads
    }

    pub fn session_partition(&self) -> &str {
        &self.config.shell.session_partition
    }

    /// Attach an external blocklist engine to the managed session.
    pub fn enable_third_party_blocking(&self, blocker: &dyn ThirdPartyBlocker) -> bool {
        self.interceptor
            .enable_third_party_blocking(blocker, self.session_partition())
    }

    /// Load an extension into the managed session. Failure is reported to
    /// the caller and logged.
    pub fn load_extension(
        &self,
        loader: &dyn ExtensionLoader,
        path: &Path,
    ) -> anyhow::Result<String> {
        match loader.load(self.session_partition(), path) {
            Ok(id) => {
                info!(extension_id = %id, path = %path.display(), "Extension loaded");
                Ok(id)
            }
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Failed to load extension");
                Err(e)
            }
        }
    }

    /// Periodically expire abandoned prompts and evict old download records
    /// until `shutdown` flips to true.
    pub fn spawn_maintenance(self: &Arc<Self>, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        let shell = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(MAINTENANCE_INTERVAL);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let evicted = shell.downloads.sweep_expired().await;
                        let expired = shell.permissions.cleanup_expired().await;
                        if !evicted.is_empty() || expired > 0 {
                            debug!(evicted = evicted.len(), expired, "Maintenance sweep");
                        }
                    }
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            debug!("Maintenance task stopping");
                            break;
                        }
                    }
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::permission::PermissionRequest;
    use std::path::PathBuf;

    fn shell() -> Shell {
        let mut config = Config::default();
        config.downloads.directory = Some(PathBuf::from("/srv/downloads"));
        Shell::new(config, Arc::new(MemoryStore::new())).unwrap()
    }

    struct Loader(bool);

    impl ExtensionLoader for Loader {
        fn load(&self, session_scope: &str, path: &Path) -> anyhow::Result<String> {
            assert_eq!(session_scope, "persist:main");
            if self.0 {
                Ok(format!("ext-{}", path.display()))
            } else {
                anyhow::bail!("manifest missing")
            }
        }
    }

    #[test]
    fn components_share_configuration() {
        let shell = shell();
        assert_eq!(shell.session_partition(), "persist:main");
        assert_eq!(
            shell.downloads().downloads_dir(),
            Path::new("/srv/downloads")
        );
        assert!(shell.interceptor().is_enabled());
    }

    #[test]
    fn extension_failure_is_reported() {
        let shell = shell();
        assert_eq!(
            shell
                .load_extension(&Loader(true), Path::new("/ext/ublock"))
                .unwrap(),
            "ext-/ext/ublock"
        );
        assert!(
            shell
                .load_extension(&Loader(false), Path::new("/ext/broken"))
                .is_err()
        );
    }

    #[tokio::test(start_paused = true)]
    async fn maintenance_expires_abandoned_prompts() {
        let shell = Arc::new(shell());
        let mut rx = shell.subscribe();
        let (_tx, shutdown) = watch::channel(false);
        let maintenance = shell.spawn_maintenance(shutdown);

        let waiter = tokio::spawn({
            let shell = Arc::clone(&shell);
            async move {
                shell
                    .permissions()
                    .request(PermissionRequest {
                        url: "https://maps.example".into(),
                        permission: "geolocation".into(),
                    })
                    .await
            }
        });
        assert!(matches!(
            rx.recv().await.unwrap(),
            ShellEvent::PermissionRequest(_)
        ));
        // Nobody is left to time the prompt out but the sweep.
        waiter.abort();

        let resolved = tokio::time::timeout(Duration::from_secs(60), async {
            loop {
                if let ShellEvent::PermissionResolved(resolved) = rx.recv().await.unwrap() {
                    return resolved;
                }
            }
        })
        .await
        .unwrap();
        assert!(resolved.expired);
        assert!(!resolved.allowed);
        maintenance.abort();
    }

    #[tokio::test]
    async fn maintenance_stops_on_shutdown() {
        let shell = Arc::new(shell());
        let (tx, rx) = watch::channel(false);
        let handle = shell.spawn_maintenance(rx);
        tx.send(true).unwrap();
        handle.await.unwrap();
    }
}
