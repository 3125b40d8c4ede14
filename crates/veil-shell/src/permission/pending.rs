//! Outstanding permission prompts.
//!
//! Prompts are keyed by request id. A second index maps each
//! `(origin, permission)` key to its open prompt so concurrent requests for
//! the same key share one prompt and one deadline.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{RwLock, oneshot};
use tokio::time::Instant;
use tracing::debug;
use uuid::Uuid;

use veil_core::PermissionKey;

use super::types::{PermissionOutcome, PermissionPrompt, permission_label};

/// A prompt awaiting a human answer.
#[derive(Debug)]
pub struct PendingPrompt {
    pub prompt: PermissionPrompt,
    pub created_at: Instant,
    pub expires_at: Instant,
    waiters: Vec<oneshot::Sender<PermissionOutcome>>,
}

impl PendingPrompt {
    pub fn key(&self) -> PermissionKey {
        PermissionKey::new(&self.prompt.origin, &self.prompt.permission)
    }

    pub fn is_expired(&self, now: Instant) -> bool {
        now >= self.expires_at
    }

    /// Hand `outcome` to every waiting caller and return the prompt.
    pub fn resolve(self, outcome: PermissionOutcome) -> PermissionPrompt {
        let waiters = self.waiters.len();
        for waiter in self.waiters {
            // The caller may have given up already.
            let _ = waiter.send(outcome);
        }
        debug!(request_id = %self.prompt.id, waiters, ?outcome, "Resolved permission prompt");
        self.prompt
    }
}

/// A caller's place in a prompt.
#[derive(Debug)]
pub struct Registration {
    pub request_id: String,
    pub receiver: oneshot::Receiver<PermissionOutcome>,
    pub expires_at: Instant,
    /// False when the caller joined a prompt that was already open.
    pub is_new: bool,
    pub prompt: PermissionPrompt,
}

#[derive(Default)]
struct PendingTable {
    prompts: HashMap<String, PendingPrompt>,
    by_key: HashMap<PermissionKey, String>,
}

impl PendingTable {
    fn remove(&mut self, request_id: &str) -> Option<PendingPrompt> {
        let pending = self.prompts.remove(request_id)?;
        let key = pending.key();
        if self.by_key.get(&key).is_some_and(|id| id == request_id) {
            self.by_key.remove(&key);
        }
        Some(pending)
    }
}

/// Manager for outstanding prompts.
pub struct PendingManager {
    table: Arc<RwLock<PendingTable>>,
    timeout: Duration,
}

impl PendingManager {
    pub fn new(timeout: Duration) -> Self {
        Self {
            table: Arc::new(RwLock::new(PendingTable::default())),
            timeout,
        }
    }

    pub const fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Open a prompt for `key`, or join the one already open.
    pub async fn register(&self, key: &PermissionKey, url: &str) -> Registration {
        let (tx, rx) = oneshot::channel();
        let now = Instant::now();
        let mut guard = self.table.write().await;
        let table = &mut *guard;

        if let Some(id) = table.by_key.get(key)
            && let Some(open) = table.prompts.get_mut(id)
            && !open.is_expired(now)
        {
            open.waiters.push(tx);
            debug!(request_id = %id, %key, waiters = open.waiters.len(), "Joined open prompt");
            return Registration {
                request_id: id.clone(),
                receiver: rx,
                expires_at: open.expires_at,
                is_new: false,
                prompt: open.prompt.clone(),
            };
        }

        let request_id = Uuid::new_v4().to_string();
        let prompt = PermissionPrompt {
            id: request_id.clone(),
            origin: key.origin.clone(),
            permission: key.permission.clone(),
            url: url.to_string(),
            label: permission_label(&key.permission).to_string(),
        };
        let expires_at = now + self.timeout;
        table.prompts.insert(
            request_id.clone(),
            PendingPrompt {
                prompt: prompt.clone(),
                created_at: now,
                expires_at,
                waiters: vec![tx],
            },
        );
        table.by_key.insert(key.clone(), request_id.clone());
        drop(guard);

        debug!(%request_id, %key, "Added pending permission prompt");
        Registration {
            request_id,
            receiver: rx,
            expires_at,
            is_new: true,
            prompt,
        }
    }

    /// Remove and return a prompt, expired or not.
    pub async fn take(&self, request_id: &str) -> Option<PendingPrompt> {
        let pending = self.table.write().await.remove(request_id);
        if pending.is_some() {
            debug!(request_id, "Removed pending permission prompt");
        }
        pending
    }

    pub async fn get(&self, request_id: &str) -> Option<PermissionPrompt> {
        self.table
            .read()
            .await
            .prompts
            .get(request_id)
            .map(|p| p.prompt.clone())
    }

    /// Open prompts, oldest first.
    pub async fn list(&self) -> Vec<PermissionPrompt> {
        let now = Instant::now();
        let table = self.table.read().await;
        let mut open: Vec<&PendingPrompt> = table
            .prompts
            .values()
            .filter(|p| !p.is_expired(now))
            .collect();
        open.sort_by_key(|p| p.created_at);
        open.into_iter().map(|p| p.prompt.clone()).collect()
    }

    /// Number of callers waiting on a prompt.
    pub async fn waiters(&self, request_id: &str) -> usize {
        self.table
            .read()
            .await
            .prompts
            .get(request_id)
            .map_or(0, |p| p.waiters.len())
    }

    pub async fn count(&self) -> usize {
        self.table.read().await.prompts.len()
    }

    /// Remove every prompt past its deadline and return them unresolved.
    pub async fn drain_expired(&self) -> Vec<PendingPrompt> {
        let now = Instant::now();
        let mut table = self.table.write().await;
        let expired: Vec<String> = table
            .prompts
            .iter()
            .filter(|(_, p)| p.is_expired(now))
            .map(|(id, _)| id.clone())
            .collect();
        expired
            .iter()
            .filter_map(|id| table.remove(id))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key() -> PermissionKey {
        PermissionKey::new("https://maps.example", "geolocation")
    }

    #[tokio::test]
    async fn same_key_joins_open_prompt() {
        let manager = PendingManager::new(Duration::from_secs(30));

        let first = manager.register(&key(), "https://maps.example/a").await;
        let second = manager.register(&key(), "https://maps.example/b").await;

        assert!(first.is_new);
        assert!(!second.is_new);
        assert_eq!(first.request_id, second.request_id);
        assert_eq!(first.expires_at, second.expires_at);
        assert_eq!(second.prompt.url, "https://maps.example/a");
        assert_eq!(manager.count().await, 1);
    }

    #[tokio::test]
    async fn different_kinds_get_separate_prompts() {
        let manager = PendingManager::new(Duration::from_secs(30));
        let geo = manager.register(&key(), "https://maps.example").await;
        let media = manager
            .register(
                &PermissionKey::new("https://maps.example", "media"),
                "https://maps.example",
            )
            .await;

        assert_ne!(geo.request_id, media.request_id);
        assert_eq!(media.prompt.label, "Camera/Microphone");
        assert_eq!(manager.list().await.len(), 2);
    }

    #[tokio::test]
    async fn resolve_reaches_every_waiter() {
        let manager = PendingManager::new(Duration::from_secs(30));
        let first = manager.register(&key(), "https://maps.example").await;
        let second = manager.register(&key(), "https://maps.example").await;

        let pending = manager.take(&first.request_id).await.unwrap();
        let outcome = PermissionOutcome::Decided {
            allowed: true,
            cached: false,
        };
        pending.resolve(outcome);

        assert_eq!(first.receiver.await.unwrap(), outcome);
        assert_eq!(second.receiver.await.unwrap(), outcome);
        assert!(manager.take(&first.request_id).await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn expired_prompt_is_not_joined() {
        let manager = PendingManager::new(Duration::from_secs(30));
        let first = manager.register(&key(), "https://maps.example").await;

        tokio::time::advance(Duration::from_secs(30)).await;
        let second = manager.register(&key(), "https://maps.example").await;

        assert!(second.is_new);
        assert_ne!(first.request_id, second.request_id);

        let drained = manager.drain_expired().await;
        assert_eq!(drained.len(), 1);
        assert_eq!(drained[0].prompt.id, first.request_id);
        // The newer prompt still owns the key.
        let third = manager.register(&key(), "https://maps.example").await;
        assert_eq!(third.request_id, second.request_id);
    }
}
