//! Permission decision cache.
//!
//! Every request first consults the durable store. A miss opens (or joins)
//! a prompt and waits for the human answer until the prompt deadline; no
//! answer is an implicit denial that is never persisted.

use std::sync::Arc;

use tokio::sync::{Mutex, oneshot};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use veil_core::{PermissionKey, PermissionMap, PermissionStore, StoreError};

use super::pending::{PendingManager, Registration};
use super::types::{
    OPAQUE_ORIGIN, PermissionError, PermissionOutcome, PermissionPrompt, PermissionRecord,
    PermissionRequest, PermissionResponse, ProcessedResponse, origin_of,
};
use crate::events::{EventBus, PermissionResolved, ShellEvent};

/// Per-origin permission decisions backed by a [`PermissionStore`].
pub struct PermissionCache {
    store: Arc<dyn PermissionStore>,
    pending: PendingManager,
    events: EventBus,
    /// Serializes read-modify-write cycles on the store.
    write_lock: Mutex<()>,
}

impl PermissionCache {
    pub fn new(store: Arc<dyn PermissionStore>, pending: PendingManager, events: EventBus) -> Self {
        Self {
            store,
            pending,
            events,
            write_lock: Mutex::new(()),
        }
    }

    /// Decide a permission request, prompting the user if nothing is stored.
    pub async fn request(&self, request: PermissionRequest) -> PermissionOutcome {
        let origin = origin_of(&request.url);
        let key = PermissionKey::new(
            origin.as_deref().unwrap_or(OPAQUE_ORIGIN),
            &request.permission,
        );

        if origin.is_some()
            && let Some(allowed) = self.lookup(&key).await
        {
            debug!(%key, allowed, "Permission cache hit");
            return PermissionOutcome::Decided {
                allowed,
                cached: true,
            };
        }

        let registration = self.pending.register(&key, &request.url).await;
        if registration.is_new {
            info!(
                request_id = %registration.request_id,
                origin = %key.origin,
                permission = %key.permission,
                "Permission prompt pending"
            );
            self.events
                .publish(ShellEvent::PermissionRequest(registration.prompt.clone()));
        }

        let Registration {
            request_id,
            mut receiver,
            expires_at,
            ..
        } = registration;

        match tokio::time::timeout_at(expires_at, &mut receiver).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(_)) => PermissionOutcome::Expired,
            Err(_) => self.expire(&request_id, &mut receiver).await,
        }
    }

    async fn expire(
        &self,
        request_id: &str,
        receiver: &mut oneshot::Receiver<PermissionOutcome>,
    ) -> PermissionOutcome {
        match self.pending.take(request_id).await {
            Some(pending) => {
                let prompt = pending.resolve(PermissionOutcome::Expired);
                self.publish_expired(&prompt);
                PermissionOutcome::Expired
            }
            // Already taken by a responder or another waiter; its resolution
            // is in flight, so wait for it.
            None => receiver.await.unwrap_or(PermissionOutcome::Expired),
        }
    }

    fn publish_expired(&self, prompt: &PermissionPrompt) {
        warn!(
            request_id = %prompt.id,
            origin = %prompt.origin,
            permission = %prompt.permission,
            "Permission prompt timed out, implicit denial"
        );
        self.events
            .publish(ShellEvent::PermissionResolved(PermissionResolved {
                id: prompt.id.clone(),
                origin: prompt.origin.clone(),
                permission: prompt.permission.clone(),
                allowed: false,
                expired: true,
            }));
    }

    /// Apply a human answer to an open prompt. Answers that arrive after the
    /// deadline are rejected and never persisted.
    pub async fn respond(
        &self,
        response: PermissionResponse,
    ) -> Result<ProcessedResponse, PermissionError> {
        let pending = self.pending.take(&response.request_id).await.ok_or_else(|| {
            PermissionError::RequestNotFound {
                request_id: response.request_id.clone(),
            }
        })?;
        if pending.is_expired(Instant::now()) {
            let prompt = pending.resolve(PermissionOutcome::Expired);
            self.publish_expired(&prompt);
            return Err(PermissionError::RequestNotFound {
                request_id: response.request_id,
            });
        }
        let key = pending.key();

        let mut record = None;
        if response.remember {
            if key.origin == OPAQUE_ORIGIN {
                debug!(%key, "Not remembering decision for opaque origin");
            } else {
                match self.write(&key, Some(response.allowed)).await {
                    Ok(_) => record = Some(new_record(&key, response.allowed)),
                    Err(e) => error!(%key, error = %e, "Failed to persist permission decision"),
                }
            }
        }

        let prompt = pending.resolve(PermissionOutcome::Decided {
            allowed: response.allowed,
            cached: false,
        });

        info!(
            request_id = %response.request_id,
            origin = %prompt.origin,
            permission = %prompt.permission,
            allowed = response.allowed,
            remembered = record.is_some(),
            "Permission response processed"
        );
        self.events
            .publish(ShellEvent::PermissionResolved(PermissionResolved {
                id: prompt.id.clone(),
                origin: prompt.origin.clone(),
                permission: prompt.permission.clone(),
                allowed: response.allowed,
                expired: false,
            }));

        Ok(ProcessedResponse {
            prompt,
            allowed: response.allowed,
            record,
        })
    }

    /// Every persisted decision.
    pub async fn preferences(&self) -> Result<PermissionMap, PermissionError> {
        let store = Arc::clone(&self.store);
        run_blocking(move || store.load()).await
    }

    /// Persist a decision without a prompt.
    pub async fn set_preference(
        &self,
        origin: &str,
        permission: &str,
        allowed: bool,
    ) -> Result<PermissionRecord, PermissionError> {
        if origin.is_empty() || permission.is_empty() || origin == OPAQUE_ORIGIN {
            return Err(PermissionError::InvalidKey(format!("{origin}:{permission}")));
        }
        let key = PermissionKey::new(origin, permission);
        self.write(&key, Some(allowed)).await?;
        info!(%key, allowed, "Permission preference set");
        Ok(new_record(&key, allowed))
    }

    /// Remove one decision by its `"<origin>:<permission>"` key. Returns
    /// whether it existed.
    pub async fn remove_preference(&self, key: &str) -> Result<bool, PermissionError> {
        let key =
            PermissionKey::parse(key).ok_or_else(|| PermissionError::InvalidKey(key.to_string()))?;
        let existed = self.write(&key, None).await?.is_some();
        info!(%key, existed, "Permission preference removed");
        Ok(existed)
    }

    /// Remove every decision. Returns how many were stored.
    pub async fn clear_preferences(&self) -> Result<usize, PermissionError> {
        let _guard = self.write_lock.lock().await;
        let store = Arc::clone(&self.store);
        let removed = run_blocking(move || {
            let count = store.load().map(|m| m.len()).unwrap_or_default();
            store.save(&PermissionMap::new())?;
            Ok(count)
        })
        .await?;
        info!(removed, "Permission preferences cleared");
        Ok(removed)
    }

    /// Prompts still waiting for an answer, oldest first.
    pub async fn pending_prompts(&self) -> Vec<PermissionPrompt> {
        self.pending.list().await
    }

    /// Deny every prompt past its deadline. Returns how many were expired.
    pub async fn cleanup_expired(&self) -> usize {
        let expired = self.pending.drain_expired().await;
        let count = expired.len();
        for pending in expired {
            let prompt = pending.resolve(PermissionOutcome::Expired);
            self.publish_expired(&prompt);
        }
        count
    }

    async fn lookup(&self, key: &PermissionKey) -> Option<bool> {
        let store = Arc::clone(&self.store);
        match run_blocking(move || store.load()).await {
            Ok(map) => map.get(&key.to_string()).copied(),
            Err(e) => {
                warn!(%key, error = %e, "Permission store unreadable, prompting instead");
                None
            }
        }
    }

    /// Set (`Some`) or remove (`None`) one entry; last write wins. Returns the
    /// previous value.
    async fn write(
        &self,
        key: &PermissionKey,
        value: Option<bool>,
    ) -> Result<Option<bool>, PermissionError> {
        let _guard = self.write_lock.lock().await;
        let store = Arc::clone(&self.store);
        let key = key.to_string();
        run_blocking(move || {
            let mut map = store.load()?;
            let previous = match value {
                Some(allowed) => map.insert(key, allowed),
                None => map.remove(&key),
            };
            store.save(&map)?;
            Ok(previous)
        })
        .await
    }
}

/// Run store I/O on the blocking pool.
async fn run_blocking<T, F>(f: F) -> Result<T, PermissionError>
where
    F: FnOnce() -> Result<T, StoreError> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| PermissionError::Storage(format!("Store task failed: {e}")))?
        .map_err(|e| PermissionError::Storage(e.to_string()))
}

fn new_record(key: &PermissionKey, allowed: bool) -> PermissionRecord {
    PermissionRecord {
        origin: key.origin.clone(),
        permission: key.permission.clone(),
        allowed,
        recorded_at: crate::unix_millis(),
    }
}
