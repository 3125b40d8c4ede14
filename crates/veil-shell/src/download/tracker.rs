//! Download lifecycle tracker.
//!
//! Records are keyed by a generated id. The live transfer handle for each id
//! sits in a separate table and is released as soon as the download reaches
//! a terminal state; the record itself stays visible until the grace period
//! runs out.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::RwLock;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

use veil_core::config::DownloadConfig;

use super::format::{format_bytes, format_duration};
use super::types::{
    DoneState, DownloadError, DownloadProgress, DownloadRecord, DownloadStart, DownloadState,
    HostTransferState, TransferHandle,
};
use crate::events::{EventBus, Notice, ShellEvent};
use crate::unix_millis;

/// Tracker configuration.
#[derive(Debug, Clone)]
pub struct TrackerConfig {
    /// Directory new downloads are saved into.
    pub downloads_dir: PathBuf,
    /// How long a finished download stays visible.
    pub grace_period: Duration,
}

impl TrackerConfig {
    pub fn from_config(config: &DownloadConfig) -> Self {
        Self {
            downloads_dir: config.resolved_directory(),
            grace_period: config.grace_period(),
        }
    }
}

struct Entry {
    record: DownloadRecord,
    seq: u64,
    started: Instant,
    finished: Option<Instant>,
}

impl Entry {
    fn is_expired(&self, now: Instant, grace: Duration) -> bool {
        self.finished
            .is_some_and(|finished| now.saturating_duration_since(finished) >= grace)
    }

    fn finalize(&mut self, state: DownloadState, now: Instant) {
        let elapsed = now.saturating_duration_since(self.started);
        self.record.state = state;
        self.record.paused = state == DownloadState::Interrupted;
        self.record.ended_at = Some(unix_millis());
        self.record.duration_ms = Some(u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX));
        self.finished = Some(now);
    }
}

#[derive(Default)]
struct TrackerState {
    records: HashMap<String, Entry>,
    handles: HashMap<String, Arc<dyn TransferHandle>>,
    next_seq: u64,
}

/// Owns every download record and its transfer handle.
pub struct DownloadTracker {
    state: Arc<RwLock<TrackerState>>,
    events: EventBus,
    config: TrackerConfig,
}

impl DownloadTracker {
    pub fn new(config: TrackerConfig, events: EventBus) -> Self {
        Self {
            state: Arc::new(RwLock::new(TrackerState::default())),
            events,
            config,
        }
    }

    /// Register a transfer the host just started.
    ///
    /// Returns the record, whose `save_path` the host must apply.
    #[allow(clippy::significant_drop_tightening)]
    pub async fn start(
        &self,
        start: DownloadStart,
        handle: Arc<dyn TransferHandle>,
    ) -> DownloadRecord {
        let id = Uuid::new_v4().to_string();
        let filename = sanitize_filename(&start.filename);
        let save_path = self.config.downloads_dir.join(&filename);

        let mut record = DownloadRecord {
            id: id.clone(),
            filename,
            url: start.url,
            save_path,
            total_bytes: start.total_bytes,
            received_bytes: 0,
            state: DownloadState::Pending,
            paused: false,
            started_at: unix_millis(),
            ended_at: None,
            duration_ms: None,
        };
        debug!(download_id = %id, "Download pending");
        record.state = DownloadState::InProgress;

        let mut state = self.state.write().await;
        let seq = state.next_seq;
        state.next_seq += 1;
        state.handles.insert(id.clone(), handle);
        state.records.insert(
            id.clone(),
            Entry {
                record: record.clone(),
                seq,
                started: Instant::now(),
                finished: None,
            },
        );
        self.events
            .publish(ShellEvent::DownloadStarted(record.clone()));

        info!(
            download_id = %id,
            filename = %record.filename,
            total = %format_bytes(record.total_bytes),
            save_path = %record.save_path.display(),
            "Download started"
        );
        record
    }

    /// Apply a progress tick from the host.
    #[allow(clippy::significant_drop_tightening)]
    pub async fn progress(
        &self,
        id: &str,
        tick: DownloadProgress,
    ) -> Result<DownloadRecord, DownloadError> {
        let now = Instant::now();
        let mut state = self.state.write().await;
        let entry = live_entry(&mut state.records, id, now, self.config.grace_period)?;
        let record = &mut entry.record;
        let previous = record.state;

        match (tick.state, tick.paused) {
            (HostTransferState::Interrupted, _) => {
                record.state = DownloadState::Interrupted;
                record.paused = true;
            }
            (HostTransferState::Progressing, true) => {
                record.state = DownloadState::Paused;
                record.paused = true;
            }
            (HostTransferState::Progressing, false) => {
                record.state = DownloadState::InProgress;
                record.paused = false;
            }
        }

        if tick.received_bytes >= record.received_bytes {
            record.received_bytes = tick.received_bytes;
        } else {
            debug!(
                download_id = %id,
                reported = tick.received_bytes,
                current = record.received_bytes,
                "Ignoring stale byte count"
            );
        }

        let snapshot = record.clone();
        self.events
            .publish(ShellEvent::DownloadUpdated(snapshot.clone()));

        if previous != snapshot.state {
            info!(
                download_id = %id,
                from = previous.as_str(),
                to = snapshot.state.as_str(),
                "Download state changed"
            );
        }
        Ok(snapshot)
    }

    /// Apply the host's final state for a transfer.
    #[allow(clippy::significant_drop_tightening)]
    pub async fn finish(&self, id: &str, done: DoneState) -> Result<DownloadRecord, DownloadError> {
        let now = Instant::now();
        let mut guard = self.state.write().await;
        let state = &mut *guard;
        let entry = live_entry(&mut state.records, id, now, self.config.grace_period)?;
        state.handles.remove(id);

        let final_state = match done {
            DoneState::Completed => {
                let record = &mut entry.record;
                if record.total_bytes > 0 {
                    record.received_bytes = record.total_bytes;
                } else {
                    record.total_bytes = record.received_bytes;
                }
                DownloadState::Completed
            }
            DoneState::Cancelled => DownloadState::Cancelled,
            DoneState::Interrupted => DownloadState::Interrupted,
        };
        entry.finalize(final_state, now);
        let record = entry.record.clone();

        self.events
            .publish(ShellEvent::DownloadCompleted(record.clone()));
        if final_state == DownloadState::Completed {
            self.events.publish(ShellEvent::Notice(Notice {
                title: "Download Complete".to_string(),
                body: format!("{} has been downloaded successfully.", record.filename),
            }));
        }
        drop(guard);

        info!(
            download_id = %id,
            state = final_state.as_str(),
            received = %format_bytes(record.received_bytes),
            elapsed = %format_duration(Duration::from_millis(record.duration_ms.unwrap_or_default())),
            "Download finished"
        );
        self.schedule_eviction();
        Ok(record)
    }

    /// Cancel a live download.
    ///
    /// Fails with `AlreadyTerminal` once the download has finished and with
    /// `NotFound` when there is no record or no live handle for `id`.
    #[allow(clippy::significant_drop_tightening)]
    pub async fn cancel(&self, id: &str) -> Result<DownloadRecord, DownloadError> {
        let now = Instant::now();
        let mut guard = self.state.write().await;
        let state = &mut *guard;
        let entry = live_entry(&mut state.records, id, now, self.config.grace_period)?;
        let handle = state
            .handles
            .remove(id)
            .ok_or_else(|| DownloadError::NotFound { id: id.to_string() })?;

        handle.cancel();
        entry.finalize(DownloadState::Cancelled, now);
        let record = entry.record.clone();
        self.events
            .publish(ShellEvent::DownloadCompleted(record.clone()));
        drop(guard);

        info!(download_id = %id, "Download cancelled");
        self.schedule_eviction();
        Ok(record)
    }

    /// Whether the live transfer for `id` can be paused and resumed.
    pub async fn can_pause(&self, id: &str) -> Result<bool, DownloadError> {
        let now = Instant::now();
        let mut guard = self.state.write().await;
        let state = &mut *guard;
        live_entry(&mut state.records, id, now, self.config.grace_period)?;
        state
            .handles
            .get(id)
            .map(|h| h.can_pause())
            .ok_or_else(|| DownloadError::NotFound { id: id.to_string() })
    }

    pub async fn pause(&self, id: &str) -> Result<DownloadRecord, DownloadError> {
        self.set_paused(id, true).await
    }

    pub async fn resume(&self, id: &str) -> Result<DownloadRecord, DownloadError> {
        self.set_paused(id, false).await
    }

    #[allow(clippy::significant_drop_tightening)]
    async fn set_paused(&self, id: &str, paused: bool) -> Result<DownloadRecord, DownloadError> {
        let operation = if paused { "pause" } else { "resume" };
        let now = Instant::now();
        let mut guard = self.state.write().await;
        let state = &mut *guard;
        let entry = live_entry(&mut state.records, id, now, self.config.grace_period)?;
        let handle = state
            .handles
            .get(id)
            .ok_or_else(|| DownloadError::NotFound { id: id.to_string() })?;

        if !handle.can_pause() {
            return Err(DownloadError::Unsupported {
                id: id.to_string(),
                operation,
            });
        }

        if paused {
            handle.pause();
            entry.record.state = DownloadState::Paused;
        } else {
            handle.resume();
            entry.record.state = DownloadState::InProgress;
        }
        entry.record.paused = paused;
        let record = entry.record.clone();
        self.events
            .publish(ShellEvent::DownloadUpdated(record.clone()));
        drop(guard);

        debug!(download_id = %id, operation, "Download control applied");
        Ok(record)
    }

    /// Get a visible record by id.
    pub async fn get(&self, id: &str) -> Option<DownloadRecord> {
        let now = Instant::now();
        self.state
            .read()
            .await
            .records
            .get(id)
            .filter(|e| !e.is_expired(now, self.config.grace_period))
            .map(|e| e.record.clone())
    }

    /// All visible records, oldest first.
    pub async fn list(&self) -> Vec<DownloadRecord> {
        let now = Instant::now();
        let state = self.state.read().await;
        let mut entries: Vec<&Entry> = state
            .records
            .values()
            .filter(|e| !e.is_expired(now, self.config.grace_period))
            .collect();
        entries.sort_by_key(|e| e.seq);
        entries.into_iter().map(|e| e.record.clone()).collect()
    }

    /// Remove every finished record immediately. Returns how many went.
    pub async fn clear_completed(&self) -> usize {
        let mut state = self.state.write().await;
        let before = state.records.len();
        state.records.retain(|_, e| !e.record.is_terminal());
        let removed = before - state.records.len();
        drop(state);

        if removed > 0 {
            info!(removed, "Cleared finished downloads");
        }
        removed
    }

    /// Evict records whose grace period has elapsed.
    pub async fn sweep_expired(&self) -> Vec<String> {
        let mut state = self.state.write().await;
        evict_expired(&mut state, Instant::now(), self.config.grace_period)
    }

    /// Number of transfers that can still be cancelled.
    pub async fn live_handle_count(&self) -> usize {
        self.state.read().await.handles.len()
    }

    pub fn downloads_dir(&self) -> &Path {
        &self.config.downloads_dir
    }

    pub const fn grace_period(&self) -> Duration {
        self.config.grace_period
    }

    fn schedule_eviction(&self) {
        let state = Arc::clone(&self.state);
        let grace = self.config.grace_period;
        tokio::spawn(async move {
            tokio::time::sleep(grace).await;
            let mut state = state.write().await;
            evict_expired(&mut state, Instant::now(), grace);
        });
    }
}

/// Look up a record that can still change state.
fn live_entry<'a>(
    records: &'a mut HashMap<String, Entry>,
    id: &str,
    now: Instant,
    grace: Duration,
) -> Result<&'a mut Entry, DownloadError> {
    let entry = records
        .get_mut(id)
        .filter(|e| !e.is_expired(now, grace))
        .ok_or_else(|| DownloadError::NotFound { id: id.to_string() })?;
    if entry.record.is_terminal() {
        return Err(DownloadError::AlreadyTerminal {
            id: id.to_string(),
            state: entry.record.state.as_str(),
        });
    }
    Ok(entry)
}

fn evict_expired(state: &mut TrackerState, now: Instant, grace: Duration) -> Vec<String> {
    let expired: Vec<String> = state
        .records
        .iter()
        .filter(|(_, e)| e.is_expired(now, grace))
        .map(|(id, _)| id.clone())
        .collect();

    for id in &expired {
        state.records.remove(id);
        if state.handles.remove(id).is_some() {
            warn!(download_id = %id, "Evicted download still had a live handle");
        }
        debug!(download_id = %id, "Download record evicted");
    }
    expired
}

/// Keep only the final path component of a host-suggested filename.
fn sanitize_filename(name: &str) -> String {
    let candidate = name.rsplit(['/', '\\']).next().unwrap_or_default().trim();
    if candidate.is_empty() || candidate == "." || candidate == ".." {
        "download".to_string()
    } else {
        candidate.to_string()
    }
}
