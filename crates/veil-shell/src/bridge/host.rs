//! Bridge dispatcher and stdio loop.

use std::collections::{HashMap, HashSet};
use std::fmt::Display;
use std::future::Future;
use std::sync::{Arc, OnceLock};

use serde::Serialize;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::broadcast::error::{RecvError, TryRecvError};
use tokio::sync::{RwLock, mpsc};
use tracing::{debug, info, warn};

use super::protocol::{BridgeError, HostMessage, HostReply, TransferCommand, parse_line};
use crate::download::{DownloadError, DownloadProgress, DownloadStart, TransferHandle};
use crate::permission::{PermissionOutcome, PermissionRequest};
use crate::shell::Shell;

/// Queue of serialized lines bound for the host.
#[derive(Debug, Clone)]
pub struct Outbox {
    tx: mpsc::UnboundedSender<String>,
}

impl Outbox {
    pub fn send<T: Serialize>(&self, message: &T) {
        match serde_json::to_string(message) {
            Ok(line) => {
                if self.tx.send(line).is_err() {
                    debug!("Bridge output closed, dropping message");
                }
            }
            Err(e) => warn!(error = %e, "Failed to serialize bridge message"),
        }
    }
}

/// Transfer handle that forwards control to the host over the bridge.
pub struct BridgeTransfer {
    transfer_id: String,
    /// Assigned by the tracker after the handle is registered.
    download_id: OnceLock<String>,
    can_pause: bool,
    outbox: Outbox,
}

impl BridgeTransfer {
    pub fn new(transfer_id: impl Into<String>, can_pause: bool, outbox: Outbox) -> Self {
        Self {
            transfer_id: transfer_id.into(),
            download_id: OnceLock::new(),
            can_pause,
            outbox,
        }
    }

    fn bind(&self, download_id: &str) {
        if self.download_id.set(download_id.to_string()).is_err() {
            warn!(transfer_id = %self.transfer_id, "Transfer bound twice");
        }
    }

    fn command(&self, command: TransferCommand) {
        self.outbox.send(&HostReply::TransferCommand {
            transfer_id: self.transfer_id.clone(),
            download_id: self.download_id.get().cloned().unwrap_or_default(),
            command,
        });
    }
}

impl TransferHandle for BridgeTransfer {
    fn cancel(&self) {
        self.command(TransferCommand::Cancel);
    }

    fn can_pause(&self) -> bool {
        self.can_pause
    }

    fn pause(&self) {
        self.command(TransferCommand::Pause);
    }

    fn resume(&self) {
        self.command(TransferCommand::Resume);
    }
}

/// Routes host messages to the shell and shell output back to the host.
pub struct HostBridge {
    shell: Arc<Shell>,
    outbox: Outbox,
    /// Host transfer id -> download id.
    transfers: RwLock<HashMap<String, String>>,
}

impl HostBridge {
    /// Create a bridge. The receiver yields every reply line; pass it to
    /// [`HostBridge::run`].
    pub fn new(shell: Arc<Shell>) -> (Arc<Self>, mpsc::UnboundedReceiver<String>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let bridge = Arc::new(Self {
            shell,
            outbox: Outbox { tx },
            transfers: RwLock::new(HashMap::new()),
        });
        (bridge, rx)
    }

    pub const fn shell(&self) -> &Arc<Shell> {
        &self.shell
    }

    /// Handle one input line. Malformed and unknown lines are logged and
    /// skipped.
    pub async fn handle_line(self: &Arc<Self>, line: &str) {
        match parse_line(line) {
            Ok(Some(HostMessage::Unknown)) => {
                warn!(line = %truncate(line, 120), "Skipping unknown bridge message");
            }
            Ok(Some(message)) => self.dispatch(message).await,
            Ok(None) => {}
            Err(e) => warn!(error = %e, line = %truncate(line, 120), "Skipping malformed bridge line"),
        }
    }

    #[allow(clippy::too_many_lines)]
    async fn dispatch(self: &Arc<Self>, message: HostMessage) {
        let downloads = self.shell.downloads();
        let permissions = self.shell.permissions();

        match message {
            HostMessage::Request(request) => {
                let interceptor = self.shell.interceptor();
                let request_headers = interceptor.on_before_send_headers(request.headers.clone());
                let verdict = interceptor.on_before_request(&request);
                self.outbox.send(&HostReply::RequestVerdict {
                    id: request.id,
                    cancel: verdict.cancel,
                    reason: verdict.decision.reason,
                    rule_id: verdict.decision.rule_id,
                    request_headers,
                });
            }
            HostMessage::DownloadStarted {
                transfer_id,
                url,
                filename,
                total_bytes,
                can_pause,
            } => {
                self.prune_transfers().await;
                let handle = Arc::new(BridgeTransfer::new(
                    transfer_id.clone(),
                    can_pause,
                    self.outbox.clone(),
                ));
                let record = downloads
                    .start(
                        DownloadStart {
                            url,
                            filename,
                            total_bytes,
                        },
                        handle.clone(),
                    )
                    .await;
                handle.bind(&record.id);
                self.transfers
                    .write()
                    .await
                    .insert(transfer_id.clone(), record.id.clone());
                self.outbox.send(&HostReply::TransferCommand {
                    transfer_id,
                    download_id: record.id,
                    command: TransferCommand::SetSavePath {
                        path: record.save_path,
                    },
                });
            }
            HostMessage::DownloadProgress {
                transfer_id,
                received_bytes,
                state,
                paused,
            } => {
                let Some(id) = self.download_for(&transfer_id).await else {
                    debug!(%transfer_id, "Progress for unknown transfer");
                    return;
                };
                let tick = DownloadProgress {
                    received_bytes,
                    state,
                    paused,
                };
                if let Err(e) = downloads.progress(&id, tick).await {
                    debug!(%transfer_id, error = %e, "Ignoring progress tick");
                }
            }
            HostMessage::DownloadDone { transfer_id, state } => {
                let Some(id) = self.transfers.write().await.remove(&transfer_id) else {
                    debug!(%transfer_id, "Done event for unknown transfer");
                    return;
                };
                match downloads.finish(&id, state).await {
                    Ok(_) => {}
                    // Expected after a cancel initiated on this side.
                    Err(DownloadError::AlreadyTerminal { .. }) => {
                        debug!(%transfer_id, download_id = %id, "Transfer already finished");
                    }
                    Err(e) => warn!(%transfer_id, error = %e, "Failed to finish download"),
                }
            }
            HostMessage::PermissionRequest {
                request_id,
                url,
                permission,
            } => {
                // Answering may wait for a human, so it must not block the reader.
                let bridge = Arc::clone(self);
                tokio::spawn(async move {
                    let outcome = bridge
                        .shell
                        .permissions()
                        .request(PermissionRequest { url, permission })
                        .await;
                    bridge.outbox.send(&HostReply::PermissionDecision {
                        request_id,
                        allowed: outcome.allowed(),
                        expired: outcome == PermissionOutcome::Expired,
                    });
                });
            }
            HostMessage::PermissionResponse(response) => {
                let result = permissions
                    .respond(response)
                    .await
                    .map(|processed| processed.record);
                self.reply("permission-response", result);
            }
            HostMessage::CancelDownload { id } => {
                let result = downloads.cancel(&id).await;
                if result.is_ok() {
                    self.prune_transfers().await;
                }
                self.reply("cancel-download", result);
            }
            HostMessage::PauseDownload { id } => {
                self.reply("pause-download", downloads.pause(&id).await);
            }
            HostMessage::ResumeDownload { id } => {
                self.reply("resume-download", downloads.resume(&id).await);
            }
            HostMessage::ClearCompletedDownloads => {
                let removed = downloads.clear_completed().await;
                self.prune_transfers().await;
                self.reply::<_, DownloadError>(
                    "clear-completed-downloads",
                    Ok(serde_json::json!({ "removed": removed })),
                );
            }
            HostMessage::ListDownloads => {
                self.reply::<_, DownloadError>("list-downloads", Ok(downloads.list().await));
            }
            HostMessage::GetPermissionPreferences => {
                self.reply("get-permission-preferences", permissions.preferences().await);
            }
            HostMessage::SetPermissionPreference {
                origin,
                permission,
                allowed,
            } => {
                self.reply(
                    "set-permission-preference",
                    permissions
                        .set_preference(&origin, &permission, allowed)
                        .await,
                );
            }
            HostMessage::RemovePermissionPreference { key } => {
                let result = permissions
                    .remove_preference(&key)
                    .await
                    .map(|existed| serde_json::json!({ "existed": existed }));
                self.reply("remove-permission-preference", result);
            }
            HostMessage::ClearPermissionPreferences => {
                let result = permissions
                    .clear_preferences()
                    .await
                    .map(|removed| serde_json::json!({ "removed": removed }));
                self.reply("clear-permission-preferences", result);
            }
            HostMessage::Unknown => {}
        }
    }

    async fn download_for(&self, transfer_id: &str) -> Option<String> {
        self.transfers.read().await.get(transfer_id).cloned()
    }

    /// Number of host transfers still mapped to a live download.
    pub async fn tracked_transfers(&self) -> usize {
        self.transfers.read().await.len()
    }

    /// Forget transfers whose download was cancelled, cleared or evicted.
    /// A late `download-done` for one of them is then ignored.
    async fn prune_transfers(&self) {
        let live: HashSet<String> = self
            .shell
            .downloads()
            .list()
            .await
            .into_iter()
            .filter(|record| !record.is_terminal())
            .map(|record| record.id)
            .collect();
        let mut transfers = self.transfers.write().await;
        let before = transfers.len();
        transfers.retain(|_, download_id| live.contains(download_id));
        let pruned = before - transfers.len();
        drop(transfers);
        if pruned > 0 {
            debug!(pruned, "Pruned finished host transfers");
        }
    }

    fn reply<T: Serialize, E: Display>(&self, command: &str, result: Result<T, E>) {
        let reply = match result {
            Ok(data) => HostReply::CommandResult {
                command: command.to_string(),
                ok: true,
                error: None,
                data: serde_json::to_value(data).ok(),
            },
            Err(e) => {
                debug!(command, error = %e, "Command failed");
                HostReply::CommandResult {
                    command: command.to_string(),
                    ok: false,
                    error: Some(e.to_string()),
                    data: None,
                }
            }
        };
        self.outbox.send(&reply);
    }

    /// Serve the bridge until the input ends or `shutdown` completes.
    ///
    /// Every shell event is written as a line alongside the replies.
    pub async fn run<R, W, S>(
        self: &Arc<Self>,
        reader: R,
        mut writer: W,
        mut outbound: mpsc::UnboundedReceiver<String>,
        shutdown: S,
    ) -> Result<(), BridgeError>
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin,
        S: Future<Output = ()>,
    {
        let mut events = self.shell.subscribe();
        let mut reader = BufReader::new(reader);
        let mut pending_bytes = Vec::new();
        tokio::pin!(shutdown);
        info!("Host bridge running");

        loop {
            tokio::select! {
                line = read_raw_line(&mut reader, &mut pending_bytes) => match line? {
                    Some(raw) => match String::from_utf8(raw) {
                        Ok(line) => self.handle_line(&line).await,
                        Err(e) => {
                            let preview = String::from_utf8_lossy(e.as_bytes()).into_owned();
                            warn!(line = %truncate(&preview, 120), "Skipping non-UTF-8 bridge line");
                        }
                    },
                    None => {
                        info!("Host closed the bridge input");
                        break;
                    }
                },
                Some(out) = outbound.recv() => write_line(&mut writer, &out).await?,
                event = events.recv() => match event {
                    Ok(event) => write_json(&mut writer, &event).await?,
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(skipped, "Bridge fell behind the event bus");
                    }
                    Err(RecvError::Closed) => break,
                },
                () = &mut shutdown => {
                    info!("Host bridge shutting down");
                    break;
                }
            }
        }

        // Flush whatever was produced before the loop ended.
        loop {
            match events.try_recv() {
                Ok(event) => write_json(&mut writer, &event).await?,
                Err(TryRecvError::Lagged(skipped)) => {
                    warn!(skipped, "Bridge fell behind the event bus");
                }
                Err(_) => break,
            }
        }
        while let Ok(out) = outbound.try_recv() {
            write_line(&mut writer, &out).await?;
        }
        writer.flush().await?;
        Ok(())
    }
}

/// Read one newline-terminated line without decoding it. Bytes of a line
/// interrupted by another `select!` branch stay in `buf` for the next call.
async fn read_raw_line<R>(
    reader: &mut BufReader<R>,
    buf: &mut Vec<u8>,
) -> std::io::Result<Option<Vec<u8>>>
where
    R: AsyncRead + Unpin,
{
    let read = reader.read_until(b'\n', buf).await?;
    if read == 0 && buf.is_empty() {
        return Ok(None);
    }
    let mut line = std::mem::take(buf);
    if line.last() == Some(&b'\n') {
        line.pop();
        if line.last() == Some(&b'\r') {
            line.pop();
        }
    }
    Ok(Some(line))
}

async fn write_line<W: AsyncWrite + Unpin>(writer: &mut W, line: &str) -> Result<(), BridgeError> {
    writer.write_all(line.as_bytes()).await?;
    writer.write_all(b"\n").await?;
    writer.flush().await?;
    Ok(())
}

async fn write_json<W, T>(writer: &mut W, value: &T) -> Result<(), BridgeError>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let line = serde_json::to_string(value)?;
    write_line(writer, &line).await
}

fn truncate(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn raw_lines_keep_invalid_bytes_and_strip_terminators() {
        let input: &[u8] = b"\xff\xfe\r\nok\nlast";
        let mut reader = BufReader::new(input);
        let mut buf = Vec::new();

        let first = read_raw_line(&mut reader, &mut buf).await.unwrap();
        assert_eq!(first, Some(vec![0xff, 0xfe]));
        let second = read_raw_line(&mut reader, &mut buf).await.unwrap();
        assert_eq!(second.as_deref(), Some(&b"ok"[..]));
        let third = read_raw_line(&mut reader, &mut buf).await.unwrap();
        assert_eq!(third.as_deref(), Some(&b"last"[..]));
        assert_eq!(read_raw_line(&mut reader, &mut buf).await.unwrap(), None);
    }

    #[test]
    fn truncate_respects_char_boundaries() {
        assert_eq!(truncate("héllo", 2), "hé");
        assert_eq!(truncate("abc", 10), "abc");
    }
}
