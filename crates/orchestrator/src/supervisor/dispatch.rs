//! IPC plumbing for attached workers.
//!
//! Each spawned worker gets three tasks: a writer draining its outbox into
//! stdin, a reader feeding stdout frames to [`Supervisor::handle_worker_message`],
//! and an exit watcher that reports the process exit exactly once.

use fleet_core::{BotId, Error, WorkerStatus};
use fleet_ipc::{
    ControllerMessage, FrameReader, FrameWriter, LogLevel, RequestKind, TransportError,
    WorkerMessage,
};
use serde_json::json;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use super::Supervisor;
use crate::policy::RestartReason;
use crate::process::{ExitInfo, SpawnedWorker};
use crate::registry::{ReloadAck, StopIntent, WorkerHandle};

const OUTBOX_CAPACITY: usize = 64;

type WorkerStdin = Box<dyn AsyncWrite + Send + Unpin>;
type WorkerStdout = Box<dyn AsyncRead + Send + Unpin>;

impl Supervisor {
    /// Wire a freshly spawned process to its record.
    pub(super) async fn attach(&self, bot_id: BotId, spawned: SpawnedWorker) -> u32 {
        let SpawnedWorker {
            pid,
            stdin,
            stdout,
            exit,
        } = spawned;
        let (outbox, inbox) = mpsc::channel(OUTBOX_CAPACITY);
        let (exit_tx, exited) = watch::channel(None);

        {
            let mut registry = self.registry().await;
            if let Some(record) = registry.get_mut(bot_id) {
                record.pid = Some(pid);
                record.handle = Some(WorkerHandle {
                    pid,
                    outbox,
                    exited,
                });
            }
        }

        tokio::spawn(write_loop(bot_id, pid, FrameWriter::new(stdin), inbox));
        tokio::spawn(self.clone().read_loop(bot_id, pid, FrameReader::new(stdout)));

        let supervisor = self.clone();
        tokio::spawn(async move {
            let info = exit.await;
            exit_tx.send_replace(Some(info));
            supervisor.handle_exit(bot_id, pid, info).await;
        });

        pid
    }

    async fn read_loop(self, bot_id: BotId, pid: u32, mut reader: FrameReader<WorkerStdout>) {
        loop {
            match reader.recv::<WorkerMessage>().await {
                Ok(message) => self.handle_worker_message(bot_id, pid, message).await,
                Err(TransportError::Decode { reason, len }) => {
                    warn!(bot_id = %bot_id, pid, len, reason = %reason, "Skipping undecodable worker frame");
                }
                Err(e) if e.is_closed() => {
                    debug!(bot_id = %bot_id, pid, "Worker closed its output");
                    break;
                }
                Err(e) => {
                    warn!(bot_id = %bot_id, pid, error = %e, "Worker channel failed");
                    break;
                }
            }
        }
    }

    /// Dispatch one message from a worker.
    ///
    /// Messages from a connection that is no longer the bot's registered one
    /// are dropped.
    pub async fn handle_worker_message(&self, bot_id: BotId, pid: u32, message: WorkerMessage) {
        let now = Instant::now();
        let mut registry = self.registry().await;
        let Some(record) = registry.get_mut(bot_id) else {
            debug!(bot_id = %bot_id, pid, kind = message.kind(), "Message for unregistered bot");
            return;
        };
        if record.handle.as_ref().map(|h| h.pid) != Some(pid) {
            debug!(bot_id = %bot_id, pid, kind = message.kind(), "Ignoring message from stale worker");
            return;
        }

        match message {
            WorkerMessage::Ready { .. } | WorkerMessage::Heartbeat { rss_bytes: None } => {
                record.last_heartbeat = Some(now);
            }
            WorkerMessage::Heartbeat {
                rss_bytes: Some(rss),
            } => {
                record.last_heartbeat = Some(now);
                record.rss_bytes = Some(rss);
            }
            WorkerMessage::Log { level, line } => {
                emit_worker_log(bot_id, level, &line);
                record.logs.push(level, line);
                return;
            }
            WorkerMessage::HotReloadAck {
                revision,
                applied,
                error,
            } => {
                match record.pending_reload.take() {
                    Some(pending) if pending.revision == revision => {
                        let _ = pending.reply.send(ReloadAck { applied, error });
                    }
                    other => {
                        record.pending_reload = other;
                        debug!(bot_id = %bot_id, revision, "Ignoring unexpected hot reload ack");
                    }
                }
                return;
            }
            WorkerMessage::Request { request_id, kind } => {
                let outbox = record.handle.as_ref().map(|h| h.outbox.clone());
                drop(registry);
                if let Some(outbox) = outbox {
                    self.answer_request(bot_id, request_id, kind, outbox);
                }
                return;
            }
        }

        if record.status == WorkerStatus::Starting {
            match record.transition(WorkerStatus::Running) {
                Ok(()) => {
                    registry.release_start_lock(bot_id);
                    info!(bot_id = %bot_id, pid, "Worker running");
                }
                Err(e) => warn!(bot_id = %bot_id, error = %e, "Could not promote worker"),
            }
        }
    }

    fn answer_request(
        &self,
        bot_id: BotId,
        request_id: u64,
        kind: RequestKind,
        outbox: mpsc::Sender<ControllerMessage>,
    ) {
        let metadata = self.metadata();
        tokio::spawn(async move {
            let body = match (kind, metadata) {
                (RequestKind::AssistantMetadata, Some(source)) => {
                    match source.assistant_metadata(bot_id).await {
                        Ok(value) => value.to_string(),
                        Err(e) => {
                            warn!(bot_id = %bot_id, request_id, error = %e, "Metadata request failed");
                            json!({ "error": e.to_string() }).to_string()
                        }
                    }
                }
                (RequestKind::AssistantMetadata, None) => {
                    json!({ "error": "no control plane configured" }).to_string()
                }
            };
            if outbox
                .send(ControllerMessage::Response { request_id, body })
                .await
                .is_err()
            {
                debug!(bot_id = %bot_id, request_id, "Worker gone before response");
            }
        });
    }

    /// Record a process exit. Exits the supervisor did not ask for crash the
    /// worker and go to the restart policy.
    pub(crate) async fn handle_exit(&self, bot_id: BotId, pid: u32, exit: ExitInfo) {
        let now = Instant::now();
        let mut registry = self.registry().await;
        let Some(record) = registry.get_mut(bot_id) else {
            debug!(bot_id = %bot_id, pid, "Exit of unregistered worker");
            return;
        };
        if record.handle.as_ref().map(|h| h.pid) != Some(pid) {
            debug!(bot_id = %bot_id, pid, "Ignoring exit of stale worker");
            return;
        }

        record.handle = None;
        record.pid = None;
        record.last_exit = Some(exit);
        if record.stop_intent != StopIntent::None {
            debug!(bot_id = %bot_id, pid, exit = %exit, "Worker exited on request");
            return;
        }

        let err = Error::process_exit(bot_id, exit.code, exit.signal);
        warn!(bot_id = %bot_id, pid, kind = err.kind(), "{err}");
        if let Err(e) = record.transition(WorkerStatus::Crashed) {
            error!(bot_id = %bot_id, error = %e, "Could not mark worker crashed");
            return;
        }
        registry.release_start_lock(bot_id);
        let decision = registry
            .policy
            .request(bot_id, RestartReason::Crash, false, now);
        debug!(bot_id = %bot_id, ?decision, "Crash handed to restart policy");
    }
}

async fn write_loop(
    bot_id: BotId,
    pid: u32,
    mut writer: FrameWriter<WorkerStdin>,
    mut inbox: mpsc::Receiver<ControllerMessage>,
) {
    while let Some(message) = inbox.recv().await {
        if let Err(e) = writer.send(&message).await {
            debug!(bot_id = %bot_id, pid, error = %e, "Worker input closed");
            break;
        }
    }
}

fn emit_worker_log(bot_id: BotId, level: LogLevel, line: &str) {
    match level {
        LogLevel::Debug => debug!(target: "fleet::worker", bot_id = %bot_id, "{line}"),
        LogLevel::Info => info!(target: "fleet::worker", bot_id = %bot_id, "{line}"),
        LogLevel::Warn => warn!(target: "fleet::worker", bot_id = %bot_id, "{line}"),
        LogLevel::Error => error!(target: "fleet::worker", bot_id = %bot_id, "{line}"),
    }
}
