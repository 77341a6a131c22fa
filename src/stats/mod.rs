//! Fire-and-forget session statistics.
//!
//! The coordinator only ever calls [`StatsSink::record`], which must never
//! block. [`StatsHandle`] pushes events onto an unbounded channel drained by a
//! background task that owns the [`StatsRecorder`] and the optional event log.

mod recorder;

pub use recorder::{ParticipantReport, SampleSummary, SessionReport, StatsRecorder};

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::path::PathBuf;
use tokio::io::AsyncWriteExt;
use tokio::sync::{mpsc, oneshot};

use crate::config::env_parse;
use crate::types::{Identity, SessionId, Uid};

/// Events emitted by the coordinator
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum StatsEvent {
    SessionStarted {
        session_id: SessionId,
        host_uid: Uid,
        resumed: bool,
    },
    SessionEnded {
        session_id: SessionId,
    },
    Joined {
        identity: Identity,
    },
    Left {
        uid: Uid,
    },
    FloorRequested {
        uid: Uid,
    },
    FloorGranted {
        uid: Uid,
    },
    FloorReleased {
        uid: Uid,
    },
    SpeakPulse {
        uid: Uid,
    },
    LatencySample {
        uid: Uid,
        rtt: f64,
    },
    QualitySample {
        uid: Uid,
        rtt: Option<f64>,
        jitter: Option<f64>,
        packet_loss: Option<f64>,
    },
}

/// Receiver of coordinator events. Implementations must not block.
pub trait StatsSink: Send + Sync {
    fn record(&self, event: StatsEvent);
}

/// Stats configuration
#[derive(Debug, Clone)]
pub struct StatsConfig {
    /// Finished session records kept in memory
    pub history: usize,
    /// Append-only JSON-lines event log
    pub log_path: Option<PathBuf>,
}

impl Default for StatsConfig {
    fn default() -> Self {
        Self {
            history: 20,
            log_path: None,
        }
    }
}

impl StatsConfig {
    pub fn from_env() -> Self {
        let log_path = std::env::var("STATS_LOG_PATH")
            .ok()
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .map(PathBuf::from);

        Self {
            history: env_parse("STATS_HISTORY", 20),
            log_path,
        }
    }
}

enum StatsCommand {
    Record {
        event: StatsEvent,
        at: DateTime<Utc>,
    },
    Current {
        respond_to: oneshot::Sender<Option<SessionReport>>,
    },
    Session {
        session_id: SessionId,
        respond_to: oneshot::Sender<Option<SessionReport>>,
    },
}

/// Cloneable handle to the stats task
#[derive(Debug, Clone)]
pub struct StatsHandle {
    sender: mpsc::UnboundedSender<StatsCommand>,
}

impl std::fmt::Debug for StatsCommand {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StatsCommand::Record { event, .. } => write!(f, "Record({:?})", event),
            StatsCommand::Current { .. } => write!(f, "Current"),
            StatsCommand::Session { session_id, .. } => write!(f, "Session({})", session_id),
        }
    }
}

impl StatsHandle {
    /// Report for the current (open or most recently ended) session
    pub async fn current(&self) -> Option<SessionReport> {
        let (respond_to, rx) = oneshot::channel();
        self.sender.send(StatsCommand::Current { respond_to }).ok()?;
        rx.await.ok().flatten()
    }

    /// Report for a session id, current or archived
    pub async fn session(&self, session_id: &str) -> Option<SessionReport> {
        let (respond_to, rx) = oneshot::channel();
        self.sender
            .send(StatsCommand::Session {
                session_id: session_id.to_string(),
                respond_to,
            })
            .ok()?;
        rx.await.ok().flatten()
    }
}

impl StatsSink for StatsHandle {
    fn record(&self, event: StatsEvent) {
        let command = StatsCommand::Record {
            event,
            at: Utc::now(),
        };
        if let Err(e) = self.sender.send(command) {
            tracing::debug!("Stats task gone, dropping event: {:?}", e.0);
        }
    }
}

/// Spawn the stats task and return a handle to it
pub fn spawn(config: StatsConfig) -> StatsHandle {
    let (sender, receiver) = mpsc::unbounded_channel();
    tokio::spawn(run(config, receiver));
    StatsHandle { sender }
}

async fn run(config: StatsConfig, mut receiver: mpsc::UnboundedReceiver<StatsCommand>) {
    let mut recorder = StatsRecorder::new(config.history);
    let mut log = match &config.log_path {
        Some(path) => match EventLog::open(path).await {
            Ok(log) => Some(log),
            Err(e) => {
                tracing::warn!(path = %path.display(), "Stats event log disabled: {}", e);
                None
            }
        },
        None => None,
    };

    while let Some(command) = receiver.recv().await {
        match command {
            StatsCommand::Record { event, at } => {
                if let Some(log) = log.as_mut() {
                    log.append(&event, at).await;
                }
                recorder.apply(event, at);
            }
            StatsCommand::Current { respond_to } => {
                let _ = respond_to.send(recorder.current_report());
            }
            StatsCommand::Session {
                session_id,
                respond_to,
            } => {
                let _ = respond_to.send(recorder.report(&session_id));
            }
        }
    }

    tracing::debug!("Stats task stopped");
}

struct EventLog {
    file: tokio::fs::File,
}

impl EventLog {
    async fn open(path: &std::path::Path) -> std::io::Result<Self> {
        let file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .await?;
        Ok(Self { file })
    }

    /// Best effort: a failed write is logged and forgotten
    async fn append(&mut self, event: &StatsEvent, at: DateTime<Utc>) {
        let mut line = match serde_json::to_value(event) {
            Ok(line) => line,
            Err(e) => {
                tracing::warn!("Failed to encode stats event: {}", e);
                return;
            }
        };
        if let Some(fields) = line.as_object_mut() {
            fields.insert("at".to_string(), at.to_rfc3339().into());
        }
        let mut bytes = match serde_json::to_vec(&line) {
            Ok(bytes) => bytes,
            Err(e) => {
                tracing::warn!("Failed to encode stats event: {}", e);
                return;
            }
        };
        bytes.push(b'\n');
        if let Err(e) = self.file.write_all(&bytes).await {
            tracing::warn!("Failed to append stats event: {}", e);
            return;
        }
        if let Err(e) = self.file.flush().await {
            tracing::warn!("Failed to flush stats log: {}", e);
        }
    }
}
