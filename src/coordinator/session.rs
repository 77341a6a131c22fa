//! Session lifecycle: active flag, host presence and the unattended-shutdown timer.

use chrono::{DateTime, Utc};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use super::messages::{CoordinatorMessage, SessionSnapshot};
use super::Coordinator;
use crate::protocol::ServerMessage;
use crate::stats::StatsEvent;
use crate::types::*;

/// The single current session of this process
#[derive(Debug, Clone)]
pub struct SessionState {
    pub id: SessionId,
    pub active: bool,
    pub host_uid: Option<Uid>,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
}

impl Default for SessionState {
    fn default() -> Self {
        Self {
            id: ulid::Ulid::new().to_string(),
            active: false,
            host_uid: None,
            started_at: Utc::now(),
            ended_at: None,
        }
    }
}

impl SessionState {
    /// Resume when the same host returns while the session is open or ended
    /// less than `window` ago. Otherwise start a new session record.
    /// Returns whether the session was resumed.
    pub fn resume_or_start(
        &mut self,
        host_uid: &str,
        now: DateTime<Utc>,
        window: Duration,
    ) -> bool {
        let same_host = self.host_uid.as_deref() == Some(host_uid);
        let recent = match self.ended_at {
            None => true,
            Some(ended) => (now - ended).to_std().map_or(true, |elapsed| elapsed <= window),
        };

        let resumed = same_host && recent;
        if !resumed {
            self.id = ulid::Ulid::new().to_string();
            self.started_at = now;
        }
        self.host_uid = Some(host_uid.to_string());
        self.ended_at = None;
        self.active = true;
        resumed
    }
}

/// At most one pending grace timer. Cancelling bumps the generation so a
/// timer that already fired into the mailbox is recognised as stale.
#[derive(Debug, Default)]
pub struct ShutdownTimer {
    generation: u64,
    task: Option<JoinHandle<()>>,
}

impl ShutdownTimer {
    pub fn arm(&mut self, mailbox: mpsc::WeakSender<CoordinatorMessage>, grace: Duration) -> u64 {
        self.cancel();
        let generation = self.generation;
        self.task = Some(tokio::spawn(async move {
            tokio::time::sleep(grace).await;
            if let Some(mailbox) = mailbox.upgrade() {
                let _ = mailbox.send(CoordinatorMessage::GraceExpired { generation }).await;
            }
        }));
        generation
    }

    /// Returns whether a timer was pending
    pub fn cancel(&mut self) -> bool {
        self.generation += 1;
        match self.task.take() {
            Some(task) => {
                task.abort();
                true
            }
            None => false,
        }
    }

    pub fn is_pending(&self) -> bool {
        self.task.is_some()
    }

    /// True when `generation` belongs to the currently armed timer
    pub fn is_current(&self, generation: u64) -> bool {
        self.task.is_some() && self.generation == generation
    }
}

impl Coordinator {
    pub(super) fn handle_register_as_host(&mut self, conn: ConnId) {
        let Some(host) = self.registry.get(conn) else {
            return;
        };
        let uid = host.identity.uid.clone();

        if self.shutdown.cancel() {
            tracing::info!(uid = %uid, "Host returned, shutdown cancelled");
        }

        let resumed = self
            .session
            .resume_or_start(&uid, Utc::now(), self.config.resume_window);
        if !resumed {
            self.floor.clear_cooldowns();
        }
        tracing::info!(
            session_id = %self.session.id,
            host_uid = %uid,
            resumed,
            "Host registered, session active"
        );

        self.broadcast_session_status();
        self.send_queue_to_host();
        self.stats.record(StatsEvent::SessionStarted {
            session_id: self.session.id.clone(),
            host_uid: uid,
            resumed,
        });

        // A fresh record has not seen participants who connected before the
        // host registered. A resumed record already counted them.
        if !resumed {
            for participant in self.registry.participants() {
                self.stats.record(StatsEvent::Joined {
                    identity: participant.identity.clone(),
                });
            }
        }
    }

    pub(super) fn handle_toggle_session(&mut self, active: bool) {
        tracing::info!(active, "Host toggled session");
        self.session.active = active;
        self.broadcast_session_status();
    }

    /// The registered host's connection is gone
    pub(super) fn host_departed(&mut self) {
        self.session.active = false;
        self.session.ended_at = Some(Utc::now());
        self.broadcast_session_status();
        self.stats.record(StatsEvent::SessionEnded {
            session_id: self.session.id.clone(),
        });

        let generation = self
            .shutdown
            .arm(self.mailbox.clone(), self.config.host_grace);
        tracing::warn!(
            grace_secs = self.config.host_grace.as_secs(),
            generation,
            "Host disconnected, shutting down unless a host registers"
        );
    }

    /// Returns true when the process should terminate
    pub(super) fn handle_grace_expired(&mut self, generation: u64) -> bool {
        if !self.shutdown.is_current(generation) {
            tracing::debug!(generation, "Ignoring stale grace timer");
            return false;
        }
        self.shutdown.task = None;
        tracing::warn!("No host registered within the grace period, terminating");
        self.broadcast(ServerMessage::SystemSessionStatus { active: false });
        true
    }

    pub(super) fn session_snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            id: self.session.id.clone(),
            active: self.session.active,
            host_uid: self.session.host_uid.clone(),
            started_at: self.session.started_at.to_rfc3339(),
            ended_at: self.session.ended_at.map(|t| t.to_rfc3339()),
            shutdown_pending: self.shutdown.is_pending(),
        }
    }
}
