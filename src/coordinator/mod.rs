//! Session coordinator.
//!
//! A single task owns all coordinator state (registry, floor, session) and
//! processes [`CoordinatorMessage`]s one at a time in arrival order. Timers
//! fire back into the same mailbox, so no handler ever interleaves with
//! another. Socket tasks talk to it through a [`CoordinatorHandle`].

mod admin;
mod broadcast;
mod floor;
pub mod messages;
mod registry;
mod relay;
mod session;

pub use floor::{FloorController, QueueEntry, RequestOutcome, Seat};
pub use messages::{
    close_code, CoordinatorMessage, CoordinatorSnapshot, Outbound, Outbox, OutboxReceiver,
    SendPolicy, SessionSnapshot,
};
pub use registry::{Connection, ConnectionRegistry};
pub use session::{SessionState, ShutdownTimer};

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::config::{env_parse, env_secs};
use crate::protocol::{ClientMessage, ServerMessage};
use crate::stats::{StatsEvent, StatsSink};
use crate::types::*;
use relay::SignalKind;

/// Coordinator tuning
#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    /// How long the session may stay hostless before the process exits
    pub host_grace: Duration,
    /// How long after ending a session the same host may resume it
    pub resume_window: Duration,
    pub send_policy: SendPolicy,
    /// Outbox size per connection under `SendPolicy::Drop`
    pub outbound_capacity: usize,
    pub mailbox_capacity: usize,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            host_grace: Duration::from_secs(10),
            resume_window: Duration::from_secs(300),
            send_policy: SendPolicy::Drop,
            outbound_capacity: 64,
            mailbox_capacity: 1024,
        }
    }
}

impl CoordinatorConfig {
    /// Load coordinator config from environment variables
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let config = Self {
            host_grace: env_secs("HOST_GRACE_SECS", defaults.host_grace.as_secs()),
            resume_window: env_secs("SESSION_RESUME_SECS", defaults.resume_window.as_secs()),
            send_policy: env_parse("SEND_POLICY", defaults.send_policy),
            outbound_capacity: env_parse("OUTBOUND_CAPACITY", defaults.outbound_capacity),
            mailbox_capacity: env_parse("MAILBOX_CAPACITY", defaults.mailbox_capacity).max(1),
        };

        tracing::info!(
            host_grace_secs = config.host_grace.as_secs(),
            resume_window_secs = config.resume_window.as_secs(),
            send_policy = ?config.send_policy,
            outbound_capacity = config.outbound_capacity,
            "Coordinator config loaded"
        );
        config
    }
}

/// Why the coordinator loop stopped
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitReason {
    /// Grace period elapsed without a host registering
    HostAbsent,
    /// Every handle was dropped
    MailboxClosed,
}

/// Macro to check host authorization and return early if unauthorized
macro_rules! check_host {
    ($self:expr, $conn:expr, $action:expr) => {
        if !$self.registry.get($conn).is_some_and(|c| c.privileged) {
            $self.send_to(
                $conn,
                ServerMessage::error(format!("Only the host can {}", $action)),
            );
            return;
        }
    };
}

pub struct Coordinator {
    config: CoordinatorConfig,
    registry: ConnectionRegistry,
    floor: FloorController,
    session: SessionState,
    shutdown: ShutdownTimer,
    stats: Arc<dyn StatsSink>,
    /// Used by timers to post back into the mailbox
    mailbox: mpsc::WeakSender<CoordinatorMessage>,
}

impl Coordinator {
    pub fn new(
        config: CoordinatorConfig,
        stats: Arc<dyn StatsSink>,
        mailbox: mpsc::WeakSender<CoordinatorMessage>,
    ) -> Self {
        Self {
            config,
            registry: ConnectionRegistry::default(),
            floor: FloorController::default(),
            session: SessionState::default(),
            shutdown: ShutdownTimer::default(),
            stats,
            mailbox,
        }
    }

    /// Start the coordinator task
    pub fn spawn(
        config: CoordinatorConfig,
        stats: Arc<dyn StatsSink>,
    ) -> (CoordinatorHandle, JoinHandle<ExitReason>) {
        let (sender, receiver) = mpsc::channel(config.mailbox_capacity.max(1));
        let handle = CoordinatorHandle {
            sender: sender.clone(),
            send_policy: config.send_policy,
            outbound_capacity: config.outbound_capacity,
        };
        let coordinator = Coordinator::new(config, stats, sender.downgrade());
        drop(sender);

        let task = tokio::spawn(coordinator.run(receiver));
        (handle, task)
    }

    pub async fn run(mut self, mut receiver: mpsc::Receiver<CoordinatorMessage>) -> ExitReason {
        tracing::info!(session_id = %self.session.id, "Coordinator started");
        while let Some(message) = receiver.recv().await {
            if let Some(reason) = self.handle(message) {
                tracing::info!(?reason, "Coordinator stopping");
                return reason;
            }
        }
        tracing::info!("Coordinator mailbox closed");
        ExitReason::MailboxClosed
    }

    /// Process one mailbox message to completion
    pub fn handle(&mut self, message: CoordinatorMessage) -> Option<ExitReason> {
        match message {
            CoordinatorMessage::Connect {
                identity,
                privileged,
                outbox,
                respond_to,
            } => {
                let admitted = self.admit(identity, privileged, outbox);
                let _ = respond_to.send(admitted);
            }
            CoordinatorMessage::Inbound { conn, message } => self.dispatch(conn, message),
            CoordinatorMessage::Disconnect { conn } => self.disconnect(conn),
            CoordinatorMessage::GraceExpired { generation } => {
                if self.handle_grace_expired(generation) {
                    return Some(ExitReason::HostAbsent);
                }
            }
            CoordinatorMessage::Snapshot { respond_to } => {
                let _ = respond_to.send(self.snapshot());
            }
        }
        None
    }

    /// Route an inbound message from an admitted connection
    pub fn dispatch(&mut self, conn: ConnId, message: ClientMessage) {
        let Some(sender) = self.registry.get(conn) else {
            tracing::debug!(conn = %conn, kind = message.kind(), "Message from unknown connection");
            return;
        };
        // Admission already filters bans, this covers a ban racing the socket
        if self.registry.is_banned(&sender.identity.uid) {
            return;
        }
        tracing::debug!(conn = %conn, kind = message.kind(), "Inbound message");

        match message {
            // Floor control
            ClientMessage::RequestToSpeak {} => self.handle_request_to_speak(conn),
            ClientMessage::CancelRequest {} => self.handle_cancel_request(conn),
            ClientMessage::ReleaseFloor {} | ClientMessage::FinishedSpeaking {} => {
                self.handle_release_floor(conn)
            }
            ClientMessage::SpeakingStarted {} => self.handle_speaking_started(conn),

            // Session lifecycle
            ClientMessage::RegisterAsHost {} => {
                check_host!(self, conn, "register as host");
                self.handle_register_as_host(conn)
            }
            ClientMessage::AdminToggleSession { active } => {
                check_host!(self, conn, "toggle the session");
                self.handle_toggle_session(active)
            }

            // Host-only floor and ban administration
            ClientMessage::AdminKickUser { uid } => {
                check_host!(self, conn, "kick users");
                self.handle_kick_user(conn, uid)
            }
            ClientMessage::AdminUnkickUser { uid } => {
                check_host!(self, conn, "unkick users");
                self.handle_unkick_user(uid)
            }
            ClientMessage::AdminRemoveRequest { uid } => {
                check_host!(self, conn, "remove requests");
                self.handle_remove_request(uid)
            }
            ClientMessage::AdminReleaseFloor {} => {
                check_host!(self, conn, "release the floor");
                self.handle_force_release()
            }
            ClientMessage::AdminGrantFloor { uid } => {
                check_host!(self, conn, "grant the floor");
                self.handle_grant_floor(uid)
            }

            // Negotiation relay
            ClientMessage::WebrtcOffer(payload) => {
                self.handle_signal(conn, SignalKind::Offer, payload)
            }
            ClientMessage::WebrtcAnswer(payload) => {
                self.handle_signal(conn, SignalKind::Answer, payload)
            }
            ClientMessage::WebrtcIceCandidate(payload) => {
                self.handle_signal(conn, SignalKind::IceCandidate, payload)
            }

            // Liveness and quality samples
            ClientMessage::Ping {} => self.send_to(conn, ServerMessage::Pong {}),
            ClientMessage::LatencyUpdate { rtt } => {
                if let Some(uid) = self.uid_of(conn) {
                    self.stats.record(StatsEvent::LatencySample { uid, rtt });
                }
            }
            ClientMessage::WebrtcStats {
                rtt,
                jitter,
                packet_loss,
            } => {
                if let Some(uid) = self.uid_of(conn) {
                    self.stats.record(StatsEvent::QualitySample {
                        uid,
                        rtt,
                        jitter,
                        packet_loss,
                    });
                }
            }
        }
    }

    fn uid_of(&self, conn: ConnId) -> Option<Uid> {
        self.registry.get(conn).map(|c| c.identity.uid.clone())
    }

    pub fn snapshot(&self) -> CoordinatorSnapshot {
        CoordinatorSnapshot {
            session: self.session_snapshot(),
            host: self
                .registry
                .host()
                .map(|c| ParticipantView::from(&c.identity)),
            speaker: self.speaker_view(),
            queue: self.queue_view(),
            participants: self.participants_view(),
            banned: self.banned_view(),
            cooldowns: self
                .floor
                .cooldowns()
                .iter()
                .map(|(uid, at)| (uid.clone(), at.to_rfc3339()))
                .collect(),
        }
    }
}

/// Cloneable entry point used by socket tasks and the REST layer
#[derive(Debug, Clone)]
pub struct CoordinatorHandle {
    sender: mpsc::Sender<CoordinatorMessage>,
    send_policy: SendPolicy,
    outbound_capacity: usize,
}

impl CoordinatorHandle {
    /// Outbox pair sized according to the configured send policy
    pub fn outbox(&self) -> (Outbox, OutboxReceiver) {
        Outbox::channel(self.send_policy, self.outbound_capacity)
    }

    /// Ask for admission. `None` means rejected (or the coordinator is gone).
    pub async fn connect(
        &self,
        identity: Identity,
        privileged: bool,
        outbox: Outbox,
    ) -> Option<ConnId> {
        let (respond_to, rx) = oneshot::channel();
        self.sender
            .send(CoordinatorMessage::Connect {
                identity,
                privileged,
                outbox,
                respond_to,
            })
            .await
            .ok()?;
        rx.await.ok().flatten()
    }

    pub async fn inbound(&self, conn: ConnId, message: ClientMessage) {
        if self
            .sender
            .send(CoordinatorMessage::Inbound { conn, message })
            .await
            .is_err()
        {
            tracing::debug!(conn = %conn, "Coordinator gone, dropping inbound message");
        }
    }

    pub async fn disconnect(&self, conn: ConnId) {
        let _ = self
            .sender
            .send(CoordinatorMessage::Disconnect { conn })
            .await;
    }

    pub async fn snapshot(&self) -> Option<CoordinatorSnapshot> {
        let (respond_to, rx) = oneshot::channel();
        self.sender
            .send(CoordinatorMessage::Snapshot { respond_to })
            .await
            .ok()?;
        rx.await.ok()
    }
}
