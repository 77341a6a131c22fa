//! Message types for the coordinator mailbox.
//!
//! Everything that touches coordinator state arrives here as a message and is
//! processed to completion before the next one. Replies use `oneshot`.

use serde::Serialize;
use tokio::sync::{mpsc, oneshot};

use crate::protocol::{ClientMessage, ServerMessage};
use crate::types::*;

/// Messages sent to the coordinator task
#[derive(Debug)]
pub enum CoordinatorMessage {
    /// A verified identity wants to join. Replies with its key when admitted.
    Connect {
        identity: Identity,
        privileged: bool,
        outbox: Outbox,
        respond_to: oneshot::Sender<Option<ConnId>>,
    },

    /// A decoded frame from a live connection
    Inbound { conn: ConnId, message: ClientMessage },

    /// The transport behind a connection closed or errored
    Disconnect { conn: ConnId },

    /// The host grace timer elapsed
    GraceExpired { generation: u64 },

    /// Read-only projection of coordinator state
    Snapshot {
        respond_to: oneshot::Sender<CoordinatorSnapshot>,
    },
}

/// Frames delivered to the socket writer of one connection
#[derive(Debug, Clone, PartialEq)]
pub enum Outbound {
    Message(ServerMessage),
    /// Send a close frame and stop writing
    Close { code: u16, reason: String },
}

/// Close codes used when the coordinator ends a connection
pub mod close_code {
    /// Connection superseded by a newer one for the same uid
    pub const REPLACED: u16 = 4000;
    /// Identity is banned
    pub const KICKED: u16 = 4003;
    /// A host is already connected
    pub const HOST_PRESENT: u16 = 4009;
}

/// What to do when a connection's outbox is full
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendPolicy {
    /// Bounded outbox, overflow is dropped
    Drop,
    /// Unbounded outbox
    Buffer,
}

impl std::str::FromStr for SendPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "drop" => Ok(SendPolicy::Drop),
            "buffer" => Ok(SendPolicy::Buffer),
            other => Err(format!("unknown send policy: {}", other)),
        }
    }
}

/// Sending half of a connection's outbound queue
#[derive(Debug, Clone)]
pub enum Outbox {
    Bounded(mpsc::Sender<Outbound>),
    Unbounded(mpsc::UnboundedSender<Outbound>),
}

/// Receiving half handed to the socket writer
#[derive(Debug)]
pub enum OutboxReceiver {
    Bounded(mpsc::Receiver<Outbound>),
    Unbounded(mpsc::UnboundedReceiver<Outbound>),
}

impl Outbox {
    pub fn channel(policy: SendPolicy, capacity: usize) -> (Outbox, OutboxReceiver) {
        match policy {
            SendPolicy::Drop => {
                let (tx, rx) = mpsc::channel(capacity.max(1));
                (Outbox::Bounded(tx), OutboxReceiver::Bounded(rx))
            }
            SendPolicy::Buffer => {
                let (tx, rx) = mpsc::unbounded_channel();
                (Outbox::Unbounded(tx), OutboxReceiver::Unbounded(rx))
            }
        }
    }

    pub fn is_open(&self) -> bool {
        match self {
            Outbox::Bounded(tx) => !tx.is_closed(),
            Outbox::Unbounded(tx) => !tx.is_closed(),
        }
    }

    /// Liveness-checked, non-blocking send. Returns whether the frame was queued.
    pub fn send(&self, frame: Outbound) -> bool {
        if !self.is_open() {
            return false;
        }
        match self {
            Outbox::Bounded(tx) => match tx.try_send(frame) {
                Ok(()) => true,
                Err(mpsc::error::TrySendError::Full(_)) => {
                    tracing::debug!("Outbox full, dropping frame");
                    false
                }
                Err(mpsc::error::TrySendError::Closed(_)) => false,
            },
            Outbox::Unbounded(tx) => tx.send(frame).is_ok(),
        }
    }
}

impl OutboxReceiver {
    pub async fn recv(&mut self) -> Option<Outbound> {
        match self {
            OutboxReceiver::Bounded(rx) => rx.recv().await,
            OutboxReceiver::Unbounded(rx) => rx.recv().await,
        }
    }

    /// Non-blocking receive, `None` when nothing is queued
    pub fn try_recv(&mut self) -> Option<Outbound> {
        match self {
            OutboxReceiver::Bounded(rx) => rx.try_recv().ok(),
            OutboxReceiver::Unbounded(rx) => rx.try_recv().ok(),
        }
    }
}

/// Session part of a snapshot
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSnapshot {
    pub id: SessionId,
    pub active: bool,
    pub host_uid: Option<Uid>,
    pub started_at: String,
    pub ended_at: Option<String>,
    pub shutdown_pending: bool,
}

/// Read-only projection of coordinator state
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CoordinatorSnapshot {
    pub session: SessionSnapshot,
    pub host: Option<ParticipantView>,
    pub speaker: Option<ParticipantView>,
    pub queue: Vec<QueueView>,
    pub participants: Vec<ParticipantView>,
    pub banned: Vec<ParticipantView>,
    /// uid -> RFC 3339 time of last floor release
    pub cooldowns: std::collections::BTreeMap<Uid, String>,
}
