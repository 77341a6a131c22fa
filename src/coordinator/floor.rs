//! Floor control: one speaker slot plus a FIFO request queue.
//!
//! `FloorController` holds the data and enforces its invariants (slot and
//! queue disjoint, no duplicate uids in the queue). The `Coordinator` methods
//! below drive the transitions and emit the resulting messages.

use chrono::{DateTime, Utc};
use std::collections::{HashMap, VecDeque};

use super::Coordinator;
use crate::protocol::ServerMessage;
use crate::stats::StatsEvent;
use crate::types::*;

/// Holder of the floor
#[derive(Debug, Clone, PartialEq)]
pub struct Seat {
    pub conn: ConnId,
    pub uid: Uid,
}

/// Pending floor request
#[derive(Debug, Clone, PartialEq)]
pub struct QueueEntry {
    pub conn: ConnId,
    pub uid: Uid,
    pub requested_at: DateTime<Utc>,
}

/// Result of a participant's request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestOutcome {
    Granted,
    AlreadySpeaking,
    Queued { position: usize, newly: bool },
}

/// What a departing connection held
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Departure {
    pub was_speaker: bool,
    pub was_queued: bool,
}

#[derive(Debug, Default)]
pub struct FloorController {
    speaker: Option<Seat>,
    queue: VecDeque<QueueEntry>,
    /// uid -> time of last release. Bookkeeping only, nothing enforces it.
    cooldowns: HashMap<Uid, DateTime<Utc>>,
}

impl FloorController {
    pub fn speaker(&self) -> Option<&Seat> {
        self.speaker.as_ref()
    }

    pub fn queue(&self) -> impl Iterator<Item = &QueueEntry> {
        self.queue.iter()
    }

    pub fn queue_len(&self) -> usize {
        self.queue.len()
    }

    pub fn cooldowns(&self) -> &HashMap<Uid, DateTime<Utc>> {
        &self.cooldowns
    }

    pub fn clear_cooldowns(&mut self) {
        self.cooldowns.clear();
    }

    fn position_of(&self, conn: ConnId) -> Option<usize> {
        self.queue.iter().position(|e| e.conn == conn)
    }

    pub fn request(&mut self, conn: ConnId, uid: &str) -> RequestOutcome {
        match &self.speaker {
            None => {
                self.grant(conn, uid);
                RequestOutcome::Granted
            }
            Some(seat) if seat.conn == conn => RequestOutcome::AlreadySpeaking,
            Some(_) => match self.position_of(conn) {
                Some(index) => RequestOutcome::Queued {
                    position: index + 1,
                    newly: false,
                },
                None => {
                    self.queue.push_back(QueueEntry {
                        conn,
                        uid: uid.to_string(),
                        requested_at: Utc::now(),
                    });
                    RequestOutcome::Queued {
                        position: self.queue.len(),
                        newly: true,
                    }
                }
            },
        }
    }

    /// Seat `conn` unconditionally. Returns whoever was overridden.
    pub fn grant(&mut self, conn: ConnId, uid: &str) -> Option<Seat> {
        self.queue.retain(|e| e.conn != conn && e.uid != uid);
        self.speaker.replace(Seat {
            conn,
            uid: uid.to_string(),
        })
    }

    pub fn cancel(&mut self, conn: ConnId) -> bool {
        let before = self.queue.len();
        self.queue.retain(|e| e.conn != conn);
        self.queue.len() != before
    }

    /// Release held by `conn`. No-op unless it is the speaker.
    pub fn release(&mut self, conn: ConnId) -> Option<Seat> {
        if self.speaker.as_ref().is_some_and(|s| s.conn == conn) {
            self.force_release()
        } else {
            None
        }
    }

    /// Empty the slot whoever holds it. The queue is left as is.
    pub fn force_release(&mut self) -> Option<Seat> {
        let seat = self.speaker.take()?;
        self.cooldowns.insert(seat.uid.clone(), Utc::now());
        Some(seat)
    }

    /// Remove a queued request by uid, regardless of which key queued it
    pub fn remove_by_uid(&mut self, uid: &str) -> Option<QueueEntry> {
        let index = self.queue.iter().position(|e| e.uid == uid)?;
        self.queue.remove(index)
    }

    /// Clear everything `conn` holds
    pub fn depart(&mut self, conn: ConnId) -> Departure {
        let was_speaker = self.release(conn).is_some();
        let was_queued = self.cancel(conn);
        Departure {
            was_speaker,
            was_queued,
        }
    }
}

impl Coordinator {
    pub(super) fn handle_request_to_speak(&mut self, conn: ConnId) {
        let Some(sender) = self.registry.get(conn) else {
            return;
        };
        if sender.privileged {
            tracing::debug!(conn = %conn, "Ignoring floor request from host");
            return;
        }
        if !self.session.active {
            sender.send(ServerMessage::error("Session is not active"));
            return;
        }
        let identity = sender.identity.clone();
        let uid = identity.uid.clone();

        match self.floor.request(conn, &uid) {
            RequestOutcome::Granted => {
                tracing::info!(uid = %uid, "Floor granted");
                self.send_to(conn, ServerMessage::SystemSpeakGranted {});
                self.notify_host_of_request(&identity);
                self.broadcast_speaker();
                self.send_queue_to_host();
                self.stats.record(StatsEvent::FloorRequested { uid: uid.clone() });
                self.stats.record(StatsEvent::FloorGranted { uid });
            }
            RequestOutcome::AlreadySpeaking => {
                self.send_to(conn, ServerMessage::SystemSpeakGranted {});
                self.stats.record(StatsEvent::SpeakPulse { uid });
            }
            RequestOutcome::Queued { position, newly } => {
                tracing::info!(uid = %uid, position, newly, "Floor request queued");
                self.send_to(conn, ServerMessage::SystemRequestAcknowledged { position });
                if newly {
                    self.notify_host_of_request(&identity);
                }
                self.send_queue_to_host();
                self.stats.record(StatsEvent::FloorRequested { uid });
            }
        }
    }

    pub(super) fn handle_cancel_request(&mut self, conn: ConnId) {
        if !self.floor.cancel(conn) {
            return;
        }
        tracing::info!(conn = %conn, "Floor request cancelled");
        self.send_to(conn, ServerMessage::SystemRequestCancelled {});
        self.send_queue_to_host();
    }

    pub(super) fn handle_release_floor(&mut self, conn: ConnId) {
        let Some(seat) = self.floor.release(conn) else {
            return;
        };
        tracing::info!(uid = %seat.uid, "Floor released");
        self.broadcast_speaker();
        self.stats.record(StatsEvent::FloorReleased { uid: seat.uid });
    }

    pub(super) fn handle_speaking_started(&mut self, conn: ConnId) {
        if let Some(seat) = self.floor.speaker().filter(|s| s.conn == conn) {
            self.stats.record(StatsEvent::SpeakPulse {
                uid: seat.uid.clone(),
            });
        }
    }

    /// Disconnect or kick: a speaker releases, a queued request disappears
    pub(super) fn release_for_departure(&mut self, conn: ConnId, uid: &str) {
        let departure = self.floor.depart(conn);
        if departure.was_speaker {
            tracing::info!(uid = %uid, "Speaker left, floor released");
            self.broadcast_speaker();
            self.stats.record(StatsEvent::FloorReleased {
                uid: uid.to_string(),
            });
        }
        if departure.was_queued {
            self.send_queue_to_host();
        }
    }

    fn notify_host_of_request(&self, identity: &Identity) {
        self.send_to_host(ServerMessage::SystemStudentRequest {
            uid: identity.uid.clone(),
            name: identity.display_name.clone(),
            email: identity.email.clone(),
        });
    }
}
