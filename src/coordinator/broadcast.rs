//! View projections and fan-out helpers.

use super::Coordinator;
use crate::protocol::ServerMessage;
use crate::types::*;

impl Coordinator {
    pub(super) fn send_to(&self, conn: ConnId, msg: ServerMessage) {
        if let Some(connection) = self.registry.get(conn) {
            if !connection.send(msg) {
                tracing::debug!(conn = %conn, "Send skipped, connection not writable");
            }
        }
    }

    pub(super) fn send_to_host(&self, msg: ServerMessage) {
        if let Some(host) = self.registry.host() {
            host.send(msg);
        }
    }

    pub(super) fn broadcast(&self, msg: ServerMessage) {
        for connection in self.registry.all() {
            connection.send(msg.clone());
        }
    }

    pub(super) fn speaker_view(&self) -> Option<ParticipantView> {
        let seat = self.floor.speaker()?;
        self.registry
            .get(seat.conn)
            .map(|c| ParticipantView::from(&c.identity))
    }

    pub(super) fn queue_view(&self) -> Vec<QueueView> {
        self.floor
            .queue()
            .map(|entry| {
                match self.registry.get(entry.conn).map(|c| &c.identity) {
                    Some(identity) => QueueView {
                        uid: identity.uid.clone(),
                        display_name: identity.display_name.clone(),
                        email: identity.email.clone(),
                        picture: identity.picture.clone(),
                        requested_at: entry.requested_at.to_rfc3339(),
                    },
                    None => QueueView {
                        uid: entry.uid.clone(),
                        display_name: entry.uid.clone(),
                        email: String::new(),
                        picture: None,
                        requested_at: entry.requested_at.to_rfc3339(),
                    },
                }
            })
            .collect()
    }

    pub(super) fn participants_view(&self) -> Vec<ParticipantView> {
        self.registry
            .participants()
            .map(|c| ParticipantView::from(&c.identity))
            .collect()
    }

    pub(super) fn banned_view(&self) -> Vec<ParticipantView> {
        self.registry.banned().map(ParticipantView::from).collect()
    }

    pub(super) fn broadcast_speaker(&self) {
        self.broadcast(ServerMessage::SystemSpeakerUpdate {
            speaker: self.speaker_view(),
        });
    }

    pub(super) fn broadcast_session_status(&self) {
        self.broadcast(ServerMessage::SystemSessionStatus {
            active: self.session.active,
        });
    }

    pub(super) fn send_queue_to_host(&self) {
        self.send_to_host(ServerMessage::SystemRequestQueue {
            queue: self.queue_view(),
        });
    }

    pub(super) fn send_participants_to_host(&self) {
        self.send_to_host(ServerMessage::SystemParticipantList {
            participants: self.participants_view(),
        });
    }

    pub(super) fn send_banned_to_host(&self) {
        self.send_to_host(ServerMessage::SystemBannedList {
            banned_list: self.banned_view(),
        });
    }
}
