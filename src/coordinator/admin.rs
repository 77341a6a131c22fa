//! Host-only command handlers
//!
//! Authorization is checked in the dispatch layer before calling these.
//! Unknown targets are logged and dropped, never reported back.

use super::messages::close_code;
use super::Coordinator;
use crate::protocol::ServerMessage;
use crate::stats::StatsEvent;
use crate::types::*;

impl Coordinator {
    pub(super) fn handle_kick_user(&mut self, host: ConnId, uid: Uid) {
        if self
            .registry
            .get(host)
            .is_some_and(|h| h.identity.uid == uid)
        {
            tracing::warn!(uid = %uid, "Host tried to ban itself, ignoring");
            return;
        }

        let target = self.registry.by_uid(&uid).map(|c| (c.id, c.identity.clone()));
        let snapshot = target
            .as_ref()
            .map(|(_, identity)| identity.clone())
            .unwrap_or_else(|| Identity::placeholder(&uid));
        tracing::info!(uid = %uid, connected = target.is_some(), "Banning user");
        self.registry.ban(snapshot);

        match target {
            Some((conn, _)) => {
                if let Some(connection) = self.registry.get(conn) {
                    connection.send(ServerMessage::SystemKicked {
                        message: "You have been removed from this session".to_string(),
                    });
                    connection.close(close_code::KICKED, "kicked");
                }
                self.drop_connection(conn);
            }
            None => {
                // Not connected, but a stale queue entry must not survive the ban
                if self.floor.remove_by_uid(&uid).is_some() {
                    self.send_queue_to_host();
                }
            }
        }

        self.send_banned_to_host();
    }

    pub(super) fn handle_unkick_user(&mut self, uid: Uid) {
        match self.registry.unban(&uid) {
            Some(_) => {
                tracing::info!(uid = %uid, "Ban lifted");
                self.send_banned_to_host();
            }
            None => tracing::debug!(uid = %uid, "Unban for uid that is not banned"),
        }
    }

    pub(super) fn handle_remove_request(&mut self, uid: Uid) {
        let Some(entry) = self.floor.remove_by_uid(&uid) else {
            tracing::debug!(uid = %uid, "Remove-request for uid not in queue");
            return;
        };
        tracing::info!(uid = %uid, "Host removed floor request");

        // The entry's key may be stale; fall back to the live connection for the uid
        let live = self
            .registry
            .get(entry.conn)
            .or_else(|| self.registry.by_uid(&uid))
            .map(|c| c.id);
        if let Some(conn) = live {
            self.send_to(conn, ServerMessage::SystemRequestRemoved {});
        }
        self.send_queue_to_host();
    }

    pub(super) fn handle_force_release(&mut self) {
        match self.floor.force_release() {
            Some(seat) => {
                tracing::info!(uid = %seat.uid, "Host released the floor");
                self.stats.record(StatsEvent::FloorReleased { uid: seat.uid });
            }
            None => tracing::debug!("Host released an idle floor"),
        }
        self.broadcast_speaker();
    }

    pub(super) fn handle_grant_floor(&mut self, uid: Uid) {
        let Some(target) = self.registry.by_uid(&uid) else {
            tracing::debug!(uid = %uid, "Grant target not connected");
            return;
        };
        if target.privileged {
            tracing::debug!(uid = %uid, "Host cannot grant the floor to itself");
            return;
        }
        let conn = target.id;

        let previous = self.floor.grant(conn, &uid);
        tracing::info!(
            uid = %uid,
            overridden = previous.as_ref().map(|s| s.uid.as_str()),
            "Host granted the floor"
        );

        self.send_to(conn, ServerMessage::SystemSpeakGranted {});
        self.broadcast_speaker();
        self.send_queue_to_host();
        self.stats.record(StatsEvent::FloorGranted { uid });
    }
}
