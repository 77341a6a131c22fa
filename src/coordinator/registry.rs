//! Connection registry and admission.
//!
//! The registry owns every live connection. Other components refer to a
//! connection only by its [`ConnId`] and resolve it here, so a closed
//! connection can never be reached through a stale handle.

use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashMap};

use super::messages::{close_code, Outbound, Outbox};
use super::Coordinator;
use crate::protocol::ServerMessage;
use crate::stats::StatsEvent;
use crate::types::*;

/// A live, admitted connection
#[derive(Debug)]
pub struct Connection {
    pub id: ConnId,
    pub identity: Identity,
    pub privileged: bool,
    pub outbox: Outbox,
    pub connected_at: DateTime<Utc>,
}

impl Connection {
    pub fn send(&self, msg: ServerMessage) -> bool {
        self.outbox.send(Outbound::Message(msg))
    }

    pub fn close(&self, code: u16, reason: &str) {
        self.outbox.send(Outbound::Close {
            code,
            reason: reason.to_string(),
        });
    }
}

/// Arena of live connections plus the process-lifetime ban set
#[derive(Debug, Default)]
pub struct ConnectionRegistry {
    /// Ordered by key, which is admission order
    connections: BTreeMap<ConnId, Connection>,
    by_uid: HashMap<Uid, ConnId>,
    banned: BTreeMap<Uid, Identity>,
    next_id: u64,
}

impl ConnectionRegistry {
    pub fn allocate_id(&mut self) -> ConnId {
        self.next_id += 1;
        ConnId(self.next_id)
    }

    pub fn insert(&mut self, connection: Connection) {
        self.by_uid
            .insert(connection.identity.uid.clone(), connection.id);
        self.connections.insert(connection.id, connection);
    }

    pub fn remove(&mut self, id: ConnId) -> Option<Connection> {
        let connection = self.connections.remove(&id)?;
        if self.by_uid.get(&connection.identity.uid) == Some(&id) {
            self.by_uid.remove(&connection.identity.uid);
        }
        Some(connection)
    }

    pub fn get(&self, id: ConnId) -> Option<&Connection> {
        self.connections.get(&id)
    }

    pub fn by_uid(&self, uid: &str) -> Option<&Connection> {
        self.by_uid
            .get(uid)
            .and_then(|id| self.connections.get(id))
    }

    /// The single privileged connection, if one is registered
    pub fn host(&self) -> Option<&Connection> {
        self.connections.values().find(|c| c.privileged)
    }

    /// Non-privileged connections in admission order
    pub fn participants(&self) -> impl Iterator<Item = &Connection> {
        self.connections.values().filter(|c| !c.privileged)
    }

    pub fn all(&self) -> impl Iterator<Item = &Connection> {
        self.connections.values()
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    pub fn is_banned(&self, uid: &str) -> bool {
        self.banned.contains_key(uid)
    }

    pub fn ban(&mut self, identity: Identity) {
        self.banned.insert(identity.uid.clone(), identity);
    }

    pub fn unban(&mut self, uid: &str) -> Option<Identity> {
        self.banned.remove(uid)
    }

    pub fn banned(&self) -> impl Iterator<Item = &Identity> {
        self.banned.values()
    }
}

impl Coordinator {
    /// Admit a verified identity. Returns the new key, or `None` when rejected.
    pub fn admit(
        &mut self,
        identity: Identity,
        privileged: bool,
        outbox: Outbox,
    ) -> Option<ConnId> {
        let uid = identity.uid.clone();

        if self.registry.is_banned(&uid) {
            tracing::info!(uid = %uid, "Rejecting banned identity");
            outbox.send(Outbound::Message(ServerMessage::SystemKicked {
                message: "You have been removed from this session".to_string(),
            }));
            outbox.send(Outbound::Close {
                code: close_code::KICKED,
                reason: "kicked".to_string(),
            });
            return None;
        }

        // Newest connection wins for the same uid
        if let Some(previous) = self.registry.by_uid(&uid).map(|c| c.id) {
            tracing::info!(uid = %uid, old = %previous, "Replacing existing connection");
            if let Some(old) = self.registry.get(previous) {
                old.close(close_code::REPLACED, "replaced");
            }
            self.drop_connection(previous);
        }

        if privileged {
            if let Some(host) = self.registry.host() {
                tracing::warn!(
                    uid = %uid,
                    host_uid = %host.identity.uid,
                    "Rejecting second host connection"
                );
                outbox.send(Outbound::Message(ServerMessage::error(
                    "A host is already present in this session",
                )));
                outbox.send(Outbound::Close {
                    code: close_code::HOST_PRESENT,
                    reason: "host already present".to_string(),
                });
                return None;
            }
        }

        let id = self.registry.allocate_id();
        let is_returning_host = privileged && self.session.host_uid.as_deref() == Some(&uid);
        let connection = Connection {
            id,
            identity: identity.clone(),
            privileged,
            outbox,
            connected_at: Utc::now(),
        };

        connection.send(ServerMessage::SystemWelcome {
            uid: identity.uid.clone(),
            display_name: identity.display_name.clone(),
            email: identity.email.clone(),
            picture: identity.picture.clone(),
            is_host: privileged,
            session_active: self.session.active,
            speaker: self.speaker_view(),
        });
        self.registry.insert(connection);

        tracing::info!(
            conn = %id,
            uid = %uid,
            privileged,
            connections = self.registry.len(),
            "Connection admitted"
        );

        self.send_participants_to_host();
        if privileged {
            self.send_banned_to_host();
            if is_returning_host {
                self.send_queue_to_host();
            }
        } else {
            self.stats.record(StatsEvent::Joined { identity });
        }

        Some(id)
    }

    /// Transport for `conn` closed. Stale keys are ignored.
    pub fn disconnect(&mut self, conn: ConnId) {
        if self.registry.get(conn).is_none() {
            tracing::debug!(conn = %conn, "Disconnect for unknown connection");
            return;
        }
        self.drop_connection(conn);
    }

    /// Remove a connection and cascade into floor and session state
    pub(super) fn drop_connection(&mut self, conn: ConnId) {
        let Some(connection) = self.registry.remove(conn) else {
            return;
        };
        let uid = connection.identity.uid.clone();
        tracing::info!(
            conn = %conn,
            uid = %uid,
            connections = self.registry.len(),
            "Connection removed"
        );

        self.release_for_departure(conn, &uid);

        if connection.privileged {
            if self.session.host_uid.as_deref() == Some(uid.as_str()) {
                self.host_departed();
            }
        } else {
            self.send_participants_to_host();
            self.stats.record(StatsEvent::Left { uid });
        }
    }
}
