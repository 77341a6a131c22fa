//! Role-gated forwarding of negotiation messages between host and participants.
//!
//! Payloads are never interpreted beyond reading `targetUid`. Anything that
//! cannot be delivered is dropped; callers retry on their own.

use super::Coordinator;
use crate::protocol::{ServerMessage, SignalPayload};
use crate::types::*;

/// Which relayed message kind is being forwarded
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalKind {
    Offer,
    Answer,
    IceCandidate,
}

impl SignalKind {
    fn wrap(self, payload: SignalPayload) -> ServerMessage {
        match self {
            SignalKind::Offer => ServerMessage::WebrtcOffer(payload),
            SignalKind::Answer => ServerMessage::WebrtcAnswer(payload),
            SignalKind::IceCandidate => ServerMessage::WebrtcIceCandidate(payload),
        }
    }
}

impl Coordinator {
    pub(super) fn handle_signal(&self, conn: ConnId, kind: SignalKind, payload: SignalPayload) {
        let Some(sender) = self.registry.get(conn) else {
            return;
        };
        let targeted = match kind {
            SignalKind::Offer => false,
            SignalKind::Answer => true,
            SignalKind::IceCandidate => payload.target_uid().is_some(),
        };

        if sender.privileged {
            if !targeted {
                tracing::debug!(?kind, "Dropping untargeted signal from host");
                return;
            }
            self.relay_to_participant(kind, payload);
        } else {
            if targeted {
                tracing::debug!(
                    uid = %sender.identity.uid,
                    ?kind,
                    "Ignoring targeted signal from non-host"
                );
                return;
            }
            let uid = sender.identity.uid.clone();
            self.relay_to_host(&uid, kind, payload);
        }
    }

    fn relay_to_host(&self, from_uid: &str, kind: SignalKind, payload: SignalPayload) {
        let Some(host) = self.registry.host() else {
            tracing::debug!(from_uid, ?kind, "No host connected, dropping signal");
            return;
        };
        if !host.send(kind.wrap(payload.with_sender(from_uid))) {
            tracing::debug!(from_uid, ?kind, "Host not writable, signal dropped");
        }
    }

    fn relay_to_participant(&self, kind: SignalKind, payload: SignalPayload) {
        let Some(target_uid) = payload.target_uid().map(str::to_string) else {
            tracing::debug!(?kind, "Host signal without targetUid");
            return;
        };
        let Some(target) = self.registry.by_uid(&target_uid) else {
            tracing::debug!(target_uid, ?kind, "Signal target not connected, dropping");
            return;
        };
        if !target.send(kind.wrap(payload)) {
            tracing::debug!(target_uid, ?kind, "Signal target not writable, dropped");
        }
    }
}
