use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{HashMap, VecDeque};

use super::StatsEvent;
use crate::types::{Identity, SessionId, Uid};

/// Running aggregate of a numeric sample stream
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SampleSummary {
    pub count: u64,
    pub mean: f64,
    pub max: f64,
    #[serde(skip)]
    sum: f64,
}

impl SampleSummary {
    fn push(&mut self, value: f64) {
        if !value.is_finite() {
            return;
        }
        self.count += 1;
        self.sum += value;
        self.mean = self.sum / self.count as f64;
        if self.count == 1 || value > self.max {
            self.max = value;
        }
    }
}

#[derive(Debug, Clone)]
struct ParticipantRecord {
    identity: Identity,
    first_joined_at: DateTime<Utc>,
    joins: u32,
    /// Connected as far as this record knows; repeated joins while present are not counted
    present: bool,
    requests: u32,
    grants: u32,
    releases: u32,
    speak_pulses: u32,
    speaking_since: Option<DateTime<Utc>>,
    floor_ms: i64,
    rtt: SampleSummary,
    jitter: SampleSummary,
    packet_loss: SampleSummary,
}

impl ParticipantRecord {
    fn new(identity: Identity, at: DateTime<Utc>) -> Self {
        Self {
            identity,
            first_joined_at: at,
            joins: 0,
            present: false,
            requests: 0,
            grants: 0,
            releases: 0,
            speak_pulses: 0,
            speaking_since: None,
            floor_ms: 0,
            rtt: SampleSummary::default(),
            jitter: SampleSummary::default(),
            packet_loss: SampleSummary::default(),
        }
    }

    fn close_floor(&mut self, at: DateTime<Utc>) {
        if let Some(since) = self.speaking_since.take() {
            self.floor_ms += (at - since).num_milliseconds().max(0);
        }
    }
}

#[derive(Debug, Clone)]
struct SessionRecord {
    id: SessionId,
    host_uid: Uid,
    started_at: DateTime<Utc>,
    ended_at: Option<DateTime<Utc>>,
    /// Keyed by uid, in first-seen order via `order`
    participants: HashMap<Uid, ParticipantRecord>,
    order: Vec<Uid>,
    event_count: u64,
}

impl SessionRecord {
    fn new(id: SessionId, host_uid: Uid, at: DateTime<Utc>) -> Self {
        Self {
            id,
            host_uid,
            started_at: at,
            ended_at: None,
            participants: HashMap::new(),
            order: Vec::new(),
            event_count: 0,
        }
    }

    /// Participant lookup for events carrying only a uid
    fn participant(&mut self, uid: &str, at: DateTime<Utc>) -> &mut ParticipantRecord {
        if !self.participants.contains_key(uid) {
            self.order.push(uid.to_string());
        }
        self.participants
            .entry(uid.to_string())
            .or_insert_with(|| ParticipantRecord::new(Identity::placeholder(uid), at))
    }

    fn report(&self) -> SessionReport {
        let participants = self
            .order
            .iter()
            .filter_map(|uid| self.participants.get(uid))
            .map(|p| ParticipantReport {
                uid: p.identity.uid.clone(),
                display_name: p.identity.display_name.clone(),
                email: p.identity.email.clone(),
                first_joined_at: p.first_joined_at.to_rfc3339(),
                joins: p.joins,
                requests: p.requests,
                grants: p.grants,
                releases: p.releases,
                speak_pulses: p.speak_pulses,
                floor_seconds: p.floor_ms as f64 / 1000.0,
                rtt: p.rtt.clone(),
                jitter: p.jitter.clone(),
                packet_loss: p.packet_loss.clone(),
            })
            .collect();

        SessionReport {
            id: self.id.clone(),
            host_uid: self.host_uid.clone(),
            started_at: self.started_at.to_rfc3339(),
            ended_at: self.ended_at.map(|t| t.to_rfc3339()),
            event_count: self.event_count,
            participants,
        }
    }
}

/// Per-participant statistics
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ParticipantReport {
    pub uid: Uid,
    pub display_name: String,
    pub email: String,
    pub first_joined_at: String,
    pub joins: u32,
    pub requests: u32,
    pub grants: u32,
    pub releases: u32,
    pub speak_pulses: u32,
    pub floor_seconds: f64,
    pub rtt: SampleSummary,
    pub jitter: SampleSummary,
    pub packet_loss: SampleSummary,
}

/// Statistics for one session
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionReport {
    pub id: SessionId,
    pub host_uid: Uid,
    pub started_at: String,
    pub ended_at: Option<String>,
    pub event_count: u64,
    pub participants: Vec<ParticipantReport>,
}

/// In-memory aggregation of stats events
#[derive(Debug)]
pub struct StatsRecorder {
    current: Option<SessionRecord>,
    archive: VecDeque<SessionRecord>,
    history: usize,
}

impl StatsRecorder {
    pub fn new(history: usize) -> Self {
        Self {
            current: None,
            archive: VecDeque::new(),
            history,
        }
    }

    pub fn apply(&mut self, event: StatsEvent, at: DateTime<Utc>) {
        if let StatsEvent::SessionStarted {
            session_id,
            host_uid,
            resumed,
        } = event
        {
            self.start_session(session_id, host_uid, resumed, at);
            return;
        }

        let Some(session) = self.current.as_mut() else {
            tracing::trace!("No stats session open, dropping {:?}", event);
            return;
        };
        session.event_count += 1;

        match event {
            StatsEvent::SessionStarted { .. } => {}
            StatsEvent::SessionEnded { session_id } => {
                if session.id == session_id {
                    session.ended_at = Some(at);
                    for participant in session.participants.values_mut() {
                        participant.close_floor(at);
                    }
                }
            }
            StatsEvent::Joined { identity } => {
                let uid = identity.uid.clone();
                let participant = session.participant(&uid, at);
                participant.identity = identity;
                if !participant.present {
                    participant.joins += 1;
                    participant.present = true;
                }
            }
            StatsEvent::Left { uid } => {
                session.participant(&uid, at).present = false;
            }
            StatsEvent::FloorRequested { uid } => {
                session.participant(&uid, at).requests += 1;
            }
            StatsEvent::FloorGranted { uid } => {
                // A grant overrides whoever held the floor before
                for participant in session.participants.values_mut() {
                    participant.close_floor(at);
                }
                let participant = session.participant(&uid, at);
                participant.grants += 1;
                participant.speaking_since = Some(at);
            }
            StatsEvent::FloorReleased { uid } => {
                let participant = session.participant(&uid, at);
                participant.releases += 1;
                participant.close_floor(at);
            }
            StatsEvent::SpeakPulse { uid } => {
                session.participant(&uid, at).speak_pulses += 1;
            }
            StatsEvent::LatencySample { uid, rtt } => {
                session.participant(&uid, at).rtt.push(rtt);
            }
            StatsEvent::QualitySample {
                uid,
                rtt,
                jitter,
                packet_loss,
            } => {
                let participant = session.participant(&uid, at);
                if let Some(rtt) = rtt {
                    participant.rtt.push(rtt);
                }
                if let Some(jitter) = jitter {
                    participant.jitter.push(jitter);
                }
                if let Some(loss) = packet_loss {
                    participant.packet_loss.push(loss);
                }
            }
        }
    }

    fn start_session(
        &mut self,
        session_id: SessionId,
        host_uid: Uid,
        resumed: bool,
        at: DateTime<Utc>,
    ) {
        if let Some(current) = self.current.as_mut() {
            if resumed && current.id == session_id {
                tracing::info!(session_id = %current.id, "Resuming stats session");
                current.ended_at = None;
                return;
            }
        }

        if let Some(previous) = self.current.take() {
            self.archive.push_back(previous);
            while self.archive.len() > self.history {
                self.archive.pop_front();
            }
        }
        tracing::info!(session_id = %session_id, host_uid = %host_uid, "Starting stats session");
        self.current = Some(SessionRecord::new(session_id, host_uid, at));
    }

    pub fn current_report(&self) -> Option<SessionReport> {
        self.current.as_ref().map(SessionRecord::report)
    }

    pub fn report(&self, session_id: &str) -> Option<SessionReport> {
        self.current
            .iter()
            .chain(self.archive.iter())
            .find(|s| s.id == session_id)
            .map(SessionRecord::report)
    }
}
