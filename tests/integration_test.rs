use serde_json::json;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use talkfloor::coordinator::{
    close_code, Coordinator, CoordinatorConfig, CoordinatorHandle, CoordinatorSnapshot,
    ExitReason, Outbound, OutboxReceiver,
};
use talkfloor::protocol::{ClientMessage, ServerMessage, SignalPayload};
use talkfloor::stats::{StatsEvent, StatsSink};
use talkfloor::types::{ConnId, Identity};
use tokio::task::JoinHandle;

/// Stats sink that keeps every event for inspection
#[derive(Default)]
struct RecordingSink {
    events: Mutex<Vec<StatsEvent>>,
}

impl StatsSink for RecordingSink {
    fn record(&self, event: StatsEvent) {
        self.events.lock().unwrap().push(event);
    }
}

impl RecordingSink {
    fn events(&self) -> Vec<StatsEvent> {
        self.events.lock().unwrap().clone()
    }
}

struct Client {
    uid: String,
    conn: ConnId,
    rx: OutboxReceiver,
}

impl Client {
    /// Everything queued for this connection so far
    fn frames(&mut self) -> Vec<Outbound> {
        let mut frames = Vec::new();
        while let Some(frame) = self.rx.try_recv() {
            frames.push(frame);
        }
        frames
    }

    fn messages(&mut self) -> Vec<ServerMessage> {
        self.frames()
            .into_iter()
            .filter_map(|frame| match frame {
                Outbound::Message(msg) => Some(msg),
                Outbound::Close { .. } => None,
            })
            .collect()
    }
}

struct Harness {
    handle: CoordinatorHandle,
    task: JoinHandle<ExitReason>,
    stats: Arc<RecordingSink>,
}

fn identity(uid: &str) -> Identity {
    Identity {
        uid: uid.to_string(),
        display_name: format!("User {}", uid),
        email: format!("{}@example.org", uid),
        picture: None,
    }
}

fn signal(value: serde_json::Value) -> SignalPayload {
    serde_json::from_value(value).unwrap()
}

impl Harness {
    fn new() -> Self {
        Self::with_config(CoordinatorConfig::default())
    }

    fn with_config(config: CoordinatorConfig) -> Self {
        let stats = Arc::new(RecordingSink::default());
        let (handle, task) = Coordinator::spawn(config, stats.clone());
        Self {
            handle,
            task,
            stats,
        }
    }

    async fn try_join(&self, uid: &str, privileged: bool) -> (Option<ConnId>, OutboxReceiver) {
        let (outbox, rx) = self.handle.outbox();
        let conn = self.handle.connect(identity(uid), privileged, outbox).await;
        (conn, rx)
    }

    async fn join(&self, uid: &str, privileged: bool) -> Client {
        let (conn, rx) = self.try_join(uid, privileged).await;
        Client {
            uid: uid.to_string(),
            conn: conn.expect("connection should be admitted"),
            rx,
        }
    }

    /// Connect a privileged identity and register it as host
    async fn host(&self, uid: &str) -> Client {
        let mut host = self.join(uid, true).await;
        self.send(&host, ClientMessage::RegisterAsHost {}).await;
        host.frames();
        host
    }

    async fn send(&self, client: &Client, message: ClientMessage) {
        self.handle.inbound(client.conn, message).await;
        self.settle().await;
    }

    /// Snapshot round-trip; every earlier mailbox message has been handled
    async fn settle(&self) -> CoordinatorSnapshot {
        self.handle
            .snapshot()
            .await
            .expect("coordinator should be running")
    }
}

fn speaker_uid(msg: &ServerMessage) -> Option<Option<String>> {
    match msg {
        ServerMessage::SystemSpeakerUpdate { speaker } => {
            Some(speaker.as_ref().map(|s| s.uid.clone()))
        }
        _ => None,
    }
}

fn last_queue(messages: &[ServerMessage]) -> Option<Vec<String>> {
    messages.iter().rev().find_map(|msg| match msg {
        ServerMessage::SystemRequestQueue { queue } => {
            Some(queue.iter().map(|q| q.uid.clone()).collect())
        }
        _ => None,
    })
}

/// End-to-end walk through a typical floor session
#[tokio::test]
async fn test_full_floor_flow() {
    let harness = Harness::new();
    let mut host = harness.host("host").await;
    let mut alice = harness.join("alice", false).await;
    let mut bob = harness.join("bob", false).await;

    let welcome = alice.messages();
    match &welcome[0] {
        ServerMessage::SystemWelcome {
            uid,
            is_host,
            session_active,
            speaker,
            ..
        } => {
            assert_eq!(uid, "alice");
            assert!(!is_host);
            assert!(session_active);
            assert!(speaker.is_none());
        }
        other => panic!("Expected welcome, got {:?}", other),
    }
    bob.frames();

    let participants = host.messages();
    match participants.last() {
        Some(ServerMessage::SystemParticipantList { participants }) => {
            let uids: Vec<_> = participants.iter().map(|p| p.uid.as_str()).collect();
            assert_eq!(uids, vec!["alice", "bob"]);
        }
        other => panic!("Expected participant list, got {:?}", other),
    }

    // 1. Alice requests an idle floor and gets it immediately
    harness.send(&alice, ClientMessage::RequestToSpeak {}).await;
    let to_alice = alice.messages();
    assert_eq!(to_alice[0], ServerMessage::SystemSpeakGranted {});
    assert_eq!(speaker_uid(&to_alice[1]), Some(Some("alice".to_string())));
    assert!(bob
        .messages()
        .iter()
        .any(|m| speaker_uid(m) == Some(Some("alice".to_string()))));
    let to_host = host.messages();
    assert!(to_host.iter().any(|m| matches!(
        m,
        ServerMessage::SystemStudentRequest { uid, .. } if uid == "alice"
    )));

    // 2. Bob requests while Alice speaks and is queued
    harness.send(&bob, ClientMessage::RequestToSpeak {}).await;
    assert_eq!(
        bob.messages(),
        vec![ServerMessage::SystemRequestAcknowledged { position: 1 }]
    );
    let to_host = host.messages();
    assert_eq!(last_queue(&to_host), Some(vec!["bob".to_string()]));

    // 3. Alice releases; Bob stays queued
    harness.send(&alice, ClientMessage::ReleaseFloor {}).await;
    assert!(alice.messages().iter().any(|m| speaker_uid(m) == Some(None)));
    assert!(bob.messages().iter().any(|m| speaker_uid(m) == Some(None)));
    let snapshot = harness.settle().await;
    assert!(snapshot.speaker.is_none());
    assert_eq!(snapshot.queue.len(), 1);
    assert_eq!(snapshot.queue[0].uid, "bob");
    assert!(snapshot.cooldowns.contains_key("alice"));
    host.frames();

    // 4. Host bans Bob
    harness
        .send(
            &host,
            ClientMessage::AdminKickUser {
                uid: "bob".to_string(),
            },
        )
        .await;
    let to_bob = bob.frames();
    assert!(matches!(
        to_bob.first(),
        Some(Outbound::Message(ServerMessage::SystemKicked { .. }))
    ));
    assert!(matches!(
        to_bob.last(),
        Some(Outbound::Close { code, .. }) if *code == close_code::KICKED
    ));

    let snapshot = harness.settle().await;
    assert!(snapshot.queue.is_empty());
    assert!(snapshot.participants.iter().all(|p| p.uid != "bob"));
    assert_eq!(snapshot.banned.len(), 1);
    assert_eq!(snapshot.banned[0].email, "bob@example.org");

    let to_host = host.messages();
    assert_eq!(last_queue(&to_host), Some(vec![]));
    assert!(to_host.iter().any(|m| matches!(
        m,
        ServerMessage::SystemBannedList { banned_list } if banned_list.len() == 1
    )));
}

#[tokio::test]
async fn test_second_host_rejected() {
    let harness = Harness::new();
    let _host = harness.host("host").await;

    let (conn, mut rx) = harness.try_join("other-host", true).await;
    assert!(conn.is_none());
    assert!(matches!(
        rx.try_recv(),
        Some(Outbound::Message(ServerMessage::SystemError { message }))
            if message.contains("already present")
    ));
    assert!(matches!(
        rx.try_recv(),
        Some(Outbound::Close { code, .. }) if code == close_code::HOST_PRESENT
    ));

    let snapshot = harness.settle().await;
    assert_eq!(snapshot.host.map(|h| h.uid), Some("host".to_string()));
}

#[tokio::test]
async fn test_banned_identity_cannot_reconnect() {
    let harness = Harness::new();
    let host = harness.host("host").await;
    let _mallory = harness.join("mallory", false).await;

    harness
        .send(
            &host,
            ClientMessage::AdminKickUser {
                uid: "mallory".to_string(),
            },
        )
        .await;

    let (conn, mut rx) = harness.try_join("mallory", false).await;
    assert!(conn.is_none());
    assert!(matches!(
        rx.try_recv(),
        Some(Outbound::Message(ServerMessage::SystemKicked { .. }))
    ));

    // Unban lets them back in
    harness
        .send(
            &host,
            ClientMessage::AdminUnkickUser {
                uid: "mallory".to_string(),
            },
        )
        .await;
    let (conn, _rx) = harness.try_join("mallory", false).await;
    assert!(conn.is_some());
}

#[tokio::test]
async fn test_kick_of_offline_uid_still_bans() {
    let harness = Harness::new();
    let host = harness.host("host").await;

    harness
        .send(
            &host,
            ClientMessage::AdminKickUser {
                uid: "ghost".to_string(),
            },
        )
        .await;

    let snapshot = harness.settle().await;
    assert_eq!(snapshot.banned.len(), 1);
    assert_eq!(snapshot.banned[0].uid, "ghost");
    let (conn, _rx) = harness.try_join("ghost", false).await;
    assert!(conn.is_none());
}

#[tokio::test]
async fn test_request_while_inactive_is_an_error() {
    let harness = Harness::new();
    let mut alice = harness.join("alice", false).await;
    alice.frames();

    harness.send(&alice, ClientMessage::RequestToSpeak {}).await;
    assert!(matches!(
        alice.messages().as_slice(),
        [ServerMessage::SystemError { .. }]
    ));

    let snapshot = harness.settle().await;
    assert!(snapshot.speaker.is_none());
    assert!(snapshot.queue.is_empty());
}

#[tokio::test]
async fn test_toggle_session_gates_requests() {
    let harness = Harness::new();
    let host = harness.host("host").await;
    let mut alice = harness.join("alice", false).await;
    alice.frames();

    harness
        .send(&host, ClientMessage::AdminToggleSession { active: false })
        .await;
    assert_eq!(
        alice.messages(),
        vec![ServerMessage::SystemSessionStatus { active: false }]
    );

    harness.send(&alice, ClientMessage::RequestToSpeak {}).await;
    assert!(matches!(
        alice.messages().as_slice(),
        [ServerMessage::SystemError { .. }]
    ));

    harness
        .send(&host, ClientMessage::AdminToggleSession { active: true })
        .await;
    harness.send(&alice, ClientMessage::RequestToSpeak {}).await;
    assert!(alice
        .messages()
        .contains(&ServerMessage::SystemSpeakGranted {}));
}

#[tokio::test]
async fn test_repeated_requests_are_idempotent() {
    let harness = Harness::new();
    let _host = harness.host("host").await;
    let mut alice = harness.join("alice", false).await;
    let mut bob = harness.join("bob", false).await;

    harness.send(&alice, ClientMessage::RequestToSpeak {}).await;
    harness.send(&alice, ClientMessage::RequestToSpeak {}).await;
    alice.frames();

    harness.send(&bob, ClientMessage::RequestToSpeak {}).await;
    harness.send(&bob, ClientMessage::RequestToSpeak {}).await;
    let acks: Vec<_> = bob
        .messages()
        .into_iter()
        .filter(|m| matches!(m, ServerMessage::SystemRequestAcknowledged { .. }))
        .collect();
    assert_eq!(
        acks,
        vec![
            ServerMessage::SystemRequestAcknowledged { position: 1 },
            ServerMessage::SystemRequestAcknowledged { position: 1 },
        ]
    );

    let snapshot = harness.settle().await;
    assert_eq!(snapshot.speaker.map(|s| s.uid), Some("alice".to_string()));
    assert_eq!(snapshot.queue.len(), 1);

    // Cancel twice, release from a non-speaker: no effect beyond the first cancel
    harness.send(&bob, ClientMessage::CancelRequest {}).await;
    harness.send(&bob, ClientMessage::CancelRequest {}).await;
    harness.send(&bob, ClientMessage::ReleaseFloor {}).await;
    assert_eq!(bob.messages(), vec![ServerMessage::SystemRequestCancelled {}]);

    let snapshot = harness.settle().await;
    assert_eq!(snapshot.speaker.map(|s| s.uid), Some("alice".to_string()));
    assert!(snapshot.queue.is_empty());
}

#[tokio::test]
async fn test_finished_speaking_releases_floor() {
    let harness = Harness::new();
    let _host = harness.host("host").await;
    let alice = harness.join("alice", false).await;

    harness.send(&alice, ClientMessage::RequestToSpeak {}).await;
    harness.send(&alice, ClientMessage::FinishedSpeaking {}).await;

    let snapshot = harness.settle().await;
    assert!(snapshot.speaker.is_none());
    assert!(snapshot.cooldowns.contains_key("alice"));
}

#[tokio::test]
async fn test_host_cannot_take_the_floor() {
    let harness = Harness::new();
    let mut host = harness.host("host").await;

    harness.send(&host, ClientMessage::RequestToSpeak {}).await;
    assert!(host.messages().is_empty());
    assert!(harness.settle().await.speaker.is_none());
}

#[tokio::test]
async fn test_admin_commands_require_host() {
    let harness = Harness::new();
    let _host = harness.host("host").await;
    let mut alice = harness.join("alice", false).await;
    let _bob = harness.join("bob", false).await;
    alice.frames();

    let commands = vec![
        ClientMessage::RegisterAsHost {},
        ClientMessage::AdminKickUser {
            uid: "bob".to_string(),
        },
        ClientMessage::AdminUnkickUser {
            uid: "bob".to_string(),
        },
        ClientMessage::AdminRemoveRequest {
            uid: "bob".to_string(),
        },
        ClientMessage::AdminToggleSession { active: false },
        ClientMessage::AdminReleaseFloor {},
        ClientMessage::AdminGrantFloor {
            uid: "alice".to_string(),
        },
    ];
    let count = commands.len();
    for command in commands {
        harness.send(&alice, command).await;
    }

    let errors = alice.messages();
    assert_eq!(errors.len(), count);
    for error in &errors {
        match error {
            ServerMessage::SystemError { message } => {
                assert!(message.starts_with("Only the host can"), "{}", message)
            }
            other => panic!("Expected error, got {:?}", other),
        }
    }

    let snapshot = harness.settle().await;
    assert!(snapshot.session.active);
    assert!(snapshot.banned.is_empty());
    assert!(snapshot.speaker.is_none());
    assert_eq!(snapshot.participants.len(), 2);
}

#[tokio::test]
async fn test_host_floor_administration() {
    let harness = Harness::new();
    let mut host = harness.host("host").await;
    let mut alice = harness.join("alice", false).await;
    let mut bob = harness.join("bob", false).await;
    let mut carol = harness.join("carol", false).await;

    harness.send(&alice, ClientMessage::RequestToSpeak {}).await;
    harness.send(&bob, ClientMessage::RequestToSpeak {}).await;
    harness.send(&carol, ClientMessage::RequestToSpeak {}).await;
    alice.frames();
    bob.frames();
    carol.frames();
    host.frames();

    // Grant to Carol out of queue order, overriding Alice
    harness
        .send(
            &host,
            ClientMessage::AdminGrantFloor {
                uid: "carol".to_string(),
            },
        )
        .await;
    let to_carol = carol.messages();
    assert_eq!(to_carol[0], ServerMessage::SystemSpeakGranted {});
    assert!(alice
        .messages()
        .iter()
        .any(|m| speaker_uid(m) == Some(Some("carol".to_string()))));
    assert_eq!(last_queue(&host.messages()), Some(vec!["bob".to_string()]));
    bob.frames();

    let snapshot = harness.settle().await;
    assert!(!snapshot.cooldowns.contains_key("alice"));

    // Remove Bob's request
    harness
        .send(
            &host,
            ClientMessage::AdminRemoveRequest {
                uid: "bob".to_string(),
            },
        )
        .await;
    assert_eq!(bob.messages(), vec![ServerMessage::SystemRequestRemoved {}]);
    assert_eq!(last_queue(&host.messages()), Some(vec![]));

    // Force release
    harness.send(&host, ClientMessage::AdminReleaseFloor {}).await;
    assert!(carol.messages().iter().any(|m| speaker_uid(m) == Some(None)));
    let snapshot = harness.settle().await;
    assert!(snapshot.speaker.is_none());
    assert!(snapshot.cooldowns.contains_key("carol"));

    // Unknown grant targets are ignored
    harness
        .send(
            &host,
            ClientMessage::AdminGrantFloor {
                uid: "nobody".to_string(),
            },
        )
        .await;
    assert!(harness.settle().await.speaker.is_none());
}

#[tokio::test]
async fn test_speaker_disconnect_frees_floor() {
    let harness = Harness::new();
    let mut host = harness.host("host").await;
    let alice = harness.join("alice", false).await;
    let bob = harness.join("bob", false).await;

    harness.send(&alice, ClientMessage::RequestToSpeak {}).await;
    harness.send(&bob, ClientMessage::RequestToSpeak {}).await;
    host.frames();

    harness.handle.disconnect(alice.conn).await;
    harness.handle.disconnect(bob.conn).await;
    // Stale key after removal is a no-op
    harness.handle.disconnect(alice.conn).await;

    let snapshot = harness.settle().await;
    assert!(snapshot.speaker.is_none());
    assert!(snapshot.queue.is_empty());
    assert!(snapshot.participants.is_empty());

    let to_host = host.messages();
    assert!(to_host.iter().any(|m| speaker_uid(m) == Some(None)));
    assert_eq!(last_queue(&to_host), Some(vec![]));
}

#[tokio::test]
async fn test_reconnect_replaces_previous_connection() {
    let harness = Harness::new();
    let _host = harness.host("host").await;
    let mut first = harness.join("alice", false).await;
    harness.send(&first, ClientMessage::RequestToSpeak {}).await;
    first.frames();

    let mut second = harness.join("alice", false).await;
    assert_ne!(first.conn, second.conn);
    assert!(matches!(
        first.frames().last(),
        Some(Outbound::Close { code, .. }) if *code == close_code::REPLACED
    ));

    let snapshot = harness.settle().await;
    assert_eq!(snapshot.participants.len(), 1);
    // The replaced connection held the floor, so it was released
    assert!(snapshot.speaker.is_none());

    // Old key no longer routes anywhere
    harness.send(&first, ClientMessage::RequestToSpeak {}).await;
    assert!(harness.settle().await.speaker.is_none());

    second.frames();
    harness.send(&second, ClientMessage::RequestToSpeak {}).await;
    assert!(second
        .messages()
        .contains(&ServerMessage::SystemSpeakGranted {}));
    assert_eq!(second.uid, "alice");
}

#[tokio::test]
async fn test_signal_relay_rules() {
    let harness = Harness::new();
    let mut host = harness.host("host").await;
    let mut alice = harness.join("alice", false).await;
    let mut bob = harness.join("bob", false).await;
    alice.frames();
    bob.frames();
    host.frames();

    // Participant offer goes to the host tagged with the sender
    harness
        .send(
            &alice,
            ClientMessage::WebrtcOffer(signal(json!({"sdp": "offer-a"}))),
        )
        .await;
    assert_eq!(
        host.messages(),
        vec![ServerMessage::WebrtcOffer(signal(
            json!({"sdp": "offer-a", "fromUid": "alice"})
        ))]
    );

    // Host answer goes only to its target
    harness
        .send(
            &host,
            ClientMessage::WebrtcAnswer(signal(json!({"sdp": "answer", "targetUid": "alice"}))),
        )
        .await;
    assert_eq!(
        alice.messages(),
        vec![ServerMessage::WebrtcAnswer(signal(
            json!({"sdp": "answer", "targetUid": "alice"})
        ))]
    );
    assert!(bob.messages().is_empty());

    // Untargeted candidate from a participant reaches the host
    harness
        .send(
            &bob,
            ClientMessage::WebrtcIceCandidate(signal(json!({"candidate": "c1"}))),
        )
        .await;
    assert!(matches!(
        host.messages().as_slice(),
        [ServerMessage::WebrtcIceCandidate(payload)]
            if payload.0.get("fromUid") == Some(&json!("bob"))
    ));

    // A participant cannot address another participant
    harness
        .send(
            &bob,
            ClientMessage::WebrtcIceCandidate(signal(
                json!({"candidate": "c2", "targetUid": "alice"}),
            )),
        )
        .await;
    harness
        .send(
            &bob,
            ClientMessage::WebrtcAnswer(signal(json!({"sdp": "x", "targetUid": "alice"}))),
        )
        .await;
    assert!(alice.messages().is_empty());
    assert!(host.messages().is_empty());

    // Host signals without a reachable target are dropped
    harness
        .send(
            &host,
            ClientMessage::WebrtcOffer(signal(json!({"sdp": "host-offer"}))),
        )
        .await;
    harness
        .send(
            &host,
            ClientMessage::WebrtcIceCandidate(signal(
                json!({"candidate": "c3", "targetUid": "gone"}),
            )),
        )
        .await;
    assert!(alice.messages().is_empty());
    assert!(bob.messages().is_empty());
}

#[tokio::test]
async fn test_signal_without_host_is_dropped() {
    let harness = Harness::new();
    let mut alice = harness.join("alice", false).await;
    alice.frames();

    harness
        .send(
            &alice,
            ClientMessage::WebrtcOffer(signal(json!({"sdp": "offer"}))),
        )
        .await;
    assert!(alice.messages().is_empty());
}

#[tokio::test]
async fn test_ping_and_samples() {
    let harness = Harness::new();
    let _host = harness.host("host").await;
    let mut alice = harness.join("alice", false).await;
    alice.frames();

    harness.send(&alice, ClientMessage::Ping {}).await;
    assert_eq!(alice.messages(), vec![ServerMessage::Pong {}]);

    harness
        .send(&alice, ClientMessage::LatencyUpdate { rtt: 42.0 })
        .await;
    harness
        .send(
            &alice,
            ClientMessage::WebrtcStats {
                rtt: Some(40.0),
                jitter: Some(2.5),
                packet_loss: None,
            },
        )
        .await;

    let events = harness.stats.events();
    assert!(events.contains(&StatsEvent::LatencySample {
        uid: "alice".to_string(),
        rtt: 42.0
    }));
    assert!(events.contains(&StatsEvent::QualitySample {
        uid: "alice".to_string(),
        rtt: Some(40.0),
        jitter: Some(2.5),
        packet_loss: None,
    }));
}

#[tokio::test]
async fn test_stats_event_sequence() {
    let harness = Harness::new();
    let alice = harness.join("alice", false).await;
    let _host = harness.host("host").await;

    harness.send(&alice, ClientMessage::RequestToSpeak {}).await;
    harness.send(&alice, ClientMessage::SpeakingStarted {}).await;
    harness.send(&alice, ClientMessage::ReleaseFloor {}).await;

    let events = harness.stats.events();
    let session_id = harness.settle().await.session.id;

    let started = events
        .iter()
        .position(|e| {
            matches!(
                e,
                StatsEvent::SessionStarted { host_uid, resumed: false, .. } if host_uid == "host"
            )
        })
        .expect("session start recorded");
    let alice_id = identity("alice");
    // Joined before the host registered, so the join is backfilled after the start
    let backfilled = events
        .iter()
        .rposition(|e| matches!(e, StatsEvent::Joined { identity } if *identity == alice_id))
        .expect("join recorded");
    assert!(backfilled > started);

    let tail: Vec<_> = events[backfilled + 1..].to_vec();
    let uid = "alice".to_string();
    assert_eq!(
        tail,
        vec![
            StatsEvent::FloorRequested { uid: uid.clone() },
            StatsEvent::FloorGranted { uid: uid.clone() },
            StatsEvent::SpeakPulse { uid: uid.clone() },
            StatsEvent::FloorReleased { uid },
        ]
    );
    assert!(matches!(
        &events[started],
        StatsEvent::SessionStarted { session_id: id, .. } if *id == session_id
    ));
}

#[tokio::test(start_paused = true)]
async fn test_host_absence_terminates_after_grace() {
    let harness = Harness::with_config(CoordinatorConfig {
        host_grace: Duration::from_secs(10),
        ..CoordinatorConfig::default()
    });
    let host = harness.host("host").await;
    let mut alice = harness.join("alice", false).await;
    alice.frames();

    harness.handle.disconnect(host.conn).await;
    let snapshot = harness.settle().await;
    assert!(!snapshot.session.active);
    assert!(snapshot.session.shutdown_pending);
    assert_eq!(
        alice.messages(),
        vec![ServerMessage::SystemSessionStatus { active: false }]
    );
    assert!(harness
        .stats
        .events()
        .iter()
        .any(|e| matches!(e, StatsEvent::SessionEnded { .. })));

    let exit = tokio::time::timeout(Duration::from_secs(60), harness.task)
        .await
        .expect("coordinator should stop within the grace period")
        .unwrap();
    assert_eq!(exit, ExitReason::HostAbsent);
}

#[tokio::test(start_paused = true)]
async fn test_returning_host_cancels_shutdown_and_resumes() {
    let harness = Harness::with_config(CoordinatorConfig {
        host_grace: Duration::from_secs(10),
        ..CoordinatorConfig::default()
    });
    let host = harness.host("host").await;
    let alice = harness.join("alice", false).await;
    harness.send(&alice, ClientMessage::RequestToSpeak {}).await;
    harness.send(&alice, ClientMessage::ReleaseFloor {}).await;
    let session_id = harness.settle().await.session.id;

    harness.handle.disconnect(host.conn).await;
    tokio::time::sleep(Duration::from_secs(5)).await;

    let mut host = harness.host("host").await;
    let snapshot = harness.settle().await;
    assert!(snapshot.session.active);
    assert!(!snapshot.session.shutdown_pending);
    assert_eq!(snapshot.session.id, session_id);
    // Same session, so cooldowns survive
    assert!(snapshot.cooldowns.contains_key("alice"));

    tokio::time::sleep(Duration::from_secs(30)).await;
    assert!(!harness.task.is_finished());
    harness.send(&host, ClientMessage::Ping {}).await;
    assert_eq!(host.messages(), vec![ServerMessage::Pong {}]);

    assert!(harness.stats.events().iter().any(|e| matches!(
        e,
        StatsEvent::SessionStarted { resumed: true, session_id: id, .. } if *id == session_id
    )));
}

#[tokio::test(start_paused = true)]
async fn test_connected_but_unregistered_host_does_not_cancel() {
    let harness = Harness::with_config(CoordinatorConfig {
        host_grace: Duration::from_secs(10),
        ..CoordinatorConfig::default()
    });
    let host = harness.host("host").await;
    harness.handle.disconnect(host.conn).await;

    // Connects again but never registers
    let _host = harness.join("host", true).await;
    assert!(harness.settle().await.session.shutdown_pending);

    let exit = tokio::time::timeout(Duration::from_secs(60), harness.task)
        .await
        .expect("coordinator should stop")
        .unwrap();
    assert_eq!(exit, ExitReason::HostAbsent);
}

#[tokio::test]
async fn test_returning_host_receives_queue_on_admission() {
    let harness = Harness::new();
    let host = harness.host("host").await;
    let alice = harness.join("alice", false).await;
    let bob = harness.join("bob", false).await;
    harness.send(&alice, ClientMessage::RequestToSpeak {}).await;
    harness.send(&bob, ClientMessage::RequestToSpeak {}).await;

    harness.handle.disconnect(host.conn).await;
    harness.settle().await;

    // Reconnect with the same uid, before any register-as-host
    let mut host = harness.join("host", true).await;
    let to_host = host.messages();
    assert!(matches!(
        to_host.first(),
        Some(ServerMessage::SystemWelcome { is_host: true, .. })
    ));
    assert!(matches!(
        to_host.last(),
        Some(ServerMessage::SystemRequestQueue { .. })
    ));
    assert_eq!(last_queue(&to_host), Some(vec!["bob".to_string()]));
    assert!(!harness.settle().await.session.active);
}

#[tokio::test]
async fn test_new_privileged_identity_gets_no_queue_on_admission() {
    let harness = Harness::new();
    let alice = harness.join("alice", false).await;
    harness.send(&alice, ClientMessage::RequestToSpeak {}).await;

    let mut host = harness.join("host", true).await;
    assert_eq!(last_queue(&host.messages()), None);
}

#[tokio::test]
async fn test_remove_request_after_reconnect_is_a_no_op() {
    let harness = Harness::new();
    let mut host = harness.host("host").await;
    let alice = harness.join("alice", false).await;
    let bob = harness.join("bob", false).await;
    harness.send(&alice, ClientMessage::RequestToSpeak {}).await;
    harness.send(&bob, ClientMessage::RequestToSpeak {}).await;
    assert_eq!(harness.settle().await.queue.len(), 1);

    // Reconnecting drops the old connection and its queue entry
    let mut bob = harness.join("bob", false).await;
    assert!(harness.settle().await.queue.is_empty());
    bob.frames();
    host.frames();

    harness
        .send(
            &host,
            ClientMessage::AdminRemoveRequest {
                uid: "bob".to_string(),
            },
        )
        .await;
    assert!(bob.messages().is_empty());
    assert!(host.messages().is_empty());

    let snapshot = harness.settle().await;
    assert!(snapshot.queue.is_empty());
    assert_eq!(snapshot.speaker.map(|s| s.uid), Some("alice".to_string()));
    assert_eq!(snapshot.participants.len(), 2);
}

#[tokio::test]
async fn test_resumed_session_does_not_backfill_joins() {
    let harness = Harness::new();
    let host = harness.host("host").await;
    let _alice = harness.join("alice", false).await;

    // Registering again resumes the open session
    harness.send(&host, ClientMessage::RegisterAsHost {}).await;

    // Host drops and returns within the resume window
    harness.handle.disconnect(host.conn).await;
    let _host = harness.host("host").await;

    let events = harness.stats.events();
    let joins = events
        .iter()
        .filter(|e| matches!(e, StatsEvent::Joined { identity } if identity.uid == "alice"))
        .count();
    assert_eq!(joins, 1);
    let resumes = events
        .iter()
        .filter(|e| matches!(e, StatsEvent::SessionStarted { resumed: true, .. }))
        .count();
    assert_eq!(resumes, 2);
}

#[tokio::test]
async fn test_departures_are_recorded() {
    let harness = Harness::new();
    let _host = harness.host("host").await;
    let alice = harness.join("alice", false).await;

    harness.handle.disconnect(alice.conn).await;
    harness.settle().await;

    assert_eq!(
        harness.stats.events().last(),
        Some(&StatsEvent::Left {
            uid: "alice".to_string()
        })
    );
}
