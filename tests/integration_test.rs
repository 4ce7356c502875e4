use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use typerace::auth::{AuthConfig, Identity, SignedTokenResolver};
use typerace::broadcast::Frame;
use typerace::config::RaceConfig;
use typerace::protocol::{ClientMessage, ServerMessage};
use typerace::state::AppState;
use typerace::store::MemoryStore;
use typerace::types::{RaceInfo, RaceStateSnapshot, RaceStatus, Role, RosterEntry};
use typerace::ws::handlers::Session;

const CHALLENGES: usize = 3;

fn race(racers: &[&str]) -> RaceInfo {
    RaceInfo {
        id: "sprint".to_string(),
        category: "rust".to_string(),
        challenge_ids: (0..CHALLENGES).map(|i| format!("ch-{}", i)).collect(),
        max_players: 8,
        created_at: Utc::now(),
        host_id: Some("host".to_string()),
        roster: racers
            .iter()
            .map(|id| RosterEntry {
                user_id: id.to_string(),
                display_name: id.to_uppercase(),
            })
            .collect(),
        time_limit_seconds: None,
    }
}

fn setup(racers: &[&str]) -> (Arc<AppState>, Arc<MemoryStore>) {
    let store = Arc::new(MemoryStore::with_races([race(racers)]));
    let state = Arc::new(AppState::new(
        RaceConfig::default(),
        store.clone(),
        Arc::new(SignedTokenResolver::new(AuthConfig { secret: None })),
    ));
    (state, store)
}

fn identity(user: &str, admin: bool) -> Identity {
    Identity {
        user_id: user.to_string(),
        display_name: user.to_uppercase(),
        admin,
    }
}

/// A joined socket: its session and the frames the room pushes to it
struct Client {
    session: Session,
    rx: mpsc::Receiver<Frame>,
}

impl Client {
    async fn join(state: &Arc<AppState>, user: &str, role: Role) -> Self {
        Self::join_as(state, identity(user, false), role).await
    }

    async fn join_as(state: &Arc<AppState>, identity: Identity, role: Role) -> Self {
        let mut session = Session::new(identity, state.clone());
        let reply = session
            .handle_message(ClientMessage::Join {
                race_id: "sprint".to_string(),
                role,
            })
            .await;
        assert!(reply.is_none(), "join failed: {:?}", reply);
        let rx = session.take_outbound().expect("joined session has an outbound queue");
        Self { session, rx }
    }

    async fn send(&mut self, msg: ClientMessage) -> Option<ServerMessage> {
        self.session.handle_message(msg).await
    }

    async fn progress(&mut self, challenge_index: usize, wpm: f64) -> Option<ServerMessage> {
        self.send(ClientMessage::Progress {
            challenge_index,
            wpm,
        })
        .await
    }

    async fn finish(&mut self, wpm: f64) -> Option<ServerMessage> {
        self.progress(CHALLENGES - 1, wpm).await;
        self.send(ClientMessage::Finish {
            wpm,
            accuracy: 96.0,
        })
        .await
    }

    /// Most recent snapshot, draining everything queued so far
    fn latest(&mut self) -> RaceStateSnapshot {
        let mut last = None;
        while let Ok(frame) = self.rx.try_recv() {
            match serde_json::from_str::<ServerMessage>(frame.as_str()) {
                Ok(ServerMessage::RaceState(s)) => last = Some(s),
                other => panic!("unexpected frame {:?}", other),
            }
        }
        last.expect("no snapshot queued")
    }
}

async fn go_live(host: &mut Client) {
    let reply = host
        .send(ClientMessage::StartCountdown {
            duration_seconds: 3,
        })
        .await;
    assert!(reply.is_none(), "start failed: {:?}", reply);
    tokio::time::sleep(Duration::from_millis(3100)).await;
}

/// End-to-end integration test for a complete race
#[tokio::test(start_paused = true)]
async fn test_full_race_flow() {
    let (state, store) = setup(&["alice", "bob", "carol"]);

    let mut alice = Client::join(&state, "alice", Role::Racer).await;
    let mut bob = Client::join(&state, "bob", Role::Racer).await;
    let mut carol = Client::join(&state, "carol", Role::Racer).await;
    let mut host = Client::join(&state, "host", Role::Racer).await;
    assert_eq!(host.session.role(), Some(Role::Spectator));

    let lobby = host.latest();
    assert_eq!(lobby.status, RaceStatus::Waiting);
    assert_eq!(lobby.participants.len(), 3);
    assert!(lobby.participants.iter().all(|p| p.connected));
    assert_eq!(lobby.spectator_count, 1);

    // Countdown carries the frozen start instant
    host.send(ClientMessage::StartCountdown {
        duration_seconds: 3,
    })
    .await;
    let counting = alice.latest();
    assert_eq!(counting.status, RaceStatus::Countdown);
    let start_time = counting.start_time.expect("countdown has a start time");
    assert!(start_time >= counting.server_now + 2000);
    assert_eq!(counting.countdown_value, Some(3));

    // No typing during the countdown
    match alice.progress(1, 50.0).await {
        Some(ServerMessage::RaceError { code, .. }) => assert_eq!(code, "INVALID_TRANSITION"),
        other => panic!("expected INVALID_TRANSITION, got {:?}", other),
    }

    tokio::time::sleep(Duration::from_millis(3100)).await;
    assert_eq!(alice.latest().status, RaceStatus::InProgress);

    // Progress streams to everyone
    assert!(alice.progress(1, 60.0).await.is_none());
    assert!(alice.progress(2, 62.0).await.is_none());
    let snap = host.latest();
    let a = snap.participants.iter().find(|p| p.user_id == "alice").unwrap();
    assert_eq!(a.current_challenge_index, 2);

    // A late, out-of-order update is dropped silently
    assert!(alice.progress(1, 10.0).await.is_none());
    let snap = room_snapshot(&state).await;
    let a = snap.participants.iter().find(|p| p.user_id == "alice").unwrap();
    assert_eq!(a.current_challenge_index, 2);
    assert_eq!(a.current_wpm, 62.0);

    // Arrival order decides rank, not speed
    assert!(bob.finish(45.0).await.is_none());
    assert!(alice.finish(130.0).await.is_none());

    let snap = carol.latest();
    let order: Vec<_> = snap.participants.iter().map(|p| p.user_id.as_str()).collect();
    assert_eq!(order, vec!["bob", "alice", "carol"]);
    assert_eq!(snap.participants[0].rank, Some(1));
    assert_eq!(snap.participants[1].rank, Some(2));
    assert_eq!(snap.participants[2].rank, None);

    // Duplicate finish is ignored
    assert!(bob.finish(200.0).await.is_none());
    assert_eq!(room_snapshot(&state).await.participants[0].final_wpm, Some(45.0));

    assert!(carol.finish(70.0).await.is_none());
    let done = host.latest();
    assert_eq!(done.status, RaceStatus::Finished);
    assert!(done.participants.iter().all(|p| p.rank.is_some()));

    // Nothing moves after the race is over
    assert!(carol.progress(2, 80.0).await.is_none());

    let result = wait_for_result(&store).await;
    assert_eq!(result.race_id, "sprint");
    let ranked: Vec<_> = result
        .standings
        .iter()
        .map(|p| (p.user_id.as_str(), p.rank))
        .collect();
    assert_eq!(
        ranked,
        vec![("bob", Some(1)), ("alice", Some(2)), ("carol", Some(3))]
    );
}

async fn room_snapshot(state: &Arc<AppState>) -> RaceStateSnapshot {
    state
        .registry
        .get("sprint")
        .await
        .expect("room is running")
        .snapshot()
        .await
        .unwrap()
}

async fn wait_for_result(store: &MemoryStore) -> typerace::types::RaceResult {
    for _ in 0..50 {
        if let Some(result) = store.results().await.pop() {
            return result;
        }
        tokio::task::yield_now().await;
    }
    panic!("race result was never saved");
}

#[tokio::test(start_paused = true)]
async fn test_spectator_joining_mid_race_sees_everything() {
    let (state, _) = setup(&["alice", "bob"]);
    let mut alice = Client::join(&state, "alice", Role::Racer).await;
    let mut host = Client::join(&state, "host", Role::Spectator).await;
    go_live(&mut host).await;

    alice.progress(1, 70.0).await;

    let mut late = Client::join(&state, "viewer", Role::Spectator).await;
    let snap = late.latest();
    assert_eq!(snap.status, RaceStatus::InProgress);
    assert_eq!(snap.spectator_count, 2);
    assert_eq!(snap.participants.len(), 2);
    let a = snap.participants.iter().find(|p| p.user_id == "alice").unwrap();
    assert_eq!(a.current_challenge_index, 1);
    let b = snap.participants.iter().find(|p| p.user_id == "bob").unwrap();
    assert!(!b.connected);
}

#[tokio::test(start_paused = true)]
async fn test_reconnect_resumes_without_duplicate() {
    let (state, _) = setup(&["alice", "bob"]);
    let mut alice = Client::join(&state, "alice", Role::Racer).await;
    let _bob = Client::join(&state, "bob", Role::Racer).await;
    let mut host = Client::join(&state, "host", Role::Spectator).await;
    go_live(&mut host).await;

    alice.progress(2, 88.0).await;
    drop(alice);

    let snap = room_snapshot(&state).await;
    let a = snap.participants.iter().find(|p| p.user_id == "alice").unwrap();
    assert!(!a.connected);
    assert_eq!(a.current_challenge_index, 2);
    assert_eq!(snap.status, RaceStatus::InProgress);

    let mut alice = Client::join(&state, "alice", Role::Racer).await;
    let snap = alice.latest();
    assert_eq!(snap.participants.len(), 2);
    let a = snap.participants.iter().find(|p| p.user_id == "alice").unwrap();
    assert!(a.connected);
    assert_eq!(a.current_challenge_index, 2);

    assert!(alice.finish(90.0).await.is_none());
    assert_eq!(alice.latest().participants[0].rank, Some(1));
}

#[tokio::test(start_paused = true)]
async fn test_admin_force_end_leaves_unfinished_unranked() {
    let (state, store) = setup(&["alice", "bob"]);
    let mut alice = Client::join(&state, "alice", Role::Racer).await;
    let mut bob = Client::join(&state, "bob", Role::Racer).await;
    let mut host = Client::join(&state, "host", Role::Spectator).await;
    go_live(&mut host).await;

    alice.finish(99.0).await;
    bob.progress(1, 40.0).await;

    // Racers cannot end the race
    match bob.send(ClientMessage::ForceEnd).await {
        Some(ServerMessage::RaceError { code, .. }) => assert_eq!(code, "FORBIDDEN"),
        other => panic!("expected FORBIDDEN, got {:?}", other),
    }

    let mut admin = Client::join_as(&state, identity("ops", true), Role::Spectator).await;
    assert!(admin.send(ClientMessage::ForceEnd).await.is_none());

    let snap = admin.latest();
    assert_eq!(snap.status, RaceStatus::Finished);
    let b = snap.participants.iter().find(|p| p.user_id == "bob").unwrap();
    assert_eq!(b.rank, None);
    assert_eq!(b.finished_at, None);

    let result = wait_for_result(&store).await;
    assert_eq!(result.standings.len(), 2);
    assert_eq!(result.standings[0].user_id, "alice");
}

#[tokio::test(start_paused = true)]
async fn test_finished_room_is_reaped_after_everyone_leaves() {
    let (state, _) = setup(&["alice"]);
    let mut alice = Client::join(&state, "alice", Role::Racer).await;
    let mut host = Client::join(&state, "host", Role::Spectator).await;
    go_live(&mut host).await;
    alice.finish(75.0).await;

    assert_eq!(state.registry.reap().await, 0);
    drop(alice);
    drop(host);
    assert_eq!(state.registry.reap().await, 1);
    assert!(state.registry.get("sprint").await.is_none());
}

#[tokio::test(start_paused = true)]
async fn test_reaped_finished_race_stays_final() {
    let (state, store) = setup(&["alice"]);
    let mut alice = Client::join(&state, "alice", Role::Racer).await;
    let mut host = Client::join(&state, "host", Role::Spectator).await;
    go_live(&mut host).await;
    alice.finish(75.0).await;
    wait_for_result(&store).await;

    drop(alice);
    drop(host);
    assert_eq!(state.registry.reap().await, 1);

    // Coming back shows the final standings, not a fresh lobby
    let mut alice = Client::join(&state, "alice", Role::Racer).await;
    let snap = alice.latest();
    assert_eq!(snap.status, RaceStatus::Finished);
    assert_eq!(snap.participants[0].rank, Some(1));
    assert_eq!(snap.participants[0].final_wpm, Some(75.0));

    let mut host = Client::join(&state, "host", Role::Spectator).await;
    assert!(host
        .send(ClientMessage::StartCountdown {
            duration_seconds: 3,
        })
        .await
        .is_some());
    alice.progress(1, 150.0).await;
    alice.finish(150.0).await;
    tokio::time::sleep(Duration::from_secs(5)).await;

    let snap = room_snapshot(&state).await;
    assert_eq!(snap.status, RaceStatus::Finished);
    assert_eq!(snap.participants[0].final_wpm, Some(75.0));

    let results = store.results().await;
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].standings[0].final_wpm, Some(75.0));
}

#[test]
fn test_unparseable_message_gets_parse_error() {
    let err = serde_json::from_str::<ClientMessage>(r#"{"type":"teleport"}"#).unwrap_err();
    let reply = serde_json::to_value(ServerMessage::parse_error(&err)).unwrap();
    assert_eq!(reply["type"], "race:error");
    assert_eq!(reply["code"], "PARSE_ERROR");
}
