/**
 * tests/search_flow.rs
 *
 * End-to-end search flows over the loopback transport, with a scripted
 * directory server and punchable peers.
 */

use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};
use tokio::sync::mpsc;

use matchpoint::config::MatchmakingConfig;
use matchpoint::error::SearchError;
use matchpoint::matchmaking::{
    GameDescriptor, MatchRequest, Matchmaker, OnlinePlayMode, ProcessState,
};
use matchpoint::transport::{Host, LoopbackNetwork, LoopbackTransport, Transport};
use matchpoint::user::{Identity, StaticCredentials, UserProfile};

const DIRECTORY_PORT: u16 = 43113;
const CLIENT_PORT: u16 = 41500;
const PEER_PORT: u16 = 45000;

fn profile() -> UserProfile {
    UserProfile {
        identity: Identity {
            uid: "uid-1".into(),
            play_key: "key-1".into(),
            connect_code: "YOU#001".into(),
        },
        display_name: "You".into(),
        alternate: Identity {
            uid: "alt-1".into(),
            play_key: "alt-key-1".into(),
            connect_code: "ALT#001".into(),
        },
    }
}

fn request() -> MatchRequest {
    MatchRequest::new(
        GameDescriptor {
            id: "GALE01".into(),
            external_id: "ext-1".into(),
            revision: 2,
            kind: "DolphinNetplay".into(),
            name: "Melee:1.0".into(),
        },
        OnlinePlayMode::Unranked,
    )
}

/// Shrunk deadlines so failure paths finish in test time.
fn test_config() -> MatchmakingConfig {
    MatchmakingConfig {
        directory_host: "mm.test".into(),
        directory_port: DIRECTORY_PORT,
        port_range: CLIENT_PORT..=CLIENT_PORT,
        bind_attempts: 3,
        connect_poll: Duration::from_millis(20),
        connect_poll_steps: 10,
        service_step: Duration::from_millis(10),
        create_ticket_timeout: Duration::from_millis(500),
        get_ticket_timeout: Duration::from_millis(100),
        punch_deadline: Duration::from_millis(300),
        punch_poll: Duration::from_millis(20),
        peer_capacity: 10,
        disconnect_wait: Duration::from_millis(200),
        app_version: "1.0.0-test".into(),
    }
}

/// One scripted exchange: the create-ticket reply, then optionally a
/// get-ticket reply pushed right after.
type Round = (Value, Option<Value>);

/// Directory server task: answers each create-ticket with the next round
/// and forwards every received request for assertions. Keeps servicing
/// afterwards so graceful disconnects complete.
fn spawn_directory(
    transport: LoopbackTransport,
    rounds: Vec<Round>,
) -> mpsc::UnboundedReceiver<Value> {
    let (seen_tx, seen_rx) = mpsc::unbounded_channel();
    tokio::spawn(async move {
        let mut host = transport
            .bind(DIRECTORY_PORT, 4)
            .expect("directory port free");
        let mut rounds = rounds.into_iter();
        loop {
            match host.service(Duration::from_millis(50)).await {
                Ok(Some(matchpoint::transport::Event::Receive { peer, payload })) => {
                    let value: Value = serde_json::from_slice(&payload).expect("valid json");
                    if seen_tx.send(value).is_err() {
                        return;
                    }
                    if let Some((create_resp, ticket)) = rounds.next() {
                        let _ = host.send(peer, create_resp.to_string().as_bytes());
                        if let Some(ticket) = ticket {
                            let _ = host.send(peer, ticket.to_string().as_bytes());
                        }
                    }
                }
                Ok(_) => {}
                Err(_) => return,
            }
        }
    });
    seen_rx
}

/// Peer task: sits on its port and accepts whatever dials it.
fn spawn_peer(transport: LoopbackTransport, port: u16) {
    tokio::spawn(async move {
        let mut host = transport.bind(port, 4).expect("peer port free");
        loop {
            if host.service(Duration::from_millis(50)).await.is_err() {
                return;
            }
        }
    });
}

fn ticket_ok() -> Value {
    json!({ "type": "create-ticket-resp" })
}

fn assignment(remote_port: u16) -> Value {
    json!({
        "type": "get-ticket-resp",
        "isHost": true,
        "players": [
            {
                "uid": "uid-1",
                "displayName": "You",
                "connectCode": "YOU#001",
                "port": 1,
                "isLocalPlayer": true,
                "ipAddress": format!("127.0.0.1:{CLIENT_PORT}"),
            },
            {
                "uid": "uid-2",
                "displayName": "Foe",
                "connectCode": "FOE#002",
                "port": 2,
                "isLocalPlayer": false,
                "ipAddress": format!("127.0.0.1:{remote_port}"),
            },
        ],
    })
}

#[tokio::test]
async fn search_without_login_fails_up_front() {
    let net = LoopbackNetwork::new();
    let mut matchmaker = Matchmaker::new(
        test_config(),
        net.transport(),
        Arc::new(StaticCredentials::logged_out()),
    );
    let err = matchmaker.start(request()).await.unwrap_err();
    assert_eq!(err.to_string(), "Must be logged in to queue. Go back to menu");
    assert_eq!(matchmaker.state(), ProcessState::Idle);
}

#[tokio::test]
async fn bind_exhaustion_reports_client_bind_failed() {
    let net = LoopbackNetwork::new();
    let transport = net.transport();
    // Occupy the only allowed port.
    let _blocker = transport.bind(CLIENT_PORT, 1).unwrap();

    let mut matchmaker = Matchmaker::new(
        test_config(),
        transport,
        Arc::new(StaticCredentials::logged_in(profile())),
    );
    let outcome = matchmaker.start(request()).await.unwrap();
    let err = outcome.await.unwrap().unwrap_err();
    assert!(matches!(err, SearchError::ClientBindFailed));

    let mut states = matchmaker.subscribe_state();
    states
        .wait_for(|s| *s == ProcessState::ErrorEncountered)
        .await
        .unwrap();
    assert_eq!(matchmaker.error_message().await, "Failed to create mm client");
    matchmaker.close().await;
}

#[tokio::test]
async fn unreachable_directory_reports_connect_failure() {
    let net = LoopbackNetwork::new();
    // No directory server bound anywhere.
    let mut matchmaker = Matchmaker::new(
        test_config(),
        net.transport(),
        Arc::new(StaticCredentials::logged_in(profile())),
    );
    let outcome = matchmaker.start(request()).await.unwrap();
    let err = outcome.await.unwrap().unwrap_err();
    assert!(matches!(err, SearchError::DirectoryUnreachable));

    matchmaker.close().await;
    // The control port must not leak past the failed search.
    assert!(!net.is_bound(CLIENT_PORT));
}

#[tokio::test]
async fn cancel_delivers_search_canceled_exactly_once() {
    let net = LoopbackNetwork::new();
    // No server: the worker sits in its connect polls until cancelled.
    let mut matchmaker = Matchmaker::new(
        test_config(),
        net.transport(),
        Arc::new(StaticCredentials::logged_in(profile())),
    );
    let outcome = matchmaker.start(request()).await.unwrap();
    assert!(matchmaker.is_searching());

    tokio::time::sleep(Duration::from_millis(30)).await;
    matchmaker.cancel().await;

    let err = outcome.await.unwrap().unwrap_err();
    assert!(matches!(err, SearchError::Cancelled));
    assert_eq!(matchmaker.error_message().await, "Search Canceled");
    assert_eq!(matchmaker.state(), ProcessState::ErrorEncountered);

    matchmaker.close().await;
    assert!(!net.is_bound(CLIENT_PORT));
}

#[tokio::test]
async fn full_search_connects_to_the_assigned_peer() {
    let net = LoopbackNetwork::new();
    let mut seen = spawn_directory(
        net.transport(),
        vec![(ticket_ok(), Some(assignment(PEER_PORT)))],
    );
    spawn_peer(net.transport(), PEER_PORT);

    let mut matchmaker = Matchmaker::new(
        test_config(),
        net.transport(),
        Arc::new(StaticCredentials::logged_in(profile())),
    );
    let outcome = matchmaker.start(request()).await.unwrap();
    let result = outcome.await.unwrap().unwrap();

    assert!(result.is_decider);
    assert_eq!(result.game.id, "GALE01");
    assert_eq!(result.remote_connect_code, "FOE#002");
    assert_eq!(result.remote_port, PEER_PORT);
    assert_eq!(result.local_port, CLIENT_PORT);
    assert_eq!(result.session.peers().len(), 1);
    // Server sent no stage list, two players: five defaults plus the extra.
    assert_eq!(result.session.assignment.stages.len(), 6);

    let mut states = matchmaker.subscribe_state();
    states
        .wait_for(|s| *s == ProcessState::ConnectionSuccess)
        .await
        .unwrap();

    // The ticket request carried the logged-in identity and version.
    let create = seen.recv().await.unwrap();
    assert_eq!(create["type"], "create-ticket");
    assert_eq!(create["user"]["uid"], "uid-1");
    assert_eq!(create["search"]["mode"], 1);
    assert_eq!(create["appVersion"], "1.0.0-test");

    // The match session holds the punched port until it is closed.
    assert!(net.is_bound(CLIENT_PORT));
    result.session.close(Duration::from_millis(200)).await;
    assert!(!net.is_bound(CLIENT_PORT));
    matchmaker.close().await;
}

#[tokio::test]
async fn server_rejection_surfaces_its_error_text() {
    let net = LoopbackNetwork::new();
    let rejection = json!({
        "type": "get-ticket-resp",
        "error": "queue closed",
        "latestVersion": "9.9.9",
    });
    let _seen = spawn_directory(net.transport(), vec![(ticket_ok(), Some(rejection))]);

    let credentials = Arc::new(StaticCredentials::logged_in(profile()));
    let mut matchmaker = Matchmaker::new(test_config(), net.transport(), credentials.clone());
    let outcome = matchmaker.start(request()).await.unwrap();
    let err = outcome.await.unwrap().unwrap_err();
    assert_eq!(err.to_string(), "queue closed");
    // The outdated-client hint reached the credential layer.
    assert_eq!(credentials.latest_version(), Some("9.9.9".into()));

    matchmaker.close().await;
    assert!(!net.is_bound(CLIENT_PORT));
}

#[tokio::test]
async fn failed_punch_retries_with_a_fresh_ticket() {
    let net = LoopbackNetwork::new();
    // First assignment points at a dead peer; the retry's create-ticket is
    // answered with a rejection to end the test.
    let dead_peer = json!({ "type": "create-ticket-resp", "error": "done" });
    let mut seen = spawn_directory(
        net.transport(),
        vec![
            (ticket_ok(), Some(assignment(49000))),
            (dead_peer, None),
        ],
    );

    let mut matchmaker = Matchmaker::new(
        test_config(),
        net.transport(),
        Arc::new(StaticCredentials::logged_in(profile())),
    );
    let outcome = matchmaker.start(request()).await.unwrap();
    let err = outcome.await.unwrap().unwrap_err();
    assert_eq!(err.to_string(), "done");

    // Two tickets were created: the original and the post-failure retry.
    assert_eq!(seen.recv().await.unwrap()["type"], "create-ticket");
    assert_eq!(seen.recv().await.unwrap()["type"], "create-ticket");
    assert_eq!(matchmaker.failed_slots().await, vec![0]);

    matchmaker.close().await;
    assert!(!net.is_bound(CLIENT_PORT));
}
