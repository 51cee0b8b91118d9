//! End-to-end scenarios over real TCP connections: roster, message relay,
//! the call lifecycle, disconnect teardown, and the sweepers.

use std::time::Duration;

use dialog::e2e_common::{spawn_server, TestPeer};
use dialog::records::{
    AnswerStatus, CallKind, CallStatus, ClientRecord, DeliveryStatus, EndStatus, ServerRecord,
};
use dialog::ServerConfig;

fn is_message_status(record: &ServerRecord) -> bool {
    matches!(record, ServerRecord::MessageStatus { .. })
}

/// S1 — both users see each other in the roster, never themselves.
#[tokio::test]
async fn login_roster_excludes_self() {
    let (_server, _store, addr) = spawn_server(ServerConfig::default()).await.unwrap();
    let mut alice = TestPeer::join(addr, "alice", "pw1").await.unwrap();
    let mut bob = TestPeer::join(addr, "bob", "pw2").await.unwrap();

    alice
        .send(&ClientRecord::GetUserList {
            session_token: alice.token(),
        })
        .await
        .unwrap();
    match alice.recv().await.unwrap() {
        ServerRecord::UserListUpdate { users } => {
            assert_eq!(users.len(), 1);
            assert_eq!(users[0].username, "bob");
            assert_eq!(users[0].p2p_port, 40000);
        }
        other => panic!("unexpected reply: {other:?}"),
    }

    bob.send(&ClientRecord::GetUserList {
        session_token: bob.token(),
    })
    .await
    .unwrap();
    match bob.recv().await.unwrap() {
        ServerRecord::UserListUpdate { users } => {
            assert_eq!(users.len(), 1);
            assert_eq!(users[0].username, "alice");
        }
        other => panic!("unexpected reply: {other:?}"),
    }
}

/// S2 — a text record reaches the receiver and the sender learns it did.
#[tokio::test]
async fn message_delivery_end_to_end() {
    let (_server, _store, addr) = spawn_server(ServerConfig::default()).await.unwrap();
    let mut alice = TestPeer::join(addr, "alice", "pw1").await.unwrap();
    let mut bob = TestPeer::join(addr, "bob", "pw2").await.unwrap();

    alice
        .send(&ClientRecord::P2pMessage {
            to: "bob".into(),
            message: "hi".into(),
            message_id: "m1".into(),
            timestamp: 1_700_000_000.0,
            session_token: alice.token(),
        })
        .await
        .unwrap();

    let delivered = bob.recv().await.unwrap();
    assert!(matches!(
        delivered,
        ServerRecord::P2pMessage { ref from, ref message, ref message_id, .. }
            if from == "alice" && message == "hi" && message_id == "m1"
    ));

    // the status arrives both as reply and as async push, same message_id
    let status = alice
        .recv_matching(Duration::from_secs(2), is_message_status)
        .await
        .unwrap();
    assert!(matches!(
        status,
        ServerRecord::MessageStatus { status: DeliveryStatus::Delivered, ref message_id, .. }
            if message_id == "m1"
    ));
}

/// S3 — a message to a disconnected user fails synchronously; nobody else
/// ever sees the body.
#[tokio::test]
async fn offline_recipient_fails_synchronously() {
    let (server, _store, addr) = spawn_server(ServerConfig::default()).await.unwrap();
    let mut alice = TestPeer::join(addr, "alice", "pw1").await.unwrap();
    let bob = TestPeer::join(addr, "bob", "pw2").await.unwrap();

    drop(bob);
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(server.presence().len(), 1);

    alice
        .send(&ClientRecord::P2pMessage {
            to: "bob".into(),
            message: "anyone there?".into(),
            message_id: "m2".into(),
            timestamp: 1_700_000_000.0,
            session_token: alice.token(),
        })
        .await
        .unwrap();

    let status = alice
        .recv_matching(Duration::from_secs(2), is_message_status)
        .await
        .unwrap();
    assert!(matches!(
        status,
        ServerRecord::MessageStatus {
            status: DeliveryStatus::UserOffline | DeliveryStatus::Failed,
            ref message_id,
            ..
        } if message_id == "m2"
    ));
}

/// S4 — full accept flow, then busy exclusivity for the caller.
#[tokio::test]
async fn call_accept_flow_and_busy_exclusivity() {
    let (_server, store, addr) = spawn_server(ServerConfig::default()).await.unwrap();
    let mut alice = TestPeer::join(addr, "alice", "pw1").await.unwrap();
    let mut bob = TestPeer::join(addr, "bob", "pw2").await.unwrap();

    alice
        .send(&ClientRecord::CallRequest {
            to: "bob".into(),
            call_type: CallKind::Audio,
            call_id: "c1".into(),
            session_token: alice.token(),
        })
        .await
        .unwrap();

    assert!(matches!(
        alice.recv().await.unwrap(),
        ServerRecord::CallResponse { status: CallStatus::Ringing, ref call_id, .. }
            if call_id == "c1"
    ));
    assert!(matches!(
        bob.recv().await.unwrap(),
        ServerRecord::CallRequest { ref from, call_type: CallKind::Audio, ref call_id, .. }
            if from == "alice" && call_id == "c1"
    ));

    bob.send(&ClientRecord::CallAnswer {
        call_id: "c1".into(),
        answer: "accept".into(),
        call_port: Some(40001),
        session_token: bob.token(),
    })
    .await
    .unwrap();

    assert!(matches!(
        bob.recv().await.unwrap(),
        ServerRecord::CallAnswerResponse { status: AnswerStatus::Accepted, ref call_id }
            if call_id == "c1"
    ));
    assert!(matches!(
        alice.recv().await.unwrap(),
        ServerRecord::CallAccepted { ref from, ref call_id, call_port: Some(40001) }
            if from == "bob" && call_id == "c1"
    ));
    assert_eq!(store.call_record("c1").unwrap().unwrap().0, "accepted");

    // any further call_request from a participant yields user_busy
    alice
        .send(&ClientRecord::CallRequest {
            to: "whoever".into(),
            call_type: CallKind::Video,
            call_id: "c2".into(),
            session_token: alice.token(),
        })
        .await
        .unwrap();
    assert!(matches!(
        alice.recv().await.unwrap(),
        ServerRecord::CallResponse { status: CallStatus::UserBusy, ref call_id, .. }
            if call_id == "c2"
    ));

    // and calling a busy callee is refused for outsiders too
    let mut carol = TestPeer::join(addr, "carol", "pw3").await.unwrap();
    carol
        .send(&ClientRecord::CallRequest {
            to: "bob".into(),
            call_type: CallKind::Audio,
            call_id: "c3".into(),
            session_token: carol.token(),
        })
        .await
        .unwrap();
    assert!(matches!(
        carol.recv().await.unwrap(),
        ServerRecord::CallResponse { status: CallStatus::UserBusy, .. }
    ));
}

#[tokio::test]
async fn call_reject_tears_the_call_down() {
    let (server, store, addr) = spawn_server(ServerConfig::default()).await.unwrap();
    let mut alice = TestPeer::join(addr, "alice", "pw1").await.unwrap();
    let mut bob = TestPeer::join(addr, "bob", "pw2").await.unwrap();

    alice
        .send(&ClientRecord::CallRequest {
            to: "bob".into(),
            call_type: CallKind::Video,
            call_id: "c1".into(),
            session_token: alice.token(),
        })
        .await
        .unwrap();
    alice.recv().await.unwrap();
    bob.recv().await.unwrap();

    bob.send(&ClientRecord::CallAnswer {
        call_id: "c1".into(),
        answer: "reject".into(),
        call_port: None,
        session_token: bob.token(),
    })
    .await
    .unwrap();

    assert!(matches!(
        bob.recv().await.unwrap(),
        ServerRecord::CallAnswerResponse { status: AnswerStatus::Rejected, .. }
    ));
    assert!(matches!(
        alice.recv().await.unwrap(),
        ServerRecord::CallRejected { ref from, ref call_id }
            if from == "bob" && call_id == "c1"
    ));
    assert!(server.calls().is_empty());
    assert_eq!(store.call_record("c1").unwrap().unwrap().0, "rejected");
}

#[tokio::test]
async fn call_end_reports_duration_and_is_idempotent() {
    let (_server, store, addr) = spawn_server(ServerConfig::default()).await.unwrap();
    let mut alice = TestPeer::join(addr, "alice", "pw1").await.unwrap();
    let mut bob = TestPeer::join(addr, "bob", "pw2").await.unwrap();

    alice
        .send(&ClientRecord::CallRequest {
            to: "bob".into(),
            call_type: CallKind::Audio,
            call_id: "c1".into(),
            session_token: alice.token(),
        })
        .await
        .unwrap();
    alice.recv().await.unwrap();
    bob.recv().await.unwrap();
    bob.send(&ClientRecord::CallAnswer {
        call_id: "c1".into(),
        answer: "accept".into(),
        call_port: Some(40001),
        session_token: bob.token(),
    })
    .await
    .unwrap();
    bob.recv().await.unwrap();
    alice.recv().await.unwrap();

    alice
        .send(&ClientRecord::CallEnd {
            call_id: "c1".into(),
            session_token: alice.token(),
        })
        .await
        .unwrap();
    assert!(matches!(
        alice.recv().await.unwrap(),
        ServerRecord::CallEndResponse { status: EndStatus::Ended, ref call_id, duration: Some(_) }
            if call_id == "c1"
    ));
    assert!(matches!(
        bob.recv().await.unwrap(),
        ServerRecord::CallEnded { ref from, ref call_id, .. }
            if from == "alice" && call_id == "c1"
    ));
    assert_eq!(store.call_record("c1").unwrap().unwrap().0, "ended");

    // a repeated hang-up is benign
    alice
        .send(&ClientRecord::CallEnd {
            call_id: "c1".into(),
            session_token: alice.token(),
        })
        .await
        .unwrap();
    assert!(matches!(
        alice.recv().await.unwrap(),
        ServerRecord::CallEndResponse { status: EndStatus::AlreadyEnded, duration: None, .. }
    ));
}

/// S5 — a participant's TCP connection dropping ends the call for the peer.
#[tokio::test]
async fn abrupt_disconnect_ends_the_call() {
    let (server, store, addr) = spawn_server(ServerConfig::default()).await.unwrap();
    let mut alice = TestPeer::join(addr, "alice", "pw1").await.unwrap();
    let mut bob = TestPeer::join(addr, "bob", "pw2").await.unwrap();

    alice
        .send(&ClientRecord::CallRequest {
            to: "bob".into(),
            call_type: CallKind::Audio,
            call_id: "c1".into(),
            session_token: alice.token(),
        })
        .await
        .unwrap();
    alice.recv().await.unwrap();
    bob.recv().await.unwrap();
    bob.send(&ClientRecord::CallAnswer {
        call_id: "c1".into(),
        answer: "accept".into(),
        call_port: Some(40001),
        session_token: bob.token(),
    })
    .await
    .unwrap();
    bob.recv().await.unwrap();
    alice.recv().await.unwrap();

    drop(bob);

    let ended = alice
        .recv_matching(Duration::from_secs(3), |r| {
            matches!(r, ServerRecord::CallEnded { .. })
        })
        .await
        .unwrap();
    assert!(matches!(
        ended,
        ServerRecord::CallEnded { ref from, ref call_id, ref reason }
            if from == "bob" && call_id == "c1"
                && reason.as_deref() == Some("user_disconnected")
    ));
    assert!(server.calls().is_empty());
    assert_eq!(store.call_record("c1").unwrap().unwrap().0, "ended_abruptly");

    alice
        .send(&ClientRecord::CallEnd {
            call_id: "c1".into(),
            session_token: alice.token(),
        })
        .await
        .unwrap();
    assert!(matches!(
        alice.recv().await.unwrap(),
        ServerRecord::CallEndResponse { status: EndStatus::AlreadyEnded, .. }
    ));
}

/// S6 — a ringing call nobody answers is swept and both sides told.
#[tokio::test]
async fn stuck_ringing_call_is_swept() {
    let config = ServerConfig {
        ringing_max_secs: 1,
        call_sweep_secs: 1,
        ..ServerConfig::default()
    };
    let (server, store, addr) = spawn_server(config).await.unwrap();
    let mut alice = TestPeer::join(addr, "alice", "pw1").await.unwrap();
    let mut charlie = TestPeer::join(addr, "charlie", "pw3").await.unwrap();

    alice
        .send(&ClientRecord::CallRequest {
            to: "charlie".into(),
            call_type: CallKind::Audio,
            call_id: "c1".into(),
            session_token: alice.token(),
        })
        .await
        .unwrap();
    alice.recv().await.unwrap();
    charlie.recv().await.unwrap(); // the incoming-call notice, never answered

    let swept = alice
        .recv_matching(Duration::from_secs(5), |r| {
            matches!(r, ServerRecord::CallEnded { .. })
        })
        .await
        .unwrap();
    assert!(matches!(
        swept,
        ServerRecord::CallEnded { ref from, ref reason, .. }
            if from == "system" && reason.as_deref() == Some("timeout")
    ));
    assert!(matches!(
        charlie
            .recv_matching(Duration::from_secs(2), |r| {
                matches!(r, ServerRecord::CallEnded { .. })
            })
            .await
            .unwrap(),
        ServerRecord::CallEnded { ref from, .. } if from == "system"
    ));
    assert!(server.calls().is_empty());
    assert_eq!(store.call_record("c1").unwrap().unwrap().0, "timeout");
}

#[tokio::test]
async fn ice_candidates_pass_through_between_participants_only() {
    let (server, _store, addr) = spawn_server(ServerConfig::default()).await.unwrap();
    let mut alice = TestPeer::join(addr, "alice", "pw1").await.unwrap();
    let mut bob = TestPeer::join(addr, "bob", "pw2").await.unwrap();
    let mut mallory = TestPeer::join(addr, "mallory", "pw4").await.unwrap();

    alice
        .send(&ClientRecord::CallRequest {
            to: "bob".into(),
            call_type: CallKind::Video,
            call_id: "c1".into(),
            session_token: alice.token(),
        })
        .await
        .unwrap();
    alice.recv().await.unwrap();
    bob.recv().await.unwrap();

    alice
        .send(&ClientRecord::IceCandidate {
            call_id: "c1".into(),
            candidate: "candidate:0 1 UDP 2122 192.0.2.7 40001 typ host".into(),
            target_user: "bob".into(),
            session_token: alice.token(),
        })
        .await
        .unwrap();
    assert!(matches!(
        bob.recv().await.unwrap(),
        ServerRecord::IceCandidate { ref call_id, ref from_user, .. }
            if call_id == "c1" && from_user == "alice"
    ));

    // an outsider's candidate is dropped with no reply and no state change
    mallory
        .send(&ClientRecord::IceCandidate {
            call_id: "c1".into(),
            candidate: "candidate:spoof".into(),
            target_user: "bob".into(),
            session_token: mallory.token(),
        })
        .await
        .unwrap();
    assert!(mallory.recv_within(Duration::from_millis(300)).await.is_err());
    assert!(bob.recv_within(Duration::from_millis(300)).await.is_err());
    assert!(server.calls().get("c1").is_some());
}

#[tokio::test]
async fn bad_call_answers_get_discriminated_replies() {
    let (_server, _store, addr) = spawn_server(ServerConfig::default()).await.unwrap();
    let mut alice = TestPeer::join(addr, "alice", "pw1").await.unwrap();
    let mut bob = TestPeer::join(addr, "bob", "pw2").await.unwrap();

    // answering a call that never existed is benign
    bob.send(&ClientRecord::CallAnswer {
        call_id: "ghost".into(),
        answer: "accept".into(),
        call_port: None,
        session_token: bob.token(),
    })
    .await
    .unwrap();
    assert!(matches!(
        bob.recv().await.unwrap(),
        ServerRecord::CallAnswerResponse { status: AnswerStatus::CallNotFound, ref call_id }
            if call_id == "ghost"
    ));

    alice
        .send(&ClientRecord::CallRequest {
            to: "bob".into(),
            call_type: CallKind::Audio,
            call_id: "c1".into(),
            session_token: alice.token(),
        })
        .await
        .unwrap();
    alice.recv().await.unwrap();
    bob.recv().await.unwrap();

    // the caller cannot answer their own call
    alice
        .send(&ClientRecord::CallAnswer {
            call_id: "c1".into(),
            answer: "accept".into(),
            call_port: None,
            session_token: alice.token(),
        })
        .await
        .unwrap();
    assert!(matches!(
        alice.recv().await.unwrap(),
        ServerRecord::Error { .. }
    ));

    // an unrecognized answer value is an error, not a decode failure
    bob.send(&ClientRecord::CallAnswer {
        call_id: "c1".into(),
        answer: "maybe".into(),
        call_port: None,
        session_token: bob.token(),
    })
    .await
    .unwrap();
    assert!(matches!(bob.recv().await.unwrap(), ServerRecord::Error { .. }));
}

#[tokio::test]
async fn calling_an_offline_user_reports_user_offline() {
    let (_server, _store, addr) = spawn_server(ServerConfig::default()).await.unwrap();
    let mut alice = TestPeer::join(addr, "alice", "pw1").await.unwrap();

    alice
        .send(&ClientRecord::CallRequest {
            to: "nobody".into(),
            call_type: CallKind::Audio,
            call_id: "c1".into(),
            session_token: alice.token(),
        })
        .await
        .unwrap();
    assert!(matches!(
        alice.recv().await.unwrap(),
        ServerRecord::CallResponse { status: CallStatus::UserOffline, .. }
    ));
}

#[tokio::test]
async fn idle_connections_are_swept() {
    let config = ServerConfig {
        idle_sweep_secs: 1,
        idle_max_secs: 1,
        ..ServerConfig::default()
    };
    let (server, _store, addr) = spawn_server(config).await.unwrap();
    let mut alice = TestPeer::join(addr, "alice", "pw1").await.unwrap();
    assert_eq!(server.presence().len(), 1);

    // no heartbeats: the sweeper evicts and closes the connection
    assert!(alice.recv_within(Duration::from_secs(5)).await.is_err());
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(server.presence().is_empty());
}

#[tokio::test]
async fn heartbeat_keeps_a_connection_alive() {
    let config = ServerConfig {
        idle_sweep_secs: 1,
        idle_max_secs: 2,
        ..ServerConfig::default()
    };
    let (server, _store, addr) = spawn_server(config).await.unwrap();
    let mut alice = TestPeer::join(addr, "alice", "pw1").await.unwrap();

    for _ in 0..4 {
        tokio::time::sleep(Duration::from_millis(800)).await;
        alice
            .send(&ClientRecord::Heartbeat {
                session_token: alice.token(),
            })
            .await
            .unwrap();
        assert_eq!(alice.recv().await.unwrap(), ServerRecord::HeartbeatAck);
    }
    assert!(server.presence().contains("alice"));
}

#[tokio::test]
async fn client_info_updates_the_roster() {
    let (_server, _store, addr) = spawn_server(ServerConfig::default()).await.unwrap();
    let mut alice = TestPeer::join(addr, "alice", "pw1").await.unwrap();
    let mut bob = TestPeer::join(addr, "bob", "pw2").await.unwrap();

    bob.send(&ClientRecord::ClientInfo {
        p2p_port: 51515,
        external_ip: "198.51.100.9".into(),
        session_token: bob.token(),
    })
    .await
    .unwrap();
    assert!(matches!(
        bob.recv().await.unwrap(),
        ServerRecord::ClientInfoAck { .. }
    ));

    alice
        .send(&ClientRecord::GetUserList {
            session_token: alice.token(),
        })
        .await
        .unwrap();
    match alice.recv().await.unwrap() {
        ServerRecord::UserListUpdate { users } => {
            assert_eq!(users[0].username, "bob");
            assert_eq!(users[0].p2p_port, 51515);
            assert_eq!(users[0].external_ip, "198.51.100.9");
        }
        other => panic!("unexpected reply: {other:?}"),
    }
}
