//! End-to-end tests over a real relay.
//!
//! These tests start a server on a free port and connect real WebSocket
//! providers, verifying the whole pipeline from a local transaction to a
//! peer's replica.

use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use serde_json::json;
use stagehand_sync::model::default_stage_props;
use stagehand_sync::{
    ConnectionState, CursorData, Marker, MessageType, PeerInfo, Point, ServerConfig, SharedDocument, SyncMessage,
    SyncEvent, SyncServer, WsProvider,
};
use tokio::time::{sleep, timeout, Duration};
use tokio_tungstenite::tungstenite::Message;

async fn free_port() -> u16 {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap().port()
}

async fn start_test_server(max_peers_per_room: usize) -> (String, Arc<SyncServer>) {
    let port = free_port().await;
    let config = ServerConfig {
        bind_addr: format!("127.0.0.1:{port}"),
        max_peers_per_room,
        broadcast_capacity: 64,
        heartbeat_interval_secs: 30,
    };
    let server = Arc::new(SyncServer::new(config));
    let running = Arc::clone(&server);
    tokio::spawn(async move {
        running.run().await.unwrap();
    });
    // Give the server time to bind
    sleep(Duration::from_millis(50)).await;
    (format!("ws://127.0.0.1:{port}"), server)
}

async fn join(url: &str, room: &str, name: &str) -> (Arc<SharedDocument>, Arc<WsProvider>) {
    let peer = PeerInfo::new(format!("user-{name}"), name);
    WsProvider::connect_document(peer, room, url).await.unwrap()
}

async fn wait_for_peers(server: &SyncServer, room: &str, expected: usize) -> bool {
    for _ in 0..100 {
        if server.peer_count(room).await == expected {
            return true;
        }
        sleep(Duration::from_millis(20)).await;
    }
    false
}

/// Poll `check` until it holds or two seconds pass.
async fn eventually<F: Fn() -> bool>(check: F) -> bool {
    for _ in 0..100 {
        if check() {
            return true;
        }
        sleep(Duration::from_millis(20)).await;
    }
    false
}

#[tokio::test]
async fn test_server_accepts_connections() {
    let (url, _server) = start_test_server(10).await;
    let result = tokio_tungstenite::connect_async(&url).await;
    assert!(result.is_ok(), "Should connect to server");
}

#[tokio::test]
async fn test_edits_reach_peer() {
    let (url, server) = start_test_server(10).await;
    let (gm, _p1) = join(&url, "party-1", "GM").await;
    let (player, _p2) = join(&url, "party-1", "Player").await;
    assert!(wait_for_peers(&server, "party-1", 2).await);

    gm.initialize_scene_data("s1", &default_stage_props()).unwrap();
    gm.upsert_marker("s1", &Marker::new("m1", Point::new(3.0, 4.0))).unwrap();

    assert!(eventually(|| player.markers("s1").map(|m| m.len() == 1).unwrap_or(false)).await);
    assert_eq!(player.markers("s1").unwrap()[0].position, Point::new(3.0, 4.0));
}

#[tokio::test]
async fn test_late_joiner_gets_state_from_relay() {
    let (url, server) = start_test_server(10).await;
    let (gm, _pg) = join(&url, "party-1", "GM").await;
    gm.initialize_scene_data("s1", &default_stage_props()).unwrap();
    gm.update_scene_stage_props("s1", &json!({ "grid": { "size": 70 } })).unwrap();
    sleep(Duration::from_millis(100)).await;
    assert!(server.room_state("party-1").await.is_some());

    // Answered from the relay's document through the state-vector handshake.
    let (late, provider) = join(&url, "party-1", "Late").await;
    let mut events = provider.take_event_rx().unwrap();
    assert!(eventually(|| late.has_scene("s1").unwrap_or(false)).await);
    assert_eq!(late.stage_props("s1").unwrap()["grid"]["size"], 70);

    let mut synced = false;
    while let Ok(Some(event)) = timeout(Duration::from_millis(200), events.recv()).await {
        if event == SyncEvent::Synced {
            synced = true;
            break;
        }
    }
    assert!(synced);
}

#[tokio::test]
async fn test_room_closes_when_everyone_leaves() {
    let (url, server) = start_test_server(10).await;
    let (a, _pa) = join(&url, "party-1", "A").await;
    let (b, _pb) = join(&url, "party-1", "B").await;
    assert!(wait_for_peers(&server, "party-1", 2).await);

    a.destroy();
    b.destroy();
    let mut rooms = usize::MAX;
    for _ in 0..100 {
        rooms = server.room_count().await;
        if rooms == 0 {
            break;
        }
        sleep(Duration::from_millis(20)).await;
    }
    assert_eq!(rooms, 0);
    assert!(server.room_state("party-1").await.is_none());
}

#[tokio::test]
async fn test_offline_edits_replayed_on_reconnect() {
    let (url, _server) = start_test_server(10).await;
    let (a, provider_a) = join(&url, "party-1", "A").await;
    let (b, _pb) = join(&url, "party-1", "B").await;

    a.initialize_scene_data("s1", &default_stage_props()).unwrap();
    assert!(eventually(|| b.has_scene("s1").unwrap_or(false)).await);

    provider_a.disconnect();
    assert_eq!(provider_a.connection_state(), ConnectionState::Disconnected);
    a.upsert_marker("s1", &Marker::new("offline", Point::new(1.0, 1.0))).unwrap();
    assert_eq!(provider_a.offline_queue_len(), 1);

    sleep(Duration::from_millis(100)).await;
    assert!(b.markers("s1").unwrap().is_empty());

    provider_a.connect().await.unwrap();
    assert_eq!(provider_a.offline_queue_len(), 0);
    assert!(eventually(|| b.markers("s1").map(|m| m.len() == 1).unwrap_or(false)).await);
}

#[tokio::test]
async fn test_peer_leaving_removes_cursor_and_awareness() {
    let (url, _server) = start_test_server(10).await;
    let (gm, _pg) = join(&url, "party-1", "GM").await;
    let (player, _pp) = join(&url, "party-1", "Player").await;

    player
        .update_cursor(&CursorData {
            user_id: "player".into(),
            position: Point::new(10.0, 10.0),
            normalized_position: Point::new(0.1, 0.1),
            last_move_time: 1,
        })
        .unwrap();
    player.update_awareness(|s| s.name = "Player".into()).unwrap();

    assert!(eventually(|| gm.cursors().map(|c| c.len() == 1).unwrap_or(false)).await);
    assert!(eventually(|| gm.peer_awareness().map(|p| p.len() == 1).unwrap_or(false)).await);

    player.destroy();
    assert!(eventually(|| gm.cursors().map(|c| c.is_empty()).unwrap_or(false)).await);
    assert!(eventually(|| gm.peer_awareness().map(|p| p.is_empty()).unwrap_or(false)).await);
}

#[tokio::test]
async fn test_awareness_reaches_late_joiner() {
    let (url, _server) = start_test_server(10).await;
    let (gm, _pg) = join(&url, "party-1", "GM").await;
    gm.update_awareness(|s| s.name = "Game Master".into()).unwrap();
    sleep(Duration::from_millis(100)).await;

    let (player, _pp) = join(&url, "party-1", "Player").await;
    assert!(
        eventually(|| player
            .peer_awareness()
            .map(|peers| peers.iter().any(|(_, s)| s.name == "Game Master"))
            .unwrap_or(false))
        .await
    );
}

#[tokio::test]
async fn test_rooms_are_isolated() {
    let (url, _server) = start_test_server(10).await;
    let (a, _pa) = join(&url, "party-1", "A").await;
    let (b, _pb) = join(&url, "party-2", "B").await;

    a.initialize_scene_data("s1", &default_stage_props()).unwrap();
    sleep(Duration::from_millis(200)).await;
    assert!(!b.has_scene("s1").unwrap());
}

#[tokio::test]
async fn test_full_room_refuses_join() {
    let (url, server) = start_test_server(1).await;
    let (_a, _pa) = join(&url, "party-1", "A").await;
    sleep(Duration::from_millis(50)).await;

    let (ws, _) = tokio_tungstenite::connect_async(&url).await.unwrap();
    let (mut tx, mut rx) = ws.split();
    let info = PeerInfo::new("user-b", "B");
    let frame = SyncMessage::peer_joined("party-1", &info).unwrap().encode().unwrap();
    tx.send(Message::Binary(frame.into())).await.unwrap();

    let closed = timeout(Duration::from_secs(2), async {
        loop {
            match rx.next().await {
                Some(Ok(Message::Close(_))) | None | Some(Err(_)) => return true,
                Some(Ok(_)) => continue,
            }
        }
    })
    .await
    .unwrap_or(false);
    assert!(closed);
    assert_eq!(server.stats().await.rejected_joins, 1);
    assert_eq!(server.peer_count("party-1").await, 1);
}

#[tokio::test]
async fn test_ping_pong() {
    let (url, _server) = start_test_server(10).await;
    let (ws, _) = tokio_tungstenite::connect_async(&url).await.unwrap();
    let (mut tx, mut rx) = ws.split();

    let info = PeerInfo::new("user-raw", "Raw");
    let join = SyncMessage::peer_joined("party-1", &info).unwrap().encode().unwrap();
    tx.send(Message::Binary(join.into())).await.unwrap();
    let ping = SyncMessage::ping(info.peer_id).encode().unwrap();
    tx.send(Message::Binary(ping.into())).await.unwrap();

    let got_pong = timeout(Duration::from_secs(2), async {
        while let Some(Ok(msg)) = rx.next().await {
            if let Message::Binary(data) = msg {
                let bytes: Vec<u8> = data.into();
                if SyncMessage::decode(&bytes).map(|m| m.msg_type) == Ok(MessageType::Pong) {
                    return true;
                }
            }
        }
        false
    })
    .await
    .unwrap_or(false);
    assert!(got_pong);
}

#[tokio::test]
async fn test_malformed_update_is_not_forwarded() {
    let (url, server) = start_test_server(10).await;
    let (doc, _p) = join(&url, "party-1", "Listener").await;

    let (ws, _) = tokio_tungstenite::connect_async(&url).await.unwrap();
    let (mut tx, _rx) = ws.split();
    let info = PeerInfo::new("user-bad", "Bad");
    let join_msg = SyncMessage::peer_joined("party-1", &info).unwrap().encode().unwrap();
    tx.send(Message::Binary(join_msg.into())).await.unwrap();
    let garbage = SyncMessage::update(info.peer_id, "party-1", 1, vec![0xFF, 0xFF, 0xFF])
        .encode()
        .unwrap();
    tx.send(Message::Binary(garbage.into())).await.unwrap();

    let mut rejected = 0;
    for _ in 0..100 {
        rejected = server.stats().await.rejected_updates;
        if rejected > 0 {
            break;
        }
        sleep(Duration::from_millis(20)).await;
    }
    assert_eq!(rejected, 1);

    // The relay keeps serving the room.
    let (other, _p2) = join(&url, "party-1", "Other").await;
    other.initialize_scene_data("s1", &default_stage_props()).unwrap();
    assert!(eventually(|| doc.has_scene("s1").unwrap_or(false)).await);
}
