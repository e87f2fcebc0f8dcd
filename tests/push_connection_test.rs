use futures_util::{SinkExt, StreamExt};
use serde_json::json;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{accept_hdr_async, WebSocketStream};

use schat::error::SyncError;
use schat::sync::stomp::{parse_frames, Command, Frame};
use schat::sync::websocket::{BROADCAST_TOPIC, PRIVATE_QUEUE, SEND_DESTINATION};
use schat::sync::{ConnectionState, PushChannel, PushConnectionManager, PushSettings};

const WAIT: Duration = Duration::from_secs(5);

type ServerSocket = WebSocketStream<TcpStream>;

struct Peer {
    ws: ServerSocket,
    connect: Frame,
    upgrade_auth: Option<String>,
}

async fn listen() -> (TcpListener, PushSettings) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let settings = PushSettings {
        url: format!("ws://127.0.0.1:{}/ws", port),
        reconnect_delay: Duration::from_millis(100),
        heartbeat_outgoing: Duration::from_secs(4),
        heartbeat_incoming: Duration::from_secs(4),
        handshake_timeout: Duration::from_secs(2),
    };
    (listener, settings)
}

/// Accept one socket and read the client's CONNECT frame
async fn accept(listener: &TcpListener) -> Peer {
    let (stream, _) = timeout(WAIT, listener.accept()).await.unwrap().unwrap();

    let mut upgrade_auth = None;
    let mut ws = accept_hdr_async(stream, |request: &Request, response: Response| -> Result<Response, ErrorResponse> {
        upgrade_auth = request
            .headers()
            .get("authorization")
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        Ok(response)
    })
    .await
    .unwrap();

    let connect = next_frame(&mut ws).await;
    Peer {
        ws,
        connect,
        upgrade_auth,
    }
}

/// Next STOMP frame from the client, skipping heart-beats
async fn next_frame(ws: &mut ServerSocket) -> Frame {
    loop {
        let message = timeout(WAIT, ws.next()).await.unwrap().unwrap().unwrap();
        if let WsMessage::Text(text) = message {
            if let Some(frame) = parse_frames(&text).unwrap().into_iter().next() {
                return frame;
            }
        }
    }
}

async fn send_frame(ws: &mut ServerSocket, frame: Frame) {
    ws.send(WsMessage::Text(frame.encode())).await.unwrap();
}

/// Finish the handshake and consume both subscriptions
async fn establish(peer: &mut Peer, heart_beat: &str) -> Vec<Frame> {
    send_frame(
        &mut peer.ws,
        Frame::new(Command::Connected)
            .header("version", "1.2")
            .header("heart-beat", heart_beat),
    )
    .await;
    vec![next_frame(&mut peer.ws).await, next_frame(&mut peer.ws).await]
}

async fn wait_for_state(manager: &PushConnectionManager, expected: ConnectionState) {
    let mut state = manager.subscribe_state();
    timeout(WAIT, state.wait_for(|s| *s == expected)).await.unwrap().unwrap();
}

#[tokio::test]
async fn test_connect_subscribe_deliver_send_disconnect() {
    let (listener, settings) = listen().await;
    let manager = PushConnectionManager::new(settings);
    let (tx, mut rx) = mpsc::channel(8);

    manager.connect("A1".to_string(), tx.clone());
    // Second call while the first attempt is active is ignored
    manager.connect("A1".to_string(), tx);

    let mut peer = accept(&listener).await;
    assert_eq!(peer.upgrade_auth.as_deref(), Some("Bearer A1"));
    assert_eq!(peer.connect.command, Command::Connect);
    assert_eq!(peer.connect.get("Authorization"), Some("Bearer A1"));
    assert_eq!(peer.connect.get("accept-version"), Some("1.2"));
    assert_eq!(peer.connect.get("heart-beat"), Some("4000,4000"));

    let subscriptions = establish(&mut peer, "0,0").await;
    let destinations: Vec<_> = subscriptions.iter().map(|f| f.get("destination")).collect();
    assert_eq!(destinations, vec![Some(BROADCAST_TOPIC), Some(PRIVATE_QUEUE)]);
    assert!(subscriptions.iter().all(|f| f.command == Command::Subscribe));
    assert_ne!(subscriptions[0].get("id"), subscriptions[1].get("id"));

    wait_for_state(&manager, ConnectionState::Connected).await;

    let body = json!({"id": 1, "content": "hello", "sender": "bob", "timestamp": "2024-03-01T10:00:00"});
    send_frame(
        &mut peer.ws,
        Frame::new(Command::Message)
            .header("destination", BROADCAST_TOPIC)
            .header("subscription", "sub-0")
            .header("message-id", "m-1")
            .with_body(body.to_string()),
    )
    .await;
    let delivered = timeout(WAIT, rx.recv()).await.unwrap().unwrap();
    assert_eq!(delivered.id, 1);
    assert_eq!(delivered.content, "hello");

    manager.send(SEND_DESTINATION, &json!({"content": "hi"})).unwrap();
    let sent = next_frame(&mut peer.ws).await;
    assert_eq!(sent.command, Command::Send);
    assert_eq!(sent.get("destination"), Some(SEND_DESTINATION));
    assert_eq!(serde_json::from_str::<serde_json::Value>(&sent.body).unwrap(), json!({"content": "hi"}));

    manager.disconnect().await;
    assert_eq!(manager.state(), ConnectionState::Disconnected);
    assert_eq!(next_frame(&mut peer.ws).await.command, Command::Disconnect);

    // Worker is gone, so the live channel closes and nothing reconnects
    assert!(timeout(WAIT, rx.recv()).await.unwrap().is_none());
    assert!(timeout(Duration::from_millis(300), listener.accept()).await.is_err());
    assert_eq!(
        manager.send(SEND_DESTINATION, &json!({"content": "late"})),
        Err(SyncError::NotConnected)
    );
}

#[tokio::test]
async fn test_reconnects_after_server_close() {
    let (listener, settings) = listen().await;
    let manager = PushConnectionManager::new(settings);
    let (tx, _rx) = mpsc::channel(8);
    manager.connect("A1".to_string(), tx);

    let mut first = accept(&listener).await;
    establish(&mut first, "0,0").await;
    wait_for_state(&manager, ConnectionState::Connected).await;

    first.ws.close(None).await.unwrap();
    drop(first);

    let mut second = accept(&listener).await;
    assert_eq!(second.connect.get("Authorization"), Some("Bearer A1"));
    establish(&mut second, "0,0").await;
    wait_for_state(&manager, ConnectionState::Connected).await;

    manager.disconnect().await;
    assert_eq!(manager.state(), ConnectionState::Disconnected);
}

#[tokio::test]
async fn test_error_frame_triggers_reconnect() {
    let (listener, settings) = listen().await;
    let manager = PushConnectionManager::new(settings);
    let (tx, _rx) = mpsc::channel(8);
    manager.connect("expired".to_string(), tx);

    let mut rejected = accept(&listener).await;
    send_frame(
        &mut rejected.ws,
        Frame::new(Command::Error).header("message", "Invalid JWT token"),
    )
    .await;

    assert_ne!(manager.state(), ConnectionState::Connected);

    // A fresh attempt follows after the reconnect delay
    let retry = accept(&listener).await;
    assert_eq!(retry.connect.command, Command::Connect);

    manager.disconnect().await;
}

#[tokio::test]
async fn test_oversized_content_length_reconnects() {
    let (listener, settings) = listen().await;
    let manager = PushConnectionManager::new(settings);
    let (tx, _rx) = mpsc::channel(8);
    manager.connect("A1".to_string(), tx);

    let mut hostile = accept(&listener).await;
    establish(&mut hostile, "0,0").await;
    wait_for_state(&manager, ConnectionState::Connected).await;

    hostile
        .ws
        .send(WsMessage::Text("MESSAGE\ncontent-length:18446744073709551615\n\n\0".to_string()))
        .await
        .unwrap();

    // The bad frame is a protocol error, so the worker survives and retries
    let mut retry = accept(&listener).await;
    establish(&mut retry, "0,0").await;
    wait_for_state(&manager, ConnectionState::Connected).await;

    manager.disconnect().await;
    assert_eq!(manager.state(), ConnectionState::Disconnected);
}

#[tokio::test]
async fn test_heartbeats_and_liveness_timeout() {
    let (listener, mut settings) = listen().await;
    settings.heartbeat_outgoing = Duration::from_millis(100);
    settings.heartbeat_incoming = Duration::from_millis(100);
    let manager = PushConnectionManager::new(settings);
    let (tx, _rx) = mpsc::channel(8);
    manager.connect("A1".to_string(), tx);

    let mut silent = accept(&listener).await;
    assert_eq!(silent.connect.get("heart-beat"), Some("100,100"));
    establish(&mut silent, "100,100").await;

    // Client keeps its side alive with bare EOLs
    let beat = timeout(WAIT, silent.ws.next()).await.unwrap().unwrap().unwrap();
    assert_eq!(beat, WsMessage::Text("\n".to_string()));

    // The server never beats back, so the client gives up and reconnects
    let retry = accept(&listener).await;
    assert_eq!(retry.connect.command, Command::Connect);

    manager.disconnect().await;
}

#[tokio::test]
async fn test_disconnect_while_reconnecting() {
    let (listener, settings) = listen().await;
    let port = listener.local_addr().unwrap().port();
    drop(listener);

    let manager = PushConnectionManager::new(PushSettings {
        url: format!("ws://127.0.0.1:{}/ws", port),
        reconnect_delay: Duration::from_secs(30),
        ..settings
    });
    let (tx, mut rx) = mpsc::channel(8);
    manager.connect("A1".to_string(), tx);

    // Let the first attempt fail and park in the reconnect delay
    tokio::time::sleep(Duration::from_millis(200)).await;

    timeout(Duration::from_secs(2), manager.disconnect()).await.unwrap();
    assert_eq!(manager.state(), ConnectionState::Disconnected);
    assert!(timeout(WAIT, rx.recv()).await.unwrap().is_none());
}
