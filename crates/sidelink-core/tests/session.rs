use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message as WsMessage;

use sidelink_core::{MessageRouter, SessionConfig, SessionState, SidelinkError, WebSocketSession};
use sidelink_wire::{Audience, HelloBody, MessageBody, MessageType};

const ORIGINATOR: &str = "4242";

#[derive(Clone, Copy)]
enum Reply {
    Authorize(bool),
    Silent,
}

enum Command {
    Send(String),
    Close,
}

/// A sidecar stand-in that answers ACCESS_REQUEST and records every frame.
struct FakeSidecar {
    url: String,
    frames: mpsc::UnboundedReceiver<Value>,
    commands: mpsc::UnboundedSender<Command>,
}

impl FakeSidecar {
    async fn start(reply: Reply) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("ws://{}/ws", listener.local_addr().unwrap());
        let (frames_tx, frames) = mpsc::unbounded_channel();
        let (commands, commands_rx) = mpsc::unbounded_channel();
        tokio::spawn(serve(listener, reply, frames_tx, commands_rx));
        Self {
            url,
            frames,
            commands,
        }
    }

    async fn next_frame(&mut self) -> Value {
        tokio::time::timeout(Duration::from_secs(2), self.frames.recv())
            .await
            .expect("sidecar should receive a frame")
            .expect("sidecar stopped")
    }

    async fn next_frame_of(&mut self, message_type: &str) -> Value {
        loop {
            let frame = self.next_frame().await;
            if frame["headers"]["message_type"] == message_type {
                return frame;
            }
        }
    }

    fn push(&self, text: impl Into<String>) {
        self.commands.send(Command::Send(text.into())).unwrap();
    }

    fn close_socket(&self) {
        self.commands.send(Command::Close).unwrap();
    }
}

async fn serve(
    listener: TcpListener,
    reply: Reply,
    frames: mpsc::UnboundedSender<Value>,
    mut commands: mpsc::UnboundedReceiver<Command>,
) {
    loop {
        let Ok((tcp, _)) = listener.accept().await else {
            return;
        };
        let Ok(mut ws) = tokio_tungstenite::accept_async(tcp).await else {
            continue;
        };
        loop {
            tokio::select! {
                frame = ws.next() => match frame {
                    Some(Ok(WsMessage::Text(text))) => {
                        let value: Value = serde_json::from_str(&text).unwrap();
                        let is_access_request = value["headers"]["message_type"] == "ACCESS_REQUEST";
                        let _ = frames.send(value);
                        if let (true, Reply::Authorize(authorized)) = (is_access_request, reply) {
                            let _ = ws.send(WsMessage::Text(access_response(authorized))).await;
                        }
                    }
                    Some(Ok(WsMessage::Close(_))) | Some(Err(_)) | None => break,
                    Some(Ok(_)) => {}
                },
                command = commands.recv() => match command {
                    Some(Command::Send(text)) => {
                        let _ = ws.send(WsMessage::Text(text)).await;
                    }
                    Some(Command::Close) => {
                        let _ = ws.close(None).await;
                        break;
                    }
                    None => return,
                },
            }
        }
    }
}

fn sidecar_frame(message_type: &str, body: Value) -> String {
    json!({
        "headers": {
            "originator": "sidecar",
            "message_id": frame_id(message_type),
            "message_type": message_type,
            "audience": "workspaces"
        },
        "body": body
    })
    .to_string()
}

fn frame_id(seed: &str) -> String {
    format!("{}-{}", seed.to_lowercase(), std::process::id())
}

fn access_response(authorized: bool) -> String {
    sidecar_frame("ACCESS_RESPONSE", json!({ "authorized": authorized }))
}

fn connection_event(id: &str) -> String {
    sidecar_frame(
        "CONNECTION_EVENT",
        json!({
            "action": "UPDATED",
            "connection": { "id": id, "type": "DIRECT", "status": {} }
        }),
    )
}

fn session_for(sidecar: &FakeSidecar) -> WebSocketSession {
    session_with_timeout(sidecar, Duration::from_secs(2))
}

fn session_with_timeout(sidecar: &FakeSidecar, handshake_timeout: Duration) -> WebSocketSession {
    let config = SessionConfig::new(sidecar.url.clone())
        .with_originator(ORIGINATOR)
        .with_handshake_timeout(handshake_timeout)
        .with_heartbeat_interval(Duration::from_millis(100));
    WebSocketSession::new(config, MessageRouter::new())
}

async fn wait_for_state(session: &WebSocketSession, state: SessionState) {
    let mut rx = session.subscribe_state();
    tokio::time::timeout(Duration::from_secs(2), rx.wait_for(|s| *s == state))
        .await
        .expect("session should reach the expected state")
        .unwrap();
}

#[tokio::test]
async fn authorized_session_announces_itself_and_heartbeats() {
    let mut sidecar = FakeSidecar::start(Reply::Authorize(true)).await;
    let session = session_for(&sidecar);

    session.connect("secret-token").await.unwrap();
    assert!(session.is_connected());

    let request = sidecar.next_frame().await;
    assert_eq!(request["headers"]["message_type"], "ACCESS_REQUEST");
    assert_eq!(request["headers"]["audience"], "sidecar");
    assert_eq!(request["headers"]["originator"], ORIGINATOR);
    assert_eq!(request["body"]["access_token"], "secret-token");

    let announce = sidecar.next_frame().await;
    assert_eq!(announce["headers"]["message_type"], "WORKSPACE_HELLO");
    assert_eq!(announce["body"]["workspace_id"], ORIGINATOR);

    let heartbeat = sidecar.next_frame_of("HELLO").await;
    assert_eq!(heartbeat["headers"]["audience"], "workspaces");
    assert_eq!(heartbeat["body"]["workspace_id"], ORIGINATOR);
}

#[tokio::test]
async fn connect_is_idempotent_once_open() {
    let mut sidecar = FakeSidecar::start(Reply::Authorize(true)).await;
    let session = session_for(&sidecar);

    session.connect("t").await.unwrap();
    session.connect("t").await.unwrap();

    sidecar.next_frame_of("ACCESS_REQUEST").await;
    sidecar.next_frame_of("WORKSPACE_HELLO").await;
    for _ in 0..3 {
        let frame = sidecar.next_frame().await;
        assert_eq!(frame["headers"]["message_type"], "HELLO");
    }
}

#[tokio::test]
async fn rejected_access_closes_the_socket() {
    let sidecar = FakeSidecar::start(Reply::Authorize(false)).await;
    let session = session_for(&sidecar);

    let err = session.connect("bad-token").await.unwrap_err();
    assert!(matches!(err, SidelinkError::Unauthorized));
    assert_eq!(session.state(), SessionState::Disconnected);

    let hello = session.message(
        Audience::Workspaces,
        MessageBody::Hello(HelloBody {
            workspace_id: ORIGINATOR.to_string(),
        }),
    );
    assert!(matches!(
        session.send(&hello),
        Err(SidelinkError::NotConnected)
    ));
}

#[tokio::test]
async fn silent_sidecar_times_out_the_handshake() {
    let sidecar = FakeSidecar::start(Reply::Silent).await;
    let session = session_with_timeout(&sidecar, Duration::from_millis(200));

    let started = tokio::time::Instant::now();
    let err = session.connect("t").await.unwrap_err();
    assert!(matches!(err, SidelinkError::HandshakeTimeout(_)));
    assert!(started.elapsed() < Duration::from_secs(2));
    assert_eq!(session.state(), SessionState::Disconnected);
    assert_eq!(
        session.router().handler_count(MessageType::AccessResponse),
        0
    );

    // A reply that shows up after the deadline finds nobody listening.
    sidecar.push(access_response(true));
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!session.is_connected());
}

#[tokio::test]
async fn inbound_frames_reach_handlers_in_order_and_malformed_ones_are_dropped() {
    let sidecar = FakeSidecar::start(Reply::Authorize(true)).await;
    let session = session_for(&sidecar);

    let (seen_tx, mut seen) = mpsc::unbounded_channel();
    let _events = session
        .router()
        .subscribe(MessageType::ConnectionEvent, move |message| {
            let seen_tx = seen_tx.clone();
            async move {
                if let MessageBody::ConnectionEvent(event) = &message.body {
                    let _ = seen_tx.send(event.connection.id.clone());
                }
                Ok(())
            }
        });

    session.connect("t").await.unwrap();
    sidecar.push("{ definitely not json");
    sidecar.push(sidecar_frame("NOT_A_REAL_TYPE", json!({})));
    for id in ["c-A", "c-B", "c-C"] {
        sidecar.push(connection_event(id));
    }

    let mut order = Vec::new();
    for _ in 0..3 {
        let id = tokio::time::timeout(Duration::from_secs(2), seen.recv())
            .await
            .expect("event should be delivered")
            .unwrap();
        order.push(id);
    }
    assert_eq!(order, vec!["c-A", "c-B", "c-C"]);
    assert!(session.is_connected());
}

#[tokio::test]
async fn panicking_handler_keeps_the_push_path_alive() {
    let mut sidecar = FakeSidecar::start(Reply::Authorize(true)).await;
    let session = session_for(&sidecar);

    let calls = Arc::new(AtomicUsize::new(0));
    let (counts_tx, mut counts) = mpsc::unbounded_channel();
    let calls_h = calls.clone();
    let _counts = session
        .router()
        .subscribe(MessageType::WorkspaceCountChanged, move |message| {
            let first = calls_h.fetch_add(1, Ordering::SeqCst) == 0;
            let counts_tx = counts_tx.clone();
            async move {
                if first {
                    panic!("workspace count handler blew up");
                }
                if let MessageBody::WorkspaceCountChanged(body) = &message.body {
                    let _ = counts_tx.send(body.current_workspace_count);
                }
                Ok(())
            }
        });

    session.connect("t").await.unwrap();
    sidecar.next_frame_of("WORKSPACE_HELLO").await;
    sidecar.push(sidecar_frame(
        "WORKSPACE_COUNT_CHANGED",
        json!({ "current_workspace_count": 1 }),
    ));
    sidecar.push(sidecar_frame(
        "WORKSPACE_COUNT_CHANGED",
        json!({ "current_workspace_count": 2 }),
    ));

    let delivered = tokio::time::timeout(Duration::from_secs(2), counts.recv())
        .await
        .expect("the frame after the panic should still be delivered")
        .unwrap();
    assert_eq!(delivered, 2);
    assert_eq!(calls.load(Ordering::SeqCst), 2);
    assert!(session.is_connected());
    assert_eq!(session.state(), SessionState::Connected);

    // The socket is still live in both directions.
    sidecar.next_frame_of("HELLO").await;
}

#[tokio::test]
async fn sidecar_close_runs_callbacks_and_allows_reconnect() {
    let mut sidecar = FakeSidecar::start(Reply::Authorize(true)).await;
    let session = session_for(&sidecar);
    session.connect("first").await.unwrap();
    sidecar.next_frame_of("ACCESS_REQUEST").await;

    let (closed_tx, closed_rx) = tokio::sync::oneshot::channel();
    session.on_close(move || {
        let _ = closed_tx.send(());
    });

    sidecar.close_socket();
    tokio::time::timeout(Duration::from_secs(2), closed_rx)
        .await
        .expect("close callback should run")
        .unwrap();
    wait_for_state(&session, SessionState::Disconnected).await;

    session.connect("second").await.unwrap();
    assert!(session.is_connected());
    let again = sidecar.next_frame_of("ACCESS_REQUEST").await;
    assert_eq!(again["body"]["access_token"], "second");
}

#[tokio::test]
async fn client_close_disconnects_and_refuses_sends() {
    let sidecar = FakeSidecar::start(Reply::Authorize(true)).await;
    let session = session_for(&sidecar);
    session.connect("t").await.unwrap();

    let (closed_tx, closed_rx) = tokio::sync::oneshot::channel();
    session.on_close(move || {
        let _ = closed_tx.send(());
    });

    assert!(session.close());
    assert!(!session.is_connected());
    closed_rx.await.unwrap();

    let hello = session.message(
        Audience::Workspaces,
        MessageBody::Hello(HelloBody {
            workspace_id: ORIGINATOR.to_string(),
        }),
    );
    assert!(matches!(
        session.send(&hello),
        Err(SidelinkError::NotConnected)
    ));
    assert!(!session.close());
}
