//! The one persistent WebSocket to the sidecar.
//!
//! A session owns at most one socket at a time. After the transport opens it
//! authorizes itself with ACCESS_REQUEST and waits for ACCESS_RESPONSE; only
//! then does it count as connected and start heartbeating. Inbound frames are
//! decoded and handed to the [`MessageRouter`] in arrival order.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use futures_util::{Sink, SinkExt, Stream, StreamExt};
use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_tungstenite::tungstenite::{self, Message as WsMessage};
use tracing::{debug, info, trace, warn, Level};

use sidelink_observability::{emit_event, redact_text, ObservabilityEvent, ProcessKind};
use sidelink_wire::{
    AccessRequestBody, Audience, HelloBody, Message, MessageBody, MessageType,
    DEFAULT_MAX_PAYLOAD_BYTES,
};

use crate::config::ClientConfig;
use crate::error::{Result, SidelinkError};
use crate::router::{MessageRouter, Subscription};

const COMPONENT: &str = "session";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Disconnected,
    Connecting,
    Handshaking,
    Connected,
}

impl SessionState {
    pub fn as_str(self) -> &'static str {
        match self {
            SessionState::Disconnected => "disconnected",
            SessionState::Connecting => "connecting",
            SessionState::Handshaking => "handshaking",
            SessionState::Connected => "connected",
        }
    }

    /// Frames may be written once the transport is open, which includes the
    /// handshake itself.
    fn can_send(self) -> bool {
        matches!(self, SessionState::Handshaking | SessionState::Connected)
    }
}

#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub url: String,
    /// Identity stamped on every outbound frame. Defaults to the process id.
    pub originator: String,
    pub handshake_timeout: Duration,
    pub heartbeat_interval: Duration,
    pub max_payload_bytes: usize,
}

impl SessionConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            originator: std::process::id().to_string(),
            handshake_timeout: Duration::from_secs(5),
            heartbeat_interval: Duration::from_secs(5),
            max_payload_bytes: DEFAULT_MAX_PAYLOAD_BYTES,
        }
    }

    pub fn from_client_config(config: &ClientConfig) -> Self {
        Self {
            url: config.websocket_url(),
            originator: std::process::id().to_string(),
            handshake_timeout: config.handshake_timeout(),
            heartbeat_interval: config.heartbeat_interval(),
            max_payload_bytes: config.max_payload_bytes,
        }
    }

    pub fn with_originator(mut self, originator: impl Into<String>) -> Self {
        self.originator = originator.into();
        self
    }

    pub fn with_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }
}

type CloseCallback = Box<dyn FnOnce() + Send>;

struct ActiveSocket {
    generation: u64,
    outbound: mpsc::UnboundedSender<WsMessage>,
    reader: JoinHandle<()>,
    writer: JoinHandle<()>,
    heartbeat: Option<JoinHandle<()>>,
}

impl ActiveSocket {
    /// Stop reading and heartbeating. Dropping `outbound` lets the writer
    /// flush what is queued, send a close frame and exit.
    fn shutdown(self) {
        self.reader.abort();
        if let Some(heartbeat) = self.heartbeat {
            heartbeat.abort();
        }
        drop(self.outbound);
        drop(self.writer);
    }
}

struct SessionInner {
    config: SessionConfig,
    router: MessageRouter,
    socket: Mutex<Option<ActiveSocket>>,
    state: watch::Sender<SessionState>,
    connect_lock: tokio::sync::Mutex<()>,
    close_callbacks: Mutex<Vec<CloseCallback>>,
    next_generation: AtomicU64,
    protocol_errors: Subscription,
}

impl SessionInner {
    fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    /// Drop the socket for `generation` (or whichever is live when `None`),
    /// run the disposal callbacks and return to `Disconnected`. Returns false
    /// when there was nothing to tear down.
    fn teardown(&self, generation: Option<u64>, reason: &str) -> bool {
        let socket = {
            let mut slot = self.socket.lock();
            match slot.as_ref() {
                Some(active) if generation.map_or(true, |g| g == active.generation) => slot.take(),
                _ => None,
            }
        };
        let Some(socket) = socket else {
            return false;
        };
        let generation = socket.generation;
        socket.shutdown();
        self.state.send_replace(SessionState::Disconnected);

        let callbacks = std::mem::take(&mut *self.close_callbacks.lock());
        for callback in callbacks {
            callback();
        }

        emit_event(
            Level::INFO,
            ProcessKind::Client,
            ObservabilityEvent {
                event: "session.closed",
                component: COMPONENT,
                status: Some("disconnected"),
                detail: Some(reason),
                ..Default::default()
            },
        );
        debug!(generation, reason, "sidecar socket torn down");
        true
    }
}

impl Drop for SessionInner {
    fn drop(&mut self) {
        self.protocol_errors.dispose();
        if let Some(socket) = self.socket.get_mut().take() {
            socket.shutdown();
        }
    }
}

#[derive(Clone)]
pub struct WebSocketSession {
    inner: Arc<SessionInner>,
}

impl WebSocketSession {
    pub fn new(config: SessionConfig, router: MessageRouter) -> Self {
        let protocol_errors = router.subscribe(MessageType::ProtocolError, |message| async move {
            if let MessageBody::ProtocolError(body) = &message.body {
                warn!(
                    originator = %message.headers.originator,
                    original_message_id = body.original_message_id.as_deref().unwrap_or(""),
                    error = %body.error,
                    "sidecar reported a protocol error"
                );
            }
            Ok(())
        });
        let (state, _) = watch::channel(SessionState::Disconnected);
        Self {
            inner: Arc::new(SessionInner {
                config,
                router,
                socket: Mutex::new(None),
                state,
                connect_lock: tokio::sync::Mutex::new(()),
                close_callbacks: Mutex::new(Vec::new()),
                next_generation: AtomicU64::new(1),
                protocol_errors,
            }),
        }
    }

    pub fn originator(&self) -> &str {
        &self.inner.config.originator
    }

    pub fn router(&self) -> &MessageRouter {
        &self.inner.router
    }

    pub fn state(&self) -> SessionState {
        self.inner.state()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<SessionState> {
        self.inner.state.subscribe()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == SessionState::Connected
    }

    /// Build a frame stamped with this session's originator.
    pub fn message(&self, audience: Audience, body: MessageBody) -> Message {
        Message::new(self.inner.config.originator.clone(), audience, body)
    }

    /// Register a callback to run the next time the socket goes away, whether
    /// the sidecar closed it or [`close`](Self::close) was called.
    pub fn on_close<F>(&self, callback: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.inner.close_callbacks.lock().push(Box::new(callback));
    }

    /// Tear the socket down. Returns false if there was none.
    pub fn close(&self) -> bool {
        self.inner.teardown(None, "closed by client")
    }

    /// Queue `message` on the open socket. Never waits and never retries.
    pub fn send(&self, message: &Message) -> Result<()> {
        let expected = &self.inner.config.originator;
        if message.headers.originator != *expected {
            return Err(SidelinkError::OriginatorMismatch {
                expected: expected.clone(),
                found: message.headers.originator.clone(),
            });
        }
        let frame = message.encode(self.inner.config.max_payload_bytes)?;

        if !self.state().can_send() {
            return Err(SidelinkError::NotConnected);
        }
        let slot = self.inner.socket.lock();
        let socket = slot.as_ref().ok_or(SidelinkError::NotConnected)?;
        socket
            .outbound
            .send(WsMessage::Text(frame))
            .map_err(|_| SidelinkError::NotConnected)?;
        trace!(
            message_type = %message.message_type(),
            message_id = %message.headers.message_id,
            "frame queued"
        );
        Ok(())
    }

    /// Open and authorize the socket. Resolves immediately when already
    /// connected; concurrent callers share one attempt.
    pub async fn connect(&self, access_token: &str) -> Result<()> {
        let _guard = self.inner.connect_lock.lock().await;
        if self.is_connected() {
            return Ok(());
        }
        self.inner.teardown(None, "stale socket replaced");
        self.inner.state.send_replace(SessionState::Connecting);

        let config = &self.inner.config;
        info!(url = %config.url, "connecting to sidecar");
        let stream = match tokio_tungstenite::connect_async(config.url.as_str()).await {
            Ok((stream, _)) => stream,
            Err(err) => {
                self.inner.state.send_replace(SessionState::Disconnected);
                self.report_handshake_failure("transport", &err.to_string());
                return Err(err.into());
            }
        };

        let generation = self.inner.next_generation.fetch_add(1, Ordering::Relaxed);
        let (write, read) = stream.split();
        let (outbound, outbound_rx) = mpsc::unbounded_channel();
        let writer = tokio::spawn(write_loop(write, outbound_rx));
        let reader = tokio::spawn(read_loop(
            read,
            self.inner.router.clone(),
            Arc::downgrade(&self.inner),
            generation,
        ));
        *self.inner.socket.lock() = Some(ActiveSocket {
            generation,
            outbound,
            reader,
            writer,
            heartbeat: None,
        });
        self.inner.state.send_replace(SessionState::Handshaking);

        match self.handshake(access_token, generation).await {
            Ok(()) => Ok(()),
            Err(err) => {
                self.inner.teardown(Some(generation), "handshake failed");
                self.report_handshake_failure(error_code(&err), &err.to_string());
                Err(err)
            }
        }
    }

    async fn handshake(&self, access_token: &str, generation: u64) -> Result<()> {
        let config = &self.inner.config;

        // The listener must exist before the request leaves, or a fast reply
        // would find nobody waiting.
        let (reply_tx, reply_rx) = oneshot::channel::<bool>();
        let reply_tx = Arc::new(Mutex::new(Some(reply_tx)));
        let reply = self
            .inner
            .router
            .once(MessageType::AccessResponse, move |message| {
                let reply_tx = reply_tx.clone();
                async move {
                    if let MessageBody::AccessResponse(body) = &message.body {
                        if let Some(tx) = reply_tx.lock().take() {
                            let _ = tx.send(body.authorized);
                        }
                    }
                    Ok(())
                }
            });

        debug!(token = %redact_text(access_token), "sending access request");
        let request = self.message(
            Audience::Sidecar,
            MessageBody::AccessRequest(AccessRequestBody {
                access_token: access_token.to_string(),
            }),
        );
        if let Err(err) = self.send(&request) {
            reply.dispose();
            return Err(err);
        }

        let mut state_rx = self.inner.state.subscribe();
        let outcome = tokio::time::timeout(config.handshake_timeout, async {
            tokio::select! {
                biased;
                authorized = reply_rx => authorized.ok(),
                _ = disconnected(&mut state_rx) => None,
            }
        })
        .await;

        let authorized = match outcome {
            Ok(Some(authorized)) => authorized,
            Ok(None) => {
                reply.dispose();
                return Err(SidelinkError::HandshakeAborted);
            }
            Err(_) => {
                reply.dispose();
                return Err(SidelinkError::HandshakeTimeout(config.handshake_timeout));
            }
        };
        if !authorized {
            return Err(SidelinkError::Unauthorized);
        }

        {
            let mut slot = self.inner.socket.lock();
            match slot.as_mut() {
                Some(active) if active.generation == generation => {
                    active.heartbeat = Some(spawn_heartbeat(
                        active.outbound.clone(),
                        config.originator.clone(),
                        config.heartbeat_interval,
                        config.max_payload_bytes,
                    ));
                    self.inner.state.send_replace(SessionState::Connected);
                }
                _ => return Err(SidelinkError::HandshakeAborted),
            }
        }

        let announce = self.message(
            Audience::Sidecar,
            MessageBody::WorkspaceHello(HelloBody {
                workspace_id: config.originator.clone(),
            }),
        );
        if let Err(err) = self.send(&announce) {
            warn!(error = %err, "could not announce workspace");
        }

        emit_event(
            Level::INFO,
            ProcessKind::Client,
            ObservabilityEvent {
                event: "session.authorized",
                component: COMPONENT,
                message_id: Some(&request.headers.message_id),
                status: Some("connected"),
                ..Default::default()
            },
        );
        Ok(())
    }

    fn report_handshake_failure(&self, code: &str, detail: &str) {
        emit_event(
            Level::WARN,
            ProcessKind::Client,
            ObservabilityEvent {
                event: "session.handshake_failed",
                component: COMPONENT,
                status: Some(self.state().as_str()),
                error_code: Some(code),
                detail: Some(detail),
                ..Default::default()
            },
        );
    }
}

async fn disconnected(state: &mut watch::Receiver<SessionState>) {
    let _ = state
        .wait_for(|state| *state == SessionState::Disconnected)
        .await;
}

fn error_code(err: &SidelinkError) -> &'static str {
    match err {
        SidelinkError::HandshakeTimeout(_) => "timeout",
        SidelinkError::Unauthorized => "unauthorized",
        SidelinkError::HandshakeAborted => "aborted",
        SidelinkError::NotConnected => "not_connected",
        _ => "other",
    }
}

async fn write_loop<S>(mut write: S, mut outbound: mpsc::UnboundedReceiver<WsMessage>)
where
    S: Sink<WsMessage, Error = tungstenite::Error> + Unpin,
{
    while let Some(frame) = outbound.recv().await {
        if let Err(err) = write.send(frame).await {
            warn!(error = %err, "sidecar socket write failed");
            return;
        }
    }
    let _ = write.close().await;
}

/// Tears its socket generation down when the reader exits, however it exits.
struct ReaderExit {
    session: Weak<SessionInner>,
    generation: u64,
    reason: &'static str,
}

impl Drop for ReaderExit {
    fn drop(&mut self) {
        let reason = if std::thread::panicking() {
            "reader panicked"
        } else {
            self.reason
        };
        if let Some(session) = self.session.upgrade() {
            session.teardown(Some(self.generation), reason);
        }
    }
}

async fn read_loop<S>(
    mut read: S,
    router: MessageRouter,
    session: Weak<SessionInner>,
    generation: u64,
) where
    S: Stream<Item = std::result::Result<WsMessage, tungstenite::Error>> + Unpin,
{
    let mut exit = ReaderExit {
        session,
        generation,
        reason: "transport closed",
    };
    while let Some(frame) = read.next().await {
        match frame {
            Ok(WsMessage::Text(text)) => match Message::decode(&text) {
                Ok(message) => {
                    router.deliver(message).await;
                }
                Err(err) => warn!(error = %err, "dropping malformed frame"),
            },
            Ok(WsMessage::Close(frame)) => {
                debug!(?frame, "sidecar closed the socket");
                break;
            }
            Ok(_) => {}
            Err(err) => {
                warn!(error = %err, "sidecar socket error");
                exit.reason = "transport error";
                break;
            }
        }
    }
}

fn spawn_heartbeat(
    outbound: mpsc::UnboundedSender<WsMessage>,
    originator: String,
    period: Duration,
    max_payload_bytes: usize,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticks = tokio::time::interval_at(Instant::now() + period, period);
        ticks.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticks.tick().await;
            let hello = Message::new(
                originator.clone(),
                Audience::Workspaces,
                MessageBody::Hello(HelloBody {
                    workspace_id: originator.clone(),
                }),
            );
            let frame = match hello.encode(max_payload_bytes) {
                Ok(frame) => frame,
                Err(err) => {
                    warn!(error = %err, "heartbeat could not be encoded");
                    return;
                }
            };
            if outbound.send(WsMessage::Text(frame)).is_err() {
                return;
            }
            trace!("heartbeat sent");
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn send_without_socket_is_refused() {
        let session = WebSocketSession::new(
            SessionConfig::new("ws://127.0.0.1:9/ws").with_originator("42"),
            MessageRouter::new(),
        );
        let hello = session.message(
            Audience::Workspaces,
            MessageBody::Hello(HelloBody {
                workspace_id: "42".to_string(),
            }),
        );
        assert!(matches!(
            session.send(&hello),
            Err(SidelinkError::NotConnected)
        ));
        assert!(!session.is_connected());
        assert!(!session.close());
    }

    #[tokio::test]
    async fn originator_mismatch_is_checked_before_the_socket() {
        let session = WebSocketSession::new(
            SessionConfig::new("ws://127.0.0.1:9/ws").with_originator("42"),
            MessageRouter::new(),
        );
        let foreign = Message::new(
            "7",
            Audience::Workspaces,
            MessageBody::Hello(HelloBody {
                workspace_id: "7".to_string(),
            }),
        );
        let err = session.send(&foreign).unwrap_err();
        assert!(matches!(
            err,
            SidelinkError::OriginatorMismatch { ref expected, ref found }
                if expected == "42" && found == "7"
        ));
    }

    #[tokio::test]
    async fn failed_transport_leaves_session_disconnected() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let session = WebSocketSession::new(
            SessionConfig::new(format!("ws://{addr}/ws")),
            MessageRouter::new(),
        );
        let err = session.connect("token").await.unwrap_err();
        assert!(matches!(err, SidelinkError::Transport(_)));
        assert_eq!(session.state(), SessionState::Disconnected);
    }

    #[tokio::test]
    async fn panicking_reader_still_tears_down_its_generation() {
        let session = WebSocketSession::new(
            SessionConfig::new("ws://127.0.0.1:9/ws"),
            MessageRouter::new(),
        );
        let (release, parked) = oneshot::channel::<()>();
        let read = futures_util::stream::once(parked).map(
            |_| -> std::result::Result<WsMessage, tungstenite::Error> { panic!("reader blew up") },
        );
        let reader = tokio::spawn(read_loop(
            read,
            session.router().clone(),
            Arc::downgrade(&session.inner),
            7,
        ));
        let (outbound, _outbound_rx) = mpsc::unbounded_channel();
        *session.inner.socket.lock() = Some(ActiveSocket {
            generation: 7,
            outbound,
            reader,
            writer: tokio::spawn(async {}),
            heartbeat: None,
        });
        session.inner.state.send_replace(SessionState::Connected);

        let (closed_tx, closed_rx) = oneshot::channel();
        session.on_close(move || {
            let _ = closed_tx.send(());
        });
        release.send(()).unwrap();

        tokio::time::timeout(Duration::from_secs(1), closed_rx)
            .await
            .expect("reader exit should tear the socket down")
            .unwrap();
        assert_eq!(session.state(), SessionState::Disconnected);
        assert!(session.inner.socket.lock().is_none());
    }

    #[test]
    fn protocol_error_handler_is_registered_for_the_session_lifetime() {
        let router = MessageRouter::new();
        let session = WebSocketSession::new(SessionConfig::new("ws://127.0.0.1:9/ws"), router.clone());
        assert_eq!(router.handler_count(MessageType::ProtocolError), 1);
        drop(session);
        assert_eq!(router.handler_count(MessageType::ProtocolError), 0);
    }
}
