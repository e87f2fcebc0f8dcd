use futures_util::{SinkExt, Stream, StreamExt};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, sleep_until, Instant};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::{header::AUTHORIZATION, HeaderValue};
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tracing::{debug, info, warn};

use super::models::Message;
use super::stomp::{heartbeat_header, negotiate_heartbeat, parse_frames, Command, Frame};
use crate::config::ClientConfig;
use crate::error::{Result, SyncError};

/// Topic every room's messages are broadcast on
pub const BROADCAST_TOPIC: &str = "/topic/messages";
/// Per-user private queue
pub const PRIVATE_QUEUE: &str = "/user/queue/private";
/// Application route for outbound chat messages
pub const SEND_DESTINATION: &str = "/app/chat.send";

/// State of the push connection. Only the connection manager changes it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Errored,
}

impl ConnectionState {
    pub fn is_connected(&self) -> bool {
        matches!(self, ConnectionState::Connected)
    }
}

/// What the message sync core needs from the push channel
pub trait PushChannel: Send + Sync {
    fn state(&self) -> ConnectionState;

    /// Fire-and-forget publish. Fails with `NotConnected` unless connected.
    fn send(&self, destination: &str, payload: &serde_json::Value) -> Result<()>;
}

#[derive(Debug, Clone)]
pub struct PushSettings {
    pub url: String,
    pub reconnect_delay: Duration,
    pub heartbeat_outgoing: Duration,
    pub heartbeat_incoming: Duration,
    pub handshake_timeout: Duration,
}

impl PushSettings {
    pub fn from_config(config: &ClientConfig) -> Self {
        Self {
            url: config.push_url(),
            reconnect_delay: config.reconnect_delay,
            heartbeat_outgoing: config.heartbeat_outgoing,
            heartbeat_incoming: config.heartbeat_incoming,
            handshake_timeout: config.request_timeout,
        }
    }

    fn host(&self) -> String {
        url::Url::parse(&self.url)
            .ok()
            .and_then(|u| {
                let host = u.host_str()?.to_string();
                Some(match u.port() {
                    Some(port) => format!("{}:{}", host, port),
                    None => host,
                })
            })
            .unwrap_or_else(|| "localhost".to_string())
    }
}

enum Outbound {
    Publish { destination: String, body: String },
    Shutdown,
}

enum SessionEnd {
    /// Local disconnect or consumer gone: do not reconnect
    Shutdown,
    /// Server closed the socket
    Closed,
}

struct Worker {
    commands: mpsc::UnboundedSender<Outbound>,
    handle: JoinHandle<()>,
}

/// Owns the single push connection: handshake, subscriptions, heart-beats
/// and reconnection.
pub struct PushConnectionManager {
    settings: PushSettings,
    state: Arc<watch::Sender<ConnectionState>>,
    worker: Mutex<Option<Worker>>,
}

impl PushConnectionManager {
    pub fn new(settings: PushSettings) -> Self {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            settings,
            state: Arc::new(state),
            worker: Mutex::new(None),
        }
    }

    /// Watch connection state changes, e.g. for a status indicator
    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    /// Start the connection. Live messages from both subscriptions go to `sink`.
    ///
    /// No-op while a connection (or connection attempt) is already active.
    pub fn connect(&self, token: String, sink: mpsc::Sender<Message>) {
        let mut worker = self.worker.lock().unwrap_or_else(|p| p.into_inner());
        if let Some(active) = worker.as_ref() {
            if !active.handle.is_finished() {
                debug!("Push connection already active, ignoring connect");
                return;
            }
        }

        let (commands, receiver) = mpsc::unbounded_channel();
        let handle = tokio::spawn(run_connection(
            self.settings.clone(),
            token,
            sink,
            receiver,
            self.state.clone(),
        ));
        *worker = Some(Worker { commands, handle });
    }

    /// Tear the connection down. Safe to call when already disconnected.
    pub async fn disconnect(&self) {
        let worker = self.worker.lock().unwrap_or_else(|p| p.into_inner()).take();

        if let Some(Worker { commands, mut handle }) = worker {
            let _ = commands.send(Outbound::Shutdown);
            drop(commands);
            if tokio::time::timeout(Duration::from_secs(1), &mut handle).await.is_err() {
                debug!("Push worker did not stop in time, aborting");
                handle.abort();
                // Wait for the aborted task to drop so its state guard runs now
                let _ = handle.await;
            }
            info!("Push channel disconnected");
        }

        self.state.send_replace(ConnectionState::Disconnected);
    }
}

impl PushChannel for PushConnectionManager {
    fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    fn send(&self, destination: &str, payload: &serde_json::Value) -> Result<()> {
        if !self.state().is_connected() {
            warn!("Push channel is not connected, dropping send to {}", destination);
            return Err(SyncError::NotConnected);
        }

        let body = serde_json::to_string(payload)?;
        let worker = self.worker.lock().unwrap_or_else(|p| p.into_inner());
        let commands = worker.as_ref().map(|w| &w.commands).ok_or(SyncError::NotConnected)?;
        commands
            .send(Outbound::Publish {
                destination: destination.to_string(),
                body,
            })
            .map_err(|_| SyncError::NotConnected)
    }
}

/// Leaves the state at `Disconnected` however the worker ends, panics included
struct StateGuard(Arc<watch::Sender<ConnectionState>>);

impl Drop for StateGuard {
    fn drop(&mut self) {
        self.0.send_if_modified(|state| {
            let changed = *state != ConnectionState::Disconnected;
            *state = ConnectionState::Disconnected;
            changed
        });
    }
}

async fn run_connection(
    settings: PushSettings,
    token: String,
    sink: mpsc::Sender<Message>,
    mut commands: mpsc::UnboundedReceiver<Outbound>,
    state: Arc<watch::Sender<ConnectionState>>,
) {
    let _guard = StateGuard(state.clone());

    loop {
        state.send_replace(ConnectionState::Connecting);
        debug!("Connecting push channel to {}", settings.url);

        match run_session(&settings, &token, &sink, &mut commands, &state).await {
            Ok(SessionEnd::Shutdown) => {
                state.send_replace(ConnectionState::Disconnected);
                return;
            }
            Ok(SessionEnd::Closed) => {
                info!("Push channel closed by server");
            }
            Err(e) => {
                warn!("Push channel error: {}", e);
                state.send_replace(ConnectionState::Errored);
            }
        }
        state.send_replace(ConnectionState::Disconnected);

        info!("Reconnecting push channel in {:?}", settings.reconnect_delay);
        let reconnect = tokio::time::sleep(settings.reconnect_delay);
        tokio::select! {
            _ = reconnect => {}
            _ = wait_for_shutdown(&mut commands) => {
                debug!("Shutdown requested while waiting to reconnect");
                return;
            }
        }
    }
}

/// Resolves once a shutdown is requested or the manager is gone.
/// Publishes seen meanwhile are dropped; senders check state first.
async fn wait_for_shutdown(commands: &mut mpsc::UnboundedReceiver<Outbound>) {
    loop {
        match commands.recv().await {
            Some(Outbound::Publish { destination, .. }) => {
                warn!("Dropping publish to {} while not connected", destination);
            }
            Some(Outbound::Shutdown) | None => return,
        }
    }
}

async fn run_session(
    settings: &PushSettings,
    token: &str,
    sink: &mpsc::Sender<Message>,
    commands: &mut mpsc::UnboundedReceiver<Outbound>,
    state: &watch::Sender<ConnectionState>,
) -> Result<SessionEnd> {
    let mut request = settings.url.as_str().into_client_request()?;
    let bearer = HeaderValue::from_str(&format!("Bearer {}", token))
        .map_err(|e| SyncError::Connection(format!("invalid token for header: {}", e)))?;
    request.headers_mut().insert(AUTHORIZATION, bearer);

    let handshake = async {
        let (ws, _) = connect_async(request).await?;
        let (mut write, mut read) = ws.split();

        let connect = Frame::new(Command::Connect)
            .header("accept-version", "1.2")
            .header("host", settings.host())
            .header("Authorization", format!("Bearer {}", token))
            .header(
                "heart-beat",
                heartbeat_header(settings.heartbeat_outgoing, settings.heartbeat_incoming),
            );
        write.send(WsMessage::Text(connect.encode())).await?;

        let connected = read_connected(&mut read).await?;
        Ok::<_, SyncError>((write, read, connected))
    };

    let (mut write, mut read, connected) = tokio::select! {
        result = tokio::time::timeout(settings.handshake_timeout, handshake) => match result {
            Ok(result) => result?,
            Err(_) => return Err(SyncError::Connection("handshake timed out".to_string())),
        },
        _ = wait_for_shutdown(commands) => return Ok(SessionEnd::Shutdown),
    };

    let (send_every, expect_every) = negotiate_heartbeat(
        settings.heartbeat_outgoing,
        settings.heartbeat_incoming,
        connected.get("heart-beat"),
    );

    for (index, destination) in [BROADCAST_TOPIC, PRIVATE_QUEUE].iter().enumerate() {
        let subscribe = Frame::new(Command::Subscribe)
            .header("id", format!("sub-{}", index))
            .header("destination", *destination);
        write.send(WsMessage::Text(subscribe.encode())).await?;
    }

    state.send_replace(ConnectionState::Connected);
    info!("Push channel connected (heart-beat send {:?}, receive {:?})", send_every, expect_every);

    let beat = send_every.unwrap_or(Duration::from_secs(3600));
    let mut heartbeat = interval_at(Instant::now() + beat, beat);
    // Allow the server twice its interval before declaring the link dead
    let silence_limit = expect_every.map(|d| d * 2);
    let mut last_inbound = Instant::now();

    loop {
        tokio::select! {
            incoming = read.next() => match incoming {
                Some(Ok(WsMessage::Text(text))) => {
                    last_inbound = Instant::now();
                    for frame in parse_frames(&text)? {
                        if !deliver(frame, sink).await? {
                            debug!("Live message consumer is gone, closing push channel");
                            let _ = write.close().await;
                            return Ok(SessionEnd::Shutdown);
                        }
                    }
                }
                Some(Ok(WsMessage::Close(_))) | None => return Ok(SessionEnd::Closed),
                Some(Ok(_)) => last_inbound = Instant::now(),
                Some(Err(e)) => return Err(e.into()),
            },
            command = commands.recv() => match command {
                Some(Outbound::Publish { destination, body }) => {
                    let frame = Frame::new(Command::Send)
                        .header("destination", destination)
                        .header("content-type", "application/json")
                        .with_body(body);
                    write.send(WsMessage::Text(frame.encode())).await?;
                }
                Some(Outbound::Shutdown) | None => {
                    let _ = write.send(WsMessage::Text(Frame::new(Command::Disconnect).encode())).await;
                    let _ = write.close().await;
                    return Ok(SessionEnd::Shutdown);
                }
            },
            _ = heartbeat.tick(), if send_every.is_some() => {
                write.send(WsMessage::Text("\n".to_string())).await?;
            }
            _ = sleep_until(last_inbound + silence_limit.unwrap_or_default()), if silence_limit.is_some() => {
                return Err(SyncError::Connection("server heart-beat missed".to_string()));
            }
        }
    }
}

async fn read_connected<S>(read: &mut S) -> Result<Frame>
where
    S: Stream<Item = std::result::Result<WsMessage, tokio_tungstenite::tungstenite::Error>> + Unpin,
{
    while let Some(incoming) = read.next().await {
        let WsMessage::Text(text) = incoming? else {
            continue;
        };
        for frame in parse_frames(&text)? {
            match frame.command {
                Command::Connected => return Ok(frame),
                Command::Error => return Err(stomp_error(&frame)),
                other => debug!("Ignoring {} before CONNECTED", other.as_str()),
            }
        }
    }
    Err(SyncError::Connection("socket closed during handshake".to_string()))
}

/// Hand a frame to the consumer. Returns false once the consumer is gone.
async fn deliver(frame: Frame, sink: &mpsc::Sender<Message>) -> Result<bool> {
    match frame.command {
        Command::Message => match serde_json::from_str::<Message>(&frame.body) {
            Ok(message) => {
                debug!("Live message {} from {}", message.id, message.sender);
                Ok(sink.send(message).await.is_ok())
            }
            Err(e) => {
                warn!("Failed to parse live message: {}", e);
                Ok(true)
            }
        },
        Command::Error => Err(stomp_error(&frame)),
        other => {
            debug!("Ignoring {} frame", other.as_str());
            Ok(true)
        }
    }
}

fn stomp_error(frame: &Frame) -> SyncError {
    let detail = frame
        .get("message")
        .map(str::to_string)
        .filter(|m| !m.is_empty())
        .unwrap_or_else(|| frame.body.trim().to_string());
    SyncError::Connection(format!("server error: {}", detail))
}
