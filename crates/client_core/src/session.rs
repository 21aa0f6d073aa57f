//! Transport session manager: owns the single persistent connection, its
//! state machine and the bounded reconnect loop. Everything else only reads
//! the session state and subscribes to its events.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::{
    stream::{SplitSink, SplitStream},
    SinkExt, StreamExt,
};
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio_tungstenite::{
    connect_async, tungstenite::Message as WsMessage, MaybeTlsStream, WebSocketStream,
};
use tracing::{debug, info, warn};

use shared::domain::{PeerId, SessionState};
use shared::protocol::{ClientFrame, ServerFrame};

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("unsupported transport origin {0:?}")]
    Origin(String),
    #[error("socket connect failed: {0}")]
    Connect(String),
    #[error("socket send failed: {0}")]
    Send(String),
    #[error("socket receive failed: {0}")]
    Receive(String),
}

/// Events fanned out to the presence tracker and the sync engine.
#[derive(Debug, Clone)]
pub enum SessionEvent {
    Connected,
    /// The connection dropped; a reconnect may follow. Presence is invalid
    /// from this moment until the next authoritative snapshot.
    ConnectionLost,
    Reconnecting { attempt: u32 },
    /// Terminal: reconnection exhausted or the session was torn down.
    Disconnected,
    Frame(ServerFrame),
}

/// Write half of a live connection.
#[async_trait]
pub trait SocketSink: Send {
    async fn send(&mut self, frame: ClientFrame) -> Result<(), SessionError>;
}

/// Read half of a live connection. `None` means the peer closed cleanly.
#[async_trait]
pub trait SocketStream: Send {
    async fn next_frame(&mut self) -> Option<Result<ServerFrame, SessionError>>;
}

/// Injection seam for the socket implementation, so tests can substitute a
/// fake transport for the real websocket.
#[async_trait]
pub trait SocketConnector: Send + Sync {
    async fn connect(
        &self,
        url: &str,
    ) -> Result<(Box<dyn SocketSink>, Box<dyn SocketStream>), SessionError>;
}

pub struct SessionManager {
    socket_url: String,
    reconnect_attempts: u32,
    reconnect_delay: Duration,
    connector: Arc<dyn SocketConnector>,
    state: RwLock<SessionState>,
    events: broadcast::Sender<SessionEvent>,
    outbound: Mutex<Option<mpsc::Sender<ClientFrame>>>,
    identity: Mutex<Option<String>>,
    joined_room: Mutex<Option<String>>,
    run_task: Mutex<Option<JoinHandle<()>>>,
}

impl SessionManager {
    pub fn new(
        socket_url: impl Into<String>,
        connector: Arc<dyn SocketConnector>,
        reconnect_attempts: u32,
        reconnect_delay: Duration,
    ) -> Arc<Self> {
        let (events, _) = broadcast::channel(256);
        Arc::new(Self {
            socket_url: socket_url.into(),
            reconnect_attempts,
            reconnect_delay,
            connector,
            state: RwLock::new(SessionState::Disconnected),
            events,
            outbound: Mutex::new(None),
            identity: Mutex::new(None),
            joined_room: Mutex::new(None),
            run_task: Mutex::new(None),
        })
    }

    pub async fn current_state(&self) -> SessionState {
        *self.state.read().await
    }

    pub async fn is_connected(&self) -> bool {
        self.current_state().await == SessionState::Connected
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    /// Brings the session up for `identity` and keeps it up until the
    /// bounded reconnect ladder is exhausted. Idempotent while running.
    pub async fn start(self: &Arc<Self>, identity: &PeerId) -> Result<(), SessionError> {
        let url = websocket_url(&self.socket_url, identity)?;
        let mut task = self.run_task.lock().await;
        if task.is_some() {
            return Ok(());
        }
        *self.identity.lock().await = Some(identity.0.clone());
        let manager = Arc::clone(self);
        let identity = identity.0.clone();
        *task = Some(tokio::spawn(async move {
            manager.run(url, identity).await;
        }));
        Ok(())
    }

    /// Tears the session down: best-effort `leave`, then the run loop is
    /// stopped and the state pinned to `disconnected`.
    pub async fn shutdown(&self) {
        if let Some(identity) = self.identity.lock().await.clone() {
            self.send(ClientFrame::Leave { user_id: identity }).await;
        }
        if let Some(task) = self.run_task.lock().await.take() {
            task.abort();
        }
        *self.outbound.lock().await = None;
        self.set_state(SessionState::Disconnected).await;
        let _ = self.events.send(SessionEvent::Disconnected);
    }

    /// Fire-and-forget send. The session never queues while disconnected;
    /// a frame emitted with no connection is dropped with a debug log.
    pub async fn send(&self, frame: ClientFrame) -> bool {
        if !self.is_connected().await {
            debug!("session: dropping outbound frame while not connected");
            return false;
        }
        let guard = self.outbound.lock().await;
        match guard.as_ref() {
            Some(tx) => {
                if let Err(err) = tx.try_send(frame) {
                    debug!("session: outbound frame dropped: {err}");
                    return false;
                }
                true
            }
            None => false,
        }
    }

    /// Remembers `room` as the active conversation room (re-joined after
    /// every reconnect) and joins it immediately when connected.
    pub async fn join_room(&self, room: &str) {
        *self.joined_room.lock().await = Some(room.to_string());
        self.send(ClientFrame::Join {
            user_id: room.to_string(),
        })
        .await;
    }

    async fn set_state(&self, next: SessionState) {
        let mut state = self.state.write().await;
        if *state != next {
            debug!("session: state {:?} -> {:?}", *state, next);
            *state = next;
        }
    }

    async fn run(self: Arc<Self>, url: String, identity: String) {
        let mut attempt: u32 = 0;
        loop {
            if attempt == 0 {
                self.set_state(SessionState::Connecting).await;
            } else {
                self.set_state(SessionState::Reconnecting).await;
                let _ = self.events.send(SessionEvent::Reconnecting { attempt });
                tokio::time::sleep(self.reconnect_delay).await;
            }

            let (mut sink, mut stream) = match self.connector.connect(&url).await {
                Ok(pair) => pair,
                Err(err) => {
                    warn!("session: connect failed: {err}");
                    attempt += 1;
                    if attempt > self.reconnect_attempts {
                        self.set_state(SessionState::Disconnected).await;
                        let _ = self.events.send(SessionEvent::Disconnected);
                        info!("session: reconnect attempts exhausted, staying disconnected");
                        return;
                    }
                    continue;
                }
            };

            let (tx, mut outbound_rx) = mpsc::channel(64);
            *self.outbound.lock().await = Some(tx);
            self.set_state(SessionState::Connected).await;
            let _ = self.events.send(SessionEvent::Connected);
            info!("session: connected identity={identity}");

            if self.handshake(&mut sink, &identity).await {
                loop {
                    tokio::select! {
                        outbound = outbound_rx.recv() => match outbound {
                            Some(frame) => {
                                if let Err(err) = sink.send(frame).await {
                                    warn!("session: send failed: {err}");
                                    break;
                                }
                            }
                            None => break,
                        },
                        inbound = stream.next_frame() => match inbound {
                            Some(Ok(frame)) => {
                                let _ = self.events.send(SessionEvent::Frame(frame));
                            }
                            Some(Err(err)) => {
                                warn!("session: receive failed: {err}");
                                break;
                            }
                            None => {
                                info!("session: connection closed by server");
                                break;
                            }
                        }
                    }
                }
            }

            *self.outbound.lock().await = None;
            let _ = self.events.send(SessionEvent::ConnectionLost);
            attempt = 1;
        }
    }

    /// Identity handshake on every (re)connect: announce presence, then
    /// re-join the previously selected conversation room if any.
    async fn handshake(&self, sink: &mut Box<dyn SocketSink>, identity: &str) -> bool {
        let mut frames = vec![
            ClientFrame::Join {
                user_id: identity.to_string(),
            },
            ClientFrame::UserOnline {
                user_id: identity.to_string(),
            },
        ];
        if let Some(room) = self.joined_room.lock().await.clone() {
            frames.push(ClientFrame::Join { user_id: room });
        }
        for frame in frames {
            if let Err(err) = sink.send(frame).await {
                warn!("session: handshake send failed: {err}");
                return false;
            }
        }
        true
    }
}

/// Rewrites the configured HTTP origin into the websocket endpoint, the
/// same scheme swap the REST base already went through for TLS.
fn websocket_url(origin: &str, identity: &PeerId) -> Result<String, SessionError> {
    let ws_origin = if let Some(rest) = origin.strip_prefix("https://") {
        format!("wss://{rest}")
    } else if let Some(rest) = origin.strip_prefix("http://") {
        format!("ws://{rest}")
    } else if origin.starts_with("ws://") || origin.starts_with("wss://") {
        origin.to_string()
    } else {
        return Err(SessionError::Origin(origin.to_string()));
    };
    Ok(format!("{ws_origin}/ws?userId={}", identity.0))
}

/// Production connector speaking JSON text frames over a websocket.
pub struct TungsteniteConnector;

#[async_trait]
impl SocketConnector for TungsteniteConnector {
    async fn connect(
        &self,
        url: &str,
    ) -> Result<(Box<dyn SocketSink>, Box<dyn SocketStream>), SessionError> {
        let (ws, _) = connect_async(url)
            .await
            .map_err(|err| SessionError::Connect(err.to_string()))?;
        let (sink, stream) = ws.split();
        Ok((
            Box::new(TungsteniteSink { sink }),
            Box::new(TungsteniteStream { stream }),
        ))
    }
}

struct TungsteniteSink {
    sink: SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, WsMessage>,
}

#[async_trait]
impl SocketSink for TungsteniteSink {
    async fn send(&mut self, frame: ClientFrame) -> Result<(), SessionError> {
        self.sink
            .send(WsMessage::Text(frame.encode()))
            .await
            .map_err(|err| SessionError::Send(err.to_string()))
    }
}

struct TungsteniteStream {
    stream: SplitStream<WebSocketStream<MaybeTlsStream<TcpStream>>>,
}

#[async_trait]
impl SocketStream for TungsteniteStream {
    async fn next_frame(&mut self) -> Option<Result<ServerFrame, SessionError>> {
        loop {
            match self.stream.next().await {
                Some(Ok(WsMessage::Text(text))) => match ServerFrame::decode(&text) {
                    Ok(frame) => return Some(Ok(frame)),
                    // Malformed or unknown payloads are dropped, never
                    // propagated as errors.
                    Err(err) => debug!("session: dropping unrecognized frame: {err}"),
                },
                Some(Ok(WsMessage::Close(_))) => return None,
                Some(Ok(_)) => {}
                Some(Err(err)) => return Some(Err(SessionError::Receive(err.to_string()))),
                None => return None,
            }
        }
    }
}

#[cfg(test)]
#[path = "tests/session_tests.rs"]
mod tests;
