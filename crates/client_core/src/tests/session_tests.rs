use super::*;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc::{unbounded_channel, UnboundedSender};
use tokio::time::timeout;

use shared::domain::PeerId;

struct FakeConnector {
    /// Scripted connect outcomes, popped per attempt; empty means succeed.
    outcomes: Mutex<VecDeque<bool>>,
    sent: Arc<Mutex<Vec<ClientFrame>>>,
    /// Sender feeding the currently live connection's inbound stream.
    inbound: Arc<Mutex<Option<UnboundedSender<ServerFrame>>>>,
}

impl FakeConnector {
    fn always_up() -> Arc<Self> {
        Self::scripted([])
    }

    fn scripted(outcomes: impl IntoIterator<Item = bool>) -> Arc<Self> {
        Arc::new(Self {
            outcomes: Mutex::new(outcomes.into_iter().collect()),
            sent: Arc::new(Mutex::new(Vec::new())),
            inbound: Arc::new(Mutex::new(None)),
        })
    }

    async fn sent_frames(&self) -> Vec<ClientFrame> {
        self.sent.lock().await.clone()
    }

    /// Drops the live connection by closing its inbound stream.
    async fn sever(&self) {
        self.inbound.lock().await.take();
    }

    async fn push(&self, frame: ServerFrame) {
        if let Some(tx) = self.inbound.lock().await.as_ref() {
            let _ = tx.send(frame);
        }
    }
}

#[async_trait]
impl SocketConnector for FakeConnector {
    async fn connect(
        &self,
        _url: &str,
    ) -> Result<(Box<dyn SocketSink>, Box<dyn SocketStream>), SessionError> {
        let up = self.outcomes.lock().await.pop_front().unwrap_or(true);
        if !up {
            return Err(SessionError::Connect("scripted failure".into()));
        }
        let (tx, rx) = unbounded_channel();
        *self.inbound.lock().await = Some(tx);
        Ok((
            Box::new(FakeSink {
                sent: Arc::clone(&self.sent),
            }),
            Box::new(FakeStream { rx }),
        ))
    }
}

struct FakeSink {
    sent: Arc<Mutex<Vec<ClientFrame>>>,
}

#[async_trait]
impl SocketSink for FakeSink {
    async fn send(&mut self, frame: ClientFrame) -> Result<(), SessionError> {
        self.sent.lock().await.push(frame);
        Ok(())
    }
}

struct FakeStream {
    rx: tokio::sync::mpsc::UnboundedReceiver<ServerFrame>,
}

#[async_trait]
impl SocketStream for FakeStream {
    async fn next_frame(&mut self) -> Option<Result<ServerFrame, SessionError>> {
        self.rx.recv().await.map(Ok)
    }
}

fn manager(connector: Arc<FakeConnector>, attempts: u32) -> Arc<SessionManager> {
    SessionManager::new(
        "http://localhost:5000/api",
        connector,
        attempts,
        Duration::from_millis(1),
    )
}

async fn next_event(rx: &mut broadcast::Receiver<SessionEvent>) -> SessionEvent {
    timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("timed out waiting for session event")
        .expect("session event channel closed")
}

async fn wait_for_frames(connector: &FakeConnector, count: usize) -> Vec<ClientFrame> {
    timeout(Duration::from_secs(5), async {
        loop {
            let frames = connector.sent_frames().await;
            if frames.len() >= count {
                return frames;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("timed out waiting for outbound frames")
}

#[tokio::test]
async fn connecting_runs_the_identity_handshake() {
    let connector = FakeConnector::always_up();
    let session = manager(Arc::clone(&connector), 5);
    let mut events = session.subscribe();

    session.start(&PeerId::new("alice")).await.expect("start");
    assert!(matches!(next_event(&mut events).await, SessionEvent::Connected));
    assert_eq!(session.current_state().await, SessionState::Connected);

    let frames = wait_for_frames(&connector, 2).await;
    assert_eq!(
        frames[0],
        ClientFrame::Join {
            user_id: "alice".into()
        }
    );
    assert_eq!(
        frames[1],
        ClientFrame::UserOnline {
            user_id: "alice".into()
        }
    );
}

#[tokio::test]
async fn reconnect_is_bounded_and_ends_disconnected() {
    let connector = FakeConnector::scripted([false, false, false]);
    let session = manager(Arc::clone(&connector), 2);
    let mut events = session.subscribe();

    session.start(&PeerId::new("alice")).await.expect("start");

    assert!(matches!(
        next_event(&mut events).await,
        SessionEvent::Reconnecting { attempt: 1 }
    ));
    assert!(matches!(
        next_event(&mut events).await,
        SessionEvent::Reconnecting { attempt: 2 }
    ));
    assert!(matches!(next_event(&mut events).await, SessionEvent::Disconnected));
    assert_eq!(session.current_state().await, SessionState::Disconnected);

    assert!(!session.send(ClientFrame::UserOnline { user_id: "alice".into() }).await);
}

#[tokio::test]
async fn dropped_connection_reconnects_and_rejoins_the_room() {
    let connector = FakeConnector::always_up();
    let session = manager(Arc::clone(&connector), 5);
    let mut events = session.subscribe();

    session.start(&PeerId::new("alice")).await.expect("start");
    assert!(matches!(next_event(&mut events).await, SessionEvent::Connected));
    wait_for_frames(&connector, 2).await;

    session.join_room("bob").await;
    wait_for_frames(&connector, 3).await;

    connector.sever().await;
    assert!(matches!(
        next_event(&mut events).await,
        SessionEvent::ConnectionLost
    ));
    assert!(matches!(
        next_event(&mut events).await,
        SessionEvent::Reconnecting { attempt: 1 }
    ));
    assert!(matches!(next_event(&mut events).await, SessionEvent::Connected));

    // The second handshake re-joins bob's room on its own.
    let frames = wait_for_frames(&connector, 6).await;
    assert_eq!(
        frames[5],
        ClientFrame::Join {
            user_id: "bob".into()
        }
    );
}

#[tokio::test]
async fn inbound_frames_fan_out_to_subscribers() {
    let connector = FakeConnector::always_up();
    let session = manager(Arc::clone(&connector), 5);
    let mut events = session.subscribe();

    session.start(&PeerId::new("alice")).await.expect("start");
    assert!(matches!(next_event(&mut events).await, SessionEvent::Connected));

    connector
        .push(ServerFrame::UserOnline {
            user_id: "bob".into(),
        })
        .await;
    match next_event(&mut events).await {
        SessionEvent::Frame(ServerFrame::UserOnline { user_id }) => {
            assert_eq!(user_id, "bob");
        }
        other => panic!("unexpected event: {other:?}"),
    }
}

#[tokio::test]
async fn shutdown_is_terminal() {
    let connector = FakeConnector::always_up();
    let session = manager(Arc::clone(&connector), 5);
    let mut events = session.subscribe();

    session.start(&PeerId::new("alice")).await.expect("start");
    assert!(matches!(next_event(&mut events).await, SessionEvent::Connected));

    session.shutdown().await;
    assert_eq!(session.current_state().await, SessionState::Disconnected);
    assert!(!session
        .send(ClientFrame::UserOnline {
            user_id: "alice".into()
        })
        .await);
}

#[test]
fn websocket_url_swaps_schemes() {
    let id = PeerId::new("alice");
    assert_eq!(
        websocket_url("http://localhost:5000/api", &id).expect("url"),
        "ws://localhost:5000/api/ws?userId=alice"
    );
    assert_eq!(
        websocket_url("https://chat.example.com", &id).expect("url"),
        "wss://chat.example.com/ws?userId=alice"
    );
    assert!(websocket_url("ftp://nope", &id).is_err());
}
