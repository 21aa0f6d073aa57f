//! Volatile presence and typing state, rebuilt from the live connection.
//! Nothing here survives a disconnect: the server snapshot after the next
//! handshake is the only source of truth.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::debug;

use shared::domain::PeerId;
use shared::protocol::{ClientFrame, ServerFrame};

use crate::session::{SessionEvent, SessionManager};

#[derive(Default)]
struct PresenceState {
    online: HashSet<String>,
    typing: HashMap<String, bool>,
}

pub struct PresenceTracker {
    session: Arc<SessionManager>,
    inner: RwLock<PresenceState>,
    /// Recipient of the armed typing timer, if one is pending.
    typing_timer: Mutex<Option<(String, JoinHandle<()>)>>,
    quiet_period: Duration,
    run_task: Mutex<Option<JoinHandle<()>>>,
}

impl PresenceTracker {
    pub fn new(session: Arc<SessionManager>, quiet_period: Duration) -> Arc<Self> {
        Arc::new(Self {
            session,
            inner: RwLock::new(PresenceState::default()),
            typing_timer: Mutex::new(None),
            quiet_period,
            run_task: Mutex::new(None),
        })
    }

    /// Spawns the event pump that keeps presence in sync with the session.
    pub async fn start(self: &Arc<Self>) {
        let mut task = self.run_task.lock().await;
        if task.is_some() {
            return;
        }
        let tracker = Arc::clone(self);
        let mut events = self.session.subscribe();
        *task = Some(tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(event) => tracker.apply(event).await,
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        // After a lag the presence picture may be stale, so
                        // drop it and wait for the next snapshot.
                        debug!("presence: lagged {skipped} events, clearing state");
                        tracker.clear().await;
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        }));
    }

    pub async fn stop(&self) {
        if let Some(task) = self.run_task.lock().await.take() {
            task.abort();
        }
        if let Some((_, timer)) = self.typing_timer.lock().await.take() {
            timer.abort();
        }
        self.clear().await;
    }

    async fn apply(&self, event: SessionEvent) {
        match event {
            SessionEvent::Frame(ServerFrame::OnlineUsers(users)) => {
                let mut inner = self.inner.write().await;
                inner.online = users.into_iter().collect();
            }
            SessionEvent::Frame(ServerFrame::UserOnline { user_id }) => {
                self.inner.write().await.online.insert(user_id);
            }
            SessionEvent::Frame(ServerFrame::UserOffline { user_id }) => {
                let mut inner = self.inner.write().await;
                inner.online.remove(&user_id);
                inner.typing.remove(&user_id);
            }
            SessionEvent::Frame(ServerFrame::UserTyping { user_id, is_typing }) => {
                let mut inner = self.inner.write().await;
                if is_typing {
                    inner.typing.insert(user_id, true);
                } else {
                    inner.typing.remove(&user_id);
                }
            }
            SessionEvent::ConnectionLost | SessionEvent::Disconnected => {
                self.clear().await;
            }
            _ => {}
        }
    }

    async fn clear(&self) {
        let mut inner = self.inner.write().await;
        inner.online.clear();
        inner.typing.clear();
    }

    pub async fn is_online(&self, peer: &PeerId) -> bool {
        self.inner.read().await.online.contains(&peer.0)
    }

    pub async fn is_typing(&self, peer: &PeerId) -> bool {
        self.inner
            .read()
            .await
            .typing
            .get(&peer.0)
            .copied()
            .unwrap_or(false)
    }

    pub async fn online_peers(&self) -> HashSet<String> {
        self.inner.read().await.online.clone()
    }

    /// Called on every local keystroke. Emits `typing` to `recipient` and
    /// (re)arms the quiet-period timer that emits `stopTyping` once the
    /// user pauses.
    pub async fn announce_typing(self: &Arc<Self>, recipient: &PeerId) {
        let mut timer = self.typing_timer.lock().await;
        if let Some((previous, handle)) = timer.take() {
            handle.abort();
            if previous != recipient.0 {
                self.session
                    .send(ClientFrame::StopTyping {
                        recipient_id: previous,
                        is_typing: false,
                    })
                    .await;
            }
        }
        self.session
            .send(ClientFrame::Typing {
                recipient_id: recipient.0.clone(),
                is_typing: true,
            })
            .await;

        let tracker = Arc::clone(self);
        let target = recipient.0.clone();
        let quiet = self.quiet_period;
        let armed = target.clone();
        *timer = Some((
            armed,
            tokio::spawn(async move {
                tokio::time::sleep(quiet).await;
                // Release the slot only while it is still ours; a re-armed
                // timer belongs to a newer announcement and must survive.
                {
                    let mut slot = tracker.typing_timer.lock().await;
                    let owns = slot
                        .as_ref()
                        .is_some_and(|(recipient, _)| *recipient == target);
                    if !owns {
                        return;
                    }
                    let _ = slot.take();
                }
                tracker
                    .session
                    .send(ClientFrame::StopTyping {
                        recipient_id: target,
                        is_typing: false,
                    })
                    .await;
            }),
        ));
    }

    /// Immediate stop, used when a message is actually sent.
    pub async fn stop_typing(&self, recipient: &PeerId) {
        if let Some((_, handle)) = self.typing_timer.lock().await.take() {
            handle.abort();
        }
        self.session
            .send(ClientFrame::StopTyping {
                recipient_id: recipient.0.clone(),
                is_typing: false,
            })
            .await;
    }
}

#[cfg(test)]
#[path = "tests/presence_tests.rs"]
mod tests;
