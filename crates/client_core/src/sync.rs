use std::{
    collections::BTreeMap,
    sync::{Arc, Mutex, MutexGuard, PoisonError, Weak},
};

use shared::{
    domain::{ChatId, MessageId},
    protocol::{ChatEvent, EventType},
};
use tokio::{sync::watch, task::JoinHandle};
use tracing::{info, warn};

use crate::{
    error::TransportError,
    listeners::{Listener, ListenerId},
    polling::PollingClient,
    transport::{ConnectionState, RealtimeTransport},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncMode {
    Realtime,
    Polling,
}

/// Listener handles on both delivery paths, returned by [`SyncEngine::on`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyncListener {
    realtime: ListenerId,
    polling: ListenerId,
}

/// Joined chats and the newest message id seen for each on either path.
type JoinedChats = Arc<Mutex<BTreeMap<ChatId, Option<MessageId>>>>;

struct Inner {
    transport: RealtimeTransport,
    polling: PollingClient,
    joined: JoinedChats,
    mode: Mutex<SyncMode>,
}

/// Keeps a set of chats live over the socket, moving them onto polling
/// when the socket is abandoned and back once it reopens.
pub struct SyncEngine {
    inner: Arc<Inner>,
    supervisor: JoinHandle<()>,
}

impl SyncEngine {
    pub fn new(transport: RealtimeTransport, polling: PollingClient) -> Self {
        let joined: JoinedChats = Arc::default();
        let tracker = last_seen_tracker(&joined);
        transport.on(EventType::Message, Arc::clone(&tracker));
        polling.on(EventType::Message, tracker);

        let states = transport.subscribe_state();
        let initial = if *states.borrow() == ConnectionState::Abandoned {
            SyncMode::Polling
        } else {
            SyncMode::Realtime
        };
        let inner = Arc::new(Inner {
            transport,
            polling,
            joined,
            mode: Mutex::new(initial),
        });
        let supervisor = tokio::spawn(supervise(Arc::downgrade(&inner), states));
        Self { inner, supervisor }
    }

    pub async fn connect(&self) -> Result<(), TransportError> {
        self.inner.transport.connect().await
    }

    pub fn mode(&self) -> SyncMode {
        *self.inner.mode()
    }

    pub fn transport(&self) -> &RealtimeTransport {
        &self.inner.transport
    }

    pub fn polling(&self) -> &PollingClient {
        &self.inner.polling
    }

    pub fn joined_chats(&self) -> Vec<ChatId> {
        self.inner.joined().keys().copied().collect()
    }

    pub fn join(&self, chat_id: ChatId) {
        self.inner.joined().entry(chat_id).or_insert(None);
        match self.mode() {
            SyncMode::Polling => self.inner.polling.watch(chat_id),
            SyncMode::Realtime if self.inner.transport.is_connected() => {
                self.inner.transport.join_chat(chat_id);
            }
            // Sent once the socket opens.
            SyncMode::Realtime => {}
        }
    }

    pub fn leave(&self, chat_id: ChatId) {
        self.inner.joined().remove(&chat_id);
        if self.inner.transport.is_connected() {
            self.inner.transport.leave_chat(chat_id);
        }
        self.inner.polling.unwatch(chat_id);
    }

    /// Typing only travels over the socket; while polling it is dropped.
    pub fn send_typing(&self, chat_id: ChatId, is_typing: bool) -> bool {
        self.mode() == SyncMode::Realtime && self.inner.transport.send_typing(chat_id, is_typing)
    }

    pub fn on(&self, event_type: EventType, listener: Listener) -> SyncListener {
        SyncListener {
            realtime: self.inner.transport.on(event_type, Arc::clone(&listener)),
            polling: self.inner.polling.on(event_type, listener),
        }
    }

    pub fn off(&self, listener: SyncListener) -> bool {
        let realtime = self.inner.transport.off(listener.realtime);
        let polling = self.inner.polling.off(listener.polling);
        realtime || polling
    }

    pub fn shutdown(&self) {
        self.supervisor.abort();
        self.inner.transport.disconnect();
        self.inner.polling.unwatch_all();
        self.inner.joined().clear();
    }
}

impl Drop for SyncEngine {
    fn drop(&mut self) {
        self.supervisor.abort();
    }
}

fn last_seen_tracker(joined: &JoinedChats) -> Listener {
    let joined = Arc::clone(joined);
    Arc::new(move |event: &ChatEvent| {
        let (chat_id, message) = match event {
            ChatEvent::Message { chat_id, message }
            | ChatEvent::MessageSent { chat_id, message } => (chat_id, message),
            _ => return,
        };
        let mut joined = joined.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(last_seen) = joined.get_mut(chat_id) {
            *last_seen = (*last_seen).max(Some(message.id));
        }
    })
}

async fn supervise(inner: Weak<Inner>, mut states: watch::Receiver<ConnectionState>) {
    while states.changed().await.is_ok() {
        let state = *states.borrow_and_update();
        let Some(inner) = inner.upgrade() else {
            break;
        };
        match state {
            ConnectionState::Open => inner.resume_realtime(),
            ConnectionState::Abandoned => inner.fall_back_to_polling(),
            _ => {}
        }
    }
}

impl Inner {
    fn joined(&self) -> MutexGuard<'_, BTreeMap<ChatId, Option<MessageId>>> {
        self.joined.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn mode(&self) -> MutexGuard<'_, SyncMode> {
        self.mode.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn resume_realtime(&self) {
        *self.mode() = SyncMode::Realtime;
        let chats: Vec<ChatId> = self.joined().keys().copied().collect();
        for chat_id in &chats {
            self.polling.unwatch(*chat_id);
            self.transport.join_chat(*chat_id);
        }
        info!(chats = chats.len(), "realtime delivery resumed");
    }

    fn fall_back_to_polling(&self) {
        *self.mode() = SyncMode::Polling;
        let chats: Vec<(ChatId, Option<MessageId>)> = self
            .joined()
            .iter()
            .map(|(chat_id, last_seen)| (*chat_id, *last_seen))
            .collect();
        for (chat_id, last_seen) in &chats {
            match last_seen {
                Some(last_seen) => self.polling.watch_from(*chat_id, *last_seen),
                None => self.polling.watch(*chat_id),
            }
        }
        warn!(chats = chats.len(), "realtime connection abandoned; polling instead");
    }
}

#[cfg(test)]
#[path = "tests/sync_tests.rs"]
mod tests;
