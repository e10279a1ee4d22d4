use std::{
    collections::BTreeMap,
    sync::{Arc, Mutex, MutexGuard, PoisonError, Weak},
    time::Duration,
};

use async_trait::async_trait;
use futures::future::join_all;
use shared::{
    domain::{ChatId, MessageId},
    protocol::{ChatEvent, EventType, MessagePayload},
};
use tokio::{
    task::JoinHandle,
    time::{interval_at, Instant, MissedTickBehavior},
};
use tracing::{debug, warn};

use crate::listeners::{Listener, ListenerId, ListenerRegistry};

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(3);

/// Where the poller reads "the newest message in a chat" from.
#[async_trait]
pub trait LatestMessageSource: Send + Sync {
    async fn latest_message(&self, chat_id: ChatId) -> anyhow::Result<Option<MessagePayload>>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollingConfig {
    pub interval: Duration,
}

impl Default for PollingConfig {
    fn default() -> Self {
        Self {
            interval: DEFAULT_POLL_INTERVAL,
        }
    }
}

#[derive(Default)]
struct PollState {
    /// Watched chats and the newest message id already reported for each.
    watched: BTreeMap<ChatId, Option<MessageId>>,
    timer: Option<JoinHandle<()>>,
}

struct Inner {
    source: Arc<dyn LatestMessageSource>,
    interval: Duration,
    listeners: ListenerRegistry,
    state: Mutex<PollState>,
}

/// Fallback that emulates the realtime event surface by fetching the newest
/// message of every watched chat on one shared timer. The timer only runs
/// while at least one chat is watched.
pub struct PollingClient {
    inner: Arc<Inner>,
}

impl PollingClient {
    pub fn new(source: Arc<dyn LatestMessageSource>, config: PollingConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                source,
                interval: config.interval.max(Duration::from_millis(1)),
                listeners: ListenerRegistry::new(),
                state: Mutex::new(PollState::default()),
            }),
        }
    }

    pub fn on(&self, event_type: EventType, listener: Listener) -> ListenerId {
        self.inner.listeners.on(event_type, listener)
    }

    pub fn off(&self, id: ListenerId) -> bool {
        self.inner.listeners.off(id)
    }

    /// Starts watching a chat. The first message observed is reported.
    pub fn watch(&self, chat_id: ChatId) {
        self.watch_with(chat_id, None);
    }

    /// Starts watching a chat whose messages up to `last_seen` are already
    /// known to the caller.
    pub fn watch_from(&self, chat_id: ChatId, last_seen: MessageId) {
        self.watch_with(chat_id, Some(last_seen));
    }

    fn watch_with(&self, chat_id: ChatId, last_seen: Option<MessageId>) {
        let mut state = self.inner.lock();
        let entry = state.watched.entry(chat_id).or_insert(None);
        *entry = (*entry).max(last_seen);
        if state.timer.is_none() {
            state.timer = Some(spawn_timer(&self.inner));
            debug!(interval_ms = self.inner.interval.as_millis() as u64, "polling started");
        }
    }

    pub fn unwatch(&self, chat_id: ChatId) -> bool {
        let mut state = self.inner.lock();
        let removed = state.watched.remove(&chat_id).is_some();
        if state.watched.is_empty() {
            stop_timer(&mut state);
        }
        removed
    }

    pub fn unwatch_all(&self) {
        let mut state = self.inner.lock();
        state.watched.clear();
        stop_timer(&mut state);
    }

    pub fn watched(&self) -> Vec<ChatId> {
        self.inner.lock().watched.keys().copied().collect()
    }

    pub fn last_seen(&self, chat_id: ChatId) -> Option<MessageId> {
        self.inner.lock().watched.get(&chat_id).copied().flatten()
    }

    pub fn is_running(&self) -> bool {
        self.inner.lock().timer.is_some()
    }

    /// Runs one tick by hand.
    pub async fn poll_once(&self) {
        self.inner.poll_once().await;
    }
}

impl Drop for PollingClient {
    fn drop(&mut self) {
        stop_timer(&mut self.inner.lock());
    }
}

fn spawn_timer(inner: &Arc<Inner>) -> JoinHandle<()> {
    let period = inner.interval;
    // Weak so a dropped client does not stay alive through its own timer.
    let inner: Weak<Inner> = Arc::downgrade(inner);
    tokio::spawn(async move {
        let mut ticker = interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            let Some(inner) = inner.upgrade() else {
                break;
            };
            inner.poll_once().await;
        }
    })
}

fn stop_timer(state: &mut PollState) {
    if let Some(timer) = state.timer.take() {
        timer.abort();
        debug!("polling stopped");
    }
}

impl Inner {
    fn lock(&self) -> MutexGuard<'_, PollState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    async fn poll_once(&self) {
        let chats: Vec<ChatId> = self.lock().watched.keys().copied().collect();
        let fetches = chats
            .iter()
            .map(|chat_id| self.source.latest_message(*chat_id));
        let results = join_all(fetches).await;

        for (chat_id, result) in chats.into_iter().zip(results) {
            let message = match result {
                Ok(Some(message)) => message,
                Ok(None) => continue,
                Err(error) => {
                    warn!(%chat_id, error = %format!("{error:#}"), "polling fetch failed");
                    continue;
                }
            };
            if self.record(chat_id, message.id) {
                self.listeners
                    .dispatch(&ChatEvent::Message { chat_id, message });
            }
        }
    }

    /// True when `message_id` is newer than anything reported for the chat.
    /// Chats unwatched while the fetch was in flight report nothing.
    fn record(&self, chat_id: ChatId, message_id: MessageId) -> bool {
        let mut state = self.lock();
        match state.watched.get_mut(&chat_id) {
            Some(last_seen) if last_seen.map_or(true, |seen| message_id > seen) => {
                *last_seen = Some(message_id);
                true
            }
            _ => false,
        }
    }
}

#[cfg(test)]
#[path = "tests/polling_tests.rs"]
mod tests;
