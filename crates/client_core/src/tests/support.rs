//! Fakes shared by the client tests: a scripted dialer standing in for the
//! websocket and an in-memory latest-message source.

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex,
    },
};

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use futures::{channel::mpsc, SinkExt, StreamExt};
use shared::{
    domain::{ChatId, MessageId, MessageType, UserId},
    protocol::{ChatEvent, MessagePayload, SenderSummary},
};
use tokio::{sync::Notify, time::Instant};
use url::Url;

use crate::{
    error::TransportError,
    listeners::Listener,
    polling::LatestMessageSource,
    transport::{Connection, Dialer},
};

/// The server side of one fake socket.
pub(crate) struct Peer {
    pub(crate) to_client: mpsc::UnboundedSender<Result<String, TransportError>>,
    pub(crate) from_client: mpsc::UnboundedReceiver<String>,
}

impl Peer {
    pub(crate) fn push(&self, event: &ChatEvent) {
        let frame = serde_json::to_string(event).expect("encode event");
        self.to_client.unbounded_send(Ok(frame)).expect("client gone");
    }

    pub(crate) async fn next_frame(&mut self) -> serde_json::Value {
        let frame = self.from_client.next().await.expect("client closed");
        serde_json::from_str(&frame).expect("json frame")
    }
}

#[derive(Default)]
pub(crate) struct FakeDialer {
    failures_left: AtomicUsize,
    dial_times: Mutex<Vec<Instant>>,
    peers: Mutex<Vec<Peer>>,
    gate: Option<Arc<Notify>>,
}

impl FakeDialer {
    pub(crate) fn failing(times: usize) -> Self {
        Self {
            failures_left: AtomicUsize::new(times),
            ..Self::default()
        }
    }

    pub(crate) fn gated(gate: Arc<Notify>) -> Self {
        Self {
            gate: Some(gate),
            ..Self::default()
        }
    }

    pub(crate) fn dial_count(&self) -> usize {
        self.dial_times.lock().expect("lock").len()
    }

    pub(crate) fn dial_times(&self) -> Vec<Instant> {
        self.dial_times.lock().expect("lock").clone()
    }

    pub(crate) fn take_peer(&self) -> Peer {
        self.peers.lock().expect("lock").remove(0)
    }
}

#[async_trait]
impl Dialer for FakeDialer {
    async fn dial(&self, url: &Url) -> Result<Connection, TransportError> {
        assert!(url.query().is_some_and(|q| q.starts_with("token=")));
        self.dial_times.lock().expect("lock").push(Instant::now());
        if let Some(gate) = &self.gate {
            gate.notified().await;
        }
        let failing = self
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
            .is_ok();
        if failing {
            return Err(TransportError::Connect("connection refused".into()));
        }

        let (to_client, client_inbox) = mpsc::unbounded();
        let (client_outbox, from_client) = mpsc::unbounded::<String>();
        self.peers.lock().expect("lock").push(Peer {
            to_client,
            from_client,
        });
        Ok(Connection {
            sink: Box::pin(
                client_outbox.sink_map_err(|err| TransportError::Closed(err.to_string())),
            ),
            stream: Box::pin(client_inbox),
        })
    }
}

/// Listener that forwards every event into a channel the test can await.
pub(crate) fn channel_listener() -> (Listener, tokio::sync::mpsc::UnboundedReceiver<ChatEvent>) {
    let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
    let listener: Listener = Arc::new(move |event: &ChatEvent| {
        let _ = tx.send(event.clone());
    });
    (listener, rx)
}

#[derive(Default)]
pub(crate) struct FakeSource {
    latest: Mutex<HashMap<ChatId, Result<MessageId, String>>>,
    calls: AtomicUsize,
}

impl FakeSource {
    pub(crate) fn set_latest(&self, chat_id: ChatId, message_id: i64) {
        self.latest
            .lock()
            .expect("lock")
            .insert(chat_id, Ok(MessageId(message_id)));
    }

    pub(crate) fn fail(&self, chat_id: ChatId) {
        self.latest
            .lock()
            .expect("lock")
            .insert(chat_id, Err("server unavailable".into()));
    }

    pub(crate) fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl LatestMessageSource for FakeSource {
    async fn latest_message(&self, chat_id: ChatId) -> anyhow::Result<Option<MessagePayload>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let latest = self.latest.lock().expect("lock").get(&chat_id).cloned();
        match latest {
            None => Ok(None),
            Some(Ok(id)) => Ok(Some(message(chat_id, id.0, UserId(2), at(id.0)))),
            Some(Err(reason)) => Err(anyhow::anyhow!(reason)),
        }
    }
}

pub(crate) fn at(seconds: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(1_700_000_000 + seconds, 0)
        .single()
        .expect("valid timestamp")
}

pub(crate) fn message(
    chat_id: ChatId,
    id: i64,
    sender: UserId,
    created_at: DateTime<Utc>,
) -> MessagePayload {
    MessagePayload {
        id: MessageId(id),
        chat_id,
        sender: SenderSummary {
            id: sender,
            display_name: format!("user {sender}"),
            avatar_url: None,
        },
        content: format!("message {id}"),
        message_type: MessageType::Text,
        reply_to_id: None,
        metadata: None,
        attachments: Vec::new(),
        reactions: Vec::new(),
        created_at,
        updated_at: created_at,
        edited_at: None,
        deleted_at: None,
    }
}
