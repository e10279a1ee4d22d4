use std::collections::HashSet;

use axum::extract::ws::{Message, WebSocket};
use futures::{SinkExt, StreamExt};
use server_api::{require_member, ApiContext};
use shared::{
    domain::{ChatId, UserId},
    protocol::{ChatEvent, ClientCommand, TypingState},
};
use tokio::sync::broadcast;
use tokio_stream::wrappers::{errors::BroadcastStreamRecvError, BroadcastStream};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// An event on its way to every connection, tagged with the user that caused
/// it so each connection can tailor delivery.
#[derive(Debug, Clone)]
pub(crate) struct HubEnvelope {
    pub(crate) event: ChatEvent,
    pub(crate) origin: Option<UserId>,
}

#[derive(Clone)]
pub(crate) struct ChatHub {
    tx: broadcast::Sender<HubEnvelope>,
}

impl ChatHub {
    pub(crate) fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// Returns how many connections were listening.
    pub(crate) fn publish(&self, event: ChatEvent, origin: Option<UserId>) -> usize {
        self.tx.send(HubEnvelope { event, origin }).unwrap_or(0)
    }

    pub(crate) fn subscribe(&self) -> broadcast::Receiver<HubEnvelope> {
        self.tx.subscribe()
    }
}

/// Chat rooms one connection has joined.
#[derive(Debug)]
pub(crate) struct ConnectionRooms {
    user_id: UserId,
    rooms: HashSet<ChatId>,
}

impl ConnectionRooms {
    pub(crate) fn new(user_id: UserId) -> Self {
        Self {
            user_id,
            rooms: HashSet::new(),
        }
    }

    pub(crate) fn join(&mut self, chat_id: ChatId) {
        self.rooms.insert(chat_id);
    }

    pub(crate) fn leave(&mut self, chat_id: ChatId) {
        self.rooms.remove(&chat_id);
    }

    pub(crate) fn contains(&self, chat_id: ChatId) -> bool {
        self.rooms.contains(&chat_id)
    }

    /// Decides what, if anything, this connection sees for a hub event.
    /// The author of a new message gets `message_sent`; typing is never
    /// echoed back to the typist; a member removed from a chat sees the
    /// `user_left` and is then dropped from the room.
    pub(crate) fn deliver(&mut self, envelope: &HubEnvelope) -> Option<ChatEvent> {
        let chat_id = envelope.event.chat_id()?;
        if !self.rooms.contains(&chat_id) {
            return None;
        }
        let from_self = envelope.origin == Some(self.user_id);

        match &envelope.event {
            ChatEvent::Typing { .. } if from_self => None,
            ChatEvent::Message { chat_id, message } if from_self => Some(ChatEvent::MessageSent {
                chat_id: *chat_id,
                message: message.clone(),
            }),
            ChatEvent::UserLeft { chat_id, user_id } if *user_id == self.user_id => {
                self.rooms.remove(chat_id);
                Some(envelope.event.clone())
            }
            event => Some(event.clone()),
        }
    }
}

/// Drives one authenticated socket until either side goes away.
pub(crate) async fn run_connection(
    api: ApiContext,
    hub: ChatHub,
    socket: WebSocket,
    user_id: UserId,
) {
    let conn_id = Uuid::new_v4();
    info!(%conn_id, %user_id, "websocket connected");

    let (mut sender, mut receiver) = socket.split();
    let mut events = BroadcastStream::new(hub.subscribe());
    let mut rooms = ConnectionRooms::new(user_id);

    loop {
        tokio::select! {
            inbound = receiver.next() => {
                let text = match inbound {
                    Some(Ok(Message::Text(text))) => text,
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => continue,
                    Some(Err(error)) => {
                        debug!(%conn_id, %error, "websocket read failed");
                        break;
                    }
                };
                let reply = handle_command(&api, &hub, &mut rooms, user_id, &text).await;
                if let Some(reply) = reply {
                    if send_event(&mut sender, &reply).await.is_err() {
                        break;
                    }
                }
            }
            outbound = events.next() => {
                let envelope = match outbound {
                    Some(Ok(envelope)) => envelope,
                    Some(Err(BroadcastStreamRecvError::Lagged(skipped))) => {
                        warn!(%conn_id, skipped, "websocket consumer lagged; events dropped");
                        continue;
                    }
                    None => break,
                };
                if let Some(event) = rooms.deliver(&envelope) {
                    if send_event(&mut sender, &event).await.is_err() {
                        break;
                    }
                }
            }
        }
    }

    info!(%conn_id, %user_id, "websocket disconnected");
}

/// Applies one client frame. Returns a frame to send back only on error.
async fn handle_command(
    api: &ApiContext,
    hub: &ChatHub,
    rooms: &mut ConnectionRooms,
    user_id: UserId,
    text: &str,
) -> Option<ChatEvent> {
    let command = match serde_json::from_str::<ClientCommand>(text) {
        Ok(command) => command,
        Err(error) => {
            debug!(%user_id, %error, "unparseable client frame");
            return Some(ChatEvent::error("invalid frame"));
        }
    };

    match command {
        ClientCommand::JoinChat { chat_id } => match require_member(api, chat_id, user_id).await {
            Ok(_) => {
                rooms.join(chat_id);
                debug!(%user_id, %chat_id, "joined chat room");
                None
            }
            Err(error) => Some(ChatEvent::Error {
                chat_id: Some(chat_id),
                error: error.message,
            }),
        },
        ClientCommand::LeaveChat { chat_id } => {
            rooms.leave(chat_id);
            None
        }
        ClientCommand::Typing { chat_id, is_typing } => {
            if !rooms.contains(chat_id) {
                return Some(ChatEvent::Error {
                    chat_id: Some(chat_id),
                    error: "chat not joined".to_string(),
                });
            }
            hub.publish(
                ChatEvent::Typing {
                    chat_id,
                    user_id,
                    data: TypingState { is_typing },
                },
                Some(user_id),
            );
            None
        }
    }
}

async fn send_event<S>(sender: &mut S, event: &ChatEvent) -> Result<(), ()>
where
    S: futures::Sink<Message> + Unpin,
{
    let text = match serde_json::to_string(event) {
        Ok(text) => text,
        Err(error) => {
            warn!(%error, "failed to encode event");
            return Ok(());
        }
    };
    sender.send(Message::Text(text)).await.map_err(|_| ())
}

#[cfg(test)]
#[path = "tests/hub_tests.rs"]
mod tests;
