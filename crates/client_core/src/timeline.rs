use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use shared::{
    domain::{ChatId, MessageId, UserId},
    protocol::{ChatEvent, MessagePayload},
};

/// One chat's messages ordered by id, fed from REST pages and from live or
/// polled events in any order. Applying the same input twice changes
/// nothing.
#[derive(Debug, Clone)]
pub struct MessageTimeline {
    chat_id: ChatId,
    messages: BTreeMap<MessageId, MessagePayload>,
}

impl MessageTimeline {
    pub fn new(chat_id: ChatId) -> Self {
        Self {
            chat_id,
            messages: BTreeMap::new(),
        }
    }

    pub fn chat_id(&self) -> ChatId {
        self.chat_id
    }

    pub fn merge_page(&mut self, page: impl IntoIterator<Item = MessagePayload>) -> usize {
        page.into_iter()
            .map(|message| self.upsert(message))
            .filter(|changed| *changed)
            .count()
    }

    /// Inserts or replaces a message. A copy older than the one held (by
    /// `updated_at`) is ignored, as are messages from other chats. A copy of
    /// the same version only contributes attachments the held one lacks,
    /// since attachments are never removed.
    pub fn upsert(&mut self, message: MessagePayload) -> bool {
        if message.chat_id != self.chat_id {
            return false;
        }
        match self.messages.get_mut(&message.id) {
            Some(held) if held.updated_at > message.updated_at => false,
            Some(held) if held.updated_at == message.updated_at => {
                let before = held.attachments.len();
                for attachment in message.attachments {
                    if !held.attachments.iter().any(|a| a.id == attachment.id) {
                        held.attachments.push(attachment);
                    }
                }
                held.attachments.sort_by_key(|a| a.id);
                held.attachments.len() != before
            }
            _ => {
                self.messages.insert(message.id, message);
                true
            }
        }
    }

    /// Folds one event into the view. Returns whether anything changed.
    pub fn apply(&mut self, event: &ChatEvent) -> bool {
        if event.chat_id() != Some(self.chat_id) {
            return false;
        }
        match event {
            ChatEvent::Message { message, .. }
            | ChatEvent::MessageSent { message, .. }
            | ChatEvent::MessageUpdated { message, .. }
            | ChatEvent::MessageDeleted { message, .. } => self.upsert(message.clone()),
            ChatEvent::ReactionAdded { reaction, .. } => {
                let Some(message) = self.messages.get_mut(&reaction.message_id) else {
                    return false;
                };
                if message.reactions.iter().any(|r| r.same_reaction(reaction)) {
                    return false;
                }
                message.reactions.push(reaction.clone());
                true
            }
            ChatEvent::ReactionRemoved { reaction, .. } => {
                let Some(message) = self.messages.get_mut(&reaction.message_id) else {
                    return false;
                };
                let before = message.reactions.len();
                message.reactions.retain(|r| !r.same_reaction(reaction));
                message.reactions.len() != before
            }
            _ => false,
        }
    }

    pub fn get(&self, message_id: MessageId) -> Option<&MessagePayload> {
        self.messages.get(&message_id)
    }

    pub fn messages(&self) -> impl Iterator<Item = &MessagePayload> {
        self.messages.values()
    }

    pub fn last(&self) -> Option<&MessagePayload> {
        self.messages.values().next_back()
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    /// Messages from others, not deleted, newer than the watermark. Mirrors
    /// the server's unread definition over what is loaded locally.
    pub fn unread_count(&self, viewer: UserId, last_read_at: Option<DateTime<Utc>>) -> usize {
        self.messages
            .values()
            .filter(|m| m.sender.id != viewer && !m.is_deleted())
            .filter(|m| last_read_at.map_or(true, |read| m.created_at > read))
            .count()
    }

    pub fn seen_by_recipient(
        &self,
        message_id: MessageId,
        viewer: UserId,
        recipient_last_read_at: Option<DateTime<Utc>>,
    ) -> bool {
        self.messages
            .get(&message_id)
            .is_some_and(|m| seen_by_recipient(m, viewer, recipient_last_read_at))
    }
}

/// A message the viewer sent counts as seen once the recipient's read
/// watermark has reached its creation time.
pub fn seen_by_recipient(
    message: &MessagePayload,
    viewer: UserId,
    recipient_last_read_at: Option<DateTime<Utc>>,
) -> bool {
    message.sender.id == viewer
        && recipient_last_read_at.is_some_and(|read| read >= message.created_at)
}

#[cfg(test)]
#[path = "tests/timeline_tests.rs"]
mod tests;
