use std::sync::Mutex;

use super::*;
use shared::domain::{ChatId, UserId};
use shared::protocol::TypingState;

fn recorder() -> (Arc<Mutex<Vec<EventType>>>, Listener) {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    let listener: Listener = Arc::new(move |event: &ChatEvent| {
        sink.lock().expect("lock").push(event.event_type());
    });
    (seen, listener)
}

fn typing() -> ChatEvent {
    ChatEvent::Typing {
        chat_id: ChatId(1),
        user_id: UserId(2),
        data: TypingState { is_typing: true },
    }
}

fn joined() -> ChatEvent {
    ChatEvent::UserJoined {
        chat_id: ChatId(1),
        user_id: UserId(3),
    }
}

#[test]
fn typed_listener_only_sees_its_type() {
    let registry = ListenerRegistry::new();
    let (seen, listener) = recorder();
    registry.on(EventType::Typing, listener);

    registry.dispatch(&typing());
    registry.dispatch(&joined());

    assert_eq!(*seen.lock().expect("lock"), vec![EventType::Typing]);
}

#[test]
fn message_listener_receives_every_event_once() {
    let registry = ListenerRegistry::new();
    let (seen, listener) = recorder();
    registry.on(EventType::Message, listener);

    registry.dispatch(&typing());
    registry.dispatch(&joined());
    registry.dispatch(&ChatEvent::error("boom"));

    assert_eq!(
        *seen.lock().expect("lock"),
        vec![EventType::Typing, EventType::UserJoined, EventType::Error]
    );
}

#[test]
fn off_removes_only_that_listener() {
    let registry = ListenerRegistry::new();
    let (first_seen, first) = recorder();
    let (second_seen, second) = recorder();
    let first_id = registry.on(EventType::Typing, first);
    registry.on(EventType::Typing, second);

    assert!(registry.off(first_id));
    assert!(!registry.off(first_id));
    registry.dispatch(&typing());

    assert!(first_seen.lock().expect("lock").is_empty());
    assert_eq!(second_seen.lock().expect("lock").len(), 1);
}

#[test]
fn listener_may_register_during_dispatch() {
    let registry = Arc::new(ListenerRegistry::new());
    let inner = Arc::clone(&registry);
    registry.on(
        EventType::Typing,
        Arc::new(move |_event: &ChatEvent| {
            inner.on(EventType::Typing, Arc::new(|_event: &ChatEvent| {}));
        }),
    );
    registry.dispatch(&typing());
    assert_eq!(registry.len(), 2);
}

#[test]
fn clear_drops_everything() {
    let registry = ListenerRegistry::new();
    let (_, listener) = recorder();
    registry.on(EventType::Message, listener.clone());
    registry.on(EventType::Error, listener);
    registry.clear();
    assert!(registry.is_empty());
}
