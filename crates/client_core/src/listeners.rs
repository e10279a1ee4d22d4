use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex, MutexGuard, PoisonError,
    },
};

use shared::protocol::{ChatEvent, EventType};

pub type Listener = Arc<dyn Fn(&ChatEvent) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ListenerId(u64);

#[derive(Default)]
struct Slots {
    typed: HashMap<EventType, Vec<(ListenerId, Listener)>>,
    catch_all: Vec<(ListenerId, Listener)>,
}

/// Listener table with two routes: per-type lists, and a catch-all list that
/// sees every event exactly once. Registering under [`EventType::Message`]
/// lands in the catch-all list.
#[derive(Default)]
pub struct ListenerRegistry {
    next_id: AtomicU64,
    slots: Mutex<Slots>,
}

impl ListenerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on(&self, event_type: EventType, listener: Listener) -> ListenerId {
        let id = ListenerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let mut slots = self.lock();
        if event_type == EventType::Message {
            slots.catch_all.push((id, listener));
        } else {
            slots
                .typed
                .entry(event_type)
                .or_default()
                .push((id, listener));
        }
        id
    }

    pub fn off(&self, id: ListenerId) -> bool {
        let mut slots = self.lock();
        let before = slots.catch_all.len();
        slots.catch_all.retain(|(existing, _)| *existing != id);
        if slots.catch_all.len() != before {
            return true;
        }
        for listeners in slots.typed.values_mut() {
            let before = listeners.len();
            listeners.retain(|(existing, _)| *existing != id);
            if listeners.len() != before {
                return true;
            }
        }
        false
    }

    /// Calls every matching listener. The table is snapshotted first so a
    /// listener may register or remove listeners while being called.
    pub fn dispatch(&self, event: &ChatEvent) {
        let event_type = event.event_type();
        let targets: Vec<Listener> = {
            let slots = self.lock();
            let typed = if event_type == EventType::Message {
                None
            } else {
                slots.typed.get(&event_type)
            };
            typed
                .into_iter()
                .flatten()
                .chain(slots.catch_all.iter())
                .map(|(_, listener)| Arc::clone(listener))
                .collect()
        };
        for listener in targets {
            listener(event);
        }
    }

    pub fn clear(&self) {
        let mut slots = self.lock();
        slots.typed.clear();
        slots.catch_all.clear();
    }

    pub fn len(&self) -> usize {
        let slots = self.lock();
        slots.catch_all.len() + slots.typed.values().map(Vec::len).sum::<usize>()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> MutexGuard<'_, Slots> {
        self.slots.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
#[path = "tests/listeners_tests.rs"]
mod tests;
