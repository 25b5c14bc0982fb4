// src/events/timers.rs

use std::collections::BTreeMap;

use crate::events::{EventKey, HandlerContext};
use crate::timer::RetryTimer;

pub type EventTimer = RetryTimer<HandlerContext>;

/// Pending handler timers keyed by [`EventKey`].
///
/// Every mutation sets the `updated` flag so persistence can be batched by
/// whoever owns the registry.
#[derive(Debug, Default)]
pub struct EventTimers {
    timers: BTreeMap<EventKey, EventTimer>,
    updated: bool,
}

impl EventTimers {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert unless a timer for `key` already exists.
    pub fn add(&mut self, key: EventKey, timer: EventTimer) -> bool {
        if self.timers.contains_key(&key) {
            return false;
        }
        self.timers.insert(key, timer);
        self.updated = true;
        true
    }

    pub fn remove(&mut self, key: &EventKey) -> Option<EventTimer> {
        let removed = self.timers.remove(key);
        if removed.is_some() {
            self.updated = true;
        }
        removed
    }

    pub fn set_waiting(&mut self, key: &EventKey) {
        if let Some(t) = self.timers.get_mut(key) {
            t.set_waiting();
            self.updated = true;
        }
    }

    pub fn unset_waiting(&mut self, key: &EventKey) {
        if let Some(t) = self.timers.get_mut(key) {
            t.unset_waiting();
            self.updated = true;
        }
    }

    /// Back to square one: no delay consumed, not waiting.
    pub fn reset(&mut self, key: &EventKey) {
        if let Some(t) = self.timers.get_mut(key) {
            t.reset();
            self.updated = true;
        }
    }

    pub fn get(&self, key: &EventKey) -> Option<&EventTimer> {
        self.timers.get(key)
    }

    pub(crate) fn get_mut(&mut self, key: &EventKey) -> Option<&mut EventTimer> {
        self.timers.get_mut(key)
    }

    pub fn contains(&self, key: &EventKey) -> bool {
        self.timers.contains_key(key)
    }

    pub fn keys(&self) -> impl Iterator<Item = &EventKey> {
        self.timers.keys()
    }

    pub fn len(&self) -> usize {
        self.timers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.timers.is_empty()
    }

    /// Return and clear the `updated` flag.
    pub fn take_updated(&mut self) -> bool {
        std::mem::take(&mut self.updated)
    }
}
