use std::collections::VecDeque;
use std::sync::Mutex;

use crate::event::{LifecycleEvent, LifecycleObserver};

/// A simple FIFO queue of lifecycle events.
///
/// Wrapped in a `Mutex` it is a [`LifecycleObserver`]: the host publishes as
/// steps happen and the owner drains later, in order.
pub struct EventBus {
    queue: VecDeque<LifecycleEvent>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    /// Create an empty event bus.
    pub fn new() -> Self {
        Self {
            queue: VecDeque::new(),
        }
    }

    /// Enqueue an event at the back of the queue.
    pub fn publish(&mut self, event: LifecycleEvent) {
        self.queue.push_back(event);
    }

    /// Remove and return all pending events, preserving insertion order.
    pub fn drain(&mut self) -> Vec<LifecycleEvent> {
        self.queue.drain(..).collect()
    }

    /// Return `true` if the queue contains at least one event.
    pub fn has_pending(&self) -> bool {
        !self.queue.is_empty()
    }
}

impl LifecycleObserver for Mutex<EventBus> {
    fn observe(&self, event: LifecycleEvent) {
        if let Ok(mut bus) = self.lock() {
            bus.publish(event);
        }
    }
}
