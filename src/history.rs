//! Bounded in-memory message history
//!
//! Keeps the most recent messages in both directions for display. Nothing is
//! written to storage; the oldest entry is evicted once the ring is full.

use crate::protocol::{Direction, Message};
use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard};

pub const DEFAULT_HISTORY_CAPACITY: usize = 100;

/// Thread-safe ring of recent messages, newest last
#[derive(Debug)]
pub struct MessageHistory {
    capacity: usize,
    entries: Mutex<VecDeque<Message>>,
}

impl Default for MessageHistory {
    fn default() -> Self {
        Self::with_capacity(DEFAULT_HISTORY_CAPACITY)
    }
}

impl MessageHistory {
    pub fn new() -> Self {
        Self::default()
    }

    /// A capacity of zero is raised to one
    pub fn with_capacity(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            entries: Mutex::new(VecDeque::with_capacity(capacity)),
        }
    }

    fn lock(&self) -> MutexGuard<'_, VecDeque<Message>> {
        self.entries.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn record(&self, message: Message) {
        let mut entries = self.lock();
        if entries.len() == self.capacity {
            entries.pop_front();
        }
        entries.push_back(message);
    }

    /// Snapshot, oldest first
    pub fn entries(&self) -> Vec<Message> {
        self.lock().iter().cloned().collect()
    }

    pub fn incoming(&self) -> Vec<Message> {
        self.by_direction(Direction::Incoming)
    }

    pub fn outgoing(&self) -> Vec<Message> {
        self.by_direction(Direction::Outgoing)
    }

    fn by_direction(&self, direction: Direction) -> Vec<Message> {
        self.lock()
            .iter()
            .filter(|message| message.direction == direction)
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    pub fn clear(&self) {
        self.lock().clear();
    }
}
