//! Per-topic callback table used to route incoming messages

use crate::protocol::{topic_matches_pattern, Message, QoS};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;

/// Callback invoked for each delivered message
pub type MessageCallback = Arc<dyn Fn(&Message) + Send + Sync>;

/// How incoming topics are looked up in the table
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DispatchMode {
    /// Exact key first, then every registered filter the topic matches
    ///
    /// Matching is per delivery. A broker that sends one copy per matching
    /// subscription (overlapping `home/#` and `home/kitchen`) makes every
    /// matching callback run once per copy; MQTT 3.1.1 does not say which
    /// subscription a copy belongs to, so the copies cannot be told apart here.
    #[default]
    Filter,
    /// Only the registration whose key equals the delivery topic
    Exact,
}

/// One subscribed topic filter
#[derive(Clone)]
pub struct Registration {
    pub qos: QoS,
    pub callback: MessageCallback,
}

impl std::fmt::Debug for Registration {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registration").field("qos", &self.qos).finish()
    }
}

/// Map from subscribed topic filter to its callback
#[derive(Debug, Default)]
pub struct DispatchTable {
    mode: DispatchMode,
    entries: HashMap<String, Registration>,
}

impl DispatchTable {
    pub fn new(mode: DispatchMode) -> Self {
        Self {
            mode,
            entries: HashMap::new(),
        }
    }

    pub fn mode(&self) -> DispatchMode {
        self.mode
    }

    /// Register `topic`, returning what it replaced so a failed subscribe can roll back
    pub fn insert(&mut self, topic: &str, registration: Registration) -> Option<Registration> {
        self.entries.insert(topic.to_string(), registration)
    }

    /// Put back what [`insert`](Self::insert) displaced
    pub fn restore(&mut self, topic: &str, previous: Option<Registration>) {
        match previous {
            Some(registration) => {
                self.entries.insert(topic.to_string(), registration);
            }
            None => {
                self.entries.remove(topic);
            }
        }
    }

    pub fn remove(&mut self, topic: &str) -> Option<Registration> {
        self.entries.remove(topic)
    }

    pub fn contains(&self, topic: &str) -> bool {
        self.entries.contains_key(topic)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    /// Callbacks that should see a delivery on `topic`
    ///
    /// The exact registration comes first; in filter mode wildcard
    /// registrations follow in no particular order.
    pub fn callbacks_for(&self, topic: &str) -> Vec<MessageCallback> {
        let mut callbacks = Vec::new();

        if let Some(exact) = self.entries.get(topic) {
            callbacks.push(exact.callback.clone());
        }

        if self.mode == DispatchMode::Filter {
            callbacks.extend(
                self.entries
                    .iter()
                    .filter(|(filter, _)| filter.as_str() != topic)
                    .filter(|(filter, _)| topic_matches_pattern(filter, topic))
                    .map(|(_, registration)| registration.callback.clone()),
            );
        }

        callbacks
    }

    /// Every registered filter with its QoS, for resubscribing after reconnect
    pub fn subscriptions(&self) -> Vec<(String, QoS)> {
        self.entries
            .iter()
            .map(|(topic, registration)| (topic.clone(), registration.qos))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn counting_callback(counter: &Arc<AtomicUsize>) -> Registration {
        let counter = counter.clone();
        Registration {
            qos: QoS::AtLeastOnce,
            callback: Arc::new(move |_: &Message| {
                counter.fetch_add(1, Ordering::SeqCst);
            }),
        }
    }

    fn fire(table: &DispatchTable, topic: &str) {
        let message = Message::incoming(topic, "x", QoS::AtMostOnce, false);
        for callback in table.callbacks_for(topic) {
            callback(&message);
        }
    }

    #[test]
    fn test_exact_mode_ignores_wildcard_registrations() {
        let hits = Arc::new(AtomicUsize::new(0));
        let mut table = DispatchTable::new(DispatchMode::Exact);
        table.insert("a/+/b", counting_callback(&hits));

        fire(&table, "a/x/b");
        assert_eq!(hits.load(Ordering::SeqCst), 0);

        fire(&table, "a/+/b");
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_filter_mode_matches_wildcards() {
        let temperature = Arc::new(AtomicUsize::new(0));
        let mut table = DispatchTable::new(DispatchMode::Filter);
        table.insert("sensors/+/temperature", counting_callback(&temperature));

        fire(&table, "sensors/kitchen/temperature");
        fire(&table, "sensors/kitchen/humidity");

        assert_eq!(temperature.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_exact_and_wildcard_both_fire_once() {
        let exact = Arc::new(AtomicUsize::new(0));
        let wildcard = Arc::new(AtomicUsize::new(0));
        let mut table = DispatchTable::default();
        table.insert("home/kitchen", counting_callback(&exact));
        table.insert("home/#", counting_callback(&wildcard));

        assert_eq!(table.callbacks_for("home/kitchen").len(), 2);
        fire(&table, "home/kitchen");

        assert_eq!(exact.load(Ordering::SeqCst), 1);
        assert_eq!(wildcard.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_overlapping_filters_fire_once_per_broker_copy() {
        // Arrange
        let exact = Arc::new(AtomicUsize::new(0));
        let wildcard = Arc::new(AtomicUsize::new(0));
        let mut table = DispatchTable::default();
        table.insert("home/kitchen", counting_callback(&exact));
        table.insert("home/#", counting_callback(&wildcard));

        // Act: a broker delivering one copy per matching subscription
        fire(&table, "home/kitchen");
        fire(&table, "home/kitchen");

        // Assert
        assert_eq!(exact.load(Ordering::SeqCst), 2);
        assert_eq!(wildcard.load(Ordering::SeqCst), 2);

        // Exact mode keeps the wildcard registration silent
        let wildcard_exact = Arc::new(AtomicUsize::new(0));
        let mut exact_table = DispatchTable::new(DispatchMode::Exact);
        exact_table.insert("home/#", counting_callback(&wildcard_exact));
        fire(&exact_table, "home/kitchen");
        assert_eq!(wildcard_exact.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_last_registration_wins_and_restore_rolls_back() {
        let first = Arc::new(AtomicUsize::new(0));
        let second = Arc::new(AtomicUsize::new(0));
        let mut table = DispatchTable::default();

        table.insert("t", counting_callback(&first));
        let previous = table.insert("t", counting_callback(&second));
        fire(&table, "t");
        assert_eq!(first.load(Ordering::SeqCst), 0);
        assert_eq!(second.load(Ordering::SeqCst), 1);

        table.restore("t", previous);
        fire(&table, "t");
        assert_eq!(first.load(Ordering::SeqCst), 1);

        let previous = table.insert("new", counting_callback(&second));
        table.restore("new", previous);
        assert!(!table.contains("new"));
    }

    #[test]
    fn test_subscriptions_and_clear() {
        let hits = Arc::new(AtomicUsize::new(0));
        let mut table = DispatchTable::default();
        table.insert("a", counting_callback(&hits));
        table.insert("b/#", counting_callback(&hits));

        let mut topics: Vec<String> = table.subscriptions().into_iter().map(|(t, _)| t).collect();
        topics.sort();
        assert_eq!(topics, vec!["a".to_string(), "b/#".to_string()]);

        table.clear();
        assert!(table.is_empty());
    }
}
