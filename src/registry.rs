//! Reference-counted subscriptions over shared sessions
//!
//! Several consumers (event conditions, CLI watchers) may want the same
//! topic on the same broker. The registry keeps one [`ConnectionSession`] per
//! [`EndpointKey`] and one wire subscription per `(endpoint, topic)`, counting
//! how many consumers hold it. The wire unsubscribe happens only on the 1 -> 0
//! transition, and the session is disconnected and discarded once its
//! endpoint has no entries left.
//!
//! The whole table sits behind one async mutex held for the full operation,
//! wire round-trips included, so concurrent acquire/release calls can never
//! interleave halfway.

use crate::config::{BrokerEndpoint, EndpointKey};
use crate::error::{CogwyrmError, Result};
use crate::network::NetworkMonitor;
use crate::protocol::{check_topic_filter, QoS};
use crate::registry_span;
use crate::session::{ConnectionSession, ConnectionState, MessageCallback, SessionOptions};
use crate::transport::Connector;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn, Instrument};

/// One shared subscription
struct Subscription {
    qos: QoS,
    ref_count: u32,
}

#[derive(Default)]
struct RegistryTable {
    sessions: HashMap<EndpointKey, Arc<ConnectionSession>>,
    entries: HashMap<(EndpointKey, String), Subscription>,
}

impl RegistryTable {
    fn has_entries_for(&self, key: &EndpointKey) -> bool {
        self.entries.keys().any(|(endpoint, _)| endpoint == key)
    }
}

/// Process-wide table of shared sessions and subscriptions
pub struct SubscriptionRegistry {
    connector: Arc<dyn Connector>,
    options: SessionOptions,
    network: Option<NetworkMonitor>,
    table: Mutex<RegistryTable>,
}

impl SubscriptionRegistry {
    pub fn new(connector: Arc<dyn Connector>, options: SessionOptions) -> Self {
        Self {
            connector,
            options,
            network: None,
            table: Mutex::new(RegistryTable::default()),
        }
    }

    /// Sessions created from now on watch this monitor
    pub fn with_network_monitor(mut self, monitor: NetworkMonitor) -> Self {
        self.network = Some(monitor);
        self
    }

    /// Take a reference on `topic` at `endpoint`
    ///
    /// The first reference connects the endpoint's session if needed and
    /// subscribes on the wire with `callback`. Later references only bump
    /// the count; their callback is not registered, the first one stays in
    /// effect. While the session is reconnecting the topic is registered
    /// locally and subscribed by the next successful reconnect.
    pub async fn acquire(
        &self,
        endpoint: &BrokerEndpoint,
        topic: &str,
        qos: QoS,
        callback: MessageCallback,
    ) -> Result<()> {
        check_topic_filter(topic)?;
        let key = endpoint.key();
        let mut table = self.table.lock().await;

        if let Some(entry) = table.entries.get_mut(&(key.clone(), topic.to_string())) {
            entry.ref_count += 1;
            debug!(endpoint = %key, topic, ref_count = entry.ref_count, "Shared subscription reused");
            return Ok(());
        }

        let session = match table.sessions.get(&key) {
            Some(session) => session.clone(),
            None => {
                let session = Arc::new(self.build_session(endpoint));
                table.sessions.insert(key.clone(), session.clone());
                session
            }
        };

        let result = async {
            match session.state() {
                ConnectionState::Connected => {}
                ConnectionState::Reconnecting { .. } => {
                    match session.adopt(topic, qos, callback.clone()).await {
                        // Reconnect landed in between; subscribe on the new link
                        Err(CogwyrmError::NotConnected {
                            state: ConnectionState::Connected,
                        }) => {}
                        deferred => return deferred,
                    }
                }
                _ => session.connect().await?,
            }
            session.subscribe_with(topic, qos, callback).await
        }
        .instrument(registry_span!(endpoint = %key, topic))
        .await;

        if let Err(err) = result {
            if !table.has_entries_for(&key) {
                table.sessions.remove(&key);
                session.disconnect().await;
            }
            return Err(err);
        }

        table.entries.insert(
            (key.clone(), topic.to_string()),
            Subscription { qos, ref_count: 1 },
        );
        info!(endpoint = %key, topic, %qos, "Shared subscription created");
        Ok(())
    }

    /// Drop one reference on `topic` at `endpoint`
    ///
    /// Releasing something never acquired is a no-op. The last release
    /// unsubscribes, and the last entry for an endpoint disconnects it.
    pub async fn release(&self, key: &EndpointKey, topic: &str) -> Result<()> {
        let mut table = self.table.lock().await;
        let entry_key = (key.clone(), topic.to_string());

        let Some(entry) = table.entries.get_mut(&entry_key) else {
            debug!(endpoint = %key, topic, "Release without matching acquire ignored");
            return Ok(());
        };

        entry.ref_count -= 1;
        if entry.ref_count > 0 {
            debug!(endpoint = %key, topic, ref_count = entry.ref_count, "Shared subscription released");
            return Ok(());
        }
        table.entries.remove(&entry_key);

        let Some(session) = table.sessions.get(key).cloned() else {
            return Ok(());
        };

        let outcome = match session.unsubscribe(topic).await {
            Ok(()) => Ok(()),
            Err(CogwyrmError::NotConnected { .. }) => {
                // Link is down; make sure the reconnect does not bring it back
                session.forget(topic).await;
                Ok(())
            }
            Err(err) => {
                warn!(endpoint = %key, topic, error = %err, "Unsubscribe failed");
                session.forget(topic).await;
                Err(err)
            }
        };
        info!(endpoint = %key, topic, "Shared subscription removed");

        if !table.has_entries_for(key) {
            table.sessions.remove(key);
            session.disconnect().await;
            info!(endpoint = %key, "Session discarded, no subscriptions left");
        }

        outcome
    }

    /// Current reference count for `(key, topic)`; zero when absent
    pub async fn ref_count(&self, key: &EndpointKey, topic: &str) -> u32 {
        let table = self.table.lock().await;
        table
            .entries
            .get(&(key.clone(), topic.to_string()))
            .map_or(0, |entry| entry.ref_count)
    }

    /// The live session for `key`, if any consumer still holds one
    pub async fn session(&self, key: &EndpointKey) -> Option<Arc<ConnectionSession>> {
        self.table.lock().await.sessions.get(key).cloned()
    }

    /// Topics with their QoS currently held for `key`
    pub async fn topics(&self, key: &EndpointKey) -> Vec<(String, QoS)> {
        let table = self.table.lock().await;
        table
            .entries
            .iter()
            .filter(|((endpoint, _), _)| endpoint == key)
            .map(|((_, topic), entry)| (topic.clone(), entry.qos))
            .collect()
    }

    /// Disconnect every session and forget all entries
    pub async fn shutdown(&self) {
        let mut table = self.table.lock().await;
        table.entries.clear();
        for (key, session) in table.sessions.drain() {
            session.disconnect().await;
            debug!(endpoint = %key, "Session closed on registry shutdown");
        }
    }

    fn build_session(&self, endpoint: &BrokerEndpoint) -> ConnectionSession {
        let mut builder =
            ConnectionSession::builder(endpoint.clone(), self.connector.clone()).options(self.options);
        if let Some(monitor) = &self.network {
            builder = builder.network_monitor(monitor.clone());
        }
        builder.build()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::Message;
    use crate::error::ConnectionFailure;
    use crate::testing::MockConnector;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn endpoint() -> BrokerEndpoint {
        BrokerEndpoint::new("localhost", 1883)
            .unwrap()
            .with_client_id("registry-test")
    }

    fn noop() -> MessageCallback {
        Arc::new(|_: &Message| {})
    }

    #[tokio::test]
    async fn test_acquire_twice_release_twice_hits_wire_once_each() {
        // Arrange
        let connector = MockConnector::new();
        let registry = SubscriptionRegistry::new(Arc::new(connector.clone()), SessionOptions::default());
        let endpoint = endpoint();
        let key = endpoint.key();

        // Act
        registry.acquire(&endpoint, "a/b", QoS::AtLeastOnce, noop()).await.unwrap();
        registry.acquire(&endpoint, "a/b", QoS::AtLeastOnce, noop()).await.unwrap();
        assert_eq!(registry.ref_count(&key, "a/b").await, 2);

        registry.release(&key, "a/b").await.unwrap();

        // Assert: one reference left, nothing unsubscribed yet
        assert_eq!(connector.subscribe_calls("a/b"), 1);
        assert_eq!(connector.unsubscribe_calls("a/b"), 0);
        assert!(registry.session(&key).await.is_some());

        registry.release(&key, "a/b").await.unwrap();

        assert_eq!(connector.unsubscribe_calls("a/b"), 1);
        assert_eq!(connector.disconnect_calls(), 1);
        assert!(registry.session(&key).await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_acquire_while_reconnecting_subscribes_after_reconnect() {
        // Arrange: a live session that loses its link and fails the first retry
        let connector = MockConnector::new();
        let registry = SubscriptionRegistry::new(Arc::new(connector.clone()), SessionOptions::default());
        let endpoint = endpoint();
        let key = endpoint.key();
        registry.acquire(&endpoint, "a", QoS::AtLeastOnce, noop()).await.unwrap();
        let session = registry.session(&key).await.unwrap();

        connector.fail_next_connects(&[ConnectionFailure::Unreachable]);
        connector.latest_link().unwrap().drop_connection("broker restart").await;
        while !matches!(session.state(), ConnectionState::Reconnecting { .. }) {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }

        // Act
        registry.acquire(&endpoint, "b", QoS::AtLeastOnce, noop()).await.unwrap();

        // Assert: counted now, subscribed once the reconnect lands
        assert_eq!(registry.ref_count(&key, "b").await, 1);
        assert_eq!(connector.subscribe_calls("b"), 0);

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert!(session.is_connected());
        assert_eq!(connector.subscribe_calls("b"), 1);
        assert_eq!(connector.subscribe_calls("a"), 2);
    }

    #[tokio::test]
    async fn test_release_without_acquire_is_noop() {
        let connector = MockConnector::new();
        let registry = SubscriptionRegistry::new(Arc::new(connector.clone()), SessionOptions::default());

        registry.release(&endpoint().key(), "never/acquired").await.unwrap();

        assert!(connector.calls().is_empty());
    }

    #[tokio::test]
    async fn test_session_survives_while_other_topics_remain() {
        let connector = MockConnector::new();
        let registry = SubscriptionRegistry::new(Arc::new(connector.clone()), SessionOptions::default());
        let endpoint = endpoint();
        let key = endpoint.key();

        registry.acquire(&endpoint, "a", QoS::AtMostOnce, noop()).await.unwrap();
        registry.acquire(&endpoint, "b", QoS::AtMostOnce, noop()).await.unwrap();
        registry.release(&key, "a").await.unwrap();

        assert_eq!(connector.connect_attempts(), 1);
        assert_eq!(connector.disconnect_calls(), 0);
        let session = registry.session(&key).await.unwrap();
        assert!(session.is_connected());
        assert_eq!(registry.topics(&key).await.len(), 1);
    }

    #[tokio::test]
    async fn test_first_callback_stays_in_effect() {
        let connector = MockConnector::new();
        let registry = SubscriptionRegistry::new(Arc::new(connector.clone()), SessionOptions::default());
        let endpoint = endpoint();
        let first = Arc::new(AtomicUsize::new(0));
        let second = Arc::new(AtomicUsize::new(0));

        let counter = first.clone();
        registry
            .acquire(&endpoint, "t", QoS::AtMostOnce, Arc::new(move |_: &Message| {
                counter.fetch_add(1, Ordering::SeqCst);
            }))
            .await
            .unwrap();
        let counter = second.clone();
        registry
            .acquire(&endpoint, "t", QoS::AtMostOnce, Arc::new(move |_: &Message| {
                counter.fetch_add(1, Ordering::SeqCst);
            }))
            .await
            .unwrap();

        connector.latest_link().unwrap().deliver("t", "1").await;
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;

        assert_eq!(first.load(Ordering::SeqCst), 1);
        assert_eq!(second.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_failed_subscribe_discards_new_session() {
        let connector = MockConnector::new();
        connector.set_fail_subscribe(true);
        let registry = SubscriptionRegistry::new(Arc::new(connector.clone()), SessionOptions::default());
        let endpoint = endpoint();
        let key = endpoint.key();

        let err = registry
            .acquire(&endpoint, "a", QoS::AtMostOnce, noop())
            .await
            .unwrap_err();

        assert_eq!(err.category(), "wire_operation");
        assert_eq!(registry.ref_count(&key, "a").await, 0);
        assert!(registry.session(&key).await.is_none());
        assert_eq!(connector.disconnect_calls(), 1);
    }

    #[tokio::test]
    async fn test_invalid_topic_rejected_before_network() {
        let connector = MockConnector::new();
        let registry = SubscriptionRegistry::new(Arc::new(connector.clone()), SessionOptions::default());

        let err = registry
            .acquire(&endpoint(), "a/#/b", QoS::AtMostOnce, noop())
            .await
            .unwrap_err();

        assert_eq!(err.category(), "validation");
        assert_eq!(connector.connect_attempts(), 0);
    }

    #[tokio::test]
    async fn test_concurrent_acquire_release_keeps_counts_consistent() {
        let connector = MockConnector::new();
        let registry = Arc::new(SubscriptionRegistry::new(
            Arc::new(connector.clone()),
            SessionOptions::default(),
        ));
        let endpoint = endpoint();
        let key = endpoint.key();

        let mut handles = Vec::new();
        for _ in 0..16 {
            let registry = registry.clone();
            let endpoint = endpoint.clone();
            handles.push(tokio::spawn(async move {
                registry
                    .acquire(&endpoint, "shared", QoS::AtLeastOnce, Arc::new(|_: &Message| {}))
                    .await
            }));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }
        assert_eq!(registry.ref_count(&key, "shared").await, 16);

        let mut handles = Vec::new();
        for _ in 0..16 {
            let registry = registry.clone();
            let key = key.clone();
            handles.push(tokio::spawn(async move { registry.release(&key, "shared").await }));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        assert_eq!(connector.subscribe_calls("shared"), 1);
        assert_eq!(connector.unsubscribe_calls("shared"), 1);
        assert_eq!(connector.disconnect_calls(), 1);
    }
}
