//! Mock connector and transport for testing
//!
//! The [`MockConnector`] hands out [`MockTransport`] links whose every wire
//! call is recorded in a shared log. Tests drive the broker side through
//! [`MockLink`]: deliver messages or drop the connection.

use crate::config::BrokerEndpoint;
use crate::error::{CogwyrmError, ConnectionFailure, Result, WireOperation};
use crate::protocol::{Message, QoS};
use crate::transport::{ConnectOptions, Connector, Transport, WireEvent, WireLink};
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;

/// One recorded wire interaction
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WireCall {
    Connect { client_id: String },
    Publish {
        topic: String,
        payload: Bytes,
        qos: QoS,
        retained: bool,
    },
    Subscribe { topic: String, qos: QoS },
    Unsubscribe { topic: String },
    Disconnect,
}

#[derive(Debug, Default)]
struct MockState {
    calls: Mutex<Vec<WireCall>>,
    connect_script: Mutex<VecDeque<ConnectionFailure>>,
    connect_attempts: AtomicUsize,
    connect_delay: Mutex<Option<Duration>>,
    links: Mutex<Vec<MockLink>>,
    fail_publish: AtomicBool,
    fail_subscribe: AtomicBool,
    fail_unsubscribe: AtomicBool,
}

impl MockState {
    fn record(&self, call: WireCall) {
        self.calls
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(call);
    }
}

/// Scriptable connector; connects succeed unless failures are queued
#[derive(Debug, Clone, Default)]
pub struct MockConnector {
    state: Arc<MockState>,
}

impl MockConnector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next connects fail, in order, with these kinds
    pub fn fail_next_connects(&self, failures: &[ConnectionFailure]) {
        let mut script = self.state.connect_script.lock().unwrap_or_else(|p| p.into_inner());
        script.extend(failures.iter().copied());
    }

    /// Hold every connect for `delay` before answering
    pub fn set_connect_delay(&self, delay: Option<Duration>) {
        *self.state.connect_delay.lock().unwrap_or_else(|p| p.into_inner()) = delay;
    }

    pub fn set_fail_publish(&self, fail: bool) {
        self.state.fail_publish.store(fail, Ordering::SeqCst);
    }

    pub fn set_fail_subscribe(&self, fail: bool) {
        self.state.fail_subscribe.store(fail, Ordering::SeqCst);
    }

    pub fn set_fail_unsubscribe(&self, fail: bool) {
        self.state.fail_unsubscribe.store(fail, Ordering::SeqCst);
    }

    /// Connect calls seen so far, successful or not
    pub fn connect_attempts(&self) -> usize {
        self.state.connect_attempts.load(Ordering::SeqCst)
    }

    pub fn calls(&self) -> Vec<WireCall> {
        self.state
            .calls
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .clone()
    }

    pub fn subscribe_calls(&self, topic: &str) -> usize {
        self.count(|call| matches!(call, WireCall::Subscribe { topic: t, .. } if t == topic))
    }

    pub fn unsubscribe_calls(&self, topic: &str) -> usize {
        self.count(|call| matches!(call, WireCall::Unsubscribe { topic: t } if t == topic))
    }

    pub fn publish_calls(&self) -> usize {
        self.count(|call| matches!(call, WireCall::Publish { .. }))
    }

    pub fn disconnect_calls(&self) -> usize {
        self.count(|call| matches!(call, WireCall::Disconnect))
    }

    pub fn count(&self, predicate: impl Fn(&WireCall) -> bool) -> usize {
        self.calls().iter().filter(|call| predicate(call)).count()
    }

    /// Broker-side handle of the most recent successful connect
    pub fn latest_link(&self) -> Option<MockLink> {
        self.state
            .links
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .last()
            .cloned()
    }
}

#[async_trait]
impl Connector for MockConnector {
    async fn connect(&self, endpoint: &BrokerEndpoint, _options: &ConnectOptions) -> Result<WireLink> {
        self.state.connect_attempts.fetch_add(1, Ordering::SeqCst);

        let delay = *self.state.connect_delay.lock().unwrap_or_else(|p| p.into_inner());
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let scripted = self
            .state
            .connect_script
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .pop_front();
        if let Some(kind) = scripted {
            return Err(CogwyrmError::connection(kind, "scripted connect failure"));
        }

        let (events, receiver) = mpsc::channel(64);
        let link = MockLink { events };
        self.state
            .links
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .push(link);
        self.state.record(WireCall::Connect {
            client_id: endpoint.client_id().to_string(),
        });

        Ok(WireLink {
            transport: Arc::new(MockTransport {
                state: self.state.clone(),
            }),
            events: receiver,
        })
    }
}

/// Broker side of one mock link
#[derive(Debug, Clone)]
pub struct MockLink {
    events: mpsc::Sender<WireEvent>,
}

impl MockLink {
    /// Deliver a message as if the broker had routed it to us
    pub async fn deliver(&self, topic: &str, payload: &'static str) -> bool {
        let message = Message::incoming(topic, payload, QoS::AtMostOnce, false);
        self.events.send(WireEvent::Message(message)).await.is_ok()
    }

    /// Report the link as lost with `cause`
    pub async fn drop_connection(&self, cause: &str) -> bool {
        self.events
            .send(WireEvent::ConnectionLost(cause.to_string()))
            .await
            .is_ok()
    }
}

/// Transport that records calls instead of talking to a broker
#[derive(Debug)]
pub struct MockTransport {
    state: Arc<MockState>,
}

#[async_trait]
impl Transport for MockTransport {
    async fn publish(&self, topic: &str, payload: Bytes, qos: QoS, retained: bool) -> Result<()> {
        self.state.record(WireCall::Publish {
            topic: topic.to_string(),
            payload,
            qos,
            retained,
        });
        if self.state.fail_publish.load(Ordering::SeqCst) {
            return Err(CogwyrmError::wire(WireOperation::Publish, topic, "mock publish failure"));
        }
        Ok(())
    }

    async fn subscribe(&self, topic: &str, qos: QoS) -> Result<()> {
        self.state.record(WireCall::Subscribe {
            topic: topic.to_string(),
            qos,
        });
        if self.state.fail_subscribe.load(Ordering::SeqCst) {
            return Err(CogwyrmError::wire(
                WireOperation::Subscribe,
                topic,
                "mock suback failure",
            ));
        }
        Ok(())
    }

    async fn unsubscribe(&self, topic: &str) -> Result<()> {
        self.state.record(WireCall::Unsubscribe {
            topic: topic.to_string(),
        });
        if self.state.fail_unsubscribe.load(Ordering::SeqCst) {
            return Err(CogwyrmError::wire(
                WireOperation::Unsubscribe,
                topic,
                "mock unsuback failure",
            ));
        }
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        self.state.record(WireCall::Disconnect);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_mock_connector_records_calls() {
        let connector = MockConnector::new();
        let endpoint = BrokerEndpoint::new("localhost", 1883)
            .unwrap()
            .with_client_id("mock-client");

        let link = connector
            .connect(&endpoint, &ConnectOptions::default())
            .await
            .unwrap();
        link.transport.subscribe("a/b", QoS::AtLeastOnce).await.unwrap();
        link.transport.disconnect().await.unwrap();

        assert_eq!(connector.connect_attempts(), 1);
        assert_eq!(connector.subscribe_calls("a/b"), 1);
        assert_eq!(connector.disconnect_calls(), 1);
        assert_eq!(
            connector.calls()[0],
            WireCall::Connect {
                client_id: "mock-client".to_string()
            }
        );
    }

    #[tokio::test]
    async fn test_scripted_failures_are_consumed_in_order() {
        let connector = MockConnector::new();
        connector.fail_next_connects(&[ConnectionFailure::AuthFailed, ConnectionFailure::Timeout]);
        let endpoint = BrokerEndpoint::new("localhost", 1883).unwrap();
        let options = ConnectOptions::default();

        let first = connector.connect(&endpoint, &options).await.unwrap_err();
        let second = connector.connect(&endpoint, &options).await.unwrap_err();
        let third = connector.connect(&endpoint, &options).await;

        assert_eq!(first.connection_failure(), Some(ConnectionFailure::AuthFailed));
        assert_eq!(second.connection_failure(), Some(ConnectionFailure::Timeout));
        assert!(third.is_ok());
        assert_eq!(connector.connect_attempts(), 3);
    }

    #[tokio::test]
    async fn test_mock_link_delivers_messages() {
        let connector = MockConnector::new();
        let endpoint = BrokerEndpoint::new("localhost", 1883).unwrap();
        let mut link = connector
            .connect(&endpoint, &ConnectOptions::default())
            .await
            .unwrap();

        let broker = connector.latest_link().unwrap();
        assert!(broker.deliver("x/y", "hello").await);

        match link.events.recv().await {
            Some(WireEvent::Message(message)) => {
                assert_eq!(message.topic, "x/y");
                assert_eq!(message.payload_text(), "hello");
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }
}
