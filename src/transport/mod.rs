//! Transport seam between the session logic and the MQTT wire
//!
//! A [`Connector`] opens one physical link per call and hands back a
//! [`WireLink`]: a [`Transport`] for outgoing operations plus a channel of
//! [`WireEvent`]s for deliveries and loss. The session never sees the
//! underlying client library, which is what lets tests swap in
//! [`crate::testing::MockConnector`].

use crate::config::BrokerEndpoint;
use crate::error::Result;
use crate::protocol::{Message, QoS};
use bytes::Bytes;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

pub mod mqtt;

/// Options a connector needs to establish one link
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectOptions {
    pub keep_alive: Duration,
    pub connection_timeout: Duration,
    pub operation_timeout: Duration,
    pub clean_session: bool,
}

impl Default for ConnectOptions {
    fn default() -> Self {
        Self {
            keep_alive: Duration::from_secs(60),
            connection_timeout: Duration::from_secs(30),
            operation_timeout: Duration::from_secs(10),
            clean_session: true,
        }
    }
}

/// Something that arrived from the broker side of a link
#[derive(Debug, Clone)]
pub enum WireEvent {
    /// Application message on a subscribed topic
    Message(Message),
    /// The link is gone; no further events follow
    ConnectionLost(String),
}

/// A freshly established link
pub struct WireLink {
    pub transport: Arc<dyn Transport>,
    pub events: mpsc::Receiver<WireEvent>,
}

impl std::fmt::Debug for WireLink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WireLink").finish_non_exhaustive()
    }
}

/// Opens links to a broker
#[async_trait::async_trait]
pub trait Connector: Send + Sync {
    /// Connect and wait for the broker's acknowledgement
    async fn connect(&self, endpoint: &BrokerEndpoint, options: &ConnectOptions) -> Result<WireLink>;
}

/// Outgoing operations on one live link
///
/// Every call resolves once the broker acknowledges (or refuses) it.
#[async_trait::async_trait]
pub trait Transport: Send + Sync {
    async fn publish(&self, topic: &str, payload: Bytes, qos: QoS, retained: bool) -> Result<()>;

    async fn subscribe(&self, topic: &str, qos: QoS) -> Result<()>;

    async fn unsubscribe(&self, topic: &str) -> Result<()>;

    /// Send DISCONNECT and release the link
    async fn disconnect(&self) -> Result<()>;
}
