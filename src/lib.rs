//! Cogwyrm - MQTT session core
//!
//! The connection layer behind the Cogwyrm automation plugin: validated topic
//! matching, a reconnecting broker session with exponential backoff, shared
//! reference-counted subscriptions, and network reachability hooks.
//!
//! # Overview
//!
//! - [`protocol`] - topic validation and wildcard matching, message types
//! - [`session`] - [`ConnectionSession`] state machine, retry policy, dispatch
//! - [`registry`] - [`SubscriptionRegistry`] sharing sessions between consumers
//! - [`network`] - reachability monitor that short-circuits backoff
//! - [`transport`] - connector/transport seam, rumqttc implementation
//! - [`condition`] and [`history`] - consumer-side helpers
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use cogwyrm::config::BrokerEndpoint;
//! use cogwyrm::protocol::{Message, QoS};
//! use cogwyrm::session::ConnectionSession;
//! use cogwyrm::transport::mqtt::RumqttcConnector;
//! use std::sync::Arc;
//!
//! # tokio_test::block_on(async {
//! let endpoint = BrokerEndpoint::from_url("mqtt://test.mosquitto.org:1883")?;
//! let session = ConnectionSession::new(endpoint, Arc::new(RumqttcConnector::new()));
//!
//! session.connect().await?;
//! session
//!     .subscribe("sensors/+/temperature", QoS::AtLeastOnce, |message: &Message| {
//!         println!("{} = {}", message.topic, message.payload_text());
//!     })
//!     .await?;
//! session.publish("sensors/kitchen/temperature", "21.5", QoS::AtLeastOnce, false).await?;
//! session.disconnect().await;
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! # });
//! ```

pub mod condition;
pub mod config;
pub mod error;
pub mod history;
pub mod network;
pub mod observability;
pub mod protocol;
pub mod registry;
pub mod session;
pub mod testing;
pub mod transport;

pub use condition::EventCondition;
pub use config::{BrokerEndpoint, CogwyrmConfig, ConfigError};
pub use error::{CogwyrmError, ConnectionFailure, Result};
pub use history::MessageHistory;
pub use network::{NetworkMonitor, Reachability};
pub use protocol::{topic_matches_pattern, validate_topic, EventOutput, Message, QoS};
pub use registry::SubscriptionRegistry;
pub use session::{ConnectionSession, ConnectionState, RetryPolicy, SessionEvent, SessionOptions};
pub use transport::mqtt::RumqttcConnector;
