//! MQTT 3.1.1 transport backed by rumqttc
//!
//! This module separates pure functions from I/O operations for better
//! testability.
//!
//! # Architecture
//!
//! - [`connection`] - Pure option building, QoS mapping and error classification
//! - [`message_handler`] - Pure event routing and acknowledgement bookkeeping
//! - [`client`] - Impure I/O: connect, event loop driver, request/ack round trips
//!
//! # Usage
//!
//! ```rust,no_run
//! use cogwyrm::config::BrokerEndpoint;
//! use cogwyrm::session::ConnectionSession;
//! use cogwyrm::transport::mqtt::RumqttcConnector;
//! use std::sync::Arc;
//!
//! # tokio_test::block_on(async {
//! let endpoint = BrokerEndpoint::from_url("mqtt://localhost:1883")?;
//! let session = ConnectionSession::new(endpoint, Arc::new(RumqttcConnector::new()));
//! session.connect().await?;
//! session.publish("home/light", "on", Default::default(), false).await?;
//! session.disconnect().await;
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! # });
//! ```

pub mod client;
pub mod connection;
pub mod message_handler;

// Re-export public types for convenience
pub use client::{RumqttcConnector, RumqttcTransport};
pub use connection::{classify_connection_error, configure_mqtt_options};
pub use message_handler::{AckKind, AckTracker, EventRoute, MessageHandler};
