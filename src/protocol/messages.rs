//! Message types shared by the session, the event condition and the history
//!
//! A [`Message`] is ephemeral: it is produced by a broker delivery or by a
//! publish call and handed to callbacks. Nothing in the core retains it.

use crate::error::{CogwyrmError, Result};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// MQTT delivery guarantee level
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(try_from = "u8", into = "u8")]
pub enum QoS {
    /// At most once
    AtMostOnce,
    /// At least once
    #[default]
    AtLeastOnce,
    /// Exactly once
    ExactlyOnce,
}

impl TryFrom<u8> for QoS {
    type Error = CogwyrmError;

    fn try_from(level: u8) -> Result<Self> {
        match level {
            0 => Ok(QoS::AtMostOnce),
            1 => Ok(QoS::AtLeastOnce),
            2 => Ok(QoS::ExactlyOnce),
            other => Err(CogwyrmError::validation(format!(
                "QoS must be 0, 1 or 2, got {other}"
            ))),
        }
    }
}

impl From<QoS> for u8 {
    fn from(qos: QoS) -> u8 {
        match qos {
            QoS::AtMostOnce => 0,
            QoS::AtLeastOnce => 1,
            QoS::ExactlyOnce => 2,
        }
    }
}

impl fmt::Display for QoS {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", u8::from(*self))
    }
}

/// Whether a message came from the broker or was sent by us
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Incoming,
    Outgoing,
}

/// A single MQTT application message
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    pub topic: String,
    pub payload: Bytes,
    pub qos: QoS,
    pub retained: bool,
    pub direction: Direction,
    pub timestamp: DateTime<Utc>,
}

impl Message {
    /// Message delivered by the broker
    pub fn incoming(topic: impl Into<String>, payload: impl Into<Bytes>, qos: QoS, retained: bool) -> Self {
        Self {
            topic: topic.into(),
            payload: payload.into(),
            qos,
            retained,
            direction: Direction::Incoming,
            timestamp: Utc::now(),
        }
    }

    /// Message we are about to publish
    pub fn outgoing(topic: impl Into<String>, payload: impl Into<Bytes>, qos: QoS, retained: bool) -> Self {
        Self {
            topic: topic.into(),
            payload: payload.into(),
            qos,
            retained,
            direction: Direction::Outgoing,
            timestamp: Utc::now(),
        }
    }

    /// Payload decoded as UTF-8, with invalid sequences replaced
    pub fn payload_text(&self) -> String {
        String::from_utf8_lossy(&self.payload).into_owned()
    }
}

/// Variables emitted when an event condition fires
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventOutput {
    pub topic: String,
    pub payload: String,
    /// RFC 3339 arrival time
    pub timestamp: String,
}

impl From<&Message> for EventOutput {
    fn from(message: &Message) -> Self {
        Self {
            topic: message.topic.clone(),
            payload: message.payload_text(),
            timestamp: message.timestamp.to_rfc3339(),
        }
    }
}
