//! Consumer-side event conditions
//!
//! A condition holds its own topic filter, independent of whatever filter
//! was used to subscribe on the broker. Several conditions can share one
//! broad subscription and each decide locally whether a delivery is theirs.

use crate::error::Result;
use crate::protocol::{check_topic_filter, topic_matches_pattern, EventOutput, Message};
use tracing::debug;

/// Trigger that fires for messages whose topic matches `filter`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventCondition {
    filter: String,
}

impl EventCondition {
    /// Fails with a validation error when `filter` is not a valid topic filter
    pub fn new(filter: impl Into<String>) -> Result<Self> {
        let filter = filter.into();
        check_topic_filter(&filter)?;
        Ok(Self { filter })
    }

    pub fn filter(&self) -> &str {
        &self.filter
    }

    pub fn matches(&self, topic: &str) -> bool {
        topic_matches_pattern(&self.filter, topic)
    }

    /// Output variables for `message`, or `None` when the condition does not fire
    pub fn evaluate(&self, message: &Message) -> Option<EventOutput> {
        if !self.matches(&message.topic) {
            debug!(filter = %self.filter, topic = %message.topic, "Condition not met");
            return None;
        }
        Some(EventOutput::from(message))
    }
}
