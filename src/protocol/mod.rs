//! MQTT message model and topic rules

pub mod messages;
pub mod topics;

pub use messages::{Direction, EventOutput, Message, QoS};
pub use topics::{
    check_topic_filter, check_topic_name, is_wildcard_filter, topic_matches_pattern,
    validate_topic, wildcard_help,
};
