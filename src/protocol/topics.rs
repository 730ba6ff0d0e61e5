//! MQTT topic filter validation and wildcard matching
//!
//! Filters are split on `/` into levels. `+` stands for exactly one level and
//! must occupy a whole level; `#` stands for the rest of the topic and must be
//! the whole final level. Everything here is pure and allocation-light so the
//! dispatch path can call it per message.

use crate::error::{CogwyrmError, Result};

const SINGLE_LEVEL_WILDCARD: &str = "+";
const MULTI_LEVEL_WILDCARD: &str = "#";

/// Reason a topic filter was rejected
fn filter_violation(topic: &str) -> Option<String> {
    if topic.is_empty() {
        return Some("topic must not be empty".to_string());
    }
    if topic.contains('\0') {
        return Some("topic must not contain NUL".to_string());
    }

    let levels: Vec<&str> = topic.split('/').collect();
    let last = levels.len() - 1;

    for (index, level) in levels.iter().enumerate() {
        if level.is_empty() && index > 0 {
            return Some(format!("empty level at position {index} in '{topic}'"));
        }
        if level.contains('#') && (*level != MULTI_LEVEL_WILDCARD || index != last) {
            return Some(format!(
                "'#' must occupy the whole final level in '{topic}'"
            ));
        }
        if level.contains('+') && *level != SINGLE_LEVEL_WILDCARD {
            return Some(format!("'+' must occupy a whole level in '{topic}'"));
        }
    }

    None
}

/// Check a topic filter against the MQTT wildcard rules
///
/// Rejects the empty string, NUL, an empty level after the first (so `a//b`
/// and `a/` fail while `/a` passes), `#` anywhere but as the whole last level,
/// and `+` sharing a level with other characters.
pub fn validate_topic(topic: &str) -> bool {
    filter_violation(topic).is_none()
}

/// [`validate_topic`] with the reason attached, for surfacing to callers
pub fn check_topic_filter(topic: &str) -> Result<()> {
    match filter_violation(topic) {
        Some(reason) => Err(CogwyrmError::validation(reason)),
        None => Ok(()),
    }
}

/// Validate a concrete topic for publishing: a valid filter with no wildcards
pub fn check_topic_name(topic: &str) -> Result<()> {
    check_topic_filter(topic)?;
    if topic.contains(['+', '#']) {
        return Err(CogwyrmError::validation(format!(
            "wildcards are not allowed when publishing to '{topic}'"
        )));
    }
    Ok(())
}

/// True when `topic` matches the filter `pattern`
///
/// Both sides must pass [`validate_topic`]. Literal levels compare byte-wise,
/// `+` consumes one level, and a trailing `#` consumes whatever is left,
/// including nothing (`a/#` matches `a`).
pub fn topic_matches_pattern(pattern: &str, topic: &str) -> bool {
    if !validate_topic(pattern) || !validate_topic(topic) {
        return false;
    }

    let mut pattern_levels = pattern.split('/');
    let mut topic_levels = topic.split('/');

    loop {
        match (pattern_levels.next(), topic_levels.next()) {
            (Some(MULTI_LEVEL_WILDCARD), _) => return true,
            (Some(SINGLE_LEVEL_WILDCARD), Some(_)) => {}
            (Some(expected), Some(actual)) if expected == actual => {}
            (None, None) => return true,
            (Some(_), None) | (None, Some(_)) | (Some(_), Some(_)) => return false,
        }
    }
}

/// True when the filter contains a wildcard level
pub fn is_wildcard_filter(pattern: &str) -> bool {
    pattern
        .split('/')
        .any(|level| level == SINGLE_LEVEL_WILDCARD || level == MULTI_LEVEL_WILDCARD)
}

/// Short usage text for topic wildcards
pub fn wildcard_help() -> &'static str {
    "Topic wildcards:\n\
     + = single level (e.g., \"home/+/temp\" matches \"home/kitchen/temp\")\n\
     # = multi level (e.g., \"home/#\" matches \"home/kitchen/temp\")\n\
     \n\
     Examples:\n\
     home/+/temperature   - any room's temperature\n\
     home/kitchen/+       - any kitchen sensor\n\
     home/#               - everything under home"
}
