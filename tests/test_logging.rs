//! Tests for logging configuration and format parsing
//!
//! Tests the pure functions in the logging module that handle
//! log format parsing and configuration from environment variables.

use cogwyrm::observability::logging::{parse_level, parse_spans_flag, LogFormat};
use tracing::Level;

#[test]
fn test_log_format_parse_is_case_insensitive() {
    assert_eq!(LogFormat::parse("json"), LogFormat::Json);
    assert_eq!(LogFormat::parse("Pretty"), LogFormat::Pretty);
    assert_eq!(LogFormat::parse("COMPACT"), LogFormat::Compact);
}

#[test]
fn test_log_format_parse_whitespace_falls_back_to_json() {
    // Untrimmed values are not recognised
    assert_eq!(LogFormat::parse("  pretty  "), LogFormat::Json);
    assert_eq!(LogFormat::parse("compact\n"), LogFormat::Json);
}

#[test]
fn test_log_level_defaults_to_info() {
    assert_eq!(parse_level("verbose"), Level::INFO);
    assert_eq!(parse_level("123"), Level::INFO);
    assert_eq!(parse_level("warn"), Level::WARN);
}

#[test]
fn test_spans_flag() {
    assert!(parse_spans_flag("TRUE"));
    assert!(!parse_spans_flag("on"));
}

#[test]
fn test_span_macros_build_spans() {
    let endpoint = "mqtt://localhost:1883";
    let _mqtt = cogwyrm::mqtt_span!(endpoint = %endpoint);
    let _session = cogwyrm::session_span!(endpoint = %endpoint, generation = 1u64);
    let _registry = cogwyrm::registry_span!(topic = "a/b");
}
