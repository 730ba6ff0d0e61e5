//! Configuration loading and validation tests
//!
//! Tests focus on BEHAVIOR of configuration loading, validation, and error handling.
//! We test observable outcomes, not implementation details of TOML parsing.

use cogwyrm::config::{CogwyrmConfig, ConfigError};
use cogwyrm::session::DispatchMode;
use std::io::Write;
use std::time::Duration;
use tempfile::NamedTempFile;

fn write_config(contents: &str) -> NamedTempFile {
    let mut temp_file = NamedTempFile::new().unwrap();
    writeln!(temp_file, "{contents}").unwrap();
    temp_file
}

#[test]
fn test_config_loads_successfully_from_valid_toml() {
    let temp_file = write_config(
        r#"
[broker]
host = "broker.example.com"
port = 8883
use_tls = true
client_id = "kitchen-tablet"

[session]
keep_alive_secs = 30
connection_timeout_secs = 15
clean_session = false
auto_reconnect = true
dispatch = "exact"

[retry]
base_delay_ms = 500
max_delay_ms = 8000
max_attempts = 5
"#,
    );

    let config = CogwyrmConfig::load_from_file(temp_file.path()).unwrap();

    assert_eq!(config.broker.host, "broker.example.com");
    assert_eq!(config.broker.port, 8883);
    assert!(config.broker.use_tls);
    assert_eq!(config.broker.client_id.as_deref(), Some("kitchen-tablet"));
    assert_eq!(config.session.keep_alive_secs, 30);
    assert!(!config.session.clean_session);
    assert_eq!(config.session.dispatch, DispatchMode::Exact);
    assert_eq!(config.retry.max_attempts, Some(5));
}

#[test]
fn test_empty_file_uses_defaults() {
    let temp_file = write_config("");

    let config = CogwyrmConfig::load_from_file(temp_file.path()).unwrap();

    assert_eq!(config, CogwyrmConfig::default());
    assert_eq!(config.broker.host, "localhost");
    assert_eq!(config.broker.port, 1883);
    assert_eq!(config.session.keep_alive_secs, 60);
    assert_eq!(config.session.connection_timeout_secs, 30);
    assert!(config.session.clean_session);
    assert_eq!(config.session.dispatch, DispatchMode::Filter);
    assert_eq!(config.retry.base_delay_ms, 1000);
    assert_eq!(config.retry.max_delay_ms, 30000);
    assert_eq!(config.retry.max_attempts, None);
}

#[test]
fn test_session_options_follow_config() {
    let temp_file = write_config(
        r#"
[session]
keep_alive_secs = 20
auto_reconnect = false

[retry]
base_delay_ms = 250
max_delay_ms = 4000
max_attempts = 3
"#,
    );
    let config = CogwyrmConfig::load_from_file(temp_file.path()).unwrap();

    let options = config.session_options();

    assert_eq!(options.keep_alive, Duration::from_secs(20));
    assert!(!options.auto_reconnect);
    assert_eq!(options.retry.base_delay(), Duration::from_millis(250));
    assert_eq!(options.retry.max_delay(), Duration::from_millis(4000));
    assert_eq!(options.retry.max_attempts(), Some(3));
}

#[test]
fn test_missing_file_is_read_error() {
    let result = CogwyrmConfig::load_from_file(std::path::Path::new("/nonexistent/cogwyrm.toml"));

    assert!(matches!(result, Err(ConfigError::FileRead(_))));
}

#[test]
fn test_malformed_toml_is_parse_error() {
    let temp_file = write_config("[broker\nhost = ");

    let result = CogwyrmConfig::load_from_file(temp_file.path());

    assert!(matches!(result, Err(ConfigError::TomlParse(_))));
}

#[test]
fn test_invalid_values_are_rejected() {
    let cases = [
        "[broker]\nhost = \"   \"",
        "[broker]\nport = 0",
        "[broker]\nclient_id = \"\"",
        "[session]\nkeep_alive_secs = 0",
        "[session]\nconnection_timeout_secs = 0",
        "[retry]\nbase_delay_ms = 0",
        "[retry]\nbase_delay_ms = 5000\nmax_delay_ms = 1000",
        "[retry]\nmax_attempts = 0",
    ];

    for case in cases {
        let temp_file = write_config(case);
        let result = CogwyrmConfig::load_from_file(temp_file.path());
        assert!(
            matches!(result, Err(ConfigError::InvalidConfig(_))),
            "expected rejection for: {case}"
        );
    }
}

#[test]
fn test_credentials_resolved_from_environment() {
    std::env::set_var("COGWYRM_TEST_CONFIG_USER", "alice");
    std::env::set_var("COGWYRM_TEST_CONFIG_PASS", "hunter2");
    let temp_file = write_config(
        r#"
[broker]
host = "broker.example.com"
username_env = "COGWYRM_TEST_CONFIG_USER"
password_env = "COGWYRM_TEST_CONFIG_PASS"
"#,
    );
    let config = CogwyrmConfig::load_from_file(temp_file.path()).unwrap();

    let endpoint = config.to_endpoint().unwrap();

    let credentials = endpoint.credentials().unwrap();
    assert_eq!(credentials.username, "alice");
    assert_eq!(credentials.password, "hunter2");
    assert!(!format!("{credentials:?}").contains("hunter2"));
}

#[test]
fn test_missing_credential_variable_is_error() {
    let temp_file = write_config(
        r#"
[broker]
username_env = "COGWYRM_TEST_CONFIG_UNSET_USER"
"#,
    );
    let config = CogwyrmConfig::load_from_file(temp_file.path()).unwrap();

    let result = config.to_endpoint();

    assert!(matches!(
        result,
        Err(ConfigError::EnvVarNotFound(name)) if name == "COGWYRM_TEST_CONFIG_UNSET_USER"
    ));
}

#[test]
fn test_config_round_trips_through_toml() {
    let config = CogwyrmConfig::default();

    let text = toml::to_string_pretty(&config).unwrap();
    let parsed: CogwyrmConfig = toml::from_str(&text).unwrap();

    assert_eq!(parsed, config);
}
