//! Configuration for broker endpoints and session behaviour
//!
//! Loaded from TOML. Every section has defaults, so an empty file yields a
//! plaintext connection to `localhost:1883` with the stock session options.
//! Credentials never live in the file: `username_env`/`password_env` name the
//! environment variables that hold them.

use crate::session::{DispatchMode, RetryPolicy, SessionOptions};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;
use url::Url;
use uuid::Uuid;

/// Top-level configuration file layout
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct CogwyrmConfig {
    #[serde(default)]
    pub broker: BrokerSection,
    #[serde(default)]
    pub session: SessionSection,
    #[serde(default)]
    pub retry: RetrySection,
}

/// `[broker]` section
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BrokerSection {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default)]
    pub use_tls: bool,
    /// Generated by [`default_client_id`] when absent
    pub client_id: Option<String>,
    /// Environment variable containing username
    pub username_env: Option<String>,
    /// Environment variable containing password
    pub password_env: Option<String>,
}

impl Default for BrokerSection {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            use_tls: false,
            client_id: None,
            username_env: None,
            password_env: None,
        }
    }
}

fn default_host() -> String {
    "localhost".to_string()
}

fn default_port() -> u16 {
    1883
}

/// `[session]` section
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SessionSection {
    #[serde(default = "default_keep_alive")]
    pub keep_alive_secs: u64,
    #[serde(default = "default_connection_timeout")]
    pub connection_timeout_secs: u64,
    #[serde(default = "default_operation_timeout")]
    pub operation_timeout_secs: u64,
    #[serde(default = "default_true")]
    pub clean_session: bool,
    #[serde(default = "default_true")]
    pub auto_reconnect: bool,
    #[serde(default)]
    pub dispatch: DispatchMode,
}

impl Default for SessionSection {
    fn default() -> Self {
        Self {
            keep_alive_secs: default_keep_alive(),
            connection_timeout_secs: default_connection_timeout(),
            operation_timeout_secs: default_operation_timeout(),
            clean_session: true,
            auto_reconnect: true,
            dispatch: DispatchMode::default(),
        }
    }
}

fn default_keep_alive() -> u64 {
    60
}

fn default_connection_timeout() -> u64 {
    30
}

fn default_operation_timeout() -> u64 {
    10
}

fn default_true() -> bool {
    true
}

/// `[retry]` section
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RetrySection {
    #[serde(default = "default_base_delay")]
    pub base_delay_ms: u64,
    #[serde(default = "default_max_delay")]
    pub max_delay_ms: u64,
    /// Unlimited when absent
    pub max_attempts: Option<u32>,
}

impl Default for RetrySection {
    fn default() -> Self {
        Self {
            base_delay_ms: default_base_delay(),
            max_delay_ms: default_max_delay(),
            max_attempts: None,
        }
    }
}

fn default_base_delay() -> u64 {
    1000
}

fn default_max_delay() -> u64 {
    30000
}

/// Configuration loading errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    FileRead(#[from] std::io::Error),
    #[error("Failed to parse TOML: {0}")]
    TomlParse(#[from] toml::de::Error),
    #[error("Environment variable not found: {0}")]
    EnvVarNotFound(String),
    #[error("Invalid broker URL: {0}")]
    InvalidBrokerUrl(String),
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

impl CogwyrmConfig {
    /// Load configuration from a TOML file and validate it
    pub fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let config: CogwyrmConfig = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Reject values that cannot produce a working session
    pub fn validate(&self) -> Result<(), ConfigError> {
        validate_host(&self.broker.host)?;
        validate_port(self.broker.port)?;

        if let Some(client_id) = &self.broker.client_id {
            if client_id.trim().is_empty() {
                return Err(ConfigError::InvalidConfig(
                    "client_id must not be blank".to_string(),
                ));
            }
        }
        if self.session.keep_alive_secs == 0 {
            return Err(ConfigError::InvalidConfig(
                "keep_alive_secs must be greater than 0".to_string(),
            ));
        }
        if self.session.connection_timeout_secs == 0 || self.session.operation_timeout_secs == 0 {
            return Err(ConfigError::InvalidConfig(
                "timeouts must be greater than 0".to_string(),
            ));
        }
        if self.retry.base_delay_ms == 0 {
            return Err(ConfigError::InvalidConfig(
                "base_delay_ms must be greater than 0".to_string(),
            ));
        }
        if self.retry.base_delay_ms > self.retry.max_delay_ms {
            return Err(ConfigError::InvalidConfig(format!(
                "base_delay_ms ({}) exceeds max_delay_ms ({})",
                self.retry.base_delay_ms, self.retry.max_delay_ms
            )));
        }
        if self.retry.max_attempts == Some(0) {
            return Err(ConfigError::InvalidConfig(
                "max_attempts must be greater than 0 or absent for unlimited".to_string(),
            ));
        }
        Ok(())
    }

    /// Build the broker endpoint, resolving credentials from the environment
    pub fn to_endpoint(&self) -> Result<BrokerEndpoint, ConfigError> {
        let mut endpoint = BrokerEndpoint::new(&self.broker.host, self.broker.port)?
            .with_tls(self.broker.use_tls);

        if let Some(client_id) = &self.broker.client_id {
            endpoint = endpoint.with_client_id(client_id);
        }

        if let Some(username_env) = &self.broker.username_env {
            let username = get_env_var_required(username_env)?;
            let password = match &self.broker.password_env {
                Some(password_env) => get_env_var_required(password_env)?,
                None => String::new(),
            };
            endpoint = endpoint.with_credentials(username, password);
        }

        Ok(endpoint)
    }

    /// Session options derived from the `[session]` and `[retry]` sections
    pub fn session_options(&self) -> SessionOptions {
        SessionOptions {
            keep_alive: Duration::from_secs(self.session.keep_alive_secs),
            connection_timeout: Duration::from_secs(self.session.connection_timeout_secs),
            operation_timeout: Duration::from_secs(self.session.operation_timeout_secs),
            clean_session: self.session.clean_session,
            auto_reconnect: self.session.auto_reconnect,
            dispatch: self.session.dispatch,
            retry: RetryPolicy::new(
                Duration::from_millis(self.retry.base_delay_ms),
                Duration::from_millis(self.retry.max_delay_ms),
            )
            .with_max_attempts(self.retry.max_attempts),
        }
    }
}

fn get_env_var_required(env_var_name: &str) -> Result<String, ConfigError> {
    std::env::var(env_var_name).map_err(|_| ConfigError::EnvVarNotFound(env_var_name.to_string()))
}

fn validate_host(host: &str) -> Result<(), ConfigError> {
    if host.trim().is_empty() {
        return Err(ConfigError::InvalidConfig(
            "broker host must not be blank".to_string(),
        ));
    }
    Ok(())
}

fn validate_port(port: u16) -> Result<(), ConfigError> {
    if port == 0 {
        return Err(ConfigError::InvalidConfig(
            "broker port must be between 1 and 65535".to_string(),
        ));
    }
    Ok(())
}

/// Default client identifier: `cogwyrm_<unix millis>_<8 random hex digits>`
///
/// The random part keeps ids unique when several endpoints are built in the
/// same millisecond.
pub fn default_client_id() -> String {
    let nonce = Uuid::new_v4().simple().to_string();
    format!(
        "cogwyrm_{}_{}",
        chrono::Utc::now().timestamp_millis(),
        &nonce[..8]
    )
}

/// Username and password for broker authentication
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"***")
            .finish()
    }
}

/// One physical connection target
///
/// Immutable once handed to a session. The broker rejects two live
/// connections with the same client id, so sharing is done through
/// [`EndpointKey`] in the subscription registry rather than by reusing ids.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerEndpoint {
    host: String,
    port: u16,
    use_tls: bool,
    client_id: String,
    credentials: Option<Credentials>,
}

impl BrokerEndpoint {
    /// Plaintext endpoint with a generated client id
    pub fn new(host: impl Into<String>, port: u16) -> Result<Self, ConfigError> {
        let host = host.into();
        validate_host(&host)?;
        validate_port(port)?;
        Ok(Self {
            host: host.trim().to_string(),
            port,
            use_tls: false,
            client_id: default_client_id(),
            credentials: None,
        })
    }

    /// Parse `mqtt://host[:port]` or `mqtts://host[:port]`
    ///
    /// `user:pass@` in the URL becomes the credentials.
    pub fn from_url(broker_url: &str) -> Result<Self, ConfigError> {
        let url = Url::parse(broker_url)
            .map_err(|_| ConfigError::InvalidBrokerUrl(broker_url.to_string()))?;

        let use_tls = match url.scheme() {
            "mqtt" | "tcp" => false,
            "mqtts" | "ssl" => true,
            _ => return Err(ConfigError::InvalidBrokerUrl(broker_url.to_string())),
        };
        let host = url
            .host_str()
            .ok_or_else(|| ConfigError::InvalidBrokerUrl(broker_url.to_string()))?;
        let port = url.port().unwrap_or(if use_tls { 8883 } else { 1883 });

        let mut endpoint = Self::new(host, port)?.with_tls(use_tls);
        if !url.username().is_empty() {
            endpoint = endpoint.with_credentials(
                url.username(),
                url.password().unwrap_or_default(),
            );
        }
        Ok(endpoint)
    }

    pub fn with_tls(mut self, use_tls: bool) -> Self {
        self.use_tls = use_tls;
        self
    }

    pub fn with_client_id(mut self, client_id: impl Into<String>) -> Self {
        self.client_id = client_id.into();
        self
    }

    pub fn with_credentials(
        mut self,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        self.credentials = Some(Credentials {
            username: username.into(),
            password: password.into(),
        });
        self
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn use_tls(&self) -> bool {
        self.use_tls
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    pub fn credentials(&self) -> Option<&Credentials> {
        self.credentials.as_ref()
    }

    /// Identity used to share one session between consumers
    pub fn key(&self) -> EndpointKey {
        EndpointKey {
            host: self.host.clone(),
            port: self.port,
            use_tls: self.use_tls,
            client_id: self.client_id.clone(),
        }
    }
}

impl fmt::Display for BrokerEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let scheme = if self.use_tls { "mqtts" } else { "mqtt" };
        write!(f, "{scheme}://{}:{}", self.host, self.port)
    }
}

/// Registry key identifying one physical connection
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct EndpointKey {
    pub host: String,
    pub port: u16,
    pub use_tls: bool,
    pub client_id: String,
}

impl fmt::Display for EndpointKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}:{}", self.client_id, self.host, self.port)
    }
}
