//! Pure connection configuration for the rumqttc client
//!
//! This module contains pure functions for building client options,
//! mapping QoS levels and classifying connection errors.

use crate::config::BrokerEndpoint;
use crate::error::{CogwyrmError, ConnectionFailure};
use crate::protocol::QoS;
use crate::transport::ConnectOptions;
use rumqttc::{ConnectReturnCode, ConnectionError, MqttOptions, Transport as RumqttcTransport};
use std::io::ErrorKind;

/// Largest packet accepted in either direction
pub const MAX_PACKET_SIZE: usize = 1024 * 1024;

/// Build client options for one link to `endpoint`
pub fn configure_mqtt_options(endpoint: &BrokerEndpoint, options: &ConnectOptions) -> MqttOptions {
    let mut mqtt_options = MqttOptions::new(endpoint.client_id(), endpoint.host(), endpoint.port());

    mqtt_options
        .set_keep_alive(options.keep_alive)
        .set_clean_session(options.clean_session)
        .set_max_packet_size(MAX_PACKET_SIZE, MAX_PACKET_SIZE);

    if endpoint.use_tls() {
        mqtt_options.set_transport(RumqttcTransport::tls_with_default_config());
    }

    if let Some(credentials) = endpoint.credentials() {
        mqtt_options.set_credentials(credentials.username.clone(), credentials.password.clone());
    }

    mqtt_options
}

pub fn to_rumqttc_qos(qos: QoS) -> rumqttc::QoS {
    match qos {
        QoS::AtMostOnce => rumqttc::QoS::AtMostOnce,
        QoS::AtLeastOnce => rumqttc::QoS::AtLeastOnce,
        QoS::ExactlyOnce => rumqttc::QoS::ExactlyOnce,
    }
}

pub fn from_rumqttc_qos(qos: rumqttc::QoS) -> QoS {
    match qos {
        rumqttc::QoS::AtMostOnce => QoS::AtMostOnce,
        rumqttc::QoS::AtLeastOnce => QoS::AtLeastOnce,
        rumqttc::QoS::ExactlyOnce => QoS::ExactlyOnce,
    }
}

/// Failure kind for a CONNACK refusal code
pub fn classify_refusal(code: ConnectReturnCode) -> ConnectionFailure {
    match code {
        ConnectReturnCode::BadUserNamePassword | ConnectReturnCode::NotAuthorized => {
            ConnectionFailure::AuthFailed
        }
        _ => ConnectionFailure::Refused,
    }
}

/// Map a client library error onto a connection failure kind
pub fn classify_connection_error(error: &ConnectionError) -> ConnectionFailure {
    match error {
        ConnectionError::ConnectionRefused(code) => classify_refusal(*code),
        ConnectionError::Tls(_) => ConnectionFailure::Tls,
        ConnectionError::NetworkTimeout | ConnectionError::FlushTimeout => ConnectionFailure::Timeout,
        ConnectionError::Io(io) => classify_io_error(io),
        _ => ConnectionFailure::Unreachable,
    }
}

fn classify_io_error(error: &std::io::Error) -> ConnectionFailure {
    let text = error.to_string().to_lowercase();
    if text.contains("lookup") || text.contains("resolve") || text.contains("name or service") {
        return ConnectionFailure::UnknownHost;
    }
    match error.kind() {
        ErrorKind::TimedOut => ConnectionFailure::Timeout,
        ErrorKind::ConnectionRefused => ConnectionFailure::Refused,
        _ => ConnectionFailure::Unreachable,
    }
}

/// Connection error with its kind and a sanitized message
pub fn connection_error(endpoint: &BrokerEndpoint, error: &ConnectionError) -> CogwyrmError {
    CogwyrmError::connection(
        classify_connection_error(error),
        format!("{endpoint}: {error}"),
    )
}
