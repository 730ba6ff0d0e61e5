//! Pure connection state machine and health bookkeeping
//!
//! The session feeds triggers through [`transition`] and publishes whatever
//! comes back. Keeping the table here, free of I/O, lets every edge be tested
//! without a broker.

use chrono::{DateTime, Utc};
use std::fmt;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Lifecycle state of one connection session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    /// Waiting for or running reattempt number `attempt`
    Reconnecting { attempt: u32 },
    Disconnecting,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionState::Disconnected => f.write_str("disconnected"),
            ConnectionState::Connecting => f.write_str("connecting"),
            ConnectionState::Connected => f.write_str("connected"),
            ConnectionState::Reconnecting { attempt } => {
                write!(f, "reconnecting (attempt {attempt})")
            }
            ConnectionState::Disconnecting => f.write_str("disconnecting"),
        }
    }
}

impl ConnectionState {
    /// Publish, subscribe and unsubscribe need a live link
    pub fn can_operate(&self) -> bool {
        matches!(self, ConnectionState::Connected)
    }

    /// A connect or reconnect is already under way
    pub fn is_busy(&self) -> bool {
        matches!(
            self,
            ConnectionState::Connecting
                | ConnectionState::Reconnecting { .. }
                | ConnectionState::Disconnecting
        )
    }
}

/// Things that move the session between states
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Trigger {
    ConnectRequested,
    ConnectSucceeded,
    ConnectFailed { auto_reconnect: bool, attempt: u32 },
    ConnectionLost { auto_reconnect: bool, attempt: u32 },
    ReattemptFailed { attempt: u32 },
    RetriesExhausted,
    DisconnectRequested,
    DisconnectCompleted,
}

/// Next state for `trigger` arriving in `current`
///
/// Triggers that make no sense in the current state leave it unchanged. That
/// is what keeps a late connect result from reviving a session that is
/// already shutting down.
pub fn transition(current: ConnectionState, trigger: &Trigger) -> ConnectionState {
    use ConnectionState::*;

    let next = match (current, trigger) {
        (_, Trigger::DisconnectRequested) => Disconnecting,
        (Disconnecting, Trigger::DisconnectCompleted) => Disconnected,
        (Disconnecting, _) => Disconnecting,

        (Disconnected, Trigger::ConnectRequested) => Connecting,
        (Connecting | Reconnecting { .. }, Trigger::ConnectSucceeded) => Connected,

        (Connecting, Trigger::ConnectFailed { auto_reconnect: true, attempt }) => {
            Reconnecting { attempt: *attempt }
        }
        (Connecting, Trigger::ConnectFailed { auto_reconnect: false, .. }) => Disconnected,

        (Connected, Trigger::ConnectionLost { auto_reconnect: true, attempt }) => {
            Reconnecting { attempt: *attempt }
        }
        (Connected, Trigger::ConnectionLost { auto_reconnect: false, .. }) => Disconnected,

        (Reconnecting { .. }, Trigger::ReattemptFailed { attempt }) => {
            Reconnecting { attempt: *attempt }
        }
        (Reconnecting { .. }, Trigger::RetriesExhausted) => Disconnected,

        (state, _) => state,
    };

    if next == current && !matches!(trigger, Trigger::ReattemptFailed { .. }) {
        debug!(state = %current, ?trigger, "Trigger ignored in current state");
    }
    next
}

/// Log a state change at a level that matches its severity
pub fn log_state_transition(from: ConnectionState, to: ConnectionState) {
    match (from, to) {
        (ConnectionState::Connecting, ConnectionState::Connected) => {
            info!("MQTT connection established");
        }
        (ConnectionState::Reconnecting { attempt }, ConnectionState::Connected) => {
            info!(attempt, "Reconnection successful");
        }
        (ConnectionState::Connected, ConnectionState::Reconnecting { .. }) => {
            warn!("MQTT connection lost, reconnecting");
        }
        (ConnectionState::Reconnecting { attempt }, ConnectionState::Disconnected) => {
            error!(attempt, "Giving up on reconnection");
        }
        (from, to) if from != to => {
            info!("MQTT connection state: {} -> {}", from, to);
        }
        _ => {}
    }
}

/// Counters describing how a session has behaved so far
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HealthMetrics {
    /// Successful connects, initial and automatic
    pub connects: u64,
    pub connection_losses: u64,
    /// Successful automatic reconnects
    pub reconnects: u64,
    pub messages_received: u64,
    pub messages_published: u64,
    pub last_connected_at: Option<DateTime<Utc>>,
    pub last_message_at: Option<DateTime<Utc>>,
}

impl HealthMetrics {
    /// Time since the last successful connect, if connected at `now`
    pub fn uptime(&self, state: ConnectionState, now: DateTime<Utc>) -> Option<Duration> {
        if !state.can_operate() {
            return None;
        }
        self.last_connected_at
            .and_then(|at| (now - at).to_std().ok())
    }

    /// Connected, and either silent so far or heard from within five minutes
    pub fn is_healthy(&self, state: ConnectionState, now: DateTime<Utc>) -> bool {
        if !state.can_operate() {
            return false;
        }
        match self.last_message_at {
            None => true,
            Some(at) => (now - at).to_std().map_or(true, |idle| idle < Duration::from_secs(300)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ConnectionState::*;

    #[test]
    fn test_connect_success_path() {
        let state = transition(Disconnected, &Trigger::ConnectRequested);
        assert_eq!(state, Connecting);

        let state = transition(state, &Trigger::ConnectSucceeded);
        assert_eq!(state, Connected);
    }

    #[test]
    fn test_connect_failure_depends_on_auto_reconnect() {
        let retrying = transition(
            Connecting,
            &Trigger::ConnectFailed {
                auto_reconnect: true,
                attempt: 1,
            },
        );
        assert_eq!(retrying, Reconnecting { attempt: 1 });

        let stopped = transition(
            Connecting,
            &Trigger::ConnectFailed {
                auto_reconnect: false,
                attempt: 1,
            },
        );
        assert_eq!(stopped, Disconnected);
    }

    #[test]
    fn test_loss_and_reattempts() {
        let state = transition(
            Connected,
            &Trigger::ConnectionLost {
                auto_reconnect: true,
                attempt: 1,
            },
        );
        assert_eq!(state, Reconnecting { attempt: 1 });

        let state = transition(state, &Trigger::ReattemptFailed { attempt: 2 });
        assert_eq!(state, Reconnecting { attempt: 2 });

        let state = transition(state, &Trigger::ConnectSucceeded);
        assert_eq!(state, Connected);
    }

    #[test]
    fn test_retries_exhausted_disconnects() {
        let state = transition(Reconnecting { attempt: 5 }, &Trigger::RetriesExhausted);
        assert_eq!(state, Disconnected);
    }

    #[test]
    fn test_disconnect_from_any_state() {
        for state in [
            Disconnected,
            Connecting,
            Connected,
            Reconnecting { attempt: 3 },
            Disconnecting,
        ] {
            let next = transition(state, &Trigger::DisconnectRequested);
            assert_eq!(next, Disconnecting);
            assert_eq!(transition(next, &Trigger::DisconnectCompleted), Disconnected);
        }
    }

    #[test]
    fn test_late_connect_result_cannot_revive_disconnecting_session() {
        assert_eq!(
            transition(Disconnecting, &Trigger::ConnectSucceeded),
            Disconnecting
        );
        assert_eq!(transition(Disconnected, &Trigger::ConnectSucceeded), Disconnected);
    }

    #[test]
    fn test_can_operate_only_when_connected() {
        assert!(Connected.can_operate());
        assert!(!Disconnected.can_operate());
        assert!(!Connecting.can_operate());
        assert!(!Reconnecting { attempt: 1 }.can_operate());
        assert!(!Disconnecting.can_operate());
    }

    #[test]
    fn test_health_metrics() {
        let now = Utc::now();
        let metrics = HealthMetrics {
            last_connected_at: Some(now - chrono::Duration::seconds(30)),
            last_message_at: Some(now - chrono::Duration::seconds(600)),
            ..Default::default()
        };

        assert_eq!(metrics.uptime(Connected, now), Some(Duration::from_secs(30)));
        assert_eq!(metrics.uptime(Disconnected, now), None);
        assert!(!metrics.is_healthy(Connected, now));

        let fresh = HealthMetrics::default();
        assert!(fresh.is_healthy(Connected, now));
        assert!(!fresh.is_healthy(Reconnecting { attempt: 1 }, now));
    }
}
