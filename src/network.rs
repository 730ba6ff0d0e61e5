//! Network reachability monitoring
//!
//! Platform code (or the TCP probe below) reports connectivity into a
//! [`NetworkMonitor`]. Sessions hold a [`NetworkWatch`] only while their
//! supervisor runs, so a disconnected session leaves no registration behind.

use crate::session::ConnectionState;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info};

/// System-level connectivity as last reported
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reachability {
    Available,
    Lost,
}

/// What a session should do about a reachability change
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetworkReaction {
    /// Remember that the network dropped under a live or retrying session
    MarkPending,
    /// Skip the remaining backoff and reattempt now
    ReconnectNow,
    /// Connectivity is back but no reattempt is waiting
    ClearPending,
    Ignore,
}

/// Decide how a session in `state` reacts to `reachability`
///
/// Loss never forces a disconnect; it only sets the pending flag. A restore
/// with the flag set short-circuits the backoff of a reconnecting session.
pub fn on_reachability_change(
    state: ConnectionState,
    reachability: Reachability,
    pending_reconnect: bool,
) -> NetworkReaction {
    match (reachability, state) {
        (Reachability::Lost, ConnectionState::Connected | ConnectionState::Reconnecting { .. }) => {
            NetworkReaction::MarkPending
        }
        (Reachability::Available, ConnectionState::Reconnecting { .. }) if pending_reconnect => {
            NetworkReaction::ReconnectNow
        }
        (Reachability::Available, _) if pending_reconnect => NetworkReaction::ClearPending,
        _ => NetworkReaction::Ignore,
    }
}

/// Shared source of reachability changes
#[derive(Debug, Clone)]
pub struct NetworkMonitor {
    sender: Arc<watch::Sender<Reachability>>,
}

impl Default for NetworkMonitor {
    fn default() -> Self {
        Self::new(Reachability::Available)
    }
}

impl NetworkMonitor {
    pub fn new(initial: Reachability) -> Self {
        let (sender, _) = watch::channel(initial);
        Self {
            sender: Arc::new(sender),
        }
    }

    /// Record the current connectivity; returns true if it changed
    pub fn report(&self, reachability: Reachability) -> bool {
        let changed = self.sender.send_if_modified(|current| {
            if *current == reachability {
                return false;
            }
            *current = reachability;
            true
        });
        if changed {
            info!(?reachability, "Network reachability changed");
        }
        changed
    }

    pub fn current(&self) -> Reachability {
        *self.sender.borrow()
    }

    /// Register a new listener
    pub fn watch(&self) -> NetworkWatch {
        NetworkWatch {
            receiver: self.sender.subscribe(),
        }
    }

    /// Number of live listeners
    pub fn registrations(&self) -> usize {
        self.sender.receiver_count()
    }
}

/// One listener registration; dropping it deregisters
#[derive(Debug)]
pub struct NetworkWatch {
    receiver: watch::Receiver<Reachability>,
}

impl NetworkWatch {
    /// Wait for the next change; `None` once the monitor is gone
    pub async fn changed(&mut self) -> Option<Reachability> {
        self.receiver.changed().await.ok()?;
        Some(*self.receiver.borrow_and_update())
    }
}

/// Probe `address` by opening TCP connections and report the result
///
/// A cheap stand-in for a platform connectivity callback on hosts that have
/// none: reachable broker port means `Available`.
pub fn spawn_tcp_probe(
    monitor: NetworkMonitor,
    address: String,
    interval: Duration,
    connect_timeout: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            let reachable = matches!(
                tokio::time::timeout(connect_timeout, TcpStream::connect(&address)).await,
                Ok(Ok(_))
            );
            debug!(address = %address, reachable, "Reachability probe");
            monitor.report(if reachable {
                Reachability::Available
            } else {
                Reachability::Lost
            });
            tokio::time::sleep(interval).await;
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_loss_marks_pending_only_for_active_sessions() {
        assert_eq!(
            on_reachability_change(ConnectionState::Connected, Reachability::Lost, false),
            NetworkReaction::MarkPending
        );
        assert_eq!(
            on_reachability_change(
                ConnectionState::Reconnecting { attempt: 2 },
                Reachability::Lost,
                false
            ),
            NetworkReaction::MarkPending
        );
        assert_eq!(
            on_reachability_change(ConnectionState::Disconnected, Reachability::Lost, false),
            NetworkReaction::Ignore
        );
    }

    #[test]
    fn test_restore_with_pending_flag() {
        assert_eq!(
            on_reachability_change(
                ConnectionState::Reconnecting { attempt: 1 },
                Reachability::Available,
                true
            ),
            NetworkReaction::ReconnectNow
        );
        assert_eq!(
            on_reachability_change(ConnectionState::Connected, Reachability::Available, true),
            NetworkReaction::ClearPending
        );
        assert_eq!(
            on_reachability_change(
                ConnectionState::Reconnecting { attempt: 1 },
                Reachability::Available,
                false
            ),
            NetworkReaction::Ignore
        );
    }

    #[test]
    fn test_report_only_signals_changes() {
        let monitor = NetworkMonitor::default();

        assert!(!monitor.report(Reachability::Available));
        assert!(monitor.report(Reachability::Lost));
        assert!(!monitor.report(Reachability::Lost));
        assert_eq!(monitor.current(), Reachability::Lost);
    }

    #[tokio::test]
    async fn test_watch_registration_lifecycle() {
        let monitor = NetworkMonitor::default();
        assert_eq!(monitor.registrations(), 0);

        let mut watch = monitor.watch();
        assert_eq!(monitor.registrations(), 1);

        monitor.report(Reachability::Lost);
        assert_eq!(watch.changed().await, Some(Reachability::Lost));

        drop(watch);
        assert_eq!(monitor.registrations(), 0);
    }

    #[tokio::test]
    async fn test_watch_ends_when_monitor_dropped() {
        let monitor = NetworkMonitor::default();
        let mut watch = monitor.watch();
        drop(monitor);

        assert_eq!(watch.changed().await, None);
    }

    #[tokio::test]
    async fn test_tcp_probe_reports_reachability() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap().to_string();
        let monitor = NetworkMonitor::new(Reachability::Lost);
        let mut watch = monitor.watch();

        let probe = spawn_tcp_probe(
            monitor.clone(),
            address,
            Duration::from_millis(20),
            Duration::from_millis(500),
        );

        let change = tokio::time::timeout(Duration::from_secs(2), watch.changed())
            .await
            .unwrap();
        assert_eq!(change, Some(Reachability::Available));

        probe.abort();
    }
}
