//! Connection session: lifecycle, backoff and message dispatch
//!
//! - [`state`] - pure state table and health counters
//! - [`retry`] - exponential backoff policy
//! - [`dispatch`] - topic-to-callback routing table
//! - [`connection`] - the I/O-owning [`ConnectionSession`]

pub mod connection;
pub mod dispatch;
pub mod retry;
pub mod state;

pub use connection::{
    ConnectionLostCallback, ConnectionSession, MessageObserver, SessionBuilder, SessionCallbacks,
    SessionEvent,
};
pub use dispatch::{DispatchMode, DispatchTable, MessageCallback, Registration};
pub use retry::{RetryDecision, RetryPolicy};
pub use state::{ConnectionState, HealthMetrics, Trigger};

use crate::transport::ConnectOptions;
use std::time::Duration;

/// Behaviour knobs for one session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionOptions {
    pub keep_alive: Duration,
    pub connection_timeout: Duration,
    /// Upper bound on waiting for a publish/subscribe/unsubscribe acknowledgement
    pub operation_timeout: Duration,
    pub clean_session: bool,
    /// Retry after a failed connect or a lost link
    pub auto_reconnect: bool,
    pub dispatch: DispatchMode,
    pub retry: RetryPolicy,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            keep_alive: Duration::from_secs(60),
            connection_timeout: Duration::from_secs(30),
            operation_timeout: Duration::from_secs(10),
            clean_session: true,
            auto_reconnect: true,
            dispatch: DispatchMode::default(),
            retry: RetryPolicy::default(),
        }
    }
}

impl SessionOptions {
    pub fn connect_options(&self) -> ConnectOptions {
        ConnectOptions {
            keep_alive: self.keep_alive,
            connection_timeout: self.connection_timeout,
            operation_timeout: self.operation_timeout,
            clean_session: self.clean_session,
        }
    }

    pub fn without_auto_reconnect(mut self) -> Self {
        self.auto_reconnect = false;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_dispatch(mut self, dispatch: DispatchMode) -> Self {
        self.dispatch = dispatch;
        self
    }
}
