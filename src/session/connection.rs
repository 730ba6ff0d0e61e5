//! One physical broker connection and its reconnection supervisor
//!
//! Public operations serialize on the `link` lock, so publish, subscribe,
//! unsubscribe and disconnect never touch the wire at the same time. A
//! background supervisor owns the event stream of the live link: it
//! dispatches deliveries, reacts to loss, waits out the backoff and swaps in
//! a new link. Every link carries a generation number; `disconnect` bumps it,
//! and any supervisor or connect attempt that finishes against an old
//! generation backs off quietly instead of reviving the session.
//!
//! Lock order is `link`, then `dispatch`. `dispatch`, `metrics` and
//! `supervisor` are std mutexes and are never held across an await.

use super::dispatch::{DispatchTable, MessageCallback, Registration};
use super::retry::RetryDecision;
use super::state::{log_state_transition, transition, ConnectionState, HealthMetrics, Trigger};
use super::SessionOptions;
use crate::config::BrokerEndpoint;
use crate::error::{CogwyrmError, ConnectionFailure, Result, WireOperation};
use crate::network::{on_reachability_change, NetworkMonitor, NetworkReaction, NetworkWatch, Reachability};
use crate::protocol::{check_topic_filter, check_topic_name, Message, QoS};
use crate::session_span;
use crate::transport::{Connector, Transport, WireEvent, WireLink};
use bytes::Bytes;
use chrono::Utc;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, MutexGuard};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn, Instrument};

const SUPERVISOR_SHUTDOWN_GRACE: Duration = Duration::from_secs(2);
const EVENT_CAPACITY: usize = 64;

/// Called with the loss cause before the session leaves `Connected`
pub type ConnectionLostCallback = Arc<dyn Fn(&str) + Send + Sync>;

/// Called for every published or delivered message
pub type MessageObserver = Arc<dyn Fn(&Message) + Send + Sync>;

/// Optional observers supplied when the session is built
#[derive(Clone, Default)]
pub struct SessionCallbacks {
    pub on_connection_lost: Option<ConnectionLostCallback>,
    /// Sees every delivery before per-topic dispatch
    pub on_message_arrived: Option<MessageObserver>,
    /// Sees every publish once the broker has acknowledged it
    pub on_delivery_complete: Option<MessageObserver>,
}

/// Lifecycle notifications broadcast to any number of listeners
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    Connected,
    ConnectionLost { cause: String },
    ReconnectScheduled { attempt: u32, delay: Duration },
    Reconnected,
    GaveUp { attempts: u32 },
    Disconnected,
}

struct Link {
    wire: Option<Arc<dyn Transport>>,
    generation: u64,
}

struct Supervisor {
    handle: JoinHandle<()>,
    shutdown: watch::Sender<bool>,
}

enum Phase {
    Live(mpsc::Receiver<WireEvent>),
    Backoff,
}

enum PhaseExit {
    Next(Phase),
    Stop,
}

struct SessionInner {
    endpoint: BrokerEndpoint,
    options: SessionOptions,
    connector: Arc<dyn Connector>,
    callbacks: SessionCallbacks,
    network: Option<NetworkMonitor>,
    state: watch::Sender<ConnectionState>,
    events: broadcast::Sender<SessionEvent>,
    link: Mutex<Link>,
    dispatch: std::sync::Mutex<DispatchTable>,
    metrics: std::sync::Mutex<HealthMetrics>,
    supervisor: std::sync::Mutex<Option<Supervisor>>,
    attempts: AtomicU32,
    pending_reconnect: AtomicBool,
}

/// Owner of one physical connection to one broker endpoint
///
/// Cheap to share behind an `Arc`; dropping the last handle stops the
/// supervisor but does not send DISCONNECT, so call
/// [`disconnect`](Self::disconnect) for a clean shutdown.
pub struct ConnectionSession {
    inner: Arc<SessionInner>,
}

/// Builder for [`ConnectionSession`]
pub struct SessionBuilder {
    endpoint: BrokerEndpoint,
    connector: Arc<dyn Connector>,
    options: SessionOptions,
    callbacks: SessionCallbacks,
    network: Option<NetworkMonitor>,
}

impl SessionBuilder {
    pub fn options(mut self, options: SessionOptions) -> Self {
        self.options = options;
        self
    }

    pub fn on_connection_lost<F>(mut self, callback: F) -> Self
    where
        F: Fn(&str) + Send + Sync + 'static,
    {
        self.callbacks.on_connection_lost = Some(Arc::new(callback));
        self
    }

    pub fn on_message_arrived<F>(mut self, callback: F) -> Self
    where
        F: Fn(&Message) + Send + Sync + 'static,
    {
        self.callbacks.on_message_arrived = Some(Arc::new(callback));
        self
    }

    pub fn on_delivery_complete<F>(mut self, callback: F) -> Self
    where
        F: Fn(&Message) + Send + Sync + 'static,
    {
        self.callbacks.on_delivery_complete = Some(Arc::new(callback));
        self
    }

    pub fn callbacks(mut self, callbacks: SessionCallbacks) -> Self {
        self.callbacks = callbacks;
        self
    }

    /// Watch this monitor for reachability changes while connected
    pub fn network_monitor(mut self, monitor: NetworkMonitor) -> Self {
        self.network = Some(monitor);
        self
    }

    pub fn build(self) -> ConnectionSession {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        let (events, _) = broadcast::channel(EVENT_CAPACITY);

        ConnectionSession {
            inner: Arc::new(SessionInner {
                dispatch: std::sync::Mutex::new(DispatchTable::new(self.options.dispatch)),
                endpoint: self.endpoint,
                options: self.options,
                connector: self.connector,
                callbacks: self.callbacks,
                network: self.network,
                state,
                events,
                link: Mutex::new(Link {
                    wire: None,
                    generation: 0,
                }),
                metrics: std::sync::Mutex::new(HealthMetrics::default()),
                supervisor: std::sync::Mutex::new(None),
                attempts: AtomicU32::new(0),
                pending_reconnect: AtomicBool::new(false),
            }),
        }
    }
}

impl ConnectionSession {
    pub fn builder(endpoint: BrokerEndpoint, connector: Arc<dyn Connector>) -> SessionBuilder {
        SessionBuilder {
            endpoint,
            connector,
            options: SessionOptions::default(),
            callbacks: SessionCallbacks::default(),
            network: None,
        }
    }

    /// Session with default options and no observers
    pub fn new(endpoint: BrokerEndpoint, connector: Arc<dyn Connector>) -> Self {
        Self::builder(endpoint, connector).build()
    }

    pub fn endpoint(&self) -> &BrokerEndpoint {
        &self.inner.endpoint
    }

    pub fn options(&self) -> &SessionOptions {
        &self.inner.options
    }

    /// Current state; never blocks
    pub fn state(&self) -> ConnectionState {
        *self.inner.state.borrow()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// Consecutive failures since the last successful connect
    pub fn attempts(&self) -> u32 {
        self.inner.attempts.load(Ordering::SeqCst)
    }

    /// Set while the network is known to be down during a live or retrying session
    pub fn pending_reconnect(&self) -> bool {
        self.inner.pending_reconnect.load(Ordering::SeqCst)
    }

    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state.subscribe()
    }

    pub fn events(&self) -> broadcast::Receiver<SessionEvent> {
        self.inner.events.subscribe()
    }

    pub fn metrics(&self) -> HealthMetrics {
        self.inner.lock_metrics().clone()
    }

    /// Topic filters currently in the dispatch table
    pub fn subscriptions(&self) -> Vec<(String, QoS)> {
        self.inner.lock_dispatch().subscriptions()
    }

    /// Establish the link and wait for the broker to accept it
    ///
    /// Returns immediately when already connected and fails with
    /// [`ConnectionFailure::InProgress`] while another connect, reconnect or
    /// disconnect is running. On failure with auto-reconnect enabled the
    /// error is still returned, and the session keeps retrying in the
    /// background.
    pub async fn connect(&self) -> Result<()> {
        let inner = &self.inner;

        let generation = {
            let link = inner.link.lock().await;
            let state = self.state();
            if state == ConnectionState::Connected {
                return Ok(());
            }
            if state.is_busy() {
                return Err(CogwyrmError::connection(
                    ConnectionFailure::InProgress,
                    format!("session is {state}"),
                ));
            }
            inner.apply(Trigger::ConnectRequested);
            link.generation
        };

        info!(endpoint = %inner.endpoint, "Connecting to MQTT broker");
        let result = inner.establish().await;

        let mut link = inner.link.lock().await;
        if link.generation != generation {
            drop(link);
            if let Ok(stale) = result {
                inner.release_stale(stale).await;
            }
            return Err(CogwyrmError::connection(
                ConnectionFailure::Cancelled,
                "disconnect requested while connecting",
            ));
        }

        match result {
            Ok(wire_link) => {
                inner.install(&mut link, wire_link.transport.clone()).await;
                inner.apply(Trigger::ConnectSucceeded);
                inner.emit(SessionEvent::Connected);
                inner.spawn_supervisor(generation, Phase::Live(wire_link.events));
                Ok(())
            }
            Err(err) => {
                inner.attempts.store(1, Ordering::SeqCst);
                let auto_reconnect = inner.options.auto_reconnect;
                inner.apply(Trigger::ConnectFailed {
                    auto_reconnect,
                    attempt: 1,
                });
                error!(endpoint = %inner.endpoint, error = %err, "MQTT connect failed");
                if auto_reconnect {
                    inner.spawn_supervisor(generation, Phase::Backoff);
                }
                Err(err)
            }
        }
    }

    /// Tear the session down; calling it again is a no-op
    ///
    /// Cancels any scheduled reconnect, waits briefly for the supervisor,
    /// sends DISCONNECT on a live link and clears the dispatch table.
    pub async fn disconnect(&self) {
        let inner = &self.inner;

        let wire = {
            let mut link = inner.link.lock().await;
            if self.state() == ConnectionState::Disconnected {
                debug!(endpoint = %inner.endpoint, "Disconnect on idle session ignored");
                inner.lock_dispatch().clear();
                inner.stop_supervisor_now();
                return;
            }
            inner.apply(Trigger::DisconnectRequested);
            link.generation += 1;
            link.wire.take()
        };

        inner.stop_supervisor().await;

        if let Some(wire) = wire {
            if let Err(e) = wire.disconnect().await {
                warn!(endpoint = %inner.endpoint, error = %e, "MQTT disconnect failed, dropping link");
            }
        }

        inner.lock_dispatch().clear();
        inner.attempts.store(0, Ordering::SeqCst);
        inner.pending_reconnect.store(false, Ordering::SeqCst);
        inner.apply(Trigger::DisconnectCompleted);
        inner.emit(SessionEvent::Disconnected);
        info!(endpoint = %inner.endpoint, "MQTT session disconnected");
    }

    /// Publish one message; requires `Connected`
    pub async fn publish(
        &self,
        topic: &str,
        payload: impl Into<Bytes>,
        qos: QoS,
        retained: bool,
    ) -> Result<()> {
        check_topic_name(topic)?;
        let payload = payload.into();
        let inner = &self.inner;

        let link = inner.link.lock().await;
        let wire = inner.live_wire(&link)?;
        let message = Message::outgoing(topic, payload.clone(), qos, retained);

        inner
            .bounded(
                WireOperation::Publish,
                topic,
                wire.publish(topic, payload, qos, retained),
            )
            .await?;
        drop(link);

        {
            let mut metrics = inner.lock_metrics();
            metrics.messages_published += 1;
        }
        debug!(topic, %qos, retained, "Published message");
        if let Some(callback) = &inner.callbacks.on_delivery_complete {
            callback(&message);
        }
        Ok(())
    }

    /// Subscribe `topic` and route its deliveries to `callback`
    pub async fn subscribe<F>(&self, topic: &str, qos: QoS, callback: F) -> Result<()>
    where
        F: Fn(&Message) + Send + Sync + 'static,
    {
        self.subscribe_with(topic, qos, Arc::new(callback)).await
    }

    /// [`subscribe`](Self::subscribe) with an already shared callback
    ///
    /// A second registration for the same filter replaces the first. If the
    /// broker refuses, the previous registration is restored.
    pub async fn subscribe_with(
        &self,
        topic: &str,
        qos: QoS,
        callback: MessageCallback,
    ) -> Result<()> {
        check_topic_filter(topic)?;
        let inner = &self.inner;

        let link = inner.link.lock().await;
        let wire = inner.live_wire(&link)?;

        let previous = inner
            .lock_dispatch()
            .insert(topic, Registration { qos, callback });

        let result = inner
            .bounded(WireOperation::Subscribe, topic, wire.subscribe(topic, qos))
            .await;
        if let Err(err) = result {
            inner.lock_dispatch().restore(topic, previous);
            error!(topic, error = %err, "Subscribe failed, registration rolled back");
            return Err(err);
        }

        info!(topic, %qos, "Subscribed");
        Ok(())
    }

    /// Remove `topic` from the dispatch table and unsubscribe on the wire
    ///
    /// Unknown topics are a no-op in any state.
    pub async fn unsubscribe(&self, topic: &str) -> Result<()> {
        let inner = &self.inner;

        let link = inner.link.lock().await;
        if !inner.lock_dispatch().contains(topic) {
            debug!(topic, "Unsubscribe for unregistered topic ignored");
            return Ok(());
        }
        let wire = inner.live_wire(&link)?;

        let previous = inner.lock_dispatch().remove(topic);
        let result = inner
            .bounded(WireOperation::Unsubscribe, topic, wire.unsubscribe(topic))
            .await;
        if let Err(err) = result {
            inner.lock_dispatch().restore(topic, previous);
            return Err(err);
        }

        info!(topic, "Unsubscribed");
        Ok(())
    }

    /// Drop `topic` locally without any wire traffic
    ///
    /// Used when the link is down: the filter will not be resubscribed on
    /// the next reconnect.
    pub async fn forget(&self, topic: &str) -> bool {
        let _link = self.inner.link.lock().await;
        self.inner.lock_dispatch().remove(topic).is_some()
    }

    /// Register `topic` without wire traffic while a reconnect is under way
    ///
    /// The next successful reconnect subscribes it along with the rest of
    /// the dispatch table. Outside `Reconnecting` this fails with
    /// `NotConnected`; use [`subscribe_with`](Self::subscribe_with) instead.
    pub async fn adopt(&self, topic: &str, qos: QoS, callback: MessageCallback) -> Result<()> {
        check_topic_filter(topic)?;
        let _link = self.inner.link.lock().await;
        let state = self.state();
        if !matches!(state, ConnectionState::Reconnecting { .. }) {
            return Err(CogwyrmError::not_connected(state));
        }

        self.inner
            .lock_dispatch()
            .insert(topic, Registration { qos, callback });
        debug!(topic, %qos, "Subscription deferred until reconnect");
        Ok(())
    }
}

impl Drop for ConnectionSession {
    fn drop(&mut self) {
        // No async in Drop: stop background work, leave DISCONNECT to disconnect()
        self.inner.stop_supervisor_now();
    }
}

impl SessionInner {
    fn lock_dispatch(&self) -> MutexGuard<'_, DispatchTable> {
        self.dispatch.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn lock_metrics(&self) -> MutexGuard<'_, HealthMetrics> {
        self.metrics.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn lock_supervisor(&self) -> MutexGuard<'_, Option<Supervisor>> {
        self.supervisor
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// Run `trigger` through the state table and publish the result
    fn apply(&self, trigger: Trigger) -> ConnectionState {
        let mut from = ConnectionState::Disconnected;
        let mut to = ConnectionState::Disconnected;
        self.state.send_if_modified(|state| {
            from = *state;
            to = transition(*state, &trigger);
            *state = to;
            from != to
        });
        log_state_transition(from, to);
        to
    }

    fn emit(&self, event: SessionEvent) {
        // No listeners is fine
        let _ = self.events.send(event);
    }

    fn live_wire(&self, link: &Link) -> Result<Arc<dyn Transport>> {
        let state = self.state();
        match (&link.wire, state.can_operate()) {
            (Some(wire), true) => Ok(wire.clone()),
            _ => Err(CogwyrmError::not_connected(state)),
        }
    }

    async fn bounded<F>(&self, operation: WireOperation, topic: &str, future: F) -> Result<()>
    where
        F: Future<Output = Result<()>>,
    {
        let limit = self.options.operation_timeout;
        match tokio::time::timeout(limit, future).await {
            Ok(result) => result,
            Err(_) => Err(CogwyrmError::wire(
                operation,
                topic,
                format!("no acknowledgement within {limit:?}"),
            )),
        }
    }

    async fn establish(&self) -> Result<WireLink> {
        let limit = self.options.connection_timeout;
        let options = self.options.connect_options();
        match tokio::time::timeout(limit, self.connector.connect(&self.endpoint, &options)).await {
            Ok(result) => result,
            Err(_) => Err(CogwyrmError::connection(
                ConnectionFailure::Timeout,
                format!("no CONNACK from {} within {limit:?}", self.endpoint),
            )),
        }
    }

    /// Make `wire` the live link and restore every dispatch subscription on it
    async fn install(&self, link: &mut Link, wire: Arc<dyn Transport>) {
        self.attempts.store(0, Ordering::SeqCst);
        self.pending_reconnect.store(false, Ordering::SeqCst);
        {
            let mut metrics = self.lock_metrics();
            metrics.connects += 1;
            metrics.last_connected_at = Some(Utc::now());
        }

        let topics = self.lock_dispatch().subscriptions();
        for (topic, qos) in topics {
            match self
                .bounded(WireOperation::Subscribe, &topic, wire.subscribe(&topic, qos))
                .await
            {
                Ok(()) => debug!(topic = %topic, "Re-subscribed"),
                Err(e) => error!(topic = %topic, error = %e, "Failed to re-subscribe"),
            }
        }

        link.wire = Some(wire);
    }

    /// A link that came up after disconnect was requested
    async fn release_stale(&self, stale: WireLink) {
        debug!(endpoint = %self.endpoint, "Releasing link established after disconnect");
        if let Err(e) = stale.transport.disconnect().await {
            debug!(error = %e, "Stale link disconnect failed");
        }
    }

    fn spawn_supervisor(self: &Arc<Self>, generation: u64, phase: Phase) {
        let (shutdown, shutdown_rx) = watch::channel(false);
        let span = session_span!(endpoint = %self.endpoint, generation);
        let inner = self.clone();
        let handle = tokio::spawn(
            async move { inner.supervise(generation, phase, shutdown_rx).await }.instrument(span),
        );

        let previous = self.lock_supervisor().replace(Supervisor { handle, shutdown });
        if let Some(previous) = previous {
            previous.handle.abort();
        }
    }

    /// Signal the supervisor and wait for it, aborting after a grace period
    async fn stop_supervisor(&self) {
        let supervisor = self.lock_supervisor().take();
        let Some(Supervisor {
            mut handle,
            shutdown,
        }) = supervisor
        else {
            return;
        };

        let _ = shutdown.send(true);
        match tokio::time::timeout(SUPERVISOR_SHUTDOWN_GRACE, &mut handle).await {
            Ok(Ok(())) => debug!("Reconnection supervisor stopped"),
            Ok(Err(e)) if !e.is_cancelled() => warn!("Reconnection supervisor ended with error: {}", e),
            Ok(Err(_)) => {}
            Err(_) => {
                warn!("Reconnection supervisor did not stop in time, aborting");
                handle.abort();
            }
        }
    }

    fn stop_supervisor_now(&self) {
        if let Some(supervisor) = self.lock_supervisor().take() {
            let _ = supervisor.shutdown.send(true);
            supervisor.handle.abort();
        }
    }

    async fn supervise(
        self: Arc<Self>,
        generation: u64,
        mut phase: Phase,
        mut shutdown: watch::Receiver<bool>,
    ) {
        // Holding the watch is what registers this session with the monitor
        let mut network = self.network.as_ref().map(NetworkMonitor::watch);
        debug!("Reconnection supervisor started");

        loop {
            let exit = match phase {
                Phase::Live(events) => {
                    self.run_live(generation, events, &mut shutdown, &mut network)
                        .await
                }
                Phase::Backoff => {
                    self.run_backoff(generation, &mut shutdown, &mut network)
                        .await
                }
            };
            match exit {
                PhaseExit::Next(next) => phase = next,
                PhaseExit::Stop => break,
            }
        }

        debug!("Reconnection supervisor stopped");
    }

    async fn run_live(
        &self,
        generation: u64,
        mut events: mpsc::Receiver<WireEvent>,
        shutdown: &mut watch::Receiver<bool>,
        network: &mut Option<NetworkWatch>,
    ) -> PhaseExit {
        loop {
            tokio::select! {
                biased;

                _ = wait_for_shutdown(shutdown) => return PhaseExit::Stop,

                change = next_reachability(network) => {
                    self.on_network_change(change);
                }

                event = events.recv() => match event {
                    Some(WireEvent::Message(message)) => self.deliver(message),
                    Some(WireEvent::ConnectionLost(cause)) => {
                        return self.handle_loss(generation, &cause).await;
                    }
                    None => {
                        return self.handle_loss(generation, "event stream closed").await;
                    }
                },
            }
        }
    }

    fn deliver(&self, message: Message) {
        {
            let mut metrics = self.lock_metrics();
            metrics.messages_received += 1;
            metrics.last_message_at = Some(message.timestamp);
        }

        if let Some(observer) = &self.callbacks.on_message_arrived {
            observer(&message);
        }

        let callbacks = self.lock_dispatch().callbacks_for(&message.topic);
        if callbacks.is_empty() {
            debug!(topic = %message.topic, "No callback registered for delivery");
            return;
        }
        debug!(topic = %message.topic, callbacks = callbacks.len(), "Dispatching message");
        for callback in callbacks {
            callback(&message);
        }
    }

    async fn handle_loss(&self, generation: u64, cause: &str) -> PhaseExit {
        if let Some(callback) = &self.callbacks.on_connection_lost {
            callback(cause);
        }

        let mut link = self.link.lock().await;
        if link.generation != generation {
            return PhaseExit::Stop;
        }
        link.wire = None;

        let attempt = self.attempts.fetch_add(1, Ordering::SeqCst) + 1;
        let auto_reconnect = self.options.auto_reconnect;
        self.apply(Trigger::ConnectionLost {
            auto_reconnect,
            attempt,
        });
        self.lock_metrics().connection_losses += 1;
        self.emit(SessionEvent::ConnectionLost {
            cause: cause.to_string(),
        });
        warn!(endpoint = %self.endpoint, cause, attempt, "MQTT connection lost");

        if auto_reconnect {
            PhaseExit::Next(Phase::Backoff)
        } else {
            PhaseExit::Stop
        }
    }

    async fn run_backoff(
        &self,
        generation: u64,
        shutdown: &mut watch::Receiver<bool>,
        network: &mut Option<NetworkWatch>,
    ) -> PhaseExit {
        let failures = self.attempts.load(Ordering::SeqCst);
        let (attempt, delay) = match self.options.retry.decide(failures) {
            RetryDecision::Retry { attempt, delay } => (attempt, delay),
            RetryDecision::GiveUp { attempts } => {
                let link = self.link.lock().await;
                if link.generation == generation {
                    self.apply(Trigger::RetriesExhausted);
                    self.emit(SessionEvent::GaveUp { attempts });
                    error!(
                        endpoint = %self.endpoint,
                        attempts,
                        "Max reconnection attempts exceeded"
                    );
                }
                return PhaseExit::Stop;
            }
        };

        self.emit(SessionEvent::ReconnectScheduled { attempt, delay });
        let max_display = self
            .options
            .retry
            .max_attempts()
            .map_or("∞".to_string(), |max| max.to_string());
        info!(
            "Attempting reconnection {}/{} after {}ms delay",
            attempt,
            max_display,
            delay.as_millis()
        );

        let sleep = tokio::time::sleep(delay);
        tokio::pin!(sleep);
        loop {
            tokio::select! {
                biased;

                _ = wait_for_shutdown(shutdown) => return PhaseExit::Stop,

                change = next_reachability(network) => {
                    if self.on_network_change(change) == NetworkReaction::ReconnectNow {
                        info!("Network restored, skipping remaining backoff");
                        break;
                    }
                }

                _ = &mut sleep => break,
            }
        }

        let result = tokio::select! {
            biased;
            _ = wait_for_shutdown(shutdown) => return PhaseExit::Stop,
            result = self.establish() => result,
        };

        let mut link = self.link.lock().await;
        if link.generation != generation {
            drop(link);
            if let Ok(stale) = result {
                self.release_stale(stale).await;
            }
            return PhaseExit::Stop;
        }

        match result {
            Ok(wire_link) => {
                self.install(&mut link, wire_link.transport.clone()).await;
                self.apply(Trigger::ConnectSucceeded);
                self.lock_metrics().reconnects += 1;
                self.emit(SessionEvent::Reconnected);
                PhaseExit::Next(Phase::Live(wire_link.events))
            }
            Err(err) => {
                let failures = self.attempts.fetch_add(1, Ordering::SeqCst) + 1;
                self.apply(Trigger::ReattemptFailed { attempt: failures });
                warn!(attempt, error = %err, "Reconnection attempt failed");
                PhaseExit::Next(Phase::Backoff)
            }
        }
    }

    fn on_network_change(&self, change: Option<Reachability>) -> NetworkReaction {
        let Some(reachability) = change else {
            return NetworkReaction::Ignore;
        };
        let reaction = on_reachability_change(
            self.state(),
            reachability,
            self.pending_reconnect.load(Ordering::SeqCst),
        );
        match reaction {
            NetworkReaction::MarkPending => {
                self.pending_reconnect.store(true, Ordering::SeqCst);
                info!("Network lost, reconnect pending");
            }
            NetworkReaction::ReconnectNow | NetworkReaction::ClearPending => {
                self.pending_reconnect.store(false, Ordering::SeqCst);
            }
            NetworkReaction::Ignore => {}
        }
        reaction
    }
}

/// Resolves once shutdown is signalled or the sender is gone
async fn wait_for_shutdown(shutdown: &mut watch::Receiver<bool>) {
    loop {
        if *shutdown.borrow_and_update() {
            return;
        }
        if shutdown.changed().await.is_err() {
            return;
        }
    }
}

/// Next reachability change; pends forever without a monitor
async fn next_reachability(network: &mut Option<NetworkWatch>) -> Option<Reachability> {
    match network {
        Some(watch) => match watch.changed().await {
            Some(reachability) => Some(reachability),
            None => {
                *network = None;
                None
            }
        },
        None => std::future::pending().await,
    }
}
