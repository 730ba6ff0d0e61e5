//! Impure I/O operations for the rumqttc-backed transport
//!
//! This module handles all impure I/O operations: opening the connection,
//! driving the rumqttc event loop, and turning client requests into awaitable
//! broker acknowledgements.

use super::connection::{configure_mqtt_options, connection_error, classify_refusal, to_rumqttc_qos};
use super::message_handler::{AckKind, AckResult, AckTracker, EventRoute, MessageHandler};
use crate::config::BrokerEndpoint;
use crate::error::{sanitize_error_message, CogwyrmError, ConnectionFailure, Result, WireOperation};
use crate::mqtt_span;
use crate::protocol::QoS;
use crate::transport::{ConnectOptions, Connector, Transport, WireEvent, WireLink};
use async_trait::async_trait;
use bytes::Bytes;
use rumqttc::{AsyncClient, ClientError, EventLoop};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn, Instrument};

/// Capacity of the rumqttc request queue
const REQUEST_CAPACITY: usize = 16;
/// Capacity of the delivery channel towards the session
const EVENT_CAPACITY: usize = 256;
const DRIVER_SHUTDOWN_GRACE: Duration = Duration::from_secs(1);

/// Opens rumqttc connections
#[derive(Debug, Clone, Copy, Default)]
pub struct RumqttcConnector;

impl RumqttcConnector {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Connector for RumqttcConnector {
    async fn connect(&self, endpoint: &BrokerEndpoint, options: &ConnectOptions) -> Result<WireLink> {
        let mqtt_options = configure_mqtt_options(endpoint, options);
        let (client, mut event_loop) = AsyncClient::new(mqtt_options, REQUEST_CAPACITY);

        debug!(endpoint = %endpoint, client_id = endpoint.client_id(), "Opening MQTT connection");
        match tokio::time::timeout(
            options.connection_timeout,
            wait_for_connack(endpoint, &mut event_loop),
        )
        .await
        {
            Ok(Ok(session_present)) => {
                info!(endpoint = %endpoint, session_present, "Broker accepted connection");
            }
            Ok(Err(e)) => return Err(e),
            Err(_) => {
                return Err(CogwyrmError::connection(
                    ConnectionFailure::Timeout,
                    format!("no CONNACK from {endpoint} within {:?}", options.connection_timeout),
                ))
            }
        }

        let tracker = Arc::new(Mutex::new(AckTracker::new()));
        let closing = Arc::new(AtomicBool::new(false));
        let (events, receiver) = mpsc::channel(EVENT_CAPACITY);

        let span = mqtt_span!(endpoint = %endpoint);
        let driver = tokio::spawn(
            drive_event_loop(event_loop, tracker.clone(), events, closing.clone()).instrument(span),
        );

        Ok(WireLink {
            transport: Arc::new(RumqttcTransport {
                client,
                tracker,
                closing,
                operation_timeout: options.operation_timeout,
                order: tokio::sync::Mutex::new(()),
                driver: Mutex::new(Some(driver)),
            }),
            events: receiver,
        })
    }
}

/// Poll until the broker answers the CONNECT
async fn wait_for_connack(endpoint: &BrokerEndpoint, event_loop: &mut EventLoop) -> Result<bool> {
    loop {
        let event = event_loop
            .poll()
            .await
            .map_err(|e| connection_error(endpoint, &e))?;
        match MessageHandler::route_event(&event) {
            EventRoute::ConnectionAcknowledged { session_present } => return Ok(session_present),
            EventRoute::ConnectionRefused(code) => {
                return Err(CogwyrmError::connection(
                    classify_refusal(code),
                    format!("{endpoint} refused connection: {code:?}"),
                ))
            }
            route => debug!(?route, "Event before CONNACK"),
        }
    }
}

/// Forward deliveries and resolve acknowledgements until the link drops
async fn drive_event_loop(
    mut event_loop: EventLoop,
    tracker: Arc<Mutex<AckTracker>>,
    events: mpsc::Sender<WireEvent>,
    closing: Arc<AtomicBool>,
) {
    debug!("MQTT event loop started");

    let cause = loop {
        match event_loop.poll().await {
            Ok(event) => match MessageHandler::route_event(&event) {
                EventRoute::MessageReceived(message) => {
                    tracing::trace!(topic = %message.topic, "Received MQTT message");
                    if events.send(WireEvent::Message(message)).await.is_err() {
                        debug!("Session released the link, stopping event loop");
                        return;
                    }
                }
                EventRoute::Disconnected => break "broker sent DISCONNECT".to_string(),
                EventRoute::InfrastructureEvent(detail) => {
                    tracing::trace!(target: "mqtt_transport", "MQTT event: {}", detail);
                }
                route => {
                    lock_tracker(&tracker).on_route(&route);
                }
            },
            Err(e) => break sanitize_error_message(&e.to_string()),
        }
    };

    lock_tracker(&tracker).fail_all(&cause);
    if closing.load(Ordering::SeqCst) {
        debug!("MQTT event loop stopped after disconnect");
        return;
    }

    error!(cause = %cause, "MQTT event loop error");
    let _ = events.send(WireEvent::ConnectionLost(cause)).await;
}

fn lock_tracker(tracker: &Mutex<AckTracker>) -> MutexGuard<'_, AckTracker> {
    tracker.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// A waiter queued for a request that rumqttc has not accepted yet
///
/// Dropping it before [`handed_over`](Self::handed_over) withdraws the waiter,
/// so a send that fails or is cancelled by a timeout cannot shift the
/// acknowledgements of later requests onto the wrong caller. Only valid
/// while the order lock is held, since the waiter must be the newest of its kind.
struct QueuedWaiter<'a> {
    tracker: &'a Mutex<AckTracker>,
    kind: AckKind,
    handed_over: bool,
}

impl<'a> QueuedWaiter<'a> {
    fn new(tracker: &'a Mutex<AckTracker>, kind: AckKind) -> Self {
        Self {
            tracker,
            kind,
            handed_over: false,
        }
    }

    fn handed_over(&mut self) {
        self.handed_over = true;
    }
}

impl Drop for QueuedWaiter<'_> {
    fn drop(&mut self) {
        if !self.handed_over {
            debug!(kind = ?self.kind, "Withdrawing waiter for a request that was never sent");
            lock_tracker(self.tracker).abandon_last(self.kind);
        }
    }
}

/// Outgoing side of one rumqttc link
pub struct RumqttcTransport {
    client: AsyncClient,
    tracker: Arc<Mutex<AckTracker>>,
    closing: Arc<AtomicBool>,
    operation_timeout: Duration,
    /// Keeps waiter registration in the same order as requests
    order: tokio::sync::Mutex<()>,
    driver: Mutex<Option<JoinHandle<()>>>,
}

impl RumqttcTransport {
    /// Register a waiter, send the request and wait for the broker's answer
    async fn request<F>(
        &self,
        kind: AckKind,
        qos: QoS,
        operation: WireOperation,
        topic: &str,
        send: F,
    ) -> Result<()>
    where
        F: std::future::Future<Output = std::result::Result<(), ClientError>>,
    {
        let waiter = {
            let _order = self.order.lock().await;
            let waiter = lock_tracker(&self.tracker).register(kind, qos);
            // Declared after `_order` so it is withdrawn while the lock is still held
            let mut queued = QueuedWaiter::new(&self.tracker, kind);
            send.await
                .map_err(|e| CogwyrmError::wire(operation, topic, e.to_string()))?;
            queued.handed_over();
            waiter
        };

        await_ack(waiter, self.operation_timeout, operation, topic).await
    }

    fn take_driver(&self) -> Option<JoinHandle<()>> {
        self.driver
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take()
    }
}

async fn await_ack(
    waiter: oneshot::Receiver<AckResult>,
    limit: Duration,
    operation: WireOperation,
    topic: &str,
) -> Result<()> {
    match tokio::time::timeout(limit, waiter).await {
        Ok(Ok(Ok(()))) => Ok(()),
        Ok(Ok(Err(reason))) => Err(CogwyrmError::wire(operation, topic, reason)),
        Ok(Err(_)) => Err(CogwyrmError::wire(operation, topic, "link closed before acknowledgement")),
        Err(_) => Err(CogwyrmError::wire(
            operation,
            topic,
            format!("no acknowledgement within {limit:?}"),
        )),
    }
}

#[async_trait]
impl Transport for RumqttcTransport {
    async fn publish(&self, topic: &str, payload: Bytes, qos: QoS, retained: bool) -> Result<()> {
        self.request(
            AckKind::Publish,
            qos,
            WireOperation::Publish,
            topic,
            self.client
                .publish_bytes(topic, to_rumqttc_qos(qos), retained, payload),
        )
        .await
    }

    async fn subscribe(&self, topic: &str, qos: QoS) -> Result<()> {
        self.request(
            AckKind::Subscribe,
            qos,
            WireOperation::Subscribe,
            topic,
            self.client.subscribe(topic, to_rumqttc_qos(qos)),
        )
        .await
    }

    async fn unsubscribe(&self, topic: &str) -> Result<()> {
        self.request(
            AckKind::Unsubscribe,
            QoS::AtMostOnce,
            WireOperation::Unsubscribe,
            topic,
            self.client.unsubscribe(topic),
        )
        .await
    }

    async fn disconnect(&self) -> Result<()> {
        self.closing.store(true, Ordering::SeqCst);
        let sent = self.client.disconnect().await;

        if let Some(mut driver) = self.take_driver() {
            if tokio::time::timeout(DRIVER_SHUTDOWN_GRACE, &mut driver)
                .await
                .is_err()
            {
                debug!("MQTT event loop did not stop in time, aborting");
                driver.abort();
            }
        }

        sent.map_err(|e| {
            warn!(error = %e, "DISCONNECT could not be queued");
            CogwyrmError::connection(ConnectionFailure::Unreachable, e.to_string())
        })
    }
}

impl Drop for RumqttcTransport {
    fn drop(&mut self) {
        if let Some(driver) = self.take_driver() {
            driver.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rumqttc::MqttOptions;
    use tokio::net::TcpListener;

    /// Transport over a client whose event loop is never polled
    fn unpolled_transport(capacity: usize) -> (RumqttcTransport, EventLoop) {
        let options = MqttOptions::new("cogwyrm_unpolled", "127.0.0.1", 1883);
        let (client, event_loop) = AsyncClient::new(options, capacity);
        let transport = RumqttcTransport {
            client,
            tracker: Arc::new(Mutex::new(AckTracker::new())),
            closing: Arc::new(AtomicBool::new(false)),
            operation_timeout: Duration::from_millis(20),
            order: tokio::sync::Mutex::new(()),
            driver: Mutex::new(None),
        };
        (transport, event_loop)
    }

    #[test]
    fn test_unsent_waiter_is_withdrawn_on_drop() {
        // Arrange
        let tracker = Mutex::new(AckTracker::new());
        let _orphan = lock_tracker(&tracker).register(AckKind::Publish, QoS::AtLeastOnce);
        drop(QueuedWaiter::new(&tracker, AckKind::Publish));

        let mut next = lock_tracker(&tracker).register(AckKind::Publish, QoS::AtLeastOnce);
        let mut sent = QueuedWaiter::new(&tracker, AckKind::Publish);
        sent.handed_over();
        drop(sent);

        // Act
        lock_tracker(&tracker).on_route(&EventRoute::PublishSent { pkid: 7 });
        lock_tracker(&tracker).on_route(&EventRoute::PublishAcknowledged { pkid: 7 });

        // Assert
        assert_eq!(next.try_recv().unwrap(), Ok(()));
        assert_eq!(lock_tracker(&tracker).pending(), 0);
    }

    #[tokio::test]
    async fn test_publish_cancelled_on_full_queue_leaves_no_waiter() {
        // Arrange: one slot, taken by the first publish
        let (transport, _event_loop) = unpolled_transport(1);
        let first = transport
            .publish("home/light", Bytes::from_static(b"on"), QoS::AtLeastOnce, false)
            .await;
        assert!(first.is_err(), "nobody acknowledges the first publish");
        assert_eq!(lock_tracker(&transport.tracker).pending(), 1);

        // Act: the second send blocks on the full queue and is cancelled
        let second = tokio::time::timeout(
            Duration::from_millis(50),
            transport.publish("home/light", Bytes::from_static(b"off"), QoS::AtLeastOnce, false),
        )
        .await;

        // Assert
        assert!(second.is_err());
        assert_eq!(lock_tracker(&transport.tracker).pending(), 1);
    }

    #[tokio::test]
    async fn test_connect_to_closed_port_is_classified() {
        // Arrange: bind then drop to get a port with nothing listening
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);
        let endpoint = BrokerEndpoint::new("127.0.0.1", port).unwrap();
        let options = ConnectOptions {
            connection_timeout: Duration::from_secs(5),
            ..ConnectOptions::default()
        };

        // Act
        let err = RumqttcConnector::new()
            .connect(&endpoint, &options)
            .await
            .unwrap_err();

        // Assert
        assert_eq!(err.category(), "connection");
        assert!(matches!(
            err.connection_failure(),
            Some(ConnectionFailure::Refused | ConnectionFailure::Unreachable)
        ));
    }

    #[tokio::test]
    async fn test_silent_server_times_out() {
        // Accepts TCP but never answers CONNECT
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let _server = tokio::spawn(async move {
            let mut held = Vec::new();
            while let Ok((socket, _)) = listener.accept().await {
                held.push(socket);
            }
        });
        let endpoint = BrokerEndpoint::new("127.0.0.1", port).unwrap();
        let options = ConnectOptions {
            connection_timeout: Duration::from_millis(300),
            ..ConnectOptions::default()
        };

        let err = RumqttcConnector::new()
            .connect(&endpoint, &options)
            .await
            .unwrap_err();

        assert_eq!(err.connection_failure(), Some(ConnectionFailure::Timeout));
    }
}
