//! Pure event routing and acknowledgement bookkeeping for MQTT events
//!
//! rumqttc does not hand packet ids back to the caller of `publish` or
//! `subscribe`; it reports them later as outgoing events, in request order.
//! [`AckTracker`] pairs each waiting caller with its packet id on that
//! outgoing event and resolves it when the matching acknowledgement arrives.

use super::connection::from_rumqttc_qos;
use crate::protocol::{Message, QoS};
use rumqttc::{ConnectReturnCode, Event, Outgoing, Packet, SubscribeReasonCode};
use std::collections::{HashMap, VecDeque};
use tokio::sync::oneshot;
use tracing::{debug, warn};

/// Outcome delivered to a waiting caller
pub type AckResult = std::result::Result<(), String>;

/// Routing decisions for MQTT events
#[derive(Debug, Clone, PartialEq)]
pub enum EventRoute {
    /// CONNACK accepted
    ConnectionAcknowledged { session_present: bool },
    /// CONNACK with a refusal code
    ConnectionRefused(ConnectReturnCode),
    /// Application message from the broker
    MessageReceived(Message),
    PublishSent { pkid: u16 },
    /// PUBACK, final for QoS 1
    PublishAcknowledged { pkid: u16 },
    /// PUBCOMP, final for QoS 2
    PublishCompleted { pkid: u16 },
    SubscribeSent { pkid: u16 },
    SubscriptionConfirmed { pkid: u16, rejected: bool },
    UnsubscribeSent { pkid: u16 },
    UnsubscriptionConfirmed { pkid: u16 },
    /// Broker sent DISCONNECT
    Disconnected,
    /// Pings and QoS 2 intermediate steps
    InfrastructureEvent(String),
}

/// Pure message routing decisions based on MQTT events
pub struct MessageHandler;

impl MessageHandler {
    pub fn route_event(event: &Event) -> EventRoute {
        match event {
            Event::Incoming(packet) => match packet {
                Packet::ConnAck(ack) if ack.code == ConnectReturnCode::Success => {
                    EventRoute::ConnectionAcknowledged {
                        session_present: ack.session_present,
                    }
                }
                Packet::ConnAck(ack) => EventRoute::ConnectionRefused(ack.code),
                Packet::Publish(publish) => EventRoute::MessageReceived(Message::incoming(
                    publish.topic.clone(),
                    publish.payload.clone(),
                    from_rumqttc_qos(publish.qos),
                    publish.retain,
                )),
                Packet::PubAck(ack) => EventRoute::PublishAcknowledged { pkid: ack.pkid },
                Packet::PubComp(comp) => EventRoute::PublishCompleted { pkid: comp.pkid },
                Packet::SubAck(ack) => EventRoute::SubscriptionConfirmed {
                    pkid: ack.pkid,
                    rejected: Self::suback_rejected(&ack.return_codes),
                },
                Packet::UnsubAck(ack) => EventRoute::UnsubscriptionConfirmed { pkid: ack.pkid },
                Packet::Disconnect => EventRoute::Disconnected,
                other => EventRoute::InfrastructureEvent(format!("{other:?}")),
            },
            Event::Outgoing(outgoing) => match outgoing {
                Outgoing::Publish(pkid) => EventRoute::PublishSent { pkid: *pkid },
                Outgoing::Subscribe(pkid) => EventRoute::SubscribeSent { pkid: *pkid },
                Outgoing::Unsubscribe(pkid) => EventRoute::UnsubscribeSent { pkid: *pkid },
                other => EventRoute::InfrastructureEvent(format!("{other:?}")),
            },
        }
    }

    /// A SUBACK carrying any failure code rejects the subscription
    pub fn suback_rejected(return_codes: &[SubscribeReasonCode]) -> bool {
        return_codes
            .iter()
            .any(|code| matches!(code, SubscribeReasonCode::Failure))
    }
}

/// Request kinds the tracker correlates
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckKind {
    Publish,
    Subscribe,
    Unsubscribe,
}

/// Waiting callers, first by request order, then by packet id
#[derive(Debug, Default)]
pub struct AckTracker {
    queued_publishes: VecDeque<(QoS, oneshot::Sender<AckResult>)>,
    queued_subscribes: VecDeque<oneshot::Sender<AckResult>>,
    queued_unsubscribes: VecDeque<oneshot::Sender<AckResult>>,
    publishes: HashMap<u16, oneshot::Sender<AckResult>>,
    subscribes: HashMap<u16, oneshot::Sender<AckResult>>,
    unsubscribes: HashMap<u16, oneshot::Sender<AckResult>>,
}

impl AckTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a waiter; must be called in the same order requests are sent
    pub fn register(&mut self, kind: AckKind, qos: QoS) -> oneshot::Receiver<AckResult> {
        let (reply, receiver) = oneshot::channel();
        match kind {
            AckKind::Publish => self.queued_publishes.push_back((qos, reply)),
            AckKind::Subscribe => self.queued_subscribes.push_back(reply),
            AckKind::Unsubscribe => self.queued_unsubscribes.push_back(reply),
        }
        receiver
    }

    /// Drop the most recent waiter of `kind` after its request never left
    pub fn abandon_last(&mut self, kind: AckKind) {
        match kind {
            AckKind::Publish => {
                self.queued_publishes.pop_back();
            }
            AckKind::Subscribe => {
                self.queued_subscribes.pop_back();
            }
            AckKind::Unsubscribe => {
                self.queued_unsubscribes.pop_back();
            }
        }
    }

    /// Waiters not yet resolved
    pub fn pending(&self) -> usize {
        self.queued_publishes.len()
            + self.queued_subscribes.len()
            + self.queued_unsubscribes.len()
            + self.publishes.len()
            + self.subscribes.len()
            + self.unsubscribes.len()
    }

    pub fn on_route(&mut self, route: &EventRoute) {
        match route {
            EventRoute::PublishSent { pkid } => {
                let Some((qos, reply)) = self.queued_publishes.pop_front() else {
                    debug!(pkid, "Outgoing publish without a waiter");
                    return;
                };
                if qos == QoS::AtMostOnce {
                    let _ = reply.send(Ok(()));
                } else {
                    self.publishes.insert(*pkid, reply);
                }
            }
            EventRoute::PublishAcknowledged { pkid } | EventRoute::PublishCompleted { pkid } => {
                if let Some(reply) = self.publishes.remove(pkid) {
                    let _ = reply.send(Ok(()));
                }
            }
            EventRoute::SubscribeSent { pkid } => {
                if let Some(reply) = self.queued_subscribes.pop_front() {
                    self.subscribes.insert(*pkid, reply);
                }
            }
            EventRoute::SubscriptionConfirmed { pkid, rejected } => {
                if let Some(reply) = self.subscribes.remove(pkid) {
                    let outcome = if *rejected {
                        warn!(pkid, "Broker rejected subscription");
                        Err("broker rejected the subscription".to_string())
                    } else {
                        Ok(())
                    };
                    let _ = reply.send(outcome);
                }
            }
            EventRoute::UnsubscribeSent { pkid } => {
                if let Some(reply) = self.queued_unsubscribes.pop_front() {
                    self.unsubscribes.insert(*pkid, reply);
                }
            }
            EventRoute::UnsubscriptionConfirmed { pkid } => {
                if let Some(reply) = self.unsubscribes.remove(pkid) {
                    let _ = reply.send(Ok(()));
                }
            }
            _ => {}
        }
    }

    /// Fail every waiter; used once the link is gone
    pub fn fail_all(&mut self, reason: &str) {
        let queued = self
            .queued_publishes
            .drain(..)
            .map(|(_, reply)| reply)
            .chain(self.queued_subscribes.drain(..))
            .chain(self.queued_unsubscribes.drain(..));
        let correlated = self
            .publishes
            .drain()
            .chain(self.subscribes.drain())
            .chain(self.unsubscribes.drain())
            .map(|(_, reply)| reply);

        for reply in queued.chain(correlated) {
            let _ = reply.send(Err(reason.to_string()));
        }
    }
}
