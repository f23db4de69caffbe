//! Pure routing of rumqttc events
//!
//! This module maps raw MQTT v5 events to routing decisions, converts
//! inbound publishes into the crate's `InboundMessage` and matches outbound
//! publishes to their delivery tokens.

use super::connection::from_rumqttc_qos;
use crate::types::{DeliveryToken, InboundMessage, Qos};
use rumqttc::v5::mqttbytes::v5::{Packet, Publish};
use rumqttc::v5::Event;
use rumqttc::Outgoing;
use std::collections::{HashMap, VecDeque};

/// Pure message routing decisions based on MQTT events
pub struct MessageHandler;

impl MessageHandler {
    /// Route MQTT event to appropriate handler (pure routing decision)
    pub fn route_mqtt_event(event: &Event) -> EventRoute {
        match event {
            Event::Incoming(incoming) => match incoming {
                Packet::ConnAck(connack) => EventRoute::ConnectionAcknowledged {
                    session_present: connack.session_present,
                },
                Packet::Publish(publish) => EventRoute::MessageReceived(publish.clone()),
                Packet::PubAck(puback) => EventRoute::DeliveryConfirmed {
                    packet_id: puback.pkid,
                },
                Packet::PubComp(pubcomp) => EventRoute::DeliveryConfirmed {
                    packet_id: pubcomp.pkid,
                },
                Packet::Disconnect(_) => EventRoute::Disconnected,
                Packet::SubAck(suback) => EventRoute::SubscriptionConfirmed {
                    packet_id: suback.pkid,
                },
                other => EventRoute::InfrastructureEvent(format!("{other:?}")),
            },
            Event::Outgoing(Outgoing::Publish(pkid)) => EventRoute::PublishSent { packet_id: *pkid },
            Event::Outgoing(_) => EventRoute::OutgoingEvent,
        }
    }

    /// Convert an inbound publish (pure function)
    pub fn to_inbound_message(publish: &Publish) -> InboundMessage {
        let qos = from_rumqttc_qos(publish.qos);
        InboundMessage {
            topic: String::from_utf8_lossy(&publish.topic).to_string(),
            payload: publish.payload.clone(),
            qos,
            retained: publish.retain,
            duplicate: publish.dup,
            packet_id: Self::ack_packet_id(qos, publish.pkid),
        }
    }

    /// QoS 0 publishes carry no packet id and need no acknowledgment
    pub fn ack_packet_id(qos: Qos, pkid: u16) -> Option<u16> {
        match qos {
            Qos::AtMostOnce => None,
            _ if pkid == 0 => None,
            _ => Some(pkid),
        }
    }
}

/// Routing decisions for MQTT events
#[derive(Debug, Clone)]
pub enum EventRoute {
    /// Broker accepted the session
    ConnectionAcknowledged { session_present: bool },
    /// Message received on subscribed topic
    MessageReceived(Publish),
    /// Outbound publish written to the socket; packet id 0 for QoS 0
    PublishSent { packet_id: u16 },
    /// Outbound QoS 1/2 publish fully acknowledged
    DeliveryConfirmed { packet_id: u16 },
    /// Broker sent DISCONNECT
    Disconnected,
    SubscriptionConfirmed { packet_id: u16 },
    /// Infrastructure event (PingResp, etc.)
    InfrastructureEvent(String),
    /// Outgoing event (handled automatically)
    OutgoingEvent,
}

/// Matches outbound publishes to the tokens they were handed over with.
///
/// rumqttc reports `Outgoing::Publish` in request order, so tokens wait in a
/// FIFO until their packet id is known, then until the broker's ack.
#[derive(Debug, Default)]
pub struct DeliveryTracker {
    queued: VecDeque<(DeliveryToken, Qos)>,
    awaiting_ack: HashMap<u16, DeliveryToken>,
}

impl DeliveryTracker {
    pub fn enqueue(&mut self, token: DeliveryToken, qos: Qos) {
        self.queued.push_back((token, qos));
    }

    /// Withdraw a token whose request never reached the event loop
    pub fn cancel(&mut self, token: DeliveryToken) {
        self.queued.retain(|(queued, _)| *queued != token);
    }

    /// A publish hit the wire. Returns the token that is now complete,
    /// which only happens for QoS 0.
    pub fn on_publish_sent(&mut self, packet_id: u16) -> Option<DeliveryToken> {
        if packet_id != 0 && self.awaiting_ack.contains_key(&packet_id) {
            // Retransmission after a session resume
            return None;
        }
        let (token, qos) = self.queued.pop_front()?;
        match qos {
            Qos::AtMostOnce => Some(token),
            Qos::AtLeastOnce | Qos::ExactlyOnce => {
                self.awaiting_ack.insert(packet_id, token);
                None
            }
        }
    }

    pub fn on_acknowledged(&mut self, packet_id: u16) -> Option<DeliveryToken> {
        self.awaiting_ack.remove(&packet_id)
    }

    pub fn in_flight(&self) -> usize {
        self.queued.len() + self.awaiting_ack.len()
    }

    pub fn clear(&mut self) {
        self.queued.clear();
        self.awaiting_ack.clear();
    }
}
