//! MQTT v5 transport.
//!
//! Mapping onto the transport contract:
//! - every publish and subscription is QoS 1 on a persistent session
//!   (`clean_start = false` plus a session expiry), so the broker keeps
//!   queued and in-flight messages while a consumer is away
//! - acknowledgements are manual; a delivery is only PUBACKed by `ack`
//! - competing consumers use shared subscriptions `$share/<group>/<filter>`
//! - a requeue-nack drops the connection without acknowledging, which makes
//!   the broker resend on session resumption; a discard-nack is an ack

use std::collections::HashMap;
use std::sync::mpsc::{self, Receiver, RecvTimeoutError};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use rumqttc::v5::mqttbytes::v5::{ConnectProperties, Packet, Publish};
use rumqttc::v5::mqttbytes::QoS;
use rumqttc::v5::{Client, Event, MqttOptions};

use crate::config::BrokerSettings;
use crate::error::TransportError;

use super::endpoint::{BrokerEndpoint, TlsMaterials};
use super::{Connector, Delivery, DeliveryTag, Subscription, Transport};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const PUBLISH_TIMEOUT: Duration = Duration::from_secs(10);
const REQUEST_CAPACITY: usize = 10;

enum Inbound {
    Connected,
    Publish(Publish),
    Lost(String),
}

/// PUBACKs received for our own publishes.
#[derive(Default)]
struct PubAcks {
    count: Mutex<u64>,
    changed: Condvar,
}

impl PubAcks {
    fn bump(&self) {
        let mut count = self.count.lock().unwrap_or_else(|p| p.into_inner());
        *count += 1;
        self.changed.notify_all();
    }

    fn wait_for(&self, target: u64, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut count = self.count.lock().unwrap_or_else(|p| p.into_inner());
        while *count < target {
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            count = match self.changed.wait_timeout(count, deadline - now) {
                Ok((guard, _)) => guard,
                Err(p) => p.into_inner().0,
            };
        }
        true
    }
}

/// Builds MQTT connections from broker settings.
#[derive(Clone)]
pub struct MqttConnector {
    settings: BrokerSettings,
    endpoint: BrokerEndpoint,
    materials: TlsMaterials,
}

impl MqttConnector {
    pub fn new(settings: BrokerSettings) -> anyhow::Result<Self> {
        let endpoint = BrokerEndpoint::parse(&settings.addr)?;
        let materials = TlsMaterials::load(
            settings.tls_ca_path.as_deref(),
            settings.tls_client_cert_path.as_deref(),
            settings.tls_client_key_path.as_deref(),
        )?;
        // Fail on inconsistent TLS settings now rather than on first connect.
        endpoint.socket(&materials)?;
        Ok(Self {
            settings,
            endpoint,
            materials,
        })
    }

    fn options(&self, client_id: &str) -> Result<MqttOptions, TransportError> {
        let mut options = MqttOptions::new(client_id, &self.endpoint.host, self.endpoint.port);
        options.set_keep_alive(self.settings.keep_alive);
        // A zero expiry ends the session with the connection, and with it
        // every unacknowledged delivery a requeue-nack relies on.
        options.set_clean_start(false);
        let mut props = ConnectProperties::new();
        props.session_expiry_interval = Some(self.settings.session_expiry_secs);
        options.set_connect_properties(props);
        options.set_manual_acks(true);
        if let Some(user) = &self.settings.username {
            options.set_credentials(user, self.settings.password.clone().unwrap_or_default());
        }
        let socket = self
            .endpoint
            .socket(&self.materials)
            .map_err(|e| TransportError::ConnectFailed(e.to_string()))?;
        options.set_transport(socket);
        Ok(options)
    }
}

impl Connector for MqttConnector {
    fn connect(&self, client_id: &str) -> Result<Box<dyn Transport>, TransportError> {
        Ok(Box::new(MqttTransport::connect(self, client_id)?))
    }
}

/// One MQTT session. A reader thread drives the rumqttc event loop and
/// forwards incoming publishes.
pub struct MqttTransport {
    client: Client,
    client_id: String,
    inbound: Receiver<Inbound>,
    reader: Option<JoinHandle<()>>,
    pubacks: Arc<PubAcks>,
    published: u64,
    next_tag: u64,
    pending: HashMap<u64, Publish>,
    lost: Option<String>,
}

impl MqttTransport {
    fn connect(connector: &MqttConnector, client_id: &str) -> Result<Self, TransportError> {
        let options = connector.options(client_id)?;
        let (client, mut connection) = Client::new(options, REQUEST_CAPACITY);
        let (tx, rx) = mpsc::channel();
        let pubacks = Arc::new(PubAcks::default());
        let reader_acks = Arc::clone(&pubacks);

        let reader = std::thread::Builder::new()
            .name(format!("mqtt-{}", client_id))
            .spawn(move || {
                for event in connection.iter() {
                    let forwarded = match event {
                        Ok(Event::Incoming(Packet::ConnAck(_))) => tx.send(Inbound::Connected),
                        Ok(Event::Incoming(Packet::Publish(publish))) => {
                            tx.send(Inbound::Publish(publish))
                        }
                        Ok(Event::Incoming(Packet::PubAck(_))) => {
                            reader_acks.bump();
                            Ok(())
                        }
                        Ok(Event::Incoming(Packet::Disconnect(_))) => {
                            let _ = tx.send(Inbound::Lost("broker sent disconnect".into()));
                            break;
                        }
                        Ok(_) => Ok(()),
                        Err(e) => {
                            let _ = tx.send(Inbound::Lost(e.to_string()));
                            break;
                        }
                    };
                    if forwarded.is_err() {
                        // Transport dropped; stop driving the event loop.
                        break;
                    }
                }
            })
            .map_err(|e| TransportError::ConnectFailed(format!("reader thread: {}", e)))?;

        match rx.recv_timeout(CONNECT_TIMEOUT) {
            Ok(Inbound::Connected) => {
                log::info!(
                    "mqtt session {} connected to {}:{} (tls: {})",
                    client_id,
                    connector.endpoint.host,
                    connector.endpoint.port,
                    connector.endpoint.use_tls
                );
            }
            Ok(Inbound::Lost(reason)) => {
                let _ = client.disconnect();
                return Err(TransportError::ConnectFailed(reason));
            }
            Ok(Inbound::Publish(_)) => {
                // Cannot precede CONNACK.
                let _ = client.disconnect();
                return Err(TransportError::ConnectFailed(
                    "publish received before connack".into(),
                ));
            }
            Err(_) => {
                let _ = client.disconnect();
                return Err(TransportError::ConnectFailed(format!(
                    "no connack within {:?}",
                    CONNECT_TIMEOUT
                )));
            }
        }

        Ok(Self {
            client,
            client_id: client_id.to_string(),
            inbound: rx,
            reader: Some(reader),
            pubacks,
            published: 0,
            next_tag: 0,
            pending: HashMap::new(),
            lost: None,
        })
    }

    fn check_live(&self) -> Result<(), TransportError> {
        match &self.lost {
            Some(reason) => Err(TransportError::ConnectionLost(reason.clone())),
            None => Ok(()),
        }
    }

    fn mark_lost(&mut self, reason: String) -> TransportError {
        log::warn!("mqtt session {} lost: {}", self.client_id, reason);
        self.lost = Some(reason.clone());
        self.pending.clear();
        TransportError::ConnectionLost(reason)
    }
}

impl Transport for MqttTransport {
    fn publish(&mut self, topic: &str, payload: &[u8]) -> Result<(), TransportError> {
        self.check_live()?;
        self.client
            .publish(topic, QoS::AtLeastOnce, false, payload.to_vec())
            .map_err(|e| TransportError::Publish {
                topic: topic.to_string(),
                reason: e.to_string(),
            })?;
        self.published += 1;
        if !self.pubacks.wait_for(self.published, PUBLISH_TIMEOUT) {
            return Err(self.mark_lost(format!(
                "no puback for {} within {:?}",
                topic, PUBLISH_TIMEOUT
            )));
        }
        Ok(())
    }

    fn subscribe(&mut self, subscription: &Subscription) -> Result<(), TransportError> {
        self.check_live()?;
        let filter = format!("$share/{}/{}", subscription.group, subscription.filter);
        self.client
            .subscribe(filter.as_str(), QoS::AtLeastOnce)
            .map_err(|e| self.mark_lost(format!("subscribe {}: {}", filter, e)))?;
        log::info!("mqtt session {} subscribed to {}", self.client_id, filter);
        Ok(())
    }

    fn receive(&mut self, timeout: Duration) -> Result<Option<Delivery>, TransportError> {
        self.check_live()?;
        let deadline = Instant::now() + timeout;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match self.inbound.recv_timeout(remaining) {
                Ok(Inbound::Publish(publish)) => {
                    let topic = match std::str::from_utf8(&publish.topic) {
                        Ok(topic) => topic.to_string(),
                        Err(e) => {
                            log::warn!("acking publish with invalid topic: {}", e);
                            let _ = self.client.ack(&publish);
                            continue;
                        }
                    };
                    self.next_tag += 1;
                    let tag = self.next_tag;
                    let delivery = Delivery {
                        topic,
                        payload: publish.payload.to_vec(),
                        redelivered: publish.dup,
                        tag: DeliveryTag(tag),
                    };
                    self.pending.insert(tag, publish);
                    return Ok(Some(delivery));
                }
                Ok(Inbound::Connected) => continue,
                Ok(Inbound::Lost(reason)) => return Err(self.mark_lost(reason)),
                Err(RecvTimeoutError::Timeout) => return Ok(None),
                Err(RecvTimeoutError::Disconnected) => {
                    return Err(self.mark_lost("event loop stopped".into()))
                }
            }
        }
    }

    fn ack(&mut self, delivery: &Delivery) -> Result<(), TransportError> {
        self.check_live()?;
        let publish = self.pending.remove(&delivery.tag.0).ok_or_else(|| {
            TransportError::ConnectionLost(format!(
                "delivery {:?} is not outstanding on {}",
                delivery.tag, self.client_id
            ))
        })?;
        self.client
            .ack(&publish)
            .map_err(|e| self.mark_lost(format!("ack: {}", e)))
    }

    fn nack(&mut self, delivery: &Delivery, requeue: bool) -> Result<(), TransportError> {
        if !requeue {
            return self.ack(delivery);
        }
        self.check_live()?;
        // No per-message reject in MQTT: leave it unacknowledged and end the
        // session's connection so the broker resends on resumption.
        log::info!(
            "mqtt session {} dropping connection to requeue {}",
            self.client_id,
            delivery.topic
        );
        let _ = self.client.disconnect();
        self.lost = Some("connection dropped to requeue a delivery".into());
        self.pending.clear();
        Ok(())
    }

    fn disconnect(&mut self) {
        let _ = self.client.disconnect();
        if self.lost.is_none() {
            self.lost = Some("disconnected".into());
        }
        self.pending.clear();
        // The reader thread exits on its own once the event loop reports the
        // closed socket.
        self.reader.take();
    }
}

impl Drop for MqttTransport {
    fn drop(&mut self) {
        let _ = self.client.disconnect();
    }
}
