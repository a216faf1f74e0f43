//! Message transport between pipeline stages.
//!
//! Two logical channels ride on one topic space:
//! - work: `<prefix>/frames/<stream_id>`, frame payloads for violation workers
//! - results: `<prefix>/results/<stream_id>`, per-frame detections and
//!   violations for the aggregator
//!
//! Delivery is at-least-once. A consumer acknowledges each delivery after it
//! has been fully handled; anything received but not acknowledged when the
//! connection goes away is delivered again, possibly to another consumer.

mod endpoint;
mod memory;
mod mqtt;
pub mod wire;

use std::time::Duration;

use crate::error::TransportError;

pub use endpoint::{BrokerEndpoint, TlsMaterials};
pub use memory::{InMemoryBroker, MemoryConnection};
pub use mqtt::{MqttConnector, MqttTransport};
pub use wire::{FrameMessage, ResultMessage};

/// Opaque handle identifying a delivery on the connection that received it.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct DeliveryTag(pub(crate) u64);

#[derive(Clone, Debug)]
pub struct Delivery {
    pub topic: String,
    pub payload: Vec<u8>,
    /// Set when the broker knows this message was handed out before.
    pub redelivered: bool,
    pub tag: DeliveryTag,
}

/// Durable subscription. Consumers subscribing with the same group compete
/// for messages; each message goes to one member of the group.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Subscription {
    pub filter: String,
    pub group: String,
}

impl Subscription {
    pub fn new(filter: impl Into<String>, group: impl Into<String>) -> Self {
        Self {
            filter: filter.into(),
            group: group.into(),
        }
    }
}

/// One live connection to the broker.
pub trait Transport: Send {
    /// Durable publish; returns once the broker has taken the message.
    fn publish(&mut self, topic: &str, payload: &[u8]) -> Result<(), TransportError>;

    fn subscribe(&mut self, subscription: &Subscription) -> Result<(), TransportError>;

    /// Wait up to `timeout` for the next delivery. `Ok(None)` on timeout.
    fn receive(&mut self, timeout: Duration) -> Result<Option<Delivery>, TransportError>;

    fn ack(&mut self, delivery: &Delivery) -> Result<(), TransportError>;

    /// Reject a delivery. With `requeue` it will be delivered again;
    /// without, it is dropped for good.
    fn nack(&mut self, delivery: &Delivery, requeue: bool) -> Result<(), TransportError>;

    /// Close the connection. Unacknowledged deliveries are redelivered.
    fn disconnect(&mut self);
}

/// Opens connections; handed to the orchestrator so it can reconnect.
pub trait Connector: Send + Sync {
    fn connect(&self, client_id: &str) -> Result<Box<dyn Transport>, TransportError>;
}

/// Topic layout under a configurable prefix.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Topics {
    prefix: String,
}

impl Topics {
    pub fn new(prefix: impl Into<String>) -> Self {
        let prefix: String = prefix.into();
        Self {
            prefix: prefix.trim_end_matches('/').to_string(),
        }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn frames(&self, stream_id: &str) -> String {
        format!("{}/frames/{}", self.prefix, stream_id)
    }

    pub fn results(&self, stream_id: &str) -> String {
        format!("{}/results/{}", self.prefix, stream_id)
    }

    /// Filter matching every stream's frames.
    pub fn all_frames(&self) -> String {
        format!("{}/frames/+", self.prefix)
    }

    pub fn all_results(&self) -> String {
        format!("{}/results/+", self.prefix)
    }

    /// Stream id segment of a frames or results topic under this prefix.
    pub fn stream_of<'a>(&self, topic: &'a str) -> Option<&'a str> {
        let rest = topic.strip_prefix(self.prefix.as_str())?.strip_prefix('/')?;
        let (channel, stream) = rest.split_once('/')?;
        match channel {
            "frames" | "results" if !stream.is_empty() && !stream.contains('/') => Some(stream),
            _ => None,
        }
    }
}

/// MQTT-style filter matching: `+` matches one level, a trailing `#` matches
/// the remaining levels (including none).
pub fn topic_matches(filter: &str, topic: &str) -> bool {
    let mut f = filter.split('/');
    let mut t = topic.split('/');
    loop {
        match (f.next(), t.next()) {
            (Some("#"), _) => return true,
            (Some("+"), Some(_)) => {}
            (Some(a), Some(b)) if a == b => {}
            (None, None) => return true,
            _ => return false,
        }
    }
}
