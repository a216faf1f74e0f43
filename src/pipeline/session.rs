use std::sync::Arc;
use std::time::Duration;

use crate::error::{PipelineError, PipelineResult, TransportError};
use crate::supervisor::Supervisor;
use crate::transport::{Connector, Delivery, Subscription, Transport};

/// A supervised connection: connects lazily through the supervisor's
/// backoff schedule, re-subscribes after every reconnect and drops the
/// connection on any transport error so the next call starts over.
pub struct Session {
    connector: Arc<dyn Connector>,
    client_id: String,
    subscriptions: Vec<Subscription>,
    supervisor: Supervisor,
    transport: Option<Box<dyn Transport>>,
    connects: u64,
}

impl Session {
    pub fn new(
        connector: Arc<dyn Connector>,
        client_id: impl Into<String>,
        subscriptions: Vec<Subscription>,
        supervisor: Supervisor,
    ) -> Self {
        Self {
            connector,
            client_id: client_id.into(),
            subscriptions,
            supervisor,
            transport: None,
            connects: 0,
        }
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    pub fn supervisor(&self) -> &Supervisor {
        &self.supervisor
    }

    pub fn is_connected(&self) -> bool {
        self.transport.is_some()
    }

    /// Successful connections after the first one.
    pub fn reconnects(&self) -> u64 {
        self.connects.saturating_sub(1)
    }

    /// Connect and subscribe unless already connected. Fails with
    /// `TransportConnectionLost` once the backoff schedule is exhausted, or
    /// `Shutdown` if shutdown interrupts it.
    pub fn connect(&mut self) -> PipelineResult<()> {
        if self.transport.is_some() {
            return Ok(());
        }
        let connector = &self.connector;
        let client_id = &self.client_id;
        let subscriptions = &self.subscriptions;
        let transport = self.supervisor.connect(|| {
            let mut transport = connector.connect(client_id)?;
            for subscription in subscriptions {
                transport.subscribe(subscription)?;
            }
            Ok(transport)
        })?;
        self.connects += 1;
        log::info!(
            "{} connected ({} subscriptions)",
            self.client_id,
            self.subscriptions.len()
        );
        self.transport = Some(transport);
        Ok(())
    }

    fn lose(&mut self, err: &TransportError) {
        log::warn!("{} dropping connection: {}", self.client_id, err);
        if let Some(mut transport) = self.transport.take() {
            transport.disconnect();
        }
        self.supervisor.mark_disconnected();
    }

    fn live(&mut self) -> Result<&mut Box<dyn Transport>, TransportError> {
        self.transport.as_mut().ok_or(TransportError::Closed)
    }

    /// Next delivery, connecting first if needed. A transport failure drops
    /// the connection and yields `Ok(None)`; the next call reconnects.
    pub fn receive(&mut self, timeout: Duration) -> PipelineResult<Option<Delivery>> {
        self.connect()?;
        let result = self.live().and_then(|t| t.receive(timeout));
        match result {
            Ok(delivery) => Ok(delivery),
            Err(e) => {
                self.lose(&e);
                Ok(None)
            }
        }
    }

    /// Publish on the current connection. On failure the connection is
    /// dropped, which also returns every unacknowledged delivery.
    pub fn publish(&mut self, topic: &str, payload: &[u8]) -> Result<(), TransportError> {
        let result = self.live().and_then(|t| t.publish(topic, payload));
        if let Err(e) = &result {
            self.lose(e);
        }
        result
    }

    /// Publish, reconnecting between attempts, for producers that hold no
    /// deliveries.
    pub fn publish_with_retry(&mut self, topic: &str, payload: &[u8]) -> PipelineResult<()> {
        let max = self.supervisor.backoff().max_attempts.max(1);
        let mut last = None;
        for _ in 0..max {
            self.connect()?;
            match self.publish(topic, payload) {
                Ok(()) => return Ok(()),
                Err(e) => last = Some(e),
            }
        }
        Err(PipelineError::TransportConnectionLost(match last {
            Some(e) => format!("publish to {} failed {} times: {}", topic, max, e),
            None => format!("publish to {} failed", topic),
        }))
    }

    /// Acknowledge; `false` if the connection went away first, in which case
    /// the delivery will come back.
    pub fn ack(&mut self, delivery: &Delivery) -> bool {
        let result = self.live().and_then(|t| t.ack(delivery));
        match result {
            Ok(()) => true,
            Err(e) => {
                self.lose(&e);
                false
            }
        }
    }

    pub fn nack(&mut self, delivery: &Delivery, requeue: bool) -> bool {
        let result = self.live().and_then(|t| t.nack(delivery, requeue));
        match result {
            Ok(()) => true,
            Err(e) => {
                self.lose(&e);
                false
            }
        }
    }

    /// Close the connection; unacknowledged deliveries are redelivered.
    pub fn disconnect(&mut self) {
        if let Some(mut transport) = self.transport.take() {
            transport.disconnect();
            log::info!("{} disconnected", self.client_id);
        }
        self.supervisor.mark_disconnected();
    }

    /// Back off before the next receive. Returns `true` if shutdown was
    /// requested meanwhile.
    pub fn pause(&self) -> bool {
        let delay = self.supervisor.backoff().delay(1);
        self.supervisor.shutdown().wait(delay)
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.disconnect();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::supervisor::{Backoff, ConnectionState, Shutdown};
    use crate::transport::InMemoryBroker;

    const WAIT: Duration = Duration::from_millis(20);

    fn session(broker: &InMemoryBroker, attempts: u32) -> Session {
        Session::new(
            Arc::new(broker.clone()),
            "test-session",
            vec![Subscription::new("t/+", "g")],
            Supervisor::new(Backoff::immediate(attempts), Shutdown::new()),
        )
    }

    #[test]
    fn reconnects_after_broker_drop() {
        let broker = InMemoryBroker::new();
        let mut s = session(&broker, 3);
        s.connect().unwrap();
        broker.sever_connections();
        assert!(s.receive(WAIT).unwrap().is_none());
        assert!(!s.is_connected());

        let mut producer = broker.open("producer").unwrap();
        producer.publish("t/a", b"x").unwrap();
        let delivery = s.receive(WAIT).unwrap().unwrap();
        assert_eq!(delivery.payload, b"x");
        assert!(s.ack(&delivery));
        assert_eq!(s.reconnects(), 1);
        assert_eq!(s.supervisor().state(), &ConnectionState::Connected);
    }

    #[test]
    fn connect_gives_up_after_schedule() {
        let broker = InMemoryBroker::new();
        broker.refuse_next_connects(10);
        let mut s = session(&broker, 3);
        assert!(matches!(
            s.connect(),
            Err(PipelineError::TransportConnectionLost(_))
        ));
    }

    #[test]
    fn publish_with_retry_survives_refusals() {
        let broker = InMemoryBroker::new();
        broker.refuse_next_connects(2);
        let mut s = session(&broker, 5);
        s.publish_with_retry("t/a", b"x").unwrap();
        assert_eq!(broker.published_count(), 1);
    }
}
