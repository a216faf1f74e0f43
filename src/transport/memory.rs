use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use crate::error::TransportError;

use super::{topic_matches, Connector, Delivery, DeliveryTag, Subscription, Transport};

#[derive(Clone, Debug)]
struct StoredMessage {
    topic: String,
    payload: Vec<u8>,
    redelivered: bool,
}

#[derive(Debug, Default)]
struct Queue {
    filter: String,
    ready: VecDeque<StoredMessage>,
    /// tag -> (owning connection, message)
    unacked: HashMap<u64, (u64, StoredMessage)>,
}

impl Queue {
    fn requeue_owned_by(&mut self, conn_id: u64) -> usize {
        let mut tags: Vec<u64> = self
            .unacked
            .iter()
            .filter(|(_, (owner, _))| *owner == conn_id)
            .map(|(tag, _)| *tag)
            .collect();
        // Highest tag first so the oldest ends up at the front.
        tags.sort_unstable_by(|a, b| b.cmp(a));
        for tag in &tags {
            if let Some((_, mut msg)) = self.unacked.remove(tag) {
                msg.redelivered = true;
                self.ready.push_front(msg);
            }
        }
        tags.len()
    }
}

#[derive(Debug, Default)]
struct BrokerState {
    /// Keyed by `<group>|<filter>`.
    queues: HashMap<String, Queue>,
    next_tag: u64,
    next_conn: u64,
    live: HashMap<u64, String>,
    refuse_connects: u32,
    published: u64,
}

impl BrokerState {
    fn drop_connection(&mut self, conn_id: u64) -> usize {
        self.live.remove(&conn_id);
        self.queues
            .values_mut()
            .map(|q| q.requeue_owned_by(conn_id))
            .sum()
    }
}

/// Durable in-process broker.
///
/// Queues and their messages outlive every connection: a queue is created
/// by the first subscription of its group and keeps collecting matching
/// messages while no consumer is attached. Cloning yields another handle to
/// the same broker.
#[derive(Clone, Debug, Default)]
pub struct InMemoryBroker {
    shared: Arc<(Mutex<BrokerState>, Condvar)>,
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, BrokerState> {
        self.shared.0.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Refuse the next `n` connection attempts.
    pub fn refuse_next_connects(&self, n: u32) {
        self.state().refuse_connects = n;
    }

    /// Drop every live connection, as a broker restart would. Their
    /// unacknowledged deliveries go back to the front of their queues.
    pub fn sever_connections(&self) {
        let mut state = self.state();
        let ids: Vec<u64> = state.live.keys().copied().collect();
        let mut requeued = 0;
        for id in ids {
            requeued += state.drop_connection(id);
        }
        log::info!("memory broker severed all connections ({} requeued)", requeued);
        self.shared.1.notify_all();
    }

    /// Messages waiting in a group's queue, not counting unacknowledged ones.
    pub fn ready_count(&self, subscription: &Subscription) -> usize {
        self.state()
            .queues
            .get(&queue_key(subscription))
            .map(|q| q.ready.len())
            .unwrap_or(0)
    }

    /// Messages handed out and not yet acknowledged.
    pub fn unacked_count(&self, subscription: &Subscription) -> usize {
        self.state()
            .queues
            .get(&queue_key(subscription))
            .map(|q| q.unacked.len())
            .unwrap_or(0)
    }

    /// Total messages accepted by `publish` since creation.
    pub fn published_count(&self) -> u64 {
        self.state().published
    }

    pub fn live_connections(&self) -> usize {
        self.state().live.len()
    }

    pub fn open(&self, client_id: &str) -> Result<MemoryConnection, TransportError> {
        let mut state = self.state();
        if state.refuse_connects > 0 {
            state.refuse_connects -= 1;
            return Err(TransportError::ConnectFailed(format!(
                "memory broker refused {}",
                client_id
            )));
        }
        state.next_conn += 1;
        let id = state.next_conn;
        state.live.insert(id, client_id.to_string());
        Ok(MemoryConnection {
            broker: self.clone(),
            conn_id: id,
            client_id: client_id.to_string(),
            queues: Vec::new(),
            cursor: 0,
            delivered: HashMap::new(),
            closed: false,
        })
    }
}

impl Connector for InMemoryBroker {
    fn connect(&self, client_id: &str) -> Result<Box<dyn Transport>, TransportError> {
        Ok(Box::new(self.open(client_id)?))
    }
}

fn queue_key(subscription: &Subscription) -> String {
    format!("{}|{}", subscription.group, subscription.filter)
}

/// Connection to an `InMemoryBroker`.
#[derive(Debug)]
pub struct MemoryConnection {
    broker: InMemoryBroker,
    conn_id: u64,
    client_id: String,
    queues: Vec<String>,
    /// Round-robin start position over `queues`.
    cursor: usize,
    /// tag -> queue key
    delivered: HashMap<u64, String>,
    closed: bool,
}

impl MemoryConnection {
    fn check_live(&self, state: &BrokerState) -> Result<(), TransportError> {
        if self.closed {
            return Err(TransportError::Closed);
        }
        if !state.live.contains_key(&self.conn_id) {
            return Err(TransportError::ConnectionLost(format!(
                "{} severed by broker",
                self.client_id
            )));
        }
        Ok(())
    }

    fn settle(&mut self, delivery: &Delivery, requeue: bool) -> Result<(), TransportError> {
        let mut state = self.broker.state();
        self.check_live(&state)?;
        let key = self.delivered.remove(&delivery.tag.0).ok_or_else(|| {
            TransportError::ConnectionLost(format!(
                "delivery {:?} is not outstanding on {}",
                delivery.tag, self.client_id
            ))
        })?;
        let queue = state
            .queues
            .get_mut(&key)
            .ok_or_else(|| TransportError::ConnectionLost(format!("queue {} vanished", key)))?;
        if let Some((_, mut msg)) = queue.unacked.remove(&delivery.tag.0) {
            if requeue {
                msg.redelivered = true;
                queue.ready.push_front(msg);
                self.broker.shared.1.notify_all();
            }
        }
        Ok(())
    }
}

impl Transport for MemoryConnection {
    fn publish(&mut self, topic: &str, payload: &[u8]) -> Result<(), TransportError> {
        let mut state = self.broker.state();
        self.check_live(&state)?;
        for queue in state.queues.values_mut() {
            if topic_matches(&queue.filter, topic) {
                queue.ready.push_back(StoredMessage {
                    topic: topic.to_string(),
                    payload: payload.to_vec(),
                    redelivered: false,
                });
            }
        }
        state.published += 1;
        self.broker.shared.1.notify_all();
        Ok(())
    }

    fn subscribe(&mut self, subscription: &Subscription) -> Result<(), TransportError> {
        let mut state = self.broker.state();
        self.check_live(&state)?;
        let key = queue_key(subscription);
        state.queues.entry(key.clone()).or_insert_with(|| Queue {
            filter: subscription.filter.clone(),
            ..Queue::default()
        });
        if !self.queues.contains(&key) {
            self.queues.push(key);
        }
        Ok(())
    }

    fn receive(&mut self, timeout: Duration) -> Result<Option<Delivery>, TransportError> {
        let deadline = Instant::now() + timeout;
        let (lock, cvar) = &*self.broker.shared;
        let mut state = lock.lock().unwrap_or_else(|p| p.into_inner());
        loop {
            self.check_live(&state)?;
            let n = self.queues.len();
            for i in 0..n {
                let key = &self.queues[(self.cursor + i) % n];
                let Some(queue) = state.queues.get_mut(key) else {
                    continue;
                };
                if let Some(msg) = queue.ready.pop_front() {
                    let tag = state.next_tag + 1;
                    state.next_tag = tag;
                    let key = key.clone();
                    if let Some(queue) = state.queues.get_mut(&key) {
                        queue.unacked.insert(tag, (self.conn_id, msg.clone()));
                    }
                    self.delivered.insert(tag, key);
                    self.cursor = (self.cursor + i + 1) % n;
                    return Ok(Some(Delivery {
                        topic: msg.topic,
                        payload: msg.payload,
                        redelivered: msg.redelivered,
                        tag: DeliveryTag(tag),
                    }));
                }
            }

            let now = Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            state = match cvar.wait_timeout(state, deadline - now) {
                Ok((guard, _)) => guard,
                Err(p) => p.into_inner().0,
            };
        }
    }

    fn ack(&mut self, delivery: &Delivery) -> Result<(), TransportError> {
        self.settle(delivery, false)
    }

    fn nack(&mut self, delivery: &Delivery, requeue: bool) -> Result<(), TransportError> {
        if !requeue {
            log::debug!("{} discarding delivery on {}", self.client_id, delivery.topic);
        }
        self.settle(delivery, requeue)
    }

    fn disconnect(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        let mut state = self.broker.state();
        let requeued = state.drop_connection(self.conn_id);
        if requeued > 0 {
            log::debug!(
                "{} disconnected with {} unacknowledged deliveries requeued",
                self.client_id,
                requeued
            );
        }
        self.delivered.clear();
        self.broker.shared.1.notify_all();
    }
}

impl Drop for MemoryConnection {
    fn drop(&mut self) {
        self.disconnect();
    }
}
