use std::sync::Arc;

use crate::cache::{AggregationCache, TypeCounts};
use crate::error::{PipelineError, PipelineResult};
use crate::storage::{NewViolationRecord, ViolationStore};
use crate::supervisor::Supervisor;
use crate::transport::wire::ResultMessage;
use crate::transport::{Connector, Delivery, Subscription, Topics};

use super::session::Session;
use super::{ConsumerOptions, StepOutcome};

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ResultsStats {
    pub messages: u64,
    pub inserted: u64,
    pub duplicates: u64,
    pub discarded: u64,
    pub write_failures: u64,
}

/// Results consumer: persists each frame's violations, then updates the
/// cache, then acknowledges.
///
/// A message is acknowledged only after its records are durable. The cache
/// counter grows only by records this delivery actually inserted, so a
/// redelivered message refreshes the snapshot without double counting.
pub struct ResultsConsumer {
    session: Session,
    topics: Topics,
    store: Box<dyn ViolationStore>,
    cache: Arc<AggregationCache>,
    options: ConsumerOptions,
    stats: ResultsStats,
}

impl ResultsConsumer {
    pub fn new(
        connector: Arc<dyn Connector>,
        topics: Topics,
        store: Box<dyn ViolationStore>,
        cache: Arc<AggregationCache>,
        options: ConsumerOptions,
    ) -> Self {
        let subscription = Subscription::new(topics.all_results(), options.group.clone());
        let supervisor = Supervisor::new(options.backoff.clone(), options.shutdown.clone());
        Self {
            session: Session::new(
                connector,
                options.client_id.clone(),
                vec![subscription],
                supervisor,
            ),
            topics,
            store,
            cache,
            options,
            stats: ResultsStats::default(),
        }
    }

    pub fn stats(&self) -> &ResultsStats {
        &self.stats
    }

    pub fn cache(&self) -> &Arc<AggregationCache> {
        &self.cache
    }

    pub fn connect(&mut self) -> PipelineResult<()> {
        self.session.connect()
    }

    pub fn run(&mut self) -> PipelineResult<ResultsStats> {
        log::info!("results consumer {} starting", self.session.client_id());
        let result = loop {
            if self.options.shutdown.is_triggered() {
                break Ok(());
            }
            match self.step() {
                Ok(_) => {}
                Err(PipelineError::Shutdown) => break Ok(()),
                Err(e) => break Err(e),
            }
        };
        self.session.disconnect();
        log::info!(
            "results consumer {} stopped: {:?}",
            self.session.client_id(),
            self.stats
        );
        result.map(|()| self.stats.clone())
    }

    pub fn step(&mut self) -> PipelineResult<StepOutcome> {
        match self.session.receive(self.options.poll_interval)? {
            Some(delivery) => Ok(self.handle(delivery)),
            None => Ok(StepOutcome::Idle),
        }
    }

    fn discard(&mut self, delivery: &Delivery, reason: &str) -> StepOutcome {
        log::warn!(
            "discarding malformed result on {}: {}",
            delivery.topic,
            reason
        );
        self.stats.discarded += 1;
        self.session.nack(delivery, false);
        StepOutcome::Discarded
    }

    fn handle(&mut self, delivery: Delivery) -> StepOutcome {
        let message = match ResultMessage::decode(&delivery.payload) {
            Ok(message) => message,
            Err(e) => return self.discard(&delivery, &e.to_string()),
        };
        if self.topics.stream_of(&delivery.topic) != Some(message.stream_id.as_str()) {
            let reason = format!("payload stream '{}' does not match topic", message.stream_id);
            return self.discard(&delivery, &reason);
        }
        let meta = message.meta();

        let records = NewViolationRecord::group(&message.violations);
        let outcomes = match self.store.insert_frame(&records) {
            Ok(outcomes) => outcomes,
            Err(e) => {
                let err = PipelineError::from(e);
                log::error!("{} for {}; requeueing", err, meta);
                self.stats.write_failures += 1;
                self.session.nack(&delivery, true);
                self.session.pause();
                return StepOutcome::Requeued;
            }
        };

        let mut delta = TypeCounts::new();
        for (record, outcome) in records.iter().zip(&outcomes) {
            if outcome.is_new() {
                log::info!(
                    "stored {} x{} for {} as #{}",
                    record.violation_type,
                    record.violation_count(),
                    meta,
                    outcome.id()
                );
                self.stats.inserted += 1;
                *delta.entry(record.violation_type).or_insert(0) += record.violation_count();
            } else {
                log::info!(
                    "duplicate {} for {} (record #{})",
                    record.violation_type,
                    meta,
                    outcome.id()
                );
                self.stats.duplicates += 1;
            }
        }
        self.cache.update(
            &message.stream_id,
            message.frame_id,
            message.timestamp_ms,
            message.detections,
            &delta,
        );

        self.stats.messages += 1;
        if !self.session.ack(&delivery) {
            log::warn!("ack for {} lost; result will be redelivered", meta);
            return StepOutcome::Requeued;
        }
        StepOutcome::Acked
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detect::Detection;
    use crate::engine::{Thresholds, ViolationEngine};
    use crate::frame::FrameMeta;
    use crate::geometry::{BBox, Zone};
    use crate::storage::InMemoryViolationStore;
    use crate::supervisor::{Backoff, Shutdown};
    use crate::transport::{InMemoryBroker, Transport};
    use crate::violation::ViolationType;
    use std::time::Duration;

    const WAIT: Duration = Duration::from_millis(20);

    fn topics() -> Topics {
        Topics::new("tg")
    }

    fn result_bytes(stream: &str, frame: u64) -> Vec<u8> {
        let meta = FrameMeta {
            stream_id: stream.into(),
            frame_id: frame,
            timestamp_ms: frame * 200,
        };
        let engine = ViolationEngine::new(
            vec![Zone::new("prep", BBox::new(0.0, 0.0, 640.0, 480.0))],
            Thresholds::default(),
        );
        let assessment = engine.assess(
            &meta,
            &[
                Detection::new("hand", 0.95, BBox::new(100.0, 150.0, 200.0, 300.0)),
                Detection::new("pizza", 0.92, BBox::new(120.0, 160.0, 280.0, 320.0)),
            ],
        );
        ResultMessage::new(&meta, 0, assessment).encode().unwrap()
    }

    fn consumer(broker: &InMemoryBroker, store: &InMemoryViolationStore) -> ResultsConsumer {
        let mut c = ResultsConsumer::new(
            Arc::new(broker.clone()),
            topics(),
            Box::new(store.clone()),
            Arc::new(AggregationCache::new()),
            ConsumerOptions {
                client_id: "agg-1".into(),
                group: "agg".into(),
                poll_interval: WAIT,
                backoff: Backoff::immediate(3),
                shutdown: Shutdown::new(),
            },
        );
        c.connect().unwrap();
        c
    }

    #[test]
    fn redelivered_result_is_stored_and_counted_once() {
        let broker = InMemoryBroker::new();
        let store = InMemoryViolationStore::new();
        let mut agg = consumer(&broker, &store);
        let mut producer = broker.open("worker").unwrap();
        let bytes = result_bytes("line_1", 4);
        producer.publish(&topics().results("line_1"), &bytes).unwrap();
        producer.publish(&topics().results("line_1"), &bytes).unwrap();

        assert_eq!(agg.step().unwrap(), StepOutcome::Acked);
        assert_eq!(agg.step().unwrap(), StepOutcome::Acked);
        assert_eq!(store.len(), 1);
        let snap = agg.cache().read("line_1").unwrap();
        assert_eq!(snap.violation_count, 1);
        assert_eq!(snap.frames_seen, 2);
        assert_eq!(agg.stats().duplicates, 1);
        assert_eq!(
            agg.cache().statistics().by_type.get(&ViolationType::ToolNotUsed),
            Some(&1)
        );
    }

    #[test]
    fn write_failure_requeues_until_it_succeeds() {
        let broker = InMemoryBroker::new();
        let store = InMemoryViolationStore::new();
        let mut agg = consumer(&broker, &store);
        let mut producer = broker.open("worker").unwrap();
        producer
            .publish(&topics().results("line_1"), &result_bytes("line_1", 4))
            .unwrap();

        store.fail_next_writes(2);
        assert_eq!(agg.step().unwrap(), StepOutcome::Requeued);
        assert_eq!(agg.step().unwrap(), StepOutcome::Requeued);
        assert!(agg.cache().read("line_1").is_none());
        assert_eq!(agg.step().unwrap(), StepOutcome::Acked);
        assert_eq!(store.len(), 1);
        assert_eq!(agg.stats().write_failures, 2);

        let results = Subscription::new(topics().all_results(), "agg");
        assert_eq!(broker.ready_count(&results), 0);
        assert_eq!(broker.unacked_count(&results), 0);
    }

    #[test]
    fn malformed_results_are_dropped() {
        let broker = InMemoryBroker::new();
        let store = InMemoryViolationStore::new();
        let mut agg = consumer(&broker, &store);
        let mut producer = broker.open("worker").unwrap();
        producer.publish(&topics().results("line_1"), b"[]").unwrap();
        producer
            .publish(&topics().results("line_9"), &result_bytes("line_1", 1))
            .unwrap();

        assert_eq!(agg.step().unwrap(), StepOutcome::Discarded);
        assert_eq!(agg.step().unwrap(), StepOutcome::Discarded);
        assert_eq!(agg.step().unwrap(), StepOutcome::Idle);
        assert!(store.is_empty());
    }
}
