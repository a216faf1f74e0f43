use std::sync::Arc;

use crate::detect::Detector;
use crate::engine::ViolationEngine;
use crate::error::{DetectorError, PipelineError, PipelineResult};
use crate::supervisor::Supervisor;
use crate::transport::wire::{decode_frame, ResultMessage};
use crate::transport::{Connector, Delivery, Subscription, Topics};

use super::session::Session;
use super::{ConsumerOptions, StepOutcome};

/// Counters reported when a worker stops.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct WorkerStats {
    pub frames: u64,
    pub violations: u64,
    pub discarded: u64,
    pub requeued: u64,
    pub detector_outages: u64,
}

/// Work consumer: frame in, detections and violations out on the results
/// channel. One frame is in flight at a time; scale by running more workers
/// in the same group.
pub struct WorkConsumer {
    session: Session,
    topics: Topics,
    engine: Arc<ViolationEngine>,
    detector: Box<dyn Detector>,
    options: ConsumerOptions,
    stats: WorkerStats,
}

impl WorkConsumer {
    pub fn new(
        connector: Arc<dyn Connector>,
        topics: Topics,
        engine: Arc<ViolationEngine>,
        detector: Box<dyn Detector>,
        options: ConsumerOptions,
    ) -> Self {
        let subscription = Subscription::new(topics.all_frames(), options.group.clone());
        let supervisor = Supervisor::new(options.backoff.clone(), options.shutdown.clone());
        Self {
            session: Session::new(
                connector,
                options.client_id.clone(),
                vec![subscription],
                supervisor,
            ),
            topics,
            engine,
            detector,
            options,
            stats: WorkerStats::default(),
        }
    }

    pub fn stats(&self) -> &WorkerStats {
        &self.stats
    }

    /// Establish the subscription, so frames published from now on are kept
    /// for this group.
    pub fn connect(&mut self) -> PipelineResult<()> {
        self.session.connect()
    }

    /// Consume until shutdown. The frame in hand is always finished or
    /// requeued before returning.
    pub fn run(&mut self) -> PipelineResult<WorkerStats> {
        log::info!(
            "worker {} starting (detector: {}, zones: {})",
            self.session.client_id(),
            self.detector.name(),
            self.engine.zones().len()
        );
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
        log::info!("worker {} stopped: {:?}", self.session.client_id(), self.stats);
        result.map(|()| self.stats.clone())
    }

    /// Receive and handle at most one frame.
    pub fn step(&mut self) -> PipelineResult<StepOutcome> {
        match self.session.receive(self.options.poll_interval)? {
            Some(delivery) => self.handle(delivery),
            None => Ok(StepOutcome::Idle),
        }
    }

    fn discard(&mut self, delivery: &Delivery, reason: &str) -> StepOutcome {
        log::warn!(
            "discarding malformed frame on {}: {}",
            delivery.topic,
            reason
        );
        self.stats.discarded += 1;
        self.session.nack(delivery, false);
        StepOutcome::Discarded
    }

    fn handle(&mut self, delivery: Delivery) -> PipelineResult<StepOutcome> {
        let frame = match decode_frame(&delivery.payload) {
            Ok(frame) => frame,
            Err(e) => return Ok(self.discard(&delivery, &e.to_string())),
        };
        if self.topics.stream_of(&delivery.topic) != Some(frame.stream_id()) {
            let reason = format!("payload stream '{}' does not match topic", frame.stream_id());
            return Ok(self.discard(&delivery, &reason));
        }
        if delivery.redelivered {
            log::debug!("redelivered frame {}", frame.meta());
        }

        let detections = match self.detector.detect(&frame) {
            Ok(detections) => detections,
            Err(DetectorError::InvalidInput(reason)) => {
                return Ok(self.discard(&delivery, &reason));
            }
            Err(DetectorError::Unavailable(reason)) => {
                return self.detector_outage(&delivery, &reason);
            }
        };

        let meta = frame.meta().clone();
        let assessment = self.engine.assess(&meta, &detections);
        for v in &assessment.violations {
            log::info!(
                "violation {} in {}: hand {:?} item {:?}",
                v.violation_type,
                meta,
                <[f32; 4]>::from(v.boxes.hand.bbox),
                <[f32; 4]>::from(v.boxes.item.bbox)
            );
        }
        let violations = assessment.violations.len() as u64;
        let message = ResultMessage::new(&meta, crate::now_ms(), assessment);
        let payload = match message.encode() {
            Ok(payload) => payload,
            Err(e) => return Ok(self.discard(&delivery, &e.to_string())),
        };

        let topic = self.topics.results(&meta.stream_id);
        if let Err(e) = self.session.publish(&topic, &payload) {
            // Connection is gone; the frame comes back unacknowledged.
            log::warn!("publishing result for {} failed: {}", meta, e);
            self.stats.requeued += 1;
            return Ok(StepOutcome::Requeued);
        }
        if !self.session.ack(&delivery) {
            log::warn!("ack for {} lost; frame will be redelivered", meta);
            self.stats.requeued += 1;
            return Ok(StepOutcome::Requeued);
        }
        self.stats.frames += 1;
        self.stats.violations += violations;
        log::debug!("frame {} done: {} violations", meta, violations);
        Ok(StepOutcome::Acked)
    }

    /// Stop consuming: give the frame back, drop the connection so nothing
    /// else is prefetched, and wait for the detector to come back.
    fn detector_outage(&mut self, delivery: &Delivery, reason: &str) -> PipelineResult<StepOutcome> {
        log::error!(
            "detector {} unavailable: {}; requeueing {}",
            self.detector.name(),
            reason,
            delivery.topic
        );
        self.stats.detector_outages += 1;
        self.stats.requeued += 1;
        self.session.nack(delivery, true);
        self.session.disconnect();

        let detector = &mut self.detector;
        self.session
            .supervisor()
            .await_recovery("detector", || detector.warm_up())?;
        Ok(StepOutcome::Requeued)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detect::{Detection, StubBackend};
    use crate::engine::Thresholds;
    use crate::frame::{Frame, FrameEncoding, FrameMeta};
    use crate::geometry::{BBox, Zone};
    use crate::supervisor::{Backoff, Shutdown};
    use crate::transport::wire::encode_frame;
    use crate::transport::{InMemoryBroker, Transport};
    use std::time::Duration;

    const WAIT: Duration = Duration::from_millis(20);

    fn topics() -> Topics {
        Topics::new("tg")
    }

    fn engine() -> Arc<ViolationEngine> {
        Arc::new(ViolationEngine::new(
            vec![Zone::new("prep", BBox::new(0.0, 0.0, 640.0, 480.0))],
            Thresholds::default(),
        ))
    }

    fn touching() -> Vec<Detection> {
        vec![
            Detection::new("hand", 0.95, BBox::new(100.0, 150.0, 200.0, 300.0)),
            Detection::new("pizza", 0.92, BBox::new(120.0, 160.0, 280.0, 320.0)),
        ]
    }

    fn options(backoff: Backoff) -> ConsumerOptions {
        ConsumerOptions {
            client_id: "worker-1".into(),
            group: "workers".into(),
            poll_interval: WAIT,
            backoff,
            shutdown: Shutdown::new(),
        }
    }

    fn frame_bytes(stream: &str, id: u64) -> Vec<u8> {
        let meta = FrameMeta {
            stream_id: stream.into(),
            frame_id: id,
            timestamp_ms: id * 200,
        };
        encode_frame(&Frame::new(meta, 640, 480, FrameEncoding::Jpeg, vec![0xff, 0xd8]).unwrap())
            .unwrap()
    }

    fn results_sub() -> Subscription {
        Subscription::new(topics().all_results(), "agg")
    }

    #[test]
    fn frame_becomes_result_message() {
        let broker = InMemoryBroker::new();
        let mut results = broker.open("agg").unwrap();
        results.subscribe(&results_sub()).unwrap();

        let mut worker = WorkConsumer::new(
            Arc::new(broker.clone()),
            topics(),
            engine(),
            Box::new(StubBackend::new(touching())),
            options(Backoff::immediate(3)),
        );
        worker.connect().unwrap();
        let mut producer = broker.open("producer").unwrap();
        producer
            .publish(&topics().frames("line_1"), &frame_bytes("line_1", 7))
            .unwrap();

        assert_eq!(worker.step().unwrap(), StepOutcome::Acked);
        let delivery = results.receive(WAIT).unwrap().unwrap();
        assert_eq!(delivery.topic, "tg/results/line_1");
        let message = ResultMessage::decode(&delivery.payload).unwrap();
        assert_eq!(message.frame_id, 7);
        assert_eq!(message.violation_count, 1);
        assert_eq!(message.detections.len(), 2);
        assert_eq!(worker.stats().violations, 1);
    }

    #[test]
    fn malformed_frames_are_discarded_not_requeued() {
        let broker = InMemoryBroker::new();
        let mut worker = WorkConsumer::new(
            Arc::new(broker.clone()),
            topics(),
            engine(),
            Box::new(StubBackend::new(touching())),
            options(Backoff::immediate(3)),
        );
        worker.connect().unwrap();
        let mut producer = broker.open("producer").unwrap();
        producer.publish(&topics().frames("line_1"), b"{oops").unwrap();
        producer
            .publish(&topics().frames("line_2"), &frame_bytes("line_1", 1))
            .unwrap();

        assert_eq!(worker.step().unwrap(), StepOutcome::Discarded);
        assert_eq!(worker.step().unwrap(), StepOutcome::Discarded);
        assert_eq!(worker.step().unwrap(), StepOutcome::Idle);
        let frames = Subscription::new(topics().all_frames(), "workers");
        assert_eq!(broker.ready_count(&frames), 0);
        assert_eq!(broker.unacked_count(&frames), 0);
        assert_eq!(worker.stats().discarded, 2);
    }

    #[test]
    fn detector_outage_requeues_and_gives_up() {
        let broker = InMemoryBroker::new();
        let stub = StubBackend::new(touching());
        let switch = stub.switch();
        let mut worker = WorkConsumer::new(
            Arc::new(broker.clone()),
            topics(),
            engine(),
            Box::new(stub),
            options(Backoff::immediate(3)),
        );
        worker.connect().unwrap();
        let mut producer = broker.open("producer").unwrap();
        producer
            .publish(&topics().frames("line_1"), &frame_bytes("line_1", 1))
            .unwrap();

        switch.set_available(false);
        assert!(matches!(
            worker.step(),
            Err(PipelineError::DetectorUnavailable(_))
        ));
        let frames = Subscription::new(topics().all_frames(), "workers");
        assert_eq!(broker.ready_count(&frames), 1);
        assert_eq!(broker.unacked_count(&frames), 0);
    }

    #[test]
    fn detector_recovery_resumes_with_redelivered_frame() {
        let broker = InMemoryBroker::new();
        let mut results = broker.open("agg").unwrap();
        results.subscribe(&results_sub()).unwrap();
        let stub = StubBackend::new(touching());
        let switch = stub.switch();
        let backoff = Backoff {
            initial: Duration::from_millis(10),
            max: Duration::from_millis(10),
            multiplier: 1.0,
            max_attempts: 200,
            jitter: 0.0,
        };
        let mut worker = WorkConsumer::new(
            Arc::new(broker.clone()),
            topics(),
            engine(),
            Box::new(stub),
            options(backoff),
        );
        worker.connect().unwrap();
        let mut producer = broker.open("producer").unwrap();
        producer
            .publish(&topics().frames("line_1"), &frame_bytes("line_1", 1))
            .unwrap();

        switch.set_available(false);
        let flip = {
            let switch = switch.clone();
            std::thread::spawn(move || {
                std::thread::sleep(Duration::from_millis(50));
                switch.set_available(true);
            })
        };
        assert_eq!(worker.step().unwrap(), StepOutcome::Requeued);
        flip.join().unwrap();

        assert_eq!(worker.step().unwrap(), StepOutcome::Acked);
        let delivery = results.receive(WAIT).unwrap().unwrap();
        assert_eq!(ResultMessage::decode(&delivery.payload).unwrap().frame_id, 1);
        assert_eq!(worker.stats().detector_outages, 1);
    }

    #[test]
    fn run_returns_on_shutdown() {
        let broker = InMemoryBroker::new();
        let opts = options(Backoff::immediate(3));
        let shutdown = opts.shutdown.clone();
        let mut worker = WorkConsumer::new(
            Arc::new(broker.clone()),
            topics(),
            engine(),
            Box::new(StubBackend::default()),
            opts,
        );
        let handle = std::thread::spawn(move || worker.run());
        std::thread::sleep(Duration::from_millis(60));
        shutdown.trigger();
        let stats = handle.join().unwrap().unwrap();
        assert_eq!(stats, WorkerStats::default());
        assert_eq!(broker.live_connections(), 0);
    }
}
