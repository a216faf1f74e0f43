//! Pipeline orchestration.
//!
//! Two consumers, each owning one supervised transport session:
//! - [`WorkConsumer`]: frames channel -> detector -> engine -> results channel
//! - [`ResultsConsumer`]: results channel -> violation store -> cache
//!
//! Both acknowledge a delivery only once it is fully handled. Malformed
//! payloads are acknowledged as discarded so they cannot loop. Transport
//! failures drop the connection and reconnect on the backoff schedule.
//! [`Orchestrator`] runs any number of workers plus one results consumer
//! on threads in one process.

mod results;
mod session;
mod worker;

use anyhow::{anyhow, Result};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use crate::cache::AggregationCache;
use crate::config::PipelineConfig;
use crate::detect::Detector;
use crate::error::PipelineResult;
use crate::storage::ViolationStore;
use crate::supervisor::{Backoff, Shutdown};
use crate::transport::{Connector, Topics};

pub use results::{ResultsConsumer, ResultsStats};
pub use session::Session;
pub use worker::{WorkConsumer, WorkerStats};

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// What one consumer step did with the delivery it received, if any.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StepOutcome {
    /// Nothing arrived within the poll interval.
    Idle,
    Acked,
    /// Malformed; acknowledged without processing.
    Discarded,
    /// Handed back for redelivery.
    Requeued,
}

#[derive(Clone, Debug)]
pub struct ConsumerOptions {
    pub client_id: String,
    pub group: String,
    /// Upper bound on how long a receive blocks; also bounds shutdown latency.
    pub poll_interval: Duration,
    pub backoff: Backoff,
    pub shutdown: Shutdown,
}

impl ConsumerOptions {
    pub fn new(client_id: impl Into<String>, group: impl Into<String>, shutdown: Shutdown) -> Self {
        Self {
            client_id: client_id.into(),
            group: group.into(),
            poll_interval: DEFAULT_POLL_INTERVAL,
            backoff: Backoff::default(),
            shutdown,
        }
    }

    pub fn with_backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }
}

type ConsumerHandle = (String, JoinHandle<PipelineResult<()>>);

/// Workers and a results consumer running on threads in this process.
pub struct Orchestrator {
    shutdown: Shutdown,
    handles: Vec<ConsumerHandle>,
}

impl Orchestrator {
    /// Connect every consumer, then start them. Subscriptions exist before
    /// this returns, so frames published afterwards are not lost.
    pub fn start<F>(
        connector: Arc<dyn Connector>,
        cfg: &PipelineConfig,
        workers: usize,
        mut detector_for: F,
        store: Box<dyn ViolationStore>,
        cache: Arc<AggregationCache>,
        shutdown: Shutdown,
    ) -> Result<Self>
    where
        F: FnMut(usize) -> Result<Box<dyn Detector>>,
    {
        let topics = Topics::new(cfg.broker.topic_prefix.clone());
        let engine = Arc::new(cfg.engine());

        let mut results = ResultsConsumer::new(
            Arc::clone(&connector),
            topics.clone(),
            store,
            cache,
            ConsumerOptions::new(
                cfg.broker.client_id_for("results"),
                cfg.broker.results_group.clone(),
                shutdown.clone(),
            )
            .with_backoff(cfg.retry.clone()),
        );
        results.connect()?;

        let mut consumers: Vec<WorkConsumer> = Vec::with_capacity(workers);
        for i in 0..workers {
            let mut worker = WorkConsumer::new(
                Arc::clone(&connector),
                topics.clone(),
                Arc::clone(&engine),
                detector_for(i)?,
                ConsumerOptions::new(
                    cfg.broker.client_id_for(&format!("worker{}", i + 1)),
                    cfg.broker.worker_group.clone(),
                    shutdown.clone(),
                )
                .with_backoff(cfg.retry.clone()),
            );
            worker.connect()?;
            consumers.push(worker);
        }

        let mut handles = Vec::with_capacity(workers + 1);
        handles.push(spawn_named("results".into(), move || {
            results.run().map(|_| ())
        })?);
        for (i, mut worker) in consumers.into_iter().enumerate() {
            handles.push(spawn_named(format!("worker{}", i + 1), move || {
                worker.run().map(|_| ())
            })?);
        }
        log::info!("pipeline started with {} workers", workers);
        Ok(Self { shutdown, handles })
    }

    pub fn shutdown_handle(&self) -> Shutdown {
        self.shutdown.clone()
    }

    /// Trigger shutdown and wait for every consumer. Returns the first
    /// consumer error, after all of them have stopped.
    pub fn stop(self) -> Result<()> {
        self.shutdown.trigger();
        self.join()
    }

    /// Wait for every consumer without triggering shutdown.
    pub fn join(self) -> Result<()> {
        let mut first_err = None;
        for (name, handle) in self.handles {
            let outcome = match handle.join() {
                Ok(Ok(())) => Ok(()),
                Ok(Err(e)) => Err(anyhow!("{} failed: {}", name, e)),
                Err(_) => Err(anyhow!("{} panicked", name)),
            };
            if let Err(e) = outcome {
                log::error!("{}", e);
                // One failed consumer stops the rest.
                self.shutdown.trigger();
                first_err.get_or_insert(e);
            }
        }
        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

fn spawn_named<F>(name: String, f: F) -> Result<ConsumerHandle>
where
    F: FnOnce() -> PipelineResult<()> + Send + 'static,
{
    let handle = std::thread::Builder::new()
        .name(name.clone())
        .spawn(f)
        .map_err(|e| anyhow!("failed to spawn {}: {}", name, e))?;
    Ok((name, handle))
}
