//! Connection supervision: backoff schedule, connection state machine and
//! the shutdown signal that interrupts pending waits.

use std::fmt;
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use rand::Rng;

use crate::error::{PipelineError, TransportError};

pub const DEFAULT_BACKOFF_INITIAL: Duration = Duration::from_millis(500);
pub const DEFAULT_BACKOFF_MAX: Duration = Duration::from_secs(30);
pub const DEFAULT_BACKOFF_MULTIPLIER: f64 = 2.0;
pub const DEFAULT_BACKOFF_ATTEMPTS: u32 = 8;
pub const DEFAULT_BACKOFF_JITTER: f64 = 0.1;

/// Exponential backoff schedule with a bounded number of attempts.
#[derive(Clone, Debug, PartialEq)]
pub struct Backoff {
    pub initial: Duration,
    pub max: Duration,
    pub multiplier: f64,
    pub max_attempts: u32,
    /// Fraction of each delay randomised in either direction, in [0, 1).
    pub jitter: f64,
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            initial: DEFAULT_BACKOFF_INITIAL,
            max: DEFAULT_BACKOFF_MAX,
            multiplier: DEFAULT_BACKOFF_MULTIPLIER,
            max_attempts: DEFAULT_BACKOFF_ATTEMPTS,
            jitter: DEFAULT_BACKOFF_JITTER,
        }
    }
}

impl Backoff {
    /// Nominal delay after the failed attempt `attempt` (1-based), without jitter.
    pub fn base_delay(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(63) as i32;
        let secs = self.initial.as_secs_f64() * self.multiplier.powi(exp);
        if !secs.is_finite() || secs >= self.max.as_secs_f64() {
            return self.max;
        }
        Duration::from_secs_f64(secs)
    }

    /// Delay after attempt `attempt`, with jitter applied. Never above `max`.
    pub fn delay(&self, attempt: u32) -> Duration {
        let base = self.base_delay(attempt);
        if self.jitter <= 0.0 {
            return base;
        }
        let spread = rand::thread_rng().gen_range(-self.jitter..=self.jitter);
        Duration::from_secs_f64((base.as_secs_f64() * (1.0 + spread)).max(0.0)).min(self.max)
    }

    /// Zero-delay schedule for tests.
    pub fn immediate(max_attempts: u32) -> Self {
        Self {
            initial: Duration::ZERO,
            max: Duration::ZERO,
            multiplier: 1.0,
            max_attempts,
            jitter: 0.0,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    /// Attempt number in flight, 1-based.
    Connecting(u32),
    Connected,
    Failed,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Disconnected => f.write_str("disconnected"),
            Self::Connecting(n) => write!(f, "connecting (attempt {})", n),
            Self::Connected => f.write_str("connected"),
            Self::Failed => f.write_str("failed"),
        }
    }
}

/// Cloneable shutdown flag whose waits wake as soon as it is triggered.
#[derive(Clone, Debug, Default)]
pub struct Shutdown {
    inner: Arc<(Mutex<bool>, Condvar)>,
}

impl Shutdown {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn trigger(&self) {
        let (lock, cvar) = &*self.inner;
        let mut flag = lock.lock().unwrap_or_else(|p| p.into_inner());
        *flag = true;
        cvar.notify_all();
    }

    pub fn is_triggered(&self) -> bool {
        let (lock, _) = &*self.inner;
        *lock.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Sleep for `timeout` unless shutdown fires first. Returns `true` when
    /// shutdown was triggered.
    pub fn wait(&self, timeout: Duration) -> bool {
        let (lock, cvar) = &*self.inner;
        let deadline = Instant::now() + timeout;
        let mut flag = lock.lock().unwrap_or_else(|p| p.into_inner());
        while !*flag {
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            flag = match cvar.wait_timeout(flag, deadline - now) {
                Ok((guard, _)) => guard,
                Err(p) => p.into_inner().0,
            };
        }
        *flag
    }

    /// Trigger on Ctrl-C / SIGTERM.
    pub fn install_ctrlc_handler(&self) -> anyhow::Result<()> {
        let handle = self.clone();
        ctrlc::set_handler(move || {
            log::info!("shutdown signal received");
            handle.trigger();
        })
        .map_err(|e| anyhow::anyhow!("error setting Ctrl-C handler: {}", e))
    }
}

/// Drives one connection through `Disconnected -> Connecting(n) -> Connected | Failed`.
#[derive(Debug)]
pub struct Supervisor {
    backoff: Backoff,
    shutdown: Shutdown,
    state: ConnectionState,
}

impl Supervisor {
    pub fn new(backoff: Backoff, shutdown: Shutdown) -> Self {
        Self {
            backoff,
            shutdown,
            state: ConnectionState::Disconnected,
        }
    }

    pub fn state(&self) -> &ConnectionState {
        &self.state
    }

    pub fn backoff(&self) -> &Backoff {
        &self.backoff
    }

    pub fn shutdown(&self) -> &Shutdown {
        &self.shutdown
    }

    pub fn mark_disconnected(&mut self) {
        if self.state != ConnectionState::Disconnected {
            log::info!("transport connection dropped");
        }
        self.state = ConnectionState::Disconnected;
    }

    /// Run `connect` until it succeeds, the schedule runs out, or shutdown
    /// fires during a backoff wait.
    pub fn connect<T, F>(&mut self, mut connect: F) -> Result<T, PipelineError>
    where
        F: FnMut() -> Result<T, TransportError>,
    {
        let max = self.backoff.max_attempts.max(1);
        for attempt in 1..=max {
            if self.shutdown.is_triggered() {
                self.state = ConnectionState::Disconnected;
                return Err(PipelineError::Shutdown);
            }
            self.state = ConnectionState::Connecting(attempt);
            match connect() {
                Ok(conn) => {
                    if attempt > 1 {
                        log::info!("transport connected after {} attempts", attempt);
                    }
                    self.state = ConnectionState::Connected;
                    return Ok(conn);
                }
                Err(e) if attempt < max => {
                    let delay = self.backoff.delay(attempt);
                    log::warn!(
                        "transport connect attempt {}/{} failed: {}; retrying in {:?}",
                        attempt,
                        max,
                        e,
                        delay
                    );
                    if self.shutdown.wait(delay) {
                        self.state = ConnectionState::Disconnected;
                        return Err(PipelineError::Shutdown);
                    }
                }
                Err(e) => {
                    log::error!(
                        "transport connect attempt {}/{} failed: {}; giving up",
                        attempt,
                        max,
                        e
                    );
                    self.state = ConnectionState::Failed;
                    return Err(PipelineError::TransportConnectionLost(format!(
                        "gave up after {} attempts: {}",
                        max, e
                    )));
                }
            }
        }
        self.state = ConnectionState::Failed;
        Err(PipelineError::TransportConnectionLost(
            "connection schedule exhausted".to_string(),
        ))
    }

    /// Probe `check` on the backoff schedule until it passes. Used to wait
    /// out a detector outage while disconnected.
    pub fn await_recovery<E, F>(&self, what: &str, mut check: F) -> Result<(), PipelineError>
    where
        E: fmt::Display,
        F: FnMut() -> Result<(), E>,
    {
        let max = self.backoff.max_attempts.max(1);
        for attempt in 1..=max {
            let delay = self.backoff.delay(attempt);
            if self.shutdown.wait(delay) {
                return Err(PipelineError::Shutdown);
            }
            match check() {
                Ok(()) => {
                    log::info!("{} recovered after {} probes", what, attempt);
                    return Ok(());
                }
                Err(e) => log::warn!("{} probe {}/{} failed: {}", what, attempt, max, e),
            }
        }
        Err(PipelineError::DetectorUnavailable(format!(
            "{} still unavailable after {} probes",
            what, max
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delays_grow_and_cap() {
        let backoff = Backoff {
            jitter: 0.0,
            ..Backoff::default()
        };
        assert_eq!(backoff.base_delay(1), Duration::from_millis(500));
        assert_eq!(backoff.base_delay(2), Duration::from_secs(1));
        assert_eq!(backoff.base_delay(4), Duration::from_secs(4));
        assert_eq!(backoff.base_delay(7), Duration::from_secs(30));
        assert_eq!(backoff.delay(100), Duration::from_secs(30));
    }

    #[test]
    fn jitter_stays_within_bounds() {
        let backoff = Backoff::default();
        for _ in 0..50 {
            let d = backoff.delay(2).as_secs_f64();
            assert!((0.9..=1.1).contains(&d), "delay {} out of range", d);
        }
    }

    #[test]
    fn jitter_never_exceeds_the_cap() {
        let backoff = Backoff {
            jitter: 0.5,
            ..Backoff::default()
        };
        for _ in 0..200 {
            let d = backoff.delay(20);
            assert!(d <= backoff.max, "delay {:?} above cap", d);
            assert!(d >= Duration::from_secs(15), "delay {:?} below jitter floor", d);
        }
    }

    #[test]
    fn connect_retries_then_succeeds() {
        let mut sup = Supervisor::new(Backoff::immediate(5), Shutdown::new());
        let mut calls = 0;
        let conn = sup
            .connect(|| {
                calls += 1;
                if calls < 3 {
                    Err(TransportError::ConnectFailed("refused".into()))
                } else {
                    Ok(calls)
                }
            })
            .unwrap();
        assert_eq!(conn, 3);
        assert_eq!(sup.state(), &ConnectionState::Connected);
    }

    #[test]
    fn connect_fails_after_bounded_attempts() {
        let mut sup = Supervisor::new(Backoff::immediate(4), Shutdown::new());
        let mut calls = 0;
        let err = sup
            .connect(|| -> Result<(), TransportError> {
                calls += 1;
                Err(TransportError::ConnectFailed("refused".into()))
            })
            .unwrap_err();
        assert_eq!(calls, 4);
        assert!(matches!(err, PipelineError::TransportConnectionLost(_)));
        assert_eq!(sup.state(), &ConnectionState::Failed);
    }

    #[test]
    fn shutdown_interrupts_backoff_wait() {
        let backoff = Backoff {
            initial: Duration::from_secs(60),
            max: Duration::from_secs(60),
            jitter: 0.0,
            ..Backoff::default()
        };
        let shutdown = Shutdown::new();
        let mut sup = Supervisor::new(backoff, shutdown.clone());

        let trigger = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(50));
            shutdown.trigger();
        });
        let started = Instant::now();
        let err = sup
            .connect(|| -> Result<(), TransportError> {
                Err(TransportError::ConnectFailed("refused".into()))
            })
            .unwrap_err();
        trigger.join().unwrap();

        assert!(matches!(err, PipelineError::Shutdown));
        assert!(started.elapsed() < Duration::from_secs(10));
        assert_eq!(sup.state(), &ConnectionState::Disconnected);
    }

    #[test]
    fn recovery_probe_gives_up() {
        let sup = Supervisor::new(Backoff::immediate(3), Shutdown::new());
        let mut probes = 0;
        let err = sup
            .await_recovery("detector", || {
                probes += 1;
                Err("still down")
            })
            .unwrap_err();
        assert_eq!(probes, 3);
        assert!(matches!(err, PipelineError::DetectorUnavailable(_)));
    }
}
