// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Circuit breaker bounding the latency, concurrency and failure rate of publish calls.
//!
//! A breaker is registered under a command name with [`configure_command`]; every
//! caller using the same name shares the same statistics.

use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::sync::{Arc, Mutex, OnceLock};
use std::time::{Duration, Instant};

use tokio::sync::Semaphore;
use tracing::{debug, warn};

use crate::errors::BreakerError;

/// Command name shared by every delivery worker.
pub const PUBLISH_COMMAND: &str = "queue-publish";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BreakerConfig {
    /// Maximum time a single call may take.
    pub timeout: Duration,
    /// Calls allowed in flight at once; extra calls are rejected.
    pub max_concurrent_requests: usize,
    /// Error percentage at or above which the circuit opens.
    pub error_percent_threshold: u8,
    /// Minimum calls inside the rolling window before the error rate is considered.
    pub request_volume_threshold: usize,
    /// How long the circuit stays open before a trial call is let through.
    pub sleep_window: Duration,
    /// Span of the statistics used for the error rate.
    pub rolling_window: Duration,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_millis(1000),
            max_concurrent_requests: 1000,
            error_percent_threshold: 25,
            request_volume_threshold: 20,
            sleep_window: Duration::from_secs(5),
            rolling_window: Duration::from_secs(10),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
}

#[derive(Debug)]
struct Health {
    samples: VecDeque<(Instant, bool)>,
    opened_at: Option<Instant>,
}

impl Health {
    fn prune(&mut self, now: Instant, window: Duration) {
        while let Some((at, _)) = self.samples.front() {
            if now.duration_since(*at) <= window {
                break;
            }
            self.samples.pop_front();
        }
    }
}

#[derive(Debug)]
pub struct CircuitBreaker {
    name: String,
    config: BreakerConfig,
    permits: Semaphore,
    health: Mutex<Health>,
}

impl CircuitBreaker {
    #[must_use]
    pub fn new(name: &str, config: BreakerConfig) -> Self {
        Self {
            name: name.to_string(),
            config,
            permits: Semaphore::new(config.max_concurrent_requests),
            health: Mutex::new(Health {
                samples: VecDeque::new(),
                opened_at: None,
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &BreakerConfig {
        &self.config
    }

    #[allow(clippy::expect_used)]
    pub fn state(&self) -> CircuitState {
        let health = self.health.lock().expect("lock poisoned");
        if health.opened_at.is_some() {
            CircuitState::Open
        } else {
            CircuitState::Closed
        }
    }

    /// Runs `command` under the breaker policy.
    ///
    /// The command is dropped as soon as the timeout elapses, so a stuck call never
    /// outlives its caller's deadline.
    pub async fn call<F, T, E>(&self, command: F) -> Result<T, BreakerError<E>>
    where
        F: Future<Output = Result<T, E>>,
    {
        if !self.allow_request() {
            return Err(BreakerError::CircuitOpen(self.name.clone()));
        }

        let Ok(_permit) = self.permits.try_acquire() else {
            self.record(false);
            return Err(BreakerError::MaxConcurrency(self.name.clone()));
        };

        match tokio::time::timeout(self.config.timeout, command).await {
            Ok(Ok(value)) => {
                self.record(true);
                Ok(value)
            }
            Ok(Err(e)) => {
                self.record(false);
                Err(BreakerError::Command(e))
            }
            Err(_) => {
                self.record(false);
                Err(BreakerError::Timeout {
                    name: self.name.clone(),
                    timeout: self.config.timeout,
                })
            }
        }
    }

    /// Closed circuits always allow; open ones let one trial through per sleep window.
    #[allow(clippy::expect_used)]
    fn allow_request(&self) -> bool {
        let mut health = self.health.lock().expect("lock poisoned");
        match health.opened_at {
            None => true,
            Some(opened_at) if opened_at.elapsed() >= self.config.sleep_window => {
                health.opened_at = Some(Instant::now());
                debug!("{}: circuit half-open, allowing trial call", self.name);
                true
            }
            Some(_) => false,
        }
    }

    #[allow(clippy::expect_used)]
    fn record(&self, success: bool) {
        let mut health = self.health.lock().expect("lock poisoned");
        let now = Instant::now();

        if health.opened_at.is_some() {
            if success {
                health.opened_at = None;
                health.samples.clear();
                debug!("{}: circuit closed", self.name);
            } else {
                health.opened_at = Some(now);
            }
            return;
        }

        health.samples.push_back((now, success));
        health.prune(now, self.config.rolling_window);

        let total = health.samples.len();
        if total < self.config.request_volume_threshold {
            return;
        }
        let failures = health.samples.iter().filter(|(_, ok)| !ok).count();
        let error_percent = failures * 100 / total;
        if error_percent >= usize::from(self.config.error_percent_threshold) {
            warn!(
                "{}: circuit opened, {}% of {} calls failed",
                self.name, error_percent, total
            );
            health.opened_at = Some(now);
        }
    }
}

fn registry() -> &'static Mutex<HashMap<String, Arc<CircuitBreaker>>> {
    static COMMANDS: OnceLock<Mutex<HashMap<String, Arc<CircuitBreaker>>>> = OnceLock::new();
    COMMANDS.get_or_init(|| Mutex::new(HashMap::new()))
}

/// Returns the process-wide breaker registered under `name`, creating it with `config`
/// on first use. Later calls for the same name keep the first configuration.
#[allow(clippy::expect_used)]
pub fn configure_command(name: &str, config: BreakerConfig) -> Arc<CircuitBreaker> {
    let mut commands = registry().lock().expect("lock poisoned");
    let breaker = commands
        .entry(name.to_string())
        .or_insert_with(|| Arc::new(CircuitBreaker::new(name, config)));
    Arc::clone(breaker)
}
