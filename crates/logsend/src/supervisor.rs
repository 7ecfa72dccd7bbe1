// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info};

use crate::breaker::{configure_command, BreakerConfig, PUBLISH_COMMAND};
use crate::errors::SupervisorError;
use crate::publisher::Publisher;
use crate::reconciler::Reconciler;
use crate::store::ConfigStore;
use crate::tailer::ReaderOptions;

/// Period between two configuration reloads. The first reload happens at startup.
pub const RECONCILE_INTERVAL: Duration = Duration::from_secs(600);

/// Stops a running [`Supervisor`]. Cloneable; only the first `stop` has an effect.
#[derive(Debug, Clone)]
pub struct SupervisorHandle {
    shutdown: CancellationToken,
    stopped: Arc<AtomicBool>,
}

impl SupervisorHandle {
    /// Cancels every reader, worker and the reload loop.
    pub fn stop(&self) -> Result<(), SupervisorError> {
        if self.stopped.swap(true, Ordering::AcqRel) {
            return Err(SupervisorError::AlreadyStopped);
        }
        info!("stopping log forwarding");
        self.shutdown.cancel();
        Ok(())
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }
}

pub struct Supervisor {
    reconciler: Reconciler,
    publisher: Arc<dyn Publisher>,
    shutdown: CancellationToken,
}

impl Supervisor {
    pub fn new(
        store: Arc<dyn ConfigStore>,
        publisher: Arc<dyn Publisher>,
        options: ReaderOptions,
    ) -> (Self, SupervisorHandle) {
        let shutdown = CancellationToken::new();
        let breaker = configure_command(PUBLISH_COMMAND, BreakerConfig::default());
        let reconciler = Reconciler::new(
            store,
            Arc::clone(&publisher),
            breaker,
            shutdown.clone(),
            options,
        );

        let handle = SupervisorHandle {
            shutdown: shutdown.clone(),
            stopped: Arc::new(AtomicBool::new(false)),
        };
        (
            Self {
                reconciler,
                publisher,
                shutdown,
            },
            handle,
        )
    }

    /// Tracker of every reader and worker started by this supervisor.
    pub fn task_tracker(&self) -> TaskTracker {
        self.reconciler.task_tracker()
    }

    /// Reloads the configuration every [`RECONCILE_INTERVAL`] until stopped, then waits
    /// for all readers and workers to exit and releases the publisher.
    pub async fn run(mut self) {
        let mut ticker = interval(RECONCILE_INTERVAL);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                () = self.shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    match self.reconciler.reconcile().await {
                        Ok(summary) if summary.is_empty() => debug!("configuration unchanged"),
                        Ok(_) => {}
                        Err(e) => error!("failed to reload configuration: {}", e),
                    }
                }
            }
        }

        let stopped = self.reconciler.shutdown().await;
        info!("stopped {} topic(s), all readers and workers exited", stopped);
        self.publisher.stop().await;
    }
}
