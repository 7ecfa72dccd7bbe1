// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Convergence of the running topic pipelines onto the stored configuration.
//!
//! The reconciler keeps two registries, the running pipelines by topic and the last
//! applied raw value by topic. Only the reconciler's owner mutates them (`&mut self`),
//! so they need no lock. A changed value is always a teardown followed by a fresh
//! start; a new pipeline may start while the one it replaces is still draining.

use std::collections::HashMap;
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use crate::breaker::CircuitBreaker;
use crate::delivery::{work_channel, DeliveryWorker};
use crate::errors::StoreError;
use crate::publisher::Publisher;
use crate::store::{ConfigStore, Snapshot};
use crate::tailer::{LineReader, ReaderOptions};
use crate::topic::TopicConfig;

/// Topics started and stopped by one reconciliation, sorted.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ReconcileSummary {
    pub started: Vec<String>,
    pub stopped: Vec<String>,
}

impl ReconcileSummary {
    pub fn is_empty(&self) -> bool {
        self.started.is_empty() && self.stopped.is_empty()
    }
}

/// The readers and workers serving one topic.
#[derive(Debug)]
pub struct TopicPipeline {
    config: TopicConfig,
    cancel: CancellationToken,
    tasks: TaskTracker,
}

impl TopicPipeline {
    pub fn files(&self) -> &[PathBuf] {
        &self.config.files
    }

    pub fn batch_size(&self) -> usize {
        self.config.batch_size
    }

    /// Readers and workers of this pipeline that have not exited yet.
    pub fn live_tasks(&self) -> usize {
        self.tasks.len()
    }
}

pub struct Reconciler {
    store: Arc<dyn ConfigStore>,
    publisher: Arc<dyn Publisher>,
    breaker: Arc<CircuitBreaker>,
    shutdown: CancellationToken,
    options: ReaderOptions,
    pipelines: HashMap<String, TopicPipeline>,
    applied: Snapshot,
    tasks: TaskTracker,
}

impl Reconciler {
    /// Topic cancellation tokens are children of `shutdown`, so cancelling it stops
    /// every pipeline at once.
    #[must_use]
    pub fn new(
        store: Arc<dyn ConfigStore>,
        publisher: Arc<dyn Publisher>,
        breaker: Arc<CircuitBreaker>,
        shutdown: CancellationToken,
        options: ReaderOptions,
    ) -> Self {
        Self {
            store,
            publisher,
            breaker,
            shutdown,
            options,
            pipelines: HashMap::new(),
            applied: Snapshot::new(),
            tasks: TaskTracker::new(),
        }
    }

    /// Fetches the current snapshot and converges the running pipelines onto it.
    ///
    /// On a fetch error nothing changes and the previous snapshot stays in force.
    pub async fn reconcile(&mut self) -> Result<ReconcileSummary, StoreError> {
        let snapshot = self.store.fetch().await?;
        let summary = self.apply(snapshot);
        if !summary.is_empty() {
            info!(
                "reconciled topics: started {:?}, stopped {:?}",
                summary.started, summary.stopped
            );
        }
        Ok(summary)
    }

    fn apply(&mut self, snapshot: Snapshot) -> ReconcileSummary {
        let mut summary = ReconcileSummary::default();

        for (topic, value) in &snapshot {
            let previous = self.applied.get(topic).map(String::as_str).unwrap_or("");
            if previous == value {
                continue;
            }
            if self.teardown(topic) {
                summary.stopped.push(topic.clone());
            }
            if !value.is_empty() {
                self.start(topic, value);
                summary.started.push(topic.clone());
            }
        }

        let removed: Vec<String> = self
            .pipelines
            .keys()
            .filter(|topic| !snapshot.contains_key(*topic))
            .cloned()
            .collect();
        for topic in removed {
            if self.teardown(&topic) {
                summary.stopped.push(topic);
            }
        }

        self.applied = snapshot;
        summary.started.sort();
        summary.stopped.sort();
        summary
    }

    fn start(&mut self, topic: &str, raw: &str) {
        let config = TopicConfig::parse(raw);
        if config.files.is_empty() {
            warn!("topic {} is configured without any file: {:?}", topic, raw);
        }

        let cancel = self.shutdown.child_token();
        let pipeline_tasks = TaskTracker::new();
        let (tx, rx) = work_channel();
        let name: Arc<str> = Arc::from(topic);

        for file in &config.files {
            let worker = DeliveryWorker::new(
                rx.clone(),
                Arc::clone(&self.publisher),
                Arc::clone(&self.breaker),
                self.shutdown.clone(),
                cancel.clone(),
            );
            let reader = LineReader::new(
                file.clone(),
                Arc::clone(&name),
                tx.clone(),
                cancel.clone(),
                self.options,
            );
            self.spawn(&pipeline_tasks, worker.spin());
            self.spawn(&pipeline_tasks, reader.spin());
        }
        pipeline_tasks.close();

        info!(
            "started topic {} with {} file(s), batch size {}",
            topic,
            config.files.len(),
            config.batch_size
        );
        self.pipelines.insert(
            topic.to_string(),
            TopicPipeline {
                config,
                cancel,
                tasks: pipeline_tasks,
            },
        );
    }

    fn spawn<F>(&self, pipeline_tasks: &TaskTracker, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.tasks.spawn(pipeline_tasks.track_future(task));
    }

    /// Cancels the topic's pipeline and drops it from both registries.
    fn teardown(&mut self, topic: &str) -> bool {
        let Some(pipeline) = self.pipelines.remove(topic) else {
            return false;
        };
        self.applied.remove(topic);
        pipeline.cancel.cancel();
        info!(
            "stopping topic {} ({} task(s) draining)",
            topic,
            pipeline.tasks.len()
        );
        true
    }

    /// Stops every pipeline and waits until all readers and workers ever started have
    /// exited. Returns the number of pipelines that were running.
    pub async fn shutdown(&mut self) -> usize {
        let topics: Vec<String> = self.pipelines.keys().cloned().collect();
        for topic in &topics {
            self.teardown(topic);
        }
        self.applied.clear();

        self.tasks.close();
        debug!("waiting for {} task(s) to exit", self.tasks.len());
        self.tasks.wait().await;
        topics.len()
    }

    /// Topics with a running pipeline, sorted.
    pub fn active_topics(&self) -> Vec<&str> {
        let mut topics: Vec<&str> = self.pipelines.keys().map(String::as_str).collect();
        topics.sort_unstable();
        topics
    }

    pub fn pipeline(&self, topic: &str) -> Option<&TopicPipeline> {
        self.pipelines.get(topic)
    }

    /// The snapshot most recently applied.
    pub fn applied(&self) -> &Snapshot {
        &self.applied
    }

    /// Tracker of every reader and worker spawned by this reconciler.
    pub fn task_tracker(&self) -> TaskTracker {
        self.tasks.clone()
    }
}
