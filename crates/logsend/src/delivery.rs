// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Delivery of tailed lines to the queue.
//!
//! Line readers submit a [`Delivery`] on their topic's shared work channel and wait on
//! its reply slot. Any [`DeliveryWorker`] of that topic may pick it up; the worker
//! publishes through the circuit breaker and answers exactly once.

use std::sync::Arc;

use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

use crate::breaker::CircuitBreaker;
use crate::errors::{BreakerError, PublishError};
use crate::publisher::Publisher;

/// Result written into a delivery's reply slot.
pub type DeliveryOutcome = Result<(), BreakerError<PublishError>>;

/// One send attempt of an ordered batch of lines.
#[derive(Debug)]
pub struct Delivery {
    pub topic: Arc<str>,
    pub lines: Arc<[Vec<u8>]>,
    pub reply: oneshot::Sender<DeliveryOutcome>,
}

impl Delivery {
    /// Builds a delivery and the receiving half of its reply slot.
    pub fn new(
        topic: Arc<str>,
        lines: Arc<[Vec<u8>]>,
    ) -> (Self, oneshot::Receiver<DeliveryOutcome>) {
        let (reply, outcome) = oneshot::channel();
        (
            Self {
                topic,
                lines,
                reply,
            },
            outcome,
        )
    }
}

pub type WorkSender = flume::Sender<Delivery>;
pub type WorkReceiver = flume::Receiver<Delivery>;

/// Creates a topic's work channel. Sends rendezvous with a free worker.
pub fn work_channel() -> (WorkSender, WorkReceiver) {
    flume::bounded(0)
}

/// Publishes deliveries taken from a topic's work channel.
pub struct DeliveryWorker {
    rx: WorkReceiver,
    publisher: Arc<dyn Publisher>,
    breaker: Arc<CircuitBreaker>,
    shutdown: CancellationToken,
    topic_cancel: CancellationToken,
}

impl DeliveryWorker {
    #[must_use]
    pub fn new(
        rx: WorkReceiver,
        publisher: Arc<dyn Publisher>,
        breaker: Arc<CircuitBreaker>,
        shutdown: CancellationToken,
        topic_cancel: CancellationToken,
    ) -> Self {
        Self {
            rx,
            publisher,
            breaker,
            shutdown,
            topic_cancel,
        }
    }

    /// Serves deliveries until the process or the topic is cancelled.
    pub async fn spin(self) {
        loop {
            tokio::select! {
                biased;
                () = self.shutdown.cancelled() => break,
                () = self.topic_cancel.cancelled() => break,
                received = self.rx.recv_async() => match received {
                    Ok(delivery) => self.handle(delivery).await,
                    Err(_) => {
                        debug!("work channel closed, delivery worker exiting");
                        break;
                    }
                },
            }
        }
    }

    async fn handle(&self, delivery: Delivery) {
        let Delivery {
            topic,
            lines,
            reply,
        } = delivery;

        let outcome = self.publish(&topic, &lines).await;
        if let Err(e) = &outcome {
            error!("failed to publish {} line(s) to {}: {}", lines.len(), topic, e);
        }

        if reply.send(outcome).is_err() {
            debug!("submitter for topic {} went away before the reply", topic);
        }
    }

    async fn publish(&self, topic: &str, lines: &[Vec<u8>]) -> DeliveryOutcome {
        let publisher = &self.publisher;
        match lines {
            [] => Err(BreakerError::Command(PublishError::EmptyBatch)),
            [line] => {
                self.breaker
                    .call(publisher.publish(topic, line))
                    .await
            }
            _ => {
                self.breaker
                    .call(publisher.multi_publish(topic, lines))
                    .await
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::breaker::BreakerConfig;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Mutex;
    use std::time::Duration;
    use tracing_test::traced_test;

    #[derive(Debug, Clone, PartialEq, Eq)]
    pub(crate) enum Call {
        Single(String, Vec<u8>),
        Multi(String, Vec<Vec<u8>>),
    }

    /// Records every call; the first `failures` calls fail.
    #[derive(Default)]
    pub(crate) struct RecordingPublisher {
        pub(crate) calls: Mutex<Vec<Call>>,
        pub(crate) failures: AtomicUsize,
        pub(crate) stopped: AtomicBool,
        pub(crate) delay: Option<Duration>,
    }

    impl RecordingPublisher {
        pub(crate) fn failing(failures: usize) -> Self {
            Self {
                failures: AtomicUsize::new(failures),
                ..Default::default()
            }
        }

        pub(crate) fn calls(&self) -> Vec<Call> {
            self.calls.lock().expect("lock").clone()
        }

        fn outcome(&self) -> Result<(), PublishError> {
            let remaining = self.failures.load(Ordering::SeqCst);
            if remaining > 0 {
                self.failures.store(remaining - 1, Ordering::SeqCst);
                return Err(PublishError::Status(503, "unavailable".to_string()));
            }
            Ok(())
        }
    }

    #[async_trait]
    impl Publisher for RecordingPublisher {
        async fn publish(&self, topic: &str, body: &[u8]) -> Result<(), PublishError> {
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            self.calls
                .lock()
                .expect("lock")
                .push(Call::Single(topic.to_string(), body.to_vec()));
            self.outcome()
        }

        async fn multi_publish(
            &self,
            topic: &str,
            bodies: &[Vec<u8>],
        ) -> Result<(), PublishError> {
            self.calls
                .lock()
                .expect("lock")
                .push(Call::Multi(topic.to_string(), bodies.to_vec()));
            self.outcome()
        }

        async fn stop(&self) {
            self.stopped.store(true, Ordering::SeqCst);
        }
    }

    pub(crate) fn test_breaker() -> Arc<CircuitBreaker> {
        Arc::new(CircuitBreaker::new(
            "test-publish",
            BreakerConfig {
                timeout: Duration::from_millis(200),
                request_volume_threshold: 1000,
                ..BreakerConfig::default()
            },
        ))
    }

    fn lines(items: &[&str]) -> Arc<[Vec<u8>]> {
        items.iter().map(|line| line.as_bytes().to_vec()).collect()
    }

    fn spawn_worker(
        publisher: Arc<RecordingPublisher>,
    ) -> (
        WorkSender,
        CancellationToken,
        CancellationToken,
        tokio::task::JoinHandle<()>,
    ) {
        let (tx, rx) = work_channel();
        let shutdown = CancellationToken::new();
        let topic_cancel = shutdown.child_token();
        let worker = DeliveryWorker::new(
            rx,
            publisher,
            test_breaker(),
            shutdown.clone(),
            topic_cancel.clone(),
        );
        let handle = tokio::spawn(worker.spin());
        (tx, shutdown, topic_cancel, handle)
    }

    #[tokio::test]
    async fn test_single_line_uses_publish() {
        let publisher = Arc::new(RecordingPublisher::default());
        let (tx, _shutdown, topic_cancel, handle) = spawn_worker(Arc::clone(&publisher));

        let (delivery, outcome) = Delivery::new("access".into(), lines(&["a\n"]));
        tx.send_async(delivery).await.expect("send");
        outcome.await.expect("reply").expect("publish ok");

        assert_eq!(
            publisher.calls(),
            vec![Call::Single("access".to_string(), b"a\n".to_vec())]
        );

        topic_cancel.cancel();
        handle.await.expect("worker exits");
    }

    #[tokio::test]
    async fn test_many_lines_use_multi_publish() {
        let publisher = Arc::new(RecordingPublisher::default());
        let (tx, shutdown, _topic_cancel, handle) = spawn_worker(Arc::clone(&publisher));

        let (delivery, outcome) = Delivery::new("access".into(), lines(&["a\n", "b\n"]));
        tx.send_async(delivery).await.expect("send");
        outcome.await.expect("reply").expect("publish ok");

        assert_eq!(
            publisher.calls(),
            vec![Call::Multi(
                "access".to_string(),
                vec![b"a\n".to_vec(), b"b\n".to_vec()]
            )]
        );

        shutdown.cancel();
        handle.await.expect("worker exits");
    }

    #[tokio::test]
    #[traced_test]
    async fn test_failure_is_replied() {
        let publisher = Arc::new(RecordingPublisher::failing(1));
        let (tx, rx) = work_channel();
        let shutdown = CancellationToken::new();
        let worker = DeliveryWorker::new(
            rx,
            publisher,
            test_breaker(),
            shutdown.clone(),
            shutdown.child_token(),
        );

        let submit = async {
            let (delivery, outcome) = Delivery::new("access".into(), lines(&["a\n"]));
            tx.send_async(delivery).await.expect("send");
            let outcome = outcome.await.expect("reply");
            shutdown.cancel();
            outcome
        };
        let ((), outcome) = tokio::join!(worker.spin(), submit);

        assert!(matches!(
            outcome,
            Err(BreakerError::Command(PublishError::Status(503, _)))
        ));
        assert!(logs_contain("failed to publish 1 line(s) to access"));
    }

    #[tokio::test]
    async fn test_slow_publish_times_out() {
        let publisher = Arc::new(RecordingPublisher {
            delay: Some(Duration::from_secs(5)),
            ..Default::default()
        });
        let (tx, shutdown, _topic_cancel, handle) = spawn_worker(Arc::clone(&publisher));

        let (delivery, outcome) = Delivery::new("access".into(), lines(&["a\n"]));
        tx.send_async(delivery).await.expect("send");
        let outcome = tokio::time::timeout(Duration::from_secs(2), outcome)
            .await
            .expect("reply within the breaker timeout")
            .expect("reply");
        assert!(matches!(outcome, Err(BreakerError::Timeout { .. })));

        shutdown.cancel();
        handle.await.expect("worker exits");
    }

    #[tokio::test]
    async fn test_worker_exits_when_channel_closes() {
        let publisher = Arc::new(RecordingPublisher::default());
        let (tx, _shutdown, _topic_cancel, handle) = spawn_worker(publisher);
        drop(tx);
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("worker should exit")
            .expect("worker task");
    }
}
