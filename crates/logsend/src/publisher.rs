// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Message-queue publishing.
//!
//! [`NsqPublisher`] speaks the nsqd HTTP API over a single pooled client that lives for
//! the whole process. Multi-line batches use the binary `mpub` framing so that lines
//! keep their terminators intact.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, CONTENT_TYPE, USER_AGENT};
use reqwest::Client;
use tracing::debug;

use crate::config::{http_base_url, AgentConfig};
use crate::errors::PublishError;

const PUB_ENDPOINT: &str = "/pub";
const MPUB_ENDPOINT: &str = "/mpub";
const PUBLISH_TIMEOUT: Duration = Duration::from_secs(5);

#[async_trait]
pub trait Publisher: Send + Sync {
    /// Publishes a single message to `topic`.
    async fn publish(&self, topic: &str, body: &[u8]) -> Result<(), PublishError>;

    /// Publishes an ordered batch of messages to `topic` in one call.
    async fn multi_publish(&self, topic: &str, bodies: &[Vec<u8>]) -> Result<(), PublishError>;

    /// Releases the connection. Later calls fail with [`PublishError::Stopped`].
    async fn stop(&self);
}

#[derive(Debug)]
pub struct NsqPublisher {
    client: Client,
    base_url: String,
    stopped: AtomicBool,
}

impl NsqPublisher {
    pub fn new(address: &str) -> Result<Self, PublishError> {
        let mut headers = HeaderMap::new();
        headers.insert(
            USER_AGENT,
            HeaderValue::from_static(concat!("logsend/", env!("CARGO_PKG_VERSION"))),
        );
        headers.insert(
            CONTENT_TYPE,
            HeaderValue::from_static("application/octet-stream"),
        );

        let client = Client::builder()
            .default_headers(headers)
            .timeout(PUBLISH_TIMEOUT)
            .build()?;

        Ok(Self {
            client,
            base_url: http_base_url(address),
            stopped: AtomicBool::new(false),
        })
    }

    pub fn from_config(config: &AgentConfig) -> Result<Self, PublishError> {
        Self::new(&config.nsq_address)
    }

    async fn post(
        &self,
        endpoint: &str,
        query: &[(&str, &str)],
        body: Vec<u8>,
    ) -> Result<(), PublishError> {
        if self.stopped.load(Ordering::Acquire) {
            return Err(PublishError::Stopped);
        }

        let url = format!("{}{}", self.base_url, endpoint);
        let response = self.client.post(url).query(query).body(body).send().await?;
        let status = response.status();
        if status.is_success() {
            return Ok(());
        }

        let text = response.text().await.unwrap_or_default();
        Err(PublishError::Status(status.as_u16(), text))
    }
}

/// Encodes `bodies` with the nsqd binary multi-publish framing:
/// `[u32 count]` followed by `[u32 size][bytes]` per message, big-endian.
pub fn encode_multi(bodies: &[Vec<u8>]) -> Result<Vec<u8>, PublishError> {
    let size = 4 + bodies.iter().map(|body| 4 + body.len()).sum::<usize>();
    let mut buf = Vec::with_capacity(size);
    buf.extend_from_slice(&frame_len(bodies.len())?);
    for body in bodies {
        buf.extend_from_slice(&frame_len(body.len())?);
        buf.extend_from_slice(body);
    }
    Ok(buf)
}

fn frame_len(len: usize) -> Result<[u8; 4], PublishError> {
    u32::try_from(len)
        .map(u32::to_be_bytes)
        .map_err(|_| PublishError::FrameTooLarge(len))
}

#[async_trait]
impl Publisher for NsqPublisher {
    async fn publish(&self, topic: &str, body: &[u8]) -> Result<(), PublishError> {
        self.post(PUB_ENDPOINT, &[("topic", topic)], body.to_vec())
            .await
    }

    async fn multi_publish(&self, topic: &str, bodies: &[Vec<u8>]) -> Result<(), PublishError> {
        if bodies.is_empty() {
            return Err(PublishError::EmptyBatch);
        }
        self.post(
            MPUB_ENDPOINT,
            &[("topic", topic), ("binary", "true")],
            encode_multi(bodies)?,
        )
        .await
    }

    async fn stop(&self) {
        if !self.stopped.swap(true, Ordering::AcqRel) {
            debug!("nsq publisher stopped");
        }
    }
}
