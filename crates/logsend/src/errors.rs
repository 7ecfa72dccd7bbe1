// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::time::Duration;

/// Errors raised while loading the agent configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid configuration: {0}")]
    Invalid(String),

    #[error("{0} environment variable is not set")]
    Missing(&'static str),
}

/// Errors raised while fetching a configuration snapshot.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("unexpected status {0} from configuration store: {1}")]
    Status(u16, String),

    #[error("failed to decode configuration store payload: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("value of key {key} is not valid base64: {source}")]
    Value {
        key: String,
        #[source]
        source: base64::DecodeError,
    },

    #[error("invalid configuration store address: {0}")]
    Address(String),
}

/// Errors raised by a queue publisher.
#[derive(Debug, thiserror::Error)]
pub enum PublishError {
    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("{0}: failed to publish: {1}")]
    Status(u16, String),

    #[error("refusing to publish an empty batch")]
    EmptyBatch,

    #[error("frame length {0} does not fit the 32-bit mpub framing")]
    FrameTooLarge(usize),

    #[error("publisher is stopped")]
    Stopped,
}

/// Errors returned by a call made through a [`crate::breaker::CircuitBreaker`].
#[derive(Debug, thiserror::Error)]
pub enum BreakerError<E> {
    #[error("{0}: circuit open")]
    CircuitOpen(String),

    #[error("{0}: max concurrency")]
    MaxConcurrency(String),

    #[error("{name}: timeout after {timeout:?}")]
    Timeout { name: String, timeout: Duration },

    #[error(transparent)]
    Command(E),
}

/// Errors raised by the supervisor lifecycle.
#[derive(Debug, thiserror::Error)]
pub enum SupervisorError {
    #[error("supervisor already stopped")]
    AlreadyStopped,
}
