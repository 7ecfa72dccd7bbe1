// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Tails a remotely configured set of log files and republishes every line to a
//! message-queue topic.
//!
//! The configuration lives in a key-value store under a fixed prefix: every key is a
//! topic, every value lists the files feeding it (`"a.log,b.log:20"`). The
//! [`supervisor::Supervisor`] reconciles that mapping periodically; for each topic the
//! [`reconciler::Reconciler`] runs one [`tailer::LineReader`] and one
//! [`delivery::DeliveryWorker`] per file, and every line is acknowledged by the queue
//! before its reader moves on.

#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::todo))]
#![cfg_attr(not(test), deny(clippy::unimplemented))]

pub mod breaker;
pub mod config;
pub mod delivery;
pub mod errors;
pub mod publisher;
pub mod reconciler;
pub mod store;
pub mod supervisor;
pub mod tailer;
pub mod topic;

pub use config::AgentConfig;
pub use reconciler::{ReconcileSummary, Reconciler};
pub use supervisor::{Supervisor, SupervisorHandle};
