// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::todo))]
#![cfg_attr(not(test), deny(clippy::unimplemented))]

use std::{env, sync::Arc};
use tracing::{debug, error, info};
use tracing_subscriber::EnvFilter;

use logsend::{
    publisher::NsqPublisher, store::ConsulKvStore, tailer::ReaderOptions, AgentConfig,
    Supervisor,
};

#[tokio::main]
pub async fn main() {
    let log_level = env::var("LOGSEND_LOG_LEVEL")
        .map(|val| val.to_lowercase())
        .unwrap_or("info".to_string());

    let env_filter = format!("h2=off,hyper=off,reqwest=off,rustls=off,{}", log_level);

    #[allow(clippy::expect_used)]
    let subscriber = tracing_subscriber::fmt::Subscriber::builder()
        .with_env_filter(
            EnvFilter::try_new(env_filter).expect("could not parse log level in configuration"),
        )
        .with_level(true)
        .with_thread_names(false)
        .with_thread_ids(false)
        .with_line_number(false)
        .with_file(false)
        .with_target(true)
        .without_time()
        .finish();

    #[allow(clippy::expect_used)]
    tracing::subscriber::set_global_default(subscriber).expect("setting default subscriber failed");

    debug!("Logging subsystem enabled");

    let config = match AgentConfig::from_env() {
        Ok(c) => c,
        Err(e) => {
            error!("Error loading configuration on startup: {e}");
            return;
        }
    };

    let store = match ConsulKvStore::from_config(&config) {
        Ok(store) => Arc::new(store),
        Err(e) => {
            error!("Error creating configuration store client: {e}");
            return;
        }
    };

    let publisher = match NsqPublisher::from_config(&config) {
        Ok(publisher) => Arc::new(publisher),
        Err(e) => {
            error!("Error creating nsqd publisher: {e}");
            return;
        }
    };

    let options = ReaderOptions {
        read_all: config.read_all,
        ..ReaderOptions::default()
    };
    let (supervisor, handle) = Supervisor::new(store, publisher, options);

    info!(
        "forwarding logs for cluster {} from {} to {}",
        config.cluster, config.consul_address, config.nsq_address
    );
    let supervisor = tokio::spawn(supervisor.run());

    wait_for_signal().await;

    if let Err(e) = handle.stop() {
        error!("{e}");
    }
    if let Err(e) = supervisor.await {
        error!("Supervisor task failed: {e}");
    }
    info!("shutdown complete");
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    let mut terminate = match signal(SignalKind::terminate()) {
        Ok(terminate) => terminate,
        Err(e) => {
            error!("Unable to listen for SIGTERM: {e}");
            wait_for_ctrl_c().await;
            return;
        }
    };

    tokio::select! {
        () = wait_for_ctrl_c() => {}
        _ = terminate.recv() => info!("received SIGTERM"),
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    wait_for_ctrl_c().await;
}

async fn wait_for_ctrl_c() {
    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("received interrupt"),
        Err(e) => error!("Unable to listen for interrupt: {e}"),
    }
}
