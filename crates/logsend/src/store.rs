// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Configuration store access.
//!
//! The agent only ever reads the store: every entry below the configured prefix is a
//! topic, and its value lists the files feeding that topic.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use base64::prelude::*;
use reqwest::header::{HeaderMap, HeaderValue, USER_AGENT};
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use tracing::debug;

use crate::config::{http_base_url, AgentConfig};
use crate::errors::StoreError;

/// Topic name to raw configuration value.
pub type Snapshot = BTreeMap<String, String>;

const KV_ENDPOINT: &str = "/v1/kv/";
const TOKEN_HEADER: &str = "X-Consul-Token";
const STORE_TIMEOUT: Duration = Duration::from_secs(10);

#[async_trait]
pub trait ConfigStore: Send + Sync {
    /// Fetches every topic entry currently stored under the prefix.
    async fn fetch(&self) -> Result<Snapshot, StoreError>;
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct KvPair {
    key: String,
    #[serde(default)]
    value: Option<String>,
}

/// Reads the topic mapping from the Consul KV HTTP API.
#[derive(Debug, Clone)]
pub struct ConsulKvStore {
    client: Client,
    base_url: String,
    prefix: String,
    datacenter: Option<String>,
}

impl ConsulKvStore {
    pub fn new(
        address: &str,
        prefix: &str,
        datacenter: Option<String>,
        token: Option<&str>,
    ) -> Result<Self, StoreError> {
        let mut headers = HeaderMap::new();
        headers.insert(
            USER_AGENT,
            HeaderValue::from_static(concat!("logsend/", env!("CARGO_PKG_VERSION"))),
        );
        if let Some(token) = token {
            headers.insert(
                TOKEN_HEADER,
                HeaderValue::from_str(token)
                    .map_err(|_| StoreError::Address("token is not a valid header".into()))?,
            );
        }

        let client = Client::builder()
            .default_headers(headers)
            .timeout(STORE_TIMEOUT)
            .build()?;

        let prefix = prefix.trim_matches('/');
        if prefix.is_empty() {
            return Err(StoreError::Address("key prefix cannot be empty".into()));
        }

        Ok(Self {
            client,
            base_url: http_base_url(address),
            prefix: prefix.to_string(),
            datacenter,
        })
    }

    pub fn from_config(config: &AgentConfig) -> Result<Self, StoreError> {
        Self::new(
            &config.consul_address,
            &config.cluster,
            config.datacenter.clone(),
            config.consul_token.as_deref(),
        )
    }

    fn url(&self) -> String {
        format!("{}{}{}", self.base_url, KV_ENDPOINT, self.prefix)
    }

    /// Keeps the entries strictly below `prefix/`, keyed by their relative name.
    fn snapshot_from(&self, pairs: Vec<KvPair>) -> Result<Snapshot, StoreError> {
        let mut snapshot = Snapshot::new();
        for pair in pairs {
            let Some(topic) = pair.key.strip_prefix(self.prefix.as_str()) else {
                continue;
            };
            let Some(topic) = topic.strip_prefix('/') else {
                continue;
            };
            if topic.is_empty() {
                continue;
            }

            let value = match pair.value {
                Some(encoded) => {
                    let bytes = BASE64_STANDARD
                        .decode(encoded.as_bytes())
                        .map_err(|source| StoreError::Value {
                            key: pair.key.clone(),
                            source,
                        })?;
                    String::from_utf8_lossy(&bytes).into_owned()
                }
                None => String::new(),
            };
            snapshot.insert(topic.to_string(), value);
        }
        Ok(snapshot)
    }
}

#[async_trait]
impl ConfigStore for ConsulKvStore {
    async fn fetch(&self) -> Result<Snapshot, StoreError> {
        let mut request = self.client.get(self.url()).query(&[("recurse", "true")]);
        if let Some(dc) = &self.datacenter {
            request = request.query(&[("dc", dc.as_str())]);
        }

        let response = request.send().await?;
        let status = response.status();
        // Consul answers 404 when nothing lives under the prefix.
        if status == StatusCode::NOT_FOUND {
            debug!("configuration store has no keys under {}", self.prefix);
            return Ok(Snapshot::new());
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(StoreError::Status(status.as_u16(), body));
        }

        let body = response.bytes().await?;
        let pairs: Vec<KvPair> = serde_json::from_slice(&body)?;
        self.snapshot_from(pairs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mockito::{Matcher, Server};

    fn encode(value: &str) -> String {
        BASE64_STANDARD.encode(value)
    }

    #[tokio::test]
    async fn test_fetch_decodes_entries_below_prefix() {
        let mut server = Server::new_async().await;
        let body = serde_json::json!([
            {"Key": "web", "Value": null, "Flags": 0},
            {"Key": "web/", "Value": null, "Flags": 0},
            {"Key": "web/access", "Value": encode("/var/log/a.log,/var/log/b.log:10"), "Flags": 0},
            {"Key": "web/errors", "Value": encode("/var/log/e.log"), "Flags": 0},
            {"Key": "web/disabled", "Value": null, "Flags": 0},
            {"Key": "webber/other", "Value": encode("/tmp/x"), "Flags": 0},
        ]);
        let mock = server
            .mock("GET", "/v1/kv/web")
            .match_query(Matcher::AllOf(vec![
                Matcher::UrlEncoded("recurse".into(), "true".into()),
                Matcher::UrlEncoded("dc".into(), "dc1".into()),
            ]))
            .match_header("X-Consul-Token", "secret")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(body.to_string())
            .create_async()
            .await;

        let store = ConsulKvStore::new(&server.url(), "web", Some("dc1".into()), Some("secret"))
            .expect("store should build");
        let snapshot = store.fetch().await.expect("fetch should succeed");

        mock.assert_async().await;
        assert_eq!(snapshot.len(), 3);
        assert_eq!(snapshot["access"], "/var/log/a.log,/var/log/b.log:10");
        assert_eq!(snapshot["errors"], "/var/log/e.log");
        assert_eq!(snapshot["disabled"], "");
        assert!(!snapshot.contains_key("other"));
    }

    #[tokio::test]
    async fn test_fetch_not_found_is_empty() {
        let mut server = Server::new_async().await;
        let _mock = server
            .mock("GET", "/v1/kv/web")
            .match_query(Matcher::Any)
            .with_status(404)
            .create_async()
            .await;

        let store = ConsulKvStore::new(&server.url(), "web", None, None).expect("store");
        let snapshot = store.fetch().await.expect("fetch should succeed");
        assert!(snapshot.is_empty());
    }

    #[tokio::test]
    async fn test_fetch_server_error() {
        let mut server = Server::new_async().await;
        let _mock = server
            .mock("GET", "/v1/kv/web")
            .match_query(Matcher::Any)
            .with_status(500)
            .with_body("rpc error")
            .create_async()
            .await;

        let store = ConsulKvStore::new(&server.url(), "web", None, None).expect("store");
        match store.fetch().await {
            Err(StoreError::Status(500, body)) => assert_eq!(body, "rpc error"),
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_fetch_rejects_bad_base64() {
        let mut server = Server::new_async().await;
        let _mock = server
            .mock("GET", "/v1/kv/web")
            .match_query(Matcher::Any)
            .with_status(200)
            .with_body(r#"[{"Key": "web/access", "Value": "%%%"}]"#)
            .create_async()
            .await;

        let store = ConsulKvStore::new(&server.url(), "web", None, None).expect("store");
        assert!(matches!(
            store.fetch().await,
            Err(StoreError::Value { ref key, .. }) if key == "web/access"
        ));
    }

    #[tokio::test]
    async fn test_prefix_folder_entries_are_skipped() {
        let mut server = Server::new_async().await;
        let body = serde_json::json!([
            {"Key": "web/", "Value": encode("/var/log/folder.log"), "Flags": 0},
            {"Key": "web", "Value": encode("/var/log/root.log"), "Flags": 0},
        ]);
        let _mock = server
            .mock("GET", "/v1/kv/web")
            .match_query(Matcher::Any)
            .with_status(200)
            .with_body(body.to_string())
            .create_async()
            .await;

        let store = ConsulKvStore::new(&server.url(), "web", None, None).expect("store");
        let snapshot = store.fetch().await.expect("fetch should succeed");
        assert!(snapshot.is_empty());
    }

    #[test]
    fn test_empty_prefix_is_rejected() {
        assert!(ConsulKvStore::new("127.0.0.1:8500", "/", None, None).is_err());
    }
}
