// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use crate::errors::ConfigError;
use std::env;

const DEFAULT_CONSUL_ADDRESS: &str = "127.0.0.1:8500";
const DEFAULT_NSQ_ADDRESS: &str = "127.0.0.1:4151";

/// Settings resolved from the environment for the log forwarding agent
#[derive(Debug, Clone)]
pub struct AgentConfig {
    /// Consul HTTP address (e.g., 127.0.0.1:8500)
    pub consul_address: String,
    /// Optional Consul datacenter to query
    pub datacenter: Option<String>,
    /// Optional Consul ACL token
    pub consul_token: Option<String>,
    /// Key prefix whose children map topics to files
    pub cluster: String,
    /// Read every file from its beginning instead of tailing from the end
    pub read_all: bool,
    /// nsqd HTTP address (e.g., 127.0.0.1:4151)
    pub nsq_address: String,
    /// Log level (e.g., trace, debug, info, warn, error)
    pub log_level: String,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            consul_address: DEFAULT_CONSUL_ADDRESS.to_string(),
            datacenter: None,
            consul_token: None,
            cluster: String::new(),
            read_all: false,
            nsq_address: DEFAULT_NSQ_ADDRESS.to_string(),
            log_level: "info".to_string(),
        }
    }
}

impl AgentConfig {
    /// Create configuration from environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        let consul_address = env::var("LOGSEND_CONSUL_ADDRESS")
            .unwrap_or_else(|_| DEFAULT_CONSUL_ADDRESS.to_string());
        let datacenter = non_empty_var("LOGSEND_DATACENTER");
        let consul_token = non_empty_var("LOGSEND_CONSUL_TOKEN");
        let cluster =
            non_empty_var("LOGSEND_CLUSTER").ok_or(ConfigError::Missing("LOGSEND_CLUSTER"))?;
        let read_all = non_empty_var("LOGSEND_READ_ALL").is_some();
        let nsq_address =
            env::var("LOGSEND_NSQ_ADDRESS").unwrap_or_else(|_| DEFAULT_NSQ_ADDRESS.to_string());
        let log_level = env::var("LOGSEND_LOG_LEVEL")
            .map(|val| val.to_lowercase())
            .unwrap_or_else(|_| "info".to_string());

        let config = Self {
            consul_address,
            datacenter,
            consul_token,
            cluster,
            read_all,
            nsq_address,
            log_level,
        };

        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.cluster.trim().is_empty() {
            return Err(ConfigError::Invalid(
                "LOGSEND_CLUSTER cannot be empty".to_string(),
            ));
        }

        if self.consul_address.trim().is_empty() {
            return Err(ConfigError::Invalid(
                "LOGSEND_CONSUL_ADDRESS cannot be empty".to_string(),
            ));
        }

        if self.nsq_address.trim().is_empty() {
            return Err(ConfigError::Invalid(
                "LOGSEND_NSQ_ADDRESS cannot be empty".to_string(),
            ));
        }

        let valid_log_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_log_levels.contains(&self.log_level.as_str()) {
            return Err(ConfigError::Invalid(format!(
                "Invalid log level '{}'. Must be one of: trace, debug, info, warn, error",
                self.log_level
            )));
        }

        Ok(())
    }
}

fn non_empty_var(name: &str) -> Option<String> {
    env::var(name).ok().filter(|val| !val.is_empty())
}

/// Prefixes `http://` onto an address given as bare `host:port`.
pub(crate) fn http_base_url(address: &str) -> String {
    let address = address.trim().trim_end_matches('/');
    if address.starts_with("http://") || address.starts_with("https://") {
        address.to_string()
    } else {
        format!("http://{address}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    const VARS: [&str; 7] = [
        "LOGSEND_CONSUL_ADDRESS",
        "LOGSEND_DATACENTER",
        "LOGSEND_CONSUL_TOKEN",
        "LOGSEND_CLUSTER",
        "LOGSEND_READ_ALL",
        "LOGSEND_NSQ_ADDRESS",
        "LOGSEND_LOG_LEVEL",
    ];

    fn clear_env() {
        for var in VARS {
            env::remove_var(var);
        }
    }

    #[test]
    #[serial]
    fn test_error_if_no_cluster() {
        clear_env();
        let config = AgentConfig::from_env();
        assert_eq!(
            config.unwrap_err().to_string(),
            "LOGSEND_CLUSTER environment variable is not set"
        );
    }

    #[test]
    #[serial]
    fn test_defaults_from_env() {
        clear_env();
        env::set_var("LOGSEND_CLUSTER", "web");

        let config = AgentConfig::from_env().expect("config should load");
        assert_eq!(config.cluster, "web");
        assert_eq!(config.consul_address, "127.0.0.1:8500");
        assert_eq!(config.nsq_address, "127.0.0.1:4151");
        assert_eq!(config.datacenter, None);
        assert_eq!(config.consul_token, None);
        assert!(!config.read_all);
        assert_eq!(config.log_level, "info");
        clear_env();
    }

    #[test]
    #[serial]
    fn test_overrides_from_env() {
        clear_env();
        env::set_var("LOGSEND_CLUSTER", "web");
        env::set_var("LOGSEND_CONSUL_ADDRESS", "consul.internal:8500");
        env::set_var("LOGSEND_DATACENTER", "dc2");
        env::set_var("LOGSEND_CONSUL_TOKEN", "secret");
        env::set_var("LOGSEND_READ_ALL", "1");
        env::set_var("LOGSEND_NSQ_ADDRESS", "http://nsqd:4151");
        env::set_var("LOGSEND_LOG_LEVEL", "DEBUG");

        let config = AgentConfig::from_env().expect("config should load");
        assert_eq!(config.consul_address, "consul.internal:8500");
        assert_eq!(config.datacenter.as_deref(), Some("dc2"));
        assert_eq!(config.consul_token.as_deref(), Some("secret"));
        assert!(config.read_all);
        assert_eq!(config.nsq_address, "http://nsqd:4151");
        assert_eq!(config.log_level, "debug");
        clear_env();
    }

    #[test]
    #[serial]
    fn test_invalid_log_level_from_env() {
        clear_env();
        env::set_var("LOGSEND_CLUSTER", "web");
        env::set_var("LOGSEND_LOG_LEVEL", "loud");
        assert!(AgentConfig::from_env().is_err());
        clear_env();
    }

    #[test]
    fn test_validate_empty_cluster() {
        let config = AgentConfig {
            cluster: "   ".to_string(),
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_empty_addresses() {
        let config = AgentConfig {
            cluster: "web".to_string(),
            nsq_address: String::new(),
            ..Default::default()
        };
        assert!(config.validate().is_err());

        let config = AgentConfig {
            cluster: "web".to_string(),
            consul_address: " ".to_string(),
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_http_base_url() {
        assert_eq!(http_base_url("127.0.0.1:8500"), "http://127.0.0.1:8500");
        assert_eq!(http_base_url("https://consul:8501/"), "https://consul:8501");
        assert_eq!(http_base_url("http://nsqd:4151"), "http://nsqd:4151");
    }
}
