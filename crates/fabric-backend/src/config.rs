//! Network configuration file
//!
//! ```json
//! {
//!   "Network": "10.5.0.0/16",
//!   "Backend": {"Type": "host-gw", "RouteCheckIntervalSecs": 10}
//! }
//! ```
//!
//! Backend keys other than `Type` and `RouteCheckIntervalSecs` are kept as
//! opaque JSON for the backend kind to interpret.
//!
//! # NIST 800-53 Rev 5 Control Mappings
//! - CM-6: Configuration Settings - Validated configuration loading

use crate::error::{BackendError, Result};
use crate::route_network::DEFAULT_ROUTE_CHECK_INTERVAL;
use fabric_types::IpPrefix;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Backend kind used when the config names none.
pub const DEFAULT_BACKEND_TYPE: &str = "host-gw";

/// Agent network configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Config {
    /// Cluster-wide network that peer subnets are carved from.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub network: Option<IpPrefix>,
    #[serde(default)]
    pub backend: BackendConfig,
}

/// The `Backend` section.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct BackendConfig {
    #[serde(rename = "Type", default = "default_backend_type")]
    pub kind: String,
    #[serde(default = "default_route_check_interval_secs")]
    pub route_check_interval_secs: u64,
    /// Remaining backend-specific keys.
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

fn default_backend_type() -> String {
    DEFAULT_BACKEND_TYPE.to_string()
}

fn default_route_check_interval_secs() -> u64 {
    DEFAULT_ROUTE_CHECK_INTERVAL.as_secs()
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            kind: default_backend_type(),
            route_check_interval_secs: default_route_check_interval_secs(),
            extra: serde_json::Map::new(),
        }
    }
}

impl BackendConfig {
    pub fn route_check_interval(&self) -> Duration {
        Duration::from_secs(self.route_check_interval_secs)
    }
}

impl Config {
    /// Parses and validates a JSON config document.
    pub fn parse(json: &str) -> Result<Self> {
        let mut config: Config = serde_json::from_str(json)?;

        if config.backend.kind.trim().is_empty() {
            config.backend.kind = default_backend_type();
        }
        if config.backend.route_check_interval_secs == 0 {
            return Err(BackendError::config(
                "RouteCheckIntervalSecs must be greater than zero",
            ));
        }
        if let Some(network) = config.network {
            if network.is_default() {
                return Err(BackendError::config(format!(
                    "Network {} covers the whole address space",
                    network
                )));
            }
            config.network = Some(network.network());
        }

        Ok(config)
    }

    /// Reads and parses the config file at `path`.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path).map_err(|e| {
            BackendError::config(format!("cannot read {}: {}", path.display(), e))
        })?;
        Self::parse(&json)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::io::Write;

    #[test]
    fn test_parse_full() {
        let config = Config::parse(
            r#"{"Network": "10.5.0.0/16", "Backend": {"Type": "host-gw", "RouteCheckIntervalSecs": 30}}"#,
        )
        .unwrap();

        assert_eq!(config.network, Some("10.5.0.0/16".parse().unwrap()));
        assert_eq!(config.backend.kind, "host-gw");
        assert_eq!(config.backend.route_check_interval(), Duration::from_secs(30));
        assert!(config.backend.extra.is_empty());
    }

    #[test]
    fn test_defaults() {
        let config = Config::parse("{}").unwrap();
        assert_eq!(config.network, None);
        assert_eq!(config.backend, BackendConfig::default());
        assert_eq!(config.backend.route_check_interval(), Duration::from_secs(10));
    }

    #[test]
    fn test_network_normalized() {
        let config = Config::parse(r#"{"Network": "10.5.3.7/16"}"#).unwrap();
        assert_eq!(config.network.unwrap().to_string(), "10.5.0.0/16");
    }

    #[test]
    fn test_extra_backend_keys_preserved() {
        let config = Config::parse(
            r#"{"Backend": {"Type": "vxlan", "VNI": 4, "Port": 8472}}"#,
        )
        .unwrap();
        assert_eq!(config.backend.kind, "vxlan");
        assert_eq!(config.backend.extra["VNI"], 4);
        assert_eq!(config.backend.extra["Port"], 8472);
    }

    #[test]
    fn test_invalid_configs() {
        assert!(matches!(
            Config::parse(r#"{"Backend": {"RouteCheckIntervalSecs": 0}}"#),
            Err(BackendError::Config(_))
        ));
        assert!(matches!(
            Config::parse(r#"{"Network": "0.0.0.0/0"}"#),
            Err(BackendError::Config(_))
        ));
        assert!(matches!(
            Config::parse(r#"{"Network": "10.5.0.0/40"}"#),
            Err(BackendError::Json(_))
        ));
        assert!(matches!(Config::parse("not json"), Err(BackendError::Json(_))));
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(br#"{"Network": "10.5.0.0/16"}"#).unwrap();

        let config = Config::load(file.path()).unwrap();
        assert_eq!(config.backend.kind, DEFAULT_BACKEND_TYPE);

        assert!(matches!(
            Config::load("/nonexistent/fabric.json"),
            Err(BackendError::Config(_))
        ));
    }
}
