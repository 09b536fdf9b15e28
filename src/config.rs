//! Gateway configuration
//!
//! The TOML file has two sections: `[broker]` describes the MQTT endpoint and
//! `[bridge]` tunes channel sizes and timers. Every field has a default, so an
//! empty or missing file yields a bridge to `localhost:1883` with no topics.
//!
//! The raw file structs are validated once into [`EndpointConfig`] and
//! [`BridgeSettings`], which are immutable afterwards. Changing configuration
//! means restarting the bridge.

use crate::error::ConfigError;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::Path;
use std::time::Duration;
use tracing::{debug, info};

const DEFAULT_HOST: &str = "localhost";
const DEFAULT_PORT: u16 = 1883;
const DEFAULT_CLIENT_ID: &str = "mqtt-bus-gateway";

/// `[broker]` section as written in the file
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct BrokerSection {
    pub host: String,
    pub port: u16,
    pub topics: Vec<String>,
    pub username: String,
    pub password: String,
    pub tls: bool,
    pub client_id: String,
    pub keep_alive_secs: u64,
}

impl Default for BrokerSection {
    fn default() -> Self {
        Self {
            host: DEFAULT_HOST.to_string(),
            port: DEFAULT_PORT,
            topics: Vec::new(),
            username: String::new(),
            password: String::new(),
            tls: false,
            client_id: DEFAULT_CLIENT_ID.to_string(),
            keep_alive_secs: 30,
        }
    }
}

/// `[bridge]` section as written in the file
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct BridgeSection {
    pub channel_capacity: usize,
    pub backoff_initial_ms: u64,
    pub backoff_max_ms: u64,
    pub subscribe_retry_ms: u64,
    pub flush_timeout_ms: u64,
}

impl Default for BridgeSection {
    fn default() -> Self {
        Self {
            channel_capacity: 100,
            backoff_initial_ms: 1_000,
            backoff_max_ms: 60_000,
            subscribe_retry_ms: 1_000,
            flush_timeout_ms: 500,
        }
    }
}

/// Whole config file
#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq)]
#[serde(default)]
pub struct GatewayConfig {
    pub broker: BrokerSection,
    pub bridge: BridgeSection,
}

impl GatewayConfig {
    /// Reads and parses a config file. A missing file yields the defaults.
    pub async fn load(path: &Path) -> Result<Self, ConfigError> {
        if !tokio::fs::try_exists(path).await? {
            info!("No config file at {}, using defaults", path.display());
            return Ok(Self::default());
        }
        let content = tokio::fs::read_to_string(path).await?;
        let config = Self::parse(&content)?;
        info!("Loaded config from {}", path.display());
        Ok(config)
    }

    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        let config: GatewayConfig = toml::from_str(content)?;
        debug!("Parsed config: {:?}", config.redacted());
        Ok(config)
    }

    /// Validates both sections
    pub fn validate(&self) -> Result<(EndpointConfig, BridgeSettings), ConfigError> {
        let endpoint = EndpointConfig::try_from(&self.broker)?;
        let settings = BridgeSettings::try_from(&self.bridge)?;
        Ok((endpoint, settings))
    }

    fn redacted(&self) -> Self {
        let mut copy = self.clone();
        if !copy.broker.password.is_empty() {
            copy.broker.password = "***".to_string();
        }
        copy
    }
}

/// Username/password pair. Only exists when a username was configured.
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"***")
            .finish()
    }
}

/// Validated broker endpoint
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EndpointConfig {
    pub host: String,
    pub port: u16,
    pub credentials: Option<Credentials>,
    pub topics: BTreeSet<String>,
    pub tls: bool,
    pub client_id: String,
    pub keep_alive: Duration,
}

impl EndpointConfig {
    pub fn is_anonymous(&self) -> bool {
        self.credentials.is_none()
    }
}

impl TryFrom<&BrokerSection> for EndpointConfig {
    type Error = ConfigError;

    fn try_from(section: &BrokerSection) -> Result<Self, Self::Error> {
        let host = section.host.trim();
        if host.is_empty() {
            return Err(ConfigError::InvalidHost);
        }
        if section.port == 0 {
            return Err(ConfigError::InvalidPort(section.port));
        }
        if section.client_id.is_empty() {
            return Err(ConfigError::InvalidSetting(
                "client_id",
                "must not be empty".to_string(),
            ));
        }
        if section.keep_alive_secs == 0 {
            return Err(ConfigError::InvalidSetting(
                "keep_alive_secs",
                "must be at least 1".to_string(),
            ));
        }

        let mut topics = BTreeSet::new();
        for topic in &section.topics {
            validate_topic(topic)?;
            topics.insert(topic.clone());
        }

        // An empty username means anonymous; the password is dropped with it.
        let credentials = if section.username.is_empty() {
            None
        } else {
            Some(Credentials {
                username: section.username.clone(),
                password: section.password.clone(),
            })
        };

        Ok(Self {
            host: host.to_string(),
            port: section.port,
            credentials,
            topics,
            tls: section.tls,
            client_id: section.client_id.clone(),
            keep_alive: Duration::from_secs(section.keep_alive_secs),
        })
    }
}

fn validate_topic(topic: &str) -> Result<(), ConfigError> {
    if topic.is_empty() {
        return Err(ConfigError::InvalidTopic(topic.to_string(), "empty topic"));
    }
    if topic.contains(['+', '#']) {
        return Err(ConfigError::InvalidTopic(
            topic.to_string(),
            "wildcards are not supported",
        ));
    }
    if topic.contains('\0') {
        return Err(ConfigError::InvalidTopic(
            topic.to_string(),
            "contains NUL character",
        ));
    }
    Ok(())
}

/// Validated runtime tuning for the bridge and its connection driver
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BridgeSettings {
    pub channel_capacity: usize,
    pub backoff_initial: Duration,
    pub backoff_max: Duration,
    pub subscribe_retry: Duration,
    pub flush_timeout: Duration,
}

impl Default for BridgeSettings {
    fn default() -> Self {
        // Defaults of the file section always validate
        Self::from_section_unchecked(&BridgeSection::default())
    }
}

impl BridgeSettings {
    fn from_section_unchecked(section: &BridgeSection) -> Self {
        Self {
            channel_capacity: section.channel_capacity,
            backoff_initial: Duration::from_millis(section.backoff_initial_ms),
            backoff_max: Duration::from_millis(section.backoff_max_ms),
            subscribe_retry: Duration::from_millis(section.subscribe_retry_ms),
            flush_timeout: Duration::from_millis(section.flush_timeout_ms),
        }
    }
}

impl TryFrom<&BridgeSection> for BridgeSettings {
    type Error = ConfigError;

    fn try_from(section: &BridgeSection) -> Result<Self, Self::Error> {
        if section.channel_capacity == 0 {
            return Err(ConfigError::InvalidSetting(
                "channel_capacity",
                "must be at least 1".to_string(),
            ));
        }
        if section.backoff_initial_ms == 0 {
            return Err(ConfigError::InvalidSetting(
                "backoff_initial_ms",
                "must be at least 1".to_string(),
            ));
        }
        if section.backoff_initial_ms > section.backoff_max_ms {
            return Err(ConfigError::InvalidSetting(
                "backoff_initial_ms",
                format!(
                    "{} exceeds backoff_max_ms {}",
                    section.backoff_initial_ms, section.backoff_max_ms
                ),
            ));
        }
        Ok(Self::from_section_unchecked(section))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let config = GatewayConfig::default();
        let (endpoint, settings) = config.validate().unwrap();
        assert_eq!(endpoint.host, "localhost");
        assert_eq!(endpoint.port, 1883);
        assert!(endpoint.topics.is_empty());
        assert!(endpoint.is_anonymous());
        assert_eq!(settings.backoff_initial, Duration::from_secs(1));
        assert_eq!(settings.backoff_max, Duration::from_secs(60));
    }

    #[test]
    fn empty_username_ignores_password() {
        let section = BrokerSection {
            username: String::new(),
            password: "secret".to_string(),
            ..Default::default()
        };
        let endpoint = EndpointConfig::try_from(&section).unwrap();
        assert_eq!(endpoint.credentials, None);
    }

    #[test]
    fn username_carries_password() {
        let section = BrokerSection {
            username: "mirror".to_string(),
            password: "secret".to_string(),
            ..Default::default()
        };
        let endpoint = EndpointConfig::try_from(&section).unwrap();
        let creds = endpoint.credentials.unwrap();
        assert_eq!(creds.username, "mirror");
        assert_eq!(creds.password, "secret");
    }

    #[test]
    fn parses_toml_and_dedups_topics() {
        let config = GatewayConfig::parse(
            r#"
[broker]
host = "broker.local"
port = 8883
tls = true
topics = ["temp", "humidity", "temp"]

[bridge]
channel_capacity = 10
"#,
        )
        .unwrap();
        let (endpoint, settings) = config.validate().unwrap();
        assert_eq!(endpoint.host, "broker.local");
        assert_eq!(endpoint.port, 8883);
        assert!(endpoint.tls);
        assert_eq!(
            endpoint.topics.into_iter().collect::<Vec<_>>(),
            vec!["humidity".to_string(), "temp".to_string()]
        );
        assert_eq!(settings.channel_capacity, 10);
        assert_eq!(settings.subscribe_retry, Duration::from_secs(1));
    }

    #[test]
    fn rejects_port_zero() {
        let section = BrokerSection {
            port: 0,
            ..Default::default()
        };
        assert!(matches!(
            EndpointConfig::try_from(&section),
            Err(ConfigError::InvalidPort(0))
        ));
    }

    #[test]
    fn rejects_out_of_range_port_at_parse_time() {
        let result = GatewayConfig::parse("[broker]\nport = 70000\n");
        assert!(matches!(result, Err(ConfigError::Parse(_))));
    }

    #[test]
    fn rejects_wildcard_and_empty_topics() {
        for topic in ["sensors/#", "sensors/+/temp", ""] {
            let section = BrokerSection {
                topics: vec![topic.to_string()],
                ..Default::default()
            };
            assert!(
                matches!(
                    EndpointConfig::try_from(&section),
                    Err(ConfigError::InvalidTopic(..))
                ),
                "topic {topic:?} should be rejected"
            );
        }
    }

    #[test]
    fn rejects_blank_host() {
        let section = BrokerSection {
            host: "  ".to_string(),
            ..Default::default()
        };
        assert!(matches!(
            EndpointConfig::try_from(&section),
            Err(ConfigError::InvalidHost)
        ));
    }

    #[test]
    fn rejects_inverted_backoff() {
        let section = BridgeSection {
            backoff_initial_ms: 5_000,
            backoff_max_ms: 1_000,
            ..Default::default()
        };
        assert!(BridgeSettings::try_from(&section).is_err());
    }

    #[tokio::test]
    async fn missing_file_yields_defaults() {
        let path = std::env::temp_dir().join("mqtt_bus_gateway_missing_config.toml");
        let _ = std::fs::remove_file(&path);
        let config = GatewayConfig::load(&path).await.unwrap();
        assert_eq!(config, GatewayConfig::default());
    }

    #[tokio::test]
    async fn loads_file_from_disk() {
        let path = std::env::temp_dir().join("mqtt_bus_gateway_test_config.toml");
        std::fs::write(&path, "[broker]\ntopics = [\"temp\"]\n").unwrap();
        let config = GatewayConfig::load(&path).await.unwrap();
        assert_eq!(config.broker.topics, vec!["temp".to_string()]);
        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn debug_output_hides_password() {
        let creds = Credentials {
            username: "u".to_string(),
            password: "hunter2".to_string(),
        };
        assert!(!format!("{creds:?}").contains("hunter2"));
    }
}
