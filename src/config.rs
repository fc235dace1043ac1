//! # Link configuration
//!
//! A single TOML file describes the broker connection, the assigned production
//! line, reconnect tuning, command defaults and the subscription set:
//!
//! ```toml
//! [mqtt]
//! endpoint = "broker.factory.example"
//! port = 8883
//! client_id = "line-b7-gateway"
//! ca = "certs/root-CA.crt"
//! cert = "certs/gateway.cert.pem"
//! key = "certs/gateway.private.key"
//!
//! [factory]
//! assigned_line = "B7"
//! machine_types = ["press", "lathe"]
//!
//! [reconnect]
//! base_delay_ms = 1000
//! max_delay_ms = 60000
//!
//! [[subscriptions]]
//! filter = "factory/+/+/telemetry"
//! qos = "at-least-once"
//! ```
//!
//! Relative credential paths are resolved against the directory of the file.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info};

use crate::dispatcher::DispatcherSettings;
use crate::model::{QualityOfService, Subscription};
use crate::session::mqtt::MqttSettings;
use crate::session::TlsCredentials;
use crate::supervisor::BackoffPolicy;
use crate::topic::{Category, FilterError, TopicFilter, ROOT_SEGMENT};

const CONFIG_DIR: &str = "factory-link";
const CONFIG_FILE: &str = "config.toml";
const MAX_COMMAND_TIMEOUT_MS: u64 = 3_600_000;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse configuration: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(String),

    #[error("Invalid subscription filter: {0}")]
    Filter(#[from] FilterError),

    #[error("No configuration directory on this platform")]
    NoConfigDir,
}

#[derive(Deserialize, Serialize, Clone, Copy, Debug, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    /// MQTT over TLS with client certificates.
    #[default]
    Mqtts,
    Mqtt,
    Tcp,
}

impl Protocol {
    pub fn uses_tls(&self) -> bool {
        matches!(self, Protocol::Mqtts)
    }
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct MqttConfig {
    pub endpoint: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default)]
    pub protocol: Protocol,
    pub client_id: String,
    pub ca: Option<PathBuf>,
    pub cert: Option<PathBuf>,
    pub key: Option<PathBuf>,
    #[serde(default = "default_keep_alive_secs")]
    pub keep_alive_secs: u64,
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
    #[serde(default = "default_request_capacity")]
    pub request_capacity: usize,
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct FactorySection {
    pub assigned_line: String,
    #[serde(default)]
    pub machine_types: Vec<String>,
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct ReconnectConfig {
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    #[serde(default = "default_jitter_ratio")]
    pub jitter_ratio: f64,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            jitter_ratio: default_jitter_ratio(),
        }
    }
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct CommandConfig {
    #[serde(default = "default_command_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default)]
    pub qos: QualityOfService,
}

impl Default for CommandConfig {
    fn default() -> Self {
        Self {
            timeout_ms: default_command_timeout_ms(),
            qos: QualityOfService::default(),
        }
    }
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct SubscriptionConfig {
    pub filter: String,
    #[serde(default)]
    pub qos: QualityOfService,
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct FactoryConfig {
    pub mqtt: MqttConfig,
    pub factory: FactorySection,
    #[serde(default)]
    pub reconnect: ReconnectConfig,
    #[serde(default)]
    pub commands: CommandConfig,
    #[serde(default)]
    pub subscriptions: Vec<SubscriptionConfig>,
}

fn default_port() -> u16 {
    8883
}
fn default_keep_alive_secs() -> u64 {
    60
}
fn default_connect_timeout_secs() -> u64 {
    10
}
fn default_request_capacity() -> usize {
    100
}
fn default_base_delay_ms() -> u64 {
    1_000
}
fn default_max_delay_ms() -> u64 {
    60_000
}
fn default_jitter_ratio() -> f64 {
    0.1
}
fn default_command_timeout_ms() -> u64 {
    5_000
}

impl FactoryConfig {
    /// `<config dir>/factory-link/config.toml`
    pub fn default_path() -> Result<PathBuf, ConfigError> {
        dirs::config_dir()
            .map(|dir| dir.join(CONFIG_DIR).join(CONFIG_FILE))
            .ok_or(ConfigError::NoConfigDir)
    }

    /// Parses and validates a configuration. Credential paths are left as
    /// written.
    pub fn from_toml(raw: &str) -> Result<Self, ConfigError> {
        let config: FactoryConfig = toml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    pub async fn load(path: &Path) -> Result<Self, ConfigError> {
        info!("Loading configuration from {}", path.display());
        let raw = tokio::fs::read_to_string(path)
            .await
            .map_err(|source| ConfigError::Read {
                path: path.to_path_buf(),
                source,
            })?;

        let mut config = Self::from_toml(&raw)?;
        if let Some(base) = path.parent() {
            config.resolve_paths(base);
        }
        debug!("Loaded configuration: {:?}", config);
        Ok(config)
    }

    fn resolve_paths(&mut self, base: &Path) {
        for path in [&mut self.mqtt.ca, &mut self.mqtt.cert, &mut self.mqtt.key]
            .into_iter()
            .flatten()
        {
            if path.is_relative() {
                *path = base.join(&*path);
            }
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |reason: &str| Err(ConfigError::Invalid(reason.to_string()));

        if self.mqtt.endpoint.trim().is_empty() {
            return invalid("mqtt.endpoint must not be empty");
        }
        if self.mqtt.port == 0 {
            return invalid("mqtt.port must not be 0");
        }
        if self.mqtt.client_id.trim().is_empty() {
            return invalid("mqtt.client_id must not be empty");
        }
        if self.mqtt.protocol.uses_tls()
            && (self.mqtt.ca.is_none() || self.mqtt.cert.is_none() || self.mqtt.key.is_none())
        {
            return invalid("mqtts requires mqtt.ca, mqtt.cert and mqtt.key");
        }
        if self.mqtt.connect_timeout_secs == 0 || self.mqtt.request_capacity == 0 {
            return invalid("mqtt.connect_timeout_secs and mqtt.request_capacity must be positive");
        }
        if self.factory.assigned_line.trim().is_empty() {
            return invalid("factory.assigned_line must not be empty");
        }
        if self
            .factory
            .assigned_line
            .contains(|c: char| matches!(c, '/' | '+' | '#'))
        {
            return invalid("factory.assigned_line must be a single topic level");
        }
        if self.reconnect.base_delay_ms == 0 || self.commands.timeout_ms == 0 {
            return invalid("reconnect.base_delay_ms and commands.timeout_ms must be positive");
        }
        if self.commands.timeout_ms > MAX_COMMAND_TIMEOUT_MS {
            return invalid("commands.timeout_ms must not exceed one hour");
        }
        if self.reconnect.base_delay_ms > self.reconnect.max_delay_ms {
            return invalid("reconnect.base_delay_ms must not exceed reconnect.max_delay_ms");
        }
        if !(0.0..=1.0).contains(&self.reconnect.jitter_ratio) {
            return invalid("reconnect.jitter_ratio must be within [0, 1]");
        }

        self.subscriptions()?;
        Ok(())
    }

    /// Configured subscription set, or the default set when none is listed:
    /// telemetry and state of every machine plus acknowledgements from the
    /// assigned line.
    pub fn subscriptions(&self) -> Result<Vec<Subscription>, ConfigError> {
        if self.subscriptions.is_empty() {
            let qos = QualityOfService::AtLeastOnce;
            let acks = format!(
                "{}/{}/+/{}",
                ROOT_SEGMENT,
                self.factory.assigned_line,
                Category::CommandAck.as_str()
            );
            return [
                Category::Telemetry.any_machine_filter(),
                Category::State.any_machine_filter(),
                acks,
            ]
            .iter()
            .map(|raw| subscription(raw, qos))
            .collect();
        }

        self.subscriptions
            .iter()
            .map(|entry| subscription(&entry.filter, entry.qos))
            .collect()
    }

    pub fn session_settings(&self) -> MqttSettings {
        MqttSettings {
            endpoint: self.mqtt.endpoint.clone(),
            port: self.mqtt.port,
            client_id: self.mqtt.client_id.clone(),
            tls: self.mqtt.protocol.uses_tls(),
            keep_alive: Duration::from_secs(self.mqtt.keep_alive_secs),
            connect_timeout: Duration::from_secs(self.mqtt.connect_timeout_secs),
            request_capacity: self.mqtt.request_capacity,
        }
    }

    pub fn backoff_policy(&self) -> BackoffPolicy {
        BackoffPolicy::new(
            Duration::from_millis(self.reconnect.base_delay_ms),
            Duration::from_millis(self.reconnect.max_delay_ms),
            self.reconnect.jitter_ratio,
        )
        .seeded_from(&self.mqtt.client_id)
    }

    pub fn dispatcher_settings(&self) -> DispatcherSettings {
        DispatcherSettings {
            client_id: self.mqtt.client_id.clone(),
            default_timeout: Duration::from_millis(self.commands.timeout_ms),
            qos: self.commands.qos,
        }
    }

    /// Reads the PEM files. Plain TCP connections get empty credentials.
    pub async fn load_credentials(&self) -> Result<TlsCredentials, ConfigError> {
        Ok(TlsCredentials {
            ca: read_optional(self.mqtt.ca.as_deref()).await?,
            cert: read_optional(self.mqtt.cert.as_deref()).await?,
            key: read_optional(self.mqtt.key.as_deref()).await?,
        })
    }
}

fn subscription(raw: &str, qos: QualityOfService) -> Result<Subscription, ConfigError> {
    Ok(Subscription::new(TopicFilter::parse(raw)?, qos))
}

async fn read_optional(path: Option<&Path>) -> Result<Vec<u8>, ConfigError> {
    match path {
        Some(path) => tokio::fs::read(path)
            .await
            .map_err(|source| ConfigError::Read {
                path: path.to_path_buf(),
                source,
            }),
        None => Ok(Vec::new()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"
        [mqtt]
        endpoint = "broker.factory.example"
        client_id = "line-b7-gateway"
        ca = "certs/root-CA.crt"
        cert = "certs/gateway.cert.pem"
        key = "certs/gateway.private.key"

        [factory]
        assigned_line = "B7"
    "#;

    #[test]
    fn minimal_config_uses_defaults() {
        let config = FactoryConfig::from_toml(MINIMAL).unwrap();
        assert_eq!(config.mqtt.port, 8883);
        assert_eq!(config.mqtt.protocol, Protocol::Mqtts);
        assert_eq!(config.mqtt.keep_alive_secs, 60);
        assert_eq!(config.reconnect, ReconnectConfig::default());
        assert_eq!(config.commands.timeout_ms, 5_000);

        let filters: Vec<String> = config
            .subscriptions()
            .unwrap()
            .iter()
            .map(|subscription| subscription.filter.to_string())
            .collect();
        assert_eq!(
            filters,
            vec![
                "factory/+/+/telemetry",
                "factory/+/+/state",
                "factory/B7/+/command-ack"
            ]
        );

        let settings = config.session_settings();
        assert!(settings.tls);
        assert_eq!(settings.connect_timeout, Duration::from_secs(10));
        assert_eq!(config.backoff_policy().ceiling(0), Duration::from_secs(1));
    }

    #[test]
    fn explicit_subscriptions_replace_defaults() {
        let raw = format!(
            "{MINIMAL}\n[[subscriptions]]\nfilter = \"factory/B7/#\"\nqos = \"exactly-once\"\n"
        );
        let config = FactoryConfig::from_toml(&raw).unwrap();
        let subscriptions = config.subscriptions().unwrap();
        assert_eq!(subscriptions.len(), 1);
        assert_eq!(subscriptions[0].qos, QualityOfService::ExactlyOnce);
    }

    #[test]
    fn malformed_subscription_filter_is_fatal() {
        let raw = format!("{MINIMAL}\n[[subscriptions]]\nfilter = \"factory/#/state\"\n");
        let err = FactoryConfig::from_toml(&raw).unwrap_err();
        assert!(matches!(
            err,
            ConfigError::Filter(FilterError::MultiLevelNotTerminal { .. })
        ));
    }

    #[test]
    fn invalid_values_are_rejected() {
        let inverted = format!("{MINIMAL}\n[reconnect]\nbase_delay_ms = 5000\nmax_delay_ms = 100\n");
        assert!(matches!(
            FactoryConfig::from_toml(&inverted),
            Err(ConfigError::Invalid(_))
        ));

        let endless = format!("{MINIMAL}\n[commands]\ntimeout_ms = {}\n", u64::MAX);
        assert!(matches!(
            FactoryConfig::from_toml(&endless),
            Err(ConfigError::Invalid(_))
        ));

        let jitter = format!("{MINIMAL}\n[reconnect]\njitter_ratio = 1.5\n");
        assert!(matches!(
            FactoryConfig::from_toml(&jitter),
            Err(ConfigError::Invalid(_))
        ));

        let no_line = MINIMAL.replace("assigned_line = \"B7\"", "assigned_line = \"\"");
        assert!(matches!(
            FactoryConfig::from_toml(&no_line),
            Err(ConfigError::Invalid(_))
        ));

        let no_key = MINIMAL.replace("key = \"certs/gateway.private.key\"", "");
        assert!(matches!(
            FactoryConfig::from_toml(&no_key),
            Err(ConfigError::Invalid(_))
        ));

        let protocol = MINIMAL.replace(
            "client_id = \"line-b7-gateway\"",
            "client_id = \"line-b7-gateway\"\nprotocol = \"websocket\"",
        );
        assert!(matches!(
            FactoryConfig::from_toml(&protocol),
            Err(ConfigError::Parse(_))
        ));
    }

    #[test]
    fn plain_tcp_needs_no_credentials() {
        let raw = r#"
            [mqtt]
            endpoint = "localhost"
            port = 1883
            protocol = "tcp"
            client_id = "bench"

            [factory]
            assigned_line = "L1"
        "#;
        let config = FactoryConfig::from_toml(raw).unwrap();
        assert!(!config.session_settings().tls);
    }

    #[tokio::test]
    async fn load_resolves_credentials_next_to_the_file() {
        let dir = tempfile::tempdir().unwrap();
        let certs = dir.path().join("certs");
        tokio::fs::create_dir_all(&certs).await.unwrap();
        tokio::fs::write(certs.join("root-CA.crt"), b"ca").await.unwrap();
        tokio::fs::write(certs.join("gateway.cert.pem"), b"cert").await.unwrap();
        tokio::fs::write(certs.join("gateway.private.key"), b"key").await.unwrap();

        let path = dir.path().join("config.toml");
        tokio::fs::write(&path, MINIMAL).await.unwrap();

        let config = FactoryConfig::load(&path).await.unwrap();
        assert_eq!(config.mqtt.ca, Some(certs.join("root-CA.crt")));

        let credentials = config.load_credentials().await.unwrap();
        assert_eq!(credentials.ca, b"ca");
        assert_eq!(credentials.cert, b"cert");
        assert_eq!(credentials.key, b"key");
    }

    #[tokio::test]
    async fn missing_file_reports_its_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("absent.toml");
        match FactoryConfig::load(&path).await {
            Err(ConfigError::Read { path: reported, .. }) => assert_eq!(reported, path),
            other => panic!("expected a read error, got {other:?}"),
        }
    }
}
