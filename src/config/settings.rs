use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

use crate::broker::message::QoS;
use crate::utils::{RelayError, Result};

pub const DEFAULT_BROKER_NAME: &str = "local";
pub const DEFAULT_MQTT_PORT: u16 = 1883;
pub const DEFAULT_KEEP_ALIVE_SECS: u64 = 30;
pub const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 10;

/// Top-level configuration settings for the relay.
///
/// Covers the broker endpoints, the outbox backend, the global webhook
/// target, the dispatcher's shutdown policy, startup subscriptions and
/// logging.
#[derive(Debug, Clone)]
pub struct Settings {
    /// Broker used when an operation names no broker.
    pub default_connection: String,
    pub brokers: HashMap<String, BrokerEndpoint>,
    pub storage: StorageSettings,
    pub webhook: WebhookSettings,
    pub dispatch: DispatchSettings,
    pub subscriptions: Vec<StartupSubscription>,
    pub logging: LoggingSettings,
}

/// Immutable description of one MQTT broker connection.
#[derive(Debug, Clone, PartialEq)]
pub struct BrokerEndpoint {
    /// Name the endpoint is registered under.
    pub name: String,
    pub host: String,
    pub port: u16,
    pub client_id: String,
    pub clean_session: bool,
    pub keep_alive_secs: u64,
    pub connect_timeout_secs: u64,
    pub tls: Option<TlsOptions>,
    pub credentials: Option<Credentials>,
}

/// TLS options for a broker endpoint.
///
/// Without a CA file the platform roots are used. `verify_peer = false`
/// disables certificate verification entirely.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct TlsOptions {
    #[serde(default)]
    pub ca_file: Option<PathBuf>,
    #[serde(default = "default_true")]
    pub verify_peer: bool,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Credentials {
    pub username: String,
    #[serde(default)]
    pub password: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    Sqlite,
    Sled,
}

/// Outbox/webhook store selection.
#[derive(Debug, Clone, PartialEq)]
pub struct StorageSettings {
    pub backend: StorageBackend,
    pub sqlite_path: PathBuf,
    pub sled_path: PathBuf,
}

/// The statically configured global webhook target.
#[derive(Debug, Clone, PartialEq)]
pub struct WebhookSettings {
    pub enabled: bool,
    pub url: String,
    pub method: String,
    pub timeout_secs: u64,
    pub retry_count: u32,
    pub retry_delay_secs: u64,
}

/// Disabled, POST, 10s timeout, 3 retries 5s apart.
impl Default for WebhookSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            url: String::new(),
            method: "POST".to_string(),
            timeout_secs: 10,
            retry_count: 3,
            retry_delay_secs: 5,
        }
    }
}

/// Shutdown policy of the dispatch engine.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DispatchSettings {
    /// Upper bound on waiting for in-flight deliveries at shutdown. `None`
    /// waits for every attempt that is already on the wire.
    pub drain_timeout_secs: Option<u64>,
}

impl DispatchSettings {
    pub fn drain_timeout(&self) -> Option<Duration> {
        self.drain_timeout_secs.map(Duration::from_secs)
    }
}

/// A subscription the binary establishes at startup.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct StartupSubscription {
    /// Broker name; the default connection when absent.
    #[serde(default)]
    pub broker: Option<String>,
    pub topic: String,
    #[serde(default)]
    pub qos: QoS,
}

#[derive(Debug, Clone, PartialEq)]
pub struct LoggingSettings {
    pub level: String,
}

fn default_true() -> bool {
    true
}

/// Partial configuration settings loaded from files or environment.
///
/// Missing values are filled from [`Settings::default`].
#[derive(Debug, Default, Deserialize)]
pub struct PartialSettings {
    pub default_connection: Option<String>,
    pub brokers: Option<HashMap<String, PartialBrokerEndpoint>>,
    pub storage: Option<PartialStorageSettings>,
    pub webhook: Option<PartialWebhookSettings>,
    pub dispatch: Option<PartialDispatchSettings>,
    pub subscriptions: Option<Vec<StartupSubscription>>,
    pub logging: Option<PartialLoggingSettings>,
}

#[derive(Debug, Default, Deserialize)]
pub struct PartialBrokerEndpoint {
    pub host: Option<String>,
    pub port: Option<u16>,
    pub client_id: Option<String>,
    pub clean_session: Option<bool>,
    pub keep_alive_secs: Option<u64>,
    pub connect_timeout_secs: Option<u64>,
    pub tls: Option<TlsOptions>,
    pub credentials: Option<Credentials>,
}

#[derive(Debug, Default, Deserialize)]
pub struct PartialStorageSettings {
    pub backend: Option<StorageBackend>,
    pub sqlite_path: Option<PathBuf>,
    pub sled_path: Option<PathBuf>,
}

#[derive(Debug, Default, Deserialize)]
pub struct PartialWebhookSettings {
    pub enabled: Option<bool>,
    pub url: Option<String>,
    pub method: Option<String>,
    pub timeout_secs: Option<u64>,
    pub retry_count: Option<u32>,
    pub retry_delay_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
pub struct PartialDispatchSettings {
    pub drain_timeout_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
pub struct PartialLoggingSettings {
    pub level: Option<String>,
}

impl BrokerEndpoint {
    /// An endpoint on `localhost:1883` with a client id derived from `name`.
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            host: "localhost".to_string(),
            port: DEFAULT_MQTT_PORT,
            client_id: format!("mqtt-relay-{name}"),
            clean_session: true,
            keep_alive_secs: DEFAULT_KEEP_ALIVE_SECS,
            connect_timeout_secs: DEFAULT_CONNECT_TIMEOUT_SECS,
            tls: None,
            credentials: None,
        }
    }

    pub fn from_partial(name: &str, partial: PartialBrokerEndpoint) -> Self {
        let default = Self::new(name);
        Self {
            name: name.to_string(),
            host: partial.host.unwrap_or(default.host),
            port: partial.port.unwrap_or(default.port),
            client_id: partial.client_id.unwrap_or(default.client_id),
            clean_session: partial.clean_session.unwrap_or(default.clean_session),
            keep_alive_secs: partial.keep_alive_secs.unwrap_or(default.keep_alive_secs),
            connect_timeout_secs: partial
                .connect_timeout_secs
                .unwrap_or(default.connect_timeout_secs),
            tls: partial.tls,
            credentials: partial.credentials,
        }
    }

    pub fn keep_alive(&self) -> Duration {
        Duration::from_secs(self.keep_alive_secs)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn validate(&self) -> Result<()> {
        let invalid = |field: &str| {
            RelayError::Configuration(format!("broker '{}': {field}", self.name))
        };
        if self.host.trim().is_empty() {
            return Err(invalid("host is required"));
        }
        if self.port == 0 {
            return Err(invalid("port must be non-zero"));
        }
        if self.client_id.trim().is_empty() {
            return Err(invalid("client_id is required"));
        }
        if self.connect_timeout_secs == 0 {
            return Err(invalid("connect_timeout_secs must be positive"));
        }
        if let Some(ca_file) = self.tls.as_ref().and_then(|t| t.ca_file.as_ref()) {
            if !ca_file.is_file() {
                return Err(invalid(&format!(
                    "ca_file '{}' does not exist",
                    ca_file.display()
                )));
            }
        }
        Ok(())
    }
}

impl Settings {
    /// Fatal-at-startup checks over the merged settings.
    pub fn validate(&self) -> Result<()> {
        if self.brokers.is_empty() {
            return Err(RelayError::Configuration(
                "at least one broker must be configured".to_string(),
            ));
        }
        if !self.brokers.contains_key(&self.default_connection) {
            return Err(RelayError::Configuration(format!(
                "default connection '{}' is not a configured broker",
                self.default_connection
            )));
        }
        for endpoint in self.brokers.values() {
            endpoint.validate()?;
        }
        if self.webhook.enabled && self.webhook.url.trim().is_empty() {
            return Err(RelayError::Configuration(
                "global webhook is enabled but has no url".to_string(),
            ));
        }
        for subscription in &self.subscriptions {
            let broker = subscription
                .broker
                .as_deref()
                .unwrap_or(&self.default_connection);
            if !self.brokers.contains_key(broker) {
                return Err(RelayError::Configuration(format!(
                    "subscription '{}' names unknown broker '{broker}'",
                    subscription.topic
                )));
            }
        }
        Ok(())
    }
}

/// Provides default values for `Settings`.
///
/// A single `local` broker on `localhost:1883`, the SQLite outbox and a
/// disabled global webhook.
impl Default for Settings {
    fn default() -> Self {
        let mut brokers = HashMap::new();
        brokers.insert(
            DEFAULT_BROKER_NAME.to_string(),
            BrokerEndpoint::new(DEFAULT_BROKER_NAME),
        );
        Self {
            default_connection: DEFAULT_BROKER_NAME.to_string(),
            brokers,
            storage: StorageSettings {
                backend: StorageBackend::Sqlite,
                sqlite_path: PathBuf::from("mqtt-messages.db"),
                sled_path: PathBuf::from("mqtt-outbox"),
            },
            webhook: WebhookSettings::default(),
            dispatch: DispatchSettings::default(),
            subscriptions: Vec::new(),
            logging: LoggingSettings {
                level: "info".to_string(),
            },
        }
    }
}
