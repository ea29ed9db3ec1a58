//! The `config` module loads relay settings from an optional file and the
//! environment.
//!
//! Environment variables use the `RELAY` prefix and `__` as the nesting
//! separator, e.g. `RELAY__BROKERS__LOCAL__HOST=broker.example`.

mod settings;

use config::{Config, ConfigError, Environment, File};

pub use settings::{
    BrokerEndpoint, Credentials, DispatchSettings, LoggingSettings, PartialBrokerEndpoint,
    PartialSettings, Settings, StartupSubscription, StorageBackend, StorageSettings, TlsOptions,
    WebhookSettings, DEFAULT_BROKER_NAME,
};

/// Loads the configuration from `config/default` and environment variables.
pub fn load_config() -> Result<Settings, ConfigError> {
    load_config_from("config/default")
}

/// Loads the configuration from the given base file (any extension the
/// `config` crate recognizes, optional) plus environment variables, and
/// merges it over the default values.
pub fn load_config_from(file: &str) -> Result<Settings, ConfigError> {
    let builder = Config::builder()
        .add_source(File::with_name(file).required(false))
        .add_source(
            Environment::with_prefix("RELAY")
                .separator("__")
                .try_parsing(true),
        );

    let config = builder.build()?;

    // Try to deserialize what is available
    let partial: PartialSettings = config.try_deserialize()?;

    Ok(merge(partial))
}

/// Merges partially specified settings over [`Settings::default`].
pub fn merge(partial: PartialSettings) -> Settings {
    let default = Settings::default();

    let brokers = match partial.brokers {
        Some(brokers) if !brokers.is_empty() => brokers
            .into_iter()
            .map(|(name, endpoint)| {
                let endpoint = BrokerEndpoint::from_partial(&name, endpoint);
                (name, endpoint)
            })
            .collect(),
        _ => default.brokers,
    };

    // With a custom broker set and no explicit default, a lone broker is the
    // obvious default.
    let default_connection = match partial.default_connection {
        Some(name) => name,
        None if brokers.len() == 1 && !brokers.contains_key(&default.default_connection) => {
            brokers
                .keys()
                .next()
                .cloned()
                .unwrap_or(default.default_connection)
        }
        None => default.default_connection,
    };

    let storage = partial.storage.unwrap_or_default();
    let webhook = partial.webhook.unwrap_or_default();

    Settings {
        default_connection,
        brokers,
        storage: StorageSettings {
            backend: storage.backend.unwrap_or(default.storage.backend),
            sqlite_path: storage.sqlite_path.unwrap_or(default.storage.sqlite_path),
            sled_path: storage.sled_path.unwrap_or(default.storage.sled_path),
        },
        webhook: WebhookSettings {
            enabled: webhook.enabled.unwrap_or(default.webhook.enabled),
            url: webhook.url.unwrap_or(default.webhook.url),
            method: webhook.method.unwrap_or(default.webhook.method),
            timeout_secs: webhook.timeout_secs.unwrap_or(default.webhook.timeout_secs),
            retry_count: webhook.retry_count.unwrap_or(default.webhook.retry_count),
            retry_delay_secs: webhook
                .retry_delay_secs
                .unwrap_or(default.webhook.retry_delay_secs),
        },
        dispatch: DispatchSettings {
            drain_timeout_secs: partial
                .dispatch
                .and_then(|d| d.drain_timeout_secs)
                .or(default.dispatch.drain_timeout_secs),
        },
        subscriptions: partial.subscriptions.unwrap_or(default.subscriptions),
        logging: LoggingSettings {
            level: partial
                .logging
                .and_then(|l| l.level)
                .unwrap_or(default.logging.level),
        },
    }
}
