//! CLI for mqtt-relay
//!
//! Connects the configured brokers, applies the startup subscriptions and
//! forwards every inbound message to the webhook dispatcher until Ctrl-C.

use std::sync::Arc;

use clap::Parser;
use tracing::{error, info, warn};

use mqtt_relay::broker::Supervisor;
use mqtt_relay::config::{Settings, load_config_from};
use mqtt_relay::persistence;
use mqtt_relay::stats::RelayStats;
use mqtt_relay::transport::mqtt::MqttTransportFactory;
use mqtt_relay::utils::logging;
use mqtt_relay::webhook::{DeliveryTarget, Dispatcher, Registry};

#[derive(Parser)]
#[command(name = "mqtt-relay", about = "Relay MQTT messages to HTTP webhooks")]
struct Cli {
    /// Configuration file, without extension
    #[arg(long, default_value = "config/default")]
    config: String,

    /// Overrides `logging.level`
    #[arg(long)]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() {
    if let Err(e) = dotenvy::dotenv() {
        if !e.not_found() {
            eprintln!("failed to read .env: {e}");
        }
    }

    let cli = Cli::parse();

    let settings = match load_config_from(&cli.config) {
        Ok(settings) => settings,
        Err(e) => {
            eprintln!("failed to load configuration: {e}");
            std::process::exit(1);
        }
    };

    logging::init(cli.log_level.as_deref().unwrap_or(&settings.logging.level));

    if let Err(e) = run(settings).await {
        error!("relay failed: {}", e);
        std::process::exit(1);
    }
}

async fn run(settings: Settings) -> Result<(), Box<dyn std::error::Error>> {
    settings.validate()?;

    let store = persistence::open(&settings.storage)?;
    store.ping().await?;
    let stats = Arc::new(RelayStats::new());

    let registry = Registry::new(store.clone());
    let global = DeliveryTarget::global(&settings.webhook)?;
    let dispatcher = Dispatcher::start(registry, global, stats.clone())?;

    let supervisor = Supervisor::new(
        &settings,
        Arc::new(MqttTransportFactory),
        Some(store),
        stats.clone(),
    );

    match supervisor.connect("").await {
        Ok(session) => info!(broker = %session.name(), "connected"),
        Err(e) => warn!(error = %e, "default broker unavailable, will retry on demand"),
    }

    for subscription in &settings.subscriptions {
        let broker = subscription.broker.as_deref().unwrap_or("");
        if let Err(e) = supervisor
            .subscribe(
                broker,
                &subscription.topic,
                subscription.qos,
                dispatcher.handler(),
            )
            .await
        {
            error!(topic = %subscription.topic, error = %e, "startup subscription failed");
        }
    }

    info!("relay running, press Ctrl-C to stop");
    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received. Exiting gracefully.");

    dispatcher
        .shutdown(settings.dispatch.drain_timeout())
        .await;
    supervisor.shutdown().await;

    let snapshot = stats.snapshot();
    info!(
        published = snapshot.messages_published,
        received = snapshot.messages_received,
        delivered = snapshot.webhook_deliveries,
        failed = snapshot.webhook_failures,
        "relay stopped"
    );
    Ok(())
}
