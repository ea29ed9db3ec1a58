use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use futures::future::join_all;
use serde::Serialize;
use tokio::sync::RwLock;
use tracing::{info, warn};

use crate::broker::message::{Payload, QoS};
use crate::broker::session::{ClientSession, MessageHandler};
use crate::config::{BrokerEndpoint, Settings};
use crate::persistence::Store;
use crate::stats::RelayStats;
use crate::transport::TransportFactory;
use crate::utils::{RelayError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OverallStatus {
    Ok,
    Partial,
    NoClients,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BrokerStatus {
    pub connected: bool,
    pub subscriptions: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RelayStatus {
    pub status: OverallStatus,
    pub brokers: BTreeMap<String, BrokerStatus>,
}

/// Owns one [`ClientSession`] per named broker endpoint.
///
/// Sessions are created lazily on first use and at most once per name.
pub struct Supervisor {
    endpoints: HashMap<String, BrokerEndpoint>,
    default_connection: String,
    sessions: RwLock<HashMap<String, Arc<ClientSession>>>,
    factory: Arc<dyn TransportFactory>,
    store: Option<Arc<dyn Store>>,
    stats: Arc<RelayStats>,
}

impl Supervisor {
    pub fn new(
        settings: &Settings,
        factory: Arc<dyn TransportFactory>,
        store: Option<Arc<dyn Store>>,
        stats: Arc<RelayStats>,
    ) -> Self {
        Self {
            endpoints: settings.brokers.clone(),
            default_connection: settings.default_connection.clone(),
            sessions: RwLock::new(HashMap::new()),
            factory,
            store,
            stats,
        }
    }

    /// Maps an empty name to the default connection.
    pub fn resolve<'a>(&'a self, name: &'a str) -> &'a str {
        if name.is_empty() {
            &self.default_connection
        } else {
            name
        }
    }

    /// Returns the session for `name`, creating it on first access.
    pub async fn get_or_create(&self, name: &str) -> Result<Arc<ClientSession>> {
        let name = self.resolve(name);

        if let Some(session) = self.sessions.read().await.get(name) {
            return Ok(session.clone());
        }

        let mut sessions = self.sessions.write().await;
        // Another task may have created it while we waited for the lock.
        if let Some(session) = sessions.get(name) {
            return Ok(session.clone());
        }

        let endpoint = self.endpoints.get(name).cloned().ok_or_else(|| {
            RelayError::Configuration(format!("broker '{name}' is not configured"))
        })?;
        let session = ClientSession::start(
            endpoint,
            self.factory.as_ref(),
            self.store.clone(),
            self.stats.clone(),
        )?;
        sessions.insert(name.to_string(), session.clone());
        info!(broker = %name, "session created");
        Ok(session)
    }

    /// Get-or-create, then connect if needed.
    pub async fn connect(&self, name: &str) -> Result<Arc<ClientSession>> {
        let session = self.get_or_create(name).await?;
        session.connect().await?;
        Ok(session)
    }

    pub async fn publish(
        &self,
        name: &str,
        topic: &str,
        qos: QoS,
        retained: bool,
        payload: impl Into<Payload>,
    ) -> Result<()> {
        let session = self.connect(name).await?;
        session.publish(topic, qos, retained, payload).await
    }

    pub async fn subscribe(
        &self,
        name: &str,
        filter: &str,
        qos: QoS,
        handler: MessageHandler,
    ) -> Result<()> {
        let session = self.connect(name).await?;
        session.subscribe(filter, qos, handler).await
    }

    pub async fn unsubscribe(&self, name: &str, filter: &str) -> Result<()> {
        let session = self.get_or_create(name).await?;
        session.unsubscribe(filter).await
    }

    pub async fn sessions(&self) -> Vec<Arc<ClientSession>> {
        self.sessions.read().await.values().cloned().collect()
    }

    /// Per-broker connection and subscription report.
    pub async fn status(&self) -> RelayStatus {
        let sessions = self.sessions().await;
        let brokers: BTreeMap<String, BrokerStatus> = sessions
            .iter()
            .map(|session| {
                (
                    session.name().to_string(),
                    BrokerStatus {
                        connected: session.is_connected(),
                        subscriptions: session.subscriptions(),
                    },
                )
            })
            .collect();

        let status = if brokers.is_empty() {
            OverallStatus::NoClients
        } else if brokers.values().all(|b| b.connected) {
            OverallStatus::Ok
        } else {
            OverallStatus::Partial
        };
        RelayStatus { status, brokers }
    }

    /// Disconnects every session concurrently.
    pub async fn shutdown(&self) {
        let sessions = self.sessions().await;
        let results = join_all(sessions.iter().map(|session| session.disconnect())).await;
        for (session, result) in sessions.iter().zip(results) {
            if let Err(err) = result {
                warn!(broker = %session.name(), error = %err, "disconnect failed");
            }
        }
        info!(count = sessions.len(), "all sessions disconnected");
    }
}

impl std::fmt::Debug for Supervisor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Supervisor")
            .field("default_connection", &self.default_connection)
            .field("endpoints", &self.endpoints.keys().collect::<Vec<_>>())
            .finish()
    }
}
