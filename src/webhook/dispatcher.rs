use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use reqwest::header::{CONTENT_TYPE, HeaderMap, HeaderName, HeaderValue, USER_AGENT};
use reqwest::{Client, Method};
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

use super::model::WebhookDefinition;
use super::registry::Registry;
use crate::broker::message::{InboundMessage, QoS};
use crate::broker::session::MessageHandler;
use crate::config::WebhookSettings;
use crate::persistence::{STORE_DEADLINE, with_deadline};
use crate::stats::RelayStats;
use crate::utils::{RelayError, Result};

/// Identifies the relay to webhook receivers.
pub const RELAY_USER_AGENT: &str = "mqtt-relay";

/// Why a single delivery attempt failed.
#[derive(Debug, Error)]
pub enum DeliveryError {
    #[error("target responded with status {0}")]
    Status(u16),

    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
}

/// Body POSTed to every target for one inbound message.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Envelope {
    pub topic: String,
    /// The payload parsed as JSON when possible, otherwise as text.
    pub payload: Value,
    pub qos: QoS,
    pub timestamp: DateTime<Utc>,
    pub broker: String,
}

impl Envelope {
    pub fn from_message(message: &InboundMessage) -> Self {
        let payload = serde_json::from_slice(&message.payload).unwrap_or_else(|_| {
            Value::String(String::from_utf8_lossy(&message.payload).into_owned())
        });
        Self {
            topic: message.topic.clone(),
            payload,
            qos: message.qos,
            timestamp: message.received_at,
            broker: message.broker.clone(),
        }
    }
}

/// Where and how to deliver: either a stored webhook or the global target.
#[derive(Debug, Clone)]
pub struct DeliveryTarget {
    pub name: String,
    pub url: String,
    pub method: Method,
    pub headers: HeaderMap,
    pub timeout: Duration,
    pub retry_count: u32,
    pub retry_delay: Duration,
}

/// Custom headers first, then the two reserved ones so they always win.
fn build_headers(target: &str, custom: &HashMap<String, String>) -> HeaderMap {
    let mut headers = HeaderMap::new();
    for (name, value) in custom {
        let Ok(header_name) = HeaderName::from_bytes(name.as_bytes()) else {
            warn!(webhook = target, header = %name, "skipping invalid header name");
            continue;
        };
        if header_name == CONTENT_TYPE || header_name == USER_AGENT {
            continue;
        }
        match HeaderValue::from_str(value) {
            Ok(header_value) => {
                headers.insert(header_name, header_value);
            }
            Err(_) => warn!(webhook = target, header = %name, "skipping invalid header value"),
        }
    }
    headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    headers.insert(USER_AGENT, HeaderValue::from_static(RELAY_USER_AGENT));
    headers
}

fn parse_method(method: &str) -> Result<Method> {
    Method::from_bytes(method.to_uppercase().as_bytes())
        .map_err(|_| RelayError::validation(format!("'{method}' is not a valid HTTP method")))
}

impl DeliveryTarget {
    pub fn from_definition(webhook: &WebhookDefinition) -> Result<Self> {
        let name = if webhook.name.is_empty() {
            webhook.id.clone()
        } else {
            webhook.name.clone()
        };
        Ok(Self {
            headers: build_headers(&name, &webhook.headers),
            method: parse_method(&webhook.method)?,
            url: webhook.url.clone(),
            timeout: webhook.timeout_duration(),
            retry_count: webhook.retry_count,
            retry_delay: webhook.retry_delay_duration(),
            name,
        })
    }

    /// The statically configured global target, if enabled.
    pub fn global(settings: &WebhookSettings) -> Result<Option<Self>> {
        if !settings.enabled {
            return Ok(None);
        }
        let method = parse_method(&settings.method)
            .map_err(|e| RelayError::Configuration(format!("global webhook: {e}")))?;
        Ok(Some(Self {
            name: "global".to_string(),
            url: settings.url.clone(),
            method,
            headers: build_headers("global", &HashMap::new()),
            timeout: Duration::from_secs(settings.timeout_secs),
            retry_count: settings.retry_count,
            retry_delay: Duration::from_secs(settings.retry_delay_secs),
        }))
    }
}

/// Result of one delivery task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryOutcome {
    Delivered { attempts: u32 },
    Failed { attempts: u32, last_error: String },
    /// Shutdown interrupted the wait before the next retry.
    Cancelled { attempts: u32 },
}

async fn attempt(
    client: &Client,
    target: &DeliveryTarget,
    body: &[u8],
) -> std::result::Result<(), DeliveryError> {
    let response = client
        .request(target.method.clone(), &target.url)
        .headers(target.headers.clone())
        .timeout(target.timeout)
        .body(body.to_vec())
        .send()
        .await?;
    let status = response.status();
    if status.is_success() {
        Ok(())
    } else {
        Err(DeliveryError::Status(status.as_u16()))
    }
}

/// Delivers `body` to `target`, retrying up to `retry_count` more times with
/// a fixed delay. The wait between attempts ends early when `cancel` fires.
pub async fn deliver(
    client: &Client,
    target: &DeliveryTarget,
    body: &[u8],
    cancel: &CancellationToken,
) -> DeliveryOutcome {
    let max_attempts = target.retry_count.saturating_add(1);
    let mut last_error = String::new();

    for attempt_no in 1..=max_attempts {
        if attempt_no > 1 {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!(webhook = %target.name, attempts = attempt_no - 1, "delivery cancelled");
                    return DeliveryOutcome::Cancelled { attempts: attempt_no - 1 };
                }
                _ = tokio::time::sleep(target.retry_delay) => {}
            }
        }

        match attempt(client, target, body).await {
            Ok(()) => {
                debug!(webhook = %target.name, attempt = attempt_no, "delivered");
                return DeliveryOutcome::Delivered {
                    attempts: attempt_no,
                };
            }
            Err(err) => {
                warn!(
                    webhook = %target.name,
                    attempt = attempt_no,
                    max_attempts,
                    error = %err,
                    "delivery attempt failed"
                );
                last_error = err.to_string();
            }
        }
    }

    error!(
        webhook = %target.name,
        url = %target.url,
        attempts = max_attempts,
        error = %last_error,
        "delivery failed after all retries"
    );
    DeliveryOutcome::Failed {
        attempts: max_attempts,
        last_error,
    }
}

struct Engine {
    client: Client,
    registry: Registry,
    global: Option<DeliveryTarget>,
    stats: Arc<RelayStats>,
    cancel: CancellationToken,
    tracker: TaskTracker,
}

impl Engine {
    async fn dispatch(&self, message: InboundMessage) {
        let body = match serde_json::to_vec(&Envelope::from_message(&message)) {
            Ok(body) => Arc::new(body),
            Err(err) => {
                error!(topic = %message.topic, error = %err, "failed to encode envelope");
                return;
            }
        };

        if let Some(global) = &self.global {
            self.spawn_delivery(global.clone(), body.clone());
        }

        let matching =
            match with_deadline(STORE_DEADLINE, self.registry.get_matching(&message.topic)).await {
                Ok(matching) => matching,
                Err(err) => {
                    error!(topic = %message.topic, error = %err, "failed to load matching webhooks");
                    return;
                }
            };
        debug!(topic = %message.topic, count = matching.len(), "matching webhooks");

        for webhook in &matching {
            match DeliveryTarget::from_definition(webhook) {
                Ok(target) => self.spawn_delivery(target, body.clone()),
                Err(err) => warn!(id = %webhook.id, error = %err, "skipping webhook"),
            }
        }
    }

    fn spawn_delivery(&self, target: DeliveryTarget, body: Arc<Vec<u8>>) {
        let client = self.client.clone();
        let cancel = self.cancel.clone();
        let stats = self.stats.clone();
        self.tracker.spawn(async move {
            match deliver(&client, &target, &body, &cancel).await {
                DeliveryOutcome::Delivered { .. } => stats.increment_webhook_deliveries(),
                DeliveryOutcome::Failed { .. } => stats.increment_webhook_failures(),
                DeliveryOutcome::Cancelled { .. } => {}
            }
        });
    }
}

/// Fans inbound messages out to the global target and every matching
/// webhook.
///
/// Messages arrive over an unbounded channel so the transport's receive path
/// never waits. Each message and each delivery runs as its own tracked task.
pub struct Dispatcher {
    sender: mpsc::UnboundedSender<InboundMessage>,
    cancel: CancellationToken,
    tracker: TaskTracker,
}

impl Dispatcher {
    /// Starts the dispatch loop. Must be called from within a tokio runtime.
    pub fn start(
        registry: Registry,
        global: Option<DeliveryTarget>,
        stats: Arc<RelayStats>,
    ) -> Result<Self> {
        let client = Client::builder()
            .build()
            .map_err(|e| RelayError::Configuration(format!("http client: {e}")))?;
        let (sender, receiver) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();
        let tracker = TaskTracker::new();

        let engine = Arc::new(Engine {
            client,
            registry,
            global,
            stats,
            cancel: cancel.clone(),
            tracker: tracker.clone(),
        });
        tracker.spawn(run(engine, receiver));

        Ok(Self {
            sender,
            cancel,
            tracker,
        })
    }

    /// Queues a message. Returns `false` once the dispatcher has stopped.
    pub fn dispatch(&self, message: InboundMessage) -> bool {
        self.sender.send(message).is_ok()
    }

    /// A subscription handler that feeds this dispatcher.
    pub fn handler(&self) -> MessageHandler {
        let sender = self.sender.clone();
        Arc::new(move |message: InboundMessage| {
            if sender.send(message).is_err() {
                debug!("dispatcher stopped, dropping message");
            }
        })
    }

    /// Stops accepting messages, cancels pending retry waits and waits for
    /// in-flight attempts. With `drain` set, gives up after that long and
    /// returns `false`.
    pub async fn shutdown(&self, drain: Option<Duration>) -> bool {
        self.cancel.cancel();
        self.tracker.close();
        let drained = match drain {
            Some(limit) => tokio::time::timeout(limit, self.tracker.wait())
                .await
                .is_ok(),
            None => {
                self.tracker.wait().await;
                true
            }
        };
        if drained {
            info!("dispatcher drained");
        } else {
            warn!(pending = self.tracker.len(), "dispatcher drain timed out");
        }
        drained
    }
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("in_flight", &self.tracker.len())
            .field("stopped", &self.cancel.is_cancelled())
            .finish()
    }
}

async fn run(engine: Arc<Engine>, mut receiver: mpsc::UnboundedReceiver<InboundMessage>) {
    loop {
        let message = tokio::select! {
            _ = engine.cancel.cancelled() => break,
            message = receiver.recv() => match message {
                Some(message) => message,
                None => break,
            },
        };
        let task_engine = engine.clone();
        engine
            .tracker
            .spawn(async move { task_engine.dispatch(message).await });
    }
    debug!("dispatch loop stopped");
}
