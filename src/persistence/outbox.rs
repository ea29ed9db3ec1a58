use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, SubsecRound, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use uuid::Uuid;

use crate::broker::message::{Payload, QoS};
use crate::utils::{RelayError, Result};
use crate::webhook::WebhookDefinition;

/// Limit applied by `list` when the caller passes zero.
pub const DEFAULT_LIST_LIMIT: usize = 100;

/// Deadline applied to store calls made from the publish and dispatch paths.
pub const STORE_DEADLINE: Duration = Duration::from_secs(5);

/// A message the caller wants recorded. `id` and `timestamp` are assigned on
/// store when absent.
#[derive(Debug, Clone)]
pub struct NewRecord {
    pub id: Option<String>,
    pub topic: String,
    pub payload: Payload,
    pub qos: QoS,
    pub retained: bool,
    pub timestamp: Option<DateTime<Utc>>,
}

impl NewRecord {
    pub fn new(topic: impl Into<String>, payload: impl Into<Payload>) -> Self {
        Self {
            id: None,
            topic: topic.into(),
            payload: payload.into(),
            qos: QoS::default(),
            retained: false,
            timestamp: None,
        }
    }

    pub fn with_qos(mut self, qos: QoS) -> Self {
        self.qos = qos;
        self
    }

    pub fn with_retained(mut self, retained: bool) -> Self {
        self.retained = retained;
        self
    }

    /// Resolves defaults and encodes the payload. Timestamps are kept to the
    /// microsecond, the precision every backend stores. Always unconfirmed.
    pub fn into_record(self) -> Result<OutboxRecord> {
        if self.topic.is_empty() {
            return Err(RelayError::validation("topic must not be empty"));
        }
        let id = match self.id {
            Some(id) if id.is_empty() => {
                return Err(RelayError::validation("record id must not be empty"));
            }
            Some(id) => id,
            None => Uuid::new_v4().to_string(),
        };
        Ok(OutboxRecord {
            id,
            payload: self.payload.to_bytes()?,
            topic: self.topic,
            qos: self.qos,
            retained: self.retained,
            timestamp: self.timestamp.unwrap_or_else(Utc::now).trunc_subsecs(6),
            confirmed: false,
        })
    }
}

/// A durably recorded message awaiting confirmation.
///
/// The payload is always raw bytes; structured payloads were JSON-encoded on
/// the way in and callers re-parse them if they need the structure.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutboxRecord {
    pub id: String,
    pub topic: String,
    #[serde(with = "payload_format")]
    pub payload: Vec<u8>,
    pub qos: QoS,
    pub retained: bool,
    pub timestamp: DateTime<Utc>,
    pub confirmed: bool,
}

impl OutboxRecord {
    pub fn payload_text(&self) -> Option<&str> {
        std::str::from_utf8(&self.payload).ok()
    }
}

/// UTF-8 payloads serialize as a string, anything else as a byte array.
mod payload_format {
    use super::*;

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Wire {
        Text(String),
        Bytes(Vec<u8>),
    }

    pub fn serialize<S: Serializer>(
        payload: &[u8],
        serializer: S,
    ) -> std::result::Result<S::Ok, S::Error> {
        match std::str::from_utf8(payload) {
            Ok(text) => serializer.serialize_str(text),
            Err(_) => payload.serialize(serializer),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> std::result::Result<Vec<u8>, D::Error> {
        Ok(match Wire::deserialize(deserializer)? {
            Wire::Text(text) => text.into_bytes(),
            Wire::Bytes(bytes) => bytes,
        })
    }
}

/// Durable message outbox.
#[async_trait]
pub trait OutboxStore: Send + Sync {
    /// Persists a record; it is readable as soon as this returns.
    async fn store(&self, record: NewRecord) -> Result<OutboxRecord>;

    /// Newest-first, at most `limit` records (zero means [`DEFAULT_LIST_LIMIT`]).
    async fn list(&self, confirmed: bool, limit: usize) -> Result<Vec<OutboxRecord>>;

    async fn get(&self, id: &str) -> Result<OutboxRecord>;

    /// Marks a record confirmed. Confirming twice is not an error.
    async fn confirm(&self, id: &str) -> Result<()>;

    async fn delete(&self, id: &str) -> Result<()>;

    /// Deletes every confirmed record, returning how many were removed.
    async fn purge_confirmed(&self) -> Result<u64>;

    async fn ping(&self) -> Result<()>;
}

/// Storage for webhook definitions.
#[async_trait]
pub trait WebhookStore: Send + Sync {
    /// Fails with a validation error if the id is already taken.
    async fn insert_webhook(&self, webhook: &WebhookDefinition) -> Result<()>;

    /// Newest-first by creation time.
    async fn list_webhooks(&self, limit: usize) -> Result<Vec<WebhookDefinition>>;

    async fn get_webhook(&self, id: &str) -> Result<WebhookDefinition>;

    async fn update_webhook(&self, webhook: &WebhookDefinition) -> Result<()>;

    async fn delete_webhook(&self, id: &str) -> Result<()>;

    async fn enabled_webhooks(&self) -> Result<Vec<WebhookDefinition>>;
}

/// A backend holding both the outbox and the webhook registry.
pub trait Store: OutboxStore + WebhookStore {}

impl<T: OutboxStore + WebhookStore> Store for T {}

pub(crate) fn effective_limit(limit: usize) -> usize {
    if limit == 0 { DEFAULT_LIST_LIMIT } else { limit }
}

/// Runs a store call under `deadline`.
pub async fn with_deadline<T, F>(deadline: Duration, call: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    tokio::time::timeout(deadline, call)
        .await
        .map_err(|_| RelayError::DeadlineExceeded(deadline))?
}
