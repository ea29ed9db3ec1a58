use std::path::Path;

use async_trait::async_trait;
use serde::Serialize;
use serde::de::DeserializeOwned;
use sled::transaction::{
    ConflictableTransactionError, TransactionError, TransactionalTree, abort,
};
use sled::{Db, Transactional, Tree};
use tracing::debug;

use super::outbox::{NewRecord, OutboxRecord, OutboxStore, WebhookStore, effective_limit};
use crate::utils::{RelayError, Result, StorageError};
use crate::webhook::WebhookDefinition;

const OUTBOX_TREE: &str = "outbox";
const OUTBOX_INDEX_TREE: &str = "outbox_by_state";
const WEBHOOK_TREE: &str = "webhooks";
const WEBHOOK_INDEX_TREE: &str = "webhooks_by_state";

fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    Ok(serde_json::to_vec(value).map_err(StorageError::from)?)
}

fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T> {
    Ok(serde_json::from_slice(bytes).map_err(StorageError::from)?)
}

fn unwrap_tx<T>(result: std::result::Result<T, TransactionError<RelayError>>) -> Result<T> {
    result.map_err(|e| match e {
        TransactionError::Abort(err) => err,
        TransactionError::Storage(err) => err.into(),
    })
}

fn decode_in_tx<T: DeserializeOwned>(
    bytes: &[u8],
) -> std::result::Result<T, ConflictableTransactionError<RelayError>> {
    decode(bytes).map_err(ConflictableTransactionError::Abort)
}

/// `[confirmed][timestamp µs, sign-flipped big-endian][id]`, so a prefix scan
/// over one state walks records oldest to newest.
fn record_index_key(record: &OutboxRecord) -> Vec<u8> {
    let micros = (record.timestamp.timestamp_micros() as u64) ^ (1 << 63);
    let mut key = Vec::with_capacity(9 + record.id.len());
    key.push(record.confirmed as u8);
    key.extend_from_slice(&micros.to_be_bytes());
    key.extend_from_slice(record.id.as_bytes());
    key
}

/// `[enabled][topic filter]\0[id]`.
fn webhook_index_key(webhook: &WebhookDefinition) -> Vec<u8> {
    let mut key = Vec::with_capacity(2 + webhook.topic_filter.len() + webhook.id.len());
    key.push(webhook.enabled as u8);
    key.extend_from_slice(webhook.topic_filter.as_bytes());
    key.push(0);
    key.extend_from_slice(webhook.id.as_bytes());
    key
}

/// Embedded document-store backend built on `sled`.
///
/// Records and definitions are JSON documents keyed by id; secondary trees
/// index them by confirmed and enabled state. Updates touching a document and
/// its index run in one multi-tree transaction.
#[derive(Clone)]
pub struct SledStore {
    db: Db,
    outbox: Tree,
    outbox_index: Tree,
    webhooks: Tree,
    webhook_index: Tree,
}

impl SledStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        debug!(path = %path.display(), "opening sled store");
        Self::from_db(sled::open(path)?)
    }

    /// A store that is deleted when dropped.
    pub fn temporary() -> Result<Self> {
        Self::from_db(sled::Config::new().temporary(true).open()?)
    }

    fn from_db(db: Db) -> Result<Self> {
        Ok(Self {
            outbox: db.open_tree(OUTBOX_TREE)?,
            outbox_index: db.open_tree(OUTBOX_INDEX_TREE)?,
            webhooks: db.open_tree(WEBHOOK_TREE)?,
            webhook_index: db.open_tree(WEBHOOK_INDEX_TREE)?,
            db,
        })
    }

    fn load_record(&self, id: &[u8]) -> Result<Option<OutboxRecord>> {
        self.outbox
            .get(id)?
            .map(|bytes| decode(&bytes))
            .transpose()
    }

    fn remove_record(
        outbox: &TransactionalTree,
        index: &TransactionalTree,
        id: &str,
    ) -> std::result::Result<Option<OutboxRecord>, ConflictableTransactionError<RelayError>> {
        let Some(bytes) = outbox.remove(id.as_bytes())? else {
            return Ok(None);
        };
        let record: OutboxRecord = decode_in_tx(&bytes)?;
        index.remove(record_index_key(&record))?;
        Ok(Some(record))
    }
}

impl std::fmt::Debug for SledStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SledStore")
            .field("db", &"sled::Db")
            .finish()
    }
}

#[async_trait]
impl OutboxStore for SledStore {
    async fn store(&self, record: NewRecord) -> Result<OutboxRecord> {
        let record = record.into_record()?;
        let document = encode(&record)?;
        let index_key = record_index_key(&record);

        unwrap_tx((&self.outbox, &self.outbox_index).transaction(|(outbox, index)| {
            if outbox.get(record.id.as_bytes())?.is_some() {
                return abort(RelayError::validation(format!(
                    "message '{}' already exists",
                    record.id
                )));
            }
            outbox.insert(record.id.as_bytes(), document.clone())?;
            index.insert(index_key.clone(), record.id.as_bytes())?;
            Ok(())
        }))?;
        Ok(record)
    }

    async fn list(&self, confirmed: bool, limit: usize) -> Result<Vec<OutboxRecord>> {
        let limit = effective_limit(limit);
        let mut records = Vec::with_capacity(limit.min(64));
        for entry in self.outbox_index.scan_prefix([confirmed as u8]).rev() {
            if records.len() == limit {
                break;
            }
            let (_, id) = entry?;
            // A concurrent delete can leave a stale index hit; skip it.
            if let Some(record) = self.load_record(&id)? {
                records.push(record);
            }
        }
        Ok(records)
    }

    async fn get(&self, id: &str) -> Result<OutboxRecord> {
        self.load_record(id.as_bytes())?
            .ok_or_else(|| RelayError::not_found("message", id))
    }

    async fn confirm(&self, id: &str) -> Result<()> {
        unwrap_tx((&self.outbox, &self.outbox_index).transaction(|(outbox, index)| {
            let Some(bytes) = outbox.get(id.as_bytes())? else {
                return abort(RelayError::not_found("message", id));
            };
            let mut record: OutboxRecord = decode_in_tx(&bytes)?;
            if record.confirmed {
                return Ok(());
            }
            index.remove(record_index_key(&record))?;
            record.confirmed = true;
            let document = encode(&record).map_err(ConflictableTransactionError::Abort)?;
            outbox.insert(id.as_bytes(), document)?;
            index.insert(record_index_key(&record), id.as_bytes())?;
            Ok(())
        }))
    }

    async fn delete(&self, id: &str) -> Result<()> {
        unwrap_tx((&self.outbox, &self.outbox_index).transaction(|(outbox, index)| {
            match Self::remove_record(outbox, index, id)? {
                Some(_) => Ok(()),
                None => abort(RelayError::not_found("message", id)),
            }
        }))
    }

    async fn purge_confirmed(&self) -> Result<u64> {
        let ids = self
            .outbox_index
            .scan_prefix([1u8])
            .values()
            .map(|id| Ok(String::from_utf8_lossy(&id?).into_owned()))
            .collect::<Result<Vec<String>>>()?;
        if ids.is_empty() {
            return Ok(0);
        }

        unwrap_tx((&self.outbox, &self.outbox_index).transaction(|(outbox, index)| {
            let mut removed = 0u64;
            for id in &ids {
                if Self::remove_record(outbox, index, id)?.is_some() {
                    removed += 1;
                }
            }
            Ok(removed)
        }))
    }

    async fn ping(&self) -> Result<()> {
        self.db.size_on_disk()?;
        Ok(())
    }
}

#[async_trait]
impl WebhookStore for SledStore {
    async fn insert_webhook(&self, webhook: &WebhookDefinition) -> Result<()> {
        let document = encode(webhook)?;
        let index_key = webhook_index_key(webhook);

        unwrap_tx((&self.webhooks, &self.webhook_index).transaction(|(webhooks, index)| {
            if webhooks.get(webhook.id.as_bytes())?.is_some() {
                return abort(RelayError::validation(format!(
                    "webhook '{}' already exists",
                    webhook.id
                )));
            }
            webhooks.insert(webhook.id.as_bytes(), document.clone())?;
            index.insert(index_key.clone(), webhook.id.as_bytes())?;
            Ok(())
        }))
    }

    async fn list_webhooks(&self, limit: usize) -> Result<Vec<WebhookDefinition>> {
        let mut webhooks = self
            .webhooks
            .iter()
            .values()
            .map(|bytes| decode::<WebhookDefinition>(&bytes?))
            .collect::<Result<Vec<_>>>()?;
        webhooks.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        webhooks.truncate(effective_limit(limit));
        Ok(webhooks)
    }

    async fn get_webhook(&self, id: &str) -> Result<WebhookDefinition> {
        match self.webhooks.get(id.as_bytes())? {
            Some(bytes) => decode(&bytes),
            None => Err(RelayError::not_found("webhook", id)),
        }
    }

    async fn update_webhook(&self, webhook: &WebhookDefinition) -> Result<()> {
        let document = encode(webhook)?;
        let new_key = webhook_index_key(webhook);

        unwrap_tx((&self.webhooks, &self.webhook_index).transaction(|(webhooks, index)| {
            let Some(bytes) = webhooks.get(webhook.id.as_bytes())? else {
                return abort(RelayError::not_found("webhook", &webhook.id));
            };
            let previous: WebhookDefinition = decode_in_tx(&bytes)?;
            index.remove(webhook_index_key(&previous))?;
            webhooks.insert(webhook.id.as_bytes(), document.clone())?;
            index.insert(new_key.clone(), webhook.id.as_bytes())?;
            Ok(())
        }))
    }

    async fn delete_webhook(&self, id: &str) -> Result<()> {
        unwrap_tx((&self.webhooks, &self.webhook_index).transaction(|(webhooks, index)| {
            let Some(bytes) = webhooks.remove(id.as_bytes())? else {
                return abort(RelayError::not_found("webhook", id));
            };
            let previous: WebhookDefinition = decode_in_tx(&bytes)?;
            index.remove(webhook_index_key(&previous))?;
            Ok(())
        }))
    }

    async fn enabled_webhooks(&self) -> Result<Vec<WebhookDefinition>> {
        let mut enabled = Vec::new();
        for id in self.webhook_index.scan_prefix([1u8]).values() {
            if let Some(bytes) = self.webhooks.get(id?)? {
                enabled.push(decode::<WebhookDefinition>(&bytes)?);
            }
        }
        Ok(enabled)
    }
}
