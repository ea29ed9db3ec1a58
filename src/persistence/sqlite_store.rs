use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{Connection, ErrorCode, OptionalExtension, Row, params};
use tracing::debug;

use super::outbox::{NewRecord, OutboxRecord, OutboxStore, WebhookStore, effective_limit};
use crate::broker::message::QoS;
use crate::utils::{RelayError, Result, StorageError};
use crate::webhook::WebhookDefinition;

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS messages (
    id TEXT PRIMARY KEY,
    topic TEXT NOT NULL,
    payload BLOB NOT NULL,
    qos INTEGER NOT NULL DEFAULT 0,
    retained INTEGER NOT NULL DEFAULT 0,
    timestamp TEXT NOT NULL,
    confirmed INTEGER NOT NULL DEFAULT 0
);
CREATE INDEX IF NOT EXISTS idx_messages_confirmed ON messages(confirmed);
CREATE INDEX IF NOT EXISTS idx_messages_timestamp ON messages(timestamp);

CREATE TABLE IF NOT EXISTS webhooks (
    id TEXT PRIMARY KEY,
    name TEXT NOT NULL,
    url TEXT NOT NULL,
    method TEXT NOT NULL DEFAULT 'POST',
    topic_filter TEXT NOT NULL,
    enabled INTEGER NOT NULL DEFAULT 1,
    headers TEXT NOT NULL DEFAULT '{}',
    timeout INTEGER NOT NULL,
    retry_count INTEGER NOT NULL,
    retry_delay INTEGER NOT NULL,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_webhooks_topic_filter ON webhooks(topic_filter);
CREATE INDEX IF NOT EXISTS idx_webhooks_enabled ON webhooks(enabled);
";

const RECORD_COLUMNS: &str = "id, topic, payload, qos, retained, timestamp, confirmed";
const WEBHOOK_COLUMNS: &str = "id, name, url, method, topic_filter, enabled, headers, \
     timeout, retry_count, retry_delay, created_at, updated_at";

/// Fixed-width RFC3339 so text ordering equals time ordering.
fn format_time(time: &DateTime<Utc>) -> String {
    time.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_time(text: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(text)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|_| StorageError::Timestamp(text.to_string()).into())
}

fn is_constraint_violation(err: &rusqlite::Error) -> bool {
    matches!(err, rusqlite::Error::SqliteFailure(e, _) if e.code == ErrorCode::ConstraintViolation)
}

struct RecordRow {
    id: String,
    topic: String,
    payload: Vec<u8>,
    qos: u8,
    retained: bool,
    timestamp: String,
    confirmed: bool,
}

impl RecordRow {
    fn read(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            topic: row.get(1)?,
            payload: row.get(2)?,
            qos: row.get(3)?,
            retained: row.get(4)?,
            timestamp: row.get(5)?,
            confirmed: row.get(6)?,
        })
    }

    fn into_record(self) -> Result<OutboxRecord> {
        Ok(OutboxRecord {
            qos: QoS::try_from(self.qos)?,
            timestamp: parse_time(&self.timestamp)?,
            id: self.id,
            topic: self.topic,
            payload: self.payload,
            retained: self.retained,
            confirmed: self.confirmed,
        })
    }
}

struct WebhookRow {
    id: String,
    name: String,
    url: String,
    method: String,
    topic_filter: String,
    enabled: bool,
    headers: String,
    timeout: i64,
    retry_count: u32,
    retry_delay: i64,
    created_at: String,
    updated_at: String,
}

impl WebhookRow {
    fn read(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            name: row.get(1)?,
            url: row.get(2)?,
            method: row.get(3)?,
            topic_filter: row.get(4)?,
            enabled: row.get(5)?,
            headers: row.get(6)?,
            timeout: row.get(7)?,
            retry_count: row.get(8)?,
            retry_delay: row.get(9)?,
            created_at: row.get(10)?,
            updated_at: row.get(11)?,
        })
    }

    fn into_definition(self) -> Result<WebhookDefinition> {
        Ok(WebhookDefinition {
            headers: serde_json::from_str(&self.headers).map_err(StorageError::from)?,
            created_at: parse_time(&self.created_at)?,
            updated_at: parse_time(&self.updated_at)?,
            id: self.id,
            name: self.name,
            url: self.url,
            method: self.method,
            topic_filter: self.topic_filter,
            enabled: self.enabled,
            timeout: self.timeout.max(0) as u64,
            retry_count: self.retry_count,
            retry_delay: self.retry_delay.max(0) as u64,
        })
    }
}

/// Embedded relational backend for the outbox and webhook registry.
///
/// One connection behind a mutex; every call runs on the blocking pool.
#[derive(Clone)]
pub struct SqliteStore {
    pub(super) conn: Arc<Mutex<Connection>>,
}

impl SqliteStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        debug!(path = %path.display(), "opening sqlite store");
        Self::init(Connection::open(path)?)
    }

    pub fn in_memory() -> Result<Self> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Runs `call` on the blocking pool. If the returned future is dropped
    /// first (a deadline expired), a call still waiting for the connection
    /// is skipped instead of executed.
    async fn run<T, F>(&self, call: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&Connection) -> Result<T> + Send + 'static,
    {
        let conn = self.conn.clone();
        let abandoned = Arc::new(AtomicBool::new(false));
        let _guard = AbandonOnDrop(abandoned.clone());
        tokio::task::spawn_blocking(move || {
            let guard = conn.lock().map_err(|_| StorageError::Poisoned)?;
            if abandoned.load(Ordering::SeqCst) {
                debug!("skipping abandoned sqlite call");
                return Err(StorageError::Abandoned.into());
            }
            call(&guard)
        })
        .await
        .map_err(StorageError::from)?
    }
}

/// Marks a pending call abandoned when the awaiting future goes away. Once
/// the call has completed the flag is never read again.
struct AbandonOnDrop(Arc<AtomicBool>);

impl Drop for AbandonOnDrop {
    fn drop(&mut self) {
        self.0.store(true, Ordering::SeqCst);
    }
}

impl std::fmt::Debug for SqliteStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteStore")
            .field("conn", &"rusqlite::Connection")
            .finish()
    }
}

#[async_trait]
impl OutboxStore for SqliteStore {
    async fn store(&self, record: NewRecord) -> Result<OutboxRecord> {
        let record = record.into_record()?;
        self.run(move |conn| {
            let inserted = conn.execute(
                "INSERT INTO messages (id, topic, payload, qos, retained, timestamp, confirmed)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, 0)",
                params![
                    record.id,
                    record.topic,
                    record.payload,
                    u8::from(record.qos),
                    record.retained,
                    format_time(&record.timestamp),
                ],
            );
            match inserted {
                Ok(_) => Ok(record),
                Err(e) if is_constraint_violation(&e) => Err(RelayError::validation(format!(
                    "message '{}' already exists",
                    record.id
                ))),
                Err(e) => Err(e.into()),
            }
        })
        .await
    }

    async fn list(&self, confirmed: bool, limit: usize) -> Result<Vec<OutboxRecord>> {
        let limit = effective_limit(limit) as i64;
        self.run(move |conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {RECORD_COLUMNS} FROM messages
                 WHERE confirmed = ?1 ORDER BY timestamp DESC LIMIT ?2"
            ))?;
            let rows = stmt
                .query_map(params![confirmed, limit], RecordRow::read)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            rows.into_iter().map(RecordRow::into_record).collect()
        })
        .await
    }

    async fn get(&self, id: &str) -> Result<OutboxRecord> {
        let id = id.to_string();
        self.run(move |conn| {
            conn.query_row(
                &format!("SELECT {RECORD_COLUMNS} FROM messages WHERE id = ?1"),
                params![id],
                RecordRow::read,
            )
            .optional()?
            .ok_or_else(|| RelayError::not_found("message", &id))?
            .into_record()
        })
        .await
    }

    async fn confirm(&self, id: &str) -> Result<()> {
        let id = id.to_string();
        self.run(move |conn| {
            let updated = conn.execute("UPDATE messages SET confirmed = 1 WHERE id = ?1", params![id])?;
            if updated == 0 {
                return Err(RelayError::not_found("message", id));
            }
            Ok(())
        })
        .await
    }

    async fn delete(&self, id: &str) -> Result<()> {
        let id = id.to_string();
        self.run(move |conn| {
            let deleted = conn.execute("DELETE FROM messages WHERE id = ?1", params![id])?;
            if deleted == 0 {
                return Err(RelayError::not_found("message", id));
            }
            Ok(())
        })
        .await
    }

    async fn purge_confirmed(&self) -> Result<u64> {
        self.run(|conn| {
            let deleted = conn.execute("DELETE FROM messages WHERE confirmed = 1", [])?;
            Ok(deleted as u64)
        })
        .await
    }

    async fn ping(&self) -> Result<()> {
        self.run(|conn| {
            conn.query_row("SELECT 1", [], |row| row.get::<_, i64>(0))?;
            Ok(())
        })
        .await
    }
}

#[async_trait]
impl WebhookStore for SqliteStore {
    async fn insert_webhook(&self, webhook: &WebhookDefinition) -> Result<()> {
        let webhook = webhook.clone();
        let headers = serde_json::to_string(&webhook.headers).map_err(StorageError::from)?;
        self.run(move |conn| {
            let inserted = conn.execute(
                &format!(
                    "INSERT INTO webhooks ({WEBHOOK_COLUMNS})
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)"
                ),
                params![
                    webhook.id,
                    webhook.name,
                    webhook.url,
                    webhook.method,
                    webhook.topic_filter,
                    webhook.enabled,
                    headers,
                    webhook.timeout as i64,
                    webhook.retry_count,
                    webhook.retry_delay as i64,
                    format_time(&webhook.created_at),
                    format_time(&webhook.updated_at),
                ],
            );
            match inserted {
                Ok(_) => Ok(()),
                Err(e) if is_constraint_violation(&e) => Err(RelayError::validation(format!(
                    "webhook '{}' already exists",
                    webhook.id
                ))),
                Err(e) => Err(e.into()),
            }
        })
        .await
    }

    async fn list_webhooks(&self, limit: usize) -> Result<Vec<WebhookDefinition>> {
        let limit = effective_limit(limit) as i64;
        self.run(move |conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {WEBHOOK_COLUMNS} FROM webhooks ORDER BY created_at DESC LIMIT ?1"
            ))?;
            let rows = stmt
                .query_map(params![limit], WebhookRow::read)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            rows.into_iter().map(WebhookRow::into_definition).collect()
        })
        .await
    }

    async fn get_webhook(&self, id: &str) -> Result<WebhookDefinition> {
        let id = id.to_string();
        self.run(move |conn| {
            conn.query_row(
                &format!("SELECT {WEBHOOK_COLUMNS} FROM webhooks WHERE id = ?1"),
                params![id],
                WebhookRow::read,
            )
            .optional()?
            .ok_or_else(|| RelayError::not_found("webhook", &id))?
            .into_definition()
        })
        .await
    }

    async fn update_webhook(&self, webhook: &WebhookDefinition) -> Result<()> {
        let webhook = webhook.clone();
        let headers = serde_json::to_string(&webhook.headers).map_err(StorageError::from)?;
        self.run(move |conn| {
            let updated = conn.execute(
                "UPDATE webhooks SET name = ?2, url = ?3, method = ?4, topic_filter = ?5,
                     enabled = ?6, headers = ?7, timeout = ?8, retry_count = ?9,
                     retry_delay = ?10, updated_at = ?11
                 WHERE id = ?1",
                params![
                    webhook.id,
                    webhook.name,
                    webhook.url,
                    webhook.method,
                    webhook.topic_filter,
                    webhook.enabled,
                    headers,
                    webhook.timeout as i64,
                    webhook.retry_count,
                    webhook.retry_delay as i64,
                    format_time(&webhook.updated_at),
                ],
            )?;
            if updated == 0 {
                return Err(RelayError::not_found("webhook", webhook.id));
            }
            Ok(())
        })
        .await
    }

    async fn delete_webhook(&self, id: &str) -> Result<()> {
        let id = id.to_string();
        self.run(move |conn| {
            let deleted = conn.execute("DELETE FROM webhooks WHERE id = ?1", params![id])?;
            if deleted == 0 {
                return Err(RelayError::not_found("webhook", id));
            }
            Ok(())
        })
        .await
    }

    async fn enabled_webhooks(&self) -> Result<Vec<WebhookDefinition>> {
        self.run(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {WEBHOOK_COLUMNS} FROM webhooks WHERE enabled = 1 ORDER BY created_at"
            ))?;
            let rows = stmt
                .query_map([], WebhookRow::read)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            rows.into_iter().map(WebhookRow::into_definition).collect()
        })
        .await
    }
}
