//! The `persistence` module provides the durable message outbox and the
//! webhook registry's storage.
//!
//! Both live behind the [`Store`] capability so callers never know which
//! backend they talk to. Two backends are available:
//!
//! - [`SqliteStore`]: an embedded relational database via `rusqlite`.
//! - [`SledStore`]: an embedded document store via `sled`.
//!
//! The backend is chosen once, from configuration, by [`open`].

pub mod outbox;
pub mod sled_store;
pub mod sqlite_store;

use std::sync::Arc;

use tracing::info;

use crate::config::{StorageBackend, StorageSettings};
use crate::utils::Result;

pub use outbox::{
    DEFAULT_LIST_LIMIT, NewRecord, OutboxRecord, OutboxStore, STORE_DEADLINE, Store,
    WebhookStore, with_deadline,
};
pub use sled_store::SledStore;
pub use sqlite_store::SqliteStore;

/// Opens the configured backend.
pub fn open(settings: &StorageSettings) -> Result<Arc<dyn Store>> {
    match settings.backend {
        StorageBackend::Sqlite => {
            info!(path = %settings.sqlite_path.display(), "using sqlite outbox");
            Ok(Arc::new(SqliteStore::open(&settings.sqlite_path)?))
        }
        StorageBackend::Sled => {
            info!(path = %settings.sled_path.display(), "using sled outbox");
            Ok(Arc::new(SledStore::open(&settings.sled_path)?))
        }
    }
}
