use std::sync::Arc;

use tracing::info;

use super::model::{WebhookDefinition, WebhookRequest};
use crate::broker::topic::topic_matches;
use crate::persistence::Store;
use crate::utils::Result;

/// CRUD over webhook definitions. Input is validated before anything is
/// persisted.
#[derive(Clone)]
pub struct Registry {
    store: Arc<dyn Store>,
}

impl Registry {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    pub async fn create(&self, request: WebhookRequest) -> Result<WebhookDefinition> {
        let definition = WebhookDefinition::create(request)?;
        self.store.insert_webhook(&definition).await?;
        info!(id = %definition.id, filter = %definition.topic_filter, "webhook created");
        Ok(definition)
    }

    pub async fn get(&self, id: &str) -> Result<WebhookDefinition> {
        self.store.get_webhook(id).await
    }

    /// Newest first; a zero limit means the default page size.
    pub async fn list(&self, limit: usize) -> Result<Vec<WebhookDefinition>> {
        self.store.list_webhooks(limit).await
    }

    /// Overlays the present fields of `request` onto the stored definition.
    pub async fn update(&self, id: &str, request: WebhookRequest) -> Result<WebhookDefinition> {
        let current = self.store.get_webhook(id).await?;
        let updated = current.updated(request)?;
        self.store.update_webhook(&updated).await?;
        info!(id, "webhook updated");
        Ok(updated)
    }

    pub async fn delete(&self, id: &str) -> Result<()> {
        self.store.delete_webhook(id).await?;
        info!(id, "webhook deleted");
        Ok(())
    }

    /// Enabled definitions whose filter matches `topic`.
    pub async fn get_matching(&self, topic: &str) -> Result<Vec<WebhookDefinition>> {
        let enabled = self.store.enabled_webhooks().await?;
        Ok(enabled
            .into_iter()
            .filter(|webhook| topic_matches(topic, &webhook.topic_filter))
            .collect())
    }
}

impl std::fmt::Debug for Registry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registry").finish_non_exhaustive()
    }
}
