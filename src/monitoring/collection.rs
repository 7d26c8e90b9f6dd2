//! Resource collections
//!
//! A collection fetches its listing once (all pages) and answers `find`
//! from that snapshot. Saving a new resource appends it to the snapshot.

use super::client::Backend;
use super::resources::Resource;
use crate::error::{ProvisionError, Result};
use tokio::sync::Mutex;

/// One remote collection, e.g. agent tokens or an entity's alarms
pub struct Collection<R: Resource> {
    backend: Backend,
    /// Path relative to the API endpoint
    path: String,
    /// Owning object for scoped collections
    parent_id: Option<String>,
    cache: Mutex<Option<Vec<R>>>,
}

impl<R: Resource> Collection<R> {
    pub(crate) fn new(backend: Backend) -> Self {
        Self {
            backend,
            path: R::COLLECTION.to_string(),
            parent_id: None,
            cache: Mutex::new(None),
        }
    }

    pub(crate) fn scoped(backend: Backend, parent_collection: &str, parent_id: &str) -> Self {
        Self {
            backend,
            path: format!(
                "{}/{}/{}",
                parent_collection,
                urlencoding::encode(parent_id),
                R::COLLECTION
            ),
            parent_id: Some(parent_id.to_string()),
            cache: Mutex::new(None),
        }
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    /// Every resource in the collection, fetched on first use
    pub async fn all(&self) -> Result<Vec<R>> {
        let mut cache = self.cache.lock().await;
        if let Some(items) = cache.as_ref() {
            return Ok(items.clone());
        }

        let raw = self.backend.list(&self.path).await?;
        let items = raw
            .into_iter()
            .map(|value| self.decode(value))
            .collect::<Result<Vec<R>>>()?;

        tracing::debug!("Fetched {} objects from {}", items.len(), self.path);
        *cache = Some(items.clone());
        Ok(items)
    }

    /// Resources matching `predicate`, lazily filtered from the cached listing
    pub async fn find<P>(&self, predicate: P) -> Result<impl Iterator<Item = R>>
    where
        P: FnMut(&R) -> bool,
    {
        let mut predicate = predicate;
        Ok(self.all().await?.into_iter().filter(move |r| predicate(r)))
    }

    /// First resource whose label equals `label` exactly
    pub async fn find_by_label(&self, label: &str) -> Result<Option<R>> {
        Ok(self.find(|r| r.label() == label).await?.next())
    }

    /// Build a new resource locally; nothing is sent until `save`
    pub fn create(&self, draft: R::Draft) -> Unsaved<'_, R> {
        Unsaved {
            collection: self,
            draft,
        }
    }

    /// Forget the cached listing so the next `find` re-fetches
    pub async fn reload(&self) {
        *self.cache.lock().await = None;
    }

    async fn persist(&self, draft: &R::Draft) -> Result<R> {
        let body = serde_json::to_value(draft).map_err(|e| {
            ProvisionError::Configuration(format!("cannot serialize {} request: {}", self.path, e))
        })?;

        let created = self.decode(self.backend.create(&self.path, body).await?)?;

        if let Some(items) = self.cache.lock().await.as_mut() {
            items.push(created.clone());
        }

        tracing::info!("Created {} {:?} ({})", self.path, created.label(), created.id());
        Ok(created)
    }

    fn decode(&self, value: serde_json::Value) -> Result<R> {
        let mut resource: R = serde_json::from_value(value).map_err(|e| {
            ProvisionError::transport(format!("unexpected {} object: {}", self.path, e))
        })?;
        if let Some(parent_id) = &self.parent_id {
            resource.attach_parent(parent_id);
        }
        Ok(resource)
    }
}

/// A resource built locally but not yet saved
pub struct Unsaved<'a, R: Resource> {
    collection: &'a Collection<R>,
    draft: R::Draft,
}

impl<R: Resource> Unsaved<'_, R> {
    pub fn draft(&self) -> &R::Draft {
        &self.draft
    }

    pub fn draft_mut(&mut self) -> &mut R::Draft {
        &mut self.draft
    }

    /// Persist remotely, returning the resource with server-assigned fields
    pub async fn save(self) -> Result<R> {
        self.collection.persist(&self.draft).await
    }
}
