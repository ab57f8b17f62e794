use crate::database::{Document, Repository};
use crate::utils::error::ApiError;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tracing::{error, info, warn};
use uuid::Uuid;

/// Immutable view of the active document set. Published wholesale; readers
/// hold it by `Arc` and never observe a half-built map.
#[derive(Debug)]
pub struct RegistrySnapshot {
    pub by_slug: HashMap<String, Arc<Document>>,
    pub by_id: HashMap<Uuid, Arc<Document>>,
    pub active_slugs: Vec<String>,
    pub loaded_at: DateTime<Utc>,
}

impl RegistrySnapshot {
    fn build(documents: Vec<Document>) -> Self {
        let mut by_slug = HashMap::with_capacity(documents.len());
        let mut by_id = HashMap::with_capacity(documents.len());
        let mut active_slugs = Vec::with_capacity(documents.len());

        for document in documents {
            let document = Arc::new(document);
            active_slugs.push(document.slug.clone());
            by_slug.insert(document.slug.clone(), Arc::clone(&document));
            by_id.insert(document.id, document);
        }

        Self {
            by_slug,
            by_id,
            active_slugs,
            loaded_at: Utc::now(),
        }
    }

    pub fn get_by_slug(&self, slug: &str) -> Option<Arc<Document>> {
        self.by_slug.get(slug).cloned()
    }

    pub fn get_by_id(&self, id: Uuid) -> Option<Arc<Document>> {
        self.by_id.get(&id).cloned()
    }

    pub fn len(&self) -> usize {
        self.active_slugs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.active_slugs.is_empty()
    }
}

/// Warm in-process index of active documents, refreshed from the catalog on
/// a timer and on demand. Swap is a single pointer write under a short lock;
/// a failed refresh keeps serving the previous snapshot.
pub struct DocumentRegistry {
    repository: Arc<Repository>,
    snapshot: RwLock<Option<Arc<RegistrySnapshot>>>,
    refreshing: AtomicBool,
    invalidate: Notify,
    refresh_interval: Duration,
}

impl DocumentRegistry {
    pub fn new(repository: Arc<Repository>, refresh_interval: Duration) -> Self {
        Self {
            repository,
            snapshot: RwLock::new(None),
            refreshing: AtomicBool::new(false),
            invalidate: Notify::new(),
            refresh_interval,
        }
    }

    /// Initial synchronous population. The server does not accept document
    /// requests until this has succeeded once.
    pub async fn load(&self) -> anyhow::Result<()> {
        let documents = self.repository.list_active_documents().await?;
        let snapshot = Arc::new(RegistrySnapshot::build(documents));
        info!("Document registry loaded: {} active documents", snapshot.len());
        *self.snapshot.write() = Some(snapshot);
        Ok(())
    }

    pub fn is_ready(&self) -> bool {
        self.snapshot.read().is_some()
    }

    /// Current snapshot, or `ServiceUnavailable` before the initial load.
    pub fn snapshot(&self) -> Result<Arc<RegistrySnapshot>, ApiError> {
        self.snapshot
            .read()
            .clone()
            .ok_or_else(|| ApiError::ServiceUnavailable("document registry not ready".to_string()))
    }

    pub fn get_by_slug(&self, slug: &str) -> Result<Option<Arc<Document>>, ApiError> {
        Ok(self.snapshot()?.get_by_slug(slug))
    }

    pub fn get_by_id(&self, id: Uuid) -> Result<Option<Arc<Document>>, ApiError> {
        Ok(self.snapshot()?.get_by_id(id))
    }

    /// Rebuild from the catalog and publish atomically. On failure the
    /// previous snapshot stays in place; partial state is never served.
    pub async fn refresh(&self) {
        if self
            .refreshing
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            warn!("Registry refresh already in flight, skipping");
            return;
        }

        match self.repository.list_active_documents().await {
            Ok(documents) => {
                let snapshot = Arc::new(RegistrySnapshot::build(documents));
                info!("Registry refreshed: {} active documents", snapshot.len());
                *self.snapshot.write() = Some(snapshot);
            }
            Err(e) => {
                error!("Registry refresh failed, keeping previous snapshot: {}", e);
            }
        }

        self.refreshing.store(false, Ordering::SeqCst);
    }

    /// External trigger (webhook) scheduling an immediate refresh on the
    /// background task.
    pub fn invalidate(&self) {
        self.invalidate.notify_one();
    }

    /// Background refresh: every `refresh_interval`, or immediately on
    /// invalidation.
    pub fn spawn_refresh_task(self: &Arc<Self>) {
        let registry = Arc::clone(self);

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(registry.refresh_interval) => {}
                    _ = registry.invalidate.notified() => {
                        info!("Registry invalidated, refreshing now");
                    }
                }
                registry.refresh().await;
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::{AccessLevel, EmbeddingProviderKind};

    fn doc(slug: &str) -> Document {
        Document {
            id: Uuid::new_v4(),
            slug: slug.to_string(),
            owner_id: Uuid::new_v4(),
            title: slug.to_uppercase(),
            subtitle: None,
            access_level: AccessLevel::Public,
            embedding_provider: EmbeddingProviderKind::Remote,
            chunk_limit: None,
            forced_model: None,
            intro_message: None,
            passcode: None,
            abstract_text: None,
            keywords: None,
            page_count: None,
            processor_version: None,
            active: true,
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn snapshot_is_internally_consistent() {
        let snapshot = RegistrySnapshot::build(vec![doc("smh"), doc("uhn"), doc("guides")]);

        assert_eq!(snapshot.len(), 3);
        for slug in &snapshot.active_slugs {
            let by_slug = snapshot.get_by_slug(slug).unwrap();
            let by_id = snapshot.get_by_id(by_slug.id).unwrap();
            assert_eq!(by_slug.id, by_id.id);
            assert_eq!(by_id.slug, *slug);
        }
    }

    #[test]
    fn unknown_slug_is_none() {
        let snapshot = RegistrySnapshot::build(vec![doc("smh")]);
        assert!(snapshot.get_by_slug("missing").is_none());
    }

    #[test]
    fn slug_rename_moves_routing_but_keeps_id() {
        let mut renamed = doc("test-doc");
        let id = renamed.id;

        let before = RegistrySnapshot::build(vec![renamed.clone()]);
        assert!(before.get_by_slug("test-doc").is_some());

        renamed.slug = "test-doc-v2".to_string();
        let after = RegistrySnapshot::build(vec![renamed]);

        assert!(after.get_by_slug("test-doc").is_none());
        let moved = after.get_by_slug("test-doc-v2").unwrap();
        assert_eq!(moved.id, id);
        assert_eq!(after.get_by_id(id).unwrap().slug, "test-doc-v2");
    }

    #[test]
    fn rebuild_from_same_membership_matches() {
        let docs = vec![doc("a"), doc("b")];
        let first = RegistrySnapshot::build(docs.clone());
        let second = RegistrySnapshot::build(docs);

        assert_eq!(first.active_slugs, second.active_slugs);
        for slug in &first.active_slugs {
            assert_eq!(
                first.get_by_slug(slug).unwrap().id,
                second.get_by_slug(slug).unwrap().id
            );
        }
    }
}
