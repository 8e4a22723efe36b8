//! In-memory service implementations.
//!
//! Used by tests and by `--dry-run`, where every stage runs but nothing leaves
//! the process. Each type can be told to fail specific ids.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Mutex;

use async_trait::async_trait;
use serde_json::Value;

use catalogsync_shared::{
    BrandRef, CanonicalProduct, CatalogProductRef, CatalogSyncError, CategoryRef,
    EnrichmentRecord, Result,
};

use crate::commerce::CommerceCatalog;
use crate::content::ContentService;
use crate::search::{IndexSettings, SearchIndex};

fn guard<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

// ---------------------------------------------------------------------------
// Content
// ---------------------------------------------------------------------------

#[derive(Default)]
struct ContentState {
    records: BTreeMap<String, EnrichmentRecord>,
    next_id: u64,
    fail_create: BTreeSet<String>,
    fail_update: BTreeSet<String>,
    fail_delete: BTreeSet<String>,
    deleted: Vec<String>,
}

/// Content service backed by a map of remote id to record.
#[derive(Default)]
pub struct MemoryContentService {
    state: Mutex<ContentState>,
}

impl MemoryContentService {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed records. Records without an id get one assigned.
    pub fn with_records(records: impl IntoIterator<Item = EnrichmentRecord>) -> Self {
        let service = Self::new();
        {
            let mut state = guard(&service.state);
            for mut record in records {
                let id = match record.id.clone() {
                    Some(id) => id,
                    None => {
                        state.next_id += 1;
                        format!("mem-{}", state.next_id)
                    }
                };
                record.id = Some(id.clone());
                state.records.insert(id, record);
            }
        }
        service
    }

    /// Creating a record for this entity id fails.
    pub fn fail_create_for(&self, entity_id: &str) {
        guard(&self.state).fail_create.insert(entity_id.to_string());
    }

    /// Updating the record with this remote id fails.
    pub fn fail_update_for(&self, id: &str) {
        guard(&self.state).fail_update.insert(id.to_string());
    }

    /// Deleting the record with this remote id fails.
    pub fn fail_delete_for(&self, id: &str) {
        guard(&self.state).fail_delete.insert(id.to_string());
    }

    pub fn records(&self) -> Vec<EnrichmentRecord> {
        guard(&self.state).records.values().cloned().collect()
    }

    /// Remote ids deleted so far, in call order.
    pub fn deleted_ids(&self) -> Vec<String> {
        guard(&self.state).deleted.clone()
    }
}

#[async_trait]
impl ContentService for MemoryContentService {
    async fn list_records(&self) -> Result<Vec<EnrichmentRecord>> {
        Ok(self.records())
    }

    async fn create_record(&self, record: &EnrichmentRecord) -> Result<EnrichmentRecord> {
        let mut state = guard(&self.state);
        if state.fail_create.contains(&record.entity_id) {
            return Err(CatalogSyncError::ContentService(format!(
                "create description for {}: injected failure",
                record.entity_id
            )));
        }
        state.next_id += 1;
        let id = format!("mem-{}", state.next_id);
        let mut created = record.clone();
        created.id = Some(id.clone());
        state.records.insert(id, created.clone());
        Ok(created)
    }

    async fn update_record(&self, id: &str, record: &EnrichmentRecord) -> Result<EnrichmentRecord> {
        let mut state = guard(&self.state);
        if state.fail_update.contains(id) {
            return Err(CatalogSyncError::ContentService(format!(
                "update description {id}: injected failure"
            )));
        }
        if !state.records.contains_key(id) {
            return Err(CatalogSyncError::ContentService(format!(
                "update description {id}: HTTP 404 Not Found"
            )));
        }
        let mut updated = record.clone();
        updated.id = Some(id.to_string());
        state.records.insert(id.to_string(), updated.clone());
        Ok(updated)
    }

    async fn delete_record(&self, id: &str) -> Result<()> {
        let mut state = guard(&self.state);
        if state.fail_delete.contains(id) {
            return Err(CatalogSyncError::ContentService(format!(
                "delete description {id}: injected failure"
            )));
        }
        state.records.remove(id);
        state.deleted.push(id.to_string());
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Commerce
// ---------------------------------------------------------------------------

#[derive(Default)]
struct CommerceState {
    products: BTreeMap<String, CatalogProductRef>,
    categories: Vec<CategoryRef>,
    brands: Vec<BrandRef>,
    upserted: Vec<String>,
}

/// Commerce catalog holding product references and reference data.
#[derive(Default)]
pub struct MemoryCommerceCatalog {
    state: Mutex<CommerceState>,
}

impl MemoryCommerceCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_products(products: impl IntoIterator<Item = CatalogProductRef>) -> Self {
        let catalog = Self::new();
        {
            let mut state = guard(&catalog.state);
            for product in products {
                state.products.insert(product.id.clone(), product);
            }
        }
        catalog
    }

    pub fn set_categories(&self, categories: Vec<CategoryRef>) {
        guard(&self.state).categories = categories;
    }

    pub fn set_brands(&self, brands: Vec<BrandRef>) {
        guard(&self.state).brands = brands;
    }

    /// Drop a product, as if it was delisted upstream.
    pub fn remove_product(&self, id: &str) {
        guard(&self.state).products.remove(id);
    }

    /// Canonical ids upserted so far, in call order.
    pub fn upserted_ids(&self) -> Vec<String> {
        guard(&self.state).upserted.clone()
    }
}

#[async_trait]
impl CommerceCatalog for MemoryCommerceCatalog {
    async fn list_products(&self) -> Result<Vec<CatalogProductRef>> {
        Ok(guard(&self.state).products.values().cloned().collect())
    }

    async fn upsert_product(&self, product: &CanonicalProduct) -> Result<()> {
        let mut state = guard(&self.state);
        let id = product.id.to_string();
        state.products.insert(
            id.clone(),
            CatalogProductRef {
                id: id.clone(),
                handle: product.handle.clone(),
            },
        );
        state.upserted.push(id);
        Ok(())
    }

    async fn list_categories(&self) -> Result<Vec<CategoryRef>> {
        Ok(guard(&self.state).categories.clone())
    }

    async fn list_brands(&self) -> Result<Vec<BrandRef>> {
        Ok(guard(&self.state).brands.clone())
    }
}

// ---------------------------------------------------------------------------
// Search index
// ---------------------------------------------------------------------------

#[derive(Default)]
struct IndexState {
    documents: BTreeMap<String, Value>,
    settings: Option<IndexSettings>,
    fail_ids: BTreeSet<String>,
    upserts: usize,
    deletes: usize,
}

/// Search index holding documents by id.
#[derive(Default)]
pub struct MemorySearchIndex {
    state: Mutex<IndexState>,
}

impl MemorySearchIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_documents(documents: impl IntoIterator<Item = Value>) -> Self {
        let index = Self::new();
        {
            let mut state = guard(&index.state);
            for doc in documents {
                if let Some(id) = doc.get("id").and_then(Value::as_str) {
                    state.documents.insert(id.to_string(), doc.clone());
                }
            }
        }
        index
    }

    /// Writes and deletes for this document id fail.
    pub fn fail_for(&self, id: &str) {
        guard(&self.state).fail_ids.insert(id.to_string());
    }

    pub fn clear_failures(&self) {
        guard(&self.state).fail_ids.clear();
    }

    pub fn document(&self, id: &str) -> Option<Value> {
        guard(&self.state).documents.get(id).cloned()
    }

    pub fn documents(&self) -> BTreeMap<String, Value> {
        guard(&self.state).documents.clone()
    }

    pub fn settings(&self) -> Option<IndexSettings> {
        guard(&self.state).settings.clone()
    }

    /// Successful upserts so far.
    pub fn upsert_count(&self) -> usize {
        guard(&self.state).upserts
    }

    pub fn delete_count(&self) -> usize {
        guard(&self.state).deletes
    }
}

#[async_trait]
impl SearchIndex for MemorySearchIndex {
    async fn configure(&self, settings: &IndexSettings) -> Result<()> {
        guard(&self.state).settings = Some(settings.clone());
        Ok(())
    }

    async fn upsert_document(&self, document: &Value) -> Result<()> {
        let id = document
            .get("id")
            .and_then(Value::as_str)
            .ok_or_else(|| CatalogSyncError::IndexSync("document has no string id".into()))?
            .to_string();
        let mut state = guard(&self.state);
        if state.fail_ids.contains(&id) {
            return Err(CatalogSyncError::IndexSync(format!(
                "upsert document {id}: injected failure"
            )));
        }
        state.documents.insert(id, document.clone());
        state.upserts += 1;
        Ok(())
    }

    async fn delete_document(&self, id: &str) -> Result<()> {
        let mut state = guard(&self.state);
        if state.fail_ids.contains(id) {
            return Err(CatalogSyncError::IndexSync(format!(
                "delete document {id}: injected failure"
            )));
        }
        if state.documents.remove(id).is_some() {
            state.deletes += 1;
        }
        Ok(())
    }

    async fn get_document(&self, id: &str) -> Result<Option<Value>> {
        Ok(self.document(id))
    }

    async fn list_document_ids(&self) -> Result<Vec<String>> {
        Ok(guard(&self.state).documents.keys().cloned().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use catalogsync_shared::{EntityKind, SyncStatus};

    fn record(entity_id: &str) -> EnrichmentRecord {
        EnrichmentRecord {
            id: None,
            entity_kind: EntityKind::Product,
            entity_id: entity_id.into(),
            handle: None,
            description: "d".into(),
            seo_title: String::new(),
            seo_description: String::new(),
            keywords: vec![],
            sync_status: SyncStatus::Pending,
            last_synced_at: None,
            source_hash: None,
        }
    }

    #[tokio::test]
    async fn content_assigns_ids_and_injects_failures() {
        let service = MemoryContentService::with_records([record("prod_1")]);
        let created = service.create_record(&record("prod_2")).await.unwrap();
        assert_eq!(created.id.as_deref(), Some("mem-2"));

        service.fail_create_for("prod_3");
        assert!(service.create_record(&record("prod_3")).await.is_err());

        service.delete_record("mem-1").await.unwrap();
        assert_eq!(service.records().len(), 1);
        assert_eq!(service.deleted_ids(), vec!["mem-1"]);
    }

    #[tokio::test]
    async fn index_counts_writes_and_fails_on_request() {
        let index = MemorySearchIndex::new();
        index
            .upsert_document(&serde_json::json!({"id": "prod_1"}))
            .await
            .unwrap();
        index.fail_for("prod_2");
        assert!(
            index
                .upsert_document(&serde_json::json!({"id": "prod_2"}))
                .await
                .is_err()
        );
        assert_eq!(index.upsert_count(), 1);
        assert_eq!(index.list_document_ids().await.unwrap(), vec!["prod_1"]);
    }
}
