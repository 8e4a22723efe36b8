//! Index documents and the synchronizer that publishes them.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use scraper::Html;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use tracing::{info, instrument, warn};

use catalogsync_services::{IndexSettings, SearchIndex};
use catalogsync_shared::{
    BrandRef, CanonicalProduct, CategoryPath, CategoryRef, EnrichmentRecord, IndexBrand,
    IndexDocument, MarketConfig, Result, RunStatus, option_field, price_field,
};
use catalogsync_storage::Storage;
use catalogsync_transform::round_to;

use crate::pool::{PoolConfig, run_bounded};

// ---------------------------------------------------------------------------
// Reference data
// ---------------------------------------------------------------------------

/// Category and brand references from the commerce catalog, keyed by handle.
#[derive(Debug, Clone, Default)]
pub struct CatalogRefs {
    categories: BTreeMap<String, CategoryRef>,
    brands: BTreeMap<String, BrandRef>,
}

impl CatalogRefs {
    pub fn new(categories: Vec<CategoryRef>, brands: Vec<BrandRef>) -> Self {
        Self {
            categories: categories.into_iter().map(|c| (c.handle.clone(), c)).collect(),
            brands: brands.into_iter().map(|b| (b.handle.clone(), b)).collect(),
        }
    }

    /// Category id per path level. Levels the catalog does not know fall back
    /// to their handle.
    pub fn category_ids(&self, path: &CategoryPath) -> Vec<String> {
        path.handles
            .iter()
            .map(|handle| {
                self.categories
                    .get(handle)
                    .map(|c| c.id.clone())
                    .unwrap_or_else(|| handle.clone())
            })
            .collect()
    }

    /// The catalog's brand for the product's vendor, or one synthesized from
    /// the vendor name.
    pub fn brand(&self, product: &CanonicalProduct) -> IndexBrand {
        let handle = product.brand_handle();
        match self.brands.get(&handle) {
            Some(brand) => IndexBrand {
                id: brand.id.clone(),
                handle: brand.handle.clone(),
                name: brand.name.clone(),
                logo_url: brand.logo_url.clone(),
            },
            None => IndexBrand {
                id: format!("brand_{handle}"),
                name: product.vendor.trim().to_string(),
                handle,
                logo_url: None,
            },
        }
    }

    pub fn brand_handles(&self) -> impl Iterator<Item = &str> {
        self.brands.keys().map(String::as_str)
    }
}

// ---------------------------------------------------------------------------
// Document building
// ---------------------------------------------------------------------------

/// Build the index document for one enriched product.
///
/// Pure: identical inputs serialize to identical bytes.
pub fn build_document(
    product: &CanonicalProduct,
    record: &EnrichmentRecord,
    brand: IndexBrand,
    markets: &[MarketConfig],
    category_ids: Vec<String>,
) -> IndexDocument {
    let base_price = product
        .variants
        .iter()
        .map(|v| v.price)
        .fold(None, |low: Option<f64>, p| Some(low.map_or(p, |l| l.min(p))))
        .unwrap_or(0.0);

    let prices = markets
        .iter()
        .map(|m| (price_field(&m.currency), round_to(base_price * m.rate, m.decimals)))
        .collect();

    let mut option_sets: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();
    for variant in &product.variants {
        for (key, value) in &variant.options {
            option_sets
                .entry(option_field(key))
                .or_default()
                .insert(value.clone());
        }
    }

    let stock_quantity = product
        .variants
        .iter()
        .filter_map(|v| v.inventory_quantity)
        .filter(|q| *q > 0)
        .sum::<i64>();

    IndexDocument {
        id: product.id.to_string(),
        title: product.title.clone(),
        handle: product.handle.clone(),
        thumbnail: product.images.first().cloned(),
        created_at: product.first_seen_at.timestamp(),
        on_sale: product.on_sale,
        in_stock: product.variants.iter().any(|v| v.available),
        stock_quantity,
        category_ids,
        category_names: product.category.names.clone(),
        tags: product.tags.clone(),
        collection_ids: product.collections.clone(),
        brand,
        rich_text: rich_text(record),
        variant_skus: product.variants.iter().map(|v| v.sku.clone()).collect(),
        prices,
        options: option_sets
            .into_iter()
            .map(|(k, v)| (k, v.into_iter().collect()))
            .collect(),
    }
}

/// Searchable text: description without markup, SEO description, keywords.
pub fn rich_text(record: &EnrichmentRecord) -> String {
    let mut parts = vec![strip_html(&record.description)];
    if !record.seo_description.trim().is_empty() {
        parts.push(record.seo_description.trim().to_string());
    }
    if !record.keywords.is_empty() {
        parts.push(record.keywords.join(" "));
    }
    parts.retain(|p| !p.is_empty());
    parts.join(" ")
}

/// Text content of an HTML fragment with whitespace collapsed.
pub fn strip_html(html: &str) -> String {
    let fragment = Html::parse_fragment(html);
    let text: Vec<&str> = fragment.root_element().text().collect();
    text.join(" ").split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Index attribute lists for a document set.
pub fn settings_for(documents: &[IndexDocument]) -> IndexSettings {
    let mut price_fields = BTreeSet::new();
    let mut option_fields = BTreeSet::new();
    for doc in documents {
        price_fields.extend(doc.prices.keys().cloned());
        option_fields.extend(doc.options.keys().cloned());
    }

    let mut filterable: Vec<String> = [
        "brand.handle",
        "category_ids",
        "collection_ids",
        "in_stock",
        "on_sale",
        "tags",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect();
    filterable.extend(price_fields.iter().cloned());
    filterable.extend(option_fields);

    let mut sortable = vec!["created_at".to_string()];
    sortable.extend(price_fields);

    let searchable = [
        "title",
        "brand.name",
        "category_names",
        "tags",
        "variant_skus",
        "rich_text",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect();

    IndexSettings {
        filterable_attributes: filterable,
        sortable_attributes: sortable,
        searchable_attributes: searchable,
    }
}

/// Hex sha256 of the serialized document.
pub fn document_hash(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("{:x}", hasher.finalize())
}

// ---------------------------------------------------------------------------
// Synchronizer
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexSummary {
    pub upserted: usize,
    pub unchanged: usize,
    pub deleted: usize,
    pub failed: usize,
    pub restored: usize,
    pub rolled_back: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexFailure {
    pub document_id: String,
    pub message: String,
}

/// What one sync did.
#[derive(Debug, Clone, Default)]
pub struct SyncOutcome {
    pub summary: IndexSummary,
    pub failures: Vec<IndexFailure>,
    /// Documents removed from the index as orphans (and not restored).
    pub orphaned: Vec<String>,
    /// Documents now in the index with current content.
    pub indexed: BTreeSet<String>,
}

/// Outcome of restoring a run's snapshot.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RestoreSummary {
    pub restored: usize,
    pub already_restored: usize,
    pub failed: usize,
}

#[derive(Debug, Clone, Copy)]
pub struct SyncOptions {
    pub pool: PoolConfig,
    pub rollback_on_failure: bool,
}

enum IndexOp {
    Upsert(String, Value),
    Delete(String),
}

impl IndexOp {
    fn id(&self) -> &str {
        match self {
            Self::Upsert(id, _) | Self::Delete(id) => id,
        }
    }
}

pub struct IndexSynchronizer {
    index: Arc<dyn SearchIndex>,
    options: SyncOptions,
}

impl IndexSynchronizer {
    pub fn new(index: Arc<dyn SearchIndex>, options: SyncOptions) -> Self {
        Self { index, options }
    }

    /// Make the index hold exactly `documents`.
    ///
    /// Orphans are snapshotted into `storage` before any delete is sent. Any
    /// failed write triggers a restore of that snapshot when rollback is on.
    pub async fn sync(
        &self,
        storage: &Storage,
        run_id: &str,
        documents: &[IndexDocument],
    ) -> Result<SyncOutcome> {
        self.sync_holding(storage, run_id, documents, &BTreeSet::new())
            .await
    }

    /// Like [`sync`](Self::sync), but ids in `held` are never treated as
    /// orphans. Used for live products whose document could not be rebuilt.
    #[instrument(skip_all, fields(run_id = %run_id, documents = documents.len(), held = held.len()))]
    pub async fn sync_holding(
        &self,
        storage: &Storage,
        run_id: &str,
        documents: &[IndexDocument],
        held: &BTreeSet<String>,
    ) -> Result<SyncOutcome> {
        let mut outcome = SyncOutcome::default();

        // --- 1. Settings ---
        self.index.configure(&settings_for(documents)).await?;

        // --- 2. Orphans ---
        let existing: BTreeSet<String> = self.index.list_document_ids().await?.into_iter().collect();
        let live: BTreeSet<&str> = documents.iter().map(|d| d.id.as_str()).collect();
        let orphans: Vec<String> = existing
            .iter()
            .filter(|id| !live.contains(id.as_str()) && !held.contains(*id))
            .cloned()
            .collect();

        // --- 3. Snapshot before delete ---
        let mut snapshot = Vec::with_capacity(orphans.len());
        let mut deletable = Vec::with_capacity(orphans.len());
        for id in orphans {
            match self.index.get_document(&id).await {
                Ok(Some(doc)) => {
                    snapshot.push((id.clone(), doc.to_string()));
                    deletable.push(id);
                }
                Ok(None) => {}
                Err(e) => {
                    warn!(id = %id, error = %e, "cannot snapshot orphan, leaving it in place");
                    outcome.summary.failed += 1;
                    outcome.failures.push(IndexFailure {
                        document_id: id,
                        message: e.to_string(),
                    });
                }
            }
        }
        storage.insert_snapshots(run_id, &snapshot).await?;

        // --- 4. Deletes and upserts ---
        let known_hashes = storage.document_hashes().await?;
        let mut ops: Vec<IndexOp> = deletable.into_iter().map(IndexOp::Delete).collect();
        let mut hashes: BTreeMap<String, String> = BTreeMap::new();
        for doc in documents {
            let bytes = doc.to_json_bytes()?;
            let hash = document_hash(&bytes);
            let unchanged = existing.contains(&doc.id)
                && known_hashes.get(&doc.id).is_some_and(|h| *h == hash);
            if unchanged {
                outcome.summary.unchanged += 1;
                outcome.indexed.insert(doc.id.clone());
                continue;
            }
            hashes.insert(doc.id.clone(), hash);
            ops.push(IndexOp::Upsert(doc.id.clone(), doc.to_value()?));
        }

        let ids: Vec<(bool, String)> = ops
            .iter()
            .map(|op| (matches!(op, IndexOp::Delete(_)), op.id().to_string()))
            .collect();
        let index = self.index.clone();
        let results = run_bounded(ops, self.options.pool, move |op| {
            let index = index.clone();
            async move {
                match op {
                    IndexOp::Upsert(_, value) => index.upsert_document(&value).await,
                    IndexOp::Delete(id) => index.delete_document(&id).await,
                }
            }
        })
        .await;

        for ((is_delete, id), result) in ids.into_iter().zip(results) {
            match result {
                Ok(()) if is_delete => {
                    storage.remove_document_hash(&id).await?;
                    outcome.summary.deleted += 1;
                    outcome.orphaned.push(id);
                }
                Ok(()) => {
                    if let Some(hash) = hashes.get(&id) {
                        storage.set_document_hash(&id, hash, run_id).await?;
                    }
                    outcome.summary.upserted += 1;
                    outcome.indexed.insert(id);
                }
                Err(e) => {
                    warn!(id = %id, delete = is_delete, error = %e, "index write failed");
                    outcome.summary.failed += 1;
                    outcome.failures.push(IndexFailure {
                        document_id: id,
                        message: e.to_string(),
                    });
                }
            }
        }

        // --- 5. Compensation ---
        if outcome.summary.failed > 0 && self.options.rollback_on_failure {
            warn!(failed = outcome.summary.failed, "index sync had failures, restoring deletions");
            let restore = self.restore(storage, run_id).await?;
            outcome.summary.restored = restore.restored;
            outcome.summary.rolled_back = true;
            outcome.orphaned.clear();
            storage.set_run_status(run_id, RunStatus::RolledBack).await?;
        }

        info!(
            upserted = outcome.summary.upserted,
            unchanged = outcome.summary.unchanged,
            deleted = outcome.summary.deleted,
            failed = outcome.summary.failed,
            rolled_back = outcome.summary.rolled_back,
            "index synchronized"
        );
        Ok(outcome)
    }

    /// Put back every document the run deleted that has not been restored yet.
    #[instrument(skip_all, fields(run_id = %run_id))]
    pub async fn restore(&self, storage: &Storage, run_id: &str) -> Result<RestoreSummary> {
        let mut summary = RestoreSummary::default();
        let mut pending = Vec::new();
        for entry in storage.snapshots(run_id).await? {
            if entry.restored {
                summary.already_restored += 1;
                continue;
            }
            match serde_json::from_str::<Value>(&entry.document_json) {
                Ok(doc) => pending.push((entry.document_id, doc)),
                Err(e) => {
                    warn!(id = %entry.document_id, error = %e, "snapshot is not valid JSON");
                    summary.failed += 1;
                }
            }
        }

        let ids: Vec<String> = pending.iter().map(|(id, _)| id.clone()).collect();
        let index = self.index.clone();
        let results = run_bounded(pending, self.options.pool, move |(_, doc)| {
            let index = index.clone();
            async move { index.upsert_document(&doc).await }
        })
        .await;

        for (id, result) in ids.into_iter().zip(results) {
            match result {
                Ok(()) => {
                    storage.mark_snapshot_restored(run_id, &id).await?;
                    summary.restored += 1;
                }
                Err(e) => {
                    warn!(id = %id, error = %e, "failed to restore document");
                    summary.failed += 1;
                }
            }
        }

        info!(restored = summary.restored, failed = summary.failed, "snapshot restored");
        Ok(summary)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use catalogsync_services::MemorySearchIndex;
    use catalogsync_shared::{CanonicalId, EntityKind, NormalizedVariant, SyncStatus};
    use chrono::{TimeZone, Utc};
    use std::time::Duration;

    fn variant(id: &str, price: f64, options: &[(&str, &str)], qty: i64) -> NormalizedVariant {
        NormalizedVariant {
            id: id.into(),
            title: id.into(),
            sku: format!("ACM-{id}"),
            price,
            compare_at_price: None,
            on_sale: false,
            options: options
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
            available: qty > 0,
            inventory_quantity: Some(qty),
        }
    }

    fn product(vendor_id: &str) -> CanonicalProduct {
        CanonicalProduct {
            id: CanonicalId::from_vendor_id(vendor_id),
            vendor_id: vendor_id.into(),
            title: "Brass Nozzle".into(),
            handle: format!("brass-nozzle-{vendor_id}"),
            vendor: "Acme".into(),
            product_type: "Nozzle".into(),
            category: CategoryPath {
                handles: vec!["hotends".into(), "nozzles".into()],
                names: vec!["Hotends".into(), "Nozzles".into()],
            },
            variants: vec![
                variant("11", 24.5, &[("Nozzle Type", "V6"), ("Nozzle Size", "0.6mm")], 0),
                variant("12", 19.99, &[("Nozzle Type", "V6"), ("Nozzle Size", "0.4mm")], 3),
            ],
            images: vec!["https://img/a.jpg".into(), "https://img/b.jpg".into()],
            tags: vec!["brass".into()],
            collections: vec!["nozzles".into()],
            body_html: None,
            first_seen_at: Utc.with_ymd_and_hms(2025, 3, 1, 12, 0, 0).unwrap(),
            on_sale: false,
        }
    }

    fn record() -> EnrichmentRecord {
        EnrichmentRecord {
            id: Some("r1".into()),
            entity_kind: EntityKind::Product,
            entity_id: "prod_1".into(),
            handle: None,
            description: "<p>Hardened <b>brass</b>\n nozzle.</p>".into(),
            seo_title: "Brass Nozzle".into(),
            seo_description: "Clean prints.".into(),
            keywords: vec!["brass".into(), "nozzle".into()],
            sync_status: SyncStatus::Synced,
            last_synced_at: None,
            source_hash: None,
        }
    }

    fn markets() -> Vec<MarketConfig> {
        vec![
            MarketConfig {
                currency: "USD".into(),
                rate: 1.0,
                decimals: 2,
            },
            MarketConfig {
                currency: "EUR".into(),
                rate: 0.9,
                decimals: 2,
            },
        ]
    }

    fn document(vendor_id: &str) -> IndexDocument {
        let p = product(vendor_id);
        let refs = CatalogRefs::default();
        build_document(&p, &record(), refs.brand(&p), &markets(), refs.category_ids(&p.category))
    }

    fn synchronizer(index: Arc<MemorySearchIndex>, rollback: bool) -> IndexSynchronizer {
        IndexSynchronizer::new(
            index,
            SyncOptions {
                pool: PoolConfig::new(2, Duration::from_secs(5)),
                rollback_on_failure: rollback,
            },
        )
    }

    #[test]
    fn document_fields_follow_markets_and_options() {
        let doc = document("1");
        assert_eq!(doc.prices["price_usd"], 19.99);
        assert_eq!(doc.prices["price_eur"], 17.99);
        assert_eq!(doc.options["options_nozzle_size"], vec!["0.4mm", "0.6mm"]);
        assert_eq!(doc.options["options_nozzle_type"], vec!["V6"]);
        assert!(doc.in_stock);
        assert_eq!(doc.stock_quantity, 3);
        assert_eq!(doc.thumbnail.as_deref(), Some("https://img/a.jpg"));
        assert_eq!(doc.rich_text, "Hardened brass nozzle. Clean prints. brass nozzle");
        assert_eq!(doc.brand.id, "brand_acme");
        assert_eq!(doc.category_ids, vec!["hotends", "nozzles"]);

        let value = doc.to_value().unwrap();
        assert_eq!(value["price_usd"], 19.99);
        assert!(value.get("prices").is_none());
    }

    #[test]
    fn catalog_refs_resolve_ids_with_handle_fallback() {
        let p = product("1");
        let refs = CatalogRefs::new(
            vec![CategoryRef {
                id: "pcat_9".into(),
                handle: "nozzles".into(),
                name: "Nozzles".into(),
            }],
            vec![BrandRef {
                id: "brand_7".into(),
                handle: "acme".into(),
                name: "ACME".into(),
                logo_url: Some("https://img/acme.png".into()),
            }],
        );
        assert_eq!(refs.category_ids(&p.category), vec!["hotends", "pcat_9"]);
        let brand = refs.brand(&p);
        assert_eq!(brand.id, "brand_7");
        assert_eq!(brand.name, "ACME");
    }

    #[test]
    fn identical_input_serializes_identically() {
        assert_eq!(
            document("1").to_json_bytes().unwrap(),
            document("1").to_json_bytes().unwrap()
        );
    }

    #[test]
    fn settings_cover_dynamic_fields() {
        let settings = settings_for(&[document("1")]);
        assert!(settings.filterable_attributes.contains(&"price_eur".to_string()));
        assert!(settings.filterable_attributes.contains(&"options_nozzle_size".to_string()));
        assert!(settings.sortable_attributes.contains(&"price_usd".to_string()));
    }

    #[tokio::test]
    async fn sync_upserts_and_removes_orphans_after_snapshot() {
        let index = Arc::new(MemorySearchIndex::with_documents([
            serde_json::json!({"id": "prod_old", "title": "Old"}),
        ]));
        let storage = Storage::open_in_memory().await.unwrap();
        let outcome = synchronizer(index.clone(), true)
            .sync(&storage, "run-1", &[document("1")])
            .await
            .unwrap();

        assert_eq!(outcome.summary.upserted, 1);
        assert_eq!(outcome.summary.deleted, 1);
        assert_eq!(outcome.orphaned, vec!["prod_old"]);
        assert!(index.document("prod_old").is_none());
        assert!(index.document("prod_1").is_some());

        let snaps = storage.snapshots("run-1").await.unwrap();
        assert_eq!(snaps.len(), 1);
        assert!(snaps[0].document_json.contains("Old"));
        assert!(index.settings().is_some());
    }

    #[tokio::test]
    async fn unchanged_documents_are_not_resent() {
        let index = Arc::new(MemorySearchIndex::new());
        let storage = Storage::open_in_memory().await.unwrap();
        let sync = synchronizer(index.clone(), true);

        sync.sync(&storage, "run-1", &[document("1")]).await.unwrap();
        let second = sync.sync(&storage, "run-2", &[document("1")]).await.unwrap();

        assert_eq!(second.summary.unchanged, 1);
        assert_eq!(second.summary.upserted, 0);
        assert_eq!(index.upsert_count(), 1);
        assert!(second.indexed.contains("prod_1"));
    }

    #[tokio::test]
    async fn failed_write_rolls_back_deletions() {
        let index = Arc::new(MemorySearchIndex::with_documents([
            serde_json::json!({"id": "prod_old", "title": "Old"}),
        ]));
        index.fail_for("prod_2");
        let storage = Storage::open_in_memory().await.unwrap();

        let outcome = synchronizer(index.clone(), true)
            .sync(&storage, "run-1", &[document("1"), document("2")])
            .await
            .unwrap();

        assert_eq!(outcome.summary.failed, 1);
        assert!(outcome.summary.rolled_back);
        assert_eq!(outcome.summary.restored, 1);
        assert!(outcome.orphaned.is_empty());
        assert_eq!(index.document("prod_old").unwrap()["title"], "Old");
        assert!(storage.snapshots("run-1").await.unwrap()[0].restored);
    }

    #[tokio::test]
    async fn restore_is_idempotent() {
        let index = Arc::new(MemorySearchIndex::with_documents([
            serde_json::json!({"id": "prod_old", "title": "Old"}),
        ]));
        let storage = Storage::open_in_memory().await.unwrap();
        let sync = synchronizer(index.clone(), false);
        sync.sync(&storage, "run-1", &[document("1")]).await.unwrap();
        assert!(index.document("prod_old").is_none());

        let first = sync.restore(&storage, "run-1").await.unwrap();
        assert_eq!(first.restored, 1);
        let second = sync.restore(&storage, "run-1").await.unwrap();
        assert_eq!(second.restored, 0);
        assert_eq!(second.already_restored, 1);
        assert!(index.document("prod_old").is_some());
    }

    #[tokio::test]
    async fn held_documents_survive_sync() {
        let index = Arc::new(MemorySearchIndex::with_documents([
            serde_json::json!({"id": "prod_9", "title": "Kept"}),
        ]));
        let storage = Storage::open_in_memory().await.unwrap();
        let held = BTreeSet::from(["prod_9".to_string()]);

        let outcome = synchronizer(index.clone(), true)
            .sync_holding(&storage, "run-1", &[document("1")], &held)
            .await
            .unwrap();

        assert_eq!(outcome.summary.deleted, 0);
        assert!(index.document("prod_9").is_some());
        assert!(storage.snapshots("run-1").await.unwrap().is_empty());
    }
}
