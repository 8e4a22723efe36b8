//! Enrichment merger.
//!
//! Reconciles canonical products and their brands against the description
//! records held by the content service, in two passes:
//!
//! 1. entity to content: every product and brand gets a record. Existing ones
//!    are matched by entity id, then by handle. Stale ones are flagged
//!    `outdated`, missing ones are synthesized and created as `pending`.
//! 2. content to entity: records whose entity the commerce catalog no longer
//!    lists are deleted.
//!
//! Upstream writes run on the bounded pool. One failed write never aborts the
//! others.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{info, instrument, warn};

use catalogsync_services::ContentService;
use catalogsync_shared::{
    CanonicalProduct, EnrichmentConfig, EnrichmentRecord, EntityKind, Result, SyncStatus,
    content_hash, slugify,
};
use catalogsync_storage::Storage;

use crate::pool::{PoolConfig, run_bounded};

/// Longest SEO title we synthesize.
const SEO_TITLE_LIMIT: usize = 60;
/// Longest SEO description we synthesize.
const SEO_DESCRIPTION_LIMIT: usize = 155;

// ---------------------------------------------------------------------------
// Inputs
// ---------------------------------------------------------------------------

/// A brand as the pipeline sees it: derived from the vendors of live products.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrandEntity {
    pub handle: String,
    pub name: String,
    pub product_types: BTreeSet<String>,
}

impl BrandEntity {
    /// One brand per distinct vendor handle, ordered by handle.
    pub fn from_products(products: &[CanonicalProduct]) -> Vec<Self> {
        let mut brands: BTreeMap<String, BrandEntity> = BTreeMap::new();
        for product in products {
            let handle = product.brand_handle();
            if handle.is_empty() {
                continue;
            }
            let brand = brands.entry(handle.clone()).or_insert_with(|| BrandEntity {
                handle,
                name: product.vendor.trim().to_string(),
                product_types: BTreeSet::new(),
            });
            if !product.product_type.trim().is_empty() {
                brand.product_types.insert(product.product_type.trim().to_string());
            }
        }
        brands.into_values().collect()
    }

    pub fn content_hash(&self) -> String {
        let types: Vec<&str> = self.product_types.iter().map(String::as_str).collect();
        content_hash(&[self.name.as_str(), &types.join(",")])
    }
}

/// What the commerce catalog says is live.
#[derive(Debug, Clone, Default)]
pub struct Authority {
    pub product_ids: BTreeSet<String>,
    pub brand_handles: BTreeSet<String>,
}

// ---------------------------------------------------------------------------
// Outputs
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnrichmentOutcome {
    Current,
    Outdated,
    Created,
    Failed,
}

/// Counts for the run report.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnrichmentSummary {
    pub current: usize,
    pub outdated: usize,
    pub created: usize,
    pub deleted: usize,
    pub failed: usize,
}

impl EnrichmentSummary {
    fn count(&mut self, outcome: EnrichmentOutcome) {
        match outcome {
            EnrichmentOutcome::Current => self.current += 1,
            EnrichmentOutcome::Outdated => self.outdated += 1,
            EnrichmentOutcome::Created => self.created += 1,
            EnrichmentOutcome::Failed => self.failed += 1,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnrichmentFailure {
    pub entity_kind: EntityKind,
    pub entity_id: String,
    pub message: String,
}

/// Result of one reconciliation.
#[derive(Debug, Clone, Default)]
pub struct EnrichmentResult {
    /// Per canonical id, the record the index should use, or why there is none.
    pub products: BTreeMap<String, std::result::Result<EnrichmentRecord, String>>,
    /// Per brand handle.
    pub brands: BTreeMap<String, EnrichmentRecord>,
    pub summary: EnrichmentSummary,
    pub failures: Vec<EnrichmentFailure>,
}

// ---------------------------------------------------------------------------
// Merger
// ---------------------------------------------------------------------------

/// One product or brand being reconciled.
struct Entity {
    kind: EntityKind,
    id: String,
    handle: String,
    hash: String,
    draft: EnrichmentRecord,
}

/// Pass-1 decision for one entity.
enum Step {
    Keep(EnrichmentRecord, EnrichmentOutcome),
    MarkOutdated {
        remote_id: String,
        previous: EnrichmentRecord,
        updated: EnrichmentRecord,
    },
    Create(EnrichmentRecord),
}

enum WriteOp {
    Update(String, EnrichmentRecord),
    Create(EnrichmentRecord),
}

pub struct EnrichmentMerger {
    content: Arc<dyn ContentService>,
    config: EnrichmentConfig,
    pool: PoolConfig,
}

impl EnrichmentMerger {
    pub fn new(content: Arc<dyn ContentService>, config: EnrichmentConfig, pool: PoolConfig) -> Self {
        Self {
            content,
            config,
            pool,
        }
    }

    /// Reconcile `products` and `brands` against the content service.
    ///
    /// Fails only if the record listing itself cannot be read. When `mirror`
    /// is given, the post-reconciliation record set replaces the local mirror.
    #[instrument(skip_all, fields(products = products.len(), brands = brands.len()))]
    pub async fn reconcile(
        &self,
        products: &[CanonicalProduct],
        brands: &[BrandEntity],
        authority: &Authority,
        mirror: Option<&Storage>,
    ) -> Result<EnrichmentResult> {
        let listed = self.content.list_records().await?;
        info!(records = listed.len(), "loaded description records");

        let entities: Vec<Entity> = products
            .iter()
            .map(|p| self.product_entity(p))
            .chain(brands.iter().map(|b| self.brand_entity(b)))
            .collect();

        // --- Pass 1: entity -> content ---
        // Id matches are settled for every entity before any handle fallback runs.
        let mut claimed: HashMap<usize, String> = HashMap::new();
        let steps: Vec<Step> = {
            let mut by_id: HashMap<(EntityKind, &str), usize> = HashMap::new();
            let mut by_handle: HashMap<(EntityKind, &str), usize> = HashMap::new();
            for (i, record) in listed.iter().enumerate() {
                by_id.entry((record.entity_kind, record.entity_id.as_str())).or_insert(i);
                if let Some(handle) = record.handle.as_deref() {
                    by_handle.entry((record.entity_kind, handle)).or_insert(i);
                }
            }

            let mut matches: Vec<Option<(usize, bool)>> = entities
                .iter()
                .map(|entity| {
                    let i = by_id.get(&(entity.kind, entity.id.as_str())).copied()?;
                    if claimed.contains_key(&i) {
                        return None;
                    }
                    claimed.insert(i, entity.id.clone());
                    Some((i, false))
                })
                .collect();

            for (entity, matched) in entities.iter().zip(matches.iter_mut()) {
                if matched.is_some() {
                    continue;
                }
                let Some(i) = by_handle.get(&(entity.kind, entity.handle.as_str())).copied() else {
                    continue;
                };
                if !claimed.contains_key(&i) {
                    claimed.insert(i, entity.id.clone());
                    *matched = Some((i, true));
                }
            }

            entities
                .iter()
                .zip(matches)
                .map(|(entity, matched)| match matched {
                    Some((i, via_handle)) => plan_existing(entity, &listed[i], via_handle),
                    None => Step::Create(entity.draft.clone()),
                })
                .collect()
        };

        // --- Upstream writes for pass 1 ---
        let mut ops: Vec<WriteOp> = Vec::new();
        let mut op_owner: Vec<usize> = Vec::new();
        for (i, step) in steps.iter().enumerate() {
            match step {
                Step::Keep(..) => {}
                Step::MarkOutdated {
                    remote_id, updated, ..
                } => {
                    ops.push(WriteOp::Update(remote_id.clone(), updated.clone()));
                    op_owner.push(i);
                }
                Step::Create(draft) => {
                    ops.push(WriteOp::Create(draft.clone()));
                    op_owner.push(i);
                }
            }
        }

        let content = self.content.clone();
        let written = run_bounded(ops, self.pool, move |op| {
            let content = content.clone();
            async move {
                match op {
                    WriteOp::Update(id, record) => content.update_record(&id, &record).await,
                    WriteOp::Create(record) => content.create_record(&record).await,
                }
            }
        })
        .await;
        let mut write_results: HashMap<usize, std::result::Result<EnrichmentRecord, String>> =
            op_owner
                .into_iter()
                .zip(written)
                .map(|(owner, r)| (owner, r.map_err(|e| e.to_string())))
                .collect();

        // --- Resolve what each entity ends up with ---
        let mut result = EnrichmentResult::default();
        let mut surviving: BTreeMap<String, EnrichmentRecord> = BTreeMap::new();
        for (i, (entity, step)) in entities.iter().zip(steps).enumerate() {
            let (resolved, outcome) = match step {
                Step::Keep(record, outcome) => (Ok(record), outcome),
                Step::MarkOutdated { previous, .. } => match write_results.remove(&i) {
                    Some(Ok(written)) => (Ok(written), EnrichmentOutcome::Outdated),
                    Some(Err(message)) => {
                        warn!(entity = %entity.id, error = %message, "failed to flag description outdated");
                        result.failures.push(failure(entity, &message));
                        // The existing content is still usable.
                        (Ok(previous), EnrichmentOutcome::Failed)
                    }
                    None => (Ok(previous), EnrichmentOutcome::Failed),
                },
                Step::Create(_) => match write_results.remove(&i) {
                    Some(Ok(created)) => (Ok(created), EnrichmentOutcome::Created),
                    Some(Err(message)) => {
                        warn!(entity = %entity.id, error = %message, "failed to create description");
                        result.failures.push(failure(entity, &message));
                        (Err(message), EnrichmentOutcome::Failed)
                    }
                    None => (
                        Err("description write was not attempted".to_string()),
                        EnrichmentOutcome::Failed,
                    ),
                },
            };
            result.summary.count(outcome);

            if let Ok(record) = &resolved {
                if let Some(remote_id) = record.id.clone() {
                    surviving.insert(remote_id, record.clone());
                }
            }
            match entity.kind {
                EntityKind::Product => {
                    result.products.insert(entity.id.clone(), resolved);
                }
                EntityKind::Brand => {
                    if let Ok(record) = resolved {
                        result.brands.insert(entity.id.clone(), record);
                    }
                }
            }
        }

        // --- Pass 2: content -> entity ---
        let mut orphans: Vec<EnrichmentRecord> = Vec::new();
        for (i, record) in listed.iter().enumerate() {
            let effective_id = claimed.get(&i).map(String::as_str).unwrap_or(&record.entity_id);
            let live = match record.entity_kind {
                EntityKind::Product => authority.product_ids.contains(effective_id),
                EntityKind::Brand => authority.brand_handles.contains(effective_id),
            };
            match (&record.id, live) {
                (Some(remote_id), true) => {
                    surviving.entry(remote_id.clone()).or_insert_with(|| record.clone());
                }
                (Some(_), false) => orphans.push(record.clone()),
                (None, _) => {}
            }
        }

        let orphan_ids: Vec<String> = orphans.iter().filter_map(|r| r.id.clone()).collect();
        let content = self.content.clone();
        let deleted = run_bounded(orphan_ids.clone(), self.pool, move |id| {
            let content = content.clone();
            async move { content.delete_record(&id).await }
        })
        .await;

        for ((remote_id, record), outcome) in orphan_ids.iter().zip(&orphans).zip(deleted) {
            match outcome {
                Ok(()) => {
                    result.summary.deleted += 1;
                }
                Err(e) => {
                    warn!(remote_id = %remote_id, error = %e, "failed to delete orphaned description");
                    result.summary.failed += 1;
                    result.failures.push(EnrichmentFailure {
                        entity_kind: record.entity_kind,
                        entity_id: record.entity_id.clone(),
                        message: e.to_string(),
                    });
                    surviving.insert(remote_id.clone(), record.clone());
                }
            }
        }

        if let Some(storage) = mirror {
            let records: Vec<EnrichmentRecord> = surviving.into_values().collect();
            storage.replace_enrichment_mirror(&records).await?;
        }

        info!(
            current = result.summary.current,
            outdated = result.summary.outdated,
            created = result.summary.created,
            deleted = result.summary.deleted,
            failed = result.summary.failed,
            "enrichment reconciled"
        );
        Ok(result)
    }

    fn product_entity(&self, product: &CanonicalProduct) -> Entity {
        let hash = product.content_hash();
        Entity {
            kind: EntityKind::Product,
            id: product.id.to_string(),
            handle: product.handle.clone(),
            draft: synthesize_product(product, &self.config, &hash),
            hash,
        }
    }

    fn brand_entity(&self, brand: &BrandEntity) -> Entity {
        let hash = brand.content_hash();
        Entity {
            kind: EntityKind::Brand,
            id: brand.handle.clone(),
            handle: brand.handle.clone(),
            draft: synthesize_brand(brand, &self.config, &hash),
            hash,
        }
    }
}

fn failure(entity: &Entity, message: &str) -> EnrichmentFailure {
    EnrichmentFailure {
        entity_kind: entity.kind,
        entity_id: entity.id.clone(),
        message: message.to_string(),
    }
}

/// Decide what to do with the record matched to `entity`.
fn plan_existing(entity: &Entity, record: &EnrichmentRecord, via_handle: bool) -> Step {
    let hash_matches = record.source_hash.as_deref() == Some(entity.hash.as_str());

    if hash_matches && !via_handle {
        let outcome = match record.sync_status {
            SyncStatus::Synced | SyncStatus::Pending => EnrichmentOutcome::Current,
            // Already flagged, still waiting for an author.
            SyncStatus::Outdated => EnrichmentOutcome::Outdated,
        };
        return Step::Keep(record.clone(), outcome);
    }

    let Some(remote_id) = record.id.clone() else {
        return Step::Create(entity.draft.clone());
    };

    let mut updated = record.clone();
    updated.entity_id = entity.id.clone();
    updated.handle = Some(entity.handle.clone());
    updated.sync_status = SyncStatus::Outdated;
    updated.source_hash = Some(entity.hash.clone());

    Step::MarkOutdated {
        remote_id,
        previous: record.clone(),
        updated,
    }
}

// ---------------------------------------------------------------------------
// Default content
// ---------------------------------------------------------------------------

/// Default description for a product nobody has written one for yet.
pub fn synthesize_product(
    product: &CanonicalProduct,
    config: &EnrichmentConfig,
    source_hash: &str,
) -> EnrichmentRecord {
    let title = product.title.trim();
    let vendor = product.vendor.trim();
    let category = product.category.leaf_name();
    let feature = render_template(
        config.template_for(product.category.leaf_handle()),
        title,
        vendor,
        category,
    );
    let summary = format!("{title} by {vendor}. {feature}");

    let mut sources: Vec<&str> = vec![title, vendor, category, product.product_type.as_str()];
    sources.extend(product.tags.iter().map(String::as_str));

    EnrichmentRecord {
        id: None,
        entity_kind: EntityKind::Product,
        entity_id: product.id.to_string(),
        handle: Some(product.handle.clone()),
        description: format!("<p>{}</p>", escape_html(&summary)),
        seo_title: truncate_chars(&format!("{title} | {vendor}"), SEO_TITLE_LIMIT),
        seo_description: truncate_chars(&summary, SEO_DESCRIPTION_LIMIT),
        keywords: derive_keywords(&sources, config.max_keywords),
        sync_status: SyncStatus::Pending,
        last_synced_at: None,
        source_hash: Some(source_hash.to_string()),
    }
}

/// Default description for a brand.
pub fn synthesize_brand(
    brand: &BrandEntity,
    config: &EnrichmentConfig,
    source_hash: &str,
) -> EnrichmentRecord {
    let types: Vec<&str> = brand.product_types.iter().map(String::as_str).collect();
    let summary = if types.is_empty() {
        format!("Products by {}.", brand.name)
    } else {
        format!("{} makes {}.", brand.name, types.join(", ").to_lowercase())
    };

    let mut sources: Vec<&str> = vec![brand.name.as_str()];
    sources.extend(types.iter().copied());

    EnrichmentRecord {
        id: None,
        entity_kind: EntityKind::Brand,
        entity_id: brand.handle.clone(),
        handle: Some(brand.handle.clone()),
        description: format!("<p>{}</p>", escape_html(&summary)),
        seo_title: truncate_chars(&brand.name, SEO_TITLE_LIMIT),
        seo_description: truncate_chars(&summary, SEO_DESCRIPTION_LIMIT),
        keywords: derive_keywords(&sources, config.max_keywords),
        sync_status: SyncStatus::Pending,
        last_synced_at: None,
        source_hash: Some(source_hash.to_string()),
    }
}

/// Fill `{title}`, `{vendor}` and `{category}` placeholders.
fn render_template(template: &str, title: &str, vendor: &str, category: &str) -> String {
    template
        .replace("{title}", title)
        .replace("{vendor}", vendor)
        .replace("{category}", category)
}

/// Lower-case slug words of every source, first occurrence wins.
fn derive_keywords(sources: &[&str], max: usize) -> Vec<String> {
    let mut seen = HashSet::new();
    let mut keywords = Vec::new();
    for source in sources {
        for word in slugify(source).split('-') {
            if keywords.len() >= max {
                return keywords;
            }
            if word.len() < 3 || word.chars().all(|c| c.is_ascii_digit()) {
                continue;
            }
            if seen.insert(word.to_string()) {
                keywords.push(word.to_string());
            }
        }
    }
    keywords
}

fn escape_html(text: &str) -> String {
    text.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
}

/// Cut to at most `max_chars` characters, on a char boundary.
fn truncate_chars(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    let cut: String = text.chars().take(max_chars.saturating_sub(1)).collect();
    format!("{}…", cut.trim_end())
}

#[cfg(test)]
mod tests {
    use super::*;
    use catalogsync_services::MemoryContentService;
    use catalogsync_shared::{CanonicalId, CategoryPath};
    use chrono::{TimeZone, Utc};
    use std::time::Duration;

    fn product(vendor_id: &str, handle: &str) -> CanonicalProduct {
        CanonicalProduct {
            id: CanonicalId::from_vendor_id(vendor_id),
            vendor_id: vendor_id.into(),
            title: "Brass Nozzle".into(),
            handle: handle.into(),
            vendor: "Acme Hotends".into(),
            product_type: "Nozzle".into(),
            category: CategoryPath {
                handles: vec!["hotends".into(), "nozzles".into()],
                names: vec!["Hotends".into(), "Nozzles".into()],
            },
            variants: vec![],
            images: vec!["https://img/1.jpg".into()],
            tags: vec!["brass".into(), "v6".into()],
            collections: vec!["nozzles".into()],
            body_html: None,
            first_seen_at: Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap(),
            on_sale: false,
        }
    }

    fn merger(content: Arc<MemoryContentService>) -> EnrichmentMerger {
        let mut config = EnrichmentConfig::default();
        config
            .templates
            .insert("nozzles".into(), "Machined for clean {category} swaps.".into());
        EnrichmentMerger::new(content, config, PoolConfig::new(2, Duration::from_secs(5)))
    }

    fn authority(products: &[&CanonicalProduct]) -> Authority {
        Authority {
            product_ids: products.iter().map(|p| p.id.to_string()).collect(),
            brand_handles: products.iter().map(|p| p.brand_handle()).collect(),
        }
    }

    fn existing(product: &CanonicalProduct, remote_id: &str, status: SyncStatus) -> EnrichmentRecord {
        EnrichmentRecord {
            id: Some(remote_id.into()),
            entity_kind: EntityKind::Product,
            entity_id: product.id.to_string(),
            handle: Some(product.handle.clone()),
            description: "<p>Authored copy.</p>".into(),
            seo_title: "Authored".into(),
            seo_description: "Authored.".into(),
            keywords: vec!["authored".into()],
            sync_status: status,
            last_synced_at: None,
            source_hash: Some(product.content_hash()),
        }
    }

    #[tokio::test]
    async fn missing_records_are_created_pending() {
        let content = Arc::new(MemoryContentService::new());
        let p = product("1", "brass-nozzle");
        let result = merger(content.clone())
            .reconcile(std::slice::from_ref(&p), &[], &authority(&[&p]), None)
            .await
            .unwrap();

        assert_eq!(result.summary.created, 1);
        let record = result.products[p.id.as_str()].as_ref().unwrap();
        assert_eq!(record.sync_status, SyncStatus::Pending);
        assert!(record.id.is_some());
        assert_eq!(record.source_hash.as_deref(), Some(p.content_hash().as_str()));
        assert!(record.description.contains("Brass Nozzle by Acme Hotends."));
        assert!(record.description.contains("Machined for clean Nozzles swaps."));
        assert!(record.keywords.contains(&"brass".to_string()));
        assert_eq!(content.records().len(), 1);
    }

    #[tokio::test]
    async fn current_record_is_left_alone() {
        let p = product("1", "brass-nozzle");
        let content = Arc::new(MemoryContentService::with_records([existing(
            &p,
            "r1",
            SyncStatus::Synced,
        )]));
        // Any write to r1 would fail, so a pass proves nothing was written.
        content.fail_update_for("r1");

        let result = merger(content.clone())
            .reconcile(std::slice::from_ref(&p), &[], &authority(&[&p]), None)
            .await
            .unwrap();

        assert_eq!(result.summary.current, 1);
        assert_eq!(result.summary.failed, 0);
        let record = result.products[p.id.as_str()].as_ref().unwrap();
        assert_eq!(record.description, "<p>Authored copy.</p>");
    }

    #[tokio::test]
    async fn changed_source_marks_record_outdated() {
        let p = product("1", "brass-nozzle");
        let mut stale = existing(&p, "r1", SyncStatus::Synced);
        stale.source_hash = Some("old".into());
        let content = Arc::new(MemoryContentService::with_records([stale]));

        let result = merger(content.clone())
            .reconcile(std::slice::from_ref(&p), &[], &authority(&[&p]), None)
            .await
            .unwrap();

        assert_eq!(result.summary.outdated, 1);
        let upstream = &content.records()[0];
        assert_eq!(upstream.sync_status, SyncStatus::Outdated);
        assert_eq!(upstream.description, "<p>Authored copy.</p>");
        assert_eq!(upstream.source_hash.as_deref(), Some(p.content_hash().as_str()));
    }

    #[tokio::test]
    async fn handle_match_relinks_entity_id() {
        let p = product("1", "brass-nozzle");
        let mut legacy = existing(&p, "r1", SyncStatus::Synced);
        legacy.entity_id = "legacy-42".into();
        let content = Arc::new(MemoryContentService::with_records([legacy]));

        let result = merger(content.clone())
            .reconcile(std::slice::from_ref(&p), &[], &authority(&[&p]), None)
            .await
            .unwrap();

        assert_eq!(result.summary.outdated, 1);
        assert_eq!(result.summary.deleted, 0);
        let upstream = &content.records()[0];
        assert_eq!(upstream.entity_id, p.id.as_str());
        assert_eq!(upstream.sync_status, SyncStatus::Outdated);
    }

    #[tokio::test]
    async fn id_match_wins_over_an_earlier_handle_match() {
        let first = product("1", "a");
        let second = product("2", "b");
        let mut owned = existing(&second, "r2", SyncStatus::Synced);
        owned.handle = Some("a".into());
        owned.description = "<p>Second authored.</p>".into();
        let content = Arc::new(MemoryContentService::with_records([owned]));

        let result = merger(content.clone())
            .reconcile(
                &[first.clone(), second.clone()],
                &[],
                &authority(&[&first, &second]),
                None,
            )
            .await
            .unwrap();

        assert_eq!(result.summary.created, 1);
        assert_eq!(result.summary.current, 1);
        let kept = result.products[second.id.as_str()].as_ref().unwrap();
        assert_eq!(kept.description, "<p>Second authored.</p>");
        let created = result.products[first.id.as_str()].as_ref().unwrap();
        assert!(created.description.contains("Brass Nozzle by Acme Hotends."));

        let upstream = content.records();
        let r2 = upstream.iter().find(|r| r.id.as_deref() == Some("r2")).unwrap();
        assert_eq!(r2.entity_id, second.id.as_str());
    }

    #[tokio::test]
    async fn orphaned_records_are_deleted_and_live_ones_kept() {
        let live = product("1", "brass-nozzle");
        let gone = product("2", "old-nozzle");
        let content = Arc::new(MemoryContentService::with_records([
            existing(&live, "r1", SyncStatus::Synced),
            existing(&gone, "r2", SyncStatus::Synced),
        ]));

        let result = merger(content.clone())
            .reconcile(std::slice::from_ref(&live), &[], &authority(&[&live]), None)
            .await
            .unwrap();

        assert_eq!(result.summary.deleted, 1);
        assert_eq!(content.deleted_ids(), vec!["r2"]);
        let remaining: Vec<_> = content.records().into_iter().map(|r| r.entity_id).collect();
        assert_eq!(remaining, vec![live.id.to_string()]);
    }

    #[tokio::test]
    async fn one_failed_delete_does_not_stop_the_rest() {
        let live = product("1", "a");
        let gone_a = product("2", "b");
        let gone_b = product("3", "c");
        let content = Arc::new(MemoryContentService::with_records([
            existing(&live, "r1", SyncStatus::Synced),
            existing(&gone_a, "r2", SyncStatus::Synced),
            existing(&gone_b, "r3", SyncStatus::Synced),
        ]));
        content.fail_delete_for("r2");

        let result = merger(content.clone())
            .reconcile(std::slice::from_ref(&live), &[], &authority(&[&live]), None)
            .await
            .unwrap();

        assert_eq!(result.summary.deleted, 1);
        assert_eq!(result.summary.failed, 1);
        assert_eq!(content.deleted_ids(), vec!["r3"]);
    }

    #[tokio::test]
    async fn failed_create_leaves_product_without_enrichment() {
        let p = product("1", "brass-nozzle");
        let content = Arc::new(MemoryContentService::new());
        content.fail_create_for(p.id.as_str());

        let result = merger(content)
            .reconcile(std::slice::from_ref(&p), &[], &authority(&[&p]), None)
            .await
            .unwrap();

        assert_eq!(result.summary.failed, 1);
        assert!(result.products[p.id.as_str()].is_err());
        assert_eq!(result.failures[0].entity_id, p.id.as_str());
    }

    #[tokio::test]
    async fn brands_get_records_and_mirror_is_written() {
        let p = product("1", "brass-nozzle");
        let brands = BrandEntity::from_products(std::slice::from_ref(&p));
        assert_eq!(brands[0].handle, "acme-hotends");

        let content = Arc::new(MemoryContentService::new());
        let storage = Storage::open_in_memory().await.unwrap();
        let result = merger(content)
            .reconcile(std::slice::from_ref(&p), &brands, &authority(&[&p]), Some(&storage))
            .await
            .unwrap();

        let brand = &result.brands["acme-hotends"];
        assert_eq!(brand.entity_kind, EntityKind::Brand);
        assert!(brand.description.contains("Acme Hotends makes nozzle."));
        assert_eq!(storage.enrichment_mirror().await.unwrap().len(), 2);
    }

    #[test]
    fn keywords_are_deduplicated_and_capped() {
        let words = derive_keywords(&["Brass Nozzle", "brass", "0.4 mm", "Nozzle Kit"], 3);
        assert_eq!(words, vec!["brass", "nozzle", "kit"]);
    }

    #[test]
    fn truncation_respects_char_boundaries() {
        assert_eq!(truncate_chars("short", 10), "short");
        let cut = truncate_chars("äöüäöüäöüäöü", 5);
        assert_eq!(cut.chars().count(), 5);
        assert!(cut.ends_with('…'));
    }
}
