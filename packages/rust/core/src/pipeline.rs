//! End-to-end catalog run: fetch → dedup → fold → normalize → publish →
//! enrich → index → report.
//!
//! Configuration errors abort before any I/O. Everything after that degrades
//! per item and ends up in the [`RunReport`]; only storage failures abort a run.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde_json::json;
use tracing::{info, instrument, warn};
use uuid::Uuid;

use catalogsync_fetcher::{FetcherConfig, SourceSpec, VendorFetcher};
use catalogsync_services::{
    CommerceCatalog, ContentService, HttpCommerceCatalog, HttpContentService, HttpSearchIndex,
    MemoryCommerceCatalog, MemoryContentService, MemorySearchIndex, SearchIndex,
};
use catalogsync_shared::{
    AppConfig, Batch, Candidate, CanonicalId, CanonicalProduct, CatalogSyncError, ProductState,
    Result, RunStatus, ServiceConfig, VendorProduct,
};
use catalogsync_storage::{
    BatchStore, DB_FILE_NAME, FileBatchStore, MemoryBatchStore, RunLock, Storage,
};
use catalogsync_transform::{
    DedupEngine, DedupPolicy, Disposition, Normalizer, OptionRules, SkipEntry, SkipReason,
    Taxonomy, fold_history,
};

use crate::enrichment::{Authority, BrandEntity, EnrichmentMerger};
use crate::index::{CatalogRefs, IndexSynchronizer, RestoreSummary, SyncOptions, build_document};
use crate::pool::{PoolConfig, run_bounded};
use crate::report::{LifecycleTracker, Reporter, RunReport};

// ---------------------------------------------------------------------------
// Progress
// ---------------------------------------------------------------------------

/// Progress callback for reporting pipeline status.
pub trait ProgressReporter: Send + Sync {
    /// Called when entering a new stage.
    fn phase(&self, name: &str);
    /// Called as items of the current stage are processed.
    fn items(&self, current: usize, total: usize);
    /// Called when the run completes.
    fn done(&self, report: &RunReport);
}

/// No-op progress reporter for headless/test usage.
pub struct SilentProgress;

impl ProgressReporter for SilentProgress {
    fn phase(&self, _name: &str) {}
    fn items(&self, _current: usize, _total: usize) {}
    fn done(&self, _report: &RunReport) {}
}

// ---------------------------------------------------------------------------
// Services
// ---------------------------------------------------------------------------

/// The three upstream services a run talks to.
#[derive(Clone)]
pub struct Services {
    pub content: Arc<dyn ContentService>,
    pub commerce: Arc<dyn CommerceCatalog>,
    pub index: Arc<dyn SearchIndex>,
}

impl Services {
    /// HTTP clients for every configured service.
    pub fn http(config: &AppConfig) -> Result<Self> {
        Ok(Self {
            content: Arc::new(HttpContentService::from_config(&config.content_service)?),
            commerce: Arc::new(HttpCommerceCatalog::from_config(&config.commerce)?),
            index: Arc::new(HttpSearchIndex::from_config(&config.search_index)?),
        })
    }

    /// In-memory copies seeded from `real`, so a dry run sees upstream state
    /// without ever writing to it.
    ///
    /// Index documents are seeded as bare ids; only their presence matters
    /// for orphan detection and the unchanged check.
    pub async fn dry_run_from(real: &Services) -> Result<Self> {
        let records = real.content.list_records().await?;
        let commerce = MemoryCommerceCatalog::with_products(real.commerce.list_products().await?);
        commerce.set_categories(real.commerce.list_categories().await?);
        commerce.set_brands(real.commerce.list_brands().await?);
        let index_ids = real.index.list_document_ids().await?;

        info!(
            records = records.len(),
            documents = index_ids.len(),
            "seeded dry-run services"
        );

        Ok(Self {
            content: Arc::new(MemoryContentService::with_records(records)),
            commerce: Arc::new(commerce),
            index: Arc::new(MemorySearchIndex::with_documents(
                index_ids.into_iter().map(|id| json!({ "id": id })),
            )),
        })
    }
}

// ---------------------------------------------------------------------------
// Options
// ---------------------------------------------------------------------------

/// Per-invocation switches.
#[derive(Debug, Clone, Copy, Default)]
pub struct RunOptions {
    /// Ignore batch history when deduplicating.
    pub reingest: bool,
    /// Read upstream, write nothing upstream, append no batch.
    pub dry_run: bool,
    /// Remove a stale run lock left by a dead run.
    pub break_lock: bool,
}

fn pool_for(service: &ServiceConfig) -> PoolConfig {
    PoolConfig::new(service.concurrency, Duration::from_secs(service.timeout_secs))
}

/// Everything built from config before any I/O happens.
struct Prepared {
    state_dir: PathBuf,
    source: SourceSpec,
    source_label: String,
    fetcher: VendorFetcher,
    taxonomy: Taxonomy,
    normalizer: Normalizer,
}

impl Prepared {
    fn from_config(config: &AppConfig) -> Result<Self> {
        config.validate()?;
        let budget = Some(Duration::from_secs(config.run.deadline_secs));
        Ok(Self {
            state_dir: config.run.state_dir_path()?,
            source: SourceSpec::from_collections(&config.vendor.collections),
            source_label: config.source_label(),
            fetcher: VendorFetcher::new(FetcherConfig::from_vendor(&config.vendor, budget)?)?,
            taxonomy: Taxonomy::from_nodes(&config.taxonomy.categories, &config.taxonomy.default)?,
            normalizer: Normalizer::new(
                OptionRules::from_config(&config.options),
                config.options.sku_prefix_len,
            ),
        })
    }
}

// ---------------------------------------------------------------------------
// Entry points
// ---------------------------------------------------------------------------

/// Run the full pipeline once.
#[instrument(skip_all, fields(dry_run = options.dry_run, reingest = options.reingest))]
pub async fn run_pipeline(
    config: &AppConfig,
    services: &Services,
    options: RunOptions,
    progress: &dyn ProgressReporter,
) -> Result<RunReport> {
    let prepared = Prepared::from_config(config)?;
    let run_id = Uuid::now_v7().to_string();
    let started_at = Utc::now();

    let _lock = RunLock::acquire(
        &prepared.state_dir,
        &run_id,
        Duration::from_secs(config.run.stale_lock_secs),
        options.break_lock,
    )?;
    let storage = Storage::open(&prepared.state_dir.join(DB_FILE_NAME)).await?;
    storage
        .insert_run(&run_id, started_at, &prepared.source_label, options.dry_run)
        .await?;
    let files = FileBatchStore::new(&prepared.state_dir);
    // Dry runs append to a copy of history that is dropped with the run.
    let scratch_history;
    let batches: &dyn BatchStore = if options.dry_run {
        scratch_history = MemoryBatchStore::with_batches(files.load_batches()?);
        &scratch_history
    } else {
        &files
    };

    info!(run_id = %run_id, source = %prepared.source_label, "run started");

    let mut reporter = Reporter::new(&run_id, &prepared.source_label, options.dry_run, started_at);
    let run = Run {
        config,
        services,
        options,
        progress,
        prepared: &prepared,
        storage: &storage,
        batches,
        run_id: &run_id,
        started_at,
    };

    match run.execute(&mut reporter).await {
        Ok(lifecycle) => {
            let report = reporter.finish(lifecycle, Utc::now());
            close_run(&storage, &report).await?;
            info!(run_id = %run_id, status = report.status.as_str(), "run finished");
            progress.done(&report);
            Ok(report)
        }
        Err(e) => {
            let failed = json!({ "error": e.to_string() }).to_string();
            if let Err(ledger) = storage
                .finish_run(&run_id, RunStatus::Failed, None, &failed)
                .await
            {
                warn!(run_id = %run_id, error = %ledger, "could not record failed run");
            }
            Err(e)
        }
    }
}

/// Extract, deduplicate and append a batch. No downstream stage runs.
#[instrument(skip_all, fields(reingest = reingest))]
pub async fn fetch_only(
    config: &AppConfig,
    reingest: bool,
    break_lock: bool,
    progress: &dyn ProgressReporter,
) -> Result<RunReport> {
    let prepared = Prepared::from_config(config)?;
    let run_id = Uuid::now_v7().to_string();
    let started_at = Utc::now();

    let _lock = RunLock::acquire(
        &prepared.state_dir,
        &run_id,
        Duration::from_secs(config.run.stale_lock_secs),
        break_lock,
    )?;
    let storage = Storage::open(&prepared.state_dir.join(DB_FILE_NAME)).await?;
    storage
        .insert_run(&run_id, started_at, &prepared.source_label, false)
        .await?;
    let batches = FileBatchStore::new(&prepared.state_dir);

    let mut reporter = Reporter::new(&run_id, &prepared.source_label, false, started_at);
    let mut lifecycle = LifecycleTracker::new(storage.product_states().await?);

    let extracted = extract(
        config,
        &prepared,
        &batches,
        reingest,
        progress,
        &mut reporter,
        &mut lifecycle,
    )
    .await?;

    if !extracted.retained.is_empty() {
        let batch = Batch::new(prepared.source_label.clone(), started_at, extracted.retained)?;
        batches.append_batch(&batch)?;
        reporter.record_batch(&batch.id);
    }
    storage
        .upsert_product_states(&run_id, &lifecycle.changed_rows())
        .await?;

    let report = reporter.finish(lifecycle.counts(), Utc::now());
    close_run(&storage, &report).await?;
    progress.done(&report);
    Ok(report)
}

/// Re-upsert every document a run deleted and has not restored yet.
#[instrument(skip_all, fields(run_id = %run_id))]
pub async fn restore_run(
    config: &AppConfig,
    index: Arc<dyn SearchIndex>,
    run_id: &str,
) -> Result<RestoreSummary> {
    let state_dir = config.run.state_dir_path()?;
    let storage = Storage::open(&state_dir.join(DB_FILE_NAME)).await?;
    let synchronizer = IndexSynchronizer::new(
        index,
        SyncOptions {
            pool: pool_for_index(config),
            rollback_on_failure: false,
        },
    );
    synchronizer.restore(&storage, run_id).await
}

fn pool_for_index(config: &AppConfig) -> PoolConfig {
    PoolConfig::new(
        config.search_index.concurrency,
        Duration::from_secs(config.search_index.timeout_secs),
    )
}

async fn close_run(storage: &Storage, report: &RunReport) -> Result<()> {
    let report_json = serde_json::to_string(report)
        .map_err(|e| CatalogSyncError::validation(e.to_string()))?;
    storage
        .finish_run(
            &report.run_id,
            report.status,
            report.batch_id.as_deref(),
            &report_json,
        )
        .await
}

/// What one run's extraction saw.
struct Extracted {
    /// Newly retained products, in arrival order.
    retained: Vec<VendorProduct>,
    /// Every vendor id the source listed this run, before filtering.
    seen: HashSet<String>,
    /// No page failed and neither the deadline nor the page ceiling cut the
    /// listing short, so an id missing from `seen` is gone from the source.
    complete: bool,
}

/// Fetch the source and filter it.
async fn extract(
    config: &AppConfig,
    prepared: &Prepared,
    batches: &dyn BatchStore,
    reingest: bool,
    progress: &dyn ProgressReporter,
    reporter: &mut Reporter,
    lifecycle: &mut LifecycleTracker,
) -> Result<Extracted> {
    progress.phase("Fetching vendor catalog");
    let fetched = prepared.fetcher.fetch_all(&prepared.source).await;
    reporter.record_fetch(&fetched);
    let complete =
        fetched.failures.is_empty() && !fetched.deadline_reached && !fetched.ceiling_reached;
    let seen: HashSet<String> = fetched.products.iter().map(|p| p.id.clone()).collect();

    progress.phase("Deduplicating");
    let known = if reingest {
        HashSet::new()
    } else {
        batches.list_known_ids()?
    };
    let mut engine = DedupEngine::new(
        DedupPolicy::from_filters(&config.filters, config.run.max_items),
        known,
    );
    let total = fetched.products.len();
    for (i, product) in fetched.products.into_iter().enumerate() {
        engine.offer(product);
        progress.items(i + 1, total);
    }
    let outcome = engine.finish();

    for entry in &outcome.skipped {
        if entry.reason.disposition() == Disposition::Excluded
            && lifecycle.state(&entry.vendor_id) == ProductState::Unseen
        {
            lifecycle.advance(&entry.vendor_id, ProductState::Excluded);
        }
    }
    for product in &outcome.retained {
        lifecycle.reenter(&product.id);
    }

    reporter.record_retained(outcome.retained.iter().map(|p| p.vendor.as_str()));
    reporter.record_skips(outcome.skipped);

    info!(
        retained = outcome.retained.len(),
        seen = seen.len(),
        complete,
        reingest,
        "deduplication finished"
    );
    Ok(Extracted {
        retained: outcome.retained,
        seen,
        complete,
    })
}

// ---------------------------------------------------------------------------
// Full run
// ---------------------------------------------------------------------------

struct Run<'a> {
    config: &'a AppConfig,
    services: &'a Services,
    options: RunOptions,
    progress: &'a dyn ProgressReporter,
    prepared: &'a Prepared,
    storage: &'a Storage,
    batches: &'a dyn BatchStore,
    run_id: &'a str,
    started_at: chrono::DateTime<Utc>,
}

impl Run<'_> {
    /// Every stage in order. Returns final lifecycle counts.
    async fn execute(&self, reporter: &mut Reporter) -> Result<BTreeMap<ProductState, usize>> {
        let mut lifecycle = LifecycleTracker::new(self.storage.product_states().await?);

        // --- Extract + dedup ---
        let history = self.batches.load_batches()?;
        let extracted = extract(
            self.config,
            self.prepared,
            self.batches,
            self.options.reingest,
            self.progress,
            reporter,
            &mut lifecycle,
        )
        .await?;
        let Extracted {
            retained,
            seen,
            complete,
        } = extracted;
        let fresh_ids: BTreeSet<String> = retained.iter().map(|p| p.id.clone()).collect();

        // --- Fold history ---
        // Only products the source listed this run go forward. History
        // supplies their first-seen time and earlier collections.
        let (candidates, unlisted): (Vec<Candidate>, Vec<Candidate>) =
            fold_history(&history, &retained, self.started_at)
                .into_iter()
                .partition(|c| seen.contains(&c.product.id));
        reporter.record_candidates(candidates.len());

        // Ids whose index documents must outlive this run.
        let mut held = BTreeSet::new();
        for candidate in &unlisted {
            let vendor_id = candidate.product.id.as_str();
            let in_flight = matches!(
                lifecycle.state(vendor_id),
                ProductState::Canonical | ProductState::Enriched | ProductState::Indexed
            );
            if !complete {
                held.insert(CanonicalId::from_vendor_id(vendor_id).to_string());
            } else if in_flight {
                lifecycle.advance(vendor_id, ProductState::Orphaned);
            }
        }
        if !unlisted.is_empty() {
            info!(
                unlisted = unlisted.len(),
                complete, "history products missing from this listing"
            );
        }

        if !retained.is_empty() {
            let batch = Batch::new(self.prepared.source_label.clone(), self.started_at, retained)?;
            self.batches.append_batch(&batch)?;
            if !self.options.dry_run {
                reporter.record_batch(&batch.id);
            }
        }

        // --- Categorize + normalize ---
        self.progress.phase("Normalizing");
        let mut canonical: Vec<CanonicalProduct> = Vec::with_capacity(candidates.len());
        for (i, candidate) in candidates.iter().enumerate() {
            let vendor_id = candidate.product.id.as_str();
            lifecycle.reenter(vendor_id);
            let path = self
                .prepared
                .taxonomy
                .map(&candidate.collections, &candidate.product.product_type);
            match self.prepared.normalizer.normalize(candidate, path.clone()) {
                Ok(product) => {
                    lifecycle.advance(vendor_id, ProductState::Canonical);
                    reporter.record_category(&path);
                    canonical.push(product);
                }
                Err(e) => {
                    warn!(vendor_id, error = %e, "normalization failed");
                    lifecycle.advance(vendor_id, ProductState::Excluded);
                    reporter.record_skip(SkipEntry::new(&candidate.product, e.skip_reason()));
                }
            }
            self.progress.items(i + 1, candidates.len());
        }

        // --- Publish ---
        self.progress.phase("Publishing to commerce catalog");
        let published = self.publish(&canonical, &fresh_ids, reporter).await;
        reporter.record_published(published);

        // --- Live set ---
        let catalog_ids: BTreeSet<String> = match self.services.commerce.list_products().await {
            Ok(products) => products.into_iter().map(|p| p.id).collect(),
            Err(e) => {
                warn!(error = %e, "cannot list commerce products, stopping before enrichment");
                reporter.record_error("commerce", &e);
                return Ok(lifecycle.counts());
            }
        };
        let (live, gone): (Vec<CanonicalProduct>, Vec<CanonicalProduct>) = canonical
            .into_iter()
            .partition(|p| catalog_ids.contains(p.id.as_str()));
        for product in &gone {
            lifecycle.advance(&product.vendor_id, ProductState::Orphaned);
        }
        reporter.record_live(live.len());

        let categories = self.services.commerce.list_categories().await.unwrap_or_else(|e| {
            warn!(error = %e, "cannot list categories, using handles");
            reporter.record_error("commerce", &e);
            Vec::new()
        });
        let brand_refs = self.services.commerce.list_brands().await.unwrap_or_else(|e| {
            warn!(error = %e, "cannot list brands, synthesizing from vendors");
            reporter.record_error("commerce", &e);
            Vec::new()
        });
        let refs = CatalogRefs::new(categories, brand_refs);

        // Dry runs keep every local write in a throwaway database.
        let scratch;
        let state: &Storage = if self.options.dry_run {
            scratch = scratch_storage(self.storage, self.run_id).await?;
            &scratch
        } else {
            self.storage
        };

        // --- Enrich ---
        self.progress.phase("Reconciling descriptions");
        let brands = BrandEntity::from_products(&live);
        let authority = Authority {
            product_ids: catalog_ids,
            brand_handles: brands
                .iter()
                .map(|b| b.handle.clone())
                .chain(refs.brand_handles().map(str::to_string))
                .collect(),
        };
        let merger = EnrichmentMerger::new(
            self.services.content.clone(),
            self.config.enrichment.clone(),
            pool_for(&self.config.content_service),
        );
        let enriched = match merger.reconcile(&live, &brands, &authority, Some(state)).await {
            Ok(result) => result,
            Err(e) => {
                warn!(error = %e, "cannot list description records, stopping before indexing");
                reporter.record_error("enrichment", &e);
                for product in &live {
                    reporter.record_skip(enrichment_skip(product));
                }
                return Ok(lifecycle.counts());
            }
        };
        reporter.record_enrichment(&enriched.summary, &enriched.failures);

        // --- Build documents ---
        self.progress.phase("Building documents");
        let mut documents = Vec::with_capacity(live.len());
        for product in &live {
            match enriched.products.get(product.id.as_str()) {
                Some(Ok(record)) => {
                    lifecycle.advance(&product.vendor_id, ProductState::Enriched);
                    documents.push(build_document(
                        product,
                        record,
                        refs.brand(product),
                        &self.config.markets,
                        refs.category_ids(&product.category),
                    ));
                }
                _ => {
                    held.insert(product.id.to_string());
                    reporter.record_skip(enrichment_skip(product));
                }
            }
        }

        // --- Index ---
        self.progress.phase("Syncing search index");
        let synchronizer = IndexSynchronizer::new(
            self.services.index.clone(),
            SyncOptions {
                pool: pool_for_index(self.config),
                rollback_on_failure: self.config.search_index.rollback_on_failure,
            },
        );
        match synchronizer
            .sync_holding(state, self.run_id, &documents, &held)
            .await
        {
            Ok(outcome) => {
                reporter.record_index(&outcome.summary, &outcome.failures);
                let by_canonical: HashMap<String, &str> = live
                    .iter()
                    .chain(gone.iter())
                    .map(|p| (p.id.to_string(), p.vendor_id.as_str()))
                    .collect();
                for id in &outcome.indexed {
                    if let Some(vendor_id) = by_canonical.get(id) {
                        lifecycle.advance(vendor_id, ProductState::Indexed);
                    }
                }
                for id in &outcome.orphaned {
                    if let Some(vendor_id) = by_canonical.get(id) {
                        lifecycle.advance(vendor_id, ProductState::Orphaned);
                    }
                }
            }
            Err(e) => {
                warn!(error = %e, "index sync failed");
                reporter.record_error("index", &e);
            }
        }

        if !self.options.dry_run {
            self.storage
                .upsert_product_states(self.run_id, &lifecycle.changed_rows())
                .await?;
        }

        if lifecycle.rejected() > 0 {
            warn!(rejected = lifecycle.rejected(), "lifecycle transitions were rejected");
        }
        Ok(lifecycle.counts())
    }

    /// Push newly retained products to the commerce catalog.
    async fn publish(
        &self,
        canonical: &[CanonicalProduct],
        fresh_ids: &BTreeSet<String>,
        reporter: &mut Reporter,
    ) -> usize {
        let fresh: Vec<CanonicalProduct> = canonical
            .iter()
            .filter(|p| fresh_ids.contains(&p.vendor_id))
            .cloned()
            .collect();
        let ids: Vec<CanonicalId> = fresh.iter().map(|p| p.id.clone()).collect();

        let commerce = self.services.commerce.clone();
        let results = run_bounded(fresh, pool_for(&self.config.commerce), move |product| {
            let commerce = commerce.clone();
            async move { commerce.upsert_product(&product).await }
        })
        .await;

        let mut published = 0;
        for (id, result) in ids.iter().zip(results) {
            match result {
                Ok(()) => published += 1,
                Err(e) => {
                    warn!(id = %id, error = %e, "publish failed");
                    reporter.record_error("publish", format!("{id}: {e}"));
                }
            }
        }
        info!(published, "published new products");
        published
    }
}

fn enrichment_skip(product: &CanonicalProduct) -> SkipEntry {
    SkipEntry {
        vendor_id: product.vendor_id.clone(),
        vendor: product.vendor.clone(),
        title: product.title.clone(),
        reason: SkipReason::EnrichmentFailed,
    }
}

/// In-memory database carrying the real document hashes, so a dry run's
/// unchanged counts match what a real run would report.
async fn scratch_storage(real: &Storage, run_id: &str) -> Result<Storage> {
    let scratch = Storage::open_in_memory().await?;
    for (id, hash) in real.document_hashes().await? {
        scratch.set_document_hash(&id, &hash, run_id).await?;
    }
    Ok(scratch)
}
