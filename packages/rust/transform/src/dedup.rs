//! Dedup and vendor filtering of freshly fetched products, plus the history
//! fold that turns all batches into this run's candidate set.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use catalogsync_shared::{Batch, Candidate, FiltersConfig, VendorProduct};

// ---------------------------------------------------------------------------
// Skip reasons
// ---------------------------------------------------------------------------

/// Why a vendor product did not make it into the index this run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    DuplicateInRun,
    AlreadyIngested,
    ExcludedVendor,
    UnapprovedVendor,
    NoImages,
    ItemCeiling,
    NoVariants,
    EnrichmentFailed,
}

/// How the reporter buckets a skip.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Disposition {
    /// Not processed this run; may be picked up later.
    Skipped,
    /// Permanently filtered by policy.
    Excluded,
    /// Processing failed.
    Error,
}

impl SkipReason {
    pub fn disposition(self) -> Disposition {
        match self {
            Self::DuplicateInRun | Self::AlreadyIngested | Self::ItemCeiling => {
                Disposition::Skipped
            }
            Self::ExcludedVendor | Self::UnapprovedVendor | Self::NoImages => {
                Disposition::Excluded
            }
            Self::NoVariants | Self::EnrichmentFailed => Disposition::Error,
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            Self::DuplicateInRun => "duplicate in run",
            Self::AlreadyIngested => "already ingested",
            Self::ExcludedVendor => "excluded vendor",
            Self::UnapprovedVendor => "unapproved vendor",
            Self::NoImages => "no images",
            Self::ItemCeiling => "item ceiling",
            Self::NoVariants => "no variants",
            Self::EnrichmentFailed => "enrichment failed",
        }
    }
}

impl std::fmt::Display for SkipReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.label())
    }
}

/// One ledger line.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SkipEntry {
    pub vendor_id: String,
    pub vendor: String,
    pub title: String,
    pub reason: SkipReason,
}

impl SkipEntry {
    pub fn new(product: &VendorProduct, reason: SkipReason) -> Self {
        Self {
            vendor_id: product.id.clone(),
            vendor: product.vendor.clone(),
            title: product.title.clone(),
            reason,
        }
    }
}

// ---------------------------------------------------------------------------
// Policy
// ---------------------------------------------------------------------------

/// Vendor lists and ceilings applied to every offered product.
#[derive(Debug, Clone, Default)]
pub struct DedupPolicy {
    approved: HashSet<String>,
    excluded: HashSet<String>,
    max_items: Option<usize>,
}

impl DedupPolicy {
    pub fn new(approved: &[String], excluded: &[String], max_items: Option<usize>) -> Self {
        Self {
            approved: approved.iter().map(|v| vendor_key(v)).collect(),
            excluded: excluded.iter().map(|v| vendor_key(v)).collect(),
            max_items,
        }
    }

    pub fn from_filters(filters: &FiltersConfig, max_items: Option<usize>) -> Self {
        Self::new(&filters.approved_vendors, &filters.excluded_vendors, max_items)
    }

    fn vendor_verdict(&self, vendor: &str) -> Option<SkipReason> {
        let key = vendor_key(vendor);
        if self.excluded.contains(&key) {
            Some(SkipReason::ExcludedVendor)
        } else if !self.approved.contains(&key) {
            Some(SkipReason::UnapprovedVendor)
        } else {
            None
        }
    }
}

fn vendor_key(vendor: &str) -> String {
    vendor.trim().to_lowercase()
}

// ---------------------------------------------------------------------------
// DedupEngine
// ---------------------------------------------------------------------------

/// Verdict for one offered product.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Retained,
    Skipped(SkipReason),
}

/// What the engine produced for a run.
#[derive(Debug, Clone, Default)]
pub struct DedupOutcome {
    /// Retained products in arrival order.
    pub retained: Vec<VendorProduct>,
    pub skipped: Vec<SkipEntry>,
}

/// Stateful filter over this run's fetched products.
///
/// Each vendor id gets exactly one real verdict per run. Later sightings of the
/// same id are `DuplicateInRun`; if the first sighting was retained their
/// collection handles are merged into it.
pub struct DedupEngine {
    policy: DedupPolicy,
    known: HashSet<String>,
    retained: Vec<VendorProduct>,
    retained_index: HashMap<String, usize>,
    offered: HashSet<String>,
    skipped: Vec<SkipEntry>,
}

impl DedupEngine {
    /// `known_ids` are the vendor ids present in batch history. Pass an empty
    /// set to force re-ingestion.
    pub fn new(policy: DedupPolicy, known_ids: HashSet<String>) -> Self {
        Self {
            policy,
            known: known_ids,
            retained: Vec::new(),
            retained_index: HashMap::new(),
            offered: HashSet::new(),
            skipped: Vec::new(),
        }
    }

    pub fn offer(&mut self, product: VendorProduct) -> Verdict {
        let verdict = self.judge(&product);

        match verdict {
            Verdict::Retained => {
                self.offered.insert(product.id.clone());
                self.known.insert(product.id.clone());
                self.retained_index
                    .insert(product.id.clone(), self.retained.len());
                self.retained.push(product);
            }
            Verdict::Skipped(SkipReason::DuplicateInRun) => {
                if let Some(&idx) = self.retained_index.get(&product.id) {
                    let kept = &mut self.retained[idx];
                    for handle in product.source_collections {
                        if !kept.source_collections.contains(&handle) {
                            kept.source_collections.push(handle);
                        }
                    }
                }
                debug!(vendor_id = %product.id, "duplicate in run");
                self.skipped.push(SkipEntry {
                    vendor_id: product.id,
                    vendor: product.vendor,
                    title: product.title,
                    reason: SkipReason::DuplicateInRun,
                });
            }
            Verdict::Skipped(reason) => {
                self.offered.insert(product.id.clone());
                debug!(vendor_id = %product.id, %reason, "skipped");
                self.skipped.push(SkipEntry::new(&product, reason));
            }
        }

        verdict
    }

    pub fn finish(self) -> DedupOutcome {
        DedupOutcome {
            retained: self.retained,
            skipped: self.skipped,
        }
    }

    fn judge(&self, product: &VendorProduct) -> Verdict {
        if self.offered.contains(&product.id) {
            return Verdict::Skipped(SkipReason::DuplicateInRun);
        }
        if self.known.contains(&product.id) {
            return Verdict::Skipped(SkipReason::AlreadyIngested);
        }
        if let Some(reason) = self.policy.vendor_verdict(&product.vendor) {
            return Verdict::Skipped(reason);
        }
        if product.images.iter().all(|img| img.src.trim().is_empty()) {
            return Verdict::Skipped(SkipReason::NoImages);
        }
        if let Some(max) = self.policy.max_items {
            if self.retained.len() >= max {
                return Verdict::Skipped(SkipReason::ItemCeiling);
            }
        }
        Verdict::Retained
    }
}

// ---------------------------------------------------------------------------
// History fold
// ---------------------------------------------------------------------------

/// Build the run's candidate set from batch history plus this run's retained
/// products.
///
/// Later batches replace earlier records for the same vendor id. Collection
/// handles are unioned across every batch containing the id and `first_seen_at`
/// is the earliest containing batch. Output is ordered by vendor id.
pub fn fold_history(
    batches: &[Batch],
    fresh: &[VendorProduct],
    fresh_at: DateTime<Utc>,
) -> Vec<Candidate> {
    let mut ordered: Vec<&Batch> = batches.iter().collect();
    ordered.sort_by_key(|b| b.extracted_at);

    let mut folded: BTreeMap<&str, Candidate> = BTreeMap::new();

    let layers = ordered
        .iter()
        .map(|b| (b.extracted_at, b.products.as_slice()))
        .chain(std::iter::once((fresh_at, fresh)));

    for (seen_at, products) in layers {
        for product in products {
            match folded.get_mut(product.id.as_str()) {
                Some(existing) => {
                    existing
                        .collections
                        .extend(product.source_collections.iter().cloned());
                    existing.first_seen_at = existing.first_seen_at.min(seen_at);
                    existing.product = product.clone();
                }
                None => {
                    folded.insert(
                        product.id.as_str(),
                        Candidate {
                            product: product.clone(),
                            collections: product
                                .source_collections
                                .iter()
                                .cloned()
                                .collect::<BTreeSet<_>>(),
                            first_seen_at: seen_at,
                        },
                    );
                }
            }
        }
    }

    folded.into_values().collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use catalogsync_shared::VendorImage;
    use chrono::TimeZone;

    fn product(id: &str, vendor: &str, collections: &[&str]) -> VendorProduct {
        VendorProduct {
            id: id.into(),
            title: format!("Product {id}"),
            handle: format!("product-{id}"),
            vendor: vendor.into(),
            product_type: "Nozzle".into(),
            tags: vec![],
            images: vec![VendorImage {
                src: "https://cdn.example.com/p.jpg".into(),
            }],
            body_html: None,
            variants: vec![],
            source_collections: collections.iter().map(|c| c.to_string()).collect(),
        }
    }

    fn policy() -> DedupPolicy {
        DedupPolicy::new(&["Acme".into(), "Both Inc".into()], &["both inc".into()], None)
    }

    fn ts(day: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, day, 12, 0, 0).unwrap()
    }

    #[test]
    fn retains_approved_vendor_with_images() {
        let mut engine = DedupEngine::new(policy(), HashSet::new());
        assert_eq!(engine.offer(product("1", "Acme", &[])), Verdict::Retained);
        let outcome = engine.finish();
        assert_eq!(outcome.retained.len(), 1);
        assert!(outcome.skipped.is_empty());
    }

    #[test]
    fn vendor_comparison_ignores_case_and_whitespace() {
        let mut engine = DedupEngine::new(policy(), HashSet::new());
        assert_eq!(engine.offer(product("1", "  ACME ", &[])), Verdict::Retained);
    }

    #[test]
    fn exclusion_beats_approval() {
        let mut engine = DedupEngine::new(policy(), HashSet::new());
        assert_eq!(
            engine.offer(product("1", "Both Inc", &[])),
            Verdict::Skipped(SkipReason::ExcludedVendor)
        );
        assert_eq!(
            engine.offer(product("2", "Stranger", &[])),
            Verdict::Skipped(SkipReason::UnapprovedVendor)
        );
    }

    #[test]
    fn zero_image_products_are_excluded() {
        let mut engine = DedupEngine::new(policy(), HashSet::new());
        let mut p = product("1", "Acme", &[]);
        p.images.clear();
        assert_eq!(engine.offer(p), Verdict::Skipped(SkipReason::NoImages));

        let outcome = engine.finish();
        assert_eq!(outcome.skipped[0].reason.label(), "no images");
        assert_eq!(outcome.skipped[0].reason.disposition(), Disposition::Excluded);
    }

    #[test]
    fn history_ids_are_already_ingested() {
        let known = HashSet::from(["1".to_string()]);
        let mut engine = DedupEngine::new(policy(), known);
        assert_eq!(
            engine.offer(product("1", "Acme", &[])),
            Verdict::Skipped(SkipReason::AlreadyIngested)
        );
    }

    #[test]
    fn in_run_duplicates_union_collections() {
        let mut engine = DedupEngine::new(policy(), HashSet::new());
        engine.offer(product("1", "Acme", &["hotends"]));
        assert_eq!(
            engine.offer(product("1", "Acme", &["nozzles"])),
            Verdict::Skipped(SkipReason::DuplicateInRun)
        );

        let outcome = engine.finish();
        assert_eq!(outcome.retained.len(), 1);
        assert_eq!(outcome.retained[0].source_collections, vec!["hotends", "nozzles"]);
    }

    #[test]
    fn item_ceiling_stops_retention() {
        let policy = DedupPolicy::new(&["Acme".into()], &[], Some(1));
        let mut engine = DedupEngine::new(policy, HashSet::new());
        engine.offer(product("1", "Acme", &[]));
        assert_eq!(
            engine.offer(product("2", "Acme", &[])),
            Verdict::Skipped(SkipReason::ItemCeiling)
        );
    }

    #[test]
    fn second_pass_over_same_products_retains_nothing() {
        let fetched = vec![product("1", "Acme", &[]), product("2", "Acme", &[])];

        let mut first = DedupEngine::new(policy(), HashSet::new());
        for p in fetched.clone() {
            first.offer(p);
        }
        let batch1 = Batch::new("all", ts(1), first.finish().retained).unwrap();

        let known: HashSet<String> = batch1.vendor_ids().map(str::to_string).collect();
        let mut second = DedupEngine::new(policy(), known);
        for p in fetched {
            second.offer(p);
        }
        let outcome = second.finish();
        assert!(outcome.retained.is_empty());
        assert!(
            outcome
                .skipped
                .iter()
                .all(|s| s.reason == SkipReason::AlreadyIngested)
        );
    }

    #[test]
    fn fold_unions_collections_and_keeps_earliest_timestamp() {
        let b1 = Batch::new("c", ts(1), vec![product("1", "Acme", &["hotends"])]).unwrap();
        let mut newer = product("1", "Acme", &["nozzles"]);
        newer.title = "Renamed".into();
        let b2 = Batch::new("c", ts(5), vec![newer, product("0", "Acme", &[])]).unwrap();

        // Pass batches out of order on purpose.
        let candidates = fold_history(&[b2, b1], &[product("9", "Acme", &["x"])], ts(9));

        let ids: Vec<_> = candidates.iter().map(|c| c.product.id.as_str()).collect();
        assert_eq!(ids, vec!["0", "1", "9"]);

        let one = &candidates[1];
        assert_eq!(one.product.title, "Renamed");
        assert_eq!(
            one.collections.iter().map(String::as_str).collect::<Vec<_>>(),
            vec!["hotends", "nozzles"]
        );
        assert_eq!(one.first_seen_at, ts(1));
        assert_eq!(candidates[2].first_seen_at, ts(9));
    }

    #[test]
    fn dispositions() {
        assert_eq!(SkipReason::AlreadyIngested.disposition(), Disposition::Skipped);
        assert_eq!(SkipReason::ExcludedVendor.disposition(), Disposition::Excluded);
        assert_eq!(SkipReason::EnrichmentFailed.disposition(), Disposition::Error);
        assert_eq!(
            serde_json::to_string(&SkipReason::NoImages).unwrap(),
            "\"no_images\""
        );
    }
}
