//! Run reporting and product lifecycle tracking.
//!
//! The [`Reporter`] only aggregates what the stages hand it. It performs no
//! I/O; the pipeline persists the finished [`RunReport`] in the run ledger.

use std::collections::{BTreeMap, HashMap};
use std::fmt::Write as _;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;

use catalogsync_fetcher::{FailureKind, FetchRun};
use catalogsync_shared::{CanonicalId, CategoryPath, ProductState, RunStatus};
use catalogsync_transform::{Disposition, SkipEntry, SkipReason};

use crate::enrichment::{EnrichmentFailure, EnrichmentSummary};
use crate::index::{IndexFailure, IndexSummary};

// ---------------------------------------------------------------------------
// Report
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FetchIssue {
    pub url: String,
    pub malformed: bool,
    pub message: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FetchStats {
    pub pages_requested: u32,
    pub products_fetched: usize,
    pub deadline_reached: bool,
    pub ceiling_reached: bool,
    pub failures: Vec<FetchIssue>,
}

/// Per-vendor tallies.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VendorCounts {
    pub retained: usize,
    pub skipped: usize,
    pub excluded: usize,
    pub errors: usize,
}

/// Everything one run did, as persisted in the run ledger.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunReport {
    pub run_id: String,
    pub source: String,
    pub dry_run: bool,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub status: RunStatus,
    pub batch_id: Option<String>,
    pub fetch: FetchStats,
    pub retained: usize,
    pub candidates: usize,
    pub canonical: usize,
    pub published: usize,
    pub live: usize,
    pub indexed: usize,
    pub vendors: BTreeMap<String, VendorCounts>,
    pub categories: BTreeMap<String, usize>,
    pub skip_reasons: BTreeMap<SkipReason, usize>,
    pub dispositions: BTreeMap<Disposition, usize>,
    pub skipped: Vec<SkipEntry>,
    pub enrichment: EnrichmentSummary,
    pub enrichment_failures: Vec<EnrichmentFailure>,
    pub index: IndexSummary,
    pub index_failures: Vec<IndexFailure>,
    pub lifecycle: BTreeMap<ProductState, usize>,
    /// Stage-level errors that did not abort the run.
    pub errors: Vec<String>,
}

impl RunReport {
    /// Operator-facing summary.
    pub fn render(&self) -> String {
        let mut out = String::new();
        let dry = if self.dry_run { " (dry run)" } else { "" };
        let _ = writeln!(out, "  Run {}{dry}", self.run_id);
        let _ = writeln!(out, "  Status:     {}", self.status);
        let _ = writeln!(out, "  Source:     {}", self.source);
        let _ = writeln!(
            out,
            "  Fetched:    {} products from {} pages ({} failed)",
            self.fetch.products_fetched,
            self.fetch.pages_requested,
            self.fetch.failures.len()
        );
        if self.fetch.deadline_reached {
            let _ = writeln!(out, "              stopped at the run deadline");
        }
        if self.fetch.ceiling_reached {
            let _ = writeln!(out, "              stopped at the page ceiling");
        }
        let _ = writeln!(out, "  Retained:   {}", self.retained);
        let _ = writeln!(out, "  Candidates: {}", self.candidates);
        let _ = writeln!(out, "  Canonical:  {} ({} published)", self.canonical, self.published);
        let _ = writeln!(out, "  Live:       {}", self.live);
        let _ = writeln!(
            out,
            "  Enrichment: {} current, {} outdated, {} created, {} deleted, {} failed",
            self.enrichment.current,
            self.enrichment.outdated,
            self.enrichment.created,
            self.enrichment.deleted,
            self.enrichment.failed
        );
        let _ = writeln!(
            out,
            "  Index:      {} upserted, {} unchanged, {} deleted, {} failed",
            self.index.upserted, self.index.unchanged, self.index.deleted, self.index.failed
        );
        if self.index.rolled_back {
            let _ = writeln!(out, "              rolled back, {} documents restored", self.index.restored);
        }

        if !self.dispositions.is_empty() {
            let _ = writeln!(out);
            let _ = writeln!(out, "  Skips by reason:");
            for (reason, count) in &self.skip_reasons {
                let _ = writeln!(
                    out,
                    "    {:<20} {count:>6}  ({:?})",
                    reason.label(),
                    reason.disposition()
                );
            }
        }

        if !self.vendors.is_empty() {
            let _ = writeln!(out);
            let _ = writeln!(out, "  Vendors:              retained  skipped  excluded  errors");
            for (vendor, c) in &self.vendors {
                let _ = writeln!(
                    out,
                    "    {vendor:<20} {:>8} {:>8} {:>9} {:>7}",
                    c.retained, c.skipped, c.excluded, c.errors
                );
            }
        }

        if !self.categories.is_empty() {
            let _ = writeln!(out);
            let _ = writeln!(out, "  Categories:");
            for (path, count) in &self.categories {
                let _ = writeln!(out, "    {path:<30} {count:>6}");
            }
        }

        if !self.errors.is_empty() {
            let _ = writeln!(out);
            let _ = writeln!(out, "  Errors:");
            for error in &self.errors {
                let _ = writeln!(out, "    {error}");
            }
        }
        out
    }
}

// ---------------------------------------------------------------------------
// Reporter
// ---------------------------------------------------------------------------

/// Accumulates stage results into a [`RunReport`].
#[derive(Debug)]
pub struct Reporter {
    run_id: String,
    source: String,
    dry_run: bool,
    started_at: DateTime<Utc>,
    batch_id: Option<String>,
    fetch: FetchStats,
    retained: usize,
    candidates: usize,
    canonical: usize,
    published: usize,
    live: usize,
    vendors: BTreeMap<String, VendorCounts>,
    categories: BTreeMap<String, usize>,
    skipped: Vec<SkipEntry>,
    enrichment: EnrichmentSummary,
    enrichment_failures: Vec<EnrichmentFailure>,
    index: IndexSummary,
    index_failures: Vec<IndexFailure>,
    errors: Vec<String>,
}

impl Reporter {
    pub fn new(run_id: &str, source: &str, dry_run: bool, started_at: DateTime<Utc>) -> Self {
        Self {
            run_id: run_id.to_string(),
            source: source.to_string(),
            dry_run,
            started_at,
            batch_id: None,
            fetch: FetchStats::default(),
            retained: 0,
            candidates: 0,
            canonical: 0,
            published: 0,
            live: 0,
            vendors: BTreeMap::new(),
            categories: BTreeMap::new(),
            skipped: Vec::new(),
            enrichment: EnrichmentSummary::default(),
            enrichment_failures: Vec::new(),
            index: IndexSummary::default(),
            index_failures: Vec::new(),
            errors: Vec::new(),
        }
    }

    pub fn record_fetch(&mut self, run: &FetchRun) {
        self.fetch = FetchStats {
            pages_requested: run.pages_requested,
            products_fetched: run.products.len(),
            deadline_reached: run.deadline_reached,
            ceiling_reached: run.ceiling_reached,
            failures: run
                .failures
                .iter()
                .map(|f| FetchIssue {
                    url: f.url.clone(),
                    malformed: f.kind == FailureKind::MalformedResponse,
                    message: f.message.clone(),
                })
                .collect(),
        };
    }

    pub fn record_retained<'a>(&mut self, vendors: impl IntoIterator<Item = &'a str>) {
        for vendor in vendors {
            self.retained += 1;
            self.vendor(vendor).retained += 1;
        }
    }

    /// Ledger a skip. A `DuplicateInRun` entry was merged into a retained
    /// product, so it shows under skip reasons only.
    pub fn record_skip(&mut self, entry: SkipEntry) {
        if entry.reason != SkipReason::DuplicateInRun {
            let counts = self.vendor(&entry.vendor);
            match entry.reason.disposition() {
                Disposition::Skipped => counts.skipped += 1,
                Disposition::Excluded => counts.excluded += 1,
                Disposition::Error => counts.errors += 1,
            }
        }
        self.skipped.push(entry);
    }

    pub fn record_skips(&mut self, entries: impl IntoIterator<Item = SkipEntry>) {
        for entry in entries {
            self.record_skip(entry);
        }
    }

    pub fn record_candidates(&mut self, count: usize) {
        self.candidates = count;
    }

    pub fn record_category(&mut self, path: &CategoryPath) {
        self.canonical += 1;
        *self.categories.entry(path.to_string()).or_default() += 1;
    }

    pub fn record_published(&mut self, count: usize) {
        self.published = count;
    }

    pub fn record_live(&mut self, count: usize) {
        self.live = count;
    }

    pub fn record_enrichment(&mut self, summary: &EnrichmentSummary, failures: &[EnrichmentFailure]) {
        self.enrichment = summary.clone();
        self.enrichment_failures = failures.to_vec();
    }

    pub fn record_index(&mut self, summary: &IndexSummary, failures: &[IndexFailure]) {
        self.index = summary.clone();
        self.index_failures = failures.to_vec();
    }

    pub fn record_batch(&mut self, batch_id: &str) {
        self.batch_id = Some(batch_id.to_string());
    }

    pub fn record_error(&mut self, stage: &str, message: impl std::fmt::Display) {
        self.errors.push(format!("{stage}: {message}"));
    }

    /// Close the report. Status follows from what was recorded.
    pub fn finish(self, lifecycle: BTreeMap<ProductState, usize>, finished_at: DateTime<Utc>) -> RunReport {
        let mut skip_reasons: BTreeMap<SkipReason, usize> = BTreeMap::new();
        let mut dispositions: BTreeMap<Disposition, usize> = BTreeMap::new();
        for entry in &self.skipped {
            *skip_reasons.entry(entry.reason).or_default() += 1;
            if entry.reason != SkipReason::DuplicateInRun {
                *dispositions.entry(entry.reason.disposition()).or_default() += 1;
            }
        }

        let had_errors = !self.errors.is_empty()
            || self.enrichment.failed > 0
            || self.index.failed > 0
            || !self.fetch.failures.is_empty()
            || dispositions.contains_key(&Disposition::Error);
        let status = if self.index.rolled_back {
            RunStatus::RolledBack
        } else if had_errors {
            RunStatus::CompletedWithErrors
        } else {
            RunStatus::Completed
        };

        RunReport {
            run_id: self.run_id,
            source: self.source,
            dry_run: self.dry_run,
            started_at: self.started_at,
            finished_at,
            status,
            batch_id: self.batch_id,
            fetch: self.fetch,
            retained: self.retained,
            candidates: self.candidates,
            canonical: self.canonical,
            published: self.published,
            live: self.live,
            indexed: self.index.upserted + self.index.unchanged,
            vendors: self.vendors,
            categories: self.categories,
            skip_reasons,
            dispositions,
            skipped: self.skipped,
            enrichment: self.enrichment,
            enrichment_failures: self.enrichment_failures,
            index: self.index,
            index_failures: self.index_failures,
            lifecycle,
            errors: self.errors,
        }
    }

    fn vendor(&mut self, vendor: &str) -> &mut VendorCounts {
        self.vendors.entry(vendor.trim().to_string()).or_default()
    }
}

// ---------------------------------------------------------------------------
// Lifecycle
// ---------------------------------------------------------------------------

/// Per vendor id lifecycle state, seeded from the previous run.
#[derive(Debug, Default)]
pub struct LifecycleTracker {
    states: BTreeMap<String, ProductState>,
    touched: BTreeMap<String, ProductState>,
    rejected: usize,
}

impl LifecycleTracker {
    pub fn new(previous: HashMap<String, ProductState>) -> Self {
        Self {
            states: previous.into_iter().collect(),
            touched: BTreeMap::new(),
            rejected: 0,
        }
    }

    pub fn state(&self, vendor_id: &str) -> ProductState {
        self.states
            .get(vendor_id)
            .copied()
            .unwrap_or(ProductState::Unseen)
    }

    /// Move `vendor_id` to `next`. Illegal moves are logged and ignored.
    pub fn advance(&mut self, vendor_id: &str, next: ProductState) -> bool {
        let current = self.state(vendor_id);
        if !current.can_transition_to(next) {
            warn!(
                vendor_id,
                from = current.as_str(),
                to = next.as_str(),
                "illegal lifecycle transition ignored"
            );
            self.rejected += 1;
            return false;
        }
        self.states.insert(vendor_id.to_string(), next);
        self.touched.insert(vendor_id.to_string(), next);
        true
    }

    /// Bring a product back into the candidate stage if it is not in flight.
    pub fn reenter(&mut self, vendor_id: &str) {
        match self.state(vendor_id) {
            ProductState::Unseen | ProductState::Excluded | ProductState::Orphaned => {
                self.advance(vendor_id, ProductState::Candidate);
            }
            _ => {}
        }
    }

    pub fn rejected(&self) -> usize {
        self.rejected
    }

    /// Number of tracked ids per state.
    pub fn counts(&self) -> BTreeMap<ProductState, usize> {
        let mut counts = BTreeMap::new();
        for state in self.states.values() {
            *counts.entry(*state).or_default() += 1;
        }
        counts
    }

    /// Rows to persist: every id whose state was set this run.
    pub fn changed_rows(&self) -> Vec<(String, String, ProductState)> {
        self.touched
            .iter()
            .map(|(vendor_id, state)| {
                (
                    vendor_id.clone(),
                    CanonicalId::from_vendor_id(vendor_id).to_string(),
                    *state,
                )
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn skip(vendor: &str, reason: SkipReason) -> SkipEntry {
        SkipEntry {
            vendor_id: format!("{vendor}-{reason:?}"),
            vendor: vendor.into(),
            title: "t".into(),
            reason,
        }
    }

    fn reporter() -> Reporter {
        Reporter::new("run-1", "all-products", false, Utc::now())
    }

    #[test]
    fn skips_bucket_by_vendor_reason_and_disposition() {
        let mut r = reporter();
        r.record_retained(["Acme", "Acme", " Beta "]);
        r.record_skips([
            skip("Acme", SkipReason::NoImages),
            skip("Acme", SkipReason::AlreadyIngested),
            skip("Gamma", SkipReason::ExcludedVendor),
        ]);
        let report = r.finish(BTreeMap::new(), Utc::now());

        assert_eq!(report.retained, 3);
        assert_eq!(report.vendors["Acme"].retained, 2);
        assert_eq!(report.vendors["Acme"].excluded, 1);
        assert_eq!(report.vendors["Acme"].skipped, 1);
        assert_eq!(report.vendors["Beta"].retained, 1);
        assert_eq!(report.skip_reasons[&SkipReason::NoImages], 1);
        assert_eq!(report.dispositions[&Disposition::Excluded], 2);
        assert_eq!(report.dispositions[&Disposition::Skipped], 1);
        assert_eq!(report.status, RunStatus::Completed);
    }

    #[test]
    fn merged_duplicates_are_not_vendor_skips() {
        let mut r = reporter();
        r.record_retained(["Acme"]);
        r.record_skips([
            skip("Acme", SkipReason::DuplicateInRun),
            skip("Acme", SkipReason::DuplicateInRun),
        ]);
        let report = r.finish(BTreeMap::new(), Utc::now());

        assert_eq!(report.vendors["Acme"].retained, 1);
        assert_eq!(report.vendors["Acme"].skipped, 0);
        assert_eq!(report.skip_reasons[&SkipReason::DuplicateInRun], 2);
        assert!(report.dispositions.is_empty());
    }

    #[test]
    fn status_follows_failures_and_rollback() {
        let mut r = reporter();
        r.record_skip(skip("Acme", SkipReason::NoVariants));
        assert_eq!(
            r.finish(BTreeMap::new(), Utc::now()).status,
            RunStatus::CompletedWithErrors
        );

        let mut r = reporter();
        r.record_index(
            &IndexSummary {
                failed: 1,
                rolled_back: true,
                ..Default::default()
            },
            &[],
        );
        assert_eq!(r.finish(BTreeMap::new(), Utc::now()).status, RunStatus::RolledBack);
    }

    #[test]
    fn report_survives_the_run_ledger() {
        let mut r = reporter();
        r.record_category(&CategoryPath {
            handles: vec!["hotends".into(), "nozzles".into()],
            names: vec!["Hotends".into(), "Nozzles".into()],
        });
        r.record_skip(skip("Acme", SkipReason::NoImages));
        let report = r.finish(BTreeMap::from([(ProductState::Canonical, 1)]), Utc::now());

        let json = serde_json::to_string(&report).unwrap();
        let back: RunReport = serde_json::from_str(&json).unwrap();
        assert_eq!(back, report);
        assert_eq!(back.categories["hotends/nozzles"], 1);

        let text = report.render();
        assert!(text.contains("no images"));
        assert!(text.contains("hotends/nozzles"));
    }

    #[test]
    fn tracker_rejects_illegal_moves() {
        let mut t = LifecycleTracker::new(HashMap::new());
        assert!(!t.advance("1", ProductState::Indexed));
        assert_eq!(t.state("1"), ProductState::Unseen);
        assert_eq!(t.rejected(), 1);

        assert!(t.advance("1", ProductState::Candidate));
        assert!(t.advance("1", ProductState::Canonical));
        assert!(t.advance("1", ProductState::Enriched));
        assert!(t.advance("1", ProductState::Indexed));
        assert_eq!(t.counts()[&ProductState::Indexed], 1);
        assert_eq!(t.changed_rows()[0].1, "prod_1");
    }

    #[test]
    fn reenter_only_restarts_idle_products() {
        let mut t = LifecycleTracker::new(HashMap::from([
            ("1".to_string(), ProductState::Orphaned),
            ("2".to_string(), ProductState::Indexed),
        ]));
        t.reenter("1");
        t.reenter("2");
        t.reenter("3");
        assert_eq!(t.state("1"), ProductState::Candidate);
        assert_eq!(t.state("2"), ProductState::Indexed);
        assert_eq!(t.state("3"), ProductState::Candidate);
    }
}
