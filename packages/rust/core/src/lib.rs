//! Core pipeline orchestration and domain logic for catalogsync.
//!
//! This crate ties together extraction, filtering, normalization, description
//! reconciliation and search-index synchronization into one run
//! ([`pipeline::run_pipeline`]).

pub mod enrichment;
pub mod index;
pub mod pipeline;
pub mod pool;
pub mod report;

pub use enrichment::{Authority, BrandEntity, EnrichmentMerger, EnrichmentResult, EnrichmentSummary};
pub use index::{CatalogRefs, IndexSynchronizer, RestoreSummary, build_document};
pub use pipeline::{
    ProgressReporter, RunOptions, Services, SilentProgress, fetch_only, restore_run, run_pipeline,
};
pub use pool::{PoolConfig, TaskError, run_bounded};
pub use report::{LifecycleTracker, Reporter, RunReport};
