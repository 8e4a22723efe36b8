//! Vendor catalog extraction.
//!
//! This crate provides:
//! - [`VendorFetcher`]: rate-limited, paginated HTTP retrieval of vendor pages
//! - [`PageCursor`]: lazy, forward-only page sequence with deadline and ceiling checks

pub mod fetcher;

pub use fetcher::{
    FailureKind, FetchFailure, FetchRun, FetcherConfig, PageCursor, PageOutcome, SourceSpec,
    VendorFetcher,
};
