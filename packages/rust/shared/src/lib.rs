//! Shared types, error model, and configuration for catalogsync.
//!
//! This crate is the foundation depended on by all other catalogsync crates.
//! It provides:
//! - [`CatalogSyncError`]: the unified error type
//! - Domain types ([`VendorProduct`], [`Batch`], [`CanonicalProduct`], [`IndexDocument`], ...)
//! - Configuration ([`AppConfig`], config loading and validation)

pub mod config;
pub mod error;
pub mod types;

// Re-export public API at crate root for ergonomic imports.
pub use config::{
    AppConfig, EnrichmentConfig, FiltersConfig, MarketConfig, OptionsConfig, RunConfig,
    SearchIndexConfig, ServiceConfig, SlashPairConfig, TaxonomyConfig, VendorConfig, config_dir,
    config_file_path, init_config, load_config, load_config_from, read_token,
    resolve_config_path, validate_credentials,
};
pub use error::{CatalogSyncError, Result};
pub use types::{
    Batch, BrandRef, CANONICAL_ID_PREFIX, CanonicalId, CanonicalProduct, Candidate,
    CatalogProductRef, CategoryNode, CategoryPath, CategoryRef, EnrichmentRecord, EntityKind,
    IndexBrand, IndexDocument, NormalizedVariant, ProductState, RunStatus, SyncStatus, VendorImage,
    VendorPage, VendorProduct, VendorVariant, content_hash, option_field, price_field, slugify,
};
