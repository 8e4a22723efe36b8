//! Core domain types for the catalog pipeline.

use std::collections::{BTreeMap, BTreeSet, HashSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::error::{CatalogSyncError, Result};

/// Prefix of every canonical product id.
pub const CANONICAL_ID_PREFIX: &str = "prod_";

// ---------------------------------------------------------------------------
// CanonicalId
// ---------------------------------------------------------------------------

/// Stable pipeline identifier derived from a vendor id.
///
/// The mapping is pure: `prod_` followed by the vendor id with every byte
/// outside `[A-Za-z0-9-]` escaped as `_xx`. Escaping `_` itself keeps the
/// function injective.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CanonicalId(String);

impl CanonicalId {
    /// Derive the canonical id for a vendor id.
    pub fn from_vendor_id(vendor_id: &str) -> Self {
        let mut id = String::with_capacity(CANONICAL_ID_PREFIX.len() + vendor_id.len());
        id.push_str(CANONICAL_ID_PREFIX);
        for byte in vendor_id.bytes() {
            if byte.is_ascii_alphanumeric() || byte == b'-' {
                id.push(byte as char);
            } else {
                id.push_str(&format!("_{byte:02x}"));
            }
        }
        Self(id)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for CanonicalId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

// ---------------------------------------------------------------------------
// Vendor wire types
// ---------------------------------------------------------------------------

/// One page of the vendor catalog API.
#[derive(Debug, Clone, Deserialize)]
pub struct VendorPage {
    #[serde(default)]
    pub products: Vec<VendorProduct>,
}

/// A product exactly as the vendor API returns it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VendorProduct {
    /// Vendor-assigned id. The API sends a number; it is kept as a string.
    #[serde(deserialize_with = "de_id")]
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub handle: String,
    #[serde(default)]
    pub vendor: String,
    #[serde(default)]
    pub product_type: String,
    #[serde(default, deserialize_with = "de_tags")]
    pub tags: Vec<String>,
    #[serde(default)]
    pub images: Vec<VendorImage>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body_html: Option<String>,
    #[serde(default)]
    pub variants: Vec<VendorVariant>,
    /// Collection handles this product was fetched from. Set by the fetcher.
    #[serde(default)]
    pub source_collections: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VendorImage {
    pub src: String,
}

/// A purchasable variant as the vendor API returns it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VendorVariant {
    #[serde(deserialize_with = "de_id")]
    pub id: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub sku: Option<String>,
    /// Decimal price string, e.g. `"19.99"`.
    #[serde(default, deserialize_with = "de_opt_price")]
    pub price: Option<String>,
    #[serde(default, deserialize_with = "de_opt_price")]
    pub compare_at_price: Option<String>,
    #[serde(default)]
    pub option1: Option<String>,
    #[serde(default)]
    pub option2: Option<String>,
    #[serde(default)]
    pub option3: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub available: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub inventory_quantity: Option<i64>,
}

/// Accept a JSON number or string id.
fn de_id<'de, D>(deserializer: D) -> std::result::Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum RawId {
        Signed(i64),
        Unsigned(u64),
        Text(String),
    }

    Ok(match RawId::deserialize(deserializer)? {
        RawId::Signed(n) => n.to_string(),
        RawId::Unsigned(n) => n.to_string(),
        RawId::Text(s) => s.trim().to_string(),
    })
}

/// Prices arrive as strings, numbers, or null.
fn de_opt_price<'de, D>(deserializer: D) -> std::result::Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum RawPrice {
        Num(f64),
        Text(String),
    }

    Ok(
        Option::<RawPrice>::deserialize(deserializer)?.map(|raw| match raw {
            RawPrice::Num(n) => n.to_string(),
            RawPrice::Text(s) => s,
        }),
    )
}

/// Tags arrive either as an array or as one comma-separated string.
fn de_tags<'de, D>(deserializer: D) -> std::result::Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum RawTags {
        List(Vec<String>),
        Joined(String),
    }

    let tags = match Option::<RawTags>::deserialize(deserializer)? {
        None => Vec::new(),
        Some(RawTags::List(list)) => list,
        Some(RawTags::Joined(joined)) => joined.split(',').map(str::to_string).collect(),
    };

    Ok(tags
        .into_iter()
        .map(|t| t.trim().to_string())
        .filter(|t| !t.is_empty())
        .collect())
}

// ---------------------------------------------------------------------------
// Batch
// ---------------------------------------------------------------------------

/// The retained output of one extraction run. Immutable once persisted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Batch {
    /// UUID v7 (time-sortable).
    pub id: String,
    pub extracted_at: DateTime<Utc>,
    /// Human-readable source description, e.g. `collections:hotends,nozzles`.
    pub source: String,
    pub products: Vec<VendorProduct>,
}

impl Batch {
    /// Build a batch, rejecting duplicate vendor ids.
    pub fn new(
        source: impl Into<String>,
        extracted_at: DateTime<Utc>,
        products: Vec<VendorProduct>,
    ) -> Result<Self> {
        let batch = Self {
            id: Uuid::now_v7().to_string(),
            extracted_at,
            source: source.into(),
            products,
        };
        batch.validate()?;
        Ok(batch)
    }

    /// Check the no-duplicate-vendor-id invariant.
    pub fn validate(&self) -> Result<()> {
        let mut seen = HashSet::with_capacity(self.products.len());
        for product in &self.products {
            if !seen.insert(product.id.as_str()) {
                return Err(CatalogSyncError::validation(format!(
                    "batch {} contains vendor id {} more than once",
                    self.id, product.id
                )));
            }
        }
        Ok(())
    }

    pub fn vendor_ids(&self) -> impl Iterator<Item = &str> {
        self.products.iter().map(|p| p.id.as_str())
    }
}

// ---------------------------------------------------------------------------
// Candidate
// ---------------------------------------------------------------------------

/// A vendor product that survived filtering, with its cross-batch context.
#[derive(Debug, Clone, PartialEq)]
pub struct Candidate {
    pub product: VendorProduct,
    /// Union of collection handles across every batch that contained the id.
    pub collections: BTreeSet<String>,
    /// Timestamp of the earliest batch that contained the id.
    pub first_seen_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Taxonomy
// ---------------------------------------------------------------------------

/// A configured taxonomy entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CategoryNode {
    pub name: String,
    pub handle: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent: Option<String>,
    /// Vendor collection handles that map to this node.
    #[serde(default)]
    pub collections: Vec<String>,
    /// Vendor product-type strings that map to this node.
    #[serde(default)]
    pub product_types: Vec<String>,
}

/// The category a product was assigned, root first.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CategoryPath {
    pub handles: Vec<String>,
    pub names: Vec<String>,
}

impl CategoryPath {
    pub fn leaf_handle(&self) -> &str {
        self.handles.last().map(String::as_str).unwrap_or_default()
    }

    pub fn leaf_name(&self) -> &str {
        self.names.last().map(String::as_str).unwrap_or_default()
    }
}

impl std::fmt::Display for CategoryPath {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.handles.join("/"))
    }
}

// ---------------------------------------------------------------------------
// CanonicalProduct
// ---------------------------------------------------------------------------

/// A variant after price parsing, option parsing and SKU synthesis.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NormalizedVariant {
    pub id: String,
    pub title: String,
    pub sku: String,
    pub price: f64,
    pub compare_at_price: Option<f64>,
    pub on_sale: bool,
    pub options: BTreeMap<String, String>,
    pub available: bool,
    pub inventory_quantity: Option<i64>,
}

/// Pipeline-internal normalized product.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CanonicalProduct {
    pub id: CanonicalId,
    pub vendor_id: String,
    pub title: String,
    pub handle: String,
    pub vendor: String,
    pub product_type: String,
    pub category: CategoryPath,
    pub variants: Vec<NormalizedVariant>,
    pub images: Vec<String>,
    pub tags: Vec<String>,
    pub collections: Vec<String>,
    pub body_html: Option<String>,
    pub first_seen_at: DateTime<Utc>,
    pub on_sale: bool,
}

impl CanonicalProduct {
    /// Hash of the content a description is written against.
    ///
    /// Changes to title, vendor, type, category or tags make enrichment stale.
    pub fn content_hash(&self) -> String {
        content_hash(&[
            self.title.as_str(),
            self.vendor.as_str(),
            self.product_type.as_str(),
            &self.category.to_string(),
            &self.tags.join(","),
            self.body_html.as_deref().unwrap_or_default(),
        ])
    }

    pub fn brand_handle(&self) -> String {
        slugify(&self.vendor)
    }
}

// ---------------------------------------------------------------------------
// Enrichment
// ---------------------------------------------------------------------------

/// What an enrichment record describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Product,
    Brand,
}

/// Sync status of an enrichment record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncStatus {
    Synced,
    Outdated,
    Pending,
}

/// Externally authored content for a product or brand.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnrichmentRecord {
    /// Content-service id. `None` until the record is created upstream.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub entity_kind: EntityKind,
    /// Canonical product id or brand handle.
    pub entity_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub handle: Option<String>,
    pub description: String,
    #[serde(default)]
    pub seo_title: String,
    #[serde(default)]
    pub seo_description: String,
    #[serde(default)]
    pub keywords: Vec<String>,
    pub sync_status: SyncStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_synced_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_hash: Option<String>,
}

// ---------------------------------------------------------------------------
// Commerce catalog references
// ---------------------------------------------------------------------------

/// A product the commerce catalog currently lists.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CatalogProductRef {
    pub id: String,
    #[serde(default)]
    pub handle: String,
}

/// Category reference data owned by the commerce catalog.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CategoryRef {
    pub id: String,
    pub handle: String,
    pub name: String,
}

/// Brand reference data owned by the commerce catalog.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BrandRef {
    pub id: String,
    pub handle: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub logo_url: Option<String>,
}

// ---------------------------------------------------------------------------
// IndexDocument
// ---------------------------------------------------------------------------

/// Brand sub-object of an index document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexBrand {
    pub id: String,
    pub handle: String,
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub logo_url: Option<String>,
}

/// The publishable search document.
///
/// `prices` and `options` are flattened into the top level as
/// `price_<currency>` and `options_<key>`, so the field set follows market and
/// option configuration. `BTreeMap` keeps serialization order stable.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct IndexDocument {
    pub id: String,
    pub title: String,
    pub handle: String,
    pub thumbnail: Option<String>,
    pub created_at: i64,
    pub on_sale: bool,
    pub in_stock: bool,
    pub stock_quantity: i64,
    pub category_ids: Vec<String>,
    pub category_names: Vec<String>,
    pub tags: Vec<String>,
    pub collection_ids: Vec<String>,
    pub brand: IndexBrand,
    pub rich_text: String,
    pub variant_skus: Vec<String>,
    #[serde(flatten)]
    pub prices: BTreeMap<String, f64>,
    #[serde(flatten)]
    pub options: BTreeMap<String, Vec<String>>,
}

impl IndexDocument {
    /// Serialize to the exact bytes sent to the index.
    pub fn to_json_bytes(&self) -> Result<Vec<u8>> {
        serde_json::to_vec(self)
            .map_err(|e| CatalogSyncError::validation(format!("document {}: {e}", self.id)))
    }

    pub fn to_value(&self) -> Result<serde_json::Value> {
        serde_json::to_value(self)
            .map_err(|e| CatalogSyncError::validation(format!("document {}: {e}", self.id)))
    }
}

/// Field name for a market's price.
pub fn price_field(currency: &str) -> String {
    format!("price_{}", currency.to_ascii_lowercase())
}

/// Field name for an option facet.
pub fn option_field(key: &str) -> String {
    format!("options_{}", slugify(key).replace('-', "_"))
}

// ---------------------------------------------------------------------------
// Lifecycle
// ---------------------------------------------------------------------------

/// Per vendor id lifecycle across the pipeline's lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProductState {
    Unseen,
    Candidate,
    Canonical,
    Enriched,
    Indexed,
    Excluded,
    Orphaned,
}

impl ProductState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Unseen => "unseen",
            Self::Candidate => "candidate",
            Self::Canonical => "canonical",
            Self::Enriched => "enriched",
            Self::Indexed => "indexed",
            Self::Excluded => "excluded",
            Self::Orphaned => "orphaned",
        }
    }

    /// Legal lifecycle edges. Staying put is always legal.
    ///
    /// Previously indexed products re-enter at `canonical` on every run since
    /// categories and documents are rebuilt fresh.
    pub fn can_transition_to(self, next: Self) -> bool {
        use ProductState::*;
        if self == next {
            return true;
        }
        matches!(
            (self, next),
            (Unseen, Candidate)
                | (Unseen, Excluded)
                | (Candidate, Canonical)
                | (Candidate, Excluded)
                | (Canonical | Enriched | Indexed, Excluded)
                | (Canonical, Enriched)
                | (Enriched, Indexed)
                | (Enriched | Indexed, Canonical)
                | (Canonical | Enriched | Indexed, Orphaned)
                | (Excluded, Candidate)
                | (Orphaned, Candidate)
        )
    }
}

impl std::str::FromStr for ProductState {
    type Err = CatalogSyncError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(match s {
            "unseen" => Self::Unseen,
            "candidate" => Self::Candidate,
            "canonical" => Self::Canonical,
            "enriched" => Self::Enriched,
            "indexed" => Self::Indexed,
            "excluded" => Self::Excluded,
            "orphaned" => Self::Orphaned,
            other => {
                return Err(CatalogSyncError::validation(format!(
                    "unknown product state '{other}'"
                )));
            }
        })
    }
}

/// Final state of a pipeline run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    Completed,
    CompletedWithErrors,
    RolledBack,
    Failed,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Completed => "completed",
            Self::CompletedWithErrors => "completed_with_errors",
            Self::RolledBack => "rolled_back",
            Self::Failed => "failed",
        }
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for RunStatus {
    type Err = CatalogSyncError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(match s {
            "running" => Self::Running,
            "completed" => Self::Completed,
            "completed_with_errors" => Self::CompletedWithErrors,
            "rolled_back" => Self::RolledBack,
            "failed" => Self::Failed,
            other => {
                return Err(CatalogSyncError::validation(format!(
                    "unknown run status '{other}'"
                )));
            }
        })
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// SHA-256 over the given parts, separated so `["ab","c"]` != `["a","bc"]`.
pub fn content_hash(parts: &[&str]) -> String {
    let mut hasher = Sha256::new();
    for part in parts {
        hasher.update(part.len().to_le_bytes());
        hasher.update(part.as_bytes());
    }
    format!("{:x}", hasher.finalize())
}

/// Lower-case, hyphen-separated slug of alphanumeric runs.
pub fn slugify(text: &str) -> String {
    text.to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .filter(|s| !s.is_empty())
        .collect::<Vec<_>>()
        .join("-")
}
