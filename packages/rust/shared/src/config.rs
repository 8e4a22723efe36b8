//! Application configuration for catalogsync.
//!
//! Lookup order: an explicit `--config` path, then `./catalogsync.toml`, then
//! `~/.catalogsync/catalogsync.toml`, then built-in defaults. Secrets are never
//! stored in the file; each service section names the env var holding its token.

use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{CatalogSyncError, Result};
use crate::types::CategoryNode;

/// Default configuration file name.
const CONFIG_FILE_NAME: &str = "catalogsync.toml";

/// Default config directory name under the user's home.
const CONFIG_DIR_NAME: &str = ".catalogsync";

// ---------------------------------------------------------------------------
// Config structs (matching catalogsync.toml schema)
// ---------------------------------------------------------------------------

/// Top-level application config, deserialized from TOML.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub vendor: VendorConfig,

    #[serde(default)]
    pub filters: FiltersConfig,

    #[serde(default)]
    pub taxonomy: TaxonomyConfig,

    #[serde(default)]
    pub options: OptionsConfig,

    /// Markets to price documents in. The first market is the base currency.
    #[serde(default = "default_markets")]
    pub markets: Vec<MarketConfig>,

    #[serde(default)]
    pub enrichment: EnrichmentConfig,

    #[serde(default = "default_content_service")]
    pub content_service: ServiceConfig,

    #[serde(default = "default_commerce")]
    pub commerce: ServiceConfig,

    #[serde(default)]
    pub search_index: SearchIndexConfig,

    #[serde(default)]
    pub run: RunConfig,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            vendor: VendorConfig::default(),
            filters: FiltersConfig::default(),
            taxonomy: TaxonomyConfig::default(),
            options: OptionsConfig::default(),
            markets: default_markets(),
            enrichment: EnrichmentConfig::default(),
            content_service: default_content_service(),
            commerce: default_commerce(),
            search_index: SearchIndexConfig::default(),
            run: RunConfig::default(),
        }
    }
}

/// `[vendor]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VendorConfig {
    /// Storefront root, e.g. `https://vendor.example.com`.
    #[serde(default)]
    pub base_url: String,

    /// Collection handles to walk in order. Empty means the full listing.
    #[serde(default)]
    pub collections: Vec<String>,

    #[serde(default = "default_page_size")]
    pub page_size: u32,

    /// Page ceiling per collection.
    #[serde(default = "default_max_pages")]
    pub max_pages: u32,

    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,

    /// Fixed delay between page requests.
    #[serde(default = "default_politeness_delay_ms")]
    pub politeness_delay_ms: u64,

    /// Stop a collection after this many failed pages in a row.
    #[serde(default = "default_max_consecutive_failures")]
    pub max_consecutive_failures: u32,
}

impl Default for VendorConfig {
    fn default() -> Self {
        Self {
            base_url: String::new(),
            collections: Vec::new(),
            page_size: default_page_size(),
            max_pages: default_max_pages(),
            timeout_secs: default_timeout_secs(),
            politeness_delay_ms: default_politeness_delay_ms(),
            max_consecutive_failures: default_max_consecutive_failures(),
        }
    }
}

fn default_page_size() -> u32 {
    250
}
fn default_max_pages() -> u32 {
    50
}
fn default_timeout_secs() -> u64 {
    30
}
fn default_politeness_delay_ms() -> u64 {
    3000
}
fn default_max_consecutive_failures() -> u32 {
    3
}

/// `[filters]` section.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FiltersConfig {
    /// Vendors allowed into the catalog. Must not be empty.
    #[serde(default)]
    pub approved_vendors: Vec<String>,

    /// Vendors never ingested. Wins over `approved_vendors`.
    #[serde(default)]
    pub excluded_vendors: Vec<String>,
}

/// `[taxonomy]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaxonomyConfig {
    /// Category used when nothing matches.
    #[serde(default = "default_category")]
    pub default: CategoryNode,

    /// Ordered category nodes. Declaration order is match priority.
    #[serde(default)]
    pub categories: Vec<CategoryNode>,
}

impl Default for TaxonomyConfig {
    fn default() -> Self {
        Self {
            default: default_category(),
            categories: Vec::new(),
        }
    }
}

fn default_category() -> CategoryNode {
    CategoryNode {
        name: "Uncategorized".into(),
        handle: "uncategorized".into(),
        parent: None,
        collections: Vec::new(),
        product_types: Vec::new(),
    }
}

/// `[options]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OptionsConfig {
    /// Product-type specific key pairs for `A / B` variant titles.
    /// Evaluated before the built-in rules.
    #[serde(default)]
    pub slash_pairs: Vec<SlashPairConfig>,

    /// Words that classify a variant title part as a color.
    #[serde(default = "default_colors")]
    pub colors: Vec<String>,

    /// Words that classify a part as a size, on top of numeric measurements.
    #[serde(default = "default_sizes")]
    pub sizes: Vec<String>,

    /// Alphanumerics of the vendor name used as the synthesized SKU prefix.
    #[serde(default = "default_sku_prefix_len")]
    pub sku_prefix_len: usize,
}

impl Default for OptionsConfig {
    fn default() -> Self {
        Self {
            slash_pairs: Vec::new(),
            colors: default_colors(),
            sizes: default_sizes(),
            sku_prefix_len: default_sku_prefix_len(),
        }
    }
}

/// `[[options.slash_pairs]]` entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SlashPairConfig {
    /// Case-insensitive substring of the product type.
    pub product_type_contains: String,
    /// Keys for the left and right part.
    pub keys: [String; 2],
}

fn default_colors() -> Vec<String> {
    [
        "black", "white", "red", "blue", "green", "yellow", "orange", "purple", "pink", "grey",
        "gray", "silver", "gold", "brown", "clear", "transparent", "natural",
    ]
    .into_iter()
    .map(String::from)
    .collect()
}

fn default_sizes() -> Vec<String> {
    ["xs", "s", "m", "l", "xl", "xxl", "small", "medium", "large"]
        .into_iter()
        .map(String::from)
        .collect()
}

fn default_sku_prefix_len() -> usize {
    3
}

/// `[[markets]]` entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MarketConfig {
    /// ISO currency code, e.g. `USD`.
    pub currency: String,
    /// Conversion rate from the vendor's currency.
    #[serde(default = "default_rate")]
    pub rate: f64,
    #[serde(default = "default_decimals")]
    pub decimals: u32,
}

fn default_rate() -> f64 {
    1.0
}
fn default_decimals() -> u32 {
    2
}

fn default_markets() -> Vec<MarketConfig> {
    vec![MarketConfig {
        currency: "USD".into(),
        rate: default_rate(),
        decimals: default_decimals(),
    }]
}

/// `[enrichment]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnrichmentConfig {
    /// Feature sentence used when a category has no template.
    #[serde(default = "default_feature_template")]
    pub default_template: String,

    /// Feature sentence per category handle.
    #[serde(default)]
    pub templates: BTreeMap<String, String>,

    /// Cap on derived keywords per record.
    #[serde(default = "default_max_keywords")]
    pub max_keywords: usize,
}

impl Default for EnrichmentConfig {
    fn default() -> Self {
        Self {
            default_template: default_feature_template(),
            templates: BTreeMap::new(),
            max_keywords: default_max_keywords(),
        }
    }
}

impl EnrichmentConfig {
    /// Template for a category handle, falling back to the default.
    pub fn template_for(&self, category_handle: &str) -> &str {
        self.templates
            .get(category_handle)
            .map(String::as_str)
            .unwrap_or(&self.default_template)
    }
}

fn default_feature_template() -> String {
    "Built for reliable everyday printing.".into()
}
fn default_max_keywords() -> usize {
    12
}

/// `[content_service]` and `[commerce]` sections.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceConfig {
    pub base_url: String,

    /// Name of the env var holding the bearer token (never store the token itself).
    pub token_env: String,

    /// Concurrent write requests.
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,

    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,

    #[serde(default = "default_service_page_size")]
    pub page_size: u32,
}

fn default_content_service() -> ServiceConfig {
    ServiceConfig {
        base_url: "http://localhost:1337/api".into(),
        token_env: "CATALOGSYNC_CONTENT_TOKEN".into(),
        concurrency: default_concurrency(),
        timeout_secs: default_timeout_secs(),
        page_size: default_service_page_size(),
    }
}

fn default_commerce() -> ServiceConfig {
    ServiceConfig {
        base_url: "http://localhost:9000/admin".into(),
        token_env: "CATALOGSYNC_COMMERCE_TOKEN".into(),
        concurrency: default_concurrency(),
        timeout_secs: default_timeout_secs(),
        page_size: default_service_page_size(),
    }
}

fn default_concurrency() -> usize {
    4
}
fn default_service_page_size() -> u32 {
    100
}

/// `[search_index]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchIndexConfig {
    #[serde(default = "default_index_url")]
    pub base_url: String,

    #[serde(default = "default_index_token_env")]
    pub token_env: String,

    /// Index uid, e.g. `products`.
    #[serde(default = "default_index_uid")]
    pub index_uid: String,

    #[serde(default = "default_concurrency")]
    pub concurrency: usize,

    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,

    #[serde(default = "default_index_page_size")]
    pub page_size: u32,

    /// Restore deleted documents when any index write in the run failed.
    #[serde(default = "default_true")]
    pub rollback_on_failure: bool,
}

impl Default for SearchIndexConfig {
    fn default() -> Self {
        Self {
            base_url: default_index_url(),
            token_env: default_index_token_env(),
            index_uid: default_index_uid(),
            concurrency: default_concurrency(),
            timeout_secs: default_timeout_secs(),
            page_size: default_index_page_size(),
            rollback_on_failure: true,
        }
    }
}

fn default_index_url() -> String {
    "http://localhost:7700".into()
}
fn default_index_token_env() -> String {
    "CATALOGSYNC_INDEX_KEY".into()
}
fn default_index_uid() -> String {
    "products".into()
}
fn default_index_page_size() -> u32 {
    1000
}
fn default_true() -> bool {
    true
}

/// `[run]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunConfig {
    /// Directory holding the database, batch artifacts and run lock.
    #[serde(default = "default_state_dir")]
    pub state_dir: String,

    /// Retain at most this many new products per run.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_items: Option<usize>,

    /// Wall-clock budget for extraction.
    #[serde(default = "default_deadline_secs")]
    pub deadline_secs: u64,

    /// Age after which `--break-lock` may remove a run lock.
    #[serde(default = "default_stale_lock_secs")]
    pub stale_lock_secs: u64,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            state_dir: default_state_dir(),
            max_items: None,
            deadline_secs: default_deadline_secs(),
            stale_lock_secs: default_stale_lock_secs(),
        }
    }
}

impl RunConfig {
    /// State directory with a leading `~` expanded.
    pub fn state_dir_path(&self) -> Result<PathBuf> {
        expand_home(&self.state_dir)
    }
}

fn default_state_dir() -> String {
    "~/.catalogsync/state".into()
}
fn default_deadline_secs() -> u64 {
    3600
}
fn default_stale_lock_secs() -> u64 {
    6 * 3600
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

impl AppConfig {
    /// Reject configurations that would make a run meaningless.
    pub fn validate(&self) -> Result<()> {
        if self.vendor.base_url.trim().is_empty() {
            return Err(CatalogSyncError::config("[vendor] base_url is not set"));
        }
        url::Url::parse(&self.vendor.base_url).map_err(|e| {
            CatalogSyncError::config(format!(
                "[vendor] base_url '{}' is not a valid URL: {e}",
                self.vendor.base_url
            ))
        })?;

        if self.filters.approved_vendors.iter().all(|v| v.trim().is_empty()) {
            return Err(CatalogSyncError::config(
                "[filters] approved_vendors is empty; nothing would be ingested",
            ));
        }

        if self.markets.is_empty() {
            return Err(CatalogSyncError::config("at least one [[markets]] entry is required"));
        }
        let mut currencies = HashSet::new();
        for market in &self.markets {
            if !currencies.insert(market.currency.to_ascii_lowercase()) {
                return Err(CatalogSyncError::config(format!(
                    "market currency {} is configured more than once",
                    market.currency
                )));
            }
            if !(market.rate.is_finite() && market.rate > 0.0) {
                return Err(CatalogSyncError::config(format!(
                    "market {} has a non-positive rate",
                    market.currency
                )));
            }
        }

        let handles: HashSet<&str> = self
            .taxonomy
            .categories
            .iter()
            .map(|c| c.handle.as_str())
            .collect();
        for node in &self.taxonomy.categories {
            if let Some(parent) = &node.parent {
                if !handles.contains(parent.as_str()) {
                    return Err(CatalogSyncError::config(format!(
                        "category '{}' names unknown parent '{parent}'",
                        node.handle
                    )));
                }
            }
        }

        for (section, base_url) in [
            ("content_service", &self.content_service.base_url),
            ("commerce", &self.commerce.base_url),
            ("search_index", &self.search_index.base_url),
        ] {
            if base_url.trim().is_empty() {
                return Err(CatalogSyncError::config(format!(
                    "[{section}] base_url is not set"
                )));
            }
        }

        Ok(())
    }

    /// Source description recorded on batches, e.g. `collections:hotends,nozzles`.
    pub fn source_label(&self) -> String {
        if self.vendor.collections.is_empty() {
            "all-products".into()
        } else {
            format!("collections:{}", self.vendor.collections.join(","))
        }
    }
}

/// Check that every service token env var is set and non-empty.
pub fn validate_credentials(config: &AppConfig) -> Result<()> {
    for (section, var_name) in [
        ("content_service", &config.content_service.token_env),
        ("commerce", &config.commerce.token_env),
        ("search_index", &config.search_index.token_env),
    ] {
        match std::env::var(var_name) {
            Ok(val) if !val.is_empty() => {}
            _ => {
                return Err(CatalogSyncError::config(format!(
                    "[{section}] token not found. Set the {var_name} environment variable."
                )));
            }
        }
    }
    Ok(())
}

/// Read the token named by `token_env`, if set.
pub fn read_token(token_env: &str) -> Option<String> {
    std::env::var(token_env).ok().filter(|v| !v.is_empty())
}

// ---------------------------------------------------------------------------
// Config loading
// ---------------------------------------------------------------------------

/// Get the path to the config directory (`~/.catalogsync/`).
pub fn config_dir() -> Result<PathBuf> {
    let home = dirs::home_dir()
        .ok_or_else(|| CatalogSyncError::config("could not determine home directory"))?;
    Ok(home.join(CONFIG_DIR_NAME))
}

/// Get the path to the user config file (`~/.catalogsync/catalogsync.toml`).
pub fn config_file_path() -> Result<PathBuf> {
    Ok(config_dir()?.join(CONFIG_FILE_NAME))
}

/// Resolve which config file applies, if any.
pub fn resolve_config_path(explicit: Option<&Path>) -> Result<Option<PathBuf>> {
    if let Some(path) = explicit {
        if !path.exists() {
            return Err(CatalogSyncError::config(format!(
                "config file {} does not exist",
                path.display()
            )));
        }
        return Ok(Some(path.to_path_buf()));
    }

    let local = PathBuf::from(CONFIG_FILE_NAME);
    if local.exists() {
        return Ok(Some(local));
    }

    let user = config_file_path()?;
    Ok(user.exists().then_some(user))
}

/// Load the application config. Returns defaults if no file is found.
pub fn load_config(explicit: Option<&Path>) -> Result<AppConfig> {
    match resolve_config_path(explicit)? {
        Some(path) => load_config_from(&path),
        None => {
            tracing::debug!("config file not found, using defaults");
            Ok(AppConfig::default())
        }
    }
}

/// Load the application config from a specific file path.
pub fn load_config_from(path: &Path) -> Result<AppConfig> {
    let content = std::fs::read_to_string(path).map_err(|e| CatalogSyncError::io(path, e))?;

    toml::from_str(&content).map_err(|e| {
        CatalogSyncError::config(format!("failed to parse {}: {e}", path.display()))
    })
}

/// Write a default config file to `target`, or to the user config path.
/// Refuses to overwrite an existing file. Returns the path written.
pub fn init_config(target: Option<&Path>) -> Result<PathBuf> {
    let path = match target {
        Some(p) => p.to_path_buf(),
        None => config_file_path()?,
    };
    if path.exists() {
        return Err(CatalogSyncError::config(format!(
            "{} already exists",
            path.display()
        )));
    }
    if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
        std::fs::create_dir_all(dir).map_err(|e| CatalogSyncError::io(dir, e))?;
    }

    let content = toml::to_string_pretty(&AppConfig::default())
        .map_err(|e| CatalogSyncError::config(e.to_string()))?;

    std::fs::write(&path, content).map_err(|e| CatalogSyncError::io(&path, e))?;
    tracing::info!(?path, "created default config file");

    Ok(path)
}

fn expand_home(raw: &str) -> Result<PathBuf> {
    match raw.strip_prefix("~/") {
        Some(rest) => {
            let home = dirs::home_dir()
                .ok_or_else(|| CatalogSyncError::config("could not determine home directory"))?;
            Ok(home.join(rest))
        }
        None => Ok(PathBuf::from(raw)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid_config() -> AppConfig {
        let mut config = AppConfig::default();
        config.vendor.base_url = "https://vendor.example.com".into();
        config.filters.approved_vendors = vec!["Acme".into()];
        config
    }

    #[test]
    fn default_config_serializes() {
        let toml_str = toml::to_string_pretty(&AppConfig::default()).expect("serialize");
        assert!(toml_str.contains("politeness_delay_ms"));
        assert!(toml_str.contains("CATALOGSYNC_CONTENT_TOKEN"));
    }

    #[test]
    fn config_roundtrip() {
        let toml_str = toml::to_string_pretty(&valid_config()).expect("serialize");
        let parsed: AppConfig = toml::from_str(&toml_str).expect("deserialize");
        assert_eq!(parsed.vendor.politeness_delay_ms, 3000);
        assert_eq!(parsed.vendor.max_consecutive_failures, 3);
        assert_eq!(parsed.markets[0].currency, "USD");
        assert_eq!(parsed.taxonomy.default.handle, "uncategorized");
    }

    #[test]
    fn parses_taxonomy_and_markets() {
        let toml_str = r#"
[vendor]
base_url = "https://vendor.example.com"
collections = ["hotends", "nozzles"]

[filters]
approved_vendors = ["Acme"]
excluded_vendors = ["Knockoff Co"]

[[taxonomy.categories]]
name = "Hotends"
handle = "hotends"
collections = ["hotends"]

[[taxonomy.categories]]
name = "Nozzles"
handle = "nozzles"
parent = "hotends"
collections = ["nozzles"]
product_types = ["Nozzle"]

[[options.slash_pairs]]
product_type_contains = "filament"
keys = ["Material", "Diameter"]

[[markets]]
currency = "USD"

[[markets]]
currency = "EUR"
rate = 0.92

[enrichment.templates]
nozzles = "Hardened for abrasive filaments."
"#;
        let config: AppConfig = toml::from_str(toml_str).expect("parse");
        config.validate().expect("valid");
        assert_eq!(config.taxonomy.categories.len(), 2);
        assert_eq!(config.taxonomy.categories[1].parent.as_deref(), Some("hotends"));
        assert_eq!(config.markets[1].decimals, 2);
        assert_eq!(config.options.slash_pairs[0].keys[1], "Diameter");
        assert_eq!(
            config.enrichment.template_for("nozzles"),
            "Hardened for abrasive filaments."
        );
        assert_eq!(
            config.enrichment.template_for("hotends"),
            config.enrichment.default_template
        );
        assert_eq!(config.source_label(), "collections:hotends,nozzles");
    }

    #[test]
    fn validate_rejects_empty_approved_list() {
        let mut config = valid_config();
        config.filters.approved_vendors.clear();
        let err = config.validate().unwrap_err();
        assert!(err.is_fatal());
        assert!(err.to_string().contains("approved_vendors"));
    }

    #[test]
    fn validate_rejects_duplicate_currency() {
        let mut config = valid_config();
        config.markets.push(MarketConfig {
            currency: "usd".into(),
            rate: 1.0,
            decimals: 2,
        });
        assert!(config.validate().unwrap_err().to_string().contains("more than once"));
    }

    #[test]
    fn validate_rejects_unknown_parent() {
        let mut config = valid_config();
        config.taxonomy.categories.push(CategoryNode {
            name: "Nozzles".into(),
            handle: "nozzles".into(),
            parent: Some("missing".into()),
            collections: vec![],
            product_types: vec![],
        });
        assert!(config.validate().unwrap_err().to_string().contains("unknown parent"));
    }

    #[test]
    fn credentials_validation() {
        let mut config = valid_config();
        // Unique names so parallel tests never see them set
        config.content_service.token_env = "CS_TEST_NONEXISTENT_TOKEN_81723".into();
        let err = validate_credentials(&config).unwrap_err();
        assert!(err.to_string().contains("CS_TEST_NONEXISTENT_TOKEN_81723"));
    }

    #[test]
    fn init_refuses_to_overwrite() {
        let dir = std::env::temp_dir().join(format!("cs-config-{}", uuid::Uuid::now_v7()));
        let path = dir.join("catalogsync.toml");

        let written = init_config(Some(&path)).expect("init");
        assert_eq!(written, path);
        assert!(load_config_from(&path).is_ok());
        assert!(init_config(Some(&path)).is_err());

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn explicit_missing_path_is_an_error() {
        let missing = std::env::temp_dir().join("cs-does-not-exist-4411.toml");
        assert!(load_config(Some(&missing)).is_err());
    }
}
