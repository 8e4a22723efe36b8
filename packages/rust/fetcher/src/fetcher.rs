//! Paginated, polite vendor catalog fetcher.
//!
//! Pages are requested strictly one at a time with a fixed delay between
//! requests. A failed page is logged, recorded and treated as empty; the cursor
//! always moves forward and never retries.

use std::time::Duration;

use reqwest::Client;
use tokio::time::Instant;
use tracing::{debug, info, instrument, warn};
use url::Url;

use catalogsync_shared::{CatalogSyncError, Result, VendorConfig, VendorPage, VendorProduct};

/// User-Agent string for vendor requests.
const USER_AGENT: &str = concat!("catalogsync/", env!("CARGO_PKG_VERSION"));

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// What to walk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SourceSpec {
    /// `GET {base}/products.json?page=N&limit=L`
    AllProducts,
    /// `GET {base}/collections/{handle}/products.json?page=N&limit=L`, in order.
    Collections(Vec<String>),
}

impl SourceSpec {
    pub fn from_collections(collections: &[String]) -> Self {
        if collections.is_empty() {
            Self::AllProducts
        } else {
            Self::Collections(collections.to_vec())
        }
    }
}

/// Runtime fetcher settings, built from `[vendor]` plus the run budget.
#[derive(Debug, Clone)]
pub struct FetcherConfig {
    pub base_url: Url,
    pub page_size: u32,
    /// Page ceiling per collection.
    pub max_pages: u32,
    pub timeout: Duration,
    pub politeness_delay: Duration,
    pub max_consecutive_failures: u32,
    /// Wall-clock budget measured from cursor creation.
    pub run_budget: Option<Duration>,
}

impl FetcherConfig {
    pub fn from_vendor(vendor: &VendorConfig, run_budget: Option<Duration>) -> Result<Self> {
        let base_url = Url::parse(&vendor.base_url).map_err(|e| {
            CatalogSyncError::config(format!("invalid vendor base_url '{}': {e}", vendor.base_url))
        })?;
        Ok(Self {
            base_url,
            page_size: vendor.page_size,
            max_pages: vendor.max_pages,
            timeout: Duration::from_secs(vendor.timeout_secs),
            politeness_delay: Duration::from_millis(vendor.politeness_delay_ms),
            max_consecutive_failures: vendor.max_consecutive_failures.max(1),
            run_budget,
        })
    }
}

// ---------------------------------------------------------------------------
// Page outcomes
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// Network error, timeout, or non-2xx status.
    Transient,
    /// Body could not be decoded as a product page.
    MalformedResponse,
}

/// A page that could not be read. The page counts as empty.
#[derive(Debug, Clone)]
pub struct FetchFailure {
    pub kind: FailureKind,
    pub url: String,
    pub page: u32,
    pub collection: Option<String>,
    pub message: String,
}

impl FetchFailure {
    pub fn into_error(self) -> CatalogSyncError {
        match self.kind {
            FailureKind::Transient => {
                CatalogSyncError::Fetch(format!("{}: {}", self.url, self.message))
            }
            FailureKind::MalformedResponse => {
                CatalogSyncError::malformed(format!("{}: {}", self.url, self.message))
            }
        }
    }
}

/// Result of one page request.
#[derive(Debug, Clone)]
pub struct PageOutcome {
    pub page: u32,
    pub collection: Option<String>,
    pub products: Vec<VendorProduct>,
    pub failure: Option<FetchFailure>,
}

/// Everything one drained cursor produced.
#[derive(Debug, Clone, Default)]
pub struct FetchRun {
    /// Products in arrival order. May repeat vendor ids across collections.
    pub products: Vec<VendorProduct>,
    pub failures: Vec<FetchFailure>,
    pub pages_requested: u32,
    pub deadline_reached: bool,
    pub ceiling_reached: bool,
    pub duration: Duration,
}

// ---------------------------------------------------------------------------
// VendorFetcher
// ---------------------------------------------------------------------------

/// HTTP client for the vendor catalog API.
pub struct VendorFetcher {
    config: FetcherConfig,
    client: Client,
}

impl VendorFetcher {
    pub fn new(config: FetcherConfig) -> Result<Self> {
        let client = Client::builder()
            .user_agent(USER_AGENT)
            .redirect(reqwest::redirect::Policy::limited(5))
            .timeout(config.timeout)
            .build()
            .map_err(|e| CatalogSyncError::Fetch(format!("failed to build HTTP client: {e}")))?;

        Ok(Self { config, client })
    }

    pub fn config(&self) -> &FetcherConfig {
        &self.config
    }

    /// Lazy page sequence over `source`. Nothing is requested until polled.
    pub fn pages(&self, source: &SourceSpec) -> PageCursor<'_> {
        let targets = match source {
            SourceSpec::AllProducts => vec![None],
            SourceSpec::Collections(handles) => handles.iter().cloned().map(Some).collect(),
        };
        PageCursor {
            fetcher: self,
            targets,
            target_idx: 0,
            page: 1,
            consecutive_failures: 0,
            requests_made: 0,
            deadline: self.config.run_budget.map(|b| Instant::now() + b),
            deadline_reached: false,
            ceiling_reached: false,
        }
    }

    /// Drain every page of `source`.
    #[instrument(skip_all, fields(base_url = %self.config.base_url))]
    pub async fn fetch_all(&self, source: &SourceSpec) -> FetchRun {
        let start = std::time::Instant::now();
        let mut cursor = self.pages(source);
        let mut run = FetchRun::default();

        info!(
            page_size = self.config.page_size,
            max_pages = self.config.max_pages,
            delay_ms = self.config.politeness_delay.as_millis() as u64,
            "starting extraction"
        );

        while let Some(outcome) = cursor.next_page().await {
            run.products.extend(outcome.products);
            if let Some(failure) = outcome.failure {
                run.failures.push(failure);
            }
        }

        run.pages_requested = cursor.requests_made();
        run.deadline_reached = cursor.deadline_reached();
        run.ceiling_reached = cursor.ceiling_reached();
        run.duration = start.elapsed();

        info!(
            products = run.products.len(),
            pages = run.pages_requested,
            failures = run.failures.len(),
            deadline_reached = run.deadline_reached,
            ceiling_reached = run.ceiling_reached,
            duration_ms = run.duration.as_millis() as u64,
            "extraction completed"
        );

        run
    }

    fn page_url(&self, collection: Option<&str>, page: u32) -> Result<Url> {
        let mut url = self.config.base_url.clone();
        url.set_query(None);
        url.set_fragment(None);
        {
            let mut segments = url.path_segments_mut().map_err(|_| {
                CatalogSyncError::config(format!(
                    "vendor base url cannot carry a path: {}",
                    self.config.base_url
                ))
            })?;
            segments.pop_if_empty();
            if let Some(handle) = collection {
                segments.push("collections").push(handle);
            }
            segments.push("products.json");
        }
        url.query_pairs_mut()
            .append_pair("page", &page.to_string())
            .append_pair("limit", &self.config.page_size.to_string());
        Ok(url)
    }

    async fn fetch_page(&self, collection: Option<&str>, page: u32) -> PageOutcome {
        let fail = |kind, url: &str, message: String| PageOutcome {
            page,
            collection: collection.map(str::to_string),
            products: Vec::new(),
            failure: Some(FetchFailure {
                kind,
                url: url.to_string(),
                page,
                collection: collection.map(str::to_string),
                message,
            }),
        };

        let url = match self.page_url(collection, page) {
            Ok(url) => url,
            Err(e) => return fail(FailureKind::Transient, "", e.to_string()),
        };

        debug!(%url, page, "fetching page");

        let response = match self.client.get(url.as_str()).send().await {
            Ok(r) => r,
            Err(e) => return fail(FailureKind::Transient, url.as_str(), e.to_string()),
        };

        let status = response.status();
        if !status.is_success() {
            return fail(FailureKind::Transient, url.as_str(), format!("HTTP {status}"));
        }

        let body = match response.bytes().await {
            Ok(b) => b,
            Err(e) => {
                return fail(
                    FailureKind::Transient,
                    url.as_str(),
                    format!("body read failed: {e}"),
                );
            }
        };

        let parsed: VendorPage = match serde_json::from_slice(&body) {
            Ok(p) => p,
            Err(e) => return fail(FailureKind::MalformedResponse, url.as_str(), e.to_string()),
        };

        let mut products = parsed.products;
        if let Some(handle) = collection {
            for product in &mut products {
                if !product.source_collections.iter().any(|c| c == handle) {
                    product.source_collections.push(handle.to_string());
                }
            }
        }

        PageOutcome {
            page,
            collection: collection.map(str::to_string),
            products,
            failure: None,
        }
    }
}

// ---------------------------------------------------------------------------
// PageCursor
// ---------------------------------------------------------------------------

/// Finite, forward-only sequence of page outcomes.
pub struct PageCursor<'a> {
    fetcher: &'a VendorFetcher,
    /// `None` is the full listing.
    targets: Vec<Option<String>>,
    target_idx: usize,
    page: u32,
    consecutive_failures: u32,
    requests_made: u32,
    deadline: Option<Instant>,
    deadline_reached: bool,
    ceiling_reached: bool,
}

impl PageCursor<'_> {
    /// Request the next page, or `None` when the sequence is exhausted.
    pub async fn next_page(&mut self) -> Option<PageOutcome> {
        let fetcher = self.fetcher;
        let config = &fetcher.config;

        loop {
            let target = self.targets.get(self.target_idx)?.clone();

            if self.page > config.max_pages {
                warn!(
                    collection = target.as_deref().unwrap_or("*"),
                    max_pages = config.max_pages,
                    "page ceiling reached"
                );
                self.ceiling_reached = true;
                self.advance_target();
                continue;
            }

            if let Some(deadline) = self.deadline {
                if Instant::now() >= deadline {
                    warn!(requests = self.requests_made, "run deadline reached, stopping");
                    self.deadline_reached = true;
                    self.target_idx = self.targets.len();
                    return None;
                }
            }

            if self.requests_made > 0 && !config.politeness_delay.is_zero() {
                tokio::time::sleep(config.politeness_delay).await;
            }

            let outcome = fetcher.fetch_page(target.as_deref(), self.page).await;
            self.requests_made += 1;

            match &outcome.failure {
                Some(failure) => {
                    warn!(
                        url = %failure.url,
                        page = failure.page,
                        kind = ?failure.kind,
                        error = %failure.message,
                        "page failed, treating as empty"
                    );
                    self.consecutive_failures += 1;
                    if self.consecutive_failures >= config.max_consecutive_failures {
                        warn!(
                            collection = target.as_deref().unwrap_or("*"),
                            failures = self.consecutive_failures,
                            "too many consecutive failures, abandoning source"
                        );
                        self.advance_target();
                    } else {
                        self.page += 1;
                    }
                }
                None if outcome.products.is_empty() => {
                    debug!(
                        collection = target.as_deref().unwrap_or("*"),
                        page = self.page,
                        "empty page, source exhausted"
                    );
                    self.advance_target();
                }
                None => {
                    self.consecutive_failures = 0;
                    self.page += 1;
                }
            }

            return Some(outcome);
        }
    }

    pub fn requests_made(&self) -> u32 {
        self.requests_made
    }

    pub fn deadline_reached(&self) -> bool {
        self.deadline_reached
    }

    pub fn ceiling_reached(&self) -> bool {
        self.ceiling_reached
    }

    fn advance_target(&mut self) {
        self.target_idx += 1;
        self.page = 1;
        self.consecutive_failures = 0;
    }
}
