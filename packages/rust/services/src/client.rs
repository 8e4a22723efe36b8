//! Thin bearer-token JSON client shared by the HTTP service implementations.

use std::time::Duration;

use reqwest::{Client, Method, RequestBuilder, Response, StatusCode};

use catalogsync_shared::{CatalogSyncError, Result, ServiceConfig, read_token};

/// User-Agent string for service requests.
const USER_AGENT: &str = concat!("catalogsync/", env!("CARGO_PKG_VERSION"));

/// Longest response body excerpt carried into an error message.
const ERROR_BODY_LIMIT: usize = 512;

/// Maps a message into the owning service's error variant.
pub(crate) type ErrorFn = fn(String) -> CatalogSyncError;

pub(crate) struct ApiClient {
    client: Client,
    base_url: String,
    token: Option<String>,
    error: ErrorFn,
}

impl ApiClient {
    pub(crate) fn new(
        base_url: &str,
        token: Option<String>,
        timeout: Duration,
        error: ErrorFn,
    ) -> Result<Self> {
        let client = Client::builder()
            .user_agent(USER_AGENT)
            .timeout(timeout)
            .build()
            .map_err(|e| error(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            token,
            error,
        })
    }

    pub(crate) fn from_service(config: &ServiceConfig, error: ErrorFn) -> Result<Self> {
        Self::new(
            &config.base_url,
            read_token(&config.token_env),
            Duration::from_secs(config.timeout_secs),
            error,
        )
    }

    pub(crate) fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path.trim_start_matches('/'))
    }

    pub(crate) fn request(&self, method: Method, path: &str) -> RequestBuilder {
        let builder = self.client.request(method, self.url(path));
        match &self.token {
            Some(token) => builder.bearer_auth(token),
            None => builder,
        }
    }

    pub(crate) fn err(&self, message: impl Into<String>) -> CatalogSyncError {
        (self.error)(message.into())
    }

    /// Send and require a 2xx status.
    pub(crate) async fn send(&self, builder: RequestBuilder, what: &str) -> Result<Response> {
        let response = builder
            .send()
            .await
            .map_err(|e| self.err(format!("{what}: {e}")))?;
        self.ensure_success(response, what).await
    }

    /// Send and accept 2xx or 404. Returns `None` on 404.
    pub(crate) async fn send_allow_missing(
        &self,
        builder: RequestBuilder,
        what: &str,
    ) -> Result<Option<Response>> {
        let response = builder
            .send()
            .await
            .map_err(|e| self.err(format!("{what}: {e}")))?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        self.ensure_success(response, what).await.map(Some)
    }

    pub(crate) async fn json<T: serde::de::DeserializeOwned>(
        &self,
        response: Response,
        what: &str,
    ) -> Result<T> {
        let body = response
            .bytes()
            .await
            .map_err(|e| self.err(format!("{what}: body read failed: {e}")))?;
        serde_json::from_slice(&body).map_err(|e| self.err(format!("{what}: malformed body: {e}")))
    }

    async fn ensure_success(&self, response: Response, what: &str) -> Result<Response> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        let excerpt: String = body.chars().take(ERROR_BODY_LIMIT).collect();
        Err(self.err(format!("{what}: HTTP {status}: {excerpt}")))
    }
}
