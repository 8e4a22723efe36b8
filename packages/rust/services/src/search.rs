//! Search index client (Meilisearch-style REST API).

use async_trait::async_trait;
use reqwest::Method;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use catalogsync_shared::{CatalogSyncError, Result, SearchIndexConfig, read_token};

use crate::client::ApiClient;

/// Attribute lists applied to the index before documents are written.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IndexSettings {
    pub filterable_attributes: Vec<String>,
    pub sortable_attributes: Vec<String>,
    pub searchable_attributes: Vec<String>,
}

#[async_trait]
pub trait SearchIndex: Send + Sync {
    async fn configure(&self, settings: &IndexSettings) -> Result<()>;

    /// Insert or replace one document keyed by its `id` field.
    async fn upsert_document(&self, document: &Value) -> Result<()>;

    /// Remove one document. A missing document counts as removed.
    async fn delete_document(&self, id: &str) -> Result<()>;

    async fn get_document(&self, id: &str) -> Result<Option<Value>>;

    /// Ids of every document currently in the index.
    async fn list_document_ids(&self) -> Result<Vec<String>>;
}

#[derive(Debug, Deserialize)]
struct DocumentPage {
    #[serde(default)]
    results: Vec<IdOnly>,
    total: usize,
}

#[derive(Debug, Deserialize)]
struct IdOnly {
    id: Value,
}

pub struct HttpSearchIndex {
    api: ApiClient,
    index_uid: String,
    page_size: u32,
}

impl HttpSearchIndex {
    pub fn from_config(config: &SearchIndexConfig) -> Result<Self> {
        let api = ApiClient::new(
            &config.base_url,
            read_token(&config.token_env),
            std::time::Duration::from_secs(config.timeout_secs),
            CatalogSyncError::IndexSync,
        )?;
        Ok(Self {
            api,
            index_uid: config.index_uid.clone(),
            page_size: config.page_size.max(1),
        })
    }

    fn documents_path(&self) -> String {
        format!("indexes/{}/documents", self.index_uid)
    }
}

#[async_trait]
impl SearchIndex for HttpSearchIndex {
    async fn configure(&self, settings: &IndexSettings) -> Result<()> {
        let builder = self
            .api
            .request(Method::PATCH, &format!("indexes/{}/settings", self.index_uid))
            .json(settings);
        self.api.send(builder, "apply index settings").await?;
        Ok(())
    }

    async fn upsert_document(&self, document: &Value) -> Result<()> {
        let id = document.get("id").map(id_string).unwrap_or_default();
        let builder = self
            .api
            .request(Method::POST, &self.documents_path())
            .query(&[("primaryKey", "id")])
            .json(&[document]);
        self.api
            .send(builder, &format!("upsert document {id}"))
            .await?;
        Ok(())
    }

    async fn delete_document(&self, id: &str) -> Result<()> {
        let builder = self
            .api
            .request(Method::DELETE, &format!("{}/{id}", self.documents_path()));
        if self
            .api
            .send_allow_missing(builder, &format!("delete document {id}"))
            .await?
            .is_none()
        {
            debug!(id, "document already absent");
        }
        Ok(())
    }

    async fn get_document(&self, id: &str) -> Result<Option<Value>> {
        let what = format!("get document {id}");
        let builder = self
            .api
            .request(Method::GET, &format!("{}/{id}", self.documents_path()));
        match self.api.send_allow_missing(builder, &what).await? {
            Some(response) => Ok(Some(self.api.json(response, &what).await?)),
            None => Ok(None),
        }
    }

    async fn list_document_ids(&self) -> Result<Vec<String>> {
        let mut ids = Vec::new();
        let mut offset = 0usize;
        loop {
            let builder = self.api.request(Method::GET, &self.documents_path()).query(&[
                ("offset", offset.to_string()),
                ("limit", self.page_size.to_string()),
                ("fields", "id".to_string()),
            ]);
            let response = self.api.send(builder, "list documents").await?;
            let page: DocumentPage = self.api.json(response, "list documents").await?;

            let received = page.results.len();
            ids.extend(page.results.iter().map(|r| id_string(&r.id)));
            offset += received;

            if received == 0 || offset >= page.total {
                break;
            }
        }
        Ok(ids)
    }
}

/// Index ids may come back as strings or numbers.
fn id_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}
