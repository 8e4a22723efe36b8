//! Content (description) service client.

use async_trait::async_trait;
use reqwest::Method;
use serde::{Deserialize, Serialize};
use tracing::debug;

use catalogsync_shared::{CatalogSyncError, EnrichmentRecord, Result, ServiceConfig};

use crate::client::ApiClient;

/// Externally authored product and brand descriptions.
#[async_trait]
pub trait ContentService: Send + Sync {
    /// Every record, across all pages.
    async fn list_records(&self) -> Result<Vec<EnrichmentRecord>>;

    /// Create a record. Returns it with the remote id assigned.
    async fn create_record(&self, record: &EnrichmentRecord) -> Result<EnrichmentRecord>;

    /// Replace the record with remote id `id`.
    async fn update_record(&self, id: &str, record: &EnrichmentRecord) -> Result<EnrichmentRecord>;

    /// Delete a record. A record that is already gone counts as deleted.
    async fn delete_record(&self, id: &str) -> Result<()>;
}

#[derive(Debug, Deserialize)]
struct ListResponse {
    #[serde(default)]
    data: Vec<EnrichmentRecord>,
    pagination: Pagination,
}

#[derive(Debug, Deserialize)]
struct Pagination {
    page: u32,
    page_count: u32,
}

#[derive(Debug, Serialize, Deserialize)]
struct Envelope<T> {
    data: T,
}

/// REST client for `/descriptions`.
pub struct HttpContentService {
    api: ApiClient,
    page_size: u32,
}

impl HttpContentService {
    pub fn from_config(config: &ServiceConfig) -> Result<Self> {
        Ok(Self {
            api: ApiClient::from_service(config, CatalogSyncError::ContentService)?,
            page_size: config.page_size.max(1),
        })
    }
}

#[async_trait]
impl ContentService for HttpContentService {
    async fn list_records(&self) -> Result<Vec<EnrichmentRecord>> {
        let mut records = Vec::new();
        let mut page = 1u32;
        loop {
            let builder = self.api.request(Method::GET, "descriptions").query(&[
                ("page", page.to_string()),
                ("page_size", self.page_size.to_string()),
            ]);
            let response = self.api.send(builder, "list descriptions").await?;
            let body: ListResponse = self.api.json(response, "list descriptions").await?;

            debug!(page, records = body.data.len(), "listed description page");
            if body.data.is_empty() {
                break;
            }
            records.extend(body.data);

            if body.pagination.page >= body.pagination.page_count {
                break;
            }
            page = body.pagination.page + 1;
        }
        Ok(records)
    }

    async fn create_record(&self, record: &EnrichmentRecord) -> Result<EnrichmentRecord> {
        let builder = self
            .api
            .request(Method::POST, "descriptions")
            .json(&Envelope { data: record });
        let what = format!("create description for {}", record.entity_id);
        let response = self.api.send(builder, &what).await?;
        let created: Envelope<EnrichmentRecord> = self.api.json(response, &what).await?;
        if created.data.id.is_none() {
            return Err(self.api.err(format!("{what}: response carried no id")));
        }
        Ok(created.data)
    }

    async fn update_record(&self, id: &str, record: &EnrichmentRecord) -> Result<EnrichmentRecord> {
        let builder = self
            .api
            .request(Method::PUT, &format!("descriptions/{id}"))
            .json(&Envelope { data: record });
        let what = format!("update description {id}");
        let response = self.api.send(builder, &what).await?;
        let updated: Envelope<EnrichmentRecord> = self.api.json(response, &what).await?;
        Ok(updated.data)
    }

    async fn delete_record(&self, id: &str) -> Result<()> {
        let builder = self.api.request(Method::DELETE, &format!("descriptions/{id}"));
        if self
            .api
            .send_allow_missing(builder, &format!("delete description {id}"))
            .await?
            .is_none()
        {
            debug!(id, "description already gone");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use catalogsync_shared::{EntityKind, SyncStatus};
    use wiremock::matchers::{body_partial_json, header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn config(server: &MockServer) -> ServiceConfig {
        ServiceConfig {
            base_url: format!("{}/api", server.uri()),
            token_env: "CS_TEST_CONTENT_TOKEN_UNSET_5521".into(),
            concurrency: 2,
            timeout_secs: 5,
            page_size: 2,
        }
    }

    fn record_json(id: &str, entity_id: &str) -> serde_json::Value {
        serde_json::json!({
            "id": id,
            "entity_kind": "product",
            "entity_id": entity_id,
            "handle": entity_id,
            "description": "Hardened steel nozzle.",
            "sync_status": "synced",
            "source_hash": "abc"
        })
    }

    fn new_record(entity_id: &str) -> EnrichmentRecord {
        EnrichmentRecord {
            id: None,
            entity_kind: EntityKind::Product,
            entity_id: entity_id.into(),
            handle: Some("brass-nozzle".into()),
            description: "Brass nozzle by Acme.".into(),
            seo_title: "Brass Nozzle | Acme".into(),
            seo_description: "Brass nozzle.".into(),
            keywords: vec!["brass".into()],
            sync_status: SyncStatus::Pending,
            last_synced_at: None,
            source_hash: Some("h1".into()),
        }
    }

    #[tokio::test]
    async fn lists_every_page() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/descriptions"))
            .and(query_param("page", "1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "data": [record_json("1", "prod_1"), record_json("2", "prod_2")],
                "pagination": {"page": 1, "page_count": 2}
            })))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/api/descriptions"))
            .and(query_param("page", "2"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "data": [record_json("3", "prod_3")],
                "pagination": {"page": 2, "page_count": 2}
            })))
            .mount(&server)
            .await;

        let service = HttpContentService::from_config(&config(&server)).unwrap();
        let records = service.list_records().await.unwrap();
        assert_eq!(records.len(), 3);
        assert_eq!(records[2].entity_id, "prod_3");
        assert_eq!(records[0].sync_status, SyncStatus::Synced);
    }

    #[tokio::test]
    async fn empty_page_ends_listing() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/descriptions"))
            .and(query_param("page", "1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "data": [record_json("1", "prod_1")],
                "pagination": {"page": 1, "page_count": 50}
            })))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/api/descriptions"))
            .and(query_param("page", "2"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "data": [],
                "pagination": {"page": 2, "page_count": 50}
            })))
            .mount(&server)
            .await;

        let service = HttpContentService::from_config(&config(&server)).unwrap();
        let records = service.list_records().await.unwrap();
        assert_eq!(records.len(), 1);

        let requests = server.received_requests().await.unwrap();
        assert_eq!(requests.len(), 2);
    }

    #[tokio::test]
    async fn create_sends_envelope_and_returns_id() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/descriptions"))
            .and(body_partial_json(serde_json::json!({
                "data": {"entity_id": "prod_9", "sync_status": "pending"}
            })))
            .respond_with(ResponseTemplate::new(201).set_body_json(serde_json::json!({
                "data": record_json("42", "prod_9")
            })))
            .expect(1)
            .mount(&server)
            .await;

        let service = HttpContentService::from_config(&config(&server)).unwrap();
        let created = service.create_record(&new_record("prod_9")).await.unwrap();
        assert_eq!(created.id.as_deref(), Some("42"));
    }

    #[tokio::test]
    async fn bearer_token_is_sent_when_configured() {
        let server = MockServer::start().await;
        Mock::given(method("PUT"))
            .and(path("/api/descriptions/7"))
            .and(header("authorization", "Bearer s3cret"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "data": record_json("7", "prod_1")
            })))
            .expect(1)
            .mount(&server)
            .await;

        let service = HttpContentService {
            api: ApiClient::new(
                &format!("{}/api", server.uri()),
                Some("s3cret".into()),
                std::time::Duration::from_secs(5),
                CatalogSyncError::ContentService,
            )
            .unwrap(),
            page_size: 10,
        };
        let updated = service.update_record("7", &new_record("prod_1")).await.unwrap();
        assert_eq!(updated.id.as_deref(), Some("7"));
    }

    #[tokio::test]
    async fn delete_treats_missing_as_deleted() {
        let server = MockServer::start().await;
        Mock::given(method("DELETE"))
            .and(path("/api/descriptions/404"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;
        Mock::given(method("DELETE"))
            .and(path("/api/descriptions/500"))
            .respond_with(ResponseTemplate::new(500).set_body_string("boom"))
            .mount(&server)
            .await;

        let service = HttpContentService::from_config(&config(&server)).unwrap();
        assert!(service.delete_record("404").await.is_ok());

        let err = service.delete_record("500").await.unwrap_err();
        assert!(matches!(err, CatalogSyncError::ContentService(_)));
        assert!(err.to_string().contains("boom"));
    }
}
