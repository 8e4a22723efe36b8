//! Commerce catalog client.
//!
//! The commerce catalog is the authority on which products exist. It also owns
//! the category and brand reference data that index documents link to.

use async_trait::async_trait;
use reqwest::Method;
use serde::Deserialize;
use tracing::debug;

use catalogsync_shared::{
    BrandRef, CanonicalProduct, CatalogProductRef, CatalogSyncError, CategoryRef, Result,
    ServiceConfig,
};

use crate::client::ApiClient;

#[async_trait]
pub trait CommerceCatalog: Send + Sync {
    /// Every product the catalog currently lists.
    async fn list_products(&self) -> Result<Vec<CatalogProductRef>>;

    /// Create or replace a product under its canonical id.
    async fn upsert_product(&self, product: &CanonicalProduct) -> Result<()>;

    async fn list_categories(&self) -> Result<Vec<CategoryRef>>;

    async fn list_brands(&self) -> Result<Vec<BrandRef>>;
}

#[derive(Debug, Deserialize)]
struct ProductList {
    #[serde(default)]
    products: Vec<CatalogProductRef>,
    count: usize,
}

#[derive(Debug, Deserialize)]
struct CategoryList {
    #[serde(default)]
    categories: Vec<CategoryRef>,
}

#[derive(Debug, Deserialize)]
struct BrandList {
    #[serde(default)]
    brands: Vec<BrandRef>,
}

/// REST client for the commerce admin API.
pub struct HttpCommerceCatalog {
    api: ApiClient,
    page_size: u32,
}

impl HttpCommerceCatalog {
    pub fn from_config(config: &ServiceConfig) -> Result<Self> {
        Ok(Self {
            api: ApiClient::from_service(config, CatalogSyncError::Commerce)?,
            page_size: config.page_size.max(1),
        })
    }
}

#[async_trait]
impl CommerceCatalog for HttpCommerceCatalog {
    async fn list_products(&self) -> Result<Vec<CatalogProductRef>> {
        let mut products = Vec::new();
        let mut offset = 0usize;
        loop {
            let builder = self.api.request(Method::GET, "products").query(&[
                ("offset", offset.to_string()),
                ("limit", self.page_size.to_string()),
                ("fields", "id,handle".to_string()),
            ]);
            let response = self.api.send(builder, "list products").await?;
            let page: ProductList = self.api.json(response, "list products").await?;

            let received = page.products.len();
            products.extend(page.products);
            offset += received;
            debug!(offset, total = page.count, "listed product page");

            if received == 0 || offset >= page.count {
                break;
            }
        }
        Ok(products)
    }

    async fn upsert_product(&self, product: &CanonicalProduct) -> Result<()> {
        let builder = self
            .api
            .request(Method::PUT, &format!("products/{}", product.id))
            .json(product);
        self.api
            .send(builder, &format!("upsert product {}", product.id))
            .await?;
        Ok(())
    }

    async fn list_categories(&self) -> Result<Vec<CategoryRef>> {
        let builder = self.api.request(Method::GET, "categories");
        let response = self.api.send(builder, "list categories").await?;
        let body: CategoryList = self.api.json(response, "list categories").await?;
        Ok(body.categories)
    }

    async fn list_brands(&self) -> Result<Vec<BrandRef>> {
        let builder = self.api.request(Method::GET, "brands");
        let response = self.api.send(builder, "list brands").await?;
        let body: BrandList = self.api.json(response, "list brands").await?;
        Ok(body.brands)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn config(server: &MockServer) -> ServiceConfig {
        ServiceConfig {
            base_url: format!("{}/admin", server.uri()),
            token_env: "CS_TEST_COMMERCE_TOKEN_UNSET_9913".into(),
            concurrency: 2,
            timeout_secs: 5,
            page_size: 2,
        }
    }

    #[tokio::test]
    async fn lists_products_by_offset() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/admin/products"))
            .and(query_param("offset", "0"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "products": [{"id": "prod_1", "handle": "a"}, {"id": "prod_2", "handle": "b"}],
                "count": 3
            })))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/admin/products"))
            .and(query_param("offset", "2"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "products": [{"id": "prod_3", "handle": "c"}],
                "count": 3
            })))
            .mount(&server)
            .await;

        let catalog = HttpCommerceCatalog::from_config(&config(&server)).unwrap();
        let products = catalog.list_products().await.unwrap();
        let ids: Vec<_> = products.iter().map(|p| p.id.as_str()).collect();
        assert_eq!(ids, vec!["prod_1", "prod_2", "prod_3"]);
    }

    #[tokio::test]
    async fn reads_reference_data() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/admin/categories"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "categories": [{"id": "pcat_1", "handle": "nozzles", "name": "Nozzles"}]
            })))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/admin/brands"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "brands": [{"id": "brand_1", "handle": "acme", "name": "Acme"}]
            })))
            .mount(&server)
            .await;

        let catalog = HttpCommerceCatalog::from_config(&config(&server)).unwrap();
        assert_eq!(catalog.list_categories().await.unwrap()[0].handle, "nozzles");
        let brands = catalog.list_brands().await.unwrap();
        assert_eq!(brands[0].name, "Acme");
        assert!(brands[0].logo_url.is_none());
    }

    #[tokio::test]
    async fn server_errors_map_to_commerce_errors() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/admin/brands"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let catalog = HttpCommerceCatalog::from_config(&config(&server)).unwrap();
        let err = catalog.list_brands().await.unwrap_err();
        assert!(matches!(err, CatalogSyncError::Commerce(_)));
        assert!(!err.is_fatal());
    }
}
