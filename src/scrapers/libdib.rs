//! LibDib wholesale portal: session cookie + CSRF token, paginated JSON API.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tracing::debug;

use super::{
    ensure_session, extract_path, parse_price_cents, scalar_string, DistributorScraper, ProductPage,
};
use crate::error::ScraperError;
use crate::http::{FetchOptions, RequestExecutor};
use crate::models::{Distributor, RawProductRecord};

const CATEGORIES_PATH: &str = "/api/v1/categories/";
const PRODUCTS_PATH: &str = "/api/v1/products/";

pub struct LibDibScraper {
    distributor: Distributor,
    executor: Arc<RequestExecutor>,
}

impl LibDibScraper {
    pub fn new(distributor: Distributor, executor: Arc<RequestExecutor>) -> Self {
        Self {
            distributor,
            executor,
        }
    }

    /// Paginated endpoints wrap rows in `results`; older ones return a bare array.
    fn rows(body: &Value) -> &[Value] {
        body.get("results")
            .and_then(|r| r.as_array())
            .or_else(|| body.as_array())
            .map(|v| v.as_slice())
            .unwrap_or(&[])
    }

    fn to_record(&self, item: &Value, category: Option<&str>) -> Option<RawProductRecord> {
        let external_id = scalar_string(&item["id"])?;
        let name = scalar_string(&item["name"])?;

        let brand = match &item["brand"] {
            Value::Object(_) => scalar_string(extract_path(item, "brand.name")),
            other => scalar_string(other),
        };
        let item_category = scalar_string(&item["category"]).or(category.map(|c| c.to_string()));
        let price = parse_price_cents(&item["wholesale_price"])
            .or_else(|| parse_price_cents(&item["price"]));
        let quantity = item["inventory_quantity"]
            .as_i64()
            .or_else(|| extract_path(item, "inventory.quantity").as_i64());
        let in_stock = item["in_stock"].as_bool();

        Some(
            RawProductRecord::new(&self.distributor.slug, &external_id, &name, item.clone())
                .with_brand(brand)
                .with_category(item_category)
                .with_price_cents(price)
                .with_stock(quantity, in_stock),
        )
    }
}

#[async_trait]
impl DistributorScraper for LibDibScraper {
    fn slug(&self) -> &str {
        &self.distributor.slug
    }

    async fn authenticate(&self) -> Result<(), ScraperError> {
        ensure_session(&self.executor, &self.distributor.slug).await
    }

    async fn list_categories(&self) -> Result<Vec<String>, ScraperError> {
        let response = self
            .executor
            .fetch(
                &self.distributor.url(CATEGORIES_PATH),
                FetchOptions::listing(&self.distributor.slug),
            )
            .await?;
        let body: Value = response.json()?;
        let categories: Vec<String> = Self::rows(&body)
            .iter()
            .filter_map(|c| match c {
                Value::Object(_) => scalar_string(&c["slug"]).or_else(|| scalar_string(&c["name"])),
                other => scalar_string(other),
            })
            .collect();
        debug!("{}: {} categories", self.distributor.slug, categories.len());
        Ok(categories)
    }

    async fn list_products(
        &self,
        category: Option<&str>,
        limit: Option<u64>,
        offset: Option<u64>,
    ) -> Result<ProductPage, ScraperError> {
        let mut options = FetchOptions::listing(&self.distributor.slug);
        if let Some(category) = category {
            options = options.query("category", category);
        }
        if let Some(limit) = limit {
            options = options.query("limit", limit);
        }
        if let Some(offset) = offset {
            options = options.query("offset", offset);
        }

        let response = self
            .executor
            .fetch(&self.distributor.url(PRODUCTS_PATH), options)
            .await?;
        let body: Value = response.json()?;
        let rows = Self::rows(&body);
        let records: Vec<RawProductRecord> = rows
            .iter()
            .filter_map(|item| self.to_record(item, category))
            .collect();
        let page = ProductPage::new(records, rows.len());
        if page.skipped() > 0 {
            debug!(
                "{}: skipped {} rows without id or name",
                self.distributor.slug,
                page.skipped()
            );
        }
        Ok(page)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::credentials::MemoryCredentialStore;
    use crate::proxy::ProxyRotator;
    use crate::session::SessionManager;
    use crate::stealth::StealthContextFactory;
    use crate::http::ExecutorConfig;
    use serde_json::json;

    fn scraper() -> LibDibScraper {
        let sessions = SessionManager::new(
            Arc::new(MemoryCredentialStore::new()),
            StealthContextFactory::new(),
        );
        let executor = RequestExecutor::new(
            ExecutorConfig::default(),
            Arc::new(sessions),
            ProxyRotator::direct(),
        );
        LibDibScraper::new(
            Distributor::new("libdib", "LibDib", "http://127.0.0.1:1", "libdib"),
            Arc::new(executor),
        )
    }

    #[test]
    fn maps_portal_rows_to_records() {
        let scraper = scraper();
        let item = json!({
            "id": 981,
            "name": "Madre Mezcal Ensamble",
            "brand": {"id": 4, "name": "Madre"},
            "wholesale_price": "31.50",
            "inventory": {"quantity": 0}
        });
        let record = scraper.to_record(&item, Some("spirits")).unwrap();
        assert_eq!(record.external_id, "981");
        assert_eq!(record.brand.as_deref(), Some("Madre"));
        assert_eq!(record.category.as_deref(), Some("spirits"));
        assert_eq!(record.price_cents, Some(3150));
        assert_eq!(record.in_stock, Some(false));
        assert_eq!(record.payload, item);
    }

    #[test]
    fn rows_without_identity_are_skipped() {
        let scraper = scraper();
        assert!(scraper.to_record(&json!({"name": "No id"}), None).is_none());
        assert!(scraper.to_record(&json!({"id": "7"}), None).is_none());
    }

    #[test]
    fn rows_accepts_wrapped_and_bare_lists() {
        let wrapped = json!({"count": 1, "results": [{"id": 1}]});
        let bare = json!([{"id": 1}, {"id": 2}]);
        assert_eq!(LibDibScraper::rows(&wrapped).len(), 1);
        assert_eq!(LibDibScraper::rows(&bare).len(), 2);
        assert!(LibDibScraper::rows(&json!({"detail": "x"})).is_empty());
    }
}
