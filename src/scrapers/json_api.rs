//! Generic API-key JSON catalog. Endpoints and field paths come from the
//! distributor's `options` table.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::{
    ensure_session, extract_path, parse_price_cents, scalar_string, DistributorScraper, ProductPage,
};
use crate::error::ScraperError;
use crate::http::{FetchOptions, RequestExecutor};
use crate::models::{Distributor, RawProductRecord};

/// Endpoint layout and field mapping, all paths dot-separated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct JsonApiConfig {
    pub categories_path: String,
    /// Where the category list sits in the response.
    pub categories_field: String,
    /// Field of each category entry holding its identifier.
    pub category_id_field: String,
    pub products_path: String,
    pub items_field: String,
    pub category_param: String,
    pub limit_param: String,
    pub offset_param: String,
    pub id_field: String,
    pub name_field: String,
    pub brand_field: String,
    pub category_field: String,
    pub price_field: String,
    pub stock_field: String,
    pub in_stock_field: String,
}

impl Default for JsonApiConfig {
    fn default() -> Self {
        Self {
            categories_path: "/categories".into(),
            categories_field: "data".into(),
            category_id_field: "id".into(),
            products_path: "/products".into(),
            items_field: "data".into(),
            category_param: "category".into(),
            limit_param: "limit".into(),
            offset_param: "offset".into(),
            id_field: "id".into(),
            name_field: "name".into(),
            brand_field: "brand".into(),
            category_field: "category".into(),
            price_field: "price".into(),
            stock_field: "stock".into(),
            in_stock_field: "in_stock".into(),
        }
    }
}

impl JsonApiConfig {
    /// Options from configuration; missing options mean the defaults.
    pub fn from_options(options: &Value) -> Result<Self, serde_json::Error> {
        if options.is_null() {
            return Ok(Self::default());
        }
        serde_json::from_value(options.clone())
    }
}

pub struct JsonApiScraper {
    distributor: Distributor,
    config: JsonApiConfig,
    executor: Arc<RequestExecutor>,
}

impl JsonApiScraper {
    pub fn new(distributor: Distributor, config: JsonApiConfig, executor: Arc<RequestExecutor>) -> Self {
        Self {
            distributor,
            config,
            executor,
        }
    }

    fn list<'a>(body: &'a Value, field: &str) -> &'a [Value] {
        extract_path(body, field)
            .as_array()
            .or_else(|| body.as_array())
            .map(|v| v.as_slice())
            .unwrap_or(&[])
    }

    fn to_record(&self, item: &Value) -> Option<RawProductRecord> {
        let c = &self.config;
        let external_id = scalar_string(extract_path(item, &c.id_field))?;
        let name = scalar_string(extract_path(item, &c.name_field))?;
        let stock = extract_path(item, &c.stock_field).as_i64();
        let in_stock = extract_path(item, &c.in_stock_field).as_bool();

        Some(
            RawProductRecord::new(&self.distributor.slug, &external_id, &name, item.clone())
                .with_brand(scalar_string(extract_path(item, &c.brand_field)))
                .with_category(scalar_string(extract_path(item, &c.category_field)))
                .with_price_cents(parse_price_cents(extract_path(item, &c.price_field)))
                .with_stock(stock, in_stock),
        )
    }
}

#[async_trait]
impl DistributorScraper for JsonApiScraper {
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
                &self.distributor.url(&self.config.categories_path),
                FetchOptions::listing(&self.distributor.slug),
            )
            .await?;
        let body: Value = response.json()?;
        Ok(Self::list(&body, &self.config.categories_field)
            .iter()
            .filter_map(|entry| match entry {
                Value::Object(_) => {
                    scalar_string(extract_path(entry, &self.config.category_id_field))
                }
                other => scalar_string(other),
            })
            .collect())
    }

    async fn list_products(
        &self,
        category: Option<&str>,
        limit: Option<u64>,
        offset: Option<u64>,
    ) -> Result<ProductPage, ScraperError> {
        let c = &self.config;
        let mut options = FetchOptions::listing(&self.distributor.slug);
        if let Some(category) = category {
            options = options.query(&c.category_param, category);
        }
        if let Some(limit) = limit {
            options = options.query(&c.limit_param, limit);
        }
        if let Some(offset) = offset {
            options = options.query(&c.offset_param, offset);
        }

        let response = self
            .executor
            .fetch(&self.distributor.url(&c.products_path), options)
            .await?;
        let body: Value = response.json()?;
        let rows = Self::list(&body, &c.items_field);
        let records = rows
            .iter()
            .filter_map(|item| self.to_record(item))
            .map(|r| match (&r.category, category) {
                (None, Some(cat)) => r.with_category(Some(cat.to_string())),
                _ => r,
            })
            .collect();
        Ok(ProductPage::new(records, rows.len()))
    }
}
