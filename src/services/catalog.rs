//! Client for the external catalog API.

use async_trait::async_trait;
use reqwest::StatusCode;
use serde_json::Value;

use crate::error::{AppError, Result};
use crate::models::{CatalogRecord, CrawlerConfig, Point};
use crate::services::RateLimiter;
use crate::utils::http;

/// Lookup of one catalog identifier.
#[async_trait]
pub trait CatalogApi: Send + Sync {
    /// `Ok(None)` means "not found". Errors are classified with
    /// [`AppError::is_transient`] to decide whether to retry.
    ///
    /// Implementations wait on `limiter` before every request they send.
    async fn lookup(&self, id: u64, limiter: &RateLimiter) -> Result<Option<CatalogRecord>>;
}

/// HTTP implementation over `{api_base}/bangumi/{id}/...`.
#[derive(Debug, Clone)]
pub struct HttpCatalog {
    client: reqwest::Client,
    api_base: String,
}

impl HttpCatalog {
    pub fn new(client: reqwest::Client, api_base: impl Into<String>) -> Self {
        Self {
            client,
            api_base: api_base.into().trim_end_matches('/').to_string(),
        }
    }

    pub fn from_config(config: &CrawlerConfig) -> Result<Self> {
        Ok(Self::new(http::create_async_client(config)?, &config.api_base))
    }

    fn endpoint(&self, id: u64, tail: &str) -> String {
        format!("{}/bangumi/{}/{}", self.api_base, id, tail)
    }

    /// GET a JSON document; 404 maps to `None`.
    async fn get_json(
        &self,
        limiter: &RateLimiter,
        id: u64,
        url: &str,
        query: &[(&str, &str)],
    ) -> Result<Option<Value>> {
        limiter.wait().await;
        let response = self.client.get(url).query(query).send().await?;
        let status = response.status();

        if status == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
            return Err(AppError::transient(id, format!("HTTP {status} from {url}")));
        }
        if !status.is_success() {
            return Err(AppError::fetch(id, format!("HTTP {status} from {url}")));
        }
        Ok(Some(response.json().await?))
    }
}

#[async_trait]
impl CatalogApi for HttpCatalog {
    async fn lookup(&self, id: u64, limiter: &RateLimiter) -> Result<Option<CatalogRecord>> {
        let points_url = self.endpoint(id, "points/detail");
        let Some(raw_points) = self
            .get_json(limiter, id, &points_url, &[("haveImage", "true")])
            .await?
        else {
            return Ok(None);
        };

        let points = parse_points(id, &raw_points);
        if points.is_empty() {
            return Ok(None);
        }

        let lite_url = self.endpoint(id, "lite");
        let lite = self
            .get_json(limiter, id, &lite_url, &[])
            .await?
            .unwrap_or(Value::Null);

        Ok(Some(record_from_lite(id, &lite, points, lite_url)))
    }
}

/// Parse the points list, skipping malformed items.
pub fn parse_points(id: u64, raw: &Value) -> Vec<Point> {
    let items: &[Value] = match raw {
        Value::Array(items) => items.as_slice(),
        Value::Object(map) => match map.get("points") {
            Some(Value::Array(items)) => items.as_slice(),
            _ => &[],
        },
        _ => &[],
    };

    items
        .iter()
        .filter_map(|item| match serde_json::from_value::<Point>(item.clone()) {
            Ok(point) => Some(point),
            Err(e) => {
                log::debug!("id {id}: skipping malformed point: {e}");
                None
            }
        })
        .collect()
}

/// Map the `lite` document onto a record. The API uses either `name`/`name_cn`
/// or `title`/`cn`, and `color` for the theme colour.
pub fn record_from_lite(
    id: u64,
    lite: &Value,
    points: Vec<Point>,
    origin_url: String,
) -> CatalogRecord {
    let text = |keys: &[&str]| -> String {
        keys.iter()
            .filter_map(|k| lite.get(*k).and_then(Value::as_str))
            .find(|s| !s.trim().is_empty())
            .unwrap_or_default()
            .trim()
            .to_string()
    };

    let related_ids = ["related", "relatedIds", "related_ids"]
        .iter()
        .find_map(|k| lite.get(*k).and_then(Value::as_array))
        .map(|ids| ids.iter().filter_map(Value::as_u64).collect())
        .unwrap_or_default();

    CatalogRecord {
        api_id: id,
        title: text(&["name", "title"]),
        name_cn: text(&["name_cn", "cn"]),
        cover: text(&["cover"]),
        theme_color: text(&["theme_color", "color"]),
        group_key: text(&["groupKey", "group_key", "group"]),
        related_ids,
        points,
        origin_url,
    }
}
