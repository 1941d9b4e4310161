use anyhow::Result;
use reqwest::StatusCode;
use serde::Serialize;
use serde_json::Value;
use std::time::Duration;

use crate::config::{FdcConfig, MissingCredential};
use crate::models::{FoodCandidate, FoodRecord};

const BACKOFF_BASE: Duration = Duration::from_millis(300);
const RETRY_STATUSES: [StatusCode; 5] = [
    StatusCode::TOO_MANY_REQUESTS,
    StatusCode::INTERNAL_SERVER_ERROR,
    StatusCode::BAD_GATEWAY,
    StatusCode::SERVICE_UNAVAILABLE,
    StatusCode::GATEWAY_TIMEOUT,
];

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct SearchRequest<'a> {
    query: &'a str,
    page_size: u32,
}

/// USDA FoodData Central search + details client.
///
/// Both calls are reads, so transient failures (429, 5xx, connection errors)
/// are retried with exponential backoff.
pub struct FdcClient {
    api_key: String,
    base_url: String,
    retries: u32,
    client: reqwest::Client,
}

impl FdcClient {
    pub fn new(config: &FdcConfig) -> Result<Self> {
        let api_key = config
            .api_key
            .clone()
            .ok_or(MissingCredential("USDA_FDC_API_KEY"))?;
        let client = reqwest::Client::builder().timeout(config.timeout).build()?;

        Ok(Self {
            api_key,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            retries: config.retries,
            client,
        })
    }

    /// Raw search response JSON.
    pub async fn search_raw(&self, query: &str, page_size: u32) -> Result<Value> {
        log::info!("🔎 FDC search: '{}' (pageSize={})", query, page_size);
        let url = format!("{}/v1/foods/search", self.base_url);
        let body = SearchRequest { query, page_size };

        self.send_with_retry(|| {
            self.client
                .post(&url)
                .query(&[("api_key", self.api_key.as_str())])
                .json(&body)
        })
        .await
    }

    pub async fn search(&self, query: &str, page_size: u32) -> Result<Vec<FoodCandidate>> {
        let raw = self.search_raw(query, page_size).await?;
        let candidates = FoodCandidate::from_search(&raw);
        log::debug!("📄 FDC search returned {} candidates", candidates.len());
        Ok(candidates)
    }

    pub async fn details(&self, fdc_id: i64) -> Result<FoodRecord> {
        log::info!("📥 FDC details for fdcId={}", fdc_id);
        let url = format!("{}/v1/food/{}", self.base_url, fdc_id);

        let raw = self
            .send_with_retry(|| {
                self.client
                    .get(&url)
                    .query(&[("api_key", self.api_key.as_str())])
            })
            .await?;
        Ok(FoodRecord::from_value(raw))
    }

    async fn send_with_retry<F>(&self, build: F) -> Result<Value>
    where
        F: Fn() -> reqwest::RequestBuilder,
    {
        let mut attempt = 0;
        loop {
            let backoff = BACKOFF_BASE * 2u32.pow(attempt.min(10));
            match build().send().await {
                Ok(response) if RETRY_STATUSES.contains(&response.status()) && attempt < self.retries => {
                    log::warn!(
                        "⚠️ FDC returned {} (attempt {}/{}), retrying in {:?}",
                        response.status(),
                        attempt + 1,
                        self.retries + 1,
                        backoff
                    );
                }
                Ok(response) => {
                    let status = response.status();
                    if !status.is_success() {
                        let error_text = response.text().await.unwrap_or_default();
                        log::error!("❌ FDC API error response: {}", error_text);
                        anyhow::bail!("FDC API error ({}): {}", status, error_text);
                    }
                    return Ok(response.json::<Value>().await?);
                }
                Err(e) if (e.is_connect() || e.is_timeout()) && attempt < self.retries => {
                    log::warn!(
                        "⚠️ FDC request failed (attempt {}/{}): {}, retrying in {:?}",
                        attempt + 1,
                        self.retries + 1,
                        e,
                        backoff
                    );
                }
                Err(e) => return Err(e.into()),
            }
            tokio::time::sleep(backoff).await;
            attempt += 1;
        }
    }
}

#[cfg(test)]
pub(crate) fn test_config(base_url: &str) -> FdcConfig {
    FdcConfig {
        api_key: Some("test_key".to_string()),
        base_url: base_url.to_string(),
        timeout: Duration::from_secs(5),
        retries: 2,
    }
}
