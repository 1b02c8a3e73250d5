use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, warn};

use mlsync_core::config::AmpreConfig;

use crate::error::AmpreError;
use crate::query;
use crate::source::{ListingSource, PropertyQuery};

/// OData response envelope.
#[derive(Debug, Deserialize)]
struct ODataPage {
    value: Vec<Value>,
}

/// Bearer-authenticated client for the AMPRE `Property` and `Media` resources.
#[derive(Clone)]
pub struct AmpreClient {
    client: Client,
    base_url: String,
    token: String,
    city: Option<String>,
    page_size: u32,
    retry_attempts: u32,
    retry_delay: Duration,
}

impl AmpreClient {
    pub fn new(config: &AmpreConfig) -> Result<Self, AmpreError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;
        if config.token().is_empty() {
            warn!(feed = ?config.feed, "AMPRE token for the configured feed is empty");
        }
        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            token: config.token().to_string(),
            city: config.city.clone().filter(|c| !c.trim().is_empty()),
            page_size: config.page_size,
            retry_attempts: config.retry_attempts.max(1),
            retry_delay: Duration::from_millis(config.retry_delay_ms),
        })
    }

    /// GET a resource, retrying transient failures with a fixed delay.
    async fn get_with_retry(
        &self,
        resource: &str,
        params: &[(&str, String)],
    ) -> Result<Vec<Value>, AmpreError> {
        let url = format!("{}/{}", self.base_url, resource);
        let mut last_error = String::new();

        for attempt in 1..=self.retry_attempts {
            if attempt > 1 {
                warn!(
                    %resource,
                    attempt,
                    delay_ms = self.retry_delay.as_millis() as u64,
                    "retrying AMPRE request"
                );
                tokio::time::sleep(self.retry_delay).await;
            }

            match self.get_once(&url, params).await {
                Ok(rows) => return Ok(rows),
                Err(e) if e.is_retryable() => {
                    warn!(%resource, attempt, error = %e, "transient AMPRE failure");
                    last_error = e.to_string();
                }
                Err(e) => return Err(e),
            }
        }

        Err(AmpreError::RetriesExhausted {
            attempts: self.retry_attempts,
            last_error,
        })
    }

    async fn get_once(&self, url: &str, params: &[(&str, String)]) -> Result<Vec<Value>, AmpreError> {
        let resp = self
            .client
            .get(url)
            .bearer_auth(&self.token)
            .header("accept", "application/json")
            .query(params)
            .send()
            .await
            .map_err(|e| {
                if e.is_connect() || e.is_timeout() {
                    AmpreError::Transport(e.to_string())
                } else {
                    AmpreError::Request(e)
                }
            })?;

        let status = resp.status();
        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            return Err(AmpreError::Auth {
                status: status.as_u16(),
            });
        }
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(AmpreError::Http {
                status: status.as_u16(),
                body,
            });
        }

        let bytes = resp
            .bytes()
            .await
            .map_err(|e| AmpreError::Transport(e.to_string()))?;
        let page: ODataPage =
            serde_json::from_slice(&bytes).map_err(|e| AmpreError::Decode(e.to_string()))?;
        debug!(%url, rows = page.value.len(), "AMPRE page received");
        Ok(page.value)
    }
}

#[async_trait]
impl ListingSource for AmpreClient {
    fn name(&self) -> &str {
        "ampre"
    }

    async fn fetch_properties(&self, q: &PropertyQuery) -> Result<Vec<Value>, AmpreError> {
        let filter = query::all_of([q.filter.clone(), self.city.as_deref().map(query::city_eq)]);

        let mut params = vec![
            ("$top", q.top.to_string()),
            ("$skip", q.skip.to_string()),
            ("$select", query::PROPERTY_SELECT.to_string()),
            ("$orderby", q.orderby.clone()),
        ];
        if let Some(f) = filter {
            params.push(("$filter", f));
        }
        self.get_with_retry("Property", &params).await
    }

    async fn fetch_media(&self, listing_keys: &[String]) -> Result<Vec<Value>, AmpreError> {
        if listing_keys.is_empty() {
            return Ok(Vec::new());
        }
        let filter = query::media_for_keys(listing_keys);
        let mut rows = Vec::new();
        let mut skip = 0u64;

        // a listing can carry dozens of photos, so page until a short page
        loop {
            let params = [
                ("$top", self.page_size.to_string()),
                ("$skip", skip.to_string()),
                ("$select", query::MEDIA_SELECT.to_string()),
                ("$filter", filter.clone()),
                ("$orderby", "ResourceRecordKey,Order".to_string()),
            ];
            let page = self.get_with_retry("Media", &params).await?;
            let len = page.len();
            rows.extend(page);
            if len < self.page_size as usize {
                break;
            }
            skip += len as u64;
        }
        Ok(rows)
    }
}
