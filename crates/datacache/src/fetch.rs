//! HTTP fetcher: outbound GETs with retries, content-type dispatch, and
//! caching via `Storage`.

use crate::error::{Error, Result};
use crate::ratelimit::RateLimiterManager;
use crate::storage::{DataValue, RetrievedValue, Storage};
use rand::Rng;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

const WEEK: i64 = 7 * 24 * 3600;
const TWO_WEEKS: i64 = 2 * WEEK;
const MONTH: i64 = 30 * 24 * 3600;

/// Outcome of a `get_or_fetch` call.
#[derive(Debug, Clone, PartialEq)]
pub enum FetchOutcome {
    Hit(RetrievedValue),
    Queued,
    NotAvailable,
}

/// Default TTL for a data type, unless the caller
/// overrides it.
pub fn default_ttl(data_type: &str, provider: &str, is_image: bool) -> i64 {
    if provider == "fanarttv" {
        return MONTH;
    }
    let is_image_type = matches!(data_type, "thumbnail" | "logo" | "banner" | "fanart");
    if is_image_type {
        return if is_image { TWO_WEEKS * 2 } else { TWO_WEEKS };
    }
    if data_type.starts_with("bio_") {
        return WEEK;
    }
    WEEK
}

/// Performs outbound GETs and stores results through `Storage`.
pub struct Fetcher {
    client: reqwest::Client,
    storage: Arc<Storage>,
    rate_limiters: Arc<RateLimiterManager>,
}

impl Fetcher {
    pub fn new(storage: Arc<Storage>, rate_limiters: Arc<RateLimiterManager>) -> Self {
        Fetcher {
            client: reqwest::Client::new(),
            storage,
            rate_limiters,
        }
    }

    /// Handles the full lookup path: cache hit, queue-for-later, or immediate
    /// fetch with retry/backoff.
    #[allow(clippy::too_many_arguments)]
    pub async fn get_or_fetch(
        &self,
        url: &str,
        identifier: &str,
        data_type: &str,
        provider: &str,
        timeout: Duration,
        retries: u32,
        ttl_seconds: Option<i64>,
        immediate: bool,
        metadata: Option<serde_json::Value>,
    ) -> Result<FetchOutcome> {
        let storage = self.storage.clone();
        let url_owned = url.to_string();
        if let Some((value, _)) = spawn_blocking_retrieve(&storage, url_owned.clone()).await? {
            return Ok(FetchOutcome::Hit(value));
        }

        if !immediate {
            let params = serde_json::json!({
                "url": url,
                "identifier": identifier,
                "data_type": data_type,
                "provider": provider,
                "ttl_seconds": ttl_seconds,
                "metadata": metadata,
            });
            let storage = self.storage.clone();
            let provider_owned = provider.to_string();
            tokio::task::spawn_blocking(move || {
                storage.queue_request(&provider_owned, "fetch_url", &params, 2)
            })
            .await
            .map_err(|e| Error::Timeout(e.to_string()))??;
            return Ok(FetchOutcome::Queued);
        }

        self.fetch_now(
            url,
            identifier,
            data_type,
            provider,
            timeout,
            retries,
            ttl_seconds,
            metadata,
        )
        .await
    }

    /// Performs the immediate-fetch path: acquire a rate-limit token, GET, classify, store.
    #[allow(clippy::too_many_arguments)]
    pub async fn fetch_now(
        &self,
        url: &str,
        identifier: &str,
        data_type: &str,
        provider: &str,
        timeout: Duration,
        retries: u32,
        ttl_seconds: Option<i64>,
        metadata: Option<serde_json::Value>,
    ) -> Result<FetchOutcome> {
        if !self.rate_limiters.acquire(provider, timeout).await {
            return Err(Error::RateLimited(provider.to_string()));
        }

        let mut attempt = 0u32;
        loop {
            let response = self
                .client
                .get(url)
                .timeout(timeout)
                .send()
                .await;

            match response {
                Ok(resp) if resp.status().is_success() => {
                    let content_type = resp
                        .headers()
                        .get(reqwest::header::CONTENT_TYPE)
                        .and_then(|v| v.to_str().ok())
                        .unwrap_or("")
                        .to_string();
                    let bytes = resp.bytes().await?;
                    let is_image = content_type.starts_with("image/");
                    let value = classify(&content_type, bytes.to_vec());
                    let retrieved = match &value {
                        DataValue::Json(v) => RetrievedValue::Json(v.clone()),
                        DataValue::Binary(b) => RetrievedValue::Raw(b.clone()),
                        DataValue::Text(s) => RetrievedValue::Raw(s.clone().into_bytes()),
                    };
                    let ttl = ttl_seconds.unwrap_or_else(|| default_ttl(data_type, provider, is_image));

                    let storage = self.storage.clone();
                    let (url_owned, identifier, data_type, provider) = (
                        url.to_string(),
                        identifier.to_string(),
                        data_type.to_string(),
                        provider.to_string(),
                    );
                    tokio::task::spawn_blocking(move || {
                        storage.store(&url_owned, &identifier, &data_type, &provider, value, ttl, metadata)
                    })
                    .await
                    .map_err(|e| Error::Timeout(e.to_string()))??;

                    return Ok(FetchOutcome::Hit(retrieved));
                }
                Ok(resp) if resp.status() == reqwest::StatusCode::TOO_MANY_REQUESTS => {
                    let retry_after = resp
                        .headers()
                        .get(reqwest::header::RETRY_AFTER)
                        .and_then(|v| v.to_str().ok())
                        .and_then(|v| v.parse::<u64>().ok())
                        .unwrap_or(1);
                    if attempt >= retries {
                        return Ok(FetchOutcome::NotAvailable);
                    }
                    attempt += 1;
                    tokio::time::sleep(Duration::from_secs(retry_after)).await;
                }
                Ok(resp) => {
                    debug!(status = %resp.status(), %url, "fetch returned error status");
                    if attempt >= retries {
                        return Ok(FetchOutcome::NotAvailable);
                    }
                    attempt += 1;
                    sleep_backoff(attempt).await;
                }
                Err(e) => {
                    warn!(error = %e, %url, "fetch error");
                    if attempt >= retries {
                        return Ok(FetchOutcome::NotAvailable);
                    }
                    attempt += 1;
                    sleep_backoff(attempt).await;
                }
            }
        }
    }
}

fn classify(content_type: &str, bytes: Vec<u8>) -> DataValue {
    if content_type.starts_with("application/json") {
        serde_json::from_slice(&bytes)
            .map(DataValue::Json)
            .unwrap_or(DataValue::Binary(bytes))
    } else if content_type.starts_with("image/")
        || content_type.starts_with("audio/")
        || content_type.starts_with("video/")
    {
        DataValue::Binary(bytes)
    } else {
        String::from_utf8(bytes.clone())
            .map(DataValue::Text)
            .unwrap_or(DataValue::Binary(bytes))
    }
}

async fn sleep_backoff(attempt: u32) {
    let jitter: f64 = rand::thread_rng().gen_range(0.0..1.0);
    let secs = 2f64.powi(attempt as i32) + jitter;
    tokio::time::sleep(Duration::from_secs_f64(secs)).await;
}

async fn spawn_blocking_retrieve(
    storage: &Arc<Storage>,
    url: String,
) -> Result<Option<(RetrievedValue, Option<serde_json::Value>)>> {
    let storage = storage.clone();
    tokio::task::spawn_blocking(move || storage.retrieve_by_url(&url))
        .await
        .map_err(|e| Error::Timeout(e.to_string()))?
}
