//! Rate-limited Jikan (MyAnimeList) API client.
//!
//! Jikan enforces strict public rate limits, so every request goes
//! through a single mutex that serializes the whole send-wait-retry
//! sequence: wait out the remainder of a one-second window since the
//! previous request, then attempt up to three times with exponential
//! backoff on HTTP 429 and transport errors. Any other non-200 status
//! is returned immediately; callers treat it as a cache miss.

use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::time::{sleep, Instant};
use tracing::{debug, warn};

use crate::metadata::EpisodeMeta;

const MIN_REQUEST_INTERVAL: Duration = Duration::from_secs(1);
const MAX_ATTEMPTS: u32 = 3;

/// Jikan API configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JikanConfig {
    #[serde(default = "default_base_url")]
    pub base_url: String,
    /// Client timeout for metadata traffic.
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for JikanConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

fn default_base_url() -> String {
    "https://api.jikan.moe/v4".to_string()
}

fn default_timeout_secs() -> u64 {
    120
}

#[derive(Debug, Error)]
pub enum JikanError {
    #[error("jikan api error: {status}")]
    Status { status: u16 },
    #[error("jikan request failed: {0}")]
    Transport(#[from] reqwest::Error),
}

pub struct JikanClient {
    client: Client,
    base_url: String,
    /// Start time of the most recent request; guards the whole
    /// send-wait-retry sequence.
    last_request: Mutex<Option<Instant>>,
}

impl JikanClient {
    pub fn new(config: &JikanConfig) -> Self {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .expect("Failed to create HTTP client");
        Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            last_request: Mutex::new(None),
        }
    }

    /// Top search results for a query.
    ///
    /// A non-200 response yields an empty list; search enrichment is
    /// best-effort.
    pub async fn search(&self, query: &str, limit: u8) -> Result<Vec<JikanAnime>, JikanError> {
        let url = format!(
            "{}/anime?q={}&limit={}",
            self.base_url,
            urlencoding::encode(query),
            limit
        );
        let response = self.throttled_get(&url).await?;
        if response.status() != StatusCode::OK {
            debug!(query, status = %response.status(), "jikan search miss");
            return Ok(Vec::new());
        }
        let body: DataEnvelope<Vec<JikanAnime>> = response.json().await?;
        Ok(body.data)
    }

    /// Full episode list for an anime. Non-200 yields an empty list.
    pub async fn episodes(&self, mal_id: i64) -> Result<Vec<JikanEpisode>, JikanError> {
        let url = format!("{}/anime/{}/episodes", self.base_url, mal_id);
        let response = self.throttled_get(&url).await?;
        if response.status() != StatusCode::OK {
            debug!(mal_id, status = %response.status(), "jikan episode list miss");
            return Ok(Vec::new());
        }
        let body: DataEnvelope<Vec<JikanEpisode>> = response.json().await?;
        Ok(body.data)
    }

    /// A single episode's metadata. Non-200 is an error here; the
    /// caller asked for a specific record.
    pub async fn episode(&self, mal_id: i64, number: u32) -> Result<JikanEpisode, JikanError> {
        let url = format!("{}/anime/{}/episodes/{}", self.base_url, mal_id, number);
        let response = self.throttled_get(&url).await?;
        if response.status() != StatusCode::OK {
            return Err(JikanError::Status {
                status: response.status().as_u16(),
            });
        }
        let body: DataEnvelope<JikanEpisode> = response.json().await?;
        Ok(body.data)
    }

    /// Performs a GET under the global rate limit.
    ///
    /// Returns the response even when it is a 429 that survived all
    /// retries; callers treat any non-200 as a miss or error.
    async fn throttled_get(&self, url: &str) -> Result<reqwest::Response, JikanError> {
        let mut last_request = self.last_request.lock().await;

        if let Some(previous) = *last_request {
            let elapsed = previous.elapsed();
            if elapsed < MIN_REQUEST_INTERVAL {
                sleep(MIN_REQUEST_INTERVAL - elapsed).await;
            }
        }

        let mut backoff = Duration::from_secs(1);
        for attempt in 1..=MAX_ATTEMPTS {
            match self.client.get(url).send().await {
                Ok(response) => {
                    let status = response.status();
                    if status != StatusCode::TOO_MANY_REQUESTS || attempt == MAX_ATTEMPTS {
                        *last_request = Some(Instant::now());
                        return Ok(response);
                    }
                    warn!(url, attempt, "jikan rate limit hit, backing off");
                }
                Err(err) => {
                    if attempt == MAX_ATTEMPTS {
                        *last_request = Some(Instant::now());
                        return Err(err.into());
                    }
                    warn!(url, attempt, error = %err, "jikan request failed, retrying");
                }
            }
            sleep(backoff).await;
            backoff *= 2;
        }
        unreachable!("retry loop always returns on the final attempt")
    }
}

#[derive(Debug, Deserialize)]
struct DataEnvelope<T> {
    data: T,
}

/// Search result entry from `/anime`.
#[derive(Debug, Clone, Deserialize)]
pub struct JikanAnime {
    pub mal_id: i64,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub title_english: Option<String>,
    #[serde(default)]
    pub synopsis: Option<String>,
    #[serde(default)]
    pub images: JikanImages,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct JikanImages {
    #[serde(default)]
    pub webp: JikanImageSet,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct JikanImageSet {
    #[serde(default)]
    pub large_image_url: String,
}

/// Episode entry from `/anime/{id}/episodes` (where `mal_id` is the
/// episode number) and `/anime/{id}/episodes/{n}`.
#[derive(Debug, Clone, Deserialize)]
pub struct JikanEpisode {
    pub mal_id: i64,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub synopsis: Option<String>,
    #[serde(default)]
    pub aired: Option<String>,
    #[serde(default)]
    pub filler: bool,
}

impl From<JikanEpisode> for EpisodeMeta {
    fn from(ep: JikanEpisode) -> Self {
        // Jikan airs dates as full timestamps; keep YYYY-MM-DD.
        let mut aired = ep.aired.unwrap_or_default();
        if aired.len() > 10 {
            aired.truncate(10);
        }
        EpisodeMeta {
            episode: ep.mal_id.max(0) as u32,
            title: ep.title,
            synopsis: ep.synopsis.unwrap_or_default(),
            aired,
            filler: ep.filler,
        }
    }
}
