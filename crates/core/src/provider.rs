//! Upstream provider client seam.
//!
//! The actual scraping/API client lives outside this crate; the backend
//! depends only on this trait and injects it as `Arc<dyn Provider>`.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use thiserror::Error;

use crate::model::{Anime, Episode, Source};

/// Requested audio track of a stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StreamMode {
    #[default]
    Sub,
    Dub,
}

/// A playable upstream URL plus the request headers it requires
/// (Referer, User-Agent and friends). Doubles as the on-disk shape of
/// `stream_metadata.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResolvedStream {
    pub url: String,
    #[serde(default)]
    pub headers: HashMap<String, String>,
}

#[derive(Debug, Error)]
pub enum ProviderError {
    /// The provider found nothing for the query.
    #[error("no anime found")]
    NoResults,
    #[error("provider error: {0}")]
    Upstream(String),
}

#[async_trait]
pub trait Provider: Send + Sync {
    async fn search_anime(&self, query: &str) -> Result<Vec<Anime>, ProviderError>;

    async fn anime_episodes(&self, url: &str, source: Source)
        -> Result<Vec<Episode>, ProviderError>;

    async fn episode_stream(
        &self,
        anime: &Anime,
        episode: &Episode,
        mode: StreamMode,
    ) -> Result<ResolvedStream, ProviderError>;
}
