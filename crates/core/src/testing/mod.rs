//! Mocks and fixtures for testing without external infrastructure.

use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Mutex;
use tokio::sync::RwLock;

use crate::events::EventSink;
use crate::model::{Anime, Episode, Source};
use crate::provider::{Provider, ProviderError, ResolvedStream, StreamMode};

/// Mock implementation of the [`Provider`] trait.
///
/// Search results, episode listings (keyed by anime URL) and streams
/// (keyed by episode URL) are all configured up front; queries are
/// recorded for assertions.
#[derive(Default)]
pub struct MockProvider {
    search_results: RwLock<Vec<Anime>>,
    episodes: RwLock<HashMap<String, Vec<Episode>>>,
    streams: RwLock<HashMap<String, ResolvedStream>>,
    searches: RwLock<Vec<String>>,
}

impl MockProvider {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the results every search returns. An empty list makes
    /// searches fail with [`ProviderError::NoResults`].
    pub async fn set_search_results(&self, results: Vec<Anime>) {
        *self.search_results.write().await = results;
    }

    pub async fn set_episodes(&self, anime_url: &str, episodes: Vec<Episode>) {
        self.episodes
            .write()
            .await
            .insert(anime_url.to_string(), episodes);
    }

    pub async fn set_stream(&self, episode_url: &str, stream: ResolvedStream) {
        self.streams
            .write()
            .await
            .insert(episode_url.to_string(), stream);
    }

    /// Queries passed to `search_anime`, in order.
    pub async fn recorded_searches(&self) -> Vec<String> {
        self.searches.read().await.clone()
    }
}

#[async_trait]
impl Provider for MockProvider {
    async fn search_anime(&self, query: &str) -> Result<Vec<Anime>, ProviderError> {
        self.searches.write().await.push(query.to_string());
        let results = self.search_results.read().await.clone();
        if results.is_empty() {
            return Err(ProviderError::NoResults);
        }
        Ok(results)
    }

    async fn anime_episodes(
        &self,
        url: &str,
        _source: Source,
    ) -> Result<Vec<Episode>, ProviderError> {
        self.episodes
            .read()
            .await
            .get(url)
            .cloned()
            .ok_or_else(|| ProviderError::Upstream(format!("no episodes for {url}")))
    }

    async fn episode_stream(
        &self,
        _anime: &Anime,
        episode: &Episode,
        _mode: StreamMode,
    ) -> Result<ResolvedStream, ProviderError> {
        self.streams
            .read()
            .await
            .get(&episode.url)
            .cloned()
            .ok_or_else(|| ProviderError::Upstream(format!("no stream for {}", episode.url)))
    }
}

/// Event sink that records everything emitted on it.
#[derive(Default)]
pub struct CollectingSink {
    events: Mutex<Vec<(String, Value)>>,
}

impl CollectingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<(String, Value)> {
        self.events.lock().unwrap().clone()
    }

    /// Progress percentages emitted for a given download key, in order.
    pub fn progress_for(&self, key: &str) -> Vec<u64> {
        self.events
            .lock()
            .unwrap()
            .iter()
            .filter(|(channel, payload)| {
                channel == crate::events::DOWNLOAD_PROGRESS_EVENT && payload["key"] == key
            })
            .filter_map(|(_, payload)| payload["progress"].as_u64())
            .collect()
    }
}

impl EventSink for CollectingSink {
    fn emit(&self, channel: &str, payload: Value) {
        self.events
            .lock()
            .unwrap()
            .push((channel.to_string(), payload));
    }
}

/// Ready-made domain objects for tests.
pub mod fixtures {
    use super::*;

    pub fn anime(name: &str, url: &str) -> Anime {
        Anime {
            name: name.to_string(),
            url: url.to_string(),
            source: Source::AllAnime,
            image_url: String::new(),
            anilist_id: 0,
            mal_id: 0,
            synopsis: String::new(),
            has_dub: false,
        }
    }

    pub fn dubbed_anime(name: &str, url: &str) -> Anime {
        Anime {
            has_dub: true,
            ..anime(name, url)
        }
    }

    pub fn episode(number: &str, url: &str) -> Episode {
        Episode {
            number: number.to_string(),
            num: number.parse().unwrap_or(0.0),
            url: url.to_string(),
            title: String::new(),
            aired: String::new(),
            duration: 0.0,
            is_filler: false,
            is_recap: false,
            synopsis: String::new(),
        }
    }

    pub fn resolved_stream(url: &str) -> ResolvedStream {
        ResolvedStream {
            url: url.to_string(),
            headers: HashMap::from([("Referer".to_string(), "https://h/".to_string())]),
        }
    }
}
