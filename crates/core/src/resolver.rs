//! Stream resolution: episode listings and playable stream URLs.
//!
//! Resolution prefers local state: an episode that was downloaded
//! before carries its resolved URL and headers in
//! `stream_metadata.json`, so it stays playable offline. Dub requests
//! need extra work because most providers list dubbed versions as
//! separate catalog entries.

use std::sync::Arc;
use thiserror::Error;
use tokio::fs;
use tracing::{debug, info, warn};

use crate::model::{Anime, Episode, Source};
use crate::provider::{Provider, ProviderError, ResolvedStream, StreamMode};
use crate::search::AnimeSearcher;
use crate::store::{StorageLayout, STREAM_METADATA_FILE};
use crate::titles::similarity;

/// Content keywords that mark a search result as a different cut of
/// the show. Each one present in the candidate but not the base name
/// costs 40 points.
const CONTENT_KEYWORDS: [&str; 12] = [
    "recap",
    "special",
    "part",
    "movie",
    "ova",
    "ona",
    "preview",
    "theatrical",
    "season 2",
    "season 3",
    "2nd season",
    "3rd season",
];

#[derive(Debug, Error)]
pub enum ResolveError {
    #[error("no suitable dubbed version found (best score: {best})")]
    NoDubMatch { best: i32 },
    #[error("failed to resolve stream URL")]
    EmptyStream,
    #[error(transparent)]
    Provider(#[from] ProviderError),
}

pub struct StreamResolver {
    provider: Arc<dyn Provider>,
    searcher: Arc<AnimeSearcher>,
    layout: StorageLayout,
}

impl StreamResolver {
    pub fn new(
        provider: Arc<dyn Provider>,
        searcher: Arc<AnimeSearcher>,
        layout: StorageLayout,
    ) -> Self {
        Self {
            provider,
            searcher,
            layout,
        }
    }

    /// Episode listing for an anime, honoring the dub flag.
    ///
    /// AllAnime models dubs as a `:dub` URL suffix, so that is tried
    /// first; if it yields nothing the dubbed catalog entry is located
    /// by title search and the suffix re-applied as needed.
    pub async fn episodes(
        &self,
        name: &str,
        url: &str,
        source: Source,
        is_dub: bool,
    ) -> Result<Vec<Episode>, ResolveError> {
        if is_dub && source == Source::AllAnime && !url.ends_with(":dub") {
            let dub_url = format!("{url}:dub");
            debug!(url = %dub_url, "trying suffix-first dub listing");
            if let Ok(episodes) = self.provider.anime_episodes(&dub_url, source).await {
                if !episodes.is_empty() {
                    info!(count = episodes.len(), "suffix-first dub listing succeeded");
                    return Ok(episodes);
                }
            }
        }

        let mut target = url.to_string();
        if is_dub && !url.ends_with(":dub") {
            match self.dubbed_counterpart(name).await {
                Ok(dubbed) => {
                    info!(name = %dubbed.name, url = %dubbed.url, "resolved dubbed counterpart");
                    target = dubbed.url;
                }
                Err(err) => warn!(name, error = %err, "dub resolution failed, using original URL"),
            }
        }
        if is_dub && source == Source::AllAnime && !target.ends_with(":dub") {
            target.push_str(":dub");
        }

        Ok(self.provider.anime_episodes(&target, source).await?)
    }

    /// Finds the dubbed catalog entry matching `current_name` via
    /// title search.
    ///
    /// The search runs through the full pipeline (cleaned names, Jikan
    /// enrichment, similarity re-rank), so ties resolve in the same
    /// order a user-facing search would present them. Candidates
    /// without a dub are skipped; the rest are scored by title
    /// similarity minus penalties for content keywords and asterisk
    /// markers that the base name does not carry. The best score wins;
    /// a negative best is a rejection.
    pub async fn dubbed_counterpart(&self, current_name: &str) -> Result<Anime, ResolveError> {
        let (base_name, query) = if current_name.to_lowercase().contains("(dub)") {
            let base = current_name
                .replace(" (Dub)", "")
                .replace(" (dub)", "")
                .trim()
                .to_string();
            (base.clone(), base)
        } else {
            (current_name.to_string(), format!("{current_name} (Dub)"))
        };

        let results = self.searcher.search(&query).await?;

        let base_lower = base_name.to_lowercase();
        let mut best: Option<Anime> = None;
        let mut best_score = -1;

        for candidate in results {
            if !candidate.has_dub {
                continue;
            }
            let candidate_lower = candidate.name.to_lowercase();

            let mut score = similarity(&base_name, &candidate.name);
            for keyword in CONTENT_KEYWORDS {
                if candidate_lower.contains(keyword) && !base_lower.contains(keyword) {
                    score -= 40;
                }
            }
            if candidate_lower.contains('*') && !base_lower.contains('*') {
                score -= 30;
            }
            debug!(name = %candidate.name, score, "dub candidate");

            if score > best_score {
                best_score = score;
                best = Some(candidate);
            }
        }

        match best {
            Some(anime) if best_score >= 0 => Ok(anime),
            _ => Err(ResolveError::NoDubMatch { best: best_score }),
        }
    }

    /// Resolves an episode to a playable `(url, headers)` pair.
    ///
    /// Episodes downloaded earlier short-circuit to the metadata
    /// recorded at download time and never touch the provider.
    pub async fn resolve(
        &self,
        anime: &Anime,
        episode: &Episode,
        is_dub: bool,
    ) -> Result<ResolvedStream, ResolveError> {
        let metadata_path = self
            .layout
            .episode_dir(&anime.name, &episode.number)
            .join(STREAM_METADATA_FILE);

        if let Ok(data) = fs::read(&metadata_path).await {
            match serde_json::from_slice::<ResolvedStream>(&data) {
                Ok(stream) if !stream.url.is_empty() => {
                    info!(anime = %anime.name, episode = %episode.number, "resolved stream from local metadata");
                    return Ok(stream);
                }
                Ok(_) => {}
                Err(err) => {
                    warn!(path = %metadata_path.display(), error = %err, "unreadable stream metadata, resolving online");
                }
            }
        }

        let mode = if is_dub {
            StreamMode::Dub
        } else {
            StreamMode::Sub
        };
        let stream = self.provider.episode_stream(anime, episode, mode).await?;
        if stream.url.is_empty() {
            return Err(ResolveError::EmptyStream);
        }
        Ok(stream)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jikan::{JikanClient, JikanConfig};
    use crate::metadata::{AnimeMetadata, MetadataCache};
    use crate::testing::{fixtures, MockProvider};
    use tempfile::TempDir;

    /// Builds a resolver whose search pipeline answers enrichment from
    /// a pre-seeded metadata cache; the Jikan base URL points at a
    /// closed port so nothing leaves the process.
    async fn resolver_with(
        provider: MockProvider,
        tmp: &TempDir,
        seeded: &[&str],
    ) -> (StreamResolver, Arc<MockProvider>) {
        let provider = Arc::new(provider);
        let layout = StorageLayout::new(tmp.path().join("downloads"), tmp.path().join("cache"));
        let jikan = Arc::new(JikanClient::new(&JikanConfig {
            base_url: "http://127.0.0.1:1".to_string(),
            timeout_secs: 1,
        }));
        let metadata = Arc::new(MetadataCache::new(tmp.path().join("metadata_cache.json")));
        for name in seeded {
            metadata.insert(*name, AnimeMetadata::default()).await;
        }
        let searcher = Arc::new(AnimeSearcher::new(
            Arc::clone(&provider) as Arc<dyn Provider>,
            jikan,
            metadata,
        ));
        (
            StreamResolver::new(Arc::clone(&provider) as Arc<dyn Provider>, searcher, layout),
            provider,
        )
    }

    #[tokio::test]
    async fn dub_selection_penalizes_content_keywords() {
        let provider = MockProvider::new();
        provider
            .set_search_results(vec![
                fixtures::dubbed_anime("Foo", "https://p/foo"),
                fixtures::dubbed_anime("Foo Recap", "https://p/foo-recap"),
            ])
            .await;
        let tmp = TempDir::new().unwrap();
        let (resolver, _mock) = resolver_with(provider, &tmp, &["Foo", "Foo Recap"]).await;

        let best = resolver.dubbed_counterpart("Foo").await.unwrap();
        assert_eq!(best.name, "Foo");
    }

    #[tokio::test]
    async fn dub_selection_ignores_sub_only_results() {
        let provider = MockProvider::new();
        let mut sub_only = fixtures::dubbed_anime("Foo", "https://p/foo");
        sub_only.has_dub = false;
        provider.set_search_results(vec![sub_only]).await;
        let tmp = TempDir::new().unwrap();
        let (resolver, _mock) = resolver_with(provider, &tmp, &["Foo"]).await;

        let err = resolver.dubbed_counterpart("Foo").await.unwrap_err();
        assert!(matches!(err, ResolveError::NoDubMatch { best: -1 }));
    }

    #[tokio::test]
    async fn dub_query_strips_existing_marker() {
        let provider = MockProvider::new();
        provider
            .set_search_results(vec![fixtures::dubbed_anime("Foo", "https://p/foo")])
            .await;
        let tmp = TempDir::new().unwrap();
        let (resolver, mock) = resolver_with(provider, &tmp, &["Foo"]).await;

        resolver.dubbed_counterpart("Foo (Dub)").await.unwrap();
        let searches = mock.recorded_searches().await;
        assert_eq!(searches, vec!["Foo".to_string()]);
    }

    #[tokio::test]
    async fn dub_query_appends_marker() {
        let provider = MockProvider::new();
        provider
            .set_search_results(vec![fixtures::dubbed_anime("Foo", "https://p/foo")])
            .await;
        let tmp = TempDir::new().unwrap();
        let (resolver, mock) = resolver_with(provider, &tmp, &["Foo"]).await;

        resolver.dubbed_counterpart("Foo").await.unwrap();
        let searches = mock.recorded_searches().await;
        assert_eq!(searches, vec!["Foo (Dub)".to_string()]);
    }

    #[tokio::test]
    async fn suffix_first_dub_listing_wins() {
        let provider = MockProvider::new();
        provider
            .set_episodes(
                "https://p/foo:dub",
                vec![fixtures::episode("1", "https://p/foo/ep1:dub")],
            )
            .await;
        let tmp = TempDir::new().unwrap();
        let (resolver, _mock) = resolver_with(provider, &tmp, &[]).await;

        let episodes = resolver
            .episodes("Foo", "https://p/foo", Source::AllAnime, true)
            .await
            .unwrap();
        assert_eq!(episodes.len(), 1);
        assert_eq!(episodes[0].url, "https://p/foo/ep1:dub");
    }

    #[tokio::test]
    async fn offline_metadata_short_circuits_resolution() {
        let provider = MockProvider::new();
        let tmp = TempDir::new().unwrap();
        let layout = StorageLayout::new(tmp.path().join("downloads"), tmp.path().join("cache"));
        let ep_dir = layout.episode_dir("Foo", "1");
        tokio::fs::create_dir_all(&ep_dir).await.unwrap();
        tokio::fs::write(
            ep_dir.join(STREAM_METADATA_FILE),
            r#"{"url":"https://h/media.m3u8","headers":{"Referer":"https://h/"}}"#,
        )
        .await
        .unwrap();

        let provider = Arc::new(provider);
        let searcher = Arc::new(AnimeSearcher::new(
            Arc::clone(&provider) as Arc<dyn Provider>,
            Arc::new(JikanClient::new(&JikanConfig {
                base_url: "http://127.0.0.1:1".to_string(),
                timeout_secs: 1,
            })),
            Arc::new(MetadataCache::new(tmp.path().join("metadata_cache.json"))),
        ));
        let resolver = StreamResolver::new(provider, searcher, layout);
        let anime = fixtures::anime("Foo", "https://p/foo");
        let episode = fixtures::episode("1", "https://p/foo/ep1");

        // No stream configured on the mock: resolution must not reach it.
        let stream = resolver.resolve(&anime, &episode, false).await.unwrap();
        assert_eq!(stream.url, "https://h/media.m3u8");
        assert_eq!(stream.headers.get("Referer").unwrap(), "https://h/");
    }
}
