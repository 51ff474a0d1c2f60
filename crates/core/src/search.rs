//! Provider search with Jikan enrichment.
//!
//! Search is one pipeline no matter who invokes it: provider results
//! get cleaned titles, the top results are enriched with covers,
//! synopses and MAL ids through the rate-limited Jikan client, and the
//! list is re-ranked by similarity to the query. The dub resolver runs
//! this same pipeline, so candidate ordering and metadata-cache side
//! effects do not depend on the call site.

use std::cmp::Reverse;
use std::sync::Arc;
use tokio::task::JoinSet;
use tracing::{debug, info};

use crate::jikan::{JikanAnime, JikanClient};
use crate::metadata::{AnimeMetadata, MetadataCache};
use crate::model::Anime;
use crate::provider::{Provider, ProviderError};
use crate::titles::{clean_title, similarity};

/// Results beyond this rank are returned without enrichment; Jikan's
/// rate limit makes deeper enrichment too slow.
const SEARCH_ENRICH_LIMIT: usize = 10;
const JIKAN_SEARCH_LIMIT: u8 = 5;

pub struct AnimeSearcher {
    provider: Arc<dyn Provider>,
    jikan: Arc<JikanClient>,
    metadata: Arc<MetadataCache>,
}

impl AnimeSearcher {
    pub fn new(
        provider: Arc<dyn Provider>,
        jikan: Arc<JikanClient>,
        metadata: Arc<MetadataCache>,
    ) -> Self {
        Self {
            provider,
            jikan,
            metadata,
        }
    }

    /// Searches the provider, enriches the top results and re-ranks
    /// them by similarity to the query. An upstream "no anime found"
    /// yields an empty list rather than an error.
    pub async fn search(&self, query: &str) -> Result<Vec<Anime>, ProviderError> {
        info!(query, "searching");
        let results = match self.provider.search_anime(query).await {
            Ok(results) => results,
            Err(ProviderError::NoResults) => return Ok(Vec::new()),
            Err(err) => return Err(err),
        };
        let mut results: Vec<Anime> = results
            .into_iter()
            .map(|mut anime| {
                anime.name = clean_title(&anime.name);
                anime
            })
            .collect();

        let mut enrichments = JoinSet::new();
        for (idx, anime) in results.iter().enumerate().take(SEARCH_ENRICH_LIMIT) {
            let jikan = Arc::clone(&self.jikan);
            let metadata = Arc::clone(&self.metadata);
            let name = anime.name.clone();
            enrichments.spawn(async move { (idx, enrich(&jikan, &metadata, &name).await) });
        }
        while let Some(joined) = enrichments.join_next().await {
            if let Ok((idx, Some(found))) = joined {
                let anime = &mut results[idx];
                if !found.img.is_empty() {
                    anime.image_url = found.img;
                }
                if !found.desc.is_empty() {
                    anime.synopsis = found.desc;
                }
                if found.mal_id > 0 {
                    anime.mal_id = found.mal_id;
                }
            }
        }

        results.sort_by_key(|anime| Reverse(similarity(query, &anime.name)));
        Ok(results)
    }
}

/// Looks up (or fetches and caches) cover/synopsis/MAL-id enrichment
/// for a cleaned title. The best of the top Jikan results wins, judged
/// by similarity against both the default and the English title.
async fn enrich(
    jikan: &JikanClient,
    metadata: &MetadataCache,
    name: &str,
) -> Option<AnimeMetadata> {
    let key = clean_title(name);
    if let Some(cached) = metadata.get(&key).await {
        return Some(cached);
    }

    let candidates = match jikan.search(&key, JIKAN_SEARCH_LIMIT).await {
        Ok(candidates) => candidates,
        Err(err) => {
            debug!(name = key, error = %err, "jikan search failed");
            return None;
        }
    };

    let mut best: Option<&JikanAnime> = None;
    let mut best_score = -1;
    for candidate in &candidates {
        let mut score = similarity(&key, &candidate.title);
        if let Some(english) = &candidate.title_english {
            score = score.max(similarity(&key, english));
        }
        if score > best_score {
            best_score = score;
            best = Some(candidate);
        }
    }
    let best = best?;

    let entry = AnimeMetadata {
        img: best.images.webp.large_image_url.clone(),
        desc: best.synopsis.clone().unwrap_or_default(),
        mal_id: best.mal_id,
        episodes: Vec::new(),
    };
    debug!(name = key, mal_id = entry.mal_id, score = best_score, "found jikan metadata");
    metadata
        .update_entry(&key, |meta| {
            meta.img = entry.img.clone();
            meta.desc = entry.desc.clone();
            meta.mal_id = entry.mal_id;
        })
        .await;
    Some(entry)
}
