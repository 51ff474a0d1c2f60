//! Public service facade.
//!
//! Everything the UI can ask for goes through [`AnimeService`]: search
//! with metadata enrichment, episode listings, proxied stream URLs,
//! downloads and the filesystem-level utilities around them.

use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::fs;
use tracing::{debug, info, warn};

use hikari_core::config::AppConfig;
use hikari_core::download::{DownloadError, DownloadJob, DownloadManager, Remuxer};
use hikari_core::events::EventSink;
use hikari_core::jikan::{JikanClient, JikanError};
use hikari_core::metadata::{AnimeMetadata, EpisodeMeta, MetadataCache};
use hikari_core::model::{Anime, Episode, Source};
use hikari_core::playlist;
use hikari_core::provider::{Provider, ProviderError};
use hikari_core::resolver::{ResolveError, StreamResolver};
use hikari_core::search::AnimeSearcher;
use hikari_core::store::{self, StorageLayout, INDEX_FILE, MP4_FILE, STREAM_METADATA_FILE};

use crate::proxy::ProxyServer;
use crate::registry::{StreamEntry, StreamRegistry};

#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("invalid source: [{0}]")]
    UnknownSource(String),

    #[error(transparent)]
    Provider(#[from] ProviderError),

    #[error(transparent)]
    Resolve(#[from] ResolveError),

    #[error(transparent)]
    Download(#[from] DownloadError),

    #[error(transparent)]
    Jikan(#[from] JikanError),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// What the UI needs to start playback.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamHandle {
    /// Loopback proxy URL; the only URL the player ever sees.
    pub url: String,
    pub headers: HashMap<String, String>,
    pub is_hls: bool,
    pub is_downloaded: bool,
}

pub struct AnimeService {
    searcher: Arc<AnimeSearcher>,
    jikan: Arc<JikanClient>,
    metadata: Arc<MetadataCache>,
    resolver: StreamResolver,
    downloads: Arc<DownloadManager>,
    registry: Arc<StreamRegistry>,
    layout: StorageLayout,
    remuxer: Remuxer,
    /// Metadata-grade client (with timeout) for variant pre-selection.
    client: reqwest::Client,
    proxy: ProxyServer,
}

impl AnimeService {
    /// Initializes the backend: creates the storage layout, loads the
    /// metadata cache and binds the loopback proxy.
    pub async fn start(
        config: AppConfig,
        provider: Arc<dyn Provider>,
        events: Arc<dyn EventSink>,
    ) -> Result<Arc<Self>, ServiceError> {
        let layout = StorageLayout::from_config(&config);
        layout.ensure_dirs().await?;

        let metadata = Arc::new(MetadataCache::load(config.metadata_cache_path()).await);
        let registry = Arc::new(StreamRegistry::new());
        let proxy = ProxyServer::start(
            Arc::clone(&registry),
            layout.clone(),
            Arc::clone(&events),
            config.proxy_port,
        )
        .await?;

        let jikan = Arc::new(JikanClient::new(&config.jikan));
        let searcher = Arc::new(AnimeSearcher::new(
            Arc::clone(&provider),
            Arc::clone(&jikan),
            Arc::clone(&metadata),
        ));
        let resolver = StreamResolver::new(provider, Arc::clone(&searcher), layout.clone());
        let remuxer = Remuxer::new();
        let downloads = Arc::new(DownloadManager::with_remuxer(
            layout.clone(),
            Arc::clone(&events),
            remuxer.clone(),
        ));
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.jikan.timeout_secs))
            .build()
            .expect("Failed to create HTTP client");

        info!(port = proxy.port(), "anime service initialized");
        Ok(Arc::new(Self {
            searcher,
            jikan,
            metadata,
            resolver,
            downloads,
            registry,
            layout,
            remuxer,
            client,
            proxy,
        }))
    }

    /// Port the loopback proxy is bound to.
    pub fn proxy_port(&self) -> u16 {
        self.proxy.port()
    }

    /// Searches the provider, enriches the top results with Jikan
    /// covers/synopses and re-ranks by similarity to the query. The
    /// same pipeline backs the resolver's dub selection.
    pub async fn search(&self, query: &str) -> Result<Vec<Anime>, ServiceError> {
        Ok(self.searcher.search(query).await?)
    }

    /// Episode listing for an anime; see the resolver for the dub
    /// handling.
    pub async fn episodes(
        &self,
        name: &str,
        url: &str,
        source: &str,
        is_dub: bool,
    ) -> Result<Vec<Episode>, ServiceError> {
        let source: Source = source.parse().map_err(ServiceError::UnknownSource)?;
        Ok(self.resolver.episodes(name, url, source, is_dub).await?)
    }

    /// Resolves an episode, registers it with the proxy and returns
    /// the proxied URL for playback.
    pub async fn stream_url(
        &self,
        anime: &Anime,
        episode: &Episode,
        is_dub: bool,
    ) -> Result<StreamHandle, ServiceError> {
        let resolved = self.resolver.resolve(anime, episode, is_dub).await?;
        let media_url = resolved.url.clone();
        let mut is_hls = playlist::looks_like_hls(&media_url);

        // Local artifacts override the classification: a finalized MP4
        // plays as plain video, a local playlist plays as HLS and gets
        // upgraded to MP4 in the background.
        let ep_dir = self.layout.episode_dir(&anime.name, &episode.number);
        if store::file_nonempty(&ep_dir.join(MP4_FILE)).await {
            is_hls = false;
        } else if fs::try_exists(ep_dir.join(INDEX_FILE)).await.unwrap_or(false) {
            is_hls = true;
            let remuxer = self.remuxer.clone();
            let dir = ep_dir.clone();
            tokio::spawn(async move {
                match remuxer.upgrade_from_manifest(dir).await {
                    Ok(()) => info!("background remux upgrade complete"),
                    Err(err) => debug!(error = %err, "background remux upgrade failed"),
                }
            });
        }

        let downloaded = self.download_status(&anime.name, &episode.number).await;
        let id = self
            .registry
            .register(StreamEntry {
                upstream_url: media_url.clone(),
                headers: resolved.headers.clone(),
                anime_name: anime.name.clone(),
                episode_number: episode.number.clone(),
                is_hls,
            })
            .await;
        let proxy_url = format!("http://127.0.0.1:{}/proxy?id={}", self.proxy.port(), id);

        if downloaded {
            info!(anime = %anime.name, episode = %episode.number, "serving downloaded episode");
            return Ok(StreamHandle {
                url: proxy_url,
                headers: resolved.headers,
                is_hls,
                is_downloaded: true,
            });
        }

        // Pick the best variant once, so the proxy serves a media
        // playlist on the very first hit.
        if is_hls {
            if let Some(variant) = self.preselect_variant(&media_url, &resolved.headers).await {
                info!(url = %variant, "pre-selected variant for streaming");
                self.registry.set_upstream_url(&id, variant).await;
            }
        }

        Ok(StreamHandle {
            url: proxy_url,
            headers: resolved.headers,
            is_hls,
            is_downloaded: false,
        })
    }

    /// Downloads an episode into its per-episode directory and
    /// finalizes it to MP4. Progress arrives on the event bus.
    pub async fn download_episode(
        &self,
        anime: &Anime,
        episode: &Episode,
        is_dub: bool,
    ) -> Result<(), ServiceError> {
        let resolved = self.resolver.resolve(anime, episode, is_dub).await?;
        let job = DownloadJob::new(anime.name.clone(), episode.number.clone());
        Ok(self.downloads.download(job, resolved).await?)
    }

    /// Cancels the download registered under `key`
    /// (`<anime>:<episode>`).
    pub async fn cancel_download(&self, key: &str) -> bool {
        self.downloads.cancel(key).await
    }

    /// Whether an episode is downloaded (finalized MP4) or at least
    /// resolvable offline (recorded stream metadata).
    pub async fn download_status(&self, anime_name: &str, episode_number: &str) -> bool {
        let ep_dir = self.layout.episode_dir(anime_name, episode_number);
        fs::try_exists(ep_dir.join(MP4_FILE)).await.unwrap_or(false)
            || fs::try_exists(ep_dir.join(STREAM_METADATA_FILE))
                .await
                .unwrap_or(false)
    }

    /// All downloaded episodes, keyed by (sanitized) anime directory
    /// name.
    pub async fn downloads(&self) -> Result<HashMap<String, Vec<String>>, ServiceError> {
        let mut downloads = HashMap::new();
        let mut anime_dirs = fs::read_dir(self.layout.downloads_dir()).await?;
        while let Some(anime_entry) = anime_dirs.next_entry().await? {
            if !anime_entry.file_type().await?.is_dir() {
                continue;
            }
            let anime_name = anime_entry.file_name().to_string_lossy().into_owned();
            let mut episodes = Vec::new();
            let Ok(mut episode_dirs) = fs::read_dir(anime_entry.path()).await else {
                continue;
            };
            while let Some(episode_entry) = episode_dirs.next_entry().await? {
                if episode_entry.file_type().await?.is_dir() {
                    episodes.push(episode_entry.file_name().to_string_lossy().into_owned());
                }
            }
            if !episodes.is_empty() {
                downloads.insert(anime_name, episodes);
            }
        }
        Ok(downloads)
    }

    /// Deletes an episode's directory and everything in it.
    pub async fn delete_download(
        &self,
        anime_name: &str,
        episode_number: &str,
    ) -> Result<(), ServiceError> {
        let ep_dir = self.layout.episode_dir(anime_name, episode_number);
        fs::remove_dir_all(&ep_dir).await?;
        Ok(())
    }

    /// Progress snapshot of all in-flight downloads.
    pub async fn active_downloads(&self) -> HashMap<String, u8> {
        self.downloads.active().await
    }

    /// Wipes the transient segment cache.
    pub async fn clear_cache(&self) -> Result<(), ServiceError> {
        info!("clearing transient video cache");
        if let Err(err) = fs::remove_dir_all(self.layout.cache_dir()).await {
            if err.kind() != std::io::ErrorKind::NotFound {
                warn!(error = %err, "failed to clear cache");
            }
        }
        fs::create_dir_all(self.layout.cache_dir()).await?;
        Ok(())
    }

    /// Metadata for a single episode, cached across every entry
    /// sharing the MAL id.
    pub async fn episode_metadata(
        &self,
        mal_id: i64,
        number: u32,
    ) -> Result<EpisodeMeta, ServiceError> {
        if let Some(cached) = self.metadata.find_episode(mal_id, number).await {
            return Ok(cached);
        }
        let episode: EpisodeMeta = self.jikan.episode(mal_id, number).await?.into();
        self.metadata.merge_episode(mal_id, episode.clone()).await;
        Ok(episode)
    }

    /// Full episode list for an anime, cached under its decimal MAL
    /// id.
    pub async fn episode_list(&self, mal_id: i64) -> Result<AnimeMetadata, ServiceError> {
        let key = mal_id.to_string();
        if let Some(cached) = self.metadata.get(&key).await {
            return Ok(cached);
        }
        let episodes: Vec<EpisodeMeta> = self
            .jikan
            .episodes(mal_id)
            .await?
            .into_iter()
            .map(Into::into)
            .collect();
        let entry = AnimeMetadata {
            img: String::new(),
            desc: String::new(),
            mal_id,
            episodes,
        };
        self.metadata.insert(key, entry.clone()).await;
        Ok(entry)
    }

    async fn preselect_variant(
        &self,
        url: &str,
        headers: &HashMap<String, String>,
    ) -> Option<String> {
        let mut request = self.client.get(url);
        for (name, value) in headers {
            request = request.header(name.as_str(), value.as_str());
        }
        let response = match request.send().await {
            Ok(response) if response.status() == reqwest::StatusCode::OK => response,
            Ok(response) => {
                debug!(url, status = %response.status(), "variant pre-selection skipped");
                return None;
            }
            Err(err) => {
                debug!(url, error = %err, "variant pre-selection failed");
                return None;
            }
        };
        let content = response.text().await.ok()?;
        if !playlist::is_master(&content) {
            return None;
        }
        let variant = playlist::select_variant(&content)?;
        playlist::resolve_url(url, variant)
    }
}
