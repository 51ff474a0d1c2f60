//! JSON-persisted metadata cache.
//!
//! A single readers/writer-locked map, loaded once at startup and
//! rewritten (atomically, in full) after every mutation. Persistence
//! failures are logged and swallowed; the in-memory view stays
//! authoritative for the session.

mod types;

pub use types::{AnimeMetadata, EpisodeMeta};

use std::collections::HashMap;
use std::path::PathBuf;
use tokio::fs;
use tokio::sync::RwLock;
use tracing::{info, warn};

use crate::store::write_atomic;

pub struct MetadataCache {
    path: PathBuf,
    entries: RwLock<HashMap<String, AnimeMetadata>>,
}

impl MetadataCache {
    /// Creates an empty cache persisting to `path`.
    pub fn new(path: PathBuf) -> Self {
        Self {
            path,
            entries: RwLock::new(HashMap::new()),
        }
    }

    /// Loads the cache from disk. A missing or empty file yields an
    /// empty cache; corrupt JSON resets to empty rather than failing
    /// startup.
    pub async fn load(path: PathBuf) -> Self {
        let entries = match fs::read(&path).await {
            Ok(data) if data.is_empty() => HashMap::new(),
            Ok(data) => match serde_json::from_slice(&data) {
                Ok(entries) => entries,
                Err(err) => {
                    warn!(path = %path.display(), error = %err, "corrupt metadata cache, resetting");
                    HashMap::new()
                }
            },
            Err(err) => {
                if err.kind() != std::io::ErrorKind::NotFound {
                    warn!(path = %path.display(), error = %err, "failed to read metadata cache");
                }
                HashMap::new()
            }
        };
        info!(entries = entries.len(), "metadata cache loaded");
        Self {
            path,
            entries: RwLock::new(entries),
        }
    }

    pub async fn get(&self, key: &str) -> Option<AnimeMetadata> {
        self.entries.read().await.get(key).cloned()
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }

    /// Replaces the entry under `key` and persists.
    pub async fn insert(&self, key: impl Into<String>, meta: AnimeMetadata) {
        self.entries.write().await.insert(key.into(), meta);
        self.persist().await;
    }

    /// Mutates the entry under `key` (creating a default one if
    /// absent) and persists.
    pub async fn update_entry<F>(&self, key: &str, mutate: F)
    where
        F: FnOnce(&mut AnimeMetadata),
    {
        {
            let mut entries = self.entries.write().await;
            mutate(entries.entry(key.to_string()).or_default());
        }
        self.persist().await;
    }

    /// Looks up a cached episode by MAL id and episode number across
    /// all entries.
    pub async fn find_episode(&self, mal_id: i64, number: u32) -> Option<EpisodeMeta> {
        let entries = self.entries.read().await;
        entries
            .values()
            .filter(|meta| meta.mal_id == mal_id)
            .flat_map(|meta| meta.episodes.iter())
            .find(|ep| ep.episode == number)
            .cloned()
    }

    /// Merges an episode into every entry sharing `mal_id`: updated in
    /// place when the number already exists, appended otherwise.
    pub async fn merge_episode(&self, mal_id: i64, episode: EpisodeMeta) {
        {
            let mut entries = self.entries.write().await;
            for meta in entries.values_mut().filter(|m| m.mal_id == mal_id) {
                match meta.episodes.iter_mut().find(|e| e.episode == episode.episode) {
                    Some(existing) => *existing = episode.clone(),
                    None => meta.episodes.push(episode.clone()),
                }
            }
        }
        self.persist().await;
    }

    /// Writes the full cache to disk, replacing the previous file.
    /// Serialization happens under the read lock; the write itself is
    /// atomic (temp + rename). Errors are logged, not propagated.
    async fn persist(&self) {
        let serialized = {
            let entries = self.entries.read().await;
            serde_json::to_vec_pretty(&*entries)
        };
        let data = match serialized {
            Ok(data) => data,
            Err(err) => {
                warn!(error = %err, "failed to serialize metadata cache");
                return;
            }
        };
        if let Err(err) = write_atomic(&self.path, &data).await {
            warn!(path = %self.path.display(), error = %err, "failed to persist metadata cache");
        }
    }
}
