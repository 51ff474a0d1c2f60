//! Registry of streams known to the proxy.
//!
//! Ids are opaque, monotone and never reused within a session; the
//! registry is append-only apart from the variant pre-selection
//! rewrite of an entry's upstream URL.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::sync::RwLock;

/// What the proxy knows about one registered stream.
#[derive(Debug, Clone)]
pub struct StreamEntry {
    /// Current best media-level URL. Rewritten once when variant
    /// pre-selection replaces a master playlist URL.
    pub upstream_url: String,
    /// Headers the upstream host requires (Referer, User-Agent, ...).
    pub headers: HashMap<String, String>,
    pub anime_name: String,
    pub episode_number: String,
    /// Classification made once at registration time.
    pub is_hls: bool,
}

pub struct StreamRegistry {
    entries: RwLock<HashMap<String, StreamEntry>>,
    next_id: AtomicU64,
}

impl Default for StreamRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl StreamRegistry {
    pub fn new() -> Self {
        // Seeding from the wall clock keeps ids unique across restarts
        // even if a UI caches an old proxy URL.
        let seed = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos() as u64)
            .unwrap_or(1);
        Self {
            entries: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(seed),
        }
    }

    /// Registers a stream and returns its opaque id.
    pub async fn register(&self, entry: StreamEntry) -> String {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed).to_string();
        self.entries.write().await.insert(id.clone(), entry);
        id
    }

    pub async fn get(&self, id: &str) -> Option<StreamEntry> {
        self.entries.read().await.get(id).cloned()
    }

    /// Points an entry at the variant chosen by pre-selection.
    pub async fn set_upstream_url(&self, id: &str, url: String) {
        if let Some(entry) = self.entries.write().await.get_mut(id) {
            entry.upstream_url = url;
        }
    }
}
