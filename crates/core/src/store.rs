//! Content-addressed segment storage.
//!
//! A segment's on-disk name is derived from its absolute URL
//! (`hex(sha256(url)) + extension`), so the same URL always maps to the
//! same file in the transient cache and in every episode directory.
//! Writers publish files atomically (write to a temp name, then
//! rename), so a file that exists with a non-zero size is complete.

use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::debug;
use url::Url;

/// Finalized remux output for an episode.
pub const MP4_FILE: &str = "episode.mp4";
/// Raw upstream media playlist, persisted verbatim.
pub const INDEX_FILE: &str = "index.m3u8";
/// Rewritten playlist referencing local segment filenames.
pub const LOCAL_INDEX_FILE: &str = "local_index.m3u8";
/// Ordered list of segment filenames belonging to an episode.
pub const MANIFEST_FILE: &str = "manifest.json";
/// Resolved `{url, headers}` recorded at download time.
pub const STREAM_METADATA_FILE: &str = "stream_metadata.json";

/// Extensions the proxy treats as cacheable media assets.
const MEDIA_EXTENSIONS: [&str; 6] = [".ts", ".m4s", ".mp4", ".m3u8", ".aspx", ".avi"];

/// File extension of a URL path, including the leading dot. Query and
/// fragment are stripped before the extension is taken.
pub fn url_extension(raw_url: &str) -> String {
    let base = raw_url
        .split(['?', '#'])
        .next()
        .unwrap_or(raw_url)
        .to_string();
    let path = Url::parse(&base)
        .map(|u| u.path().to_string())
        .unwrap_or(base);
    let name = path.rsplit('/').next().unwrap_or(&path);
    match name.rfind('.') {
        Some(idx) if idx + 1 < name.len() => name[idx..].to_string(),
        _ => String::new(),
    }
}

/// Content-addressed filename for a segment URL.
pub fn segment_filename(url: &str) -> String {
    let hash = Sha256::digest(url.as_bytes());
    format!("{:x}{}", hash, url_extension(url))
}

/// Whether an extension (as returned by [`url_extension`]) names a
/// media asset worth caching.
pub fn is_media_extension(ext: &str) -> bool {
    MEDIA_EXTENSIONS.contains(&ext)
}

/// Makes a name safe to use as a directory component: path separators
/// become underscores, reserved characters are dropped.
pub fn sanitize_name(name: &str) -> String {
    name.chars()
        .filter_map(|c| match c {
            '/' | '\\' => Some('_'),
            '<' | '>' | ':' | '"' | '|' | '?' | '*' => None,
            other => Some(other),
        })
        .collect::<String>()
        .trim()
        .to_string()
}

/// Whether `path` is a fully-written file (exists with size > 0).
pub async fn file_nonempty(path: &Path) -> bool {
    matches!(fs::metadata(path).await, Ok(meta) if meta.is_file() && meta.len() > 0)
}

/// Writes `bytes` to `path` atomically: the content lands under a temp
/// name first and becomes visible only via rename.
pub async fn write_atomic(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    let tmp = temp_path(path);
    let mut file = fs::File::create(&tmp).await?;
    if let Err(err) = async {
        file.write_all(bytes).await?;
        file.flush().await
    }
    .await
    {
        drop(file);
        let _ = fs::remove_file(&tmp).await;
        return Err(err);
    }
    drop(file);
    fs::rename(&tmp, path).await
}

/// Temp-file sibling used for atomic publication of `path`.
pub fn temp_path(path: &Path) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    name.push_str(".part");
    path.with_file_name(name)
}

/// The on-disk layout: transient cache plus per-episode downloads.
#[derive(Debug, Clone)]
pub struct StorageLayout {
    downloads_dir: PathBuf,
    cache_dir: PathBuf,
}

impl StorageLayout {
    pub fn new(downloads_dir: PathBuf, cache_dir: PathBuf) -> Self {
        Self {
            downloads_dir,
            cache_dir,
        }
    }

    pub fn from_config(config: &crate::config::AppConfig) -> Self {
        Self::new(config.downloads_dir(), config.cache_dir())
    }

    pub async fn ensure_dirs(&self) -> std::io::Result<()> {
        fs::create_dir_all(&self.downloads_dir).await?;
        fs::create_dir_all(&self.cache_dir).await
    }

    pub fn downloads_dir(&self) -> &Path {
        &self.downloads_dir
    }

    pub fn cache_dir(&self) -> &Path {
        &self.cache_dir
    }

    /// Directory holding everything belonging to one episode.
    pub fn episode_dir(&self, anime_name: &str, episode_number: &str) -> PathBuf {
        self.downloads_dir
            .join(sanitize_name(anime_name))
            .join(sanitize_name(episode_number))
    }

    /// Transient cache path for a content-addressed filename.
    pub fn cache_path(&self, filename: &str) -> PathBuf {
        self.cache_dir.join(filename)
    }

    /// Resolves a segment URL across the storage tiers: episode
    /// directory, legacy flat downloads directory, transient cache. A
    /// hit is any fully-written file.
    pub async fn locate_segment(&self, url: &str, episode_dir: Option<&Path>) -> Option<PathBuf> {
        let filename = segment_filename(url);
        let mut candidates = Vec::with_capacity(3);
        if let Some(dir) = episode_dir {
            candidates.push(dir.join(&filename));
        }
        candidates.push(self.downloads_dir.join(&filename));
        candidates.push(self.cache_dir.join(&filename));

        for candidate in candidates {
            if file_nonempty(&candidate).await {
                debug!(url, path = %candidate.display(), "segment found locally");
                return Some(candidate);
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn extension_ignores_query_and_fragment() {
        assert_eq!(url_extension("https://h/video/seg.ts?token=abc#t"), ".ts");
        assert_eq!(url_extension("https://h/master.m3u8"), ".m3u8");
        assert_eq!(url_extension("https://h/path/noext"), "");
        assert_eq!(url_extension("relative/seg.m4s"), ".m4s");
    }

    #[test]
    fn filename_depends_only_on_url() {
        let a = segment_filename("https://h/seg.ts?x=1");
        let b = segment_filename("https://h/seg.ts?x=1");
        let c = segment_filename("https://h/seg.ts?x=2");
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert!(a.ends_with(".ts"));
        assert_eq!(a.len(), 64 + 3);
    }

    #[test]
    fn sanitizes_reserved_characters() {
        assert_eq!(sanitize_name("Re:Zero / Part 2?"), "ReZero _ Part 2");
        assert_eq!(sanitize_name("a\\b|c*d"), "a_bcd");
    }

    #[test]
    fn media_extension_classification() {
        for ext in [".ts", ".m4s", ".mp4", ".m3u8", ".aspx", ".avi"] {
            assert!(is_media_extension(ext));
        }
        assert!(!is_media_extension(".vtt"));
        assert!(!is_media_extension(""));
    }

    #[tokio::test]
    async fn locates_segments_across_tiers() {
        let tmp = TempDir::new().unwrap();
        let layout = StorageLayout::new(tmp.path().join("downloads"), tmp.path().join("cache"));
        layout.ensure_dirs().await.unwrap();

        let url = "https://h/stream/seg0.ts";
        let filename = segment_filename(url);
        let ep_dir = layout.episode_dir("Show", "1");

        assert!(layout.locate_segment(url, Some(&ep_dir)).await.is_none());

        // Cache tier.
        fs::write(layout.cache_path(&filename), b"data").await.unwrap();
        let hit = layout.locate_segment(url, Some(&ep_dir)).await.unwrap();
        assert_eq!(hit, layout.cache_path(&filename));

        // Episode dir wins over the cache.
        fs::create_dir_all(&ep_dir).await.unwrap();
        fs::write(ep_dir.join(&filename), b"data").await.unwrap();
        let hit = layout.locate_segment(url, Some(&ep_dir)).await.unwrap();
        assert_eq!(hit, ep_dir.join(&filename));
    }

    #[tokio::test]
    async fn empty_files_are_not_hits() {
        let tmp = TempDir::new().unwrap();
        let layout = StorageLayout::new(tmp.path().join("downloads"), tmp.path().join("cache"));
        layout.ensure_dirs().await.unwrap();

        let url = "https://h/seg1.ts";
        fs::write(layout.cache_path(&segment_filename(url)), b"")
            .await
            .unwrap();
        assert!(layout.locate_segment(url, None).await.is_none());
    }

    #[tokio::test]
    async fn atomic_write_replaces_content() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("file.json");
        write_atomic(&path, b"one").await.unwrap();
        write_atomic(&path, b"two").await.unwrap();
        assert_eq!(fs::read(&path).await.unwrap(), b"two");
        assert!(!temp_path(&path).exists());
    }
}
