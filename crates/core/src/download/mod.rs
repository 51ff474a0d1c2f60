//! Concurrent, cancellable episode downloads.
//!
//! A download resolves its stream URL through up to three levels of
//! HLS master playlists, fetches every media segment with bounded
//! parallelism into the episode directory, then hands the result to
//! the remux finalizer. Segments are content-addressed, so anything
//! already present in any storage tier is skipped, and an interrupted
//! download resumes for free on the next attempt.

mod remux;

pub use remux::Remuxer;

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::{mpsc, RwLock, Semaphore};
use tokio::task::JoinSet;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use url::Url;

use crate::events::{emit_download_progress, DownloadProgress, EventSink};
use crate::playlist;
use crate::provider::ResolvedStream;
use crate::store::{
    self, write_atomic, StorageLayout, INDEX_FILE, MANIFEST_FILE, STREAM_METADATA_FILE,
};

/// Concurrent segment fetches per download.
const MAX_PARALLEL_SEGMENTS: usize = 5;
/// Attempts per segment, with linear backoff between them.
const SEGMENT_ATTEMPTS: u32 = 3;
/// Bytes peeked to classify a response as HLS or a direct file.
const PLAYLIST_PEEK_BYTES: usize = 512;

/// Injected when the provider headers carry no User-Agent; several
/// hosts reject non-browser agents.
const DEFAULT_USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 \
                                  (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36";

#[derive(Debug, Error)]
pub enum DownloadError {
    #[error("download already in progress for {key}")]
    AlreadyInProgress { key: String },

    #[error("download cancelled")]
    Cancelled,

    #[error("bad status code: {status}")]
    BadStatus { status: u16 },

    #[error("no segments found")]
    NoSegments,

    #[error("invalid URL: {0}")]
    InvalidUrl(String),

    #[error("ffmpeg not found at {path}")]
    FfmpegNotFound { path: PathBuf },

    #[error("remux failed with exit code {code:?}")]
    RemuxFailed { code: Option<i32> },

    #[error(transparent)]
    Http(#[from] reqwest::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Identity of a download; at most one task may be active per key.
#[derive(Debug, Clone)]
pub struct DownloadJob {
    pub anime_name: String,
    pub episode_number: String,
}

impl DownloadJob {
    pub fn new(anime_name: impl Into<String>, episode_number: impl Into<String>) -> Self {
        Self {
            anime_name: anime_name.into(),
            episode_number: episode_number.into(),
        }
    }

    pub fn key(&self) -> String {
        format!("{}:{}", self.anime_name, self.episode_number)
    }
}

/// Shared state of one in-flight download, handed to segment tasks.
struct SegmentBatch {
    headers: HashMap<String, String>,
    ep_dir: PathBuf,
    key: String,
    job: DownloadJob,
    total: usize,
    completed: AtomicUsize,
    token: CancellationToken,
}

pub struct DownloadManager {
    layout: StorageLayout,
    client: reqwest::Client,
    events: Arc<dyn EventSink>,
    remuxer: Remuxer,
    cancellations: RwLock<HashMap<String, CancellationToken>>,
    progress: RwLock<HashMap<String, u8>>,
}

impl DownloadManager {
    pub fn new(layout: StorageLayout, events: Arc<dyn EventSink>) -> Self {
        Self::with_remuxer(layout, events, Remuxer::new())
    }

    pub fn with_remuxer(layout: StorageLayout, events: Arc<dyn EventSink>, remuxer: Remuxer) -> Self {
        // Downloads can run for hours; the client carries no timeout.
        let client = reqwest::Client::builder()
            .build()
            .expect("Failed to create HTTP client");
        Self {
            layout,
            client,
            events,
            remuxer,
            cancellations: RwLock::new(HashMap::new()),
            progress: RwLock::new(HashMap::new()),
        }
    }

    /// Cancels the download registered under `key`. Returns whether a
    /// download was active.
    pub async fn cancel(&self, key: &str) -> bool {
        match self.cancellations.read().await.get(key) {
            Some(token) => {
                info!(key, "cancelling download");
                token.cancel();
                true
            }
            None => false,
        }
    }

    /// Snapshot of active downloads and their progress percentages.
    pub async fn active(&self) -> HashMap<String, u8> {
        self.progress.read().await.clone()
    }

    /// Downloads one episode from an already-resolved stream.
    ///
    /// Fails fast with [`DownloadError::AlreadyInProgress`] when the
    /// key is taken; otherwise the cancellation token and progress
    /// entry live exactly as long as this call.
    pub async fn download(
        self: &Arc<Self>,
        job: DownloadJob,
        resolved: ResolvedStream,
    ) -> Result<(), DownloadError> {
        let key = job.key();
        let token = CancellationToken::new();
        {
            let mut cancellations = self.cancellations.write().await;
            if cancellations.contains_key(&key) {
                return Err(DownloadError::AlreadyInProgress { key });
            }
            cancellations.insert(key.clone(), token.clone());
        }

        info!(key, url = %resolved.url, "starting download");
        self.report_progress(&key, &job, 0).await;

        let result = self.run(&job, &key, &resolved, &token).await;

        self.cancellations.write().await.remove(&key);
        self.progress.write().await.remove(&key);

        match &result {
            Ok(()) => info!(key, "download finished"),
            Err(DownloadError::Cancelled) => info!(key, "download cancelled"),
            Err(err) => error!(key, error = %err, "download failed"),
        }
        result
    }

    async fn run(
        self: &Arc<Self>,
        job: &DownloadJob,
        key: &str,
        resolved: &ResolvedStream,
        token: &CancellationToken,
    ) -> Result<(), DownloadError> {
        let ep_dir = self.layout.episode_dir(&job.anime_name, &job.episode_number);
        fs::create_dir_all(&ep_dir).await?;

        let (media_url, raw_playlist, segment_urls) =
            self.collect_segments(key, resolved, token).await?;
        let total = segment_urls.len();
        info!(key, segments = total, "collected segment list");

        let batch = Arc::new(SegmentBatch {
            headers: resolved.headers.clone(),
            ep_dir: ep_dir.clone(),
            key: key.to_string(),
            job: job.clone(),
            total,
            completed: AtomicUsize::new(0),
            token: token.clone(),
        });

        let semaphore = Arc::new(Semaphore::new(MAX_PARALLEL_SEGMENTS));
        // Single-slot channel: the first failure wins, later ones are
        // downstream consequences and get dropped.
        let (error_tx, mut error_rx) = mpsc::channel::<DownloadError>(1);
        let mut tasks = JoinSet::new();

        for url in &segment_urls {
            if token.is_cancelled() {
                return Err(DownloadError::Cancelled);
            }
            let manager = Arc::clone(self);
            let batch = Arc::clone(&batch);
            let semaphore = Arc::clone(&semaphore);
            let error_tx = error_tx.clone();
            let url = url.clone();
            tasks.spawn(async move {
                let _permit = match semaphore.acquire_owned().await {
                    Ok(permit) => permit,
                    Err(_) => return,
                };
                match manager.fetch_segment(&batch, &url).await {
                    Ok(()) => {
                        let done = batch.completed.fetch_add(1, Ordering::SeqCst) + 1;
                        let percent = (done * 100 / batch.total) as u8;
                        manager.report_progress(&batch.key, &batch.job, percent).await;
                    }
                    Err(err) => {
                        let _ = error_tx.try_send(err);
                    }
                }
            });
        }
        drop(error_tx);
        while tasks.join_next().await.is_some() {}

        if let Ok(err) = error_rx.try_recv() {
            return Err(err);
        }

        let filenames: Vec<String> = segment_urls
            .iter()
            .map(|url| store::segment_filename(url))
            .collect();
        self.finalize(
            key,
            &ep_dir,
            raw_playlist.as_deref(),
            &filenames,
            &media_url,
            &resolved.headers,
            token,
        )
        .await
    }

    /// Follows the stream URL down to a media playlist (or a direct
    /// file) and returns the media-level URL, the raw playlist text
    /// and the absolute segment URLs.
    async fn collect_segments(
        &self,
        key: &str,
        resolved: &ResolvedStream,
        token: &CancellationToken,
    ) -> Result<(String, Option<String>, Vec<String>), DownloadError> {
        let mut stream_url = resolved.url.clone();
        let mut raw_playlist = None;
        let mut segment_urls = Vec::new();

        for level in 0..playlist::MAX_PLAYLIST_DEPTH {
            debug!(key, level, url = %stream_url, "fetching playlist or stream");
            let mut response = self
                .get_with_headers(&stream_url, &resolved.headers, token)
                .await?;

            let mut body: Vec<u8> = Vec::new();
            while body.len() < PLAYLIST_PEEK_BYTES {
                match self.next_chunk(&mut response, token).await? {
                    Some(chunk) => body.extend_from_slice(&chunk),
                    None => break,
                }
            }
            let looks_like_hls = {
                let head = String::from_utf8_lossy(&body[..body.len().min(PLAYLIST_PEEK_BYTES)]);
                head.trim_start().starts_with("#EXTM3U")
            };
            if !looks_like_hls {
                if level == 0 {
                    info!(key, "direct download detected (not HLS)");
                    segment_urls.push(stream_url.clone());
                    break;
                }
                warn!(key, level, "variant is not a valid HLS playlist");
            }

            while let Some(chunk) = self.next_chunk(&mut response, token).await? {
                body.extend_from_slice(&chunk);
            }
            let content = String::from_utf8_lossy(&body).into_owned();

            if playlist::is_master(&content) {
                if let Some(variant) = playlist::select_variant(&content) {
                    stream_url = playlist::resolve_url(&stream_url, variant)
                        .ok_or_else(|| DownloadError::InvalidUrl(variant.to_string()))?;
                    info!(key, url = %stream_url, "selected highest-bandwidth variant");
                    continue;
                }
            }

            let base = Url::parse(&stream_url)
                .map_err(|_| DownloadError::InvalidUrl(stream_url.clone()))?;
            for line in playlist::media_segment_lines(&content) {
                if let Ok(absolute) = base.join(line) {
                    segment_urls.push(absolute.to_string());
                }
            }
            raw_playlist = Some(content);
            break;
        }

        if segment_urls.is_empty() {
            return Err(DownloadError::NoSegments);
        }
        Ok((stream_url, raw_playlist, segment_urls))
    }

    /// Fetches one segment into the episode directory, skipping the
    /// network entirely when any storage tier already has it.
    async fn fetch_segment(&self, batch: &SegmentBatch, url: &str) -> Result<(), DownloadError> {
        if self
            .layout
            .locate_segment(url, Some(&batch.ep_dir))
            .await
            .is_some()
        {
            return Ok(());
        }
        let dest = batch.ep_dir.join(store::segment_filename(url));

        for attempt in 1..=SEGMENT_ATTEMPTS {
            if attempt > 1 {
                debug!(url, attempt, "retrying segment download");
                let backoff = Duration::from_secs(u64::from(attempt - 1));
                tokio::select! {
                    _ = batch.token.cancelled() => return Err(DownloadError::Cancelled),
                    _ = sleep(backoff) => {}
                }
            }
            match self.try_fetch_segment(batch, url, &dest).await {
                Ok(()) => return Ok(()),
                Err(DownloadError::Cancelled) => return Err(DownloadError::Cancelled),
                Err(err) if attempt == SEGMENT_ATTEMPTS => return Err(err),
                Err(err) => warn!(url, attempt, error = %err, "segment download failed"),
            }
        }
        unreachable!("retry loop always returns on the final attempt")
    }

    async fn try_fetch_segment(
        &self,
        batch: &SegmentBatch,
        url: &str,
        dest: &Path,
    ) -> Result<(), DownloadError> {
        let mut response = self
            .get_with_headers(url, &batch.headers, &batch.token)
            .await?;
        let total_bytes = response.content_length();

        // Write to a temp name; the segment becomes visible to the
        // proxy and to dedup checks only once complete.
        let tmp = store::temp_path(dest);
        let mut file = fs::File::create(&tmp).await?;
        let result: Result<(), DownloadError> = async {
            let mut downloaded: u64 = 0;
            while let Some(chunk) = self.next_chunk(&mut response, &batch.token).await? {
                file.write_all(&chunk).await?;
                downloaded += chunk.len() as u64;
                if batch.total == 1 {
                    if let Some(total) = total_bytes.filter(|total| *total > 0) {
                        let percent = ((downloaded as f64 / total as f64) * 100.0) as u8;
                        self.report_progress_changed(&batch.key, &batch.job, percent.min(100))
                            .await;
                    }
                }
            }
            file.flush().await?;
            Ok(())
        }
        .await;
        drop(file);

        if let Err(err) = result {
            let _ = fs::remove_file(&tmp).await;
            return Err(err);
        }
        fs::rename(&tmp, dest).await?;
        Ok(())
    }

    /// Persists the playlist artifacts, runs the remux and records the
    /// manifest and stream metadata. A failed remux is logged and the
    /// HLS artifacts kept; the episode stays playable via the proxy.
    #[allow(clippy::too_many_arguments)]
    async fn finalize(
        &self,
        key: &str,
        ep_dir: &Path,
        raw_playlist: Option<&str>,
        filenames: &[String],
        media_url: &str,
        headers: &HashMap<String, String>,
        token: &CancellationToken,
    ) -> Result<(), DownloadError> {
        if let Some(raw) = raw_playlist {
            if let Err(err) = write_atomic(&ep_dir.join(INDEX_FILE), raw.as_bytes()).await {
                warn!(key, error = %err, "failed to persist upstream playlist");
            }
            info!(key, "remuxing HLS download to MP4");
            match self.remuxer.remux_playlist(ep_dir, filenames, token).await {
                Ok(()) => info!(key, "remux complete"),
                Err(DownloadError::Cancelled) => return Err(DownloadError::Cancelled),
                Err(err) => warn!(key, error = %err, "remux failed, keeping HLS artifacts"),
            }
        } else if filenames.len() == 1 && filenames[0].to_lowercase().ends_with(".ts") {
            info!(key, "remuxing single TS download to MP4");
            match self.remuxer.remux_single(ep_dir, &filenames[0], token).await {
                Ok(()) => info!(key, "remux complete"),
                Err(DownloadError::Cancelled) => return Err(DownloadError::Cancelled),
                Err(err) => warn!(key, error = %err, "remux failed, keeping TS file"),
            }
        }

        // Written regardless of the remux outcome: the manifest drives
        // deletion and the background upgrade, the stream metadata
        // makes the episode resolvable offline.
        match serde_json::to_vec(filenames) {
            Ok(data) => {
                if let Err(err) = write_atomic(&ep_dir.join(MANIFEST_FILE), &data).await {
                    warn!(key, error = %err, "failed to write manifest");
                }
            }
            Err(err) => warn!(key, error = %err, "failed to serialize manifest"),
        }
        let metadata = ResolvedStream {
            url: media_url.to_string(),
            headers: headers.clone(),
        };
        match serde_json::to_vec(&metadata) {
            Ok(data) => {
                if let Err(err) = write_atomic(&ep_dir.join(STREAM_METADATA_FILE), &data).await {
                    warn!(key, error = %err, "failed to write stream metadata");
                }
            }
            Err(err) => warn!(key, error = %err, "failed to serialize stream metadata"),
        }
        Ok(())
    }

    async fn next_chunk(
        &self,
        response: &mut reqwest::Response,
        token: &CancellationToken,
    ) -> Result<Option<bytes::Bytes>, DownloadError> {
        tokio::select! {
            _ = token.cancelled() => Err(DownloadError::Cancelled),
            chunk = response.chunk() => Ok(chunk?),
        }
    }

    async fn get_with_headers(
        &self,
        url: &str,
        headers: &HashMap<String, String>,
        token: &CancellationToken,
    ) -> Result<reqwest::Response, DownloadError> {
        let mut request = self.client.get(url);
        for (name, value) in headers {
            request = request.header(name.as_str(), value.as_str());
        }
        if !headers.keys().any(|name| name.eq_ignore_ascii_case("user-agent")) {
            request = request.header(reqwest::header::USER_AGENT, DEFAULT_USER_AGENT);
        }
        let response = tokio::select! {
            _ = token.cancelled() => return Err(DownloadError::Cancelled),
            response = request.send() => response?,
        };
        if response.status() != reqwest::StatusCode::OK {
            return Err(DownloadError::BadStatus {
                status: response.status().as_u16(),
            });
        }
        Ok(response)
    }

    async fn report_progress(&self, key: &str, job: &DownloadJob, progress: u8) {
        self.progress.write().await.insert(key.to_string(), progress);
        self.emit_progress(key, job, progress);
    }

    /// Like [`Self::report_progress`] but suppresses duplicate
    /// percentages; byte-level reporting would otherwise flood the bus.
    async fn report_progress_changed(&self, key: &str, job: &DownloadJob, progress: u8) {
        {
            let mut map = self.progress.write().await;
            if map.get(key) == Some(&progress) {
                return;
            }
            map.insert(key.to_string(), progress);
        }
        self.emit_progress(key, job, progress);
    }

    fn emit_progress(&self, key: &str, job: &DownloadJob, progress: u8) {
        emit_download_progress(
            self.events.as_ref(),
            &DownloadProgress {
                key: key.to_string(),
                anime_name: job.anime_name.clone(),
                episode: job.episode_number.clone(),
                progress,
            },
        );
    }
}
