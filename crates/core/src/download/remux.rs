//! Remux finalization: HLS artifacts → a single seekable MP4.
//!
//! ffmpeg is invoked in stream-copy mode only; there is no transcoding
//! anywhere in the backend. The MP4 is written under a staging name
//! and renamed into place, so a player reading the HLS artifacts never
//! observes a half-written file, and segment cleanup happens only
//! after the rename succeeded.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::fs;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::DownloadError;
use crate::playlist;
use crate::store::{write_atomic, INDEX_FILE, LOCAL_INDEX_FILE, MANIFEST_FILE, MP4_FILE};

/// Staging name the MP4 is muxed into before the final rename. Keeps
/// the `.mp4` suffix so ffmpeg picks the right muxer.
const MP4_STAGING_FILE: &str = "episode.partial.mp4";

#[derive(Debug, Clone)]
pub struct Remuxer {
    ffmpeg_path: PathBuf,
}

impl Default for Remuxer {
    fn default() -> Self {
        Self::new()
    }
}

impl Remuxer {
    /// Remuxer using `ffmpeg` from PATH.
    pub fn new() -> Self {
        Self::with_path("ffmpeg")
    }

    pub fn with_path(path: impl Into<PathBuf>) -> Self {
        Self {
            ffmpeg_path: path.into(),
        }
    }

    /// Remuxes a downloaded HLS episode into `episode.mp4`.
    ///
    /// A local playlist referencing the segment files by name keeps
    /// ffmpeg off the network. On success every HLS artifact is
    /// deleted; on failure they are all kept for retry or direct HLS
    /// playback.
    pub async fn remux_playlist(
        &self,
        ep_dir: &Path,
        filenames: &[String],
        token: &CancellationToken,
    ) -> Result<(), DownloadError> {
        let local_index = ep_dir.join(LOCAL_INDEX_FILE);
        write_atomic(
            &local_index,
            playlist::local_vod_playlist(filenames).as_bytes(),
        )
        .await?;
        self.run_ffmpeg(&local_index, ep_dir, token).await?;
        self.cleanup_hls_artifacts(ep_dir, filenames).await;
        Ok(())
    }

    /// Remuxes a single direct-downloaded TS file into `episode.mp4`,
    /// removing the TS on success.
    pub async fn remux_single(
        &self,
        ep_dir: &Path,
        filename: &str,
        token: &CancellationToken,
    ) -> Result<(), DownloadError> {
        let input = ep_dir.join(filename);
        self.run_ffmpeg(&input, ep_dir, token).await?;
        let _ = fs::remove_file(&input).await;
        Ok(())
    }

    /// Maintenance upgrade for an episode that has HLS artifacts but
    /// no MP4 yet: rebuilds the local playlist from the manifest and
    /// remuxes in place.
    pub async fn upgrade_from_manifest(&self, ep_dir: PathBuf) -> Result<(), DownloadError> {
        let data = fs::read(ep_dir.join(MANIFEST_FILE)).await?;
        let filenames: Vec<String> = serde_json::from_slice(&data)
            .map_err(|err| std::io::Error::new(std::io::ErrorKind::InvalidData, err))?;
        let token = CancellationToken::new();
        self.remux_playlist(&ep_dir, &filenames, &token).await
    }

    async fn run_ffmpeg(
        &self,
        input: &Path,
        ep_dir: &Path,
        token: &CancellationToken,
    ) -> Result<(), DownloadError> {
        let staging = ep_dir.join(MP4_STAGING_FILE);
        let mut child = Command::new(&self.ffmpeg_path)
            .arg("-i")
            .arg(input)
            .args(["-c", "copy", "-y"])
            .arg(&staging)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|err| {
                if err.kind() == std::io::ErrorKind::NotFound {
                    DownloadError::FfmpegNotFound {
                        path: self.ffmpeg_path.clone(),
                    }
                } else {
                    DownloadError::Io(err)
                }
            })?;

        let status = tokio::select! {
            _ = token.cancelled() => {
                let _ = child.kill().await;
                let _ = fs::remove_file(&staging).await;
                return Err(DownloadError::Cancelled);
            }
            status = child.wait() => status?,
        };
        if !status.success() {
            let _ = fs::remove_file(&staging).await;
            return Err(DownloadError::RemuxFailed {
                code: status.code(),
            });
        }
        fs::rename(&staging, ep_dir.join(MP4_FILE)).await?;
        Ok(())
    }

    async fn cleanup_hls_artifacts(&self, ep_dir: &Path, filenames: &[String]) {
        debug!(dir = %ep_dir.display(), "removing remuxed HLS artifacts");
        for name in filenames {
            let _ = fs::remove_file(ep_dir.join(name)).await;
        }
        let _ = fs::remove_file(ep_dir.join(INDEX_FILE)).await;
        let _ = fs::remove_file(ep_dir.join(LOCAL_INDEX_FILE)).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn missing_ffmpeg_is_reported_as_such() {
        let tmp = TempDir::new().unwrap();
        let remuxer = Remuxer::with_path(tmp.path().join("no-such-ffmpeg"));
        let filenames = vec!["seg.ts".to_string()];
        let token = CancellationToken::new();

        let err = remuxer
            .remux_playlist(tmp.path(), &filenames, &token)
            .await
            .unwrap_err();
        assert!(matches!(err, DownloadError::FfmpegNotFound { .. }));
        // The local playlist was written before the spawn attempt and
        // must survive the failure.
        assert!(tmp.path().join(LOCAL_INDEX_FILE).exists());
    }

    #[tokio::test]
    async fn failed_remux_keeps_segments() {
        let tmp = TempDir::new().unwrap();
        // `false` exits non-zero without writing anything.
        let remuxer = Remuxer::with_path("false");
        let seg = tmp.path().join("seg.ts");
        fs::write(&seg, b"data").await.unwrap();
        let filenames = vec!["seg.ts".to_string()];
        let token = CancellationToken::new();

        let err = remuxer
            .remux_playlist(tmp.path(), &filenames, &token)
            .await
            .unwrap_err();
        assert!(matches!(err, DownloadError::RemuxFailed { .. }));
        assert!(seg.exists());
        assert!(!tmp.path().join(MP4_FILE).exists());
    }
}
