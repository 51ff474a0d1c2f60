//! Loopback stream proxy.
//!
//! A single `GET /proxy?id=<id>[&url=<absolute>]` endpoint gives the
//! UI's video element one stable URL per stream regardless of where
//! the bytes actually live. Requests are answered from the per-episode
//! download directory first, then the transient cache, and only then
//! from upstream; playlists are rewritten on the way through so every
//! child URL loops back here.

use axum::body::Body;
use axum::extract::{Query, State};
use axum::http::{header, HeaderMap, HeaderName, HeaderValue, Request, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use bytes::Bytes;
use serde::Deserialize;
use std::net::{Ipv4Addr, SocketAddr};
use std::path::Path;
use std::sync::Arc;
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::ReceiverStream;
use tower::ServiceExt;
use tower_http::services::ServeFile;
use tracing::{debug, error, info, warn};
use url::Url;

use hikari_core::events::{emit_proxy_log, EventSink};
use hikari_core::store::{self, StorageLayout, INDEX_FILE, MP4_FILE};

use crate::registry::StreamRegistry;

/// Response headers never copied from upstream; caching is overridden
/// and the length changes whenever a playlist is rewritten.
const STRIPPED_HEADERS: [HeaderName; 5] = [
    header::CONTENT_LENGTH,
    header::CACHE_CONTROL,
    header::PRAGMA,
    header::EXPIRES,
    header::ETAG,
];

#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("stream not found")]
    UnknownStream,
    #[error("failed to fetch upstream")]
    Upstream,
    #[error("internal proxy error")]
    Internal,
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl IntoResponse for ProxyError {
    fn into_response(self) -> Response {
        let status = match &self {
            ProxyError::UnknownStream => StatusCode::NOT_FOUND,
            ProxyError::Upstream => StatusCode::BAD_GATEWAY,
            ProxyError::Internal | ProxyError::Io(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        (status, self.to_string()).into_response()
    }
}

/// Shared state of the proxy handler.
pub struct ProxyContext {
    registry: Arc<StreamRegistry>,
    layout: StorageLayout,
    client: reqwest::Client,
    events: Arc<dyn EventSink>,
    port: u16,
}

impl ProxyContext {
    pub fn new(
        registry: Arc<StreamRegistry>,
        layout: StorageLayout,
        client: reqwest::Client,
        events: Arc<dyn EventSink>,
        port: u16,
    ) -> Self {
        Self {
            registry,
            layout,
            client,
            events,
            port,
        }
    }
}

pub fn router(ctx: Arc<ProxyContext>) -> Router {
    Router::new()
        .route("/proxy", get(proxy_handler))
        .with_state(ctx)
}

/// A running proxy bound to `127.0.0.1`.
pub struct ProxyServer {
    addr: SocketAddr,
    handle: JoinHandle<()>,
}

impl ProxyServer {
    /// Binds the proxy and starts serving in the background. Pass port
    /// `0` to let the OS pick one; the bound address is reported back.
    pub async fn start(
        registry: Arc<StreamRegistry>,
        layout: StorageLayout,
        events: Arc<dyn EventSink>,
        port: u16,
    ) -> std::io::Result<Self> {
        let listener = TcpListener::bind(SocketAddr::from((Ipv4Addr::LOCALHOST, port))).await?;
        let addr = listener.local_addr()?;
        // Streams and segments can be arbitrarily large and slow; the
        // upstream client carries no timeout.
        let client = reqwest::Client::builder()
            .build()
            .expect("Failed to create HTTP client");
        let ctx = Arc::new(ProxyContext::new(
            registry,
            layout,
            client,
            events,
            addr.port(),
        ));
        let app = router(ctx);
        info!(%addr, "stream proxy listening");
        let handle = tokio::spawn(async move {
            if let Err(err) = axum::serve(listener, app).await {
                error!(error = %err, "proxy server error");
            }
        });
        Ok(Self { addr, handle })
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    pub fn shutdown(&self) {
        self.handle.abort();
    }
}

#[derive(Debug, Deserialize)]
struct ProxyQuery {
    id: String,
    url: Option<String>,
}

async fn proxy_handler(
    State(ctx): State<Arc<ProxyContext>>,
    Query(query): Query<ProxyQuery>,
    headers: HeaderMap,
) -> Response {
    match handle(ctx, query, headers).await {
        Ok(response) => response,
        Err(err) => err.into_response(),
    }
}

async fn handle(
    ctx: Arc<ProxyContext>,
    query: ProxyQuery,
    request_headers: HeaderMap,
) -> Result<Response, ProxyError> {
    let entry = ctx
        .registry
        .get(&query.id)
        .await
        .ok_or(ProxyError::UnknownStream)?;
    let range = request_headers.get(header::RANGE).cloned();

    // Root-of-stream request: prefer the finalized MP4, then the local
    // playlist.
    if query.url.is_none() {
        let ep_dir = ctx
            .layout
            .episode_dir(&entry.anime_name, &entry.episode_number);
        let mp4 = ep_dir.join(MP4_FILE);
        if store::file_nonempty(&mp4).await {
            info!(id = %query.id, "serving remuxed MP4");
            emit_proxy_log(
                ctx.events.as_ref(),
                format!(
                    "Serving remuxed MP4 for {} - Ep {}",
                    entry.anime_name, entry.episode_number
                ),
            );
            return serve_ranged_file(&mp4, range).await;
        }
        let index = ep_dir.join(INDEX_FILE);
        if let Ok(content) = fs::read_to_string(&index).await {
            info!(id = %query.id, "serving local playlist");
            emit_proxy_log(
                ctx.events.as_ref(),
                format!(
                    "Serving local playlist for {} - Ep {}",
                    entry.anime_name, entry.episode_number
                ),
            );
            return Ok(playlist_response(rewrite_playlist(
                &content,
                &entry.upstream_url,
                &query.id,
                ctx.port,
            )));
        }
    }

    let target = query
        .url
        .clone()
        .unwrap_or_else(|| entry.upstream_url.clone());
    let ext = store::url_extension(&target);
    let is_media = store::is_media_extension(&ext);

    if is_media {
        // The stream root keeps its well-known name so downloads and
        // playback address the same file.
        let filename = if ext == ".m3u8" && target == entry.upstream_url {
            INDEX_FILE.to_string()
        } else {
            store::segment_filename(&target)
        };

        if !entry.anime_name.is_empty() && !entry.episode_number.is_empty() {
            let local = ctx
                .layout
                .episode_dir(&entry.anime_name, &entry.episode_number)
                .join(&filename);
            if store::file_nonempty(&local).await {
                if ext == ".m3u8" {
                    if let Ok(content) = fs::read_to_string(&local).await {
                        emit_proxy_log(
                            ctx.events.as_ref(),
                            format!("Serving local playlist from persistent storage: {filename}"),
                        );
                        return Ok(playlist_response(rewrite_playlist(
                            &content, &target, &query.id, ctx.port,
                        )));
                    }
                } else {
                    emit_proxy_log(
                        ctx.events.as_ref(),
                        format!("Serving persistent local file: {filename}"),
                    );
                    return serve_ranged_file(&local, range).await;
                }
            }
        }

        let cached = ctx.layout.cache_path(&filename);
        if store::file_nonempty(&cached).await {
            emit_proxy_log(
                ctx.events.as_ref(),
                format!("Serving cached segment: {filename}"),
            );
            return serve_ranged_file(&cached, range).await;
        }
        debug!(filename, target, "no local copy, fetching upstream");
    }

    fetch_upstream(ctx, &entry.headers, &query.id, target, is_media, range).await
}

async fn fetch_upstream(
    ctx: Arc<ProxyContext>,
    upstream_headers: &std::collections::HashMap<String, String>,
    id: &str,
    target: String,
    is_media: bool,
    range: Option<HeaderValue>,
) -> Result<Response, ProxyError> {
    emit_proxy_log(ctx.events.as_ref(), format!("Proxying stream: {target}"));

    let mut request = ctx.client.get(&target);
    for (name, value) in upstream_headers {
        request = request.header(name.as_str(), value.as_str());
    }
    if let Some(range) = &range {
        request = request.header(header::RANGE, range);
    }
    let response = request.send().await.map_err(|err| {
        warn!(target, error = %err, "upstream fetch failed");
        ProxyError::Upstream
    })?;

    let status =
        StatusCode::from_u16(response.status().as_u16()).unwrap_or(StatusCode::BAD_GATEWAY);
    let response_headers = response.headers().clone();
    let content_type = response_headers
        .get(header::CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .unwrap_or("")
        .to_ascii_lowercase();
    let is_playlist = content_type.contains("mpegurl")
        || content_type.contains("m3u8")
        || target.ends_with(".m3u8")
        || target.ends_with(".m3u");

    if is_playlist {
        let body = response.text().await.map_err(|err| {
            warn!(target, error = %err, "failed to read playlist body");
            ProxyError::Upstream
        })?;
        let rewritten = rewrite_playlist(&body, &target, id, ctx.port);
        return build_response(status, &response_headers, Body::from(rewritten));
    }

    if is_media {
        let cache_path = ctx.layout.cache_path(&store::segment_filename(&target));
        return tee_to_cache(&ctx, response, status, &response_headers, cache_path).await;
    }

    build_response(status, &response_headers, relay_body(response))
}

/// Streams the upstream body to the client while writing it into the
/// transient cache. The cache file is published via rename only after
/// the full body arrived; any error discards the partial file.
async fn tee_to_cache(
    ctx: &ProxyContext,
    mut response: reqwest::Response,
    status: StatusCode,
    response_headers: &HeaderMap,
    cache_path: std::path::PathBuf,
) -> Result<Response, ProxyError> {
    let tmp = store::temp_path(&cache_path);
    let mut file = match fs::File::create(&tmp).await {
        Ok(file) => file,
        Err(err) => {
            warn!(path = %tmp.display(), error = %err, "failed to create cache file");
            emit_proxy_log(
                ctx.events.as_ref(),
                format!("Failed to create cache file: {err}"),
            );
            return build_response(status, response_headers, relay_body(response));
        }
    };

    let (tx, rx) = mpsc::channel::<Result<Bytes, std::io::Error>>(8);
    tokio::spawn(async move {
        let mut failed = false;
        loop {
            match response.chunk().await {
                Ok(Some(chunk)) => {
                    if file.write_all(&chunk).await.is_err() || tx.send(Ok(chunk)).await.is_err() {
                        failed = true;
                        break;
                    }
                }
                Ok(None) => break,
                Err(err) => {
                    failed = true;
                    let _ = tx.send(Err(std::io::Error::other(err))).await;
                    break;
                }
            }
        }
        if !failed && file.flush().await.is_err() {
            failed = true;
        }
        drop(file);
        if failed {
            let _ = fs::remove_file(&tmp).await;
        } else if let Err(err) = fs::rename(&tmp, &cache_path).await {
            warn!(error = %err, "failed to publish cache file");
            let _ = fs::remove_file(&tmp).await;
        } else {
            debug!(path = %cache_path.display(), "cached segment");
        }
    });

    build_response(
        status,
        response_headers,
        Body::from_stream(ReceiverStream::new(rx)),
    )
}

/// Pipes an upstream body through without caching it.
fn relay_body(mut response: reqwest::Response) -> Body {
    let (tx, rx) = mpsc::channel::<Result<Bytes, std::io::Error>>(8);
    tokio::spawn(async move {
        loop {
            match response.chunk().await {
                Ok(Some(chunk)) => {
                    if tx.send(Ok(chunk)).await.is_err() {
                        break;
                    }
                }
                Ok(None) => break,
                Err(err) => {
                    let _ = tx.send(Err(std::io::Error::other(err))).await;
                    break;
                }
            }
        }
    });
    Body::from_stream(ReceiverStream::new(rx))
}

fn build_response(
    status: StatusCode,
    upstream_headers: &HeaderMap,
    body: Body,
) -> Result<Response, ProxyError> {
    let mut builder = Response::builder().status(status);
    for (name, value) in upstream_headers {
        if STRIPPED_HEADERS.contains(name) {
            continue;
        }
        builder = builder.header(name, value);
    }
    builder
        .header(header::CACHE_CONTROL, "no-cache, no-store, must-revalidate")
        .header(header::PRAGMA, "no-cache")
        .header(header::EXPIRES, "0")
        .body(body)
        .map_err(|_| ProxyError::Internal)
}

/// Serves a local file with full `Range` support.
async fn serve_ranged_file(
    path: &Path,
    range: Option<HeaderValue>,
) -> Result<Response, ProxyError> {
    let mut builder = Request::builder().uri("/");
    if let Some(range) = range {
        builder = builder.header(header::RANGE, range);
    }
    let request = builder
        .body(Body::empty())
        .map_err(|_| ProxyError::Internal)?;
    match ServeFile::new(path).oneshot(request).await {
        Ok(response) => Ok(response.map(Body::new)),
        Err(infallible) => match infallible {},
    }
}

fn playlist_response(content: String) -> Response {
    (
        [(header::CONTENT_TYPE, "application/vnd.apple.mpegurl")],
        content,
    )
        .into_response()
}

/// Rewrites every URI line of a playlist to loop back through the
/// proxy, resolving relative references against `base_url` first.
///
/// Comment and blank lines pass through verbatim, as do URIs that
/// already address this proxy; rewriting is idempotent.
pub fn rewrite_playlist(content: &str, base_url: &str, id: &str, port: u16) -> String {
    let base = match Url::parse(base_url) {
        Ok(base) => base,
        Err(err) => {
            warn!(base_url, error = %err, "unparseable playlist base URL");
            return content.to_string();
        }
    };

    let mut lines = Vec::new();
    for line in content.lines() {
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            lines.push(line.to_string());
            continue;
        }
        let absolute = match base.join(trimmed) {
            Ok(url) => url,
            Err(_) => {
                lines.push(line.to_string());
                continue;
            }
        };
        if is_own_proxy_url(&absolute, port) {
            lines.push(line.to_string());
            continue;
        }
        lines.push(format!(
            "http://127.0.0.1:{port}/proxy?id={id}&url={}",
            urlencoding::encode(absolute.as_str())
        ));
    }
    lines.join("\n")
}

fn is_own_proxy_url(url: &Url, port: u16) -> bool {
    url.host_str() == Some("127.0.0.1") && url.port() == Some(port) && url.path() == "/proxy"
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rewrites_relative_uris_against_base() {
        let playlist = "#EXTM3U\n#EXTINF:4.0,\nseg.ts\n#EXT-X-ENDLIST";
        let rewritten = rewrite_playlist(playlist, "https://h/m.m3u8", "x", 4000);
        assert_eq!(
            rewritten,
            "#EXTM3U\n#EXTINF:4.0,\n\
             http://127.0.0.1:4000/proxy?id=x&url=https%3A%2F%2Fh%2Fseg.ts\n\
             #EXT-X-ENDLIST"
        );
    }

    #[test]
    fn preserves_comments_and_blank_lines() {
        let playlist = "#EXTM3U\n\n# a comment\nhttps://cdn/seg.ts\n";
        let rewritten = rewrite_playlist(playlist, "https://h/m.m3u8", "x", 4000);
        let lines: Vec<_> = rewritten.lines().collect();
        assert_eq!(lines[0], "#EXTM3U");
        assert_eq!(lines[1], "");
        assert_eq!(lines[2], "# a comment");
        assert!(lines[3].starts_with("http://127.0.0.1:4000/proxy?id=x&url="));
    }

    #[test]
    fn rewrite_is_idempotent() {
        let playlist = "#EXTM3U\nseg.ts\n#EXT-X-ENDLIST";
        let once = rewrite_playlist(playlist, "https://h/m.m3u8", "x", 4000);
        let twice = rewrite_playlist(&once, "https://h/m.m3u8", "x", 4000);
        assert_eq!(once, twice);
    }

    #[test]
    fn foreign_proxy_urls_are_still_rewritten() {
        // Another port on loopback is not this proxy.
        let playlist = "http://127.0.0.1:9999/proxy?id=y&url=abc";
        let rewritten = rewrite_playlist(playlist, "https://h/m.m3u8", "x", 4000);
        assert!(rewritten.starts_with("http://127.0.0.1:4000/proxy?id=x&url="));
    }
}
