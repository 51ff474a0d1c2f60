//! Proxy tests over a real loopback listener, with an in-process axum
//! server standing in for upstream.

use axum::body::Bytes;
use axum::http::header;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

use hikari_core::events::NullSink;
use hikari_core::store::{self, StorageLayout, INDEX_FILE, MP4_FILE};
use hikari_server::proxy::ProxyServer;
use hikari_server::registry::{StreamEntry, StreamRegistry};

struct Fixture {
    _tmp: TempDir,
    layout: StorageLayout,
    registry: Arc<StreamRegistry>,
    proxy: ProxyServer,
    client: reqwest::Client,
}

impl Fixture {
    async fn new() -> Self {
        let tmp = TempDir::new().unwrap();
        let layout = StorageLayout::new(tmp.path().join("downloads"), tmp.path().join("cache"));
        layout.ensure_dirs().await.unwrap();
        let registry = Arc::new(StreamRegistry::new());
        let proxy = ProxyServer::start(
            Arc::clone(&registry),
            layout.clone(),
            Arc::new(NullSink),
            0,
        )
        .await
        .unwrap();
        Self {
            _tmp: tmp,
            layout,
            registry,
            proxy,
            client: reqwest::Client::new(),
        }
    }

    fn proxy_url(&self, id: &str) -> String {
        format!("http://127.0.0.1:{}/proxy?id={}", self.proxy.port(), id)
    }

    fn proxy_url_for(&self, id: &str, target: &str) -> String {
        format!(
            "http://127.0.0.1:{}/proxy?id={}&url={}",
            self.proxy.port(),
            id,
            urlencoding::encode(target)
        )
    }
}

fn entry(url: &str) -> StreamEntry {
    StreamEntry {
        upstream_url: url.to_string(),
        headers: HashMap::new(),
        anime_name: "Show".into(),
        episode_number: "1".into(),
        is_hls: true,
    }
}

async fn spawn_upstream(app: Router) -> SocketAddr {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    addr
}

#[tokio::test]
async fn unknown_stream_id_is_404() {
    let fixture = Fixture::new().await;
    let response = fixture
        .client
        .get(fixture.proxy_url("no-such-id"))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 404);
}

#[tokio::test]
async fn local_playlist_is_served_and_rewritten_without_upstream() {
    let fixture = Fixture::new().await;
    // The upstream host does not exist; any network attempt would 502.
    let id = fixture.registry.register(entry("https://h/m.m3u8")).await;

    let ep_dir = fixture.layout.episode_dir("Show", "1");
    tokio::fs::create_dir_all(&ep_dir).await.unwrap();
    tokio::fs::write(
        ep_dir.join(INDEX_FILE),
        "#EXTM3U\n#EXTINF:10.0,\nseg.ts\n#EXT-X-ENDLIST\n",
    )
    .await
    .unwrap();

    let response = fixture
        .client
        .get(fixture.proxy_url(&id))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    let body = response.text().await.unwrap();
    assert!(
        body.contains(&format!(
            "http://127.0.0.1:{}/proxy?id={}&url=https%3A%2F%2Fh%2Fseg.ts",
            fixture.proxy.port(),
            id
        )),
        "unexpected rewrite: {body}"
    );
    assert!(body.contains("#EXTINF:10.0,"));
}

#[tokio::test]
async fn segment_is_cached_on_first_fetch_and_served_locally_after() {
    let hits = Arc::new(AtomicUsize::new(0));
    let upstream_hits = Arc::clone(&hits);
    let app = Router::new().route(
        "/seg.ts",
        get(move || {
            let hits = Arc::clone(&upstream_hits);
            async move {
                hits.fetch_add(1, Ordering::SeqCst);
                ([(header::CONTENT_TYPE, "video/mp2t")], Bytes::from(vec![0x47u8; 2048]))
            }
        }),
    );
    let addr = spawn_upstream(app).await;

    let fixture = Fixture::new().await;
    let id = fixture
        .registry
        .register(entry(&format!("http://{addr}/m.m3u8")))
        .await;
    let segment_url = format!("http://{addr}/seg.ts");

    let body = fixture
        .client
        .get(fixture.proxy_url_for(&id, &segment_url))
        .send()
        .await
        .unwrap()
        .bytes()
        .await
        .unwrap();
    assert_eq!(body.len(), 2048);
    assert_eq!(hits.load(Ordering::SeqCst), 1);

    // The cache file is published asynchronously after the body is
    // fully relayed; wait for it.
    let cache_path = fixture
        .layout
        .cache_path(&store::segment_filename(&segment_url));
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !store::file_nonempty(&cache_path).await {
        assert!(
            tokio::time::Instant::now() < deadline,
            "cache file never appeared"
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    let body = fixture
        .client
        .get(fixture.proxy_url_for(&id, &segment_url))
        .send()
        .await
        .unwrap()
        .bytes()
        .await
        .unwrap();
    assert_eq!(body.len(), 2048);
    assert_eq!(hits.load(Ordering::SeqCst), 1, "second request hit upstream");
}

#[tokio::test]
async fn remuxed_mp4_supports_range_requests() {
    let fixture = Fixture::new().await;
    let id = fixture.registry.register(entry("https://h/m.m3u8")).await;

    let ep_dir = fixture.layout.episode_dir("Show", "1");
    tokio::fs::create_dir_all(&ep_dir).await.unwrap();
    let content: Vec<u8> = (0u8..100).collect();
    tokio::fs::write(ep_dir.join(MP4_FILE), &content).await.unwrap();

    let response = fixture
        .client
        .get(fixture.proxy_url(&id))
        .header(header::RANGE, "bytes=10-19")
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 206);
    assert!(response.headers().contains_key(header::CONTENT_RANGE));
    let body = response.bytes().await.unwrap();
    assert_eq!(body.as_ref(), &content[10..20]);
}

#[tokio::test]
async fn upstream_playlist_is_rewritten_with_caching_disabled() {
    let app = Router::new().route(
        "/media.m3u8",
        get(|| async {
            (
                [(header::CONTENT_TYPE, "application/vnd.apple.mpegurl")],
                "#EXTM3U\n#EXTINF:4.0,\nseg0.ts\n#EXT-X-ENDLIST\n",
            )
                .into_response()
        }),
    );
    let addr = spawn_upstream(app).await;

    let fixture = Fixture::new().await;
    let upstream = format!("http://{addr}/media.m3u8");
    let id = fixture.registry.register(entry(&upstream)).await;

    let response = fixture
        .client
        .get(fixture.proxy_url(&id))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    assert_eq!(
        response.headers().get(header::CACHE_CONTROL).unwrap(),
        "no-cache, no-store, must-revalidate"
    );
    let body = response.text().await.unwrap();
    let expected_segment = format!("http://{addr}/seg0.ts");
    assert!(body.contains(&format!(
        "/proxy?id={}&url={}",
        id,
        urlencoding::encode(&expected_segment)
    )));
}

#[tokio::test]
async fn unreachable_upstream_is_502() {
    let fixture = Fixture::new().await;
    // Nothing listens on port 1.
    let id = fixture.registry.register(entry("http://127.0.0.1:1/m.m3u8")).await;
    let response = fixture
        .client
        .get(fixture.proxy_url_for(&id, "http://127.0.0.1:1/seg.ts"))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 502);
}
