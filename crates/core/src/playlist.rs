//! Line-level HLS playlist handling.
//!
//! The proxy and the downloader both need to preserve playlists
//! byte-for-byte (comments, blank lines, ordering), so parsing stays at
//! the line level instead of going through a structured playlist model.

/// Maximum number of master-playlist indirections followed before
/// giving up.
pub const MAX_PLAYLIST_DEPTH: usize = 3;

/// A playlist containing `#EXT-X-STREAM-INF` entries is a master
/// playlist; anything else is treated as a media playlist.
pub fn is_master(content: &str) -> bool {
    content.contains("#EXT-X-STREAM-INF")
}

/// Whether a URL looks like an HLS playlist.
pub fn looks_like_hls(url: &str) -> bool {
    url.to_lowercase().contains(".m3u8")
}

/// Picks the variant URI with the highest `BANDWIDTH` from a master
/// playlist.
///
/// Each `#EXT-X-STREAM-INF:` tag's `BANDWIDTH` attribute applies to the
/// next non-comment, non-empty line. Ties resolve to the later
/// occurrence (the comparison is `>=`); callers must not "fix" this.
pub fn select_variant(master: &str) -> Option<&str> {
    let mut best: Option<&str> = None;
    let mut max_bandwidth: u64 = 0;
    let mut current_bandwidth: u64 = 0;

    for line in master.lines() {
        let line = line.trim();
        if let Some(attrs) = line.strip_prefix("#EXT-X-STREAM-INF:") {
            if let Some(value) = attrs
                .split(',')
                .map(str::trim)
                .find_map(|part| part.strip_prefix("BANDWIDTH="))
            {
                current_bandwidth = value.parse().unwrap_or(0);
            }
        } else if !line.is_empty() && !line.starts_with('#') && current_bandwidth >= max_bandwidth {
            max_bandwidth = current_bandwidth;
            best = Some(line);
        }
    }
    best
}

/// Segment URIs of a media playlist: every non-empty, non-comment line,
/// in order, still relative to the playlist URL.
pub fn media_segment_lines(content: &str) -> impl Iterator<Item = &str> {
    content
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
}

/// Resolves a (possibly relative) playlist reference against the URL
/// of the playlist it appeared in.
pub fn resolve_url(base: &str, reference: &str) -> Option<String> {
    let base = url::Url::parse(base).ok()?;
    base.join(reference).ok().map(|u| u.to_string())
}

/// Minimal VOD playlist referencing local segment files by name.
///
/// The durations are nominal; the stream-copy remux reads timestamps
/// from the segments themselves.
pub fn local_vod_playlist(filenames: &[String]) -> String {
    let mut content = String::from(
        "#EXTM3U\n#EXT-X-VERSION:3\n#EXT-X-TARGETDURATION:10\n\
         #EXT-X-PLAYLIST-TYPE:VOD\n#EXT-X-MEDIA-SEQUENCE:0\n",
    );
    for name in filenames {
        content.push_str("#EXTINF:10.0,\n");
        content.push_str(name);
        content.push('\n');
    }
    content.push_str("#EXT-X-ENDLIST\n");
    content
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn selects_highest_bandwidth_variant() {
        let master = "#EXTM3U\n\
                      #EXT-X-STREAM-INF:BANDWIDTH=800000\n\
                      low.m3u8\n\
                      #EXT-X-STREAM-INF:BANDWIDTH=2400000\n\
                      high.m3u8\n";
        assert_eq!(select_variant(master), Some("high.m3u8"));
    }

    #[test]
    fn equal_bandwidth_picks_later_variant() {
        let master = "#EXT-X-STREAM-INF:BANDWIDTH=1000\n\
                      first.m3u8\n\
                      #EXT-X-STREAM-INF:BANDWIDTH=1000\n\
                      second.m3u8\n";
        assert_eq!(select_variant(master), Some("second.m3u8"));
    }

    #[test]
    fn bandwidth_is_found_among_other_attributes() {
        let master = "#EXT-X-STREAM-INF:RESOLUTION=1920x1080,BANDWIDTH=5000000,CODECS=\"avc1\"\n\
                      hd.m3u8\n\
                      #EXT-X-STREAM-INF:BANDWIDTH=100000\n\
                      sd.m3u8\n";
        assert_eq!(select_variant(master), Some("hd.m3u8"));
    }

    #[test]
    fn media_playlist_has_no_variant() {
        let media = "#EXTM3U\n#EXTINF:10.0,\nseg0.ts\n#EXT-X-ENDLIST\n";
        assert!(!is_master(media));
        assert_eq!(select_variant(media), Some("seg0.ts"));
    }

    #[test]
    fn collects_segment_lines_in_order() {
        let media = "#EXTM3U\n#EXTINF:4.0,\nseg0.ts\n\n#EXTINF:4.0,\nseg1.ts\n#EXT-X-ENDLIST\n";
        let segments: Vec<_> = media_segment_lines(media).collect();
        assert_eq!(segments, vec!["seg0.ts", "seg1.ts"]);
    }

    #[test]
    fn local_playlist_is_a_valid_vod() {
        let content = local_vod_playlist(&["a.ts".to_string(), "b.ts".to_string()]);
        assert!(content.starts_with("#EXTM3U\n"));
        assert!(content.contains("#EXT-X-PLAYLIST-TYPE:VOD\n"));
        assert!(content.contains("#EXTINF:10.0,\na.ts\n#EXTINF:10.0,\nb.ts\n"));
        assert!(content.ends_with("#EXT-X-ENDLIST\n"));
    }

    #[test]
    fn resolves_relative_and_absolute_references() {
        assert_eq!(
            resolve_url("https://h/stream/master.m3u8", "variants/high.m3u8").unwrap(),
            "https://h/stream/variants/high.m3u8"
        );
        assert_eq!(
            resolve_url("https://h/stream/master.m3u8", "https://cdn/other.m3u8").unwrap(),
            "https://cdn/other.m3u8"
        );
    }

    #[test]
    fn classifies_hls_urls() {
        assert!(looks_like_hls("https://h/stream/Master.M3U8?token=1"));
        assert!(!looks_like_hls("https://h/video.mp4"));
    }
}
