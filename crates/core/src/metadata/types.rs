use serde::{Deserialize, Serialize};

/// Cached enrichment data for one anime.
///
/// Keys in the metadata cache are either a cleaned title (search
/// enrichment) or a decimal MAL id (episode-list enrichment).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnimeMetadata {
    #[serde(default)]
    pub img: String,
    #[serde(default)]
    pub desc: String,
    #[serde(default)]
    pub mal_id: i64,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub episodes: Vec<EpisodeMeta>,
}

/// Per-episode metadata from Jikan.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EpisodeMeta {
    pub episode: u32,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub synopsis: String,
    #[serde(default)]
    pub aired: String,
    #[serde(default)]
    pub filler: bool,
}
