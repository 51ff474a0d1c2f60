//! Domain types shared between the service facade and the UI.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Upstream provider an anime entry was found on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Source {
    AllAnime,
    AnimeFire,
}

impl FromStr for Source {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "allanime" => Ok(Source::AllAnime),
            "animefire" => Ok(Source::AnimeFire),
            other => Err(other.to_string()),
        }
    }
}

impl fmt::Display for Source {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Source::AllAnime => write!(f, "allanime"),
            Source::AnimeFire => write!(f, "animefire"),
        }
    }
}

/// An anime as presented to the UI. Identity is `(source, url)`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Anime {
    pub name: String,
    pub url: String,
    pub source: Source,
    #[serde(default)]
    pub image_url: String,
    #[serde(default)]
    pub anilist_id: i64,
    #[serde(default)]
    pub mal_id: i64,
    #[serde(default)]
    pub synopsis: String,
    #[serde(default)]
    pub has_dub: bool,
}

/// A single episode, ordered within an anime by `num`.
///
/// `number` is the display form ("12", "12.5", "OVA 1"); `num` is the
/// numeric ordering key derived from it.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Episode {
    pub number: String,
    #[serde(default)]
    pub num: f64,
    pub url: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub aired: String,
    #[serde(default)]
    pub duration: f64,
    #[serde(default)]
    pub is_filler: bool,
    #[serde(default)]
    pub is_recap: bool,
    #[serde(default)]
    pub synopsis: String,
}
