use std::collections::BTreeSet;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;

use super::dates::parse_date;
use super::tokenizer::is_language_code;
use crate::util::{normalize_url, strip_control_chars};

/// Media types accepted for an episode enclosure, compared case-insensitively.
const AUDIO_MIMETYPES: &[&str] = &[
    "audio/aac",
    "audio/aacp",
    "audio/basic",
    "audio/l24",
    "audio/m4a",
    "audio/midi",
    "audio/mp3",
    "audio/mp4",
    "audio/mp4a-latm",
    "audio/mpef",
    "audio/mpeg",
    "audio/mpeg3",
    "audio/mpeg4",
    "audio/mpg",
    "audio/ogg",
    "audio/video",
    "audio/vnd.dlna.adts",
    "audio/vnd.rn-realaudio",
    "audio/vnd.wave",
    "audio/vorbis",
    "audio/wav",
    "audio/wave",
    "audio/webm",
    "audio/x-aac",
    "audio/x-aiff",
    "audio/x-flac",
    "audio/x-hx-aac-adts",
    "audio/x-m4a",
    "audio/x-m4b",
    "audio/x-m4v",
    "audio/x-mov",
    "audio/x-mp3",
    "audio/x-mpeg",
    "audio/x-mpg",
    "audio/x-ms-wma",
    "audio/x-pn-realaudio",
    "audio/x-wav",
];

const DEFAULT_LANGUAGE: &str = "en";

/// A parsed podcast feed. Transient: never stored as-is.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Feed {
    pub title: String,
    pub description: String,
    pub owner: String,
    pub language: String,
    pub explicit: bool,
    pub complete: bool,
    pub cover_url: Option<String>,
    pub website: Option<String>,
    pub funding_url: Option<String>,
    pub funding_text: String,
    /// Target of an `itunes:new-feed-url` redirect, if announced.
    pub canonical_url: Option<String>,
    /// Case-folded, deduplicated.
    pub categories: BTreeSet<String>,
    /// Latest item publish date.
    pub pub_date: Option<DateTime<Utc>>,
    pub items: Vec<Item>,
}

/// One valid episode entry.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Item {
    pub guid: String,
    pub title: String,
    pub description: String,
    pub pub_date: DateTime<Utc>,
    pub media_url: String,
    pub media_type: String,
    pub file_size: Option<i64>,
    pub explicit: bool,
    pub episode: Option<i32>,
    pub season: Option<i32>,
    pub episode_type: EpisodeType,
    /// `H:MM:SS`-style or plain seconds; empty when unknown.
    pub duration: String,
    pub cover_url: Option<String>,
    pub website: Option<String>,
    /// Item-level categories joined with spaces.
    pub keywords: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EpisodeType {
    #[default]
    Full,
    Trailer,
    Bonus,
}

impl EpisodeType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Full => "full",
            Self::Trailer => "trailer",
            Self::Bonus => "bonus",
        }
    }

    /// Unknown values fall back to `Full`.
    pub fn parse(value: &str) -> Self {
        match value.trim().to_lowercase().as_str() {
            "trailer" => Self::Trailer,
            "bonus" => Self::Bonus,
            _ => Self::Full,
        }
    }
}

impl fmt::Display for EpisodeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Field values as extracted from the document, before validation.
#[derive(Debug, Clone, Default)]
pub struct RawFeed {
    pub title: Option<String>,
    pub description: Option<String>,
    pub owner: Option<String>,
    pub language: Option<String>,
    pub explicit: Option<String>,
    pub complete: Option<String>,
    pub cover_url: Option<String>,
    pub website: Option<String>,
    pub funding_url: Option<String>,
    pub funding_text: Option<String>,
    pub canonical_url: Option<String>,
    pub categories: Vec<String>,
    pub items: Vec<RawItem>,
}

#[derive(Debug, Clone, Default)]
pub struct RawItem {
    pub guid: Option<String>,
    pub title: Option<String>,
    pub description: Option<String>,
    pub pub_date: Option<String>,
    pub media_url: Option<String>,
    pub media_type: Option<String>,
    pub file_size: Option<String>,
    pub explicit: Option<String>,
    pub episode: Option<String>,
    pub season: Option<String>,
    pub episode_type: Option<String>,
    pub duration: Option<String>,
    pub cover_url: Option<String>,
    pub website: Option<String>,
    pub categories: Vec<String>,
}

/// Why a single item was skipped.
#[derive(Debug, Error, PartialEq)]
pub enum ItemError {
    #[error("missing {0}")]
    Missing(&'static str),
    #[error("unparseable pub date: {0}")]
    InvalidDate(String),
    #[error("pub date {0} is in the future")]
    FutureDate(DateTime<Utc>),
    #[error("invalid media url: {0}")]
    InvalidMediaUrl(String),
    #[error("unsupported media type: {0}")]
    UnsupportedMediaType(String),
}

/// Why a whole feed was rejected.
#[derive(Debug, Error, PartialEq)]
pub enum InvalidRssError {
    #[error("no channel element found")]
    NoChannel,
    #[error("feed has no title")]
    MissingTitle,
    #[error("feed has no valid items")]
    NoItems,
    #[error("unparseable feed: {0}")]
    Malformed(String),
}

impl RawItem {
    pub fn validate(self, now: DateTime<Utc>) -> Result<Item, ItemError> {
        let guid = non_empty(self.guid).ok_or(ItemError::Missing("guid"))?;
        let title = non_empty(self.title).ok_or(ItemError::Missing("title"))?;

        let raw_date = non_empty(self.pub_date).ok_or(ItemError::Missing("pub_date"))?;
        let pub_date = parse_date(&raw_date).ok_or(ItemError::InvalidDate(raw_date))?;
        if pub_date > now {
            return Err(ItemError::FutureDate(pub_date));
        }

        let raw_url = non_empty(self.media_url).ok_or(ItemError::Missing("media_url"))?;
        let media_url = normalize_url(&raw_url).ok_or(ItemError::InvalidMediaUrl(raw_url))?;

        let media_type = non_empty(self.media_type).ok_or(ItemError::Missing("media_type"))?;
        if !is_audio(&media_type) {
            return Err(ItemError::UnsupportedMediaType(media_type));
        }

        let keywords = self
            .categories
            .iter()
            .map(|c| c.trim())
            .filter(|c| !c.is_empty())
            .collect::<Vec<_>>()
            .join(" ");

        Ok(Item {
            guid,
            title: strip_control_chars(&title).into_owned(),
            description: self.description.unwrap_or_default(),
            pub_date,
            media_url,
            media_type,
            file_size: self.file_size.as_deref().and_then(parse_bounded_int).map(i64::from),
            explicit: parse_explicit(self.explicit.as_deref()),
            episode: self.episode.as_deref().and_then(parse_bounded_int),
            season: self.season.as_deref().and_then(parse_bounded_int),
            episode_type: self
                .episode_type
                .as_deref()
                .map(EpisodeType::parse)
                .unwrap_or_default(),
            duration: self.duration.as_deref().map(normalize_duration).unwrap_or_default(),
            cover_url: self.cover_url.as_deref().and_then(normalize_url),
            website: self.website.as_deref().and_then(normalize_url),
            keywords,
        })
    }
}

impl RawFeed {
    /// Validates the feed and every item, skipping invalid items.
    pub fn validate(self, now: DateTime<Utc>) -> Result<Feed, InvalidRssError> {
        let title = non_empty(self.title).ok_or(InvalidRssError::MissingTitle)?;

        let total = self.items.len();
        let items: Vec<Item> = self
            .items
            .into_iter()
            .filter_map(|raw| {
                let guid = raw.guid.clone().unwrap_or_default();
                match raw.validate(now) {
                    Ok(item) => Some(item),
                    Err(e) => {
                        tracing::debug!(guid = %guid, error = %e, "Skipping invalid item");
                        None
                    }
                }
            })
            .collect();

        if items.is_empty() {
            return Err(InvalidRssError::NoItems);
        }
        if items.len() < total {
            tracing::debug!(
                title = %title,
                skipped = total - items.len(),
                kept = items.len(),
                "Items skipped during validation"
            );
        }

        let categories = self
            .categories
            .iter()
            .map(|c| c.trim().replace("&amp;", "&").to_lowercase())
            .filter(|c| !c.is_empty())
            .collect();

        let pub_date = items.iter().map(|item| item.pub_date).max();

        Ok(Feed {
            title: strip_control_chars(&title).into_owned(),
            description: self.description.unwrap_or_default(),
            owner: self.owner.unwrap_or_default(),
            language: normalize_language(self.language.as_deref()),
            explicit: parse_explicit(self.explicit.as_deref()),
            complete: parse_complete(self.complete.as_deref()),
            cover_url: self.cover_url.as_deref().and_then(normalize_url),
            website: self.website.as_deref().and_then(normalize_url),
            funding_url: self.funding_url.as_deref().and_then(normalize_url),
            funding_text: self.funding_text.unwrap_or_default(),
            canonical_url: self.canonical_url.as_deref().and_then(normalize_url),
            categories,
            pub_date,
            items,
        })
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_owned())
        .filter(|v| !v.is_empty())
}

pub fn is_audio(media_type: &str) -> bool {
    let media_type = media_type.trim().to_lowercase();
    AUDIO_MIMETYPES.contains(&media_type.as_str())
}

pub fn parse_explicit(value: Option<&str>) -> bool {
    matches!(
        value.map(|v| v.trim().to_lowercase()).as_deref(),
        Some("clean" | "yes" | "true")
    )
}

pub fn parse_complete(value: Option<&str>) -> bool {
    matches!(
        value.map(|v| v.trim().to_lowercase()).as_deref(),
        Some("yes" | "true")
    )
}

/// First two letters, if they form a known code; otherwise `en`.
pub fn normalize_language(value: Option<&str>) -> String {
    let code: String = value
        .unwrap_or_default()
        .trim()
        .chars()
        .take(2)
        .collect::<String>()
        .to_lowercase();

    if is_language_code(&code) {
        code
    } else {
        DEFAULT_LANGUAGE.to_owned()
    }
}

/// Integers outside the signed 32-bit range are discarded.
pub fn parse_bounded_int(value: &str) -> Option<i32> {
    let parsed: i64 = value.trim().parse().ok()?;
    i32::try_from(parsed).ok()
}

/// Normalizes an `itunes:duration` value.
///
/// Plain integers are kept as seconds. Colon-separated values keep at most
/// three components; components outside `0..=59` are dropped, later ones
/// are zero-padded, and any non-numeric component invalidates the value.
pub fn normalize_duration(value: &str) -> String {
    let value = value.trim();
    if value.is_empty() {
        return String::new();
    }

    if let Ok(seconds) = value.parse::<u64>() {
        return seconds.to_string();
    }

    let mut parts = Vec::with_capacity(3);
    for part in value.split(':').take(3) {
        let Ok(number) = part.trim().parse::<u32>() else {
            return String::new();
        };
        if number <= 59 {
            parts.push(if parts.is_empty() {
                number.to_string()
            } else {
                format!("{number:02}")
            });
        }
    }
    parts.join(":")
}
