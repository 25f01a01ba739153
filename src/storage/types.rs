use chrono::{DateTime, TimeDelta, Utc};
use serde::{Serialize, Serializer};
use thiserror::Error;

use crate::feed::{CacheValidators, EpisodeType};

// ============================================================================
// Error Types
// ============================================================================

/// Errors raised while opening or migrating the catalog.
#[derive(Debug, Error)]
pub enum DatabaseError {
    /// Another process holds a lock on the database file
    #[error("The podcast catalog is locked by another process. Wait for it to finish and try again.")]
    InstanceLocked,

    #[error("Database migration failed: {0}")]
    Migration(String),

    #[error("Database error: {0}")]
    Other(#[from] sqlx::Error),
}

impl DatabaseError {
    pub(crate) fn from_sqlx(err: sqlx::Error) -> Self {
        if is_lock_error(&err.to_string()) {
            return DatabaseError::InstanceLocked;
        }
        DatabaseError::Other(err)
    }
}

/// True if an SQLite error message describes lock contention.
///
/// SQLITE_BUSY (5), SQLITE_LOCKED (6) and SQLITE_CANTOPEN (14).
pub(crate) fn is_lock_error(message: &str) -> bool {
    let message = message.to_lowercase();
    message.contains("database is locked")
        || message.contains("database table is locked")
        || message.contains("sqlite_busy")
        || message.contains("sqlite_locked")
        || message.contains("unable to open database file")
}

// ============================================================================
// Data Structures
// ============================================================================

/// One catalog row per feed URL.
#[derive(Debug, Clone, Serialize)]
pub struct Podcast {
    pub id: i64,
    pub rss: String,
    /// The podcast this one duplicates, if any.
    pub canonical: Option<i64>,
    pub etag: String,
    pub modified: Option<DateTime<Utc>>,
    pub content_hash: String,
    pub active: bool,
    pub num_retries: i64,
    /// Status code of the last attempt; empty after a successful parse.
    pub parser_error: String,
    #[serde(serialize_with = "serialize_seconds")]
    pub frequency: TimeDelta,
    pub pub_date: Option<DateTime<Utc>>,
    pub parsed: Option<DateTime<Utc>>,
    pub queued: Option<DateTime<Utc>>,
    pub updated: Option<DateTime<Utc>>,
    pub created: DateTime<Utc>,
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
    pub extracted_text: String,
    pub keywords: String,
    pub num_episodes: i64,
    pub promoted: bool,
    pub subscribers: i64,
}

impl Podcast {
    /// Cache validators from the previous successful fetch.
    pub fn validators(&self) -> CacheValidators {
        CacheValidators {
            etag: self.etag.clone(),
            modified: self.modified,
            content_hash: self.content_hash.clone(),
        }
    }
}

/// A persisted episode, owned by exactly one podcast.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Episode {
    pub id: i64,
    pub podcast_id: i64,
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
    pub duration: String,
    pub cover_url: Option<String>,
    pub website: Option<String>,
    pub keywords: String,
}

impl Episode {
    /// Duration in seconds, from either `H:MM:SS`/`MM:SS` or a plain integer.
    pub fn duration_in_seconds(&self) -> Option<i64> {
        if self.duration.is_empty() {
            return None;
        }
        self.duration.split(':').try_fold(0i64, |total, part| {
            part.parse::<i64>().ok().map(|value| total * 60 + value)
        })
    }
}

/// Row counts touched by one episode sync.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct EpisodeSync {
    pub inserted: u64,
    pub updated: u64,
    pub deleted: u64,
}

impl EpisodeSync {
    pub fn is_empty(&self) -> bool {
        self.inserted == 0 && self.updated == 0 && self.deleted == 0
    }
}

fn serialize_seconds<S: Serializer>(value: &TimeDelta, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_i64(value.num_seconds())
}

pub(crate) fn from_timestamp(seconds: Option<i64>) -> Option<DateTime<Utc>> {
    seconds.and_then(|s| DateTime::from_timestamp(s, 0))
}

// ============================================================================
// Row Types
// ============================================================================

/// Internal row type for podcast queries, converted via `into_podcast()`
#[derive(Debug, sqlx::FromRow)]
pub(crate) struct PodcastDbRow {
    pub id: i64,
    pub rss: String,
    pub canonical: Option<i64>,
    pub etag: String,
    pub modified: Option<i64>,
    pub content_hash: String,
    pub active: bool,
    pub num_retries: i64,
    pub parser_error: String,
    pub frequency: i64,
    pub pub_date: Option<i64>,
    pub parsed: Option<i64>,
    pub queued: Option<i64>,
    pub updated: Option<i64>,
    pub created: i64,
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
    pub extracted_text: String,
    pub keywords: String,
    pub num_episodes: i64,
    pub promoted: bool,
    pub subscribers: i64,
}

impl PodcastDbRow {
    pub(crate) fn into_podcast(self) -> Podcast {
        Podcast {
            id: self.id,
            rss: self.rss,
            canonical: self.canonical,
            etag: self.etag,
            modified: from_timestamp(self.modified),
            content_hash: self.content_hash,
            active: self.active,
            num_retries: self.num_retries,
            parser_error: self.parser_error,
            frequency: TimeDelta::seconds(self.frequency),
            pub_date: from_timestamp(self.pub_date),
            parsed: from_timestamp(self.parsed),
            queued: from_timestamp(self.queued),
            updated: from_timestamp(self.updated),
            created: DateTime::from_timestamp(self.created, 0).unwrap_or_default(),
            title: self.title,
            description: self.description,
            owner: self.owner,
            language: self.language,
            explicit: self.explicit,
            complete: self.complete,
            cover_url: self.cover_url,
            website: self.website,
            funding_url: self.funding_url,
            funding_text: self.funding_text,
            extracted_text: self.extracted_text,
            keywords: self.keywords,
            num_episodes: self.num_episodes,
            promoted: self.promoted,
            subscribers: self.subscribers,
        }
    }
}

#[derive(Debug, sqlx::FromRow)]
pub(crate) struct EpisodeDbRow {
    pub id: i64,
    pub podcast_id: i64,
    pub guid: String,
    pub title: String,
    pub description: String,
    pub pub_date: i64,
    pub media_url: String,
    pub media_type: String,
    pub file_size: Option<i64>,
    pub explicit: bool,
    pub episode: Option<i32>,
    pub season: Option<i32>,
    pub episode_type: String,
    pub duration: String,
    pub cover_url: Option<String>,
    pub website: Option<String>,
    pub keywords: String,
}

impl EpisodeDbRow {
    pub(crate) fn into_episode(self) -> Episode {
        Episode {
            id: self.id,
            podcast_id: self.podcast_id,
            guid: self.guid,
            title: self.title,
            description: self.description,
            pub_date: DateTime::from_timestamp(self.pub_date, 0).unwrap_or_default(),
            media_url: self.media_url,
            media_type: self.media_type,
            file_size: self.file_size,
            explicit: self.explicit,
            episode: self.episode,
            season: self.season,
            episode_type: EpisodeType::parse(&self.episode_type),
            duration: self.duration,
            cover_url: self.cover_url,
            website: self.website,
            keywords: self.keywords,
        }
    }
}
