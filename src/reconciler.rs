//! Per-podcast ingestion: fetch, parse, reconcile.
//!
//! Every attempt ends in exactly one terminal state, and every state is
//! written back to the podcast row:
//!
//! | Outcome | Podcast update |
//! |---|---|
//! | success | feed fields, episodes, validators; retries reset |
//! | not modified | retries reset, rescheduled |
//! | discontinued (HTTP 410) | deactivated |
//! | inaccessible, unavailable, invalid RSS | retry counted, deactivated past the ceiling |
//! | duplicate | deactivated, `canonical` linked |
//! | database error | status recorded, rescheduled |
//! | panic (caught by the worker) | `panic` recorded, rescheduled |
//!
//! There is no in-process retry: a failed podcast stays eligible for the
//! next scheduled pass.

use chrono::{DateTime, TimeDelta, Utc};
use serde::Serialize;
use std::collections::{BTreeSet, HashSet};
use std::fmt::Display;
use thiserror::Error;

use crate::config::Config;
use crate::feed::tokenizer::extract_text;
use crate::feed::{
    parse_rss_at, Feed, FetchError, FetchResponse, Fetcher, InvalidRssError,
};
use crate::scheduler::SchedulePolicy;
use crate::storage::{
    apply_refresh, find_duplicate, mark_duplicate, resolve_canonical, set_podcast_categories,
    stamp_attempt, sync_episodes, CategoryCache, CategoryMap, Database, EpisodeSync, Podcast,
    PodcastRefresh,
};

// ============================================================================
// Error Types
// ============================================================================

#[derive(Debug, Error)]
pub enum ReconcileError {
    /// Another active podcast already serves this feed.
    #[error("Duplicate of podcast {canonical_id}")]
    Duplicate { canonical_id: i64 },

    #[error("Podcast {0} not found")]
    Missing(i64),

    #[error("Database error: {0}")]
    Database(String),
}

impl ReconcileError {
    fn database(err: impl Display) -> Self {
        Self::Database(err.to_string())
    }
}

/// Terminal failure of one podcast's pipeline.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error(transparent)]
    Fetch(#[from] FetchError),

    #[error("Invalid RSS: {0}")]
    InvalidRss(#[from] InvalidRssError),

    #[error(transparent)]
    Reconcile(#[from] ReconcileError),
}

impl PipelineError {
    /// Stable status code stored in `parser_error`.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Fetch(FetchError::NotModified) => "not_modified",
            Self::Fetch(FetchError::Discontinued) => "discontinued",
            Self::Fetch(FetchError::Inaccessible(_)) => "inaccessible",
            Self::Fetch(FetchError::Unavailable(_)) => "unavailable",
            Self::InvalidRss(_) => "invalid_rss",
            Self::Reconcile(ReconcileError::Duplicate { .. }) => "duplicate",
            Self::Reconcile(ReconcileError::Missing(_)) => "missing",
            Self::Reconcile(ReconcileError::Database(_)) => "database_error",
        }
    }

    /// True for outcomes that count against the retry budget.
    pub fn counts_as_retry(&self) -> bool {
        matches!(
            self,
            Self::Fetch(FetchError::Inaccessible(_) | FetchError::Unavailable(_))
                | Self::InvalidRss(_)
        )
    }
}

// ============================================================================
// Reconciler
// ============================================================================

/// Result of a successful parse.
#[derive(Debug, Clone, Serialize)]
pub struct ParseReport {
    pub podcast_id: i64,
    pub title: String,
    pub num_episodes: usize,
    pub episodes: EpisodeSync,
    /// Next check interval, in seconds.
    pub frequency: i64,
}

/// Runs the fetch/parse/reconcile pipeline for single podcasts.
///
/// Owns the category cache: categories created through
/// [`create_category`](Self::create_category) invalidate it.
pub struct Reconciler {
    db: Database,
    fetcher: Fetcher,
    categories: CategoryCache,
    policy: SchedulePolicy,
    max_retries: i64,
}

impl Reconciler {
    pub fn new(db: Database, fetcher: Fetcher, policy: SchedulePolicy, max_retries: i64) -> Self {
        Self {
            db,
            fetcher,
            categories: CategoryCache::new(),
            policy,
            max_retries,
        }
    }

    pub fn from_config(db: Database, config: &Config) -> Result<Self, reqwest::Error> {
        Ok(Self::new(
            db,
            Fetcher::new(config)?,
            config.scheduler.policy(),
            config.max_retries,
        ))
    }

    pub fn database(&self) -> &Database {
        &self.db
    }

    pub fn policy(&self) -> &SchedulePolicy {
        &self.policy
    }

    /// Create a category and drop the cached lookup table.
    pub async fn create_category(&self, name: &str) -> anyhow::Result<i64> {
        let id = self.db.create_category(name).await?;
        self.categories.invalidate().await;
        Ok(id)
    }

    /// Force the next reconcile to reload categories.
    pub async fn invalidate_categories(&self) {
        self.categories.invalidate().await;
    }

    /// Load podcast `id` and run one attempt for it, regardless of schedule.
    pub async fn parse_podcast_id(&self, id: i64) -> Result<ParseReport, PipelineError> {
        let podcast = self
            .db
            .get_podcast(id)
            .await
            .map_err(ReconcileError::database)?
            .ok_or(ReconcileError::Missing(id))?;
        self.parse_podcast(&podcast).await
    }

    /// Run one attempt for `podcast` and record its outcome on the row.
    pub async fn parse_podcast(&self, podcast: &Podcast) -> Result<ParseReport, PipelineError> {
        let now = Utc::now();
        let outcome = self.attempt(podcast, now).await;
        if let Err(err) = &outcome {
            self.record_failure(podcast, err, now).await;
        }
        outcome
    }

    async fn attempt(&self, podcast: &Podcast, now: DateTime<Utc>) -> Result<ParseReport, PipelineError> {
        let mut response = self.fetcher.fetch(&podcast.rss, &podcast.validators()).await?;

        // XML parsing is CPU-bound: keep it off the async workers
        let content = std::mem::take(&mut response.content);
        let feed = tokio::task::spawn_blocking(move || parse_rss_at(&content, now))
            .await
            .map_err(|e| InvalidRssError::Malformed(format!("parser task failed: {e}")))??;

        Ok(self.reconcile(podcast, &feed, &response, now).await?)
    }

    /// Apply a parsed feed to the catalog in one transaction.
    ///
    /// If another active podcast already serves the final URL, the announced
    /// canonical URL or the same body, this podcast is deactivated and linked
    /// to that podcast's canonical root; episodes are left untouched. A
    /// successful refresh clears any earlier `canonical` link.
    pub async fn reconcile(
        &self,
        podcast: &Podcast,
        feed: &Feed,
        response: &FetchResponse,
        now: DateTime<Utc>,
    ) -> Result<ParseReport, ReconcileError> {
        let known = self
            .categories
            .get(&self.db)
            .await
            .map_err(ReconcileError::database)?;
        let (category_ids, keywords) = match_categories(&feed.categories, &known);
        let extracted_text = extract_text(feed);
        let frequency = self.policy.reschedule_at(
            feed.pub_date,
            self.policy.estimate_frequency(feed),
            now,
        );
        let num_episodes = feed
            .items
            .iter()
            .map(|item| item.guid.as_str())
            .collect::<HashSet<_>>()
            .len();

        let mut urls = vec![response.url.as_str()];
        if let Some(canonical_url) = feed.canonical_url.as_deref() {
            if canonical_url != response.url {
                urls.push(canonical_url);
            }
        }
        let rss = feed.canonical_url.as_deref().unwrap_or(&response.url);

        let mut tx = self.db.pool.begin().await.map_err(ReconcileError::database)?;

        stamp_attempt(&mut tx, podcast.id, now)
            .await
            .map_err(ReconcileError::database)?;

        let duplicate = find_duplicate(&mut tx, podcast.id, &urls, &response.content_hash)
            .await
            .map_err(ReconcileError::database)?;

        let canonical = match duplicate {
            Some(other) => {
                let root = resolve_canonical(&mut tx, other)
                    .await
                    .map_err(ReconcileError::database)?;
                // The match already resolves to this podcast: linking it would
                // close a cycle, so this podcast stays the canonical one.
                if root == podcast.id {
                    tracing::debug!(podcast_id = podcast.id, other, "Duplicate resolves to itself");
                    None
                } else {
                    Some(root)
                }
            }
            None => None,
        };

        if let Some(canonical_id) = canonical {
            mark_duplicate(&mut tx, podcast.id, canonical_id)
                .await
                .map_err(ReconcileError::database)?;
            tx.commit().await.map_err(ReconcileError::database)?;
            return Err(ReconcileError::Duplicate { canonical_id });
        }

        let episodes = sync_episodes(&mut tx, podcast.id, &feed.items)
            .await
            .map_err(ReconcileError::database)?;

        set_podcast_categories(&mut tx, podcast.id, &category_ids)
            .await
            .map_err(ReconcileError::database)?;

        let refresh = PodcastRefresh {
            feed,
            rss,
            etag: &response.etag,
            modified: response.modified,
            content_hash: &response.content_hash,
            frequency,
            extracted_text: &extracted_text,
            keywords: &keywords,
            num_episodes: num_episodes as i64,
        };
        apply_refresh(&mut tx, podcast.id, &refresh)
            .await
            .map_err(ReconcileError::database)?;

        tx.commit().await.map_err(ReconcileError::database)?;

        Ok(ParseReport {
            podcast_id: podcast.id,
            title: feed.title.clone(),
            num_episodes,
            episodes,
            frequency: frequency.num_seconds(),
        })
    }

    /// Write a failed attempt's state transition. Never fails the pipeline:
    /// a write error here is logged and the podcast is retried next pass.
    async fn record_failure(&self, podcast: &Podcast, err: &PipelineError, now: DateTime<Utc>) {
        let frequency = self.reschedule(podcast, now);

        let result = match err {
            PipelineError::Fetch(FetchError::NotModified) => {
                self.db.record_not_modified(podcast.id, frequency, now).await
            }
            PipelineError::Fetch(FetchError::Discontinued) => {
                self.db.record_discontinued(podcast.id, now).await
            }
            err if err.counts_as_retry() => self
                .db
                .record_failure(podcast.id, err.code(), self.max_retries, frequency, now)
                .await
                .map(|state| {
                    if !state.active {
                        tracing::warn!(
                            podcast_id = podcast.id,
                            num_retries = state.num_retries,
                            "Retry ceiling exceeded, podcast deactivated"
                        );
                    }
                }),
            // Already committed by the reconcile transaction
            PipelineError::Reconcile(ReconcileError::Duplicate { .. }) => Ok(()),
            PipelineError::Reconcile(ReconcileError::Missing(_)) => Ok(()),
            err => {
                self.db
                    .record_status(podcast.id, err.code(), frequency, now)
                    .await
            }
        };

        if let Err(e) = result {
            tracing::error!(podcast_id = podcast.id, error = %e, "Failed to record feed status");
        }
    }

    /// Release the claim of a podcast whose pipeline panicked and record
    /// `panic` as its status, so the next due pass picks it up again.
    pub async fn record_panic(&self, podcast_id: i64) {
        let now = Utc::now();
        let result = match self.db.get_podcast(podcast_id).await {
            Ok(Some(podcast)) => {
                let frequency = self.reschedule(&podcast, now);
                self.db.record_status(podcast_id, "panic", frequency, now).await
            }
            Ok(None) => Ok(()),
            Err(e) => Err(e),
        };
        if let Err(e) = result {
            tracing::error!(podcast_id, error = %e, "Failed to record feed status");
        }
    }

    fn reschedule(&self, podcast: &Podcast, now: DateTime<Utc>) -> TimeDelta {
        self.policy
            .reschedule_at(podcast.pub_date, podcast.frequency, now)
    }
}

/// Split feed categories into known category ids and free-form keywords.
fn match_categories(categories: &BTreeSet<String>, known: &CategoryMap) -> (Vec<i64>, String) {
    let mut ids = Vec::new();
    let mut keywords = Vec::new();

    for category in categories {
        match known.get(category.as_str()) {
            Some(id) => ids.push(*id),
            None => keywords.push(category.as_str()),
        }
    }

    (ids, keywords.join(" "))
}
