use anyhow::{bail, Result};
use chrono::{DateTime, TimeDelta, Utc};
use sqlx::{QueryBuilder, SqliteConnection};
use std::collections::HashSet;

use super::schema::Database;
use super::types::{Podcast, PodcastDbRow};
use crate::feed::Feed;
use crate::scheduler::SchedulePolicy;

/// Upper bound on canonical hops followed before giving up on a chain.
const MAX_CANONICAL_HOPS: usize = 64;

/// Retry bookkeeping after a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryState {
    pub num_retries: i64,
    pub active: bool,
}

/// Everything a successful parse writes onto the podcast row.
#[derive(Debug)]
pub(crate) struct PodcastRefresh<'a> {
    pub feed: &'a Feed,
    /// URL to store as `rss`: announced canonical URL or final fetch URL.
    pub rss: &'a str,
    pub etag: &'a str,
    pub modified: Option<DateTime<Utc>>,
    pub content_hash: &'a str,
    pub frequency: TimeDelta,
    pub extracted_text: &'a str,
    pub keywords: &'a str,
    pub num_episodes: i64,
}

impl Database {
    // ========================================================================
    // Podcast Operations
    // ========================================================================

    /// Add a feed URL to the catalog, returning its id.
    ///
    /// Adding a URL that is already present returns the existing id.
    pub async fn insert_podcast(&self, rss: &str) -> Result<i64> {
        let rss = rss.trim();
        if rss.is_empty() {
            bail!("Podcast URL cannot be empty");
        }

        let row: (i64,) = sqlx::query_as(
            "INSERT INTO podcasts (rss, created) VALUES (?, ?)
             ON CONFLICT(rss) DO UPDATE SET rss = excluded.rss
             RETURNING id",
        )
        .bind(rss)
        .bind(Utc::now().timestamp())
        .fetch_one(&self.pool)
        .await?;

        Ok(row.0)
    }

    pub async fn get_podcast(&self, id: i64) -> Result<Option<Podcast>> {
        let row: Option<PodcastDbRow> = sqlx::query_as("SELECT * FROM podcasts WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(PodcastDbRow::into_podcast))
    }

    /// Follow `canonical` links from `id` to the podcast at the end of the chain.
    pub async fn resolve_canonical(&self, id: i64) -> Result<i64> {
        let mut conn = self.pool.acquire().await?;
        resolve_canonical(&mut conn, id).await
    }

    // ========================================================================
    // Scheduling
    // ========================================================================

    /// Claim up to `limit` due podcasts for this pass, highest priority first.
    pub async fn select_due(&self, limit: usize, policy: &SchedulePolicy) -> Result<Vec<i64>> {
        self.select_due_at(limit, policy, Utc::now()).await
    }

    /// [`select_due`](Self::select_due) against an explicit clock.
    ///
    /// A podcast is due when it was never parsed, has no known publish date,
    /// was last parsed more than `frequency` ago, or more than
    /// `policy.max_frequency` ago. Claimed rows get `queued = now`; a row whose
    /// claim is younger than `max_frequency` is skipped, so two overlapping
    /// passes never pick the same podcast.
    pub async fn select_due_at(
        &self,
        limit: usize,
        policy: &SchedulePolicy,
        now: DateTime<Utc>,
    ) -> Result<Vec<i64>> {
        if limit == 0 {
            return Ok(Vec::new());
        }

        let now_ts = now.timestamp();
        let ceiling = (now - policy.max_frequency).timestamp();

        let candidates: Vec<(i64,)> = sqlx::query_as(
            r#"
                SELECT id FROM podcasts
                WHERE active = 1
                  AND (queued IS NULL OR queued < ?)
                  AND (
                      parsed IS NULL
                      OR pub_date IS NULL
                      OR parsed + frequency < ?
                      OR parsed < ?
                  )
                ORDER BY
                    parsed IS NULL DESC,
                    subscribers DESC,
                    promoted DESC,
                    parsed ASC,
                    updated ASC
                LIMIT ?
            "#,
        )
        .bind(ceiling)
        .bind(now_ts)
        .bind(ceiling)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        if candidates.is_empty() {
            return Ok(Vec::new());
        }

        // The claim re-checks `queued`: rows taken by a concurrent pass since
        // the SELECT drop out here.
        let mut builder: QueryBuilder<sqlx::Sqlite> =
            QueryBuilder::new("UPDATE podcasts SET queued = ");
        builder.push_bind(now_ts);
        builder.push(" WHERE (queued IS NULL OR queued < ");
        builder.push_bind(ceiling);
        builder.push(") AND id IN (");
        let mut separated = builder.separated(", ");
        for (id,) in &candidates {
            separated.push_bind(*id);
        }
        separated.push_unseparated(") RETURNING id");

        let claimed: HashSet<i64> = builder
            .build_query_as::<(i64,)>()
            .fetch_all(&self.pool)
            .await?
            .into_iter()
            .map(|(id,)| id)
            .collect();

        Ok(candidates
            .into_iter()
            .map(|(id,)| id)
            .filter(|id| claimed.contains(id))
            .collect())
    }

    // ========================================================================
    // Attempt Outcomes
    // ========================================================================

    /// Server reported no change: retries reset, podcast rescheduled.
    pub async fn record_not_modified(
        &self,
        id: i64,
        frequency: TimeDelta,
        now: DateTime<Utc>,
    ) -> Result<()> {
        sqlx::query(
            "UPDATE podcasts SET num_retries = 0, parser_error = 'not_modified', frequency = ?,
                 parsed = ?, updated = ?, queued = NULL
             WHERE id = ?",
        )
        .bind(frequency.num_seconds())
        .bind(now.timestamp())
        .bind(now.timestamp())
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Feed is gone for good (HTTP 410).
    pub async fn record_discontinued(&self, id: i64, now: DateTime<Utc>) -> Result<()> {
        sqlx::query(
            "UPDATE podcasts SET active = 0, parser_error = 'discontinued',
                 parsed = ?, updated = ?, queued = NULL
             WHERE id = ?",
        )
        .bind(now.timestamp())
        .bind(now.timestamp())
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Count a failed attempt against the retry budget.
    ///
    /// The podcast is deactivated once `num_retries` exceeds `max_retries`.
    pub async fn record_failure(
        &self,
        id: i64,
        code: &str,
        max_retries: i64,
        frequency: TimeDelta,
        now: DateTime<Utc>,
    ) -> Result<RetryState> {
        let row: Option<(i64, bool)> = sqlx::query_as(
            "UPDATE podcasts SET
                 num_retries = num_retries + 1,
                 active = CASE WHEN num_retries + 1 > ? THEN 0 ELSE active END,
                 parser_error = ?, frequency = ?, parsed = ?, updated = ?, queued = NULL
             WHERE id = ?
             RETURNING num_retries, active",
        )
        .bind(max_retries)
        .bind(code)
        .bind(frequency.num_seconds())
        .bind(now.timestamp())
        .bind(now.timestamp())
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some((num_retries, active)) => Ok(RetryState {
                num_retries,
                active,
            }),
            None => bail!("Podcast {} not found", id),
        }
    }

    /// Store a non-retry status (e.g. a local database failure) and reschedule.
    pub async fn record_status(
        &self,
        id: i64,
        code: &str,
        frequency: TimeDelta,
        now: DateTime<Utc>,
    ) -> Result<()> {
        sqlx::query(
            "UPDATE podcasts SET parser_error = ?, frequency = ?, parsed = ?, updated = ?, queued = NULL
             WHERE id = ?",
        )
        .bind(code)
        .bind(frequency.num_seconds())
        .bind(now.timestamp())
        .bind(now.timestamp())
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

// ============================================================================
// Transaction-scoped helpers
// ============================================================================

/// Stamp the attempt on the row. Run first in a reconcile transaction so the
/// write lock is taken before any reads.
pub(crate) async fn stamp_attempt(
    conn: &mut SqliteConnection,
    id: i64,
    now: DateTime<Utc>,
) -> Result<()> {
    sqlx::query("UPDATE podcasts SET parsed = ?, updated = ?, queued = NULL WHERE id = ?")
        .bind(now.timestamp())
        .bind(now.timestamp())
        .bind(id)
        .execute(&mut *conn)
        .await?;
    Ok(())
}

pub(crate) async fn resolve_canonical(conn: &mut SqliteConnection, id: i64) -> Result<i64> {
    let mut visited = HashSet::new();
    let mut current = id;

    while visited.insert(current) {
        if visited.len() > MAX_CANONICAL_HOPS {
            break;
        }
        let next: Option<(Option<i64>,)> =
            sqlx::query_as("SELECT canonical FROM podcasts WHERE id = ?")
                .bind(current)
                .fetch_optional(&mut *conn)
                .await?;
        match next {
            Some((Some(next),)) => current = next,
            _ => return Ok(current),
        }
    }

    tracing::warn!(podcast_id = id, stopped_at = current, "Canonical chain loops");
    Ok(current)
}

/// Another active podcast serving one of `urls` or the same body hash.
pub(crate) async fn find_duplicate(
    conn: &mut SqliteConnection,
    id: i64,
    urls: &[&str],
    content_hash: &str,
) -> Result<Option<i64>> {
    let mut builder: QueryBuilder<sqlx::Sqlite> =
        QueryBuilder::new("SELECT id FROM podcasts WHERE active = 1 AND id != ");
    builder.push_bind(id);
    builder.push(" AND (rss IN (");
    let mut separated = builder.separated(", ");
    for url in urls {
        separated.push_bind(*url);
    }
    separated.push_unseparated(")");
    if !content_hash.is_empty() {
        builder.push(" OR content_hash = ");
        builder.push_bind(content_hash);
    }
    builder.push(") ORDER BY id LIMIT 1");

    let row: Option<(i64,)> = builder
        .build_query_as()
        .fetch_optional(&mut *conn)
        .await?;
    Ok(row.map(|(id,)| id))
}

/// Deactivate `id` and point it at `canonical`.
pub(crate) async fn mark_duplicate(
    conn: &mut SqliteConnection,
    id: i64,
    canonical: i64,
) -> Result<()> {
    sqlx::query("UPDATE podcasts SET active = 0, canonical = ?, parser_error = 'duplicate' WHERE id = ?")
        .bind(canonical)
        .bind(id)
        .execute(&mut *conn)
        .await?;
    Ok(())
}

/// Overwrite the podcast row with a freshly parsed feed.
pub(crate) async fn apply_refresh(
    conn: &mut SqliteConnection,
    id: i64,
    refresh: &PodcastRefresh<'_>,
) -> Result<()> {
    let feed = refresh.feed;

    sqlx::query(
        r#"
            UPDATE podcasts SET
                rss = CASE
                    WHEN EXISTS (SELECT 1 FROM podcasts p WHERE p.rss = ? AND p.id != podcasts.id)
                    THEN rss ELSE ? END,
                etag = ?, modified = ?, content_hash = ?,
                active = ?, canonical = NULL, num_retries = 0, parser_error = '',
                frequency = ?, pub_date = ?,
                title = ?, description = ?, owner = ?, language = ?,
                explicit = ?, complete = ?, cover_url = ?, website = ?,
                funding_url = ?, funding_text = ?,
                extracted_text = ?, keywords = ?, num_episodes = ?
            WHERE id = ?
        "#,
    )
    .bind(refresh.rss)
    .bind(refresh.rss)
    .bind(refresh.etag)
    .bind(refresh.modified.map(|m| m.timestamp()))
    .bind(refresh.content_hash)
    .bind(!feed.complete)
    .bind(refresh.frequency.num_seconds())
    .bind(feed.pub_date.map(|d| d.timestamp()))
    .bind(&feed.title)
    .bind(&feed.description)
    .bind(&feed.owner)
    .bind(&feed.language)
    .bind(feed.explicit)
    .bind(feed.complete)
    .bind(&feed.cover_url)
    .bind(&feed.website)
    .bind(&feed.funding_url)
    .bind(&feed.funding_text)
    .bind(refresh.extracted_text)
    .bind(refresh.keywords)
    .bind(refresh.num_episodes)
    .bind(id)
    .execute(&mut *conn)
    .await?;
    Ok(())
}
