use anyhow::{bail, Result};
use sqlx::{QueryBuilder, SqliteConnection};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

use super::schema::Database;
use crate::util::strip_control_chars;

/// Category name (case-folded) to id.
pub type CategoryMap = HashMap<String, i64>;

impl Database {
    // ========================================================================
    // Category Operations
    // ========================================================================

    fn sanitize_category_name(name: &str) -> Result<String> {
        let sanitized = strip_control_chars(name);
        let trimmed = sanitized.trim();
        if trimmed.is_empty() {
            bail!("Category name cannot be empty or whitespace-only");
        }
        Ok(trimmed.to_owned())
    }

    /// Create a category, returning its id. Names are unique case-insensitively;
    /// creating an existing name returns the existing id.
    pub async fn create_category(&self, name: &str) -> Result<i64> {
        let clean_name = Self::sanitize_category_name(name)?;

        let row: (i64,) = sqlx::query_as(
            "INSERT INTO categories (name) VALUES (?)
             ON CONFLICT(name) DO UPDATE SET name = categories.name
             RETURNING id",
        )
        .bind(&clean_name)
        .fetch_one(&self.pool)
        .await?;

        Ok(row.0)
    }

    pub async fn get_categories(&self) -> Result<CategoryMap> {
        let rows: Vec<(String, i64)> = sqlx::query_as("SELECT name, id FROM categories")
            .fetch_all(&self.pool)
            .await?;
        Ok(rows
            .into_iter()
            .map(|(name, id)| (name.to_lowercase(), id))
            .collect())
    }

    /// Names of the categories linked to a podcast, alphabetical.
    pub async fn get_podcast_categories(&self, podcast_id: i64) -> Result<Vec<String>> {
        let rows: Vec<(String,)> = sqlx::query_as(
            "SELECT c.name FROM categories c
             JOIN podcast_categories pc ON pc.category_id = c.id
             WHERE pc.podcast_id = ?
             ORDER BY c.name COLLATE NOCASE",
        )
        .bind(podcast_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(|(name,)| name).collect())
    }
}

/// Replace the category links of a podcast.
pub(crate) async fn set_podcast_categories(
    conn: &mut SqliteConnection,
    podcast_id: i64,
    category_ids: &[i64],
) -> Result<()> {
    sqlx::query("DELETE FROM podcast_categories WHERE podcast_id = ?")
        .bind(podcast_id)
        .execute(&mut *conn)
        .await?;

    if category_ids.is_empty() {
        return Ok(());
    }

    let mut builder: QueryBuilder<sqlx::Sqlite> =
        QueryBuilder::new("INSERT OR IGNORE INTO podcast_categories (podcast_id, category_id) ");
    builder.push_values(category_ids, |mut b, category_id| {
        b.push_bind(podcast_id).push_bind(*category_id);
    });
    builder.build().execute(&mut *conn).await?;
    Ok(())
}

// ============================================================================
// Category Cache
// ============================================================================

/// Read-through cache of the `categories` table.
///
/// Loaded on first use and kept until [`invalidate`](Self::invalidate) is
/// called. Anything that writes to `categories` must invalidate the cache it
/// shares with readers.
#[derive(Debug, Default)]
pub struct CategoryCache {
    entries: RwLock<Option<Arc<CategoryMap>>>,
}

impl CategoryCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn get(&self, db: &Database) -> Result<Arc<CategoryMap>> {
        if let Some(entries) = self.entries.read().await.as_ref() {
            return Ok(Arc::clone(entries));
        }

        let mut guard = self.entries.write().await;
        // Another task may have filled it while we waited for the write lock
        if let Some(entries) = guard.as_ref() {
            return Ok(Arc::clone(entries));
        }
        let entries = Arc::new(db.get_categories().await?);
        tracing::debug!(count = entries.len(), "Loaded category cache");
        *guard = Some(Arc::clone(&entries));
        Ok(entries)
    }

    pub async fn invalidate(&self) {
        *self.entries.write().await = None;
    }
}
