use anyhow::Result;
use sqlx::{
    sqlite::{SqliteConnectOptions, SqlitePoolOptions},
    SqlitePool,
};
use std::str::FromStr;
use std::time::Duration;

use super::types::{is_lock_error, DatabaseError};

// ============================================================================
// Database
// ============================================================================

/// Handle to the podcast catalog. Cheap to clone: all clones share one pool.
#[derive(Clone)]
pub struct Database {
    pub(crate) pool: SqlitePool,
}

impl Database {
    /// Open (creating if needed) the catalog at `path` and run migrations.
    ///
    /// `":memory:"` opens a private in-memory catalog shared by the pool.
    ///
    /// # Errors
    ///
    /// Returns `DatabaseError::InstanceLocked` when another process holds the
    /// database lock, `DatabaseError::Migration` when the schema cannot be
    /// applied.
    pub async fn open(path: &str) -> Result<Self, DatabaseError> {
        let url = format!("sqlite:{}?mode=rwc", path);

        // Pre-create the file owner-only so there is no window with umask permissions
        #[cfg(unix)]
        if path != ":memory:" {
            let db_path = std::path::Path::new(path);
            let parent_exists = match db_path.parent() {
                Some(parent) => parent.as_os_str().is_empty() || parent.exists(),
                None => true,
            };
            if !db_path.exists() && parent_exists {
                use std::os::unix::fs::OpenOptionsExt;
                let _file = std::fs::OpenOptions::new()
                    .write(true)
                    .create_new(true)
                    .mode(0o600)
                    .open(db_path)
                    .ok(); // SQLite reports the real error at connect_with.
            }
        }

        // busy_timeout on every pooled connection: writers wait up to 5s
        // for the lock instead of failing with SQLITE_BUSY.
        let options = SqliteConnectOptions::from_str(&url)
            .map_err(DatabaseError::from_sqlx)?
            .foreign_keys(true)
            .pragma("busy_timeout", "5000");

        // SQLite is single-writer; a handful of connections covers the
        // worker pool's reads while writes serialize on the lock.
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .acquire_timeout(Duration::from_secs(30))
            .connect_with(options)
            .await
            .map_err(DatabaseError::from_sqlx)?;

        let db = Self { pool };
        db.migrate().await.map_err(|e| {
            if is_lock_error(&e.to_string()) {
                DatabaseError::InstanceLocked
            } else {
                DatabaseError::Migration(e.to_string())
            }
        })?;
        Ok(db)
    }

    /// Apply the schema inside one transaction.
    ///
    /// Every statement is `IF NOT EXISTS`, so re-running on an existing
    /// catalog is a no-op.
    async fn migrate(&self) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS podcasts (
                id INTEGER PRIMARY KEY,
                rss TEXT UNIQUE NOT NULL,
                canonical INTEGER REFERENCES podcasts(id) ON DELETE SET NULL,
                etag TEXT NOT NULL DEFAULT '',
                modified INTEGER,
                content_hash TEXT NOT NULL DEFAULT '',
                active INTEGER NOT NULL DEFAULT 1,
                num_retries INTEGER NOT NULL DEFAULT 0,
                parser_error TEXT NOT NULL DEFAULT '',
                frequency INTEGER NOT NULL DEFAULT 86400,
                pub_date INTEGER,
                parsed INTEGER,
                queued INTEGER,
                updated INTEGER,
                created INTEGER NOT NULL DEFAULT 0,
                title TEXT NOT NULL DEFAULT '',
                description TEXT NOT NULL DEFAULT '',
                owner TEXT NOT NULL DEFAULT '',
                language TEXT NOT NULL DEFAULT 'en',
                explicit INTEGER NOT NULL DEFAULT 0,
                complete INTEGER NOT NULL DEFAULT 0,
                cover_url TEXT,
                website TEXT,
                funding_url TEXT,
                funding_text TEXT NOT NULL DEFAULT '',
                extracted_text TEXT NOT NULL DEFAULT '',
                keywords TEXT NOT NULL DEFAULT '',
                num_episodes INTEGER NOT NULL DEFAULT 0,
                promoted INTEGER NOT NULL DEFAULT 0,
                subscribers INTEGER NOT NULL DEFAULT 0
            )
        "#,
        )
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS episodes (
                id INTEGER PRIMARY KEY,
                podcast_id INTEGER NOT NULL REFERENCES podcasts(id) ON DELETE CASCADE,
                guid TEXT NOT NULL,
                title TEXT NOT NULL,
                description TEXT NOT NULL DEFAULT '',
                pub_date INTEGER NOT NULL,
                media_url TEXT NOT NULL,
                media_type TEXT NOT NULL,
                file_size INTEGER,
                explicit INTEGER NOT NULL DEFAULT 0,
                episode INTEGER,
                season INTEGER,
                episode_type TEXT NOT NULL DEFAULT 'full',
                duration TEXT NOT NULL DEFAULT '',
                cover_url TEXT,
                website TEXT,
                keywords TEXT NOT NULL DEFAULT '',
                UNIQUE(podcast_id, guid)
            )
        "#,
        )
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS categories (
                id INTEGER PRIMARY KEY,
                name TEXT NOT NULL UNIQUE COLLATE NOCASE
            )
        "#,
        )
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS podcast_categories (
                podcast_id INTEGER NOT NULL REFERENCES podcasts(id) ON DELETE CASCADE,
                category_id INTEGER NOT NULL REFERENCES categories(id) ON DELETE CASCADE,
                PRIMARY KEY (podcast_id, category_id)
            )
        "#,
        )
        .execute(&mut *tx)
        .await?;

        // Episode listings: newest first within a podcast
        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_episodes_podcast_pub_date ON episodes(podcast_id, pub_date DESC)",
        )
        .execute(&mut *tx)
        .await?;

        // Duplicate detection by body hash
        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_podcasts_content_hash ON podcasts(content_hash) WHERE content_hash != ''",
        )
        .execute(&mut *tx)
        .await?;

        // Due-podcast selection scans active rows by last attempt
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_podcasts_active_parsed ON podcasts(active, parsed)")
            .execute(&mut *tx)
            .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_podcast_categories_category ON podcast_categories(category_id)",
        )
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }
}
