use anyhow::Result;
use sqlx::{QueryBuilder, SqliteConnection};
use std::collections::{HashMap, HashSet};

use super::schema::Database;
use super::types::{Episode, EpisodeDbRow, EpisodeSync};
use crate::feed::Item;

// ============================================================================
// Batch Size Constants
// ============================================================================

/// 16 bound columns per row: 100 rows stays well under SQLite's variable limit.
const INSERT_BATCH_SIZE: usize = 100;

/// Upserts carry the same 16 columns; 500 rows is 8000 variables.
const UPDATE_BATCH_SIZE: usize = 500;

const DELETE_BATCH_SIZE: usize = 1000;

const EPISODE_COLUMNS: &str = "podcast_id, guid, title, description, pub_date, media_url, \
     media_type, file_size, explicit, episode, season, episode_type, duration, cover_url, \
     website, keywords";

impl Database {
    // ========================================================================
    // Episode Operations
    // ========================================================================

    /// Make the stored episodes of `podcast_id` match `items` exactly.
    pub async fn sync_episodes(&self, podcast_id: i64, items: &[Item]) -> Result<EpisodeSync> {
        let mut tx = self.pool.begin().await?;
        let sync = sync_episodes(&mut tx, podcast_id, items).await?;
        tx.commit().await?;
        Ok(sync)
    }

    /// Episodes of a podcast, newest first.
    pub async fn get_episodes(&self, podcast_id: i64) -> Result<Vec<Episode>> {
        let rows: Vec<EpisodeDbRow> = sqlx::query_as(
            "SELECT * FROM episodes WHERE podcast_id = ? ORDER BY pub_date DESC, id ASC",
        )
        .bind(podcast_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(EpisodeDbRow::into_episode).collect())
    }
}

/// Keep only the last occurrence of each guid, preserving feed order.
pub(crate) fn dedupe_by_guid(items: &[Item]) -> Vec<&Item> {
    let last: HashMap<&str, usize> = items
        .iter()
        .enumerate()
        .map(|(i, item)| (item.guid.as_str(), i))
        .collect();

    items
        .iter()
        .enumerate()
        .filter(|(i, item)| last.get(item.guid.as_str()) == Some(i))
        .map(|(_, item)| item)
        .collect()
}

/// Delete, update and insert episodes so that exactly the guids of `items`
/// remain for `podcast_id`.
///
/// The feed is the source of truth: guids absent from `items` are deleted.
/// Duplicate guids within `items` collapse to their last occurrence.
/// Updates only count rows whose fields actually changed.
pub(crate) async fn sync_episodes(
    conn: &mut SqliteConnection,
    podcast_id: i64,
    items: &[Item],
) -> Result<EpisodeSync> {
    let items = dedupe_by_guid(items);
    let incoming: HashSet<&str> = items.iter().map(|item| item.guid.as_str()).collect();

    let existing: HashMap<String, i64> =
        sqlx::query_as::<_, (String, i64)>("SELECT guid, id FROM episodes WHERE podcast_id = ?")
            .bind(podcast_id)
            .fetch_all(&mut *conn)
            .await?
            .into_iter()
            .collect();

    let mut sync = EpisodeSync::default();

    // Phase 1: delete episodes that left the feed
    let stale: Vec<i64> = existing
        .iter()
        .filter(|(guid, _)| !incoming.contains(guid.as_str()))
        .map(|(_, id)| *id)
        .collect();

    for chunk in stale.chunks(DELETE_BATCH_SIZE) {
        let mut builder: QueryBuilder<sqlx::Sqlite> =
            QueryBuilder::new("DELETE FROM episodes WHERE id IN (");
        let mut separated = builder.separated(", ");
        for id in chunk {
            separated.push_bind(*id);
        }
        separated.push_unseparated(")");
        sync.deleted += builder.build().execute(&mut *conn).await?.rows_affected();
    }

    let (updates, inserts): (Vec<&Item>, Vec<&Item>) = items
        .into_iter()
        .partition(|item| existing.contains_key(&item.guid));

    // Phase 2: refresh known guids; the WHERE skips rows with nothing new
    for chunk in updates.chunks(UPDATE_BATCH_SIZE) {
        let mut builder = episode_values(podcast_id, "INSERT INTO episodes", chunk);
        builder.push(
            " ON CONFLICT(podcast_id, guid) DO UPDATE SET \
             title = excluded.title, description = excluded.description, \
             pub_date = excluded.pub_date, media_url = excluded.media_url, \
             media_type = excluded.media_type, file_size = excluded.file_size, \
             explicit = excluded.explicit, episode = excluded.episode, \
             season = excluded.season, episode_type = excluded.episode_type, \
             duration = excluded.duration, cover_url = excluded.cover_url, \
             website = excluded.website, keywords = excluded.keywords \
             WHERE episodes.title IS NOT excluded.title \
                OR episodes.description IS NOT excluded.description \
                OR episodes.pub_date IS NOT excluded.pub_date \
                OR episodes.media_url IS NOT excluded.media_url \
                OR episodes.media_type IS NOT excluded.media_type \
                OR episodes.file_size IS NOT excluded.file_size \
                OR episodes.explicit IS NOT excluded.explicit \
                OR episodes.episode IS NOT excluded.episode \
                OR episodes.season IS NOT excluded.season \
                OR episodes.episode_type IS NOT excluded.episode_type \
                OR episodes.duration IS NOT excluded.duration \
                OR episodes.cover_url IS NOT excluded.cover_url \
                OR episodes.website IS NOT excluded.website \
                OR episodes.keywords IS NOT excluded.keywords",
        );
        sync.updated += builder.build().execute(&mut *conn).await?.rows_affected();
    }

    // Phase 3: insert new guids
    for chunk in inserts.chunks(INSERT_BATCH_SIZE) {
        let mut builder = episode_values(podcast_id, "INSERT OR IGNORE INTO episodes", chunk);
        sync.inserted += builder.build().execute(&mut *conn).await?.rows_affected();
    }

    Ok(sync)
}

fn episode_values<'a>(
    podcast_id: i64,
    statement: &str,
    items: &[&'a Item],
) -> QueryBuilder<'a, sqlx::Sqlite> {
    let mut builder: QueryBuilder<sqlx::Sqlite> =
        QueryBuilder::new(format!("{} ({}) ", statement, EPISODE_COLUMNS));

    builder.push_values(items.iter().copied(), |mut b, item| {
        b.push_bind(podcast_id)
            .push_bind(&item.guid)
            .push_bind(&item.title)
            .push_bind(&item.description)
            .push_bind(item.pub_date.timestamp())
            .push_bind(&item.media_url)
            .push_bind(&item.media_type)
            .push_bind(item.file_size)
            .push_bind(item.explicit)
            .push_bind(item.episode)
            .push_bind(item.season)
            .push_bind(item.episode_type.as_str())
            .push_bind(&item.duration)
            .push_bind(&item.cover_url)
            .push_bind(&item.website)
            .push_bind(&item.keywords);
    });

    builder
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::feed::EpisodeType;
    use chrono::{TimeDelta, Utc};
    use pretty_assertions::assert_eq;

    async fn test_db() -> (Database, i64) {
        let db = Database::open(":memory:").await.unwrap();
        let id = db.insert_podcast("https://example.com/feed.xml").await.unwrap();
        (db, id)
    }

    fn item(guid: &str, title: &str) -> Item {
        Item {
            guid: guid.to_string(),
            title: title.to_string(),
            description: String::new(),
            pub_date: Utc::now() - TimeDelta::days(1),
            media_url: format!("https://example.com/{guid}.mp3"),
            media_type: "audio/mpeg".to_string(),
            file_size: Some(1024),
            explicit: false,
            episode: None,
            season: None,
            episode_type: EpisodeType::Full,
            duration: "10:00".to_string(),
            cover_url: None,
            website: None,
            keywords: String::new(),
        }
    }

    fn guids(episodes: &[Episode]) -> Vec<String> {
        let mut guids: Vec<String> = episodes.iter().map(|e| e.guid.clone()).collect();
        guids.sort();
        guids
    }

    #[tokio::test]
    async fn test_sync_inserts_new_episodes() {
        let (db, id) = test_db().await;
        let sync = db
            .sync_episodes(id, &[item("a", "A"), item("b", "B")])
            .await
            .unwrap();

        assert_eq!(sync, EpisodeSync { inserted: 2, updated: 0, deleted: 0 });
        let episodes = db.get_episodes(id).await.unwrap();
        assert_eq!(guids(&episodes), vec!["a", "b"]);
        assert_eq!(episodes[0].media_type, "audio/mpeg");
        assert_eq!(episodes[0].duration_in_seconds(), Some(600));
    }

    #[tokio::test]
    async fn test_sync_replaces_episode_set() {
        let (db, id) = test_db().await;
        db.sync_episodes(id, &[item("A", "a"), item("B", "b"), item("C", "c")])
            .await
            .unwrap();

        let sync = db
            .sync_episodes(id, &[item("B", "b2"), item("C", "c2"), item("D", "d")])
            .await
            .unwrap();

        assert_eq!(sync, EpisodeSync { inserted: 1, updated: 2, deleted: 1 });
        let episodes = db.get_episodes(id).await.unwrap();
        assert_eq!(guids(&episodes), vec!["B", "C", "D"]);
        let b = episodes.iter().find(|e| e.guid == "B").unwrap();
        assert_eq!(b.title, "b2");
    }

    #[tokio::test]
    async fn test_sync_unchanged_is_noop() {
        let (db, id) = test_db().await;
        let items = vec![item("a", "A"), item("b", "B")];
        db.sync_episodes(id, &items).await.unwrap();

        let sync = db.sync_episodes(id, &items).await.unwrap();
        assert!(sync.is_empty());
    }

    #[tokio::test]
    async fn test_sync_keeps_last_duplicate_guid() {
        let (db, id) = test_db().await;
        let sync = db
            .sync_episodes(id, &[item("a", "first"), item("b", "B"), item("a", "last")])
            .await
            .unwrap();

        assert_eq!(sync.inserted, 2);
        let episodes = db.get_episodes(id).await.unwrap();
        let a = episodes.iter().find(|e| e.guid == "a").unwrap();
        assert_eq!(a.title, "last");
    }

    #[tokio::test]
    async fn test_sync_is_scoped_to_podcast() {
        let (db, first) = test_db().await;
        let second = db.insert_podcast("https://other.example.com/rss").await.unwrap();

        db.sync_episodes(first, &[item("shared", "one")]).await.unwrap();
        db.sync_episodes(second, &[item("shared", "two")]).await.unwrap();
        db.sync_episodes(second, &[item("other", "x")]).await.unwrap();

        assert_eq!(guids(&db.get_episodes(first).await.unwrap()), vec!["shared"]);
        assert_eq!(guids(&db.get_episodes(second).await.unwrap()), vec!["other"]);
    }

    #[tokio::test]
    async fn test_sync_large_feed_batches() {
        let (db, id) = test_db().await;
        let items: Vec<Item> = (0..1250)
            .map(|i| item(&format!("guid-{i}"), &format!("Episode {i}")))
            .collect();

        let sync = db.sync_episodes(id, &items).await.unwrap();
        assert_eq!(sync.inserted, 1250);

        let renamed: Vec<Item> = items
            .iter()
            .skip(50)
            .map(|i| Item { title: format!("{} (remastered)", i.title), ..i.clone() })
            .collect();
        let sync = db.sync_episodes(id, &renamed).await.unwrap();
        assert_eq!(sync, EpisodeSync { inserted: 0, updated: 1200, deleted: 50 });
    }

    #[tokio::test]
    async fn test_sync_empty_deletes_all() {
        let (db, id) = test_db().await;
        db.sync_episodes(id, &[item("a", "A")]).await.unwrap();
        let sync = db.sync_episodes(id, &[]).await.unwrap();
        assert_eq!(sync.deleted, 1);
        assert!(db.get_episodes(id).await.unwrap().is_empty());
    }

    #[test]
    fn test_dedupe_preserves_order() {
        let items = vec![item("a", "1"), item("b", "2"), item("a", "3"), item("c", "4")];
        let titles: Vec<&str> = dedupe_by_guid(&items).iter().map(|i| i.title.as_str()).collect();
        assert_eq!(titles, vec!["2", "3", "4"]);
    }
}
