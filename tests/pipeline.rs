//! Integration tests for the per-podcast pipeline: fetch, parse, reconcile.
//!
//! Each test runs a wiremock server as the feed host and an in-memory SQLite
//! catalog, then checks the podcast row and episode set after each attempt.

use chrono::{TimeDelta, Utc};
use pretty_assertions::assert_eq;
use std::time::Duration;
use wiremock::matchers::{header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use podcrawl::feed::{FetchError, Fetcher};
use podcrawl::reconciler::{PipelineError, ReconcileError, Reconciler};
use podcrawl::scheduler::SchedulePolicy;
use podcrawl::storage::Database;

const MAX_RETRIES: i64 = 2;

async fn test_reconciler() -> Reconciler {
    let db = Database::open(":memory:").await.unwrap();
    let fetcher = Fetcher::with_client(reqwest::Client::new(), Duration::from_secs(5), 1024 * 1024);
    Reconciler::new(db, fetcher, SchedulePolicy::default(), MAX_RETRIES)
}

/// Item fixture: (guid, days ago, media type)
fn rss(title: &str, extra: &str, items: &[(&str, i64, &str)]) -> String {
    let items: String = items
        .iter()
        .map(|(guid, days, media_type)| {
            let date = (Utc::now() - TimeDelta::days(*days)).to_rfc2822();
            format!(
                r#"<item>
                  <guid>{guid}</guid>
                  <title>Episode {guid}</title>
                  <pubDate>{date}</pubDate>
                  <enclosure url="https://cdn.example.com/{guid}.mp3" type="{media_type}" length="100"/>
                </item>"#
            )
        })
        .collect();

    format!(
        r#"<?xml version="1.0" encoding="UTF-8"?>
<rss version="2.0" xmlns:itunes="http://www.itunes.com/dtds/podcast-1.0.dtd">
  <channel>
    <title>{title}</title>
    <description>Conversations about ancient history</description>
    <itunes:author>History Guild</itunes:author>
    <itunes:category text="History"/>
    <itunes:category text="Archaeology"/>
    {extra}
    {items}
  </channel>
</rss>"#
    )
}

fn default_feed() -> String {
    rss(
        "Ancient Rome",
        "",
        &[("A", 3, "audio/mpeg"), ("B", 6, "audio/mpeg"), ("C", 9, "audio/mpeg")],
    )
}

async fn serve(server: &MockServer, route: &str, body: String) {
    Mock::given(method("GET"))
        .and(path(route))
        .respond_with(ResponseTemplate::new(200).set_body_string(body))
        .mount(server)
        .await;
}

async fn guids(reconciler: &Reconciler, id: i64) -> Vec<String> {
    let mut guids: Vec<String> = reconciler
        .database()
        .get_episodes(id)
        .await
        .unwrap()
        .into_iter()
        .map(|e| e.guid)
        .collect();
    guids.sort();
    guids
}

// ============================================================================
// Success Path
// ============================================================================

#[tokio::test]
async fn test_first_parse_populates_podcast() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/feed.xml"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("ETag", "\"v1\"")
                .set_body_string(default_feed()),
        )
        .mount(&server)
        .await;

    let reconciler = test_reconciler().await;
    let db = reconciler.database();
    reconciler.create_category("History").await.unwrap();
    let id = db.insert_podcast(&format!("{}/feed.xml", server.uri())).await.unwrap();

    let report = reconciler.parse_podcast_id(id).await.unwrap();
    assert_eq!(report.num_episodes, 3);
    assert_eq!(report.episodes.inserted, 3);

    let podcast = db.get_podcast(id).await.unwrap().unwrap();
    assert_eq!(podcast.title, "Ancient Rome");
    assert_eq!(podcast.owner, "History Guild");
    assert_eq!(podcast.etag, "\"v1\"");
    assert!(!podcast.content_hash.is_empty());
    assert!(podcast.active);
    assert_eq!(podcast.num_retries, 0);
    assert_eq!(podcast.parser_error, "");
    assert_eq!(podcast.num_episodes, 3);
    assert_eq!(podcast.keywords, "archaeology");
    assert!(podcast.extracted_text.contains("rome"));
    assert!(podcast.parsed.is_some());
    assert!(podcast.frequency >= TimeDelta::days(3));
    let expected = (Utc::now() - TimeDelta::days(3)).timestamp();
    let pub_date = podcast.pub_date.unwrap().timestamp();
    assert!((pub_date - expected).abs() < 60);

    assert_eq!(db.get_podcast_categories(id).await.unwrap(), vec!["History"]);
    assert_eq!(guids(&reconciler, id).await, vec!["A", "B", "C"]);
}

#[tokio::test]
async fn test_episode_set_follows_feed() {
    let server = MockServer::start().await;
    serve(&server, "/feed.xml", default_feed()).await;

    let reconciler = test_reconciler().await;
    let id = reconciler
        .database()
        .insert_podcast(&format!("{}/feed.xml", server.uri()))
        .await
        .unwrap();
    reconciler.parse_podcast_id(id).await.unwrap();

    server.reset().await;
    serve(
        &server,
        "/feed.xml",
        rss(
            "Ancient Rome",
            "",
            &[("B", 6, "audio/mpeg"), ("C", 9, "audio/mpeg"), ("D", 1, "audio/mpeg")],
        ),
    )
    .await;

    let report = reconciler.parse_podcast_id(id).await.unwrap();
    assert_eq!(report.episodes.inserted, 1);
    assert_eq!(report.episodes.deleted, 1);
    assert_eq!(guids(&reconciler, id).await, vec!["B", "C", "D"]);
}

#[tokio::test]
async fn test_non_audio_item_is_dropped() {
    let server = MockServer::start().await;
    serve(
        &server,
        "/feed.xml",
        rss(
            "Mixed Media",
            "",
            &[("audio", 1, "audio/mpeg"), ("video", 2, "video/mpeg")],
        ),
    )
    .await;

    let reconciler = test_reconciler().await;
    let id = reconciler
        .database()
        .insert_podcast(&format!("{}/feed.xml", server.uri()))
        .await
        .unwrap();

    let report = reconciler.parse_podcast_id(id).await.unwrap();
    assert_eq!(report.num_episodes, 1);
    assert_eq!(guids(&reconciler, id).await, vec!["audio"]);
}

#[tokio::test]
async fn test_complete_feed_is_deactivated() {
    let server = MockServer::start().await;
    serve(
        &server,
        "/feed.xml",
        rss("Finished Series", "<itunes:complete>Yes</itunes:complete>", &[("A", 30, "audio/mpeg")]),
    )
    .await;

    let reconciler = test_reconciler().await;
    let id = reconciler
        .database()
        .insert_podcast(&format!("{}/feed.xml", server.uri()))
        .await
        .unwrap();
    reconciler.parse_podcast_id(id).await.unwrap();

    let podcast = reconciler.database().get_podcast(id).await.unwrap().unwrap();
    assert!(podcast.complete);
    assert!(!podcast.active);
    assert_eq!(podcast.parser_error, "");
}

#[tokio::test]
async fn test_new_feed_url_replaces_rss() {
    let server = MockServer::start().await;
    let moved = format!("{}/moved.xml", server.uri());
    serve(
        &server,
        "/feed.xml",
        rss(
            "Moving Podcast",
            &format!("<itunes:new-feed-url>{moved}</itunes:new-feed-url>"),
            &[("A", 1, "audio/mpeg")],
        ),
    )
    .await;

    let reconciler = test_reconciler().await;
    let id = reconciler
        .database()
        .insert_podcast(&format!("{}/feed.xml", server.uri()))
        .await
        .unwrap();
    reconciler.parse_podcast_id(id).await.unwrap();

    let podcast = reconciler.database().get_podcast(id).await.unwrap().unwrap();
    assert_eq!(podcast.rss, moved);
}

// ============================================================================
// Not Modified
// ============================================================================

#[tokio::test]
async fn test_unchanged_body_is_not_modified() {
    let server = MockServer::start().await;
    serve(&server, "/feed.xml", default_feed()).await;

    let reconciler = test_reconciler().await;
    let db = reconciler.database();
    let id = db.insert_podcast(&format!("{}/feed.xml", server.uri())).await.unwrap();
    reconciler.parse_podcast_id(id).await.unwrap();
    let before = db.get_episodes(id).await.unwrap();

    let result = reconciler.parse_podcast_id(id).await;
    assert!(matches!(
        result,
        Err(PipelineError::Fetch(FetchError::NotModified))
    ));

    let podcast = db.get_podcast(id).await.unwrap().unwrap();
    assert_eq!(podcast.parser_error, "not_modified");
    assert_eq!(podcast.num_retries, 0);
    assert!(podcast.active);
    assert_eq!(db.get_episodes(id).await.unwrap(), before);
}

#[tokio::test]
async fn test_conditional_request_304() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/feed.xml"))
        .and(header("If-None-Match", "\"v1\""))
        .respond_with(ResponseTemplate::new(304))
        .with_priority(1)
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/feed.xml"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("ETag", "\"v1\"")
                .set_body_string(default_feed()),
        )
        .mount(&server)
        .await;

    let reconciler = test_reconciler().await;
    let id = reconciler
        .database()
        .insert_podcast(&format!("{}/feed.xml", server.uri()))
        .await
        .unwrap();
    reconciler.parse_podcast_id(id).await.unwrap();

    let result = reconciler.parse_podcast_id(id).await;
    assert!(matches!(
        result,
        Err(PipelineError::Fetch(FetchError::NotModified))
    ));
}

// ============================================================================
// Failure Paths
// ============================================================================

#[tokio::test]
async fn test_gone_feed_is_discontinued() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(410))
        .mount(&server)
        .await;

    let reconciler = test_reconciler().await;
    let id = reconciler
        .database()
        .insert_podcast(&format!("{}/feed.xml", server.uri()))
        .await
        .unwrap();

    let result = reconciler.parse_podcast_id(id).await;
    assert!(matches!(
        result,
        Err(PipelineError::Fetch(FetchError::Discontinued))
    ));

    let podcast = reconciler.database().get_podcast(id).await.unwrap().unwrap();
    assert!(!podcast.active);
    assert_eq!(podcast.parser_error, "discontinued");
    assert_eq!(podcast.num_retries, 0);
}

#[tokio::test]
async fn test_retry_ceiling_deactivates() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&server)
        .await;

    let reconciler = test_reconciler().await;
    let db = reconciler.database();
    let id = db.insert_podcast(&format!("{}/feed.xml", server.uri())).await.unwrap();

    for attempt in 1..=MAX_RETRIES {
        let err = reconciler.parse_podcast_id(id).await.unwrap_err();
        assert_eq!(err.code(), "inaccessible");
        let podcast = db.get_podcast(id).await.unwrap().unwrap();
        assert_eq!(podcast.num_retries, attempt);
        assert!(podcast.active);
    }

    reconciler.parse_podcast_id(id).await.unwrap_err();
    let podcast = db.get_podcast(id).await.unwrap().unwrap();
    assert_eq!(podcast.num_retries, MAX_RETRIES + 1);
    assert!(!podcast.active);
    assert!(podcast.parsed.is_some());
}

#[tokio::test]
async fn test_server_error_is_unavailable() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(503))
        .mount(&server)
        .await;

    let reconciler = test_reconciler().await;
    let id = reconciler
        .database()
        .insert_podcast(&format!("{}/feed.xml", server.uri()))
        .await
        .unwrap();

    let err = reconciler.parse_podcast_id(id).await.unwrap_err();
    assert_eq!(err.code(), "unavailable");

    let podcast = reconciler.database().get_podcast(id).await.unwrap().unwrap();
    assert_eq!(podcast.parser_error, "unavailable");
    assert_eq!(podcast.num_retries, 1);
}

#[tokio::test]
async fn test_invalid_rss_counts_retry_and_keeps_episodes() {
    let server = MockServer::start().await;
    serve(&server, "/feed.xml", default_feed()).await;

    let reconciler = test_reconciler().await;
    let id = reconciler
        .database()
        .insert_podcast(&format!("{}/feed.xml", server.uri()))
        .await
        .unwrap();
    reconciler.parse_podcast_id(id).await.unwrap();

    server.reset().await;
    serve(
        &server,
        "/feed.xml",
        "<html><body>Maintenance</body></html>".to_string(),
    )
    .await;

    let err = reconciler.parse_podcast_id(id).await.unwrap_err();
    assert_eq!(err.code(), "invalid_rss");

    let podcast = reconciler.database().get_podcast(id).await.unwrap().unwrap();
    assert_eq!(podcast.num_retries, 1);
    assert_eq!(podcast.title, "Ancient Rome");
    assert_eq!(guids(&reconciler, id).await, vec!["A", "B", "C"]);
}

#[tokio::test]
async fn test_missing_podcast() {
    let reconciler = test_reconciler().await;
    let err = reconciler.parse_podcast_id(404).await.unwrap_err();
    assert_eq!(err.code(), "missing");
}

// ============================================================================
// Duplicate Detection
// ============================================================================

#[tokio::test]
async fn test_redirect_to_known_feed_is_duplicate() {
    let server = MockServer::start().await;
    serve(&server, "/a.xml", default_feed()).await;
    Mock::given(method("GET"))
        .and(path("/b.xml"))
        .respond_with(ResponseTemplate::new(301).insert_header("Location", "/a.xml"))
        .mount(&server)
        .await;

    let reconciler = test_reconciler().await;
    let db = reconciler.database();
    let first = db.insert_podcast(&format!("{}/a.xml", server.uri())).await.unwrap();
    let second = db.insert_podcast(&format!("{}/b.xml", server.uri())).await.unwrap();

    reconciler.parse_podcast_id(first).await.unwrap();
    let result = reconciler.parse_podcast_id(second).await;

    match result {
        Err(PipelineError::Reconcile(ReconcileError::Duplicate { canonical_id })) => {
            assert_eq!(canonical_id, first);
        }
        other => panic!("expected duplicate, got {other:?}"),
    }

    let first_row = db.get_podcast(first).await.unwrap().unwrap();
    let second_row = db.get_podcast(second).await.unwrap().unwrap();
    assert_eq!(first_row.canonical, None);
    assert!(first_row.active);
    assert_eq!(second_row.canonical, Some(first));
    assert!(!second_row.active);
    assert_eq!(second_row.parser_error, "duplicate");
    assert!(db.get_episodes(second).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_same_body_is_duplicate_of_canonical_root() {
    let server = MockServer::start().await;
    for route in ["/a.xml", "/b.xml", "/c.xml"] {
        serve(&server, route, default_feed()).await;
    }

    let reconciler = test_reconciler().await;
    let db = reconciler.database();
    let a = db.insert_podcast(&format!("{}/a.xml", server.uri())).await.unwrap();
    let b = db.insert_podcast(&format!("{}/b.xml", server.uri())).await.unwrap();
    let c = db.insert_podcast(&format!("{}/c.xml", server.uri())).await.unwrap();

    reconciler.parse_podcast_id(a).await.unwrap();
    let err = reconciler.parse_podcast_id(b).await.unwrap_err();
    assert_eq!(err.code(), "duplicate");
    let err = reconciler.parse_podcast_id(c).await.unwrap_err();
    assert_eq!(err.code(), "duplicate");

    assert_eq!(db.get_podcast(b).await.unwrap().unwrap().canonical, Some(a));
    assert_eq!(db.get_podcast(c).await.unwrap().unwrap().canonical, Some(a));
}

#[tokio::test]
async fn test_revived_duplicate_never_forms_canonical_cycle() {
    let server = MockServer::start().await;
    let a_url = format!("{}/a.xml", server.uri());
    let b_url = format!("{}/b.xml", server.uri());
    let revised = rss(
        "Ancient Rome",
        "",
        &[("A", 3, "audio/mpeg"), ("B", 6, "audio/mpeg"), ("D", 1, "audio/mpeg")],
    );

    // Mocks are tried in mount order; exhausted ones are skipped
    Mock::given(method("GET"))
        .and(path("/a.xml"))
        .respond_with(ResponseTemplate::new(200).set_body_string(default_feed()))
        .up_to_n_times(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/a.xml"))
        .respond_with(ResponseTemplate::new(410))
        .up_to_n_times(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/a.xml"))
        .respond_with(ResponseTemplate::new(301).insert_header("Location", "/b.xml"))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/b.xml"))
        .respond_with(ResponseTemplate::new(200).set_body_string(default_feed()))
        .up_to_n_times(1)
        .mount(&server)
        .await;
    serve(&server, "/b.xml", revised).await;

    let reconciler = test_reconciler().await;
    let db = reconciler.database();
    let a = db.insert_podcast(&a_url).await.unwrap();
    let b = db.insert_podcast(&b_url).await.unwrap();

    reconciler.parse_podcast_id(a).await.unwrap();
    let err = reconciler.parse_podcast_id(b).await.unwrap_err();
    assert_eq!(err.code(), "duplicate");

    let err = reconciler.parse_podcast_id(a).await.unwrap_err();
    assert_eq!(err.code(), "discontinued");

    // With its canonical gone, the former duplicate parses on its own
    reconciler.parse_podcast_id(b).await.unwrap();
    let b_row = db.get_podcast(b).await.unwrap().unwrap();
    assert!(b_row.active);
    assert_eq!(b_row.canonical, None);

    let err = reconciler.parse_podcast_id(a).await.unwrap_err();
    assert_eq!(err.code(), "duplicate");

    let a_row = db.get_podcast(a).await.unwrap().unwrap();
    let b_row = db.get_podcast(b).await.unwrap().unwrap();
    assert_eq!(a_row.canonical, Some(b));
    assert!(!a_row.active);
    assert_eq!(b_row.canonical, None);
    assert!(b_row.active);
}

#[tokio::test]
async fn test_record_panic_releases_claim() {
    let reconciler = test_reconciler().await;
    let db = reconciler.database();
    let id = db.insert_podcast("https://feeds.example.com/show.xml").await.unwrap();

    let claimed = db.select_due(10, reconciler.policy()).await.unwrap();
    assert_eq!(claimed, vec![id]);
    assert!(db.get_podcast(id).await.unwrap().unwrap().queued.is_some());

    reconciler.record_panic(id).await;

    let podcast = db.get_podcast(id).await.unwrap().unwrap();
    assert!(podcast.queued.is_none());
    assert_eq!(podcast.parser_error, "panic");
    assert!(podcast.active);
    assert_eq!(podcast.num_retries, 0);
    // No pub_date yet, so it is due again on the next pass
    assert_eq!(db.select_due(10, reconciler.policy()).await.unwrap(), vec![id]);

    // Unknown ids are ignored
    reconciler.record_panic(id + 100).await;
}
