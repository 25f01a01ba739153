//! Integration tests for scheduled runs: due selection plus the worker pool.
//!
//! These use an on-disk SQLite file so that concurrent workers contend on
//! real database locks.

use chrono::{TimeDelta, Utc};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use podcrawl::feed::Fetcher;
use podcrawl::orchestrator::{Orchestrator, RunSummary};
use podcrawl::reconciler::Reconciler;
use podcrawl::scheduler::SchedulePolicy;
use podcrawl::storage::Database;

struct TempDb {
    path: PathBuf,
}

impl TempDb {
    fn new(name: &str) -> Self {
        let nanos = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_nanos())
            .unwrap_or(0);
        let path = std::env::temp_dir().join(format!(
            "podcrawl-{}-{}-{}.db",
            name,
            std::process::id(),
            nanos
        ));
        Self { path }
    }
}

impl Drop for TempDb {
    fn drop(&mut self) {
        for suffix in ["", "-wal", "-shm", "-journal"] {
            let mut file = self.path.clone().into_os_string();
            file.push(suffix);
            let _ = std::fs::remove_file(file);
        }
    }
}

async fn test_orchestrator(temp: &TempDb, workers: usize) -> (Arc<Reconciler>, Orchestrator) {
    let db = Database::open(temp.path.to_str().unwrap()).await.unwrap();
    let fetcher = Fetcher::with_client(reqwest::Client::new(), Duration::from_secs(5), 1024 * 1024);
    let reconciler = Arc::new(Reconciler::new(db, fetcher, SchedulePolicy::default(), 3));
    let orchestrator = Orchestrator::new(Arc::clone(&reconciler), workers);
    (reconciler, orchestrator)
}

fn feed(title: &str, guids: &[&str]) -> String {
    let items: String = guids
        .iter()
        .enumerate()
        .map(|(i, guid)| {
            let date = (Utc::now() - TimeDelta::days(i as i64 + 1)).to_rfc2822();
            format!(
                r#"<item><guid>{guid}</guid><title>{guid}</title><pubDate>{date}</pubDate>
                   <enclosure url="https://cdn.example.com/{guid}.mp3" type="audio/mpeg"/></item>"#
            )
        })
        .collect();
    format!(r#"<rss version="2.0"><channel><title>{title}</title>{items}</channel></rss>"#)
}

#[tokio::test]
async fn test_run_isolates_failures() {
    let server = MockServer::start().await;
    for i in 0..4 {
        Mock::given(method("GET"))
            .and(path(format!("/ok-{i}.xml")))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_string(feed(&format!("Show {i}"), &[&format!("{i}-a"), &format!("{i}-b")])),
            )
            .mount(&server)
            .await;
    }
    Mock::given(method("GET"))
        .and(path("/missing.xml"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/broken.xml"))
        .respond_with(ResponseTemplate::new(500))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/gone.xml"))
        .respond_with(ResponseTemplate::new(410))
        .mount(&server)
        .await;

    let temp = TempDb::new("isolation");
    let (reconciler, orchestrator) = test_orchestrator(&temp, 3).await;
    let db = reconciler.database();

    let mut ok_ids = Vec::new();
    for i in 0..4 {
        ok_ids.push(db.insert_podcast(&format!("{}/ok-{i}.xml", server.uri())).await.unwrap());
    }
    for route in ["missing", "broken", "gone"] {
        db.insert_podcast(&format!("{}/{route}.xml", server.uri())).await.unwrap();
    }

    let summary = orchestrator.run(100).await.unwrap();

    assert_eq!(
        summary,
        RunSummary {
            selected: 7,
            succeeded: 4,
            not_modified: 0,
            duplicates: 0,
            failed: 3,
            panicked: 0,
        }
    );

    for id in ok_ids {
        let podcast = db.get_podcast(id).await.unwrap().unwrap();
        assert_eq!(podcast.parser_error, "");
        assert!(podcast.queued.is_none());
        assert_eq!(db.get_episodes(id).await.unwrap().len(), 2);
    }
}

#[tokio::test]
async fn test_run_respects_limit_and_schedule() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200).set_body_string(feed("Daily", &["a", "b", "c"])))
        .mount(&server)
        .await;

    let temp = TempDb::new("limit");
    let (reconciler, orchestrator) = test_orchestrator(&temp, 2).await;
    let db = reconciler.database();
    for i in 0..5 {
        db.insert_podcast(&format!("{}/feed-{i}.xml", server.uri())).await.unwrap();
    }

    let first = orchestrator.run(3).await.unwrap();
    assert_eq!(first.selected, 3);
    assert_eq!(first.processed(), 3);

    // Identical bodies, so only one podcast survives the first run
    assert_eq!(first.succeeded, 1);
    assert_eq!(first.duplicates, 2);

    let second = orchestrator.run(10).await.unwrap();
    assert_eq!(second.selected, 2);
    assert_eq!(second.duplicates, 2);

    // Everything parsed a moment ago with a daily cadence: nothing is due
    let third = orchestrator.run(10).await.unwrap();
    assert_eq!(third.selected, 0);
}

#[tokio::test]
async fn test_process_empty_list() {
    let temp = TempDb::new("empty");
    let (_reconciler, orchestrator) = test_orchestrator(&temp, 4).await;
    let summary = orchestrator.process(Vec::new()).await;
    assert_eq!(summary, RunSummary::default());
}
