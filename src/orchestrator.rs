//! Bounded worker pool over due podcasts.
//!
//! A run claims up to `limit` due podcasts, queues their ids on a channel and
//! lets a fixed number of long-lived workers drain it. Each podcast's pipeline
//! is isolated: errors are recorded on the podcast row by the
//! [`Reconciler`], and a panic is caught at the worker boundary so it only
//! costs that one podcast; its claim is released with a `panic` status.

use anyhow::Result;
use futures::FutureExt;
use serde::Serialize;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};

use crate::feed::FetchError;
use crate::reconciler::{ParseReport, PipelineError, ReconcileError, Reconciler};

/// Outcome counts for one run.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RunSummary {
    pub selected: usize,
    pub succeeded: usize,
    pub not_modified: usize,
    pub duplicates: usize,
    pub failed: usize,
    pub panicked: usize,
}

impl RunSummary {
    fn merge(&mut self, other: RunSummary) {
        self.succeeded += other.succeeded;
        self.not_modified += other.not_modified;
        self.duplicates += other.duplicates;
        self.failed += other.failed;
        self.panicked += other.panicked;
    }

    pub fn processed(&self) -> usize {
        self.succeeded + self.not_modified + self.duplicates + self.failed + self.panicked
    }

    fn record(&mut self, podcast_id: i64, outcome: Result<Result<ParseReport, PipelineError>, String>) {
        match outcome {
            Ok(Ok(report)) => {
                self.succeeded += 1;
                tracing::info!(
                    podcast_id,
                    title = %report.title,
                    episodes = report.num_episodes,
                    inserted = report.episodes.inserted,
                    updated = report.episodes.updated,
                    deleted = report.episodes.deleted,
                    frequency_secs = report.frequency,
                    "Podcast parsed"
                );
            }
            Ok(Err(PipelineError::Fetch(FetchError::NotModified))) => {
                self.not_modified += 1;
                tracing::info!(podcast_id, "Podcast not modified");
            }
            Ok(Err(PipelineError::Reconcile(ReconcileError::Duplicate { canonical_id }))) => {
                self.duplicates += 1;
                tracing::info!(podcast_id, canonical_id, "Podcast is a duplicate");
            }
            Ok(Err(err)) => {
                self.failed += 1;
                tracing::warn!(podcast_id, status = err.code(), error = %err, "Podcast update failed");
            }
            Err(panic) => {
                self.panicked += 1;
                tracing::error!(podcast_id, error = %panic, "Podcast pipeline panicked");
            }
        }
    }
}

/// Drives [`Reconciler`] attempts for due podcasts on a fixed worker pool.
pub struct Orchestrator {
    reconciler: Arc<Reconciler>,
    workers: usize,
}

impl Orchestrator {
    pub fn new(reconciler: Arc<Reconciler>, workers: usize) -> Self {
        Self {
            reconciler,
            workers: workers.max(1),
        }
    }

    /// Claim up to `limit` due podcasts and process them.
    pub async fn run(&self, limit: usize) -> Result<RunSummary> {
        let ids = self
            .reconciler
            .database()
            .select_due(limit, self.reconciler.policy())
            .await?;
        tracing::info!(count = ids.len(), limit, "Selected due podcasts");
        Ok(self.process(ids).await)
    }

    /// Process the given podcast ids regardless of schedule.
    pub async fn process(&self, ids: Vec<i64>) -> RunSummary {
        let mut summary = RunSummary {
            selected: ids.len(),
            ..RunSummary::default()
        };
        if ids.is_empty() {
            return summary;
        }

        let (tx, rx) = mpsc::channel(ids.len());
        for id in ids.iter().copied() {
            // Capacity covers every id, so this never waits
            if tx.send(id).await.is_err() {
                break;
            }
        }
        drop(tx);

        let rx = Arc::new(Mutex::new(rx));
        let handles: Vec<_> = (0..self.workers.min(ids.len()))
            .map(|worker| {
                let reconciler = Arc::clone(&self.reconciler);
                let rx = Arc::clone(&rx);
                tokio::spawn(worker_loop(worker, reconciler, rx))
            })
            .collect();

        for result in futures::future::join_all(handles).await {
            match result {
                Ok(partial) => summary.merge(partial),
                Err(e) => tracing::error!(error = %e, "Worker task failed"),
            }
        }

        tracing::info!(
            selected = summary.selected,
            succeeded = summary.succeeded,
            not_modified = summary.not_modified,
            duplicates = summary.duplicates,
            failed = summary.failed,
            panicked = summary.panicked,
            "Run complete"
        );
        summary
    }
}

async fn worker_loop(
    worker: usize,
    reconciler: Arc<Reconciler>,
    rx: Arc<Mutex<mpsc::Receiver<i64>>>,
) -> RunSummary {
    let mut summary = RunSummary::default();

    loop {
        // Hold the lock only while taking one id
        let next = {
            let mut guard = rx.lock().await;
            guard.recv().await
        };
        let Some(podcast_id) = next else {
            break;
        };

        tracing::debug!(worker, podcast_id, "Processing podcast");
        let outcome = catch_panic(reconciler.parse_podcast_id(podcast_id)).await;
        let panicked = outcome.is_err();
        summary.record(podcast_id, outcome);
        if panicked {
            reconciler.record_panic(podcast_id).await;
        }
    }

    summary
}

/// Runs `future`, turning a panic into `Err(message)`.
async fn catch_panic<F, T>(future: F) -> Result<T, String>
where
    F: std::future::Future<Output = T>,
{
    AssertUnwindSafe(future).catch_unwind().await.map_err(|panic| {
        if let Some(s) = panic.downcast_ref::<&'static str>() {
            s.to_string()
        } else if let Some(s) = panic.downcast_ref::<String>() {
            s.clone()
        } else {
            "unknown panic".to_string()
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_catch_panic_returns_message() {
        let result: Result<(), String> = catch_panic(async { panic!("boom") }).await;
        assert_eq!(result, Err("boom".to_string()));

        let result = catch_panic(async { 7 }).await;
        assert_eq!(result, Ok(7));
    }

    #[test]
    fn test_summary_record_and_merge() {
        let mut a = RunSummary::default();
        a.record(1, Ok(Err(FetchError::NotModified.into())));
        a.record(2, Ok(Err(FetchError::Inaccessible(404).into())));
        a.record(3, Err("boom".into()));

        let mut b = RunSummary::default();
        b.record(
            4,
            Ok(Err(ReconcileError::Duplicate { canonical_id: 1 }.into())),
        );
        b.merge(a);

        assert_eq!(b.not_modified, 1);
        assert_eq!(b.failed, 1);
        assert_eq!(b.panicked, 1);
        assert_eq!(b.duplicates, 1);
        assert_eq!(b.processed(), 4);
    }
}
