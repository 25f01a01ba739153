//! Podcast feed ingestion.
//!
//! Due podcasts are selected by the [`scheduler`] policy and the
//! [`storage`] claim query, fetched and parsed by [`feed`], written back by
//! the [`reconciler`], all driven by the [`orchestrator`] worker pool.

pub mod config;
pub mod feed;
pub mod orchestrator;
pub mod reconciler;
pub mod scheduler;
pub mod storage;
pub mod util;
