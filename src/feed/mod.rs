//! Feed retrieval and parsing.
//!
//! - **Fetching**: conditional HTTP GET with ETag/Last-Modified and content-hash
//!   short-circuiting, classified into typed outcomes
//! - **Parsing**: tolerant RSS reading with ordered per-field fallbacks, Atom via `feed-rs`
//! - **Validation**: item-level rejects are skipped, feed-level rejects are typed errors
//! - **Tokenizing**: the `extracted_text` payload consumed by the recommender
//!
//! # Example
//!
//! ```ignore
//! use podcrawl::feed::{parse_rss, CacheValidators, Fetcher};
//!
//! let response = fetcher.fetch(&podcast.rss, &CacheValidators::default()).await?;
//! let feed = parse_rss(&response.content)?;
//! ```

mod dates;
mod element;
mod fetcher;
mod model;
mod parser;
pub mod tokenizer;

pub use dates::{http_date, parse_date};
pub use fetcher::{
    make_content_hash, quote_etag, CacheValidators, FetchError, FetchResponse, Fetcher,
    TransportError,
};
pub use model::{normalize_duration, EpisodeType, Feed, InvalidRssError, Item, ItemError};
pub use parser::{parse_rss, parse_rss_at};
