//! Utility functions shared by the parser and the tokenizer.
//!
//! - **Text scrubbing**: HTML tag and entity removal, control-character stripping
//! - **URL normalization**: tolerant handling of the scheme-less links feeds often carry

mod text;
mod urls;

pub use text::{decode_entities, strip_control_chars, strip_html};
pub use urls::{normalize_url, validate_feed_url, UrlValidationError};
