use thiserror::Error;
use url::Url;

/// Errors returned when a feed URL is submitted to the catalog.
#[derive(Error, Debug)]
pub enum UrlValidationError {
    /// The URL string could not be parsed.
    #[error("Invalid URL: {0}")]
    InvalidUrl(#[from] url::ParseError),
    /// The URL uses a scheme other than http or https.
    #[error("Unsupported scheme: {0} (only http/https allowed)")]
    UnsupportedScheme(String),
    /// The URL has no host component.
    #[error("URL has no host")]
    MissingHost,
}

/// Validates a URL before it is stored as a podcast `rss`.
///
/// Only absolute `http`/`https` URLs with a host are accepted. The returned
/// string is the parsed form, so equivalent spellings of the same URL
/// (`HTTP://Example.com` vs `http://example.com/`) collapse to one value and
/// the `rss` uniqueness constraint stays meaningful.
pub fn validate_feed_url(url_str: &str) -> Result<String, UrlValidationError> {
    let url = Url::parse(url_str.trim())?;

    match url.scheme() {
        "http" | "https" => {}
        scheme => return Err(UrlValidationError::UnsupportedScheme(scheme.to_owned())),
    }

    match url.host_str() {
        Some(host) if !host.is_empty() => {}
        _ => return Err(UrlValidationError::MissingHost),
    }

    Ok(url.into())
}

/// Normalizes a link found inside a feed.
///
/// Feeds frequently publish bare domains (`example.com/show`), so anything
/// not starting with `http` is prefixed with `http://` before parsing.
/// Returns `None` for empty or unparseable values instead of failing: a bad
/// website or cover link never invalidates an item.
pub fn normalize_url(value: &str) -> Option<String> {
    let value = value.trim();
    if value.is_empty() {
        return None;
    }

    let candidate = if value.starts_with("http") {
        value.to_owned()
    } else {
        format!("http://{value}")
    };

    let url = Url::parse(&candidate).ok()?;
    match url.scheme() {
        "http" | "https" if url.host_str().is_some_and(|h| h.contains('.') || h == "localhost") => {
            Some(candidate)
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_valid_feed_urls() {
        assert!(validate_feed_url("https://example.com/feed.xml").is_ok());
        assert!(validate_feed_url("http://news.example.org/rss").is_ok());
    }

    #[test]
    fn test_feed_url_is_canonicalized() {
        assert_eq!(
            validate_feed_url("  HTTP://Example.COM  ").unwrap(),
            "http://example.com/"
        );
    }

    #[test]
    fn test_feed_url_rejects_other_schemes() {
        assert!(matches!(
            validate_feed_url("ftp://example.com/feed"),
            Err(UrlValidationError::UnsupportedScheme(_))
        ));
        assert!(validate_feed_url("file:///etc/passwd").is_err());
        assert!(validate_feed_url("not a url").is_err());
    }

    #[test]
    fn test_normalize_url_prefixes_scheme() {
        assert_eq!(
            normalize_url("example.com/show").as_deref(),
            Some("http://example.com/show")
        );
        assert_eq!(
            normalize_url(" https://example.com/a.mp3 ").as_deref(),
            Some("https://example.com/a.mp3")
        );
    }

    #[test]
    fn test_normalize_url_rejects_garbage() {
        assert_eq!(normalize_url(""), None);
        assert_eq!(normalize_url("   "), None);
        assert_eq!(normalize_url("not a link"), None);
        assert_eq!(normalize_url("javascript:void(0)"), None);
    }
}
