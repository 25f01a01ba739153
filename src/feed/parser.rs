use chrono::{DateTime, Utc};

use super::element::{parse_document, Element, Selector};
use super::model::{Feed, InvalidRssError, RawFeed, RawItem};

// ============================================================================
// Field extraction strategies
// ============================================================================
//
// Each field lists its sources in priority order; the first non-empty value
// wins.

const FEED_TITLE: &[Selector] = &[Selector::Text(&["title"])];
const FEED_DESCRIPTION: &[Selector] = &[
    Selector::Text(&["description"]),
    Selector::Text(&["itunes:summary"]),
];
const FEED_OWNER: &[Selector] = &[
    Selector::Text(&["itunes:author"]),
    Selector::Text(&["itunes:owner", "itunes:name"]),
];
const FEED_LANGUAGE: &[Selector] = &[Selector::Text(&["language"])];
const FEED_EXPLICIT: &[Selector] = &[Selector::Text(&["itunes:explicit"])];
const FEED_COMPLETE: &[Selector] = &[Selector::Text(&["itunes:complete"])];
const FEED_COVER: &[Selector] = &[
    Selector::Attr(&["itunes:image"], "href"),
    Selector::Text(&["image", "url"]),
];
const FEED_WEBSITE: &[Selector] = &[Selector::Text(&["link"])];
const FEED_FUNDING_URL: &[Selector] = &[Selector::Attr(&["podcast:funding"], "url")];
const FEED_FUNDING_TEXT: &[Selector] = &[Selector::Text(&["podcast:funding"])];
const FEED_CANONICAL: &[Selector] = &[Selector::Text(&["itunes:new-feed-url"])];
const FEED_CATEGORIES: &[Selector] = &[
    Selector::DescendantAttr("itunes:category", "text"),
    Selector::DescendantAttr("googleplay:category", "text"),
    Selector::DescendantAttr("media:category", "label"),
    Selector::DescendantText("media:category"),
];

const ITEM_GUID: &[Selector] = &[Selector::Text(&["guid"])];
const ITEM_TITLE: &[Selector] = &[Selector::Text(&["title"]), Selector::Text(&["itunes:title"])];
const ITEM_DESCRIPTION: &[Selector] = &[
    Selector::Text(&["content:encoded"]),
    Selector::Text(&["description"]),
    Selector::Text(&["itunes:summary"]),
];
const ITEM_PUB_DATE: &[Selector] = &[Selector::Text(&["pubDate"]), Selector::Text(&["pubdate"])];
const ITEM_MEDIA_URL: &[Selector] = &[
    Selector::Attr(&["enclosure"], "url"),
    Selector::Attr(&["media:content"], "url"),
];
const ITEM_MEDIA_TYPE: &[Selector] = &[
    Selector::Attr(&["enclosure"], "type"),
    Selector::Attr(&["media:content"], "type"),
];
const ITEM_FILE_SIZE: &[Selector] = &[
    Selector::Attr(&["enclosure"], "length"),
    Selector::Attr(&["media:content"], "fileSize"),
];
const ITEM_EXPLICIT: &[Selector] = &[Selector::Text(&["itunes:explicit"])];
const ITEM_EPISODE: &[Selector] = &[Selector::Text(&["itunes:episode"])];
const ITEM_SEASON: &[Selector] = &[Selector::Text(&["itunes:season"])];
const ITEM_EPISODE_TYPE: &[Selector] = &[Selector::Text(&["itunes:episodeType"])];
const ITEM_DURATION: &[Selector] = &[Selector::Text(&["itunes:duration"])];
const ITEM_COVER: &[Selector] = &[Selector::Attr(&["itunes:image"], "href")];
const ITEM_WEBSITE: &[Selector] = &[Selector::Text(&["link"])];
const ITEM_CATEGORIES: &[Selector] = &[
    Selector::DescendantAttr("itunes:category", "text"),
    Selector::Text(&["category"]),
];

// ============================================================================
// Parsing
// ============================================================================

/// Parses an RSS (or, failing that, Atom) document into a validated [`Feed`].
pub fn parse_rss(bytes: &[u8]) -> Result<Feed, InvalidRssError> {
    parse_rss_at(bytes, Utc::now())
}

/// [`parse_rss`] against an explicit clock, used for the future-date check.
pub fn parse_rss_at(bytes: &[u8], now: DateTime<Utc>) -> Result<Feed, InvalidRssError> {
    let root = parse_document(bytes);

    let Some(channel) = root.descendants().find(|el| el.name == "channel") else {
        if root.children.iter().any(|el| el.name == "feed") {
            return parse_atom(bytes, now);
        }
        return Err(InvalidRssError::NoChannel);
    };

    let mut raw = raw_feed(channel);

    // RSS 1.0 places items beside the channel rather than inside it.
    if raw.items.is_empty() {
        raw.items = root
            .descendants()
            .filter(|el| el.name == "item")
            .map(raw_item)
            .collect();
    }

    raw.validate(now)
}

fn raw_feed(channel: &Element) -> RawFeed {
    // Channel-level fields only: item subtrees carry their own categories.
    let head = Element {
        children: channel
            .children
            .iter()
            .filter(|el| el.name != "item")
            .cloned()
            .collect(),
        ..Default::default()
    };

    RawFeed {
        title: head.first(FEED_TITLE),
        description: head.first(FEED_DESCRIPTION),
        owner: head.first(FEED_OWNER),
        language: head.first(FEED_LANGUAGE),
        explicit: head.first(FEED_EXPLICIT),
        complete: head.first(FEED_COMPLETE),
        cover_url: head.first(FEED_COVER),
        website: head.first(FEED_WEBSITE),
        funding_url: head.first(FEED_FUNDING_URL),
        funding_text: head.first(FEED_FUNDING_TEXT),
        canonical_url: head.first(FEED_CANONICAL),
        categories: head.all(FEED_CATEGORIES),
        items: channel.children_named("item").map(raw_item).collect(),
    }
}

fn raw_item(item: &Element) -> RawItem {
    RawItem {
        guid: item.first(ITEM_GUID),
        title: item.first(ITEM_TITLE),
        description: item.first(ITEM_DESCRIPTION),
        pub_date: item.first(ITEM_PUB_DATE),
        media_url: item.first(ITEM_MEDIA_URL),
        media_type: item.first(ITEM_MEDIA_TYPE),
        file_size: item.first(ITEM_FILE_SIZE),
        explicit: item.first(ITEM_EXPLICIT),
        episode: item.first(ITEM_EPISODE),
        season: item.first(ITEM_SEASON),
        episode_type: item.first(ITEM_EPISODE_TYPE),
        duration: item.first(ITEM_DURATION),
        cover_url: item.first(ITEM_COVER),
        website: item.first(ITEM_WEBSITE),
        categories: item.all(ITEM_CATEGORIES),
    }
}

/// Atom feeds go through `feed-rs`, then the same validation as RSS.
fn parse_atom(bytes: &[u8], now: DateTime<Utc>) -> Result<Feed, InvalidRssError> {
    let atom = feed_rs::parser::parse(bytes).map_err(|e| InvalidRssError::Malformed(e.to_string()))?;

    let website = alternate_link(&atom.links);
    let raw = RawFeed {
        title: atom.title.map(|t| t.content),
        description: atom.description.map(|t| t.content),
        owner: atom.authors.first().map(|p| p.name.clone()),
        language: atom.language,
        cover_url: atom.logo.or(atom.icon).map(|image| image.uri),
        website,
        categories: atom
            .categories
            .iter()
            .map(|c| c.label.clone().unwrap_or_else(|| c.term.clone()))
            .collect(),
        items: atom.entries.into_iter().map(raw_entry).collect(),
        ..Default::default()
    };

    raw.validate(now)
}

fn raw_entry(entry: feed_rs::model::Entry) -> RawItem {
    let enclosure = entry
        .links
        .iter()
        .find(|link| link.rel.as_deref() == Some("enclosure"));
    let media = entry.media.iter().flat_map(|m| m.content.iter()).next();

    RawItem {
        guid: Some(entry.id.clone()),
        title: entry.title.as_ref().map(|t| t.content.clone()),
        description: entry
            .content
            .as_ref()
            .and_then(|c| c.body.clone())
            .or_else(|| entry.summary.as_ref().map(|s| s.content.clone())),
        pub_date: entry.published.or(entry.updated).map(|dt| dt.to_rfc3339()),
        media_url: enclosure
            .map(|link| link.href.clone())
            .or_else(|| media.and_then(|m| m.url.as_ref()).map(|url| url.to_string())),
        media_type: enclosure
            .and_then(|link| link.media_type.clone())
            .or_else(|| media.and_then(|m| m.content_type.as_ref()).map(|mime| mime.to_string())),
        file_size: enclosure
            .and_then(|link| link.length)
            .or_else(|| media.and_then(|m| m.size))
            .map(|size| size.to_string()),
        duration: media
            .and_then(|m| m.duration)
            .map(|duration| duration.as_secs().to_string()),
        website: alternate_link(&entry.links),
        categories: entry.categories.iter().map(|c| c.term.clone()).collect(),
        ..Default::default()
    }
}

fn alternate_link(links: &[feed_rs::model::Link]) -> Option<String> {
    links
        .iter()
        .find(|link| link.rel.as_deref().map_or(true, |rel| rel == "alternate"))
        .map(|link| link.href.clone())
}
