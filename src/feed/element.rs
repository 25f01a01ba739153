//! Tolerant XML element tree.
//!
//! Real-world podcast feeds are frequently malformed: mismatched end tags,
//! stray `&` characters, invalid UTF-8, HTML entities that XML does not
//! define. Text is decoded with the encoding the XML declaration names
//! (Windows-1252 and Latin-1 feeds are common), falling back to lossy UTF-8. This module reads whatever quick-xml can make sense of into a small
//! owned tree and stops (keeping everything read so far) at the first hard
//! error instead of rejecting the document.
//!
//! Namespace prefixes are rewritten to canonical ones (`itunes`, `content`,
//! `googleplay`, `media`, `podcast`, `atom`) using the document's `xmlns`
//! declarations, so selectors work regardless of the prefix a feed chose.

use std::borrow::Cow;
use std::collections::HashMap;

use quick_xml::encoding::Decoder;
use quick_xml::escape::{resolve_predefined_entity, unescape_with};
use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;

use crate::util::decode_entities;

/// Elements nested deeper than this are skipped, along with their subtree.
const MAX_DEPTH: usize = 128;

const NAMESPACES: &[(&str, &str)] = &[
    ("http://www.itunes.com/dtds/podcast-1.0.dtd", "itunes"),
    ("http://www.itunes.com/dtds/podcast-1.0.dtd/", "itunes"),
    ("http://purl.org/rss/1.0/modules/content/", "content"),
    ("http://www.google.com/schemas/play-podcasts/1.0", "googleplay"),
    ("http://www.google.com/schemas/play-podcasts/1.0/", "googleplay"),
    ("http://search.yahoo.com/mrss/", "media"),
    ("http://search.yahoo.com/mrss", "media"),
    ("https://podcastindex.org/namespace/1.0", "podcast"),
    (
        "https://github.com/Podcastindex-org/podcast-namespace/blob/main/docs/1.0.md",
        "podcast",
    ),
    ("http://www.w3.org/2005/Atom", "atom"),
];

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Element {
    pub name: String,
    pub attributes: Vec<(String, String)>,
    pub text: String,
    pub children: Vec<Element>,
}

/// One strategy for extracting a value from an element.
///
/// Paths are relative to the element the selector is evaluated on; each step
/// names a direct child.
#[derive(Debug, Clone, Copy)]
pub enum Selector {
    /// Text content of the element at the path.
    Text(&'static [&'static str]),
    /// An attribute of the element at the path.
    Attr(&'static [&'static str], &'static str),
    /// Text content of every descendant with this name, at any depth.
    DescendantText(&'static str),
    /// An attribute of every descendant with this name, at any depth.
    DescendantAttr(&'static str, &'static str),
}

impl Element {
    fn new(name: String) -> Self {
        Self {
            name,
            ..Default::default()
        }
    }

    pub fn attr(&self, name: &str) -> Option<&str> {
        self.attributes
            .iter()
            .find(|(key, _)| key == name)
            .map(|(_, value)| value.as_str())
    }

    pub fn child(&self, name: &str) -> Option<&Element> {
        self.children.iter().find(|c| c.name == name)
    }

    pub fn children_named<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a Element> + 'a {
        self.children.iter().filter(move |c| c.name == name)
    }

    /// Depth-first iterator over every element below this one.
    pub fn descendants(&self) -> Descendants<'_> {
        Descendants {
            stack: self.children.iter().rev().collect(),
        }
    }

    /// All elements reached by following `path` from this element.
    pub fn select<'a>(&'a self, path: &[&str]) -> Vec<&'a Element> {
        let mut current = vec![self];
        for step in path {
            current = current
                .into_iter()
                .flat_map(|el| el.children.iter().filter(move |c| c.name == *step))
                .collect();
        }
        current
    }

    fn values<'a>(&'a self, selector: &Selector) -> Vec<&'a str> {
        match *selector {
            Selector::Text(path) => self.select(path).into_iter().map(|el| el.text.as_str()).collect(),
            Selector::Attr(path, attr) => self
                .select(path)
                .into_iter()
                .filter_map(|el| el.attr(attr))
                .collect(),
            Selector::DescendantText(name) => self
                .descendants()
                .filter(|el| el.name == name)
                .map(|el| el.text.as_str())
                .collect(),
            Selector::DescendantAttr(name, attr) => self
                .descendants()
                .filter(|el| el.name == name)
                .filter_map(|el| el.attr(attr))
                .collect(),
        }
    }

    /// Evaluates `selectors` in order and returns the first non-empty value.
    pub fn first(&self, selectors: &[Selector]) -> Option<String> {
        selectors.iter().find_map(|selector| {
            self.values(selector)
                .into_iter()
                .map(str::trim)
                .find(|v| !v.is_empty())
                .map(str::to_owned)
        })
    }

    /// Every non-empty value matched by any of `selectors`, in selector order.
    pub fn all(&self, selectors: &[Selector]) -> Vec<String> {
        selectors
            .iter()
            .flat_map(|selector| self.values(selector))
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .map(str::to_owned)
            .collect()
    }
}

pub struct Descendants<'a> {
    stack: Vec<&'a Element>,
}

impl<'a> Iterator for Descendants<'a> {
    type Item = &'a Element;

    fn next(&mut self) -> Option<Self::Item> {
        let el = self.stack.pop()?;
        self.stack.extend(el.children.iter().rev());
        Some(el)
    }
}

/// Reads `bytes` into a tree rooted at an unnamed document element.
///
/// Never fails: a document that is not XML at all yields an empty root.
pub fn parse_document(bytes: &[u8]) -> Element {
    let bytes = bytes.strip_prefix(b"\xEF\xBB\xBF").unwrap_or(bytes);

    let mut reader = Reader::from_reader(bytes);
    let config = reader.config_mut();
    config.trim_text(true);
    config.check_end_names = false;
    config.allow_unmatched_ends = true;
    config.expand_empty_elements = false;

    let mut builder = TreeBuilder::new();

    loop {
        match reader.read_event() {
            Ok(Event::Start(start)) => builder.open(&start, reader.decoder()),
            Ok(Event::Empty(start)) => {
                builder.open(&start, reader.decoder());
                builder.close();
            }
            Ok(Event::End(_)) => builder.close(),
            Ok(Event::Text(text)) => builder.text(&decode_text(&text, reader.decoder())),
            Ok(Event::CData(cdata)) => builder.text(&decode(&cdata, reader.decoder())),
            Ok(Event::Eof) => break,
            Ok(_) => {}
            Err(e) => {
                tracing::debug!(
                    position = reader.error_position(),
                    error = %e,
                    "Malformed XML, keeping partial document"
                );
                break;
            }
        }
    }

    builder.finish()
}

struct TreeBuilder {
    /// Open elements; index 0 is the unnamed document root.
    stack: Vec<Element>,
    namespaces: HashMap<String, &'static str>,
    /// Open elements beyond `MAX_DEPTH` that were not pushed.
    skipped: usize,
}

impl TreeBuilder {
    fn new() -> Self {
        Self {
            stack: vec![Element::new(String::new())],
            namespaces: HashMap::new(),
            skipped: 0,
        }
    }

    fn open(&mut self, start: &BytesStart<'_>, decoder: Decoder) {
        if self.skipped > 0 || self.stack.len() > MAX_DEPTH {
            self.skipped += 1;
            return;
        }

        let mut attributes = Vec::new();
        for attr in start.attributes().with_checks(false).flatten() {
            let key = decode(attr.key.as_ref(), decoder).into_owned();
            let value = decode_text(&attr.value, decoder);

            if let Some(prefix) = key.strip_prefix("xmlns:") {
                if let Some((_, canonical)) = NAMESPACES.iter().find(|(uri, _)| *uri == value.trim()) {
                    self.namespaces.insert(prefix.to_owned(), canonical);
                }
            }
            attributes.push((self.canonical_name(&key), value));
        }

        let name = self.canonical_name(&decode(start.name().as_ref(), decoder));
        let mut element = Element::new(name);
        element.attributes = attributes;
        self.stack.push(element);
    }

    fn close(&mut self) {
        if self.skipped > 0 {
            self.skipped -= 1;
            return;
        }
        // Unmatched end tags with nothing open are ignored.
        if self.stack.len() > 1 {
            if let Some(element) = self.stack.pop() {
                if let Some(parent) = self.stack.last_mut() {
                    parent.children.push(element);
                }
            }
        }
    }

    fn text(&mut self, text: &str) {
        if self.skipped > 0 {
            return;
        }
        if let Some(current) = self.stack.last_mut() {
            if !current.text.is_empty() {
                current.text.push(' ');
            }
            current.text.push_str(text);
        }
    }

    fn canonical_name(&self, name: &str) -> String {
        match name.split_once(':') {
            Some((prefix, local)) if prefix != "xmlns" => match self.namespaces.get(prefix) {
                Some(canonical) => format!("{canonical}:{local}"),
                None => name.to_owned(),
            },
            _ => name.to_owned(),
        }
    }

    /// Closes every element still open and returns the document root.
    fn finish(mut self) -> Element {
        while self.stack.len() > 1 {
            self.close();
        }
        self.stack.pop().unwrap_or_default()
    }
}

/// Decodes with the document's declared encoding, or lossy UTF-8 when the
/// bytes do not fit it.
fn decode(raw: &[u8], decoder: Decoder) -> Cow<'_, str> {
    decoder
        .decode(raw)
        .unwrap_or_else(|_| String::from_utf8_lossy(raw))
}

fn decode_text(raw: &[u8], decoder: Decoder) -> String {
    let text = decode(raw, decoder);
    match unescape_with(&text, resolve_entity) {
        Ok(Cow::Borrowed(_)) => text.into_owned(),
        Ok(Cow::Owned(unescaped)) => unescaped,
        // Stray `&` or unknown entities: decode what can be decoded.
        Err(_) => decode_entities(&text).into_owned(),
    }
}

/// XML's predefined entities plus the HTML ones feeds commonly leak.
fn resolve_entity(entity: &str) -> Option<&'static str> {
    resolve_predefined_entity(entity).or(match entity {
        "nbsp" => Some("\u{a0}"),
        "ndash" => Some("\u{2013}"),
        "mdash" => Some("\u{2014}"),
        "lsquo" => Some("\u{2018}"),
        "rsquo" => Some("\u{2019}"),
        "ldquo" => Some("\u{201c}"),
        "rdquo" => Some("\u{201d}"),
        "hellip" => Some("\u{2026}"),
        "copy" => Some("\u{a9}"),
        "reg" => Some("\u{ae}"),
        "trade" => Some("\u{2122}"),
        _ => None,
    })
}
