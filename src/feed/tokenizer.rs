//! Keyword extraction for `extracted_text`.
//!
//! Text is scrubbed of markup, digits and punctuation, case-folded, split
//! into words, lightly lemmatized and filtered against per-language stopword
//! lists. The result feeds the recommender, so stability matters more than
//! linguistic precision.

use std::collections::HashSet;
use std::sync::OnceLock;

use crate::util::strip_html;

use super::Feed;

/// Number of item titles folded into a feed's extracted text.
const ITEM_TITLES: usize = 6;

/// Two-letter ISO 639-1 codes accepted as a feed language.
pub const LANGUAGE_CODES: &[&str] = &[
    "aa", "ab", "ae", "af", "ak", "am", "an", "ar", "as", "av", "ay", "az", "ba", "be", "bg",
    "bi", "bm", "bn", "bo", "br", "bs", "ca", "ce", "ch", "co", "cr", "cs", "cu", "cv", "cy",
    "da", "de", "dv", "dz", "ee", "el", "en", "eo", "es", "et", "eu", "fa", "ff", "fi", "fj",
    "fo", "fr", "fy", "ga", "gd", "gl", "gn", "gu", "gv", "ha", "he", "hi", "ho", "hr", "ht",
    "hu", "hy", "hz", "ia", "id", "ie", "ig", "ii", "ik", "io", "is", "it", "iu", "ja", "jv",
    "ka", "kg", "ki", "kj", "kk", "kl", "km", "kn", "ko", "kr", "ks", "ku", "kv", "kw", "ky",
    "la", "lb", "lg", "li", "ln", "lo", "lt", "lu", "lv", "mg", "mh", "mi", "mk", "ml", "mn",
    "mr", "ms", "mt", "my", "na", "nb", "nd", "ne", "ng", "nl", "nn", "no", "nr", "nv", "ny",
    "oc", "oj", "om", "or", "os", "pa", "pi", "pl", "ps", "pt", "qu", "rm", "rn", "ro", "ru",
    "rw", "sa", "sc", "sd", "se", "sg", "sh", "si", "sk", "sl", "sm", "sn", "so", "sq", "sr",
    "ss", "st", "su", "sv", "sw", "ta", "te", "tg", "th", "ti", "tk", "tl", "tn", "to", "tr",
    "ts", "tt", "tw", "ty", "ug", "uk", "ur", "uz", "ve", "vi", "vo", "wa", "wo", "xh", "yi",
    "yo", "za", "zh", "zu",
];

const CORPORATE_STOPWORDS: &[&str] = &["apple", "patreon", "spotify", "stitcher", "itunes"];

const ENGLISH_STOPWORDS: &[&str] = &[
    "i", "me", "my", "myself", "we", "our", "ours", "ourselves", "you", "your", "yours",
    "yourself", "yourselves", "he", "him", "his", "himself", "she", "her", "hers", "herself",
    "it", "its", "itself", "they", "them", "their", "theirs", "themselves", "what", "which",
    "who", "whom", "this", "that", "these", "those", "am", "is", "are", "was", "were", "be",
    "been", "being", "have", "has", "had", "having", "do", "does", "did", "doing", "a", "an",
    "the", "and", "but", "if", "or", "because", "as", "until", "while", "of", "at", "by",
    "for", "with", "about", "against", "between", "into", "through", "during", "before",
    "after", "above", "below", "to", "from", "up", "down", "in", "out", "on", "off", "over",
    "under", "again", "further", "then", "once", "here", "there", "when", "where", "why",
    "how", "all", "any", "both", "each", "few", "more", "most", "other", "some", "such", "no",
    "nor", "not", "only", "own", "same", "so", "than", "too", "very", "s", "t", "can", "will",
    "just", "don", "dont", "should", "now", "d", "ll", "m", "o", "re", "ve", "y", "ain",
    "aren", "couldn", "didn", "doesn", "hadn", "hasn", "haven", "isn", "ma", "mightn",
    "mustn", "needn", "shan", "shouldn", "wasn", "weren", "won", "wouldn", "im", "ive",
    "youre", "episode", "podcast", "show", "new", "also", "get", "one", "like",
    // dates
    "jan", "january", "feb", "february", "mar", "march", "apr", "april", "may", "jun", "june",
    "jul", "july", "aug", "august", "sep", "sept", "september", "oct", "october", "nov",
    "november", "dec", "december", "mon", "monday", "tue", "tuesday", "wed", "wednesday",
    "thu", "thursday", "fri", "friday", "sat", "saturday", "sun", "sunday",
];

const SPANISH_STOPWORDS: &[&str] = &[
    "de", "la", "que", "el", "en", "y", "a", "los", "del", "se", "las", "por", "un", "para",
    "con", "no", "una", "su", "al", "lo", "como", "más", "pero", "sus", "le", "ya", "o",
    "este", "sí", "porque", "esta", "entre", "cuando", "muy", "sin", "sobre", "también", "me",
    "hasta", "hay", "donde", "quien", "desde", "todo", "nos", "durante", "todos", "uno", "les",
    "ni", "contra", "otros", "ese", "eso", "ante", "ellos", "e", "esto", "mí", "antes",
    "algunos", "qué", "unos", "yo", "otro", "otras", "otra", "él", "tanto", "esa", "estos",
    "mucho", "quienes", "nada", "muchos", "cual", "poco", "ella", "estar", "estas", "es",
    "episodio", "enero", "febrero", "marzo", "abril", "mayo", "junio", "julio", "agosto",
    "septiembre", "octubre", "noviembre", "diciembre", "lunes", "martes", "miércoles",
    "jueves", "viernes", "sábado", "domingo",
];

const FRENCH_STOPWORDS: &[&str] = &[
    "au", "aux", "avec", "ce", "ces", "dans", "de", "des", "du", "elle", "en", "et", "eux",
    "il", "je", "la", "le", "les", "leur", "lui", "ma", "mais", "me", "même", "mes", "moi",
    "mon", "ne", "nos", "notre", "nous", "on", "ou", "par", "pas", "pour", "qu", "que", "qui",
    "sa", "se", "ses", "son", "sur", "ta", "te", "tes", "toi", "ton", "tu", "un", "une", "vos",
    "votre", "vous", "c", "d", "j", "l", "à", "m", "n", "s", "t", "y", "été", "est", "sont",
    "épisode", "janvier", "février", "mars", "avril", "mai", "juin", "juillet", "août",
    "septembre", "octobre", "novembre", "décembre", "lundi", "mardi", "mercredi", "jeudi",
    "vendredi", "samedi", "dimanche",
];

const GERMAN_STOPWORDS: &[&str] = &[
    "aber", "alle", "als", "also", "am", "an", "auch", "auf", "aus", "bei", "bin", "bis",
    "bist", "da", "damit", "dann", "das", "dass", "dem", "den", "der", "des", "dich", "die",
    "dir", "doch", "du", "ein", "eine", "einem", "einen", "einer", "er", "es", "für", "hat",
    "hier", "ich", "ihr", "im", "in", "ist", "ja", "kein", "mich", "mit", "nach", "nicht",
    "noch", "nur", "oder", "sich", "sie", "sind", "so", "um", "und", "uns", "von", "vor",
    "war", "was", "wie", "wir", "zu", "zum", "zur", "folge", "januar", "februar", "märz",
    "april", "mai", "juni", "juli", "august", "september", "oktober", "november", "dezember",
    "montag", "dienstag", "mittwoch", "donnerstag", "freitag", "samstag", "sonntag",
];

fn stopwords(language: &str) -> &'static HashSet<&'static str> {
    static EN: OnceLock<HashSet<&'static str>> = OnceLock::new();
    static ES: OnceLock<HashSet<&'static str>> = OnceLock::new();
    static FR: OnceLock<HashSet<&'static str>> = OnceLock::new();
    static DE: OnceLock<HashSet<&'static str>> = OnceLock::new();
    static OTHER: OnceLock<HashSet<&'static str>> = OnceLock::new();

    let (cell, words): (_, &[&'static str]) = match language {
        "en" => (&EN, ENGLISH_STOPWORDS),
        "es" => (&ES, SPANISH_STOPWORDS),
        "fr" => (&FR, FRENCH_STOPWORDS),
        "de" => (&DE, GERMAN_STOPWORDS),
        _ => (&OTHER, &[]),
    };

    cell.get_or_init(|| {
        CORPORATE_STOPWORDS
            .iter()
            .chain(words)
            .copied()
            .collect()
    })
}

/// True if `code` is a known two-letter language code.
pub fn is_language_code(code: &str) -> bool {
    LANGUAGE_CODES.contains(&code)
}

/// Extracts keywords from free text in `language`.
pub fn tokenize(language: &str, text: &str) -> Vec<String> {
    let cleaned: String = strip_html(text)
        .chars()
        .filter(|c| !c.is_numeric())
        .filter(|c| c.is_alphanumeric() || c.is_whitespace())
        .collect::<String>()
        .to_lowercase();

    let stopwords = stopwords(language);

    cleaned
        .split_whitespace()
        .map(|token| lemmatize(language, token))
        .filter(|token| !token.is_empty() && !stopwords.contains(token.as_str()))
        .collect()
}

/// Builds the search payload stored on a podcast after a successful parse.
pub fn extract_text(feed: &Feed) -> String {
    let mut parts = vec![feed.title.as_str(), feed.description.as_str(), feed.owner.as_str()];

    // Feed categories and item keywords, each term once
    let mut seen = HashSet::new();
    parts.extend(
        feed.categories
            .iter()
            .map(String::as_str)
            .chain(feed.items.iter().flat_map(|item| item.keywords.split_whitespace()))
            .filter(|term| seen.insert(term.to_lowercase())),
    );
    parts.extend(feed.items.iter().take(ITEM_TITLES).map(|item| item.title.as_str()));

    let text = parts
        .into_iter()
        .filter(|part| !part.is_empty())
        .collect::<Vec<_>>()
        .join(" ");

    tokenize(&feed.language, &text).join(" ")
}

/// Reduces English plurals to their singular form; other languages pass through.
fn lemmatize(language: &str, token: &str) -> String {
    if language != "en" || token.chars().count() <= 3 {
        return token.to_owned();
    }

    if let Some(stem) = token.strip_suffix("ies") {
        if stem.len() > 1 {
            return format!("{stem}y");
        }
    }
    if let Some(stem) = token.strip_suffix("sses") {
        return format!("{stem}ss");
    }
    if token.ends_with("ss") || token.ends_with("us") || token.ends_with("is") {
        return token.to_owned();
    }
    match token.strip_suffix('s') {
        Some(stem) => stem.to_owned(),
        None => token.to_owned(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::feed::parse_rss_at;
    use chrono::{TimeZone, Utc};
    use pretty_assertions::assert_eq;

    #[test]
    fn test_tokenize_removes_stopwords_and_markup() {
        let tokens = tokenize("en", "<p>The History of <b>Rome</b></p>");
        assert_eq!(tokens, vec!["history", "rome"]);
    }

    #[test]
    fn test_tokenize_drops_digits_and_punctuation() {
        let tokens = tokenize("en", "Rock'n'roll 1969: Woodstock!!");
        assert_eq!(tokens, vec!["rocknroll", "woodstock"]);
    }

    #[test]
    fn test_tokenize_drops_corporate_and_date_words() {
        let tokens = tokenize("en", "Listen on Spotify every Monday in January");
        assert_eq!(tokens, vec!["listen", "every"]);
    }

    #[test]
    fn test_tokenize_lemmatizes_plurals() {
        let tokens = tokenize("en", "Stories about cats and classes");
        assert_eq!(tokens, vec!["story", "cat", "class"]);
    }

    #[test]
    fn test_tokenize_other_language_keeps_words() {
        let tokens = tokenize("es", "Las historias de España");
        assert_eq!(tokens, vec!["historias", "españa"]);
    }

    #[test]
    fn test_tokenize_unknown_language_only_corporate() {
        let tokens = tokenize("fi", "Apple podcastit");
        assert_eq!(tokens, vec!["podcastit"]);
    }

    #[test]
    fn test_tokenize_empty() {
        assert!(tokenize("en", "").is_empty());
        assert!(tokenize("en", "<br/> 123 !!!").is_empty());
    }

    #[test]
    fn test_extract_text_includes_item_keywords() {
        let xml = r#"<rss><channel><title>Ep</title><category>Zoology</category>
            <item><guid>1</guid><title>Ep</title><pubDate>Mon, 09 Jun 2003 04:00:00 GMT</pubDate>
              <enclosure url="https://example.com/1.mp3" type="audio/mpeg"/>
              <category>Zoology</category><category>Mycology</category></item>
            <item><guid>2</guid><title>Ep</title><pubDate>Tue, 10 Jun 2003 04:00:00 GMT</pubDate>
              <enclosure url="https://example.com/2.mp3" type="audio/mpeg"/>
              <category>mycology</category></item>
          </channel></rss>"#;
        let now = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let feed = parse_rss_at(xml.as_bytes(), now).unwrap();

        let text = extract_text(&feed);
        let count = |word: &str| text.split(' ').filter(|w| *w == word).count();
        assert_eq!(count("zoology"), 1);
        assert_eq!(count("mycology"), 1);
    }

    #[test]
    fn test_language_codes() {
        assert!(is_language_code("en"));
        assert!(is_language_code("zh"));
        assert!(!is_language_code("xx"));
        assert!(!is_language_code("eng"));
    }
}
