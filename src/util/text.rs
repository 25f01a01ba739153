use std::borrow::Cow;

/// Strips control characters that feeds occasionally smuggle into titles.
///
/// Removes ASCII control chars (0x00-0x08, 0x0B-0x0C, 0x0E-0x1F, 0x7F) and
/// ANSI escape sequences. Tab, newline and carriage return are preserved.
///
/// Returns `Cow::Borrowed` when nothing needs stripping (the common case).
pub fn strip_control_chars(s: &str) -> Cow<'_, str> {
    let needs_strip = s
        .bytes()
        .any(|b| b == 0x1b || b == 0x7f || (b < 0x20 && b != b'\t' && b != b'\n' && b != b'\r'));

    if !needs_strip {
        return Cow::Borrowed(s);
    }

    let mut out = String::with_capacity(s.len());
    let mut chars = s.chars().peekable();

    while let Some(c) = chars.next() {
        match c {
            '\x1b' => match chars.peek() {
                // CSI: skip parameters up to the final byte in 0x40..=0x7E
                Some('[') => {
                    chars.next();
                    for c in chars.by_ref() {
                        if ('\x40'..='\x7e').contains(&c) {
                            break;
                        }
                    }
                }
                // OSC: skip until BEL or ST
                Some(']') => {
                    chars.next();
                    while let Some(c) = chars.next() {
                        if c == '\x07' {
                            break;
                        }
                        if c == '\x1b' && chars.peek() == Some(&'\\') {
                            chars.next();
                            break;
                        }
                    }
                }
                _ => {}
            },
            '\t' | '\n' | '\r' => out.push(c),
            c if (c as u32) < 0x20 || c == '\x7f' => {}
            c => out.push(c),
        }
    }

    Cow::Owned(out)
}

/// Removes HTML markup from feed descriptions and collapses whitespace.
///
/// Tags are dropped, `<script>`/`<style>` bodies are dropped with them, and
/// common named plus numeric entities are decoded. The result is plain text
/// suitable for tokenization, not for display.
pub fn strip_html(s: &str) -> String {
    let mut text = String::with_capacity(s.len());
    let mut rest = s;

    while let Some(start) = rest.find('<') {
        text.push_str(&rest[..start]);
        let after = &rest[start..];

        let Some(end) = after.find('>') else {
            // Unterminated tag: treat the remainder as text.
            text.push_str(after);
            rest = "";
            break;
        };

        let tag = after[1..end].trim_start_matches('/').to_ascii_lowercase();
        rest = &after[end + 1..];

        for skipped in ["script", "style"] {
            if tag.starts_with(skipped) && !after[1..].starts_with('/') {
                let closing = format!("</{skipped}");
                rest = match rest.to_ascii_lowercase().find(&closing) {
                    Some(pos) => rest[pos..].find('>').map_or("", |gt| &rest[pos + gt + 1..]),
                    None => "",
                };
            }
        }

        // Tags separate words.
        text.push(' ');
    }
    text.push_str(rest);

    let decoded = decode_entities(&text);
    decoded.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Decodes named and numeric character references, leaving unknown ones as-is.
pub fn decode_entities(s: &str) -> Cow<'_, str> {
    if !s.contains('&') {
        return Cow::Borrowed(s);
    }

    let mut out = String::with_capacity(s.len());
    let mut rest = s;

    while let Some(amp) = rest.find('&') {
        out.push_str(&rest[..amp]);
        let after = &rest[amp + 1..];

        let decoded = after
            .find(';')
            .filter(|&semi| semi <= 10)
            .and_then(|semi| entity_value(&after[..semi]).map(|c| (c, semi)));

        match decoded {
            Some((c, semi)) => {
                out.push(c);
                rest = &after[semi + 1..];
            }
            None => {
                out.push('&');
                rest = after;
            }
        }
    }
    out.push_str(rest);
    Cow::Owned(out)
}

fn entity_value(name: &str) -> Option<char> {
    if let Some(num) = name.strip_prefix('#') {
        let code = match num.strip_prefix(['x', 'X']) {
            Some(hex) => u32::from_str_radix(hex, 16).ok()?,
            None => num.parse().ok()?,
        };
        return char::from_u32(code);
    }

    let c = match name {
        "amp" => '&',
        "lt" => '<',
        "gt" => '>',
        "quot" => '"',
        "apos" => '\'',
        "nbsp" => ' ',
        "ndash" => '–',
        "mdash" => '—',
        "lsquo" => '‘',
        "rsquo" => '’',
        "ldquo" => '“',
        "rdquo" => '”',
        "hellip" => '…',
        "copy" => '©',
        "reg" => '®',
        "trade" => '™',
        _ => return None,
    };
    Some(c)
}
