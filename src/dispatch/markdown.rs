//! Best-effort Markdown for message bodies: links, phone numbers and street
//! addresses become clickable. Emoji-only messages are left alone.
use percent_encoding::{utf8_percent_encode, NON_ALPHANUMERIC};

const STREET_SUFFIXES: &[&str] = &[
    "st", "street", "ave", "avenue", "rd", "road", "blvd", "boulevard", "ln", "lane", "dr",
    "drive", "way", "ct", "court", "pl", "place", "ter", "terrace", "hwy", "highway",
];

/// True when every non-space character is a non-ASCII symbol (emoji,
/// joiners, variation selectors).
pub fn is_emoji_only(text: &str) -> bool {
    let mut chars = text.chars().filter(|c| !c.is_whitespace()).peekable();
    chars.peek().is_some() && chars.all(|c| !c.is_ascii() && !c.is_alphanumeric())
}

pub fn render(text: &str) -> String {
    if is_emoji_only(text) {
        return text.to_string();
    }
    let segments = split_segments(text);
    let mut out = String::with_capacity(text.len());
    let mut i = 0;
    while i < segments.len() {
        let (is_space, seg) = segments[i];
        if is_space {
            out.push_str(seg);
            i += 1;
            continue;
        }
        if let Some(end) = address_end(&segments, i) {
            let raw: String = segments[i..=end].iter().map(|(_, s)| *s).collect();
            let (core, trail) = split_trailing(&raw);
            out.push_str(&format!(
                "[{}](http://maps.apple.com/?address={}){}",
                core,
                utf8_percent_encode(core, NON_ALPHANUMERIC),
                trail
            ));
            i = end + 1;
            continue;
        }
        let (core, trail) = split_trailing(seg);
        if core.starts_with("http://") || core.starts_with("https://") {
            out.push_str(&format!("[{}]({}){}", core, core, trail));
        } else if core.starts_with("www.") && core.len() > 4 {
            out.push_str(&format!("[{}](http://{}){}", core, core, trail));
        } else if is_phone(core) {
            out.push_str(&format!("[{}](tel:{}){}", core, core, trail));
        } else {
            out.push_str(seg);
        }
        i += 1;
    }
    out
}

/// Alternating runs of whitespace / non-whitespace, tagged `true` for space.
fn split_segments(text: &str) -> Vec<(bool, &str)> {
    let mut out = Vec::new();
    let mut start = 0;
    let mut current: Option<bool> = None;
    for (idx, c) in text.char_indices() {
        let ws = c.is_whitespace();
        match current {
            Some(kind) if kind == ws => {}
            Some(kind) => {
                out.push((kind, &text[start..idx]));
                start = idx;
                current = Some(ws);
            }
            None => current = Some(ws),
        }
    }
    if let Some(kind) = current {
        out.push((kind, &text[start..]));
    }
    out
}

fn split_trailing(word: &str) -> (&str, &str) {
    let core = word.trim_end_matches(|c: char| matches!(c, '.' | ',' | '!' | '?' | ';' | ':' | ')'));
    (core, &word[core.len()..])
}

fn is_phone(word: &str) -> bool {
    let body = word.strip_prefix('+').unwrap_or(word);
    let digits = body.chars().filter(|c| c.is_ascii_digit()).count();
    body.chars().next().map_or(false, |c| c.is_ascii_digit() || c == '(')
        && body
            .chars()
            .all(|c| c.is_ascii_digit() || matches!(c, '-' | '(' | ')' | '.'))
        && (7..=15).contains(&digits)
}

/// `<house number> <words...> <street suffix>`, within four words.
fn address_end(segments: &[(bool, &str)], start: usize) -> Option<usize> {
    let number = segments[start].1;
    if number.is_empty() || number.len() > 5 || !number.chars().all(|c| c.is_ascii_digit()) {
        return None;
    }
    let mut words = 0;
    for (j, (is_space, seg)) in segments.iter().enumerate().skip(start + 1) {
        if *is_space {
            if seg.contains('\n') {
                return None;
            }
            continue;
        }
        words += 1;
        if words > 4 {
            return None;
        }
        let (core, _) = split_trailing(seg);
        if words > 1 && STREET_SUFFIXES.contains(&core.to_ascii_lowercase().as_str()) {
            return Some(j);
        }
        if core.chars().any(|c| c.is_ascii_digit()) {
            return None;
        }
    }
    None
}
