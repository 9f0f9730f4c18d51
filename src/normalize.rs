//! Whitespace normalization for chat text
//!
//! Everything that is counted or sent downstream goes through [`normalize`] first,
//! so token counts are taken on exactly the text the backend will see.

/// Collapse noisy whitespace in free text.
///
/// - runs of `\n` become a single `\n`
/// - runs of other whitespace (except `\r`) become a single space
/// - leading and trailing whitespace is trimmed
///
/// Whitespace is the ECMAScript set: Unicode `White_Space` minus U+0085 (NEL),
/// plus U+FEFF (byte order mark).
pub fn normalize(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut prev: Option<char> = None;

    for c in text.chars() {
        if c == '\n' {
            if prev != Some('\n') {
                out.push('\n');
            }
        } else if is_horizontal(c) {
            if !prev.is_some_and(is_horizontal) {
                out.push(' ');
            }
        } else {
            out.push(c);
        }
        prev = Some(c);
    }

    let trimmed = out.trim_matches(is_whitespace);
    if trimmed.len() == out.len() {
        out
    } else {
        trimmed.to_string()
    }
}

fn is_whitespace(c: char) -> bool {
    match c {
        '\u{85}' => false,
        '\u{feff}' => true,
        _ => c.is_whitespace(),
    }
}

fn is_horizontal(c: char) -> bool {
    is_whitespace(c) && c != '\n' && c != '\r'
}
