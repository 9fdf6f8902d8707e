//! Subject line cleanup for downstream storage and Textile rendering.
//!
//! Reports end up in systems limited to the Basic Multilingual Plane
//! (e.g. MySQL `utf8mb3` columns), so astral code points are swapped for a
//! placeholder, and characters that Textile treats as markup are escaped.

use std::borrow::Cow;

/// Placeholder used in place of characters outside the BMP (U+2702 scissors).
pub const DEFAULT_REPLACEMENT: &str = "\u{2702}";

/// Last code point storable in a 3-byte UTF-8 column.
pub const BMP_END: char = '\u{FFFF}';

const MARKUP_ESCAPES: &[(char, &str)] = &[('|', "&#124;"), ('#', "&#35;")];

/// Whether every character of `s` lies within `start..=end`.
pub fn chars_within_range(s: &str, start: char, end: char) -> bool {
    s.chars().all(|c| (start..=end).contains(&c))
}

pub fn within_bmp(s: &str) -> bool {
    chars_within_range(s, '\u{0}', BMP_END)
}

/// Replace every code point above U+FFFF with `replacement`.
pub fn replace_astral<'a>(s: &'a str, replacement: &str) -> Cow<'a, str> {
    if within_bmp(s) {
        return Cow::Borrowed(s);
    }

    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        if c > BMP_END {
            out.push_str(replacement);
        } else {
            out.push(c);
        }
    }
    Cow::Owned(out)
}

/// Escape characters Textile would otherwise interpret inside a table cell.
pub fn replace_markup_chars(s: &str) -> Cow<'_, str> {
    if !s.contains(|c| MARKUP_ESCAPES.iter().any(|(m, _)| *m == c)) {
        return Cow::Borrowed(s);
    }

    let mut out = String::with_capacity(s.len() + 8);
    for c in s.chars() {
        match MARKUP_ESCAPES.iter().find(|(m, _)| *m == c) {
            Some((_, escaped)) => out.push_str(escaped),
            None => out.push(c),
        }
    }
    Cow::Owned(out)
}

/// Astral substitution followed by markup escaping.
///
/// Returns `Cow::Borrowed` when the subject needed no changes, which is how
/// callers decide whether to record a modified subject.
pub fn sanitize_subject<'a>(s: &'a str, replacement: &str) -> Cow<'a, str> {
    match replace_astral(s, replacement) {
        Cow::Borrowed(b) => replace_markup_chars(b),
        Cow::Owned(o) => match replace_markup_chars(&o) {
            Cow::Borrowed(_) => Cow::Owned(o),
            Cow::Owned(escaped) => Cow::Owned(escaped),
        },
    }
}
