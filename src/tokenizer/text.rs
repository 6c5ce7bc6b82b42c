//! Text cleanup applied before tokenization.

use regex::Regex;
use std::sync::OnceLock;
use unicode_normalization::UnicodeNormalization;

fn terminal_escape_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\x1b\[((?:\d|;)*)([a-zA-Z])").expect("valid regex"))
}

fn entity_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"&(?:#[0-9]+|#[xX][0-9a-fA-F]+|[a-zA-Z][a-zA-Z0-9]*);").expect("valid regex")
    })
}

fn whitespace_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\s+").expect("valid regex"))
}

/// Repair common text glitches: terminal escapes, odd line breaks, control
/// characters, curly quotes, Latin ligatures and full-width forms. The result
/// is NFC normalized.
pub fn fix_text(text: &str) -> String {
    let text = terminal_escape_re().replace_all(text, "");
    let text = text.replace("\r\n", "\n");

    let mut out = String::with_capacity(text.len());
    for ch in text.chars() {
        match ch {
            '\r' | '\u{2028}' | '\u{2029}' | '\u{0085}' => out.push('\n'),
            '\u{2018}' | '\u{2019}' | '\u{201A}' | '\u{201B}' => out.push('\''),
            '\u{201C}' | '\u{201D}' | '\u{201E}' | '\u{201F}' => out.push('"'),
            '\u{FB00}' => out.push_str("ff"),
            '\u{FB01}' => out.push_str("fi"),
            '\u{FB02}' => out.push_str("fl"),
            '\u{FB03}' => out.push_str("ffi"),
            '\u{FB04}' => out.push_str("ffl"),
            '\u{FB05}' | '\u{FB06}' => out.push_str("st"),
            '\u{3000}' => out.push(' '),
            '\u{FF01}'..='\u{FF5E}' => {
                // Full-width ASCII sits 0xFEE0 above the ASCII range
                match char::from_u32(ch as u32 - 0xFEE0) {
                    Some(narrow) => out.push(narrow),
                    None => out.push(ch),
                }
            }
            '\t' | '\n' | '\x0c' => out.push(ch),
            c if c.is_control() => {}
            c => out.push(c),
        }
    }
    out.nfc().collect()
}

/// Decode HTML entities one at a time. Bare `&` and unknown entities are
/// kept as literal text.
pub fn html_unescape(text: &str) -> String {
    if !text.contains('&') {
        return text.to_string();
    }
    entity_re()
        .replace_all(text, |caps: &regex::Captures| {
            let entity = &caps[0];
            htmlescape::decode_html(entity).unwrap_or_else(|_| entity.to_string())
        })
        .into_owned()
}

pub fn basic_clean(text: &str) -> String {
    let text = fix_text(text);
    let text = html_unescape(&html_unescape(&text));
    text.trim().to_string()
}

pub fn whitespace_clean(text: &str) -> String {
    whitespace_re().replace_all(text, " ").trim().to_string()
}

/// Full normalization used by the tokenizer.
pub fn normalize(text: &str) -> String {
    whitespace_clean(&basic_clean(text)).to_lowercase()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fix_text() {
        assert_eq!(fix_text("\u{201C}quoted\u{201D} it\u{2019}s"), "\"quoted\" it's");
        assert_eq!(fix_text("\u{FB01}ne \u{FB02}ow"), "fine flow");
        assert_eq!(fix_text("\u{FF21}\u{FF42}\u{FF43}\u{3000}\u{FF11}"), "Abc 1");
        assert_eq!(fix_text("a\r\nb\rc"), "a\nb\nc");
        assert_eq!(fix_text("\x1b[31mred\x1b[0m"), "red");
        assert_eq!(fix_text("nul\u{0}byte"), "nulbyte");
    }

    #[test]
    fn test_fix_text_composes_to_nfc() {
        assert_eq!(fix_text("cafe\u{301}"), "caf\u{e9}");
        assert_eq!(normalize("Cafe\u{301}"), normalize("Caf\u{e9}"));
    }

    #[test]
    fn test_form_feed_separates_words() {
        assert_eq!(fix_text("a\x0cb"), "a\x0cb");
        assert_eq!(normalize("a\x0cb"), "a b");
    }

    #[test]
    fn test_html_unescape() {
        assert_eq!(html_unescape("fish &amp; chips"), "fish & chips");
        assert_eq!(html_unescape("plain"), "plain");
        assert_eq!(html_unescape("&#65;&#x42;"), "AB");
    }

    #[test]
    fn test_bare_ampersand_next_to_entity() {
        assert_eq!(html_unescape("AT&T &amp; co"), "AT&T & co");
        assert_eq!(basic_clean("Tom & Jerry &amp; friends"), "Tom & Jerry & friends");
        assert_eq!(html_unescape("&bogus; &lt;"), "&bogus; <");
    }

    #[test]
    fn test_double_unescape() {
        assert_eq!(basic_clean("  a &amp;lt; b  "), "a < b");
    }

    #[test]
    fn test_normalize() {
        assert_eq!(normalize("  A   Photo\tof\n\na  DOG "), "a photo of a dog");
    }
}
