//! Removal of terminal escape sequences from build output.

use once_cell::sync::Lazy;
use regex::Regex;
use std::borrow::Cow;

/// CSI sequences, OSC sequences ended by BEL or ST, and two-byte escapes.
///
/// The literal `\e` spelling some tools print only counts when a CSI or
/// OSC body follows, so Windows-style paths survive.
static ANSI_ESCAPE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(concat!(
        r"\x1b(?:",
        r"\[[\x30-\x3f]*[\x20-\x2f]*[\x40-\x7e]",
        r"|\][^\x07\x1b]*(?:\x07|\x1b\\)",
        r"|[\x40-\x5f])?",
        r"|\\e(?:",
        r"\[[\x30-\x3f]*[\x20-\x2f]*[\x40-\x7e]",
        r"|\][^\x07\x1b]*(?:\x07|\x1b\\))",
    ))
    .unwrap_or_else(|err| unreachable!("escape pattern is valid: {err}"))
});

/// Returns true if `text` contains a raw or backslash-written escape.
#[must_use]
pub fn has_escapes(text: &str) -> bool {
    text.contains('\u{1b}') || text.contains("\\e")
}

/// Strips CSI, OSC and two-byte escape sequences.
///
/// Text without escapes is returned borrowed.
#[must_use]
pub fn strip_escapes(text: &str) -> Cow<'_, str> {
    if !has_escapes(text) {
        return Cow::Borrowed(text);
    }
    ANSI_ESCAPE.replace_all(text, "")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plain_text_is_borrowed() {
        assert!(matches!(strip_escapes("foo.c:1:1: error"), Cow::Borrowed(_)));
    }

    #[test]
    fn test_strips_color_codes() {
        let input = "\u{1b}[01m\u{1b}[Kfoo.c:10:5:\u{1b}[m\u{1b}[K \u{1b}[01;35mwarning:\u{1b}[m x";
        assert_eq!(strip_escapes(input), "foo.c:10:5: warning: x");
    }

    #[test]
    fn test_strips_literal_backslash_e() {
        assert_eq!(strip_escapes("\\e[1;31merror\\e[0m: bad"), "error: bad");
    }

    #[test]
    fn test_strips_osc_hyperlinks() {
        let input = "\u{1b}]8;;file:///a.c\u{07}a.c\u{1b}]8;;\u{1b}\\:1:1";
        assert_eq!(strip_escapes(input), "a.c:1:1");
    }

    #[test]
    fn test_backslash_e_in_paths_is_kept() {
        assert_eq!(strip_escapes(r"C:\extra\foo.c:1:1"), r"C:\extra\foo.c:1:1");
    }
}
