//! Classification of terminal control sequences in output chunks.
//!
//! The daemon persists raw output per session. When a program explicitly
//! erases scrollback (ED3, `ESC[3J`), the persisted history must be
//! truncated so a reattaching client does not replay content the user
//! asked to discard. A full reset (RIS, `ESC c`) must NOT truncate:
//! full-screen programs emit it while repainting and history stays valid.
//!
//! These functions are pure and stateless. Each chunk is classified
//! independently; malformed or partial sequences are ordinary text.

/// ED3: erase display mode 3, "clear scrollback".
pub const CLEAR_SCROLLBACK: &str = "\u{1b}[3J";

/// RIS: reset to initial state. Never a truncation trigger.
pub const FULL_RESET: &str = "\u{1b}c";

/// Whether the chunk contains a clear-scrollback sequence.
///
/// Matches ED3 exactly. Near-misses like `ESC[3m` (SGR italic) or
/// `ESC[30J` are not matched, and neither is RIS.
pub fn contains_clear_scrollback(chunk: &str) -> bool {
    chunk.contains(CLEAR_SCROLLBACK)
}

/// The content strictly after the last clear-scrollback sequence.
///
/// With multiple occurrences in one chunk the last one wins; everything
/// before it, including any interleaved full resets, is discarded. When
/// no clear sequence is present the chunk is returned unchanged,
/// byte for byte. Slicing happens at the end of the matched sequence so
/// multi-byte characters are never split.
pub fn content_after_clear(chunk: &str) -> &str {
    match chunk.rfind(CLEAR_SCROLLBACK) {
        Some(idx) => &chunk[idx + CLEAR_SCROLLBACK.len()..],
        None => chunk,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detects_clear_scrollback() {
        assert!(contains_clear_scrollback("\u{1b}[3J"));
        assert!(contains_clear_scrollback("before\u{1b}[3Jafter"));
        assert!(contains_clear_scrollback("\u{1b}[2J\u{1b}[3J\u{1b}[H"));
    }

    #[test]
    fn full_reset_is_not_clear_scrollback() {
        assert!(!contains_clear_scrollback("\u{1b}c"));
        assert!(!contains_clear_scrollback("repaint\u{1b}cmore"));
    }

    #[test]
    fn near_misses_do_not_match() {
        // SGR italic
        assert!(!contains_clear_scrollback("\u{1b}[3mitalic\u{1b}[0m"));
        // Different ED parameters
        assert!(!contains_clear_scrollback("\u{1b}[30J"));
        assert!(!contains_clear_scrollback("\u{1b}[13J"));
        assert!(!contains_clear_scrollback("\u{1b}[J\u{1b}[2J"));
    }

    #[test]
    fn empty_input() {
        assert!(!contains_clear_scrollback(""));
        assert_eq!(content_after_clear(""), "");
    }

    #[test]
    fn chunk_without_clear_is_unchanged() {
        let chunk = "plain text\nwith lines\n";
        assert_eq!(content_after_clear(chunk), chunk);
    }

    #[test]
    fn full_reset_is_preserved_as_content() {
        let chunk = "a\u{1b}cb";
        assert_eq!(content_after_clear(chunk), chunk);
    }

    #[test]
    fn content_after_single_clear() {
        assert_eq!(content_after_clear("old\u{1b}[3Jnew"), "new");
        assert_eq!(content_after_clear("\u{1b}[3J"), "");
    }

    #[test]
    fn last_clear_wins() {
        let chunk = "a\u{1b}[3Jb\u{1b}[3Jc";
        assert_eq!(content_after_clear(chunk), "c");
    }

    #[test]
    fn interleaved_resets_before_last_clear_are_discarded() {
        let chunk = "a\u{1b}c b\u{1b}[3Jc\u{1b}cd\u{1b}[3Je";
        assert_eq!(content_after_clear(chunk), "e");

        // Resets after the last clear survive as ordinary content.
        let chunk = "a\u{1b}[3Jb\u{1b}cc";
        assert_eq!(content_after_clear(chunk), "b\u{1b}cc");
    }

    #[test]
    fn partial_sequence_at_chunk_boundary_is_literal() {
        // A truncated ED3 split across chunks must not match or panic.
        assert_eq!(content_after_clear("tail\u{1b}[3"), "tail\u{1b}[3");
        assert_eq!(content_after_clear("tail\u{1b}["), "tail\u{1b}[");
        assert_eq!(content_after_clear("tail\u{1b}"), "tail\u{1b}");
    }

    #[test]
    fn unicode_payloads_survive() {
        let chunk = "日本語\u{1b}[3J絵文字 🦀 done";
        assert_eq!(content_after_clear(chunk), "絵文字 🦀 done");

        let no_clear = "ただのテキスト 🚀";
        assert_eq!(content_after_clear(no_clear), no_clear);
    }

    #[test]
    fn ansi_colors_mixed_with_resets() {
        let chunk = "\u{1b}[31mred\u{1b}[0m\u{1b}c\u{1b}[3J\u{1b}[32mgreen\u{1b}[0m";
        assert_eq!(content_after_clear(chunk), "\u{1b}[32mgreen\u{1b}[0m");
    }

    #[test]
    fn idempotent_once_cleared() {
        let chunk = "a\u{1b}[3Jb\u{1b}[3Jc";
        let once = content_after_clear(chunk);
        assert_eq!(content_after_clear(once), once);
    }
}
