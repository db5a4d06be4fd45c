//! Markdown rendering for chat platforms.
//!
//! Telegram accepts only a small HTML subset, so outbound markdown is
//! converted rather than sent raw. Code is extracted into placeholder
//! tokens before any other transformation and reinserted fully escaped at
//! the end, so characters inside code are never reinterpreted as markup.

use std::sync::LazyLock;

use regex::Regex;

static RE_CODE_BLOCK: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"```\w*\n?([\s\S]*?)```").unwrap());
static RE_INLINE_CODE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"`([^`]+)`").unwrap());
static RE_BOLD: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\*\*(.+?)\*\*").unwrap());
static RE_UNDER_BOLD: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"__(.+?)__").unwrap());
static RE_ITALIC: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"_([^_]+)_").unwrap());
static RE_STRIKE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"~~(.+?)~~").unwrap());
static RE_LINK: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\[([^\]]+)\]\(([^)]+)\)").unwrap());
static RE_HEADING: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?m)^#{1,6}\s+(.+)$").unwrap());
static RE_BLOCKQUOTE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(?m)^>\s*(.*)$").unwrap());
static RE_LIST_ITEM: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(?m)^[-*]\s+").unwrap());

/// Convert a constrained markdown subset to Telegram-safe HTML.
///
/// Order matters: code first (placeholders), structural collapses, escape,
/// inline markup, then code reinsertion with its own escaping.
pub fn markdown_to_html(text: &str) -> String {
    if text.is_empty() {
        return String::new();
    }

    let (text, code_blocks) = extract_code_blocks(text);
    let (text, inline_codes) = extract_inline_codes(&text);

    let text = RE_HEADING.replace_all(&text, "$1");
    let text = RE_BLOCKQUOTE.replace_all(&text, "$1");

    let mut text = escape_html(&text);
    text = RE_LINK
        .replace_all(&text, r#"<a href="$2">$1</a>"#)
        .into_owned();
    text = RE_BOLD.replace_all(&text, "<b>$1</b>").into_owned();
    text = RE_UNDER_BOLD.replace_all(&text, "<b>$1</b>").into_owned();
    text = RE_ITALIC.replace_all(&text, "<i>$1</i>").into_owned();
    text = RE_STRIKE.replace_all(&text, "<s>$1</s>").into_owned();
    text = RE_LIST_ITEM.replace_all(&text, "\u{2022} ").into_owned();

    for (i, code) in inline_codes.iter().enumerate() {
        text = text.replace(
            &inline_placeholder(i),
            &format!("<code>{}</code>", escape_html(code)),
        );
    }
    for (i, code) in code_blocks.iter().enumerate() {
        text = text.replace(
            &block_placeholder(i),
            &format!("<pre><code>{}</code></pre>", escape_html(code)),
        );
    }

    text
}

/// Plain-text rendition: code removed, markup unwrapped, heading lines and
/// list markers dropped. Used for length checks and the plain-send fallback.
pub fn strip_markdown(text: &str) -> String {
    let text = RE_CODE_BLOCK.replace_all(text, "");
    let text = RE_INLINE_CODE.replace_all(&text, "");
    let text = RE_BOLD.replace_all(&text, "$1");
    let text = RE_UNDER_BOLD.replace_all(&text, "$1");
    let text = RE_ITALIC.replace_all(&text, "$1");
    let text = RE_STRIKE.replace_all(&text, "$1");
    let text = RE_LINK.replace_all(&text, "$1");
    let text = RE_HEADING.replace_all(&text, "");
    let text = RE_LIST_ITEM.replace_all(&text, "");
    text.trim().to_string()
}

/// Whether the text carries fenced blocks or inline code spans.
pub fn contains_code(text: &str) -> bool {
    text.contains("```") || RE_INLINE_CODE.is_match(text)
}

/// Split text into chunks of at most `max_len` bytes, preferring a
/// paragraph boundary, then a line boundary, then a hard cut. Boundary
/// whitespace is trimmed from each chunk.
pub fn split_message(text: &str, max_len: usize) -> Vec<String> {
    if text.len() <= max_len {
        return vec![text.to_string()];
    }

    let mut chunks = Vec::new();
    let mut rest = text;
    while !rest.is_empty() {
        if rest.len() <= max_len {
            chunks.push(rest.to_string());
            break;
        }

        let window_end = boundary_at_or_before(rest, max_len);
        let window = &rest[..window_end];

        let mut split_at = window.rfind("\n\n").map(|i| i as isize).unwrap_or(-1);
        if split_at < (max_len / 2) as isize {
            split_at = window.rfind('\n').map(|i| i as isize).unwrap_or(-1);
        }
        if split_at < (max_len / 4) as isize {
            split_at = window_end as isize;
        }
        let mut split_at = split_at as usize;
        if split_at == 0 {
            // Always make progress, even on degenerate limits.
            split_at = rest
                .chars()
                .next()
                .map(|c| c.len_utf8())
                .unwrap_or(rest.len());
        }

        let chunk = rest[..split_at].trim();
        if !chunk.is_empty() {
            chunks.push(chunk.to_string());
        }
        rest = rest[split_at..].trim();
    }

    chunks
}

fn block_placeholder(i: usize) -> String {
    format!("\u{0}CB{}\u{0}", i)
}

fn inline_placeholder(i: usize) -> String {
    format!("\u{0}IC{}\u{0}", i)
}

fn extract_code_blocks(text: &str) -> (String, Vec<String>) {
    let mut codes = Vec::new();
    let replaced = RE_CODE_BLOCK.replace_all(text, |caps: &regex::Captures| {
        let placeholder = block_placeholder(codes.len());
        codes.push(caps[1].to_string());
        placeholder
    });
    (replaced.into_owned(), codes)
}

fn extract_inline_codes(text: &str) -> (String, Vec<String>) {
    let mut codes = Vec::new();
    let replaced = RE_INLINE_CODE.replace_all(text, |caps: &regex::Captures| {
        let placeholder = inline_placeholder(codes.len());
        codes.push(caps[1].to_string());
        placeholder
    });
    (replaced.into_owned(), codes)
}

fn escape_html(text: &str) -> String {
    text.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
}

fn boundary_at_or_before(s: &str, index: usize) -> usize {
    let mut i = index.min(s.len());
    while i > 0 && !s.is_char_boundary(i) {
        i -= 1;
    }
    i
}

/// Longest prefix of `text` at most `max_len` bytes long, cut on a char
/// boundary.
pub(crate) fn truncate_str(text: &str, max_len: usize) -> &str {
    &text[..boundary_at_or_before(text, max_len)]
}

#[cfg(test)]
mod tests {
    use super::*;

    // ── markdown_to_html ────────────────────────────────────────────────

    #[test]
    fn empty_input_empty_output() {
        assert_eq!(markdown_to_html(""), "");
    }

    #[test]
    fn bold_italic_strike_converted() {
        assert_eq!(markdown_to_html("**b**"), "<b>b</b>");
        assert_eq!(markdown_to_html("__b__"), "<b>b</b>");
        assert_eq!(markdown_to_html("_i_"), "<i>i</i>");
        assert_eq!(markdown_to_html("~~s~~"), "<s>s</s>");
    }

    #[test]
    fn links_converted() {
        assert_eq!(
            markdown_to_html("[docs](https://example.com)"),
            r#"<a href="https://example.com">docs</a>"#
        );
    }

    #[test]
    fn headings_and_quotes_collapse_to_text() {
        assert_eq!(markdown_to_html("## Title"), "Title");
        assert_eq!(markdown_to_html("> quoted"), "quoted");
    }

    #[test]
    fn list_markers_become_bullets() {
        assert_eq!(markdown_to_html("- one\n- two"), "\u{2022} one\n\u{2022} two");
        assert_eq!(markdown_to_html("* starred"), "\u{2022} starred");
    }

    #[test]
    fn special_chars_escaped() {
        assert_eq!(markdown_to_html("a < b & c > d"), "a &lt; b &amp; c &gt; d");
    }

    #[test]
    fn code_block_content_verbatim_only_escaped() {
        let out = markdown_to_html("```\n**not bold** [x](y) <tag> & _i_\n```");
        assert_eq!(
            out,
            "<pre><code>**not bold** [x](y) &lt;tag&gt; &amp; _i_\n</code></pre>"
        );
    }

    #[test]
    fn language_hint_dropped_from_fenced_block() {
        let out = markdown_to_html("```rust\nlet x = 1;\n```");
        assert!(out.contains("let x = 1;"));
        assert!(!out.contains("rust"));
    }

    #[test]
    fn inline_code_protected_from_styling() {
        let out = markdown_to_html("use `*ptr*` here");
        assert_eq!(out, "use <code>*ptr*</code> here");
    }

    #[test]
    fn multiple_code_segments_reinserted_in_place() {
        let out = markdown_to_html("`a` then ```\nblock\n``` then `b`");
        assert_eq!(
            out,
            "<code>a</code> then <pre><code>block\n</code></pre> then <code>b</code>"
        );
    }

    #[test]
    fn styling_still_applies_around_code() {
        let out = markdown_to_html("**bold** and `code`");
        assert_eq!(out, "<b>bold</b> and <code>code</code>");
    }

    // ── strip_markdown ──────────────────────────────────────────────────

    #[test]
    fn strip_removes_code_and_unwraps_styles() {
        let text = "# Head\n**bold** `code` _i_ [l](u)\n```\nblock\n```";
        let out = strip_markdown(text);
        assert!(!out.contains("Head"));
        assert!(out.contains("bold"));
        assert!(!out.contains("code"));
        assert!(!out.contains("block"));
        assert!(out.contains("l"));
        assert!(!out.contains("**"));
    }

    #[test]
    fn strip_plain_text_untouched() {
        assert_eq!(strip_markdown("just words"), "just words");
    }

    // ── contains_code ───────────────────────────────────────────────────

    #[test]
    fn detects_code_forms() {
        assert!(contains_code("has `inline`"));
        assert!(contains_code("```\nfenced\n```"));
        assert!(!contains_code("plain text"));
    }

    // ── split_message ───────────────────────────────────────────────────

    #[test]
    fn short_text_single_chunk() {
        assert_eq!(split_message("hello", 100), vec!["hello"]);
    }

    #[test]
    fn splits_at_paragraph_boundary() {
        let a = "a".repeat(60);
        let b = "b".repeat(60);
        let text = format!("{}\n\n{}", a, b);
        let chunks = split_message(&text, 100);
        assert_eq!(chunks, vec![a, b]);
    }

    #[test]
    fn falls_back_to_line_boundary() {
        // The only paragraph break is too early (< half the limit).
        let text = format!("{}\n\n{}\n{}", "a".repeat(10), "b".repeat(70), "c".repeat(70));
        let chunks = split_message(&text, 100);
        assert!(chunks.len() >= 2);
        assert!(chunks[0].ends_with('b'));
    }

    #[test]
    fn hard_cut_without_any_boundary() {
        let text = "x".repeat(250);
        let chunks = split_message(&text, 100);
        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks[0].len(), 100);
        assert_eq!(chunks[2].len(), 50);
    }

    #[test]
    fn all_chunks_within_limit() {
        let mut text = String::new();
        for i in 0..40 {
            text.push_str(&"word ".repeat(i % 13 + 1));
            text.push_str(if i % 3 == 0 { "\n\n" } else { "\n" });
        }
        for chunk in split_message(&text, 80) {
            assert!(chunk.len() <= 80, "chunk too long: {}", chunk.len());
        }
    }

    #[test]
    fn concatenation_reconstructs_content() {
        let text = format!(
            "{}\n\n{}\n{}",
            "alpha ".repeat(30),
            "beta ".repeat(30),
            "gamma ".repeat(30)
        );
        let chunks = split_message(&text, 120);
        let rejoined: String = chunks.concat();
        let squash = |s: &str| s.split_whitespace().collect::<String>();
        assert_eq!(squash(&rejoined), squash(&text));
    }

    #[test]
    fn multibyte_text_never_split_mid_char() {
        let text = "héllo wörld ".repeat(40);
        for chunk in split_message(&text, 50) {
            assert!(chunk.len() <= 50);
            assert!(chunk.is_char_boundary(chunk.len()));
        }
    }

    #[test]
    fn chunks_are_trimmed() {
        let text = format!("{}\n\n   {}", "a".repeat(60), "b".repeat(60));
        for chunk in split_message(&text, 100) {
            assert_eq!(chunk, chunk.trim());
        }
    }

    #[test]
    fn truncate_respects_char_boundaries() {
        assert_eq!(truncate_str("hello", 10), "hello");
        assert_eq!(truncate_str("hello", 3), "hel");
        // "é" is two bytes; cutting inside it backs off to the boundary.
        assert_eq!(truncate_str("é", 1), "");
        assert_eq!(truncate_str("aé", 2), "a");
    }
}
