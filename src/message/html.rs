//! HTML body preparation and rendering.
//!
//! Mail HTML is untrusted. Before it reaches a renderer we drop `<style>`
//! blocks and anything executable or embeddable, and pad tables with line
//! breaks so tabular content does not run into the surrounding text.

use std::sync::LazyLock;

use regex::Regex;

/// Elements removed together with their content.
const BLOCKED_ELEMENTS: [&str; 5] = ["style", "script", "iframe", "object", "form"];

static BR_TAG: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(?i)<br\s*/?>").unwrap());

static BLOCKED_BLOCKS: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    BLOCKED_ELEMENTS
        .iter()
        .map(|tag| Regex::new(&format!(r"(?is)<{tag}\b[^>]*>.*?(?:</{tag}\s*>|\z)")).unwrap())
        .collect()
});

// <embed> is a void element; strip the tag itself plus any stray closers.
static LEFTOVER_TAGS: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)<embed\b[^>]*>|</(?:embed|style|script|iframe|object|form)\s*>").unwrap()
});

static TABLE_OPEN: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(?i)<table\b").unwrap());
static TABLE_CLOSE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(?i)</table\s*>").unwrap());

/// Converts (already sanitised) HTML into plain text or markdown.
///
/// Implementations must not execute anything embedded in the markup and must
/// tolerate malformed input.
pub trait Render: Send + Sync {
    fn render(&self, html: &str) -> String;
}

impl<F> Render for F
where
    F: Fn(&str) -> String + Send + Sync,
{
    fn render(&self, html: &str) -> String {
        self(html)
    }
}

/// Markdown renderer backed by `htmd`.
#[derive(Debug, Clone, Copy, Default)]
pub struct MarkdownRenderer;

impl Render for MarkdownRenderer {
    fn render(&self, html: &str) -> String {
        let converter = htmd::HtmlToMarkdown::builder()
            .skip_tags(vec!["head", "style", "script", "iframe", "object", "embed", "form"])
            .build();
        match converter.convert(html) {
            Ok(markdown) => markdown,
            Err(e) => {
                tracing::warn!(error = %e, "HTML conversion failed; falling back to tag stripping");
                strip_tags(html)
            }
        }
    }
}

/// Sanitise a raw HTML body ahead of rendering.
pub fn sanitize(html: &str) -> String {
    let mut out = BR_TAG.replace_all(html, "<br/>").into_owned();
    // Removing one element can splice a new one together out of the text
    // around it, so repeat until nothing changes. Every change shrinks `out`.
    loop {
        let before = out.len();
        for block in BLOCKED_BLOCKS.iter() {
            out = block.replace_all(&out, "").into_owned();
        }
        if out.len() != before {
            continue;
        }
        out = LEFTOVER_TAGS.replace_all(&out, "").into_owned();
        if out.len() == before {
            break;
        }
    }
    out = TABLE_OPEN.replace_all(&out, "<br/><br/>$0").into_owned();
    TABLE_CLOSE.replace_all(&out, "</table><br/>").into_owned()
}

/// Last-resort text extraction: drop tags, keep line structure.
pub fn strip_tags(html: &str) -> String {
    let mut result = String::with_capacity(html.len());
    let mut tag = String::new();
    let mut in_tag = false;

    for ch in html.chars() {
        match ch {
            '<' => {
                in_tag = true;
                tag.clear();
            }
            '>' if in_tag => {
                in_tag = false;
                let name: String = tag
                    .trim_start_matches('/')
                    .chars()
                    .take_while(char::is_ascii_alphanumeric)
                    .collect::<String>()
                    .to_ascii_lowercase();
                if matches!(
                    name.as_str(),
                    "br" | "p" | "div" | "tr" | "li" | "table" | "h1" | "h2" | "h3" | "h4"
                        | "h5" | "h6" | "blockquote"
                ) {
                    result.push('\n');
                }
            }
            _ if in_tag => tag.push(ch),
            _ => result.push(ch),
        }
    }
    result
}
