//! Content preprocessing: raw crawled content → clean text.
//!
//! HTML chrome (scripts, styles, navigation, tags) is stripped before
//! chunking. If extraction yields nothing usable, the raw content is kept
//! and the method records the fallback.

use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Content-type hint from the crawler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContentKind {
    Html,
    PlainText,
}

impl ContentKind {
    /// Derive a hint from an HTTP content type header value.
    pub fn from_content_type(content_type: &str) -> Self {
        if content_type.to_ascii_lowercase().contains("html") {
            ContentKind::Html
        } else {
            ContentKind::PlainText
        }
    }
}

/// How the clean text was produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PreprocessMethod {
    HtmlStripped,
    PlainText,
    RawFallback,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreprocessResult {
    pub text: String,
    pub method: PreprocessMethod,
}

static SCRIPT_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?is)<script\b[^>]*>.*?</script>").unwrap());
static STYLE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?is)<style\b[^>]*>.*?</style>").unwrap());
static NAV_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?is)<(nav|header|footer|aside)\b[^>]*>.*?</(nav|header|footer|aside)>").unwrap()
});
static COMMENT_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(?s)<!--.*?-->").unwrap());
static TAG_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(?s)<[^>]+>").unwrap());
static WHITESPACE_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"[ \t]+").unwrap());
static BLANK_LINES_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\n{3,}").unwrap());

/// Strips boilerplate from crawled content.
#[derive(Debug, Clone, Default)]
pub struct Preprocessor;

impl Preprocessor {
    pub fn new() -> Self {
        Self
    }

    /// Produce clean text from raw content.
    ///
    /// Never fails: when HTML stripping leaves nothing usable the raw
    /// content is returned with `method = RawFallback`.
    pub fn preprocess(&self, raw: &str, kind: ContentKind) -> PreprocessResult {
        match kind {
            ContentKind::PlainText => PreprocessResult {
                text: normalize_whitespace(raw),
                method: PreprocessMethod::PlainText,
            },
            ContentKind::Html => {
                let stripped = strip_html(raw);
                if stripped.trim().is_empty() && !raw.trim().is_empty() {
                    debug!("html stripping produced no text, falling back to raw content");
                    PreprocessResult {
                        text: raw.to_string(),
                        method: PreprocessMethod::RawFallback,
                    }
                } else {
                    PreprocessResult {
                        text: stripped,
                        method: PreprocessMethod::HtmlStripped,
                    }
                }
            }
        }
    }
}

fn strip_html(raw: &str) -> String {
    let no_scripts = SCRIPT_RE.replace_all(raw, " ");
    let no_styles = STYLE_RE.replace_all(&no_scripts, " ");
    let no_nav = NAV_RE.replace_all(&no_styles, " ");
    let no_comments = COMMENT_RE.replace_all(&no_nav, " ");
    let no_tags = TAG_RE.replace_all(&no_comments, " ");
    normalize_whitespace(&decode_entities(&no_tags))
}

fn decode_entities(text: &str) -> String {
    text.replace("&nbsp;", " ")
        .replace("&amp;", "&")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&#39;", "'")
}

fn normalize_whitespace(text: &str) -> String {
    let collapsed = WHITESPACE_RE.replace_all(text, " ");
    let lines: Vec<&str> = collapsed.lines().map(str::trim).collect();
    let joined = lines.join("\n");
    BLANK_LINES_RE.replace_all(&joined, "\n\n").trim().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_scripts_styles_and_tags() {
        let html = r#"<html><head><style>body { color: red; }</style>
            <script>alert("x");</script></head>
            <body><nav><a href="/">Home</a></nav>
            <p>Rust is a <b>systems</b> language.</p></body></html>"#;

        let result = Preprocessor::new().preprocess(html, ContentKind::Html);

        assert_eq!(result.method, PreprocessMethod::HtmlStripped);
        assert!(result.text.contains("Rust is a systems language."));
        assert!(!result.text.contains("alert"));
        assert!(!result.text.contains("color: red"));
        assert!(!result.text.contains("Home"));
    }

    #[test]
    fn decodes_common_entities() {
        let result =
            Preprocessor::new().preprocess("<p>a &amp; b &lt; c</p>", ContentKind::Html);
        assert_eq!(result.text, "a & b < c");
    }

    #[test]
    fn falls_back_to_raw_when_stripping_empties_content() {
        let result = Preprocessor::new().preprocess("<br/><hr/>", ContentKind::Html);
        assert_eq!(result.method, PreprocessMethod::RawFallback);
        assert_eq!(result.text, "<br/><hr/>");
    }

    #[test]
    fn plain_text_only_normalizes_whitespace() {
        let result = Preprocessor::new().preprocess("a   b\n\n\n\nc", ContentKind::PlainText);
        assert_eq!(result.method, PreprocessMethod::PlainText);
        assert_eq!(result.text, "a b\n\nc");
    }
}
