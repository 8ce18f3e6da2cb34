//! Output format conversion
//!
//! Pure functions turning a fetched or rendered document into the format a
//! caller asked for. HTML goes through a `scraper` DOM walk; binary payloads
//! are never converted and always come back as raw bytes.

use crate::FetchError;
use scraper::{ElementRef, Html};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

const BINARY_PREFIXES: &[&str] = &[
    "image/",
    "audio/",
    "video/",
    "font/",
    "application/octet-stream",
    "application/pdf",
    "application/zip",
    "application/gzip",
    "application/x-tar",
    "application/x-rar",
    "application/x-7z",
    "application/vnd.ms-",
    "application/vnd.openxmlformats",
    "application/wasm",
];

/// Nesting below this depth is flattened to plain text.
const MAX_DEPTH: usize = 128;

const SKIPPED_ELEMENTS: &[&str] = &[
    "script", "style", "noscript", "template", "svg", "head", "iframe", "canvas",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    #[default]
    Markdown,
    Text,
    Html,
    Raw,
}

impl OutputFormat {
    /// Pick a format from an Accept-style hint; the first recognised media
    /// type wins and anything else means Markdown.
    pub fn from_accept(hint: Option<&str>) -> Self {
        let Some(hint) = hint else {
            return OutputFormat::Markdown;
        };
        for part in hint.split(',') {
            let media = part.split(';').next().unwrap_or("").trim().to_ascii_lowercase();
            match media.as_str() {
                "text/markdown" | "text/x-markdown" => return OutputFormat::Markdown,
                "text/plain" => return OutputFormat::Text,
                "text/html" | "application/xhtml+xml" => return OutputFormat::Html,
                "application/octet-stream" => return OutputFormat::Raw,
                _ => {}
            }
        }
        OutputFormat::Markdown
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            OutputFormat::Markdown => "markdown",
            OutputFormat::Text => "text",
            OutputFormat::Html => "html",
            OutputFormat::Raw => "raw",
        }
    }

    pub fn extension(&self) -> &'static str {
        match self {
            OutputFormat::Markdown => "md",
            OutputFormat::Text => "txt",
            OutputFormat::Html => "html",
            OutputFormat::Raw => "bin",
        }
    }
}

impl fmt::Display for OutputFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OutputFormat {
    type Err = FetchError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "markdown" | "md" => Ok(OutputFormat::Markdown),
            "text" | "txt" | "plain" => Ok(OutputFormat::Text),
            "html" => Ok(OutputFormat::Html),
            "raw" | "binary" => Ok(OutputFormat::Raw),
            other => Err(FetchError::Validation(format!("unknown output format '{other}'"))),
        }
    }
}

/// Converted document body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "encoding", content = "data", rename_all = "snake_case")]
pub enum OutcomeContent {
    Text(String),
    #[serde(rename = "base64", with = "base64_bytes")]
    Binary(Vec<u8>),
}

impl OutcomeContent {
    pub fn len(&self) -> usize {
        match self {
            OutcomeContent::Text(text) => text.len(),
            OutcomeContent::Binary(bytes) => bytes.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            OutcomeContent::Text(text) => Some(text),
            OutcomeContent::Binary(_) => None,
        }
    }
}

mod base64_bytes {
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&base64::engine::general_purpose::STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        base64::engine::general_purpose::STANDARD
            .decode(encoded)
            .map_err(serde::de::Error::custom)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Converted {
    /// Format actually produced, which differs from the request for binary
    /// or non-HTML input.
    pub format: OutputFormat,
    pub content: OutcomeContent,
}

pub fn is_binary_content_type(content_type: Option<&str>) -> bool {
    let Some(ct) = content_type else {
        return false;
    };
    let ct = ct.trim().to_ascii_lowercase();
    BINARY_PREFIXES.iter().any(|prefix| ct.starts_with(prefix))
}

/// HTML by content type, or by the document's first bytes when no type was
/// sent.
pub fn looks_like_html(content_type: Option<&str>, body: &[u8]) -> bool {
    match content_type {
        Some(ct) => {
            let ct = ct.to_ascii_lowercase();
            ct.contains("text/html") || ct.contains("application/xhtml")
        }
        None => {
            let head: Vec<u8> = body
                .iter()
                .skip_while(|b| b.is_ascii_whitespace())
                .take(15)
                .map(|b| b.to_ascii_lowercase())
                .collect();
            head.starts_with(b"<!doctype html") || head.starts_with(b"<html")
        }
    }
}

pub fn convert(
    body: &[u8],
    content_type: Option<&str>,
    format: OutputFormat,
) -> Result<Converted, FetchError> {
    if is_binary_content_type(content_type) {
        return Ok(Converted {
            format: OutputFormat::Raw,
            content: OutcomeContent::Binary(body.to_vec()),
        });
    }

    if format == OutputFormat::Raw {
        let content = match std::str::from_utf8(body) {
            Ok(text) => OutcomeContent::Text(text.to_string()),
            Err(_) => OutcomeContent::Binary(body.to_vec()),
        };
        return Ok(Converted {
            format: OutputFormat::Raw,
            content,
        });
    }

    let text = String::from_utf8_lossy(body);
    if !looks_like_html(content_type, body) {
        return Ok(Converted {
            format: OutputFormat::Text,
            content: OutcomeContent::Text(text.into_owned()),
        });
    }

    let content = match format {
        OutputFormat::Html | OutputFormat::Raw => text.into_owned(),
        OutputFormat::Markdown => html_to_markdown(&text),
        OutputFormat::Text => html_to_text(&text),
    };
    Ok(Converted {
        format,
        content: OutcomeContent::Text(content),
    })
}

pub fn html_to_markdown(html: &str) -> String {
    let document = Html::parse_document(html);
    let mut writer = DocumentWriter::new(Style::Markdown);
    writer.element(document.root_element());
    tidy(&writer.out)
}

pub fn html_to_text(html: &str) -> String {
    let document = Html::parse_document(html);
    let mut writer = DocumentWriter::new(Style::Text);
    writer.element(document.root_element());
    tidy(&writer.out)
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Style {
    Markdown,
    Text,
}

#[derive(Clone, Copy)]
enum ListKind {
    Unordered,
    Ordered(usize),
}

struct DocumentWriter {
    style: Style,
    out: String,
    lists: Vec<ListKind>,
    in_pre: bool,
    depth: usize,
}

impl DocumentWriter {
    fn new(style: Style) -> Self {
        Self {
            style,
            out: String::new(),
            lists: Vec::new(),
            in_pre: false,
            depth: 0,
        }
    }

    fn markdown(&self) -> bool {
        self.style == Style::Markdown
    }

    fn block_break(&mut self) {
        if !self.out.is_empty() && !self.out.ends_with("\n\n") {
            if self.out.ends_with('\n') {
                self.out.push('\n');
            } else {
                self.out.push_str("\n\n");
            }
        }
    }

    fn line_break(&mut self) {
        if !self.out.is_empty() && !self.out.ends_with('\n') {
            self.out.push('\n');
        }
    }

    fn text(&mut self, text: &str) {
        if self.in_pre {
            self.out.push_str(text);
            return;
        }
        let starts_with_space = text.starts_with(char::is_whitespace);
        let ends_with_space = text.ends_with(char::is_whitespace);
        let words: Vec<&str> = text.split_whitespace().collect();
        if words.is_empty() {
            if !text.is_empty() && !self.out.is_empty() && !self.out.ends_with([' ', '\n']) {
                self.out.push(' ');
            }
            return;
        }
        if starts_with_space && !self.out.is_empty() && !self.out.ends_with([' ', '\n']) {
            self.out.push(' ');
        }
        self.out.push_str(&words.join(" "));
        if ends_with_space {
            self.out.push(' ');
        }
    }

    /// Render the children of `el` into a separate buffer.
    fn capture(&mut self, el: ElementRef<'_>) -> String {
        let saved = std::mem::take(&mut self.out);
        self.children(el);
        std::mem::replace(&mut self.out, saved).trim().to_string()
    }

    fn children(&mut self, el: ElementRef<'_>) {
        for child in el.children() {
            if let Some(text) = child.value().as_text() {
                self.text(text);
            } else if let Some(child_el) = ElementRef::wrap(child) {
                self.element(child_el);
            }
        }
    }

    /// Emit the text under `el` without recursing.
    fn flatten(&mut self, el: ElementRef<'_>) {
        let mut stack = vec![*el];
        while let Some(node) = stack.pop() {
            if let Some(text) = node.value().as_text() {
                self.text(text);
                continue;
            }
            if let Some(element) = node.value().as_element() {
                if SKIPPED_ELEMENTS.contains(&element.name()) {
                    continue;
                }
                if element.name() == "br" {
                    self.line_break();
                }
            }
            stack.extend(node.children().rev());
        }
    }

    fn element(&mut self, el: ElementRef<'_>) {
        let name = el.value().name();
        if SKIPPED_ELEMENTS.contains(&name) {
            return;
        }
        if self.depth >= MAX_DEPTH {
            self.flatten(el);
            return;
        }

        self.depth += 1;
        self.element_body(el, name);
        self.depth -= 1;
    }

    fn element_body(&mut self, el: ElementRef<'_>, name: &str) {
        match name {
            "h1" | "h2" | "h3" | "h4" | "h5" | "h6" => {
                let level = name[1..].parse::<usize>().unwrap_or(1);
                let inner = self.capture(el);
                self.block_break();
                if self.markdown() {
                    self.out.push_str(&"#".repeat(level));
                    self.out.push(' ');
                }
                self.out.push_str(&inner);
                self.block_break();
            }
            "p" | "div" | "section" | "article" | "main" | "header" | "footer" | "nav"
            | "aside" | "figure" | "table" | "form" => {
                self.block_break();
                self.children(el);
                self.block_break();
            }
            "tr" => {
                self.line_break();
                self.children(el);
                self.line_break();
            }
            "td" | "th" => {
                self.children(el);
                self.out.push(' ');
            }
            "br" => self.out.push('\n'),
            "hr" => {
                self.block_break();
                if self.markdown() {
                    self.out.push_str("---");
                }
                self.block_break();
            }
            "pre" => {
                self.block_break();
                let was_pre = self.in_pre;
                self.in_pre = true;
                if self.markdown() {
                    self.out.push_str("```\n");
                }
                self.children(el);
                if self.markdown() {
                    if !self.out.ends_with('\n') {
                        self.out.push('\n');
                    }
                    self.out.push_str("```");
                }
                self.in_pre = was_pre;
                self.block_break();
            }
            "code" if !self.in_pre && self.markdown() => {
                let inner = self.capture(el);
                self.out.push('`');
                self.out.push_str(&inner);
                self.out.push('`');
            }
            "strong" | "b" if self.markdown() => self.wrap_inline(el, "**"),
            "em" | "i" if self.markdown() => self.wrap_inline(el, "*"),
            "a" => {
                let inner = self.capture(el);
                match el.value().attr("href") {
                    Some(href) if self.markdown() && !inner.is_empty() && !href.starts_with("javascript:") => {
                        self.out.push_str(&format!("[{inner}]({href})"));
                    }
                    _ => self.out.push_str(&inner),
                }
            }
            "img" => {
                if self.markdown() {
                    let alt = el.value().attr("alt").unwrap_or("");
                    if let Some(src) = el.value().attr("src") {
                        self.out.push_str(&format!("![{alt}]({src})"));
                    }
                } else if let Some(alt) = el.value().attr("alt") {
                    self.text(alt);
                }
            }
            "ul" | "ol" => {
                self.block_break();
                self.lists.push(if name == "ol" {
                    ListKind::Ordered(1)
                } else {
                    ListKind::Unordered
                });
                self.children(el);
                self.lists.pop();
                self.block_break();
            }
            "li" => {
                self.line_break();
                let depth = self.lists.len().saturating_sub(1);
                self.out.push_str(&"  ".repeat(depth));
                let marker = match self.lists.last_mut() {
                    Some(ListKind::Ordered(n)) => {
                        let marker = format!("{n}. ");
                        *n += 1;
                        marker
                    }
                    _ => "- ".to_string(),
                };
                self.out.push_str(&marker);
                self.children(el);
                self.line_break();
            }
            "blockquote" => {
                let inner = self.capture(el);
                self.block_break();
                if self.markdown() {
                    let quoted: Vec<String> = inner
                        .lines()
                        .map(|line| if line.is_empty() { ">".to_string() } else { format!("> {line}") })
                        .collect();
                    self.out.push_str(&quoted.join("\n"));
                } else {
                    self.out.push_str(&inner);
                }
                self.block_break();
            }
            _ => self.children(el),
        }
    }

    fn wrap_inline(&mut self, el: ElementRef<'_>, marker: &str) {
        let inner = self.capture(el);
        if inner.is_empty() {
            return;
        }
        if !self.out.is_empty() && !self.out.ends_with([' ', '\n']) && self.out.ends_with(char::is_alphanumeric) {
            self.out.push(' ');
        }
        self.out.push_str(marker);
        self.out.push_str(&inner);
        self.out.push_str(marker);
    }
}

/// Trim trailing spaces and collapse runs of blank lines.
fn tidy(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    let mut blank_run = 0;
    for line in raw.lines() {
        let line = line.trim_end();
        if line.is_empty() {
            blank_run += 1;
            if blank_run > 1 {
                continue;
            }
        } else {
            blank_run = 0;
        }
        out.push_str(line);
        out.push('\n');
    }
    out.trim().to_string()
}
