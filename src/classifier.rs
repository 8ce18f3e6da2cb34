//! Rendering-need classification
//!
//! Decides from a plain-fetched document whether JavaScript has to run
//! before the page holds usable content. Verdicts are remembered per URL in
//! two bounded LRU sets; inconclusive documents are re-examined every time.

use crate::utils::host_matches_any;
use crate::{ClassifierSettings, LruSet};
use scraper::Html;
use serde::Serialize;
use std::sync::{Mutex, MutexGuard};
use tracing::debug;

/// Phrases sites show when they refuse to work without scripts.
pub const JAVASCRIPT_NOTICES: &[&str] = &[
    "please enable javascript",
    "javascript is required",
    "enable js",
    "turn on javascript",
    "javascript is disabled",
    "requires javascript",
];

const HIDDEN_ELEMENTS: &[&str] = &["script", "style", "template"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DecisionReason {
    CachedRender,
    CachedStatic,
    NotHtml,
    JavascriptNotice,
    NoBody,
    FrameworkShell,
    MissingMetadata,
    JsHeavyDomain,
    RichStaticContent,
    Inconclusive,
}

impl DecisionReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            DecisionReason::CachedRender => "cached_render",
            DecisionReason::CachedStatic => "cached_static",
            DecisionReason::NotHtml => "not_html",
            DecisionReason::JavascriptNotice => "javascript_notice",
            DecisionReason::NoBody => "no_body",
            DecisionReason::FrameworkShell => "framework_shell",
            DecisionReason::MissingMetadata => "missing_metadata",
            DecisionReason::JsHeavyDomain => "js_heavy_domain",
            DecisionReason::RichStaticContent => "rich_static_content",
            DecisionReason::Inconclusive => "inconclusive",
        }
    }
}

/// Classifier verdict. `Ambiguous` is kept apart from `Static` so callers
/// can tell "looked and found nothing" from "confirmed static".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "decision", content = "reason", rename_all = "snake_case")]
pub enum RenderDecision {
    Render(DecisionReason),
    Static(DecisionReason),
    Ambiguous(DecisionReason),
}

impl RenderDecision {
    pub fn needs_rendering(&self) -> bool {
        matches!(self, RenderDecision::Render(_))
    }

    pub fn reason(&self) -> DecisionReason {
        match self {
            RenderDecision::Render(r) | RenderDecision::Static(r) | RenderDecision::Ambiguous(r) => *r,
        }
    }
}

struct DecisionCaches {
    render: LruSet,
    static_pages: LruSet,
}

pub struct RenderingClassifier {
    settings: ClassifierSettings,
    caches: Mutex<DecisionCaches>,
}

/// What a single pass over the parsed document found.
#[derive(Debug, Default)]
struct DocumentSignals {
    visible_text: String,
    body_text_chars: usize,
    framework_root: bool,
    title_meta: bool,
    description_meta: bool,
    social_meta: bool,
}

impl RenderingClassifier {
    pub fn new(settings: ClassifierSettings) -> Self {
        let capacity = settings.cache_capacity;
        Self {
            settings,
            caches: Mutex::new(DecisionCaches {
                render: LruSet::new(capacity),
                static_pages: LruSet::new(capacity),
            }),
        }
    }

    fn caches(&self) -> MutexGuard<'_, DecisionCaches> {
        self.caches.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn needs_rendering(&self, url: &str, body: &[u8], content_type: Option<&str>) -> bool {
        self.classify(url, body, content_type).needs_rendering()
    }

    /// Run the decision cascade, first match wins.
    pub fn classify(&self, url: &str, body: &[u8], content_type: Option<&str>) -> RenderDecision {
        {
            let mut caches = self.caches();
            if caches.render.touch(url) {
                return self.finish(url, RenderDecision::Render(DecisionReason::CachedRender));
            }
            if caches.static_pages.touch(url) {
                return self.finish(url, RenderDecision::Static(DecisionReason::CachedStatic));
            }
        }

        let decision = self.evaluate(url, body, content_type);
        {
            let mut caches = self.caches();
            match decision {
                RenderDecision::Render(_) => {
                    caches.static_pages.remove(url);
                    caches.render.insert(url);
                }
                RenderDecision::Static(DecisionReason::NotHtml) => {}
                RenderDecision::Static(_) => {
                    caches.render.remove(url);
                    caches.static_pages.insert(url);
                }
                RenderDecision::Ambiguous(_) => {}
            }
        }
        self.finish(url, decision)
    }

    fn finish(&self, url: &str, decision: RenderDecision) -> RenderDecision {
        debug!("Classified {} as {:?}", url, decision);
        let render = match decision {
            RenderDecision::Render(_) => Some(true),
            RenderDecision::Static(_) => Some(false),
            RenderDecision::Ambiguous(_) => None,
        };
        crate::metrics::record_decision(decision.reason().as_str(), render);
        decision
    }

    fn evaluate(&self, url: &str, body: &[u8], content_type: Option<&str>) -> RenderDecision {
        if !is_html_content_type(content_type) {
            return RenderDecision::Static(DecisionReason::NotHtml);
        }

        // Legacy single-byte pages still carry ASCII markup and notices.
        let source = String::from_utf8_lossy(body);
        let document = Html::parse_document(&source);
        let signals = collect_signals(&document);

        if JAVASCRIPT_NOTICES
            .iter()
            .any(|phrase| signals.visible_text.contains(phrase))
        {
            return RenderDecision::Render(DecisionReason::JavascriptNotice);
        }

        if !contains_body_tag(body) {
            return RenderDecision::Static(DecisionReason::NoBody);
        }

        if signals.framework_root
            && signals.body_text_chars < self.settings.min_framework_content_chars
        {
            return RenderDecision::Render(DecisionReason::FrameworkShell);
        }

        if body.len() < self.settings.small_document_bytes
            && !signals.title_meta
            && !signals.description_meta
        {
            return RenderDecision::Render(DecisionReason::MissingMetadata);
        }

        if let Some(host) = url::Url::parse(url).ok().and_then(|u| u.host_str().map(str::to_string)) {
            if host_matches_any(&host, &self.settings.js_heavy_domains) {
                return RenderDecision::Render(DecisionReason::JsHeavyDomain);
            }
        }

        if signals.body_text_chars > self.settings.rich_text_chars && signals.social_meta {
            return RenderDecision::Static(DecisionReason::RichStaticContent);
        }

        RenderDecision::Ambiguous(DecisionReason::Inconclusive)
    }

    /// Entries in the (render, static) caches.
    pub fn cache_sizes(&self) -> (usize, usize) {
        let caches = self.caches();
        (caches.render.len(), caches.static_pages.len())
    }

    pub fn clear_cache(&self) {
        let mut caches = self.caches();
        caches.render.clear();
        caches.static_pages.clear();
    }
}

pub fn is_html_content_type(content_type: Option<&str>) -> bool {
    content_type
        .map(|ct| ct.to_ascii_lowercase().contains("html"))
        .unwrap_or(false)
}

/// Elements whose content is never parsed as markup.
const RAW_TEXT_ELEMENTS: &[&[u8]] = &[b"script", b"style", b"textarea", b"title"];

/// Whether the markup as sent contains an opening `<body>` tag. The parsed
/// tree cannot answer this because the parser always synthesizes a body, so
/// this scans the source while skipping comments and raw-text elements.
fn contains_body_tag(source: &[u8]) -> bool {
    let mut pos = 0;
    while let Some(offset) = source[pos..].iter().position(|&b| b == b'<') {
        let tag = &source[pos + offset..];
        if tag.starts_with(b"<!--") {
            pos += offset + 4 + find(&tag[4..], b"-->").map_or(tag.len() - 4, |end| end + 3);
            continue;
        }
        if opens_element(tag, b"body") {
            return true;
        }
        if let Some(name) = RAW_TEXT_ELEMENTS.iter().find(|name| opens_element(tag, name)) {
            let mut closing = Vec::with_capacity(name.len() + 2);
            closing.extend_from_slice(b"</");
            closing.extend_from_slice(name);
            let rest = &tag[name.len() + 1..];
            pos += offset + name.len() + 1 + find(rest, &closing).unwrap_or(rest.len());
            continue;
        }
        pos += offset + 1;
    }
    false
}

/// `tag` starts with `<name` followed by a tag-name boundary.
fn opens_element(tag: &[u8], name: &[u8]) -> bool {
    let Some(candidate) = tag.get(1..=name.len()) else {
        return false;
    };
    candidate.eq_ignore_ascii_case(name)
        && tag
            .get(name.len() + 1)
            .map_or(true, |&b| b == b'>' || b == b'/' || b.is_ascii_whitespace())
}

/// Case-insensitive position of `needle` in `haystack`.
fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|w| w.eq_ignore_ascii_case(needle))
}

/// One pre-order pass over the tree. Each stack entry carries whether the
/// node sits under a hidden element and whether it sits under `<body>`, so
/// no node walks its ancestors.
fn collect_signals(document: &Html) -> DocumentSignals {
    let mut signals = DocumentSignals::default();
    let mut visible = String::new();
    let mut body_text = String::new();

    let mut stack = vec![(*document.root_element(), false, false)];
    while let Some((node, hidden, in_body)) = stack.pop() {
        if let Some(text) = node.value().as_text() {
            if hidden {
                continue;
            }
            visible.push_str(text);
            visible.push(' ');
            if in_body {
                body_text.push_str(text);
                body_text.push(' ');
            }
            continue;
        }

        let Some(el) = node.value().as_element() else {
            stack.extend(node.children().rev().map(|c| (c, hidden, in_body)));
            continue;
        };

        if matches!(el.id(), Some("root") | Some("app"))
            || el.attr("ng-app").is_some()
            || el.attr("data-ng-app").is_some()
        {
            signals.framework_root = true;
        }

        if el.name() == "meta" {
            let key = el
                .attr("property")
                .or_else(|| el.attr("name"))
                .unwrap_or("")
                .to_ascii_lowercase();
            let has_content = el.attr("content").map_or(false, |c| !c.trim().is_empty());
            if has_content {
                match key.as_str() {
                    "og:title" | "twitter:title" => signals.title_meta = true,
                    "og:description" | "twitter:description" | "description" => {
                        signals.description_meta = true
                    }
                    _ => {}
                }
                if key.starts_with("og:") || key.starts_with("twitter:") {
                    signals.social_meta = true;
                }
            }
        }

        let hidden = hidden || HIDDEN_ELEMENTS.contains(&el.name());
        let in_body = in_body || el.name() == "body";
        stack.extend(node.children().rev().map(|c| (c, hidden, in_body)));
    }

    signals.visible_text = collapse_whitespace(&visible).to_lowercase();
    signals.body_text_chars = collapse_whitespace(&body_text).chars().count();
    signals
}

fn collapse_whitespace(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}
