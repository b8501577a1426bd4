use crate::core::dom::{Document, NodeId};
use serde::Serialize;
use std::collections::BTreeMap;

pub const TRUNCATION_MARKER: &str = "<!-- truncated -->";

const LANDMARK_TAGS: &[&str] = &["header", "main", "nav", "footer", "section", "article"];
const SKIPPED_TAGS: &[&str] = &["script", "style", "svg"];
const MAX_STRUCTURE_DEPTH: usize = 4;
const MAX_STRUCTURE_LINES: usize = 50;
const MAX_SAMPLE_HTML: usize = 1800;

/// Portable description of a selected element.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ElementContext {
    pub index: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub tag_name: String,
    #[serde(rename = "outerHTML")]
    pub outer_html: String,
    pub classes: Vec<String>,
    pub inline_style: String,
    pub text_content: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Theme {
    Dark,
    Light,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Landmark {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub tag: String,
    pub classes: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
}

/// Lightweight outline of the page for document-wide edits.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PageContext {
    pub tag_counts: BTreeMap<String, usize>,
    pub landmarks: Vec<Landmark>,
    pub structure: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub page_title: Option<String>,
    pub theme: Theme,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content_summary: Option<String>,
    #[serde(rename = "sampleSectionHTML", skip_serializing_if = "Option::is_none")]
    pub sample_section_html: Option<String>,
}

pub(crate) fn truncate_chars(text: &str, limit: usize) -> &str {
    match text.char_indices().nth(limit) {
        Some((cut, _)) => &text[..cut],
        None => text,
    }
}

pub(crate) fn element_context(
    document: &Document,
    id: NodeId,
    index: usize,
    outer_html_limit: usize,
    text_limit: usize,
) -> crate::core::dom::document::Result<ElementContext> {
    let mut outer_html = document.outer_html(id)?;
    if outer_html.chars().count() > outer_html_limit {
        outer_html = format!("{}{TRUNCATION_MARKER}", truncate_chars(&outer_html, outer_html_limit));
    }
    let text = document.text_content(id);

    document.with_node(id, |node| ElementContext {
        index,
        id: node.element_id().map(str::to_string),
        tag_name: node.tag_name.clone(),
        outer_html,
        classes: node.class_list(),
        inline_style: node.style_text(),
        text_content: truncate_chars(&text, text_limit).to_string(),
    })
}

struct PageWalker<'a> {
    document: &'a Document,
    overlay_attribute: &'a str,
    tag_counts: BTreeMap<String, usize>,
    landmarks: Vec<Landmark>,
    lines: Vec<String>,
}

impl PageWalker<'_> {
    fn in_overlay(&self, id: NodeId) -> bool {
        self.document
            .closest_with_attribute(id, self.overlay_attribute)
            .is_some()
    }

    fn walk(&mut self, id: NodeId, depth: usize) {
        if self.in_overlay(id) {
            return;
        }
        let Some(node) = self.document.node(id) else {
            return;
        };
        let tag = node.tag_name.clone();
        if SKIPPED_TAGS.contains(&tag.as_str()) {
            return;
        }
        *self.tag_counts.entry(tag.clone()).or_default() += 1;

        if node.element_id().is_some() || LANDMARK_TAGS.contains(&tag.as_str()) {
            let text = self.document.text_content(id);
            let text = truncate_chars(text.trim(), 40).to_string();
            self.landmarks.push(Landmark {
                id: node.element_id().map(str::to_string),
                tag: tag.clone(),
                classes: node.class_list().into_iter().take(3).collect(),
                text: (!text.is_empty()).then_some(text),
            });
        }

        if depth < MAX_STRUCTURE_DEPTH && self.lines.len() < MAX_STRUCTURE_LINES {
            let visible: Vec<NodeId> = self
                .document
                .element_children(id)
                .into_iter()
                .filter(|child| !self.in_overlay(*child))
                .collect();
            if !visible.is_empty() {
                self.lines.push(format!("{}<{tag}>", "  ".repeat(depth)));
                for child in visible {
                    self.walk(child, depth + 1);
                }
            }
        }
    }
}

pub(crate) fn page_context(document: &Document, overlay_attribute: &str) -> PageContext {
    let Some(body) = document.body() else {
        return PageContext {
            tag_counts: BTreeMap::new(),
            landmarks: Vec::new(),
            structure: String::new(),
            page_title: None,
            theme: Theme::Light,
            content_summary: None,
            sample_section_html: None,
        };
    };

    let mut walker = PageWalker {
        document,
        overlay_attribute,
        tag_counts: BTreeMap::new(),
        landmarks: Vec::new(),
        lines: Vec::new(),
    };
    walker.walk(body, 0);

    let structure = if walker.lines.is_empty() {
        "<body>".to_string()
    } else {
        walker.lines.join("\n")
    };

    let first_text = |selector: &str| {
        document
            .query_selector_within(body, selector)
            .ok()
            .flatten()
            .map(|id| document.text_content(id).trim().to_string())
            .filter(|text| !text.is_empty())
    };

    let title = document
        .query_selector("title")
        .ok()
        .flatten()
        .map(|id| document.text_content(id).trim().to_string())
        .filter(|t| !t.is_empty());
    let page_title = title.or_else(|| first_text("h1").map(|t| truncate_chars(&t, 80).to_string()));

    let summary_parts: Vec<String> = [first_text("h1"), first_text("main p, article p, .content p, p")]
        .into_iter()
        .flatten()
        .collect();
    let content_summary = truncate_chars(&summary_parts.join(" — "), 200).to_string();

    let sample_section_html = document
        .query_selector_within(body, "main section, main > div, article section, section")
        .ok()
        .flatten()
        .and_then(|id| document.outer_html(id).ok())
        .map(|html| truncate_chars(&html, MAX_SAMPLE_HTML).to_string());

    PageContext {
        tag_counts: walker.tag_counts,
        landmarks: walker.landmarks,
        structure,
        page_title,
        theme: detect_theme(document, body),
        content_summary: (!content_summary.is_empty()).then_some(content_summary),
        sample_section_html,
    }
}

/// `dark` class on the root element, else the luminance of an inline body
/// background colour.
fn detect_theme(document: &Document, body: NodeId) -> Theme {
    let root_is_dark = document
        .document_element()
        .and_then(|html| document.with_node(html, |n| n.has_class("dark")).ok())
        .unwrap_or(false);
    if root_is_dark {
        return Theme::Dark;
    }

    let background = document
        .with_node(body, |n| n.style_property("background-color"))
        .ok()
        .flatten();
    if let Some(background) = background {
        let channels: Vec<f64> = background
            .split(|c: char| !c.is_ascii_digit())
            .filter(|part| !part.is_empty())
            .filter_map(|part| part.parse().ok())
            .collect();
        if channels.len() >= 3 {
            let luminance = 0.299 * channels[0] + 0.587 * channels[1] + 0.114 * channels[2];
            if luminance < 128.0 {
                return Theme::Dark;
            }
        }
    }
    Theme::Light
}
