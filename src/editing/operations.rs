use super::EditError;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InsertPosition {
    Before,
    After,
    Prepend,
    Append,
}

impl InsertPosition {
    /// Sibling insertions need the target to have a parent.
    pub fn is_sibling(self) -> bool {
        matches!(self, InsertPosition::Before | InsertPosition::After)
    }
}

/// Either an index into the caller's selected elements or a selector for
/// document-wide changes. A non-empty selector wins.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ElementTarget {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub element_index: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub selector: Option<String>,
}

impl ElementTarget {
    pub fn index(index: usize) -> Self {
        Self {
            element_index: Some(index),
            selector: None,
        }
    }

    pub fn selector(selector: impl Into<String>) -> Self {
        Self {
            element_index: None,
            selector: Some(selector.into()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum EditOperation {
    SetStyle {
        #[serde(flatten)]
        target: ElementTarget,
        /// camelCase or kebab-case property name.
        property: String,
        value: String,
    },
    AddClass {
        #[serde(flatten)]
        target: ElementTarget,
        #[serde(rename = "className")]
        class_name: String,
    },
    RemoveClass {
        #[serde(flatten)]
        target: ElementTarget,
        #[serde(rename = "className")]
        class_name: String,
    },
    SetAttribute {
        #[serde(flatten)]
        target: ElementTarget,
        name: String,
        value: String,
    },
    RemoveAttribute {
        #[serde(flatten)]
        target: ElementTarget,
        name: String,
    },
    SetTextContent {
        #[serde(flatten)]
        target: ElementTarget,
        text: String,
    },
    SetInnerHtml {
        #[serde(flatten)]
        target: ElementTarget,
        html: String,
    },
    InsertHtml {
        position: InsertPosition,
        #[serde(rename = "targetElementIndex", default, skip_serializing_if = "Option::is_none")]
        target_element_index: Option<usize>,
        #[serde(rename = "targetSelector", default, skip_serializing_if = "Option::is_none")]
        target_selector: Option<String>,
        html: String,
    },
}

impl EditOperation {
    /// Target of an element operation; `None` for `insert-html`.
    pub fn target(&self) -> Option<&ElementTarget> {
        match self {
            EditOperation::SetStyle { target, .. }
            | EditOperation::AddClass { target, .. }
            | EditOperation::RemoveClass { target, .. }
            | EditOperation::SetAttribute { target, .. }
            | EditOperation::RemoveAttribute { target, .. }
            | EditOperation::SetTextContent { target, .. }
            | EditOperation::SetInnerHtml { target, .. } => Some(target),
            EditOperation::InsertHtml { .. } => None,
        }
    }
}

/// Destination of a `dom_write`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WritePath {
    /// `style.<prop>`, written with `!important`.
    Style(String),
    Text,
    Html,
    SetAttribute(String),
    RemoveAttribute(String),
    AddClass(String),
    RemoveClass(String),
}

impl WritePath {
    pub fn parse(path: &str) -> Result<Self, EditError> {
        let named = |name: &str, build: fn(String) -> WritePath| {
            if name.is_empty() {
                Err(EditError::UnknownPath(path.to_string()))
            } else {
                Ok(build(name.to_string()))
            }
        };

        if let Some(property) = path.strip_prefix("style.") {
            named(property, WritePath::Style)
        } else if path == "text" {
            Ok(WritePath::Text)
        } else if path == "html" {
            Ok(WritePath::Html)
        } else if let Some(name) = path.strip_prefix("attr.") {
            match name.strip_prefix('-') {
                Some(removed) => named(removed, WritePath::RemoveAttribute),
                None => named(name, WritePath::SetAttribute),
            }
        } else if let Some(class) = path.strip_prefix("class.") {
            named(class, WritePath::AddClass)
        } else if let Some(class) = path.strip_prefix("-class.") {
            named(class, WritePath::RemoveClass)
        } else {
            Err(EditError::UnknownPath(path.to_string()))
        }
    }
}

/// What a `dom_read` returns for each matched element.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReadPath {
    Text,
    Html,
    Style,
    StyleProperty(String),
    Attribute(String),
    Classes,
}

impl ReadPath {
    pub fn parse(path: &str) -> Result<Self, EditError> {
        match path {
            "text" => Ok(ReadPath::Text),
            "html" => Ok(ReadPath::Html),
            "style" => Ok(ReadPath::Style),
            "classes" => Ok(ReadPath::Classes),
            _ => {
                if let Some(property) = path.strip_prefix("style.").filter(|p| !p.is_empty()) {
                    Ok(ReadPath::StyleProperty(property.to_string()))
                } else if let Some(name) = path.strip_prefix("attr.").filter(|n| !n.is_empty()) {
                    Ok(ReadPath::Attribute(name.to_string()))
                } else {
                    Err(EditError::UnknownPath(path.to_string()))
                }
            }
        }
    }
}

/// Tool invocation as produced by an external edit collaborator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "tool", rename_all = "snake_case")]
pub enum ToolCall {
    DomWrite {
        selector: String,
        path: String,
        value: String,
    },
    DomInsert {
        #[serde(rename = "targetSelector")]
        target_selector: String,
        position: InsertPosition,
        html: String,
    },
    DomRead {
        selector: String,
        path: String,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum ToolOutcome {
    /// Whether a history entry was recorded.
    Applied(bool),
    Read(Vec<String>),
}
