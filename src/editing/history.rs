use crate::core::dom::document::Result;
use crate::core::dom::{Document, NodeId};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use tracing::debug;

/// State of one element captured before an edit touched it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ElementSnapshot {
    pub element_index: usize,
    #[serde(rename = "outerHTML")]
    pub outer_html: String,
    pub inline_style: String,
    pub classes: Vec<String>,
}

/// One undoable edit. `elements` are non-owning: a node removed from the
/// document since is skipped on undo.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EditHistoryEntry {
    pub description: String,
    pub snapshots: Vec<ElementSnapshot>,
    pub elements: Vec<NodeId>,
    pub inserted_nodes: Vec<NodeId>,
}

/// LIFO stack of entries. A non-zero `limit` evicts the oldest entry.
#[derive(Debug, Default)]
pub struct EditHistory {
    entries: VecDeque<EditHistoryEntry>,
    limit: usize,
}

impl EditHistory {
    pub fn new(limit: usize) -> Self {
        Self {
            entries: VecDeque::new(),
            limit,
        }
    }

    pub fn push(&mut self, entry: EditHistoryEntry) {
        self.entries.push_back(entry);
        if self.limit > 0 && self.entries.len() > self.limit {
            if let Some(evicted) = self.entries.pop_front() {
                debug!(description = %evicted.description, "edit history full, dropping oldest entry");
            }
        }
    }

    pub fn pop(&mut self) -> Option<EditHistoryEntry> {
        self.entries.pop_back()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    /// Most recent first.
    pub fn descriptions(&self) -> Vec<String> {
        self.entries.iter().rev().map(|e| e.description.clone()).collect()
    }
}

pub fn capture_snapshot(document: &Document, id: NodeId, element_index: usize) -> Result<ElementSnapshot> {
    let outer_html = document.outer_html(id)?;
    let (inline_style, classes) = document.with_node(id, |node| (node.style_text(), node.class_list()))?;
    Ok(ElementSnapshot {
        element_index,
        outer_html,
        inline_style,
        classes,
    })
}

/// Puts an element back to `snapshot`.
///
/// Inline style and class list are restored first. If the serialized
/// element still differs from the captured markup, the markup is reparsed
/// and its attributes and children replace the live ones. The element keeps
/// its identity either way.
pub fn restore_snapshot(document: &Document, id: NodeId, snapshot: &ElementSnapshot) -> Result<()> {
    document.with_node_mut(id, |node| {
        node.set_style_text(&snapshot.inline_style);
        if !snapshot.classes.is_empty() || node.get_attribute("class").is_some() {
            node.set_attribute("class", &snapshot.classes.join(" "));
        }
    })?;

    if document.outer_html(id)? == snapshot.outer_html {
        return Ok(());
    }

    let tag_name = document.tag_name(id).unwrap_or_default();
    let context = document.fragment_context(id);
    let parsed = document.parse_fragment_in(&context, &snapshot.outer_html);
    let restored = parsed
        .iter()
        .copied()
        .find(|candidate| document.tag_name(*candidate).as_deref() == Some(tag_name.as_str()))
        .or_else(|| parsed.iter().copied().find(|candidate| document.is_element(*candidate)));

    if let Some(restored) = restored {
        let attributes = document.with_node(restored, |node| node.attributes.clone())?;
        document.with_node_mut(id, |node| node.attributes = attributes)?;
        let children = document.children(restored);
        document.replace_children(id, children)?;
    }

    for leftover in parsed {
        if document.contains(leftover) {
            document.remove_node(leftover)?;
        }
    }
    Ok(())
}
