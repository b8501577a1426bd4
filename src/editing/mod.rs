//! Reversible edits over a [`Document`].
//!
//! Every mutating call captures snapshots of the elements it is about to
//! touch, applies its changes, and records one history entry. [`EditEngine::undo`]
//! pops entries in LIFO order.

pub mod context;
pub mod history;
pub mod operations;

pub use context::{ElementContext, Landmark, PageContext, Theme};
pub use history::{EditHistory, EditHistoryEntry, ElementSnapshot};
pub use operations::{
    EditOperation, ElementTarget, InsertPosition, ReadPath, ToolCall, ToolOutcome, WritePath,
};

use crate::core::dom::{Document, DocumentError, NodeId};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, warn};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EditConfig {
    /// Elements inside an ancestor carrying this attribute are never targeted.
    pub overlay_attribute: String,
    /// A `dom_write` selector containing this falls back to `body` when it
    /// matches nothing.
    pub selection_marker: String,
    /// 0 keeps every entry.
    pub max_history: usize,
    pub outer_html_limit: usize,
    pub text_limit: usize,
}

impl Default for EditConfig {
    fn default() -> Self {
        Self {
            overlay_attribute: "data-i2-overlay".to_string(),
            selection_marker: "[data-i2-selected]".to_string(),
            max_history: 100,
            outer_html_limit: 2000,
            text_limit: 500,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum EditError {
    #[error("Unknown path: {0}")]
    UnknownPath(String),
    #[error(transparent)]
    Document(#[from] DocumentError),
}

pub struct EditEngine {
    document: Arc<Document>,
    config: EditConfig,
    history: Mutex<EditHistory>,
}

impl EditEngine {
    pub fn new(document: Arc<Document>, config: EditConfig) -> Self {
        let history = EditHistory::new(config.max_history);
        Self {
            document,
            config,
            history: Mutex::new(history),
        }
    }

    pub fn document(&self) -> &Arc<Document> {
        &self.document
    }

    /// Applies typed operations against `selected` (for `elementIndex`
    /// targets) or the whole document (for selectors). Returns whether a
    /// history entry was recorded.
    pub fn apply_edits(
        &self,
        selected: &[NodeId],
        operations: &[EditOperation],
        description: &str,
    ) -> Result<bool, EditError> {
        if operations.is_empty() {
            return Ok(false);
        }

        let mut affected: Vec<NodeId> = Vec::new();
        let mut resolved = Vec::with_capacity(operations.len());
        for operation in operations {
            let targets = match operation {
                EditOperation::InsertHtml {
                    position,
                    target_element_index,
                    target_selector,
                    ..
                } => {
                    let target = self.resolve_insert_target(
                        selected,
                        *target_element_index,
                        target_selector.as_deref(),
                    )?;
                    if let Some(target) = target {
                        self.check_insert_target(target, *position)?;
                    }
                    target.into_iter().collect()
                }
                other => match other.target() {
                    Some(target) => self.resolve_targets(selected, target)?,
                    None => Vec::new(),
                },
            };
            for id in &targets {
                if !affected.contains(id) {
                    affected.push(*id);
                }
            }
            resolved.push(targets);
        }

        if affected.is_empty() {
            debug!(description, "edit matched no elements");
            return Ok(false);
        }

        let snapshots = self.capture(&affected)?;
        let mut inserted_nodes = Vec::new();
        let outcome = operations
            .iter()
            .zip(resolved)
            .try_for_each(|(operation, targets)| {
                for id in targets {
                    if !self.document.contains(id) {
                        debug!(?id, "edit target removed by an earlier operation");
                        continue;
                    }
                    match operation {
                        EditOperation::InsertHtml { position, html, .. } => {
                            inserted_nodes.extend(self.insert_html(id, *position, html)?)
                        }
                        element_op => self.apply_operation(id, element_op)?,
                    }
                }
                Ok::<_, EditError>(())
            });

        // Recorded even on a partial failure so the applied part stays undoable.
        self.push(EditHistoryEntry {
            description: description.to_string(),
            snapshots,
            elements: affected,
            inserted_nodes,
        });
        outcome.map(|()| true)
    }

    /// Writes `value` at `path` on every element matching `selector`.
    pub fn apply_dom_write(
        &self,
        selector: &str,
        path: &str,
        value: &str,
        description: Option<&str>,
    ) -> Result<bool, EditError> {
        let path = WritePath::parse(path)?;

        let mut targets = self.query_filtered(selector)?;
        if targets.is_empty() && selector.contains(self.config.selection_marker.as_str()) {
            targets = self.query_filtered("body")?;
        }
        if targets.is_empty() {
            debug!(selector, "dom_write matched no elements");
            return Ok(false);
        }

        let snapshots = self.capture(&targets)?;
        let outcome = targets
            .iter()
            .try_for_each(|id| self.apply_path_write(*id, &path, value));

        self.push(EditHistoryEntry {
            description: description.unwrap_or("dom_write").to_string(),
            snapshots,
            elements: targets,
            inserted_nodes: Vec::new(),
        });
        outcome.map(|()| true)
    }

    /// Inserts `html` relative to the first element matching `target_selector`.
    pub fn apply_dom_insert(
        &self,
        target_selector: &str,
        position: InsertPosition,
        html: &str,
        description: Option<&str>,
    ) -> Result<bool, EditError> {
        let Some(target) = self.query_filtered(target_selector)?.into_iter().next() else {
            debug!(target_selector, "dom_insert matched no elements");
            return Ok(false);
        };
        self.check_insert_target(target, position)?;

        let snapshots = self.capture(&[target])?;
        let inserted_nodes = self.insert_html(target, position, html)?;
        self.push(EditHistoryEntry {
            description: description.unwrap_or("dom_insert").to_string(),
            snapshots,
            elements: vec![target],
            inserted_nodes,
        });
        Ok(true)
    }

    /// Reads `path` from every element matching `selector`. Never records history.
    pub fn read_path(&self, selector: &str, path: &str) -> Result<Vec<String>, EditError> {
        let path = ReadPath::parse(path)?;
        self.query_filtered(selector)?
            .into_iter()
            .map(|id| {
                let value = match &path {
                    ReadPath::Text => self.document.text_content(id),
                    ReadPath::Html => self.document.inner_html(id)?,
                    ReadPath::Style => self.document.with_node(id, |n| n.style_text())?,
                    ReadPath::StyleProperty(property) => self
                        .document
                        .with_node(id, |n| n.style_property(property).unwrap_or_default())?,
                    ReadPath::Attribute(name) => self
                        .document
                        .get_attribute(id, name)
                        .unwrap_or_default(),
                    ReadPath::Classes => self.document.with_node(id, |n| n.class_list().join(" "))?,
                };
                Ok::<_, EditError>(value)
            })
            .collect()
    }

    pub fn dispatch(&self, call: &ToolCall) -> Result<ToolOutcome, EditError> {
        match call {
            ToolCall::DomWrite {
                selector,
                path,
                value,
            } => self
                .apply_dom_write(selector, path, value, None)
                .map(ToolOutcome::Applied),
            ToolCall::DomInsert {
                target_selector,
                position,
                html,
            } => self
                .apply_dom_insert(target_selector, *position, html, None)
                .map(ToolOutcome::Applied),
            ToolCall::DomRead { selector, path } => self.read_path(selector, path).map(ToolOutcome::Read),
        }
    }

    /// Reverts the most recent entry. Returns `false` when history is empty.
    pub fn undo(&self) -> bool {
        let Some(entry) = self.history.lock().pop() else {
            return false;
        };

        for snapshot in &entry.snapshots {
            let Some(id) = entry.elements.get(snapshot.element_index).copied() else {
                continue;
            };
            if !self.document.contains(id) {
                debug!(?id, "undo target no longer in document");
                continue;
            }
            if let Err(e) = history::restore_snapshot(&self.document, id, snapshot) {
                warn!(?id, error = %e, "failed to restore element snapshot");
            }
        }

        for id in &entry.inserted_nodes {
            if self.document.contains(*id) {
                if let Err(e) = self.document.remove_node(*id) {
                    debug!(?id, error = %e, "inserted node already detached");
                }
            }
        }

        debug!(description = %entry.description, remaining = self.undo_count(), "edit undone");
        true
    }

    pub fn undo_count(&self) -> usize {
        self.history.lock().len()
    }

    pub fn clear_history(&self) {
        self.history.lock().clear();
    }

    /// Descriptions of undoable entries, most recent first.
    pub fn history_descriptions(&self) -> Vec<String> {
        self.history.lock().descriptions()
    }

    pub fn serialize_element(&self, id: NodeId, index: usize) -> Result<ElementContext, EditError> {
        Ok(context::element_context(
            &self.document,
            id,
            index,
            self.config.outer_html_limit,
            self.config.text_limit,
        )?)
    }

    pub fn serialize_elements(&self, elements: &[NodeId]) -> Result<Vec<ElementContext>, EditError> {
        elements
            .iter()
            .enumerate()
            .map(|(index, id)| self.serialize_element(*id, index))
            .collect()
    }

    pub fn page_context(&self) -> PageContext {
        context::page_context(&self.document, &self.config.overlay_attribute)
    }

    fn push(&self, entry: EditHistoryEntry) {
        debug!(description = %entry.description, elements = entry.elements.len(), "edit recorded");
        self.history.lock().push(entry);
    }

    fn capture(&self, elements: &[NodeId]) -> Result<Vec<ElementSnapshot>, EditError> {
        elements
            .iter()
            .enumerate()
            .map(|(index, id)| history::capture_snapshot(&self.document, *id, index))
            .collect::<Result<Vec<_>, _>>()
            .map_err(EditError::from)
    }

    /// All elements matching `selector` outside the overlay.
    fn query_filtered(&self, selector: &str) -> Result<Vec<NodeId>, EditError> {
        let overlay = self.config.overlay_attribute.as_str();
        Ok(self
            .document
            .query_selector_all(selector)?
            .into_iter()
            .filter(|id| self.document.closest_with_attribute(*id, overlay).is_none())
            .collect())
    }

    fn resolve_targets(&self, selected: &[NodeId], target: &ElementTarget) -> Result<Vec<NodeId>, EditError> {
        if let Some(selector) = target.selector.as_deref().filter(|s| !s.is_empty()) {
            return self.query_filtered(selector);
        }
        Ok(target
            .element_index
            .and_then(|index| selected.get(index).copied())
            .filter(|id| self.document.contains(*id))
            .into_iter()
            .collect())
    }

    fn resolve_insert_target(
        &self,
        selected: &[NodeId],
        index: Option<usize>,
        selector: Option<&str>,
    ) -> Result<Option<NodeId>, EditError> {
        if let Some(selector) = selector.filter(|s| !s.is_empty()) {
            return Ok(self.query_filtered(selector)?.into_iter().next());
        }
        Ok(index
            .and_then(|index| selected.get(index).copied())
            .filter(|id| self.document.contains(*id)))
    }

    fn check_insert_target(&self, target: NodeId, position: InsertPosition) -> Result<(), EditError> {
        if position.is_sibling() && self.document.parent(target).is_none() {
            return Err(DocumentError::InvalidOperation(format!(
                "cannot insert {position:?} an element without a parent"
            ))
            .into());
        }
        Ok(())
    }

    fn apply_operation(&self, id: NodeId, operation: &EditOperation) -> Result<(), EditError> {
        let doc = &self.document;
        match operation {
            EditOperation::SetStyle { property, value, .. } => {
                doc.with_node_mut(id, |n| n.set_style_property(property, value, false))?
            }
            EditOperation::AddClass { class_name, .. } => doc.with_node_mut(id, |n| n.add_class(class_name))?,
            EditOperation::RemoveClass { class_name, .. } => {
                doc.with_node_mut(id, |n| n.remove_class(class_name))?
            }
            EditOperation::SetAttribute { name, value, .. } => {
                doc.with_node_mut(id, |n| n.set_attribute(name, value))?
            }
            EditOperation::RemoveAttribute { name, .. } => {
                doc.with_node_mut(id, |n| {
                    n.remove_attribute(name);
                })?
            }
            EditOperation::SetTextContent { text, .. } => doc.set_text_content(id, text)?,
            EditOperation::SetInnerHtml { html, .. } => doc.set_inner_html(id, html)?,
            EditOperation::InsertHtml { .. } => {}
        }
        Ok(())
    }

    fn apply_path_write(&self, id: NodeId, path: &WritePath, value: &str) -> Result<(), EditError> {
        let doc = &self.document;
        match path {
            WritePath::Style(property) => doc.with_node_mut(id, |n| n.set_style_property(property, value, true))?,
            WritePath::Text => doc.set_text_content(id, value)?,
            WritePath::Html => doc.set_inner_html(id, value)?,
            WritePath::SetAttribute(name) => doc.with_node_mut(id, |n| n.set_attribute(name, value))?,
            WritePath::RemoveAttribute(name) => doc.with_node_mut(id, |n| {
                n.remove_attribute(name);
            })?,
            WritePath::AddClass(class) => doc.with_node_mut(id, |n| n.add_class(class))?,
            WritePath::RemoveClass(class) => doc.with_node_mut(id, |n| n.remove_class(class))?,
        }
        Ok(())
    }

    /// Parses `html` and places the resulting nodes at `position`, keeping
    /// their order. Returns the inserted top-level nodes.
    fn insert_html(&self, target: NodeId, position: InsertPosition, html: &str) -> Result<Vec<NodeId>, EditError> {
        let doc = &self.document;
        let context = match position {
            InsertPosition::Before | InsertPosition::After => doc.fragment_context(target),
            InsertPosition::Prepend | InsertPosition::Append => {
                doc.tag_name(target).unwrap_or_else(|| "body".to_string())
            }
        };
        let nodes = doc.parse_fragment_in(&context, html);

        let mut previous: Option<NodeId> = None;
        for node in &nodes {
            match (position, previous) {
                (InsertPosition::Before, _) => doc.insert_before(target, *node)?,
                (InsertPosition::After, None) => doc.insert_after(target, *node)?,
                (InsertPosition::Prepend, None) => doc.prepend_child(target, *node)?,
                (InsertPosition::After | InsertPosition::Prepend, Some(prev)) => doc.insert_after(prev, *node)?,
                (InsertPosition::Append, _) => doc.append_child(target, *node)?,
            }
            previous = Some(*node);
        }
        Ok(nodes)
    }
}
