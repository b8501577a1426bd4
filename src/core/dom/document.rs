use super::node::{Node, NodeId, NodeType};
use super::selector::SelectorList;
use dashmap::DashMap;
use html5ever::tendril::TendrilSink;
use html5ever::{namespace_url, ns, parse_document, parse_fragment, LocalName, ParseOpts, QualName};
use markup5ever_rcdom::{Handle, NodeData, RcDom};
use parking_lot::RwLock;
use smallvec::SmallVec;
use std::sync::Arc;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DocumentError {
    #[error("Node not found: {0:?}")]
    NodeNotFound(NodeId),
    #[error("Invalid selector: {0}")]
    InvalidSelector(String),
    #[error("Invalid operation: {0}")]
    InvalidOperation(String),
}

pub type Result<T> = std::result::Result<T, DocumentError>;

const VOID_ELEMENTS: &[&str] = &[
    "area", "base", "br", "col", "embed", "hr", "img", "input", "link", "meta", "param", "source",
    "track", "wbr",
];

const RAW_TEXT_ELEMENTS: &[&str] = &[
    "script", "style", "xmp", "iframe", "noembed", "noframes", "plaintext",
];

/// Mutable in-memory HTML tree. Nodes live in a shared table keyed by id;
/// removed subtrees are dropped from the table, so a stale id simply
/// stops resolving.
pub struct Document {
    root: NodeId,
    nodes: DashMap<NodeId, Arc<RwLock<Node>>>,
}

impl Default for Document {
    fn default() -> Self {
        Self::new()
    }
}

impl Document {
    /// An empty `<html><head></head><body></body></html>` document.
    pub fn new() -> Self {
        let root = NodeId::next();
        let document = Self {
            root,
            nodes: DashMap::new(),
        };
        document.insert_node(Node::new_document(root));

        let html = document.create_element("html");
        let head = document.create_element("head");
        let body = document.create_element("body");
        document.link(root, html);
        document.link(html, head);
        document.link(html, body);
        document
    }

    pub fn parse(html: &str) -> Self {
        let dom = parse_document(RcDom::default(), ParseOpts::default()).one(html);

        let root = NodeId::next();
        let document = Self {
            root,
            nodes: DashMap::new(),
        };
        document.insert_node(Node::new_document(root));

        for child in dom.document.children.borrow().iter() {
            if let Some(id) = document.import(child) {
                document.link(root, id);
            }
        }
        tracing::debug!(nodes = document.len(), "parsed document");
        document
    }

    /// Parses `html` in a `<body>` context into detached nodes owned by
    /// this document.
    pub fn parse_fragment(&self, html: &str) -> Vec<NodeId> {
        self.parse_fragment_in("body", html)
    }

    /// Parses `html` as if it were the content of a `context` element.
    pub fn parse_fragment_in(&self, context: &str, html: &str) -> Vec<NodeId> {
        let context = QualName::new(None, ns!(html), LocalName::from(context));
        let dom = parse_fragment(RcDom::default(), ParseOpts::default(), context, Vec::new()).one(html);

        // The fragment parser wraps its output in a synthetic <html> element.
        let wrapper = dom.document.children.borrow().first().cloned();
        let Some(wrapper) = wrapper else {
            return Vec::new();
        };
        let children = wrapper.children.borrow();
        children.iter().filter_map(|child| self.import(child)).collect()
    }

    /// Tag of the element whose content `id` would be parsed as.
    pub fn fragment_context(&self, id: NodeId) -> String {
        self.parent(id)
            .and_then(|parent| self.tag_name(parent))
            .unwrap_or_else(|| "body".to_string())
    }

    fn import(&self, handle: &Handle) -> Option<NodeId> {
        let id = NodeId::next();
        let node = match &handle.data {
            NodeData::Element { name, attrs, .. } => {
                let mut node = Node::new_element(&name.local, id);
                for attr in attrs.borrow().iter() {
                    node.set_attribute(&attr.name.local, &attr.value);
                }
                node
            }
            NodeData::Text { contents } => Node::new_text(contents.borrow().to_string(), id),
            NodeData::Comment { contents } => Node::new_comment(contents.to_string(), id),
            NodeData::Document | NodeData::Doctype { .. } | NodeData::ProcessingInstruction { .. } => {
                return None
            }
        };
        self.insert_node(node);

        let source_children = handle.children.borrow().clone();
        for child in &source_children {
            if let Some(child_id) = self.import(child) {
                self.link(id, child_id);
            }
        }
        Some(id)
    }

    fn insert_node(&self, node: Node) {
        self.nodes.insert(node.id, Arc::new(RwLock::new(node)));
    }

    /// Appends without detaching; only for freshly created nodes.
    fn link(&self, parent: NodeId, child: NodeId) {
        if let Some(node) = self.entry(parent) {
            node.write().children.push(child);
        }
        if let Some(node) = self.entry(child) {
            node.write().parent = Some(parent);
        }
    }

    fn entry(&self, id: NodeId) -> Option<Arc<RwLock<Node>>> {
        self.nodes.get(&id).map(|node| Arc::clone(node.value()))
    }

    fn require(&self, id: NodeId) -> Result<Arc<RwLock<Node>>> {
        self.entry(id).ok_or(DocumentError::NodeNotFound(id))
    }

    pub fn root(&self) -> NodeId {
        self.root
    }

    pub fn document_element(&self) -> Option<NodeId> {
        self.children(self.root)
            .into_iter()
            .find(|id| self.is_element(*id))
    }

    pub fn body(&self) -> Option<NodeId> {
        self.element_descendants(self.root)
            .into_iter()
            .find(|id| self.tag_name(*id).as_deref() == Some("body"))
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn contains(&self, id: NodeId) -> bool {
        self.nodes.contains_key(&id)
    }

    pub fn create_element(&self, tag_name: &str) -> NodeId {
        let id = NodeId::next();
        self.insert_node(Node::new_element(tag_name, id));
        id
    }

    pub fn create_text(&self, text: &str) -> NodeId {
        let id = NodeId::next();
        self.insert_node(Node::new_text(text.to_string(), id));
        id
    }

    /// Copy of the node's current state.
    pub fn node(&self, id: NodeId) -> Option<Node> {
        self.entry(id).map(|node| node.read().clone())
    }

    pub fn with_node<R>(&self, id: NodeId, f: impl FnOnce(&Node) -> R) -> Result<R> {
        let node = self.require(id)?;
        let guard = node.read();
        Ok(f(&guard))
    }

    pub fn with_node_mut<R>(&self, id: NodeId, f: impl FnOnce(&mut Node) -> R) -> Result<R> {
        let node = self.require(id)?;
        let mut guard = node.write();
        Ok(f(&mut guard))
    }

    pub fn is_element(&self, id: NodeId) -> bool {
        self.entry(id).is_some_and(|node| node.read().is_element())
    }

    pub fn tag_name(&self, id: NodeId) -> Option<String> {
        self.entry(id).and_then(|node| {
            let node = node.read();
            node.is_element().then(|| node.tag_name.clone())
        })
    }

    pub fn get_attribute(&self, id: NodeId, name: &str) -> Option<String> {
        self.entry(id)
            .and_then(|node| node.read().get_attribute(name).map(str::to_string))
    }

    pub fn parent(&self, id: NodeId) -> Option<NodeId> {
        self.entry(id).and_then(|node| node.read().parent)
    }

    pub fn children(&self, id: NodeId) -> Vec<NodeId> {
        self.entry(id)
            .map(|node| node.read().children.to_vec())
            .unwrap_or_default()
    }

    pub fn element_children(&self, id: NodeId) -> Vec<NodeId> {
        self.children(id)
            .into_iter()
            .filter(|child| self.is_element(*child))
            .collect()
    }

    /// Element descendants of `id` in document order, excluding `id` itself.
    pub fn element_descendants(&self, id: NodeId) -> Vec<NodeId> {
        let mut out = Vec::new();
        let mut stack: Vec<NodeId> = self.children(id).into_iter().rev().collect();
        while let Some(current) = stack.pop() {
            if !self.is_element(current) {
                continue;
            }
            out.push(current);
            stack.extend(self.children(current).into_iter().rev());
        }
        out
    }

    /// Nearest inclusive ancestor carrying `attribute`.
    pub fn closest_with_attribute(&self, id: NodeId, attribute: &str) -> Option<NodeId> {
        let mut current = Some(id);
        while let Some(node_id) = current {
            let node = self.entry(node_id)?;
            let node = node.read();
            if node.is_element() && node.attributes.has(attribute) {
                return Some(node_id);
            }
            current = node.parent;
        }
        None
    }

    /// Removes `child` from its parent without dropping it.
    pub fn detach(&self, child: NodeId) -> Result<()> {
        let node = self.require(child)?;
        let parent = node.write().parent.take();
        if let Some(parent) = parent.and_then(|p| self.entry(p)) {
            parent.write().children.retain(|id| *id != child);
        }
        Ok(())
    }

    pub fn append_child(&self, parent: NodeId, child: NodeId) -> Result<()> {
        self.check_insertion(parent, child)?;
        self.detach(child)?;
        self.require(parent)?.write().children.push(child);
        self.require(child)?.write().parent = Some(parent);
        Ok(())
    }

    pub fn prepend_child(&self, parent: NodeId, child: NodeId) -> Result<()> {
        self.check_insertion(parent, child)?;
        self.detach(child)?;
        self.require(parent)?.write().children.insert(0, child);
        self.require(child)?.write().parent = Some(parent);
        Ok(())
    }

    /// Inserts `child` directly before `reference`, which must have a parent.
    pub fn insert_before(&self, reference: NodeId, child: NodeId) -> Result<()> {
        self.insert_sibling(reference, child, 0)
    }

    pub fn insert_after(&self, reference: NodeId, child: NodeId) -> Result<()> {
        self.insert_sibling(reference, child, 1)
    }

    fn insert_sibling(&self, reference: NodeId, child: NodeId, offset: usize) -> Result<()> {
        let parent = self.parent(reference).ok_or_else(|| {
            DocumentError::InvalidOperation("reference node has no parent".into())
        })?;
        self.check_insertion(parent, child)?;
        self.detach(child)?;

        let parent_node = self.require(parent)?;
        {
            let mut parent_node = parent_node.write();
            let position = parent_node
                .children
                .iter()
                .position(|id| *id == reference)
                .ok_or(DocumentError::NodeNotFound(reference))?;
            parent_node.children.insert(position + offset, child);
        }
        self.require(child)?.write().parent = Some(parent);
        Ok(())
    }

    fn check_insertion(&self, parent: NodeId, child: NodeId) -> Result<()> {
        self.require(child)?;
        let mut current = Some(parent);
        while let Some(id) = current {
            if id == child {
                return Err(DocumentError::InvalidOperation(
                    "cannot insert a node into its own subtree".into(),
                ));
            }
            current = self.parent(id);
        }
        Ok(())
    }

    /// Detaches `id` and drops its whole subtree from the document.
    pub fn remove_node(&self, id: NodeId) -> Result<()> {
        if id == self.root {
            return Err(DocumentError::InvalidOperation("cannot remove the document root".into()));
        }
        self.detach(id)?;
        self.drop_subtree(id);
        Ok(())
    }

    fn drop_subtree(&self, id: NodeId) {
        let mut stack = vec![id];
        while let Some(current) = stack.pop() {
            if let Some((_, node)) = self.nodes.remove(&current) {
                stack.extend(node.read().children.iter().copied());
            }
        }
    }

    /// Drops every current child of `parent` and adopts `children` in order.
    pub fn replace_children(&self, parent: NodeId, children: Vec<NodeId>) -> Result<()> {
        let parent_node = self.require(parent)?;
        let old: SmallVec<[NodeId; 8]> = std::mem::take(&mut parent_node.write().children);
        for child in old {
            if children.contains(&child) {
                if let Some(node) = self.entry(child) {
                    node.write().parent = None;
                }
            } else {
                self.drop_subtree(child);
            }
        }
        for child in children {
            self.append_child(parent, child)?;
        }
        Ok(())
    }

    pub fn set_text_content(&self, id: NodeId, text: &str) -> Result<()> {
        let node = self.require(id)?;
        if !node.read().is_element() {
            node.write().text_content = text.to_string();
            return Ok(());
        }
        let children = if text.is_empty() {
            Vec::new()
        } else {
            vec![self.create_text(text)]
        };
        self.replace_children(id, children)
    }

    pub fn set_inner_html(&self, id: NodeId, html: &str) -> Result<()> {
        let context = self.tag_name(id).ok_or(DocumentError::NodeNotFound(id))?;
        let children = self.parse_fragment_in(&context, html);
        self.replace_children(id, children)
    }

    /// Concatenated text of all descendant text nodes.
    pub fn text_content(&self, id: NodeId) -> String {
        let mut out = String::new();
        self.collect_text(id, &mut out);
        out
    }

    fn collect_text(&self, id: NodeId, out: &mut String) {
        let Some(node) = self.entry(id) else {
            return;
        };
        let node = node.read();
        match node.node_type {
            NodeType::Text => out.push_str(&node.text_content),
            NodeType::Comment => {}
            NodeType::Element | NodeType::Document => {
                let children = node.children.clone();
                drop(node);
                for child in children {
                    self.collect_text(child, out);
                }
            }
        }
    }

    pub fn outer_html(&self, id: NodeId) -> Result<String> {
        self.require(id)?;
        let mut out = String::new();
        self.serialize_node(id, false, &mut out);
        Ok(out)
    }

    pub fn inner_html(&self, id: NodeId) -> Result<String> {
        let node = self.require(id)?.read().clone();
        let mut out = String::new();
        let raw = node.is_element() && RAW_TEXT_ELEMENTS.contains(&node.tag_name.as_str());
        for child in node.children {
            self.serialize_node(child, raw, &mut out);
        }
        Ok(out)
    }

    fn serialize_node(&self, id: NodeId, raw_parent: bool, out: &mut String) {
        let Some(node) = self.node(id) else {
            return;
        };
        match node.node_type {
            NodeType::Text => {
                if raw_parent {
                    out.push_str(&node.text_content);
                } else {
                    escape_text(&node.text_content, out);
                }
            }
            NodeType::Comment => {
                out.push_str("<!--");
                out.push_str(&node.text_content);
                out.push_str("-->");
            }
            NodeType::Document => {
                for child in node.children {
                    self.serialize_node(child, false, out);
                }
            }
            NodeType::Element => {
                out.push('<');
                out.push_str(&node.tag_name);
                for (name, value) in node.attributes.entries() {
                    out.push(' ');
                    out.push_str(name);
                    out.push_str("=\"");
                    escape_attribute(value, out);
                    out.push('"');
                }
                out.push('>');
                if VOID_ELEMENTS.contains(&node.tag_name.as_str()) {
                    return;
                }
                let raw = RAW_TEXT_ELEMENTS.contains(&node.tag_name.as_str());
                for child in node.children {
                    self.serialize_node(child, raw, out);
                }
                out.push_str("</");
                out.push_str(&node.tag_name);
                out.push('>');
            }
        }
    }

    pub fn query_selector_all(&self, selector: &str) -> Result<Vec<NodeId>> {
        let selectors = SelectorList::parse(selector)?;
        Ok(self
            .element_descendants(self.root)
            .into_iter()
            .filter(|id| selectors.matches(self, *id))
            .collect())
    }

    pub fn query_selector(&self, selector: &str) -> Result<Option<NodeId>> {
        Ok(self.query_selector_all(selector)?.into_iter().next())
    }

    /// First element under `scope` matching `selector`.
    pub fn query_selector_within(&self, scope: NodeId, selector: &str) -> Result<Option<NodeId>> {
        let selectors = SelectorList::parse(selector)?;
        Ok(self
            .element_descendants(scope)
            .into_iter()
            .find(|id| selectors.matches(self, *id)))
    }

    pub fn matches(&self, id: NodeId, selector: &str) -> Result<bool> {
        Ok(SelectorList::parse(selector)?.matches(self, id))
    }
}

fn escape_text(text: &str, out: &mut String) {
    for ch in text.chars() {
        match ch {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '\u{a0}' => out.push_str("&nbsp;"),
            _ => out.push(ch),
        }
    }
}

fn escape_attribute(value: &str, out: &mut String) {
    for ch in value.chars() {
        match ch {
            '&' => out.push_str("&amp;"),
            '"' => out.push_str("&quot;"),
            '\u{a0}' => out.push_str("&nbsp;"),
            _ => out.push(ch),
        }
    }
}
