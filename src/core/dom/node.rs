use serde::{Deserialize, Serialize};
use smallvec::SmallVec;
use std::sync::atomic::{AtomicU64, Ordering};

static NEXT_NODE_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeId(pub u64);

impl NodeId {
    pub fn next() -> Self {
        Self(NEXT_NODE_ID.fetch_add(1, Ordering::Relaxed))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NodeType {
    Element,
    Text,
    Comment,
    Document,
}

/// Attributes in source order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AttributeMap {
    map: SmallVec<[(String, String); 8]>,
}

impl AttributeMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.map
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }

    pub fn set(&mut self, name: &str, value: &str) {
        if let Some((_, v)) = self.map.iter_mut().find(|(k, _)| k == name) {
            *v = value.to_string();
        } else {
            self.map.push((name.to_string(), value.to_string()));
        }
    }

    pub fn remove(&mut self, name: &str) -> Option<String> {
        let pos = self.map.iter().position(|(k, _)| k == name)?;
        Some(self.map.remove(pos).1)
    }

    pub fn has(&self, name: &str) -> bool {
        self.map.iter().any(|(k, _)| k == name)
    }

    pub fn entries(&self) -> impl Iterator<Item = (&str, &str)> {
        self.map.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    pub fn clear(&mut self) {
        self.map.clear();
    }
}

/// One `property: value [!important]` entry of an inline style.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StyleDeclaration {
    pub property: String,
    pub value: String,
    pub important: bool,
}

pub fn parse_style(text: &str) -> Vec<StyleDeclaration> {
    text.split(';')
        .filter_map(|decl| {
            let (property, value) = decl.split_once(':')?;
            let property = property.trim().to_ascii_lowercase();
            let mut value = value.trim();
            if property.is_empty() || value.is_empty() {
                return None;
            }

            let mut important = false;
            let lower = value.to_ascii_lowercase();
            if let Some(stripped) = lower.strip_suffix("!important") {
                value = value[..stripped.len()].trim_end();
                important = true;
            }
            Some(StyleDeclaration {
                property,
                value: value.to_string(),
                important,
            })
        })
        .collect()
}

/// `cssText` form: `a: b; c: d !important;`
pub fn serialize_style(declarations: &[StyleDeclaration]) -> String {
    declarations
        .iter()
        .map(|d| {
            if d.important {
                format!("{}: {} !important;", d.property, d.value)
            } else {
                format!("{}: {};", d.property, d.value)
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}

/// `backgroundColor` -> `background-color`. Already hyphenated names pass through.
pub fn camel_to_kebab(property: &str) -> String {
    let mut out = String::with_capacity(property.len() + 4);
    for ch in property.chars() {
        if ch.is_ascii_uppercase() {
            out.push('-');
            out.push(ch.to_ascii_lowercase());
        } else {
            out.push(ch);
        }
    }
    out
}

#[derive(Debug, Clone)]
pub struct Node {
    pub id: NodeId,
    pub node_type: NodeType,
    pub tag_name: String,
    pub text_content: String,
    pub attributes: AttributeMap,
    pub parent: Option<NodeId>,
    pub children: SmallVec<[NodeId; 8]>,
}

impl Node {
    fn with_type(id: NodeId, node_type: NodeType, tag_name: &str, text: String) -> Self {
        Self {
            id,
            node_type,
            tag_name: tag_name.to_string(),
            text_content: text,
            attributes: AttributeMap::new(),
            parent: None,
            children: SmallVec::new(),
        }
    }

    pub fn new_element(tag_name: &str, id: NodeId) -> Self {
        Self::with_type(id, NodeType::Element, &tag_name.to_ascii_lowercase(), String::new())
    }

    pub fn new_text(content: String, id: NodeId) -> Self {
        Self::with_type(id, NodeType::Text, "#text", content)
    }

    pub fn new_comment(content: String, id: NodeId) -> Self {
        Self::with_type(id, NodeType::Comment, "#comment", content)
    }

    pub fn new_document(id: NodeId) -> Self {
        Self::with_type(id, NodeType::Document, "#document", String::new())
    }

    pub fn is_element(&self) -> bool {
        self.node_type == NodeType::Element
    }

    pub fn is_text(&self) -> bool {
        self.node_type == NodeType::Text
    }

    pub fn get_attribute(&self, name: &str) -> Option<&str> {
        self.attributes.get(name)
    }

    pub fn set_attribute(&mut self, name: &str, value: &str) {
        self.attributes.set(name, value);
    }

    pub fn remove_attribute(&mut self, name: &str) -> Option<String> {
        self.attributes.remove(name)
    }

    pub fn element_id(&self) -> Option<&str> {
        self.attributes.get("id").filter(|id| !id.is_empty())
    }

    pub fn class_list(&self) -> Vec<String> {
        self.attributes
            .get("class")
            .map(|classes| classes.split_whitespace().map(str::to_string).collect())
            .unwrap_or_default()
    }

    pub fn has_class(&self, class_name: &str) -> bool {
        self.attributes
            .get("class")
            .is_some_and(|classes| classes.split_whitespace().any(|c| c == class_name))
    }

    pub fn add_class(&mut self, class_name: &str) {
        if class_name.is_empty() || self.has_class(class_name) {
            return;
        }
        let mut classes = self.class_list();
        classes.push(class_name.to_string());
        self.attributes.set("class", &classes.join(" "));
    }

    pub fn remove_class(&mut self, class_name: &str) {
        if !self.has_class(class_name) {
            return;
        }
        let classes: Vec<String> = self
            .class_list()
            .into_iter()
            .filter(|c| c != class_name)
            .collect();
        self.attributes.set("class", &classes.join(" "));
    }

    pub fn style_text(&self) -> String {
        self.attributes
            .get("style")
            .map(|style| serialize_style(&parse_style(style)))
            .unwrap_or_default()
    }

    /// Replaces the whole inline style. An empty value removes the attribute.
    pub fn set_style_text(&mut self, text: &str) {
        let declarations = parse_style(text);
        if declarations.is_empty() {
            self.attributes.remove("style");
        } else {
            self.attributes.set("style", &serialize_style(&declarations));
        }
    }

    pub fn style_property(&self, property: &str) -> Option<String> {
        let property = camel_to_kebab(property);
        self.attributes.get("style").and_then(|style| {
            parse_style(style)
                .into_iter()
                .find(|d| d.property == property)
                .map(|d| d.value)
        })
    }

    /// Sets one property; an empty value removes it like `style.setProperty(p, "")`.
    pub fn set_style_property(&mut self, property: &str, value: &str, important: bool) {
        let property = camel_to_kebab(property);
        let mut declarations = self
            .attributes
            .get("style")
            .map(parse_style)
            .unwrap_or_default();

        let value = value.trim();
        if value.is_empty() {
            declarations.retain(|d| d.property != property);
        } else if let Some(existing) = declarations.iter_mut().find(|d| d.property == property) {
            existing.value = value.to_string();
            existing.important = important;
        } else {
            declarations.push(StyleDeclaration {
                property,
                value: value.to_string(),
                important,
            });
        }

        if declarations.is_empty() {
            self.attributes.remove("style");
        } else {
            self.attributes.set("style", &serialize_style(&declarations));
        }
    }
}
