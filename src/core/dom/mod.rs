pub mod document;
pub mod node;
pub mod selector;

pub use document::{Document, DocumentError};
pub use node::{camel_to_kebab, AttributeMap, Node, NodeId, NodeType, StyleDeclaration};
pub use selector::SelectorList;
