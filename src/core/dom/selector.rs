//! Selector subset used for edit targeting: type, `*`, `#id`, `.class`,
//! `[attr]`, `[attr=value]`, descendant and child combinators, and
//! comma-separated lists.

use super::document::{Document, DocumentError, Result};
use super::node::{Node, NodeId};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttributeSelector {
    Exists(String),
    Equals(String, String),
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CompoundSelector {
    pub tag: Option<String>,
    pub id: Option<String>,
    pub classes: Vec<String>,
    pub attributes: Vec<AttributeSelector>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Combinator {
    Descendant,
    Child,
}

/// Compounds left to right; each combinator links a compound to the one
/// before it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ComplexSelector {
    pub head: CompoundSelector,
    pub tail: Vec<(Combinator, CompoundSelector)>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SelectorList(pub Vec<ComplexSelector>);

impl SelectorList {
    pub fn parse(input: &str) -> Result<Self> {
        let mut parser = Parser {
            chars: input.chars().collect(),
            pos: 0,
            source: input,
        };
        let mut selectors = vec![parser.complex()?];
        loop {
            parser.skip_whitespace();
            match parser.peek() {
                None => break,
                Some(',') => {
                    parser.pos += 1;
                    selectors.push(parser.complex()?);
                }
                Some(c) => return Err(parser.error(&format!("unexpected '{c}'"))),
            }
        }
        Ok(Self(selectors))
    }

    pub fn matches(&self, document: &Document, id: NodeId) -> bool {
        self.0.iter().any(|selector| selector.matches(document, id))
    }
}

impl ComplexSelector {
    pub fn matches(&self, document: &Document, id: NodeId) -> bool {
        let mut compounds = Vec::with_capacity(self.tail.len() + 1);
        compounds.push((None, &self.head));
        compounds.extend(self.tail.iter().map(|(c, s)| (Some(*c), s)));
        matches_from(document, id, &compounds)
    }
}

/// Right-to-left match of `compounds` with the last one anchored at `id`.
fn matches_from(
    document: &Document,
    id: NodeId,
    compounds: &[(Option<Combinator>, &CompoundSelector)],
) -> bool {
    let Some(((combinator, compound), rest)) = compounds.split_last() else {
        return true;
    };
    let Some(node) = document.node(id) else {
        return false;
    };
    if !compound.matches(&node) {
        return false;
    }

    match combinator {
        None => true,
        Some(Combinator::Child) => match element_parent(document, id) {
            Some(parent) => matches_from(document, parent, rest),
            None => false,
        },
        Some(Combinator::Descendant) => {
            let mut ancestor = element_parent(document, id);
            while let Some(candidate) = ancestor {
                if matches_from(document, candidate, rest) {
                    return true;
                }
                ancestor = element_parent(document, candidate);
            }
            false
        }
    }
}

fn element_parent(document: &Document, id: NodeId) -> Option<NodeId> {
    document.parent(id).filter(|p| document.is_element(*p))
}

impl CompoundSelector {
    pub fn matches(&self, node: &Node) -> bool {
        if !node.is_element() {
            return false;
        }
        if let Some(tag) = &self.tag {
            if !tag.eq_ignore_ascii_case(&node.tag_name) {
                return false;
            }
        }
        if let Some(id) = &self.id {
            if node.get_attribute("id") != Some(id.as_str()) {
                return false;
            }
        }
        if !self.classes.iter().all(|c| node.has_class(c)) {
            return false;
        }
        self.attributes.iter().all(|attr| match attr {
            AttributeSelector::Exists(name) => node.attributes.has(name),
            AttributeSelector::Equals(name, value) => node.get_attribute(name) == Some(value.as_str()),
        })
    }

    fn is_empty(&self) -> bool {
        self.tag.is_none() && self.id.is_none() && self.classes.is_empty() && self.attributes.is_empty()
    }
}

struct Parser<'a> {
    chars: Vec<char>,
    pos: usize,
    source: &'a str,
}

impl Parser<'_> {
    fn peek(&self) -> Option<char> {
        self.chars.get(self.pos).copied()
    }

    fn error(&self, message: &str) -> DocumentError {
        DocumentError::InvalidSelector(format!("{message} in {:?}", self.source))
    }

    fn skip_whitespace(&mut self) -> bool {
        let start = self.pos;
        while self.peek().is_some_and(char::is_whitespace) {
            self.pos += 1;
        }
        self.pos > start
    }

    fn complex(&mut self) -> Result<ComplexSelector> {
        self.skip_whitespace();
        let head = self.compound()?;
        let mut tail = Vec::new();

        loop {
            let had_space = self.skip_whitespace();
            let combinator = match self.peek() {
                None | Some(',') => break,
                Some('>') => {
                    self.pos += 1;
                    self.skip_whitespace();
                    Combinator::Child
                }
                Some(_) if had_space => Combinator::Descendant,
                Some(c) => return Err(self.error(&format!("unexpected '{c}'"))),
            };
            tail.push((combinator, self.compound()?));
        }
        Ok(ComplexSelector { head, tail })
    }

    fn compound(&mut self) -> Result<CompoundSelector> {
        let mut compound = CompoundSelector::default();
        let mut universal = false;

        match self.peek() {
            Some('*') => {
                self.pos += 1;
                universal = true;
            }
            Some(c) if is_ident_char(c) => compound.tag = Some(self.ident()?.to_ascii_lowercase()),
            _ => {}
        }

        loop {
            match self.peek() {
                Some('#') => {
                    self.pos += 1;
                    compound.id = Some(self.ident()?);
                }
                Some('.') => {
                    self.pos += 1;
                    compound.classes.push(self.ident()?);
                }
                Some('[') => {
                    self.pos += 1;
                    compound.attributes.push(self.attribute()?);
                }
                Some(':') => return Err(self.error("pseudo-classes are not supported")),
                _ => break,
            }
        }

        if compound.is_empty() && !universal {
            return Err(self.error("expected a selector"));
        }
        Ok(compound)
    }

    fn attribute(&mut self) -> Result<AttributeSelector> {
        self.skip_whitespace();
        let name = self.ident()?.to_ascii_lowercase();
        self.skip_whitespace();
        match self.peek() {
            Some(']') => {
                self.pos += 1;
                Ok(AttributeSelector::Exists(name))
            }
            Some('=') => {
                self.pos += 1;
                self.skip_whitespace();
                let value = match self.peek() {
                    Some(quote @ ('"' | '\'')) => self.quoted(quote)?,
                    _ => self.ident()?,
                };
                self.skip_whitespace();
                if self.peek() != Some(']') {
                    return Err(self.error("expected ']'"));
                }
                self.pos += 1;
                Ok(AttributeSelector::Equals(name, value))
            }
            _ => Err(self.error("unsupported attribute matcher")),
        }
    }

    fn quoted(&mut self, quote: char) -> Result<String> {
        self.pos += 1;
        let mut value = String::new();
        loop {
            match self.peek() {
                None => return Err(self.error("unterminated string")),
                Some('\\') => {
                    self.pos += 1;
                    if let Some(c) = self.peek() {
                        value.push(c);
                        self.pos += 1;
                    }
                }
                Some(c) if c == quote => {
                    self.pos += 1;
                    return Ok(value);
                }
                Some(c) => {
                    value.push(c);
                    self.pos += 1;
                }
            }
        }
    }

    fn ident(&mut self) -> Result<String> {
        let mut out = String::new();
        while let Some(c) = self.peek() {
            if c == '\\' {
                self.pos += 1;
                if let Some(escaped) = self.peek() {
                    out.push(escaped);
                    self.pos += 1;
                }
            } else if is_ident_char(c) {
                out.push(c);
                self.pos += 1;
            } else {
                break;
            }
        }
        if out.is_empty() {
            return Err(self.error("expected an identifier"));
        }
        Ok(out)
    }
}

fn is_ident_char(c: char) -> bool {
    c.is_alphanumeric() || c == '-' || c == '_' || !c.is_ascii()
}
