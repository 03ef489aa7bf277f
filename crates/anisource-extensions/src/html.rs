//! Parsed HTML documents and selections handed to scripts.
//!
//! A [`Selection`] is an ordered set of nodes in a shared parsed document.
//! The document itself is a selection holding the tree root. All methods
//! are read-only; a script can never mutate a document.

use std::collections::HashSet;
use std::rc::Rc;

use ego_tree::NodeId;
use mlua::{Function, MetaMethod, UserData, UserDataMethods};
use scraper::{ElementRef, Html, Selector};

#[derive(Clone)]
pub struct Selection {
    doc: Rc<Html>,
    nodes: Vec<NodeId>,
}

impl std::fmt::Debug for Selection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Selection")
            .field("length", &self.nodes.len())
            .finish_non_exhaustive()
    }
}

impl Selection {
    /// Parse a full document. Malformed markup is recovered, never rejected.
    pub fn parse_document(html: &str) -> Self {
        let doc = Html::parse_document(html);
        let root = doc.tree.root().id();
        Self {
            doc: Rc::new(doc),
            nodes: vec![root],
        }
    }

    fn with_nodes(&self, nodes: Vec<NodeId>) -> Self {
        Self {
            doc: Rc::clone(&self.doc),
            nodes,
        }
    }

    /// Elements in this selection; the document root maps to `<html>`.
    fn elements(&self) -> impl Iterator<Item = ElementRef<'_>> + '_ {
        self.nodes.iter().filter_map(|id| {
            let node = self.doc.tree.get(*id)?;
            ElementRef::wrap(node).or_else(|| Some(self.doc.root_element()))
        })
    }

    /// Descendants of every node matching `selector`, in document order
    /// per node and without duplicates.
    pub fn select(&self, selector: &str) -> Result<Self, String> {
        let selector =
            Selector::parse(selector).map_err(|e| format!("invalid selector '{selector}': {e}"))?;

        let mut seen = HashSet::new();
        let mut found = Vec::new();
        for id in &self.nodes {
            let Some(node) = self.doc.tree.get(*id) else {
                continue;
            };
            let matches: Box<dyn Iterator<Item = ElementRef<'_>> + '_> =
                match ElementRef::wrap(node) {
                    Some(element) => Box::new(element.select(&selector)),
                    None => Box::new(self.doc.select(&selector)),
                };
            for element in matches {
                if seen.insert(element.id()) {
                    found.push(element.id());
                }
            }
        }
        Ok(self.with_nodes(found))
    }

    /// Concatenated text of all nodes, trimmed.
    pub fn text(&self) -> String {
        let mut out = String::new();
        for element in self.elements() {
            out.extend(element.text());
        }
        out.trim().to_string()
    }

    /// Attribute of the first element, `""` when absent.
    pub fn attr(&self, name: &str) -> String {
        self.elements()
            .next()
            .and_then(|e| e.value().attr(name))
            .unwrap_or_default()
            .to_string()
    }

    /// Inner HTML of the first element, `""` when empty.
    pub fn inner_html(&self) -> String {
        self.elements()
            .next()
            .map(|e| e.inner_html())
            .unwrap_or_default()
    }

    pub fn first(&self) -> Self {
        self.with_nodes(self.nodes.first().copied().into_iter().collect())
    }

    pub fn last(&self) -> Self {
        self.with_nodes(self.nodes.last().copied().into_iter().collect())
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Single-node selections, one per node, in order.
    pub fn iter(&self) -> impl Iterator<Item = Self> + '_ {
        self.nodes.iter().map(|id| self.with_nodes(vec![*id]))
    }
}

impl UserData for Selection {
    fn add_methods<M: UserDataMethods<Self>>(methods: &mut M) {
        methods.add_method("select", |_, this, selector: String| {
            this.select(&selector).map_err(mlua::Error::RuntimeError)
        });
        methods.add_method("text", |_, this, ()| Ok(this.text()));
        methods.add_method("attr", |_, this, name: String| Ok(this.attr(&name)));
        methods.add_method("html", |_, this, ()| Ok(this.inner_html()));
        methods.add_method("first", |_, this, ()| Ok(this.first()));
        methods.add_method("last", |_, this, ()| Ok(this.last()));
        methods.add_method("length", |_, this, ()| Ok(this.len()));
        methods.add_method("each", |_, this, callback: Function| {
            for (index, element) in this.iter().enumerate() {
                callback.call::<()>((index + 1, element))?;
            }
            Ok(this.clone())
        });
        methods.add_meta_method(MetaMethod::Len, |_, this, ()| Ok(this.len()));
    }
}
