//! Mutable tag tree over the wiki storage format.
//!
//! The storage format is an XML fragment with namespaced tags
//! (`ac:structured-macro`, `ri:page`, ...) and HTML entities that must not
//! be re-resolved on write. Text and attribute values are therefore kept in
//! their raw escaped form; getters and setters unescape/escape at the edges.

use quick_xml::escape::{escape, unescape};
use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;

use crate::error::{Result, SyncError};

pub type NodeId = usize;

const ROOT: NodeId = 0;

#[derive(Debug, Clone)]
enum NodeKind {
    /// Synthetic root; the storage format has no single document element.
    Root,
    Element {
        name: String,
        /// Attribute values in raw escaped form.
        attrs: Vec<(String, String)>,
        self_closing: bool,
    },
    /// Character data in raw escaped form.
    Text(String),
    /// Comments, CDATA and processing instructions, passed through verbatim.
    Raw(String),
}

#[derive(Debug, Clone)]
struct Node {
    kind: NodeKind,
    children: Vec<NodeId>,
}

/// Arena-backed document tree.
#[derive(Debug, Clone)]
pub struct Tree {
    nodes: Vec<Node>,
}

impl Tree {
    pub fn parse(body: &str) -> Result<Self> {
        let mut reader = Reader::from_str(body);
        let mut nodes = vec![Node {
            kind: NodeKind::Root,
            children: Vec::new(),
        }];
        let mut stack: Vec<NodeId> = vec![ROOT];

        loop {
            match reader.read_event()? {
                Event::Start(e) => {
                    let id = push_element(&mut nodes, &stack, &e, false)?;
                    stack.push(id);
                }
                Event::Empty(e) => {
                    push_element(&mut nodes, &stack, &e, true)?;
                }
                Event::End(_) => {
                    if stack.len() <= 1 {
                        return Err(SyncError::storage("unbalanced closing tag"));
                    }
                    stack.pop();
                }
                Event::Text(e) => {
                    let raw = String::from_utf8_lossy(e.as_ref()).into_owned();
                    push_node(&mut nodes, &stack, NodeKind::Text(raw));
                }
                Event::CData(e) => {
                    let inner = String::from_utf8_lossy(e.as_ref()).into_owned();
                    push_node(&mut nodes, &stack, NodeKind::Raw(format!("<![CDATA[{inner}]]>")));
                }
                Event::Comment(e) => {
                    let inner = String::from_utf8_lossy(e.as_ref()).into_owned();
                    push_node(&mut nodes, &stack, NodeKind::Raw(format!("<!--{inner}-->")));
                }
                // Never present in storage bodies
                Event::PI(_) | Event::Decl(_) | Event::DocType(_) => {}
                Event::Eof => break,
            }
        }

        if stack.len() != 1 {
            return Err(SyncError::storage("unclosed tag at end of input"));
        }

        Ok(Self { nodes })
    }

    /// Serialize back to storage format. A tree that was parsed and never
    /// mutated serializes to the original bytes.
    pub fn to_storage(&self) -> String {
        let mut out = String::new();
        for &child in &self.nodes[ROOT].children {
            self.write_node(child, &mut out);
        }
        out
    }

    fn write_node(&self, id: NodeId, out: &mut String) {
        let node = &self.nodes[id];
        match &node.kind {
            NodeKind::Root => {}
            NodeKind::Element {
                name,
                attrs,
                self_closing,
            } => {
                out.push('<');
                out.push_str(name);
                for (key, value) in attrs {
                    out.push(' ');
                    out.push_str(key);
                    out.push_str("=\"");
                    out.push_str(value);
                    out.push('"');
                }
                if node.children.is_empty() && *self_closing {
                    out.push_str("/>");
                } else {
                    out.push('>');
                    for &child in &node.children {
                        self.write_node(child, out);
                    }
                    out.push_str("</");
                    out.push_str(name);
                    out.push('>');
                }
            }
            NodeKind::Text(raw) | NodeKind::Raw(raw) => out.push_str(raw),
        }
    }

    /// All elements with the given tag name, in document order.
    pub fn find_all(&self, name: &str) -> Vec<NodeId> {
        let mut found = Vec::new();
        self.collect_named(ROOT, name, &mut found);
        found
    }

    fn collect_named(&self, id: NodeId, name: &str, found: &mut Vec<NodeId>) {
        for &child in &self.nodes[id].children {
            if self.name(child) == Some(name) {
                found.push(child);
            }
            self.collect_named(child, name, found);
        }
    }

    /// First element anywhere in the tree with the given name and
    /// (unescaped) attribute value.
    pub fn find_by_attr(&self, name: &str, attr: &str, value: &str) -> Option<NodeId> {
        self.find_all(name)
            .into_iter()
            .find(|&id| self.attr(id, attr).as_deref() == Some(value))
    }

    /// All direct children of a node, elements and text alike.
    pub fn children(&self, id: NodeId) -> &[NodeId] {
        &self.nodes[id].children
    }

    /// Direct children of an element with the given tag name.
    pub fn children_named(&self, id: NodeId, name: &str) -> Vec<NodeId> {
        self.nodes[id]
            .children
            .iter()
            .copied()
            .filter(|&c| self.name(c) == Some(name))
            .collect()
    }

    pub fn name(&self, id: NodeId) -> Option<&str> {
        match &self.nodes[id].kind {
            NodeKind::Element { name, .. } => Some(name),
            _ => None,
        }
    }

    /// Unescaped attribute value.
    pub fn attr(&self, id: NodeId, key: &str) -> Option<String> {
        match &self.nodes[id].kind {
            NodeKind::Element { attrs, .. } => attrs
                .iter()
                .find(|(k, _)| k == key)
                .map(|(_, v)| unescape_lenient(v)),
            _ => None,
        }
    }

    /// Set (or add) an attribute; the value is escaped on write.
    pub fn set_attr(&mut self, id: NodeId, key: &str, value: &str) {
        if let NodeKind::Element { attrs, .. } = &mut self.nodes[id].kind {
            let escaped = escape(value).into_owned();
            match attrs.iter_mut().find(|(k, _)| k == key) {
                Some(slot) => slot.1 = escaped,
                None => attrs.push((key.to_string(), escaped)),
            }
        }
    }

    /// Concatenated unescaped text of an element's direct text children.
    pub fn text(&self, id: NodeId) -> String {
        let mut out = String::new();
        for &child in &self.nodes[id].children {
            if let NodeKind::Text(raw) = &self.nodes[child].kind {
                out.push_str(&unescape_lenient(raw));
            }
        }
        out
    }

    /// Replace an element's content with a single text node.
    pub fn set_text(&mut self, id: NodeId, value: &str) {
        let escaped = escape(value).into_owned();
        let text_id = self.alloc(NodeKind::Text(escaped));
        self.nodes[id].children = vec![text_id];
    }

    pub fn clear_children(&mut self, id: NodeId) {
        self.nodes[id].children.clear();
    }

    /// Remove a direct child from an element.
    pub fn remove_child(&mut self, parent: NodeId, child: NodeId) {
        self.nodes[parent].children.retain(|&c| c != child);
    }

    /// Deep-copy a subtree from another tree and append it as the last child
    /// of `dest_parent`.
    pub fn copy_subtree_from(&mut self, source: &Tree, source_id: NodeId, dest_parent: NodeId) {
        let copied = self.copy_nodes(source, source_id);
        self.nodes[dest_parent].children.push(copied);
    }

    fn copy_nodes(&mut self, source: &Tree, source_id: NodeId) -> NodeId {
        let kind = source.nodes[source_id].kind.clone();
        let id = self.alloc(kind);
        for &child in &source.nodes[source_id].children {
            let copied = self.copy_nodes(source, child);
            self.nodes[id].children.push(copied);
        }
        id
    }

    fn alloc(&mut self, kind: NodeKind) -> NodeId {
        self.nodes.push(Node {
            kind,
            children: Vec::new(),
        });
        self.nodes.len() - 1
    }
}

fn push_element(
    nodes: &mut Vec<Node>,
    stack: &[NodeId],
    event: &BytesStart<'_>,
    self_closing: bool,
) -> Result<NodeId> {
    let name = String::from_utf8_lossy(event.name().as_ref()).into_owned();
    let mut attrs = Vec::new();
    for attr in event.attributes().with_checks(false) {
        let attr = attr.map_err(|e| SyncError::storage(e.to_string()))?;
        let key = String::from_utf8_lossy(attr.key.as_ref()).into_owned();
        let value = String::from_utf8_lossy(&attr.value).into_owned();
        attrs.push((key, value));
    }

    let id = nodes.len();
    nodes.push(Node {
        kind: NodeKind::Element {
            name,
            attrs,
            self_closing,
        },
        children: Vec::new(),
    });
    let parent = stack.last().copied().unwrap_or(ROOT);
    nodes[parent].children.push(id);
    Ok(id)
}

fn push_node(nodes: &mut Vec<Node>, stack: &[NodeId], kind: NodeKind) {
    let id = nodes.len();
    nodes.push(Node {
        kind,
        children: Vec::new(),
    });
    let parent = stack.last().copied().unwrap_or(ROOT);
    nodes[parent].children.push(id);
}

fn unescape_lenient(raw: &str) -> String {
    match unescape(raw) {
        Ok(unescaped) => unescaped.into_owned(),
        // Unknown entities (e.g. &nbsp;) stay as-is
        Err(_) => raw.to_string(),
    }
}
