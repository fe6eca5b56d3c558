//! Namespace-aware XML document.
//!
//! Built from quick-xml events. Unlike most DOMs it keeps the original
//! prefixes and namespace declarations of every element, which the
//! canonicalizer needs to reproduce exactly what a signer digested.

use std::{borrow::Cow, fmt};

use quick_xml::{
    escape::unescape,
    events::{BytesStart, Event},
    Reader,
};

use crate::error::{SamlError, SamlResult};

pub const XML_NAMESPACE: &str = "http://www.w3.org/XML/1998/namespace";

/// A namespace declaration (`xmlns` or `xmlns:prefix`) written on an element.
///
/// An empty `uri` on the default namespace is an undeclaration (`xmlns=""`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NamespaceDecl {
    pub prefix: Option<String>,
    pub uri: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attribute {
    pub prefix: Option<String>,
    pub local_name: String,
    pub namespace: Option<String>,
    pub value: String,
}

#[derive(Debug)]
struct ElementData {
    prefix: Option<String>,
    local_name: String,
    namespace: Option<String>,
    namespace_decls: Vec<NamespaceDecl>,
    attributes: Vec<Attribute>,
    content_start: usize,
    end: usize,
}

#[derive(Debug)]
enum NodeKind {
    Element(ElementData),
    Text(String),
    Comment(String),
}

#[derive(Debug)]
struct NodeData {
    parent: Option<usize>,
    children: Vec<usize>,
    kind: NodeKind,
}

/// A parsed, immutable XML document.
#[derive(Debug)]
pub struct XmlDocument {
    nodes: Vec<NodeData>,
    root: usize,
}

/// Any node below the root element that takes part in canonicalization.
#[derive(Debug, Clone, Copy)]
pub enum Node<'d> {
    Element(Element<'d>),
    Text(&'d str),
    Comment(&'d str),
}

/// A borrowed handle to an element of an [`XmlDocument`].
#[derive(Clone, Copy)]
pub struct Element<'d> {
    doc: &'d XmlDocument,
    id: usize,
}

impl XmlDocument {
    /// Parses a document.
    ///
    /// DOCTYPE declarations are rejected outright so no entity expansion can
    /// happen, and so are processing instructions inside the root element.
    pub fn parse(xml: &str) -> SamlResult<Self> {
        let xml = xml.strip_prefix('\u{feff}').unwrap_or(xml);
        let mut reader = Reader::from_str(xml);
        let mut nodes: Vec<NodeData> = Vec::new();
        let mut stack: Vec<usize> = Vec::new();
        let mut root = None;

        loop {
            let event = reader.read_event().map_err(|e| {
                SamlError::Xml(format!("{e} at position {}", reader.buffer_position()))
            })?;
            match event {
                Event::Start(start) => {
                    let id = push_element(&mut nodes, &stack, &mut root, &start)?;
                    element_data_mut(&mut nodes, id).content_start = reader.buffer_position();
                    stack.push(id);
                }
                Event::Empty(start) => {
                    let id = push_element(&mut nodes, &stack, &mut root, &start)?;
                    let data = element_data_mut(&mut nodes, id);
                    data.content_start = reader.buffer_position();
                    data.end = reader.buffer_position();
                }
                Event::End(_) => {
                    let id = stack
                        .pop()
                        .ok_or_else(|| SamlError::Xml("unexpected end tag".into()))?;
                    element_data_mut(&mut nodes, id).end = reader.buffer_position();
                }
                Event::Text(text) => {
                    let raw = utf8(&text)?;
                    match stack.last() {
                        Some(&parent) => {
                            let value = unescape(&normalize_line_endings(raw))
                                .map_err(|e| SamlError::Xml(e.to_string()))?
                                .into_owned();
                            push_text(&mut nodes, parent, value);
                        }
                        None if raw.trim().is_empty() => {}
                        None => return Err(SamlError::Xml("text outside the root element".into())),
                    }
                }
                Event::CData(cdata) => {
                    let raw = utf8(&cdata)?;
                    let parent = *stack
                        .last()
                        .ok_or_else(|| SamlError::Xml("CDATA outside the root element".into()))?;
                    push_text(&mut nodes, parent, normalize_line_endings(raw).into_owned());
                }
                Event::Comment(comment) => {
                    if let Some(&parent) = stack.last() {
                        let value = normalize_line_endings(utf8(&comment)?).into_owned();
                        push_child(&mut nodes, parent, NodeKind::Comment(value));
                    }
                }
                Event::PI(_) => {
                    if !stack.is_empty() {
                        return Err(SamlError::Xml(
                            "processing instructions are not supported inside elements".into(),
                        ));
                    }
                }
                Event::DocType(_) => {
                    return Err(SamlError::Xml("DOCTYPE declarations are not allowed".into()))
                }
                Event::Decl(_) => {}
                Event::Eof => break,
            }
        }

        if !stack.is_empty() {
            return Err(SamlError::Xml("unexpected end of document".into()));
        }
        let root = root.ok_or_else(|| SamlError::Xml("document has no root element".into()))?;
        Ok(XmlDocument { nodes, root })
    }

    pub fn root(&self) -> Element<'_> {
        Element {
            doc: self,
            id: self.root,
        }
    }

    fn element_data(&self, id: usize) -> &ElementData {
        match &self.nodes[id].kind {
            NodeKind::Element(data) => data,
            // Element handles are only ever created for element nodes.
            _ => unreachable!("element handle points at a non-element node"),
        }
    }
}

fn utf8(bytes: &[u8]) -> SamlResult<&str> {
    std::str::from_utf8(bytes).map_err(|e| SamlError::Xml(e.to_string()))
}

fn normalize_line_endings(raw: &str) -> Cow<'_, str> {
    if raw.contains('\r') {
        Cow::Owned(raw.replace("\r\n", "\n").replace('\r', "\n"))
    } else {
        Cow::Borrowed(raw)
    }
}

/// Attribute-value normalization for CDATA attributes, then entity expansion.
fn attribute_value(raw: &str) -> SamlResult<String> {
    let normalized = normalize_line_endings(raw).replace(['\t', '\n'], " ");
    unescape(&normalized)
        .map(Cow::into_owned)
        .map_err(|e| SamlError::Xml(e.to_string()))
}

fn split_qname(qname: &str) -> SamlResult<(Option<String>, String)> {
    match qname.split_once(':') {
        Some((prefix, local))
            if !prefix.is_empty() && !local.is_empty() && !local.contains(':') =>
        {
            Ok((Some(prefix.to_string()), local.to_string()))
        }
        None if !qname.is_empty() => Ok((None, qname.to_string())),
        _ => Err(SamlError::Xml(format!("invalid qualified name '{qname}'"))),
    }
}

fn element_data_mut(nodes: &mut [NodeData], id: usize) -> &mut ElementData {
    match &mut nodes[id].kind {
        NodeKind::Element(data) => data,
        _ => unreachable!("element id points at a non-element node"),
    }
}

fn push_child(nodes: &mut Vec<NodeData>, parent: usize, kind: NodeKind) -> usize {
    let id = nodes.len();
    nodes.push(NodeData {
        parent: Some(parent),
        children: Vec::new(),
        kind,
    });
    nodes[parent].children.push(id);
    id
}

fn push_text(nodes: &mut Vec<NodeData>, parent: usize, value: String) {
    if let Some(&last) = nodes[parent].children.last() {
        if let NodeKind::Text(existing) = &mut nodes[last].kind {
            existing.push_str(&value);
            return;
        }
    }
    push_child(nodes, parent, NodeKind::Text(value));
}

fn resolve_prefix(
    nodes: &[NodeData],
    parent: Option<usize>,
    decls: &[NamespaceDecl],
    prefix: Option<&str>,
) -> Option<String> {
    if prefix == Some("xml") {
        return Some(XML_NAMESPACE.to_string());
    }
    let mut found = decls
        .iter()
        .find(|d| d.prefix.as_deref() == prefix)
        .map(|d| d.uri.clone());
    let mut current = parent;
    while found.is_none() {
        let Some(id) = current else { break };
        if let NodeKind::Element(data) = &nodes[id].kind {
            found = data
                .namespace_decls
                .iter()
                .find(|d| d.prefix.as_deref() == prefix)
                .map(|d| d.uri.clone());
        }
        current = nodes[id].parent;
    }
    found.filter(|uri| !uri.is_empty())
}

fn push_element(
    nodes: &mut Vec<NodeData>,
    stack: &[usize],
    root: &mut Option<usize>,
    start: &BytesStart<'_>,
) -> SamlResult<usize> {
    let parent = stack.last().copied();
    if parent.is_none() && root.is_some() {
        return Err(SamlError::Xml("document has more than one root element".into()));
    }

    let (prefix, local_name) = split_qname(utf8(start.name().as_ref())?)?;

    let mut namespace_decls = Vec::new();
    let mut raw_attributes = Vec::new();
    for attr in start.attributes() {
        let attr = attr.map_err(|e| SamlError::Xml(e.to_string()))?;
        let key = utf8(attr.key.as_ref())?;
        let value = attribute_value(utf8(&attr.value)?)?;
        if key == "xmlns" {
            namespace_decls.push(NamespaceDecl { prefix: None, uri: value });
        } else if let Some(declared) = key.strip_prefix("xmlns:") {
            if value.is_empty() {
                return Err(SamlError::Xml(format!("prefix '{declared}' bound to empty namespace")));
            }
            namespace_decls.push(NamespaceDecl {
                prefix: Some(declared.to_string()),
                uri: value,
            });
        } else {
            raw_attributes.push((split_qname(key)?, value));
        }
    }

    let namespace = resolve_prefix(nodes, parent, &namespace_decls, prefix.as_deref());
    if let (Some(p), None) = (&prefix, &namespace) {
        return Err(SamlError::Xml(format!("unbound namespace prefix '{p}'")));
    }

    let mut attributes: Vec<Attribute> = Vec::with_capacity(raw_attributes.len());
    for ((attr_prefix, attr_local), value) in raw_attributes {
        let attr_namespace = match &attr_prefix {
            Some(p) => Some(
                resolve_prefix(nodes, parent, &namespace_decls, Some(p))
                    .ok_or_else(|| SamlError::Xml(format!("unbound namespace prefix '{p}'")))?,
            ),
            None => None,
        };
        if attributes
            .iter()
            .any(|a| a.local_name == attr_local && a.namespace == attr_namespace)
        {
            return Err(SamlError::Xml(format!("duplicate attribute '{attr_local}'")));
        }
        attributes.push(Attribute {
            prefix: attr_prefix,
            local_name: attr_local,
            namespace: attr_namespace,
            value,
        });
    }

    let kind = NodeKind::Element(ElementData {
        prefix,
        local_name,
        namespace,
        namespace_decls,
        attributes,
        content_start: 0,
        end: 0,
    });
    let id = match parent {
        Some(parent) => push_child(nodes, parent, kind),
        None => {
            nodes.push(NodeData {
                parent: None,
                children: Vec::new(),
                kind,
            });
            let id = nodes.len() - 1;
            *root = Some(id);
            id
        }
    };
    Ok(id)
}

impl<'d> Element<'d> {
    fn data(&self) -> &'d ElementData {
        self.doc.element_data(self.id)
    }

    pub fn document(&self) -> &'d XmlDocument {
        self.doc
    }

    pub fn local_name(&self) -> &'d str {
        &self.data().local_name
    }

    pub fn prefix(&self) -> Option<&'d str> {
        self.data().prefix.as_deref()
    }

    pub fn namespace(&self) -> Option<&'d str> {
        self.data().namespace.as_deref()
    }

    /// True if the element has the given namespace URI and local name.
    pub fn is(&self, namespace: &str, local_name: &str) -> bool {
        self.namespace() == Some(namespace) && self.local_name() == local_name
    }

    /// Value of an unqualified attribute.
    pub fn attribute(&self, name: &str) -> Option<&'d str> {
        self.data()
            .attributes
            .iter()
            .find(|a| a.namespace.is_none() && a.local_name == name)
            .map(|a| a.value.as_str())
    }

    pub fn attribute_ns(&self, namespace: &str, name: &str) -> Option<&'d str> {
        self.data()
            .attributes
            .iter()
            .find(|a| a.namespace.as_deref() == Some(namespace) && a.local_name == name)
            .map(|a| a.value.as_str())
    }

    pub fn attributes(&self) -> &'d [Attribute] {
        &self.data().attributes
    }

    /// Declarations written on this element only.
    pub fn namespace_decls(&self) -> &'d [NamespaceDecl] {
        &self.data().namespace_decls
    }

    /// All namespace bindings in scope at this element, nearest declaration
    /// first. Undeclared defaults (`xmlns=""`) are left out.
    pub fn in_scope_namespaces(&self) -> Vec<(Option<&'d str>, &'d str)> {
        let mut seen: Vec<Option<&'d str>> = Vec::new();
        let mut result = Vec::new();
        let mut current = Some(*self);
        while let Some(element) = current {
            for decl in element.namespace_decls() {
                let prefix = decl.prefix.as_deref();
                if seen.contains(&prefix) {
                    continue;
                }
                seen.push(prefix);
                if !decl.uri.is_empty() {
                    result.push((prefix, decl.uri.as_str()));
                }
            }
            current = element.parent();
        }
        result
    }

    /// Namespace URI bound to `prefix` (`None` for the default namespace).
    pub fn lookup_namespace(&self, prefix: Option<&str>) -> Option<&'d str> {
        if prefix == Some("xml") {
            return Some(XML_NAMESPACE);
        }
        self.in_scope_namespaces()
            .into_iter()
            .find(|(p, _)| *p == prefix)
            .map(|(_, uri)| uri)
    }

    pub fn parent(&self) -> Option<Element<'d>> {
        self.doc.nodes[self.id].parent.map(|id| Element { doc: self.doc, id })
    }

    pub fn children(&self) -> impl Iterator<Item = Node<'d>> + 'd {
        let doc = self.doc;
        doc.nodes[self.id]
            .children
            .iter()
            .map(move |&id| match &doc.nodes[id].kind {
                NodeKind::Element(_) => Node::Element(Element { doc, id }),
                NodeKind::Text(text) => Node::Text(text),
                NodeKind::Comment(text) => Node::Comment(text),
            })
    }

    pub fn child_elements(&self) -> impl Iterator<Item = Element<'d>> + 'd {
        self.children().filter_map(|node| match node {
            Node::Element(element) => Some(element),
            _ => None,
        })
    }

    /// This element and every element below it, in document order.
    pub fn descendants(&self) -> Vec<Element<'d>> {
        let mut result = Vec::new();
        let mut pending = vec![*self];
        while let Some(element) = pending.pop() {
            result.push(element);
            let mut children: Vec<_> = element.child_elements().collect();
            children.reverse();
            pending.extend(children);
        }
        result
    }

    /// Concatenated text of the direct text children.
    pub fn text(&self) -> String {
        self.children()
            .filter_map(|node| match node {
                Node::Text(text) => Some(text),
                _ => None,
            })
            .collect()
    }

    /// Source offset just after the start tag.
    pub fn content_start(&self) -> usize {
        self.data().content_start
    }

    /// Source offset just after the end tag (or the empty-element tag).
    pub fn end(&self) -> usize {
        self.data().end
    }
}

impl PartialEq for Element<'_> {
    fn eq(&self, other: &Self) -> bool {
        std::ptr::eq(self.doc, other.doc) && self.id == other.id
    }
}

impl Eq for Element<'_> {}

impl fmt::Debug for Element<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.prefix() {
            Some(prefix) => write!(f, "Element({prefix}:{})", self.local_name()),
            None => write!(f, "Element({})", self.local_name()),
        }
    }
}
