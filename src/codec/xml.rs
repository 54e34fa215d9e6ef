//! Minimal namespace-aware element tree.

use crate::error::{FeedError, Result};
use quick_xml::escape::escape;
use quick_xml::events::{BytesStart, Event};
use quick_xml::name::{PrefixDeclaration, ResolveResult};
use quick_xml::NsReader;
use std::collections::{BTreeMap, BTreeSet};

/// Namespace bindings by prefix; the empty prefix is the default namespace.
type Scope = BTreeMap<String, String>;

/// A parsed XML element.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct XmlElement {
    /// Resolved namespace URI, if the element is in one.
    pub namespace: Option<String>,

    /// Local name.
    pub name: String,

    /// Unprefixed attributes as (local name, unescaped value).
    pub attributes: Vec<(String, String)>,

    pub children: Vec<XmlElement>,

    /// Concatenated, unescaped direct text content.
    pub text: String,

    /// The element's own source text, start tag through end tag, verbatim.
    pub source: String,

    /// Bindings in scope from ancestors.
    inherited: Scope,

    /// Prefixes declared on the start tag.
    declared: BTreeSet<String>,

    /// Prefixes the subtree uses without declaring them itself.
    free: BTreeSet<String>,

    /// Offset in `source` just past the qualified name.
    name_end: usize,
}

impl XmlElement {
    pub fn is(&self, namespace: &str, name: &str) -> bool {
        self.namespace.as_deref() == Some(namespace) && self.name == name
    }

    /// `{namespace}name`, or the bare name outside any namespace.
    pub fn clark_name(&self) -> String {
        match &self.namespace {
            Some(namespace) => format!("{{{namespace}}}{}", self.name),
            None => self.name.clone(),
        }
    }

    /// First child with the given qualified name.
    pub fn child(&self, namespace: &str, name: &str) -> Option<&XmlElement> {
        self.children.iter().find(|c| c.is(namespace, name))
    }

    pub fn children_named<'a>(
        &'a self,
        namespace: &'a str,
        name: &'a str,
    ) -> impl Iterator<Item = &'a XmlElement> + 'a {
        self.children.iter().filter(move |c| c.is(namespace, name))
    }

    pub fn attribute(&self, name: &str) -> Option<&str> {
        self.attributes
            .iter()
            .find(|(key, _)| key == name)
            .map(|(_, value)| value.as_str())
    }

    /// Text of a child, or the empty string if the child is absent.
    pub fn child_text(&self, namespace: &str, name: &str) -> &str {
        self.child(namespace, name)
            .map(|c| c.text.trim())
            .unwrap_or("")
    }

    /// The element's source with every binding it relies on declared on its
    /// own start tag, so it means the same thing wherever it is embedded.
    ///
    /// An unprefixed name with no default namespace in scope gets `xmlns=""`.
    pub fn to_standalone(&self) -> String {
        let mut declarations = String::new();
        for prefix in &self.free {
            let uri = self.inherited.get(prefix).map(String::as_str).unwrap_or("");
            if prefix.is_empty() {
                declarations.push_str(" xmlns=\"");
            } else {
                declarations.push_str(" xmlns:");
                declarations.push_str(prefix);
                declarations.push_str("=\"");
            }
            declarations.push_str(&escape(uri));
            declarations.push('"');
        }

        match (
            self.source.get(..self.name_end),
            self.source.get(self.name_end..),
        ) {
            (Some(head), Some(tail)) if !declarations.is_empty() => {
                format!("{head}{declarations}{tail}")
            }
            _ => self.source.clone(),
        }
    }
}

/// Parse a document and return its root element.
pub fn parse(source: &str) -> Result<XmlElement> {
    parse_tree(source, false)
}

/// Parse a lone element: no declaration, doctype, processing instruction or
/// anything but whitespace around the element.
pub fn parse_fragment(source: &str) -> Result<XmlElement> {
    parse_tree(source, true)
}

struct Open {
    element: XmlElement,
    start: usize,
    scope: Scope,
}

fn parse_tree(source: &str, fragment: bool) -> Result<XmlElement> {
    let mut reader = NsReader::from_str(source);
    let mut stack: Vec<Open> = Vec::new();
    let mut root: Option<XmlElement> = None;
    let empty = Scope::new();

    loop {
        let before = reader.buffer_position();
        let (namespace, event) = reader.read_resolved_event()?;
        let namespace = resolve(namespace)?;
        let after = reader.buffer_position();

        match event {
            Event::Start(start) => {
                ensure_single_root(&root, &stack)?;
                let inherited = stack.last().map_or(&empty, |open| &open.scope);
                let (element, scope) = open(namespace, &start, inherited)?;
                stack.push(Open {
                    element,
                    start: before,
                    scope,
                });
            }
            Event::Empty(start) => {
                ensure_single_root(&root, &stack)?;
                let inherited = stack.last().map_or(&empty, |open| &open.scope);
                let (mut element, _) = open(namespace, &start, inherited)?;
                element.source = slice(source, before, after)?;
                close(element, &mut stack, &mut root);
            }
            Event::End(_) => {
                let Some(Open {
                    mut element, start, ..
                }) = stack.pop()
                else {
                    return Err(FeedError::Malformed("unexpected end tag".into()));
                };
                element.source = slice(source, start, after)?;
                close(element, &mut stack, &mut root);
            }
            Event::Text(text) => {
                let text = text.unescape()?;
                match stack.last_mut() {
                    Some(open) => open.element.text.push_str(&text),
                    None if text.trim().is_empty() => {}
                    None => return Err(FeedError::Malformed("text outside root element".into())),
                }
            }
            Event::CData(data) => {
                let data = utf8(&data)?;
                match stack.last_mut() {
                    Some(open) => open.element.text.push_str(&data),
                    None => return Err(FeedError::Malformed("CDATA outside root element".into())),
                }
            }
            Event::Decl(_) | Event::DocType(_) if fragment => {
                return Err(FeedError::Malformed("declaration in fragment".into()));
            }
            Event::Eof => break,
            _ if fragment && stack.is_empty() => {
                return Err(FeedError::Malformed("markup outside root element".into()));
            }
            _ => {}
        }
    }

    if !stack.is_empty() {
        return Err(FeedError::Malformed("unexpected end of document".into()));
    }
    root.ok_or_else(|| FeedError::Malformed("document has no root element".into()))
}

fn resolve(namespace: ResolveResult<'_>) -> Result<Option<String>> {
    match namespace {
        ResolveResult::Bound(ns) => Ok(Some(utf8(ns.as_ref())?)),
        ResolveResult::Unbound => Ok(None),
        ResolveResult::Unknown(prefix) => Err(FeedError::Malformed(format!(
            "unknown namespace prefix: {}",
            String::from_utf8_lossy(&prefix)
        ))),
    }
}

/// Build an element from its start tag, returning it with the scope its
/// children see.
fn open(
    namespace: Option<String>,
    start: &BytesStart<'_>,
    inherited: &Scope,
) -> Result<(XmlElement, Scope)> {
    let mut scope = inherited.clone();
    let mut declared = BTreeSet::new();
    let mut used = BTreeSet::new();
    let mut attributes = Vec::new();

    for attr in start.attributes() {
        let attr = attr.map_err(|e| FeedError::Malformed(e.to_string()))?;
        let prefix = match attr.key.as_namespace_binding() {
            Some(PrefixDeclaration::Default) => String::new(),
            Some(PrefixDeclaration::Named(prefix)) => utf8(prefix)?,
            None => continue,
        };
        scope.insert(prefix.clone(), attr.unescape_value()?.into_owned());
        declared.insert(prefix);
    }

    for attr in start.attributes() {
        let attr = attr.map_err(|e| FeedError::Malformed(e.to_string()))?;
        if attr.key.as_namespace_binding().is_some() {
            continue;
        }
        if let Some(prefix) = attr.key.prefix() {
            let prefix = utf8(prefix.as_ref())?;
            if prefix != "xml" && !scope.contains_key(&prefix) {
                return Err(FeedError::Malformed(format!(
                    "unknown namespace prefix: {prefix}"
                )));
            }
            used.insert(prefix);
            continue;
        }
        let key = utf8(attr.key.local_name().as_ref())?;
        let value = attr.unescape_value()?.into_owned();
        attributes.push((key, value));
    }

    let qname = start.name();
    let prefix = match qname.prefix() {
        Some(prefix) => utf8(prefix.as_ref())?,
        None => String::new(),
    };
    used.insert(prefix);
    used.remove("xml");

    let element = XmlElement {
        namespace,
        name: utf8(start.local_name().as_ref())?,
        attributes,
        inherited: inherited.clone(),
        free: used.difference(&declared).cloned().collect(),
        declared,
        name_end: 1 + qname.as_ref().len(),
        ..Default::default()
    };
    Ok((element, scope))
}

fn close(element: XmlElement, stack: &mut [Open], root: &mut Option<XmlElement>) {
    match stack.last_mut() {
        Some(Open { element: parent, .. }) => {
            let free: Vec<String> = element
                .free
                .difference(&parent.declared)
                .cloned()
                .collect();
            parent.free.extend(free);
            parent.children.push(element);
        }
        None => *root = Some(element),
    }
}

fn ensure_single_root(root: &Option<XmlElement>, stack: &[Open]) -> Result<()> {
    if root.is_some() && stack.is_empty() {
        return Err(FeedError::Malformed("multiple root elements".into()));
    }
    Ok(())
}

fn slice(source: &str, start: usize, end: usize) -> Result<String> {
    source
        .get(start..end)
        .map(str::to_string)
        .ok_or_else(|| FeedError::Malformed("bad element bounds".into()))
}

fn utf8(bytes: &[u8]) -> Result<String> {
    std::str::from_utf8(bytes)
        .map(str::to_string)
        .map_err(|e| FeedError::Malformed(e.to_string()))
}
