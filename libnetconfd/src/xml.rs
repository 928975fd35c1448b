// Copyright 2023 Google LLC
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! An arena backed XML document. Elements live in a flat `Vec` and refer to
//! each other by index, which gives us parent pointers without ownership
//! cycles and makes the mark/sweep passes of the XPath pipeline flat index
//! walks. Parsing and serialization go through quick-xml.

use anyhow::{anyhow, Context};
use quick_xml::events::{BytesDecl, BytesEnd, BytesStart, BytesText, Event};
use quick_xml::{Reader, Writer};

pub type NodeId = usize;

#[derive(Debug, Clone, Default)]
pub struct Attr {
    /// Prefix as written in the source, e.g. `nc` in `nc:operation`.
    pub prefix: Option<String>,
    pub name: String,
    pub value: String,
}

#[derive(Debug, Clone, Default)]
pub struct Element {
    /// Local name without any prefix.
    pub name: String,
    /// Namespace prefix as written on the element, if any.
    pub prefix: Option<String>,
    /// Namespace declarations made on this element: (prefix, href).
    /// A `None` prefix is the default namespace.
    pub ns_decls: Vec<(Option<String>, String)>,
    pub attrs: Vec<Attr>,
    text: String,
    parent: Option<NodeId>,
    children: Vec<NodeId>,
}

#[derive(Debug, Clone, Default)]
pub struct Document {
    nodes: Vec<Element>,
    root: Option<NodeId>,
}

fn split_qname(raw: &[u8]) -> (Option<String>, String) {
    let raw = String::from_utf8_lossy(raw);
    match raw.split_once(':') {
        Some((p, n)) => (Some(p.to_string()), n.to_string()),
        None => (None, raw.to_string()),
    }
}

impl Document {
    pub fn new() -> Self {
        Document::default()
    }

    /// Parse a full document from UTF-8 bytes. Fails on malformed XML or a
    /// missing root element.
    pub fn parse(input: &[u8]) -> anyhow::Result<Document> {
        let text = std::str::from_utf8(input).context("message is not valid utf-8")?;
        let mut reader = Reader::from_str(text);

        let mut doc = Document::new();
        let mut stack: Vec<NodeId> = Vec::new();

        loop {
            match reader.read_event().context("parsing xml")? {
                Event::Start(e) => {
                    let id = doc.push_parsed_element(&e, stack.last().copied())?;
                    stack.push(id);
                }
                Event::Empty(e) => {
                    doc.push_parsed_element(&e, stack.last().copied())?;
                }
                Event::End(_) => {
                    stack.pop();
                }
                Event::Text(t) => {
                    if let Some(&cur) = stack.last() {
                        let unescaped = t.unescape().context("unescaping text")?;
                        doc.nodes[cur].text.push_str(&unescaped);
                    }
                }
                Event::CData(t) => {
                    if let Some(&cur) = stack.last() {
                        doc.nodes[cur].text.push_str(&String::from_utf8_lossy(&t));
                    }
                }
                Event::Eof => break,
                // declaration, comments, PIs and doctypes carry nothing we use
                _ => {}
            }
        }

        if doc.root.is_none() {
            return Err(anyhow!("document has no root element"));
        }
        Ok(doc)
    }

    fn push_parsed_element(
        &mut self,
        e: &BytesStart,
        parent: Option<NodeId>,
    ) -> anyhow::Result<NodeId> {
        let (prefix, name) = split_qname(e.name().as_ref());
        let id = self.push_element(name, prefix, parent);
        for attr in e.attributes() {
            let attr = attr.context("parsing attribute")?;
            let (aprefix, aname) = split_qname(attr.key.as_ref());
            let value = attr.unescape_value().context("unescaping attribute")?.to_string();
            if aprefix.as_deref() == Some("xmlns") {
                self.nodes[id].ns_decls.push((Some(aname), value));
            } else if aprefix.is_none() && aname == "xmlns" {
                self.nodes[id].ns_decls.push((None, value));
            } else {
                self.nodes[id].attrs.push(Attr { prefix: aprefix, name: aname, value });
            }
        }
        Ok(id)
    }

    fn push_element(&mut self, name: String, prefix: Option<String>, parent: Option<NodeId>) -> NodeId {
        let id = self.nodes.len();
        self.nodes.push(Element { name, prefix, parent, ..Element::default() });
        match parent {
            Some(p) => self.nodes[p].children.push(id),
            None => {
                if self.root.is_none() {
                    self.root = Some(id);
                }
            }
        }
        id
    }

    pub fn root(&self) -> Option<NodeId> {
        self.root
    }

    pub fn name(&self, id: NodeId) -> &str {
        &self.nodes[id].name
    }

    pub fn prefix(&self, id: NodeId) -> Option<&str> {
        self.nodes[id].prefix.as_deref()
    }

    pub fn text(&self, id: NodeId) -> &str {
        self.nodes[id].text.trim()
    }

    pub fn parent(&self, id: NodeId) -> Option<NodeId> {
        self.nodes[id].parent
    }

    pub fn children(&self, id: NodeId) -> &[NodeId] {
        &self.nodes[id].children
    }

    pub fn first_child(&self, id: NodeId) -> Option<NodeId> {
        self.nodes[id].children.first().copied()
    }

    pub fn find_child(&self, id: NodeId, name: &str) -> Option<NodeId> {
        self.nodes[id].children.iter().copied().find(|&c| self.nodes[c].name == name)
    }

    /// Look an attribute up by local name, ignoring any prefix. NETCONF
    /// attributes of interest (`message-id`, `type`, `select`,
    /// `nc:operation`) are unambiguous by local name.
    pub fn attr(&self, id: NodeId, name: &str) -> Option<&str> {
        self.nodes[id].attrs.iter().find(|a| a.name == name).map(|a| a.value.as_str())
    }

    pub fn ns_decls(&self, id: NodeId) -> &[(Option<String>, String)] {
        &self.nodes[id].ns_decls
    }

    /// Resolve the effective namespace href of an element by walking up
    /// through the declarations in scope.
    pub fn namespace(&self, id: NodeId) -> Option<&str> {
        let prefix = self.nodes[id].prefix.as_deref();
        let mut cur = Some(id);
        while let Some(n) = cur {
            for (p, href) in &self.nodes[n].ns_decls {
                if p.as_deref() == prefix {
                    return Some(href);
                }
            }
            cur = self.nodes[n].parent;
        }
        None
    }

    /// Unlink a node from its parent. The element stays in the arena but is
    /// no longer reachable from the root.
    pub fn detach(&mut self, id: NodeId) {
        if let Some(p) = self.nodes[id].parent.take() {
            self.nodes[p].children.retain(|&c| c != id);
        } else if self.root == Some(id) {
            self.root = None;
        }
    }

    pub fn new_root<S: Into<String>>(&mut self, name: S) -> NodeId {
        self.push_element(name.into(), None, None)
    }

    pub fn append_child<S: Into<String>>(&mut self, parent: NodeId, name: S) -> NodeId {
        self.push_element(name.into(), None, Some(parent))
    }

    /// Re-parent an existing node under a new parent.
    pub fn reattach(&mut self, id: NodeId, parent: NodeId) {
        self.detach(id);
        self.nodes[id].parent = Some(parent);
        self.nodes[parent].children.push(id);
    }

    pub fn set_text<S: Into<String>>(&mut self, id: NodeId, text: S) {
        self.nodes[id].text = text.into();
    }

    pub fn push_attr<N: Into<String>, V: Into<String>>(&mut self, id: NodeId, name: N, value: V) {
        self.nodes[id].attrs.push(Attr { prefix: None, name: name.into(), value: value.into() });
    }

    pub fn push_ns<S: Into<String>>(&mut self, id: NodeId, prefix: Option<String>, href: S) {
        self.nodes[id].ns_decls.push((prefix, href.into()));
    }

    /// Depth of a node, the root being depth 0.
    pub fn depth(&self, id: NodeId) -> usize {
        let mut d = 0;
        let mut cur = self.nodes[id].parent;
        while let Some(p) = cur {
            d += 1;
            cur = self.nodes[p].parent;
        }
        d
    }

    /// All reachable descendants of `id`, not including `id` itself.
    pub fn descendants(&self, id: NodeId) -> Vec<NodeId> {
        let mut out = Vec::new();
        let mut work: Vec<NodeId> = self.nodes[id].children.clone();
        while let Some(n) = work.pop() {
            out.push(n);
            work.extend_from_slice(&self.nodes[n].children);
        }
        out
    }

    /// Serialize the subtree rooted at `id` without an XML declaration.
    pub fn serialize(&self, id: NodeId) -> anyhow::Result<String> {
        let mut writer = Writer::new(Vec::new());
        self.write_element(&mut writer, id)?;
        String::from_utf8(writer.into_inner()).context("serialized xml is not utf-8")
    }

    fn write_element(&self, writer: &mut Writer<Vec<u8>>, id: NodeId) -> anyhow::Result<()> {
        let el = &self.nodes[id];
        let qname = match &el.prefix {
            Some(p) => format!("{p}:{}", el.name),
            None => el.name.clone(),
        };
        let mut start = BytesStart::new(qname.clone());
        for (prefix, href) in &el.ns_decls {
            match prefix {
                Some(p) => start.push_attribute((format!("xmlns:{p}").as_str(), href.as_str())),
                None => start.push_attribute(("xmlns", href.as_str())),
            }
        }
        for attr in &el.attrs {
            match &attr.prefix {
                Some(p) => start.push_attribute((
                    format!("{p}:{}", attr.name).as_str(),
                    attr.value.as_str(),
                )),
                None => start.push_attribute((attr.name.as_str(), attr.value.as_str())),
            }
        }

        let text = el.text.trim();
        if el.children.is_empty() && text.is_empty() {
            writer.write_event(Event::Empty(start))?;
            return Ok(());
        }

        writer.write_event(Event::Start(start))?;
        if !text.is_empty() {
            writer.write_event(Event::Text(BytesText::new(text)))?;
        }
        for &child in &el.children {
            self.write_element(writer, child)?;
        }
        writer.write_event(Event::End(BytesEnd::new(qname)))?;
        Ok(())
    }
}

/// Serialize a full reply document: XML declaration plus the given body.
pub fn document_string(body: &str) -> String {
    let mut writer = Writer::new(Vec::new());
    // the declaration write is infallible on a Vec sink
    let _ = writer.write_event(Event::Decl(BytesDecl::new("1.0", Some("UTF-8"), None)));
    let mut out = String::from_utf8(writer.into_inner()).unwrap_or_default();
    out.push('\n');
    out.push_str(body);
    out
}
