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

//! The schema engine. Models are XML files describing a YANG derived tree:
//! a `MODULE` root carrying model metadata and nested `NODE` elements
//! carrying per-path name, access mode, default value and `when` condition.
//! A list is a node with a `*` child; list entries are keyed by the child
//! named by the `key` attribute (first leaf child otherwise).
//!
//! Everything the protocol engines need from the model lives behind this
//! type: lookup by path or namespace, node predicates, the XML to data tree
//! translations for filters and edits, data tree to XML serialization,
//! defaults handling and `when` condition evaluation.

use std::fs;
use std::path::Path;

use anyhow::{anyhow, Context};
use tracing::{debug, info};

use crate::error::{ErrType, NcError, Tag};
use crate::tree::{DataTree, ROOT};
use crate::xml::{Document, NodeId};

/// Behavior flags threaded through translation and serialization.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SchFlags(u32);

impl SchFlags {
    pub const NONE: SchFlags = SchFlags(0);
    /// Only config (writable) nodes survive serialization.
    pub const CONFIG: SchFlags = SchFlags(1);
    /// Add schema default values to the response.
    pub const ADD_DEFAULTS: SchFlags = SchFlags(1 << 1);
    /// Remove leaves whose value equals the schema default.
    pub const TRIM_DEFAULTS: SchFlags = SchFlags(1 << 2);
    /// A valued list key in a filter becomes a path component and the key
    /// leaf itself is dropped from the requested shape.
    pub const STRIP_KEY: SchFlags = SchFlags(1 << 3);
    /// Do not widen frontiers with a wildcard.
    pub const DEPTH_ONE: SchFlags = SchFlags(1 << 4);

    pub fn has(self, other: SchFlags) -> bool {
        self.0 & other.0 != 0
    }

    pub fn with(self, other: SchFlags) -> SchFlags {
        SchFlags(self.0 | other.0)
    }
}

#[derive(Debug, Clone)]
pub struct ModelInfo {
    pub model: String,
    pub organization: String,
    pub version: String,
    pub ns_href: String,
    pub prefix: String,
    pub features: Option<String>,
    pub deviations: Option<String>,
}

#[derive(Debug)]
struct SchemaNode {
    name: String,
    mode: String,
    default: Option<String>,
    when: Option<String>,
    key: Option<String>,
    model: usize,
    parent: Option<usize>,
    children: Vec<usize>,
}

#[derive(Debug, Default)]
pub struct Schema {
    nodes: Vec<SchemaNode>,
    roots: Vec<usize>,
    models: Vec<ModelInfo>,
}

/// What a `<config>` tree translates to: the mutation tree plus the per
/// operation path lists, condition pairs and whether a tree set is needed.
/// The create/merge/replace lists carry the leaf value alongside the path
/// for audit records; pre-flight checks use only the path.
#[derive(Debug, Default)]
pub struct EditParms {
    pub tree: DataTree,
    pub creates: Vec<(String, String)>,
    pub deletes: Vec<String>,
    pub removes: Vec<String>,
    pub replaces: Vec<(String, String)>,
    pub merges: Vec<(String, String)>,
    pub conditions: Vec<(String, String)>,
    pub need_tree_set: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EditOp {
    Merge,
    Replace,
    Create,
    Delete,
    Remove,
    None,
}

impl EditOp {
    fn parse(s: &str) -> Option<EditOp> {
        match s {
            "merge" => Some(EditOp::Merge),
            "replace" => Some(EditOp::Replace),
            "create" => Some(EditOp::Create),
            "delete" => Some(EditOp::Delete),
            "remove" => Some(EditOp::Remove),
            "none" => Some(EditOp::None),
            _ => Option::None,
        }
    }
}

impl Schema {
    /// Load every model file in `dir`. When `supported` is given, models
    /// whose name is not listed are skipped.
    pub fn load(dir: &Path, supported: Option<&[String]>) -> anyhow::Result<Schema> {
        let mut schema = Schema::default();
        let mut paths: Vec<_> = fs::read_dir(dir)
            .with_context(|| format!("reading schema dir {}", dir.display()))?
            .filter_map(|e| e.ok().map(|e| e.path()))
            .filter(|p| p.extension().map(|e| e == "xml").unwrap_or(false))
            .collect();
        paths.sort();

        for path in paths {
            let raw = fs::read(&path)
                .with_context(|| format!("reading model file {}", path.display()))?;
            let doc = Document::parse(&raw)
                .with_context(|| format!("parsing model file {}", path.display()))?;
            let module = doc.root().ok_or(anyhow!("empty model file"))?;
            if doc.name(module) != "MODULE" {
                return Err(anyhow!("{}: root element is not MODULE", path.display()));
            }
            let model = doc.attr(module, "model").unwrap_or("").to_string();
            if let Some(supported) = supported {
                if !supported.iter().any(|m| *m == model) {
                    debug!("skipping unsupported model {}", model);
                    continue;
                }
            }
            let model_idx = schema.models.len();
            schema.models.push(ModelInfo {
                model,
                organization: doc.attr(module, "organization").unwrap_or("").to_string(),
                version: doc.attr(module, "version").unwrap_or("").to_string(),
                ns_href: doc.attr(module, "namespace").unwrap_or("").to_string(),
                prefix: doc.attr(module, "prefix").unwrap_or("").to_string(),
                features: doc.attr(module, "features").map(String::from),
                deviations: doc.attr(module, "deviations").map(String::from),
            });
            for &child in doc.children(module) {
                if doc.name(child) == "NODE" {
                    let id = schema.load_node(&doc, child, model_idx, None)?;
                    schema.roots.push(id);
                }
            }
        }
        info!("loaded {} models, {} root nodes", schema.models.len(), schema.roots.len());
        Ok(schema)
    }

    fn load_node(
        &mut self,
        doc: &Document,
        elem: NodeId,
        model: usize,
        parent: Option<usize>,
    ) -> anyhow::Result<usize> {
        let name = doc.attr(elem, "name").ok_or(anyhow!("NODE without a name"))?.to_string();
        let id = self.nodes.len();
        self.nodes.push(SchemaNode {
            name,
            mode: doc.attr(elem, "mode").unwrap_or("").to_string(),
            default: doc.attr(elem, "default").map(String::from),
            when: doc.attr(elem, "when").map(String::from),
            key: doc.attr(elem, "key").map(String::from),
            model,
            parent,
            children: Vec::new(),
        });
        if let Some(p) = parent {
            self.nodes[p].children.push(id);
        }
        for &child in doc.children(elem) {
            if doc.name(child) == "NODE" {
                self.load_node(doc, child, model, Some(id))?;
            }
        }
        Ok(id)
    }

    pub fn models(&self) -> &[ModelInfo] {
        &self.models
    }

    pub fn model_of(&self, id: usize) -> &ModelInfo {
        &self.models[self.nodes[id].model]
    }

    pub fn name(&self, id: usize) -> &str {
        &self.nodes[id].name
    }

    pub fn parent(&self, id: usize) -> Option<usize> {
        self.nodes[id].parent
    }

    pub fn default_value(&self, id: usize) -> Option<&str> {
        self.nodes[id].default.as_deref()
    }

    pub fn is_leaf(&self, id: usize) -> bool {
        self.nodes[id].children.is_empty()
    }

    pub fn has_children(&self, id: usize) -> bool {
        !self.nodes[id].children.is_empty()
    }

    pub fn is_list(&self, id: usize) -> bool {
        self.star_child(id).is_some()
    }

    /// Readable unless the mode says otherwise; `h` hides a node entirely.
    pub fn is_readable(&self, id: usize) -> bool {
        let mode = &self.nodes[id].mode;
        if mode.contains('h') {
            return false;
        }
        mode.is_empty() || mode.contains('r')
    }

    pub fn is_writable(&self, id: usize) -> bool {
        self.nodes[id].mode.contains('w')
    }

    /// Config nodes are the writable ones; containers with no mode pass
    /// through so their writable descendants can be reached.
    fn is_config(&self, id: usize) -> bool {
        self.is_writable(id) || (self.nodes[id].mode.is_empty() && !self.is_leaf(id))
    }

    fn star_child(&self, id: usize) -> Option<usize> {
        self.nodes[id].children.iter().copied().find(|&c| self.nodes[c].name == "*")
    }

    pub fn child(&self, id: usize, name: &str) -> Option<usize> {
        self.nodes[id].children.iter().copied().find(|&c| self.nodes[c].name == name)
    }

    /// The name of the key leaf of a list node.
    pub fn list_key(&self, id: usize) -> Option<String> {
        let star = self.star_child(id)?;
        if let Some(key) = &self.nodes[star].key {
            return Some(key.clone());
        }
        self.nodes[star]
            .children
            .iter()
            .copied()
            .find(|&c| self.is_leaf(c))
            .map(|c| self.nodes[c].name.clone())
    }

    pub fn root_by_name(&self, name: &str) -> Option<usize> {
        self.roots.iter().copied().find(|&r| self.nodes[r].name == name)
    }

    /// Find a module root node by namespace href or prefix.
    pub fn root_by_namespace(
        &self,
        href: Option<&str>,
        prefix: Option<&str>,
        name: &str,
    ) -> Option<usize> {
        self.roots.iter().copied().find(|&r| {
            let model = &self.models[self.nodes[r].model];
            let ns_ok = match (href, prefix) {
                (None, None) => true,
                _ => {
                    href.map(|h| model.ns_href == h).unwrap_or(false)
                        || prefix.map(|p| model.prefix == p).unwrap_or(false)
                }
            };
            ns_ok && self.nodes[r].name == name
        })
    }

    /// Does any loaded model claim this namespace?
    pub fn knows_namespace(&self, href: &str) -> bool {
        self.models.iter().any(|m| m.ns_href == href)
    }

    /// Walk a slash separated data path. List levels consume one extra
    /// component for the entry key.
    pub fn lookup(&self, path: &str) -> Option<usize> {
        let mut comps = path.trim_matches('/').split('/');
        let first = comps.next()?;
        let mut cur = self.root_by_name(strip_prefix(first))?;
        for comp in comps {
            cur = match self.child(cur, strip_prefix(comp)) {
                Some(c) => c,
                None => self.star_child(cur)?,
            };
        }
        Some(cur)
    }

    /// Convert a subtree filter element into a datastore query tree.
    /// Returns the query and the schema node of the deepest translated
    /// element.
    pub fn xml_to_query(
        &self,
        doc: &Document,
        elem: NodeId,
        flags: SchFlags,
    ) -> Result<(DataTree, Option<usize>), NcError> {
        let root = self.resolve_top(doc, elem)?;
        let mut tree = DataTree::new();
        let tnode = tree.append(ROOT, doc.name(elem).to_string());
        let mut deepest = (1usize, root);
        self.query_children(doc, elem, root, &mut tree, tnode, flags, 1, &mut deepest)?;
        Ok((tree, Some(deepest.1)))
    }

    fn resolve_top(&self, doc: &Document, elem: NodeId) -> Result<usize, NcError> {
        let name = doc.name(elem);
        let href = doc.namespace(elem);
        if let Some(href) = href {
            if href != crate::consts::BASE_1_0_NS && !self.knows_namespace(href) {
                return Err(NcError::new(Tag::UnknownNamespace, ErrType::Rpc)
                    .with_message(format!("Namespace \"{href}\" is not known"))
                    .with_bad_namespace(href)
                    .with_bad_element(name));
            }
        }
        let known_href = href.filter(|h| self.knows_namespace(h));
        self.root_by_namespace(known_href, doc.prefix(elem), name).ok_or_else(|| {
            NcError::new(Tag::UnknownElement, ErrType::Rpc)
                .with_message(format!("Element \"{name}\" is not known"))
                .with_bad_element(name)
        })
    }

    #[allow(clippy::too_many_arguments)]
    fn query_children(
        &self,
        doc: &Document,
        elem: NodeId,
        schema: usize,
        tree: &mut DataTree,
        tnode: usize,
        flags: SchFlags,
        depth: usize,
        deepest: &mut (usize, usize),
    ) -> Result<(), NcError> {
        if depth > deepest.0 {
            *deepest = (depth, schema);
        }

        if let Some(star) = self.star_child(schema) {
            // `elem` is one list instance; its key child (when valued)
            // becomes the entry path component
            let key_name = self.list_key(schema).unwrap_or_default();
            let key_elem = doc
                .children(elem)
                .iter()
                .copied()
                .find(|&c| doc.name(c) == key_name && !doc.text(c).is_empty());
            let entry = match key_elem {
                Some(k) => tree.append(tnode, doc.text(k).to_string()),
                None => tree.append(tnode, "*"),
            };
            if depth + 1 > deepest.0 {
                *deepest = (depth + 1, star);
            }
            for &child in doc.children(elem) {
                if let Some(k) = key_elem {
                    if child == k && flags.has(SchFlags::STRIP_KEY) {
                        continue;
                    }
                }
                self.query_child(doc, child, star, tree, entry, flags, depth + 1, deepest)?;
            }
            return Ok(());
        }

        for &child in doc.children(elem) {
            self.query_child(doc, child, schema, tree, tnode, flags, depth, deepest)?;
        }
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    fn query_child(
        &self,
        doc: &Document,
        child: NodeId,
        schema: usize,
        tree: &mut DataTree,
        tnode: usize,
        flags: SchFlags,
        depth: usize,
        deepest: &mut (usize, usize),
    ) -> Result<(), NcError> {
        let name = doc.name(child);
        let cschema = self.child(schema, name).ok_or_else(|| {
            NcError::new(Tag::UnknownElement, ErrType::Rpc)
                .with_message(format!("Element \"{name}\" is not known"))
                .with_bad_element(name)
        })?;
        let ctree = tree.ensure_child(tnode, name);
        if depth + 1 > deepest.0 {
            *deepest = (depth + 1, cschema);
        }
        if self.is_leaf(cschema) {
            let text = doc.text(child);
            if !text.is_empty() {
                tree.set_value(ctree, text.to_string());
            }
            return Ok(());
        }
        self.query_children(doc, child, cschema, tree, ctree, flags, depth + 1, deepest)
    }

    /// Convert the child of a `<config>` element into typed mutations.
    pub fn xml_to_edit(
        &self,
        doc: &Document,
        elem: NodeId,
        def_op: &str,
    ) -> Result<EditParms, NcError> {
        let root = self.resolve_top(doc, elem)?;
        let def_op = EditOp::parse(def_op).unwrap_or(EditOp::Merge);
        let mut parms = EditParms::default();
        let mut tree = DataTree::new();
        let tnode = tree.append(ROOT, doc.name(elem).to_string());
        self.edit_element(doc, elem, root, &mut tree, tnode, def_op, &mut parms)?;
        parms.tree = tree;
        Ok(parms)
    }

    fn edit_op(&self, doc: &Document, elem: NodeId, inherited: EditOp) -> Result<EditOp, NcError> {
        match doc.attr(elem, "operation") {
            None => Ok(inherited),
            Some(raw) => EditOp::parse(raw).ok_or_else(|| {
                NcError::new(Tag::BadAttribute, ErrType::Rpc)
                    .with_message(format!("Unknown operation \"{raw}\""))
                    .with_bad_attribute("operation")
                    .with_bad_element(doc.name(elem))
            }),
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn edit_element(
        &self,
        doc: &Document,
        elem: NodeId,
        schema: usize,
        tree: &mut DataTree,
        tnode: usize,
        inherited: EditOp,
        parms: &mut EditParms,
    ) -> Result<(), NcError> {
        let op = self.edit_op(doc, elem, inherited)?;
        let path = tree.path(tnode);

        if let Some(when) = &self.nodes[schema].when {
            parms.conditions.push((path.clone(), when.clone()));
        }

        match op {
            EditOp::Delete => parms.deletes.push(path.clone()),
            EditOp::Remove => parms.removes.push(path.clone()),
            _ => {}
        }

        if let Some(star) = self.star_child(schema) {
            let key_name = self.list_key(schema).ok_or_else(|| {
                NcError::new(Tag::OperationFailed, ErrType::Application)
                    .with_message(format!("List \"{}\" has no key", self.nodes[schema].name))
            })?;
            let key_elem = doc
                .children(elem)
                .iter()
                .copied()
                .find(|&c| doc.name(c) == key_name && !doc.text(c).is_empty())
                .ok_or_else(|| {
                    NcError::new(Tag::MissingElement, ErrType::Protocol)
                        .with_message(format!("Missing \"{key_name}\" element"))
                        .with_bad_element(key_name.clone())
                })?;
            let entry = tree.ensure_child(tnode, doc.text(key_elem));
            if matches!(op, EditOp::Delete | EditOp::Remove) {
                // prune the whole entry, nothing to descend into
                let entry_path = tree.path(entry);
                replace_last(&mut parms.deletes, &path, &entry_path);
                replace_last(&mut parms.removes, &path, &entry_path);
                tree.detach(entry);
                return Ok(());
            }
            if matches!(op, EditOp::Create) {
                parms.creates.push((tree.path(entry), String::new()));
            }
            if matches!(op, EditOp::Replace) {
                parms.replaces.push((tree.path(entry), String::new()));
            }
            let next = descend_op(op);
            for &child in doc.children(elem) {
                self.edit_child(doc, child, star, tree, entry, next, parms)?;
            }
            return Ok(());
        }

        if self.is_leaf(schema) {
            let value = doc.text(elem).to_string();
            match op {
                EditOp::Delete | EditOp::Remove | EditOp::None => {}
                _ => {
                    if !self.is_writable(schema) {
                        return Err(NcError::new(Tag::AccessDenied, ErrType::Application)
                            .with_message(format!("Path \"{path}\" is not writable")));
                    }
                    tree.set_value(tnode, value.clone());
                    parms.need_tree_set = true;
                    match op {
                        EditOp::Merge => parms.merges.push((path, value)),
                        EditOp::Replace => parms.replaces.push((path, value)),
                        EditOp::Create => parms.creates.push((path, value)),
                        _ => {}
                    }
                }
            }
            return Ok(());
        }

        // plain container
        if matches!(op, EditOp::Delete | EditOp::Remove) {
            tree.detach(tnode);
            return Ok(());
        }
        if matches!(op, EditOp::Create) {
            parms.creates.push((path.clone(), String::new()));
        }
        if matches!(op, EditOp::Replace) {
            parms.replaces.push((path, String::new()));
        }
        let next = descend_op(op);
        for &child in doc.children(elem) {
            self.edit_child(doc, child, schema, tree, tnode, next, parms)?;
        }
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    fn edit_child(
        &self,
        doc: &Document,
        child: NodeId,
        schema: usize,
        tree: &mut DataTree,
        tnode: usize,
        inherited: EditOp,
        parms: &mut EditParms,
    ) -> Result<(), NcError> {
        let name = doc.name(child);
        let cschema = self.child(schema, name).ok_or_else(|| {
            NcError::new(Tag::UnknownElement, ErrType::Rpc)
                .with_message(format!("Element \"{name}\" is not known"))
                .with_bad_element(name)
        })?;
        let ctree = tree.ensure_child(tnode, name);
        self.edit_element(doc, child, cschema, tree, ctree, inherited, parms)?;
        // drop childless container skeletons left by delete/remove leaves
        if tree.children(ctree).is_empty() && tree.value(ctree).is_none() && self.is_leaf(cschema) {
            tree.detach(ctree);
        }
        Ok(())
    }

    /// Serialize a result tree (rooted at `/`) to XML fragments, one per top
    /// level subtree.
    pub fn tree_to_xml(&self, tree: &DataTree, flags: SchFlags) -> Vec<String> {
        let mut out = Vec::new();
        for &top in tree.children(ROOT) {
            let Some(schema) = self.root_by_name(tree.name(top)) else {
                debug!("no schema for subtree {}", tree.name(top));
                continue;
            };
            let mut doc = Document::new();
            let el = doc.new_root(tree.name(top).to_string());
            doc.push_ns(el, None, self.model_of(schema).ns_href.clone());
            self.node_to_xml(tree, top, schema, &mut doc, el, flags);
            if doc.root().is_some()
                && (doc.first_child(el).is_some() || !doc.text(el).is_empty() || self.is_leaf(schema))
            {
                if let Ok(xml) = doc.serialize(el) {
                    out.push(xml);
                }
            }
        }
        out
    }

    fn node_to_xml(
        &self,
        tree: &DataTree,
        tnode: usize,
        schema: usize,
        doc: &mut Document,
        el: NodeId,
        flags: SchFlags,
    ) {
        if let Some(star) = self.star_child(schema) {
            // each child of the list level is one entry, serialized as a
            // repeated element named after the list
            let parent_el = doc.parent(el).unwrap_or(el);
            for &entry in tree.children(tnode) {
                let entry_el = doc.append_child(parent_el, self.nodes[schema].name.clone());
                for &child in tree.children(entry) {
                    self.child_to_xml(tree, child, star, doc, entry_el, flags);
                }
                if doc.children(entry_el).is_empty() {
                    doc.detach(entry_el);
                }
            }
            // the list element itself was created by the caller; remove the
            // placeholder since entries are siblings of it
            doc.detach(el);
            return;
        }

        if let Some(v) = tree.value(tnode) {
            doc.set_text(el, v.to_string());
            return;
        }

        for &child in tree.children(tnode) {
            self.child_to_xml(tree, child, schema, doc, el, flags);
        }
    }

    fn child_to_xml(
        &self,
        tree: &DataTree,
        tnode: usize,
        schema: usize,
        doc: &mut Document,
        parent_el: NodeId,
        flags: SchFlags,
    ) {
        let name = tree.name(tnode);
        let Some(cschema) = self.child(schema, name) else {
            debug!("no schema for node {}", name);
            return;
        };
        if !self.is_readable(cschema) {
            return;
        }
        if flags.has(SchFlags::CONFIG) && !self.is_config(cschema) {
            return;
        }
        let el = doc.append_child(parent_el, name.to_string());
        self.node_to_xml(tree, tnode, cschema, doc, el, flags);
        // empty non-presence containers do not serialize
        if !self.is_leaf(cschema)
            && doc.parent(el).is_some()
            && doc.children(el).is_empty()
            && doc.text(el).is_empty()
        {
            doc.detach(el);
        }
    }

    /// Add default valued leaves below `tnode`, which corresponds to
    /// `schema`. Only existing containers are descended into.
    pub fn add_defaults(&self, tree: &mut DataTree, tnode: usize, schema: usize) {
        if let Some(star) = self.star_child(schema) {
            let entries: Vec<usize> = tree.children(tnode).to_vec();
            for entry in entries {
                self.add_defaults_under(tree, entry, star);
            }
            return;
        }
        self.add_defaults_under(tree, tnode, schema);
    }

    fn add_defaults_under(&self, tree: &mut DataTree, tnode: usize, schema: usize) {
        for &cschema in &self.nodes[schema].children {
            let name = self.nodes[cschema].name.clone();
            if self.is_leaf(cschema) {
                if let Some(default) = &self.nodes[cschema].default {
                    if self.is_readable(cschema) && tree.find_child(tnode, &name).is_none() {
                        tree.append_leaf(tnode, name, default.clone());
                    }
                }
            } else if let Some(child) = tree.find_child(tnode, &name) {
                self.add_defaults(tree, child, cschema);
            }
        }
    }

    /// Remove leaves below `tnode` whose value equals the schema default.
    pub fn trim_defaults(&self, tree: &mut DataTree, tnode: usize, schema: usize) {
        if let Some(star) = self.star_child(schema) {
            let entries: Vec<usize> = tree.children(tnode).to_vec();
            for entry in entries {
                self.trim_defaults_under(tree, entry, star);
            }
            return;
        }
        self.trim_defaults_under(tree, tnode, schema);
    }

    fn trim_defaults_under(&self, tree: &mut DataTree, tnode: usize, schema: usize) {
        let children: Vec<usize> = tree.children(tnode).to_vec();
        for child in children {
            let name = tree.name(child).to_string();
            let Some(cschema) = self.child(schema, &name) else { continue };
            if self.is_leaf(cschema) {
                if let (Some(v), Some(d)) = (tree.value(child), self.nodes[cschema].default.as_deref())
                {
                    if v == d {
                        tree.detach(child);
                    }
                }
            } else {
                self.trim_defaults(tree, child, cschema);
            }
        }
    }

    /// Evaluate a `when` condition recorded for `path` against the mutation
    /// tree. The grammar covers relative path equality and existence tests
    /// joined with `and` / `or`.
    pub fn process_condition(&self, tree: &DataTree, path: &str, condition: &str) -> bool {
        let Some(node) = find_by_path(tree, path) else {
            return false;
        };
        condition.split(" or ").any(|clause| {
            clause.split(" and ").all(|atom| eval_atom(tree, node, atom.trim()))
        })
    }
}

fn descend_op(op: EditOp) -> EditOp {
    match op {
        // children under an explicit structural op just populate the tree
        EditOp::Replace | EditOp::Create => EditOp::Merge,
        other => other,
    }
}

/// When a delete/remove recorded the list element path but the entry key
/// narrows it, rewrite the recorded path.
fn replace_last(list: &mut Vec<String>, from: &str, to: &str) {
    if let Some(last) = list.last_mut() {
        if last == from {
            *last = to.to_string();
        }
    }
}

fn strip_prefix(comp: &str) -> &str {
    match comp.split_once(':') {
        Some((_, n)) => n,
        None => comp,
    }
}

fn find_by_path(tree: &DataTree, path: &str) -> Option<usize> {
    let mut cur = ROOT;
    for comp in path.trim_matches('/').split('/') {
        cur = tree.find_child(cur, comp)?;
    }
    Some(cur)
}

fn eval_atom(tree: &DataTree, node: usize, atom: &str) -> bool {
    let (path_part, want) = match atom.split_once('=') {
        Some((p, v)) => (p.trim(), Some(v.trim().trim_matches('\'').trim_matches('"'))),
        None => (atom, None),
    };
    let mut cur = node;
    for comp in path_part.split('/') {
        match comp {
            "." | "" => {}
            ".." => match tree.parent(cur) {
                Some(p) => cur = p,
                None => return false,
            },
            name => match tree.find_child(cur, name) {
                Some(c) => cur = c,
                None => return false,
            },
        }
    }
    match want {
        Some(v) => tree.value(cur).map(|got| got == v).unwrap_or(false),
        None => true,
    }
}
