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

//! XPath filter support. A select alternative translates to either a plain
//! datastore query (`Simple`), a query prefix whose XML result is then run
//! through the node set evaluator (`Evaluate`), or is rejected (`Error`).
//!
//! The evaluator covers the location path subset the schema cannot turn
//! into a query: descendant steps, wildcards over containers and non-key
//! predicates. Matched nodes keep their ancestors and whole subtrees;
//! list entries keep their first child so the sweep cannot hollow them out.

use std::collections::HashSet;

use tracing::debug;

use crate::schema::Schema;
use crate::tree::{DataTree, ROOT};
use crate::xml::{Document, NodeId};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum XpathType {
    Simple,
    Evaluate,
    Error,
}

#[derive(Debug)]
pub struct XpathQuery {
    pub tree: Option<DataTree>,
    pub qschema: Option<usize>,
    pub x_type: XpathType,
}

impl XpathQuery {
    fn error() -> Self {
        XpathQuery { tree: None, qschema: None, x_type: XpathType::Error }
    }
}

#[derive(Debug)]
struct Step {
    name: String,
    descendant: bool,
    predicates: Vec<String>,
}

fn strip_step_prefix(name: &str) -> &str {
    match name.split_once(':') {
        Some((_, n)) => n,
        None => name,
    }
}

/// Split a location path into steps, honoring brackets. Returns `None` on
/// anything that is not an absolute location path.
fn parse_steps(path: &str) -> Option<Vec<Step>> {
    let path = path.trim();
    if !path.starts_with('/') {
        return None;
    }
    let mut steps = Vec::new();
    let mut chars = path.chars().peekable();
    while chars.peek() == Some(&'/') {
        chars.next();
        let mut descendant = false;
        if chars.peek() == Some(&'/') {
            chars.next();
            descendant = true;
        }
        let mut name = String::new();
        let mut predicates = Vec::new();
        while let Some(&c) = chars.peek() {
            match c {
                '/' => break,
                '[' => {
                    chars.next();
                    let mut depth = 1;
                    let mut pred = String::new();
                    for c in chars.by_ref() {
                        match c {
                            '[' => depth += 1,
                            ']' => {
                                depth -= 1;
                                if depth == 0 {
                                    break;
                                }
                            }
                            _ => {}
                        }
                        pred.push(c);
                    }
                    if depth != 0 {
                        return None;
                    }
                    predicates.push(pred);
                }
                _ => {
                    chars.next();
                    name.push(c);
                }
            }
        }
        if name.is_empty() && !descendant {
            return None;
        }
        steps.push(Step { name, descendant, predicates });
    }
    if steps.is_empty() {
        return None;
    }
    Some(steps)
}

/// A `[key='value']` style predicate, or `None` for anything richer.
fn key_predicate(pred: &str) -> Option<(String, String)> {
    let (lhs, rhs) = pred.split_once('=')?;
    let lhs = lhs.trim().trim_start_matches("./");
    let rhs = rhs.trim();
    if lhs.is_empty() || lhs.contains('(') || lhs.contains('/') || lhs.contains('@') {
        return None;
    }
    let value = if (rhs.starts_with('\'') && rhs.ends_with('\'') && rhs.len() >= 2)
        || (rhs.starts_with('"') && rhs.ends_with('"') && rhs.len() >= 2)
    {
        &rhs[1..rhs.len() - 1]
    } else {
        return None;
    };
    Some((strip_step_prefix(lhs).to_string(), value.to_string()))
}

/// Translate one select alternative. `ns_href` is the namespace in scope on
/// the filter (or the enclosing operation) and resolves the first step.
pub fn xpath_to_query(schema: &Schema, ns_href: Option<&str>, path: &str) -> XpathQuery {
    let Some(steps) = parse_steps(path) else {
        return XpathQuery::error();
    };

    let first = &steps[0];
    if first.descendant || first.name == "*" {
        // nothing to anchor a query on, let the evaluator see nothing
        return XpathQuery { tree: None, qschema: None, x_type: XpathType::Evaluate };
    }
    let first_prefix = first.name.split_once(':').map(|(p, _)| p);
    let Some(mut snode) =
        schema.root_by_namespace(ns_href, first_prefix, strip_step_prefix(&first.name))
    else {
        debug!("xpath: unknown root step {}", first.name);
        return XpathQuery::error();
    };

    let mut tree = DataTree::new();
    let mut tnode = tree.append(ROOT, strip_step_prefix(&first.name).to_string());

    let mut evaluate = false;
    let mut idx = 0;
    loop {
        let step = &steps[idx];

        // predicates on the current step
        if !step.predicates.is_empty() {
            let key = schema.list_key(snode);
            let simple = step.predicates.len() == 1
                && key_predicate(&step.predicates[0])
                    .map(|(name, _)| Some(name) == key)
                    .unwrap_or(false);
            if simple {
                let (_, value) = key_predicate(&step.predicates[0]).unwrap();
                tnode = tree.append(tnode, value);
                snode = schema
                    .child(snode, "*")
                    .expect("list nodes always have a star child");
            } else {
                evaluate = true;
                break;
            }
        }

        idx += 1;
        if idx >= steps.len() {
            break;
        }
        let next = &steps[idx];
        if next.descendant {
            evaluate = true;
            break;
        }

        // an un-predicated list level matches every entry
        if schema.is_list(snode) && schema.child(snode, strip_step_prefix(&next.name)).is_none() {
            tnode = tree.append(tnode, "*");
            snode = schema.child(snode, "*").expect("list star child");
        }

        if next.name == "*" {
            if let Some(star) = schema.child(snode, "*") {
                tnode = tree.append(tnode, "*");
                snode = star;
                continue;
            }
            evaluate = true;
            break;
        }
        match schema.child(snode, strip_step_prefix(&next.name)) {
            Some(c) => {
                tnode = tree.append(tnode, strip_step_prefix(&next.name).to_string());
                snode = c;
            }
            None => {
                debug!("xpath: unknown step {}", next.name);
                return XpathQuery::error();
            }
        }
    }

    if evaluate {
        // widen the prefix so the evaluator sees the whole subtree
        if tree.children(tnode).is_empty() {
            tree.append(tnode, "*");
        }
        return XpathQuery { tree: Some(tree), qschema: Some(snode), x_type: XpathType::Evaluate };
    }

    XpathQuery { tree: Some(tree), qschema: Some(snode), x_type: XpathType::Simple }
}

/// Evaluate a location path over a document rooted at the synthetic `root`
/// wrapper, returning the matched element ids. `None` means the expression
/// is not something the evaluator understands.
pub fn evaluate(doc: &Document, root: NodeId, path: &str) -> Option<Vec<NodeId>> {
    let steps = parse_steps(path)?;
    let mut current: Vec<NodeId> = vec![root];
    for step in &steps {
        let name = strip_step_prefix(&step.name);
        let mut next: Vec<NodeId> = Vec::new();
        for &node in &current {
            let candidates: Vec<NodeId> = if step.descendant {
                doc.descendants(node)
            } else {
                doc.children(node).to_vec()
            };
            for cand in candidates {
                if name != "*" && doc.name(cand) != name {
                    continue;
                }
                if !step.predicates.iter().all(|p| predicate_holds(doc, cand, p)) {
                    continue;
                }
                if !next.contains(&cand) {
                    next.push(cand);
                }
            }
        }
        current = next;
        if current.is_empty() {
            break;
        }
    }
    Some(current)
}

fn predicate_holds(doc: &Document, node: NodeId, pred: &str) -> bool {
    match key_predicate(pred) {
        Some((name, value)) => doc
            .children(node)
            .iter()
            .any(|&c| doc.name(c) == name && doc.text(c) == value),
        // anything beyond child equality never matches
        None => false,
    }
}

/// Reduce `doc` to the subtrees selected by the node set: matches keep
/// their descendants and ancestors, list entries keep their first child,
/// everything else is swept. Returns false if the top fragment itself was
/// deleted.
pub fn keep_node_set(
    doc: &mut Document,
    schema: &Schema,
    root: NodeId,
    matches: &[NodeId],
) -> bool {
    let mut keep: HashSet<NodeId> = HashSet::new();
    for &m in matches {
        keep.insert(m);
        for d in doc.descendants(m) {
            keep.insert(d);
        }
        let mut cur = doc.parent(m);
        while let Some(p) = cur {
            keep.insert(p);
            cur = doc.parent(p);
        }
    }
    keep.insert(root);

    mark_list_first_children(doc, schema, root, &mut keep);

    // post-order sweep of unmarked elements
    sweep(doc, root, &keep);

    // a second sweep removes empty skeleton nodes shallower than the
    // deepest retained element
    let max_depth = doc
        .descendants(root)
        .into_iter()
        .map(|n| doc.depth(n))
        .max()
        .unwrap_or(0);
    sweep_empty(doc, root, max_depth);

    !doc.children(root).is_empty()
}

fn mark_list_first_children(
    doc: &Document,
    schema: &Schema,
    node: NodeId,
    keep: &mut HashSet<NodeId>,
) {
    let mut work: Vec<(NodeId, String)> = doc
        .children(node)
        .iter()
        .map(|&c| (c, format!("/{}", doc.name(c))))
        .collect();
    while let Some((n, path)) = work.pop() {
        if !keep.contains(&n) {
            continue;
        }
        if let Some(snode) = schema.lookup(&path) {
            if schema.is_list(snode) {
                // a marked list instance keeps its key child
                if let Some(first) = doc.first_child(n) {
                    keep.insert(first);
                }
            }
        }
        for &c in doc.children(n) {
            work.push((c, format!("{path}/{}", doc.name(c))));
        }
    }
}

fn sweep(doc: &mut Document, node: NodeId, keep: &HashSet<NodeId>) {
    let children: Vec<NodeId> = doc.children(node).to_vec();
    for c in children {
        if keep.contains(&c) {
            sweep(doc, c, keep);
        } else {
            doc.detach(c);
        }
    }
}

fn sweep_empty(doc: &mut Document, node: NodeId, max_depth: usize) {
    let children: Vec<NodeId> = doc.children(node).to_vec();
    for c in children {
        sweep_empty(doc, c, max_depth);
        if doc.children(c).is_empty()
            && doc.text(c).is_empty()
            && doc.depth(c) < max_depth
        {
            doc.detach(c);
        }
    }
}
