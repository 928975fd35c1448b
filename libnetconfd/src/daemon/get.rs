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

//! The query pipeline behind `get` and `get-config`: filters translate to
//! datastore queries, results come back as trees, defaults handling and
//! the XPath evaluate pass shape them, and the schema serializes them to
//! the `<data>` fragments of the reply.

use tracing::{debug, info};

use crate::audit;
use crate::error::{ErrType, NcError, Tag};
use crate::schema::{SchFlags, Schema};
use crate::tree::{self, DataTree};
use crate::xml::{Document, NodeId};
use crate::xpath::{self, XpathType};

use super::server::{Ctx, ReplyBody};

pub(crate) fn handle(
    ctx: &Ctx,
    doc: &Document,
    rpc: NodeId,
    config_only: bool,
) -> Result<ReplyBody, NcError> {
    let action = doc.first_child(rpc).expect("dispatcher always hands over an operation");

    let mut flags = SchFlags::NONE;
    if config_only {
        flags = flags.with(SchFlags::CONFIG);
        // get-config from a session other than the lock owner is refused
        if let Some(owner) = ctx.table.locked_by_other(ctx.session.id) {
            debug!("lock is held by session {}", owner);
            return Err(NcError::new(Tag::InUse, ErrType::Application)
                .with_message("Lock is already held")
                .with_session_id(owner));
        }
    }

    // with-defaults first, it changes how queries execute
    for &node in doc.children(action) {
        if doc.name(node) != "with-defaults" {
            continue;
        }
        match doc.text(node) {
            "report-all" => flags = flags.with(SchFlags::ADD_DEFAULTS),
            "trim" => flags = flags.with(SchFlags::TRIM_DEFAULTS),
            "explicit" => {}
            other => {
                return Err(NcError::new(Tag::OperationNotSupported, ErrType::Protocol)
                    .with_message(format!(
                        "WITH-DEFAULTS: No support for with-defaults query type \"{other}\""
                    )));
            }
        }
        break;
    }

    let mut fragments: Vec<String> = Vec::new();
    let mut filter_seen = false;
    for &node in doc.children(action) {
        match doc.name(node) {
            "with-defaults" => {}
            "source" => {
                let datastore = doc.first_child(node).map(|c| doc.name(c)).unwrap_or("none");
                if datastore != "running" {
                    return Err(NcError::new(Tag::OperationNotSupported, ErrType::Protocol)
                        .with_message(format!("Datastore \"{datastore}\" not supported")));
                }
            }
            "filter" => {
                filter_seen = true;
                process_filter(ctx, doc, node, action, flags, config_only, &mut fragments)?;
            }
            other => debug!("ignoring {} in get", other),
        }
    }

    // a get with no filter at all enumerates the whole datastore
    if !filter_seen && fragments.is_empty() {
        let mut full = DataTree::new();
        for path in ctx.store.search("/") {
            if let Some(sub) = ctx.store.get_tree(&path) {
                for &top in sub.children(tree::ROOT) {
                    full.graft(tree::ROOT, &sub, top);
                }
            }
        }
        fragments = ctx.schema.tree_to_xml(&full, flags);
    }

    Ok(ReplyBody::Data(fragments))
}

fn process_filter(
    ctx: &Ctx,
    doc: &Document,
    filter: NodeId,
    action: NodeId,
    flags: SchFlags,
    config_only: bool,
    fragments: &mut Vec<String>,
) -> Result<(), NcError> {
    match doc.attr(filter, "type").unwrap_or("subtree") {
        "subtree" => {
            if doc.first_child(filter).is_none() {
                debug!("empty subtree filter");
                return Ok(());
            }
            for &elem in doc.children(filter) {
                subtree_alternative(ctx, doc, elem, flags, config_only, fragments)?;
            }
            Ok(())
        }
        "xpath" => {
            let select = doc.attr(filter, "select").ok_or_else(|| {
                NcError::new(Tag::MissingAttribute, ErrType::Protocol)
                    .with_message("XPATH filter missing select attribute")
                    .with_bad_element("xpath")
                    .with_bad_attribute("select")
            })?;
            let ns = known_namespace(ctx.schema, doc, filter)
                .or_else(|| known_namespace(ctx.schema, doc, action));
            for alternative in select.split('|') {
                let path = alternative.trim().replace("child::", "");
                xpath_alternative(ctx, &path, ns.as_deref(), flags, config_only, fragments)?;
            }
            Ok(())
        }
        other => Err(NcError::new(Tag::OperationNotSupported, ErrType::Application)
            .with_message(format!("FILTER: unsupported/missing type ({other})"))),
    }
}

/// The first namespace declared on `elem` that a loaded model claims.
fn known_namespace(schema: &Schema, doc: &Document, elem: NodeId) -> Option<String> {
    doc.ns_decls(elem)
        .iter()
        .map(|(_, href)| href)
        .find(|href| schema.knows_namespace(href))
        .cloned()
}

/// The deepest non-wildcard node of a query; a wildcard leaf stands for
/// its parent.
fn deepest_qnode(query: &DataTree) -> Option<usize> {
    let mut best: Option<(usize, usize)> = None;
    for leaf in query.leaves() {
        let (node, depth) = if query.name(leaf) == "*" {
            match query.parent(leaf) {
                Some(p) => (p, query.depth(p)),
                None => continue,
            }
        } else {
            (leaf, query.depth(leaf))
        };
        if best.map(|(_, d)| depth > d).unwrap_or(true) {
            best = Some((node, depth));
        }
    }
    best.map(|(n, _)| n)
}

/// Schema node corresponding to a query node, following entry components
/// through list levels.
fn schema_at(schema: &Schema, query: &DataTree, qnode: usize) -> Option<usize> {
    schema.lookup(&query.path(qnode))
}

fn subtree_alternative(
    ctx: &Ctx,
    doc: &Document,
    elem: NodeId,
    flags: SchFlags,
    config_only: bool,
    fragments: &mut Vec<String>,
) -> Result<(), NcError> {
    let (mut query, qschema) =
        ctx.schema.xml_to_query(doc, elem, flags.with(SchFlags::STRIP_KEY))?;

    if let Some(qschema) = qschema {
        if ctx.schema.is_leaf(qschema) && !ctx.schema.is_readable(qschema) {
            let path = deepest_qnode(&query).map(|n| query.path(n)).unwrap_or_default();
            return Err(NcError::new(Tag::OperationNotSupported, ErrType::Application)
                .with_message(format!("NETCONF: Path \"{path}\" not readable")));
        }
    }

    widen_frontier(ctx.schema, &mut query, flags);
    audit_query(ctx, config_only, &query);

    let Some(mut result) = ctx.store.query_full(&query) else {
        debug!("subtree query matched nothing");
        return Ok(());
    };
    apply_defaults(ctx.schema, &query, &mut result, flags);
    fragments.extend(ctx.schema.tree_to_xml(&result, flags));
    Ok(())
}

fn xpath_alternative(
    ctx: &Ctx,
    path: &str,
    ns: Option<&str>,
    flags: SchFlags,
    config_only: bool,
    fragments: &mut Vec<String>,
) -> Result<(), NcError> {
    let translated = xpath::xpath_to_query(ctx.schema, ns, path);
    if translated.x_type == XpathType::Error {
        debug!("XPATH: malformed filter {path}");
        return Err(NcError::new(Tag::MalformedMessage, ErrType::Rpc)
            .with_message("XPATH: malformed filter"));
    }
    let Some(mut query) = translated.tree else {
        // an evaluate alternative with nothing to anchor on returns nothing
        return Ok(());
    };

    if let Some(qschema) = translated.qschema {
        if ctx.schema.is_leaf(qschema) && !ctx.schema.is_readable(qschema) {
            return Err(NcError::new(Tag::OperationNotSupported, ErrType::Application)
                .with_message(format!("NETCONF: Path \"{path}\" not readable")));
        }
    }

    if translated.x_type == XpathType::Simple {
        widen_frontier(ctx.schema, &mut query, flags);
        audit_query(ctx, config_only, &query);
    } else {
        audit_path(ctx, config_only, path);
    }

    let result = match translated.x_type {
        XpathType::Simple => ctx.store.query(&query),
        _ => ctx.store.query_full(&query),
    };
    let Some(mut result) = result else {
        debug!("xpath query matched nothing");
        return Ok(());
    };
    apply_defaults(ctx.schema, &query, &mut result, flags);

    if translated.x_type == XpathType::Simple {
        fragments.extend(ctx.schema.tree_to_xml(&result, flags));
        return Ok(());
    }

    // the evaluate pipeline works on the serialized XML wrapped in a
    // synthetic root
    let wrapped = format!("<root>{}</root>", ctx.schema.tree_to_xml(&result, flags).concat());
    let mut edoc = Document::parse(wrapped.as_bytes()).map_err(|err| {
        debug!("re-parsing evaluate fragment: {err:?}");
        NcError::new(Tag::OperationFailed, ErrType::Application)
    })?;
    let root = edoc.root().expect("wrapped document always has a root");

    let matches = xpath::evaluate(&edoc, root, path).ok_or_else(|| {
        NcError::new(Tag::OperationNotSupported, ErrType::Application)
            .with_message("NETCONF: XPATH invalid predicate")
    })?;
    if matches.is_empty() {
        debug!("XPATH: no match for {path}");
        return Ok(());
    }
    if xpath::keep_node_set(&mut edoc, ctx.schema, root, &matches) {
        for &kept in edoc.children(root) {
            if let Ok(xml) = edoc.serialize(kept) {
                fragments.push(xml);
            }
        }
    }
    Ok(())
}

/// Policy: a filter frontier without a value widens with a wildcard child
/// when the schema still has children there, so the whole subtree comes
/// back.
fn widen_frontier(schema: &Schema, query: &mut DataTree, flags: SchFlags) {
    if flags.has(SchFlags::DEPTH_ONE) {
        return;
    }
    let Some(qnode) = deepest_qnode(query) else { return };
    if !query.children(qnode).is_empty() || query.value(qnode).is_some() {
        return;
    }
    let Some(snode) = schema_at(schema, query, qnode) else { return };
    if schema.has_children(snode) {
        query.append(qnode, "*");
    }
}

fn audit_query(ctx: &Ctx, config_only: bool, query: &DataTree) {
    let flag = if config_only { audit::Flags::GET_CONFIG } else { audit::Flags::GET };
    if !ctx.audit.enabled(flag) {
        return;
    }
    for path in query.frontier_paths() {
        audit_path(ctx, config_only, &path);
    }
}

fn audit_path(ctx: &Ctx, config_only: bool, path: &str) {
    let flag = if config_only { audit::Flags::GET_CONFIG } else { audit::Flags::GET };
    if !ctx.audit.enabled(flag) {
        return;
    }
    info!(
        target: "audit",
        "{}: {}@{} id:{} path:{}",
        if config_only { "GET-CONFIG" } else { "GET" },
        ctx.session.info.username,
        ctx.session.info.rem_addr,
        ctx.session.id,
        path
    );
}

/// Walk query and result in parallel and apply defaults handling at the
/// query frontiers, where whole subtrees are being returned.
fn apply_defaults(schema: &Schema, query: &DataTree, result: &mut DataTree, flags: SchFlags) {
    let add = flags.has(SchFlags::ADD_DEFAULTS);
    let trim = flags.has(SchFlags::TRIM_DEFAULTS);
    if !add && !trim {
        return;
    }
    for &qtop in query.children(tree::ROOT) {
        let Some(snode) = schema.root_by_name(query.name(qtop)) else { continue };
        let Some(rtop) = result.find_child(tree::ROOT, query.name(qtop)) else { continue };
        defaults_walk(schema, query, qtop, result, rtop, snode, add);
    }
}

fn is_frontier(query: &DataTree, qnode: usize) -> bool {
    let children = query.children(qnode);
    match children {
        [] => query.value(qnode).is_none(),
        [only] => query.name(*only) == "*" && query.children(*only).is_empty(),
        _ => false,
    }
}

fn defaults_walk(
    schema: &Schema,
    query: &DataTree,
    qnode: usize,
    result: &mut DataTree,
    rnode: usize,
    snode: usize,
    add: bool,
) {
    if is_frontier(query, qnode) {
        if schema.is_leaf(snode) {
            if !add {
                if let (Some(v), Some(d)) = (result.value(rnode), schema.default_value(snode)) {
                    if v == d {
                        result.detach(rnode);
                    }
                }
            }
        } else if add {
            schema.add_defaults(result, rnode, snode);
        } else {
            schema.trim_defaults(result, rnode, snode);
        }
        return;
    }

    let qchildren: Vec<usize> = query.children(qnode).to_vec();
    for qchild in qchildren {
        let qname = query.name(qchild).to_string();
        if qname == "*" {
            let rchildren: Vec<usize> = result.children(rnode).to_vec();
            for rchild in rchildren {
                let next = if schema.is_list(snode) {
                    schema.child(snode, "*")
                } else {
                    schema.child(snode, result.name(rchild))
                };
                if let Some(next) = next {
                    defaults_walk(schema, query, qchild, result, rchild, next, add);
                }
            }
            continue;
        }
        let next = match schema.child(snode, &qname) {
            Some(c) => Some(c),
            // an entry component under a list level
            None if schema.is_list(snode) => schema.child(snode, "*"),
            None => None,
        };
        let (Some(next), Some(rchild)) = (next, result.find_child(rnode, &qname)) else {
            continue;
        };
        defaults_walk(schema, query, qchild, result, rchild, next, add);
    }
}
