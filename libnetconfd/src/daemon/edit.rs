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

//! The edit pipeline behind `edit-config`: validate the request envelope,
//! translate `<config>` into typed mutations, run the pre-flight existence
//! checks, then prune and set in the order that makes replace semantics
//! come out right.

use tracing::{debug, info};

use crate::audit;
use crate::error::{ErrType, NcError, Tag};
use crate::xml::{Document, NodeId};

use super::server::{Ctx, ReplyBody};

pub(crate) fn handle(ctx: &Ctx, doc: &Document, rpc: NodeId) -> Result<ReplyBody, NcError> {
    let action = doc.first_child(rpc).expect("dispatcher always hands over an operation");

    // the only writable target is the running datastore
    let target_ok = doc
        .find_child(action, "target")
        .and_then(|t| doc.first_child(t))
        .map(|d| doc.name(d) == "running")
        .unwrap_or(false);
    if !target_ok {
        let datastore = doc
            .find_child(action, "target")
            .and_then(|t| doc.first_child(t))
            .map(|d| doc.name(d))
            .unwrap_or("none");
        return Err(NcError::new(Tag::OperationNotSupported, ErrType::Protocol)
            .with_message(format!("Datastore \"{datastore}\" not supported")));
    }

    let def_op = match doc.find_child(action, "default-operation") {
        None => "merge",
        Some(node) => match doc.text(node) {
            op @ ("merge" | "replace" | "none") => op,
            _ => {
                return Err(NcError::new(Tag::InvalidValue, ErrType::Protocol)
                    .with_message("Invalid value for default-operation parameter"));
            }
        },
    };

    if let Some(owner) = ctx.table.locked_by_other(ctx.session.id) {
        debug!("lock is held by session {}", owner);
        return Err(NcError::new(Tag::InUse, ErrType::Application)
            .with_message("Lock is already held")
            .with_session_id(owner));
    }

    let config = doc.find_child(action, "config").ok_or_else(|| {
        NcError::new(Tag::MissingElement, ErrType::Protocol)
            .with_message("Missing config element")
            .with_bad_element("config")
    })?;
    let Some(payload) = doc.first_child(config) else {
        // nothing to merge is still a success
        return Ok(ReplyBody::Ok);
    };

    let parms = ctx.schema.xml_to_edit(doc, payload, def_op)?;

    // pre-flight existence checks; the first failure is the reply
    for path in &parms.deletes {
        if ctx.store.get_tree(path).is_none() {
            debug!("delete pre-check failed, no data at {path}");
            return Err(NcError::new(Tag::DataMissing, ErrType::Application));
        }
    }
    for (path, _) in &parms.creates {
        if ctx.store.get_tree(path).is_some() {
            debug!("create pre-check failed, data exists at {path}");
            return Err(NcError::new(Tag::DataExists, ErrType::Application));
        }
    }

    // prune before set so replace establishes the new subtree
    for path in &parms.deletes {
        ctx.store.prune(path);
    }
    for path in &parms.removes {
        ctx.store.prune(path);
    }
    for (path, _) in &parms.replaces {
        ctx.store.prune(path);
    }

    // re-verify creates right before the write
    for (path, _) in &parms.creates {
        if ctx.store.get(path).is_some() {
            debug!("create conflicted at {path}");
            return Err(NcError::new(Tag::DataExists, ErrType::Application));
        }
    }

    for (path, condition) in &parms.conditions {
        if !ctx.schema.process_condition(&parms.tree, path, condition) {
            info!("edit-config path {} failed condition {}", path, condition);
            return Err(NcError::new(Tag::InvalidValue, ErrType::Protocol));
        }
    }

    if parms.need_tree_set && !parms.tree.is_empty() && !ctx.store.set_tree(&parms.tree) {
        return Err(NcError::new(Tag::OperationFailed, ErrType::Application));
    }

    if ctx.audit.enabled(audit::Flags::EDIT_CONFIG) {
        let who = (
            ctx.session.info.username.as_str(),
            ctx.session.info.rem_addr.as_str(),
            ctx.session.id,
        );
        for path in &parms.deletes {
            info!(target: "audit", "EDIT-CONFIG: {}@{} id:{} delete:{}", who.0, who.1, who.2, path);
        }
        for path in &parms.removes {
            info!(target: "audit", "EDIT-CONFIG: {}@{} id:{} remove:{}", who.0, who.1, who.2, path);
        }
        for (path, value) in &parms.creates {
            info!(target: "audit", "EDIT-CONFIG: {}@{} id:{} create:{}={}", who.0, who.1, who.2, path, value);
        }
        for (path, value) in &parms.merges {
            info!(target: "audit", "EDIT-CONFIG: {}@{} id:{} merge:{}={}", who.0, who.1, who.2, path, value);
        }
        for (path, value) in &parms.replaces {
            info!(target: "audit", "EDIT-CONFIG: {}@{} id:{} replace:{}={}", who.0, who.1, who.2, path, value);
        }
    }

    Ok(ReplyBody::Ok)
}
