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

//! Reply document builders. Every message the server sends is produced
//! here: the hello, `<ok/>`, `<data>` and the single `<rpc-error>` shape
//! driven by an [`NcError`] value.

use quick_xml::escape::escape;

use crate::consts;
use crate::error::{NcError, Tag};
use crate::schema::Schema;
use crate::xml::{self, Document};

fn reply_open(msg_id: Option<&str>) -> String {
    match msg_id {
        Some(id) => format!(
            "<rpc-reply xmlns=\"{}\" message-id=\"{}\">",
            consts::BASE_1_0_NS,
            escape(id)
        ),
        None => format!("<rpc-reply xmlns=\"{}\">", consts::BASE_1_0_NS),
    }
}

pub fn rpc_ok(msg_id: Option<&str>) -> String {
    xml::document_string(&format!("{}<ok/></rpc-reply>", reply_open(msg_id)))
}

/// All the alternatives' fragments concatenate as children of one `<data>`.
pub fn rpc_data(msg_id: Option<&str>, fragments: &[String]) -> String {
    let mut body = reply_open(msg_id);
    if fragments.iter().all(|f| f.is_empty()) {
        body.push_str("<data/>");
    } else {
        body.push_str("<data>");
        for fragment in fragments {
            body.push_str(fragment);
        }
        body.push_str("</data>");
    }
    body.push_str("</rpc-reply>");
    xml::document_string(&body)
}

pub fn rpc_error(msg_id: Option<&str>, err: &NcError) -> String {
    let mut doc = Document::new();
    let root = doc.new_root("rpc-reply");
    doc.push_ns(root, None, consts::BASE_1_0_NS);
    if let Some(id) = msg_id {
        doc.push_attr(root, "message-id", id);
    }
    let error = doc.append_child(root, "rpc-error");

    let tag = doc.append_child(error, "error-tag");
    doc.set_text(tag, err.tag.as_str());
    let typ = doc.append_child(error, "error-type");
    doc.set_text(typ, err.typ.as_str());
    let severity = doc.append_child(error, "error-severity");
    doc.set_text(severity, "error");
    let message = doc.append_child(error, "error-message");
    doc.push_attr(message, "xml:lang", "en");
    doc.set_text(message, err.message());

    // The error-info shape depends on the tag. Pairs are all or nothing:
    // an attribute error without its element (or vice versa) emits no info.
    let info = &err.info;
    if !info.is_empty() {
        let info_el = doc.append_child(error, "error-info");
        match err.tag {
            Tag::UnknownNamespace => {
                if let (Some(ns), Some(elem)) = (&info.bad_namespace, &info.bad_element) {
                    let e = doc.append_child(info_el, "bad-namespace");
                    doc.set_text(e, ns.clone());
                    let e = doc.append_child(info_el, "bad-element");
                    doc.set_text(e, elem.clone());
                }
            }
            Tag::InUse | Tag::LockDenied => {
                if let Some(id) = info.session_id {
                    let e = doc.append_child(info_el, "session-id");
                    doc.set_text(e, id.to_string());
                }
            }
            Tag::MissingAttribute | Tag::BadAttribute | Tag::UnknownAttribute => {
                if let (Some(attr), Some(elem)) = (&info.bad_attribute, &info.bad_element) {
                    let e = doc.append_child(info_el, "bad-attribute");
                    doc.set_text(e, attr.clone());
                    let e = doc.append_child(info_el, "bad-element");
                    doc.set_text(e, elem.clone());
                }
            }
            Tag::MissingElement | Tag::BadElement | Tag::UnknownElement => {
                if let Some(elem) = &info.bad_element {
                    let e = doc.append_child(info_el, "bad-element");
                    doc.set_text(e, elem.clone());
                }
            }
            _ => {}
        }
        if doc.children(info_el).is_empty() {
            doc.detach(info_el);
        }
    }

    xml::document_string(&doc.serialize(root).unwrap_or_default())
}

/// The server hello: base capabilities, one capability per loaded model,
/// and our session id.
pub fn hello(schema: &Schema, session_id: u32) -> String {
    let mut doc = Document::new();
    let root = doc.new_root("hello");
    doc.push_ns(root, None, consts::BASE_1_0_NS);
    let caps = doc.append_child(root, "capabilities");

    for cap in [
        consts::BASE_1_1_CAP,
        consts::XPATH_CAP,
        consts::WRITABLE_RUNNING_CAP,
        consts::WITH_DEFAULTS_CAP,
    ] {
        let c = doc.append_child(caps, "capability");
        doc.set_text(c, cap);
    }

    for model in schema.models() {
        if model.organization.is_empty() || model.version.is_empty() || model.model.is_empty() {
            continue;
        }
        let mut cap =
            format!("{}?module={}&revision={}", model.ns_href, model.model, model.version);
        if let Some(features) = &model.features {
            cap.push_str(&format!("&features={features}"));
        }
        if let Some(deviations) = &model.deviations {
            cap.push_str(&format!("&deviations={deviations}"));
        }
        let c = doc.append_child(caps, "capability");
        doc.set_text(c, cap);
    }

    let sid = doc.append_child(root, "session-id");
    doc.set_text(sid, session_id.to_string());

    xml::document_string(&doc.serialize(root).unwrap_or_default())
}

/// The reply is accepted iff the capabilities list contains base:1.1.
pub fn validate_hello(payload: &[u8]) -> bool {
    let Ok(doc) = Document::parse(payload) else {
        return false;
    };
    let Some(root) = doc.root() else { return false };
    if doc.name(root) != "hello" {
        return false;
    }
    let Some(caps) = doc.find_child(root, "capabilities") else {
        return false;
    };
    doc.children(caps)
        .iter()
        .any(|&c| doc.name(c) == "capability" && doc.text(c) == consts::BASE_1_1_CAP)
}
