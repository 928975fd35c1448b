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

//! End to end session tests: a real worker thread on one end of a
//! socketpair, the test client on the other.

use std::sync::atomic::Ordering;

use ntest::timeout;

mod support;
use support::{daemon, wait_for, Client};

#[test]
#[timeout(30000)]
fn hello_negotiation_succeeds_with_base_11() {
    let d = daemon();
    let mut client = Client::connect(&d);

    let hello = client.read_hello().expect("server hello");
    assert!(hello.contains("<capability>urn:ietf:params:netconf:base:1.1</capability>"));
    assert!(hello.contains("urn:example:if?module=example-if&amp;revision=2024-01-10"));
    assert!(client.session_id() > 0);

    client.send_client_hello("urn:ietf:params:netconf:base:1.1");
    let reply = client
        .rpc(r#"<rpc message-id="1" xmlns="urn:ietf:params:xml:ns:netconf:base:1.0"><get/></rpc>"#)
        .expect("session proceeds");
    assert!(reply.contains("<rpc-reply"));
}

#[test]
#[timeout(30000)]
fn hello_without_base_11_closes_the_session() {
    let d = daemon();
    let mut client = Client::connect(&d);
    client.read_hello().expect("server hello");
    client.send_client_hello("urn:ietf:params:netconf:base:1.0");

    assert!(client.at_eof());
    wait_for(|| d.table.stats.in_bad_hellos.load(Ordering::Relaxed) == 1, "in_bad_hellos");
    wait_for(|| d.table.num_sessions() == 0, "session teardown");
}

#[test]
#[timeout(30000)]
fn get_with_subtree_filter_returns_list_keys() {
    let d = daemon();
    d.store.set("/interfaces/interface/eth0/name", "eth0");
    d.store.set("/interfaces/interface/eth1/name", "eth1");

    let mut client = Client::connect(&d);
    client.handshake();
    let reply = client
        .rpc(
            r#"<rpc message-id="1" xmlns="urn:ietf:params:xml:ns:netconf:base:1.0"><get><filter type="subtree"><interfaces xmlns="urn:example:if"><interface><name/></interface></interfaces></filter></get></rpc>"#,
        )
        .expect("reply");
    assert!(reply.contains("message-id=\"1\""));
    assert!(reply.contains(
        "<data><interfaces xmlns=\"urn:example:if\"><interface><name>eth0</name></interface><interface><name>eth1</name></interface></interfaces></data>"
    ));
}

#[test]
#[timeout(30000)]
fn get_without_filter_returns_every_root_subtree() {
    let d = daemon();
    d.store.set("/interfaces/interface/eth0/name", "eth0");
    d.store.set("/system/hostname", "router");

    let mut client = Client::connect(&d);
    client.handshake();
    let reply = client
        .rpc(r#"<rpc message-id="5" xmlns="urn:ietf:params:xml:ns:netconf:base:1.0"><get/></rpc>"#)
        .expect("reply");
    assert!(reply.contains("<interfaces xmlns=\"urn:example:if\">"));
    assert!(reply.contains("<hostname>router</hostname>"));
}

#[test]
#[timeout(30000)]
fn get_config_filters_out_state_leaves() {
    let d = daemon();
    d.store.set("/interfaces/interface/eth0/name", "eth0");
    d.store.set("/interfaces/interface/eth0/status", "up");

    let mut client = Client::connect(&d);
    client.handshake();
    let reply = client
        .rpc(
            r#"<rpc message-id="2" xmlns="urn:ietf:params:xml:ns:netconf:base:1.0"><get-config><source><running/></source><filter type="subtree"><interfaces xmlns="urn:example:if"/></filter></get-config></rpc>"#,
        )
        .expect("reply");
    assert!(reply.contains("<name>eth0</name>"));
    assert!(!reply.contains("<status>"));
}

#[test]
#[timeout(30000)]
fn get_config_rejects_non_running_source() {
    let d = daemon();
    let mut client = Client::connect(&d);
    client.handshake();
    let reply = client
        .rpc(
            r#"<rpc message-id="3" xmlns="urn:ietf:params:xml:ns:netconf:base:1.0"><get-config><source><candidate/></source></get-config></rpc>"#,
        )
        .expect("reply");
    assert!(reply.contains("<error-tag>operation-not-supported</error-tag>"));
    assert!(reply.contains("<error-type>protocol</error-type>"));
}

#[test]
#[timeout(30000)]
fn with_defaults_report_all_and_trim() {
    let d = daemon();
    d.store.set("/interfaces/interface/eth0/name", "eth0");

    let mut client = Client::connect(&d);
    client.handshake();
    let reply = client
        .rpc(
            r#"<rpc message-id="1" xmlns="urn:ietf:params:xml:ns:netconf:base:1.0"><get><filter type="subtree"><interfaces xmlns="urn:example:if"/></filter><with-defaults>report-all</with-defaults></get></rpc>"#,
        )
        .expect("reply");
    assert!(reply.contains("<mtu>1500</mtu>"));

    d.store.set("/interfaces/interface/eth0/mtu", "1500");
    let reply = client
        .rpc(
            r#"<rpc message-id="2" xmlns="urn:ietf:params:xml:ns:netconf:base:1.0"><get><filter type="subtree"><interfaces xmlns="urn:example:if"/></filter><with-defaults>trim</with-defaults></get></rpc>"#,
        )
        .expect("reply");
    assert!(!reply.contains("<mtu>"));

    let reply = client
        .rpc(
            r#"<rpc message-id="3" xmlns="urn:ietf:params:xml:ns:netconf:base:1.0"><get><with-defaults>bogus</with-defaults></get></rpc>"#,
        )
        .expect("reply");
    assert!(reply.contains("<error-tag>operation-not-supported</error-tag>"));
}

#[test]
#[timeout(30000)]
fn xpath_union_returns_both_subtrees_once() {
    let d = daemon();
    d.store.set("/interfaces/interface/eth0/name", "eth0");
    d.store.set("/system/hostname", "router");

    let mut client = Client::connect(&d);
    client.handshake();
    let reply = client
        .rpc(
            r#"<rpc message-id="4" xmlns="urn:ietf:params:xml:ns:netconf:base:1.0"><get><filter type="xpath" select="/eif:interfaces|/esys:system"/></get></rpc>"#,
        )
        .expect("reply");
    assert_eq!(reply.matches("<interfaces").count(), 1);
    assert_eq!(reply.matches("<hostname>router</hostname>").count(), 1);
}

#[test]
#[timeout(30000)]
fn xpath_missing_select_is_missing_attribute() {
    let d = daemon();
    let mut client = Client::connect(&d);
    client.handshake();
    let reply = client
        .rpc(
            r#"<rpc message-id="4" xmlns="urn:ietf:params:xml:ns:netconf:base:1.0"><get><filter type="xpath"/></get></rpc>"#,
        )
        .expect("reply");
    assert!(reply.contains("<error-tag>missing-attribute</error-tag>"));
    assert!(reply.contains("<bad-attribute>select</bad-attribute>"));
}

#[test]
#[timeout(30000)]
fn xpath_malformed_filter_counts_a_bad_rpc() {
    let d = daemon();
    let mut client = Client::connect(&d);
    client.handshake();
    let reply = client
        .rpc(
            r#"<rpc message-id="4" xmlns="urn:ietf:params:xml:ns:netconf:base:1.0"><get><filter type="xpath" select="/nosuch/path"/></get></rpc>"#,
        )
        .expect("reply");
    assert!(reply.contains("<error-tag>malformed-message</error-tag>"));
    assert!(reply.contains("<error-type>rpc</error-type>"));
    wait_for(|| d.table.stats.totals.in_bad_rpcs.load(Ordering::Relaxed) == 1, "in_bad_rpcs");
}

#[test]
#[timeout(30000)]
fn edit_config_create_conflict_reports_data_exists() {
    let d = daemon();
    d.store.set("/foo/bar", "x");

    let mut client = Client::connect(&d);
    client.handshake();
    let reply = client
        .rpc(
            r#"<rpc message-id="2" xmlns="urn:ietf:params:xml:ns:netconf:base:1.0" xmlns:nc="urn:ietf:params:xml:ns:netconf:base:1.0"><edit-config><target><running/></target><config><foo xmlns="urn:example:x"><bar nc:operation="create">y</bar></foo></config></edit-config></rpc>"#,
        )
        .expect("reply");
    assert!(reply.contains("<error-tag>data-exists</error-tag>"));
    assert!(reply.contains("<error-type>application</error-type>"));
    assert_eq!(d.store.get("/foo/bar").as_deref(), Some("x"));
}

#[test]
#[timeout(30000)]
fn edit_config_merge_is_idempotent() {
    let d = daemon();
    let mut client = Client::connect(&d);
    client.handshake();

    let edit = r#"<rpc message-id="1" xmlns="urn:ietf:params:xml:ns:netconf:base:1.0"><edit-config><target><running/></target><config><system xmlns="urn:example:sys"><hostname>core1</hostname></system></config></edit-config></rpc>"#;
    let reply = client.rpc(edit).expect("first merge");
    assert!(reply.contains("<ok/>"));
    assert_eq!(d.store.get("/system/hostname").as_deref(), Some("core1"));

    let reply = client.rpc(edit).expect("second merge");
    assert!(reply.contains("<ok/>"));
    assert_eq!(d.store.get("/system/hostname").as_deref(), Some("core1"));
}

#[test]
#[timeout(30000)]
fn edit_config_delete_and_remove_semantics_differ() {
    let d = daemon();
    let mut client = Client::connect(&d);
    client.handshake();

    // delete of absent data is an error
    let reply = client
        .rpc(
            r#"<rpc message-id="1" xmlns="urn:ietf:params:xml:ns:netconf:base:1.0" xmlns:nc="urn:ietf:params:xml:ns:netconf:base:1.0"><edit-config><target><running/></target><config><system xmlns="urn:example:sys"><hostname nc:operation="delete"/></system></config></edit-config></rpc>"#,
        )
        .expect("reply");
    assert!(reply.contains("<error-tag>data-missing</error-tag>"));

    // remove of absent data is fine
    let reply = client
        .rpc(
            r#"<rpc message-id="2" xmlns="urn:ietf:params:xml:ns:netconf:base:1.0" xmlns:nc="urn:ietf:params:xml:ns:netconf:base:1.0"><edit-config><target><running/></target><config><system xmlns="urn:example:sys"><hostname nc:operation="remove"/></system></config></edit-config></rpc>"#,
        )
        .expect("reply");
    assert!(reply.contains("<ok/>"));
}

#[test]
#[timeout(30000)]
fn edit_config_requires_config_element() {
    let d = daemon();
    let mut client = Client::connect(&d);
    client.handshake();
    let reply = client
        .rpc(
            r#"<rpc message-id="1" xmlns="urn:ietf:params:xml:ns:netconf:base:1.0"><edit-config><target><running/></target></edit-config></rpc>"#,
        )
        .expect("reply");
    assert!(reply.contains("<error-tag>missing-element</error-tag>"));
    assert!(reply.contains("<bad-element>config</bad-element>"));
}

#[test]
#[timeout(30000)]
fn edit_config_unknown_default_operation_is_invalid_value() {
    let d = daemon();
    let mut client = Client::connect(&d);
    client.handshake();
    let reply = client
        .rpc(
            r#"<rpc message-id="1" xmlns="urn:ietf:params:xml:ns:netconf:base:1.0"><edit-config><target><running/></target><default-operation>overwrite</default-operation><config><system xmlns="urn:example:sys"><hostname>x</hostname></system></config></edit-config></rpc>"#,
        )
        .expect("reply");
    assert!(reply.contains("<error-tag>invalid-value</error-tag>"));
}

#[test]
#[timeout(30000)]
fn lock_contention_follows_s4() {
    let d = daemon();
    let mut a = Client::connect(&d);
    a.handshake();
    let mut b = Client::connect(&d);
    b.handshake();

    let lock = r#"<rpc message-id="1" xmlns="urn:ietf:params:xml:ns:netconf:base:1.0"><lock><target><running/></target></lock></rpc>"#;
    let reply = a.rpc(lock).expect("A locks");
    assert!(reply.contains("<ok/>"));
    let a_id = a.session_id();

    let reply = b.rpc(lock).expect("B denied");
    assert!(reply.contains("<error-tag>lock-denied</error-tag>"));
    assert!(reply.contains(&format!("<session-id>{a_id}</session-id>")));

    // get-config from the non-owner is refused with in-use
    let reply = b
        .rpc(
            r#"<rpc message-id="2" xmlns="urn:ietf:params:xml:ns:netconf:base:1.0"><get-config><source><running/></source></get-config></rpc>"#,
        )
        .expect("B get-config");
    assert!(reply.contains("<error-tag>in-use</error-tag>"));

    // A closes; the lock releases and B can take it
    let reply = a
        .rpc(r#"<rpc message-id="3" xmlns="urn:ietf:params:xml:ns:netconf:base:1.0"><close-session/></rpc>"#)
        .expect("A closes");
    assert!(reply.contains("<ok/>"));
    wait_for(|| d.table.lock_owner().is_none(), "lock release");

    let reply = b.rpc(lock).expect("B locks");
    assert!(reply.contains("<ok/>"));
}

#[test]
#[timeout(30000)]
fn unlock_without_lock_and_wrong_owner() {
    let d = daemon();
    let mut a = Client::connect(&d);
    a.handshake();
    let mut b = Client::connect(&d);
    b.handshake();

    let unlock = r#"<rpc message-id="1" xmlns="urn:ietf:params:xml:ns:netconf:base:1.0"><unlock><target><running/></target></unlock></rpc>"#;
    let reply = a.rpc(unlock).expect("unlock unlocked");
    assert!(reply.contains("<error-tag>operation-failed</error-tag>"));

    let lock = r#"<rpc message-id="2" xmlns="urn:ietf:params:xml:ns:netconf:base:1.0"><lock><target><running/></target></lock></rpc>"#;
    assert!(a.rpc(lock).expect("A locks").contains("<ok/>"));
    let reply = b.rpc(unlock).expect("B unlock denied");
    assert!(reply.contains("<error-tag>lock-denied</error-tag>"));

    assert!(a.rpc(unlock).expect("A unlocks").contains("<ok/>"));
}

#[test]
#[timeout(30000)]
fn chunk_too_big_errors_and_drops() {
    let d = daemon();
    let mut client = Client::connect(&d);
    client.handshake();

    let mut wire = b"\n#40000\n".to_vec();
    wire.extend_from_slice(&vec![b'x'; 40000]);
    client.send_raw(&wire).expect("send oversized chunk");

    let reply = client.read_reply().expect("too-big error");
    assert!(reply.contains("<error-tag>too-big</error-tag>"));
    assert!(reply.contains("<error-type>application</error-type>"));
    assert!(client.at_eof());
    wait_for(|| d.table.num_sessions() == 0, "session drop");
}

#[test]
#[timeout(30000)]
fn kill_session_self_is_invalid_value() {
    let d = daemon();
    let mut client = Client::connect(&d);
    client.handshake();
    let id = client.session_id();

    let reply = client
        .rpc(&format!(
            r#"<rpc message-id="1" xmlns="urn:ietf:params:xml:ns:netconf:base:1.0"><kill-session><session-id>{id}</session-id></kill-session></rpc>"#
        ))
        .expect("reply");
    assert!(reply.contains("<error-tag>invalid-value</error-tag>"));

    // session remains usable
    let reply = client
        .rpc(r#"<rpc message-id="2" xmlns="urn:ietf:params:xml:ns:netconf:base:1.0"><get/></rpc>"#)
        .expect("still open");
    assert!(reply.contains("<rpc-reply"));
}

#[test]
#[timeout(30000)]
fn kill_session_terminates_the_victim() {
    let d = daemon();
    let mut a = Client::connect(&d);
    a.handshake();
    let mut b = Client::connect(&d);
    b.handshake();
    let b_id = b.session_id();

    let reply = a
        .rpc(&format!(
            r#"<rpc message-id="1" xmlns="urn:ietf:params:xml:ns:netconf:base:1.0"><kill-session><session-id>{b_id}</session-id></kill-session></rpc>"#
        ))
        .expect("reply");
    assert!(reply.contains("<ok/>"));
    assert!(b.at_eof());
    wait_for(|| d.table.num_sessions() == 1, "victim teardown");

    // killing an unknown id is invalid-value
    let reply = a
        .rpc(
            r#"<rpc message-id="2" xmlns="urn:ietf:params:xml:ns:netconf:base:1.0"><kill-session><session-id>99999</session-id></kill-session></rpc>"#,
        )
        .expect("reply");
    assert!(reply.contains("<error-tag>invalid-value</error-tag>"));

    let reply = a
        .rpc(r#"<rpc message-id="3" xmlns="urn:ietf:params:xml:ns:netconf:base:1.0"><kill-session/></rpc>"#)
        .expect("reply");
    assert!(reply.contains("<error-tag>missing-element</error-tag>"));
}

#[test]
#[timeout(30000)]
fn missing_message_id_drops_the_session() {
    let d = daemon();
    let mut client = Client::connect(&d);
    client.handshake();

    let reply = client
        .rpc(r#"<rpc xmlns="urn:ietf:params:xml:ns:netconf:base:1.0"><get/></rpc>"#)
        .expect("error reply");
    assert!(reply.contains("<error-tag>missing-attribute</error-tag>"));
    assert!(reply.contains("<bad-attribute>message-id</bad-attribute>"));
    assert!(reply.contains("<bad-element>rpc</bad-element>"));
    assert!(client.at_eof());
}

#[test]
#[timeout(30000)]
fn unknown_rpc_keeps_the_session_alive() {
    let d = daemon();
    let mut client = Client::connect(&d);
    client.handshake();

    let reply = client
        .rpc(r#"<rpc message-id="1" xmlns="urn:ietf:params:xml:ns:netconf:base:1.0"><make-coffee/></rpc>"#)
        .expect("error reply");
    assert!(reply.contains("<error-tag>operation-not-supported</error-tag>"));

    let reply = client
        .rpc(r#"<rpc message-id="2" xmlns="urn:ietf:params:xml:ns:netconf:base:1.0"><get/></rpc>"#)
        .expect("still open");
    assert!(reply.contains("<rpc-reply"));
}

#[test]
#[timeout(30000)]
fn admission_control_drops_over_limit_sessions() {
    let d = daemon();
    d.store.set("/netconf/config/max-sessions", "1");
    assert_eq!(d.table.max_sessions(), 1);

    let mut a = Client::connect(&d);
    a.handshake();
    // make sure A is fully admitted before racing B in
    wait_for(|| d.table.num_sessions() == 1, "A admitted");

    let mut b = Client::connect(&d);
    assert!(b.read_hello().is_err());
    wait_for(
        || d.table.stats.dropped_sessions.load(Ordering::Relaxed) == 1,
        "dropped_sessions",
    );
}

#[test]
#[timeout(30000)]
fn published_session_state_appears_in_the_store() {
    let d = daemon();
    let mut client = Client::connect(&d);
    client.handshake();
    wait_for(|| d.table.num_sessions() == 1, "session up");
    let id = client.session_id();

    let username = d.store.get(&format!("/netconf-state/sessions/session/{id}/username"));
    assert!(username.is_some());
    assert_eq!(
        d.store
            .get(&format!("/netconf-state/sessions/session/{id}/transport"))
            .as_deref(),
        Some("netconf-ssh")
    );
    assert!(d.store.get("/netconf-state/statistics/netconf-start-time").is_some());
    assert_eq!(d.store.get("/netconf/state/max-sessions").as_deref(), Some("4"));
}

#[test]
#[timeout(30000)]
fn status_inactive_write_clears_the_session() {
    let d = daemon();
    let mut client = Client::connect(&d);
    client.handshake();
    wait_for(|| d.table.num_sessions() == 1, "session up");
    let id = client.session_id();

    d.store.set(&format!("/netconf-state/sessions/session/{id}/status"), "inactive");
    assert!(client.at_eof());
    wait_for(|| d.table.num_sessions() == 0, "session cleared");

    // clearing an unknown session writes "unknown" back into the status
    // leaf; observe the write through a watch since the next publisher
    // refresh prunes it again
    let seen = std::sync::Arc::new(std::sync::Mutex::new(Vec::<String>::new()));
    let sink = std::sync::Arc::clone(&seen);
    d.store.watch(
        "/netconf-state/sessions/session/*/status",
        std::sync::Arc::new(move |_path, value| {
            if let Some(value) = value {
                sink.lock().unwrap().push(value.to_string());
            }
            true
        }),
    );
    d.store.set("/netconf-state/sessions/session/424242/status", "inactive");
    wait_for(
        || seen.lock().unwrap().iter().any(|v| v == "unknown"),
        "unknown write-back",
    );
}
