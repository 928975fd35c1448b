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

//! The server proper: accepts connections handed over by the transport
//! front-end, runs admission control, and gives every session its own
//! worker that speaks the hello exchange and then dispatches chunked RPCs
//! until the peer goes away.

use std::os::unix::net::{UnixListener, UnixStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;

use anyhow::Context;
use tracing::{debug, error, info, instrument, span, Level};

use crate::audit::{self, AuditLog};
use crate::consts;
use crate::error::{ErrType, NcError, Tag};
use crate::schema::Schema;
use crate::store::Store;
use crate::user;
use crate::xml::Document;

use super::edit;
use super::framer::{Framer, RecvError};
use super::get;
use super::reply;
use super::session::{Session, SessionTable, UnlockError};

/// What a handler hands back for the worker to frame and send.
pub(crate) enum ReplyBody {
    Ok,
    Data(Vec<String>),
}

/// Everything a handler needs, borrowed for the duration of one RPC.
pub(crate) struct Ctx<'a> {
    pub schema: &'a Schema,
    pub store: &'a dyn Store,
    pub table: &'a SessionTable,
    pub audit: &'a AuditLog,
    pub session: &'a Session,
}

pub struct Server {
    schema: Arc<Schema>,
    store: Arc<dyn Store>,
    table: Arc<SessionTable>,
    audit: Arc<AuditLog>,
    running: Arc<AtomicBool>,
}

/// Removes the session from the table (releasing the lock if held) no
/// matter which path the worker leaves through.
struct SessionGuard<'a> {
    table: &'a SessionTable,
    id: u32,
}

impl Drop for SessionGuard<'_> {
    fn drop(&mut self) {
        self.table.remove(self.id);
        debug!("session {} terminated", self.id);
    }
}

impl Server {
    pub fn new(
        schema: Arc<Schema>,
        store: Arc<dyn Store>,
        table: Arc<SessionTable>,
        audit: Arc<AuditLog>,
    ) -> Arc<Self> {
        Arc::new(Server {
            schema,
            store,
            table,
            audit,
            running: Arc::new(AtomicBool::new(true)),
        })
    }

    pub fn table(&self) -> &Arc<SessionTable> {
        &self.table
    }

    pub fn running_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.running)
    }

    fn running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Begin cooperative shutdown: clear the run flag and half-close every
    /// session so blocked workers wake up and drain.
    pub fn shutdown(&self) {
        self.running.store(false, Ordering::SeqCst);
        self.table.shutdown_all();
    }

    #[instrument(skip_all)]
    pub fn serve(server: Arc<Self>, listener: UnixListener) -> anyhow::Result<()> {
        for stream in listener.incoming() {
            if !server.running() {
                break;
            }
            match stream {
                Ok(stream) => {
                    let server = Arc::clone(&server);
                    thread::spawn(move || {
                        if let Err(err) = server.handle_session(stream) {
                            error!("handling session: {:?}", err);
                        }
                    });
                }
                Err(err) => {
                    error!("accepting stream: {:?}", err);
                }
            }
        }
        Ok(())
    }

    /// Run one session to completion on the calling thread. The transport
    /// front-end (or a test) may call this directly with any connected
    /// stream.
    #[instrument(skip_all)]
    pub fn handle_session(&self, stream: UnixStream) -> anyhow::Result<()> {
        let stats = &self.table.stats;
        let info = user::peer_info(&stream).unwrap_or_default();
        let session =
            self.table.register(&stream, info).context("registering session")?;
        let _guard = SessionGuard { table: &self.table, id: session.id };
        let _span = span!(Level::INFO, "session", sid = session.id).entered();

        if !self.running() || self.table.over_limit() {
            info!("dropping session {}, admission refused", session.id);
            stats.dropped_sessions.fetch_add(1, Ordering::Relaxed);
            return Ok(());
        }

        if stream.set_read_timeout(Some(consts::RECV_TIMEOUT)).is_err() {
            stats.dropped_sessions.fetch_add(1, Ordering::Relaxed);
            return Ok(());
        }

        let mut framer = Framer::new(stream);

        // RFC 6241 section 8.1, the server hello goes out first
        let hello = reply::hello(&self.schema, session.id);
        if !self.running() || framer.send_hello(hello.as_bytes()).is_err() {
            stats.dropped_sessions.fetch_add(1, Ordering::Relaxed);
            return Ok(());
        }

        match framer.recv_hello(&self.running) {
            Ok(payload) if self.running() && reply::validate_hello(&payload) => {
                debug!("received valid hello");
            }
            _ => {
                info!("hello exchange failed");
                stats.in_bad_hellos.fetch_add(1, Ordering::Relaxed);
                return Ok(());
            }
        }

        self.rpc_loop(&mut framer, &session);
        Ok(())
    }

    fn rpc_loop(&self, framer: &mut Framer<UnixStream>, session: &Session) {
        let stats = &self.table.stats;
        loop {
            if !self.running() {
                stats.dropped_sessions.fetch_add(1, Ordering::Relaxed);
                break;
            }
            let message = match framer.recv_message(&self.running) {
                Ok(message) => message,
                Err(RecvError::TooBig) => {
                    let err = NcError::new(Tag::TooBig, ErrType::Application).with_message(
                        "NETCONF: The request is too large for the implementation to handle.",
                    );
                    self.send_error(framer, session, None, &err);
                    stats.dropped_sessions.fetch_add(1, Ordering::Relaxed);
                    break;
                }
                Err(_) => {
                    stats.dropped_sessions.fetch_add(1, Ordering::Relaxed);
                    break;
                }
            };

            let doc = match Document::parse(&message) {
                Ok(doc) => doc,
                Err(err) => {
                    error!("XML: invalid netconf message: {err:?}");
                    stats.dropped_sessions.fetch_add(1, Ordering::Relaxed);
                    break;
                }
            };
            let root = match doc.root() {
                Some(root) if doc.name(root) == "rpc" => root,
                _ => {
                    error!("XML: no root RPC element");
                    stats.dropped_sessions.fetch_add(1, Ordering::Relaxed);
                    break;
                }
            };
            let Some(op) = doc.first_child(root) else {
                error!("XML: no RPC child element");
                stats.dropped_sessions.fetch_add(1, Ordering::Relaxed);
                break;
            };
            let Some(msg_id) = doc.attr(root, "message-id") else {
                let err = NcError::new(Tag::MissingAttribute, ErrType::Protocol)
                    .with_message("RPC missing message-id attribute")
                    .with_bad_element("rpc")
                    .with_bad_attribute("message-id");
                self.send_error(framer, session, None, &err);
                stats.dropped_sessions.fetch_add(1, Ordering::Relaxed);
                break;
            };

            let ctx = Ctx {
                schema: &self.schema,
                store: self.store.as_ref(),
                table: &self.table,
                audit: &self.audit,
                session,
            };

            debug!("handle RPC {}", doc.name(op));
            let result = match doc.name(op) {
                "close-session" => {
                    if self.audit.enabled(audit::Flags::CLOSE_SESSION) {
                        info!(
                            target: "audit",
                            "CLOSE-SESSION: {}@{} id:{} closed",
                            session.info.username, session.info.rem_addr, session.id
                        );
                    }
                    // best effort, the peer may already be gone
                    let _ = framer.send(reply::rpc_ok(Some(msg_id)).as_bytes());
                    session.counters.in_rpcs.fetch_add(1, Ordering::Relaxed);
                    stats.totals.in_rpcs.fetch_add(1, Ordering::Relaxed);
                    break;
                }
                "kill-session" => handle_kill(&ctx, &doc, root),
                "get" => get::handle(&ctx, &doc, root, false),
                "get-config" => get::handle(&ctx, &doc, root, true),
                "edit-config" => edit::handle(&ctx, &doc, root),
                "lock" => handle_lock(&ctx, &doc, root),
                "unlock" => handle_unlock(&ctx, &doc, root),
                other => Err(NcError::new(Tag::OperationNotSupported, ErrType::Protocol)
                    .with_message(format!("Unknown RPC ({other})"))),
            };

            match result {
                Ok(body) => {
                    let xml = match body {
                        ReplyBody::Ok => reply::rpc_ok(Some(msg_id)),
                        ReplyBody::Data(fragments) => reply::rpc_data(Some(msg_id), &fragments),
                    };
                    if framer.send(xml.as_bytes()).is_err() {
                        stats.dropped_sessions.fetch_add(1, Ordering::Relaxed);
                        break;
                    }
                    session.counters.in_rpcs.fetch_add(1, Ordering::Relaxed);
                    stats.totals.in_rpcs.fetch_add(1, Ordering::Relaxed);
                }
                Err(err) => {
                    debug!("rpc failed: {err}");
                    // rpc-type errors are the bad-rpc counter's domain
                    if err.typ == ErrType::Rpc {
                        session.counters.in_bad_rpcs.fetch_add(1, Ordering::Relaxed);
                        stats.totals.in_bad_rpcs.fetch_add(1, Ordering::Relaxed);
                    }
                    if !self.send_error(framer, session, Some(msg_id), &err) {
                        stats.dropped_sessions.fetch_add(1, Ordering::Relaxed);
                        break;
                    }
                }
            }
        }
    }

    /// Send an rpc-error reply, counting it only when the write succeeds.
    fn send_error(
        &self,
        framer: &mut Framer<UnixStream>,
        session: &Session,
        msg_id: Option<&str>,
        err: &NcError,
    ) -> bool {
        let xml = reply::rpc_error(msg_id, err);
        match framer.send(xml.as_bytes()) {
            Ok(()) => {
                session.counters.out_rpc_errors.fetch_add(1, Ordering::Relaxed);
                self.table.stats.totals.out_rpc_errors.fetch_add(1, Ordering::Relaxed);
                true
            }
            Err(err) => {
                error!("TX failed sending rpc-error: {err}");
                false
            }
        }
    }
}

fn check_target_running(doc: &Document, action: crate::xml::NodeId) -> Result<(), NcError> {
    let datastore = doc
        .find_child(action, "target")
        .and_then(|t| doc.first_child(t))
        .map(|d| doc.name(d))
        .unwrap_or("none");
    if datastore == "running" {
        Ok(())
    } else {
        Err(NcError::new(Tag::OperationNotSupported, ErrType::Protocol)
            .with_message(format!("Datastore \"{datastore}\" not supported")))
    }
}

fn handle_lock(ctx: &Ctx, doc: &Document, rpc: crate::xml::NodeId) -> Result<ReplyBody, NcError> {
    let action = doc.first_child(rpc).expect("dispatcher always hands over an operation");
    check_target_running(doc, action)?;

    match ctx.table.lock_running(ctx.session.id) {
        Ok(()) => {
            if ctx.audit.enabled(audit::Flags::LOCK) {
                info!(
                    target: "audit",
                    "LOCK: {}@{} id:{}",
                    ctx.session.info.username, ctx.session.info.rem_addr, ctx.session.id
                );
            }
            Ok(ReplyBody::Ok)
        }
        Err(holder) => {
            debug!("lock denied, held by {}", holder);
            Err(NcError::new(Tag::LockDenied, ErrType::Protocol)
                .with_message(format!("Lock is already held by session id {holder}"))
                .with_session_id(holder))
        }
    }
}

fn handle_unlock(ctx: &Ctx, doc: &Document, rpc: crate::xml::NodeId) -> Result<ReplyBody, NcError> {
    let action = doc.first_child(rpc).expect("dispatcher always hands over an operation");
    check_target_running(doc, action)?;

    match ctx.table.unlock_running(ctx.session.id) {
        Ok(()) => {
            if ctx.audit.enabled(audit::Flags::UNLOCK) {
                info!(
                    target: "audit",
                    "UNLOCK: {}@{} id:{}",
                    ctx.session.info.username, ctx.session.info.rem_addr, ctx.session.id
                );
            }
            Ok(ReplyBody::Ok)
        }
        Err(UnlockError::NotLocked) => {
            Err(NcError::new(Tag::OperationFailed, ErrType::Protocol).with_message(
                "Unlock failed, no lock configured on the \"running\" datastore",
            ))
        }
        Err(UnlockError::NotOwner(holder)) => {
            Err(NcError::new(Tag::LockDenied, ErrType::Protocol)
                .with_message(format!(
                    "Unlock failed, session {} does not own the lock",
                    ctx.session.id
                ))
                .with_session_id(holder))
        }
    }
}

fn handle_kill(ctx: &Ctx, doc: &Document, rpc: crate::xml::NodeId) -> Result<ReplyBody, NcError> {
    let action = doc.first_child(rpc).expect("dispatcher always hands over an operation");
    let node = doc.find_child(action, "session-id").ok_or_else(|| {
        NcError::new(Tag::MissingElement, ErrType::Protocol)
            .with_message("Missing \"session-id\" element")
            .with_bad_element("session-id")
    })?;

    let victim_id = doc.text(node).parse::<u32>().unwrap_or(0);
    if victim_id == 0 {
        return Err(NcError::new(Tag::InvalidValue, ErrType::Protocol)
            .with_message("Invalid session ID - 0"));
    }
    if victim_id == ctx.session.id {
        return Err(NcError::new(Tag::InvalidValue, ErrType::Protocol)
            .with_message("Attempt to kill own session is forbidden"));
    }

    // half-close the victim; its worker exits through the normal EOF path
    let victim = ctx.table.kill(victim_id).ok_or_else(|| {
        NcError::new(Tag::InvalidValue, ErrType::Protocol)
            .with_message(format!("Session ID - {victim_id} not found!"))
    })?;

    if ctx.audit.enabled(audit::Flags::KILL_SESSION) {
        info!(
            target: "audit",
            "KILL-SESSION: {}@{} id:{} killed session {}@{} id:{}",
            ctx.session.info.username,
            ctx.session.info.rem_addr,
            ctx.session.id,
            victim.username,
            victim.rem_addr,
            victim_id
        );
    }
    Ok(ReplyBody::Ok)
}
