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

//! Test harness: an in-process daemon over socketpairs plus a tiny
//! NETCONF client speaking the hello exchange and chunked framing.

use std::io::{Read, Write};
use std::os::unix::net::UnixStream;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use libnetconfd::audit::AuditLog;
use libnetconfd::daemon::server::Server;
use libnetconfd::daemon::session::{self, SessionTable};
use libnetconfd::schema::Schema;
use libnetconfd::store::{MemStore, Store};
use tempfile::TempDir;

const IF_MODEL: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<MODULE xmlns="urn:netconfd:models"
        model="example-if" organization="Example Org" version="2024-01-10"
        namespace="urn:example:if" prefix="eif">
  <NODE name="interfaces">
    <NODE name="interface">
      <NODE name="*" key="name">
        <NODE name="name" mode="rw"/>
        <NODE name="mtu" mode="rw" default="1500"/>
        <NODE name="status" mode="r"/>
      </NODE>
    </NODE>
  </NODE>
</MODULE>
"#;

const SYS_MODEL: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<MODULE xmlns="urn:netconfd:models"
        model="example-sys" organization="Example Org" version="2024-02-02"
        namespace="urn:example:sys" prefix="esys">
  <NODE name="system">
    <NODE name="hostname" mode="rw"/>
    <NODE name="uptime" mode="r"/>
  </NODE>
</MODULE>
"#;

const X_MODEL: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<MODULE xmlns="urn:netconfd:models"
        model="example-x" organization="Example Org" version="2024-03-03"
        namespace="urn:example:x" prefix="ex">
  <NODE name="foo">
    <NODE name="bar" mode="rw"/>
  </NODE>
</MODULE>
"#;

pub struct TestDaemon {
    pub server: Arc<Server>,
    pub store: Arc<dyn Store>,
    pub table: Arc<SessionTable>,
    #[allow(dead_code)]
    tmp: TempDir,
}

pub fn daemon() -> TestDaemon {
    let tmp = tempfile::tempdir().expect("tempdir");
    std::fs::write(tmp.path().join("example-if.xml"), IF_MODEL).expect("write if model");
    std::fs::write(tmp.path().join("example-sys.xml"), SYS_MODEL).expect("write sys model");
    std::fs::write(tmp.path().join("example-x.xml"), X_MODEL).expect("write x model");

    let schema = Arc::new(Schema::load(tmp.path(), None).expect("schema to load"));
    let store: Arc<dyn Store> = Arc::new(MemStore::new());
    let table = Arc::new(SessionTable::new());
    session::register_state(Arc::clone(&table), Arc::clone(&store));
    let server = Server::new(schema, Arc::clone(&store), Arc::clone(&table), AuditLog::disabled());

    TestDaemon { server, store, table, tmp }
}

pub struct Client {
    stream: UnixStream,
    session_id: Option<u32>,
}

impl Client {
    /// Connect a fresh session; the server side runs on its own thread.
    pub fn connect(daemon: &TestDaemon) -> Client {
        let (client_side, server_side) = UnixStream::pair().expect("socketpair");
        client_side
            .set_read_timeout(Some(Duration::from_secs(5)))
            .expect("setting client timeout");
        let server = Arc::clone(&daemon.server);
        thread::spawn(move || {
            let _ = server.handle_session(server_side);
        });
        Client { stream: client_side, session_id: None }
    }

    pub fn session_id(&self) -> u32 {
        self.session_id.expect("hello exchange first")
    }

    /// Read the server hello up to the 1.0 trailer.
    pub fn read_hello(&mut self) -> std::io::Result<String> {
        let mut buf = Vec::new();
        let mut byte = [0u8; 1];
        loop {
            let n = self.stream.read(&mut byte)?;
            if n == 0 {
                return Err(std::io::Error::new(std::io::ErrorKind::UnexpectedEof, "eof"));
            }
            buf.push(byte[0]);
            if buf.ends_with(b"]]>]]>") {
                buf.truncate(buf.len() - 6);
                let hello = String::from_utf8_lossy(&buf).to_string();
                if let Some(id) = extract(&hello, "<session-id>", "</session-id>") {
                    self.session_id = id.parse().ok();
                }
                return Ok(hello);
            }
        }
    }

    pub fn send_client_hello(&mut self, capability: &str) {
        let hello = format!(
            "<?xml version=\"1.0\"?><hello xmlns=\"urn:ietf:params:xml:ns:netconf:base:1.0\"><capabilities><capability>{capability}</capability></capabilities></hello>]]>]]>"
        );
        self.stream.write_all(hello.as_bytes()).expect("writing hello");
    }

    /// The happy-path hello exchange most tests start with.
    pub fn handshake(&mut self) {
        self.read_hello().expect("server hello");
        self.send_client_hello("urn:ietf:params:netconf:base:1.1");
    }

    pub fn send_raw(&mut self, bytes: &[u8]) -> std::io::Result<()> {
        self.stream.write_all(bytes)
    }

    /// Send one RPC as a single chunk and read the reply.
    pub fn rpc(&mut self, payload: &str) -> std::io::Result<String> {
        let frame = format!("\n#{}\n{}\n##\n", payload.len(), payload);
        self.stream.write_all(frame.as_bytes())?;
        self.read_reply()
    }

    /// Read one chunked message off the wire.
    pub fn read_reply(&mut self) -> std::io::Result<String> {
        let mut message = Vec::new();
        loop {
            let header = self.read_chunk_header()?;
            let len = match header {
                None => break,
                Some(len) => len,
            };
            let mut chunk = vec![0u8; len];
            self.stream.read_exact(&mut chunk)?;
            message.extend_from_slice(&chunk);
        }
        Ok(String::from_utf8_lossy(&message).to_string())
    }

    fn read_chunk_header(&mut self) -> std::io::Result<Option<usize>> {
        let mut header = Vec::new();
        let mut byte = [0u8; 1];
        loop {
            let n = self.stream.read(&mut byte)?;
            if n == 0 {
                return Err(std::io::Error::new(std::io::ErrorKind::UnexpectedEof, "eof"));
            }
            header.push(byte[0]);
            if header.len() >= 3 && header.last() == Some(&b'\n') {
                if header == b"\n##\n" {
                    return Ok(None);
                }
                let digits = String::from_utf8_lossy(&header[2..header.len() - 1]).to_string();
                return digits
                    .parse::<usize>()
                    .map(Some)
                    .map_err(|_| std::io::Error::new(std::io::ErrorKind::InvalidData, "header"));
            }
            if header.len() > 16 {
                return Err(std::io::Error::new(std::io::ErrorKind::InvalidData, "header"));
            }
        }
    }

    /// True when the server has half-closed our stream.
    pub fn at_eof(&mut self) -> bool {
        let mut byte = [0u8; 1];
        matches!(self.stream.read(&mut byte), Ok(0))
    }
}

fn extract(haystack: &str, open: &str, close: &str) -> Option<String> {
    let start = haystack.find(open)? + open.len();
    let end = haystack[start..].find(close)? + start;
    Some(haystack[start..end].to_string())
}

/// Poll until `cond` holds, failing the test after a couple of seconds.
pub fn wait_for<F: FnMut() -> bool>(mut cond: F, what: &str) {
    for _ in 0..200 {
        if cond() {
            return;
        }
        thread::sleep(Duration::from_millis(10));
    }
    panic!("timed out waiting for {what}");
}
