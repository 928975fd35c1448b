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

use std::fs;
use std::os::unix::net::UnixListener;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{anyhow, Context};
use tracing::{info, instrument};

use crate::audit::AuditLog;
use crate::config;
use crate::schema::Schema;
use crate::store::{MemStore, Store};

mod edit;
mod framer;
mod get;
mod reply;
pub mod server;
pub mod session;
mod signals;

#[instrument(skip_all)]
pub fn run(config: config::Config, socket: PathBuf) -> anyhow::Result<()> {
    info!("\n\n======================== STARTING DAEMON ============================\n\n");

    let schema_dir = config
        .schema_dir
        .as_deref()
        .ok_or(anyhow!("no schema_dir configured, nothing to serve"))?;
    let schema = Arc::new(
        Schema::load(Path::new(schema_dir), config.models.as_deref())
            .context("loading schema models")?,
    );

    let store: Arc<dyn Store> = Arc::new(MemStore::new());
    let table = Arc::new(session::SessionTable::new());
    session::register_state(Arc::clone(&table), Arc::clone(&store));

    let audit = match &config.audit_file {
        Some(path) => AuditLog::new(path),
        None => AuditLog::disabled(),
    };
    let _audit_watcher = audit.spawn_watcher().context("watching audit flags file")?;

    let server = server::Server::new(schema, store, table, audit);

    if let Some(parent) = socket.parent() {
        fs::create_dir_all(parent).context("creating socket dir")?;
    }
    // a stale socket from a previous run would fail the bind
    let _ = fs::remove_file(&socket);
    let listener = UnixListener::bind(&socket).context("binding to socket")?;
    info!("listening on {}", socket.display());

    // spawn the signal handler thread in the background
    signals::Handler::new(Some(socket.clone()), Arc::clone(&server)).spawn()?;

    server::Server::serve(server, listener)?;

    fs::remove_file(&socket).context("cleaning up socket on exit")?;
    Ok(())
}
