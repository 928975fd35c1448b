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

//! Operation audit flags. A single line in the flags file enumerates the
//! operations to audit; a notify watch on the containing directory reloads
//! the file whenever it is created, modified, removed or renamed. Unknown
//! tokens are ignored. Audit records themselves are tracing events with
//! `target: "audit"` emitted at the operation sites.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::thread;

use anyhow::Context;
use notify::{recommended_watcher, EventKind, RecommendedWatcher, RecursiveMode, Watcher as _};
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Flags(u32);

impl Flags {
    pub const NONE: Flags = Flags(0);
    pub const EDIT_CONFIG: Flags = Flags(1);
    pub const GET: Flags = Flags(1 << 1);
    pub const GET_CONFIG: Flags = Flags(1 << 2);
    pub const KILL_SESSION: Flags = Flags(1 << 3);
    pub const LOCK: Flags = Flags(1 << 4);
    pub const UNLOCK: Flags = Flags(1 << 5);
    pub const CLOSE_SESSION: Flags = Flags(1 << 6);
}

fn parse_line(line: &str) -> u32 {
    let mut flags = 0;
    for token in line.trim().split(' ') {
        flags |= match token {
            "edit-config" => Flags::EDIT_CONFIG.0,
            "get" => Flags::GET.0,
            "get-config" => Flags::GET_CONFIG.0,
            "kill-session" => Flags::KILL_SESSION.0,
            "lock" => Flags::LOCK.0,
            "unlock" => Flags::UNLOCK.0,
            "close-session" => Flags::CLOSE_SESSION.0,
            _ => 0,
        };
    }
    flags
}

pub struct AuditLog {
    flags: AtomicU32,
    path: Option<PathBuf>,
}

impl AuditLog {
    /// An audit log with no file backing it; nothing is audited.
    pub fn disabled() -> Arc<Self> {
        Arc::new(AuditLog { flags: AtomicU32::new(0), path: None })
    }

    pub fn new<P: AsRef<Path>>(path: P) -> Arc<Self> {
        let log =
            Arc::new(AuditLog { flags: AtomicU32::new(0), path: Some(path.as_ref().to_owned()) });
        log.reload();
        log
    }

    pub fn enabled(&self, flag: Flags) -> bool {
        self.flags.load(Ordering::Relaxed) & flag.0 != 0
    }

    /// Re-read the flags file. A missing or unreadable file clears every
    /// flag, matching what an operator expects from deleting it.
    pub fn reload(&self) {
        let Some(path) = &self.path else { return };
        let flags = match std::fs::read_to_string(path) {
            Ok(contents) => parse_line(contents.lines().next().unwrap_or("")),
            Err(err) => {
                debug!("audit flags file unreadable: {err}");
                0
            }
        };
        self.flags.store(flags, Ordering::Relaxed);
        info!("audit flags now {:#x}", flags);
    }

    /// Watch the directory containing the flags file and reload on any
    /// create/modify/remove/rename that touches it. The watcher thread and
    /// notify handle live inside the returned guard.
    pub fn spawn_watcher(self: &Arc<Self>) -> anyhow::Result<AuditWatcher> {
        let Some(path) = self.path.clone() else {
            return Ok(AuditWatcher { _watcher: None });
        };
        let dir = path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .map(Path::to_owned)
            .unwrap_or_else(|| PathBuf::from("."));
        let file_name = path.file_name().map(|n| n.to_owned()).unwrap_or_default();

        let (tx, rx) = crossbeam_channel::unbounded();
        let mut watcher: RecommendedWatcher =
            recommended_watcher(tx).context("creating audit flags watcher")?;
        watcher.watch(&dir, RecursiveMode::NonRecursive).context("watching audit flags dir")?;

        let log = Arc::clone(self);
        thread::Builder::new()
            .name("audit-reload".to_string())
            .spawn(move || {
                for res in rx {
                    let event = match res {
                        Ok(event) => event,
                        Err(err) => {
                            warn!("audit watch error: {:?}", err);
                            continue;
                        }
                    };
                    if !matches!(
                        event.kind,
                        EventKind::Create(_) | EventKind::Modify(_) | EventKind::Remove(_)
                    ) {
                        continue;
                    }
                    // only the flags file itself, not neighbors in the dir
                    if event.paths.iter().any(|p| p.file_name() == Some(file_name.as_os_str())) {
                        log.reload();
                    }
                }
                debug!("audit watcher channel closed");
            })
            .context("spawning audit reload thread")?;

        Ok(AuditWatcher { _watcher: Some(watcher) })
    }
}

/// Keeps the notify handle alive for the life of the daemon.
pub struct AuditWatcher {
    _watcher: Option<RecommendedWatcher>,
}

#[cfg(test)]
mod test {
    use super::*;
    use std::fs;

    #[test]
    fn parses_known_tokens_and_ignores_the_rest() {
        let flags = parse_line("get lock frobnicate close-session");
        assert_ne!(flags & Flags::GET.0, 0);
        assert_ne!(flags & Flags::LOCK.0, 0);
        assert_ne!(flags & Flags::CLOSE_SESSION.0, 0);
        assert_eq!(flags & Flags::EDIT_CONFIG.0, 0);
        assert_eq!(parse_line(""), 0);
        assert_eq!(parse_line("nonsense"), 0);
    }

    #[test]
    fn reload_reads_first_line_only() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("audit.conf");
        fs::write(&path, "get get-config\nedit-config\n").unwrap();

        let log = AuditLog::new(&path);
        assert!(log.enabled(Flags::GET));
        assert!(log.enabled(Flags::GET_CONFIG));
        assert!(!log.enabled(Flags::EDIT_CONFIG));

        fs::write(&path, "edit-config").unwrap();
        log.reload();
        assert!(log.enabled(Flags::EDIT_CONFIG));
        assert!(!log.enabled(Flags::GET));
    }

    #[test]
    fn missing_file_clears_flags() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("audit.conf");
        fs::write(&path, "get").unwrap();
        let log = AuditLog::new(&path);
        assert!(log.enabled(Flags::GET));

        fs::remove_file(&path).unwrap();
        log.reload();
        assert!(!log.enabled(Flags::GET));
    }

    #[test]
    fn disabled_log_audits_nothing() {
        let log = AuditLog::disabled();
        assert!(!log.enabled(Flags::GET));
        assert!(log.spawn_watcher().is_ok());
    }
}
