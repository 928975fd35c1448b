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

//! The session table and everything guarded with it: session id
//! allocation, admission bookkeeping, the single running datastore lock
//! and the global statistics. The state publisher at the bottom mirrors
//! the table into the datastore through refresh callbacks.

use std::collections::HashMap;
use std::os::unix::net::UnixStream;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use chrono::Utc;
use tracing::{debug, info, warn};

use crate::consts;
use crate::store::Store;
use crate::tree::{DataTree, ROOT};
use crate::user::PeerInfo;

#[derive(Debug, Default)]
pub struct Counters {
    pub in_rpcs: AtomicU32,
    pub in_bad_rpcs: AtomicU32,
    pub out_rpc_errors: AtomicU32,
    pub out_notifications: AtomicU32,
}

/// What a worker holds for its own session. The table keeps a parallel
/// entry with a cloned stream handle for kill-session and shutdown.
pub struct Session {
    pub id: u32,
    pub info: PeerInfo,
    pub counters: Arc<Counters>,
}

struct Entry {
    info: PeerInfo,
    counters: Arc<Counters>,
    stream: UnixStream,
}

#[derive(Debug, Default)]
struct LockState {
    locked: bool,
    owner_id: u32,
}

pub struct GlobalStats {
    pub start_time: String,
    pub in_bad_hellos: AtomicU32,
    pub in_sessions: AtomicU32,
    pub dropped_sessions: AtomicU32,
    pub totals: Counters,
}

impl Default for GlobalStats {
    fn default() -> Self {
        GlobalStats {
            start_time: Utc::now().format("%Y-%m-%dT%H:%M:%S%:z").to_string(),
            in_bad_hellos: AtomicU32::default(),
            in_sessions: AtomicU32::default(),
            dropped_sessions: AtomicU32::default(),
            totals: Counters::default(),
        }
    }
}

struct TableInner {
    sessions: HashMap<u32, Entry>,
    next_id: u32,
    max_sessions: u32,
    lock: LockState,
}

pub struct SessionTable {
    inner: Mutex<TableInner>,
    pub stats: GlobalStats,
}

#[derive(Debug, PartialEq, Eq)]
pub enum UnlockError {
    NotLocked,
    NotOwner(u32),
}

/// A read-only record of one live session for the publisher.
pub struct SessionRecord {
    pub id: u32,
    pub username: String,
    pub rem_addr: String,
    pub rem_port: String,
    pub login_time: String,
    pub has_lock: bool,
    pub in_rpcs: u32,
    pub in_bad_rpcs: u32,
    pub out_rpc_errors: u32,
    pub out_notifications: u32,
}

impl Default for SessionTable {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionTable {
    pub fn new() -> Self {
        // a randomized starting point, seeded without a clock-independent
        // rng since ids only need process-lifetime uniqueness
        let seed = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.subsec_nanos())
            .unwrap_or(1);
        let next_id = (seed % 32768).max(1);
        SessionTable {
            inner: Mutex::new(TableInner {
                sessions: HashMap::new(),
                next_id,
                max_sessions: consts::MAX_SESSIONS_DEFAULT,
                lock: LockState::default(),
            }),
            stats: GlobalStats::default(),
        }
    }

    /// Register a new session for a connected stream. The caller checks
    /// admission afterwards; registration itself always succeeds so the
    /// drop is visible in the statistics.
    pub fn register(&self, stream: &UnixStream, info: PeerInfo) -> std::io::Result<Session> {
        let counters = Arc::new(Counters::default());
        let entry_stream = stream.try_clone()?;
        let mut inner = self.inner.lock().unwrap();
        // ids wrap but never take the value 0
        let mut id = inner.next_id;
        if id == 0 {
            id = 1;
        }
        inner.next_id = id.wrapping_add(1);

        inner.sessions.insert(
            id,
            Entry { info: info.clone(), counters: Arc::clone(&counters), stream: entry_stream },
        );
        self.stats.in_sessions.fetch_add(1, Ordering::Relaxed);
        info!("registered session {} for {}@{}", id, info.username, info.rem_addr);
        Ok(Session { id, info, counters })
    }

    /// True when the session that was just admitted pushed us over the
    /// bound.
    pub fn over_limit(&self) -> bool {
        let inner = self.inner.lock().unwrap();
        inner.sessions.len() as u32 > inner.max_sessions
    }

    /// Remove a session, releasing the running lock if it is the owner.
    pub fn remove(&self, id: u32) {
        let mut inner = self.inner.lock().unwrap();
        if inner.lock.locked && inner.lock.owner_id == id {
            debug!("session {} destroyed while holding the lock, releasing", id);
            inner.lock = LockState::default();
        }
        inner.sessions.remove(&id);
    }

    pub fn num_sessions(&self) -> usize {
        self.inner.lock().unwrap().sessions.len()
    }

    pub fn max_sessions(&self) -> u32 {
        self.inner.lock().unwrap().max_sessions
    }

    pub fn set_max_sessions(&self, max: u32) -> bool {
        let mut inner = self.inner.lock().unwrap();
        if inner.max_sessions == max {
            return false;
        }
        inner.max_sessions = max;
        true
    }

    /// Acquire the running datastore lock. On failure returns the holder.
    pub fn lock_running(&self, id: u32) -> Result<(), u32> {
        let mut inner = self.inner.lock().unwrap();
        if inner.lock.locked {
            return Err(inner.lock.owner_id);
        }
        inner.lock = LockState { locked: true, owner_id: id };
        Ok(())
    }

    pub fn unlock_running(&self, id: u32) -> Result<(), UnlockError> {
        let mut inner = self.inner.lock().unwrap();
        if !inner.lock.locked {
            return Err(UnlockError::NotLocked);
        }
        if inner.lock.owner_id != id {
            return Err(UnlockError::NotOwner(inner.lock.owner_id));
        }
        inner.lock = LockState::default();
        Ok(())
    }

    /// The lock holder when it is some session other than `id`.
    pub fn locked_by_other(&self, id: u32) -> Option<u32> {
        let inner = self.inner.lock().unwrap();
        if inner.lock.locked && inner.lock.owner_id != id {
            Some(inner.lock.owner_id)
        } else {
            None
        }
    }

    pub fn lock_owner(&self) -> Option<u32> {
        let inner = self.inner.lock().unwrap();
        if inner.lock.locked {
            Some(inner.lock.owner_id)
        } else {
            None
        }
    }

    /// Half-close a session's stream by id. The victim's worker observes
    /// EOF and destroys itself through the normal path.
    pub fn kill(&self, id: u32) -> Option<PeerInfo> {
        let inner = self.inner.lock().unwrap();
        let entry = inner.sessions.get(&id)?;
        if let Err(err) = entry.stream.shutdown(std::net::Shutdown::Both) {
            warn!("shutting down session {} stream: {}", id, err);
        }
        Some(entry.info.clone())
    }

    /// Half-close every live session, used during daemon shutdown.
    pub fn shutdown_all(&self) {
        let inner = self.inner.lock().unwrap();
        for (id, entry) in inner.sessions.iter() {
            if let Err(err) = entry.stream.shutdown(std::net::Shutdown::Both) {
                debug!("shutting down session {} stream: {}", id, err);
            }
        }
    }

    /// A consistent snapshot of every live session, taken under the table
    /// mutex.
    pub fn snapshot(&self) -> Vec<SessionRecord> {
        let inner = self.inner.lock().unwrap();
        let mut records: Vec<SessionRecord> = inner
            .sessions
            .iter()
            .map(|(&id, entry)| SessionRecord {
                id,
                username: entry.info.username.clone(),
                rem_addr: entry.info.rem_addr.clone(),
                rem_port: entry.info.rem_port.clone(),
                login_time: entry.info.login_time.clone(),
                has_lock: inner.lock.locked && inner.lock.owner_id == id,
                in_rpcs: entry.counters.in_rpcs.load(Ordering::Relaxed),
                in_bad_rpcs: entry.counters.in_bad_rpcs.load(Ordering::Relaxed),
                out_rpc_errors: entry.counters.out_rpc_errors.load(Ordering::Relaxed),
                out_notifications: entry.counters.out_notifications.load(Ordering::Relaxed),
            })
            .collect();
        records.sort_by_key(|r| r.id);
        records
    }
}

/// Register the datastore refresh and watch callbacks that publish session
/// and statistics state, plus the admission bound knob.
pub fn register_state(table: Arc<SessionTable>, store: Arc<dyn Store>) {
    let sessions_table = Arc::clone(&table);
    let sessions_store = Arc::clone(&store);
    store.refresh(
        &format!("{}/*", consts::STATE_SESSIONS_PATH),
        Arc::new(move |_glob| {
            publish_sessions(&sessions_table, sessions_store.as_ref());
            Duration::from_secs(1)
        }),
    );

    let stats_table = Arc::clone(&table);
    let stats_store = Arc::clone(&store);
    store.refresh(
        &format!("{}/*", consts::STATE_STATISTICS_PATH),
        Arc::new(move |_glob| {
            publish_statistics(&stats_table, stats_store.as_ref());
            Duration::from_secs(1)
        }),
    );

    // an external writer flips .../status to "inactive" to clear a session
    let clear_table = Arc::clone(&table);
    let clear_store = Arc::clone(&store);
    store.watch(
        consts::SESSION_STATUS_PATH,
        Arc::new(move |path, value| {
            if value != Some("inactive") {
                return true;
            }
            let id = path
                .trim_matches('/')
                .split('/')
                .nth(3)
                .and_then(|c| c.parse::<u32>().ok());
            match id.and_then(|id| clear_table.kill(id)) {
                Some(_) => info!("session at {} cleared via status write", path),
                None => {
                    clear_store.set(path, "unknown");
                }
            }
            true
        }),
    );

    let max_table = Arc::clone(&table);
    let max_store = Arc::clone(&store);
    store.watch(
        consts::CONFIG_MAX_SESSIONS_PATH,
        Arc::new(move |_path, value| {
            let max = match value {
                None | Some("") => consts::MAX_SESSIONS_DEFAULT,
                Some(v) => v
                    .parse::<u32>()
                    .unwrap_or(consts::MAX_SESSIONS_DEFAULT)
                    .clamp(consts::MAX_SESSIONS_MIN, consts::MAX_SESSIONS_MAX),
            };
            if max_table.set_max_sessions(max) {
                info!("max-sessions now {}", max);
                max_store.set(consts::STATE_MAX_SESSIONS_PATH, &max.to_string());
            }
            true
        }),
    );

    store.set(consts::STATE_MAX_SESSIONS_PATH, &consts::MAX_SESSIONS_DEFAULT.to_string());
}

fn publish_sessions(table: &SessionTable, store: &dyn Store) {
    let records = table.snapshot();

    let mut tree = DataTree::new();
    let state = tree.append(ROOT, "netconf-state");
    let sessions = tree.append(state, "sessions");
    let list = tree.append(sessions, "session");
    for record in &records {
        let sess = tree.append(list, record.id.to_string());
        tree.append_leaf(sess, "session-id", record.id.to_string());
        tree.append_leaf(sess, "transport", "netconf-ssh");
        tree.append_leaf(sess, "username", record.username.clone());
        tree.append_leaf(sess, "login-time", record.login_time.clone());
        tree.append_leaf(sess, "source-host", record.rem_addr.clone());
        tree.append_leaf(sess, "source-port", record.rem_port.clone());
        tree.append_leaf(sess, "lock", if record.has_lock { "R" } else { "-" });
        tree.append_leaf(sess, "status", "active");
        tree.append_leaf(sess, "in-rpcs", record.in_rpcs.to_string());
        tree.append_leaf(sess, "in-bad-rpcs", record.in_bad_rpcs.to_string());
        tree.append_leaf(sess, "out-rpc-errors", record.out_rpc_errors.to_string());
        tree.append_leaf(sess, "out-notifications", record.out_notifications.to_string());
    }

    store.prune(consts::STATE_SESSIONS_PATH);
    if !records.is_empty() {
        store.set_tree(&tree);
    }
}

fn publish_statistics(table: &SessionTable, store: &dyn Store) {
    let stats = &table.stats;
    let mut tree = DataTree::new();
    let state = tree.append(ROOT, "netconf-state");
    let root = tree.append(state, "statistics");
    tree.append_leaf(root, "netconf-start-time", stats.start_time.clone());
    tree.append_leaf(root, "in-bad-hellos", stats.in_bad_hellos.load(Ordering::Relaxed).to_string());
    tree.append_leaf(root, "in-sessions", stats.in_sessions.load(Ordering::Relaxed).to_string());
    tree.append_leaf(
        root,
        "dropped-sessions",
        stats.dropped_sessions.load(Ordering::Relaxed).to_string(),
    );
    tree.append_leaf(root, "in-rpcs", stats.totals.in_rpcs.load(Ordering::Relaxed).to_string());
    tree.append_leaf(
        root,
        "in-bad-rpcs",
        stats.totals.in_bad_rpcs.load(Ordering::Relaxed).to_string(),
    );
    tree.append_leaf(
        root,
        "out-rpc-errors",
        stats.totals.out_rpc_errors.load(Ordering::Relaxed).to_string(),
    );
    tree.append_leaf(
        root,
        "out-notifications",
        stats.totals.out_notifications.load(Ordering::Relaxed).to_string(),
    );

    store.prune(consts::STATE_STATISTICS_PATH);
    store.set_tree(&tree);
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::store::MemStore;
    use assert_matches::assert_matches;

    fn stream_pair() -> (UnixStream, UnixStream) {
        UnixStream::pair().expect("socketpair")
    }

    fn register(table: &SessionTable) -> (Session, UnixStream) {
        let (a, b) = stream_pair();
        let sess = table.register(&a, PeerInfo::default()).expect("register");
        (sess, b)
    }

    #[test]
    fn ids_are_unique_and_never_zero() {
        let table = SessionTable::new();
        {
            let mut inner = table.inner.lock().unwrap();
            inner.next_id = u32::MAX;
        }
        let (s1, _k1) = register(&table);
        let (s2, _k2) = register(&table);
        let (s3, _k3) = register(&table);
        assert_eq!(s1.id, u32::MAX);
        assert_ne!(s2.id, 0);
        assert_ne!(s3.id, 0);
        assert_ne!(s2.id, s3.id);
    }

    #[test]
    fn lock_is_exclusive_and_released_on_destroy() {
        let table = SessionTable::new();
        let (s1, _k1) = register(&table);
        let (s2, _k2) = register(&table);

        assert!(table.lock_running(s1.id).is_ok());
        assert_eq!(table.lock_running(s2.id), Err(s1.id));
        assert_eq!(table.locked_by_other(s2.id), Some(s1.id));
        assert_eq!(table.locked_by_other(s1.id), None);

        assert_matches!(table.unlock_running(s2.id), Err(UnlockError::NotOwner(id)) if id == s1.id);

        // destroying the owner clears the lock
        table.remove(s1.id);
        assert_eq!(table.lock_owner(), None);
        assert_eq!(table.unlock_running(s2.id), Err(UnlockError::NotLocked));
        assert!(table.lock_running(s2.id).is_ok());
    }

    #[test]
    fn admission_bound_checks_after_registration() {
        let table = SessionTable::new();
        table.set_max_sessions(1);
        let (_s1, _k1) = register(&table);
        assert!(!table.over_limit());
        let (s2, _k2) = register(&table);
        assert!(table.over_limit());
        table.remove(s2.id);
        assert!(!table.over_limit());
    }

    #[test]
    fn snapshot_reflects_counters_and_lock() {
        let table = SessionTable::new();
        let (s1, _k1) = register(&table);
        s1.counters.in_rpcs.store(3, Ordering::Relaxed);
        table.lock_running(s1.id).unwrap();

        let records = table.snapshot();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].in_rpcs, 3);
        assert!(records[0].has_lock);
    }

    #[test]
    fn publisher_writes_sessions_and_statistics() {
        let table = Arc::new(SessionTable::new());
        let store: Arc<dyn Store> = Arc::new(MemStore::new());
        register_state(Arc::clone(&table), Arc::clone(&store));

        assert_eq!(store.get(consts::STATE_MAX_SESSIONS_PATH).as_deref(), Some("4"));

        let (s1, _k1) = register(&table);
        // reading under the published path triggers the refresher
        let path = format!("{}/{}/username", consts::STATE_SESSIONS_PATH, s1.id);
        assert!(store.get(&path).is_some());

        table.stats.dropped_sessions.store(2, Ordering::Relaxed);
        // fresh store keeps serving the cached copy inside the interval,
        // so check the always-present start time instead
        let start = store.get(&format!("{}/netconf-start-time", consts::STATE_STATISTICS_PATH));
        assert!(start.is_some());
    }

    #[test]
    fn max_sessions_watch_clamps_and_mirrors() {
        let table = Arc::new(SessionTable::new());
        let store: Arc<dyn Store> = Arc::new(MemStore::new());
        register_state(Arc::clone(&table), Arc::clone(&store));

        store.set(consts::CONFIG_MAX_SESSIONS_PATH, "25");
        assert_eq!(table.max_sessions(), consts::MAX_SESSIONS_MAX);
        assert_eq!(
            store.get(consts::STATE_MAX_SESSIONS_PATH).as_deref(),
            Some(&consts::MAX_SESSIONS_MAX.to_string()[..])
        );

        store.set(consts::CONFIG_MAX_SESSIONS_PATH, "2");
        assert_eq!(table.max_sessions(), 2);

        store.set(consts::CONFIG_MAX_SESSIONS_PATH, "");
        assert_eq!(table.max_sessions(), consts::MAX_SESSIONS_DEFAULT);
    }

    #[test]
    fn kill_unknown_session_is_none() {
        let table = SessionTable::new();
        assert!(table.kill(999).is_none());
    }
}
