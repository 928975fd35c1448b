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

//! The datastore seam. The server core only talks to [`Store`]; the in
//! memory [`MemStore`] backs the daemon and the tests. Paths are slash
//! separated, every stored entry is a leaf value, and containers exist as
//! key prefixes.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};

use tracing::debug;

use crate::tree::{DataTree, ROOT};

/// A refresh callback repopulates its subtree and returns how long the
/// refreshed data may be served before the callback is due again.
pub type RefreshFn = Arc<dyn Fn(&str) -> Duration + Send + Sync>;

/// A watch callback observes a write. `None` is a delete.
pub type WatchFn = Arc<dyn Fn(&str, Option<&str>) -> bool + Send + Sync>;

pub trait Store: Send + Sync {
    /// Immediate child paths under `path`.
    fn search(&self, path: &str) -> Vec<String>;
    fn get(&self, path: &str) -> Option<String>;
    /// The subtree at or below `path`, if any data exists there.
    fn get_tree(&self, path: &str) -> Option<DataTree>;
    /// Execute a query tree, returning matches with values filled in.
    fn query(&self, query: &DataTree) -> Option<DataTree>;
    /// Like [`Store::query`] but returns every node in the requested shape,
    /// including containers that hold no values of their own.
    fn query_full(&self, query: &DataTree) -> Option<DataTree>;
    fn set(&self, path: &str, value: &str) -> bool;
    fn set_tree(&self, tree: &DataTree) -> bool;
    /// Remove everything at or below `path`.
    fn prune(&self, path: &str) -> bool;
    fn refresh(&self, glob: &str, cb: RefreshFn);
    fn watch(&self, glob: &str, cb: WatchFn);
}

/// Component-wise glob match; `*` matches exactly one component.
fn glob_matches(glob: &str, path: &str) -> bool {
    let g: Vec<&str> = glob.trim_matches('/').split('/').collect();
    let p: Vec<&str> = path.trim_matches('/').split('/').collect();
    if g.len() != p.len() {
        return false;
    }
    g.iter().zip(p.iter()).all(|(gc, pc)| *gc == "*" || gc == pc)
}

/// The static prefix of a glob: the components before the first `*`.
fn glob_prefix(glob: &str) -> String {
    let mut parts = Vec::new();
    for comp in glob.trim_matches('/').split('/') {
        if comp == "*" {
            break;
        }
        parts.push(comp);
    }
    format!("/{}", parts.join("/"))
}

fn under(path: &str, prefix: &str) -> bool {
    path == prefix || path.starts_with(&format!("{}/", prefix.trim_end_matches('/')))
}

struct Refresher {
    glob: String,
    prefix: String,
    cb: RefreshFn,
    // (last run, interval the callback asked for)
    due: Mutex<Option<(Instant, Duration)>>,
}

struct Watcher {
    glob: String,
    cb: WatchFn,
}

#[derive(Default)]
pub struct MemStore {
    data: RwLock<BTreeMap<String, String>>,
    refreshers: Mutex<Vec<Arc<Refresher>>>,
    watchers: Mutex<Vec<Arc<Watcher>>>,
}

impl MemStore {
    pub fn new() -> Self {
        MemStore::default()
    }

    /// Run any due refresh callbacks whose subtree intersects `path`.
    /// Callbacks are invoked with no store locks held since they write back
    /// into the store.
    fn run_refreshers(&self, path: &str) {
        let due: Vec<Arc<Refresher>> = {
            let refreshers = self.refreshers.lock().unwrap();
            refreshers
                .iter()
                .filter(|r| under(path, &r.prefix) || under(&r.prefix, path))
                .filter(|r| {
                    let mut due = r.due.lock().unwrap();
                    let stale = match *due {
                        None => true,
                        Some((last, interval)) => last.elapsed() >= interval,
                    };
                    if stale {
                        // claim the slot before dropping the lock so
                        // concurrent readers do not stampede the callback
                        *due = Some((Instant::now(), Duration::from_secs(u64::MAX)));
                    }
                    stale
                })
                .map(Arc::clone)
                .collect()
        };
        for r in due {
            debug!("refreshing {}", r.glob);
            let interval = (r.cb)(&r.glob);
            *r.due.lock().unwrap() = Some((Instant::now(), interval));
        }
    }

    fn notify_watchers(&self, path: &str, value: Option<&str>) {
        let interested: Vec<Arc<Watcher>> = {
            let watchers = self.watchers.lock().unwrap();
            watchers.iter().filter(|w| glob_matches(&w.glob, path)).map(Arc::clone).collect()
        };
        for w in interested {
            (w.cb)(path, value);
        }
    }

    fn query_node(
        &self,
        data: &BTreeMap<String, String>,
        query: &DataTree,
        qnode: usize,
        path: &str,
        result: &mut DataTree,
        rnode: usize,
        full: bool,
    ) -> bool {
        let mut hit = false;
        for &qchild in query.children(qnode) {
            let name = query.name(qchild);
            if name == "*" {
                for comp in search_components(data, path) {
                    let child_path = format!("{}/{comp}", path.trim_end_matches('/'));
                    hit |= self.query_step(data, query, qchild, &child_path, &comp, result, rnode, full);
                }
            } else {
                let child_path = format!("{}/{name}", path.trim_end_matches('/'));
                let name = name.to_string();
                hit |= self.query_step(data, query, qchild, &child_path, &name, result, rnode, full);
            }
        }
        hit
    }

    #[allow(clippy::too_many_arguments)]
    fn query_step(
        &self,
        data: &BTreeMap<String, String>,
        query: &DataTree,
        qchild: usize,
        path: &str,
        comp: &str,
        result: &mut DataTree,
        rnode: usize,
        full: bool,
    ) -> bool {
        if query.children(qchild).is_empty() {
            match query.value(qchild) {
                // content match: include the leaf only on an exact value hit
                Some(want) => {
                    if data.get(path).map(|v| v == want).unwrap_or(false) {
                        result.append_leaf(rnode, comp, want.to_string());
                        return true;
                    }
                    false
                }
                // frontier: everything at or below this path
                None => {
                    let mut hit = false;
                    if let Some(v) = data.get(path) {
                        result.append_leaf(rnode, comp, v.clone());
                        hit = true;
                    } else if data.keys().any(|k| under(k, path)) {
                        let sub = result.append(rnode, comp);
                        copy_subtree(data, path, result, sub);
                        hit = true;
                    } else if full {
                        // keep the requested shape even with nothing below
                        result.append(rnode, comp);
                    }
                    hit
                }
            }
        } else {
            let sub = result.append(rnode, comp);
            let hit = self.query_node(data, query, qchild, path, result, sub, full);
            if !hit && !full {
                result.detach(sub);
            }
            hit
        }
    }
}

fn search_components(data: &BTreeMap<String, String>, path: &str) -> Vec<String> {
    let prefix = format!("{}/", path.trim_end_matches('/'));
    let mut out: Vec<String> = Vec::new();
    for key in data.keys() {
        if let Some(rest) = key.strip_prefix(&prefix) {
            let comp = rest.split('/').next().unwrap_or(rest);
            if !out.iter().any(|c| c == comp) {
                out.push(comp.to_string());
            }
        }
    }
    out
}

fn copy_subtree(data: &BTreeMap<String, String>, path: &str, result: &mut DataTree, rnode: usize) {
    for comp in search_components(data, path) {
        let child_path = format!("{}/{comp}", path.trim_end_matches('/'));
        if let Some(v) = data.get(&child_path) {
            result.append_leaf(rnode, comp, v.clone());
        } else {
            let sub = result.append(rnode, comp);
            copy_subtree(data, &child_path, result, sub);
        }
    }
}

impl Store for MemStore {
    fn search(&self, path: &str) -> Vec<String> {
        self.run_refreshers(path);
        let data = self.data.read().unwrap();
        let base = if path == "/" { "" } else { path.trim_end_matches('/') };
        search_components(&data, path)
            .into_iter()
            .map(|c| format!("{base}/{c}"))
            .collect()
    }

    fn get(&self, path: &str) -> Option<String> {
        self.run_refreshers(path);
        self.data.read().unwrap().get(path).cloned()
    }

    fn get_tree(&self, path: &str) -> Option<DataTree> {
        self.run_refreshers(path);
        let data = self.data.read().unwrap();
        let mut tree = DataTree::new();
        let mut parent = ROOT;
        if path != "/" {
            for comp in path.trim_matches('/').split('/') {
                parent = tree.append(parent, comp.to_string());
            }
        }
        if let Some(v) = data.get(path) {
            tree.set_value(parent, v.clone());
            return Some(tree);
        }
        if data.keys().any(|k| under(k, path)) {
            copy_subtree(&data, path, &mut tree, parent);
            return Some(tree);
        }
        None
    }

    fn query(&self, query: &DataTree) -> Option<DataTree> {
        self.run_refreshers(&query_prefix(query));
        let data = self.data.read().unwrap();
        let mut result = DataTree::new();
        let hit = self.query_node(&data, query, ROOT, "/", &mut result, ROOT, false);
        if hit {
            Some(result)
        } else {
            None
        }
    }

    fn query_full(&self, query: &DataTree) -> Option<DataTree> {
        self.run_refreshers(&query_prefix(query));
        let data = self.data.read().unwrap();
        let mut result = DataTree::new();
        let hit = self.query_node(&data, query, ROOT, "/", &mut result, ROOT, true);
        if hit {
            Some(result)
        } else {
            None
        }
    }

    fn set(&self, path: &str, value: &str) -> bool {
        self.data.write().unwrap().insert(path.to_string(), value.to_string());
        self.notify_watchers(path, Some(value));
        true
    }

    fn set_tree(&self, tree: &DataTree) -> bool {
        let pairs = tree.to_paths();
        {
            let mut data = self.data.write().unwrap();
            for (path, value) in &pairs {
                data.insert(path.clone(), value.clone());
            }
        }
        for (path, value) in &pairs {
            self.notify_watchers(path, Some(value));
        }
        true
    }

    fn prune(&self, path: &str) -> bool {
        let removed: Vec<String> = {
            let mut data = self.data.write().unwrap();
            let doomed: Vec<String> =
                data.keys().filter(|k| under(k, path)).cloned().collect();
            for k in &doomed {
                data.remove(k);
            }
            doomed
        };
        for k in removed {
            self.notify_watchers(&k, None);
        }
        true
    }

    fn refresh(&self, glob: &str, cb: RefreshFn) {
        self.refreshers.lock().unwrap().push(Arc::new(Refresher {
            glob: glob.to_string(),
            prefix: glob_prefix(glob),
            cb,
            due: Mutex::new(None),
        }));
    }

    fn watch(&self, glob: &str, cb: WatchFn) {
        self.watchers.lock().unwrap().push(Arc::new(Watcher { glob: glob.to_string(), cb }));
    }
}

/// The static prefix of a query: the chain of single, non-wildcard children
/// from the root.
fn query_prefix(query: &DataTree) -> String {
    let mut parts = Vec::new();
    let mut cur = ROOT;
    loop {
        let children = query.children(cur);
        if children.len() != 1 {
            break;
        }
        let child = children[0];
        if query.name(child) == "*" {
            break;
        }
        parts.push(query.name(child).to_string());
        cur = child;
    }
    format!("/{}", parts.join("/"))
}
