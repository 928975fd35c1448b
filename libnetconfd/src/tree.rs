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

//! The labeled ordered tree shared by the query, mutation and result
//! pipelines. Nodes are arena allocated with explicit parent indices so the
//! schema and store code can walk both directions without ownership cycles.
//!
//! Conventions: the root is always named `/`; each child holds one path
//! component; `*` is a single-level wildcard; a leaf with `value == None`
//! in a query is a frontier ("return everything at or below here") while
//! `Some(v)` is a content match. In mutation and result trees leaves carry
//! their value in `value`.

pub const ROOT: usize = 0;

#[derive(Debug, Clone)]
struct TNode {
    name: String,
    value: Option<String>,
    parent: Option<usize>,
    children: Vec<usize>,
}

#[derive(Debug, Clone)]
pub struct DataTree {
    nodes: Vec<TNode>,
}

impl Default for DataTree {
    fn default() -> Self {
        Self::new()
    }
}

impl DataTree {
    pub fn new() -> Self {
        DataTree {
            nodes: vec![TNode {
                name: String::from("/"),
                value: None,
                parent: None,
                children: Vec::new(),
            }],
        }
    }

    pub fn append<S: Into<String>>(&mut self, parent: usize, name: S) -> usize {
        let id = self.nodes.len();
        self.nodes.push(TNode { name: name.into(), value: None, parent: Some(parent), children: Vec::new() });
        self.nodes[parent].children.push(id);
        id
    }

    pub fn append_leaf<N: Into<String>, V: Into<String>>(
        &mut self,
        parent: usize,
        name: N,
        value: V,
    ) -> usize {
        let id = self.append(parent, name);
        self.nodes[id].value = Some(value.into());
        id
    }

    pub fn name(&self, id: usize) -> &str {
        &self.nodes[id].name
    }

    pub fn value(&self, id: usize) -> Option<&str> {
        self.nodes[id].value.as_deref()
    }

    pub fn set_value<V: Into<String>>(&mut self, id: usize, value: V) {
        self.nodes[id].value = Some(value.into());
    }

    pub fn parent(&self, id: usize) -> Option<usize> {
        self.nodes[id].parent
    }

    pub fn children(&self, id: usize) -> &[usize] {
        &self.nodes[id].children
    }

    pub fn find_child(&self, id: usize, name: &str) -> Option<usize> {
        self.nodes[id].children.iter().copied().find(|&c| self.nodes[c].name == name)
    }

    pub fn ensure_child(&mut self, id: usize, name: &str) -> usize {
        match self.find_child(id, name) {
            Some(c) => c,
            None => self.append(id, name.to_string()),
        }
    }

    pub fn is_leaf(&self, id: usize) -> bool {
        self.nodes[id].children.is_empty()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes[ROOT].children.is_empty()
    }

    /// Unlink a node from its parent. The slot stays allocated but
    /// unreachable.
    pub fn detach(&mut self, id: usize) {
        if let Some(p) = self.nodes[id].parent.take() {
            self.nodes[p].children.retain(|&c| c != id);
        }
    }

    /// Depth of a node; the root is depth 0.
    pub fn depth(&self, id: usize) -> usize {
        let mut d = 0;
        let mut cur = self.nodes[id].parent;
        while let Some(p) = cur {
            d += 1;
            cur = self.nodes[p].parent;
        }
        d
    }

    /// Height of the tree: the depth of the deepest node.
    pub fn max_height(&self) -> usize {
        self.leaves().into_iter().map(|l| self.depth(l)).max().unwrap_or(0)
    }

    /// Slash separated path from the root down to (and including) `id`.
    pub fn path(&self, id: usize) -> String {
        let mut parts = Vec::new();
        let mut cur = Some(id);
        while let Some(n) = cur {
            if self.nodes[n].parent.is_some() {
                parts.push(self.nodes[n].name.clone());
            }
            cur = self.nodes[n].parent;
        }
        parts.reverse();
        format!("/{}", parts.join("/"))
    }

    /// All reachable leaves, in document order.
    pub fn leaves(&self) -> Vec<usize> {
        let mut out = Vec::new();
        self.collect_leaves(ROOT, &mut out);
        out
    }

    fn collect_leaves(&self, id: usize, out: &mut Vec<usize>) {
        if self.nodes[id].children.is_empty() {
            if self.nodes[id].parent.is_some() {
                out.push(id);
            }
            return;
        }
        for &c in &self.nodes[id].children {
            self.collect_leaves(c, out);
        }
    }

    /// Flatten to (path, value) pairs for every valued leaf.
    pub fn to_paths(&self) -> Vec<(String, String)> {
        self.leaves()
            .into_iter()
            .filter_map(|l| self.nodes[l].value.clone().map(|v| (self.path(l), v)))
            .collect()
    }

    /// The frontier paths of a query: the path of every leaf, valued or not.
    /// Used for one-audit-record-per-path logging.
    pub fn frontier_paths(&self) -> Vec<String> {
        self.leaves().into_iter().map(|l| self.path(l)).collect()
    }

    /// Graft a subtree from `other` (rooted at `other_id`) under `parent`,
    /// copying nodes.
    pub fn graft(&mut self, parent: usize, other: &DataTree, other_id: usize) -> usize {
        let id = self.append(parent, other.nodes[other_id].name.clone());
        self.nodes[id].value = other.nodes[other_id].value.clone();
        for &c in &other.nodes[other_id].children {
            self.graft(id, other, c);
        }
        id
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn sample() -> DataTree {
        let mut t = DataTree::new();
        let ifs = t.append(ROOT, "interfaces");
        let list = t.append(ifs, "interface");
        let eth0 = t.append(list, "eth0");
        t.append_leaf(eth0, "name", "eth0");
        t.append_leaf(eth0, "mtu", "1500");
        let eth1 = t.append(list, "eth1");
        t.append_leaf(eth1, "name", "eth1");
        t
    }

    #[test]
    fn paths_and_depths() {
        let t = sample();
        let leaves = t.leaves();
        assert_eq!(leaves.len(), 3);
        assert_eq!(t.path(leaves[0]), "/interfaces/interface/eth0/name");
        assert_eq!(t.depth(leaves[0]), 4);
        assert_eq!(t.max_height(), 4);
    }

    #[test]
    fn to_paths_only_sees_values() {
        let mut t = sample();
        let ifs = t.find_child(ROOT, "interfaces").unwrap();
        // a bare frontier contributes no value pair
        t.append(ifs, "status");
        let pairs = t.to_paths();
        assert_eq!(
            pairs,
            vec![
                ("/interfaces/interface/eth0/name".to_string(), "eth0".to_string()),
                ("/interfaces/interface/eth0/mtu".to_string(), "1500".to_string()),
                ("/interfaces/interface/eth1/name".to_string(), "eth1".to_string()),
            ]
        );
    }

    #[test]
    fn detach_unlinks() {
        let mut t = sample();
        let ifs = t.find_child(ROOT, "interfaces").unwrap();
        let list = t.find_child(ifs, "interface").unwrap();
        let eth0 = t.find_child(list, "eth0").unwrap();
        t.detach(eth0);
        assert_eq!(t.to_paths().len(), 1);
        assert!(!t.is_empty());
    }

    #[test]
    fn graft_copies_subtree() {
        let src = sample();
        let src_ifs = src.find_child(ROOT, "interfaces").unwrap();
        let mut dst = DataTree::new();
        dst.graft(ROOT, &src, src_ifs);
        assert_eq!(dst.to_paths(), src.to_paths());
    }
}
