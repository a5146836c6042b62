//! Dirty-path tracking
//!
//! A [`DirtyTree`] records which paths of a record changed since it was last
//! persisted. It is a trie over path segments where a marked node covers its
//! whole subtree:
//!
//! - marking a path whose ancestor is already marked is a no-op
//! - marking a path drops every marked descendant
//!
//! so the marked leaves never overlap and map one-to-one onto patch entries.

use std::collections::BTreeMap;
use trellis_core::{JsonPath, PathSegment};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
struct Node {
    marked: bool,
    children: BTreeMap<PathSegment, Node>,
}

impl Node {
    fn collect(&self, prefix: &mut Vec<PathSegment>, out: &mut Vec<JsonPath>) {
        if self.marked {
            out.push(JsonPath::from_segments(prefix.clone()));
            return;
        }
        for (segment, child) in &self.children {
            prefix.push(segment.clone());
            child.collect(prefix, out);
            prefix.pop();
        }
    }
}

/// Set of changed paths, collapsed to their highest marked ancestors
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DirtyTree {
    root: Node,
}

impl DirtyTree {
    /// Empty tree
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a changed path
    ///
    /// Returns `false` when the path was already covered by a marked ancestor.
    pub fn mark(&mut self, path: &JsonPath) -> bool {
        let mut node = &mut self.root;
        for segment in path.segments() {
            if node.marked {
                return false;
            }
            node = node.children.entry(segment.clone()).or_default();
        }
        if node.marked {
            return false;
        }
        node.marked = true;
        node.children.clear();
        true
    }

    /// Whether the path or one of its ancestors is marked
    pub fn covers(&self, path: &JsonPath) -> bool {
        let mut node = &self.root;
        if node.marked {
            return true;
        }
        for segment in path.segments() {
            match node.children.get(segment) {
                Some(child) if child.marked => return true,
                Some(child) => node = child,
                None => return false,
            }
        }
        false
    }

    /// Whether nothing is marked
    pub fn is_empty(&self) -> bool {
        !self.root.marked && self.root.children.is_empty()
    }

    /// Marked paths in path order
    pub fn paths(&self) -> Vec<JsonPath> {
        let mut out = Vec::new();
        self.root.collect(&mut Vec::new(), &mut out);
        out
    }

    /// Number of marked paths
    pub fn len(&self) -> usize {
        self.paths().len()
    }

    /// Forget every mark
    pub fn clear(&mut self) {
        self.root = Node::default();
    }
}
