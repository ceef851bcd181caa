//! In-memory model of watched directories
//!
//! Nodes are kept in a `BTreeMap` keyed by normalized path. Path ordering is
//! component-wise, so every subtree occupies one contiguous key range and
//! cascading removal is a range scan.

use crate::platform::SubscriptionHandle;
use std::collections::{BTreeMap, BTreeSet};
use std::ops::Bound;
use std::path::{Path, PathBuf};

/// One actively monitored directory
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchNode {
    /// Normalized absolute path
    pub path: PathBuf,
    /// New subdirectories are watched automatically
    pub recursive: bool,
    /// Nearest watched ancestor, None for a root
    pub parent: Option<PathBuf>,
    /// Watched directories whose nearest watched ancestor is this node
    pub children: BTreeSet<PathBuf>,
    /// Event source subscription for this directory
    pub handle: SubscriptionHandle,
}

/// Tree of watched directories
#[derive(Debug, Default)]
pub struct PathTree {
    nodes: BTreeMap<PathBuf, WatchNode>,
}

impl PathTree {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn contains(&self, path: &Path) -> bool {
        self.nodes.contains_key(path)
    }

    pub fn get(&self, path: &Path) -> Option<&WatchNode> {
        self.nodes.get(path)
    }

    /// All nodes in path order
    pub fn nodes(&self) -> impl Iterator<Item = &WatchNode> {
        self.nodes.values()
    }

    /// Nodes without a watched ancestor
    pub fn roots(&self) -> impl Iterator<Item = &WatchNode> {
        self.nodes.values().filter(|node| node.parent.is_none())
    }

    /// Nearest watched strict ancestor of `path`
    pub fn nearest_ancestor(&self, path: &Path) -> Option<&WatchNode> {
        path.ancestors().skip(1).find_map(|p| self.nodes.get(p))
    }

    /// Nearest recursive node that is `path` itself or one of its ancestors
    pub fn recursive_cover(&self, path: &Path) -> Option<&WatchNode> {
        path.ancestors()
            .filter_map(|p| self.nodes.get(p))
            .find(|node| node.recursive)
    }

    /// Node paths at or below `path`, in path order
    pub fn subtree_paths(&self, path: &Path) -> Vec<PathBuf> {
        self.nodes
            .range::<Path, _>((Bound::Included(path), Bound::Unbounded))
            .map(|(p, _)| p)
            .take_while(|p| p.starts_with(path))
            .cloned()
            .collect()
    }

    /// Insert a node, linking it under its nearest watched ancestor
    ///
    /// Existing nodes below `path` that were attached higher up (or were
    /// roots) are re-parented onto the new node. Replaces an existing node
    /// at the same path, keeping its children.
    pub fn insert(&mut self, path: PathBuf, recursive: bool, handle: SubscriptionHandle) {
        if let Some(existing) = self.nodes.get_mut(&path) {
            existing.recursive = recursive;
            existing.handle = handle;
            return;
        }

        let parent = self.nearest_ancestor(&path).map(|node| node.path.clone());

        // Adopt descendants whose nearest ancestor is now the new node
        let mut adopted = BTreeSet::new();
        for candidate in self.subtree_paths(&path) {
            let node = &self.nodes[&candidate];
            if node.parent == parent {
                adopted.insert(candidate);
            }
        }
        for child in &adopted {
            if let Some(node) = self.nodes.get_mut(child) {
                node.parent = Some(path.clone());
            }
            if let Some(old_parent) = parent.as_ref().and_then(|p| self.nodes.get_mut(p)) {
                old_parent.children.remove(child);
            }
        }

        if let Some(parent_node) = parent.as_ref().and_then(|p| self.nodes.get_mut(p)) {
            parent_node.children.insert(path.clone());
        }

        self.nodes.insert(
            path.clone(),
            WatchNode {
                path,
                recursive,
                parent,
                children: adopted,
                handle,
            },
        );
    }

    /// Remove `path` and every node below it
    ///
    /// Returns the removed nodes in path order (empty if nothing was watched
    /// at or below `path`).
    pub fn remove_subtree(&mut self, path: &Path) -> Vec<WatchNode> {
        let doomed = self.subtree_paths(path);
        let mut removed = Vec::with_capacity(doomed.len());

        for key in doomed {
            if let Some(node) = self.nodes.remove(&key) {
                removed.push(node);
            }
        }

        // Detach removed tops from surviving parents
        for node in &removed {
            if let Some(parent) = node.parent.as_ref().and_then(|p| self.nodes.get_mut(p)) {
                parent.children.remove(&node.path);
            }
        }

        removed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn handle(n: u64) -> SubscriptionHandle {
        SubscriptionHandle::new(n)
    }

    #[test]
    fn test_insert_links_parent_and_children() {
        let mut tree = PathTree::new();
        tree.insert(PathBuf::from("/tmp/a"), true, handle(1));
        tree.insert(PathBuf::from("/tmp/a/b"), true, handle(2));
        tree.insert(PathBuf::from("/tmp/a/b/c"), true, handle(3));

        let b = tree.get(Path::new("/tmp/a/b")).unwrap();
        assert_eq!(b.parent.as_deref(), Some(Path::new("/tmp/a")));
        assert!(b.children.contains(Path::new("/tmp/a/b/c")));

        let roots: Vec<_> = tree.roots().map(|n| n.path.clone()).collect();
        assert_eq!(roots, vec![PathBuf::from("/tmp/a")]);
    }

    #[test]
    fn test_insert_ancestor_adopts_existing_roots() {
        let mut tree = PathTree::new();
        tree.insert(PathBuf::from("/tmp/a/b"), false, handle(1));
        tree.insert(PathBuf::from("/tmp/a/c"), false, handle(2));
        tree.insert(PathBuf::from("/tmp/ab"), false, handle(3));

        tree.insert(PathBuf::from("/tmp/a"), true, handle(4));

        let a = tree.get(Path::new("/tmp/a")).unwrap();
        assert_eq!(a.children.len(), 2);
        assert_eq!(
            tree.get(Path::new("/tmp/a/b")).unwrap().parent.as_deref(),
            Some(Path::new("/tmp/a"))
        );
        // Sibling with a shared string prefix stays a root
        assert!(tree.get(Path::new("/tmp/ab")).unwrap().parent.is_none());
    }

    #[test]
    fn test_recursive_cover() {
        let mut tree = PathTree::new();
        tree.insert(PathBuf::from("/tmp/a"), true, handle(1));
        tree.insert(PathBuf::from("/tmp/x"), false, handle(2));

        assert_eq!(
            tree.recursive_cover(Path::new("/tmp/a/deep/er")).map(|n| n.path.clone()),
            Some(PathBuf::from("/tmp/a"))
        );
        assert!(tree.recursive_cover(Path::new("/tmp/x/y")).is_none());
        assert!(tree.recursive_cover(Path::new("/tmp/ab")).is_none());
    }

    #[test]
    fn test_remove_subtree_cascades() {
        let mut tree = PathTree::new();
        tree.insert(PathBuf::from("/tmp/a"), true, handle(1));
        tree.insert(PathBuf::from("/tmp/a/b"), true, handle(2));
        tree.insert(PathBuf::from("/tmp/a/b/c"), true, handle(3));
        tree.insert(PathBuf::from("/tmp/a/bc"), true, handle(4));

        let removed = tree.remove_subtree(Path::new("/tmp/a/b"));
        let removed_paths: Vec<_> = removed.iter().map(|n| n.path.clone()).collect();

        assert_eq!(
            removed_paths,
            vec![PathBuf::from("/tmp/a/b"), PathBuf::from("/tmp/a/b/c")]
        );
        assert!(tree.contains(Path::new("/tmp/a/bc")));
        let a = tree.get(Path::new("/tmp/a")).unwrap();
        assert!(!a.children.contains(Path::new("/tmp/a/b")));
        assert!(a.children.contains(Path::new("/tmp/a/bc")));
    }

    #[test]
    fn test_remove_unwatched_is_empty() {
        let mut tree = PathTree::new();
        tree.insert(PathBuf::from("/tmp/a"), false, handle(1));

        assert!(tree.remove_subtree(Path::new("/tmp/zzz")).is_empty());
        assert_eq!(tree.len(), 1);
    }
}
