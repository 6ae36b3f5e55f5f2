//! Commit-graph walking helpers.
//!
//! These are plain functions over an [`ObjectGraph`]; they never mutate
//! traversal state on the commits themselves. Anything per-commit that a
//! caller wants to remember (merge status, conflict info) goes into an
//! explicit side table instead.

use std::collections::{HashSet, VecDeque};

use crate::error::StorageError;
use crate::id::ObjectId;
use crate::store::ObjectGraph;

pub fn parents<G: ObjectGraph + ?Sized>(
    graph: &G,
    id: &ObjectId,
) -> Result<Vec<ObjectId>, StorageError> {
    Ok(graph.commit(id)?.parents)
}

/// True if `ancestor` is reachable from `descendant` (inclusive).
pub fn is_ancestor<G: ObjectGraph + ?Sized>(
    graph: &G,
    ancestor: &ObjectId,
    descendant: &ObjectId,
) -> Result<bool, StorageError> {
    let mut queue = VecDeque::from([*descendant]);
    let mut seen = HashSet::new();
    while let Some(id) = queue.pop_front() {
        if id == *ancestor {
            return Ok(true);
        }
        if !seen.insert(id) {
            continue;
        }
        queue.extend(graph.commit(&id)?.parents);
    }
    Ok(false)
}

/// All commits reachable from `start`, including `start` itself.
pub fn ancestors<G: ObjectGraph + ?Sized>(
    graph: &G,
    start: &ObjectId,
) -> Result<HashSet<ObjectId>, StorageError> {
    let mut queue = VecDeque::from([*start]);
    let mut seen = HashSet::new();
    while let Some(id) = queue.pop_front() {
        if !seen.insert(id) {
            continue;
        }
        queue.extend(graph.commit(&id)?.parents);
    }
    Ok(seen)
}

/// Commits reachable from `start` but not from `exclude`, in breadth-first
/// order starting at `start`. Used to propagate an integration failure to
/// everything that depends on the failed commit.
pub fn unmerged<G: ObjectGraph + ?Sized>(
    graph: &G,
    start: &ObjectId,
    exclude: Option<&ObjectId>,
) -> Result<Vec<ObjectId>, StorageError> {
    let boundary = match exclude {
        Some(tip) => ancestors(graph, tip)?,
        None => HashSet::new(),
    };
    let mut queue = VecDeque::from([*start]);
    let mut seen = HashSet::new();
    let mut out = Vec::new();
    while let Some(id) = queue.pop_front() {
        if boundary.contains(&id) || !seen.insert(id) {
            continue;
        }
        out.push(id);
        queue.extend(graph.commit(&id)?.parents);
    }
    Ok(out)
}

/// The nearest common ancestors of `a` and `b`.
///
/// Zero results means unrelated histories; more than one means the caller
/// needs a recursive (virtual-base) merge or has to give up.
pub fn merge_bases<G: ObjectGraph + ?Sized>(
    graph: &G,
    a: &ObjectId,
    b: &ObjectId,
) -> Result<Vec<ObjectId>, StorageError> {
    let of_a = ancestors(graph, a)?;
    let of_b = ancestors(graph, b)?;
    let common: HashSet<ObjectId> = of_a.intersection(&of_b).copied().collect();
    if common.is_empty() {
        return Ok(Vec::new());
    }

    // The common set is closed under ancestry, so the merge bases are
    // exactly its maximal elements: commits with no child in the set.
    let mut has_common_child: HashSet<ObjectId> = HashSet::new();
    for id in &common {
        for parent in graph.commit(id)?.parents {
            if common.contains(&parent) {
                has_common_child.insert(parent);
            }
        }
    }
    let mut bases: Vec<ObjectId> = common
        .iter()
        .filter(|id| !has_common_child.contains(*id))
        .copied()
        .collect();
    bases.sort();
    Ok(bases)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ident::PersonIdent;
    use crate::object::{Commit, Tree};
    use crate::store::memory::MemoryRepository;

    fn ident() -> PersonIdent {
        PersonIdent {
            name: "tester".into(),
            email: "t@example.com".into(),
            when_secs: 0,
        }
    }

    fn commit(store: &MemoryRepository, parents: Vec<ObjectId>, msg: &str) -> ObjectId {
        let tree = store.put_tree(Tree::new()).unwrap();
        store
            .put_commit(Commit {
                tree,
                parents,
                author: ident(),
                committer: ident(),
                message: msg.into(),
            })
            .unwrap()
    }

    #[test]
    fn ancestry_and_merge_base() {
        let store = MemoryRepository::new();
        let root = commit(&store, vec![], "root");
        let a = commit(&store, vec![root], "a");
        let b = commit(&store, vec![root], "b");
        let m = commit(&store, vec![a, b], "merge");

        assert!(is_ancestor(&store, &root, &m).unwrap());
        assert!(is_ancestor(&store, &a, &m).unwrap());
        assert!(!is_ancestor(&store, &a, &b).unwrap());

        assert_eq!(merge_bases(&store, &a, &b).unwrap(), vec![root]);
        assert_eq!(merge_bases(&store, &m, &a).unwrap(), vec![a]);
    }

    #[test]
    fn criss_cross_has_two_bases() {
        let store = MemoryRepository::new();
        let root = commit(&store, vec![], "root");
        let x = commit(&store, vec![root], "x");
        let y = commit(&store, vec![root], "y");
        let xy = commit(&store, vec![x, y], "xy");
        let yx = commit(&store, vec![y, x], "yx");

        let mut bases = merge_bases(&store, &xy, &yx).unwrap();
        bases.sort();
        let mut expected = vec![x, y];
        expected.sort();
        assert_eq!(bases, expected);
    }

    #[test]
    fn unrelated_histories_have_no_base() {
        let store = MemoryRepository::new();
        let a = commit(&store, vec![], "a");
        let b = commit(&store, vec![], "b");
        assert!(merge_bases(&store, &a, &b).unwrap().is_empty());
    }

    #[test]
    fn unmerged_walk_respects_boundary() {
        let store = MemoryRepository::new();
        let root = commit(&store, vec![], "root");
        let a = commit(&store, vec![root], "a");
        let b = commit(&store, vec![a], "b");

        let pending = unmerged(&store, &b, Some(&root)).unwrap();
        assert_eq!(pending, vec![b, a]);
        assert!(unmerged(&store, &b, Some(&b)).unwrap().is_empty());
    }
}
