//! Storage traits for the object graph and its refs.
//!
//! The two concerns are deliberately separate, mirroring the split between a
//! content-addressed blob side (no ordering, no history, trivially cachable)
//! and a small mutable ref side whose only primitive is compare-and-swap.
//! Everything takes `&self`: implementations synchronize internally, and the
//! ref CAS is the single serialization point between concurrent callers.

pub mod memory;

use std::cell::RefCell;
use std::collections::HashMap;

use crate::error::StorageError;
use crate::id::ObjectId;
use crate::object::{Blob, Commit, Object, Tree};
use crate::refs::RefName;

/// Read/write access to immutable, content-addressed objects.
pub trait ObjectGraph {
    /// Fetches an object, or `None` if it is not present.
    fn get(&self, id: &ObjectId) -> Result<Option<Object>, StorageError>;

    /// Stores an object and returns its content address.
    fn insert(&self, object: Object) -> Result<ObjectId, StorageError>;

    fn contains(&self, id: &ObjectId) -> Result<bool, StorageError> {
        Ok(self.get(id)?.is_some())
    }

    fn blob(&self, id: &ObjectId) -> Result<Blob, StorageError> {
        match self.get(id)? {
            Some(Object::Blob(b)) => Ok(b),
            Some(_) => Err(StorageError::NotABlob(*id)),
            None => Err(StorageError::MissingObject(*id)),
        }
    }

    fn tree(&self, id: &ObjectId) -> Result<Tree, StorageError> {
        match self.get(id)? {
            Some(Object::Tree(t)) => Ok(t),
            Some(_) => Err(StorageError::NotATree(*id)),
            None => Err(StorageError::MissingObject(*id)),
        }
    }

    fn commit(&self, id: &ObjectId) -> Result<Commit, StorageError> {
        match self.get(id)? {
            Some(Object::Commit(c)) => Ok(c),
            Some(_) => Err(StorageError::NotACommit(*id)),
            None => Err(StorageError::MissingObject(*id)),
        }
    }

    /// Like [`ObjectGraph::commit`] but treats a missing object or a
    /// non-commit as `None`, for callers that report rather than fail.
    fn try_commit(&self, id: &ObjectId) -> Result<Option<Commit>, StorageError> {
        match self.get(id)? {
            Some(Object::Commit(c)) => Ok(Some(c)),
            _ => Ok(None),
        }
    }

    fn put_blob(&self, blob: Blob) -> Result<ObjectId, StorageError> {
        self.insert(Object::Blob(blob))
    }

    fn put_tree(&self, tree: Tree) -> Result<ObjectId, StorageError> {
        self.insert(Object::Tree(tree))
    }

    fn put_commit(&self, commit: Commit) -> Result<ObjectId, StorageError> {
        self.insert(Object::Commit(commit))
    }
}

/// One compare-and-swap command against a ref.
///
/// `expected_old == None` asserts the ref is absent (first creation);
/// `new == None` requests deletion. `force` permits a non-fast-forward move
/// and is only set by callers that deal in single-object refs or history
/// rewrites.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RefUpdate {
    pub name: RefName,
    pub expected_old: Option<ObjectId>,
    pub new: Option<ObjectId>,
    pub force: bool,
}

/// Outcome of a single ref compare-and-swap.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RefUpdateOutcome {
    New,
    FastForward,
    Forced,
    NoChange,
    Deleted,
    /// The ref's current value did not match `expected_old`. Carries both
    /// sides for the external retry loop.
    LockFailure {
        expected: Option<ObjectId>,
        actual: Option<ObjectId>,
    },
    /// The new tip does not descend from the old one and `force` was unset.
    RejectedNonFastForward,
}

impl RefUpdateOutcome {
    pub fn is_applied(&self) -> bool {
        !matches!(
            self,
            RefUpdateOutcome::LockFailure { .. } | RefUpdateOutcome::RejectedNonFastForward
        )
    }
}

/// Mutable ref storage with compare-and-swap semantics.
pub trait RefStore {
    fn resolve(&self, name: &RefName) -> Result<Option<ObjectId>, StorageError>;

    /// All refs whose name starts with `prefix`, in name order.
    fn refs_with_prefix(&self, prefix: &str) -> Result<Vec<(RefName, ObjectId)>, StorageError>;

    fn compare_and_swap(&self, update: &RefUpdate) -> Result<RefUpdateOutcome, StorageError>;

    /// Applies a batch of commands atomically within this repository: every
    /// command is validated against the current ref values first, and if any
    /// would fail, nothing is applied. The returned outcomes parallel the
    /// input order.
    fn compare_and_swap_batch(
        &self,
        updates: &[RefUpdate],
    ) -> Result<Vec<RefUpdateOutcome>, StorageError>;
}

/// A full repository: objects plus refs.
pub trait Repository: ObjectGraph + RefStore {}

impl<T: ObjectGraph + RefStore + ?Sized> Repository for T {}

/// Read-through overlay that diverts writes into a throwaway buffer.
///
/// Used for dry-run merges: predicates such as `can_merge` must produce and
/// inspect merge trees without polluting the shared graph. Reads fall through
/// to the underlying graph; inserts stay local and are dropped with the
/// scratch.
pub struct ScratchGraph<'a, G: ObjectGraph + ?Sized> {
    base: &'a G,
    local: RefCell<HashMap<ObjectId, Object>>,
}

impl<'a, G: ObjectGraph + ?Sized> ScratchGraph<'a, G> {
    pub fn new(base: &'a G) -> Self {
        ScratchGraph {
            base,
            local: RefCell::new(HashMap::new()),
        }
    }
}

impl<G: ObjectGraph + ?Sized> ObjectGraph for ScratchGraph<'_, G> {
    fn get(&self, id: &ObjectId) -> Result<Option<Object>, StorageError> {
        if let Some(obj) = self.local.borrow().get(id) {
            return Ok(Some(obj.clone()));
        }
        self.base.get(id)
    }

    fn insert(&self, object: Object) -> Result<ObjectId, StorageError> {
        let id = object.id();
        self.local.borrow_mut().insert(id, object);
        Ok(id)
    }
}
