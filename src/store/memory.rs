//! In-memory [`Repository`] for tests and ephemeral embedding.
//!
//! All state lives behind one `RwLock`, which also gives the batch CAS its
//! within-repository atomicity: validation and application of a batch happen
//! under a single write guard.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::RwLock;

use crate::error::StorageError;
use crate::id::ObjectId;
use crate::object::Object;
use crate::refs::RefName;
use crate::store::{ObjectGraph, RefStore, RefUpdate, RefUpdateOutcome};

#[derive(Debug, Default)]
struct Inner {
    objects: HashMap<ObjectId, Object>,
    refs: BTreeMap<String, ObjectId>,
}

impl Inner {
    /// Commit-graph ancestry test used to classify fast-forwards.
    fn is_ancestor(&self, ancestor: &ObjectId, descendant: &ObjectId) -> bool {
        let mut queue = vec![*descendant];
        let mut seen = HashSet::new();
        while let Some(id) = queue.pop() {
            if id == *ancestor {
                return true;
            }
            if !seen.insert(id) {
                continue;
            }
            if let Some(Object::Commit(c)) = self.objects.get(&id) {
                queue.extend(c.parents.iter().copied());
            }
        }
        false
    }

    /// Classifies one command against current state without applying it.
    fn evaluate(&self, update: &RefUpdate) -> Result<RefUpdateOutcome, StorageError> {
        let actual = self.refs.get(update.name.as_str()).copied();
        if actual != update.expected_old {
            return Ok(RefUpdateOutcome::LockFailure {
                expected: update.expected_old,
                actual,
            });
        }
        let Some(new) = update.new else {
            return Ok(match actual {
                Some(_) => RefUpdateOutcome::Deleted,
                None => RefUpdateOutcome::NoChange,
            });
        };
        if !self.objects.contains_key(&new) {
            return Err(StorageError::MissingObject(new));
        }
        Ok(match actual {
            None => RefUpdateOutcome::New,
            Some(old) if old == new => RefUpdateOutcome::NoChange,
            Some(old) if self.is_ancestor(&old, &new) => RefUpdateOutcome::FastForward,
            Some(_) if update.force => RefUpdateOutcome::Forced,
            Some(_) => RefUpdateOutcome::RejectedNonFastForward,
        })
    }

    fn apply(&mut self, update: &RefUpdate) {
        match update.new {
            Some(new) => {
                self.refs.insert(update.name.as_str().to_owned(), new);
            }
            None => {
                self.refs.remove(update.name.as_str());
            }
        }
    }
}

/// Thread-safe in-memory repository.
#[derive(Debug, Default)]
pub struct MemoryRepository {
    inner: RwLock<Inner>,
}

impl MemoryRepository {
    pub fn new() -> Self {
        MemoryRepository::default()
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, Inner> {
        self.inner.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, Inner> {
        self.inner.write().unwrap_or_else(|e| e.into_inner())
    }
}

impl ObjectGraph for MemoryRepository {
    fn get(&self, id: &ObjectId) -> Result<Option<Object>, StorageError> {
        Ok(self.read().objects.get(id).cloned())
    }

    fn insert(&self, object: Object) -> Result<ObjectId, StorageError> {
        let id = object.id();
        self.write().objects.insert(id, object);
        Ok(id)
    }
}

impl RefStore for MemoryRepository {
    fn resolve(&self, name: &RefName) -> Result<Option<ObjectId>, StorageError> {
        Ok(self.read().refs.get(name.as_str()).copied())
    }

    fn refs_with_prefix(&self, prefix: &str) -> Result<Vec<(RefName, ObjectId)>, StorageError> {
        Ok(self
            .read()
            .refs
            .range(prefix.to_owned()..)
            .take_while(|(name, _)| name.starts_with(prefix))
            .map(|(name, id)| (RefName::new(name.clone()), *id))
            .collect())
    }

    fn compare_and_swap(&self, update: &RefUpdate) -> Result<RefUpdateOutcome, StorageError> {
        let mut inner = self.write();
        let outcome = inner.evaluate(update)?;
        if outcome.is_applied() {
            inner.apply(update);
        }
        Ok(outcome)
    }

    fn compare_and_swap_batch(
        &self,
        updates: &[RefUpdate],
    ) -> Result<Vec<RefUpdateOutcome>, StorageError> {
        let mut inner = self.write();
        let mut outcomes = Vec::with_capacity(updates.len());
        let mut all_ok = true;
        for update in updates {
            let outcome = inner.evaluate(update)?;
            all_ok &= outcome.is_applied();
            outcomes.push(outcome);
        }
        if all_ok {
            for update in updates {
                inner.apply(update);
            }
        }
        Ok(outcomes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object::{Blob, Commit, Tree};
    use crate::ident::PersonIdent;

    fn ident() -> PersonIdent {
        PersonIdent {
            name: "tester".into(),
            email: "t@example.com".into(),
            when_secs: 0,
        }
    }

    fn empty_commit(store: &MemoryRepository, parents: Vec<ObjectId>, msg: &str) -> ObjectId {
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
    fn cas_detects_stale_expected_value() {
        let store = MemoryRepository::new();
        let c1 = empty_commit(&store, vec![], "one");
        let c2 = empty_commit(&store, vec![c1], "two");
        let name = RefName::from("refs/changes/01/1/meta");

        let outcome = store
            .compare_and_swap(&RefUpdate {
                name: name.clone(),
                expected_old: None,
                new: Some(c1),
                force: false,
            })
            .unwrap();
        assert_eq!(outcome, RefUpdateOutcome::New);

        // A second first-creation loses and reports the actual tip.
        let outcome = store
            .compare_and_swap(&RefUpdate {
                name: name.clone(),
                expected_old: None,
                new: Some(c2),
                force: false,
            })
            .unwrap();
        assert_eq!(
            outcome,
            RefUpdateOutcome::LockFailure {
                expected: None,
                actual: Some(c1),
            }
        );

        let outcome = store
            .compare_and_swap(&RefUpdate {
                name: name.clone(),
                expected_old: Some(c1),
                new: Some(c2),
                force: false,
            })
            .unwrap();
        assert_eq!(outcome, RefUpdateOutcome::FastForward);
        assert_eq!(store.resolve(&name).unwrap(), Some(c2));
    }

    #[test]
    fn non_fast_forward_requires_force() {
        let store = MemoryRepository::new();
        let c1 = empty_commit(&store, vec![], "one");
        let side = empty_commit(&store, vec![], "side");
        let name = RefName::from("refs/heads/main");

        store
            .compare_and_swap(&RefUpdate {
                name: name.clone(),
                expected_old: None,
                new: Some(c1),
                force: false,
            })
            .unwrap();

        let outcome = store
            .compare_and_swap(&RefUpdate {
                name: name.clone(),
                expected_old: Some(c1),
                new: Some(side),
                force: false,
            })
            .unwrap();
        assert_eq!(outcome, RefUpdateOutcome::RejectedNonFastForward);
        assert_eq!(store.resolve(&name).unwrap(), Some(c1));

        let outcome = store
            .compare_and_swap(&RefUpdate {
                name: name.clone(),
                expected_old: Some(c1),
                new: Some(side),
                force: true,
            })
            .unwrap();
        assert_eq!(outcome, RefUpdateOutcome::Forced);
    }

    #[test]
    fn batch_is_all_or_nothing() {
        let store = MemoryRepository::new();
        let c1 = empty_commit(&store, vec![], "one");
        let a = RefName::from("refs/changes/01/1/meta");
        let b = RefName::from("refs/changes/02/2/meta");

        store
            .compare_and_swap(&RefUpdate {
                name: a.clone(),
                expected_old: None,
                new: Some(c1),
                force: false,
            })
            .unwrap();

        // Second command is stale, so the first must not apply either.
        let outcomes = store
            .compare_and_swap_batch(&[
                RefUpdate {
                    name: b.clone(),
                    expected_old: None,
                    new: Some(c1),
                    force: false,
                },
                RefUpdate {
                    name: a.clone(),
                    expected_old: None,
                    new: Some(c1),
                    force: false,
                },
            ])
            .unwrap();
        assert!(outcomes[0].is_applied());
        assert!(!outcomes[1].is_applied());
        assert_eq!(store.resolve(&b).unwrap(), None);
    }

    #[test]
    fn prefix_listing_is_bounded() {
        let store = MemoryRepository::new();
        let c1 = empty_commit(&store, vec![], "one");
        let blob = store.put_blob(Blob::new(&b"draft"[..])).unwrap();
        for name in [
            "refs/changes/01/1/1",
            "refs/changes/01/1/meta",
            "refs/draft-comments/01/1/1000001",
        ] {
            store
                .compare_and_swap(&RefUpdate {
                    name: RefName::from(name),
                    expected_old: None,
                    new: Some(if name.starts_with("refs/draft") { blob } else { c1 }),
                    force: false,
                })
                .unwrap();
        }
        let listed = store.refs_with_prefix("refs/changes/01/1/").unwrap();
        assert_eq!(listed.len(), 2);
        assert_eq!(listed[0].0.as_str(), "refs/changes/01/1/1");
    }
}
