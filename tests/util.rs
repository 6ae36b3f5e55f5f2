#![allow(dead_code)]

use std::collections::HashSet;

use hifitime::Epoch;

use reviewdb::change::{ChangeId, ChangeStrategy};
use reviewdb::check::AccountDirectory;
use reviewdb::id::ObjectId;
use reviewdb::ident::{IdentityProvider, PersonIdent};
use reviewdb::meta::MetadataDocument;
use reviewdb::object::{Blob, Commit, Tree};
use reviewdb::refs;
use reviewdb::store::memory::MemoryRepository;
use reviewdb::store::{ObjectGraph, RefStore, RefUpdate};

pub fn ident(name: &str) -> PersonIdent {
    PersonIdent {
        name: name.to_owned(),
        email: format!("{name}@example.com"),
        when_secs: 1_700_000_000,
    }
}

/// Fixed identities and a frozen clock, so object ids are reproducible.
pub struct TestIdentity;

impl IdentityProvider for TestIdentity {
    fn actor(&self) -> PersonIdent {
        ident("alice")
    }

    fn server(&self) -> PersonIdent {
        ident("server")
    }

    fn now(&self) -> Epoch {
        Epoch::from_unix_seconds(1_700_000_000.0)
    }
}

pub struct TestAccounts(pub HashSet<String>);

impl TestAccounts {
    pub fn with(names: &[&str]) -> Self {
        TestAccounts(names.iter().map(|n| (*n).to_owned()).collect())
    }
}

impl AccountDirectory for TestAccounts {
    fn exists(&self, account: &str) -> bool {
        self.0.contains(account)
    }
}

/// Stores `files` as a tree of text blobs.
pub fn tree_with(repo: &MemoryRepository, files: &[(&str, &str)]) -> ObjectId {
    let mut tree = Tree::new();
    for (path, text) in files {
        let blob = repo.put_blob(Blob::new(text.as_bytes().to_vec())).unwrap();
        tree.insert(*path, blob);
    }
    repo.put_tree(tree).unwrap()
}

pub fn commit_with(
    repo: &MemoryRepository,
    parents: Vec<ObjectId>,
    files: &[(&str, &str)],
    message: &str,
) -> ObjectId {
    let tree = tree_with(repo, files);
    repo.put_commit(Commit {
        tree,
        parents,
        author: ident("alice"),
        committer: ident("alice"),
        message: message.to_owned(),
    })
    .unwrap()
}

pub fn set_ref(repo: &MemoryRepository, name: &str, target: ObjectId) {
    let current = repo.resolve(&name.into()).unwrap();
    let outcome = repo
        .compare_and_swap(&RefUpdate {
            name: name.into(),
            expected_old: current,
            new: Some(target),
            force: true,
        })
        .unwrap();
    assert!(outcome.is_applied(), "failed to set {name}: {outcome:?}");
}

/// Creates a change record with the given patch set commits (ordinals 1..),
/// pointing the patch set refs at them.
pub fn create_change(
    repo: &MemoryRepository,
    id: ChangeId,
    owner: &str,
    dest_branch: &str,
    patch_sets: &[ObjectId],
) {
    let mut doc = MetadataDocument::load(repo, ChangeStrategy::new(id), refs::change_meta(id))
        .expect("load new change");
    {
        let state = doc.state_mut();
        state.change.owner = owner.to_owned();
        state.change.dest_branch = dest_branch.to_owned();
        state.change.subject = format!("Change {id}");
        for commit in patch_sets {
            state.change.add_patch_set(*commit);
        }
        state.stage_message("Create change");
    }
    let mut update = doc.open_update(repo, ident("server")).unwrap();
    assert!(update.write().unwrap());
    update.commit().unwrap();

    for (i, commit) in patch_sets.iter().enumerate() {
        set_ref(repo, refs::patch_set(id, i as u32 + 1).as_str(), *commit);
    }
}

pub fn load_change(
    repo: &MemoryRepository,
    id: ChangeId,
) -> MetadataDocument<ChangeStrategy> {
    MetadataDocument::load(repo, ChangeStrategy::new(id), refs::change_meta(id))
        .expect("load change")
}
