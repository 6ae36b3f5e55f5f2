//! The versioned-metadata commit protocol.
//!
//! A metadata document is one record stored as the tip of a linear commit
//! chain on a dedicated ref. The generic engine here owns the mechanics:
//! read the tree, apply path edits, elide no-op commits, advance the ref by
//! CAS. A [`DocumentStrategy`] value supplies the record-specific
//! parsing and serialization. The strategy is plain data passed in, not a
//! subclass hook, and the write context is an explicit value threaded
//! through each call.
//!
//! Writes support batching: several logical commits can be stacked on one
//! ref in memory ([`BatchDocumentUpdate::write`]) before a single physical
//! ref update, shrinking the CAS race window across multi-step operations.

use tracing::debug;

use crate::error::{DocumentError, LockFailure, StorageError, TransactionError};
use crate::id::ObjectId;
use crate::ident::PersonIdent;
use crate::object::{Blob, Commit, Tree};
use crate::refs::RefName;
use crate::store::{ObjectGraph, RefUpdate, RefUpdateOutcome, Repository};
use crate::txn::RefTransaction;

/// What a strategy wants committed, or `None` to skip the commit entirely
/// (a documented no-op path).
#[derive(Debug, Clone)]
pub struct CommitSpec {
    pub message: String,
    /// Author override; the committer and its timestamp always come from
    /// the identity the update was opened with.
    pub author: Option<PersonIdent>,
    /// Explicit result tree, bypassing the editor. Suppresses elision.
    pub tree: Option<ObjectId>,
    /// Forces the commit even if the tree is unchanged.
    pub allow_empty: bool,
}

impl CommitSpec {
    pub fn new(message: impl Into<String>) -> Self {
        CommitSpec {
            message: message.into(),
            author: None,
            tree: None,
            allow_empty: false,
        }
    }
}

/// Record-specific parse and serialize hooks, passed by value.
pub trait DocumentStrategy {
    type State;

    /// Builds the in-memory state from the tree at the loaded revision;
    /// `None` means the ref does not exist yet.
    fn parse<G: ObjectGraph + ?Sized>(
        &self,
        graph: &G,
        tree: Option<&Tree>,
    ) -> Result<Self::State, DocumentError>;

    /// Serializes pending state into `editor` and describes the commit, or
    /// returns `None` to decline committing.
    fn prepare_commit<G: ObjectGraph + ?Sized>(
        &self,
        graph: &G,
        state: &mut Self::State,
        editor: &mut TreeEditor,
    ) -> Result<Option<CommitSpec>, DocumentError>;
}

/// Mutable working copy of a record tree, edited path by path.
#[derive(Debug, Clone, Default)]
pub struct TreeEditor {
    tree: Tree,
}

impl TreeEditor {
    pub fn from_tree(tree: Option<&Tree>) -> Self {
        TreeEditor {
            tree: tree.cloned().unwrap_or_default(),
        }
    }

    /// Stores `raw` as a blob at `path`. An empty payload deletes the path.
    pub fn save<G: ObjectGraph + ?Sized>(
        &mut self,
        graph: &G,
        path: &str,
        raw: &[u8],
    ) -> Result<(), StorageError> {
        if raw.is_empty() {
            self.tree.remove(path);
        } else {
            let id = graph.put_blob(Blob::new(raw.to_vec()))?;
            self.tree.insert(path, id);
        }
        Ok(())
    }

    pub fn delete(&mut self, path: &str) {
        self.tree.remove(path);
    }

    pub fn tree(&self) -> &Tree {
        &self.tree
    }

    pub fn write_tree<G: ObjectGraph + ?Sized>(
        &self,
        graph: &G,
    ) -> Result<ObjectId, StorageError> {
        graph.put_tree(self.tree.clone())
    }
}

/// One versioned record bound to its ref, loaded state and observed tip.
#[derive(Debug)]
pub struct MetadataDocument<S: DocumentStrategy> {
    strategy: S,
    ref_name: RefName,
    tip: Option<ObjectId>,
    state: S::State,
}

impl<S: DocumentStrategy> MetadataDocument<S> {
    /// Loads the record from the current ref tip (absent ref loads the
    /// strategy's empty state).
    pub fn load<G: Repository + ?Sized>(
        graph: &G,
        strategy: S,
        ref_name: RefName,
    ) -> Result<Self, DocumentError> {
        let tip = graph.resolve(&ref_name)?;
        Self::load_at(graph, strategy, ref_name, tip)
    }

    /// Loads the record as of a specific commit. Useful for applying an
    /// update against the revision a user was shown; a concurrent move of
    /// the ref is then caught at commit time as a [`LockFailure`].
    pub fn load_at<G: Repository + ?Sized>(
        graph: &G,
        strategy: S,
        ref_name: RefName,
        at: Option<ObjectId>,
    ) -> Result<Self, DocumentError> {
        let tree = match at {
            Some(commit_id) => {
                let commit = graph.commit(&commit_id)?;
                Some(graph.tree(&commit.tree)?)
            }
            None => None,
        };
        let state = strategy.parse(graph, tree.as_ref())?;
        Ok(MetadataDocument {
            strategy,
            ref_name,
            tip: at,
            state,
        })
    }

    pub fn ref_name(&self) -> &RefName {
        &self.ref_name
    }

    /// The revision the record was loaded at; `None` before first creation.
    pub fn tip(&self) -> Option<ObjectId> {
        self.tip
    }

    pub fn state(&self) -> &S::State {
        &self.state
    }

    pub fn state_mut(&mut self) -> &mut S::State {
        &mut self.state
    }

    /// Opens a write cycle against the loaded revision.
    pub fn open_update<'a, G: Repository + ?Sized>(
        &'a mut self,
        graph: &'a G,
        committer: PersonIdent,
    ) -> Result<BatchDocumentUpdate<'a, G, S>, DocumentError> {
        let base_tree = match self.tip {
            Some(commit_id) => {
                let commit = graph.commit(&commit_id)?;
                Some(graph.tree(&commit.tree)?)
            }
            None => None,
        };
        let src_tree = base_tree.as_ref().map(Tree::id);
        Ok(BatchDocumentUpdate {
            graph,
            src: self.tip,
            src_tree,
            editor: TreeEditor::from_tree(base_tree.as_ref()),
            committer,
            doc: self,
        })
    }
}

/// An open write cycle: zero or more logical commits staged in memory,
/// finished by exactly one ref update (direct CAS or via a transaction).
pub struct BatchDocumentUpdate<'a, G: Repository + ?Sized, S: DocumentStrategy> {
    graph: &'a G,
    doc: &'a mut MetadataDocument<S>,
    committer: PersonIdent,
    editor: TreeEditor,
    /// Tip of the staged chain; starts at the loaded revision.
    src: Option<ObjectId>,
    src_tree: Option<ObjectId>,
}

impl<G: Repository + ?Sized, S: DocumentStrategy> BatchDocumentUpdate<'_, G, S> {
    /// Stages one logical commit. Returns `false` when the strategy declined
    /// or the commit was elided because it would not change the tree.
    pub fn write(&mut self) -> Result<bool, DocumentError> {
        let spec = match self.doc.strategy.prepare_commit(
            self.graph,
            &mut self.doc.state,
            &mut self.editor,
        )? {
            Some(spec) => spec,
            None => return Ok(false),
        };

        let edited_tree = self.editor.write_tree(self.graph)?;
        if Some(edited_tree) == self.src_tree && !spec.allow_empty && spec.tree.is_none() {
            // No content change: leave the chain (and later the ref) alone.
            return Ok(false);
        }
        let tree = spec.tree.unwrap_or(edited_tree);

        let commit = Commit {
            tree,
            parents: self.src.into_iter().collect(),
            author: spec.author.unwrap_or_else(|| self.committer.clone()),
            committer: self.committer.clone(),
            message: spec.message,
        };
        let id = self.graph.put_commit(commit)?;
        debug!(ref_name = %self.doc.ref_name, commit = %id.short(), "staged metadata commit");
        self.src = Some(id);
        self.src_tree = Some(tree);
        Ok(true)
    }

    /// Tip of the staged chain so far.
    pub fn staged_tip(&self) -> Option<ObjectId> {
        self.src
    }

    /// Record state, for staging further logical commits between writes.
    pub fn state(&self) -> &S::State {
        &self.doc.state
    }

    pub fn state_mut(&mut self) -> &mut S::State {
        &mut self.doc.state
    }

    /// Applies the staged chain with expected-old = the loaded revision.
    pub fn commit(self) -> Result<Option<ObjectId>, DocumentError> {
        let expected = self.doc.tip;
        self.commit_at(expected)
    }

    /// Applies the staged chain with an explicit expected-old value.
    pub fn commit_at(self, expected: Option<ObjectId>) -> Result<Option<ObjectId>, DocumentError> {
        if self.src == expected {
            // Nothing staged; never touch the ref.
            return Ok(self.src);
        }
        let update = RefUpdate {
            name: self.doc.ref_name.clone(),
            expected_old: expected,
            new: self.src,
            force: false,
        };
        match self.graph.compare_and_swap(&update)? {
            RefUpdateOutcome::LockFailure { expected, actual } => Err(LockFailure {
                name: self.doc.ref_name.clone(),
                expected,
                actual,
            }
            .into()),
            RefUpdateOutcome::RejectedNonFastForward => {
                Err(DocumentError::Rejected(self.doc.ref_name.clone()))
            }
            _ => {
                self.doc.tip = self.src;
                Ok(self.src)
            }
        }
    }

    /// Instead of updating the ref directly, enqueues the staged chain into
    /// `txn`. The document keeps its loaded tip; reload after the
    /// transaction executes.
    pub fn commit_to(self, txn: &mut RefTransaction<'_>) -> Result<Option<ObjectId>, TransactionError> {
        if self.src == self.doc.tip {
            return Ok(None);
        }
        let new = self.src.ok_or_else(|| {
            // Unreachable by construction: src only moves forward from tip.
            TransactionError::InvalidInput("staged chain has no tip".into())
        })?;
        txn.add_update(self.doc.ref_name.clone(), self.doc.tip, new)?;
        Ok(Some(new))
    }
}
