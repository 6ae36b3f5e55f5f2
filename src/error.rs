//! Error taxonomy.
//!
//! Fatal storage problems are errors; expected business outcomes are not.
//! A lost CAS race surfaces as [`LockFailure`] carrying the expected and
//! actual ids so an external retry policy can reload and re-run the whole
//! read-compute-write cycle; nothing in this crate retries internally.
//! Merge conflicts and checker findings travel as typed values
//! ([`MergeError::Conflict`] opted into, `Problem` records returned as data).

use thiserror::Error;

use crate::id::ObjectId;
use crate::refs::RefName;

/// Fatal failure of the underlying object graph.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("object missing: {0}")]
    MissingObject(ObjectId),
    #[error("not a commit: {0}")]
    NotACommit(ObjectId),
    #[error("not a tree: {0}")]
    NotATree(ObjectId),
    #[error("not a blob: {0}")]
    NotABlob(ObjectId),
    #[error("corrupt object: {0}")]
    Corrupt(String),
    #[error("ref {0} is empty")]
    EmptyRef(RefName),
    #[error("storage i/o: {0}")]
    Io(String),
}

/// A compare-and-swap lost to a concurrent writer. Expected and transient;
/// the caller reloads and retries, this crate only signals it.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("lock failure on {name}: expected {expected:?}, found {actual:?}")]
pub struct LockFailure {
    pub name: RefName,
    pub expected: Option<ObjectId>,
    pub actual: Option<ObjectId>,
}

/// Failure of a ref transaction.
#[derive(Debug, Error)]
pub enum TransactionError {
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error(transparent)]
    Lock(#[from] LockFailure),
    /// Malformed or conflicting queued operations, rejected before any I/O.
    #[error("invalid transaction input: {0}")]
    InvalidInput(String),
    #[error("ref update rejected on {0}")]
    Rejected(RefName),
    #[error("transaction has already been executed")]
    AlreadyExecuted,
}

impl From<DocumentError> for TransactionError {
    fn from(err: DocumentError) -> Self {
        match err {
            DocumentError::Storage(e) => TransactionError::Storage(e),
            DocumentError::Lock(l) => TransactionError::Lock(l),
            DocumentError::Rejected(name) => TransactionError::Rejected(name),
            DocumentError::Invalid(msg) => TransactionError::InvalidInput(msg),
        }
    }
}

/// Failure of a metadata document load or commit.
#[derive(Debug, Error)]
pub enum DocumentError {
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error(transparent)]
    Lock(#[from] LockFailure),
    #[error("ref update rejected on {0}")]
    Rejected(RefName),
    #[error("invalid document: {0}")]
    Invalid(String),
}

/// Failure or distinguished outcome of a merge operation. `Conflict` and
/// `IdenticalTree` are expected business outcomes the caller chooses a
/// policy for, not storage failures.
#[derive(Debug, Error)]
pub enum MergeError {
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error("{}", conflict_message(.files))]
    Conflict { files: Vec<String> },
    #[error("identical tree")]
    IdenticalTree,
    #[error("'{0}' has already been merged")]
    AlreadyMerged(ObjectId),
    #[error("multiple merge bases for {ours} and {theirs}")]
    MultipleMergeBases { ours: ObjectId, theirs: ObjectId },
    #[error("strategy {0} cannot produce conflict markers")]
    MarkersNotSupported(&'static str),
    #[error("cannot cherry-pick a root commit")]
    NoParentToPick,
}

fn conflict_message(files: &[String]) -> String {
    if files.is_empty() {
        // The path-level strategy does not report which files collided.
        return "merge conflict(s)".to_owned();
    }
    let mut msg = String::from("merge conflict(s):");
    for f in files {
        msg.push_str("\n* ");
        msg.push_str(f);
    }
    msg
}
