//! A transactional metadata store on a content-addressable commit graph.
//!
//! Review metadata (change records, patch set pointers, per-user drafts)
//! lives in the same kind of object graph as the code it describes: blobs,
//! flat trees and commits addressed by hash, with a small set of mutable
//! refs on top. Every record is the tip of a linear commit chain on its own
//! ref, so history, audit and replication come for free, and the only
//! concurrency primitive anywhere is the ref compare-and-swap.
//!
//! The crate splits into a storage substrate and four engines built on it:
//!
//! * [`meta`]: the versioned-document protocol: read a record's tree,
//!   mutate parsed state, commit back with CAS, eliding no-op commits.
//! * [`txn`]: atomic multi-ref transactions, spanning a primary and an
//!   optional secondary repository with primary-first ordering.
//! * [`merge`]: three-way tree and line merging, cherry-picks, conflict
//!   markers and the integration-queue evaluation built on them.
//! * [`check`]: validation and repair of a change's stored invariants,
//!   with every repair going through the ordinary write paths.
//!
//! Lost CAS races surface as [`error::LockFailure`]; retrying the whole
//! read-compute-write cycle is the caller's decision, never this crate's.

pub mod change;
pub mod check;
pub mod config;
pub mod error;
pub mod id;
pub mod ident;
pub mod merge;
pub mod meta;
pub mod object;
pub mod refs;
pub mod store;
pub mod txn;
pub mod walk;
