//! The persisted ref-name layout.
//!
//! Every change occupies a namespace under `refs/changes/` keyed by a 2-digit
//! shard (`id % 100`, bounding directory fan-out) followed by the numeric id:
//!
//! ```text
//! refs/changes/34/1234/meta   the record itself, a linear commit chain
//! refs/changes/34/1234/1      patch set 1, pointing at one immutable commit
//! refs/changes/34/1234/2      patch set 2
//! ```
//!
//! Per-user advisory state lives in the secondary repository under
//! `refs/draft-comments/`; those refs point at exactly one object and carry
//! no history, which is why they are the only refs permitted to move
//! non-fast-forward during ordinary updates.

use std::fmt;

use crate::change::ChangeId;

pub const CHANGES_PREFIX: &str = "refs/changes/";
pub const DRAFTS_PREFIX: &str = "refs/draft-comments/";
pub const META_SUFFIX: &str = "meta";

/// A named, mutable pointer into the object graph; the unit of CAS.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RefName(String);

impl RefName {
    pub fn new(name: impl Into<String>) -> Self {
        RefName(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RefName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for RefName {
    fn from(s: &str) -> Self {
        RefName(s.to_owned())
    }
}

impl From<String> for RefName {
    fn from(s: String) -> Self {
        RefName(s)
    }
}

/// 2-digit shard segment for a change id.
pub fn shard(id: ChangeId) -> String {
    format!("{:02}", id.get() % 100)
}

/// Prefix under which all of a change's refs live, including the trailing
/// slash: `refs/changes/NN/<id>/`.
pub fn change_prefix(id: ChangeId) -> String {
    format!("{}{}/{}/", CHANGES_PREFIX, shard(id), id.get())
}

/// Ref holding the change record's commit chain.
pub fn change_meta(id: ChangeId) -> RefName {
    RefName(format!("{}{}", change_prefix(id), META_SUFFIX))
}

/// Ref pointing at one patch set commit.
pub fn patch_set(id: ChangeId, ordinal: u32) -> RefName {
    RefName(format!("{}{}", change_prefix(id), ordinal))
}

/// Advisory single-object ref for one user's draft annotations on a change.
pub fn draft_comments(id: ChangeId, account: &str) -> RefName {
    RefName(format!(
        "{}{}/{}/{}",
        DRAFTS_PREFIX,
        shard(id),
        id.get(),
        account
    ))
}

/// Parses `refs/changes/NN/<id>/<ordinal>` back into its keys. Returns
/// `None` for meta refs, malformed names and inconsistent shards.
pub fn parse_patch_set(name: &RefName) -> Option<(ChangeId, u32)> {
    let rest = name.as_str().strip_prefix(CHANGES_PREFIX)?;
    let mut parts = rest.split('/');
    let shard_part = parts.next()?;
    let id: u64 = parts.next()?.parse().ok()?;
    let ordinal: u32 = parts.next()?.parse().ok()?;
    if parts.next().is_some() || shard_part != shard(ChangeId::new(id)) {
        return None;
    }
    Some((ChangeId::new(id), ordinal))
}

/// True for refs that point at exactly one object and carry no history.
/// These are exempt from the fast-forward requirement.
pub fn is_single_object(name: &RefName) -> bool {
    if name.as_str().starts_with(DRAFTS_PREFIX) {
        return true;
    }
    parse_patch_set(name).is_some()
}
