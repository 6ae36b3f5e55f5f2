//! The change record: the concrete metadata document tracked per change.
//!
//! Serialized layout inside the record tree:
//!
//! ```text
//! change                  key: value lines (status, owner, subject, ...)
//! patch-sets/<ordinal>    "<commit hex> <state>" per patch set
//! ```

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use crate::error::{DocumentError, StorageError};
use crate::id::ObjectId;
use crate::meta::{CommitSpec, DocumentStrategy, TreeEditor};
use crate::object::Tree;
use crate::store::ObjectGraph;

/// Stable numeric identity of a change; also selects its ref shard.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ChangeId(u64);

impl ChangeId {
    pub fn new(id: u64) -> Self {
        ChangeId(id)
    }

    pub fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ChangeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeStatus {
    New,
    Merged,
    Abandoned,
}

impl ChangeStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            ChangeStatus::New => "new",
            ChangeStatus::Merged => "merged",
            ChangeStatus::Abandoned => "abandoned",
        }
    }

    /// Whether the change still accepts new patch sets.
    pub fn is_open(self) -> bool {
        matches!(self, ChangeStatus::New)
    }
}

impl FromStr for ChangeStatus {
    type Err = StorageError;

    fn from_str(s: &str) -> Result<Self, StorageError> {
        match s {
            "new" => Ok(ChangeStatus::New),
            "merged" => Ok(ChangeStatus::Merged),
            "abandoned" => Ok(ChangeStatus::Abandoned),
            other => Err(StorageError::Corrupt(format!(
                "unknown change status {other:?}"
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PatchSetState {
    Active,
    Deleted,
}

impl PatchSetState {
    pub fn as_str(self) -> &'static str {
        match self {
            PatchSetState::Active => "active",
            PatchSetState::Deleted => "deleted",
        }
    }
}

impl FromStr for PatchSetState {
    type Err = StorageError;

    fn from_str(s: &str) -> Result<Self, StorageError> {
        match s {
            "active" => Ok(PatchSetState::Active),
            "deleted" => Ok(PatchSetState::Deleted),
            other => Err(StorageError::Corrupt(format!(
                "unknown patch set state {other:?}"
            ))),
        }
    }
}

/// One uploaded revision of a change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PatchSet {
    pub ordinal: u32,
    pub commit: ObjectId,
    pub state: PatchSetState,
}

/// Parsed state of a change record.
#[derive(Debug, Clone)]
pub struct Change {
    pub id: ChangeId,
    pub owner: String,
    pub subject: String,
    pub dest_branch: String,
    pub status: ChangeStatus,
    /// Ordinal of the current patch set; 0 only before the first patch set.
    pub current: u32,
    pub patch_sets: BTreeMap<u32, PatchSet>,
}

impl Change {
    pub fn new(id: ChangeId, owner: impl Into<String>, dest_branch: impl Into<String>) -> Self {
        Change {
            id,
            owner: owner.into(),
            subject: String::new(),
            dest_branch: dest_branch.into(),
            status: ChangeStatus::New,
            current: 0,
            patch_sets: BTreeMap::new(),
        }
    }

    pub fn current_patch_set(&self) -> Option<&PatchSet> {
        self.patch_sets.get(&self.current)
    }

    /// Active patch sets in ordinal order.
    pub fn active_patch_sets(&self) -> impl Iterator<Item = &PatchSet> {
        self.patch_sets
            .values()
            .filter(|ps| ps.state == PatchSetState::Active)
    }

    pub fn next_ordinal(&self) -> u32 {
        self.patch_sets.keys().next_back().copied().unwrap_or(0) + 1
    }

    /// Adds a patch set at the next ordinal and makes it current.
    pub fn add_patch_set(&mut self, commit: ObjectId) -> u32 {
        let ordinal = self.next_ordinal();
        self.patch_sets.insert(
            ordinal,
            PatchSet {
                ordinal,
                commit,
                state: PatchSetState::Active,
            },
        );
        self.current = ordinal;
        ordinal
    }
}

const CHANGE_FILE: &str = "change";
const PATCH_SET_DIR: &str = "patch-sets/";

fn patch_set_path(ordinal: u32) -> String {
    format!("{PATCH_SET_DIR}{ordinal}")
}

fn encode_change(change: &Change) -> String {
    let mut out = String::new();
    out.push_str(&format!("status: {}\n", change.status.as_str()));
    out.push_str(&format!("owner: {}\n", change.owner));
    out.push_str(&format!("subject: {}\n", change.subject));
    out.push_str(&format!("branch: {}\n", change.dest_branch));
    out.push_str(&format!("current: {}\n", change.current));
    out
}

fn decode_change(id: ChangeId, raw: &str) -> Result<Change, StorageError> {
    let mut change = Change::new(id, "", "");
    for line in raw.lines() {
        let (key, value) = line.split_once(": ").ok_or_else(|| {
            StorageError::Corrupt(format!("malformed change line {line:?}"))
        })?;
        match key {
            "status" => change.status = value.parse()?,
            "owner" => change.owner = value.to_owned(),
            "subject" => change.subject = value.to_owned(),
            "branch" => change.dest_branch = value.to_owned(),
            "current" => {
                change.current = value.parse().map_err(|_| {
                    StorageError::Corrupt(format!("bad current patch set {value:?}"))
                })?
            }
            other => {
                return Err(StorageError::Corrupt(format!(
                    "unknown change key {other:?}"
                )))
            }
        }
    }
    Ok(change)
}

fn encode_patch_set(ps: &PatchSet) -> String {
    format!("{} {}\n", ps.commit.to_hex(), ps.state.as_str())
}

fn decode_patch_set(ordinal: u32, raw: &str) -> Result<PatchSet, StorageError> {
    let line = raw.trim_end_matches('\n');
    let (hex, state) = line.split_once(' ').ok_or_else(|| {
        StorageError::Corrupt(format!("malformed patch set entry {line:?}"))
    })?;
    let commit = hex
        .parse()
        .map_err(|_| StorageError::Corrupt(format!("bad patch set commit id {hex:?}")))?;
    Ok(PatchSet {
        ordinal,
        commit,
        state: state.parse()?,
    })
}

/// [`DocumentStrategy`] for change records. Holds the change id (needed
/// before the record exists) and a staged commit message.
#[derive(Debug, Clone)]
pub struct ChangeStrategy {
    id: ChangeId,
    pending_message: Option<String>,
}

impl ChangeStrategy {
    pub fn new(id: ChangeId) -> Self {
        ChangeStrategy {
            id,
            pending_message: None,
        }
    }

    /// Sets the message of the next staged commit. Without one the next
    /// `write` declines to commit.
    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.pending_message = Some(message.into());
        self
    }
}

/// State paired with the message staged for the next commit; the message is
/// consumed by each `write` so stacked commits each name their own.
#[derive(Debug, Clone)]
pub struct ChangeState {
    pub change: Change,
    pub pending_message: Option<String>,
}

impl ChangeState {
    pub fn stage_message(&mut self, message: impl Into<String>) {
        self.pending_message = Some(message.into());
    }
}

impl DocumentStrategy for ChangeStrategy {
    type State = ChangeState;

    fn parse<G: ObjectGraph + ?Sized>(
        &self,
        graph: &G,
        tree: Option<&Tree>,
    ) -> Result<ChangeState, DocumentError> {
        let change = match tree {
            None => Change::new(self.id, "", ""),
            Some(tree) => {
                let change_blob = tree.get(CHANGE_FILE).ok_or_else(|| {
                    StorageError::Corrupt("change record tree has no change file".into())
                })?;
                let raw = graph.blob(&change_blob)?;
                let text = std::str::from_utf8(raw.as_bytes()).map_err(|_| {
                    StorageError::Corrupt("change file is not UTF-8".into())
                })?;
                let mut change = decode_change(self.id, text)?;
                for (path, blob_id) in tree.iter() {
                    let Some(ordinal) = path.strip_prefix(PATCH_SET_DIR) else {
                        continue;
                    };
                    let ordinal: u32 = ordinal.parse().map_err(|_| {
                        StorageError::Corrupt(format!("bad patch set path {path:?}"))
                    })?;
                    let blob = graph.blob(&blob_id)?;
                    let text = std::str::from_utf8(blob.as_bytes()).map_err(|_| {
                        StorageError::Corrupt(format!("patch set {ordinal} is not UTF-8"))
                    })?;
                    change
                        .patch_sets
                        .insert(ordinal, decode_patch_set(ordinal, text)?);
                }
                change
            }
        };
        Ok(ChangeState {
            change,
            pending_message: self.pending_message.clone(),
        })
    }

    fn prepare_commit<G: ObjectGraph + ?Sized>(
        &self,
        graph: &G,
        state: &mut ChangeState,
        editor: &mut TreeEditor,
    ) -> Result<Option<CommitSpec>, DocumentError> {
        let message = match state.pending_message.take() {
            Some(message) => message,
            None => return Ok(None),
        };

        editor.save(graph, CHANGE_FILE, encode_change(&state.change).as_bytes())?;
        // Rewrite every patch set entry; removed ordinals are deleted so
        // repairs that drop a patch set converge on the same tree.
        let staged: Vec<String> = editor
            .tree()
            .paths()
            .filter(|p| p.starts_with(PATCH_SET_DIR))
            .map(str::to_owned)
            .collect();
        for path in staged {
            let ordinal = path
                .strip_prefix(PATCH_SET_DIR)
                .and_then(|s| s.parse::<u32>().ok());
            let keep = ordinal.map_or(false, |o| state.change.patch_sets.contains_key(&o));
            if !keep {
                editor.delete(&path);
            }
        }
        for ps in state.change.patch_sets.values() {
            editor.save(
                graph,
                &patch_set_path(ps.ordinal),
                encode_patch_set(ps).as_bytes(),
            )?;
        }
        Ok(Some(CommitSpec::new(message)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::id::ObjectId;

    fn oid(byte: u8) -> ObjectId {
        ObjectId::from_bytes([byte; 32])
    }

    #[test]
    fn change_file_round_trip() {
        let mut change = Change::new(ChangeId::new(42), "alice", "refs/heads/main");
        change.subject = "Teach the walker about criss-cross merges".into();
        change.add_patch_set(oid(1));
        change.add_patch_set(oid(2));
        change.status = ChangeStatus::Merged;

        let decoded = decode_change(ChangeId::new(42), &encode_change(&change)).unwrap();
        assert_eq!(decoded.status, ChangeStatus::Merged);
        assert_eq!(decoded.owner, "alice");
        assert_eq!(decoded.subject, change.subject);
        assert_eq!(decoded.dest_branch, "refs/heads/main");
        assert_eq!(decoded.current, 2);
    }

    #[test]
    fn patch_set_entry_round_trip() {
        let ps = PatchSet {
            ordinal: 3,
            commit: oid(7),
            state: PatchSetState::Deleted,
        };
        let decoded = decode_patch_set(3, &encode_patch_set(&ps)).unwrap();
        assert_eq!(decoded, ps);
    }

    #[test]
    fn unknown_change_key_is_corrupt() {
        let err = decode_change(ChangeId::new(1), "status: new\ncolor: green\n").unwrap_err();
        assert!(matches!(err, StorageError::Corrupt(_)));
    }

    #[test]
    fn next_ordinal_skips_gaps() {
        let mut change = Change::new(ChangeId::new(1), "bob", "refs/heads/main");
        change.patch_sets.insert(
            5,
            PatchSet {
                ordinal: 5,
                commit: oid(9),
                state: PatchSetState::Active,
            },
        );
        assert_eq!(change.next_ordinal(), 6);
    }
}
