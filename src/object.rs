//! The immutable object model: blobs, trees and commits.
//!
//! Objects are value types with a canonical byte encoding; their identity is
//! the hash of that encoding (see [`ObjectId::hash`]). Decoding is strict and
//! must round-trip byte-exactly, since a re-encoded object that drifted from
//! its stored bytes would silently change identity.
//!
//! Trees are flat: one entry per full path. The metadata trees this store
//! manages are shallow, and flat paths keep three-way merging canonical;
//! no directory boundary cases, a path either maps to a blob or is absent.

use std::collections::BTreeMap;

use bytes::Bytes;

use crate::error::StorageError;
use crate::id::ObjectId;
use crate::ident::PersonIdent;

/// An uninterpreted byte payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Blob {
    pub bytes: Bytes,
}

impl Blob {
    pub fn new(bytes: impl Into<Bytes>) -> Self {
        Blob { bytes: bytes.into() }
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn id(&self) -> ObjectId {
        ObjectId::hash("blob", &self.bytes)
    }
}

/// An ordered mapping of full paths to blob ids.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Tree {
    entries: BTreeMap<String, ObjectId>,
}

impl Tree {
    pub fn new() -> Self {
        Tree::default()
    }

    pub fn get(&self, path: &str) -> Option<ObjectId> {
        self.entries.get(path).copied()
    }

    pub fn insert(&mut self, path: impl Into<String>, id: ObjectId) {
        self.entries.insert(path.into(), id);
    }

    pub fn remove(&mut self, path: &str) -> Option<ObjectId> {
        self.entries.remove(path)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, ObjectId)> {
        self.entries.iter().map(|(p, id)| (p.as_str(), *id))
    }

    pub fn paths(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Canonical encoding: `"<hex> <path>\n"` per entry in path order.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::new();
        for (path, id) in &self.entries {
            out.extend_from_slice(id.to_hex().as_bytes());
            out.push(b' ');
            out.extend_from_slice(path.as_bytes());
            out.push(b'\n');
        }
        out
    }

    pub fn decode(raw: &[u8]) -> Result<Self, StorageError> {
        let text = std::str::from_utf8(raw)
            .map_err(|_| StorageError::Corrupt("tree is not utf-8".into()))?;
        let mut entries = BTreeMap::new();
        for line in text.lines() {
            let (hex, path) = line
                .split_once(' ')
                .ok_or_else(|| StorageError::Corrupt(format!("bad tree entry: {line:?}")))?;
            let id = ObjectId::from_hex(hex)
                .map_err(|_| StorageError::Corrupt(format!("bad tree entry id: {hex:?}")))?;
            if path.is_empty() || entries.insert(path.to_owned(), id).is_some() {
                return Err(StorageError::Corrupt(format!("bad tree entry: {line:?}")));
            }
        }
        Ok(Tree { entries })
    }

    pub fn id(&self) -> ObjectId {
        ObjectId::hash("tree", &self.encode())
    }
}

/// One revision of a tree, linked to its predecessors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Commit {
    pub tree: ObjectId,
    pub parents: Vec<ObjectId>,
    pub author: PersonIdent,
    pub committer: PersonIdent,
    pub message: String,
}

impl Commit {
    pub fn first_parent(&self) -> Option<ObjectId> {
        self.parents.first().copied()
    }

    /// First line of the message.
    pub fn subject(&self) -> &str {
        self.message.lines().next().unwrap_or("")
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = String::new();
        out.push_str("tree ");
        out.push_str(&self.tree.to_hex());
        out.push('\n');
        for p in &self.parents {
            out.push_str("parent ");
            out.push_str(&p.to_hex());
            out.push('\n');
        }
        out.push_str(&format!("author {}\n", self.author));
        out.push_str(&format!("committer {}\n", self.committer));
        out.push('\n');
        out.push_str(&self.message);
        out.into_bytes()
    }

    pub fn decode(raw: &[u8]) -> Result<Self, StorageError> {
        let text = std::str::from_utf8(raw)
            .map_err(|_| StorageError::Corrupt("commit is not utf-8".into()))?;
        let (header, message) = text
            .split_once("\n\n")
            .ok_or_else(|| StorageError::Corrupt("commit has no message separator".into()))?;

        let mut tree = None;
        let mut parents = Vec::new();
        let mut author = None;
        let mut committer = None;
        for line in header.lines() {
            let (key, value) = line
                .split_once(' ')
                .ok_or_else(|| StorageError::Corrupt(format!("bad commit header: {line:?}")))?;
            match key {
                "tree" => {
                    tree = Some(parse_id(value)?);
                }
                "parent" => parents.push(parse_id(value)?),
                "author" => author = Some(parse_ident(value)?),
                "committer" => committer = Some(parse_ident(value)?),
                _ => {
                    return Err(StorageError::Corrupt(format!(
                        "unknown commit header: {key:?}"
                    )))
                }
            }
        }
        Ok(Commit {
            tree: tree.ok_or_else(|| StorageError::Corrupt("commit without tree".into()))?,
            parents,
            author: author
                .ok_or_else(|| StorageError::Corrupt("commit without author".into()))?,
            committer: committer
                .ok_or_else(|| StorageError::Corrupt("commit without committer".into()))?,
            message: message.to_owned(),
        })
    }

    pub fn id(&self) -> ObjectId {
        ObjectId::hash("commit", &self.encode())
    }
}

fn parse_id(hex: &str) -> Result<ObjectId, StorageError> {
    ObjectId::from_hex(hex).map_err(|_| StorageError::Corrupt(format!("bad object id: {hex:?}")))
}

/// Parses `name <email> secs`. The name may contain spaces, so the line is
/// pulled apart from the right.
fn parse_ident(value: &str) -> Result<PersonIdent, StorageError> {
    let corrupt = || StorageError::Corrupt(format!("bad ident: {value:?}"));
    let (rest, secs) = value.rsplit_once(' ').ok_or_else(corrupt)?;
    let when_secs: i64 = secs.parse().map_err(|_| corrupt())?;
    let rest = rest.strip_suffix('>').ok_or_else(corrupt)?;
    let (name, email) = rest.rsplit_once(" <").ok_or_else(corrupt)?;
    Ok(PersonIdent {
        name: name.to_owned(),
        email: email.to_owned(),
        when_secs,
    })
}

/// Any stored object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Object {
    Blob(Blob),
    Tree(Tree),
    Commit(Commit),
}

impl Object {
    pub fn id(&self) -> ObjectId {
        match self {
            Object::Blob(b) => b.id(),
            Object::Tree(t) => t.id(),
            Object::Commit(c) => c.id(),
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Object::Blob(_) => "blob",
            Object::Tree(_) => "tree",
            Object::Commit(_) => "commit",
        }
    }
}
