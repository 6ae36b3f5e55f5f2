//! Content addresses for objects in the graph.
//!
//! Every object (blob, tree, commit) is identified by the BLAKE3 hash of its
//! canonical encoding, framed with the object kind so that a blob and a tree
//! with identical payload bytes can never collide.

use std::fmt;
use std::str::FromStr;

use hex::FromHex;

/// Length in bytes of an [`ObjectId`].
pub const OBJECT_ID_LEN: usize = 32;

/// A 32-byte BLAKE3 content address.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectId([u8; OBJECT_ID_LEN]);

impl ObjectId {
    pub fn from_bytes(bytes: [u8; OBJECT_ID_LEN]) -> Self {
        ObjectId(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; OBJECT_ID_LEN] {
        &self.0
    }

    /// Hashes `payload` framed by the object `kind` (e.g. `"blob"`).
    ///
    /// The framing is `kind SP decimal-length NUL payload`, so differently
    /// typed objects with equal payloads get distinct addresses.
    pub fn hash(kind: &str, payload: &[u8]) -> Self {
        let mut hasher = blake3::Hasher::new();
        hasher.update(kind.as_bytes());
        hasher.update(b" ");
        hasher.update(payload.len().to_string().as_bytes());
        hasher.update(b"\0");
        hasher.update(payload);
        ObjectId(*hasher.finalize().as_bytes())
    }

    pub fn from_hex(s: &str) -> Result<Self, ParseObjectIdError> {
        let raw = <[u8; OBJECT_ID_LEN]>::from_hex(s).map_err(|_| ParseObjectIdError)?;
        Ok(ObjectId(raw))
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Abbreviated hex form for log lines and conflict-marker labels.
    pub fn short(&self) -> String {
        hex::encode(&self.0[..5])
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ObjectId({})", self.short())
    }
}

impl FromStr for ObjectId {
    type Err = ParseObjectIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ObjectId::from_hex(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("not a valid object id")]
pub struct ParseObjectIdError;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_framing_distinguishes_object_types() {
        let a = ObjectId::hash("blob", b"payload");
        let b = ObjectId::hash("tree", b"payload");
        assert_ne!(a, b);
    }

    #[test]
    fn hex_round_trip() {
        let id = ObjectId::hash("blob", b"x");
        let parsed: ObjectId = id.to_hex().parse().unwrap();
        assert_eq!(id, parsed);
    }

    #[test]
    fn rejects_bad_hex() {
        assert!(ObjectId::from_hex("zz").is_err());
        assert!(ObjectId::from_hex("abcd").is_err());
    }
}
