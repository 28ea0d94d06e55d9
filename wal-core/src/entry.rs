//! Log slots and the Paxos state persisted in each one.

use std::fmt;

use bytes::Bytes;
use error_stack::{Report, ResultExt};
use serde::{Deserialize, Serialize};

use crate::error::DecodeError;

/// Partition key of the replicated log.
///
/// Commits are ordered and CAS-protected independently per entity group.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct EntityGroup(pub Bytes);

impl EntityGroup {
    #[must_use]
    pub fn new(bytes: impl Into<Bytes>) -> Self {
        Self(bytes.into())
    }

    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl From<&str> for EntityGroup {
    fn from(s: &str) -> Self {
        Self(Bytes::copy_from_slice(s.as_bytes()))
    }
}

impl fmt::Display for EntityGroup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match std::str::from_utf8(&self.0) {
            Ok(s) => f.write_str(s),
            Err(_) => {
                for b in self.0.iter() {
                    write!(f, "{b:02x}")?;
                }
                Ok(())
            }
        }
    }
}

/// One addressable log position.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Slot {
    pub entity_group: EntityGroup,
    pub wal_index: u64,
}

impl Slot {
    #[must_use]
    pub fn new(entity_group: impl Into<EntityGroup>, wal_index: u64) -> Self {
        Self {
            entity_group: entity_group.into(),
            wal_index,
        }
    }

    /// Storage row key: entity group bytes followed by the big-endian index.
    #[must_use]
    pub fn row_key(&self) -> Vec<u8> {
        let group = self.entity_group.as_bytes();
        let mut key = Vec::with_capacity(group.len() + 8);
        key.extend_from_slice(group);
        key.extend_from_slice(&self.wal_index.to_be_bytes());
        key
    }

    #[must_use]
    pub fn next(&self) -> Self {
        Self {
            entity_group: self.entity_group.clone(),
            wal_index: self.wal_index + 1,
        }
    }
}

impl fmt::Display for Slot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.entity_group, self.wal_index)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EntryStatus {
    /// A promise for proposal `n`; no value has been chosen.
    Prepared,
    /// A durably chosen value.
    Accepted,
}

/// Paxos state of a single slot.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct WalEntry {
    /// Proposal number. Doubles as the CAS token of the slot's row.
    pub n: u64,
    pub value: Option<Bytes>,
    pub status: EntryStatus,
}

impl WalEntry {
    /// A promise written by a successful prepare.
    #[must_use]
    pub fn promise(n: u64) -> Self {
        Self {
            n,
            value: None,
            status: EntryStatus::Prepared,
        }
    }

    #[must_use]
    pub fn accepted(n: u64, value: Option<Bytes>) -> Self {
        Self {
            n,
            value,
            status: EntryStatus::Accepted,
        }
    }

    #[must_use]
    pub fn is_accepted(&self) -> bool {
        self.status == EntryStatus::Accepted
    }

    /// Serialized form stored in the entry field of the slot's row.
    ///
    /// # Panics
    /// Never in practice: postcard cannot fail to encode this type into a `Vec`.
    #[must_use]
    pub fn to_bytes(&self) -> Bytes {
        Bytes::from(postcard::to_allocvec(self).expect("serialization should not fail"))
    }

    /// # Errors
    /// Returns [`DecodeError`] if `bytes` is not a serialized entry.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, Report<DecodeError>> {
        postcard::from_bytes(bytes)
            .change_context(DecodeError)
            .attach("failed to decode WAL entry")
    }
}
