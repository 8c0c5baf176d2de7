//! Module: changeset
//! Responsibility: the tracked-change input model handed to the pipeline by
//! the object/state tracker — entries, records, keys, and modified-field
//! indicators.
//! Does not own: extraction into result trees (see `extract`) or any
//! metadata resolution.
//!
//! Invariants:
//! - `EntryId` is the position of the entry in the session intake order.
//! - Which snapshots an entry carries is determined by its state; the
//!   extractor rejects entries that violate this.

use crate::{
    metadata::{AssociationSetId, EntitySetId},
    value::Value,
};
use derive_more::Display;
use std::collections::BTreeSet;

///
/// EntryId
///
/// Session-scoped handle to one change entry, attached to errors so the
/// caller can report which conceptual objects are implicated.
///

#[derive(Clone, Copy, Debug, Display, Eq, Hash, Ord, PartialEq, PartialOrd)]
#[display("entry#{_0}")]
pub struct EntryId(pub(crate) u32);

impl EntryId {
    #[must_use]
    pub(crate) const fn index(self) -> usize {
        self.0 as usize
    }
}

///
/// EntityState
///

#[derive(Clone, Copy, Debug, Display, Eq, PartialEq)]
pub enum EntityState {
    Added,
    Modified,
    Deleted,
    Unchanged,
}

impl EntityState {
    #[must_use]
    pub const fn has_current(self) -> bool {
        matches!(self, Self::Added | Self::Modified | Self::Unchanged)
    }

    #[must_use]
    pub const fn has_original(self) -> bool {
        matches!(self, Self::Deleted | Self::Modified | Self::Unchanged)
    }
}

///
/// EntityKey
///
/// Key of a tracked entity. Temporary keys stand in for keys whose values
/// are still pending store generation; two temporary keys are equal only
/// when their serials match.
///

#[derive(Clone, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub enum EntityKey {
    Literal {
        entity_set: EntitySetId,
        values: Vec<Value>,
    },
    Temporary {
        entity_set: EntitySetId,
        serial: u64,
    },
}

impl EntityKey {
    #[must_use]
    pub const fn entity_set(&self) -> EntitySetId {
        match self {
            Self::Literal { entity_set, .. } | Self::Temporary { entity_set, .. } => *entity_set,
        }
    }

    #[must_use]
    pub const fn is_temporary(&self) -> bool {
        matches!(self, Self::Temporary { .. })
    }
}

///
/// Record
///
/// One flat snapshot of an entity's fields, ordered by field ordinal.
///

#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct Record {
    pub values: Vec<Value>,
}

impl Record {
    #[must_use]
    pub const fn new(values: Vec<Value>) -> Self {
        Self { values }
    }

    #[must_use]
    pub fn get(&self, ordinal: usize) -> Option<&Value> {
        self.values.get(ordinal)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.values.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

///
/// ModifiedFields
///

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum ModifiedFields {
    All,
    None,
    Some(BTreeSet<usize>),
}

impl ModifiedFields {
    #[must_use]
    pub fn is_modified(&self, ordinal: usize) -> bool {
        match self {
            Self::All => true,
            Self::None => false,
            Self::Some(set) => set.contains(&ordinal),
        }
    }
}

///
/// RelationshipSnapshot
///
/// One relationship instance: the keys at the association's two ends,
/// in declared end order (principal `from`, dependent `to`).
///

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct RelationshipSnapshot {
    pub from: EntityKey,
    pub to: EntityKey,
}

///
/// ChangePayload
///

#[derive(Clone, Debug)]
pub enum ChangePayload {
    Entity {
        entity_set: EntitySetId,
        key: EntityKey,
        original: Option<Record>,
        current: Option<Record>,
        modified: ModifiedFields,
    },
    Relationship {
        association_set: AssociationSetId,
        original: Option<RelationshipSnapshot>,
        current: Option<RelationshipSnapshot>,
    },
}

///
/// ChangeEntry
///
/// One tracked modification as supplied by the change source.
///

#[derive(Clone, Debug)]
pub struct ChangeEntry {
    pub state: EntityState,
    pub payload: ChangePayload,
}

impl ChangeEntry {
    #[must_use]
    pub const fn is_relationship(&self) -> bool {
        matches!(self.payload, ChangePayload::Relationship { .. })
    }

    /// Entity key, when the payload describes an entity.
    #[must_use]
    pub const fn entity_key(&self) -> Option<&EntityKey> {
        match &self.payload {
            ChangePayload::Entity { key, .. } => Some(key),
            ChangePayload::Relationship { .. } => None,
        }
    }

    /// Snapshot preferred for key resolution: current for added entries,
    /// original otherwise.
    #[must_use]
    pub const fn resolution_snapshot(&self) -> Option<&RelationshipSnapshot> {
        match &self.payload {
            ChangePayload::Relationship {
                original, current, ..
            } => match self.state {
                EntityState::Added => current.as_ref(),
                _ => original.as_ref(),
            },
            ChangePayload::Entity { .. } => None,
        }
    }
}
