//! Module: processor
//! Responsibility: grouping one table's propagated insert and delete rows
//! by key, merging matched pairs into updates, and rejecting key
//! collisions.
//! Does not own: view propagation (rows arrive pre-propagated) or command
//! compilation (see `command`).
//!
//! Invariants:
//! - Keys compare canonically: literal by value, identifier by clique.
//! - At most one insert and one delete survive per key and table.
//! - An update whose new row matches the old one is dropped entirely.

#[cfg(test)]
mod tests;

use crate::{
    changeset::EntryId,
    key::KeyManager,
    metadata::{MetadataModel, TableId},
    propagator::ChangeNode,
    result::{CanonicalKey, CompositeKey, PropagatorResult, ResultError},
};
use std::collections::HashMap;
use thiserror::Error as ThisError;

///
/// ProcessorError
///

#[derive(Debug, ThisError)]
pub enum ProcessorError {
    #[error("table '{table}': two rows collapse onto the same key")]
    DuplicateKey { table: String, entries: Vec<EntryId> },

    #[error(
        "table '{table}': referential constraints force two distinct rows onto the same key"
    )]
    ReferentialIntegrity { table: String, entries: Vec<EntryId> },

    #[error(transparent)]
    Result(#[from] ResultError),
}

impl ProcessorError {
    /// Entries implicated in the failure, when known.
    #[must_use]
    pub fn entries(&self) -> &[EntryId] {
        match self {
            Self::DuplicateKey { entries, .. } | Self::ReferentialIntegrity { entries, .. } => {
                entries
            }
            Self::Result(_) => &[],
        }
    }
}

///
/// RowOp
///
/// One key-level change to a table after insert/delete pairing.
///

#[derive(Clone, Debug)]
pub enum RowOp {
    Insert {
        key: CompositeKey,
        row: PropagatorResult,
    },
    Update {
        key: CompositeKey,
        original: PropagatorResult,
        current: PropagatorResult,
    },
    Delete {
        key: CompositeKey,
        row: PropagatorResult,
    },
}

impl RowOp {
    #[must_use]
    pub const fn key(&self) -> &CompositeKey {
        match self {
            Self::Insert { key, .. } | Self::Update { key, .. } | Self::Delete { key, .. } => key,
        }
    }
}

///
/// TableChangeProcessor
///
/// Per-table, per-session worker. Produces [`RowOp`]s in first-seen key
/// order so command compilation is deterministic.
///

pub struct TableChangeProcessor<'a> {
    table: TableId,
    metadata: &'a MetadataModel,
    keys: &'a KeyManager,
}

impl<'a> TableChangeProcessor<'a> {
    #[must_use]
    pub const fn new(table: TableId, metadata: &'a MetadataModel, keys: &'a KeyManager) -> Self {
        Self {
            table,
            metadata,
            keys,
        }
    }

    /// Pair the table's propagated delta into row operations.
    pub fn process(&self, delta: &ChangeNode) -> Result<Vec<RowOp>, ProcessorError> {
        let key_ordinals = &self.metadata.table(self.table).key_ordinals;

        let mut order: Vec<CanonicalKey> = Vec::new();
        let mut inserts: HashMap<CanonicalKey, (CompositeKey, PropagatorResult)> = HashMap::new();
        let mut deletes: HashMap<CanonicalKey, (CompositeKey, PropagatorResult)> = HashMap::new();

        for (rows, bucket) in [(&delta.inserted, &mut inserts), (&delta.deleted, &mut deletes)] {
            for row in rows {
                let key = CompositeKey::from_row(row, key_ordinals)?;
                let canonical = key.canonical(self.keys)?;

                if let Some((existing_key, existing_row)) =
                    bucket.insert(canonical.clone(), (key, row.clone()))
                {
                    let (key, row) = &bucket[&canonical];
                    return Err(self.key_collision(&existing_key, &existing_row, key, row));
                }
                if !order.contains(&canonical) {
                    order.push(canonical);
                }
            }
        }

        let mut out = Vec::with_capacity(order.len());
        for canonical in order {
            let op = match (inserts.remove(&canonical), deletes.remove(&canonical)) {
                (Some((insert_key, current)), Some((delete_key, original))) => {
                    if Self::modifies_nothing(&original, &current) {
                        continue;
                    }
                    RowOp::Update {
                        key: insert_key.merged_with(&delete_key),
                        original,
                        current,
                    }
                }
                (Some((key, row)), None) => RowOp::Insert { key, row },
                (None, Some((key, row))) => RowOp::Delete { key, row },
                (None, None) => continue,
            };
            out.push(op);
        }

        Ok(out)
    }

    // An update whose new row matches the old one slot for slot is a
    // no-op and produces no command at all. Preserved slots count as
    // unchanged without a value comparison.
    fn modifies_nothing(original: &PropagatorResult, current: &PropagatorResult) -> bool {
        let (Ok(old_slots), Ok(new_slots)) = (original.children(), current.children()) else {
            return false;
        };
        old_slots.len() == new_slots.len()
            && old_slots.iter().zip(new_slots).all(|(old, new)| {
                new.flags().is_preserve()
                    || matches!((old.value(), new.value()), (Ok(a), Ok(b)) if a == b)
            })
    }

    // Two rows in the same delta share a canonical key. If their key slots
    // reach a common principal, referential constraints forced the
    // collision; otherwise the input itself carried duplicate keys.
    fn key_collision(
        &self,
        a_key: &CompositeKey,
        a_row: &PropagatorResult,
        b_key: &CompositeKey,
        b_row: &PropagatorResult,
    ) -> ProcessorError {
        let table = self.metadata.table(self.table).name.clone();

        let mut entries = a_row.contributing_entries();
        entries.extend(b_row.contributing_entries());
        entries.sort_unstable();
        entries.dedup();

        let a_principals = a_key.principal_identifiers(self.keys);
        let shared = b_key
            .principal_identifiers(self.keys)
            .iter()
            .any(|id| a_principals.contains(id));

        if shared {
            ProcessorError::ReferentialIntegrity { table, entries }
        } else {
            ProcessorError::DuplicateKey { table, entries }
        }
    }
}
