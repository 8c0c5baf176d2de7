//! Equi-join propagation.
//!
//! Both input deltas are partitioned by canonical join key; each partition
//! is classified per side as untouched, inserted, deleted, or updated, and
//! a rule table decides which rows (or synthesized placeholders) make up
//! the joined insert and delete for that key.

use super::{ChangeNode, PlaceholderMode};
use crate::{
    key::KeyManager,
    metadata::JoinKind,
    result::{CanonicalKey, CompositeKey, PropagatorResult, ResultError},
};
use std::collections::HashMap;

// Net effect of one side's delta on a join key.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum SideState {
    Untouched,
    Inserted,
    Deleted,
    Updated,
}

const fn side_state(has_insert: bool, has_delete: bool) -> SideState {
    match (has_insert, has_delete) {
        (false, false) => SideState::Untouched,
        (true, false) => SideState::Inserted,
        (false, true) => SideState::Deleted,
        (true, true) => SideState::Updated,
    }
}

// Where one side of a joined row comes from.
#[derive(Clone, Copy, Debug)]
enum RowSource {
    Inserts,
    Deletes,
    Placeholder(PlaceholderMode),
}

#[derive(Default)]
struct Partition {
    key: Option<CompositeKey>,
    left_inserts: Vec<PropagatorResult>,
    left_deletes: Vec<PropagatorResult>,
    right_inserts: Vec<PropagatorResult>,
    right_deletes: Vec<PropagatorResult>,
}

///
/// JoinPropagator
///

pub(super) struct JoinPropagator<'a> {
    keys: &'a KeyManager,
    kind: JoinKind,
    left_keys: &'a [usize],
    right_keys: &'a [usize],
}

impl<'a> JoinPropagator<'a> {
    pub(super) const fn new(
        keys: &'a KeyManager,
        kind: JoinKind,
        left_keys: &'a [usize],
        right_keys: &'a [usize],
    ) -> Self {
        Self {
            keys,
            kind,
            left_keys,
            right_keys,
        }
    }

    pub(super) fn propagate(
        &self,
        left: &ChangeNode,
        right: &ChangeNode,
    ) -> Result<ChangeNode, ResultError> {
        let (order, partitions) = self.partition(left, right)?;

        let placeholder = Self::concat(&left.placeholder, &right.placeholder)?;
        let mut out = ChangeNode::empty(placeholder);

        for canonical in order {
            let partition = &partitions[&canonical];
            let left_state = side_state(
                !partition.left_inserts.is_empty(),
                !partition.left_deletes.is_empty(),
            );
            let right_state = side_state(
                !partition.right_inserts.is_empty(),
                !partition.right_deletes.is_empty(),
            );

            if let Some((l, r)) = self.insert_rule(left_state, right_state) {
                self.emit(&mut out.inserted, partition, left, right, l, r)?;
            }
            if let Some((l, r)) = self.delete_rule(left_state, right_state) {
                self.emit(&mut out.deleted, partition, left, right, l, r)?;
            }
        }

        Ok(out)
    }

    // ======================================================================
    // Rule tables
    // ======================================================================

    // A key's joined insert: which rows form the new version of the row.
    fn insert_rule(
        &self,
        left: SideState,
        right: SideState,
    ) -> Option<(RowSource, RowSource)> {
        use PlaceholderMode::{NullModified, Unknown};
        use RowSource::{Inserts, Placeholder};
        use SideState::{Deleted, Inserted, Untouched, Updated};

        match (left, right) {
            (Inserted | Updated, Inserted | Updated) => Some((Inserts, Inserts)),
            // a one-sided insert has no join partner in this delta
            (Inserted, Untouched) => match self.kind {
                JoinKind::Inner => None,
                JoinKind::LeftOuter => Some((Inserts, Placeholder(NullModified))),
            },
            // an update's key row is known to exist on the untouched side
            (Updated, Untouched) => Some((Inserts, Placeholder(Unknown))),
            (Inserted | Updated, Deleted) => match self.kind {
                // the joined row ceases to exist
                JoinKind::Inner => None,
                // the row survives null-extended; nulls count as modified
                JoinKind::LeftOuter => Some((Inserts, Placeholder(NullModified))),
            },
            (Untouched, Inserted) => match self.kind {
                JoinKind::Inner => None,
                JoinKind::LeftOuter => Some((Placeholder(Unknown), Inserts)),
            },
            (Untouched, Updated) => Some((Placeholder(Unknown), Inserts)),
            _ => None,
        }
    }

    // A key's joined delete: which rows form the old version of the row.
    fn delete_rule(
        &self,
        left: SideState,
        right: SideState,
    ) -> Option<(RowSource, RowSource)> {
        use PlaceholderMode::{NullPreserve, Unknown};
        use RowSource::{Deletes, Placeholder};
        use SideState::{Deleted, Inserted, Untouched, Updated};

        match (left, right) {
            (Deleted | Updated, Deleted | Updated) => Some((Deletes, Deletes)),
            // a one-sided delete has no join partner in this delta
            (Deleted, Untouched) => match self.kind {
                JoinKind::Inner => None,
                JoinKind::LeftOuter => Some((Deletes, Placeholder(NullPreserve))),
            },
            (Updated, Untouched) => Some((Deletes, Placeholder(Unknown))),
            (Deleted | Updated, Inserted) => match self.kind {
                JoinKind::Inner => None,
                JoinKind::LeftOuter => Some((Deletes, Placeholder(NullPreserve))),
            },
            (Untouched, Deleted) => match self.kind {
                JoinKind::Inner => None,
                JoinKind::LeftOuter => Some((Placeholder(Unknown), Deletes)),
            },
            (Untouched, Updated) => Some((Placeholder(Unknown), Deletes)),
            _ => None,
        }
    }

    // ======================================================================
    // Row assembly
    // ======================================================================

    fn emit(
        &self,
        out: &mut Vec<PropagatorResult>,
        partition: &Partition,
        left: &ChangeNode,
        right: &ChangeNode,
        left_source: RowSource,
        right_source: RowSource,
    ) -> Result<(), ResultError> {
        let Some(key) = &partition.key else {
            return Ok(());
        };

        let left_rows = self.side_rows(
            left_source,
            &partition.left_inserts,
            &partition.left_deletes,
            &left.placeholder,
            self.left_keys,
            key,
        )?;
        let right_rows = self.side_rows(
            right_source,
            &partition.right_inserts,
            &partition.right_deletes,
            &right.placeholder,
            self.right_keys,
            key,
        )?;

        for left_row in &left_rows {
            for right_row in &right_rows {
                out.push(Self::concat(left_row, right_row)?);
            }
        }

        Ok(())
    }

    fn side_rows(
        &self,
        source: RowSource,
        inserts: &[PropagatorResult],
        deletes: &[PropagatorResult],
        placeholder: &PropagatorResult,
        key_ordinals: &[usize],
        key: &CompositeKey,
    ) -> Result<Vec<PropagatorResult>, ResultError> {
        Ok(match source {
            RowSource::Inserts => inserts.to_vec(),
            RowSource::Deletes => deletes.to_vec(),
            RowSource::Placeholder(mode) => {
                vec![Self::synthesize(placeholder, key_ordinals, key, mode)?]
            }
        })
    }

    // Placeholder row for the absent side: key slots take the present
    // side's key results, every other slot is filled per mode.
    fn synthesize(
        placeholder: &PropagatorResult,
        key_ordinals: &[usize],
        key: &CompositeKey,
        mode: PlaceholderMode,
    ) -> Result<PropagatorResult, ResultError> {
        let slots = placeholder.children()?;
        let mut out = Vec::with_capacity(slots.len());

        for (ordinal, slot) in slots.iter().enumerate() {
            let filled = match key_ordinals.iter().position(|&k| k == ordinal) {
                Some(offset) => key.components()[offset].clone(),
                None => mode.apply(slot),
            };
            out.push(filled);
        }

        Ok(PropagatorResult::structural(out))
    }

    fn concat(
        left: &PropagatorResult,
        right: &PropagatorResult,
    ) -> Result<PropagatorResult, ResultError> {
        let mut slots = left.children()?.to_vec();
        slots.extend_from_slice(right.children()?);
        Ok(PropagatorResult::structural(slots))
    }

    // ======================================================================
    // Partitioning
    // ======================================================================

    #[expect(clippy::type_complexity)]
    fn partition(
        &self,
        left: &ChangeNode,
        right: &ChangeNode,
    ) -> Result<(Vec<CanonicalKey>, HashMap<CanonicalKey, Partition>), ResultError> {
        let mut order = Vec::new();
        let mut partitions: HashMap<CanonicalKey, Partition> = HashMap::new();

        let sides: [(&[PropagatorResult], &[usize], fn(&mut Partition) -> &mut Vec<PropagatorResult>); 4] = [
            (&left.inserted, self.left_keys, |p| &mut p.left_inserts),
            (&left.deleted, self.left_keys, |p| &mut p.left_deletes),
            (&right.inserted, self.right_keys, |p| &mut p.right_inserts),
            (&right.deleted, self.right_keys, |p| &mut p.right_deletes),
        ];

        for (rows, key_ordinals, bucket) in sides {
            for row in rows {
                let key = CompositeKey::from_row(row, key_ordinals)?;
                let canonical = key.canonical(self.keys)?;

                let partition = partitions.entry(canonical.clone()).or_insert_with(|| {
                    order.push(canonical);
                    Partition::default()
                });

                // merge key chains so every side's key slots stay reachable
                partition.key = Some(match partition.key.take() {
                    Some(existing) => existing.merged_with(&key),
                    None => key,
                });
                bucket(partition).push(row.clone());
            }
        }

        Ok((order, partitions))
    }
}
