//! Module: propagator
//! Responsibility: rewriting mapping-view operator trees to consume change
//! sets instead of full extents, yielding per-table insert and delete rows.
//! Does not own: change extraction (inputs arrive as [`ChangeNode`]s) or
//! the merging of inserts and deletes into updates (see `processor`).
//!
//! Invariants:
//! - Propagation through every operator preserves row arity.
//! - Placeholders mirror the extent's row shape with default values.
//! - An `Opaque` operator in a view is unreachable for well-formed
//!   metadata and fails loudly, never silently.

mod join;


use crate::{
    key::KeyManager,
    metadata::{ExtentRef, MetadataModel, Predicate, ProjectedColumn, ViewExpr},
    result::{PropagatorResult, ResultError, ResultFlags},
    value::Value,
};
use join::JoinPropagator;
use std::collections::HashMap;
use thiserror::Error as ThisError;

///
/// PropagationError
///

#[derive(Debug, ThisError)]
pub enum PropagationError {
    #[error("mapping view contains operator '{operator}' which updates cannot propagate through")]
    UnsupportedMapping { operator: String },

    #[error(transparent)]
    Result(#[from] ResultError),
}

///
/// ChangeNode
///
/// The delta of one relational node: rows entering, rows leaving, and a
/// placeholder row describing the node's shape.
///

#[derive(Clone, Debug)]
pub struct ChangeNode {
    pub inserted: Vec<PropagatorResult>,
    pub deleted: Vec<PropagatorResult>,
    pub placeholder: PropagatorResult,
}

impl ChangeNode {
    #[must_use]
    pub const fn empty(placeholder: PropagatorResult) -> Self {
        Self {
            inserted: Vec::new(),
            deleted: Vec::new(),
            placeholder,
        }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inserted.is_empty() && self.deleted.is_empty()
    }
}

// How a synthesized placeholder fills its non-key slots.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) enum PlaceholderMode {
    /// Values exist in the store but are not known to this session.
    Unknown,
    /// Values become null and count as modified (written out).
    NullModified,
    /// Values become null and are preserved (never written).
    NullPreserve,
}

impl PlaceholderMode {
    fn apply(self, slot: &PropagatorResult) -> PropagatorResult {
        let (value, flags) = match self {
            Self::Unknown => (
                slot.value().cloned().unwrap_or(Value::Null),
                slot.flags() | ResultFlags::UNKNOWN | ResultFlags::PRESERVE,
            ),
            Self::NullModified => (Value::Null, slot.flags()),
            Self::NullPreserve => (Value::Null, slot.flags() | ResultFlags::PRESERVE),
        };
        let mut out = PropagatorResult::scalar(value, flags);
        if let Some(id) = slot.identifier() {
            out = out.with_identifier(id);
        }
        out
    }
}

///
/// Propagator
///
/// Evaluates one view tree against the session's extracted change sets.
/// Stateless between tables; borrows everything it reads.
///

pub struct Propagator<'a> {
    metadata: &'a MetadataModel,
    keys: &'a KeyManager,
    changes: &'a HashMap<ExtentRef, ChangeNode>,
}

impl<'a> Propagator<'a> {
    #[must_use]
    pub const fn new(
        metadata: &'a MetadataModel,
        keys: &'a KeyManager,
        changes: &'a HashMap<ExtentRef, ChangeNode>,
    ) -> Self {
        Self {
            metadata,
            keys,
            changes,
        }
    }

    /// Rewrite the view to consume deltas, producing the table's delta.
    pub fn propagate(&self, expr: &ViewExpr) -> Result<ChangeNode, PropagationError> {
        match expr {
            ViewExpr::Scan { extent } => Ok(self.scan(*extent)),
            ViewExpr::Project { input, columns } => {
                let node = self.propagate(input)?;
                Self::project(&node, columns)
            }
            ViewExpr::Filter { input, predicate } => {
                let node = self.propagate(input)?;
                Self::filter(node, predicate)
            }
            ViewExpr::UnionAll { left, right } => {
                let mut left = self.propagate(left)?;
                let mut right = self.propagate(right)?;
                left.inserted.append(&mut right.inserted);
                left.deleted.append(&mut right.deleted);
                Ok(left)
            }
            ViewExpr::Join {
                kind,
                left,
                right,
                left_keys,
                right_keys,
            } => {
                let left = self.propagate(left)?;
                let right = self.propagate(right)?;
                JoinPropagator::new(self.keys, *kind, left_keys, right_keys)
                    .propagate(&left, &right)
                    .map_err(PropagationError::from)
            }
            ViewExpr::Opaque { operator } => Err(PropagationError::UnsupportedMapping {
                operator: operator.clone(),
            }),
        }
    }

    // Leaf: the extent's extracted delta, or an empty node for untouched
    // extents (they still contribute shape to joins and unions).
    fn scan(&self, extent: ExtentRef) -> ChangeNode {
        self.changes
            .get(&extent)
            .cloned()
            .unwrap_or_else(|| ChangeNode::empty(self.extent_placeholder(extent)))
    }

    /// Default-valued row in the extent's shape.
    #[must_use]
    pub fn extent_placeholder(&self, extent: ExtentRef) -> PropagatorResult {
        match extent {
            ExtentRef::Entity(id) => {
                let schema = self.metadata.entity_set(id);
                PropagatorResult::structural(
                    schema
                        .fields
                        .iter()
                        .map(|field| {
                            PropagatorResult::scalar(field.ty.default_value(), ResultFlags::NONE)
                        })
                        .collect(),
                )
            }
            ExtentRef::Association(id) => {
                let schema = self.metadata.association_set(id);
                let mut slots = Vec::new();
                for end in [&schema.from, &schema.to] {
                    let end_schema = self.metadata.entity_set(end.entity_set);
                    for &ordinal in &end_schema.key_ordinals {
                        slots.push(PropagatorResult::scalar(
                            end_schema.fields[ordinal].ty.default_value(),
                            ResultFlags::NONE,
                        ));
                    }
                }
                PropagatorResult::structural(slots)
            }
        }
    }

    fn project(
        node: &ChangeNode,
        columns: &[ProjectedColumn],
    ) -> Result<ChangeNode, PropagationError> {
        let project_row = |row: &PropagatorResult| -> Result<PropagatorResult, PropagationError> {
            let mut out = Vec::with_capacity(columns.len());
            for column in columns {
                out.push(match column {
                    ProjectedColumn::Input(ordinal) => row.child(*ordinal)?.clone(),
                    ProjectedColumn::Literal(value) => {
                        PropagatorResult::scalar(value.clone(), ResultFlags::NONE)
                    }
                });
            }
            Ok(PropagatorResult::structural(out))
        };

        Ok(ChangeNode {
            inserted: node
                .inserted
                .iter()
                .map(project_row)
                .collect::<Result<_, _>>()?,
            deleted: node
                .deleted
                .iter()
                .map(project_row)
                .collect::<Result<_, _>>()?,
            placeholder: project_row(&node.placeholder)?,
        })
    }

    fn filter(node: ChangeNode, predicate: &Predicate) -> Result<ChangeNode, PropagationError> {
        let matches = |row: &PropagatorResult| -> Result<bool, PropagationError> {
            for (ordinal, expected) in &predicate.equalities {
                if row.child(*ordinal)?.value()? != expected {
                    return Ok(false);
                }
            }
            Ok(true)
        };

        let mut inserted = Vec::with_capacity(node.inserted.len());
        for row in node.inserted {
            if matches(&row)? {
                inserted.push(row);
            }
        }
        let mut deleted = Vec::with_capacity(node.deleted.len());
        for row in node.deleted {
            if matches(&row)? {
                deleted.push(row);
            }
        }

        Ok(ChangeNode {
            inserted,
            deleted,
            placeholder: node.placeholder,
        })
    }
}
