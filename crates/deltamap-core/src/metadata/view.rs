//! Mapping-view operator trees.
//!
//! A view translates per-extent change sets into one storage table's row
//! shape. Only the closed operator set below can appear in a well-formed
//! view; anything else is a metadata authoring defect surfaced as an
//! unsupported-mapping error by the propagator.

use crate::{metadata::ExtentRef, value::Value};
use derive_more::Display;

///
/// JoinKind
///

#[derive(Clone, Copy, Debug, Display, Eq, PartialEq)]
pub enum JoinKind {
    #[display("inner join")]
    Inner,
    #[display("left outer join")]
    LeftOuter,
}

///
/// ProjectedColumn
///
/// One output column of a projection: either a pass-through of an input
/// ordinal or a literal constant (discriminator columns).
///

#[derive(Clone, Debug)]
pub enum ProjectedColumn {
    Input(usize),
    Literal(Value),
}

///
/// Predicate
///
/// Selection predicate: a conjunction of column/literal equalities. This
/// is the only predicate shape mapping conditions produce.
///

#[derive(Clone, Debug)]
pub struct Predicate {
    pub equalities: Vec<(usize, Value)>,
}

impl Predicate {
    #[must_use]
    pub const fn new(equalities: Vec<(usize, Value)>) -> Self {
        Self { equalities }
    }
}

///
/// ViewExpr
///
/// The operator tree. A closed sum type evaluated by a single match-based
/// propagator, not an open visitor hierarchy. `Opaque` stands in for
/// operators that cannot appear in well-formed update views (cross join,
/// grouping, sorting); reaching one at propagation time is fatal.
///

#[derive(Clone, Debug)]
pub enum ViewExpr {
    /// Leaf: raw change set of one extent (entity or association set).
    Scan { extent: ExtentRef },

    /// Column-wise projection of the input rows.
    Project {
        input: Box<ViewExpr>,
        columns: Vec<ProjectedColumn>,
    },

    /// Row filter.
    Filter {
        input: Box<ViewExpr>,
        predicate: Predicate,
    },

    /// Concatenation of two type-compatible inputs.
    UnionAll {
        left: Box<ViewExpr>,
        right: Box<ViewExpr>,
    },

    /// Equi-join on the given key ordinals of each side.
    Join {
        kind: JoinKind,
        left: Box<ViewExpr>,
        right: Box<ViewExpr>,
        left_keys: Vec<usize>,
        right_keys: Vec<usize>,
    },

    /// An operator the update pipeline cannot propagate through.
    Opaque { operator: String },
}

impl ViewExpr {
    /// Whether any scan leaf of this tree reads the given extent.
    #[must_use]
    pub fn scans_extent(&self, target: ExtentRef) -> bool {
        match self {
            Self::Scan { extent } => *extent == target,
            Self::Project { input, .. } | Self::Filter { input, .. } => {
                input.scans_extent(target)
            }
            Self::UnionAll { left, right } | Self::Join { left, right, .. } => {
                left.scans_extent(target) || right.scans_extent(target)
            }
            Self::Opaque { .. } => false,
        }
    }

    /// Number of columns produced by this operator, given per-extent widths.
    #[must_use]
    pub fn arity(&self, width_of: &impl Fn(ExtentRef) -> usize) -> usize {
        match self {
            Self::Scan { extent } => width_of(*extent),
            Self::Project { columns, .. } => columns.len(),
            Self::Filter { input, .. } => input.arity(width_of),
            Self::UnionAll { left, .. } => left.arity(width_of),
            Self::Join { left, right, .. } => left.arity(width_of) + right.arity(width_of),
            Self::Opaque { .. } => 0,
        }
    }
}
