//! Module: metadata
//! Responsibility: the resolved, read-only model consumed by the pipeline —
//! entity sets, storage tables, association sets with referential
//! constraints, mapping views, and modification-function mappings.
//! Does not own: change tracking, propagation, or command compilation.
//!
//! Invariants:
//! - Ids handed out by [`MetadataBuilder`] index into the owning model.
//! - Key ordinals reference fields of the owning schema.
//! - Every table with dynamic changes has exactly one mapping view.

mod view;

pub use view::{JoinKind, Predicate, ProjectedColumn, ViewExpr};

use crate::value::ValueType;
use derive_more::Display;
use serde::{Deserialize, Serialize};
use std::{collections::BTreeMap, fmt};

///
/// EntitySetId
///

#[derive(Clone, Copy, Debug, Deserialize, Display, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize)]
#[display("extent#{_0}")]
pub struct EntitySetId(pub(crate) u32);

impl EntitySetId {
    #[must_use]
    pub(crate) const fn index(self) -> usize {
        self.0 as usize
    }
}

///
/// TableId
///

#[derive(Clone, Copy, Debug, Deserialize, Display, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize)]
#[display("table#{_0}")]
pub struct TableId(pub(crate) u32);

impl TableId {
    #[must_use]
    pub(crate) const fn index(self) -> usize {
        self.0 as usize
    }
}

///
/// AssociationSetId
///

#[derive(Clone, Copy, Debug, Deserialize, Display, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize)]
#[display("association#{_0}")]
pub struct AssociationSetId(pub(crate) u32);

impl AssociationSetId {
    #[must_use]
    pub(crate) const fn index(self) -> usize {
        self.0 as usize
    }
}

///
/// ExtentRef
///
/// A changeable extent as seen by mapping views: either a conceptual
/// entity set or an association set (independent relationships kept in
/// their own change set).
///

#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub enum ExtentRef {
    Entity(EntitySetId),
    Association(AssociationSetId),
}

impl fmt::Display for ExtentRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Entity(id) => id.fmt(f),
            Self::Association(id) => id.fmt(f),
        }
    }
}

///
/// FieldSchema
///

#[derive(Clone, Debug)]
pub struct FieldSchema {
    pub name: String,
    pub ty: ValueType,
    pub nullable: bool,
    pub server_generated: bool,
    pub concurrency_token: bool,
}

impl FieldSchema {
    #[must_use]
    pub fn new(name: impl Into<String>, ty: ValueType) -> Self {
        Self {
            name: name.into(),
            ty,
            nullable: false,
            server_generated: false,
            concurrency_token: false,
        }
    }

    #[must_use]
    pub const fn nullable(mut self) -> Self {
        self.nullable = true;
        self
    }

    #[must_use]
    pub const fn server_generated(mut self) -> Self {
        self.server_generated = true;
        self
    }

    #[must_use]
    pub const fn concurrency_token(mut self) -> Self {
        self.concurrency_token = true;
        self
    }
}

///
/// EntitySetSchema
///
/// One conceptual extent: its row shape and declared key members.
///

#[derive(Clone, Debug)]
pub struct EntitySetSchema {
    pub name: String,
    pub fields: Vec<FieldSchema>,
    pub key_ordinals: Vec<usize>,
}

impl EntitySetSchema {
    /// Offset of `ordinal` within the declared key member list, if any.
    #[must_use]
    pub fn key_offset(&self, ordinal: usize) -> Option<usize> {
        self.key_ordinals.iter().position(|&k| k == ordinal)
    }
}

///
/// TableSchema
///
/// One storage table: its column shape and declared key columns.
///

#[derive(Clone, Debug)]
pub struct TableSchema {
    pub name: String,
    pub fields: Vec<FieldSchema>,
    pub key_ordinals: Vec<usize>,
}

///
/// Multiplicity
///

#[derive(Clone, Copy, Debug, Display, Eq, PartialEq)]
pub enum Multiplicity {
    /// Exactly one (1..1).
    #[display("1..1")]
    One,
    /// At most one (0..1).
    #[display("0..1")]
    ZeroOrOne,
    /// Unbounded (0..*).
    #[display("0..*")]
    Many,
}

impl Multiplicity {
    #[must_use]
    pub const fn lower_bound(self) -> usize {
        match self {
            Self::One => 1,
            Self::ZeroOrOne | Self::Many => 0,
        }
    }

    #[must_use]
    pub const fn upper_bound(self) -> Option<usize> {
        match self {
            Self::One | Self::ZeroOrOne => Some(1),
            Self::Many => None,
        }
    }
}

///
/// AssociationEnd
///

#[derive(Clone, Debug)]
pub struct AssociationEnd {
    pub name: String,
    pub entity_set: EntitySetId,
    pub multiplicity: Multiplicity,
}

///
/// ReferentialConstraint
///
/// Pairs key members of the principal end with foreign-key fields of the
/// dependent end. `principal_props[i]` is an offset into the principal's
/// key member list; `dependent_props[i]` is a field ordinal of the
/// dependent entity set.
///

#[derive(Clone, Debug)]
pub struct ReferentialConstraint {
    pub principal_props: Vec<usize>,
    pub dependent_props: Vec<usize>,
}

///
/// AssociationSetSchema
///
/// A binary relationship set. `from` is the principal end, `to` the
/// dependent end. When `co_located_table` is set, the relationship is
/// stored in the same table as the `to`-end entity (1:1 co-location).
///

#[derive(Clone, Debug)]
pub struct AssociationSetSchema {
    pub name: String,
    pub from: AssociationEnd,
    pub to: AssociationEnd,
    pub constraint: Option<ReferentialConstraint>,
    pub co_located_table: Option<TableId>,
}

///
/// FunctionParam
///
/// Binds one stored-procedure parameter to a field of the change record.
///

#[derive(Clone, Debug)]
pub struct FunctionParam {
    pub name: String,
    pub source_ordinal: usize,
    pub use_original: bool,
}

///
/// ResultBinding
///
/// Maps one column of the procedure's result row back onto a field of the
/// current record (store-generated values).
///

#[derive(Clone, Debug)]
pub struct ResultBinding {
    pub column: String,
    pub ordinal: usize,
}

///
/// FunctionMapping
///

#[derive(Clone, Debug)]
pub struct FunctionMapping {
    pub function_name: String,
    pub params: Vec<FunctionParam>,
    pub result_bindings: Vec<ResultBinding>,
    pub rows_affected_param: Option<String>,
}

///
/// FunctionMappingSet
///
/// Insert/update/delete procedures for one function-mapped extent.
///

#[derive(Clone, Debug)]
pub struct FunctionMappingSet {
    pub insert: FunctionMapping,
    pub update: FunctionMapping,
    pub delete: FunctionMapping,
}

impl FunctionMappingSet {
    #[must_use]
    pub const fn for_state(&self, added: bool, deleted: bool) -> &FunctionMapping {
        if added {
            &self.insert
        } else if deleted {
            &self.delete
        } else {
            &self.update
        }
    }
}

///
/// MappingView
///

#[derive(Clone, Debug)]
pub struct MappingView {
    pub table: TableId,
    pub expr: ViewExpr,
}

///
/// MetadataModel
///
/// The complete resolved input model. Construction goes through
/// [`MetadataBuilder`]; after that the model is read-only for the lifetime
/// of every update session that borrows it.
///

#[derive(Clone, Debug, Default)]
pub struct MetadataModel {
    entity_sets: Vec<EntitySetSchema>,
    tables: Vec<TableSchema>,
    association_sets: Vec<AssociationSetSchema>,
    views: Vec<MappingView>,
    functions: BTreeMap<EntitySetId, FunctionMappingSet>,
}

impl MetadataModel {
    #[must_use]
    pub fn builder() -> MetadataBuilder {
        MetadataBuilder::default()
    }

    #[must_use]
    pub fn entity_set(&self, id: EntitySetId) -> &EntitySetSchema {
        &self.entity_sets[id.index()]
    }

    #[must_use]
    pub fn table(&self, id: TableId) -> &TableSchema {
        &self.tables[id.index()]
    }

    #[must_use]
    pub fn association_set(&self, id: AssociationSetId) -> &AssociationSetSchema {
        &self.association_sets[id.index()]
    }

    pub fn association_sets(
        &self,
    ) -> impl Iterator<Item = (AssociationSetId, &AssociationSetSchema)> {
        self.association_sets
            .iter()
            .enumerate()
            .map(|(i, schema)| (AssociationSetId(i as u32), schema))
    }

    /// Association sets with an end bound to the given entity set.
    pub fn association_sets_referencing(
        &self,
        entity_set: EntitySetId,
    ) -> impl Iterator<Item = (AssociationSetId, &AssociationSetSchema)> {
        self.association_sets().filter(move |(_, schema)| {
            schema.from.entity_set == entity_set || schema.to.entity_set == entity_set
        })
    }

    #[must_use]
    pub fn view_for_table(&self, table: TableId) -> Option<&MappingView> {
        self.views.iter().find(|view| view.table == table)
    }

    /// Storage tables whose mapping view scans the given extent.
    #[must_use]
    pub fn affected_tables(&self, extent: ExtentRef) -> Vec<TableId> {
        self.views
            .iter()
            .filter(|view| view.expr.scans_extent(extent))
            .map(|view| view.table)
            .collect()
    }

    #[must_use]
    pub fn function_mapping(&self, extent: EntitySetId) -> Option<&FunctionMappingSet> {
        self.functions.get(&extent)
    }

    /// Number of declared key members for the extent.
    #[must_use]
    pub fn key_member_count(&self, extent: EntitySetId) -> usize {
        self.entity_set(extent).key_ordinals.len()
    }
}

///
/// MetadataBuilder
///

#[derive(Debug, Default)]
pub struct MetadataBuilder {
    model: MetadataModel,
}

impl MetadataBuilder {
    pub fn add_entity_set(&mut self, schema: EntitySetSchema) -> EntitySetId {
        let id = EntitySetId(self.model.entity_sets.len() as u32);
        self.model.entity_sets.push(schema);
        id
    }

    pub fn add_table(&mut self, schema: TableSchema) -> TableId {
        let id = TableId(self.model.tables.len() as u32);
        self.model.tables.push(schema);
        id
    }

    pub fn add_association_set(&mut self, schema: AssociationSetSchema) -> AssociationSetId {
        let id = AssociationSetId(self.model.association_sets.len() as u32);
        self.model.association_sets.push(schema);
        id
    }

    pub fn add_view(&mut self, view: MappingView) {
        self.model.views.push(view);
    }

    pub fn add_function_mapping(&mut self, extent: EntitySetId, set: FunctionMappingSet) {
        self.model.functions.insert(extent, set);
    }

    #[must_use]
    pub fn build(self) -> MetadataModel {
        self.model
    }
}
