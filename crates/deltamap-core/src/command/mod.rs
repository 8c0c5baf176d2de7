//! Module: command
//! Responsibility: compiling row operations and function mappings into
//! executable store commands, the wire form handed to the transport, and
//! the dependency metadata the orderer consumes.
//! Does not own: execution sequencing (see `orderer`) or the update loop
//! itself (see `translator`).
//!
//! Invariants:
//! - A command's input identifiers never intersect its own outputs.
//! - Wire commands are value-complete; pending identifiers are resolved
//!   against generated values at wire time, falling back to the slot's
//!   literal.

mod orderer;


pub use orderer::order_commands;

use crate::{
    changeset::{EntityState, EntryId},
    extract::ExtractedStateEntry,
    key::{Identifier, KeyManager},
    metadata::{FunctionMappingSet, MetadataModel, TableId},
    processor::RowOp,
    result::{CanonicalKey, PropagatorResult, ResultError, ResultFlags},
    value::Value,
};
use std::collections::{BTreeSet, HashMap};
use thiserror::Error as ThisError;

///
/// CommandError
///

#[derive(Debug, ThisError)]
pub enum CommandError {
    #[error("store commands form a dependency cycle; no safe execution order exists")]
    OrderingCycle { entries: Vec<EntryId> },

    #[error(transparent)]
    Result(#[from] ResultError),
}

impl CommandError {
    #[must_use]
    pub fn entries(&self) -> &[EntryId] {
        match self {
            Self::OrderingCycle { entries } => entries,
            Self::Result(_) => &[],
        }
    }
}

///
/// ModificationOperator
///
/// Discriminant order doubles as the execution heuristic between
/// unrelated commands: updates free keys, deletes free more, inserts
/// consume them.
///

#[derive(Clone, Copy, Debug, Eq, Ord, PartialEq, PartialOrd)]
pub enum ModificationOperator {
    Update = 0,
    Delete = 1,
    Insert = 2,
}

///
/// ParamValue
///
/// A command parameter: fixed at compile time, or linked to an identifier
/// whose value another command may generate first.
///

#[derive(Clone, Debug)]
pub enum ParamValue {
    Literal(Value),
    Pending { id: Identifier, fallback: Value },
}

impl ParamValue {
    fn from_slot(slot: &PropagatorResult) -> Result<Self, ResultError> {
        let value = slot.value()?.clone();
        Ok(match slot.identifier() {
            Some(id) => Self::Pending {
                id,
                fallback: value,
            },
            None => Self::Literal(value),
        })
    }

    /// Concrete value, preferring a generated value for the clique.
    #[must_use]
    pub fn resolve(&self, keys: &KeyManager, generated: &HashMap<Identifier, Value>) -> Value {
        match self {
            Self::Literal(value) => value.clone(),
            Self::Pending { id, fallback } => generated
                .get(&keys.representative(*id))
                .cloned()
                .unwrap_or_else(|| fallback.clone()),
        }
    }
}

///
/// WireCommand
///
/// The value-complete form handed to the execution transport.
///

#[derive(Clone, Debug)]
pub enum WireCommand {
    Statement {
        table: String,
        op: ModificationOperator,
        set: Vec<(String, Value)>,
        predicate: Vec<(String, Value)>,
        returning: Vec<String>,
    },
    Function {
        name: String,
        params: Vec<(String, Value)>,
        rows_affected_param: Option<String>,
    },
}

///
/// ExecutionOutcome
///

#[derive(Clone, Debug, Default)]
pub struct ExecutionOutcome {
    pub rows_affected: u64,
    /// Returned row of store-generated values, column name to value.
    pub result_row: Option<Vec<(String, Value)>>,
}

///
/// TransportError
///

#[derive(Debug, ThisError)]
#[error("store transport failed: {message}")]
pub struct TransportError {
    pub message: String,
}

impl TransportError {
    #[must_use]
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

///
/// ExecutionTransport
///
/// The session's only outlet to the store. One command at a time, inside
/// whatever transaction the caller established.
///

pub trait ExecutionTransport {
    fn execute(&mut self, command: &WireCommand) -> Result<ExecutionOutcome, TransportError>;
}

///
/// InterceptorDecision
///

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum InterceptorDecision {
    Continue,
    /// Do not execute; the command counts as having affected one row.
    Skip,
}

///
/// CommandInterceptor
///

pub trait CommandInterceptor {
    fn before_execute(&mut self, command: &UpdateCommand) -> InterceptorDecision;
}

///
/// DynamicCommand
///
/// One table-level statement compiled from propagated rows.
///

#[derive(Clone, Debug)]
pub struct DynamicCommand {
    table: TableId,
    table_name: String,
    op: ModificationOperator,
    set: Vec<(String, ParamValue)>,
    predicate: Vec<(String, ParamValue)>,
    // server-generated columns to read back, with their result slots
    returning: Vec<(String, PropagatorResult)>,
    canonical_key: CanonicalKey,
    inputs: BTreeSet<Identifier>,
    outputs: BTreeSet<Identifier>,
    key_identifiers: BTreeSet<Identifier>,
    entries: Vec<EntryId>,
}

///
/// FunctionCommand
///
/// One modification-function invocation for a function-mapped extent.
///

#[derive(Clone, Debug)]
pub struct FunctionCommand {
    function_name: String,
    op: ModificationOperator,
    params: Vec<(String, ParamValue)>,
    // result columns bound back onto current-record slots
    result_bindings: Vec<(String, PropagatorResult)>,
    rows_affected_param: Option<String>,
    inputs: BTreeSet<Identifier>,
    outputs: BTreeSet<Identifier>,
    entry: EntryId,
}

///
/// UpdateCommand
///

#[derive(Clone, Debug)]
pub enum UpdateCommand {
    Dynamic(DynamicCommand),
    Function(FunctionCommand),
}

impl UpdateCommand {
    #[must_use]
    pub const fn op(&self) -> ModificationOperator {
        match self {
            Self::Dynamic(cmd) => cmd.op,
            Self::Function(cmd) => cmd.op,
        }
    }

    /// Identifiers whose values must exist before this command runs.
    #[must_use]
    pub const fn input_identifiers(&self) -> &BTreeSet<Identifier> {
        match self {
            Self::Dynamic(cmd) => &cmd.inputs,
            Self::Function(cmd) => &cmd.inputs,
        }
    }

    /// Identifiers whose values this command produces.
    #[must_use]
    pub const fn output_identifiers(&self) -> &BTreeSet<Identifier> {
        match self {
            Self::Dynamic(cmd) => &cmd.outputs,
            Self::Function(cmd) => &cmd.outputs,
        }
    }

    /// Key-slot identifiers of the touched row (dynamic commands only).
    #[must_use]
    pub fn key_identifiers(&self) -> &BTreeSet<Identifier> {
        static EMPTY: BTreeSet<Identifier> = BTreeSet::new();
        match self {
            Self::Dynamic(cmd) => &cmd.key_identifiers,
            Self::Function(_) => &EMPTY,
        }
    }

    /// Table and canonical row key, for delete-before-insert sequencing.
    #[must_use]
    pub fn table_and_key(&self) -> Option<(TableId, &CanonicalKey)> {
        match self {
            Self::Dynamic(cmd) => Some((cmd.table, &cmd.canonical_key)),
            Self::Function(_) => None,
        }
    }

    /// Change entries this command was compiled from.
    #[must_use]
    pub fn source_entries(&self) -> &[EntryId] {
        match self {
            Self::Dynamic(cmd) => &cmd.entries,
            Self::Function(cmd) => std::slice::from_ref(&cmd.entry),
        }
    }

    /// Server-generated columns and the slots their values flow back into.
    #[must_use]
    pub fn result_bindings(&self) -> &[(String, PropagatorResult)] {
        match self {
            Self::Dynamic(cmd) => &cmd.returning,
            Self::Function(cmd) => &cmd.result_bindings,
        }
    }

    /// Whether a zero-rows-affected outcome means a concurrency conflict.
    /// Reads never arise here; every compiled command writes.
    #[must_use]
    pub const fn expects_rows(&self) -> bool {
        true
    }

    /// Resolve to the value-complete wire form.
    #[must_use]
    pub fn to_wire(
        &self,
        keys: &KeyManager,
        generated: &HashMap<Identifier, Value>,
    ) -> WireCommand {
        match self {
            Self::Dynamic(cmd) => WireCommand::Statement {
                table: cmd.table_name.clone(),
                op: cmd.op,
                set: cmd
                    .set
                    .iter()
                    .map(|(column, param)| (column.clone(), param.resolve(keys, generated)))
                    .collect(),
                predicate: cmd
                    .predicate
                    .iter()
                    .map(|(column, param)| (column.clone(), param.resolve(keys, generated)))
                    .collect(),
                returning: cmd
                    .returning
                    .iter()
                    .map(|(column, _)| column.clone())
                    .collect(),
            },
            Self::Function(cmd) => WireCommand::Function {
                name: cmd.function_name.clone(),
                params: cmd
                    .params
                    .iter()
                    .map(|(name, param)| (name.clone(), param.resolve(keys, generated)))
                    .collect(),
                rows_affected_param: cmd.rows_affected_param.clone(),
            },
        }
    }

    // Deterministic tie-break between unordered commands.
    pub(crate) fn sort_key(&self) -> (u8, String, String) {
        match self {
            Self::Dynamic(cmd) => (
                cmd.op as u8,
                cmd.table_name.clone(),
                format!("{:?}", cmd.canonical_key),
            ),
            Self::Function(cmd) => (
                cmd.op as u8,
                cmd.function_name.clone(),
                format!("{}", cmd.entry),
            ),
        }
    }
}

///
/// CommandCompiler
///

pub struct CommandCompiler<'a> {
    metadata: &'a MetadataModel,
    keys: &'a KeyManager,
}

impl<'a> CommandCompiler<'a> {
    #[must_use]
    pub const fn new(metadata: &'a MetadataModel, keys: &'a KeyManager) -> Self {
        Self { metadata, keys }
    }

    /// Compile one table's row operations.
    pub fn compile_table(
        &self,
        table: TableId,
        ops: &[RowOp],
    ) -> Result<Vec<UpdateCommand>, CommandError> {
        let mut out = Vec::with_capacity(ops.len());
        for op in ops {
            out.push(UpdateCommand::Dynamic(match op {
                RowOp::Insert { key, row } => self.compile_insert(table, key, row)?,
                RowOp::Update {
                    key,
                    original,
                    current,
                } => self.compile_update(table, key, original, current)?,
                RowOp::Delete { key, row } => self.compile_delete(table, key, row)?,
            }));
        }
        Ok(out)
    }

    fn compile_insert(
        &self,
        table: TableId,
        key: &crate::result::CompositeKey,
        row: &PropagatorResult,
    ) -> Result<DynamicCommand, CommandError> {
        let schema = self.metadata.table(table);
        let mut set = Vec::new();
        let mut returning = Vec::new();

        for (ordinal, slot) in row.children()?.iter().enumerate() {
            let column = schema.fields[ordinal].name.clone();
            let flags = slot.flags();

            if flags.contains(ResultFlags::SERVER_GENERATED) && slot.value()?.is_null() {
                returning.push((column, slot.clone()));
                continue;
            }
            if flags.contains(ResultFlags::UNKNOWN) {
                // value exists in the store already; not ours to write
                continue;
            }
            set.push((column, ParamValue::from_slot(slot)?));
        }

        self.assemble(
            table,
            ModificationOperator::Insert,
            key,
            row,
            set,
            Vec::new(),
            returning,
        )
    }

    fn compile_update(
        &self,
        table: TableId,
        key: &crate::result::CompositeKey,
        original: &PropagatorResult,
        current: &PropagatorResult,
    ) -> Result<DynamicCommand, CommandError> {
        let schema = self.metadata.table(table);
        let mut set = Vec::new();
        let mut returning = Vec::new();

        for (ordinal, slot) in current.children()?.iter().enumerate() {
            let column = schema.fields[ordinal].name.clone();
            let flags = slot.flags();

            if flags.contains(ResultFlags::SERVER_GENERATED) {
                returning.push((column.clone(), slot.clone()));
            }
            if flags.is_preserve() {
                continue;
            }
            set.push((column, ParamValue::from_slot(slot)?));
        }

        let predicate = self.build_predicate(schema, original)?;
        self.assemble(
            table,
            ModificationOperator::Update,
            key,
            current,
            set,
            predicate,
            returning,
        )
    }

    fn compile_delete(
        &self,
        table: TableId,
        key: &crate::result::CompositeKey,
        row: &PropagatorResult,
    ) -> Result<DynamicCommand, CommandError> {
        let schema = self.metadata.table(table);
        let predicate = self.build_predicate(schema, row)?;
        self.assemble(
            table,
            ModificationOperator::Delete,
            key,
            row,
            Vec::new(),
            predicate,
            Vec::new(),
        )
    }

    // Row selector: key columns plus concurrency tokens, original values.
    fn build_predicate(
        &self,
        schema: &crate::metadata::TableSchema,
        row: &PropagatorResult,
    ) -> Result<Vec<(String, ParamValue)>, CommandError> {
        let mut out = Vec::new();
        for (ordinal, slot) in row.children()?.iter().enumerate() {
            let is_key = schema.key_ordinals.contains(&ordinal);
            let is_token = slot.flags().contains(ResultFlags::CONCURRENCY);
            if is_key || is_token {
                out.push((
                    schema.fields[ordinal].name.clone(),
                    ParamValue::from_slot(slot)?,
                ));
            }
        }
        Ok(out)
    }

    #[expect(clippy::too_many_arguments)]
    fn assemble(
        &self,
        table: TableId,
        op: ModificationOperator,
        key: &crate::result::CompositeKey,
        row: &PropagatorResult,
        set: Vec<(String, ParamValue)>,
        predicate: Vec<(String, ParamValue)>,
        returning: Vec<(String, PropagatorResult)>,
    ) -> Result<DynamicCommand, CommandError> {
        let schema = self.metadata.table(table);

        let key_identifiers: BTreeSet<Identifier> = key
            .components()
            .iter()
            .filter_map(PropagatorResult::identifier)
            .collect();

        // inserts produce their row's key values; every command produces
        // the values it reads back from the store
        let mut outputs: BTreeSet<Identifier> = returning
            .iter()
            .filter_map(|(_, slot)| slot.identifier())
            .collect();
        if op == ModificationOperator::Insert {
            outputs.extend(key_identifiers.iter().copied());
        }

        let mut inputs = BTreeSet::new();
        for (_, param) in set.iter().chain(&predicate) {
            if let ParamValue::Pending { id, .. } = param {
                for principal in self.keys.principals(*id) {
                    if !outputs.contains(&principal) {
                        inputs.insert(principal);
                    }
                }
            }
        }

        // a deleted row still references its principals; those references
        // must be released before the principal rows can go away
        if op == ModificationOperator::Delete {
            for slot in row.children()? {
                if let Some(id) = slot.identifier() {
                    for principal in self.keys.principals(id) {
                        if !outputs.contains(&principal) && !key_identifiers.contains(&principal) {
                            inputs.insert(principal);
                        }
                    }
                }
            }
        }

        let mut entries = row.contributing_entries();
        for component in key.components() {
            entries.extend(component.contributing_entries());
        }
        entries.sort_unstable();
        entries.dedup();

        Ok(DynamicCommand {
            table,
            table_name: schema.name.clone(),
            op,
            set,
            predicate,
            returning,
            canonical_key: key.canonical(self.keys)?,
            inputs,
            outputs,
            key_identifiers,
            entries,
        })
    }

    /// Compile the modification function for one function-mapped entry.
    pub fn compile_function(
        &self,
        mappings: &FunctionMappingSet,
        extracted: &ExtractedStateEntry,
    ) -> Result<UpdateCommand, CommandError> {
        let added = extracted.state == EntityState::Added;
        let deleted = extracted.state == EntityState::Deleted;
        let mapping = mappings.for_state(added, deleted);
        let op = if added {
            ModificationOperator::Insert
        } else if deleted {
            ModificationOperator::Delete
        } else {
            ModificationOperator::Update
        };

        let mut params = Vec::with_capacity(mapping.params.len());
        let mut inputs = BTreeSet::new();
        for param in &mapping.params {
            let record = if param.use_original {
                extracted.original.as_ref()
            } else {
                extracted.current.as_ref()
            };
            let slot = match record {
                Some(row) => row.child(param.source_ordinal)?,
                None => {
                    return Err(CommandError::Result(ResultError::MissingOrdinal {
                        ordinal: param.source_ordinal,
                        width: 0,
                    }));
                }
            };

            let value = ParamValue::from_slot(slot)?;
            if let ParamValue::Pending { id, .. } = &value {
                inputs.extend(self.keys.principals(*id));
            }
            params.push((param.name.clone(), value));
        }

        let mut result_bindings = Vec::with_capacity(mapping.result_bindings.len());
        let mut outputs = BTreeSet::new();
        if let Some(current) = &extracted.current {
            for binding in &mapping.result_bindings {
                let slot = current.child(binding.ordinal)?;
                if let Some(id) = slot.identifier() {
                    outputs.insert(id);
                }
                result_bindings.push((binding.column.clone(), slot.clone()));
            }
        }
        inputs.retain(|id| !outputs.contains(id));

        Ok(UpdateCommand::Function(FunctionCommand {
            function_name: mapping.function_name.clone(),
            op,
            params,
            result_bindings,
            rows_affected_param: mapping.rows_affected_param.clone(),
            inputs,
            outputs,
            entry: extracted.id,
        }))
    }
}
