//! Module: translator
//! Responsibility: orchestrating one update session end to end — intake and
//! validation, constraint registration, view propagation, command
//! compilation and ordering, execution against the transport, and
//! back-propagation of store-generated values.
//! Does not own: any single pipeline stage; it sequences them and carries
//! the session's [`KeyManager`].
//!
//! Invariants:
//! - A translator runs one session; the phase only moves forward.
//! - Commands execute in dependency order; a zero-row outcome aborts the
//!   session before any later command runs.
//! - Values flow back into caller records only after every command has
//!   executed.


use crate::{
    changeset::{ChangeEntry, ChangePayload, EntityKey, EntityState, EntryId},
    command::{
        CommandCompiler, CommandInterceptor, ExecutionTransport, InterceptorDecision,
        ModificationOperator, UpdateCommand, order_commands,
    },
    error::UpdateError,
    extract::{ChangeExtractor, ExtractedStateEntry},
    key::{Identifier, KeyManager},
    metadata::{EntitySetId, ExtentRef, MetadataModel},
    obs::{MetricsEvent, OpKind, sink},
    processor::TableChangeProcessor,
    propagator::{ChangeNode, Propagator},
    relation::RelationshipConstraintValidator,
    result::{PropagatorResult, RecordRef},
    value::Value,
};
use derive_more::Display;
use std::collections::{BTreeSet, HashMap, HashSet};

///
/// SessionPhase
///

#[derive(Clone, Copy, Debug, Display, Eq, PartialEq)]
pub enum SessionPhase {
    Idle,
    Extracting,
    ConstraintChecking,
    Propagating,
    Compiling,
    Ordering,
    Executing,
    BackPropagating,
    Committed,
}

///
/// SessionConfig
///

#[derive(Clone, Copy, Debug)]
pub struct SessionConfig {
    /// Invoke [`RecordSink::accept_changes`] for every processed entry
    /// once the session commits.
    pub accept_changes: bool,
    /// Consult the interceptor (when one is supplied) before each command.
    pub intercept_commands: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            accept_changes: true,
            intercept_commands: true,
        }
    }
}

///
/// SessionReport
///

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct SessionReport {
    /// Entries in a non-Unchanged state that the session processed.
    pub entries_processed: usize,
    pub commands_executed: usize,
    pub rows_affected: u64,
}

///
/// RecordSink
///
/// The back-propagation outlet: store-generated values are written into
/// the caller's tracked records through this trait.
///

pub trait RecordSink {
    /// Write one store-generated value into the tracked record position.
    fn set_value(&mut self, target: RecordRef, value: Value);

    /// Commit acknowledgment for one processed entry.
    fn accept_changes(&mut self, entry: EntryId) {
        let _ = entry;
    }
}

/// Sink for callers with nothing to read back.
pub struct DiscardRecordSink;

impl RecordSink for DiscardRecordSink {
    fn set_value(&mut self, _target: RecordRef, _value: Value) {}
}

///
/// UpdateTranslator
///
/// Single-use session driver. Borrows the metadata model; owns every
/// other piece of session state.
///

pub struct UpdateTranslator<'a> {
    metadata: &'a MetadataModel,
    config: SessionConfig,
    phase: SessionPhase,
}

impl<'a> UpdateTranslator<'a> {
    #[must_use]
    pub fn new(metadata: &'a MetadataModel) -> Self {
        Self::with_config(metadata, SessionConfig::default())
    }

    #[must_use]
    pub const fn with_config(metadata: &'a MetadataModel, config: SessionConfig) -> Self {
        Self {
            metadata,
            config,
            phase: SessionPhase::Idle,
        }
    }

    #[must_use]
    pub const fn phase(&self) -> SessionPhase {
        self.phase
    }

    /// Run the session: every non-Unchanged entry becomes zero or more
    /// store commands, executed in dependency order inside the caller's
    /// transaction.
    pub fn update(
        &mut self,
        entries: &[ChangeEntry],
        transport: &mut dyn ExecutionTransport,
        records: &mut dyn RecordSink,
    ) -> Result<SessionReport, UpdateError> {
        self.run(entries, transport, records, None)
    }

    /// Like [`Self::update`], with an observe-and-veto hook before each
    /// command. A skipped command counts as having affected one row.
    pub fn update_with_interceptor(
        &mut self,
        entries: &[ChangeEntry],
        transport: &mut dyn ExecutionTransport,
        records: &mut dyn RecordSink,
        interceptor: &mut dyn CommandInterceptor,
    ) -> Result<SessionReport, UpdateError> {
        self.run(entries, transport, records, Some(interceptor))
    }

    fn run(
        &mut self,
        entries: &[ChangeEntry],
        transport: &mut dyn ExecutionTransport,
        records: &mut dyn RecordSink,
        interceptor: Option<&mut dyn CommandInterceptor>,
    ) -> Result<SessionReport, UpdateError> {
        if self.phase != SessionPhase::Idle {
            return Err(UpdateError::SessionConsumed);
        }

        sink::record(MetricsEvent::SessionStart);
        let result = self.run_pipeline(entries, transport, records, interceptor);
        sink::record(MetricsEvent::SessionFinish {
            committed: result.is_ok(),
        });
        result
    }

    fn run_pipeline(
        &mut self,
        entries: &[ChangeEntry],
        transport: &mut dyn ExecutionTransport,
        records: &mut dyn RecordSink,
        mut interceptor: Option<&mut dyn CommandInterceptor>,
    ) -> Result<SessionReport, UpdateError> {
        self.phase = SessionPhase::Extracting;

        let extractor = ChangeExtractor::new(self.metadata);
        let mut keys = KeyManager::new();

        // tracked entity states: principal resolution, deleted-reference
        // rejection, and co-located storage checks all consult this
        let mut tracked: HashMap<EntityKey, EntityState> = HashMap::new();
        for entry in entries {
            if let Some(key) = entry.entity_key() {
                tracked.insert(key.clone(), entry.state);
            }
        }

        let mut active: Vec<(EntryId, &ChangeEntry)> = Vec::new();
        for (index, entry) in entries.iter().enumerate() {
            let id = EntryId(index as u32);
            if entry.state == EntityState::Unchanged {
                continue;
            }
            extractor.validate(id, entry)?;
            active.push((id, entry));
        }

        // added keys first so value-written foreign keys can resolve to
        // entities added in the same session
        for (_, entry) in &active {
            extractor.register_added_key(&mut keys, entry);
        }
        for (id, entry) in &active {
            extractor.register_referential_constraints(&mut keys, *id, entry, &tracked)?;
        }

        let mut changes: HashMap<ExtentRef, ChangeNode> = HashMap::new();
        let mut function_inputs: Vec<(EntitySetId, ExtractedStateEntry)> = Vec::new();

        for (id, entry) in &active {
            let extracted = extractor.extract(&mut keys, *id, entry)?;
            match &entry.payload {
                ChangePayload::Entity { entity_set, .. } => {
                    if self.metadata.function_mapping(*entity_set).is_some() {
                        function_inputs.push((*entity_set, extracted));
                    } else {
                        self.accumulate(
                            &mut changes,
                            &keys,
                            ExtentRef::Entity(*entity_set),
                            &extracted,
                        );
                    }
                }
                ChangePayload::Relationship {
                    association_set, ..
                } => {
                    self.accumulate(
                        &mut changes,
                        &keys,
                        ExtentRef::Association(*association_set),
                        &extracted,
                    );
                }
            }
        }

        self.phase = SessionPhase::ConstraintChecking;
        keys.validate_ri_graph_acyclic()
            .map_err(UpdateError::from)?;

        let mut validator = RelationshipConstraintValidator::new(self.metadata);
        for (id, entry) in &active {
            if entry.is_relationship() {
                validator.register_relationship(*id, entry);
            } else {
                validator.register_entity(*id, entry);
            }
        }
        validator.validate(&tracked)?;

        self.phase = SessionPhase::Propagating;
        let mut tables = BTreeSet::new();
        for extent in changes.keys() {
            tables.extend(self.metadata.affected_tables(*extent));
        }

        let propagator = Propagator::new(self.metadata, &keys, &changes);
        let mut table_deltas = Vec::new();

        for table in tables {
            let Some(view) = self.metadata.view_for_table(table) else {
                continue;
            };
            let delta = propagator.propagate(&view.expr)?;
            if delta.is_empty() {
                continue;
            }
            table_deltas.push((table, delta));
        }

        self.phase = SessionPhase::Compiling;
        let compiler = CommandCompiler::new(self.metadata, &keys);
        let mut commands = Vec::new();

        for (table, delta) in &table_deltas {
            let ops = TableChangeProcessor::new(*table, self.metadata, &keys).process(delta)?;
            commands.extend(compiler.compile_table(*table, &ops)?);
        }

        for (entity_set, extracted) in &function_inputs {
            let Some(mappings) = self.metadata.function_mapping(*entity_set) else {
                continue;
            };
            commands.push(compiler.compile_function(mappings, extracted)?);
        }

        self.phase = SessionPhase::Ordering;
        let ordered = order_commands(commands)?;

        self.phase = SessionPhase::Executing;
        let mut generated: HashMap<Identifier, Value> = HashMap::new();
        let mut writes: Vec<(RecordRef, Value)> = Vec::new();
        let mut commands_executed = 0usize;
        let mut rows_total = 0u64;

        for command in &ordered {
            if self.config.intercept_commands
                && let Some(observer) = interceptor.as_deref_mut()
                && observer.before_execute(command) == InterceptorDecision::Skip
            {
                sink::record(MetricsEvent::CommandSkipped);
                commands_executed += 1;
                rows_total += 1;
                continue;
            }

            let wire = command.to_wire(&keys, &generated);
            let outcome =
                transport
                    .execute(&wire)
                    .map_err(|source| UpdateError::Transport {
                        source,
                        entries: command.source_entries().to_vec(),
                    })?;

            sink::record(MetricsEvent::CommandExecuted {
                table: command.table_and_key().map(|(table, _)| table),
                kind: op_kind(command.op()),
                rows_affected: outcome.rows_affected,
            });
            commands_executed += 1;
            rows_total += outcome.rows_affected;

            if command.expects_rows() && outcome.rows_affected == 0 {
                sink::record(MetricsEvent::ConcurrencyConflict);
                return Err(UpdateError::Concurrency {
                    rows_affected: 0,
                    expected: 1,
                    entries: command.source_entries().to_vec(),
                });
            }

            self.collect_returned_values(
                entries,
                command,
                &outcome.result_row,
                &keys,
                &mut generated,
                &mut writes,
            )?;
        }

        self.phase = SessionPhase::BackPropagating;
        let mut seen: HashSet<RecordRef> = HashSet::new();
        let mut propagated = 0u64;
        // later commands win when two write the same position
        for (target, value) in writes.into_iter().rev() {
            if seen.insert(target) {
                records.set_value(target, value);
                propagated += 1;
            }
        }
        sink::record(MetricsEvent::ValuesPropagated { count: propagated });

        self.phase = SessionPhase::Committed;
        if self.config.accept_changes {
            for (id, _) in &active {
                records.accept_changes(*id);
            }
        }

        Ok(SessionReport {
            entries_processed: active.len(),
            commands_executed,
            rows_affected: rows_total,
        })
    }

    // Fold one extracted entry into its extent's change node. Modified
    // entries contribute to both sides and merge back into an update
    // downstream.
    fn accumulate(
        &self,
        changes: &mut HashMap<ExtentRef, ChangeNode>,
        keys: &KeyManager,
        extent: ExtentRef,
        extracted: &ExtractedStateEntry,
    ) {
        if !changes.contains_key(&extent) {
            let empty = HashMap::new();
            let placeholder =
                Propagator::new(self.metadata, keys, &empty).extent_placeholder(extent);
            changes.insert(extent, ChangeNode::empty(placeholder));
        }
        let Some(node) = changes.get_mut(&extent) else {
            return;
        };

        if let Some(current) = &extracted.current {
            node.inserted.push(current.clone());
        }
        if let Some(original) = &extracted.original {
            node.deleted.push(original.clone());
        }
    }

    // Read the command's returned row back into the session: generated
    // values become resolvable for later commands immediately, record
    // writes are buffered until every command has run.
    fn collect_returned_values(
        &self,
        entries: &[ChangeEntry],
        command: &UpdateCommand,
        result_row: &Option<Vec<(String, Value)>>,
        keys: &KeyManager,
        generated: &mut HashMap<Identifier, Value>,
        writes: &mut Vec<(RecordRef, Value)>,
    ) -> Result<(), UpdateError> {
        for (column, slot) in command.result_bindings() {
            let returned = result_row
                .as_ref()
                .and_then(|row| row.iter().find(|(name, _)| name == column));
            let Some((_, value)) = returned else {
                return Err(UpdateError::MissingReturnValue {
                    column: column.clone(),
                    entries: command.source_entries().to_vec(),
                });
            };

            let value = self.check_returned_value(entries, slot, value)?;

            if let Some(id) = slot.identifier() {
                generated.insert(keys.representative(id), value.clone());

                // the whole dependent closure shares the value
                for dependent in keys.dependents(id) {
                    if let Some(owner) = keys.owner(dependent) {
                        for part in owner.chain() {
                            if let Some(target) = part.source() {
                                writes.push((target, value.clone()));
                            }
                        }
                    }
                }
            }

            for part in slot.chain() {
                if let Some(target) = part.source() {
                    writes.push((target, value.clone()));
                }
            }
        }

        Ok(())
    }

    // Typed acceptance of one returned value against the member schema it
    // flows back into.
    fn check_returned_value(
        &self,
        entries: &[ChangeEntry],
        slot: &PropagatorResult,
        value: &Value,
    ) -> Result<Value, UpdateError> {
        let Some(target) = slot.source() else {
            return Ok(value.clone());
        };
        let Some(ChangePayload::Entity { entity_set, .. }) =
            entries.get(target.entry.index()).map(|entry| &entry.payload)
        else {
            return Ok(value.clone());
        };
        let field = &self.metadata.entity_set(*entity_set).fields[target.ordinal];

        if value.is_null() {
            if field.nullable {
                return Ok(Value::Null);
            }
            return Err(UpdateError::NullReturnValue {
                member: field.name.clone(),
                entries: vec![target.entry],
            });
        }

        value
            .coerce_to(field.ty)
            .map_err(|source| UpdateError::ReturnValueType {
                member: field.name.clone(),
                source,
                entries: vec![target.entry],
            })
    }
}

const fn op_kind(op: ModificationOperator) -> OpKind {
    match op {
        ModificationOperator::Insert => OpKind::Insert,
        ModificationOperator::Update => OpKind::Update,
        ModificationOperator::Delete => OpKind::Delete,
    }
}
