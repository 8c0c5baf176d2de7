//! Module: extract
//! Responsibility: converting tracked change entries into typed result
//! trees — tagging modified fields, assigning key/foreign-key identifiers,
//! and registering referential constraints with the key manager.
//! Does not own: view propagation or command compilation; it only produces
//! the per-extent inputs those stages consume.
//!
//! Invariants:
//! - Every produced scalar slot carries a back-link to its record position.
//! - Key slots of entity records are registered as identifier owners.
//! - Entries are validated before any identifier state is touched.

#[cfg(test)]
mod tests;

use crate::{
    changeset::{
        ChangeEntry, ChangePayload, EntityKey, EntityState, EntryId, ModifiedFields, Record,
        RelationshipSnapshot,
    },
    key::{KeyError, KeyManager},
    metadata::{AssociationSetSchema, EntitySetId, MetadataModel},
    result::{PropagatorResult, ResultError, ResultFlags},
    value::Value,
};
use std::collections::{BTreeSet, HashMap};
use thiserror::Error as ThisError;

///
/// ExtractError
///

#[derive(Debug, ThisError)]
pub enum ExtractError {
    #[error("{entry}: malformed change entry: {reason}")]
    MalformedEntry { entry: EntryId, reason: String },

    #[error("{entry}: record width {found} does not match schema width {expected}")]
    RecordWidthMismatch {
        entry: EntryId,
        expected: usize,
        found: usize,
    },

    #[error(
        "{entry}: foreign key of '{association}' matches more than one added entity; \
         the reference is ambiguous"
    )]
    AmbiguousForeignKey { entry: EntryId, association: String },

    #[error("{entry}: cannot insert or update a reference to a deleted principal via '{association}'")]
    ReferenceToDeletedPrincipal { entry: EntryId, association: String },

    #[error(transparent)]
    Key(#[from] KeyError),

    #[error(transparent)]
    Result(#[from] ResultError),
}

///
/// ExtractedStateEntry
///
/// Pipeline-internal form of one change entry: original and current
/// snapshots as tagged result trees.
///

#[derive(Clone, Debug)]
pub struct ExtractedStateEntry {
    pub id: EntryId,
    pub state: EntityState,
    pub original: Option<PropagatorResult>,
    pub current: Option<PropagatorResult>,
}

///
/// ChangeExtractor
///
/// Stateless over the session apart from the metadata borrow; identifier
/// state lives in the [`KeyManager`] passed into each call.
///

#[derive(Clone, Copy, Debug)]
pub struct ChangeExtractor<'a> {
    metadata: &'a MetadataModel,
}

impl<'a> ChangeExtractor<'a> {
    #[must_use]
    pub const fn new(metadata: &'a MetadataModel) -> Self {
        Self { metadata }
    }

    // ======================================================================
    // Validation
    // ======================================================================

    /// Verify the entry's snapshots agree with its state and schema.
    pub fn validate(&self, id: EntryId, entry: &ChangeEntry) -> Result<(), ExtractError> {
        match &entry.payload {
            ChangePayload::Entity {
                entity_set,
                key,
                original,
                current,
                ..
            } => {
                self.check_snapshot_presence(
                    id,
                    entry.state,
                    original.is_some(),
                    current.is_some(),
                )?;

                if key.entity_set() != *entity_set {
                    return Err(ExtractError::MalformedEntry {
                        entry: id,
                        reason: format!(
                            "key belongs to {} but entry targets {entity_set}",
                            key.entity_set()
                        ),
                    });
                }

                let width = self.metadata.entity_set(*entity_set).fields.len();
                for record in [original, current].into_iter().flatten() {
                    if record.len() != width {
                        return Err(ExtractError::RecordWidthMismatch {
                            entry: id,
                            expected: width,
                            found: record.len(),
                        });
                    }
                }

                Ok(())
            }
            ChangePayload::Relationship {
                association_set,
                original,
                current,
            } => {
                self.check_snapshot_presence(
                    id,
                    entry.state,
                    original.is_some(),
                    current.is_some(),
                )?;

                let schema = self.metadata.association_set(*association_set);
                for snapshot in [original, current].into_iter().flatten() {
                    if snapshot.from.entity_set() != schema.from.entity_set
                        || snapshot.to.entity_set() != schema.to.entity_set
                    {
                        return Err(ExtractError::MalformedEntry {
                            entry: id,
                            reason: format!(
                                "relationship ends do not match the declared ends of '{}'",
                                schema.name
                            ),
                        });
                    }
                }

                Ok(())
            }
        }
    }

    fn check_snapshot_presence(
        &self,
        id: EntryId,
        state: EntityState,
        has_original: bool,
        has_current: bool,
    ) -> Result<(), ExtractError> {
        if state.has_original() != has_original || state.has_current() != has_current {
            return Err(ExtractError::MalformedEntry {
                entry: id,
                reason: format!(
                    "state {state} requires original={} current={}",
                    state.has_original(),
                    state.has_current()
                ),
            });
        }
        Ok(())
    }

    // ======================================================================
    // Added-entity key registration (first pass)
    // ======================================================================

    /// Register the value-built key of an added entity so foreign keys
    /// written by value can resolve to the pending key.
    pub fn register_added_key(&self, keys: &mut KeyManager, entry: &ChangeEntry) {
        let ChangePayload::Entity {
            entity_set,
            key,
            current: Some(record),
            ..
        } = &entry.payload
        else {
            return;
        };
        if entry.state != EntityState::Added {
            return;
        }

        let schema = self.metadata.entity_set(*entity_set);
        let mut values = Vec::with_capacity(schema.key_ordinals.len());
        for &ordinal in &schema.key_ordinals {
            match record.get(ordinal) {
                Some(value) if !value.is_null() => values.push(value.clone()),
                // a pending (server-generated) component: no value key exists
                _ => return,
            }
        }

        keys.register_added_key(
            EntityKey::Literal {
                entity_set: *entity_set,
                values,
            },
            key.clone(),
        );
    }

    // ======================================================================
    // Referential-constraint registration (second pass)
    // ======================================================================

    /// Register identifier equivalences implied by this entry. `tracked`
    /// maps known entity keys to their tracked state (used to reject
    /// references to deleted principals).
    pub fn register_referential_constraints(
        &self,
        keys: &mut KeyManager,
        id: EntryId,
        entry: &ChangeEntry,
        tracked: &HashMap<EntityKey, EntityState>,
    ) -> Result<(), ExtractError> {
        match &entry.payload {
            ChangePayload::Relationship {
                association_set, ..
            } => {
                let schema = self.metadata.association_set(*association_set);
                if schema.constraint.is_none() {
                    return Ok(());
                }
                let Some(snapshot) = entry.resolution_snapshot() else {
                    return Ok(());
                };
                self.register_relationship_constraint(keys, id, schema, snapshot)
            }
            ChangePayload::Entity { .. } => {
                if matches!(entry.state, EntityState::Added | EntityState::Modified) {
                    self.register_entity_constraints(keys, id, entry, tracked, true)?;
                }
                if matches!(entry.state, EntityState::Deleted | EntityState::Modified) {
                    self.register_entity_constraints(keys, id, entry, tracked, false)?;
                }
                Ok(())
            }
        }
    }

    fn register_relationship_constraint(
        &self,
        keys: &mut KeyManager,
        id: EntryId,
        schema: &AssociationSetSchema,
        snapshot: &RelationshipSnapshot,
    ) -> Result<(), ExtractError> {
        let Some(constraint) = &schema.constraint else {
            return Ok(());
        };

        let principal_total = self.metadata.key_member_count(schema.from.entity_set);
        let dependent_schema = self.metadata.entity_set(schema.to.entity_set);
        let dependent_total = dependent_schema.key_ordinals.len();

        for (&principal_offset, &dependent_ordinal) in
            constraint.principal_props.iter().zip(&constraint.dependent_props)
        {
            let principal =
                keys.identifier_for_key_offset(&snapshot.from, principal_offset, principal_total)?;

            let dependent = match dependent_schema.key_offset(dependent_ordinal) {
                Some(offset) => {
                    keys.identifier_for_key_offset(&snapshot.to, offset, dependent_total)?
                }
                None => {
                    let member = &dependent_schema.fields[dependent_ordinal].name;
                    keys.identifier_for_member(&snapshot.to, member, true)
                }
            };

            keys.add_referential_constraint(id, dependent, principal);
        }

        Ok(())
    }

    fn register_entity_constraints(
        &self,
        keys: &mut KeyManager,
        id: EntryId,
        entry: &ChangeEntry,
        tracked: &HashMap<EntityKey, EntityState>,
        use_current: bool,
    ) -> Result<(), ExtractError> {
        let ChangePayload::Entity {
            entity_set,
            key: dependent_key,
            original,
            current,
            ..
        } = &entry.payload
        else {
            return Ok(());
        };

        let record = if use_current { current } else { original };
        let Some(record) = record else {
            return Ok(());
        };

        let dependent_schema = self.metadata.entity_set(*entity_set);
        let dependent_total = dependent_schema.key_ordinals.len();

        for (_, association) in self.metadata.association_sets() {
            if association.to.entity_set != *entity_set {
                continue;
            }
            let Some(constraint) = &association.constraint else {
                continue;
            };

            // build the principal key from the foreign-key values
            let Some(principal_key) =
                Self::principal_key_from_record(association, constraint, record)
            else {
                continue; // a null component means no reference
            };

            let principal_key = self.resolve_principal_key(
                keys,
                id,
                entry,
                association,
                principal_key,
                tracked,
                use_current,
            )?;

            let principal_total = self.metadata.key_member_count(association.from.entity_set);

            for (&principal_offset, &dependent_ordinal) in
                constraint.principal_props.iter().zip(&constraint.dependent_props)
            {
                let principal = keys.identifier_for_key_offset(
                    &principal_key,
                    principal_offset,
                    principal_total,
                )?;

                let dependent = match dependent_schema.key_offset(dependent_ordinal) {
                    Some(offset) => keys.identifier_for_key_offset(
                        dependent_key,
                        offset,
                        dependent_total,
                    )?,
                    None => {
                        let member = &dependent_schema.fields[dependent_ordinal].name;
                        keys.identifier_for_member(dependent_key, member, use_current)
                    }
                };

                keys.add_referential_constraint(id, dependent, principal);
            }
        }

        Ok(())
    }

    // Foreign-key values ordered by principal key member offset; None when
    // any component is null.
    fn principal_key_from_record(
        association: &AssociationSetSchema,
        constraint: &crate::metadata::ReferentialConstraint,
        record: &Record,
    ) -> Option<EntityKey> {
        let mut pairs: Vec<(usize, Value)> = Vec::with_capacity(constraint.principal_props.len());
        for (&principal_offset, &dependent_ordinal) in
            constraint.principal_props.iter().zip(&constraint.dependent_props)
        {
            let value = record.get(dependent_ordinal)?;
            if value.is_null() {
                return None;
            }
            pairs.push((principal_offset, value.clone()));
        }

        pairs.sort_by_key(|(offset, _)| *offset);
        Some(EntityKey::Literal {
            entity_set: association.from.entity_set,
            values: pairs.into_iter().map(|(_, value)| value).collect(),
        })
    }

    // Resolve a value-built principal key: prefer a tracked entity, then a
    // pending (added) key; reject ambiguous or deleted targets.
    #[expect(clippy::too_many_arguments)]
    fn resolve_principal_key(
        &self,
        keys: &KeyManager,
        id: EntryId,
        entry: &ChangeEntry,
        association: &AssociationSetSchema,
        principal_key: EntityKey,
        tracked: &HashMap<EntityKey, EntityState>,
        use_current: bool,
    ) -> Result<EntityKey, ExtractError> {
        if let Some(state) = tracked.get(&principal_key) {
            if use_current
                && *state == EntityState::Deleted
                && matches!(entry.state, EntityState::Added | EntityState::Modified)
            {
                return Err(ExtractError::ReferenceToDeletedPrincipal {
                    entry: id,
                    association: association.name.clone(),
                });
            }
            return Ok(principal_key);
        }

        // original values cannot refer to an entity that was only just added
        if use_current {
            match keys.resolve_added_key(&principal_key) {
                Some(Some(temp)) => return Ok(temp.clone()),
                Some(None) => {
                    return Err(ExtractError::AmbiguousForeignKey {
                        entry: id,
                        association: association.name.clone(),
                    });
                }
                None => {}
            }
        }

        Ok(principal_key)
    }

    // ======================================================================
    // Extraction (third pass)
    // ======================================================================

    /// Convert one validated entry into tagged result trees.
    pub fn extract(
        &self,
        keys: &mut KeyManager,
        id: EntryId,
        entry: &ChangeEntry,
    ) -> Result<ExtractedStateEntry, ExtractError> {
        let (original, current) = match &entry.payload {
            ChangePayload::Entity {
                entity_set,
                key,
                original,
                current,
                modified,
            } => {
                let original = original
                    .as_ref()
                    .map(|record| {
                        self.extract_entity_record(
                            keys, id, *entity_set, key, record, modified, false,
                        )
                    })
                    .transpose()?;
                let current = current
                    .as_ref()
                    .map(|record| {
                        self.extract_entity_record(
                            keys, id, *entity_set, key, record, modified, true,
                        )
                    })
                    .transpose()?;
                (original, current)
            }
            ChangePayload::Relationship {
                association_set,
                original,
                current,
            } => {
                let schema = self.metadata.association_set(*association_set);
                let original = original
                    .as_ref()
                    .map(|snapshot| self.extract_relationship(keys, id, schema, snapshot))
                    .transpose()?;
                let current = current
                    .as_ref()
                    .map(|snapshot| self.extract_relationship(keys, id, schema, snapshot))
                    .transpose()?;
                (original, current)
            }
        };

        Ok(ExtractedStateEntry {
            id,
            state: entry.state,
            original,
            current,
        })
    }

    #[expect(clippy::too_many_arguments)]
    fn extract_entity_record(
        &self,
        keys: &mut KeyManager,
        id: EntryId,
        entity_set: EntitySetId,
        key: &EntityKey,
        record: &Record,
        modified: &ModifiedFields,
        is_current: bool,
    ) -> Result<PropagatorResult, ExtractError> {
        let schema = self.metadata.entity_set(entity_set);
        let key_total = schema.key_ordinals.len();
        let fk_ordinals = self.foreign_key_ordinals(entity_set);

        let mut children = Vec::with_capacity(schema.fields.len());
        for (ordinal, field) in schema.fields.iter().enumerate() {
            let mut flags = ResultFlags::NONE;
            if !modified.is_modified(ordinal) {
                flags |= ResultFlags::PRESERVE;
            }
            if field.concurrency_token {
                flags |= ResultFlags::CONCURRENCY;
            }
            if field.server_generated {
                flags |= ResultFlags::SERVER_GENERATED;
            }

            let key_offset = schema.key_offset(ordinal);
            if key_offset.is_some() {
                flags |= ResultFlags::KEY;
            }
            if fk_ordinals.contains(&ordinal) {
                flags |= ResultFlags::FOREIGN_KEY;
            }

            let value = record
                .get(ordinal)
                .cloned()
                .unwrap_or(Value::Null);

            let mut result =
                PropagatorResult::scalar(value, flags).with_source(id, ordinal);

            // key slots and foreign-key slots participate in identifier
            // resolution; the slot addressing must match constraint
            // registration exactly
            if let Some(offset) = key_offset {
                let identifier = keys.identifier_for_key_offset(key, offset, key_total)?;
                result = result.with_identifier(identifier);
                if is_current {
                    keys.register_owner(&result);
                }
            } else if fk_ordinals.contains(&ordinal) {
                let identifier = keys.identifier_for_member(key, &field.name, is_current);
                result = result.with_identifier(identifier);
            }

            children.push(result);
        }

        Ok(PropagatorResult::structural(children))
    }

    // Relationship rows flatten to [from-end key components, to-end key
    // components] so mapping views can project them by flat ordinal.
    fn extract_relationship(
        &self,
        keys: &mut KeyManager,
        id: EntryId,
        schema: &AssociationSetSchema,
        snapshot: &RelationshipSnapshot,
    ) -> Result<PropagatorResult, ExtractError> {
        let mut children = Vec::new();
        let mut ordinal = 0;

        for (end, end_key) in [
            (&schema.from, &snapshot.from),
            (&schema.to, &snapshot.to),
        ] {
            let end_schema = self.metadata.entity_set(end.entity_set);
            let total = end_schema.key_ordinals.len();

            for offset in 0..total {
                let identifier = keys.identifier_for_key_offset(end_key, offset, total)?;
                let value = match end_key {
                    EntityKey::Literal { values, .. } => {
                        values.get(offset).cloned().unwrap_or(Value::Null)
                    }
                    EntityKey::Temporary { .. } => Value::Null,
                };

                let flags = ResultFlags::KEY | ResultFlags::FOREIGN_KEY;
                children.push(
                    PropagatorResult::scalar(value, flags)
                        .with_identifier(identifier)
                        .with_source(id, ordinal),
                );
                ordinal += 1;
            }
        }

        Ok(PropagatorResult::structural(children))
    }

    // Field ordinals of `entity_set` that appear as the dependent side of
    // any referential constraint.
    fn foreign_key_ordinals(&self, entity_set: EntitySetId) -> BTreeSet<usize> {
        let mut out = BTreeSet::new();
        for (_, association) in self.metadata.association_sets() {
            if association.to.entity_set != entity_set {
                continue;
            }
            if let Some(constraint) = &association.constraint {
                out.extend(constraint.dependent_props.iter().copied());
            }
        }
        out
    }
}
