//! Module: relation
//! Responsibility: validating that the session's relationship changes
//! respect association multiplicities, including participation implied by
//! added and deleted entities and co-located one-to-one storage.
//! Does not own: referential-constraint identifier plumbing (see `key`)
//! or relationship extraction.
//!
//! Invariants:
//! - A relationship instance added and deleted in the same session is a
//!   no-op and never counts against any bound.
//! - Every check is directional; each instance is counted once per end.


use crate::{
    changeset::{ChangeEntry, ChangePayload, EntityKey, EntityState, EntryId},
    metadata::{AssociationSetId, MetadataModel},
};
use std::collections::HashMap;
use thiserror::Error as ThisError;

///
/// RelationError
///

#[derive(Debug, ThisError)]
pub enum RelationError {
    #[error(
        "association '{association}', end '{end}': {count} related instance(s) found where \
         between {minimum} and {maximum:?} are required"
    )]
    CardinalityViolation {
        association: String,
        end: String,
        count: usize,
        minimum: usize,
        maximum: Option<usize>,
        entries: Vec<EntryId>,
    },

    #[error(
        "association '{association}' is stored with its dependent entity; the relationship \
         cannot change unless the dependent entity is created or deleted with it"
    )]
    MissingRequiredEntity {
        association: String,
        entries: Vec<EntryId>,
    },
}

impl RelationError {
    #[must_use]
    pub fn entries(&self) -> &[EntryId] {
        match self {
            Self::CardinalityViolation { entries, .. }
            | Self::MissingRequiredEntity { entries, .. } => entries,
        }
    }
}

// One relationship instance's accumulated changes. Equal instances added
// and deleted in the same session cancel pairwise.
#[derive(Debug, Default)]
struct InstanceCounts {
    added: Vec<EntryId>,
    deleted: Vec<EntryId>,
}

impl InstanceCounts {
    fn net_added(&self) -> usize {
        self.added.len().saturating_sub(self.deleted.len())
    }

    fn net_deleted(&self) -> usize {
        self.deleted.len().saturating_sub(self.added.len())
    }
}

// Participation demanded by an added or deleted entity at one end.
#[derive(Debug)]
struct Requirement {
    state: EntityState,
    entry: EntryId,
}

// (association, anchor instance, anchored at the from end)
type DirectionKey = (AssociationSetId, EntityKey, bool);

///
/// RelationshipConstraintValidator
///
/// Session-scoped accumulator. Entities and relationships are registered
/// as they are intaken; `validate` runs once before command compilation.
///

pub struct RelationshipConstraintValidator<'a> {
    metadata: &'a MetadataModel,
    instances: HashMap<(AssociationSetId, EntityKey, EntityKey), InstanceCounts>,
    required: HashMap<DirectionKey, Requirement>,
}

impl<'a> RelationshipConstraintValidator<'a> {
    #[must_use]
    pub fn new(metadata: &'a MetadataModel) -> Self {
        Self {
            metadata,
            instances: HashMap::new(),
            required: HashMap::new(),
        }
    }

    // ======================================================================
    // Registration
    // ======================================================================

    /// Record one relationship change.
    pub fn register_relationship(&mut self, id: EntryId, entry: &ChangeEntry) {
        let ChangePayload::Relationship {
            association_set, ..
        } = &entry.payload
        else {
            return;
        };
        let Some(snapshot) = entry.resolution_snapshot() else {
            return;
        };

        let counts = self
            .instances
            .entry((*association_set, snapshot.from.clone(), snapshot.to.clone()))
            .or_default();
        match entry.state {
            EntityState::Added => counts.added.push(id),
            EntityState::Deleted => counts.deleted.push(id),
            EntityState::Modified | EntityState::Unchanged => {}
        }
    }

    /// Record participation implied by an added or deleted entity: every
    /// end whose opposite end has a lower bound demands relationship
    /// changes alongside the entity.
    pub fn register_entity(&mut self, id: EntryId, entry: &ChangeEntry) {
        let ChangePayload::Entity {
            entity_set, key, ..
        } = &entry.payload
        else {
            return;
        };
        if !matches!(entry.state, EntityState::Added | EntityState::Deleted) {
            return;
        }

        for (association_id, association) in
            self.metadata.association_sets_referencing(*entity_set)
        {
            for (anchor, other, anchor_is_from) in [
                (&association.from, &association.to, true),
                (&association.to, &association.from, false),
            ] {
                if anchor.entity_set != *entity_set {
                    continue;
                }
                if other.multiplicity.lower_bound() == 0 {
                    continue;
                }
                self.required.insert(
                    (association_id, key.clone(), anchor_is_from),
                    Requirement {
                        state: entry.state,
                        entry: id,
                    },
                );
            }
        }
    }

    // ======================================================================
    // Validation
    // ======================================================================

    /// Check every accumulated direction against the model's bounds.
    /// `tracked` maps entity keys to their tracked state (for co-located
    /// storage checks).
    pub fn validate(
        &self,
        tracked: &HashMap<EntityKey, EntityState>,
    ) -> Result<(), RelationError> {
        let directions = self.direction_totals();

        // upper bounds on every touched direction
        for ((association_id, _, anchor_is_from), totals) in &directions {
            let association = self.metadata.association_set(*association_id);
            let target = if *anchor_is_from {
                &association.to
            } else {
                &association.from
            };

            if let Some(maximum) = target.multiplicity.upper_bound()
                && totals.added.saturating_sub(totals.deleted) > maximum
            {
                return Err(RelationError::CardinalityViolation {
                    association: association.name.clone(),
                    end: target.name.clone(),
                    count: totals.added - totals.deleted,
                    minimum: target.multiplicity.lower_bound(),
                    maximum: Some(maximum),
                    entries: totals.entries.clone(),
                });
            }
        }

        // lower bounds demanded by added and deleted entities
        for ((association_id, anchor, anchor_is_from), requirement) in &self.required {
            let association = self.metadata.association_set(*association_id);
            let target = if *anchor_is_from {
                &association.to
            } else {
                &association.from
            };
            let minimum = target.multiplicity.lower_bound();

            let found = directions
                .get(&(*association_id, anchor.clone(), *anchor_is_from));
            let count = match requirement.state {
                EntityState::Added => found.map_or(0, |totals| totals.added),
                _ => found.map_or(0, |totals| totals.deleted),
            };

            if count < minimum {
                let mut entries = vec![requirement.entry];
                if let Some(totals) = found {
                    entries.extend(totals.entries.iter().copied());
                    entries.sort_unstable();
                    entries.dedup();
                }
                return Err(RelationError::CardinalityViolation {
                    association: association.name.clone(),
                    end: target.name.clone(),
                    count,
                    minimum,
                    maximum: target.multiplicity.upper_bound(),
                    entries,
                });
            }
        }

        self.validate_co_located(tracked)
    }

    // Relationships stored in the dependent entity's own table can only
    // change when that row is itself inserted or deleted.
    fn validate_co_located(
        &self,
        tracked: &HashMap<EntityKey, EntityState>,
    ) -> Result<(), RelationError> {
        for ((association_id, _, to_key), counts) in &self.instances {
            let association = self.metadata.association_set(*association_id);
            if association.co_located_table.is_none() {
                continue;
            }

            let dependent_state = tracked.get(to_key);
            let violated = (counts.net_added() > 0
                && dependent_state != Some(&EntityState::Added))
                || (counts.net_deleted() > 0
                    && dependent_state != Some(&EntityState::Deleted));

            if violated {
                let mut entries = counts.added.clone();
                entries.extend(counts.deleted.iter().copied());
                entries.sort_unstable();
                entries.dedup();
                return Err(RelationError::MissingRequiredEntity {
                    association: association.name.clone(),
                    entries,
                });
            }
        }

        Ok(())
    }

    // Aggregate instance-level nets into per-direction totals.
    fn direction_totals(&self) -> HashMap<DirectionKey, DirectionTotals> {
        let mut out: HashMap<DirectionKey, DirectionTotals> = HashMap::new();

        for ((association_id, from, to), counts) in &self.instances {
            let net_added = counts.net_added();
            let net_deleted = counts.net_deleted();
            if net_added == 0 && net_deleted == 0 {
                continue;
            }

            let mut entries: Vec<EntryId> = counts.added.iter().copied().collect();
            entries.extend(counts.deleted.iter().copied());
            entries.sort_unstable();
            entries.dedup();

            for (anchor, anchor_is_from) in [(from, true), (to, false)] {
                let totals = out
                    .entry((*association_id, anchor.clone(), anchor_is_from))
                    .or_default();
                totals.added += net_added;
                totals.deleted += net_deleted;
                totals.entries.extend(entries.iter().copied());
                totals.entries.sort_unstable();
                totals.entries.dedup();
            }
        }

        out
    }
}

#[derive(Debug, Default)]
struct DirectionTotals {
    added: usize,
    deleted: usize,
    entries: Vec<EntryId>,
}
