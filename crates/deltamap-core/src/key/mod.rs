//! Module: key
//! Responsibility: symbolic identifiers for key-value slots, including keys
//! whose values are still pending store generation, and the referential
//! constraint graph linking dependent slots to principal slots.
//! Does not own: result trees (it stores owner results opaquely) or
//! command ordering (it only answers principal/dependent queries).
//!
//! Invariants:
//! - Identifiers are session-scoped dense handles; the same key slot always
//!   resolves to the same identifier.
//! - Cliques only grow; two identifiers once unified stay unified.
//! - The directed constraint graph must be acyclic; `validate_ri_graph_acyclic`
//!   is the single enforcement point.

#[cfg(test)]
mod tests;

use crate::{
    changeset::{EntityKey, EntryId},
    result::PropagatorResult,
};
use derive_more::Display;
use std::collections::{BTreeSet, HashMap};
use thiserror::Error as ThisError;

///
/// KeyError
///

#[derive(Debug, ThisError)]
pub enum KeyError {
    #[error("referential constraints form a cycle; no update ordering can satisfy them")]
    ConstraintCycle { entries: Vec<EntryId> },

    #[error("key member offset {offset} out of range for a key with {total} members")]
    InvalidKeyOffset { offset: usize, total: usize },
}

///
/// Identifier
///
/// Dense handle for one key-component slot. Scalar results carry one when
/// they participate in key or foreign-key resolution.
///

#[derive(Clone, Copy, Debug, Display, Eq, Hash, Ord, PartialEq, PartialOrd)]
#[display("id#{_0}")]
pub struct Identifier(u32);

impl Identifier {
    #[must_use]
    const fn index(self) -> usize {
        self.0 as usize
    }
}

// Slot addressing: one identifier per (key, key-member offset) and one per
// (key, member name, record side) for non-key dependent members.
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
enum SlotKey {
    Offset { key: EntityKey, offset: usize },
    Member {
        key: EntityKey,
        member: String,
        current: bool,
    },
}

// Resolution of a value-built key against added entities.
#[derive(Clone, Debug)]
enum KeyResolution {
    Unique(EntityKey),
    Ambiguous,
}

///
/// KeyManager
///
/// Session-scoped. Owned exclusively by one translator; never shared
/// across sessions.
///

#[derive(Debug, Default)]
pub struct KeyManager {
    // union-find over raw identifiers (value-equivalence cliques)
    parent: Vec<u32>,

    slots: HashMap<SlotKey, Identifier>,

    // directed referential-constraint graph over raw identifiers
    principal_edges: HashMap<Identifier, BTreeSet<Identifier>>,
    dependent_edges: HashMap<Identifier, BTreeSet<Identifier>>,

    // justification entries, keyed by the dependent identifier
    dependent_entries: HashMap<Identifier, Vec<EntryId>>,

    owners: HashMap<Identifier, PropagatorResult>,

    value_keys: HashMap<EntityKey, KeyResolution>,
}

impl KeyManager {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    // ======================================================================
    // Identifier allocation
    // ======================================================================

    fn allocate(&mut self) -> Identifier {
        let id = Identifier(self.parent.len() as u32);
        self.parent.push(id.0);
        id
    }

    /// Identifier for the `offset`-th member of the given key.
    pub fn identifier_for_key_offset(
        &mut self,
        key: &EntityKey,
        offset: usize,
        total: usize,
    ) -> Result<Identifier, KeyError> {
        if offset >= total {
            return Err(KeyError::InvalidKeyOffset { offset, total });
        }

        Ok(self.slot(SlotKey::Offset {
            key: key.clone(),
            offset,
        }))
    }

    /// Identifier for a named non-key member of a dependent record.
    /// `use_current` distinguishes the current-values slot from the
    /// original-values slot of the same member.
    pub fn identifier_for_member(
        &mut self,
        key: &EntityKey,
        member: &str,
        use_current: bool,
    ) -> Identifier {
        self.slot(SlotKey::Member {
            key: key.clone(),
            member: member.to_string(),
            current: use_current,
        })
    }

    fn slot(&mut self, slot: SlotKey) -> Identifier {
        if let Some(&id) = self.slots.get(&slot) {
            return id;
        }

        let id = self.allocate();
        self.slots.insert(slot, id);
        id
    }

    // ======================================================================
    // Referential constraints
    // ======================================================================

    /// Register that `dependent` takes its value from `principal`, merging
    /// their cliques. `entry` is kept as justification for diagnostics.
    pub fn add_referential_constraint(
        &mut self,
        entry: EntryId,
        dependent: Identifier,
        principal: Identifier,
    ) {
        self.dependent_entries.entry(dependent).or_default().push(entry);

        if dependent == principal {
            return;
        }

        self.principal_edges
            .entry(dependent)
            .or_default()
            .insert(principal);
        self.dependent_edges
            .entry(principal)
            .or_default()
            .insert(dependent);

        self.union(dependent, principal);
    }

    /// Canonical representative of the identifier's value clique.
    #[must_use]
    pub fn representative(&self, id: Identifier) -> Identifier {
        let mut current = id.index();
        while self.parent[current] as usize != current {
            current = self.parent[current] as usize;
        }
        Identifier(current as u32)
    }

    #[must_use]
    pub fn same_clique(&self, a: Identifier, b: Identifier) -> bool {
        self.representative(a) == self.representative(b)
    }

    fn union(&mut self, a: Identifier, b: Identifier) {
        let ra = self.find_compress(a.index());
        let rb = self.find_compress(b.index());
        if ra != rb {
            // principal side owns: dependents re-root under the principal
            self.parent[ra] = rb as u32;
        }
    }

    fn find_compress(&mut self, mut current: usize) -> usize {
        while self.parent[current] as usize != current {
            let grandparent = self.parent[self.parent[current] as usize];
            self.parent[current] = grandparent;
            current = grandparent as usize;
        }
        current
    }

    // ======================================================================
    // Graph traversal
    // ======================================================================

    /// All identifiers transitively linked as principals, including `id`.
    #[must_use]
    pub fn principals(&self, id: Identifier) -> Vec<Identifier> {
        self.closure(id, &self.principal_edges)
    }

    /// All identifiers transitively linked as dependents, including `id`.
    #[must_use]
    pub fn dependents(&self, id: Identifier) -> Vec<Identifier> {
        self.closure(id, &self.dependent_edges)
    }

    fn closure(
        &self,
        start: Identifier,
        edges: &HashMap<Identifier, BTreeSet<Identifier>>,
    ) -> Vec<Identifier> {
        let mut seen = BTreeSet::from([start]);
        let mut stack = vec![start];

        while let Some(node) = stack.pop() {
            if let Some(next) = edges.get(&node) {
                for &target in next {
                    if seen.insert(target) {
                        stack.push(target);
                    }
                }
            }
        }

        seen.into_iter().collect()
    }

    /// Verify the directed constraint graph has no cycle. A back-edge means
    /// no execution order can satisfy the provider's constraints.
    pub fn validate_ri_graph_acyclic(&self) -> Result<(), KeyError> {
        #[derive(Clone, Copy, PartialEq)]
        enum Color {
            White,
            Gray,
            Black,
        }

        let mut colors = vec![Color::White; self.parent.len()];

        for start in 0..self.parent.len() {
            if colors[start] != Color::White {
                continue;
            }

            // iterative DFS keeping the gray path for cycle reporting
            let mut stack = vec![(Identifier(start as u32), false)];
            while let Some((node, children_done)) = stack.pop() {
                if children_done {
                    colors[node.index()] = Color::Black;
                    continue;
                }
                if colors[node.index()] == Color::Black {
                    continue;
                }

                colors[node.index()] = Color::Gray;
                stack.push((node, true));

                if let Some(next) = self.dependent_edges.get(&node) {
                    for &target in next {
                        match colors[target.index()] {
                            Color::White => stack.push((target, false)),
                            Color::Gray => {
                                return Err(KeyError::ConstraintCycle {
                                    entries: self.cycle_entries(&stack),
                                });
                            }
                            Color::Black => {}
                        }
                    }
                }
            }
        }

        Ok(())
    }

    // Justification entries for every identifier on the gray path.
    fn cycle_entries(&self, stack: &[(Identifier, bool)]) -> Vec<EntryId> {
        let mut entries = BTreeSet::new();
        for (node, on_path) in stack {
            if *on_path
                && let Some(found) = self.dependent_entries.get(node)
            {
                entries.extend(found.iter().copied());
            }
        }
        entries.into_iter().collect()
    }

    /// Entries registered as justification for constraints on `id`.
    #[must_use]
    pub fn constraint_entries(&self, id: Identifier) -> &[EntryId] {
        self.dependent_entries
            .get(&id)
            .map_or(&[], |entries| entries.as_slice())
    }

    // ======================================================================
    // Owners
    // ======================================================================

    /// Register the canonical owner result for the identifier carried by
    /// `result`. Only entity-level key slots are registered; the first
    /// registration wins (association-end copies are not owners).
    pub fn register_owner(&mut self, result: &PropagatorResult) {
        if let Some(id) = result.identifier() {
            self.owners.entry(id).or_insert_with(|| result.clone());
        }
    }

    #[must_use]
    pub fn owner(&self, id: Identifier) -> Option<&PropagatorResult> {
        self.owners.get(&id)
    }

    // ======================================================================
    // Added-entity key registry
    // ======================================================================

    /// Remember that the value-built key `value_key` refers to the added
    /// entity tracked under `actual`. A second registration of the same
    /// value key makes the mapping ambiguous.
    pub fn register_added_key(&mut self, value_key: EntityKey, actual: EntityKey) {
        self.value_keys
            .entry(value_key)
            .and_modify(|existing| *existing = KeyResolution::Ambiguous)
            .or_insert(KeyResolution::Unique(actual));
    }

    /// Resolve a value-built key against added entities.
    ///
    /// `None`: no added entity claims this key. `Some(None)`: more than one
    /// does (ambiguous). `Some(Some(key))`: unique resolution.
    #[must_use]
    pub fn resolve_added_key(&self, value_key: &EntityKey) -> Option<Option<&EntityKey>> {
        self.value_keys.get(value_key).map(|res| match res {
            KeyResolution::Unique(key) => Some(key),
            KeyResolution::Ambiguous => None,
        })
    }
}
