//! Module: result
//! Responsibility: the immutable tagged value model flowing through the
//! pipeline — scalar and structural results, modification flags, identifier
//! linkage, and composite keys with clique-aware equality.
//! Does not own: identifier allocation or clique maintenance (see `key`).
//!
//! Invariants:
//! - A result is structural XOR scalar.
//! - Results are never mutated; `replace` produces a new tree.
//! - `next` chains are append-only and therefore acyclic by construction.


use crate::{
    changeset::EntryId,
    key::{Identifier, KeyManager},
    value::Value,
};
use std::{
    fmt,
    ops::{BitOr, BitOrAssign},
};
use thiserror::Error as ThisError;

///
/// ResultError
///
/// Shape-invariant violations: a caller reached into a result with the
/// wrong structure. Always indicates a defect in view metadata or in the
/// pipeline itself, never a user data problem.
///

#[derive(Debug, ThisError)]
pub enum ResultError {
    #[error("expected a scalar result, found a structural row")]
    NotScalar,

    #[error("expected a structural row, found a scalar")]
    NotStructural,

    #[error("row has no member at ordinal {ordinal} (width {width})")]
    MissingOrdinal { ordinal: usize, width: usize },
}

///
/// ResultFlags
///
/// Bitset describing how a value participates in the change.
///

#[derive(Clone, Copy, Default, Eq, Hash, PartialEq)]
pub struct ResultFlags(u8);

impl ResultFlags {
    pub const NONE: Self = Self(0);
    /// Value is unmodified and must be preserved by updates.
    pub const PRESERVE: Self = Self(1);
    /// Value is a concurrency token; updates predicate on it.
    pub const CONCURRENCY: Self = Self(1 << 1);
    /// Value is a primary-key component.
    pub const KEY: Self = Self(1 << 2);
    /// Value is a foreign-key component.
    pub const FOREIGN_KEY: Self = Self(1 << 3);
    /// Value is produced by the store at write time.
    pub const SERVER_GENERATED: Self = Self(1 << 4);
    /// Value exists but is not known to this session (placeholder fill).
    pub const UNKNOWN: Self = Self(1 << 5);

    #[must_use]
    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    #[must_use]
    pub const fn is_preserve(self) -> bool {
        self.contains(Self::PRESERVE)
    }
}

impl BitOr for ResultFlags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl BitOrAssign for ResultFlags {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

impl fmt::Debug for ResultFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut labels = Vec::new();
        for (flag, label) in [
            (Self::PRESERVE, "Preserve"),
            (Self::CONCURRENCY, "Concurrency"),
            (Self::KEY, "Key"),
            (Self::FOREIGN_KEY, "ForeignKey"),
            (Self::SERVER_GENERATED, "ServerGenerated"),
            (Self::UNKNOWN, "Unknown"),
        ] {
            if self.contains(flag) {
                labels.push(label);
            }
        }
        write!(f, "ResultFlags({})", labels.join("|"))
    }
}

///
/// RecordRef
///
/// Back-link from a result to the change record position it was extracted
/// from, used to inject store-generated values during back-propagation.
///

#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub struct RecordRef {
    pub entry: EntryId,
    pub ordinal: usize,
}

#[derive(Clone, Debug, Eq, Hash, PartialEq)]
enum ResultKind {
    Scalar(Value),
    Structural(Vec<PropagatorResult>),
}

///
/// PropagatorResult
///
/// Immutable node representing one value extracted from a change record or
/// derived by view propagation. "Modification" always means building a new
/// result; the originals are shared freely.
///

#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub struct PropagatorResult {
    kind: ResultKind,
    flags: ResultFlags,
    identifier: Option<Identifier>,
    source: Option<RecordRef>,
    // merged source slots from join unification; append-only chain
    next: Option<Box<PropagatorResult>>,
}

impl PropagatorResult {
    // ======================================================================
    // Construction
    // ======================================================================

    #[must_use]
    pub const fn scalar(value: Value, flags: ResultFlags) -> Self {
        Self {
            kind: ResultKind::Scalar(value),
            flags,
            identifier: None,
            source: None,
            next: None,
        }
    }

    #[must_use]
    pub fn structural(children: Vec<Self>) -> Self {
        Self {
            kind: ResultKind::Structural(children),
            flags: ResultFlags::NONE,
            identifier: None,
            source: None,
            next: None,
        }
    }

    #[must_use]
    pub const fn with_identifier(mut self, identifier: Identifier) -> Self {
        self.identifier = Some(identifier);
        self
    }

    #[must_use]
    pub const fn with_source(mut self, entry: EntryId, ordinal: usize) -> Self {
        self.source = Some(RecordRef { entry, ordinal });
        self
    }

    // ======================================================================
    // Accessors
    // ======================================================================

    #[must_use]
    pub const fn flags(&self) -> ResultFlags {
        self.flags
    }

    #[must_use]
    pub const fn identifier(&self) -> Option<Identifier> {
        self.identifier
    }

    #[must_use]
    pub const fn source(&self) -> Option<RecordRef> {
        self.source
    }

    #[must_use]
    pub const fn is_structural(&self) -> bool {
        matches!(self.kind, ResultKind::Structural(_))
    }

    /// Scalar payload, or an error for structural rows.
    pub const fn value(&self) -> Result<&Value, ResultError> {
        match &self.kind {
            ResultKind::Scalar(value) => Ok(value),
            ResultKind::Structural(_) => Err(ResultError::NotScalar),
        }
    }

    /// Child results, or an error for scalars.
    pub fn children(&self) -> Result<&[Self], ResultError> {
        match &self.kind {
            ResultKind::Structural(children) => Ok(children),
            ResultKind::Scalar(_) => Err(ResultError::NotStructural),
        }
    }

    /// Child at `ordinal` of a structural row.
    pub fn child(&self, ordinal: usize) -> Result<&Self, ResultError> {
        let children = self.children()?;
        children.get(ordinal).ok_or(ResultError::MissingOrdinal {
            ordinal,
            width: children.len(),
        })
    }

    // ======================================================================
    // Derivation
    // ======================================================================

    /// Produce a copy of this tree with every node for which `substitute`
    /// returns a replacement swapped out. Children of replaced nodes are
    /// not revisited.
    #[must_use]
    pub fn replace(&self, substitute: &impl Fn(&Self) -> Option<Self>) -> Self {
        if let Some(replacement) = substitute(self) {
            return replacement;
        }

        match &self.kind {
            ResultKind::Scalar(_) => self.clone(),
            ResultKind::Structural(children) => {
                let mut out = self.clone();
                out.kind = ResultKind::Structural(
                    children.iter().map(|child| child.replace(substitute)).collect(),
                );
                out
            }
        }
    }

    /// Merge another scalar result into this one's chain. The merged result
    /// keeps this node's value and identifier; `other`'s slots stay
    /// reachable for back-propagation.
    #[must_use]
    pub fn merged_with(&self, other: &Self) -> Self {
        let mut out = self.clone();
        let mut tail = &mut out.next;
        while let Some(node) = tail {
            tail = &mut node.next;
        }
        *tail = Some(Box::new(other.clone()));
        out
    }

    /// This result followed by every merged source in its chain.
    pub fn chain(&self) -> impl Iterator<Item = &Self> {
        let mut current = Some(self);
        std::iter::from_fn(move || {
            let node = current?;
            current = node.next.as_deref();
            Some(node)
        })
    }

    /// Entries contributing to this tree (sources of all nodes and chains).
    #[must_use]
    pub fn contributing_entries(&self) -> Vec<EntryId> {
        let mut out = Vec::new();
        self.collect_entries(&mut out);
        out.sort_unstable();
        out.dedup();
        out
    }

    fn collect_entries(&self, out: &mut Vec<EntryId>) {
        for link in self.chain() {
            if let Some(source) = link.source {
                out.push(source.entry);
            }
            if let ResultKind::Structural(children) = &link.kind {
                for child in children {
                    child.collect_entries(out);
                }
            }
        }
    }
}

///
/// CompositeKey
///
/// Ordered fixed-length slice of scalar key-component results for one row.
///

#[derive(Clone, Debug)]
pub struct CompositeKey {
    components: Vec<PropagatorResult>,
}

impl CompositeKey {
    /// Project the key components of a structural row.
    pub fn from_row(
        row: &PropagatorResult,
        key_ordinals: &[usize],
    ) -> Result<Self, ResultError> {
        let mut components = Vec::with_capacity(key_ordinals.len());
        for &ordinal in key_ordinals {
            components.push(row.child(ordinal)?.clone());
        }
        Ok(Self { components })
    }

    #[must_use]
    pub fn components(&self) -> &[PropagatorResult] {
        &self.components
    }

    /// Canonical form under the manager's cliques: components with an
    /// identifier compare by clique representative, others by literal value.
    pub fn canonical(&self, keys: &KeyManager) -> Result<CanonicalKey, ResultError> {
        let mut out = Vec::with_capacity(self.components.len());
        for component in &self.components {
            let canonical = match component.identifier() {
                Some(id) => KeyComponent::Clique(keys.representative(id)),
                None => KeyComponent::Literal(component.value()?.clone()),
            };
            out.push(canonical);
        }
        Ok(CanonicalKey(out))
    }

    /// Merge component chains of two keys that compare equal, so every
    /// source slot stays reachable from the surviving key.
    #[must_use]
    pub fn merged_with(&self, other: &Self) -> Self {
        let components = self
            .components
            .iter()
            .zip(&other.components)
            .map(|(a, b)| a.merged_with(b))
            .collect();
        Self { components }
    }

    /// Identifiers of all principal slots reachable from the components.
    #[must_use]
    pub fn principal_identifiers(&self, keys: &KeyManager) -> Vec<Identifier> {
        let mut out = Vec::new();
        for component in &self.components {
            if let Some(id) = component.identifier() {
                out.extend(keys.principals(id));
            }
        }
        out.sort_unstable();
        out.dedup();
        out
    }
}

///
/// KeyComponent
///

#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub enum KeyComponent {
    Literal(Value),
    Clique(Identifier),
}

///
/// CanonicalKey
///
/// Hashable projection of a [`CompositeKey`]; two keys are equal when every
/// component has the same literal value or resolves to the same clique.
///

#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub struct CanonicalKey(Vec<KeyComponent>);

impl CanonicalKey {
    #[must_use]
    pub fn components(&self) -> &[KeyComponent] {
        &self.0
    }
}
