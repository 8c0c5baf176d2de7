//! Core runtime for deltamap: the change-propagation pipeline that turns
//! tracked entity and relationship modifications into an ordered sequence
//! of store-level write commands, and the ergonomics exported via the
//! `prelude`.
#![warn(unreachable_pub)]

// public exports are one module level down
pub mod changeset;
pub mod command;
pub mod error;
pub mod extract;
pub mod key;
pub mod metadata;
pub mod obs;
pub mod processor;
pub mod propagator;
pub mod relation;
pub mod result;
pub mod translator;
pub mod value;

// test
#[cfg(test)]
pub(crate) mod test_fixtures;

///
/// Prelude
///
/// Prelude contains only domain vocabulary.
/// No transports, compilers, or pipeline internals are re-exported here.
///

pub mod prelude {
    pub use crate::{
        changeset::{ChangeEntry, ChangePayload, EntityKey, EntityState, ModifiedFields, Record},
        error::UpdateError,
        metadata::{MetadataModel, Multiplicity},
        translator::{SessionConfig, SessionReport, UpdateTranslator},
        value::{Value, ValueType},
    };
}
