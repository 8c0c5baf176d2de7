//! Module: error
//! Responsibility: the single error surface callers see from an update
//! session. Stage-specific errors stay in their owning modules and are
//! aggregated here transparently.

use crate::{
    changeset::EntryId,
    command::{CommandError, TransportError},
    extract::ExtractError,
    key::KeyError,
    processor::ProcessorError,
    propagator::PropagationError,
    relation::RelationError,
    value::CoercionError,
};
use thiserror::Error as ThisError;

///
/// UpdateError
///

#[derive(Debug, ThisError)]
pub enum UpdateError {
    #[error(transparent)]
    Key(#[from] KeyError),

    #[error(transparent)]
    Extract(#[from] ExtractError),

    #[error(transparent)]
    Propagation(#[from] PropagationError),

    #[error(transparent)]
    Processor(#[from] ProcessorError),

    #[error(transparent)]
    Relation(#[from] RelationError),

    #[error(transparent)]
    Command(#[from] CommandError),

    #[error("{source}")]
    Transport {
        #[source]
        source: TransportError,
        entries: Vec<EntryId>,
    },

    #[error(
        "a command affected {rows_affected} row(s) where {expected} were expected; \
         the data may have been modified or deleted since it was loaded"
    )]
    Concurrency {
        rows_affected: u64,
        expected: u64,
        entries: Vec<EntryId>,
    },

    #[error("the store returned a null value for the non-nullable member '{member}'")]
    NullReturnValue { member: String, entries: Vec<EntryId> },

    #[error("the store returned an unusable value for member '{member}': {source}")]
    ReturnValueType {
        member: String,
        #[source]
        source: CoercionError,
        entries: Vec<EntryId>,
    },

    #[error("the store returned no value for result binding '{column}'")]
    MissingReturnValue { column: String, entries: Vec<EntryId> },

    #[error("the update session has already run; a session is single use")]
    SessionConsumed,
}

impl UpdateError {
    /// Change entries implicated in the failure, if the stage tracked any.
    #[must_use]
    pub fn entries(&self) -> Vec<EntryId> {
        match self {
            Self::Key(err) => match err {
                KeyError::ConstraintCycle { entries } => entries.clone(),
                KeyError::InvalidKeyOffset { .. } => Vec::new(),
            },
            Self::Extract(err) => match err {
                ExtractError::MalformedEntry { entry, .. }
                | ExtractError::RecordWidthMismatch { entry, .. }
                | ExtractError::AmbiguousForeignKey { entry, .. }
                | ExtractError::ReferenceToDeletedPrincipal { entry, .. } => vec![*entry],
                ExtractError::Key(KeyError::ConstraintCycle { entries }) => entries.clone(),
                ExtractError::Key(KeyError::InvalidKeyOffset { .. })
                | ExtractError::Result(_) => Vec::new(),
            },
            Self::Processor(err) => err.entries().to_vec(),
            Self::Relation(err) => err.entries().to_vec(),
            Self::Command(err) => err.entries().to_vec(),
            Self::Transport { entries, .. }
            | Self::Concurrency { entries, .. }
            | Self::NullReturnValue { entries, .. }
            | Self::ReturnValueType { entries, .. }
            | Self::MissingReturnValue { entries, .. } => entries.clone(),
            Self::Propagation(_) | Self::SessionConsumed => Vec::new(),
        }
    }
}
