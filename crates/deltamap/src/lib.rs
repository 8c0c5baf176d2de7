//! deltamap — change propagation and update-command compilation for
//! mapped object graphs.
//!
//! This is the public meta-crate. Downstream users depend on **deltamap**
//! only; it re-exports the stable surface of `deltamap-core`.

pub use deltamap_core as core;

pub use deltamap_core::{
    changeset, command, error, extract, key, metadata, obs, processor, propagator, relation,
    result, translator, value,
};

///
/// CONSTANTS
///

pub const VERSION: &str = env!("CARGO_PKG_VERSION");

//
// Prelude
//

pub mod prelude {
    pub use deltamap_core::prelude::*;
}
