//! Vink store: the per-session projection map and the observable cell that
//! publishes frozen snapshots of it to readers.

#![forbid(unsafe_code)]

mod cell;
mod projection;

use std::sync::Arc;

use vink_core::Envelope;

pub use cell::{Lease, ProjectionCell, ProjectionHandle};
pub use projection::{Applied, Projection, ProjectionStore};

/// Apply envelopes in order to a fresh store and freeze the result.
pub fn replay<'a>(envelopes: impl IntoIterator<Item = &'a Envelope>) -> Arc<Projection> {
    let mut store = ProjectionStore::new();
    for env in envelopes { store.apply(env); }
    store.freeze()
}
