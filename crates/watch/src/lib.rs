//! Vink watch engine.
//!
//! [`subscribe`] opens a [`Subscription`]: a watch session streaming one
//! resource type into an observable projection, plus derived projections
//! joined on by the cascade resolver (VirtualMachine -> instance -> node,
//! VirtualMachine -> boot DataVolume).

#![forbid(unsafe_code)]

pub mod cascade;
mod config;
mod error;
mod registry;
mod session;

pub use cascade::{CascadeLink, CascadeResolver, JoinedVm, LINKS};
pub use config::WatchConfig;
pub use error::{ErrorKind, ErrorQueue, WatchError};
pub use registry::Subscription;
pub use session::{SessionCells, SessionState, WatchSession};
pub use vink_store::{Projection, ProjectionHandle};

use vink_api::SharedTransport;
use vink_core::{FilterOptions, ResourceType};

/// Open a subscription and start streaming. Must be called inside a tokio runtime.
pub fn subscribe(transport: SharedTransport, resource: ResourceType, options: FilterOptions, cfg: WatchConfig) -> Subscription {
    Subscription::open(transport, resource, options, cfg)
}
