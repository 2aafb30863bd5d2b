//! Vink transport boundary.
//!
//! Watch sessions depend on the two traits here, never on a concrete client:
//! [`ListWatch`] opens the streaming list-watch and [`PointLookup`] fetches a
//! batch of identities for the cascade. [`MockTransport`] is the scriptable
//! in-memory implementation used by tests and demos; [`KubeTransport`] talks
//! to the cluster from the current kubeconfig.

#![forbid(unsafe_code)]

use std::sync::Arc;

use futures::stream::BoxStream;
use tokio_util::sync::CancellationToken;
use vink_core::{FilterOptions, NamespaceName, ResourceType, WireEnvelope};

mod cluster;
mod mock;

pub use cluster::KubeTransport;
pub use mock::{MockTransport, StreamController};

/// Errors surfaced by a transport. Cloneable so one failure can be reported
/// to several observers.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    /// The caller canceled the request; never reported to users.
    #[error("canceled")]
    Canceled,
    #[error("unavailable: {0}")]
    Unavailable(String),
    #[error("server error {code}: {message}")]
    Server { code: u16, message: String },
    #[error("decode: {0}")]
    Decode(String),
}

impl TransportError {
    /// Errors that only exist because the request was aborted on purpose.
    pub fn is_cancellation_artifact(&self) -> bool { matches!(self, TransportError::Canceled) }
}

pub type TransportResult<T> = Result<T, TransportError>;

/// Stream of wire envelopes for one list-watch request.
pub type WireStream = BoxStream<'static, TransportResult<WireEnvelope>>;

/// Streaming list-watch endpoint.
#[async_trait::async_trait]
pub trait ListWatch: Send + Sync {
    /// Open a list-watch for `resource` scoped by `options`. The stream ends
    /// (without an error item) once `cancel` fires.
    async fn list_watch(&self, resource: ResourceType, options: &FilterOptions, cancel: CancellationToken) -> TransportResult<WireStream>;
}

/// Batched point lookup used by the cascade.
#[async_trait::async_trait]
pub trait PointLookup: Send + Sync {
    /// Fetch the given identities. Identities that do not exist are simply
    /// absent from the result; items are serialized JSON entities.
    async fn lookup(&self, resource: ResourceType, identities: &[NamespaceName], cancel: CancellationToken) -> TransportResult<Vec<String>>;
}

/// Both halves of the boundary; what a watch session needs.
pub trait Transport: ListWatch + PointLookup {}

impl<T: ListWatch + PointLookup + ?Sized> Transport for T {}

pub type SharedTransport = Arc<dyn Transport>;
