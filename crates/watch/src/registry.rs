//! Per-view subscriptions.
//!
//! A view owns one [`Subscription`]. Reconciling it with new filter options
//! replaces its session only when the options actually changed; the cells it
//! exposes stay the same across replacements, so readers keep their handles.

use std::time::Instant;

use tokio::sync::{mpsc, watch};
use tracing::{debug, info};
use uuid::Uuid;
use vink_api::SharedTransport;
use vink_core::{FilterOptions, IdentityKey, ResourceType};
use vink_store::ProjectionHandle;

use crate::cascade::JoinedVm;
use crate::error::ErrorQueue;
use crate::session::{SessionCells, SessionState, WatchSession};
use crate::{WatchConfig, WatchError};

pub struct Subscription {
    transport: SharedTransport,
    resource: ResourceType,
    options: FilterOptions,
    cfg: WatchConfig,
    cells: SessionCells,
    errors_tx: mpsc::Sender<WatchError>,
    errors: ErrorQueue,
    session: Option<WatchSession>,
    sessions_opened: u64,
}

impl Subscription {
    pub(crate) fn open(transport: SharedTransport, resource: ResourceType, options: FilterOptions, cfg: WatchConfig) -> Self {
        let cells = SessionCells::new(resource, cfg.cascade);
        let (errors_tx, errors) = ErrorQueue::channel(cfg.error_queue_cap);
        let mut sub = Self { transport, resource, options, cfg, cells, errors_tx, errors, session: None, sessions_opened: 0 };
        sub.start();
        sub
    }

    fn start(&mut self) {
        let session = WatchSession::open(
            self.transport.clone(),
            self.resource,
            self.options.clone(),
            &self.cells,
            self.errors_tx.clone(),
            &self.cfg,
        );
        self.sessions_opened += 1;
        self.session = Some(session);
    }

    pub fn resource(&self) -> ResourceType { self.resource }
    pub fn options(&self) -> &FilterOptions { &self.options }

    /// Observable primary projection.
    pub fn projection(&self) -> ProjectionHandle { self.cells.projection() }

    pub fn loading(&self) -> bool { self.cells.projection().loading() }
    pub fn subscribe_loading(&self) -> watch::Receiver<bool> { self.cells.projection().subscribe_loading() }

    /// Errors reported by this subscription's sessions, in report order.
    pub fn errors(&mut self) -> &mut ErrorQueue { &mut self.errors }

    /// Derived projection for a cascade target, if this type cascades into it.
    pub fn cascade(&self, target: ResourceType) -> Option<ProjectionHandle> { self.cells.derived(target) }

    pub fn cascade_targets(&self) -> impl Iterator<Item = ResourceType> + '_ { self.cells.derived.iter().map(|(t, _)| *t) }

    /// VirtualMachine `key` joined with its instance, node and boot volume as
    /// currently projected.
    pub fn join_vm(&self, key: &str) -> Option<JoinedVm> {
        let vm = self.projection().get(key)?;
        JoinedVm::join(vm, |rt, k: &IdentityKey| self.cascade(rt).and_then(|h| h.get(k.as_str())))
    }

    pub fn session_id(&self) -> Option<Uuid> { self.session.as_ref().map(WatchSession::id) }
    pub fn session_state(&self) -> Option<SessionState> { self.session.as_ref().map(WatchSession::state) }
    pub fn subscribe_state(&self) -> Option<watch::Receiver<SessionState>> { self.session.as_ref().map(WatchSession::subscribe_state) }

    /// Sessions opened over the subscription's lifetime.
    pub fn sessions_opened(&self) -> u64 { self.sessions_opened }

    pub fn is_active(&self) -> bool { self.session.is_some() }

    /// Point the subscription at `options`. Deep-equal options keep the
    /// current session; anything else cancels it and opens a new one.
    /// Returns whether a new session was opened.
    pub fn reconcile(&mut self, options: FilterOptions) -> bool {
        if self.session.is_some() && options == self.options {
            debug!(resource = %self.resource, "subscription: options unchanged");
            return false;
        }
        let t0 = Instant::now();
        let changed = self.options.diff(&options);
        let old = self.session.take().map(|s| {
            s.cancel();
            s.id()
        });
        self.options = options;
        self.start();
        info!(
            resource = %self.resource, changed = ?changed.as_slice(), old = ?old, new = ?self.session_id(),
            took_ms = %t0.elapsed().as_millis(), "subscription: session replaced"
        );
        true
    }

    /// Ask the running session to prune derived entries nobody references.
    pub fn prune_unreferenced(&self) {
        if let Some(s) = &self.session { s.prune_unreferenced(); }
    }

    /// Cancel the current session. Idempotent.
    pub fn unsubscribe(&mut self) {
        if let Some(s) = self.session.take() {
            s.cancel();
            debug!(resource = %self.resource, session = %s.id(), "subscription: unsubscribed");
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) { self.unsubscribe(); }
}
