//! Observable projection cell with write leases.
//!
//! Readers load the latest frozen [`Projection`] without locking and wait on a
//! `watch` counter for changes. Writers hold a [`Lease`]; taking a new lease
//! or revoking the current one invalidates every older lease, and the check is
//! made under the same lock that guards publication, so a revoked writer can
//! never publish.

use std::sync::{Arc, Mutex, MutexGuard};

use arc_swap::ArcSwap;
use tokio::sync::watch;
use tracing::trace;
use vink_core::Entity;

use crate::Projection;

#[derive(Debug)]
pub struct ProjectionCell {
    snap: ArcSwap<Projection>,
    published_tx: watch::Sender<u64>,
    loading_tx: watch::Sender<bool>,
    epoch: Mutex<u64>,
}

impl ProjectionCell {
    /// New empty cell; `loading` starts `true`.
    pub fn new() -> Arc<Self> {
        let (published_tx, _) = watch::channel(0u64);
        let (loading_tx, _) = watch::channel(true);
        Arc::new(Self { snap: ArcSwap::from_pointee(Projection::default()), published_tx, loading_tx, epoch: Mutex::new(0) })
    }

    /// Take the write lease, invalidating any previous holder.
    pub fn lease(self: &Arc<Self>) -> Lease {
        let mut guard = self.lock();
        *guard = guard.wrapping_add(1);
        trace!(epoch = *guard, "cell: lease taken");
        Lease { cell: Arc::clone(self), epoch: *guard }
    }

    pub fn handle(self: &Arc<Self>) -> ProjectionHandle { ProjectionHandle { cell: Arc::clone(self) } }

    // A poisoned lock only means a writer panicked mid-publish; the epoch value is still valid.
    fn lock(&self) -> MutexGuard<'_, u64> { self.epoch.lock().unwrap_or_else(|e| e.into_inner()) }
}

/// Exclusive right to publish into a [`ProjectionCell`] until revoked or superseded.
#[derive(Debug, Clone)]
pub struct Lease {
    cell: Arc<ProjectionCell>,
    epoch: u64,
}

impl Lease {
    /// Swap in a new snapshot. Returns `false` (and publishes nothing) once the lease is stale.
    pub fn publish(&self, next: Arc<Projection>) -> bool {
        let guard = self.cell.lock();
        if *guard != self.epoch { return false; }
        self.cell.snap.store(next);
        self.cell.published_tx.send_modify(|n| *n = n.wrapping_add(1));
        true
    }

    /// Set the loading flag. Same staleness rule as [`Lease::publish`].
    pub fn set_loading(&self, loading: bool) -> bool {
        let guard = self.cell.lock();
        if *guard != self.epoch { return false; }
        self.cell.loading_tx.send_if_modified(|cur| {
            if *cur == loading { return false; }
            *cur = loading;
            true
        });
        true
    }

    /// Give the lease up. No-op when a newer lease already superseded this one.
    pub fn revoke(&self) {
        let mut guard = self.cell.lock();
        if *guard == self.epoch {
            *guard = guard.wrapping_add(1);
            trace!(epoch = self.epoch, "cell: lease revoked");
        }
    }

    pub fn is_current(&self) -> bool { *self.cell.lock() == self.epoch }

    /// Run `f` while holding the lease lock, only if the lease is still current.
    /// `f` must not block.
    pub fn run_if_current<R>(&self, f: impl FnOnce() -> R) -> Option<R> {
        let guard = self.cell.lock();
        if *guard != self.epoch { return None; }
        Some(f())
    }
}

/// Read side of a [`ProjectionCell`]. Cheap to clone.
#[derive(Debug, Clone)]
pub struct ProjectionHandle {
    cell: Arc<ProjectionCell>,
}

impl ProjectionHandle {
    pub fn current(&self) -> Arc<Projection> { self.cell.snap.load_full() }
    pub fn get(&self, key: &str) -> Option<Entity> { self.cell.snap.load().get(key).cloned() }
    pub fn len(&self) -> usize { self.cell.snap.load().len() }
    pub fn is_empty(&self) -> bool { self.cell.snap.load().is_empty() }
    pub fn loading(&self) -> bool { *self.cell.loading_tx.borrow() }
    /// Publish counter; changes on every accepted publish.
    pub fn subscribe(&self) -> watch::Receiver<u64> { self.cell.published_tx.subscribe() }
    pub fn subscribe_loading(&self) -> watch::Receiver<bool> { self.cell.loading_tx.subscribe() }

    /// Wait until the published projection satisfies `pred` and return it.
    pub async fn wait_for(&self, mut pred: impl FnMut(&Projection) -> bool) -> Arc<Projection> {
        let mut rx = self.subscribe();
        loop {
            let cur = self.current();
            if pred(&cur) { return cur; }
            if rx.changed().await.is_err() { return self.current(); }
        }
    }

    /// Wait until `loading` reads `false`.
    pub async fn wait_loaded(&self) {
        let mut rx = self.subscribe_loading();
        while *rx.borrow_and_update() {
            if rx.changed().await.is_err() { return; }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ProjectionStore;
    use vink_core::{Envelope, ResourceType};

    fn vm(ns: &str, name: &str) -> Entity {
        Entity::from_value(ResourceType::VirtualMachine, serde_json::json!({"metadata": {"namespace": ns, "name": name}})).unwrap()
    }

    #[test]
    fn superseded_lease_cannot_publish() {
        let cell = ProjectionCell::new();
        let old = cell.lease();
        let new = cell.lease();
        let mut store = ProjectionStore::new();
        store.apply(&Envelope::Added(vec![vm("a", "x")]));
        assert!(!old.publish(store.freeze()));
        assert!(cell.handle().is_empty());
        assert!(new.publish(store.freeze()));
        assert_eq!(cell.handle().len(), 1);
    }

    #[test]
    fn revoke_of_stale_lease_keeps_current() {
        let cell = ProjectionCell::new();
        let old = cell.lease();
        let new = cell.lease();
        old.revoke();
        assert!(new.is_current());
        new.revoke();
        assert!(!new.is_current());
        assert!(!new.set_loading(false));
        assert!(cell.handle().loading());
    }

    #[tokio::test]
    async fn readers_see_publishes() {
        let cell = ProjectionCell::new();
        let lease = cell.lease();
        let h = cell.handle();
        let mut rx = h.subscribe();
        let mut store = ProjectionStore::new();
        store.apply(&Envelope::Added(vec![vm("a", "x"), vm("a", "y")]));
        assert!(lease.publish(store.freeze()));
        rx.changed().await.unwrap();
        assert!(h.get("a/y").is_some());
        assert!(lease.set_loading(false));
        h.wait_loaded().await;
        assert!(!h.loading());
    }
}
