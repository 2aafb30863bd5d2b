//! Scriptable in-memory transport.
//!
//! Every `list_watch` call hands a [`StreamController`] to the test through
//! [`MockTransport::next_stream`]; the test then pushes envelopes or errors
//! into that stream. Point lookups are answered from objects registered with
//! [`MockTransport::put`].

use std::collections::{BTreeMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use futures::StreamExt;
use rustc_hash::FxHashMap;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use vink_core::{Entity, FilterOptions, NamespaceName, ResourceType, WireEnvelope};

use crate::{ListWatch, PointLookup, TransportError, TransportResult, WireStream};

/// Test-side end of one opened list-watch stream.
#[derive(Debug, Clone)]
pub struct StreamController {
    resource: ResourceType,
    options: FilterOptions,
    tx: mpsc::UnboundedSender<TransportResult<WireEnvelope>>,
    cancel: CancellationToken,
}

impl StreamController {
    pub fn resource(&self) -> ResourceType { self.resource }
    pub fn options(&self) -> &FilterOptions { &self.options }

    /// Push one envelope; `false` once the consumer dropped the stream.
    pub fn send(&self, env: WireEnvelope) -> bool { self.tx.send(Ok(env)).is_ok() }

    /// Push an `ADDED` envelope of the objects the stream's options select,
    /// the way a server applies the request's filter. Use [`send`](Self::send)
    /// to push items unfiltered.
    pub fn added(&self, items: impl IntoIterator<Item = serde_json::Value>) -> bool {
        self.send(WireEnvelope::added(self.selected(items)))
    }

    pub fn modified(&self, items: impl IntoIterator<Item = serde_json::Value>) -> bool {
        self.send(WireEnvelope::modified(self.selected(items)))
    }

    /// Objects that fail to decode pass through so the consumer sees them.
    fn selected(&self, items: impl IntoIterator<Item = serde_json::Value>) -> Vec<String> {
        items
            .into_iter()
            .filter(|v| match Entity::from_value(self.resource, v.clone()) {
                Ok(e) => self.options.matches(&e),
                Err(_) => true,
            })
            .map(|v| v.to_string())
            .collect()
    }

    pub fn deleted(&self, namespace: &str, name: &str) -> bool { self.send(WireEnvelope::deleted(NamespaceName::new(namespace, name))) }

    pub fn fail(&self, err: TransportError) -> bool { self.tx.send(Err(err)).is_ok() }

    /// End the stream naturally (once every clone is dropped).
    pub fn close(self) {}

    pub fn is_canceled(&self) -> bool { self.cancel.is_cancelled() }

    pub async fn canceled(&self) { self.cancel.cancelled().await }
}

#[derive(Default)]
struct MockState {
    objects: FxHashMap<ResourceType, BTreeMap<NamespaceName, serde_json::Value>>,
    lookup_failures: FxHashMap<ResourceType, TransportError>,
    lookup_delays: VecDeque<Duration>,
    lookups: Vec<(ResourceType, Vec<NamespaceName>)>,
    open_failure: Option<TransportError>,
    opened: usize,
}

pub struct MockTransport {
    state: Mutex<MockState>,
    opened_tx: mpsc::UnboundedSender<StreamController>,
    opened_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<StreamController>>,
}

impl Default for MockTransport {
    fn default() -> Self { Self::new() }
}

impl MockTransport {
    pub fn new() -> Self {
        let (opened_tx, opened_rx) = mpsc::unbounded_channel();
        Self { state: Mutex::new(MockState::default()), opened_tx, opened_rx: tokio::sync::Mutex::new(opened_rx) }
    }

    pub fn shared() -> Arc<Self> { Arc::new(Self::new()) }

    fn state(&self) -> MutexGuard<'_, MockState> { self.state.lock().unwrap_or_else(|e| e.into_inner()) }

    /// Wait for the next `list_watch` call and take control of its stream.
    pub async fn next_stream(&self) -> Option<StreamController> { self.opened_rx.lock().await.recv().await }

    /// A stream opened since the last `next_stream`, without waiting.
    pub fn try_next_stream(&self) -> Option<StreamController> {
        self.opened_rx.try_lock().ok().and_then(|mut rx| rx.try_recv().ok())
    }

    /// Number of `list_watch` calls so far.
    pub fn opened(&self) -> usize { self.state().opened }

    /// Register an object for point lookups (keyed by its metadata).
    pub fn put(&self, resource: ResourceType, obj: serde_json::Value) {
        let text = |p: &str| obj.pointer(p).and_then(|v| v.as_str()).unwrap_or_default().to_string();
        let nn = NamespaceName::new(text("/metadata/namespace"), text("/metadata/name"));
        self.state().objects.entry(resource).or_default().insert(nn, obj);
    }

    pub fn remove(&self, resource: ResourceType, nn: &NamespaceName) {
        if let Some(m) = self.state().objects.get_mut(&resource) { m.remove(nn); }
    }

    /// Make every lookup of `resource` fail until cleared.
    pub fn fail_lookups(&self, resource: ResourceType, err: TransportError) { self.state().lookup_failures.insert(resource, err); }

    pub fn clear_lookup_failure(&self, resource: ResourceType) { self.state().lookup_failures.remove(&resource); }

    /// Delay the next lookup call by `d` (queued; one entry per call).
    pub fn delay_next_lookup(&self, d: Duration) { self.state().lookup_delays.push_back(d); }

    /// Make the next `list_watch` call fail before returning a stream.
    pub fn fail_next_open(&self, err: TransportError) { self.state().open_failure = Some(err); }

    /// Every lookup request received, in call order.
    pub fn lookups(&self) -> Vec<(ResourceType, Vec<NamespaceName>)> { self.state().lookups.clone() }

    pub fn lookups_of(&self, resource: ResourceType) -> Vec<Vec<NamespaceName>> {
        self.state().lookups.iter().filter(|(rt, _)| *rt == resource).map(|(_, ids)| ids.clone()).collect()
    }
}

#[async_trait::async_trait]
impl ListWatch for MockTransport {
    async fn list_watch(&self, resource: ResourceType, options: &FilterOptions, cancel: CancellationToken) -> TransportResult<WireStream> {
        let open_failure = self.state().open_failure.take();
        if let Some(err) = open_failure { return Err(err); }
        self.state().opened += 1;
        let (tx, rx) = mpsc::unbounded_channel();
        let ctl = StreamController { resource, options: options.clone(), tx, cancel: cancel.clone() };
        let _ = self.opened_tx.send(ctl);
        debug!(resource = %resource, "mock: stream opened");
        let stream = futures::stream::unfold((rx, cancel), |(mut rx, cancel)| async move {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => None,
                item = rx.recv() => item.map(|i| (i, (rx, cancel))),
            }
        });
        Ok(stream.boxed())
    }
}

#[async_trait::async_trait]
impl PointLookup for MockTransport {
    async fn lookup(&self, resource: ResourceType, identities: &[NamespaceName], cancel: CancellationToken) -> TransportResult<Vec<String>> {
        // Answer from the objects as they are when the request arrives.
        let (delay, outcome) = {
            let mut st = self.state();
            st.lookups.push((resource, identities.to_vec()));
            let outcome = match st.lookup_failures.get(&resource) {
                Some(err) => Err(err.clone()),
                None => {
                    let objs = st.objects.get(&resource);
                    Ok(identities.iter().filter_map(|nn| objs.and_then(|m| m.get(nn)).map(|v| v.to_string())).collect::<Vec<_>>())
                }
            };
            (st.lookup_delays.pop_front(), outcome)
        };
        if let Some(d) = delay {
            tokio::select! {
                _ = cancel.cancelled() => return Err(TransportError::Canceled),
                _ = tokio::time::sleep(d) => {}
            }
        }
        if cancel.is_cancelled() { return Err(TransportError::Canceled); }
        outcome
    }
}
