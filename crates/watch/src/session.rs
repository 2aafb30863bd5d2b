//! Watch session: one list-watch stream feeding one projection.
//!
//! A session owns its [`ProjectionStore`] and (for types with cascade links)
//! its [`CascadeResolver`], and runs as a single task that applies envelopes
//! and lookup results serially. Everything it shows to readers goes through
//! write leases on the subscription's cells, so once a session is canceled
//! nothing it does can reach those cells again.

use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::future::BoxFuture;
use futures::stream::FuturesUnordered;
use futures::{FutureExt, StreamExt};
use metrics::{counter, histogram};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};
use uuid::Uuid;
use vink_api::{ListWatch, PointLookup, SharedTransport, TransportError};
use vink_core::{Envelope, FilterOptions, ResourceType, WireEnvelope};
use vink_store::{Lease, ProjectionCell, ProjectionHandle, ProjectionStore};

use crate::cascade::{targets_of, CascadeResolver, LookupDone, LookupRequest, Resolved};
use crate::error::report as deliver;
use crate::{WatchConfig, WatchError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionState {
    /// Stream requested, not yet open.
    Opening,
    Streaming,
    /// The stream ended on its own.
    Completed,
    Canceled,
    Failed,
}

impl SessionState {
    pub fn is_terminal(self) -> bool { matches!(self, SessionState::Completed | SessionState::Canceled | SessionState::Failed) }

    pub fn can_become(self, next: SessionState) -> bool {
        use SessionState::*;
        matches!(
            (self, next),
            (Opening, Streaming) | (Opening, Canceled) | (Opening, Failed) | (Streaming, Completed) | (Streaming, Canceled) | (Streaming, Failed)
        )
    }
}

/// Move to `next` if the transition is valid; `false` otherwise.
fn advance(state: &watch::Sender<SessionState>, next: SessionState) -> bool {
    state.send_if_modified(|cur| {
        if !cur.can_become(next) { return false; }
        *cur = next;
        true
    })
}

/// Observable cells one subscription publishes into: the primary projection
/// and one derived projection per cascade target.
#[derive(Debug, Clone)]
pub struct SessionCells {
    pub primary: Arc<ProjectionCell>,
    pub derived: Vec<(ResourceType, Arc<ProjectionCell>)>,
}

impl SessionCells {
    pub fn new(resource: ResourceType, cascade: bool) -> Self {
        let derived = if cascade { targets_of(resource).into_iter().map(|t| (t, ProjectionCell::new())).collect() } else { Vec::new() };
        Self { primary: ProjectionCell::new(), derived }
    }

    pub fn projection(&self) -> ProjectionHandle { self.primary.handle() }

    pub fn derived(&self, rt: ResourceType) -> Option<ProjectionHandle> {
        self.derived.iter().find(|(t, _)| *t == rt).map(|(_, c)| c.handle())
    }
}

#[derive(Debug, Clone)]
struct SessionLeases {
    primary: Lease,
    derived: Vec<(ResourceType, Lease)>,
}

impl SessionLeases {
    fn take(cells: &SessionCells) -> Self {
        Self { primary: cells.primary.lease(), derived: cells.derived.iter().map(|(t, c)| (*t, c.lease())).collect() }
    }

    fn derived(&self, rt: ResourceType) -> Option<&Lease> { self.derived.iter().find(|(t, _)| *t == rt).map(|(_, l)| l) }

    fn revoke(&self) {
        self.primary.revoke();
        for (_, l) in &self.derived { l.revoke(); }
    }
}

#[derive(Debug)]
enum Command {
    Prune,
}

/// Handle to a running watch session. Dropping it cancels the session.
pub struct WatchSession {
    id: Uuid,
    resource: ResourceType,
    options: FilterOptions,
    cancel: CancellationToken,
    state: Arc<watch::Sender<SessionState>>,
    leases: SessionLeases,
    commands: mpsc::UnboundedSender<Command>,
    task: Option<JoinHandle<()>>,
}

impl WatchSession {
    /// Take write leases on `cells`, raise their loading flags and start
    /// streaming. Returns immediately; must be called inside a tokio runtime.
    pub fn open(
        transport: SharedTransport,
        resource: ResourceType,
        options: FilterOptions,
        cells: &SessionCells,
        errors: mpsc::Sender<WatchError>,
        cfg: &WatchConfig,
    ) -> Self {
        let id = Uuid::new_v4();
        let cancel = CancellationToken::new();
        let leases = SessionLeases::take(cells);
        leases.primary.set_loading(true);
        for (_, l) in &leases.derived { l.set_loading(true); }
        let (state_tx, _) = watch::channel(SessionState::Opening);
        let state = Arc::new(state_tx);
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let cascade = (!leases.derived.is_empty()).then(|| CascadeResolver::new(resource, id));
        counter!("watch_sessions_opened_total", 1u64, "resource" => resource.label());
        info!(session = %id, resource = %resource, ns = ?options.namespace, cascade = cascade.is_some(), "session: open");
        let task = SessionTask {
            id,
            resource,
            options: options.clone(),
            transport,
            cancel: cancel.clone(),
            state: Arc::clone(&state),
            leases: leases.clone(),
            errors,
            lookup_timeout: cfg.lookup_timeout,
            store: ProjectionStore::new(),
            cascade,
            commands: cmd_rx,
        };
        let handle = tokio::spawn(task.run());
        Self { id, resource, options, cancel, state, leases, commands: cmd_tx, task: Some(handle) }
    }

    pub fn id(&self) -> Uuid { self.id }
    pub fn resource(&self) -> ResourceType { self.resource }
    pub fn options(&self) -> &FilterOptions { &self.options }
    pub fn state(&self) -> SessionState { *self.state.borrow() }
    pub fn subscribe_state(&self) -> watch::Receiver<SessionState> { self.state.subscribe() }
    pub fn is_canceled(&self) -> bool { self.cancel.is_cancelled() }

    /// Stop the session. Idempotent; once this returns nothing from this
    /// session is published or reported.
    pub fn cancel(&self) {
        self.cancel.cancel();
        self.leases.revoke();
        if advance(&self.state, SessionState::Canceled) {
            counter!("watch_sessions_canceled_total", 1u64, "resource" => self.resource.label());
            debug!(session = %self.id, resource = %self.resource, "session: canceled");
        }
    }

    /// Ask the session to drop derived entries no source references.
    pub fn prune_unreferenced(&self) { let _ = self.commands.send(Command::Prune); }
}

impl Drop for WatchSession {
    fn drop(&mut self) {
        self.cancel();
        if let Some(task) = self.task.take() { task.abort(); }
    }
}

type Lookups = FuturesUnordered<BoxFuture<'static, LookupDone>>;

struct SessionTask {
    id: Uuid,
    resource: ResourceType,
    options: FilterOptions,
    transport: SharedTransport,
    cancel: CancellationToken,
    state: Arc<watch::Sender<SessionState>>,
    leases: SessionLeases,
    errors: mpsc::Sender<WatchError>,
    lookup_timeout: Option<Duration>,
    store: ProjectionStore,
    cascade: Option<CascadeResolver>,
    commands: mpsc::UnboundedReceiver<Command>,
}

impl SessionTask {
    async fn run(mut self) {
        let t0 = Instant::now();
        let opened = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => {
                self.finish();
                return;
            }
            r = self.transport.list_watch(self.resource, &self.options, self.cancel.child_token()) => r,
        };
        let mut stream = match opened {
            Ok(s) => s,
            Err(e) => {
                self.fail(&e);
                self.finish();
                return;
            }
        };
        if !advance(&self.state, SessionState::Streaming) {
            self.finish();
            return;
        }
        debug!(session = %self.id, resource = %self.resource, took_ms = %t0.elapsed().as_millis(), "session: stream open");

        let mut lookups: Lookups = FuturesUnordered::new();
        let mut stream_done = false;
        let mut first = true;
        loop {
            if stream_done && lookups.is_empty() { break; }
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break,
                Some(cmd) = self.commands.recv() => match cmd {
                    Command::Prune => {
                        if let Some(out) = self.cascade.as_mut().map(CascadeResolver::prune_unreferenced) {
                            self.after_cascade(out, &mut lookups);
                        }
                    }
                },
                Some(done) = lookups.next(), if !lookups.is_empty() => {
                    if self.cancel.is_cancelled() { break; }
                    histogram!("cascade_lookup_ms", done.took.as_secs_f64() * 1000.0);
                    if let Some(out) = self.cascade.as_mut().map(|c| c.complete(done)) {
                        self.after_cascade(out, &mut lookups);
                    }
                }
                item = stream.next(), if !stream_done => match item {
                    Some(Ok(wire)) => {
                        if self.cancel.is_cancelled() { break; }
                        if first {
                            histogram!("watch_first_event_ms", t0.elapsed().as_secs_f64() * 1000.0);
                            info!(session = %self.id, resource = %self.resource, since_ms = %t0.elapsed().as_millis(), "session: first event");
                            first = false;
                        }
                        self.on_wire(&wire, &mut lookups);
                    }
                    Some(Err(e)) => {
                        stream_done = true;
                        self.fail(&e);
                    }
                    None => {
                        stream_done = true;
                        if advance(&self.state, SessionState::Completed) {
                            info!(session = %self.id, resource = %self.resource, ran_ms = %t0.elapsed().as_millis(), "session: stream completed");
                        }
                        self.leases.primary.set_loading(false);
                    }
                },
            }
        }
        self.finish();
    }

    fn on_wire(&mut self, wire: &WireEnvelope, lookups: &mut Lookups) {
        counter!("watch_envelopes_total", 1u64, "event" => wire.event_type.as_str());
        let decoded = match Envelope::decode(self.resource, wire) {
            Ok(d) => d,
            Err(e) => {
                debug!(session = %self.id, resource = %self.resource, error = %e, "session: envelope ignored");
                self.leases.primary.set_loading(false);
                return;
            }
        };
        for err in &decoded.rejected {
            counter!("watch_items_malformed_total", 1u64, "resource" => self.resource.label());
            warn!(session = %self.id, resource = %self.resource, error = %err, "session: malformed item skipped");
            self.report(WatchError::malformed(self.resource.label(), self.id, err));
        }
        let applied = self.store.apply(&decoded.envelope);
        trace!(
            session = %self.id, event = applied.event.as_str(), reset = applied.reset,
            upserted = applied.upserted.len(), len = self.store.len(), "session: envelope applied"
        );
        self.leases.primary.publish(self.store.freeze());
        self.leases.primary.set_loading(false);
        if let Some(out) = self.cascade.as_mut().map(|c| c.on_primary(&applied)) {
            self.after_cascade(out, lookups);
        }
    }

    fn after_cascade(&self, out: Resolved, lookups: &mut Lookups) {
        let Resolved { changed, follow_ups, errors } = out;
        for e in errors { self.report(e); }
        for req in follow_ups { lookups.push(self.lookup(req)); }
        let Some(cascade) = self.cascade.as_ref() else { return };
        for rt in changed {
            if let (Some(lease), Some(store)) = (self.leases.derived(rt), cascade.derived(rt)) {
                lease.publish(store.freeze());
            }
        }
        for (rt, lease) in &self.leases.derived { lease.set_loading(cascade.pending(*rt) > 0); }
    }

    fn lookup(&self, request: LookupRequest) -> BoxFuture<'static, LookupDone> {
        let transport = Arc::clone(&self.transport);
        let token = self.cancel.child_token();
        let timeout = self.lookup_timeout;
        trace!(session = %self.id, link = request.link, ids = request.ids.len(), seq = request.seq, "session: lookup issued");
        async move {
            let t0 = Instant::now();
            let fut = transport.lookup(request.target, &request.ids, token.clone());
            let result = match timeout {
                Some(d) => match tokio::time::timeout(d, fut).await {
                    Ok(r) => r,
                    Err(_) => Err(TransportError::Unavailable(format!("lookup timed out after {}ms", d.as_millis()))),
                },
                None => fut.await,
            };
            LookupDone { request, result, took: t0.elapsed(), canceled: token.is_cancelled() }
        }
        .boxed()
    }

    /// A `Canceled` error is only an artifact when this session asked for it;
    /// anything else fails the session.
    fn fail(&self, e: &TransportError) {
        if e.is_cancellation_artifact() && self.cancel.is_cancelled() {
            debug!(session = %self.id, resource = %self.resource, "session: stream canceled");
            advance(&self.state, SessionState::Canceled);
            return;
        }
        if !advance(&self.state, SessionState::Failed) { return; }
        counter!("watch_stream_failures_total", 1u64, "resource" => self.resource.label());
        warn!(session = %self.id, resource = %self.resource, error = %e, "session: stream failed");
        self.report(WatchError::transport(self.resource.label(), self.id, e));
        self.leases.primary.set_loading(false);
    }

    /// Clear every loading flag this session still owns and leave the state
    /// terminal.
    fn finish(&self) {
        self.leases.primary.set_loading(false);
        for (_, l) in &self.leases.derived { l.set_loading(false); }
        let last = if self.cancel.is_cancelled() { SessionState::Canceled } else { SessionState::Failed };
        if advance(&self.state, last) {
            debug!(session = %self.id, resource = %self.resource, state = ?last, "session: ended without a terminal event");
        }
    }

    /// Errors from a superseded session are not delivered.
    fn report(&self, err: WatchError) {
        if self.leases.primary.run_if_current(|| deliver(&self.errors, err)).is_none() {
            trace!(session = %self.id, "session: error from revoked session dropped");
        }
    }
}
