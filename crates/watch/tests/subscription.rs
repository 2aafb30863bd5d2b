#![forbid(unsafe_code)]

use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::StreamExt;
use serde_json::json;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use vink_api::{ListWatch, MockTransport, PointLookup, StreamController, TransportError, TransportResult, WireStream};
use vink_core::{FilterOptions, NamespaceName, ResourceType, WireEnvelope};
use vink_watch::{subscribe, ErrorKind, Projection, ProjectionHandle, SessionState, Subscription, WatchConfig};

const WAIT: Duration = Duration::from_secs(2);

fn vm(ns: &str, name: &str, status: &str) -> serde_json::Value {
    json!({ "metadata": { "namespace": ns, "name": name }, "status": { "printableStatus": status } })
}

fn keys(p: &Projection) -> Vec<String> { p.keys().map(|k| k.to_string()).collect() }

fn status(p: &Projection, key: &str) -> Option<String> {
    p.get(key).and_then(|e| e.as_virtual_machine()).and_then(|vm| vm.status.printable_status.clone())
}

fn cfg() -> WatchConfig { WatchConfig::default().without_cascade() }

async fn next_stream(mock: &MockTransport) -> StreamController {
    tokio::time::timeout(WAIT, mock.next_stream()).await.expect("no stream opened").expect("transport gone")
}

async fn wait_for(h: &ProjectionHandle, pred: impl FnMut(&Projection) -> bool) -> Arc<Projection> {
    tokio::time::timeout(WAIT, h.wait_for(pred)).await.expect("projection never matched")
}

async fn wait_state(sub: &Subscription, want: SessionState) {
    let mut rx = sub.subscribe_state().expect("no session");
    tokio::time::timeout(WAIT, async {
        while *rx.borrow_and_update() != want {
            if rx.changed().await.is_err() { break; }
        }
    })
    .await
    .expect("state never reached");
    assert_eq!(sub.session_state(), Some(want));
}

#[tokio::test]
async fn virtual_machine_scenario() {
    let mock = MockTransport::shared();
    let sub = subscribe(mock.clone(), ResourceType::VirtualMachine, FilterOptions::in_namespace("ns1"), cfg());
    assert!(sub.loading());
    let ctl = next_stream(&mock).await;
    assert_eq!(ctl.options().namespace.as_deref(), Some("ns1"));

    ctl.added([vm("ns1", "vm1", "Running"), vm("ns1", "vm2", "Stopped")]);
    let p = wait_for(&sub.projection(), |p| p.len() == 2).await;
    assert_eq!(keys(&p), vec!["ns1/vm1", "ns1/vm2"]);
    sub.projection().wait_loaded().await;
    assert!(!sub.loading());

    ctl.deleted("ns1", "vm1");
    ctl.modified([vm("ns1", "vm2", "Starting")]);
    let p = wait_for(&sub.projection(), |p| status(p, "ns1/vm2").as_deref() == Some("Starting")).await;
    assert_eq!(keys(&p), vec!["ns1/vm2"]);
}

#[tokio::test]
async fn loading_clears_on_first_event_of_any_type() {
    let mock = MockTransport::shared();
    let sub = subscribe(mock.clone(), ResourceType::VirtualMachine, FilterOptions::all(), cfg());
    let ctl = next_stream(&mock).await;
    assert!(sub.loading());
    ctl.deleted("ns1", "ghost");
    tokio::time::timeout(WAIT, sub.projection().wait_loaded()).await.unwrap();
    assert!(sub.projection().is_empty());
}

#[tokio::test]
async fn reconcile_with_equal_options_keeps_session() {
    let mock = MockTransport::shared();
    let opts = FilterOptions::in_namespace("ns1");
    let mut sub = subscribe(mock.clone(), ResourceType::VirtualMachine, opts.clone(), cfg());
    let ctl = next_stream(&mock).await;
    let id = sub.session_id();

    assert!(!sub.reconcile(opts));
    assert_eq!(sub.session_id(), id);
    assert!(!ctl.is_canceled());
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(mock.try_next_stream().is_none());
    assert_eq!(mock.opened(), 1);
    assert_eq!(sub.sessions_opened(), 1);
}

#[tokio::test]
async fn reconcile_replaces_session_and_resets_view() {
    let mock = MockTransport::shared();
    let mut sub = subscribe(mock.clone(), ResourceType::VirtualMachine, FilterOptions::in_namespace("ns1"), cfg());
    let old = next_stream(&mock).await;
    old.added([vm("ns1", "a", "Running")]);
    wait_for(&sub.projection(), |p| p.contains("ns1/a")).await;

    assert!(sub.reconcile(FilterOptions::in_namespace("ns2")));
    assert!(sub.loading());
    assert!(old.is_canceled());
    // Late traffic from the replaced session.
    old.modified([vm("ns1", "late", "Running")]);

    let new = next_stream(&mock).await;
    assert_eq!(new.options().namespace.as_deref(), Some("ns2"));
    new.added([vm("ns2", "b", "Running")]);
    let p = wait_for(&sub.projection(), |p| p.contains("ns2/b")).await;
    assert_eq!(keys(&p), vec!["ns2/b"]);
    assert!(!sub.loading());
    assert_eq!(sub.sessions_opened(), 2);
}

#[tokio::test]
async fn transport_failure_is_reported_and_view_kept() {
    let mock = MockTransport::shared();
    let mut sub = subscribe(mock.clone(), ResourceType::VirtualMachine, FilterOptions::all(), cfg());
    let ctl = next_stream(&mock).await;
    ctl.added([vm("ns1", "a", "Running")]);
    wait_for(&sub.projection(), |p| p.contains("ns1/a")).await;

    ctl.fail(TransportError::Server { code: 500, message: "etcd timeout".into() });
    let err = tokio::time::timeout(WAIT, sub.errors().recv()).await.unwrap().unwrap();
    assert_eq!(err.resource, "VirtualMachine");
    assert_eq!(err.kind, ErrorKind::Transport);
    assert_eq!(Some(err.session), sub.session_id());
    wait_state(&sub, SessionState::Failed).await;
    assert!(!sub.loading());
    assert!(sub.projection().get("ns1/a").is_some());
}

#[tokio::test]
async fn open_failure_is_reported() {
    let mock = MockTransport::shared();
    mock.fail_next_open(TransportError::Unavailable("gateway down".into()));
    let mut sub = subscribe(mock.clone(), ResourceType::Node, FilterOptions::all(), cfg());
    let err = tokio::time::timeout(WAIT, sub.errors().recv()).await.unwrap().unwrap();
    assert_eq!(err.resource, "Node");
    assert_eq!(err.kind, ErrorKind::Transport);
    wait_state(&sub, SessionState::Failed).await;
    assert!(!sub.loading());
}

#[tokio::test]
async fn unrequested_cancel_from_the_stream_fails_the_session() {
    let mock = MockTransport::shared();
    let mut sub = subscribe(mock.clone(), ResourceType::VirtualMachine, FilterOptions::all(), cfg());
    let ctl = next_stream(&mock).await;
    ctl.added([vm("ns1", "a", "Running")]);
    wait_for(&sub.projection(), |p| p.contains("ns1/a")).await;

    ctl.fail(TransportError::Canceled);
    let err = tokio::time::timeout(WAIT, sub.errors().recv()).await.unwrap().unwrap();
    assert_eq!(err.kind, ErrorKind::Transport);
    assert_eq!(err.resource, "VirtualMachine");
    wait_state(&sub, SessionState::Failed).await;
    assert!(!sub.loading());
    assert!(sub.projection().get("ns1/a").is_some());
}

#[tokio::test]
async fn unrequested_cancel_on_open_fails_the_session() {
    let mock = MockTransport::shared();
    mock.fail_next_open(TransportError::Canceled);
    let mut sub = subscribe(mock.clone(), ResourceType::VirtualMachine, FilterOptions::all(), cfg());
    let err = tokio::time::timeout(WAIT, sub.errors().recv()).await.unwrap().unwrap();
    assert_eq!(err.kind, ErrorKind::Transport);
    wait_state(&sub, SessionState::Failed).await;
    assert!(!sub.loading());
}

#[tokio::test]
async fn requested_cancel_is_silent_and_terminal() {
    let mock = MockTransport::shared();
    let mut sub = subscribe(mock.clone(), ResourceType::VirtualMachine, FilterOptions::all(), cfg());
    let ctl = next_stream(&mock).await;
    let mut state = sub.subscribe_state().unwrap();
    sub.unsubscribe();
    // What a transport emits when it notices the cancel.
    ctl.fail(TransportError::Canceled);
    tokio::time::timeout(WAIT, async {
        while !state.borrow_and_update().is_terminal() {
            if state.changed().await.is_err() { break; }
        }
    })
    .await
    .unwrap();
    assert_eq!(*state.borrow(), SessionState::Canceled);
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(sub.errors().drain().is_empty());
}

#[tokio::test]
async fn malformed_items_are_skipped_and_reported() {
    let mock = MockTransport::shared();
    let mut sub = subscribe(mock.clone(), ResourceType::VirtualMachine, FilterOptions::all(), cfg());
    let ctl = next_stream(&mock).await;
    ctl.send(WireEnvelope::added(vec!["{not json".into(), vm("ns1", "ok", "Running").to_string(), json!({"metadata": {}}).to_string()]));
    let p = wait_for(&sub.projection(), |p| p.contains("ns1/ok")).await;
    assert_eq!(p.len(), 1);
    let errs = sub.errors().drain();
    assert_eq!(errs.len(), 2);
    assert!(errs.iter().all(|e| e.kind == ErrorKind::Malformed && e.resource == "VirtualMachine"));
    assert_eq!(sub.session_state(), Some(SessionState::Streaming));
}

#[tokio::test]
async fn stream_end_completes_session() {
    let mock = MockTransport::shared();
    let sub = subscribe(mock.clone(), ResourceType::Namespace, FilterOptions::all(), cfg());
    let ctl = next_stream(&mock).await;
    ctl.added([json!({"metadata": {"name": "default"}})]);
    wait_for(&sub.projection(), |p| p.contains("default")).await;
    ctl.close();
    wait_state(&sub, SessionState::Completed).await;
    assert!(sub.projection().current().contains("default"));
}

#[tokio::test]
async fn unsubscribe_is_idempotent_and_safe_before_first_event() {
    let mock = MockTransport::shared();
    let mut sub = subscribe(mock.clone(), ResourceType::VirtualMachine, FilterOptions::all(), cfg());
    let state = sub.subscribe_state().unwrap();
    sub.unsubscribe();
    sub.unsubscribe();
    assert!(!sub.is_active());
    assert_eq!(*state.borrow(), SessionState::Canceled);

    // If the stream got opened anyway, it is already canceled and inert.
    if let Some(ctl) = mock.try_next_stream() {
        assert!(ctl.is_canceled());
        ctl.added([vm("ns1", "a", "Running")]);
    }
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(sub.projection().is_empty());
}

/// Transport that keeps yielding after cancellation, to exercise the write
/// lease rather than stream shutdown.
#[derive(Default)]
struct Stubborn {
    streams: Mutex<Vec<mpsc::UnboundedSender<WireEnvelope>>>,
}

impl Stubborn {
    async fn stream(&self, n: usize) -> mpsc::UnboundedSender<WireEnvelope> {
        tokio::time::timeout(WAIT, async {
            loop {
                if let Some(tx) = self.streams.lock().unwrap().get(n).cloned() { return tx; }
                tokio::time::sleep(Duration::from_millis(2)).await;
            }
        })
        .await
        .expect("stream never opened")
    }
}

#[async_trait::async_trait]
impl ListWatch for Stubborn {
    async fn list_watch(&self, _resource: ResourceType, _options: &FilterOptions, _cancel: CancellationToken) -> TransportResult<WireStream> {
        let (tx, mut rx) = mpsc::unbounded_channel();
        self.streams.lock().unwrap().push(tx);
        let s = async_stream::stream! {
            while let Some(env) = rx.recv().await { yield Ok::<_, TransportError>(env); }
        };
        Ok(s.boxed())
    }
}

#[async_trait::async_trait]
impl PointLookup for Stubborn {
    async fn lookup(&self, _resource: ResourceType, _ids: &[NamespaceName], _cancel: CancellationToken) -> TransportResult<Vec<String>> {
        Ok(Vec::new())
    }
}

fn added(items: &[serde_json::Value]) -> WireEnvelope { WireEnvelope::added(items.iter().map(|v| v.to_string()).collect()) }

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn canceled_session_never_touches_the_view() {
    let transport = Arc::new(Stubborn::default());
    let mut sub = subscribe(transport.clone(), ResourceType::VirtualMachine, FilterOptions::in_namespace("ns1"), cfg());
    let old = transport.stream(0).await;
    old.send(added(&[vm("ns1", "a", "Running")])).unwrap();
    wait_for(&sub.projection(), |p| p.contains("ns1/a")).await;

    sub.reconcile(FilterOptions::in_namespace("ns2"));
    let new = transport.stream(1).await;
    // Burst from the replaced session racing the new one.
    for i in 0..50 {
        let _ = old.send(WireEnvelope::modified(vec![vm("ns1", &format!("late{}", i), "Running").to_string()]));
    }
    new.send(added(&[vm("ns2", "b", "Running")])).unwrap();
    wait_for(&sub.projection(), |p| p.contains("ns2/b")).await;
    tokio::time::sleep(Duration::from_millis(30)).await;
    assert_eq!(keys(&sub.projection().current()), vec!["ns2/b"]);

    sub.unsubscribe();
    let before = sub.projection().current();
    let _ = new.send(WireEnvelope::deleted(NamespaceName::new("ns2", "b")));
    tokio::time::sleep(Duration::from_millis(30)).await;
    assert_eq!(keys(&sub.projection().current()), keys(&before));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn first_snapshot_of_a_replaced_session_is_ignored() {
    let transport = Arc::new(Stubborn::default());
    let mut sub = subscribe(transport.clone(), ResourceType::VirtualMachine, FilterOptions::in_namespace("ns1"), cfg());
    let old = transport.stream(0).await;

    sub.reconcile(FilterOptions::in_namespace("ns2"));
    let new = transport.stream(1).await;
    // The replaced session's initial snapshot arrives only now.
    let _ = old.send(added(&[vm("ns1", "a", "Running")]));
    tokio::time::sleep(Duration::from_millis(30)).await;
    assert!(sub.projection().is_empty());
    assert!(sub.loading());

    new.send(added(&[vm("ns2", "b", "Running")])).unwrap();
    wait_for(&sub.projection(), |p| p.contains("ns2/b")).await;
    let _ = old.send(added(&[vm("ns1", "c", "Running")]));
    tokio::time::sleep(Duration::from_millis(30)).await;
    assert_eq!(keys(&sub.projection().current()), vec!["ns2/b"]);
    assert!(!sub.loading());
}
