//! Cascade resolver: derived projections joined onto a primary one.
//!
//! A [`CascadeLink`] says how to get from an entity of one type to the key of
//! an entity of another. The resolver keeps one derived [`ProjectionStore`]
//! per target type, counts how many source entities reference each derived
//! key, and turns primary changes into batched [`LookupRequest`]s. Lookup
//! results come back through [`CascadeResolver::complete`], in any order.

use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

use metrics::counter;
use rustc_hash::FxHashMap;
use smallvec::SmallVec;
use tracing::{debug, trace, warn};
use uuid::Uuid;
use vink_api::TransportError;
use vink_core::{Entity, IdentityKey, NamespaceName, ResourceType};
use vink_store::{Applied, ProjectionStore};

use crate::WatchError;

/// Static join rule from `source` entities to `target` identities.
pub struct CascadeLink {
    pub name: &'static str,
    pub source: ResourceType,
    pub target: ResourceType,
    pub extract: fn(&Entity) -> Option<NamespaceName>,
    /// Do not re-fetch keys already present in the derived projection.
    pub skip_resolved: bool,
}

pub static LINKS: [CascadeLink; 3] = [
    CascadeLink {
        name: "vm-instance",
        source: ResourceType::VirtualMachine,
        target: ResourceType::VirtualMachineInstance,
        extract: |e| e.as_virtual_machine().map(|vm| vm.instance()),
        skip_resolved: false,
    },
    CascadeLink {
        name: "vm-boot-volume",
        source: ResourceType::VirtualMachine,
        target: ResourceType::DataVolume,
        extract: |e| e.as_virtual_machine().and_then(|vm| vm.boot_volume()),
        skip_resolved: false,
    },
    CascadeLink {
        name: "instance-node",
        source: ResourceType::VirtualMachineInstance,
        target: ResourceType::Node,
        extract: |e| e.as_instance().and_then(|vmi| vmi.node()),
        skip_resolved: true,
    },
];

/// Links reachable from `root`, breadth-first, so upstream links come first.
pub fn links_from(root: ResourceType) -> Vec<&'static CascadeLink> {
    let mut reached = vec![root];
    let mut out = Vec::new();
    let mut i = 0;
    while i < reached.len() {
        let src = reached[i];
        for link in LINKS.iter().filter(|l| l.source == src) {
            out.push(link);
            if !reached.contains(&link.target) { reached.push(link.target); }
        }
        i += 1;
    }
    out
}

/// Derived types of `root`, upstream first.
pub fn targets_of(root: ResourceType) -> Vec<ResourceType> {
    let mut out = Vec::new();
    for link in links_from(root) {
        if !out.contains(&link.target) { out.push(link.target); }
    }
    out
}

/// One batched point lookup the session must issue.
#[derive(Debug, Clone, PartialEq)]
pub struct LookupRequest {
    pub link: &'static str,
    pub target: ResourceType,
    pub ids: Vec<NamespaceName>,
    pub seq: u64,
}

#[derive(Debug)]
pub struct LookupDone {
    pub request: LookupRequest,
    pub result: Result<Vec<String>, TransportError>,
    pub took: Duration,
    /// The session had canceled the lookup by the time it finished.
    pub canceled: bool,
}

/// What a resolver step changed and what it needs next.
#[derive(Debug, Default)]
pub struct Resolved {
    /// Derived types whose projection changed.
    pub changed: SmallVec<[ResourceType; 3]>,
    pub follow_ups: Vec<LookupRequest>,
    pub errors: Vec<WatchError>,
}

impl Resolved {
    fn touch(&mut self, rt: ResourceType) {
        if !self.changed.contains(&rt) { self.changed.push(rt); }
    }
}

pub struct CascadeResolver {
    root: ResourceType,
    session: Uuid,
    links: Vec<&'static CascadeLink>,
    derived: BTreeMap<ResourceType, ProjectionStore>,
    /// Per link (same index as `links`): source key -> target key.
    refs: Vec<FxHashMap<IdentityKey, IdentityKey>>,
    /// Number of source entities referencing a derived key.
    holders: FxHashMap<(ResourceType, IdentityKey), usize>,
    /// Latest request sequence issued per derived key.
    requested: FxHashMap<(ResourceType, IdentityKey), u64>,
    inflight: FxHashMap<ResourceType, usize>,
    seq: u64,
    /// Derived views have been published since the session opened.
    primed: bool,
}

impl CascadeResolver {
    pub fn new(root: ResourceType, session: Uuid) -> Self {
        let links = links_from(root);
        let derived = targets_of(root).into_iter().map(|t| (t, ProjectionStore::new())).collect();
        let refs = links.iter().map(|_| FxHashMap::default()).collect();
        Self {
            root,
            session,
            links,
            derived,
            refs,
            holders: FxHashMap::default(),
            requested: FxHashMap::default(),
            inflight: FxHashMap::default(),
            seq: 0,
            primed: false,
        }
    }

    /// No links hang off the root type.
    pub fn is_empty(&self) -> bool { self.links.is_empty() }
    pub fn targets(&self) -> impl Iterator<Item = ResourceType> + '_ { self.derived.keys().copied() }
    pub fn derived(&self, rt: ResourceType) -> Option<&ProjectionStore> { self.derived.get(&rt) }
    /// Lookups issued for `rt` and not yet completed.
    pub fn pending(&self, rt: ResourceType) -> usize { self.inflight.get(&rt).copied().unwrap_or(0) }

    pub fn holders(&self, rt: ResourceType, key: &str) -> usize {
        self.holders.get(&(rt, IdentityKey::from(key))).copied().unwrap_or(0)
    }

    /// Feed one envelope applied to the primary projection.
    pub fn on_primary(&mut self, applied: &Applied) -> Resolved {
        let mut out = Resolved::default();
        if applied.reset { self.reset(&mut out); }
        if !self.primed {
            // Whatever the first envelope is, the views stop showing the
            // previous session's entries.
            self.primed = true;
            for rt in self.derived.keys() { out.touch(*rt); }
        }
        match &applied.deleted {
            Some((key, _)) => self.release_source(self.root, key, &mut out),
            None => self.on_upserted(self.root, &applied.upserted, &mut out),
        }
        out
    }

    /// Feed back a finished lookup. Results superseded by a newer request, or
    /// for keys nobody references anymore, are dropped.
    pub fn complete(&mut self, done: LookupDone) -> Resolved {
        let LookupDone { request, result, took, canceled } = done;
        let target = request.target;
        if let Some(n) = self.inflight.get_mut(&target) { *n = n.saturating_sub(1); }
        let mut out = Resolved::default();
        let items = match result {
            Ok(items) => items,
            Err(_) if canceled => {
                debug!(session = %self.session, link = request.link, "cascade: lookup canceled");
                return out;
            }
            Err(e) => {
                counter!("cascade_lookup_failures_total", 1u64, "resource" => target.label());
                warn!(session = %self.session, resource = %target, error = %e, "cascade: lookup failed");
                out.errors.push(WatchError::lookup(target.label(), self.session, &e));
                return out;
            }
        };
        let mut found: BTreeMap<IdentityKey, Entity> = BTreeMap::new();
        for item in &items {
            match Entity::decode(target, item) {
                Ok(e) => { found.insert(e.key().clone(), e); }
                Err(e) => out.errors.push(WatchError::malformed(target.label(), self.session, &e)),
            }
        }
        let mut upserted = Vec::new();
        let mut stale = 0usize;
        for nn in &request.ids {
            let slot = (target, nn.key());
            if self.requested.get(&slot) != Some(&request.seq) {
                stale += 1;
                continue;
            }
            self.requested.remove(&slot);
            if !self.holders.contains_key(&slot) { continue; }
            let key = slot.1;
            match found.remove(&key) {
                Some(e) => {
                    if let Some(store) = self.derived.get_mut(&target) { store.upsert(e.clone()); }
                    upserted.push(e);
                    out.touch(target);
                }
                None => {
                    // The joined object no longer exists.
                    let removed = self.derived.get_mut(&target).and_then(|s| s.remove(key.as_str()));
                    if removed.is_some() { out.touch(target); }
                    self.release_source(target, &key, &mut out);
                }
            }
        }
        trace!(
            session = %self.session, link = request.link, requested = request.ids.len(), applied = upserted.len(),
            stale, took_ms = %took.as_millis(), "cascade: lookup applied"
        );
        if !upserted.is_empty() { self.on_upserted(target, &upserted, &mut out); }
        out
    }

    /// Drop derived entries no source references anymore (left behind when a
    /// source's reference moved on `Added`/`Modified`).
    pub fn prune_unreferenced(&mut self) -> Resolved {
        let mut out = Resolved::default();
        for t in targets_of(self.root) {
            let holders = &self.holders;
            let dropped = match self.derived.get_mut(&t) {
                Some(store) => store.retain(|k, _| holders.contains_key(&(t, k.clone()))),
                None => Vec::new(),
            };
            for key in dropped {
                out.touch(t);
                self.release_source(t, &key, &mut out);
            }
        }
        out
    }

    fn reset(&mut self, out: &mut Resolved) {
        for (rt, store) in self.derived.iter_mut() {
            store.reset();
            out.touch(*rt);
        }
        for r in self.refs.iter_mut() { r.clear(); }
        self.holders.clear();
        self.requested.clear();
    }

    fn on_upserted(&mut self, source: ResourceType, entities: &[Entity], out: &mut Resolved) {
        let links: Vec<(usize, &'static CascadeLink)> =
            self.links.iter().copied().enumerate().filter(|(_, l)| l.source == source).collect();
        for (idx, link) in links {
            let mut want: BTreeSet<NamespaceName> = BTreeSet::new();
            for e in entities {
                let next = (link.extract)(e).filter(|nn| !nn.name.is_empty());
                let next_key = next.as_ref().map(NamespaceName::key);
                let prev = self.refs[idx].get(e.key()).cloned();
                if prev != next_key {
                    if let Some(p) = prev {
                        self.refs[idx].remove(e.key());
                        self.release(link.target, &p, false, out);
                    }
                    if let Some(k) = &next_key {
                        self.refs[idx].insert(e.key().clone(), k.clone());
                        *self.holders.entry((link.target, k.clone())).or_insert(0) += 1;
                    }
                }
                let Some(nn) = next else { continue };
                let resolved = self.derived.get(&link.target).is_some_and(|s| s.contains(nn.key().as_str()));
                if link.skip_resolved && resolved { continue; }
                want.insert(nn);
            }
            if !want.is_empty() { out.follow_ups.push(self.request(link, want)); }
        }
    }

    /// A source entity is gone: release everything it referenced.
    fn release_source(&mut self, source: ResourceType, key: &IdentityKey, out: &mut Resolved) {
        let links: Vec<(usize, &'static CascadeLink)> =
            self.links.iter().copied().enumerate().filter(|(_, l)| l.source == source).collect();
        for (idx, link) in links {
            if let Some(target_key) = self.refs[idx].remove(key) {
                self.release(link.target, &target_key, true, out);
            }
        }
    }

    /// Drop one reference to a derived key. At zero the key stops being
    /// tracked; with `prune` its entry is removed too, cascading downstream.
    fn release(&mut self, target: ResourceType, key: &IdentityKey, prune: bool, out: &mut Resolved) {
        let slot = (target, key.clone());
        let Some(count) = self.holders.get_mut(&slot) else { return };
        *count = count.saturating_sub(1);
        if *count > 0 { return; }
        self.holders.remove(&slot);
        self.requested.remove(&slot);
        if !prune { return; }
        if self.derived.get_mut(&target).and_then(|s| s.remove(key.as_str())).is_some() {
            out.touch(target);
        }
        self.release_source(target, key, out);
    }

    fn request(&mut self, link: &'static CascadeLink, want: BTreeSet<NamespaceName>) -> LookupRequest {
        self.seq += 1;
        let ids: Vec<NamespaceName> = want.into_iter().collect();
        for nn in &ids { self.requested.insert((link.target, nn.key()), self.seq); }
        *self.inflight.entry(link.target).or_insert(0) += 1;
        counter!("cascade_lookups_total", 1u64, "resource" => link.target.label());
        LookupRequest { link: link.name, target: link.target, ids, seq: self.seq }
    }
}

/// A VirtualMachine with the objects the cascade joined onto it.
#[derive(Debug, Clone)]
pub struct JoinedVm {
    pub vm: Entity,
    pub instance: Option<Entity>,
    pub node: Option<Entity>,
    pub boot_volume: Option<Entity>,
}

impl JoinedVm {
    /// Join `vm` against derived projections through `lookup`. `None` when
    /// `vm` is not a VirtualMachine.
    pub fn join(vm: Entity, lookup: impl Fn(ResourceType, &IdentityKey) -> Option<Entity>) -> Option<Self> {
        let shape = vm.as_virtual_machine()?;
        let instance = lookup(ResourceType::VirtualMachineInstance, &shape.instance().key());
        let node = instance
            .as_ref()
            .and_then(|i| i.as_instance())
            .and_then(|i| i.node())
            .and_then(|nn| lookup(ResourceType::Node, &nn.key()));
        let boot_volume = shape.boot_volume().and_then(|nn| lookup(ResourceType::DataVolume, &nn.key()));
        Some(Self { vm, instance, node, boot_volume })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use vink_core::Envelope;

    fn vm(ns: &str, name: &str, dv: Option<&str>) -> Entity {
        let mut raw = json!({"metadata": {"namespace": ns, "name": name}});
        if let Some(dv) = dv {
            raw["spec"] = json!({"template": {"spec": {
                "domain": {"devices": {"disks": [{"name": "root", "bootOrder": 1}]}},
                "volumes": [{"name": "root", "dataVolume": {"name": dv}}],
            }}});
        }
        Entity::from_value(ResourceType::VirtualMachine, raw).unwrap()
    }

    fn vmi_json(ns: &str, name: &str, node: &str) -> String {
        json!({"metadata": {"namespace": ns, "name": name}, "status": {"nodeName": node}}).to_string()
    }

    fn done(req: &LookupRequest, items: Vec<String>) -> LookupDone {
        LookupDone { request: req.clone(), result: Ok(items), took: Duration::from_millis(1), canceled: false }
    }

    fn primary(store: &mut ProjectionStore, env: Envelope) -> Applied { store.apply(&env) }

    #[test]
    fn link_table_is_breadth_first() {
        let names: Vec<_> = links_from(ResourceType::VirtualMachine).iter().map(|l| l.name).collect();
        assert_eq!(names, vec!["vm-instance", "vm-boot-volume", "instance-node"]);
        assert_eq!(
            targets_of(ResourceType::VirtualMachine),
            vec![ResourceType::VirtualMachineInstance, ResourceType::DataVolume, ResourceType::Node]
        );
        assert!(links_from(ResourceType::Node).is_empty());
    }

    #[test]
    fn chain_resolves_and_delete_releases_everything() {
        let mut r = CascadeResolver::new(ResourceType::VirtualMachine, Uuid::new_v4());
        let mut store = ProjectionStore::new();
        let out = r.on_primary(&primary(&mut store, Envelope::Added(vec![vm("ns1", "vm1", Some("dv1"))])));
        assert_eq!(out.follow_ups.len(), 2);
        let vmi_req = out.follow_ups.iter().find(|q| q.target == ResourceType::VirtualMachineInstance).unwrap().clone();
        let dv_req = out.follow_ups.iter().find(|q| q.target == ResourceType::DataVolume).unwrap().clone();
        assert_eq!(dv_req.ids, vec![NamespaceName::new("ns1", "dv1")]);

        let out = r.complete(done(&vmi_req, vec![vmi_json("ns1", "vm1", "node-a")]));
        assert_eq!(out.follow_ups.len(), 1);
        let node_req = out.follow_ups[0].clone();
        assert_eq!(node_req.ids, vec![NamespaceName::cluster("node-a")]);
        r.complete(done(&node_req, vec![json!({"metadata": {"name": "node-a"}}).to_string()]));
        r.complete(done(&dv_req, vec![json!({"metadata": {"namespace": "ns1", "name": "dv1"}}).to_string()]));
        assert!(r.derived(ResourceType::Node).unwrap().contains("node-a"));
        assert_eq!(r.pending(ResourceType::Node), 0);

        let out = r.on_primary(&primary(&mut store, Envelope::Deleted(IdentityKey::from("ns1/vm1"))));
        for t in targets_of(ResourceType::VirtualMachine) {
            assert!(r.derived(t).unwrap().is_empty(), "{} not released", t);
            assert!(out.changed.contains(&t));
        }
    }

    #[test]
    fn shared_node_survives_until_last_holder_goes() {
        let mut r = CascadeResolver::new(ResourceType::VirtualMachine, Uuid::new_v4());
        let mut store = ProjectionStore::new();
        let out = r.on_primary(&primary(&mut store, Envelope::Added(vec![vm("ns1", "a", None), vm("ns1", "b", None)])));
        let vmi_req = out.follow_ups.iter().find(|q| q.target == ResourceType::VirtualMachineInstance).unwrap().clone();
        assert_eq!(vmi_req.ids.len(), 2);
        let out = r.complete(done(&vmi_req, vec![vmi_json("ns1", "a", "n1"), vmi_json("ns1", "b", "n1")]));
        // Both instances sit on n1: one batched request with one key.
        assert_eq!(out.follow_ups[0].ids, vec![NamespaceName::cluster("n1")]);
        r.complete(done(&out.follow_ups[0], vec![json!({"metadata": {"name": "n1"}}).to_string()]));
        assert_eq!(r.holders(ResourceType::Node, "n1"), 2);

        r.on_primary(&primary(&mut store, Envelope::Deleted(IdentityKey::from("ns1/a"))));
        assert!(r.derived(ResourceType::Node).unwrap().contains("n1"));
        r.on_primary(&primary(&mut store, Envelope::Deleted(IdentityKey::from("ns1/b"))));
        assert!(r.derived(ResourceType::Node).unwrap().is_empty());
    }

    #[test]
    fn stale_results_and_missing_keys() {
        let mut r = CascadeResolver::new(ResourceType::VirtualMachine, Uuid::new_v4());
        let mut store = ProjectionStore::new();
        let first = r.on_primary(&primary(&mut store, Envelope::Added(vec![vm("ns1", "a", None)]))).follow_ups[0].clone();
        let second = r.on_primary(&primary(&mut store, Envelope::Modified(vec![vm("ns1", "a", None)]))).follow_ups[0].clone();
        assert!(second.seq > first.seq);

        // Newer answer lands first; the older one must not overwrite it.
        r.complete(done(&second, vec![vmi_json("ns1", "a", "new")]));
        r.complete(done(&first, vec![vmi_json("ns1", "a", "old")]));
        let vmi = r.derived(ResourceType::VirtualMachineInstance).unwrap().get("ns1/a").unwrap().clone();
        assert_eq!(vmi.as_instance().unwrap().status.node_name.as_deref(), Some("new"));

        // Instance vanished: requested key absent from the response is removed.
        let third = r.on_primary(&primary(&mut store, Envelope::Modified(vec![vm("ns1", "a", None)]))).follow_ups[0].clone();
        let out = r.complete(done(&third, vec![]));
        assert!(r.derived(ResourceType::VirtualMachineInstance).unwrap().is_empty());
        assert!(out.changed.contains(&ResourceType::VirtualMachineInstance));
    }

    #[test]
    fn resolved_nodes_are_not_refetched() {
        let mut r = CascadeResolver::new(ResourceType::VirtualMachine, Uuid::new_v4());
        let mut store = ProjectionStore::new();
        let q = r.on_primary(&primary(&mut store, Envelope::Added(vec![vm("ns1", "a", None)]))).follow_ups[0].clone();
        let node_q = r.complete(done(&q, vec![vmi_json("ns1", "a", "n1")])).follow_ups[0].clone();
        r.complete(done(&node_q, vec![json!({"metadata": {"name": "n1"}}).to_string()]));

        let q = r.on_primary(&primary(&mut store, Envelope::Modified(vec![vm("ns1", "a", None)]))).follow_ups[0].clone();
        let out = r.complete(done(&q, vec![vmi_json("ns1", "a", "n1")]));
        assert!(out.follow_ups.is_empty());
    }

    #[test]
    fn moved_reference_is_kept_until_pruned() {
        let mut r = CascadeResolver::new(ResourceType::VirtualMachine, Uuid::new_v4());
        let mut store = ProjectionStore::new();
        let q = r.on_primary(&primary(&mut store, Envelope::Added(vec![vm("ns1", "a", Some("dv1"))])));
        let dv_q = q.follow_ups.iter().find(|q| q.target == ResourceType::DataVolume).unwrap().clone();
        r.complete(done(&dv_q, vec![json!({"metadata": {"namespace": "ns1", "name": "dv1"}}).to_string()]));

        r.on_primary(&primary(&mut store, Envelope::Modified(vec![vm("ns1", "a", Some("dv2"))])));
        let dvs = r.derived(ResourceType::DataVolume).unwrap();
        assert!(dvs.contains("ns1/dv1"));
        assert_eq!(r.holders(ResourceType::DataVolume, "ns1/dv1"), 0);

        let out = r.prune_unreferenced();
        assert!(!r.derived(ResourceType::DataVolume).unwrap().contains("ns1/dv1"));
        assert!(out.changed.contains(&ResourceType::DataVolume));
    }

    #[test]
    fn lookup_errors_carry_target_label() {
        let mut r = CascadeResolver::new(ResourceType::VirtualMachine, Uuid::new_v4());
        let mut store = ProjectionStore::new();
        let q = r.on_primary(&primary(&mut store, Envelope::Added(vec![vm("ns1", "a", Some("dv1"))])));
        let dv_q = q.follow_ups.iter().find(|q| q.target == ResourceType::DataVolume).unwrap().clone();
        let out = r.complete(LookupDone {
            request: dv_q.clone(),
            result: Err(TransportError::Unavailable("boom".into())),
            took: Duration::ZERO,
            canceled: false,
        });
        assert_eq!(out.errors.len(), 1);
        assert_eq!(out.errors[0].resource, "DataVolume");

        let out = r.complete(LookupDone { request: dv_q, result: Err(TransportError::Canceled), took: Duration::ZERO, canceled: true });
        assert!(out.errors.is_empty());
    }

    #[test]
    fn unrequested_cancel_of_a_lookup_is_reported() {
        let mut r = CascadeResolver::new(ResourceType::VirtualMachine, Uuid::new_v4());
        let mut store = ProjectionStore::new();
        let q = r.on_primary(&primary(&mut store, Envelope::Added(vec![vm("ns1", "a", Some("dv1"))])));
        let dv_q = q.follow_ups.iter().find(|q| q.target == ResourceType::DataVolume).unwrap().clone();
        let out = r.complete(LookupDone { request: dv_q, result: Err(TransportError::Canceled), took: Duration::ZERO, canceled: false });
        assert_eq!(out.errors.len(), 1);
        assert_eq!(out.errors[0].kind, crate::ErrorKind::Lookup);
        assert_eq!(r.pending(ResourceType::DataVolume), 0);
    }

    #[test]
    fn first_envelope_of_any_type_publishes_every_view() {
        let mut r = CascadeResolver::new(ResourceType::VirtualMachine, Uuid::new_v4());
        let mut store = ProjectionStore::new();
        let out = r.on_primary(&primary(&mut store, Envelope::Modified(vec![vm("ns1", "a", None)])));
        for t in targets_of(ResourceType::VirtualMachine) {
            assert!(out.changed.contains(&t), "{} not published", t);
        }
        let out = r.on_primary(&primary(&mut store, Envelope::Modified(vec![vm("ns1", "a", None)])));
        assert!(out.changed.is_empty());
    }

    #[test]
    fn join_reads_all_derived_objects() {
        let mut r = CascadeResolver::new(ResourceType::VirtualMachine, Uuid::new_v4());
        let mut store = ProjectionStore::new();
        let v = vm("ns1", "a", Some("dv1"));
        let q = r.on_primary(&primary(&mut store, Envelope::Added(vec![v.clone()])));
        for req in q.follow_ups {
            let items = match req.target {
                ResourceType::VirtualMachineInstance => vec![vmi_json("ns1", "a", "n1")],
                _ => vec![json!({"metadata": {"namespace": "ns1", "name": "dv1"}}).to_string()],
            };
            for f in r.complete(done(&req, items)).follow_ups {
                r.complete(done(&f, vec![json!({"metadata": {"name": "n1"}}).to_string()]));
            }
        }
        let joined = JoinedVm::join(v, |rt, key| r.derived(rt).and_then(|s| s.get(key.as_str()).cloned())).unwrap();
        assert_eq!(joined.instance.unwrap().name(), "a");
        assert_eq!(joined.node.unwrap().name(), "n1");
        assert_eq!(joined.boot_volume.unwrap().name(), "dv1");
    }
}
