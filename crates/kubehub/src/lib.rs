//! Vink kubehub: discovery, list-watch and point lookups against the cluster,
//! translated into the gateway's wire envelopes.

#![forbid(unsafe_code)]

use std::sync::Mutex;
use std::time::Instant;

use anyhow::{anyhow, Context, Result};
use futures::{future::try_join_all, TryStreamExt};
use kube::{
    api::Api,
    core::{ApiResource, DynamicObject, GroupVersionKind},
    discovery::{Discovery, Scope},
    runtime::watcher::{self, Event},
    Client,
};
use once_cell::sync::Lazy;
use rustc_hash::{FxHashMap, FxHashSet};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use vink_core::{Entity, FieldOp, FilterOptions, NamespaceName, ResourceType, WireEnvelope};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiscoveredResource {
    pub group: String,
    pub version: String,
    pub kind: String,
    pub namespaced: bool,
}

impl DiscoveredResource {
    pub fn gvk_key(&self) -> String {
        if self.group.is_empty() {
            format!("{}/{}", self.version, self.kind)
        } else {
            format!("{}/{}/{}", self.group, self.version, self.kind)
        }
    }

    /// The watched type this resource serves, if any.
    pub fn resource_type(&self) -> Option<ResourceType> {
        ResourceType::ALL.into_iter().find(|rt| rt.gvk_key() == self.gvk_key())
    }
}

/// Discover served resources (incl. CRDs) using kube Discovery.
pub async fn discover(client: Client) -> Result<Vec<DiscoveredResource>> {
    let discovery = Discovery::new(client).run().await?;
    let mut out = Vec::new();
    for group in discovery.groups() {
        for (ar, caps) in group.recommended_resources() {
            let namespaced = matches!(caps.scope, Scope::Namespaced);
            out.push(DiscoveredResource {
                group: ar.group.clone(),
                version: ar.version.clone(),
                kind: ar.kind.clone(),
                namespaced,
            });
        }
    }
    // Stable-ish order
    out.sort_by(|a, b| a.group.cmp(&b.group).then(a.version.cmp(&b.version)).then(a.kind.cmp(&b.kind)));
    Ok(out)
}

static API_RESOURCES: Lazy<Mutex<FxHashMap<ResourceType, (ApiResource, bool)>>> = Lazy::new(|| Mutex::new(FxHashMap::default()));

/// Resolve the ApiResource (plural, scope) for a watched type. Discovery runs
/// once per type and process.
pub async fn api_resource(client: Client, resource: ResourceType) -> Result<(ApiResource, bool)> {
    if let Some(hit) = API_RESOURCES.lock().unwrap_or_else(|e| e.into_inner()).get(&resource).cloned() {
        return Ok(hit);
    }
    let t0 = Instant::now();
    let gvk = GroupVersionKind { group: resource.group().into(), version: resource.version().into(), kind: resource.kind().into() };
    let discovery = Discovery::new(client).run().await.context("running discovery")?;
    for group in discovery.groups() {
        for (ar, caps) in group.recommended_resources() {
            if ar.group == gvk.group && ar.version == gvk.version && ar.kind == gvk.kind {
                let namespaced = matches!(caps.scope, Scope::Namespaced);
                debug!(resource = %resource, plural = %ar.plural, took_ms = %t0.elapsed().as_millis(), "kubehub: api resource resolved");
                let hit = (ar.clone(), namespaced);
                API_RESOURCES.lock().unwrap_or_else(|e| e.into_inner()).insert(resource, hit.clone());
                return Ok(hit);
            }
        }
    }
    Err(anyhow!("GVK not served: {}", resource.gvk_key()))
}

fn strip_managed_fields(v: &mut serde_json::Value) {
    if let Some(meta) = v.get_mut("metadata") {
        if let Some(obj) = meta.as_object_mut() {
            obj.remove("managedFields");
        }
    }
}

fn to_value(obj: &DynamicObject) -> Result<serde_json::Value> {
    let mut raw = serde_json::to_value(obj).context("serializing DynamicObject")?;
    strip_managed_fields(&mut raw);
    Ok(raw)
}

fn identity_of(obj: &DynamicObject) -> NamespaceName {
    NamespaceName::new(obj.metadata.namespace.clone().unwrap_or_default(), obj.metadata.name.clone().unwrap_or_default())
}

/// Field selector the API server can evaluate: only a conjunction of
/// `metadata.name` / `metadata.namespace` equalities. Everything else is
/// filtered client-side.
fn server_fields(opts: &FilterOptions) -> Option<String> {
    let group = &opts.field_selector_group;
    if group.is_empty() || (group.field_selectors.len() > 1 && group.operator != vink_core::Combinator::And) { return None; }
    let mut parts = Vec::new();
    for sel in &group.field_selectors {
        let pushable = sel.operator == FieldOp::Equal
            && sel.values.len() == 1
            && matches!(sel.field_path.as_str(), "metadata.name" | "metadata.namespace");
        if !pushable { return None; }
        parts.push(format!("{}={}", sel.field_path, sel.values[0]));
    }
    Some(parts.join(","))
}

fn api_for(client: Client, ar: &ApiResource, namespaced: bool, namespace: Option<&str>) -> Api<DynamicObject> {
    match namespace.filter(|ns| namespaced && !ns.is_empty()) {
        Some(ns) => Api::namespaced_with(client, ns, ar),
        None => Api::all_with(client, ar),
    }
}

/// Tracks which objects of the watch currently satisfy the filter.
struct Matcher<'a> {
    resource: ResourceType,
    opts: &'a FilterOptions,
    matched: FxHashSet<NamespaceName>,
}

impl<'a> Matcher<'a> {
    fn accepts(&self, raw: &serde_json::Value) -> bool {
        if self.opts.is_unfiltered() { return true; }
        match Entity::from_value(self.resource, raw.clone()) {
            Ok(e) => self.opts.matches(&e),
            // Let undecodable objects through; the session reports them.
            Err(_) => true,
        }
    }
}

/// List+watch a resource type and send wire envelopes into `tx`.
///
/// The initial list (and every relist) becomes an `ADDED` envelope; updates
/// become `MODIFIED`, or `DELETED` when an object stops matching the filter.
/// Returns when the receiver is dropped or the watch stream ends.
pub async fn start_watcher(client: Client, resource: ResourceType, opts: &FilterOptions, tx: mpsc::Sender<WireEnvelope>) -> Result<()> {
    let (ar, namespaced) = api_resource(client.clone(), resource).await?;
    let api = api_for(client, &ar, namespaced, opts.namespace.as_deref());

    let mut cfg = watcher::Config::default();
    let labels = opts.label_selector.to_string();
    if !labels.is_empty() { cfg = cfg.labels(&labels); }
    if let Some(fields) = server_fields(opts) { cfg = cfg.fields(&fields); }

    let stream = watcher::watcher(api, cfg);
    futures::pin_mut!(stream);
    info!(resource = %resource, ns = ?opts.namespace, labels = %labels, "watcher started");
    let mut m = Matcher { resource, opts, matched: FxHashSet::default() };
    while let Some(ev) = stream.try_next().await? {
        let envelopes = match ev {
            Event::Applied(o) => {
                let raw = to_value(&o)?;
                let nn = identity_of(&o);
                if m.accepts(&raw) {
                    m.matched.insert(nn);
                    vec![WireEnvelope::modified(vec![raw.to_string()])]
                } else if m.matched.remove(&nn) {
                    vec![WireEnvelope::deleted(nn)]
                } else {
                    Vec::new()
                }
            }
            Event::Deleted(o) => {
                let nn = identity_of(&o);
                if m.matched.remove(&nn) { vec![WireEnvelope::deleted(nn)] } else { Vec::new() }
            }
            Event::Restarted(list) => {
                debug!(resource = %resource, count = list.len(), "watch restart");
                let mut items = Vec::with_capacity(list.len());
                let mut now = FxHashSet::default();
                for o in list.iter() {
                    let raw = to_value(o)?;
                    if m.accepts(&raw) {
                        now.insert(identity_of(o));
                        items.push(raw.to_string());
                    }
                }
                // Objects that vanished while the watch was down.
                let mut out: Vec<WireEnvelope> =
                    m.matched.difference(&now).cloned().map(WireEnvelope::deleted).collect();
                m.matched = now;
                out.insert(0, WireEnvelope::added(items));
                out
            }
        };
        for env in envelopes {
            if tx.send(env).await.is_err() {
                debug!(resource = %resource, "watch receiver dropped");
                return Ok(());
            }
        }
    }
    warn!(resource = %resource, "watcher stream ended");
    Ok(())
}

/// Fetch the given identities; absent objects are skipped.
pub async fn get_many(client: Client, resource: ResourceType, ids: &[NamespaceName]) -> Result<Vec<String>> {
    let t0 = Instant::now();
    let (ar, namespaced) = api_resource(client.clone(), resource).await?;
    let fetches = ids.iter().map(|nn| {
        let api = api_for(client.clone(), &ar, namespaced, Some(nn.namespace.as_str()));
        let name = nn.name.clone();
        async move { api.get_opt(&name).await.with_context(|| format!("get {} {}", resource, name)) }
    });
    let found = try_join_all(fetches).await?;
    let mut out = Vec::with_capacity(found.len());
    for obj in found.into_iter().flatten() {
        out.push(to_value(&obj)?.to_string());
    }
    debug!(resource = %resource, requested = ids.len(), found = out.len(), took_ms = %t0.elapsed().as_millis(), "kubehub: lookup done");
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use vink_core::{Combinator, FieldSelector};

    #[test]
    fn pushes_down_identity_equalities_only() {
        let single = FilterOptions::single(&NamespaceName::new("ns1", "vm1"));
        assert_eq!(server_fields(&single).as_deref(), Some("metadata.namespace=ns1,metadata.name=vm1"));

        let or = single.clone().with_combinator(Combinator::Or);
        assert_eq!(server_fields(&or), None);

        let prefix = FilterOptions::all().with_field("metadata.name^=web".parse::<FieldSelector>().unwrap());
        assert_eq!(server_fields(&prefix), None);
        assert_eq!(server_fields(&FilterOptions::all()), None);
    }

    #[test]
    fn strips_managed_fields() {
        let mut v = serde_json::json!({"metadata": {"name": "a", "managedFields": [{"manager": "kubectl"}]}});
        strip_managed_fields(&mut v);
        assert!(v["metadata"].get("managedFields").is_none());
    }

    #[test]
    fn discovered_maps_to_watched_type() {
        let d = DiscoveredResource { group: "cdi.kubevirt.io".into(), version: "v1beta1".into(), kind: "DataVolume".into(), namespaced: true };
        assert_eq!(d.resource_type(), Some(ResourceType::DataVolume));
        let pods = DiscoveredResource { group: String::new(), version: "v1".into(), kind: "Pod".into(), namespaced: true };
        assert_eq!(pods.resource_type(), None);
    }
}
