//! Decoded entities.
//!
//! Wire items arrive as JSON text. They are decoded exactly once, at the
//! transport boundary, into an [`Entity`]: a typed shape for the resource
//! types the cascade reads, plus the raw document for selectors and output.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::{IdentityKey, NamespaceName, ResourceType};

#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("{resource}: invalid JSON: {source}")]
    Json { resource: &'static str, #[source] source: serde_json::Error },
    #[error("{resource}: unexpected shape: {source}")]
    Shape { resource: &'static str, #[source] source: serde_json::Error },
    #[error("{resource}: object missing metadata.name")]
    MissingName { resource: &'static str },
    #[error("{resource}: DELETED envelope carries no identity")]
    MissingDeleted { resource: &'static str },
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ObjectMeta {
    pub name: String,
    pub namespace: Option<String>,
    pub uid: Option<String>,
    pub resource_version: Option<String>,
    pub creation_timestamp: Option<String>,
    pub labels: BTreeMap<String, String>,
    pub annotations: BTreeMap<String, String>,
}

impl ObjectMeta {
    pub fn namespace_name(&self) -> NamespaceName {
        NamespaceName::new(self.namespace.clone().unwrap_or_default(), self.name.clone())
    }

    /// Unix seconds, 0 when absent or unparsable.
    pub fn creation_ts(&self) -> i64 {
        self.creation_timestamp
            .as_deref()
            .and_then(|s| chrono::DateTime::parse_from_rfc3339(s).ok())
            .map(|dt| dt.timestamp())
            .unwrap_or(0)
    }
}

// ---- VirtualMachine ----

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct VirtualMachine {
    pub metadata: ObjectMeta,
    pub spec: VirtualMachineSpec,
    pub status: VirtualMachineStatus,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct VirtualMachineSpec {
    pub run_strategy: Option<String>,
    pub template: VmTemplate,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct VmTemplate {
    pub spec: VmTemplateSpec,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct VmTemplateSpec {
    pub domain: Domain,
    pub volumes: Vec<Volume>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct Domain {
    pub devices: Devices,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct Devices {
    pub disks: Vec<Disk>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Disk {
    pub name: String,
    pub boot_order: Option<u32>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Volume {
    pub name: String,
    pub data_volume: Option<VolumeRef>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct VolumeRef {
    pub name: String,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct VirtualMachineStatus {
    pub printable_status: Option<String>,
    pub ready: Option<bool>,
}

impl VirtualMachine {
    /// The disk the VM boots from: `bootOrder == 1`, else the first declared disk.
    pub fn boot_disk(&self) -> Option<&Disk> {
        let disks = &self.spec.template.spec.domain.devices.disks;
        disks.iter().find(|d| d.boot_order == Some(1)).or_else(|| disks.first())
    }

    /// DataVolume backing the boot disk, in the VM's namespace.
    pub fn boot_volume(&self) -> Option<NamespaceName> {
        let disk = self.boot_disk()?;
        let vol = self.spec.template.spec.volumes.iter().find(|v| v.name == disk.name)?;
        let dv = vol.data_volume.as_ref()?;
        if dv.name.is_empty() { return None; }
        Some(NamespaceName::new(self.metadata.namespace.clone().unwrap_or_default(), dv.name.clone()))
    }

    /// The instance of a VM shares its namespace and name.
    pub fn instance(&self) -> NamespaceName { self.metadata.namespace_name() }
}

// ---- VirtualMachineInstance ----

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct VirtualMachineInstance {
    pub metadata: ObjectMeta,
    pub status: VmiStatus,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct VmiStatus {
    pub node_name: Option<String>,
    pub phase: Option<String>,
    pub interfaces: Vec<VmiInterface>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct VmiInterface {
    pub name: Option<String>,
    pub ip_address: Option<String>,
}

impl VirtualMachineInstance {
    /// Hosting node, once scheduled.
    pub fn node(&self) -> Option<NamespaceName> {
        self.status.node_name.as_deref().filter(|n| !n.is_empty()).map(NamespaceName::cluster)
    }
}

// ---- DataVolume ----

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct DataVolume {
    pub metadata: ObjectMeta,
    pub status: DataVolumeStatus,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct DataVolumeStatus {
    pub phase: Option<String>,
    pub progress: Option<String>,
}

// ---- Node ----

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct Node {
    pub metadata: ObjectMeta,
    pub status: NodeStatus,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct NodeStatus {
    pub addresses: Vec<NodeAddress>,
    pub capacity: BTreeMap<String, String>,
    pub allocatable: BTreeMap<String, String>,
    pub conditions: Vec<NodeCondition>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct NodeAddress {
    pub address: String,
    #[serde(rename = "type")]
    pub kind: String,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct NodeCondition {
    #[serde(rename = "type")]
    pub kind: String,
    pub status: String,
}

impl Node {
    pub fn internal_ip(&self) -> Option<&str> {
        self.status.addresses.iter().find(|a| a.kind == "InternalIP").map(|a| a.address.as_str())
    }

    pub fn is_ready(&self) -> bool {
        self.status.conditions.iter().any(|c| c.kind == "Ready" && c.status == "True")
    }
}

// ---- Entity ----

/// Statically declared shape, tagged by resource type.
#[derive(Debug, Clone, PartialEq)]
pub enum Shape {
    VirtualMachine(VirtualMachine),
    VirtualMachineInstance(VirtualMachineInstance),
    DataVolume(DataVolume),
    Node(Node),
    /// Types the engine never looks inside.
    Generic { resource: ResourceType, metadata: ObjectMeta },
}

impl Shape {
    pub fn metadata(&self) -> &ObjectMeta {
        match self {
            Shape::VirtualMachine(v) => &v.metadata,
            Shape::VirtualMachineInstance(v) => &v.metadata,
            Shape::DataVolume(v) => &v.metadata,
            Shape::Node(v) => &v.metadata,
            Shape::Generic { metadata, .. } => metadata,
        }
    }

    pub fn resource_type(&self) -> ResourceType {
        match self {
            Shape::VirtualMachine(_) => ResourceType::VirtualMachine,
            Shape::VirtualMachineInstance(_) => ResourceType::VirtualMachineInstance,
            Shape::DataVolume(_) => ResourceType::DataVolume,
            Shape::Node(_) => ResourceType::Node,
            Shape::Generic { resource, .. } => *resource,
        }
    }
}

#[derive(Debug)]
struct Repr {
    shape: Shape,
    key: IdentityKey,
    raw: serde_json::Value,
}

/// Immutable entity snapshot. Clones share the decoded representation.
#[derive(Debug, Clone)]
pub struct Entity(Arc<Repr>);

impl Entity {
    /// Decode one serialized wire item.
    pub fn decode(resource: ResourceType, text: &str) -> Result<Self, DecodeError> {
        let raw: serde_json::Value =
            serde_json::from_str(text).map_err(|source| DecodeError::Json { resource: resource.label(), source })?;
        Self::from_value(resource, raw)
    }

    pub fn from_value(resource: ResourceType, raw: serde_json::Value) -> Result<Self, DecodeError> {
        let label = resource.label();
        let shape_err = |source| DecodeError::Shape { resource: label, source };
        let shape = match resource {
            ResourceType::VirtualMachine => Shape::VirtualMachine(serde_json::from_value(raw.clone()).map_err(shape_err)?),
            ResourceType::VirtualMachineInstance => {
                Shape::VirtualMachineInstance(serde_json::from_value(raw.clone()).map_err(shape_err)?)
            }
            ResourceType::DataVolume => Shape::DataVolume(serde_json::from_value(raw.clone()).map_err(shape_err)?),
            ResourceType::Node => Shape::Node(serde_json::from_value(raw.clone()).map_err(shape_err)?),
            other => {
                let metadata = raw
                    .get("metadata")
                    .cloned()
                    .map(serde_json::from_value::<ObjectMeta>)
                    .transpose()
                    .map_err(shape_err)?
                    .unwrap_or_default();
                Shape::Generic { resource: other, metadata }
            }
        };
        if shape.metadata().name.is_empty() {
            return Err(DecodeError::MissingName { resource: label });
        }
        let key = shape.metadata().namespace_name().key();
        Ok(Entity(Arc::new(Repr { shape, key, raw })))
    }

    pub fn resource_type(&self) -> ResourceType { self.0.shape.resource_type() }
    pub fn shape(&self) -> &Shape { &self.0.shape }
    pub fn metadata(&self) -> &ObjectMeta { self.0.shape.metadata() }
    pub fn raw(&self) -> &serde_json::Value { &self.0.raw }
    pub fn key(&self) -> &IdentityKey { &self.0.key }
    pub fn identity(&self) -> NamespaceName { self.metadata().namespace_name() }
    pub fn name(&self) -> &str { &self.metadata().name }

    pub fn as_virtual_machine(&self) -> Option<&VirtualMachine> {
        match &self.0.shape { Shape::VirtualMachine(v) => Some(v), _ => None }
    }

    pub fn as_instance(&self) -> Option<&VirtualMachineInstance> {
        match &self.0.shape { Shape::VirtualMachineInstance(v) => Some(v), _ => None }
    }

    pub fn as_data_volume(&self) -> Option<&DataVolume> {
        match &self.0.shape { Shape::DataVolume(v) => Some(v), _ => None }
    }

    pub fn as_node(&self) -> Option<&Node> {
        match &self.0.shape { Shape::Node(v) => Some(v), _ => None }
    }

    /// Serialize back to the wire form.
    pub fn to_wire(&self) -> String { self.0.raw.to_string() }
}

impl PartialEq for Entity {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
            || (self.resource_type() == other.resource_type() && self.0.raw == other.0.raw)
    }
}

impl Serialize for Entity {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.0.raw.serialize(serializer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn vm(disks: serde_json::Value, volumes: serde_json::Value) -> Entity {
        let raw = json!({
            "metadata": { "name": "vm1", "namespace": "ns1" },
            "spec": { "template": { "spec": { "domain": { "devices": { "disks": disks } }, "volumes": volumes } } },
        });
        Entity::from_value(ResourceType::VirtualMachine, raw).unwrap()
    }

    #[test]
    fn boot_volume_prefers_boot_order_one() {
        let e = vm(
            json!([{ "name": "data" }, { "name": "root", "bootOrder": 1 }]),
            json!([
                { "name": "data", "dataVolume": { "name": "dv-data" } },
                { "name": "root", "dataVolume": { "name": "dv-root" } },
            ]),
        );
        let vm = e.as_virtual_machine().unwrap();
        assert_eq!(vm.boot_volume(), Some(NamespaceName::new("ns1", "dv-root")));
    }

    #[test]
    fn boot_volume_falls_back_to_first_disk() {
        let e = vm(
            json!([{ "name": "root" }, { "name": "data" }]),
            json!([{ "name": "root", "dataVolume": { "name": "dv-root" } }]),
        );
        assert_eq!(e.as_virtual_machine().unwrap().boot_volume(), Some(NamespaceName::new("ns1", "dv-root")));
    }

    #[test]
    fn boot_volume_absent_for_container_disk() {
        let e = vm(json!([{ "name": "root" }]), json!([{ "name": "root", "containerDisk": { "image": "x" } }]));
        assert_eq!(e.as_virtual_machine().unwrap().boot_volume(), None);
    }

    #[test]
    fn decode_rejects_nameless_and_bad_json() {
        assert!(matches!(
            Entity::decode(ResourceType::Node, r#"{"metadata":{}}"#),
            Err(DecodeError::MissingName { resource: "Node" })
        ));
        assert!(matches!(Entity::decode(ResourceType::Node, "{not json"), Err(DecodeError::Json { .. })));
    }

    #[test]
    fn generic_types_keep_metadata_and_raw() {
        let e = Entity::decode(ResourceType::Subnet, r#"{"metadata":{"name":"ovn-default"},"spec":{"cidrBlock":"10.16.0.0/16"}}"#)
            .unwrap();
        assert_eq!(e.key().as_str(), "ovn-default");
        assert_eq!(e.resource_type(), ResourceType::Subnet);
        assert_eq!(e.raw()["spec"]["cidrBlock"], "10.16.0.0/16");
    }

    #[test]
    fn vmi_node_and_node_readiness() {
        let vmi = Entity::decode(
            ResourceType::VirtualMachineInstance,
            r#"{"metadata":{"name":"vm1","namespace":"ns1"},"status":{"nodeName":"node-a","phase":"Running"}}"#,
        )
        .unwrap();
        assert_eq!(vmi.as_instance().unwrap().node(), Some(NamespaceName::cluster("node-a")));

        let node = Entity::decode(
            ResourceType::Node,
            r#"{"metadata":{"name":"node-a"},"status":{"addresses":[{"type":"InternalIP","address":"10.0.0.5"}],"conditions":[{"type":"Ready","status":"True"}]}}"#,
        )
        .unwrap();
        let n = node.as_node().unwrap();
        assert!(n.is_ready());
        assert_eq!(n.internal_ip(), Some("10.0.0.5"));
    }
}
