//! Watched resource types and their Kubernetes coordinates.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Closed set of resource types the list-watch gateway serves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ResourceType {
    VirtualMachine,
    VirtualMachineInstance,
    DataVolume,
    Node,
    Namespace,
    Multus,
    Subnet,
    Vpc,
    IpPool,
    StorageClass,
    Ip,
}

impl ResourceType {
    pub const ALL: [ResourceType; 11] = [
        ResourceType::VirtualMachine,
        ResourceType::VirtualMachineInstance,
        ResourceType::DataVolume,
        ResourceType::Node,
        ResourceType::Namespace,
        ResourceType::Multus,
        ResourceType::Subnet,
        ResourceType::Vpc,
        ResourceType::IpPool,
        ResourceType::StorageClass,
        ResourceType::Ip,
    ];

    /// Human label used for error attribution, logs and metrics.
    pub fn label(self) -> &'static str {
        match self {
            ResourceType::VirtualMachine => "VirtualMachine",
            ResourceType::VirtualMachineInstance => "VirtualMachineInstance",
            ResourceType::DataVolume => "DataVolume",
            ResourceType::Node => "Node",
            ResourceType::Namespace => "Namespace",
            ResourceType::Multus => "Multus",
            ResourceType::Subnet => "Subnet",
            ResourceType::Vpc => "VPC",
            ResourceType::IpPool => "IPPool",
            ResourceType::StorageClass => "StorageClass",
            ResourceType::Ip => "IP",
        }
    }

    pub fn group(self) -> &'static str {
        match self {
            ResourceType::VirtualMachine | ResourceType::VirtualMachineInstance => "kubevirt.io",
            ResourceType::DataVolume => "cdi.kubevirt.io",
            ResourceType::Node | ResourceType::Namespace => "",
            ResourceType::Multus => "k8s.cni.cncf.io",
            ResourceType::Subnet | ResourceType::Vpc | ResourceType::IpPool | ResourceType::Ip => "kubeovn.io",
            ResourceType::StorageClass => "storage.k8s.io",
        }
    }

    pub fn version(self) -> &'static str {
        match self {
            ResourceType::DataVolume => "v1beta1",
            _ => "v1",
        }
    }

    pub fn kind(self) -> &'static str {
        match self {
            ResourceType::Multus => "NetworkAttachmentDefinition",
            ResourceType::Vpc => "Vpc",
            ResourceType::IpPool => "IPPool",
            ResourceType::Ip => "IP",
            other => other.label(),
        }
    }

    pub fn namespaced(self) -> bool {
        matches!(
            self,
            ResourceType::VirtualMachine
                | ResourceType::VirtualMachineInstance
                | ResourceType::DataVolume
                | ResourceType::Multus
        )
    }

    /// `v1/Kind` for the core group, `group/v1/Kind` otherwise.
    pub fn gvk_key(self) -> String {
        if self.group().is_empty() {
            format!("{}/{}", self.version(), self.kind())
        } else {
            format!("{}/{}/{}", self.group(), self.version(), self.kind())
        }
    }
}

impl fmt::Display for ResourceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(self.label()) }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown resource type: {0}")]
pub struct UnknownResourceType(pub String);

impl FromStr for ResourceType {
    type Err = UnknownResourceType;

    /// Accepts labels (`VirtualMachine`), wire names (`VIRTUAL_MACHINE`) and short aliases (`vm`).
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let norm: String = s.chars().filter(|c| *c != '_' && *c != '-').collect::<String>().to_ascii_lowercase();
        let rt = match norm.as_str() {
            "virtualmachine" | "virtualmachines" | "vm" | "vms" => ResourceType::VirtualMachine,
            "virtualmachineinstance" | "virtualmachineinstances" | "vmi" | "vmis" => ResourceType::VirtualMachineInstance,
            "datavolume" | "datavolumes" | "dv" | "dvs" => ResourceType::DataVolume,
            "node" | "nodes" => ResourceType::Node,
            "namespace" | "namespaces" | "ns" => ResourceType::Namespace,
            "multus" | "networkattachmentdefinition" | "nad" => ResourceType::Multus,
            "subnet" | "subnets" => ResourceType::Subnet,
            "vpc" | "vpcs" => ResourceType::Vpc,
            "ippool" | "ippools" => ResourceType::IpPool,
            "storageclass" | "storageclasses" | "sc" => ResourceType::StorageClass,
            "ip" | "ips" => ResourceType::Ip,
            _ => return Err(UnknownResourceType(s.to_string())),
        };
        Ok(rt)
    }
}
