//! Vink core types: watched resource types, decoded entities, watch
//! envelopes and the filter options that scope a subscription.

#![forbid(unsafe_code)]

mod entity;
mod envelope;
mod filter;
mod identity;
mod resource;
pub mod summary;

pub use entity::{
    DataVolume, DataVolumeStatus, DecodeError, Devices, Disk, Domain, Entity, Node, NodeAddress, NodeCondition,
    NodeStatus, ObjectMeta, Shape, VirtualMachine, VirtualMachineInstance, VirtualMachineSpec, VirtualMachineStatus,
    VmTemplate, VmTemplateSpec, VmiInterface, VmiStatus, Volume, VolumeRef,
};
pub use envelope::{Decoded, Envelope, EventType, WireEnvelope};
pub use filter::{
    resolve_path, Combinator, FieldOp, FieldSelector, FieldSelectorGroup, FilterOptions, LabelRequirement, LabelSelector,
    SelectorError,
};
pub use identity::{IdentityKey, NamespaceName};
pub use resource::{ResourceType, UnknownResourceType};

pub mod prelude {
    pub use super::{Entity, Envelope, EventType, FilterOptions, IdentityKey, NamespaceName, ResourceType, WireEnvelope};
}
