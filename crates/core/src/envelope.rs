//! Watch envelopes: the wire form and its decoded counterpart.

use serde::{Deserialize, Serialize};

use crate::{DecodeError, Entity, IdentityKey, NamespaceName, ResourceType};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventType {
    Added,
    Modified,
    Deleted,
}

impl EventType {
    pub fn as_str(self) -> &'static str {
        match self {
            EventType::Added => "added",
            EventType::Modified => "modified",
            EventType::Deleted => "deleted",
        }
    }
}

/// One list-watch stream item as the gateway sends it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WireEnvelope {
    pub event_type: EventType,
    /// Serialized entities (JSON text).
    #[serde(default)]
    pub items: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deleted: Option<NamespaceName>,
}

impl WireEnvelope {
    pub fn added(items: Vec<String>) -> Self { Self { event_type: EventType::Added, items, deleted: None } }
    pub fn modified(items: Vec<String>) -> Self { Self { event_type: EventType::Modified, items, deleted: None } }
    pub fn deleted(identity: NamespaceName) -> Self {
        Self { event_type: EventType::Deleted, items: Vec::new(), deleted: Some(identity) }
    }
}

/// Decoded envelope, applied to a projection in receipt order.
#[derive(Debug, Clone, PartialEq)]
pub enum Envelope {
    Added(Vec<Entity>),
    Modified(Vec<Entity>),
    Deleted(IdentityKey),
}

/// Result of decoding a wire envelope: the envelope plus the items that failed.
#[derive(Debug)]
pub struct Decoded {
    pub envelope: Envelope,
    pub rejected: Vec<DecodeError>,
}

impl Envelope {
    pub fn event_type(&self) -> EventType {
        match self {
            Envelope::Added(_) => EventType::Added,
            Envelope::Modified(_) => EventType::Modified,
            Envelope::Deleted(_) => EventType::Deleted,
        }
    }

    /// Decode at the transport boundary. A bad item is collected in
    /// `rejected` and skipped; only a DELETED envelope with no resolvable
    /// identity fails as a whole.
    pub fn decode(resource: ResourceType, wire: &WireEnvelope) -> Result<Decoded, DecodeError> {
        let mut rejected = Vec::new();
        let envelope = match wire.event_type {
            EventType::Added | EventType::Modified => {
                let mut entities = Vec::with_capacity(wire.items.len());
                for item in &wire.items {
                    match Entity::decode(resource, item) {
                        Ok(e) => entities.push(e),
                        Err(e) => rejected.push(e),
                    }
                }
                if wire.event_type == EventType::Added { Envelope::Added(entities) } else { Envelope::Modified(entities) }
            }
            EventType::Deleted => {
                // Some gateways send the deleted object in `items` instead of `deleted`.
                let key = match &wire.deleted {
                    Some(nn) if !nn.name.is_empty() => nn.key(),
                    _ => wire
                        .items
                        .iter()
                        .find_map(|item| Entity::decode(resource, item).ok())
                        .map(|e| e.key().clone())
                        .ok_or(DecodeError::MissingDeleted { resource: resource.label() })?,
                };
                Envelope::Deleted(key)
            }
        };
        Ok(Decoded { envelope, rejected })
    }
}
