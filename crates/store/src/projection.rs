//! Projection store: the ordered map rebuilt from an envelope stream.

use std::collections::BTreeMap;
use std::sync::Arc;

use vink_core::{Entity, Envelope, EventType, IdentityKey};

/// Frozen view of a projection, shared with readers.
#[derive(Debug, Clone, Default)]
pub struct Projection {
    /// Resyncs observed (first `Added` of a session bumps it).
    pub generation: u64,
    /// Envelopes applied.
    pub revision: u64,
    pub entries: BTreeMap<IdentityKey, Entity>,
}

impl Projection {
    pub fn len(&self) -> usize { self.entries.len() }
    pub fn is_empty(&self) -> bool { self.entries.is_empty() }
    pub fn get(&self, key: &str) -> Option<&Entity> { self.entries.get(key) }
    pub fn contains(&self, key: &str) -> bool { self.entries.contains_key(key) }
    pub fn keys(&self) -> impl Iterator<Item = &IdentityKey> { self.entries.keys() }
    pub fn values(&self) -> impl Iterator<Item = &Entity> { self.entries.values() }
}

/// What one application changed; input for the cascade.
#[derive(Debug, Clone)]
pub struct Applied {
    pub event: EventType,
    /// The envelope started a new generation (entries from before were discarded).
    pub reset: bool,
    pub upserted: Vec<Entity>,
    /// Key named by a `Deleted` envelope and the entry it removed, if any.
    pub deleted: Option<(IdentityKey, Option<Entity>)>,
}

/// Mutable projection owned by exactly one writer (a watch session or a cascade).
#[derive(Debug)]
pub struct ProjectionStore {
    entries: BTreeMap<IdentityKey, Entity>,
    awaiting_first_added: bool,
    generation: u64,
    revision: u64,
}

impl Default for ProjectionStore {
    fn default() -> Self { Self::new() }
}

impl ProjectionStore {
    pub fn new() -> Self {
        Self { entries: BTreeMap::new(), awaiting_first_added: true, generation: 0, revision: 0 }
    }

    pub fn len(&self) -> usize { self.entries.len() }
    pub fn is_empty(&self) -> bool { self.entries.is_empty() }
    pub fn get(&self, key: &str) -> Option<&Entity> { self.entries.get(key) }
    pub fn contains(&self, key: &str) -> bool { self.entries.contains_key(key) }
    pub fn generation(&self) -> u64 { self.generation }
    pub fn revision(&self) -> u64 { self.revision }

    /// Apply one envelope. The first `Added` after construction (or after
    /// [`ProjectionStore::expect_resync`]) replaces the map wholesale, even when empty.
    pub fn apply(&mut self, envelope: &Envelope) -> Applied {
        self.revision = self.revision.saturating_add(1);
        match envelope {
            Envelope::Added(entities) => {
                let reset = self.awaiting_first_added;
                if reset {
                    self.entries = BTreeMap::new();
                    self.awaiting_first_added = false;
                    self.generation = self.generation.saturating_add(1);
                }
                self.upsert_all(entities);
                Applied { event: EventType::Added, reset, upserted: entities.clone(), deleted: None }
            }
            Envelope::Modified(entities) => {
                self.upsert_all(entities);
                Applied { event: EventType::Modified, reset: false, upserted: entities.clone(), deleted: None }
            }
            Envelope::Deleted(key) => {
                let prev = self.entries.remove(key);
                Applied { event: EventType::Deleted, reset: false, upserted: Vec::new(), deleted: Some((key.clone(), prev)) }
            }
        }
    }

    /// Insert-or-replace outside the envelope path (cascade results).
    pub fn upsert(&mut self, entity: Entity) {
        self.revision = self.revision.saturating_add(1);
        self.entries.insert(entity.key().clone(), entity);
    }

    pub fn remove(&mut self, key: &str) -> Option<Entity> {
        let prev = self.entries.remove(key);
        if prev.is_some() { self.revision = self.revision.saturating_add(1); }
        prev
    }

    /// Drop everything and start a new generation.
    pub fn reset(&mut self) {
        self.entries.clear();
        self.generation = self.generation.saturating_add(1);
        self.revision = self.revision.saturating_add(1);
    }

    /// Arm the reset rule again: the next `Added` is treated as a fresh snapshot.
    pub fn expect_resync(&mut self) { self.awaiting_first_added = true; }

    pub fn retain(&mut self, mut keep: impl FnMut(&IdentityKey, &Entity) -> bool) -> Vec<IdentityKey> {
        let dropped: Vec<IdentityKey> = self.entries.iter().filter(|&(k, e)| !keep(k, e)).map(|(k, _)| k.clone()).collect();
        for k in &dropped { self.entries.remove(k); }
        if !dropped.is_empty() { self.revision = self.revision.saturating_add(1); }
        dropped
    }

    pub fn freeze(&self) -> Arc<Projection> {
        Arc::new(Projection { generation: self.generation, revision: self.revision, entries: self.entries.clone() })
    }

    fn upsert_all(&mut self, entities: &[Entity]) {
        for e in entities {
            self.entries.insert(e.key().clone(), e.clone());
        }
    }
}
