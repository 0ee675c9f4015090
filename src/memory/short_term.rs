//! Short-term layer: bounded store of structured triples with
//! importance-and-decay eviction.

use crate::memory::types::{ShortTermMemory, MAX_IMPORTANCE_DELTA};
use std::collections::{BTreeMap, HashMap, HashSet};

/// In-memory short-term store. The engine guards it with a mutex and
/// journals it after mutations.
pub struct ShortTermStore {
    memories: HashMap<String, ShortTermMemory>,
    capacity: usize,
    decay_factor: f32,
    /// Ids accessed since the last decay sweep; the sweep skips them.
    accessed_since_sweep: HashSet<String>,
}

impl ShortTermStore {
    pub fn new(capacity: usize, decay_factor: f32) -> Self {
        Self {
            memories: HashMap::new(),
            capacity,
            decay_factor,
            accessed_since_sweep: HashSet::new(),
        }
    }

    pub fn restore(&mut self, memories: Vec<ShortTermMemory>) {
        self.memories = memories
            .into_iter()
            .map(|memory| (memory.id.clone(), memory))
            .collect();
    }

    pub fn get(&self, id: &str) -> Option<&ShortTermMemory> {
        self.memories.get(id)
    }

    pub fn len(&self) -> usize {
        self.memories.len()
    }

    pub fn is_empty(&self) -> bool {
        self.memories.is_empty()
    }

    /// Insert a new memory. Returns ids evicted to stay within capacity
    /// (never memories currently being promoted).
    pub fn insert(&mut self, memory: ShortTermMemory) -> Vec<String> {
        self.memories.insert(memory.id.clone(), memory);
        self.evict_over_capacity()
    }

    /// Fold a candidate's attributes into an existing memory and bump its
    /// importance by a bounded delta.
    pub fn merge(
        &mut self,
        target_id: &str,
        attributes: &BTreeMap<String, String>,
        importance_delta: f32,
        origin_block_id: &str,
    ) -> bool {
        let Some(memory) = self.memories.get_mut(target_id) else {
            return false;
        };
        for (key, value) in attributes {
            memory
                .attributes
                .entry(key.clone())
                .or_insert_with(|| value.clone());
        }
        let delta = importance_delta.clamp(0.0, MAX_IMPORTANCE_DELTA);
        memory.importance = (memory.importance + delta).min(1.0);
        memory.last_accessed = chrono::Utc::now();
        if !memory.origin_block_ids.iter().any(|id| id == origin_block_id) {
            memory.origin_block_ids.push(origin_block_id.to_string());
        }
        self.accessed_since_sweep.insert(target_id.to_string());
        true
    }

    /// Replace contradicting attributes on an existing memory and bump its
    /// importance.
    pub fn update(
        &mut self,
        target_id: &str,
        attributes: &BTreeMap<String, String>,
        origin_block_id: &str,
    ) -> bool {
        let Some(memory) = self.memories.get_mut(target_id) else {
            return false;
        };
        for (key, value) in attributes {
            memory.attributes.insert(key.clone(), value.clone());
        }
        memory.importance = (memory.importance + 0.05).min(1.0);
        memory.last_accessed = chrono::Utc::now();
        if !memory.origin_block_ids.iter().any(|id| id == origin_block_id) {
            memory.origin_block_ids.push(origin_block_id.to_string());
        }
        self.accessed_since_sweep.insert(target_id.to_string());
        true
    }

    /// Record an access: refresh recency, bump activation, apply the
    /// per-access decay.
    pub fn access(&mut self, id: &str) -> Option<&ShortTermMemory> {
        let memory = self.memories.get_mut(id)?;
        memory.activation_count += 1;
        memory.last_accessed = chrono::Utc::now();
        memory.importance *= self.decay_factor;
        self.accessed_since_sweep.insert(id.to_string());
        self.memories.get(id)
    }

    /// Background sweep: decay every memory not accessed since the last
    /// sweep. Returns how many were decayed.
    pub fn decay_unaccessed(&mut self) -> usize {
        let mut decayed = 0;
        for memory in self.memories.values_mut() {
            if self.accessed_since_sweep.contains(&memory.id) {
                continue;
            }
            memory.importance *= self.decay_factor;
            decayed += 1;
        }
        self.accessed_since_sweep.clear();
        decayed
    }

    pub fn set_promoting(&mut self, id: &str, promoting: bool) {
        if let Some(memory) = self.memories.get_mut(id) {
            memory.promoting = promoting;
        }
    }

    pub fn mark_embedded(&mut self, id: &str) {
        if let Some(memory) = self.memories.get_mut(id) {
            memory.embedded = true;
        }
    }

    pub fn remove(&mut self, id: &str) -> Option<ShortTermMemory> {
        self.accessed_since_sweep.remove(id);
        self.memories.remove(id)
    }

    /// Ids whose importance reached the transfer threshold and that are not
    /// already queued for promotion.
    pub fn transfer_candidates(&self, threshold: f32) -> Vec<String> {
        self.memories
            .values()
            .filter(|memory| memory.importance >= threshold && !memory.promoting)
            .map(|memory| memory.id.clone())
            .collect()
    }

    pub fn snapshot(&self) -> Vec<ShortTermMemory> {
        self.memories.values().cloned().collect()
    }

    pub fn unembedded_ids(&self) -> Vec<String> {
        self.memories
            .values()
            .filter(|memory| !memory.embedded)
            .map(|memory| memory.id.clone())
            .collect()
    }

    /// Combined `(importance × decay^age)` ranking used for eviction;
    /// lower evicts first. Age counts minutes since last access.
    fn ranking(&self, memory: &ShortTermMemory, now: chrono::DateTime<chrono::Utc>) -> f32 {
        let age_minutes = (now - memory.last_accessed).num_minutes().max(0) as f32;
        memory.importance * self.decay_factor.powf(age_minutes)
    }

    fn evict_over_capacity(&mut self) -> Vec<String> {
        let mut evicted = Vec::new();
        let now = chrono::Utc::now();
        while self.memories.len() > self.capacity {
            let victim = self
                .memories
                .values()
                .filter(|memory| !memory.promoting)
                .min_by(|a, b| {
                    self.ranking(a, now)
                        .partial_cmp(&self.ranking(b, now))
                        .unwrap_or(std::cmp::Ordering::Equal)
                })
                .map(|memory| memory.id.clone());
            let Some(victim) = victim else {
                // Everything is mid-promotion; tolerate the overflow.
                break;
            };
            self.remove(&victim);
            evicted.push(victim);
        }
        evicted
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::types::ExtractedTriple;

    fn memory(subject: &str, importance: f32) -> ShortTermMemory {
        let triple = ExtractedTriple {
            subject: subject.into(),
            topic: "topic".into(),
            object: "object".into(),
            attributes: BTreeMap::new(),
            importance,
        };
        ShortTermMemory::from_triple(triple, "block-1")
    }

    #[test]
    fn eviction_removes_lowest_ranked_first() {
        let mut store = ShortTermStore::new(2, 0.98);
        store.insert(memory("keep-high", 0.9));
        store.insert(memory("keep-mid", 0.5));
        let evicted = store.insert(memory("low", 0.1));

        assert_eq!(evicted.len(), 1);
        assert_eq!(store.len(), 2);
        assert!(store
            .snapshot()
            .iter()
            .all(|memory| memory.subject != "low"));
    }

    #[test]
    fn promoting_memories_are_never_evicted() {
        let mut store = ShortTermStore::new(1, 0.98);
        let low = memory("low-but-promoting", 0.05);
        let low_id = low.id.clone();
        store.insert(low);
        store.set_promoting(&low_id, true);

        let evicted = store.insert(memory("high", 0.9));
        // The high newcomer is the only evictable entry.
        assert_eq!(evicted.len(), 1);
        assert!(store.get(&low_id).is_some());
    }

    #[test]
    fn merge_keeps_existing_attributes_and_caps_delta() {
        let mut store = ShortTermStore::new(10, 0.98);
        let mut existing = memory("we", 0.5);
        existing
            .attributes
            .insert("time".into(), "next Wednesday".into());
        let id = existing.id.clone();
        store.insert(existing);

        let mut incoming = BTreeMap::new();
        incoming.insert("time".into(), "next Thursday".into());
        incoming.insert("place".into(), "cafe".into());

        assert!(store.merge(&id, &incoming, 5.0, "block-2"));
        let merged = store.get(&id).unwrap();
        // Merge keeps the existing value; update would replace it.
        assert_eq!(merged.attributes["time"], "next Wednesday");
        assert_eq!(merged.attributes["place"], "cafe");
        assert!((merged.importance - (0.5 + MAX_IMPORTANCE_DELTA)).abs() < 1e-6);
        assert_eq!(merged.origin_block_ids, vec!["block-1", "block-2"]);
    }

    #[test]
    fn update_replaces_contradicting_attributes() {
        let mut store = ShortTermStore::new(10, 0.98);
        let mut existing = memory("we", 0.5);
        existing
            .attributes
            .insert("time".into(), "next Wednesday".into());
        let id = existing.id.clone();
        store.insert(existing);

        let mut incoming = BTreeMap::new();
        incoming.insert("time".into(), "next Friday".into());
        assert!(store.update(&id, &incoming, "block-3"));
        assert_eq!(store.get(&id).unwrap().attributes["time"], "next Friday");
    }

    #[test]
    fn access_decays_and_sweep_skips_accessed() {
        let mut store = ShortTermStore::new(10, 0.5);
        let a = memory("a", 0.8);
        let b = memory("b", 0.8);
        let a_id = a.id.clone();
        let b_id = b.id.clone();
        store.insert(a);
        store.insert(b);

        store.access(&a_id);
        assert!((store.get(&a_id).unwrap().importance - 0.4).abs() < 1e-6);

        let decayed = store.decay_unaccessed();
        assert_eq!(decayed, 1);
        assert!((store.get(&b_id).unwrap().importance - 0.4).abs() < 1e-6);
        // a was accessed since the sweep started; untouched by the sweep.
        assert!((store.get(&a_id).unwrap().importance - 0.4).abs() < 1e-6);
    }

    #[test]
    fn transfer_candidates_respect_threshold_and_promoting() {
        let mut store = ShortTermStore::new(10, 0.98);
        let hot = memory("hot", 0.7);
        let hot_id = hot.id.clone();
        store.insert(hot);
        store.insert(memory("cold", 0.3));

        assert_eq!(store.transfer_candidates(0.6), vec![hot_id.clone()]);

        store.set_promoting(&hot_id, true);
        assert!(store.transfer_candidates(0.6).is_empty());
    }
}
