use std::collections::{BTreeMap, BTreeSet, HashMap};

use crate::firestore::core::target_id_generator::TargetIdGenerator;
use crate::firestore::core::{Target, TargetId};
use crate::firestore::local::reference_set::ReferenceSet;
use crate::firestore::local::target_data::{ListenSequenceNumber, TargetData};
use crate::firestore::model::{DocumentKey, SnapshotVersion};

/// Metadata for every target the client has listened to, plus the keys the
/// backend reported as matching each target.
#[derive(Clone, Debug)]
pub struct MemoryTargetCache {
    targets: BTreeMap<TargetId, TargetData>,
    by_canonical_id: HashMap<String, TargetId>,
    references: ReferenceSet,
    highest_target_id: TargetId,
    highest_sequence_number: ListenSequenceNumber,
    last_remote_snapshot_version: SnapshotVersion,
    target_id_generator: TargetIdGenerator,
}

impl Default for MemoryTargetCache {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryTargetCache {
    pub fn new() -> Self {
        Self {
            targets: BTreeMap::new(),
            by_canonical_id: HashMap::new(),
            references: ReferenceSet::new(),
            highest_target_id: 0,
            highest_sequence_number: 0,
            last_remote_snapshot_version: SnapshotVersion::none(),
            target_id_generator: TargetIdGenerator::for_target_cache(0),
        }
    }

    pub fn target_count(&self) -> usize {
        self.targets.len()
    }

    pub fn highest_target_id(&self) -> TargetId {
        self.highest_target_id
    }

    pub fn allocate_target_id(&mut self) -> TargetId {
        let mut id = self.target_id_generator.next_id();
        while id <= self.highest_target_id {
            id = self.target_id_generator.next_id();
        }
        self.highest_target_id = id;
        id
    }

    pub fn next_sequence_number(&mut self) -> ListenSequenceNumber {
        self.highest_sequence_number += 1;
        self.highest_sequence_number
    }

    pub fn last_remote_snapshot_version(&self) -> SnapshotVersion {
        self.last_remote_snapshot_version
    }

    pub fn set_last_remote_snapshot_version(&mut self, version: SnapshotVersion) {
        if version > self.last_remote_snapshot_version {
            self.last_remote_snapshot_version = version;
        }
    }

    /// Inserts or replaces the metadata for `target_data.target_id`.
    pub fn save_target_data(&mut self, target_data: TargetData) {
        let target_id = target_data.target_id;
        if target_id > self.highest_target_id {
            self.highest_target_id = target_id;
            self.target_id_generator = TargetIdGenerator::for_target_cache(target_id);
        }
        if target_data.sequence_number > self.highest_sequence_number {
            self.highest_sequence_number = target_data.sequence_number;
        }
        self.by_canonical_id
            .insert(target_data.target.canonical_id(), target_id);
        self.targets.insert(target_id, target_data);
    }

    pub fn remove_target_data(&mut self, target_id: TargetId) -> Option<TargetData> {
        let removed = self.targets.remove(&target_id)?;
        self.by_canonical_id.remove(&removed.target.canonical_id());
        self.references.remove_references_for_id(target_id);
        Some(removed)
    }

    pub fn get_target_data(&self, target: &Target) -> Option<&TargetData> {
        let target_id = self.by_canonical_id.get(&target.canonical_id())?;
        self.targets.get(target_id)
    }

    pub fn target_data_for_id(&self, target_id: TargetId) -> Option<&TargetData> {
        self.targets.get(&target_id)
    }

    pub fn targets(&self) -> impl Iterator<Item = &TargetData> {
        self.targets.values()
    }

    pub fn add_matching_keys<'a>(
        &mut self,
        keys: impl IntoIterator<Item = &'a DocumentKey>,
        target_id: TargetId,
    ) {
        self.references.add_references(keys, target_id);
    }

    pub fn remove_matching_keys<'a>(
        &mut self,
        keys: impl IntoIterator<Item = &'a DocumentKey>,
        target_id: TargetId,
    ) {
        self.references.remove_references(keys, target_id);
    }

    pub fn matching_keys(&self, target_id: TargetId) -> BTreeSet<DocumentKey> {
        self.references.references_for_id(target_id)
    }

    pub fn contains_key(&self, key: &DocumentKey) -> bool {
        self.references.contains_key(key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::firestore::local::target_data::TargetPurpose;
    use crate::firestore::model::ResourcePath;
    use crate::firestore::core::Query;

    fn target(path: &str) -> Target {
        Query::new(ResourcePath::from_string(path).unwrap()).to_target()
    }

    #[test]
    fn allocates_even_ids_above_restored_targets() {
        let mut cache = MemoryTargetCache::new();
        cache.save_target_data(TargetData::new(target("rooms"), 6, TargetPurpose::Listen, 3));
        assert_eq!(cache.allocate_target_id(), 8);
        assert_eq!(cache.next_sequence_number(), 4);
    }

    #[test]
    fn looks_up_targets_by_canonical_id() {
        let mut cache = MemoryTargetCache::new();
        let id = cache.allocate_target_id();
        cache.save_target_data(TargetData::new(target("rooms"), id, TargetPurpose::Listen, 1));
        assert_eq!(cache.get_target_data(&target("rooms")).unwrap().target_id, id);
        assert!(cache.get_target_data(&target("halls")).is_none());

        let key = DocumentKey::from_string("rooms/a").unwrap();
        cache.add_matching_keys([&key], id);
        assert!(cache.contains_key(&key));
        cache.remove_target_data(id);
        assert!(!cache.contains_key(&key));
    }

    #[test]
    fn snapshot_version_only_moves_forward() {
        let mut cache = MemoryTargetCache::new();
        cache.set_last_remote_snapshot_version(SnapshotVersion::from_micros(5));
        cache.set_last_remote_snapshot_version(SnapshotVersion::from_micros(2));
        assert_eq!(cache.last_remote_snapshot_version(), SnapshotVersion::from_micros(5));
    }
}
