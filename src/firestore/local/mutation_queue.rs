use std::collections::{BTreeSet, VecDeque};

use crate::firestore::constants::BATCH_ID_UNKNOWN;
use crate::firestore::core::Query;
use crate::firestore::error::{internal_error, FirestoreResult};
use crate::firestore::local::reference_set::ReferenceSet;
use crate::firestore::model::{BatchId, DocumentKey, Mutation, MutationBatch, Timestamp};

/// Pending writes of one user, ordered by batch id.
///
/// Batches leave the queue strictly from the head, once the backend has
/// acknowledged or rejected them.
#[derive(Clone, Debug)]
pub struct MemoryMutationQueue {
    queue: VecDeque<MutationBatch>,
    next_batch_id: BatchId,
    last_stream_token: Vec<u8>,
    batches_by_key: ReferenceSet,
}

impl Default for MemoryMutationQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryMutationQueue {
    pub fn new() -> Self {
        Self {
            queue: VecDeque::new(),
            next_batch_id: 1,
            last_stream_token: Vec::new(),
            batches_by_key: ReferenceSet::new(),
        }
    }

    /// Rebuilds a queue from batches restored out of persistence.
    pub fn restore(batches: Vec<MutationBatch>, last_stream_token: Vec<u8>) -> Self {
        let mut queue = Self::new();
        queue.last_stream_token = last_stream_token;
        let mut batches = batches;
        batches.sort_by_key(|batch| batch.batch_id);
        for batch in batches {
            queue.next_batch_id = queue.next_batch_id.max(batch.batch_id + 1);
            queue.index_batch(&batch);
            queue.queue.push_back(batch);
        }
        queue
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    /// Builds the batch the queue would accept next without queueing it.
    pub fn new_batch(
        &self,
        local_write_time: Timestamp,
        base_mutations: Vec<Mutation>,
        mutations: Vec<Mutation>,
    ) -> MutationBatch {
        MutationBatch::new(self.next_batch_id, local_write_time, base_mutations, mutations)
    }

    /// Appends a batch built by [`MemoryMutationQueue::new_batch`].
    pub fn add_batch(&mut self, batch: MutationBatch) -> FirestoreResult<()> {
        if batch.batch_id != self.next_batch_id {
            return Err(internal_error(format!(
                "Batch {} added out of order, expected {}",
                batch.batch_id, self.next_batch_id
            )));
        }
        self.next_batch_id += 1;
        self.index_batch(&batch);
        self.queue.push_back(batch);
        Ok(())
    }

    fn index_batch(&mut self, batch: &MutationBatch) {
        for mutation in &batch.mutations {
            self.batches_by_key
                .add_reference(mutation.key().clone(), batch.batch_id);
        }
    }

    pub fn lookup(&self, batch_id: BatchId) -> Option<&MutationBatch> {
        let index = self.index_of(batch_id)?;
        self.queue.get(index)
    }

    fn index_of(&self, batch_id: BatchId) -> Option<usize> {
        let first = self.queue.front()?.batch_id;
        let index = usize::try_from(batch_id - first).ok()?;
        match self.queue.get(index) {
            Some(batch) if batch.batch_id == batch_id => Some(index),
            _ => self.queue.iter().position(|batch| batch.batch_id == batch_id),
        }
    }

    /// First batch with an id greater than `batch_id`, or the head when
    /// `batch_id` is `None`.
    pub fn next_batch_after(&self, batch_id: Option<BatchId>) -> Option<&MutationBatch> {
        let after = batch_id.unwrap_or(BATCH_ID_UNKNOWN);
        self.queue.iter().find(|batch| batch.batch_id > after)
    }

    pub fn highest_unacknowledged_batch_id(&self) -> BatchId {
        self.queue
            .back()
            .map(|batch| batch.batch_id)
            .unwrap_or(BATCH_ID_UNKNOWN)
    }

    pub fn all_batches(&self) -> impl Iterator<Item = &MutationBatch> {
        self.queue.iter()
    }

    pub fn all_batches_affecting_key(&self, key: &DocumentKey) -> Vec<&MutationBatch> {
        self.queue
            .iter()
            .filter(|batch| self.batches_by_key.contains(key, batch.batch_id))
            .collect()
    }

    pub fn all_batches_affecting_keys(&self, keys: &BTreeSet<DocumentKey>) -> Vec<&MutationBatch> {
        self.queue
            .iter()
            .filter(|batch| keys.iter().any(|key| self.batches_by_key.contains(key, batch.batch_id)))
            .collect()
    }

    pub fn all_batches_affecting_query(&self, query: &Query) -> Vec<&MutationBatch> {
        self.queue
            .iter()
            .filter(|batch| {
                batch
                    .mutations
                    .iter()
                    .any(|mutation| query.matches_path(mutation.key()))
            })
            .collect()
    }

    /// Removes `batch_id`, which must be the head of the queue.
    pub fn remove_batch(&mut self, batch_id: BatchId) -> FirestoreResult<MutationBatch> {
        match self.queue.front() {
            Some(head) if head.batch_id == batch_id => {}
            Some(head) => {
                return Err(internal_error(format!(
                    "Can only remove the first batch of the mutation queue (head {}, requested {batch_id})",
                    head.batch_id
                )))
            }
            None => {
                return Err(internal_error(format!(
                    "Cannot remove batch {batch_id} from an empty mutation queue"
                )))
            }
        }

        let batch = self
            .queue
            .pop_front()
            .ok_or_else(|| internal_error("Mutation queue emptied during removal"))?;
        for mutation in &batch.mutations {
            self.batches_by_key
                .remove_reference(mutation.key(), batch.batch_id);
        }
        Ok(batch)
    }

    pub fn set_last_stream_token(&mut self, token: Vec<u8>) {
        self.last_stream_token = token;
    }

    pub fn last_stream_token(&self) -> &[u8] {
        &self.last_stream_token
    }

    pub fn contains_key(&self, key: &DocumentKey) -> bool {
        self.batches_by_key.contains_key(key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::firestore::model::ResourcePath;
    use crate::firestore::value::MapValue;

    fn key(path: &str) -> DocumentKey {
        DocumentKey::from_string(path).unwrap()
    }

    fn add(queue: &mut MemoryMutationQueue, path: &str) -> BatchId {
        let batch = queue.new_batch(
            Timestamp::now(),
            Vec::new(),
            vec![Mutation::set(key(path), MapValue::empty())],
        );
        let batch_id = batch.batch_id;
        queue.add_batch(batch).unwrap();
        batch_id
    }

    #[test]
    fn batch_ids_increase_monotonically() {
        let mut queue = MemoryMutationQueue::new();
        let first = add(&mut queue, "c/a");
        let second = add(&mut queue, "c/b");
        assert!(second > first);
        assert_eq!(queue.highest_unacknowledged_batch_id(), second);
        assert_eq!(queue.next_batch_after(Some(first)).unwrap().batch_id, second);
        assert_eq!(queue.next_batch_after(None).unwrap().batch_id, first);
    }

    #[test]
    fn unqueued_batch_does_not_consume_an_id() {
        let mut queue = MemoryMutationQueue::new();
        let dropped = queue.new_batch(Timestamp::now(), Vec::new(), Vec::new());
        assert!(queue.is_empty());
        let batch = queue.new_batch(Timestamp::now(), Vec::new(), Vec::new());
        assert_eq!(batch.batch_id, dropped.batch_id);
        queue.add_batch(batch).unwrap();
        assert!(queue.add_batch(dropped).is_err());
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn only_head_can_be_removed() {
        let mut queue = MemoryMutationQueue::new();
        let first = add(&mut queue, "c/a");
        let second = add(&mut queue, "c/a");

        let err = queue.remove_batch(second).unwrap_err();
        assert_eq!(err.code_str(), "firestore/internal");

        queue.remove_batch(first).unwrap();
        queue.remove_batch(second).unwrap();
        assert!(queue.is_empty());
        assert_eq!(queue.highest_unacknowledged_batch_id(), BATCH_ID_UNKNOWN);
        assert!(!queue.contains_key(&key("c/a")));
    }

    #[test]
    fn finds_batches_by_key_and_query() {
        let mut queue = MemoryMutationQueue::new();
        add(&mut queue, "rooms/a");
        add(&mut queue, "halls/b");
        add(&mut queue, "rooms/a");

        assert_eq!(queue.all_batches_affecting_key(&key("rooms/a")).len(), 2);
        let query = Query::new(ResourcePath::from_string("halls").unwrap());
        assert_eq!(queue.all_batches_affecting_query(&query).len(), 1);
    }

    #[test]
    fn restore_continues_after_highest_id() {
        let mut queue = MemoryMutationQueue::new();
        add(&mut queue, "c/a");
        add(&mut queue, "c/b");
        let batches: Vec<MutationBatch> = queue.all_batches().cloned().collect();

        let mut restored = MemoryMutationQueue::restore(batches, b"token".to_vec());
        assert_eq!(restored.len(), 2);
        assert_eq!(restored.last_stream_token(), b"token");
        assert_eq!(add(&mut restored, "c/c"), 3);
    }
}
