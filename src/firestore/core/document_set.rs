use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt::{Debug, Formatter};
use std::sync::Arc;

use crate::firestore::core::query::DocumentComparator;
use crate::firestore::model::{DocumentKey, MutableDocument};

/// Documents ordered by a query comparator, with ties broken by key.
#[derive(Clone)]
pub struct DocumentSet {
    by_key: BTreeMap<DocumentKey, MutableDocument>,
    sorted: Vec<MutableDocument>,
    comparator: DocumentComparator,
}

impl DocumentSet {
    pub fn new(comparator: DocumentComparator) -> Self {
        Self {
            by_key: BTreeMap::new(),
            sorted: Vec::new(),
            comparator,
        }
    }

    /// Empty set ordered by document key only.
    pub fn empty_by_key() -> Self {
        Self::new(Arc::new(|_: &MutableDocument, _: &MutableDocument| Ordering::Equal))
    }

    /// Empty set sharing this set's ordering.
    pub fn empty_like(&self) -> Self {
        Self::new(Arc::clone(&self.comparator))
    }

    fn compare(&self, left: &MutableDocument, right: &MutableDocument) -> Ordering {
        (self.comparator)(left, right).then_with(|| left.key().cmp(right.key()))
    }

    pub fn len(&self) -> usize {
        self.sorted.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sorted.is_empty()
    }

    pub fn contains(&self, key: &DocumentKey) -> bool {
        self.by_key.contains_key(key)
    }

    pub fn get(&self, key: &DocumentKey) -> Option<&MutableDocument> {
        self.by_key.get(key)
    }

    pub fn first(&self) -> Option<&MutableDocument> {
        self.sorted.first()
    }

    pub fn last(&self) -> Option<&MutableDocument> {
        self.sorted.last()
    }

    pub fn iter(&self) -> impl Iterator<Item = &MutableDocument> {
        self.sorted.iter()
    }

    pub fn keys(&self) -> impl Iterator<Item = &DocumentKey> {
        self.sorted.iter().map(MutableDocument::key)
    }

    /// Inserts or replaces the document with the same key.
    pub fn insert(&mut self, document: MutableDocument) {
        self.remove(document.key());
        let index = self
            .sorted
            .binary_search_by(|probe| self.compare(probe, &document))
            .unwrap_or_else(|index| index);
        self.by_key.insert(document.key().clone(), document.clone());
        self.sorted.insert(index, document);
    }

    pub fn remove(&mut self, key: &DocumentKey) -> Option<MutableDocument> {
        let existing = self.by_key.remove(key)?;
        if let Ok(index) = self
            .sorted
            .binary_search_by(|probe| self.compare(probe, &existing))
        {
            self.sorted.remove(index);
        } else {
            self.sorted.retain(|doc| doc.key() != key);
        }
        Some(existing)
    }
}

impl PartialEq for DocumentSet {
    fn eq(&self, other: &Self) -> bool {
        self.sorted == other.sorted
    }
}

impl Debug for DocumentSet {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_list()
            .entries(self.sorted.iter().map(|doc| doc.key().to_string()))
            .finish()
    }
}
