use std::cmp::Ordering;
use std::collections::BTreeSet;
use std::sync::Arc;

use crate::firestore::core::filter::{FieldFilter, Filter};
use crate::firestore::core::order_by::{Bound, Direction, OrderBy};
use crate::firestore::core::target::Target;
use crate::firestore::model::{DocumentKey, FieldPath, MutableDocument, ResourcePath};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum LimitType {
    First,
    Last,
}

/// Ordering over documents induced by a query's normalised `order_by`.
pub type DocumentComparator =
    Arc<dyn Fn(&MutableDocument, &MutableDocument) -> Ordering + Send + Sync>;

/// A query over a collection, a collection group, or a single document.
#[derive(Clone, Debug, PartialEq)]
pub struct Query {
    path: ResourcePath,
    collection_group: Option<String>,
    filters: Vec<Filter>,
    explicit_order_by: Vec<OrderBy>,
    limit: Option<u32>,
    limit_type: LimitType,
    start_at: Option<Bound>,
    end_at: Option<Bound>,
}

impl Query {
    /// Query over the collection (or single document) at `path`.
    pub fn new(path: ResourcePath) -> Self {
        Self {
            path,
            collection_group: None,
            filters: Vec::new(),
            explicit_order_by: Vec::new(),
            limit: None,
            limit_type: LimitType::First,
            start_at: None,
            end_at: None,
        }
    }

    pub fn for_document(key: &DocumentKey) -> Self {
        Self::new(key.path().clone())
    }

    /// Query over every collection named `collection_id`, at any depth.
    pub fn collection_group(collection_id: impl Into<String>) -> Self {
        let mut query = Self::new(ResourcePath::default());
        query.collection_group = Some(collection_id.into());
        query
    }

    pub fn with_filter(mut self, filter: Filter) -> Self {
        self.filters.push(filter);
        self
    }

    pub fn with_order_by(mut self, order_by: OrderBy) -> Self {
        self.explicit_order_by.push(order_by);
        self
    }

    pub fn with_limit_to_first(mut self, limit: u32) -> Self {
        self.limit = Some(limit);
        self.limit_type = LimitType::First;
        self
    }

    pub fn with_limit_to_last(mut self, limit: u32) -> Self {
        self.limit = Some(limit);
        self.limit_type = LimitType::Last;
        self
    }

    pub fn starting_at(mut self, bound: Bound) -> Self {
        self.start_at = Some(bound);
        self
    }

    pub fn ending_at(mut self, bound: Bound) -> Self {
        self.end_at = Some(bound);
        self
    }

    pub fn path(&self) -> &ResourcePath {
        &self.path
    }

    pub fn collection_group_id(&self) -> Option<&str> {
        self.collection_group.as_deref()
    }

    pub fn filters(&self) -> &[Filter] {
        &self.filters
    }

    pub fn explicit_order_by(&self) -> &[OrderBy] {
        &self.explicit_order_by
    }

    pub fn limit(&self) -> Option<u32> {
        self.limit
    }

    pub fn limit_type(&self) -> LimitType {
        self.limit_type
    }

    pub fn has_limit(&self) -> bool {
        self.limit.is_some()
    }

    pub fn start_at(&self) -> Option<&Bound> {
        self.start_at.as_ref()
    }

    pub fn end_at(&self) -> Option<&Bound> {
        self.end_at.as_ref()
    }

    pub fn is_document_query(&self) -> bool {
        DocumentKey::is_document_key(&self.path)
            && self.collection_group.is_none()
            && self.filters.is_empty()
    }

    pub fn is_collection_group_query(&self) -> bool {
        self.collection_group.is_some()
    }

    /// True when the query returns every document in its collection, so
    /// cached remote keys cannot narrow the scan.
    pub fn matches_all_documents(&self) -> bool {
        self.filters.is_empty()
            && self.limit.is_none()
            && self.start_at.is_none()
            && self.end_at.is_none()
            && (self.explicit_order_by.is_empty()
                || (self.explicit_order_by.len() == 1
                    && self.explicit_order_by[0].field().is_key_field()))
    }

    fn inequality_fields(&self) -> BTreeSet<FieldPath> {
        self.filters
            .iter()
            .flat_map(Filter::flattened)
            .filter(|filter: &&FieldFilter| filter.is_inequality())
            .map(|filter| filter.field().clone())
            .collect()
    }

    /// Explicit ordering followed by implicit orderings on inequality fields
    /// and finally the document key.
    pub fn normalized_order_by(&self) -> Vec<OrderBy> {
        let mut normalized = self.explicit_order_by.clone();
        let mut seen: BTreeSet<FieldPath> = normalized
            .iter()
            .map(|order| order.field().clone())
            .collect();
        let last_direction = self
            .explicit_order_by
            .last()
            .map(OrderBy::direction)
            .unwrap_or(Direction::Ascending);

        for field in self.inequality_fields() {
            if !field.is_key_field() && seen.insert(field.clone()) {
                normalized.push(OrderBy::new(field, last_direction));
            }
        }
        if !seen.contains(&FieldPath::document_id()) {
            normalized.push(OrderBy::new(FieldPath::document_id(), last_direction));
        }
        normalized
    }

    pub fn to_target(&self) -> Target {
        let order_by = self.normalized_order_by();
        match self.limit_type {
            LimitType::First => Target {
                path: self.path.clone(),
                collection_group: self.collection_group.clone(),
                filters: self.filters.clone(),
                order_by,
                limit: self.limit,
                start_at: self.start_at.clone(),
                end_at: self.end_at.clone(),
            },
            // Limit-to-last runs as a limit-to-first over the reversed order.
            LimitType::Last => Target {
                path: self.path.clone(),
                collection_group: self.collection_group.clone(),
                filters: self.filters.clone(),
                order_by: order_by.iter().map(OrderBy::reversed).collect(),
                limit: self.limit,
                start_at: self.end_at.clone(),
                end_at: self.start_at.clone(),
            },
        }
    }

    pub fn canonical_id(&self) -> String {
        let limit_type = match self.limit_type {
            LimitType::First => "F",
            LimitType::Last => "L",
        };
        format!("{}|lt:{limit_type}", self.to_target().canonical_id())
    }

    pub fn matches(&self, document: &MutableDocument) -> bool {
        document.is_found_document()
            && self.matches_path(document.key())
            && self.matches_order_by(document)
            && self.filters.iter().all(|filter| filter.matches(document))
            && self.matches_bounds(document)
    }

    /// True when `key` lies within the collection, group or document
    /// the query ranges over.
    pub(crate) fn matches_path(&self, key: &DocumentKey) -> bool {
        let doc_path = key.path();
        if let Some(group) = &self.collection_group {
            key.has_collection_id(group) && self.path.is_prefix_of(doc_path)
        } else if DocumentKey::is_document_key(&self.path) {
            &self.path == doc_path
        } else {
            self.path.is_immediate_parent_of(doc_path)
        }
    }

    fn matches_order_by(&self, document: &MutableDocument) -> bool {
        self.explicit_order_by
            .iter()
            .all(|order| order.field().is_key_field() || document.field(order.field()).is_some())
    }

    fn matches_bounds(&self, document: &MutableDocument) -> bool {
        let order_by = self.normalized_order_by();
        if let Some(start) = &self.start_at {
            if !start.sorts_before_document(&order_by, document) {
                return false;
            }
        }
        if let Some(end) = &self.end_at {
            if !end.sorts_after_document(&order_by, document) {
                return false;
            }
        }
        true
    }

    pub fn comparator(&self) -> DocumentComparator {
        let order_by = self.normalized_order_by();
        Arc::new(move |left: &MutableDocument, right: &MutableDocument| {
            order_by
                .iter()
                .map(|order| order.compare(left, right))
                .find(|ordering| *ordering != Ordering::Equal)
                .unwrap_or(Ordering::Equal)
        })
    }
}
