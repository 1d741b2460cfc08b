use crate::firestore::core::filter::Filter;
use crate::firestore::core::order_by::{Bound, OrderBy};
use crate::firestore::model::{DocumentKey, ResourcePath};

pub type TargetId = i32;

/// Normalised form of a query as registered with the backend.
///
/// Unlike a [`Query`](crate::firestore::core::Query), a target always carries
/// its full ordering (including the implicit key ordering) and never has a
/// limit-to-last; those are rewritten when the query is converted.
#[derive(Clone, Debug, PartialEq)]
pub struct Target {
    pub path: ResourcePath,
    pub collection_group: Option<String>,
    pub filters: Vec<Filter>,
    pub order_by: Vec<OrderBy>,
    pub limit: Option<u32>,
    pub start_at: Option<Bound>,
    pub end_at: Option<Bound>,
}

impl Target {
    /// Target listening to a single document.
    pub fn for_document(key: &DocumentKey) -> Self {
        Self {
            path: key.path().clone(),
            collection_group: None,
            filters: Vec::new(),
            order_by: Vec::new(),
            limit: None,
            start_at: None,
            end_at: None,
        }
    }

    pub fn is_document_target(&self) -> bool {
        DocumentKey::is_document_key(&self.path)
            && self.collection_group.is_none()
            && self.filters.is_empty()
    }

    /// Stable string identifying the target; equal targets share an id.
    pub fn canonical_id(&self) -> String {
        let mut id = self.path.canonical_string();
        if let Some(group) = &self.collection_group {
            id.push_str("|cg:");
            id.push_str(group);
        }
        id.push_str("|f:");
        id.push_str(
            &self
                .filters
                .iter()
                .map(Filter::canonical_id)
                .collect::<Vec<_>>()
                .join(","),
        );
        id.push_str("|ob:");
        id.push_str(
            &self
                .order_by
                .iter()
                .map(OrderBy::canonical_id)
                .collect::<Vec<_>>()
                .join(","),
        );
        if let Some(limit) = self.limit {
            id.push_str(&format!("|l:{limit}"));
        }
        if let Some(bound) = &self.start_at {
            id.push_str("|lb:");
            id.push_str(if bound.inclusive() { "b:" } else { "a:" });
            id.push_str(&bound.canonical_id());
        }
        if let Some(bound) = &self.end_at {
            id.push_str("|ub:");
            id.push_str(if bound.inclusive() { "a:" } else { "b:" });
            id.push_str(&bound.canonical_id());
        }
        id
    }
}
