use std::cmp::Ordering;

use crate::firestore::core::filter::field_value;
use crate::firestore::model::{FieldPath, MutableDocument};
use crate::firestore::value::FirestoreValue;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Direction {
    Ascending,
    Descending,
}

impl Direction {
    pub fn reversed(self) -> Self {
        match self {
            Direction::Ascending => Direction::Descending,
            Direction::Descending => Direction::Ascending,
        }
    }

    fn apply(self, ordering: Ordering) -> Ordering {
        match self {
            Direction::Ascending => ordering,
            Direction::Descending => ordering.reverse(),
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct OrderBy {
    field: FieldPath,
    direction: Direction,
}

impl OrderBy {
    pub fn new(field: FieldPath, direction: Direction) -> Self {
        Self { field, direction }
    }

    pub fn field(&self) -> &FieldPath {
        &self.field
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    pub fn reversed(&self) -> Self {
        Self::new(self.field.clone(), self.direction.reversed())
    }

    pub fn compare(&self, left: &MutableDocument, right: &MutableDocument) -> Ordering {
        let ordering = if self.field.is_key_field() {
            left.key().cmp(right.key())
        } else {
            let left_value = left.field(&self.field).cloned().unwrap_or_else(FirestoreValue::null);
            let right_value = right.field(&self.field).cloned().unwrap_or_else(FirestoreValue::null);
            left_value.compare(&right_value)
        };
        self.direction.apply(ordering)
    }

    pub(crate) fn canonical_id(&self) -> String {
        let direction = match self.direction {
            Direction::Ascending => "asc",
            Direction::Descending => "desc",
        };
        format!("{}{direction}", self.field.canonical_string())
    }
}

/// Cursor position over the ordered fields of a query.
#[derive(Clone, Debug, PartialEq)]
pub struct Bound {
    position: Vec<FirestoreValue>,
    inclusive: bool,
}

impl Bound {
    pub fn new(position: Vec<FirestoreValue>, inclusive: bool) -> Self {
        Self {
            position,
            inclusive,
        }
    }

    pub fn position(&self) -> &[FirestoreValue] {
        &self.position
    }

    pub fn inclusive(&self) -> bool {
        self.inclusive
    }

    fn compare_to_document(&self, order_by: &[OrderBy], document: &MutableDocument) -> Ordering {
        for (component, order) in self.position.iter().zip(order_by) {
            let doc_value =
                field_value(document, order.field()).unwrap_or_else(FirestoreValue::null);
            let ordering = order.direction.apply(component.compare(&doc_value));
            if ordering != Ordering::Equal {
                return ordering;
            }
        }
        Ordering::Equal
    }

    /// Whether the bound, used as a start cursor, admits `document`.
    pub fn sorts_before_document(&self, order_by: &[OrderBy], document: &MutableDocument) -> bool {
        let ordering = self.compare_to_document(order_by, document);
        if self.inclusive {
            ordering != Ordering::Greater
        } else {
            ordering == Ordering::Less
        }
    }

    /// Whether the bound, used as an end cursor, admits `document`.
    pub fn sorts_after_document(&self, order_by: &[OrderBy], document: &MutableDocument) -> bool {
        let ordering = self.compare_to_document(order_by, document);
        if self.inclusive {
            ordering != Ordering::Less
        } else {
            ordering == Ordering::Greater
        }
    }

    pub(crate) fn canonical_id(&self) -> String {
        let values: Vec<String> = self.position.iter().map(FirestoreValue::canonical_id).collect();
        values.join(",")
    }
}
