use std::cmp::Ordering;

use crate::firestore::error::{invalid_argument, FirestoreResult};
use crate::firestore::model::{FieldPath, MutableDocument};
use crate::firestore::value::{FirestoreValue, ValueKind};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum FilterOperator {
    LessThan,
    LessThanOrEqual,
    Equal,
    NotEqual,
    GreaterThan,
    GreaterThanOrEqual,
    ArrayContains,
    ArrayContainsAny,
    In,
    NotIn,
}

impl FilterOperator {
    pub fn as_str(&self) -> &'static str {
        match self {
            FilterOperator::LessThan => "<",
            FilterOperator::LessThanOrEqual => "<=",
            FilterOperator::Equal => "==",
            FilterOperator::NotEqual => "!=",
            FilterOperator::GreaterThan => ">",
            FilterOperator::GreaterThanOrEqual => ">=",
            FilterOperator::ArrayContains => "array-contains",
            FilterOperator::ArrayContainsAny => "array-contains-any",
            FilterOperator::In => "in",
            FilterOperator::NotIn => "not-in",
        }
    }

    pub fn is_inequality(&self) -> bool {
        matches!(
            self,
            FilterOperator::LessThan
                | FilterOperator::LessThanOrEqual
                | FilterOperator::GreaterThan
                | FilterOperator::GreaterThanOrEqual
                | FilterOperator::NotEqual
                | FilterOperator::NotIn
        )
    }

    fn requires_array_operand(&self) -> bool {
        matches!(
            self,
            FilterOperator::ArrayContainsAny | FilterOperator::In | FilterOperator::NotIn
        )
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct FieldFilter {
    field: FieldPath,
    op: FilterOperator,
    value: FirestoreValue,
}

impl FieldFilter {
    pub fn new(field: FieldPath, op: FilterOperator, value: FirestoreValue) -> FirestoreResult<Self> {
        if op.requires_array_operand() && value.as_array().is_none() {
            return Err(invalid_argument(format!(
                "Invalid Query. A non-empty array is required for '{}' filters.",
                op.as_str()
            )));
        }
        if let Some(array) = value.as_array() {
            if op.requires_array_operand() && array.values().is_empty() {
                return Err(invalid_argument(format!(
                    "Invalid Query. A non-empty array is required for '{}' filters.",
                    op.as_str()
                )));
            }
        }
        if field.is_key_field()
            && !matches!(value.kind(), ValueKind::Reference(_) | ValueKind::Array(_))
        {
            return Err(invalid_argument(
                "Invalid Query. Filters on the document id require a document reference.",
            ));
        }
        Ok(Self { field, op, value })
    }

    pub fn field(&self) -> &FieldPath {
        &self.field
    }

    pub fn op(&self) -> FilterOperator {
        self.op
    }

    pub fn value(&self) -> &FirestoreValue {
        &self.value
    }

    pub fn is_inequality(&self) -> bool {
        self.op.is_inequality()
    }

    pub fn matches(&self, document: &MutableDocument) -> bool {
        let other = field_value(document, &self.field);
        match self.op {
            FilterOperator::ArrayContains => other
                .as_ref()
                .and_then(FirestoreValue::as_array)
                .map(|array| array.contains(&self.value))
                .unwrap_or(false),
            FilterOperator::ArrayContainsAny => {
                match (other.as_ref().and_then(FirestoreValue::as_array), self.value.as_array()) {
                    (Some(array), Some(needles)) => array.contains_any(needles),
                    _ => false,
                }
            }
            FilterOperator::In => self
                .value
                .as_array()
                .zip(other.as_ref())
                .map(|(needles, value)| needles.contains(value))
                .unwrap_or(false),
            FilterOperator::NotIn => {
                let Some(needles) = self.value.as_array() else {
                    return false;
                };
                if needles.contains(&FirestoreValue::null()) {
                    return false;
                }
                match other {
                    Some(value) => !value.is_null() && !needles.contains(&value),
                    None => false,
                }
            }
            FilterOperator::NotEqual => match other {
                Some(value) if !value.is_null() => {
                    self.matches_comparison(value.compare(&self.value))
                }
                _ => false,
            },
            _ => match other {
                Some(value) if value.type_order() == self.value.type_order() => {
                    self.matches_comparison(value.compare(&self.value))
                }
                _ => false,
            },
        }
    }

    fn matches_comparison(&self, ordering: Ordering) -> bool {
        match self.op {
            FilterOperator::LessThan => ordering == Ordering::Less,
            FilterOperator::LessThanOrEqual => ordering != Ordering::Greater,
            FilterOperator::Equal => ordering == Ordering::Equal,
            FilterOperator::NotEqual => ordering != Ordering::Equal,
            FilterOperator::GreaterThan => ordering == Ordering::Greater,
            FilterOperator::GreaterThanOrEqual => ordering != Ordering::Less,
            _ => false,
        }
    }

    fn canonical_id(&self) -> String {
        format!(
            "{}{}{}",
            self.field.canonical_string(),
            self.op.as_str(),
            self.value.canonical_id()
        )
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum CompositeOperator {
    And,
    Or,
}

#[derive(Clone, Debug, PartialEq)]
pub enum Filter {
    Field(FieldFilter),
    Composite {
        op: CompositeOperator,
        filters: Vec<Filter>,
    },
}

impl Filter {
    pub fn field(field: FieldPath, op: FilterOperator, value: FirestoreValue) -> FirestoreResult<Self> {
        FieldFilter::new(field, op, value).map(Filter::Field)
    }

    pub fn and(filters: Vec<Filter>) -> Self {
        Filter::Composite {
            op: CompositeOperator::And,
            filters,
        }
    }

    pub fn or(filters: Vec<Filter>) -> Self {
        Filter::Composite {
            op: CompositeOperator::Or,
            filters,
        }
    }

    pub fn matches(&self, document: &MutableDocument) -> bool {
        match self {
            Filter::Field(filter) => filter.matches(document),
            Filter::Composite {
                op: CompositeOperator::And,
                filters,
            } => filters.iter().all(|filter| filter.matches(document)),
            // An empty disjunction matches everything, like an empty conjunction.
            Filter::Composite {
                op: CompositeOperator::Or,
                filters,
            } => filters.is_empty() || filters.iter().any(|filter| filter.matches(document)),
        }
    }

    /// All field filters contained in this filter, depth first.
    pub fn flattened(&self) -> Vec<&FieldFilter> {
        match self {
            Filter::Field(filter) => vec![filter],
            Filter::Composite { filters, .. } => {
                filters.iter().flat_map(Filter::flattened).collect()
            }
        }
    }

    pub fn canonical_id(&self) -> String {
        match self {
            Filter::Field(filter) => filter.canonical_id(),
            Filter::Composite { op, filters } => {
                let children: Vec<String> = filters.iter().map(Filter::canonical_id).collect();
                let name = match op {
                    CompositeOperator::And => "and",
                    CompositeOperator::Or => "or",
                };
                format!("{name}({})", children.join(","))
            }
        }
    }
}

/// Reads `field` from `document`; the key field resolves to a reference.
pub(crate) fn field_value(document: &MutableDocument, field: &FieldPath) -> Option<FirestoreValue> {
    if field.is_key_field() {
        return Some(FirestoreValue::from_reference(
            document.key().path().canonical_string(),
        ));
    }
    document.field(field).cloned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::firestore::model::{DocumentKey, SnapshotVersion};
    use crate::firestore::value::MapValue;
    use std::collections::BTreeMap;

    fn doc(fields: &[(&str, FirestoreValue)]) -> MutableDocument {
        let data: BTreeMap<String, FirestoreValue> = fields
            .iter()
            .map(|(key, value)| (key.to_string(), value.clone()))
            .collect();
        MutableDocument::new_found_document(
            DocumentKey::from_string("cities/sf").unwrap(),
            SnapshotVersion::from_micros(1),
            MapValue::new(data),
        )
    }

    fn filter(field: &str, op: FilterOperator, value: FirestoreValue) -> Filter {
        Filter::field(FieldPath::from_dot_separated(field).unwrap(), op, value).unwrap()
    }

    #[test]
    fn comparisons_require_matching_type_order() {
        let document = doc(&[("population", FirestoreValue::from_integer(100))]);
        assert!(filter("population", FilterOperator::GreaterThan, FirestoreValue::from_double(50.5))
            .matches(&document));
        assert!(filter("population", FilterOperator::Equal, FirestoreValue::from_double(100.0))
            .matches(&document));
        assert!(!filter("population", FilterOperator::LessThan, FirestoreValue::from_string("z"))
            .matches(&document));
    }

    #[test]
    fn not_equal_and_not_in_skip_missing_fields() {
        let document = doc(&[("name", FirestoreValue::null())]);
        assert!(!filter("name", FilterOperator::NotEqual, FirestoreValue::from_string("x"))
            .matches(&document));
        assert!(!filter("missing", FilterOperator::NotEqual, FirestoreValue::from_string("x"))
            .matches(&document));
        let not_in = filter(
            "name",
            FilterOperator::NotIn,
            FirestoreValue::from_array(vec![FirestoreValue::from_string("x")]),
        );
        assert!(!not_in.matches(&document));
    }

    #[test]
    fn array_operators() {
        let document = doc(&[(
            "tags",
            FirestoreValue::from_array(vec![FirestoreValue::from_string("a")]),
        )]);
        assert!(filter("tags", FilterOperator::ArrayContains, FirestoreValue::from_string("a"))
            .matches(&document));
        assert!(filter(
            "tags",
            FilterOperator::ArrayContainsAny,
            FirestoreValue::from_array(vec![
                FirestoreValue::from_string("b"),
                FirestoreValue::from_string("a"),
            ])
        )
        .matches(&document));
        let err = Filter::field(
            FieldPath::from_dot_separated("tags").unwrap(),
            FilterOperator::In,
            FirestoreValue::from_string("a"),
        )
        .unwrap_err();
        assert_eq!(err.code_str(), "firestore/invalid-argument");
    }

    #[test]
    fn composite_filters() {
        let document = doc(&[("a", FirestoreValue::from_integer(1))]);
        let or = Filter::or(vec![
            filter("a", FilterOperator::Equal, FirestoreValue::from_integer(2)),
            filter("a", FilterOperator::Equal, FirestoreValue::from_integer(1)),
        ]);
        assert!(or.matches(&document));
        let and = Filter::and(vec![
            or.clone(),
            filter("a", FilterOperator::GreaterThan, FirestoreValue::from_integer(1)),
        ]);
        assert!(!and.matches(&document));
        assert_eq!(and.flattened().len(), 3);
        assert!(and.canonical_id().starts_with("and(or("));
    }

    #[test]
    fn key_field_filters_compare_references() {
        let document = doc(&[]);
        let by_key = Filter::field(
            FieldPath::document_id(),
            FilterOperator::Equal,
            FirestoreValue::from_reference("cities/sf"),
        )
        .unwrap();
        assert!(by_key.matches(&document));
    }
}
