use serde_json::{json, Value as JsonValue};

use crate::firestore::core::{Bound, CompositeOperator, Direction, FieldFilter, Filter, FilterOperator, Target};
use crate::firestore::error::{invalid_argument, FirestoreResult};
use crate::firestore::remote::serializer::{encode_value, JsonProtoSerializer};

/// Encodes a query target as `(parent, structuredQuery)`.
pub(crate) fn encode_structured_query(
    serializer: &JsonProtoSerializer,
    target: &Target,
) -> FirestoreResult<(String, JsonValue)> {
    let root = serializer.database_id().documents_root();
    let mut structured = serde_json::Map::new();

    let (parent_path, collection_id, all_descendants) = match &target.collection_group {
        Some(group) => (target.path.clone(), group.clone(), true),
        None => {
            let collection_id = target
                .path
                .last_segment()
                .ok_or_else(|| invalid_argument("Query target has no collection"))?
                .to_string();
            (target.path.without_last(), collection_id, false)
        }
    };
    let parent = if parent_path.is_empty() {
        root
    } else {
        format!("{root}/{}", parent_path.canonical_string())
    };

    structured.insert(
        "from".to_string(),
        json!([{ "collectionId": collection_id, "allDescendants": all_descendants }]),
    );

    match target.filters.len() {
        0 => {}
        1 => {
            structured.insert("where".to_string(), encode_filter(&target.filters[0])?);
        }
        _ => {
            let nested = target
                .filters
                .iter()
                .map(encode_filter)
                .collect::<FirestoreResult<Vec<_>>>()?;
            structured.insert(
                "where".to_string(),
                json!({ "compositeFilter": { "op": "AND", "filters": nested } }),
            );
        }
    }

    if !target.order_by.is_empty() {
        let orders: Vec<_> = target
            .order_by
            .iter()
            .map(|order| {
                json!({
                    "field": { "fieldPath": order.field().canonical_string() },
                    "direction": match order.direction() {
                        Direction::Ascending => "ASCENDING",
                        Direction::Descending => "DESCENDING",
                    },
                })
            })
            .collect();
        structured.insert("orderBy".to_string(), JsonValue::Array(orders));
    }

    if let Some(limit) = target.limit {
        structured.insert("limit".to_string(), json!(limit));
    }
    if let Some(start) = &target.start_at {
        structured.insert("startAt".to_string(), encode_cursor(start, true)?);
    }
    if let Some(end) = &target.end_at {
        structured.insert("endAt".to_string(), encode_cursor(end, false)?);
    }

    Ok((parent, JsonValue::Object(structured)))
}

fn encode_filter(filter: &Filter) -> FirestoreResult<JsonValue> {
    match filter {
        Filter::Field(field_filter) => encode_field_filter(field_filter),
        Filter::Composite { op, filters } => {
            let nested = filters
                .iter()
                .map(encode_filter)
                .collect::<FirestoreResult<Vec<_>>>()?;
            let op = match op {
                CompositeOperator::And => "AND",
                CompositeOperator::Or => "OR",
            };
            Ok(json!({ "compositeFilter": { "op": op, "filters": nested } }))
        }
    }
}

fn encode_field_filter(filter: &FieldFilter) -> FirestoreResult<JsonValue> {
    let field = json!({ "fieldPath": filter.field().canonical_string() });
    // Equality against null or NaN is sent as a unary filter.
    if matches!(filter.op(), FilterOperator::Equal | FilterOperator::NotEqual) {
        let negated = filter.op() == FilterOperator::NotEqual;
        let unary = if filter.value().is_null() {
            Some(if negated { "IS_NOT_NULL" } else { "IS_NULL" })
        } else if filter.value().is_nan() {
            Some(if negated { "IS_NOT_NAN" } else { "IS_NAN" })
        } else {
            None
        };
        if let Some(op) = unary {
            return Ok(json!({ "unaryFilter": { "field": field, "op": op } }));
        }
    }
    Ok(json!({
        "fieldFilter": {
            "field": field,
            "op": operator_name(filter.op()),
            "value": encode_value(filter.value())?,
        }
    }))
}

fn operator_name(op: FilterOperator) -> &'static str {
    match op {
        FilterOperator::LessThan => "LESS_THAN",
        FilterOperator::LessThanOrEqual => "LESS_THAN_OR_EQUAL",
        FilterOperator::Equal => "EQUAL",
        FilterOperator::NotEqual => "NOT_EQUAL",
        FilterOperator::GreaterThan => "GREATER_THAN",
        FilterOperator::GreaterThanOrEqual => "GREATER_THAN_OR_EQUAL",
        FilterOperator::ArrayContains => "ARRAY_CONTAINS",
        FilterOperator::ArrayContainsAny => "ARRAY_CONTAINS_ANY",
        FilterOperator::In => "IN",
        FilterOperator::NotIn => "NOT_IN",
    }
}

fn encode_cursor(bound: &Bound, start: bool) -> FirestoreResult<JsonValue> {
    let values = bound
        .position()
        .iter()
        .map(encode_value)
        .collect::<FirestoreResult<Vec<_>>>()?;
    Ok(json!({
        "values": values,
        "before": if start { bound.inclusive() } else { !bound.inclusive() },
    }))
}
