use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use base64::Engine;
use serde::Deserialize;
use serde_json::Value as JsonValue;

use crate::firestore::constants::LOG_TAG_REMOTE;
use crate::firestore::core::TargetId;
use crate::firestore::error::{
    internal_error, invalid_argument, map_rpc_status, FirestoreError, FirestoreResult,
};
use crate::firestore::model::{DocumentKey, MutableDocument, SnapshotVersion};
use crate::firestore::remote::bloom_filter::BloomFilter;
use crate::firestore::remote::serializer::JsonProtoSerializer;

/// One decoded `ListenResponse` frame.
#[derive(Debug, Clone, PartialEq)]
pub enum WatchChange {
    TargetChange(WatchTargetChange),
    /// Covers `documentChange`, `documentDelete` and `documentRemove`.
    Document(DocumentWatchChange),
    ExistenceFilter(ExistenceFilterChange),
}

#[derive(Debug, Clone, PartialEq)]
pub struct WatchTargetChange {
    pub state: TargetChangeState,
    /// Empty means the change applies to every active target.
    pub target_ids: Vec<TargetId>,
    pub resume_token: Vec<u8>,
    pub read_time: SnapshotVersion,
    pub cause: Option<FirestoreError>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TargetChangeState {
    NoChange,
    Add,
    Remove,
    Current,
    Reset,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DocumentWatchChange {
    pub updated_target_ids: Vec<TargetId>,
    pub removed_target_ids: Vec<TargetId>,
    pub key: DocumentKey,
    /// Found document for a change, a no-document for a delete, and `None`
    /// when the document merely left the targets.
    pub new_document: Option<MutableDocument>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ExistenceFilterChange {
    pub target_id: TargetId,
    pub count: i32,
    pub bloom_filter: Option<BloomFilter>,
}

#[derive(Debug, Deserialize)]
struct StatusCause {
    #[serde(default)]
    code: i32,
    #[serde(default)]
    message: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct UnchangedNames {
    #[serde(default)]
    bits: Option<BitSequence>,
    #[serde(default)]
    hash_count: u32,
}

#[derive(Debug, Deserialize)]
struct BitSequence {
    #[serde(default)]
    bitmap: String,
    #[serde(default)]
    padding: u32,
}

/// Decodes a listen response. Frames with no recognised payload decode to
/// `None`.
pub fn decode_watch_change(
    serializer: &JsonProtoSerializer,
    value: &JsonValue,
) -> FirestoreResult<Option<WatchChange>> {
    if let Some(target_change) = value.get("targetChange") {
        return decode_target_change(serializer, target_change).map(Some);
    }
    if let Some(document_change) = value.get("documentChange") {
        return decode_document_change(serializer, document_change).map(Some);
    }
    if let Some(document_delete) = value.get("documentDelete") {
        return decode_document_delete(serializer, document_delete).map(Some);
    }
    if let Some(document_remove) = value.get("documentRemove") {
        return decode_document_remove(serializer, document_remove).map(Some);
    }
    if let Some(filter) = value.get("filter") {
        return decode_filter_change(filter).map(Some);
    }
    Ok(None)
}

fn decode_target_change(
    serializer: &JsonProtoSerializer,
    value: &JsonValue,
) -> FirestoreResult<WatchChange> {
    let target_ids = numeric_array(value.get("targetIds"));

    let resume_token = value
        .get("resumeToken")
        .and_then(JsonValue::as_str)
        .map(|token| {
            BASE64_STANDARD
                .decode(token)
                .map_err(|err| invalid_argument(format!("Invalid resumeToken: {err}")))
        })
        .transpose()?
        .unwrap_or_default();

    let read_time = read_time(serializer, value)?;

    let state = value
        .get("targetChangeType")
        .and_then(JsonValue::as_str)
        .map(target_state_from_str)
        .unwrap_or(TargetChangeState::NoChange);

    let cause = value
        .get("cause")
        .map(|cause| serde_json::from_value::<StatusCause>(cause.clone()))
        .transpose()
        .map_err(|err| internal_error(format!("Failed to decode watch cause: {err}")))?
        .filter(|cause| cause.code != 0)
        .map(|cause| map_rpc_status(cause.code, cause.message));

    Ok(WatchChange::TargetChange(WatchTargetChange {
        state,
        target_ids,
        resume_token,
        read_time,
        cause,
    }))
}

fn decode_document_change(
    serializer: &JsonProtoSerializer,
    value: &JsonValue,
) -> FirestoreResult<WatchChange> {
    let document = value
        .get("document")
        .ok_or_else(|| invalid_argument("documentChange missing document"))?;
    let document = serializer.decode_document(document)?;
    Ok(WatchChange::Document(DocumentWatchChange {
        updated_target_ids: numeric_array(value.get("targetIds")),
        removed_target_ids: numeric_array(value.get("removedTargetIds")),
        key: document.key().clone(),
        new_document: Some(document),
    }))
}

fn decode_document_delete(
    serializer: &JsonProtoSerializer,
    value: &JsonValue,
) -> FirestoreResult<WatchChange> {
    let key = document_key(serializer, value, "documentDelete")?;
    let version = read_time(serializer, value)?;
    Ok(WatchChange::Document(DocumentWatchChange {
        updated_target_ids: Vec::new(),
        removed_target_ids: numeric_array(value.get("removedTargetIds")),
        new_document: Some(MutableDocument::new_no_document(key.clone(), version)),
        key,
    }))
}

fn decode_document_remove(
    serializer: &JsonProtoSerializer,
    value: &JsonValue,
) -> FirestoreResult<WatchChange> {
    let key = document_key(serializer, value, "documentRemove")?;
    Ok(WatchChange::Document(DocumentWatchChange {
        updated_target_ids: Vec::new(),
        removed_target_ids: numeric_array(value.get("removedTargetIds")),
        key,
        new_document: None,
    }))
}

fn decode_filter_change(value: &JsonValue) -> FirestoreResult<WatchChange> {
    let target_id = value
        .get("targetId")
        .and_then(JsonValue::as_i64)
        .ok_or_else(|| invalid_argument("filter missing targetId"))? as TargetId;
    let count = value.get("count").and_then(JsonValue::as_i64).unwrap_or(0) as i32;

    // A malformed bloom filter is dropped; the full re-query path still
    // resolves the mismatch.
    let bloom_filter = value
        .get("unchangedNames")
        .and_then(|names| serde_json::from_value::<UnchangedNames>(names.clone()).ok())
        .and_then(|names| {
            let bits = names.bits?;
            match BloomFilter::from_base64(&bits.bitmap, bits.padding, names.hash_count) {
                Ok(filter) => Some(filter),
                Err(err) => {
                    log::warn!(
                        target: LOG_TAG_REMOTE,
                        "Ignoring invalid bloom filter for target {target_id}: {err}"
                    );
                    None
                }
            }
        });

    Ok(WatchChange::ExistenceFilter(ExistenceFilterChange {
        target_id,
        count,
        bloom_filter,
    }))
}

fn document_key(
    serializer: &JsonProtoSerializer,
    value: &JsonValue,
    frame: &str,
) -> FirestoreResult<DocumentKey> {
    let name = value
        .get("document")
        .and_then(JsonValue::as_str)
        .ok_or_else(|| invalid_argument(format!("{frame} missing document")))?;
    serializer.document_key_from_name(name)
}

fn read_time(serializer: &JsonProtoSerializer, value: &JsonValue) -> FirestoreResult<SnapshotVersion> {
    Ok(value
        .get("readTime")
        .and_then(JsonValue::as_str)
        .map(|timestamp| serializer.decode_version(timestamp))
        .transpose()?
        .unwrap_or_else(SnapshotVersion::none))
}

fn numeric_array(value: Option<&JsonValue>) -> Vec<TargetId> {
    value
        .and_then(JsonValue::as_array)
        .map(|entries| {
            entries
                .iter()
                .filter_map(|entry| entry.as_i64().map(|value| value as TargetId))
                .collect::<Vec<_>>()
        })
        .unwrap_or_default()
}

fn target_state_from_str(value: &str) -> TargetChangeState {
    match value {
        "ADD" => TargetChangeState::Add,
        "REMOVE" => TargetChangeState::Remove,
        "CURRENT" => TargetChangeState::Current,
        "RESET" => TargetChangeState::Reset,
        _ => TargetChangeState::NoChange,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::firestore::error::FirestoreErrorCode;
    use crate::firestore::model::DatabaseId;
    use serde_json::json;

    fn serializer() -> JsonProtoSerializer {
        JsonProtoSerializer::new(DatabaseId::new("project", "(default)"))
    }

    #[test]
    fn decodes_target_change() {
        let change = json!({
            "targetChange": {
                "targetIds": [1, 2],
                "resumeToken": BASE64_STANDARD.encode([1u8, 2, 3]),
                "targetChangeType": "CURRENT"
            }
        });

        let decoded = decode_watch_change(&serializer(), &change).unwrap().unwrap();
        match decoded {
            WatchChange::TargetChange(change) => {
                assert_eq!(change.target_ids, vec![1, 2]);
                assert_eq!(change.resume_token, vec![1, 2, 3]);
                assert_eq!(change.state, TargetChangeState::Current);
                assert!(change.read_time.is_none());
                assert!(change.cause.is_none());
            }
            other => panic!("unexpected change: {other:?}"),
        }
    }

    #[test]
    fn decodes_target_removal_cause() {
        let change = json!({
            "targetChange": {
                "targetIds": [4],
                "targetChangeType": "REMOVE",
                "cause": { "code": 7, "message": "denied" }
            }
        });
        let Some(WatchChange::TargetChange(change)) =
            decode_watch_change(&serializer(), &change).unwrap()
        else {
            panic!("expected target change");
        };
        assert_eq!(change.cause.unwrap().code, FirestoreErrorCode::PermissionDenied);
    }

    #[test]
    fn decodes_document_frames() {
        let name = "projects/project/databases/(default)/documents/rooms/a";
        let change = json!({
            "documentChange": {
                "document": {
                    "name": name,
                    "fields": { "n": { "integerValue": "1" } },
                    "updateTime": "2024-01-01T00:00:00Z"
                },
                "targetIds": [2]
            }
        });
        let Some(WatchChange::Document(change)) =
            decode_watch_change(&serializer(), &change).unwrap()
        else {
            panic!("expected document change");
        };
        assert_eq!(change.updated_target_ids, vec![2]);
        assert!(change.new_document.unwrap().is_found_document());

        let delete = json!({
            "documentDelete": { "document": name, "removedTargetIds": [2] }
        });
        let Some(WatchChange::Document(delete)) =
            decode_watch_change(&serializer(), &delete).unwrap()
        else {
            panic!("expected document delete");
        };
        assert!(delete.new_document.unwrap().is_no_document());

        let remove = json!({ "documentRemove": { "document": name, "removedTargetIds": [2] } });
        let Some(WatchChange::Document(remove)) =
            decode_watch_change(&serializer(), &remove).unwrap()
        else {
            panic!("expected document remove");
        };
        assert!(remove.new_document.is_none());
    }

    #[test]
    fn decodes_existence_filter_with_bloom_filter() {
        let mut bloom = BloomFilter::with_capacity(64, 3).unwrap();
        bloom.insert("x");
        let frame = json!({
            "filter": {
                "targetId": 3,
                "count": 2,
                "unchangedNames": {
                    "bits": { "bitmap": bloom.bitmap_base64(), "padding": bloom.padding() },
                    "hashCount": 3
                }
            }
        });
        let Some(WatchChange::ExistenceFilter(filter)) =
            decode_watch_change(&serializer(), &frame).unwrap()
        else {
            panic!("expected existence filter");
        };
        assert_eq!(filter.count, 2);
        assert_eq!(filter.bloom_filter, Some(bloom));
    }
}
