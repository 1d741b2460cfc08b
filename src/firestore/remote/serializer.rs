use std::collections::BTreeMap;
use std::str::FromStr;

use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use base64::Engine;
use serde_json::{json, Value as JsonValue};

use crate::firestore::error::{invalid_argument, FirestoreResult};
use crate::firestore::local::TargetData;
use crate::firestore::model::{
    DatabaseId, DocumentKey, GeoPoint, MutableDocument, Mutation, MutationBatch, MutationKind,
    MutationResult, Precondition, ResourcePath, SnapshotVersion, Timestamp, TransformOperation,
};
use crate::firestore::remote::structured_query::encode_structured_query;
use crate::firestore::value::{BytesValue, FirestoreValue, MapValue, ValueKind};

/// Decoded reply on the write stream.
#[derive(Clone, Debug, PartialEq)]
pub struct WriteResponse {
    pub stream_token: Vec<u8>,
    /// `None` for the handshake reply.
    pub commit_version: Option<SnapshotVersion>,
    pub mutation_results: Vec<MutationResult>,
}

/// Converts between the client model and the JSON rendition of the
/// Firestore protos exchanged on the listen and write streams.
#[derive(Clone, Debug)]
pub struct JsonProtoSerializer {
    database_id: DatabaseId,
}

impl JsonProtoSerializer {
    pub fn new(database_id: DatabaseId) -> Self {
        Self { database_id }
    }

    pub fn database_id(&self) -> &DatabaseId {
        &self.database_id
    }

    pub fn database_name(&self) -> String {
        self.database_id.resource_name()
    }

    pub fn document_name(&self, key: &DocumentKey) -> String {
        self.resource_name(key.path())
    }

    fn resource_name(&self, path: &ResourcePath) -> String {
        if path.is_empty() {
            self.database_id.documents_root()
        } else {
            format!("{}/{}", self.database_id.documents_root(), path.canonical_string())
        }
    }

    pub fn document_key_from_name(&self, name: &str) -> FirestoreResult<DocumentKey> {
        let root = self.database_id.documents_root();
        let relative = name
            .strip_prefix(&root)
            .and_then(|rest| rest.strip_prefix('/'))
            .ok_or_else(|| {
                invalid_argument(format!(
                    "Tried to deserialize key from different project or database: {name}"
                ))
            })?;
        DocumentKey::from_string(relative)
    }

    /// Encodes the `addTarget` payload for `target_data`, resuming from its
    /// token or snapshot version when it has one.
    pub fn encode_target(&self, target_data: &TargetData) -> FirestoreResult<JsonValue> {
        let target = &target_data.target;
        let mut encoded = serde_json::Map::new();
        if target.is_document_target() {
            encoded.insert(
                "documents".to_string(),
                json!({ "documents": [self.resource_name(&target.path)] }),
            );
        } else {
            let (parent, structured_query) = encode_structured_query(self, target)?;
            encoded.insert(
                "query".to_string(),
                json!({ "parent": parent, "structuredQuery": structured_query }),
            );
        }
        encoded.insert("targetId".to_string(), json!(target_data.target_id));

        if !target_data.resume_token.is_empty() {
            encoded.insert(
                "resumeToken".to_string(),
                json!(BASE64_STANDARD.encode(&target_data.resume_token)),
            );
        } else if !target_data.snapshot_version.is_none() {
            encoded.insert(
                "readTime".to_string(),
                json!(self.encode_version(target_data.snapshot_version)),
            );
        }
        if let Some(expected_count) = target_data.expected_count {
            if !target_data.resume_token.is_empty() || !target_data.snapshot_version.is_none() {
                encoded.insert("expectedCount".to_string(), json!(expected_count));
            }
        }
        Ok(JsonValue::Object(encoded))
    }

    pub fn encode_listen_request(&self, target_data: &TargetData) -> FirestoreResult<JsonValue> {
        let mut request = json!({
            "database": self.database_name(),
            "addTarget": self.encode_target(target_data)?,
        });
        if let Some(label) = listen_request_label(target_data) {
            request["labels"] = json!({ "goog-listen-tags": label });
        }
        Ok(request)
    }

    pub fn encode_unlisten_request(&self, target_id: i32) -> JsonValue {
        json!({
            "database": self.database_name(),
            "removeTarget": target_id,
        })
    }

    /// First message on a fresh write stream.
    pub fn encode_write_handshake(&self) -> JsonValue {
        json!({ "database": self.database_name() })
    }

    pub fn encode_write_request(
        &self,
        stream_token: &[u8],
        batch: &MutationBatch,
    ) -> FirestoreResult<JsonValue> {
        let writes = batch
            .mutations
            .iter()
            .map(|mutation| self.encode_mutation(mutation))
            .collect::<FirestoreResult<Vec<_>>>()?;
        Ok(json!({
            "streamToken": BASE64_STANDARD.encode(stream_token),
            "writes": writes,
        }))
    }

    pub fn decode_write_response(&self, value: &JsonValue) -> FirestoreResult<WriteResponse> {
        let stream_token = value
            .get("streamToken")
            .and_then(JsonValue::as_str)
            .map(|token| {
                BASE64_STANDARD
                    .decode(token)
                    .map_err(|err| invalid_argument(format!("Invalid streamToken: {err}")))
            })
            .transpose()?
            .unwrap_or_default();

        let commit_version = value
            .get("commitTime")
            .and_then(JsonValue::as_str)
            .map(|time| self.decode_version(time))
            .transpose()?;

        let mut mutation_results = Vec::new();
        if let Some(results) = value.get("writeResults").and_then(JsonValue::as_array) {
            let commit = commit_version.ok_or_else(|| {
                invalid_argument("Received a write result without a commit time")
            })?;
            for result in results {
                mutation_results.push(self.decode_mutation_result(result, commit)?);
            }
        }

        Ok(WriteResponse {
            stream_token,
            commit_version,
            mutation_results,
        })
    }

    fn decode_mutation_result(
        &self,
        value: &JsonValue,
        commit_version: SnapshotVersion,
    ) -> FirestoreResult<MutationResult> {
        let mut version = value
            .get("updateTime")
            .and_then(JsonValue::as_str)
            .map(|time| self.decode_version(time))
            .transpose()?
            .unwrap_or(commit_version);
        // Deletes report no update time; they take the commit time.
        if version.is_none() {
            version = commit_version;
        }
        let transform_results = value
            .get("transformResults")
            .and_then(JsonValue::as_array)
            .map(|values| values.iter().map(decode_value).collect::<FirestoreResult<Vec<_>>>())
            .transpose()?
            .unwrap_or_default();
        Ok(MutationResult::new(version, transform_results))
    }

    pub fn encode_mutation(&self, mutation: &Mutation) -> FirestoreResult<JsonValue> {
        let mut write = serde_json::Map::new();
        let name = self.document_name(mutation.key());
        match mutation.kind() {
            MutationKind::Set { value } => {
                write.insert("update".to_string(), self.encode_document(&name, value)?);
            }
            MutationKind::Patch { data, mask } => {
                write.insert("update".to_string(), self.encode_document(&name, data)?);
                let paths: Vec<String> = mask.fields().map(|path| path.canonical_string()).collect();
                write.insert("updateMask".to_string(), json!({ "fieldPaths": paths }));
            }
            MutationKind::Delete => {
                write.insert("delete".to_string(), json!(name));
            }
            MutationKind::Verify => {
                write.insert("verify".to_string(), json!(name));
            }
        }

        if !mutation.field_transforms().is_empty() {
            let mut transforms = Vec::with_capacity(mutation.field_transforms().len());
            for transform in mutation.field_transforms() {
                let field_path = transform.field_path().canonical_string();
                let encoded = match transform.operation() {
                    TransformOperation::ServerTimestamp => json!({
                        "fieldPath": field_path,
                        "setToServerValue": "REQUEST_TIME"
                    }),
                    TransformOperation::ArrayUnion(elements) => json!({
                        "fieldPath": field_path,
                        "appendMissingElements": { "values": encode_values(elements)? }
                    }),
                    TransformOperation::ArrayRemove(elements) => json!({
                        "fieldPath": field_path,
                        "removeAllFromArray": { "values": encode_values(elements)? }
                    }),
                    TransformOperation::NumericIncrement(operand) => json!({
                        "fieldPath": field_path,
                        "increment": encode_value(operand)?
                    }),
                };
                transforms.push(encoded);
            }
            write.insert("updateTransforms".to_string(), JsonValue::Array(transforms));
        }

        match mutation.precondition() {
            Precondition::None => {}
            Precondition::Exists(exists) => {
                write.insert("currentDocument".to_string(), json!({ "exists": exists }));
            }
            Precondition::UpdateTime(version) => {
                write.insert(
                    "currentDocument".to_string(),
                    json!({ "updateTime": self.encode_version(*version) }),
                );
            }
        }
        Ok(JsonValue::Object(write))
    }

    fn encode_document(&self, name: &str, fields: &MapValue) -> FirestoreResult<JsonValue> {
        Ok(json!({
            "name": name,
            "fields": encode_map_fields(fields)?,
        }))
    }

    /// Decodes a `Document` message into a found document.
    pub fn decode_document(&self, value: &JsonValue) -> FirestoreResult<MutableDocument> {
        let name = value
            .get("name")
            .and_then(JsonValue::as_str)
            .ok_or_else(|| invalid_argument("Document missing name"))?;
        let key = self.document_key_from_name(name)?;
        let fields = decode_map_value(value)?;
        let version = value
            .get("updateTime")
            .and_then(JsonValue::as_str)
            .map(|time| self.decode_version(time))
            .transpose()?
            .ok_or_else(|| invalid_argument("Document missing updateTime"))?;
        Ok(MutableDocument::new_found_document(key, version, fields))
    }

    pub fn encode_value(&self, value: &FirestoreValue) -> FirestoreResult<JsonValue> {
        encode_value(value)
    }

    pub fn decode_value(&self, value: &JsonValue) -> FirestoreResult<FirestoreValue> {
        decode_value(value)
    }

    pub fn encode_version(&self, version: SnapshotVersion) -> String {
        version.timestamp().to_rfc3339()
    }

    pub fn decode_version(&self, value: &str) -> FirestoreResult<SnapshotVersion> {
        Timestamp::from_rfc3339(value).map(SnapshotVersion::new)
    }
}

fn listen_request_label(target_data: &TargetData) -> Option<&'static str> {
    use crate::firestore::local::TargetPurpose;
    match target_data.purpose {
        TargetPurpose::Listen => None,
        TargetPurpose::ExistenceFilterMismatch => Some("existence-filter-mismatch"),
        TargetPurpose::ExistenceFilterMismatchBloom => Some("existence-filter-mismatch-bloom"),
        TargetPurpose::LimboResolution => Some("limbo-document"),
    }
}

fn encode_values(values: &[FirestoreValue]) -> FirestoreResult<Vec<JsonValue>> {
    values.iter().map(encode_value).collect()
}

fn encode_map_fields(map: &MapValue) -> FirestoreResult<JsonValue> {
    let mut fields = serde_json::Map::new();
    for (key, value) in map.fields() {
        fields.insert(key.clone(), encode_value(value)?);
    }
    Ok(JsonValue::Object(fields))
}

pub(crate) fn encode_value(value: &FirestoreValue) -> FirestoreResult<JsonValue> {
    Ok(match value.kind() {
        ValueKind::Null => json!({ "nullValue": JsonValue::Null }),
        ValueKind::Boolean(boolean) => json!({ "booleanValue": boolean }),
        ValueKind::Integer(integer) => json!({ "integerValue": integer.to_string() }),
        ValueKind::Double(double) => {
            if double.is_finite() {
                json!({ "doubleValue": double })
            } else {
                json!({ "doubleValue": double.to_string() })
            }
        }
        ValueKind::Timestamp(timestamp) => json!({ "timestampValue": timestamp.to_rfc3339() }),
        ValueKind::String(string) => json!({ "stringValue": string }),
        ValueKind::Bytes(bytes) => json!({ "bytesValue": bytes.to_base64() }),
        ValueKind::Reference(reference) => json!({ "referenceValue": reference }),
        ValueKind::GeoPoint(point) => json!({
            "geoPointValue": {
                "latitude": point.latitude(),
                "longitude": point.longitude(),
            }
        }),
        ValueKind::Array(array) => json!({ "arrayValue": { "values": encode_values(array.values())? } }),
        ValueKind::Map(map) => json!({ "mapValue": { "fields": encode_map_fields(map)? } }),
        ValueKind::Sentinel(_) => {
            return Err(invalid_argument(
                "Sentinel values must be converted to field transforms before encoding",
            ))
        }
    })
}

fn decode_map_value(value: &JsonValue) -> FirestoreResult<MapValue> {
    let fields_object = match value.get("fields") {
        Some(fields) => fields
            .as_object()
            .ok_or_else(|| invalid_argument("Expected 'fields' to be an object"))?,
        None => return Ok(MapValue::empty()),
    };

    let mut fields = BTreeMap::new();
    for (key, value) in fields_object {
        fields.insert(key.clone(), decode_value(value)?);
    }
    Ok(MapValue::new(fields))
}

pub(crate) fn decode_value(value: &JsonValue) -> FirestoreResult<FirestoreValue> {
    let object = value
        .as_object()
        .ok_or_else(|| invalid_argument("Expected Firestore value object"))?;
    if object.contains_key("nullValue") {
        return Ok(FirestoreValue::null());
    }
    if let Some(bool_value) = object.get("booleanValue") {
        let value = bool_value
            .as_bool()
            .ok_or_else(|| invalid_argument("booleanValue must be bool"))?;
        return Ok(FirestoreValue::from_bool(value));
    }
    if let Some(integer_value) = object.get("integerValue") {
        let parsed = match integer_value {
            JsonValue::String(value) => i64::from_str(value)
                .map_err(|err| invalid_argument(format!("Invalid integerValue: {err}")))?,
            JsonValue::Number(number) => number
                .as_i64()
                .ok_or_else(|| invalid_argument("Integer out of range"))?,
            _ => return Err(invalid_argument("integerValue must be a string or number")),
        };
        return Ok(FirestoreValue::from_integer(parsed));
    }
    if let Some(double_value) = object.get("doubleValue") {
        let parsed = match double_value {
            JsonValue::Number(number) => number
                .as_f64()
                .ok_or_else(|| invalid_argument("Invalid doubleValue"))?,
            JsonValue::String(value) => value
                .parse::<f64>()
                .map_err(|err| invalid_argument(format!("Invalid doubleValue: {err}")))?,
            _ => return Err(invalid_argument("doubleValue must be a number or string")),
        };
        return Ok(FirestoreValue::from_double(parsed));
    }
    if let Some(timestamp_value) = object.get("timestampValue") {
        let timestamp = timestamp_value
            .as_str()
            .ok_or_else(|| invalid_argument("timestampValue must be string"))?;
        return Ok(FirestoreValue::from_timestamp(Timestamp::from_rfc3339(timestamp)?));
    }
    if let Some(string_value) = object.get("stringValue") {
        let value = string_value
            .as_str()
            .ok_or_else(|| invalid_argument("stringValue must be string"))?;
        return Ok(FirestoreValue::from_string(value));
    }
    if let Some(bytes_value) = object.get("bytesValue") {
        let encoded = bytes_value
            .as_str()
            .ok_or_else(|| invalid_argument("bytesValue must be base64 string"))?;
        let bytes = BytesValue::from_base64(encoded)?;
        return Ok(FirestoreValue::from_bytes(bytes));
    }
    if let Some(reference_value) = object.get("referenceValue") {
        let reference = reference_value
            .as_str()
            .ok_or_else(|| invalid_argument("referenceValue must be string"))?;
        return Ok(FirestoreValue::from_reference(reference));
    }
    if let Some(geo_point) = object.get("geoPointValue") {
        let latitude = geo_point
            .get("latitude")
            .and_then(JsonValue::as_f64)
            .unwrap_or_default();
        let longitude = geo_point
            .get("longitude")
            .and_then(JsonValue::as_f64)
            .unwrap_or_default();
        return Ok(FirestoreValue::from_geo_point(GeoPoint::new(latitude, longitude)?));
    }
    if let Some(array_value) = object.get("arrayValue") {
        let values = match array_value.get("values").and_then(JsonValue::as_array) {
            Some(entries) => entries
                .iter()
                .map(decode_value)
                .collect::<FirestoreResult<Vec<_>>>()?,
            None => Vec::new(),
        };
        return Ok(FirestoreValue::from_array(values));
    }
    if let Some(map_value) = object.get("mapValue") {
        return Ok(FirestoreValue::from_map_value(decode_map_value(map_value)?));
    }

    Err(invalid_argument("Unknown Firestore value type"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::firestore::core::{Query, Target};
    use crate::firestore::local::TargetPurpose;
    use crate::firestore::model::{FieldMask, FieldPath, FieldTransform};

    fn serializer() -> JsonProtoSerializer {
        JsonProtoSerializer::new(DatabaseId::default("project"))
    }

    fn key(path: &str) -> DocumentKey {
        DocumentKey::from_string(path).unwrap()
    }

    #[test]
    fn encodes_patch_with_mask_precondition_and_transforms() {
        let mut data = MapValue::empty();
        let field = FieldPath::from_dot_separated("name").unwrap();
        data.set_field(&field, FirestoreValue::from_string("Ada"));
        let mutation = Mutation::patch(key("rooms/a"), data, FieldMask::new(vec![field]))
            .with_field_transforms(vec![FieldTransform::new(
                FieldPath::from_dot_separated("updated").unwrap(),
                TransformOperation::ServerTimestamp,
            )]);

        let encoded = serializer().encode_mutation(&mutation).unwrap();
        assert_eq!(
            encoded["update"]["name"],
            "projects/project/databases/(default)/documents/rooms/a"
        );
        assert_eq!(encoded["update"]["fields"]["name"]["stringValue"], "Ada");
        assert_eq!(encoded["updateMask"]["fieldPaths"], json!(["name"]));
        assert_eq!(encoded["currentDocument"]["exists"], true);
        assert_eq!(
            encoded["updateTransforms"][0]["setToServerValue"],
            "REQUEST_TIME"
        );
    }

    #[test]
    fn document_names_must_belong_to_the_database() {
        let serializer = serializer();
        let name = serializer.document_name(&key("rooms/a"));
        assert_eq!(serializer.document_key_from_name(&name).unwrap(), key("rooms/a"));
        assert!(serializer
            .document_key_from_name("projects/other/databases/(default)/documents/rooms/a")
            .is_err());
    }

    #[test]
    fn write_results_default_to_commit_time() {
        let response = serializer()
            .decode_write_response(&json!({
                "streamToken": BASE64_STANDARD.encode(b"t2"),
                "commitTime": "2024-01-01T00:00:01Z",
                "writeResults": [
                    { "updateTime": "2024-01-01T00:00:00.5Z" },
                    {}
                ]
            }))
            .unwrap();
        assert_eq!(response.stream_token, b"t2".to_vec());
        let commit = response.commit_version.unwrap();
        assert_eq!(response.mutation_results[1].version, commit);
        assert!(response.mutation_results[0].version < commit);
    }

    #[test]
    fn resumed_targets_carry_token_and_expected_count() {
        let target = Query::new(ResourcePath::from_string("rooms").unwrap()).to_target();
        let data = TargetData::new(target, 2, TargetPurpose::Listen, 1)
            .with_resume_token(b"resume".to_vec(), SnapshotVersion::from_micros(5))
            .with_expected_count(Some(3));
        let encoded = serializer().encode_listen_request(&data).unwrap();
        let add = &encoded["addTarget"];
        assert_eq!(add["targetId"], 2);
        assert_eq!(add["resumeToken"], BASE64_STANDARD.encode(b"resume"));
        assert_eq!(add["expectedCount"], 3);
        assert_eq!(add["query"]["parent"], "projects/project/databases/(default)/documents");
        assert!(encoded.get("labels").is_none());

        let limbo = TargetData::new(
            Target::for_document(&key("rooms/a")),
            1,
            TargetPurpose::LimboResolution,
            0,
        );
        let encoded = serializer().encode_listen_request(&limbo).unwrap();
        assert_eq!(
            encoded["addTarget"]["documents"]["documents"][0],
            "projects/project/databases/(default)/documents/rooms/a"
        );
        assert_eq!(encoded["labels"]["goog-listen-tags"], "limbo-document");
    }
}
