use std::collections::BTreeSet;

use crate::firestore::core::document_set::DocumentSet;
use crate::firestore::core::query::LimitType;
use crate::firestore::core::Query;
use crate::firestore::local::local_documents_view::LocalDocumentsView;
use crate::firestore::local::remote_document_cache::DocumentMap;
use crate::firestore::model::{DocumentKey, SnapshotVersion};

/// Runs queries against the local cache.
///
/// When the previous result of a target is known (its remote keys and the
/// last snapshot version at which it had no limbo documents), only the
/// documents changed since then are rescanned. Otherwise the whole
/// collection is scanned.
#[derive(Clone, Copy, Debug, Default)]
pub struct QueryEngine;

impl QueryEngine {
    pub fn new() -> Self {
        Self
    }

    pub fn get_documents_matching_query(
        &self,
        view: &LocalDocumentsView<'_>,
        query: &Query,
        last_limbo_free_snapshot_version: SnapshotVersion,
        remote_keys: &BTreeSet<DocumentKey>,
    ) -> DocumentMap {
        if query.matches_all_documents() || last_limbo_free_snapshot_version.is_none() {
            return self.full_collection_scan(view, query);
        }

        let previous = view.get_documents(remote_keys);
        let mut previous_results = DocumentSet::new(query.comparator());
        for document in previous.into_values() {
            if query.matches(&document) {
                previous_results.insert(document);
            }
        }

        if query.has_limit()
            && needs_refill(
                query,
                &previous_results,
                remote_keys,
                last_limbo_free_snapshot_version,
            )
        {
            return self.full_collection_scan(view, query);
        }

        log::debug!(
            target: crate::firestore::constants::LOG_TAG_LOCAL,
            "Re-using previous result from {last_limbo_free_snapshot_version} to execute query: {}",
            query.canonical_id()
        );

        let mut results = view.get_documents_matching_query(query, last_limbo_free_snapshot_version);
        for document in previous_results.iter() {
            results
                .entry(document.key().clone())
                .or_insert_with(|| document.clone());
        }
        results
    }

    fn full_collection_scan(&self, view: &LocalDocumentsView<'_>, query: &Query) -> DocumentMap {
        log::debug!(
            target: crate::firestore::constants::LOG_TAG_LOCAL,
            "Using full collection scan to execute query: {}",
            query.canonical_id()
        );
        view.get_documents_matching_query(query, SnapshotVersion::none())
    }
}

/// A limit query must be rescanned when its previous result lost documents
/// or the document at the limit edge changed since the limbo-free version.
fn needs_refill(
    query: &Query,
    sorted_previous_results: &DocumentSet,
    remote_keys: &BTreeSet<DocumentKey>,
    limbo_free_snapshot_version: SnapshotVersion,
) -> bool {
    if remote_keys.len() != sorted_previous_results.len() {
        return true;
    }
    let edge = match query.limit_type() {
        LimitType::First => sorted_previous_results.last(),
        LimitType::Last => sorted_previous_results.first(),
    };
    match edge {
        Some(document) => {
            document.has_pending_writes() || document.version() > limbo_free_snapshot_version
        }
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::firestore::core::filter::{Filter, FilterOperator};
    use crate::firestore::local::overlay::OverlayIndex;
    use crate::firestore::local::remote_document_cache::MemoryRemoteDocumentCache;
    use crate::firestore::model::{FieldPath, MutableDocument, ResourcePath};
    use crate::firestore::value::{FirestoreValue, MapValue};
    use std::collections::BTreeMap;

    fn doc(id: &str, version: i64, matches: bool) -> MutableDocument {
        MutableDocument::new_found_document(
            DocumentKey::from_string(&format!("rooms/{id}")).unwrap(),
            SnapshotVersion::from_micros(version),
            MapValue::new(BTreeMap::from([(
                "open".to_string(),
                FirestoreValue::from_bool(matches),
            )])),
        )
    }

    fn open_rooms() -> Query {
        Query::new(ResourcePath::from_string("rooms").unwrap()).with_filter(
            Filter::field(
                FieldPath::from_dot_separated("open").unwrap(),
                FilterOperator::Equal,
                FirestoreValue::from_bool(true),
            )
            .unwrap(),
        )
    }

    #[test]
    fn reuses_previous_results_and_scans_newer_documents() {
        let mut remote = MemoryRemoteDocumentCache::new();
        let a = doc("a", 1, true);
        remote.add(a.clone(), SnapshotVersion::from_micros(1));
        // Written after the limbo-free version; picked up by the read-time scan.
        remote.add(doc("b", 5, true), SnapshotVersion::from_micros(5));
        // Old document outside the target; must not be rediscovered.
        remote.add(doc("c", 1, true), SnapshotVersion::from_micros(1));

        let overlays = OverlayIndex::new();
        let view = LocalDocumentsView::new(&remote, &overlays);
        let remote_keys = BTreeSet::from([a.key().clone()]);
        let results = QueryEngine::new().get_documents_matching_query(
            &view,
            &open_rooms(),
            SnapshotVersion::from_micros(2),
            &remote_keys,
        );
        let ids: Vec<&str> = results.keys().map(DocumentKey::id).collect();
        assert_eq!(ids, vec!["a", "b"]);
    }

    #[test]
    fn falls_back_to_full_scan_without_limbo_free_version() {
        let mut remote = MemoryRemoteDocumentCache::new();
        remote.add(doc("a", 1, true), SnapshotVersion::from_micros(1));
        remote.add(doc("b", 1, false), SnapshotVersion::from_micros(1));
        let overlays = OverlayIndex::new();
        let view = LocalDocumentsView::new(&remote, &overlays);
        let results = QueryEngine::new().get_documents_matching_query(
            &view,
            &open_rooms(),
            SnapshotVersion::none(),
            &BTreeSet::new(),
        );
        assert_eq!(results.len(), 1);
    }

    #[test]
    fn limit_query_refills_when_previous_result_shrank() {
        let mut remote = MemoryRemoteDocumentCache::new();
        let a = doc("a", 1, false);
        remote.add(a.clone(), SnapshotVersion::from_micros(1));
        remote.add(doc("b", 1, true), SnapshotVersion::from_micros(1));
        let overlays = OverlayIndex::new();
        let view = LocalDocumentsView::new(&remote, &overlays);
        let results = QueryEngine::new().get_documents_matching_query(
            &view,
            &open_rooms().with_limit_to_first(1),
            SnapshotVersion::from_micros(1),
            &BTreeSet::from([a.key().clone()]),
        );
        let ids: Vec<&str> = results.keys().map(DocumentKey::id).collect();
        assert_eq!(ids, vec!["b"]);
    }
}
