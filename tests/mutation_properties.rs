use std::collections::BTreeMap;

use firebase_sync_rs::firestore::local::overlay::OverlayIndex;
use firebase_sync_rs::firestore::model::{
    DocumentKey, FieldMask, FieldPath, MutableDocument, Mutation, MutationBatch, SnapshotVersion, Timestamp,
};
use firebase_sync_rs::firestore::value::{FirestoreValue, MapValue};
use proptest::prelude::*;

const FIELDS: [&str; 3] = ["a", "b", "c"];

#[derive(Clone, Debug)]
enum Op {
    Set(BTreeMap<String, i64>),
    Patch(BTreeMap<String, i64>),
    Delete,
}

fn fields_strategy() -> impl Strategy<Value = BTreeMap<String, i64>> {
    prop::collection::btree_map(prop::sample::select(FIELDS.to_vec()), -5i64..5, 0..=FIELDS.len())
        .prop_map(|fields| fields.into_iter().map(|(name, value)| (name.to_string(), value)).collect())
}

fn op_strategy() -> impl Strategy<Value = Op> {
    prop_oneof![
        fields_strategy().prop_map(Op::Set),
        fields_strategy().prop_map(Op::Patch),
        Just(Op::Delete),
    ]
}

fn key() -> DocumentKey {
    DocumentKey::from_string("rooms/a").unwrap()
}

fn map_value(fields: &BTreeMap<String, i64>) -> MapValue {
    MapValue::new(
        fields
            .iter()
            .map(|(name, value)| (name.clone(), FirestoreValue::from_integer(*value)))
            .collect(),
    )
}

fn to_mutation(op: &Op) -> Mutation {
    match op {
        Op::Set(fields) => Mutation::set(key(), map_value(fields)),
        Op::Patch(fields) => Mutation::patch(
            key(),
            map_value(fields),
            FieldMask::new(fields.keys().map(|name| FieldPath::from_dot_separated(name).unwrap())),
        ),
        Op::Delete => Mutation::delete(key()),
    }
}

/// Reference semantics: `None` means the document does not exist.
fn expected_state(start: Option<BTreeMap<String, i64>>, ops: &[Op]) -> Option<BTreeMap<String, i64>> {
    ops.iter().fold(start, |state, op| match op {
        Op::Set(fields) => Some(fields.clone()),
        Op::Patch(fields) => state.map(|mut current| {
            current.extend(fields.iter().map(|(name, value)| (name.clone(), *value)));
            current
        }),
        Op::Delete => None,
    })
}

fn base_document(start: &Option<BTreeMap<String, i64>>) -> MutableDocument {
    let version = SnapshotVersion::new(Timestamp::new(1, 0));
    match start {
        Some(fields) => MutableDocument::new_found_document(key(), version, map_value(fields)),
        None => MutableDocument::new_no_document(key(), version),
    }
}

fn assert_matches(document: &MutableDocument, expected: &Option<BTreeMap<String, i64>>) {
    match expected {
        Some(fields) => {
            assert!(document.is_found_document());
            assert_eq!(document.data(), &map_value(fields));
        }
        None => assert!(!document.is_found_document()),
    }
}

proptest! {
    #[test]
    fn local_view_follows_last_writer_semantics(
        start in prop::option::of(fields_strategy()),
        ops in prop::collection::vec(op_strategy(), 0..12),
    ) {
        let mut document = base_document(&start);
        let write_time = Timestamp::new(2, 0);
        let mut mask = Some(FieldMask::empty());
        for op in &ops {
            mask = to_mutation(op).apply_to_local_view(&mut document, mask, write_time);
        }
        assert_matches(&document, &expected_state(start.clone(), &ops));
        if ops.is_empty() {
            prop_assert!(!document.has_local_mutations());
        }
    }

    #[test]
    fn batching_does_not_change_the_local_view(
        start in prop::option::of(fields_strategy()),
        ops in prop::collection::vec(op_strategy(), 1..12),
        split in prop::collection::vec(1usize..4, 1..12),
    ) {
        let mut batches = Vec::new();
        let mut remaining = ops.as_slice();
        let mut sizes = split.iter().cycle();
        let mut batch_id = 1;
        while !remaining.is_empty() {
            let size = (*sizes.next().unwrap()).min(remaining.len());
            let (head, tail) = remaining.split_at(size);
            batches.push(MutationBatch::new(
                batch_id,
                Timestamp::new(2, 0),
                Vec::new(),
                head.iter().map(to_mutation).collect(),
            ));
            batch_id += 1;
            remaining = tail;
        }

        let mut layered = base_document(&start);
        OverlayIndex::from_batches(&batches).apply(&mut layered);

        let mut sequential = base_document(&start);
        let mut mask = Some(FieldMask::empty());
        for batch in &batches {
            mask = batch.apply_to_local_view(&mut sequential, mask);
        }

        prop_assert_eq!(layered.is_found_document(), sequential.is_found_document());
        prop_assert_eq!(layered.data(), sequential.data());
        assert_matches(&layered, &expected_state(start, &ops));
    }
}
