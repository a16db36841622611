//! Property-based test generators using proptest.

use docwatch_codec::{Timestamp, Value};
use docwatch_protocol::{DocumentKey, DocumentSnapshot};
use proptest::prelude::*;

/// Strategy for scalar values of every orderable type.
pub fn scalar_value_strategy() -> impl Strategy<Value = Value> {
    prop_oneof![
        Just(Value::Null),
        any::<bool>().prop_map(Value::Bool),
        any::<i64>().prop_map(Value::Integer),
        any::<f64>().prop_map(Value::Double),
        (-1_000_000i64..1_000_000, 0i32..1_000_000_000)
            .prop_map(|(s, n)| Value::Timestamp(Timestamp::new(s, n))),
        "[a-z]{0,6}".prop_map(Value::String),
        prop::collection::vec(any::<u8>(), 0..6).prop_map(Value::Bytes),
        "[a-z]{1,4}/[a-z0-9]{1,4}".prop_map(Value::Reference),
        (-90.0f64..90.0, -180.0f64..180.0)
            .prop_map(|(latitude, longitude)| Value::GeoPoint { latitude, longitude }),
    ]
}

/// Strategy for arbitrarily nested values.
pub fn value_strategy() -> impl Strategy<Value = Value> {
    scalar_value_strategy().prop_recursive(3, 24, 4, |inner| {
        prop_oneof![
            prop::collection::vec(inner.clone(), 0..4).prop_map(Value::Array),
            prop::collection::btree_map("[a-c]{1,2}", inner, 0..4).prop_map(Value::Map),
            prop::collection::vec(-10.0f64..10.0, 0..4).prop_map(Value::Vector),
        ]
    })
}

/// Strategy for a document id from a small pool, so generated changes
/// collide often.
pub fn document_id_strategy() -> impl Strategy<Value = String> {
    prop::sample::select(vec!["a", "b", "c", "d", "e", "f", "g", "h"]).prop_map(str::to_string)
}

/// Strategy for documents in `collection` with an integer field `n`, which
/// is sometimes missing.
pub fn document_strategy(collection: &'static str) -> impl Strategy<Value = DocumentSnapshot> {
    (document_id_strategy(), prop::option::weighted(0.9, 0i64..6), 1i64..100).prop_map(
        move |(id, n, version)| {
            let key = DocumentKey::parse(&format!("{collection}/{id}")).expect("valid document path");
            let fields = n.map(|n| ("n".to_string(), Value::Integer(n))).into_iter().collect();
            DocumentSnapshot::new(key, fields, Timestamp::from_seconds(version))
        },
    )
}

/// One generated server-side change.
#[derive(Debug, Clone)]
pub enum GeneratedChange {
    /// Add or update a document.
    Upsert(DocumentSnapshot),
    /// Remove the document with this id.
    Remove(String),
}

/// Strategy for a batch of changes against `collection`.
pub fn change_batch_strategy(collection: &'static str) -> impl Strategy<Value = Vec<GeneratedChange>> {
    prop::collection::vec(
        prop_oneof![
            3 => document_strategy(collection).prop_map(GeneratedChange::Upsert),
            1 => document_id_strategy().prop_map(GeneratedChange::Remove),
        ],
        0..12,
    )
}
