//! Property tests for view diffs driven by generated change batches.

use docwatch_engine::{ChangeType, DocumentChange, PendingChangeSet, View};
use docwatch_protocol::{
    compare_documents, translate_query, Direction, DocumentKey, DocumentSnapshot, OrderBy,
    QueryDescriptor, Timestamp,
};
use docwatch_testkit::{change_batch_strategy, value_strategy, GeneratedChange};
use proptest::prelude::*;
use std::cmp::Ordering;

fn order(direction: Direction) -> Vec<OrderBy> {
    translate_query(&QueryDescriptor::collection("items").order_by("n", direction))
        .unwrap()
        .order_by
}

fn pending(batch: &[GeneratedChange]) -> PendingChangeSet {
    let mut set = PendingChangeSet::new();
    for change in batch {
        match change {
            GeneratedChange::Upsert(doc) => set.upsert(doc.clone()),
            GeneratedChange::Remove(id) => {
                set.remove(DocumentKey::parse(&format!("items/{id}")).unwrap())
            }
        }
    }
    set
}

fn replay(old: &[DocumentSnapshot], changes: &[DocumentChange]) -> Vec<DocumentSnapshot> {
    let mut docs = old.to_vec();
    for change in changes {
        match change.change_type() {
            ChangeType::Removed => {
                let at = change.old_index().unwrap();
                assert_eq!(docs[at].key(), change.key());
                docs.remove(at);
            }
            ChangeType::Added => docs.insert(change.new_index().unwrap(), change.document().clone()),
            ChangeType::Modified => {
                let at = change.old_index().unwrap();
                assert_eq!(docs[at].key(), change.key());
                docs.remove(at);
                docs.insert(change.new_index().unwrap(), change.document().clone());
            }
        }
    }
    docs
}

fn assert_sorted(docs: &[DocumentSnapshot], order_by: &[OrderBy]) {
    for pair in docs.windows(2) {
        assert_eq!(compare_documents(&pair[0], &pair[1], order_by), Ordering::Less);
    }
}

proptest! {
    #[test]
    fn replaying_changes_reproduces_view(
        batches in prop::collection::vec((change_batch_strategy("items"), any::<bool>()), 1..6),
        descending in any::<bool>(),
    ) {
        let direction = if descending { Direction::Descending } else { Direction::Ascending };
        let order_by = order(direction);
        let mut view = View::with_order(order_by.clone());

        for (batch, full) in batches {
            let result = view.apply(&pending(&batch), full);
            let replayed = replay(view.documents(), &result.changes);

            let expected_keys: Vec<_> = result.view.documents().iter().map(|d| d.key().clone()).collect();
            let replayed_keys: Vec<_> = replayed.iter().map(|d| d.key().clone()).collect();
            prop_assert_eq!(replayed_keys, expected_keys);
            assert_sorted(result.view.documents(), &order_by);
            prop_assert!(result.view.documents().iter().all(|d| d.get(&"n".into()).is_some()));

            view = result.view;
        }
    }

    #[test]
    fn mixed_value_types_stay_in_query_order(values in prop::collection::vec(value_strategy(), 0..10)) {
        let order_by = order(Direction::Ascending);
        let mut set = PendingChangeSet::new();
        for (i, value) in values.into_iter().enumerate() {
            let key = DocumentKey::parse(&format!("items/d{i}")).unwrap();
            let fields = [("n".to_string(), value)].into_iter().collect();
            set.upsert(DocumentSnapshot::new(key, fields, Timestamp::from_seconds(1)));
        }

        let result = View::with_order(order_by.clone()).apply(&set, false);
        prop_assert_eq!(result.view.len(), set.len());
        prop_assert!(result.changes.iter().all(|c| c.change_type() == ChangeType::Added));
        assert_sorted(result.view.documents(), &order_by);
    }
}
