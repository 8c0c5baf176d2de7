use super::*;
use crate::{
    key::Identifier,
    metadata::ExtentRef,
    propagator::Propagator,
    result::ResultFlags,
    test_fixtures::StoreFixture,
    value::Value,
};
use proptest::prelude::*;

fn order_row(id: i64, customer_id: i64, amount: i64, preserve: bool) -> PropagatorResult {
    let flags = if preserve {
        ResultFlags::PRESERVE
    } else {
        ResultFlags::NONE
    };
    PropagatorResult::structural(vec![
        PropagatorResult::scalar(Value::Int(id), ResultFlags::KEY | flags),
        PropagatorResult::scalar(Value::Int(customer_id), flags),
        PropagatorResult::scalar(Value::Int(amount), flags),
    ])
}

fn orders_delta(fx: &StoreFixture) -> ChangeNode {
    let keys = KeyManager::new();
    let empty = std::collections::HashMap::new();
    let propagator = Propagator::new(&fx.model, &keys, &empty);
    ChangeNode::empty(propagator.extent_placeholder(ExtentRef::Entity(fx.orders)))
}

#[test]
fn unmatched_rows_become_inserts_and_deletes() {
    let fx = StoreFixture::new();
    let keys = KeyManager::new();
    let processor = TableChangeProcessor::new(fx.orders_table, &fx.model, &keys);

    let mut delta = orders_delta(&fx);
    delta.inserted.push(order_row(1, 7, 10, false));
    delta.deleted.push(order_row(2, 7, 20, false));

    let ops = processor.process(&delta).unwrap();
    assert_eq!(ops.len(), 2);
    assert!(matches!(ops[0], RowOp::Insert { .. }));
    assert!(matches!(ops[1], RowOp::Delete { .. }));
}

#[test]
fn matched_insert_and_delete_merge_into_an_update() {
    let fx = StoreFixture::new();
    let keys = KeyManager::new();
    let processor = TableChangeProcessor::new(fx.orders_table, &fx.model, &keys);

    let mut delta = orders_delta(&fx);
    delta.inserted.push(order_row(1, 7, 99, false));
    delta.deleted.push(order_row(1, 7, 10, false));

    let ops = processor.process(&delta).unwrap();
    assert_eq!(ops.len(), 1);
    let RowOp::Update {
        original, current, ..
    } = &ops[0]
    else {
        panic!("expected an update");
    };
    assert_eq!(original.child(2).unwrap().value().unwrap(), &Value::Int(10));
    assert_eq!(current.child(2).unwrap().value().unwrap(), &Value::Int(99));
}

#[test]
fn update_modifying_nothing_is_dropped() {
    let fx = StoreFixture::new();
    let keys = KeyManager::new();
    let processor = TableChangeProcessor::new(fx.orders_table, &fx.model, &keys);

    let mut delta = orders_delta(&fx);
    delta.inserted.push(order_row(1, 7, 10, true));
    delta.deleted.push(order_row(1, 7, 10, true));

    let ops = processor.process(&delta).unwrap();
    assert!(ops.is_empty());
}

#[test]
fn identical_pair_without_preserve_flags_is_dropped() {
    let fx = StoreFixture::new();
    let keys = KeyManager::new();
    let processor = TableChangeProcessor::new(fx.orders_table, &fx.model, &keys);

    // same values on both sides, no slot flagged preserved; still a no-op
    let mut delta = orders_delta(&fx);
    delta.inserted.push(order_row(1, 7, 10, false));
    delta.deleted.push(order_row(1, 7, 10, false));

    let ops = processor.process(&delta).unwrap();
    assert!(ops.is_empty());
}

#[test]
fn merged_update_key_keeps_both_sides_reachable() {
    let fx = StoreFixture::new();
    let keys = KeyManager::new();
    let processor = TableChangeProcessor::new(fx.orders_table, &fx.model, &keys);

    let mut delta = orders_delta(&fx);
    delta.inserted.push(
        order_row(1, 7, 99, false).replace(&|node| match node.value() {
            Ok(Value::Int(1)) => Some(
                PropagatorResult::scalar(Value::Int(1), ResultFlags::KEY)
                    .with_source(crate::changeset::EntryId(0), 0),
            ),
            _ => None,
        }),
    );
    delta.deleted.push(
        order_row(1, 7, 10, false).replace(&|node| match node.value() {
            Ok(Value::Int(1)) => Some(
                PropagatorResult::scalar(Value::Int(1), ResultFlags::KEY)
                    .with_source(crate::changeset::EntryId(1), 0),
            ),
            _ => None,
        }),
    );

    let ops = processor.process(&delta).unwrap();
    let RowOp::Update { key, .. } = &ops[0] else {
        panic!("expected an update");
    };

    let sources: Vec<_> = key.components()[0]
        .chain()
        .filter_map(|node| node.source())
        .map(|source| source.entry)
        .collect();
    assert_eq!(sources.len(), 2);
}

#[test]
fn duplicate_literal_keys_are_rejected() {
    let fx = StoreFixture::new();
    let keys = KeyManager::new();
    let processor = TableChangeProcessor::new(fx.orders_table, &fx.model, &keys);

    let mut delta = orders_delta(&fx);
    delta.inserted.push(order_row(1, 7, 10, false));
    delta.inserted.push(order_row(1, 8, 20, false));

    let err = processor.process(&delta).unwrap_err();
    assert!(matches!(err, ProcessorError::DuplicateKey { .. }));
}

#[test]
fn constraint_forced_collision_is_a_referential_integrity_error() {
    let fx = StoreFixture::new();
    let mut keys = KeyManager::new();

    // two dependent slots unified with the same principal collapse onto
    // one canonical key
    let principal = keys
        .identifier_for_key_offset(&fx.customer_key(7), 0, 1)
        .unwrap();
    let a = keys.identifier_for_member(&fx.order_key(1), "customer_id", true);
    let b = keys.identifier_for_member(&fx.order_key(2), "customer_id", true);
    keys.add_referential_constraint(crate::changeset::EntryId(0), a, principal);
    keys.add_referential_constraint(crate::changeset::EntryId(1), b, principal);

    let row = |id: Identifier| {
        PropagatorResult::structural(vec![
            PropagatorResult::scalar(Value::Null, ResultFlags::KEY).with_identifier(id),
            PropagatorResult::scalar(Value::Text("x".into()), ResultFlags::NONE),
            PropagatorResult::scalar(Value::Uint(1), ResultFlags::NONE),
        ])
    };

    let processor = TableChangeProcessor::new(fx.customers_table, &fx.model, &keys);
    let empty = std::collections::HashMap::new();
    let propagator = Propagator::new(&fx.model, &keys, &empty);
    let mut delta =
        ChangeNode::empty(propagator.extent_placeholder(ExtentRef::Entity(fx.customers)));
    delta.inserted.push(row(a));
    delta.inserted.push(row(b));

    let err = processor.process(&delta).unwrap_err();
    assert!(matches!(err, ProcessorError::ReferentialIntegrity { .. }));
}

proptest! {
    // An unmodified row arriving as an insert/delete pair must never
    // produce a command, whatever the values or flags are.
    #[test]
    fn identical_pairs_never_produce_operations(
        rows in proptest::collection::btree_map(
            any::<i64>(),
            (any::<i64>(), -1000i64..1000),
            0..8,
        ),
        preserve in any::<bool>(),
    ) {
        let fx = StoreFixture::new();
        let keys = KeyManager::new();
        let processor = TableChangeProcessor::new(fx.orders_table, &fx.model, &keys);

        let mut delta = orders_delta(&fx);
        for (id, (customer_id, amount)) in rows {
            delta.inserted.push(order_row(id, customer_id, amount, preserve));
            delta.deleted.push(order_row(id, customer_id, amount, preserve));
        }

        let ops = processor.process(&delta).unwrap();
        prop_assert!(ops.is_empty());
    }

    // Unpaired inserts always survive processing one to one.
    #[test]
    fn unpaired_inserts_survive_one_to_one(
        rows in proptest::collection::btree_map(
            any::<i64>(),
            (any::<i64>(), -1000i64..1000),
            0..8,
        )
    ) {
        let fx = StoreFixture::new();
        let keys = KeyManager::new();
        let processor = TableChangeProcessor::new(fx.orders_table, &fx.model, &keys);

        let mut delta = orders_delta(&fx);
        let expected = rows.len();
        for (id, (customer_id, amount)) in rows {
            delta.inserted.push(order_row(id, customer_id, amount, false));
        }

        let ops = processor.process(&delta).unwrap();
        prop_assert_eq!(ops.len(), expected);
        let all_inserts = ops.iter().all(|op| matches!(op, RowOp::Insert { .. }));
        prop_assert!(all_inserts);
    }
}
