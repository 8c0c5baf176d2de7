use super::*;
use crate::{
    changeset::EntityState,
    result::ResultFlags,
    test_fixtures::StoreFixture,
    value::Value,
};

fn entry_id(n: u32) -> EntryId {
    EntryId(n)
}

#[test]
fn validate_rejects_snapshots_that_disagree_with_state() {
    let fx = StoreFixture::new();
    let extractor = ChangeExtractor::new(&fx.model);

    let mut entry = fx.added_customer(fx.temp_customer_key(1), "alice");
    entry.state = EntityState::Deleted; // deleted entries carry originals only

    let err = extractor.validate(entry_id(0), &entry).unwrap_err();
    assert!(matches!(err, ExtractError::MalformedEntry { .. }));
}

#[test]
fn validate_rejects_record_width_mismatch() {
    let fx = StoreFixture::new();
    let extractor = ChangeExtractor::new(&fx.model);

    let mut entry = fx.added_order(1, Value::Null, 10);
    if let ChangePayload::Entity { current, .. } = &mut entry.payload {
        *current = Some(Record::new(vec![Value::Int(1)]));
    }

    let err = extractor.validate(entry_id(0), &entry).unwrap_err();
    assert!(matches!(
        err,
        ExtractError::RecordWidthMismatch {
            expected: 3,
            found: 1,
            ..
        }
    ));
}

#[test]
fn extraction_tags_key_server_generated_and_concurrency_slots() {
    let fx = StoreFixture::new();
    let extractor = ChangeExtractor::new(&fx.model);
    let mut keys = KeyManager::new();

    let entry = fx.added_customer(fx.temp_customer_key(1), "alice");
    let extracted = extractor.extract(&mut keys, entry_id(0), &entry).unwrap();

    let current = extracted.current.unwrap();
    let id_slot = current.child(0).unwrap();
    assert!(id_slot.flags().contains(ResultFlags::KEY));
    assert!(id_slot.flags().contains(ResultFlags::SERVER_GENERATED));
    assert!(id_slot.identifier().is_some());
    assert_eq!(id_slot.source().unwrap().entry, entry_id(0));

    let version_slot = current.child(2).unwrap();
    assert!(version_slot.flags().contains(ResultFlags::CONCURRENCY));
    assert!(version_slot.identifier().is_none());

    // the key slot of the current record owns its identifier
    let owner = keys.owner(id_slot.identifier().unwrap()).unwrap();
    assert_eq!(owner.source(), id_slot.source());
}

#[test]
fn unmodified_fields_are_marked_preserve() {
    let fx = StoreFixture::new();
    let extractor = ChangeExtractor::new(&fx.model);
    let mut keys = KeyManager::new();

    let entry = fx.modified_customer(
        5,
        fx.customer_record(Value::Int(5), "alice", 1),
        fx.customer_record(Value::Int(5), "alicia", 1),
        ModifiedFields::Some([1].into()),
    );
    let extracted = extractor.extract(&mut keys, entry_id(0), &entry).unwrap();

    let current = extracted.current.unwrap();
    assert!(current.child(0).unwrap().flags().is_preserve());
    assert!(!current.child(1).unwrap().flags().is_preserve());
    assert!(current.child(2).unwrap().flags().is_preserve());
}

#[test]
fn foreign_key_constraint_unifies_dependent_and_principal_slots() {
    let fx = StoreFixture::new();
    let extractor = ChangeExtractor::new(&fx.model);
    let mut keys = KeyManager::new();
    let tracked = HashMap::from([
        (fx.customer_key(7), EntityState::Unchanged),
        (fx.order_key(1), EntityState::Added),
    ]);

    let order = fx.added_order(1, Value::Int(7), 10);
    extractor
        .register_referential_constraints(&mut keys, entry_id(0), &order, &tracked)
        .unwrap();
    let extracted = extractor.extract(&mut keys, entry_id(0), &order).unwrap();

    let fk_slot = extracted.current.unwrap().child(1).unwrap().clone();
    assert!(fk_slot.flags().contains(ResultFlags::FOREIGN_KEY));

    let principal = keys
        .identifier_for_key_offset(&fx.customer_key(7), 0, 1)
        .unwrap();
    assert!(keys.same_clique(fk_slot.identifier().unwrap(), principal));
}

#[test]
fn value_built_reference_resolves_to_pending_key() {
    let fx = StoreFixture::new();
    let extractor = ChangeExtractor::new(&fx.model);
    let mut keys = KeyManager::new();

    // client-assigned key value on an entity still tracked under a temp key
    let mut customer = fx.added_customer(fx.temp_customer_key(1), "alice");
    if let ChangePayload::Entity { current, .. } = &mut customer.payload {
        *current = Some(fx.customer_record(Value::Int(5), "alice", 1));
    }
    extractor.register_added_key(&mut keys, &customer);

    let order = fx.added_order(1, Value::Int(5), 10);
    let tracked = HashMap::from([
        (fx.temp_customer_key(1), EntityState::Added),
        (fx.order_key(1), EntityState::Added),
    ]);
    extractor
        .register_referential_constraints(&mut keys, entry_id(1), &order, &tracked)
        .unwrap();

    let fk = keys.identifier_for_member(&fx.order_key(1), "customer_id", true);
    let pending = keys
        .identifier_for_key_offset(&fx.temp_customer_key(1), 0, 1)
        .unwrap();
    assert!(keys.same_clique(fk, pending));
}

#[test]
fn ambiguous_value_built_reference_is_rejected() {
    let fx = StoreFixture::new();
    let extractor = ChangeExtractor::new(&fx.model);
    let mut keys = KeyManager::new();

    for serial in [1, 2] {
        let mut customer = fx.added_customer(fx.temp_customer_key(serial), "dup");
        if let ChangePayload::Entity { current, .. } = &mut customer.payload {
            *current = Some(fx.customer_record(Value::Int(5), "dup", 1));
        }
        extractor.register_added_key(&mut keys, &customer);
    }

    let order = fx.added_order(1, Value::Int(5), 10);
    let err = extractor
        .register_referential_constraints(&mut keys, entry_id(2), &order, &HashMap::new())
        .unwrap_err();
    assert!(matches!(err, ExtractError::AmbiguousForeignKey { .. }));
}

#[test]
fn inserting_a_reference_to_a_deleted_principal_is_rejected() {
    let fx = StoreFixture::new();
    let extractor = ChangeExtractor::new(&fx.model);
    let mut keys = KeyManager::new();
    let tracked = HashMap::from([(fx.customer_key(7), EntityState::Deleted)]);

    let order = fx.added_order(1, Value::Int(7), 10);
    let err = extractor
        .register_referential_constraints(&mut keys, entry_id(0), &order, &tracked)
        .unwrap_err();
    assert!(matches!(err, ExtractError::ReferenceToDeletedPrincipal { .. }));
}

#[test]
fn null_foreign_key_registers_nothing() {
    let fx = StoreFixture::new();
    let extractor = ChangeExtractor::new(&fx.model);
    let mut keys = KeyManager::new();

    let order = fx.added_order(1, Value::Null, 10);
    extractor
        .register_referential_constraints(&mut keys, entry_id(0), &order, &HashMap::new())
        .unwrap();

    let fk = keys.identifier_for_member(&fx.order_key(1), "customer_id", true);
    assert_eq!(keys.principals(fk), vec![fk]);
}

#[test]
fn relationship_rows_flatten_both_end_keys() {
    let fx = StoreFixture::new();
    let extractor = ChangeExtractor::new(&fx.model);
    let mut keys = KeyManager::new();

    let entry = fx.added_relationship(fx.customer_key(7), fx.order_key(1));
    let extracted = extractor.extract(&mut keys, entry_id(0), &entry).unwrap();

    let current = extracted.current.unwrap();
    let row = current.children().unwrap();
    assert_eq!(row.len(), 2);
    assert_eq!(row[0].value().unwrap(), &Value::Int(7));
    assert_eq!(row[1].value().unwrap(), &Value::Int(1));
    for slot in row {
        assert!(slot.flags().contains(ResultFlags::KEY));
        assert!(slot.flags().contains(ResultFlags::FOREIGN_KEY));
        assert!(slot.identifier().is_some());
    }
}
