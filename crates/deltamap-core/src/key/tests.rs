use super::*;
use crate::{
    metadata::EntitySetId,
    result::{PropagatorResult, ResultFlags},
    value::Value,
};

fn key(set: u32, id: i64) -> EntityKey {
    EntityKey::Literal {
        entity_set: EntitySetId(set),
        values: vec![Value::Int(id)],
    }
}

fn temp(set: u32, serial: u64) -> EntityKey {
    EntityKey::Temporary {
        entity_set: EntitySetId(set),
        serial,
    }
}

fn entry(n: u32) -> EntryId {
    EntryId(n)
}

#[test]
fn same_slot_resolves_to_same_identifier() {
    let mut keys = KeyManager::new();

    let a = keys.identifier_for_key_offset(&key(0, 1), 0, 1).unwrap();
    let b = keys.identifier_for_key_offset(&key(0, 1), 0, 1).unwrap();
    assert_eq!(a, b);

    let c = keys.identifier_for_key_offset(&key(0, 2), 0, 1).unwrap();
    assert_ne!(a, c);
}

#[test]
fn member_slots_distinguish_record_sides() {
    let mut keys = KeyManager::new();

    let current = keys.identifier_for_member(&key(0, 1), "owner_id", true);
    let original = keys.identifier_for_member(&key(0, 1), "owner_id", false);
    assert_ne!(current, original);
    assert_eq!(current, keys.identifier_for_member(&key(0, 1), "owner_id", true));
}

#[test]
fn offset_out_of_range_is_rejected() {
    let mut keys = KeyManager::new();
    let err = keys.identifier_for_key_offset(&key(0, 1), 2, 2).unwrap_err();
    assert!(matches!(
        err,
        KeyError::InvalidKeyOffset { offset: 2, total: 2 }
    ));
}

#[test]
fn constraint_unifies_cliques() {
    let mut keys = KeyManager::new();

    let principal = keys.identifier_for_key_offset(&temp(0, 1), 0, 1).unwrap();
    let dependent = keys.identifier_for_member(&key(1, 10), "owner_id", true);
    assert!(!keys.same_clique(principal, dependent));

    keys.add_referential_constraint(entry(0), dependent, principal);
    assert!(keys.same_clique(principal, dependent));
}

#[test]
fn cliques_are_transitive() {
    let mut keys = KeyManager::new();

    let a = keys.identifier_for_key_offset(&temp(0, 1), 0, 1).unwrap();
    let b = keys.identifier_for_member(&key(1, 10), "owner_id", true);
    let c = keys.identifier_for_member(&key(2, 20), "owner_id", true);

    keys.add_referential_constraint(entry(0), b, a);
    keys.add_referential_constraint(entry(1), c, a);
    assert!(keys.same_clique(b, c));
}

#[test]
fn principal_and_dependent_closures_include_self() {
    let mut keys = KeyManager::new();

    let a = keys.identifier_for_key_offset(&key(0, 1), 0, 1).unwrap();
    let b = keys.identifier_for_member(&key(1, 10), "a_id", true);
    let c = keys.identifier_for_member(&key(2, 20), "b_id", true);

    // c depends on b depends on a
    keys.add_referential_constraint(entry(0), b, a);
    keys.add_referential_constraint(entry(1), c, b);

    assert_eq!(keys.principals(c), vec![a, b, c]);
    assert_eq!(keys.dependents(a), vec![a, b, c]);
    assert_eq!(keys.principals(a), vec![a]);
}

#[test]
fn acyclic_graph_validates() {
    let mut keys = KeyManager::new();

    let a = keys.identifier_for_key_offset(&key(0, 1), 0, 1).unwrap();
    let b = keys.identifier_for_member(&key(1, 10), "a_id", true);
    keys.add_referential_constraint(entry(0), b, a);

    assert!(keys.validate_ri_graph_acyclic().is_ok());
}

#[test]
fn constraint_cycle_is_detected_with_entries() {
    let mut keys = KeyManager::new();

    let a = keys.identifier_for_key_offset(&key(0, 1), 0, 1).unwrap();
    let b = keys.identifier_for_key_offset(&key(1, 10), 0, 1).unwrap();
    let c = keys.identifier_for_key_offset(&key(2, 20), 0, 1).unwrap();

    keys.add_referential_constraint(entry(0), b, a);
    keys.add_referential_constraint(entry(1), c, b);
    keys.add_referential_constraint(entry(2), a, c);

    let err = keys.validate_ri_graph_acyclic().unwrap_err();
    let KeyError::ConstraintCycle { entries } = err else {
        panic!("expected a constraint cycle");
    };
    assert!(!entries.is_empty());
}

#[test]
fn self_constraint_is_ignored_by_cycle_detection() {
    let mut keys = KeyManager::new();

    let a = keys.identifier_for_key_offset(&key(0, 1), 0, 1).unwrap();
    keys.add_referential_constraint(entry(0), a, a);

    assert!(keys.validate_ri_graph_acyclic().is_ok());
    assert_eq!(keys.constraint_entries(a), &[entry(0)]);
}

#[test]
fn first_owner_registration_wins() {
    let mut keys = KeyManager::new();

    let id = keys.identifier_for_key_offset(&key(0, 1), 0, 1).unwrap();
    let first = PropagatorResult::scalar(Value::Int(1), ResultFlags::KEY).with_identifier(id);
    let second = PropagatorResult::scalar(Value::Int(9), ResultFlags::KEY).with_identifier(id);

    keys.register_owner(&first);
    keys.register_owner(&second);

    let owner = keys.owner(id).unwrap();
    assert_eq!(owner.value().unwrap(), &Value::Int(1));
}

#[test]
fn added_key_registry_resolves_and_detects_ambiguity() {
    let mut keys = KeyManager::new();

    assert!(keys.resolve_added_key(&key(0, 1)).is_none());

    keys.register_added_key(key(0, 1), temp(0, 7));
    assert_eq!(keys.resolve_added_key(&key(0, 1)), Some(Some(&temp(0, 7))));

    keys.register_added_key(key(0, 1), temp(0, 8));
    assert_eq!(keys.resolve_added_key(&key(0, 1)), Some(None));
}
