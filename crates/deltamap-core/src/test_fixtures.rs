//! Shared metadata and change-set fixtures for pipeline tests.
//!
//! The model is a small store: customers (server-generated key, concurrency
//! token) and orders carrying a nullable foreign key to their customer.
//! Each extent maps to one table through an identity projection view.

use crate::{
    changeset::{
        ChangeEntry, ChangePayload, EntityKey, EntityState, ModifiedFields, Record,
        RelationshipSnapshot,
    },
    metadata::{
        AssociationEnd, AssociationSetId, AssociationSetSchema, EntitySetId, EntitySetSchema,
        ExtentRef, FieldSchema, MappingView, MetadataModel, Multiplicity, ProjectedColumn,
        ReferentialConstraint, TableId, TableSchema, ViewExpr,
    },
    value::{Value, ValueType},
};

pub struct StoreFixture {
    pub model: MetadataModel,
    pub customers: EntitySetId,
    pub orders: EntitySetId,
    pub customers_table: TableId,
    pub orders_table: TableId,
    pub customer_orders: AssociationSetId,
}

impl StoreFixture {
    pub fn new() -> Self {
        let mut builder = MetadataModel::builder();

        let customer_fields = vec![
            FieldSchema::new("id", ValueType::Int).server_generated(),
            FieldSchema::new("name", ValueType::Text),
            FieldSchema::new("version", ValueType::Uint).concurrency_token(),
        ];
        let customers = builder.add_entity_set(EntitySetSchema {
            name: "customers".into(),
            fields: customer_fields.clone(),
            key_ordinals: vec![0],
        });
        let customers_table = builder.add_table(TableSchema {
            name: "customers".into(),
            fields: customer_fields,
            key_ordinals: vec![0],
        });

        let order_fields = vec![
            FieldSchema::new("id", ValueType::Int),
            FieldSchema::new("customer_id", ValueType::Int).nullable(),
            FieldSchema::new("amount", ValueType::Int),
        ];
        let orders = builder.add_entity_set(EntitySetSchema {
            name: "orders".into(),
            fields: order_fields.clone(),
            key_ordinals: vec![0],
        });
        let orders_table = builder.add_table(TableSchema {
            name: "orders".into(),
            fields: order_fields,
            key_ordinals: vec![0],
        });

        let customer_orders = builder.add_association_set(AssociationSetSchema {
            name: "customer_orders".into(),
            from: AssociationEnd {
                name: "customer".into(),
                entity_set: customers,
                multiplicity: Multiplicity::ZeroOrOne,
            },
            to: AssociationEnd {
                name: "orders".into(),
                entity_set: orders,
                multiplicity: Multiplicity::Many,
            },
            constraint: Some(ReferentialConstraint {
                principal_props: vec![0],
                dependent_props: vec![1],
            }),
            co_located_table: None,
        });

        builder.add_view(MappingView {
            table: customers_table,
            expr: identity_view(customers, 3),
        });
        builder.add_view(MappingView {
            table: orders_table,
            expr: identity_view(orders, 3),
        });

        Self {
            model: builder.build(),
            customers,
            orders,
            customers_table,
            orders_table,
            customer_orders,
        }
    }

    pub fn customer_key(&self, id: i64) -> EntityKey {
        EntityKey::Literal {
            entity_set: self.customers,
            values: vec![Value::Int(id)],
        }
    }

    pub fn temp_customer_key(&self, serial: u64) -> EntityKey {
        EntityKey::Temporary {
            entity_set: self.customers,
            serial,
        }
    }

    pub fn order_key(&self, id: i64) -> EntityKey {
        EntityKey::Literal {
            entity_set: self.orders,
            values: vec![Value::Int(id)],
        }
    }

    pub fn customer_record(&self, id: Value, name: &str, version: u64) -> Record {
        Record::new(vec![id, Value::Text(name.into()), Value::Uint(version)])
    }

    pub fn order_record(&self, id: i64, customer_id: Value, amount: i64) -> Record {
        Record::new(vec![Value::Int(id), customer_id, Value::Int(amount)])
    }

    pub fn added_customer(&self, key: EntityKey, name: &str) -> ChangeEntry {
        ChangeEntry {
            state: EntityState::Added,
            payload: ChangePayload::Entity {
                entity_set: self.customers,
                key,
                original: None,
                current: Some(self.customer_record(Value::Null, name, 1)),
                modified: ModifiedFields::All,
            },
        }
    }

    pub fn added_order(&self, id: i64, customer_id: Value, amount: i64) -> ChangeEntry {
        ChangeEntry {
            state: EntityState::Added,
            payload: ChangePayload::Entity {
                entity_set: self.orders,
                key: self.order_key(id),
                original: None,
                current: Some(self.order_record(id, customer_id, amount)),
                modified: ModifiedFields::All,
            },
        }
    }

    pub fn modified_customer(
        &self,
        id: i64,
        original: Record,
        current: Record,
        modified: ModifiedFields,
    ) -> ChangeEntry {
        ChangeEntry {
            state: EntityState::Modified,
            payload: ChangePayload::Entity {
                entity_set: self.customers,
                key: self.customer_key(id),
                original: Some(original),
                current: Some(current),
                modified,
            },
        }
    }

    pub fn deleted_customer(&self, id: i64, original: Record) -> ChangeEntry {
        ChangeEntry {
            state: EntityState::Deleted,
            payload: ChangePayload::Entity {
                entity_set: self.customers,
                key: self.customer_key(id),
                original: Some(original),
                current: None,
                modified: ModifiedFields::All,
            },
        }
    }

    pub fn deleted_order(&self, id: i64, customer_id: Value, amount: i64) -> ChangeEntry {
        ChangeEntry {
            state: EntityState::Deleted,
            payload: ChangePayload::Entity {
                entity_set: self.orders,
                key: self.order_key(id),
                original: Some(self.order_record(id, customer_id, amount)),
                current: None,
                modified: ModifiedFields::All,
            },
        }
    }

    pub fn added_relationship(&self, from: EntityKey, to: EntityKey) -> ChangeEntry {
        ChangeEntry {
            state: EntityState::Added,
            payload: ChangePayload::Relationship {
                association_set: self.customer_orders,
                original: None,
                current: Some(RelationshipSnapshot { from, to }),
            },
        }
    }

    pub fn deleted_relationship(&self, from: EntityKey, to: EntityKey) -> ChangeEntry {
        ChangeEntry {
            state: EntityState::Deleted,
            payload: ChangePayload::Relationship {
                association_set: self.customer_orders,
                original: Some(RelationshipSnapshot { from, to }),
                current: None,
            },
        }
    }
}

/// Project every input column through unchanged.
pub fn identity_view(extent: EntitySetId, width: usize) -> ViewExpr {
    ViewExpr::Project {
        input: Box::new(ViewExpr::Scan {
            extent: ExtentRef::Entity(extent),
        }),
        columns: (0..width).map(ProjectedColumn::Input).collect(),
    }
}
