//! Address Book Storage Contract
//!
//! The pipelines in `addressbook-core` only ever talk to storage through the
//! traits in this crate:
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                       STORAGE CONTRACT                           │
//! ├──────────────────────────────────────────────────────────────────┤
//! │                                                                  │
//! │  ┌──────────┐  import_metadata   ┌──────────────────────────┐   │
//! │  │ Catalog  │───────────────────►│                          │   │
//! │  └──────────┘                    │          Store           │   │
//! │                                  │  (acquire / begin /      │   │
//! │  ┌──────────┐  acquire/release   │   release)               │   │
//! │  │   HTTP   │───────────────────►│                          │   │
//! │  └──────────┘                    └────────────┬─────────────┘   │
//! │                                               │ begin           │
//! │  ┌──────────┐  query/persist/    ┌────────────▼─────────────┐   │
//! │  │ Pipeline │───discard─────────►│       Transaction        │   │
//! │  └──────────┘  commit/rollback   │  (bound to a connection) │   │
//! │                                  └──────────────────────────┘   │
//! └──────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Referential integrity
//!
//! Stores own the relational contract, not the pipelines:
//! - reference fields are non-null and must resolve at commit,
//! - deleting a parent applies the reference's [`OnDelete`] rule
//!   (the address book uses [`OnDelete::Cascade`] for `Address.book`),
//! - keys are unique per entity.

pub mod memory;


use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use thiserror::Error;

pub use memory::{MemoryStore, MemoryTransaction};

// ============================================================================
// Core Types
// ============================================================================

/// Numeric record key.
pub type Key = u64;

/// A stored record: field name -> JSON value.
pub type Record = Map<String, Value>;

/// What happens to referencing rows when the referenced row is discarded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OnDelete {
    /// Referencing rows are discarded with the parent.
    Cascade,
    /// The discard fails while referencing rows exist.
    Restrict,
}

/// Storage type of one field.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum FieldKind {
    /// The numeric primary key.
    Key,
    Text,
    /// Non-null numeric reference to another entity's key.
    Reference { target: String, on_delete: OnDelete },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldDef {
    pub name: String,
    pub kind: FieldKind,
}

/// A back-link association: the rows of `target` whose `via` field points at
/// the owning row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssociationDef {
    pub name: String,
    pub target: String,
    pub via: String,
}

/// Schema description of one record type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntityDef {
    pub name: String,
    pub key: String,
    pub fields: Vec<FieldDef>,
    pub associations: Vec<AssociationDef>,
}

impl EntityDef {
    /// Start a definition with a numeric key field named `key`.
    pub fn new(name: impl Into<String>, key: impl Into<String>) -> Self {
        let key = key.into();
        Self {
            name: name.into(),
            fields: vec![FieldDef {
                name: key.clone(),
                kind: FieldKind::Key,
            }],
            key,
            associations: Vec::new(),
        }
    }

    pub fn text(mut self, name: impl Into<String>) -> Self {
        self.fields.push(FieldDef {
            name: name.into(),
            kind: FieldKind::Text,
        });
        self
    }

    pub fn reference(
        mut self,
        name: impl Into<String>,
        target: impl Into<String>,
        on_delete: OnDelete,
    ) -> Self {
        self.fields.push(FieldDef {
            name: name.into(),
            kind: FieldKind::Reference {
                target: target.into(),
                on_delete,
            },
        });
        self
    }

    pub fn back_link(
        mut self,
        name: impl Into<String>,
        target: impl Into<String>,
        via: impl Into<String>,
    ) -> Self {
        self.associations.push(AssociationDef {
            name: name.into(),
            target: target.into(),
            via: via.into(),
        });
        self
    }

    pub fn field(&self, name: &str) -> Option<&FieldDef> {
        self.fields.iter().find(|f| f.name == name)
    }

    pub fn association(&self, name: &str) -> Option<&AssociationDef> {
        self.associations.iter().find(|a| a.name == name)
    }

    pub fn field_names(&self) -> Vec<String> {
        self.fields.iter().map(|f| f.name.clone()).collect()
    }

    /// Reference fields as `(field, target, on_delete)`.
    pub fn references(&self) -> impl Iterator<Item = (&str, &str, OnDelete)> {
        self.fields.iter().filter_map(|f| match &f.kind {
            FieldKind::Reference { target, on_delete } => {
                Some((f.name.as_str(), target.as_str(), *on_delete))
            }
            _ => None,
        })
    }
}

/// A metadata-import request: the entity definitions a client wants the
/// store to resolve, including their associations.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetadataImport {
    pub entities: Vec<EntityDef>,
}

impl MetadataImport {
    pub fn new(entities: Vec<EntityDef>) -> Self {
        Self { entities }
    }

    pub fn entity(&self, name: &str) -> Option<&EntityDef> {
        self.entities.iter().find(|e| e.name == name)
    }

    /// Structural checks every store performs before resolving a request.
    ///
    /// `known` looks up definitions resolved by earlier imports, so a request
    /// may reference entities it does not itself carry.
    pub fn validate<'a>(
        &'a self,
        known: impl Fn(&str) -> Option<&'a EntityDef>,
    ) -> StoreResult<()> {
        let lookup = |name: &str| self.entity(name).or_else(|| known(name));

        for (idx, entity) in self.entities.iter().enumerate() {
            if self.entities[..idx].iter().any(|e| e.name == entity.name) {
                return Err(StoreError::InvalidMetadata(format!(
                    "entity `{}` declared twice",
                    entity.name
                )));
            }
            match entity.field(&entity.key) {
                Some(FieldDef {
                    kind: FieldKind::Key,
                    ..
                }) => {}
                _ => {
                    return Err(StoreError::InvalidMetadata(format!(
                        "entity `{}` has no key field `{}`",
                        entity.name, entity.key
                    )));
                }
            }
            for (field, target, _) in entity.references() {
                if lookup(target).is_none() {
                    return Err(StoreError::InvalidMetadata(format!(
                        "`{}.{}` references unknown entity `{}`",
                        entity.name, field, target
                    )));
                }
            }
            for assoc in &entity.associations {
                let Some(target) = lookup(&assoc.target) else {
                    return Err(StoreError::InvalidMetadata(format!(
                        "association `{}.{}` targets unknown entity `{}`",
                        entity.name, assoc.name, assoc.target
                    )));
                };
                let points_back = target
                    .references()
                    .any(|(field, to, _)| field == assoc.via && to == entity.name);
                if !points_back {
                    return Err(StoreError::InvalidMetadata(format!(
                        "association `{}.{}`: `{}.{}` is not a reference to `{}`",
                        entity.name, assoc.name, assoc.target, assoc.via, entity.name
                    )));
                }
            }
        }
        Ok(())
    }
}

/// A projection query over one entity, optionally expanding back-link
/// associations. Stores return one JSON object per root row with each
/// expanded association as an array of projected child objects.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Query {
    pub entity: String,
    pub fields: Vec<String>,
    pub expand: Vec<Expand>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Expand {
    pub association: String,
    pub fields: Vec<String>,
}

impl Query {
    pub fn new(entity: impl Into<String>) -> Self {
        Self {
            entity: entity.into(),
            fields: Vec::new(),
            expand: Vec::new(),
        }
    }

    pub fn select<I, S>(mut self, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.fields.extend(fields.into_iter().map(Into::into));
        self
    }

    pub fn expand<I, S>(mut self, association: impl Into<String>, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.expand.push(Expand {
            association: association.into(),
            fields: fields.into_iter().map(Into::into).collect(),
        });
        self
    }
}

/// Opaque handle to a store connection.
///
/// Handles are acquired by whoever owns the request (the HTTP layer) and only
/// borrowed by transactions.
#[derive(Debug, PartialEq, Eq, Hash)]
pub struct Connection {
    id: u64,
}

impl Connection {
    pub fn new(id: u64) -> Self {
        Self { id }
    }

    pub fn id(&self) -> u64 {
        self.id
    }
}

impl fmt::Display for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn#{}", self.id)
    }
}

/// Transaction state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxState {
    Active,
    Committed,
    RolledBack,
}

// ============================================================================
// Errors
// ============================================================================

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("unknown entity `{0}`")]
    UnknownEntity(String),

    #[error("unknown field `{entity}.{field}`")]
    UnknownField { entity: String, field: String },

    #[error("unknown association `{entity}.{association}`")]
    UnknownAssociation { entity: String, association: String },

    #[error("invalid metadata: {0}")]
    InvalidMetadata(String),

    #[error("connection {0} is not open")]
    ConnectionClosed(u64),

    #[error("connection {0} is already bound to a transaction")]
    ConnectionBusy(u64),

    #[error("duplicate key {key} for `{entity}`")]
    DuplicateKey { entity: String, key: Key },

    #[error("`{entity}.{field}` = {key} does not resolve to a `{target}` row")]
    MissingReference {
        entity: String,
        field: String,
        key: Key,
        target: String,
    },

    #[error("`{entity}` row {key} is still referenced by `{referencing}`")]
    ReferencedBy {
        entity: String,
        key: Key,
        referencing: String,
    },

    #[error("invalid `{entity}` record: {reason}")]
    InvalidRecord { entity: String, reason: String },

    #[error("transaction {0} is no longer active")]
    TransactionClosed(u64),

    #[error("store unavailable: {0}")]
    Unavailable(String),
}

pub type StoreResult<T> = Result<T, StoreError>;

// ============================================================================
// Traits
// ============================================================================

/// A transactional record store.
#[async_trait]
pub trait Store: Send + Sync {
    /// Resolve entity definitions and their associations. Returns the
    /// definitions as the store now knows them, in request order.
    async fn import_metadata(&self, request: &MetadataImport) -> StoreResult<Vec<EntityDef>>;

    /// Open a connection handle.
    async fn acquire(&self) -> StoreResult<Connection>;

    /// Give a connection handle back. Any transaction still bound to it is
    /// rolled back.
    fn release(&self, connection: Connection);

    /// Bind a new transaction to `connection`.
    async fn begin(&self, connection: &Connection) -> StoreResult<Box<dyn Transaction>>;
}

/// A transaction bound to one borrowed connection.
///
/// Writes are staged and become visible to other transactions only on
/// [`Transaction::commit`]; reads inside the transaction see its own staged
/// writes.
#[async_trait]
pub trait Transaction: Send {
    fn id(&self) -> u64;

    fn state(&self) -> TxState;

    async fn query(&mut self, query: &Query) -> StoreResult<Vec<Value>>;

    async fn persist(&mut self, entity: &str, records: Vec<Record>) -> StoreResult<()>;

    /// Discard rows by key. Missing keys are ignored.
    async fn discard(&mut self, entity: &str, keys: &[Key]) -> StoreResult<()>;

    async fn commit(&mut self) -> StoreResult<()>;

    async fn rollback(&mut self) -> StoreResult<()>;

    /// Synchronous last-resort release: drops staged writes and frees the
    /// connection. A no-op once the transaction has committed or rolled back.
    fn release(&mut self);
}

/// Read a numeric key out of a JSON value. Accepts integers and decimal
/// strings.
pub fn key_of(value: &Value) -> Option<Key> {
    match value {
        Value::Number(n) => n.as_u64(),
        Value::String(s) => s.parse().ok(),
        _ => None,
    }
}
