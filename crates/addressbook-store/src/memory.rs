//! In-process store with real transaction semantics.
//!
//! - Writes are staged per transaction and applied atomically at commit
//!   under one write guard.
//! - Reference checks are deferred to the end of the staged batch, so a
//!   parent and its children may be persisted in either order.
//! - Discards apply each reference's [`OnDelete`] rule.

use std::borrow::Cow;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use serde_json::Value;

use crate::{
    key_of, Connection, EntityDef, FieldKind, Key, MetadataImport, OnDelete, Query, Record,
    Store, StoreError, StoreResult, Transaction, TxState,
};

type Table = BTreeMap<Key, Record>;
type Tables = BTreeMap<String, Table>;
type Schema = BTreeMap<String, EntityDef>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ConnectionState {
    Idle,
    InTransaction(u64),
}

#[derive(Default)]
struct Inner {
    schema: RwLock<Schema>,
    tables: RwLock<Tables>,
    connections: Mutex<HashMap<u64, ConnectionState>>,
    next_connection: AtomicU64,
    next_tx: AtomicU64,
    imports: AtomicU64,
}

impl Inner {
    fn free_connection(&self, connection: u64, tx_id: u64) {
        let mut connections = self.connections.lock();
        if let Some(state) = connections.get_mut(&connection) {
            if *state == ConnectionState::InTransaction(tx_id) {
                *state = ConnectionState::Idle;
            }
        }
    }
}

/// Shared in-memory store. Cloning shares the underlying data.
#[derive(Clone, Default)]
pub struct MemoryStore {
    inner: Arc<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of successful metadata imports served so far.
    pub fn import_count(&self) -> u64 {
        self.inner.imports.load(Ordering::SeqCst)
    }

    /// Committed rows of `entity`, in key order.
    pub fn rows(&self, entity: &str) -> Vec<Record> {
        self.inner
            .tables
            .read()
            .get(entity)
            .map(|table| table.values().cloned().collect())
            .unwrap_or_default()
    }

    pub fn count(&self, entity: &str) -> usize {
        self.inner
            .tables
            .read()
            .get(entity)
            .map_or(0, BTreeMap::len)
    }

    pub fn open_connections(&self) -> usize {
        self.inner.connections.lock().len()
    }

    /// Connections currently bound to a transaction.
    pub fn busy_connections(&self) -> usize {
        self.inner
            .connections
            .lock()
            .values()
            .filter(|s| matches!(s, ConnectionState::InTransaction(_)))
            .count()
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn import_metadata(&self, request: &MetadataImport) -> StoreResult<Vec<EntityDef>> {
        let mut schema = self.inner.schema.write();
        {
            let known: &Schema = &schema;
            request.validate(|name| known.get(name))?;
        }
        for entity in &request.entities {
            if let Some(existing) = schema.get(&entity.name) {
                if existing != entity {
                    return Err(StoreError::InvalidMetadata(format!(
                        "conflicting definition for `{}`",
                        entity.name
                    )));
                }
            }
        }

        let mut tables = self.inner.tables.write();
        for entity in &request.entities {
            schema.insert(entity.name.clone(), entity.clone());
            tables.entry(entity.name.clone()).or_default();
        }
        self.inner.imports.fetch_add(1, Ordering::SeqCst);
        tracing::debug!(
            entities = request.entities.len(),
            "memory store: metadata imported"
        );
        Ok(request.entities.clone())
    }

    async fn acquire(&self) -> StoreResult<Connection> {
        let id = self.inner.next_connection.fetch_add(1, Ordering::SeqCst) + 1;
        self.inner
            .connections
            .lock()
            .insert(id, ConnectionState::Idle);
        Ok(Connection::new(id))
    }

    fn release(&self, connection: Connection) {
        let state = self.inner.connections.lock().remove(&connection.id());
        if let Some(ConnectionState::InTransaction(tx)) = state {
            tracing::warn!(
                connection = connection.id(),
                tx,
                "memory store: connection released with an open transaction"
            );
        }
    }

    async fn begin(&self, connection: &Connection) -> StoreResult<Box<dyn Transaction>> {
        let mut connections = self.inner.connections.lock();
        let state = connections
            .get_mut(&connection.id())
            .ok_or(StoreError::ConnectionClosed(connection.id()))?;
        if let ConnectionState::InTransaction(_) = state {
            return Err(StoreError::ConnectionBusy(connection.id()));
        }
        let id = self.inner.next_tx.fetch_add(1, Ordering::SeqCst) + 1;
        *state = ConnectionState::InTransaction(id);

        Ok(Box::new(MemoryTransaction {
            id,
            connection: connection.id(),
            inner: Arc::clone(&self.inner),
            state: TxState::Active,
            pending: Vec::new(),
        }))
    }
}

// ============================================================================
// Transaction
// ============================================================================

#[derive(Debug, Clone)]
enum PendingWrite {
    Persist { entity: String, record: Record },
    Discard { entity: String, key: Key },
}

pub struct MemoryTransaction {
    id: u64,
    connection: u64,
    inner: Arc<Inner>,
    state: TxState,
    pending: Vec<PendingWrite>,
}

impl MemoryTransaction {
    fn ensure_active(&self) -> StoreResult<()> {
        if self.state == TxState::Active {
            Ok(())
        } else {
            Err(StoreError::TransactionClosed(self.id))
        }
    }

    fn finish(&mut self, state: TxState) {
        self.state = state;
        self.pending.clear();
        self.inner.free_connection(self.connection, self.id);
    }
}

#[async_trait]
impl Transaction for MemoryTransaction {
    fn id(&self) -> u64 {
        self.id
    }

    fn state(&self) -> TxState {
        self.state
    }

    async fn query(&mut self, query: &Query) -> StoreResult<Vec<Value>> {
        self.ensure_active()?;
        let schema = self.inner.schema.read();
        let committed = self.inner.tables.read();
        let tables: Cow<'_, Tables> = if self.pending.is_empty() {
            Cow::Borrowed(&*committed)
        } else {
            let mut view = committed.clone();
            apply_pending(&schema, &mut view, &self.pending)?;
            Cow::Owned(view)
        };
        run_query(&schema, &tables, query)
    }

    async fn persist(&mut self, entity: &str, records: Vec<Record>) -> StoreResult<()> {
        self.ensure_active()?;
        {
            let schema = self.inner.schema.read();
            let def = schema
                .get(entity)
                .ok_or_else(|| StoreError::UnknownEntity(entity.to_string()))?;
            for record in &records {
                check_record(def, record)?;
            }
        }
        self.pending
            .extend(records.into_iter().map(|record| PendingWrite::Persist {
                entity: entity.to_string(),
                record,
            }));
        Ok(())
    }

    async fn discard(&mut self, entity: &str, keys: &[Key]) -> StoreResult<()> {
        self.ensure_active()?;
        if !self.inner.schema.read().contains_key(entity) {
            return Err(StoreError::UnknownEntity(entity.to_string()));
        }
        self.pending
            .extend(keys.iter().map(|&key| PendingWrite::Discard {
                entity: entity.to_string(),
                key,
            }));
        Ok(())
    }

    async fn commit(&mut self) -> StoreResult<()> {
        self.ensure_active()?;
        let result = {
            let schema = self.inner.schema.read();
            let mut tables = self.inner.tables.write();
            let mut next = tables.clone();
            apply_pending(&schema, &mut next, &self.pending).map(|()| {
                *tables = next;
            })
        };
        match result {
            Ok(()) => {
                tracing::debug!(tx = self.id, writes = self.pending.len(), "memory store: commit");
                self.finish(TxState::Committed);
                Ok(())
            }
            Err(e) => {
                self.finish(TxState::RolledBack);
                Err(e)
            }
        }
    }

    async fn rollback(&mut self) -> StoreResult<()> {
        self.ensure_active()?;
        self.finish(TxState::RolledBack);
        Ok(())
    }

    fn release(&mut self) {
        if self.state == TxState::Active {
            self.finish(TxState::RolledBack);
        }
    }
}

impl Drop for MemoryTransaction {
    fn drop(&mut self) {
        self.release();
    }
}

// ============================================================================
// Apply / Query
// ============================================================================

fn check_record(def: &EntityDef, record: &Record) -> StoreResult<()> {
    let invalid = |reason: String| StoreError::InvalidRecord {
        entity: def.name.clone(),
        reason,
    };
    for (name, value) in record {
        let field = def.field(name).ok_or_else(|| StoreError::UnknownField {
            entity: def.name.clone(),
            field: name.clone(),
        })?;
        match &field.kind {
            FieldKind::Key | FieldKind::Reference { .. } => {
                if key_of(value).is_none() {
                    return Err(invalid(format!("`{name}` must be a numeric key")));
                }
            }
            FieldKind::Text => {
                if !(value.is_string() || value.is_null()) {
                    return Err(invalid(format!("`{name}` must be a string")));
                }
            }
        }
    }
    if !record.contains_key(&def.key) {
        return Err(invalid(format!("missing key field `{}`", def.key)));
    }
    for (field, _, _) in def.references() {
        if !record.contains_key(field) {
            return Err(invalid(format!("missing reference `{field}`")));
        }
    }
    Ok(())
}

fn record_key(def: &EntityDef, record: &Record) -> StoreResult<Key> {
    record
        .get(&def.key)
        .and_then(key_of)
        .ok_or_else(|| StoreError::InvalidRecord {
            entity: def.name.clone(),
            reason: format!("missing key field `{}`", def.key),
        })
}

fn apply_pending(schema: &Schema, tables: &mut Tables, pending: &[PendingWrite]) -> StoreResult<()> {
    let mut persisted: Vec<(&str, Key)> = Vec::new();

    for write in pending {
        match write {
            PendingWrite::Persist { entity, record } => {
                let def = schema
                    .get(entity)
                    .ok_or_else(|| StoreError::UnknownEntity(entity.clone()))?;
                let key = record_key(def, record)?;
                let table = tables.entry(entity.clone()).or_default();
                if table.contains_key(&key) {
                    return Err(StoreError::DuplicateKey {
                        entity: entity.clone(),
                        key,
                    });
                }
                table.insert(key, record.clone());
                persisted.push((entity.as_str(), key));
            }
            PendingWrite::Discard { entity, key } => {
                discard_row(schema, tables, entity, *key)?;
            }
        }
    }

    // Deferred reference check over rows written by this batch.
    for (entity, key) in persisted {
        let Some(record) = tables.get(entity).and_then(|t| t.get(&key)) else {
            continue;
        };
        let Some(def) = schema.get(entity) else {
            continue;
        };
        for (field, target, _) in def.references() {
            let target_key = record.get(field).and_then(key_of);
            let resolves = target_key
                .map(|k| tables.get(target).is_some_and(|t| t.contains_key(&k)))
                .unwrap_or(false);
            if !resolves {
                return Err(StoreError::MissingReference {
                    entity: entity.to_string(),
                    field: field.to_string(),
                    key: target_key.unwrap_or_default(),
                    target: target.to_string(),
                });
            }
        }
    }
    Ok(())
}

fn discard_row(schema: &Schema, tables: &mut Tables, entity: &str, key: Key) -> StoreResult<()> {
    let removed = tables.get_mut(entity).and_then(|t| t.remove(&key));
    if removed.is_none() {
        return Ok(());
    }

    for child in schema.values() {
        for (field, target, on_delete) in child.references() {
            if target != entity {
                continue;
            }
            let dependents: Vec<Key> = tables
                .get(&child.name)
                .map(|t| {
                    t.iter()
                        .filter(|(_, row)| row.get(field).and_then(key_of) == Some(key))
                        .map(|(k, _)| *k)
                        .collect()
                })
                .unwrap_or_default();
            if dependents.is_empty() {
                continue;
            }
            match on_delete {
                OnDelete::Cascade => {
                    for dependent in dependents {
                        discard_row(schema, tables, &child.name, dependent)?;
                    }
                }
                OnDelete::Restrict => {
                    return Err(StoreError::ReferencedBy {
                        entity: entity.to_string(),
                        key,
                        referencing: child.name.clone(),
                    });
                }
            }
        }
    }
    Ok(())
}

fn project(def: &EntityDef, row: &Record, fields: &[String]) -> StoreResult<Record> {
    let mut out = Record::new();
    for field in fields {
        if def.field(field).is_none() {
            return Err(StoreError::UnknownField {
                entity: def.name.clone(),
                field: field.clone(),
            });
        }
        out.insert(field.clone(), row.get(field).cloned().unwrap_or(Value::Null));
    }
    Ok(out)
}

fn run_query(schema: &Schema, tables: &Tables, query: &Query) -> StoreResult<Vec<Value>> {
    let def = schema
        .get(&query.entity)
        .ok_or_else(|| StoreError::UnknownEntity(query.entity.clone()))?;

    let mut expansions = Vec::with_capacity(query.expand.len());
    for expand in &query.expand {
        let assoc = def
            .association(&expand.association)
            .ok_or_else(|| StoreError::UnknownAssociation {
                entity: def.name.clone(),
                association: expand.association.clone(),
            })?;
        let target = schema
            .get(&assoc.target)
            .ok_or_else(|| StoreError::UnknownEntity(assoc.target.clone()))?;
        expansions.push((expand, assoc, target));
    }

    let empty = Table::new();
    let rows = tables.get(&query.entity).unwrap_or(&empty);
    let mut out = Vec::with_capacity(rows.len());
    for (key, row) in rows {
        let mut projected = project(def, row, &query.fields)?;
        for (expand, assoc, target) in &expansions {
            let children = tables.get(&target.name).unwrap_or(&empty);
            let mut nested = Vec::new();
            for child in children.values() {
                if child.get(&assoc.via).and_then(key_of) == Some(*key) {
                    nested.push(Value::Object(project(target, child, &expand.fields)?));
                }
            }
            projected.insert(assoc.name.clone(), Value::Array(nested));
        }
        out.push(Value::Object(projected));
    }
    Ok(out)
}
