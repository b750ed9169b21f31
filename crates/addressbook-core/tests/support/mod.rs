//! Fault-injecting store wrapper shared by the pipeline tests.

#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use addressbook_core::{AddressBook, IdGenerator};
use addressbook_store::{
    Connection, EntityDef, Key, MemoryStore, MetadataImport, Query, Record, Store, StoreError,
    StoreResult, Transaction, TxState,
};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;

#[derive(Default)]
pub struct FaultyStore {
    pub inner: MemoryStore,
    /// Fail this many upcoming imports.
    pub import_failures: AtomicUsize,
    /// Import attempts, successful or not.
    pub import_attempts: AtomicUsize,
    pub import_delay: Mutex<Option<Duration>>,
    pub fail_query: AtomicBool,
    /// Fail `persist` calls for this entity.
    pub fail_persist_of: Mutex<Option<String>>,
}

impl FaultyStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }
}

#[async_trait]
impl Store for FaultyStore {
    async fn import_metadata(&self, request: &MetadataImport) -> StoreResult<Vec<EntityDef>> {
        self.import_attempts.fetch_add(1, Ordering::SeqCst);
        let delay = *self.import_delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        let should_fail = self
            .import_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if should_fail {
            return Err(StoreError::Unavailable("metadata service down".to_string()));
        }
        self.inner.import_metadata(request).await
    }

    async fn acquire(&self) -> StoreResult<Connection> {
        self.inner.acquire().await
    }

    fn release(&self, connection: Connection) {
        self.inner.release(connection);
    }

    async fn begin(&self, connection: &Connection) -> StoreResult<Box<dyn Transaction>> {
        let inner = self.inner.begin(connection).await?;
        Ok(Box::new(FaultyTransaction {
            inner,
            fail_query: self.fail_query.load(Ordering::SeqCst),
            fail_persist_of: self.fail_persist_of.lock().clone(),
        }))
    }
}

struct FaultyTransaction {
    inner: Box<dyn Transaction>,
    fail_query: bool,
    fail_persist_of: Option<String>,
}

#[async_trait]
impl Transaction for FaultyTransaction {
    fn id(&self) -> u64 {
        self.inner.id()
    }

    fn state(&self) -> TxState {
        self.inner.state()
    }

    async fn query(&mut self, query: &Query) -> StoreResult<Vec<Value>> {
        if self.fail_query {
            return Err(StoreError::Unavailable("query timed out".to_string()));
        }
        self.inner.query(query).await
    }

    async fn persist(&mut self, entity: &str, records: Vec<Record>) -> StoreResult<()> {
        if self.fail_persist_of.as_deref() == Some(entity) {
            return Err(StoreError::Unavailable(format!("cannot write `{entity}`")));
        }
        self.inner.persist(entity, records).await
    }

    async fn discard(&mut self, entity: &str, keys: &[Key]) -> StoreResult<()> {
        self.inner.discard(entity, keys).await
    }

    async fn commit(&mut self) -> StoreResult<()> {
        self.inner.commit().await
    }

    async fn rollback(&mut self) -> StoreResult<()> {
        self.inner.rollback().await
    }

    fn release(&mut self) {
        self.inner.release();
    }
}

/// Hands out ids from a fixed list, then repeats the last one.
pub struct FixedIds {
    ids: Mutex<Vec<Key>>,
}

impl FixedIds {
    pub fn new(ids: impl IntoIterator<Item = Key>) -> Self {
        let mut ids: Vec<Key> = ids.into_iter().collect();
        ids.reverse();
        Self {
            ids: Mutex::new(ids),
        }
    }
}

impl IdGenerator for FixedIds {
    fn next_id(&self) -> Key {
        let mut ids = self.ids.lock();
        if ids.len() > 1 {
            ids.pop().unwrap_or_default()
        } else {
            ids.first().copied().unwrap_or(1)
        }
    }
}

pub fn book_over(store: &Arc<FaultyStore>) -> AddressBook {
    let dyn_store: Arc<dyn Store> = store.clone();
    AddressBook::new(dyn_store)
}
