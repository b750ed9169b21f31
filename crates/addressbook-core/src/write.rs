//! Write pipeline: seed one Book with two fixed sample Addresses.
//!
//! This is a fixture generator, not a general create API. The Book and both
//! Addresses are staged in one transaction and committed together, so a
//! failure at any step leaves nothing behind.

use addressbook_store::{Connection, Key, Record};
use rand::Rng;
use serde::Serialize;
use serde_json::{json, Value};

use crate::catalog::{ADDRESS, ADDRESS_BOOK, BOOK, KEY_FIELD};
use crate::error::{PipelineError, PipelineResult};
use crate::scope::TransactionScope;
use crate::AddressBook;

/// Source of record ids for generated sample data.
pub trait IdGenerator: Send + Sync {
    fn next_id(&self) -> Key;
}

/// Pseudo-random ids from the thread-local RNG.
#[derive(Debug, Clone, Copy, Default)]
pub struct RandomIds;

impl RandomIds {
    pub const MAX: Key = u32::MAX as Key;
}

impl IdGenerator for RandomIds {
    fn next_id(&self) -> Key {
        rand::thread_rng().gen_range(1..=Self::MAX)
    }
}

/// Ids of the records created by [`AddressBook::create_sample_book`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SeededBook {
    pub book_id: Key,
    pub address_ids: [Key; 2],
}

pub fn sample_book_name(id: Key, owner_label: &str) -> String {
    format!("My Book #{id} created by {owner_label}")
}

fn into_record(value: Value) -> Record {
    match value {
        Value::Object(map) => map,
        _ => Record::new(),
    }
}

fn sample_addresses(book_id: Key, ids: [Key; 2]) -> Vec<Record> {
    vec![
        into_record(json!({
            KEY_FIELD: ids[0],
            ADDRESS_BOOK: book_id,
            "first_name": "John",
            "last_name": "Doe",
            "address": "Dietmar-Hopp-Allee 16",
            "city": "Walldorf",
            "country": "Germany",
            "zip": "69190",
            "phone": "+49 6227 7-47474",
            "email": "john.doe@example.com",
            "web": "https://www.example.com",
        })),
        into_record(json!({
            KEY_FIELD: ids[1],
            ADDRESS_BOOK: book_id,
            "first_name": "Jane",
            "last_name": "Roe",
            "address": "3999 West Chester Pike",
            "city": "Newtown Square",
            "country": "USA",
            "zip": "19073",
            "phone": "+1 610 661-1000",
            "email": "jane.roe@example.com",
            "web": "https://www.example.org",
        })),
    ]
}

impl AddressBook {
    pub async fn create_sample_book(
        &self,
        connection: &Connection,
        owner_label: &str,
    ) -> PipelineResult<SeededBook> {
        self.catalog().ensure_initialized().await?;
        let mut scope = TransactionScope::begin(self.store().as_ref(), connection).await?;

        let seeded = SeededBook {
            book_id: self.ids.next_id(),
            address_ids: [self.ids.next_id(), self.ids.next_id()],
        };
        let outcome = persist_sample(&mut scope, &seeded, owner_label).await;
        let seeded = scope.close(outcome.map(|()| seeded)).await?;

        tracing::info!(
            book_id = seeded.book_id,
            owner = owner_label,
            "sample book created"
        );
        Ok(seeded)
    }
}

async fn persist_sample(
    scope: &mut TransactionScope<'_>,
    seeded: &SeededBook,
    owner_label: &str,
) -> PipelineResult<()> {
    let book = into_record(json!({
        KEY_FIELD: seeded.book_id,
        "name": sample_book_name(seeded.book_id, owner_label),
    }));
    scope
        .tx()
        .persist(BOOK, vec![book])
        .await
        .map_err(PipelineError::Write)?;
    scope
        .tx()
        .persist(ADDRESS, sample_addresses(seeded.book_id, seeded.address_ids))
        .await
        .map_err(PipelineError::Write)
}
