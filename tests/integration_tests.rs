//! Integration tests for the complete address book stack
//!
//! These tests drive the pipelines in `addressbook-core` against the
//! in-memory store from `addressbook-store`, the way the HTTP layer does:
//! one connection per request, released afterwards.
//!
//! Run with: cargo test --test integration_tests

use std::collections::BTreeSet;
use std::sync::Arc;

use addressbook_core::catalog::{ADDRESS, BOOK};
use addressbook_core::{AddressBook, PipelineError, Principal, DELETE_SCOPE};
use addressbook_store::{MemoryStore, Query, Store};

fn service() -> (MemoryStore, Arc<AddressBook>) {
    let store = MemoryStore::new();
    let dyn_store: Arc<dyn Store> = Arc::new(store.clone());
    (store, Arc::new(AddressBook::new(dyn_store)))
}

fn admin() -> Principal {
    Principal::new("admin", [DELETE_SCOPE])
}

// ============================================================================
// Request lifecycle
// ============================================================================

#[tokio::test]
async fn test_request_lifecycle_seed_list_purge() {
    let (store, book) = service();

    let conn = store.acquire().await.unwrap();
    let seeded = book.create_sample_book(&conn, "alice").await.unwrap();
    store.release(conn);

    let conn = store.acquire().await.unwrap();
    let tree = book.list_books_with_addresses(&conn).await.unwrap();
    store.release(conn);

    let entry = tree.book(&seeded.book_id.to_string()).expect("seeded book listed");
    let addresses = entry["addresses"].as_object().unwrap();
    let listed: BTreeSet<String> = addresses.keys().cloned().collect();
    let expected: BTreeSet<String> = seeded.address_ids.iter().map(|id| id.to_string()).collect();
    assert_eq!(listed, expected);

    let conn = store.acquire().await.unwrap();
    let report = book.purge_all_books(&conn, &admin()).await.unwrap();
    store.release(conn);

    assert_eq!(report.deleted_books, 1);
    assert_eq!(store.count(BOOK), 0);
    assert_eq!(store.count(ADDRESS), 0);
    assert_eq!(store.open_connections(), 0);
}

#[tokio::test]
async fn test_denied_purge_leaves_data_and_connection_reusable() {
    let (store, book) = service();
    let conn = store.acquire().await.unwrap();
    book.create_sample_book(&conn, "alice").await.unwrap();

    let reader = Principal::new("alice", ["Read"]);
    let err = book.purge_all_books(&conn, &reader).await.unwrap_err();
    assert!(matches!(err, PipelineError::Authorization { .. }));
    assert_eq!(err.status_code(), 403);

    // The same handle can immediately run another pipeline.
    let tree = book.list_books_with_addresses(&conn).await.unwrap();
    assert_eq!(tree.len(), 1);
    store.release(conn);
}

// ============================================================================
// Concurrency
// ============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_requests_share_one_catalog() {
    let (store, book) = service();

    let mut handles = Vec::new();
    for i in 0..8 {
        let store = store.clone();
        let book = Arc::clone(&book);
        handles.push(tokio::spawn(async move {
            let conn = store.acquire().await.unwrap();
            let result = book.create_sample_book(&conn, &format!("user{i}")).await;
            store.release(conn);
            result
        }));
    }
    for handle in handles {
        handle.await.unwrap().unwrap();
    }

    assert_eq!(store.import_count(), 1);
    assert_eq!(store.count(BOOK), 8);
    assert_eq!(store.count(ADDRESS), 16);
    assert_eq!(store.open_connections(), 0);

    let conn = store.acquire().await.unwrap();
    let tree = book.list_books_with_addresses(&conn).await.unwrap();
    store.release(conn);
    assert_eq!(tree.len(), 8);
    for (_, entry) in tree.books() {
        assert_eq!(entry["addresses"].as_object().unwrap().len(), 2);
    }
}

// ============================================================================
// Store contract as seen through the pipelines
// ============================================================================

#[tokio::test]
async fn test_every_address_references_an_existing_book() {
    let (store, book) = service();
    let conn = store.acquire().await.unwrap();
    for owner in ["alice", "bob", "carol"] {
        book.create_sample_book(&conn, owner).await.unwrap();
    }

    let mut tx = store.begin(&conn).await.unwrap();
    let books = tx.query(&Query::new(BOOK).select(["id"])).await.unwrap();
    let addresses = tx
        .query(&Query::new(ADDRESS).select(["id", "book"]))
        .await
        .unwrap();
    tx.rollback().await.unwrap();
    store.release(conn);

    let book_ids: BTreeSet<_> = books.iter().map(|b| b["id"].to_string()).collect();
    assert_eq!(book_ids.len(), 3);
    assert_eq!(addresses.len(), 6);
    for address in &addresses {
        assert!(book_ids.contains(&address["book"].to_string()));
    }
}
