//! Address Book Core: request-scoped transactional pipelines
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────────┐
//! │                          ADDRESS BOOK CORE                          │
//! ├──────────────────────────────────────────────────────────────────────┤
//! │                                                                      │
//! │  request ──► ensure_initialized ──► begin ──► work ──► close ──► reply │
//! │               (EntityCatalog)      (TransactionScope)                │
//! │                                                                      │
//! │  work:                                                               │
//! │    list_books_with_addresses   query Book + addresses, reshape       │
//! │    create_sample_book          persist Book + 2 Addresses (atomic)   │
//! │    purge_all_books             fetch Books, check `Delete`, discard  │
//! │                                                                      │
//! └──────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Every pipeline borrows a connection handle owned by the caller and never
//! leaves a transaction open on any exit path.

pub mod catalog;
pub mod error;
pub mod principal;
pub mod purge;
pub mod read;
pub mod scope;
pub mod write;

use std::sync::Arc;

use addressbook_store::Store;

pub use catalog::{EntityCatalog, EntityModel};
pub use error::{PipelineError, PipelineResult};
pub use principal::{Principal, DELETE_SCOPE};
pub use purge::PurgeReport;
pub use read::{reshape_books, BookTree, ROOT_KEY};
pub use scope::TransactionScope;
pub use write::{IdGenerator, RandomIds, SeededBook};

/// The address book service: a store plus the entity metadata cache every
/// pipeline shares.
pub struct AddressBook {
    store: Arc<dyn Store>,
    catalog: EntityCatalog,
    ids: Arc<dyn IdGenerator>,
}

impl AddressBook {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self {
            catalog: EntityCatalog::new(Arc::clone(&store)),
            store,
            ids: Arc::new(RandomIds),
        }
    }

    /// Replace the id source used by the sample-data pipeline.
    pub fn with_id_generator(mut self, ids: impl IdGenerator + 'static) -> Self {
        self.ids = Arc::new(ids);
        self
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    pub fn catalog(&self) -> &EntityCatalog {
        &self.catalog
    }
}
