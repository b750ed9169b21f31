//! Entity metadata cache.
//!
//! The `Book` / `Address` definitions are resolved against the store once and
//! then shared by every pipeline. Population is single-flight: concurrent
//! first callers wait on the same import, and a failed import leaves the cell
//! empty so the next caller retries.

use std::sync::Arc;

use addressbook_store::{EntityDef, MetadataImport, OnDelete, Store, StoreError};
use tokio::sync::OnceCell;

use crate::error::{PipelineError, PipelineResult};

pub const BOOK: &str = "Book";
pub const ADDRESS: &str = "Address";
pub const KEY_FIELD: &str = "id";
/// Back-link from `Book` to its `Address` rows.
pub const BOOK_ADDRESSES: &str = "addresses";
/// Reference from `Address` to its owning `Book`.
pub const ADDRESS_BOOK: &str = "book";

/// Address fields projected by the tree listing.
pub const ADDRESS_LIST_FIELDS: [&str; 5] = ["id", "first_name", "last_name", "phone", "city"];

/// The resolved pair of entity definitions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntityModel {
    pub book: EntityDef,
    pub address: EntityDef,
}

pub struct EntityCatalog {
    store: Arc<dyn Store>,
    model: OnceCell<Arc<EntityModel>>,
}

impl EntityCatalog {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self {
            store,
            model: OnceCell::new(),
        }
    }

    /// The metadata-import request describing both entities and the
    /// `Address.book` back-link.
    pub fn import_request() -> MetadataImport {
        MetadataImport::new(vec![
            EntityDef::new(BOOK, KEY_FIELD)
                .text("name")
                .back_link(BOOK_ADDRESSES, ADDRESS, ADDRESS_BOOK),
            EntityDef::new(ADDRESS, KEY_FIELD)
                .reference(ADDRESS_BOOK, BOOK, OnDelete::Cascade)
                .text("first_name")
                .text("last_name")
                .text("address")
                .text("city")
                .text("country")
                .text("zip")
                .text("phone")
                .text("email")
                .text("web"),
        ])
    }

    /// Return the cached model, importing it on first use.
    pub async fn ensure_initialized(&self) -> PipelineResult<Arc<EntityModel>> {
        self.model
            .get_or_try_init(|| self.import())
            .await
            .map(Arc::clone)
    }

    /// The cached model, if an import has already succeeded.
    pub fn get(&self) -> Option<Arc<EntityModel>> {
        self.model.get().cloned()
    }

    async fn import(&self) -> PipelineResult<Arc<EntityModel>> {
        let request = Self::import_request();
        let resolved = match self.store.import_metadata(&request).await {
            Ok(resolved) => resolved,
            Err(e) => {
                tracing::warn!(error = %e, "entity metadata import failed; will retry on next use");
                return Err(PipelineError::MetadataImport(e));
            }
        };

        let pick = |name: &str| {
            resolved
                .iter()
                .find(|def| def.name == name)
                .cloned()
                .ok_or_else(|| {
                    PipelineError::MetadataImport(StoreError::InvalidMetadata(format!(
                        "store did not resolve `{name}`"
                    )))
                })
        };
        let model = EntityModel {
            book: pick(BOOK)?,
            address: pick(ADDRESS)?,
        };

        tracing::info!(
            book_fields = model.book.fields.len(),
            address_fields = model.address.fields.len(),
            "entity metadata imported"
        );
        Ok(Arc::new(model))
    }
}
