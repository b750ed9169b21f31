//! Delete pipeline: discard every Book, gated on the `Delete` scope.
//!
//! Stages:
//!
//! ```text
//! Init → MetadataReady → TxOpen → BooksFetched → AuthChecked ─┬─► Deleted ─┬─► Closed
//!                                                             └─► Denied ──┘
//! ```
//!
//! Address rows go with their Book through the store's cascade rule on
//! `Address.book`; nothing here touches them directly.

use addressbook_store::{key_of, Connection, Key, Query};
use serde::Serialize;

use crate::catalog::{BOOK, KEY_FIELD};
use crate::error::{PipelineError, PipelineResult};
use crate::principal::{Principal, DELETE_SCOPE};
use crate::scope::TransactionScope;
use crate::AddressBook;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum PurgeStage {
    Init,
    MetadataReady,
    TxOpen,
    BooksFetched,
    AuthChecked,
    Deleted,
    Denied,
    Closed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PurgeReport {
    pub deleted_books: usize,
}

struct StageTracker {
    stage: PurgeStage,
}

impl StageTracker {
    fn new() -> Self {
        Self {
            stage: PurgeStage::Init,
        }
    }

    fn current(&self) -> PurgeStage {
        self.stage
    }

    fn advance(&mut self, next: PurgeStage) {
        tracing::debug!(from = ?self.stage, to = ?next, "purge stage");
        self.stage = next;
    }
}

impl AddressBook {
    pub async fn purge_all_books(
        &self,
        connection: &Connection,
        principal: &Principal,
    ) -> PipelineResult<PurgeReport> {
        let mut stages = StageTracker::new();

        self.catalog().ensure_initialized().await?;
        stages.advance(PurgeStage::MetadataReady);

        let mut scope = TransactionScope::begin(self.store().as_ref(), connection).await?;
        stages.advance(PurgeStage::TxOpen);

        let outcome = purge_in_scope(&mut scope, principal, &mut stages).await;
        let reached = stages.current();
        let result = scope.close(outcome).await;
        stages.advance(PurgeStage::Closed);

        let deleted_books = result.map_err(|e| {
            tracing::debug!(stage = ?reached, error = %e, "purge failed");
            e
        })?;
        tracing::info!(user = %principal.user, deleted_books, "address book purged");
        Ok(PurgeReport { deleted_books })
    }
}

async fn purge_in_scope(
    scope: &mut TransactionScope<'_>,
    principal: &Principal,
    stages: &mut StageTracker,
) -> PipelineResult<usize> {
    let rows = scope
        .tx()
        .query(&Query::new(BOOK).select([KEY_FIELD]))
        .await
        .map_err(PipelineError::Query)?;
    let keys: Vec<Key> = rows
        .iter()
        .filter_map(|row| row.get(KEY_FIELD).and_then(key_of))
        .collect();
    stages.advance(PurgeStage::BooksFetched);

    let granted = principal.has_scope(DELETE_SCOPE);
    stages.advance(PurgeStage::AuthChecked);
    if !granted {
        stages.advance(PurgeStage::Denied);
        tracing::warn!(
            user = %principal.user,
            scope = DELETE_SCOPE,
            books = keys.len(),
            "purge denied"
        );
        return Err(PipelineError::authorization(&principal.user, DELETE_SCOPE));
    }

    scope
        .tx()
        .discard(BOOK, &keys)
        .await
        .map_err(PipelineError::Write)?;
    stages.advance(PurgeStage::Deleted);
    Ok(keys.len())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tracker_starts_at_init_and_follows_advances() {
        let mut stages = StageTracker::new();
        assert_eq!(stages.current(), PurgeStage::Init);
        for next in [
            PurgeStage::MetadataReady,
            PurgeStage::TxOpen,
            PurgeStage::BooksFetched,
            PurgeStage::AuthChecked,
            PurgeStage::Denied,
            PurgeStage::Closed,
        ] {
            stages.advance(next);
            assert_eq!(stages.current(), next);
        }
    }
}
