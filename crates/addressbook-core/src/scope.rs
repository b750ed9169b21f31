//! Transaction scope: one transaction bound to a borrowed connection for the
//! lifetime of one pipeline invocation.
//!
//! `close` commits on success and rolls back on error. A scope dropped without
//! `close` (early return, panic, dropped future) releases its transaction
//! synchronously.

use addressbook_store::{Connection, Store, Transaction};

use crate::error::{PipelineError, PipelineResult};

pub struct TransactionScope<'c> {
    tx: Box<dyn Transaction>,
    connection: &'c Connection,
    closed: bool,
}

impl<'c> TransactionScope<'c> {
    pub async fn begin(store: &dyn Store, connection: &'c Connection) -> PipelineResult<Self> {
        let tx = store
            .begin(connection)
            .await
            .map_err(PipelineError::Connection)?;
        tracing::debug!(connection = connection.id(), tx = tx.id(), "transaction opened");
        Ok(Self {
            tx,
            connection,
            closed: false,
        })
    }

    pub fn tx(&mut self) -> &mut dyn Transaction {
        self.tx.as_mut()
    }

    pub fn connection(&self) -> &Connection {
        self.connection
    }

    /// Close the scope according to `outcome`.
    ///
    /// `Ok` commits; a failed commit becomes [`PipelineError::Write`]. `Err`
    /// rolls back and is returned unchanged.
    pub async fn close<T>(mut self, outcome: PipelineResult<T>) -> PipelineResult<T> {
        let result = match outcome {
            Ok(value) => match self.tx.commit().await {
                Ok(()) => Ok(value),
                Err(e) => Err(PipelineError::Write(e)),
            },
            Err(err) => {
                if let Err(rollback) = self.tx.rollback().await {
                    tracing::warn!(
                        tx = self.tx.id(),
                        error = %rollback,
                        "rollback failed; releasing transaction"
                    );
                    self.tx.release();
                }
                Err(err)
            }
        };
        self.closed = true;
        tracing::debug!(
            connection = self.connection.id(),
            tx = self.tx.id(),
            ok = result.is_ok(),
            "transaction closed"
        );
        result
    }
}

impl Drop for TransactionScope<'_> {
    fn drop(&mut self) {
        if !self.closed {
            tracing::warn!(
                connection = self.connection.id(),
                tx = self.tx.id(),
                "transaction scope dropped without close; releasing"
            );
            self.tx.release();
        }
    }
}
