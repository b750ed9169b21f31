//! Pipeline error types.

use addressbook_store::StoreError;
use thiserror::Error;

/// Everything a pipeline can return to the HTTP boundary.
#[derive(Debug, Error)]
pub enum PipelineError {
    /// Entity/association resolution failed. Nothing was cached.
    #[error("entity metadata import failed: {0}")]
    MetadataImport(#[source] StoreError),

    /// No transaction could be bound to the supplied connection.
    #[error("could not bind a transaction to the connection: {0}")]
    Connection(#[source] StoreError),

    /// A read failed after the transaction was opened.
    #[error("query failed: {0}")]
    Query(#[source] StoreError),

    /// A create, discard or commit failed after the transaction was opened.
    #[error("write failed: {0}")]
    Write(#[source] StoreError),

    /// The principal lacks a scope required by a destructive operation.
    #[error("user `{user}` is missing scope `{scope}`: {remediation}")]
    Authorization {
        user: String,
        scope: String,
        remediation: String,
    },
}

impl PipelineError {
    pub fn authorization(user: impl Into<String>, scope: impl Into<String>) -> Self {
        let user = user.into();
        let scope = scope.into();
        let remediation = format!(
            "assign a role collection granting the `{scope}` scope to `{user}` and sign in again"
        );
        Self::Authorization {
            user,
            scope,
            remediation,
        }
    }

    /// HTTP status the boundary maps this error to.
    pub fn status_code(&self) -> u16 {
        match self {
            Self::Authorization { .. } => 403,
            _ => 500,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::MetadataImport(_) => "metadata_import",
            Self::Connection(_) => "connection",
            Self::Query(_) => "query",
            Self::Write(_) => "write",
            Self::Authorization { .. } => "authorization",
        }
    }
}

pub type PipelineResult<T> = Result<T, PipelineError>;
