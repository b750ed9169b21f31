use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Scope required to purge the address book.
pub const DELETE_SCOPE: &str = "Delete";

/// An authenticated caller and the scopes granted to it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Principal {
    pub user: String,
    #[serde(default)]
    pub scopes: BTreeSet<String>,
}

impl Principal {
    pub fn new<I, S>(user: impl Into<String>, scopes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            user: user.into(),
            scopes: scopes.into_iter().map(Into::into).collect(),
        }
    }

    pub fn has_scope(&self, name: &str) -> bool {
        self.scopes.contains(name)
    }
}
