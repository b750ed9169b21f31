//! Bearer-token identity.
//!
//! Tokens are looked up in a static directory loaded at startup; the matching
//! entry becomes the request's [`Principal`]. There is no expiry or signature
//! check.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use addressbook_core::Principal;
use serde::Deserialize;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum IdentityError {
    #[error("failed to read token file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid token file: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("missing Authorization: Bearer <token>")]
    MissingCredentials,

    #[error("Authorization header is not a bearer token")]
    MalformedCredentials,

    #[error("unknown bearer token")]
    UnknownToken,
}

#[derive(Debug, Deserialize)]
struct TokenFile {
    tokens: HashMap<String, Principal>,
}

/// Token → principal lookup.
#[derive(Debug, Default)]
pub struct TokenDirectory {
    tokens: HashMap<String, Principal>,
}

impl TokenDirectory {
    pub fn load(path: &Path) -> Result<Self, IdentityError> {
        let text = std::fs::read_to_string(path).map_err(|source| IdentityError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_json(&text)
    }

    pub fn from_json(text: &str) -> Result<Self, IdentityError> {
        let file: TokenFile = serde_json::from_str(text)?;
        Ok(Self {
            tokens: file.tokens,
        })
    }

    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }

    /// Resolve the raw `Authorization` header value to a principal.
    pub fn authenticate(&self, header: Option<&str>) -> Result<&Principal, IdentityError> {
        let header = header.ok_or(IdentityError::MissingCredentials)?;
        let token = bearer_token(header).ok_or(IdentityError::MalformedCredentials)?;
        self.tokens.get(token).ok_or(IdentityError::UnknownToken)
    }
}

fn bearer_token(header: &str) -> Option<&str> {
    let token = header
        .strip_prefix("Bearer ")
        .or_else(|| header.strip_prefix("bearer "))?
        .trim();
    (!token.is_empty()).then_some(token)
}
