//! Error taxonomy for the replication engine

use crate::cid::{display_head, Cid};

/// Result type for engine operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors raised by the store, the repo model, bundle I/O and the resolver
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A value cannot be canonicalized (NaN, infinity, non-string map key).
    #[error("Encoding error: {0}")]
    Encoding(String),

    #[error("Decoding error: {0}")]
    Decoding(String),

    #[error("Block not found: {0}")]
    NotFound(Cid),

    #[error("Entity not found: {0}")]
    EntityNotFound(String),

    #[error("Repository not found: {0}")]
    RepoNotFound(String),

    #[error("CID mismatch in {state} state: expected {expected}, received {received}")]
    CidMismatch {
        expected: Cid,
        received: Cid,
        state: &'static str,
    },

    #[error("Unexpected block {cid} in {state} state: {reason}")]
    UnexpectedBlock {
        cid: Cid,
        state: &'static str,
        reason: String,
    },

    #[error("Bundle stream ended inside a bundle ({state} state)")]
    TruncatedBundle { state: &'static str },

    #[error("Bundle belongs to repository {found}, expected {expected}")]
    RepoMismatch { expected: String, found: String },

    #[error("Invalid signature: {0}")]
    SignatureInvalid(String),

    #[error("No capability authorizes {agent} to publish to {repo}")]
    CapabilityMissing { agent: String, repo: String },

    #[error("Invalid capability token: {0}")]
    InvalidCapability(String),

    #[error("Relation to {uri} (from {entity}) could not be resolved")]
    RelationUnresolved { uri: String, entity: String },

    #[error("Circular relation between {from} and {to}")]
    CircularRelation { from: String, to: String },

    #[error("Stale head: expected {}, found {}", display_head(.expected), display_head(.actual))]
    StaleHead {
        expected: Option<Cid>,
        actual: Option<Cid>,
    },

    #[error("Entity {entity} has type {expected}, revision declares {found}")]
    EntityTypeMismatch {
        entity: String,
        expected: String,
        found: String,
    },

    #[error("Schema violation: {0}")]
    Schema(String),

    #[error("Invalid identifier: {0}")]
    InvalidId(String),

    #[error("Invalid DID: {0}")]
    InvalidDid(String),

    #[error("Datasource error: {0}")]
    Datasource(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Storage backend error: {0}")]
    Storage(String),
}

impl Error {
    /// Whether the caller can retry or continue after this error.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Error::NotFound(_)
                | Error::EntityNotFound(_)
                | Error::RepoNotFound(_)
                | Error::StaleHead { .. }
        )
    }
}

impl From<rusqlite::Error> for Error {
    fn from(e: rusqlite::Error) -> Self {
        Error::Database(e.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Decoding(e.to_string())
    }
}
