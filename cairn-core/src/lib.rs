//! Cairn Core Library
//!
//! Content-addressed, append-only replication store:
//! - Canonical value codec (DAG-CBOR) and CIDs
//! - Time-sortable identifiers
//! - Block storage (memory, fjall, LRU cache)
//! - Signed commit chain per repo, with a SQLite revision index
//! - Keypairs and publishing delegations
//! - Bundle export/import over CARv1 streams
//! - Cross-entity relation resolution
//! - Node context, transfer log and integrity checks

mod base32;
pub mod capability;
pub mod car;
pub mod cid;
pub mod codec;
pub mod config;
pub mod error;
pub mod export;
pub mod ids;
pub mod import;
pub mod index;
pub mod keys;
pub mod model;
pub mod node;
pub mod relations;
pub mod repo;
pub mod schema;
pub mod storage;
pub mod transfer_log;
pub mod verify;

#[cfg(test)]
mod test_support;

pub use capability::{Capability, CapabilityClaims, Signer, PUBLISH_SCOPE};
pub use cid::Cid;
pub use codec::Value;
pub use config::{NodeConfig, ResolutionMode};
pub use error::{Error, Result};
pub use export::{ExportOptions, ExportOrder, ExportProgress, Exporter};
pub use ids::{Clock, IdGenerator, ManualClock, SystemClock, Uid};
pub use import::{BundleParser, ImportProgress, Importer, ParserState};
pub use index::{RevisionFilter, RevisionIndex, SqliteIndex};
pub use keys::{KeyStore, Keypair};
pub use model::{Bundle, Commit, Entity, EntityInput, RelationValue, Revision, Root};
pub use node::{ExportStream, IngestReport, Node, ReconcileReport};
pub use relations::{Datasource, FetchResult, NoDatasource, RelationFinder, Resolution, ResolvedBatch};
pub use repo::{ApplyOutcome, CommitOutcome, CommitSummary, ParentHint, Repo, RepoContext, RevisionPage};
pub use schema::{FieldKind, Schema, TypeSchema};
pub use storage::{BlockStore, BlockStoreExt, CachedBlockStore, FjallBlockStore, MemoryBlockStore};
pub use transfer_log::{TransferLog, TransferLogEntry};
pub use verify::VerifyReport;
