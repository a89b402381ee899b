//! Bundle importer
//!
//! `BundleParser` is the validating state machine
//! `Root -> Commit -> Revision -> Content -> (Revision | Yield)`. It sees one
//! block at a time and hands out a bundle once the commit's last content
//! block arrives. `Importer` drives it over a bundle stream and replays each
//! yielded bundle into a repo; a violation aborts the stream, and bundles
//! applied before it stay committed.

use bytes::Bytes;
use serde::Serialize;
use std::collections::HashSet;
use tokio::io::AsyncRead;
use tracing::{debug, info, warn};

use crate::car::CarReader;
use crate::cid::Cid;
use crate::codec;
use crate::error::{Error, Result};
use crate::model::{Bundle, BundleRevision, Commit, Revision, Root};
use crate::repo::{verify_root, ApplyOutcome, Repo};

/// Where the parser is within a bundle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParserState {
    Root,
    Commit,
    Revision,
    Content,
    Yield,
}

impl ParserState {
    pub fn name(self) -> &'static str {
        match self {
            ParserState::Root => "Root",
            ParserState::Commit => "Commit",
            ParserState::Revision => "Revision",
            ParserState::Content => "Content",
            ParserState::Yield => "Yield",
        }
    }
}

fn unexpected(state: ParserState, cid: Cid, reason: impl Into<String>) -> Error {
    Error::UnexpectedBlock {
        cid,
        state: state.name(),
        reason: reason.into(),
    }
}

struct Partial {
    root_cid: Cid,
    root: Root,
    root_bytes: Bytes,
    commit: Option<(Cid, Commit, Bytes)>,
    listed: HashSet<Cid>,
    revisions: Vec<BundleRevision>,
    pending: Option<(Cid, Revision, Bytes)>,
}

/// Validating block-by-block bundle assembler for one repo
pub struct BundleParser {
    repo_did: String,
    state: ParserState,
    partial: Option<Partial>,
}

impl BundleParser {
    pub fn new(repo_did: impl Into<String>) -> Self {
        Self {
            repo_did: repo_did.into(),
            state: ParserState::Root,
            partial: None,
        }
    }

    pub fn state(&self) -> ParserState {
        self.state
    }

    /// Feed the next block; returns a bundle when this block completes one
    pub fn push(&mut self, cid: Cid, data: Bytes) -> Result<Option<Bundle>> {
        let state = self.state;
        let received = Cid::for_block(&data);
        if received != cid {
            return Err(Error::CidMismatch {
                expected: cid,
                received,
                state: state.name(),
            });
        }

        match state {
            ParserState::Root => {
                let root = codec::decode(&data)
                    .and_then(|v| Root::from_value(&v))
                    .map_err(|e| unexpected(state, cid, format!("not a root: {}", e)))?;
                self.partial = Some(Partial {
                    root_cid: cid,
                    root,
                    root_bytes: data,
                    commit: None,
                    listed: HashSet::new(),
                    revisions: Vec::new(),
                    pending: None,
                });
                self.state = ParserState::Commit;
                Ok(None)
            }
            ParserState::Commit => {
                let partial = self.partial_mut()?;
                if cid != partial.root.commit {
                    return Err(Error::CidMismatch {
                        expected: partial.root.commit,
                        received: cid,
                        state: ParserState::Commit.name(),
                    });
                }
                let commit = codec::decode(&data)
                    .and_then(|v| Commit::from_value(&v))
                    .map_err(|e| unexpected(state, cid, format!("not a commit: {}", e)))?;
                if commit.repo_did != self.repo_did {
                    return Err(Error::RepoMismatch {
                        expected: self.repo_did.clone(),
                        found: commit.repo_did,
                    });
                }
                let partial = self.partial_mut()?;
                verify_root(&partial.root, cid, &commit)?;
                partial.listed = commit.revisions.iter().copied().collect();
                if partial.listed.len() != commit.revisions.len() {
                    return Err(unexpected(state, cid, "commit lists a revision twice"));
                }
                let empty = commit.revisions.is_empty();
                partial.commit = Some((cid, commit, data));
                if empty {
                    return self.yield_bundle().map(Some);
                }
                self.state = ParserState::Revision;
                Ok(None)
            }
            ParserState::Revision => {
                let listed = self.partial_mut()?.listed.remove(&cid);
                if !listed {
                    return Err(unexpected(state, cid, "not listed in commit, or repeated"));
                }
                let revision = codec::decode(&data)
                    .and_then(|v| Revision::from_value(&v))
                    .map_err(|e| unexpected(state, cid, format!("not a revision: {}", e)))?;
                self.partial_mut()?.pending = Some((cid, revision, data));
                self.state = ParserState::Content;
                Ok(None)
            }
            ParserState::Content => {
                let partial = self.partial_mut()?;
                let Some((rev_cid, revision, bytes)) = partial.pending.take() else {
                    return Err(unexpected(state, cid, "no revision awaiting content"));
                };
                if cid != revision.content_cid {
                    return Err(Error::CidMismatch {
                        expected: revision.content_cid,
                        received: cid,
                        state: ParserState::Content.name(),
                    });
                }
                partial.revisions.push(BundleRevision {
                    cid: rev_cid,
                    revision,
                    bytes,
                    content: data,
                });
                if partial.listed.is_empty() {
                    return self.yield_bundle().map(Some);
                }
                self.state = ParserState::Revision;
                Ok(None)
            }
            ParserState::Yield => Err(unexpected(state, cid, "parser did not reset")),
        }
    }

    /// The stream ended; anything but a bundle boundary is truncation
    pub fn finish(&self) -> Result<()> {
        match self.state {
            ParserState::Root => Ok(()),
            state => Err(Error::TruncatedBundle { state: state.name() }),
        }
    }

    fn partial_mut(&mut self) -> Result<&mut Partial> {
        let state = self.state.name();
        self.partial.as_mut().ok_or(Error::TruncatedBundle { state })
    }

    fn yield_bundle(&mut self) -> Result<Bundle> {
        self.state = ParserState::Yield;
        let partial = self.partial.take().ok_or(Error::TruncatedBundle {
            state: ParserState::Yield.name(),
        })?;
        let (commit_cid, commit, commit_bytes) = partial.commit.ok_or(Error::TruncatedBundle {
            state: ParserState::Commit.name(),
        })?;
        self.state = ParserState::Root;
        Ok(Bundle {
            root_cid: partial.root_cid,
            root: partial.root,
            root_bytes: partial.root_bytes,
            commit_cid,
            commit,
            commit_bytes,
            revisions: partial.revisions,
        })
    }
}

/// Running totals of an import
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ImportProgress {
    pub blocks: u64,
    pub bytes_total: u64,
    /// Blocks of bundles the repo already had
    pub skipped: u64,
    /// Bundles applied
    pub bundles: u64,
}

type ProgressFn<'a> = Box<dyn FnMut(&ImportProgress) + Send + Sync + 'a>;

/// Replays a bundle stream into a repo
pub struct Importer<'a> {
    repo: &'a Repo,
    max_block_size: usize,
    progress: ImportProgress,
    on_progress: Option<ProgressFn<'a>>,
}

impl<'a> Importer<'a> {
    pub fn new(repo: &'a Repo) -> Self {
        Self {
            repo,
            max_block_size: repo.context().config.max_block_size,
            progress: ImportProgress::default(),
            on_progress: None,
        }
    }

    pub fn on_progress(mut self, callback: impl FnMut(&ImportProgress) + Send + Sync + 'a) -> Self {
        self.on_progress = Some(Box::new(callback));
        self
    }

    /// Totals so far; still meaningful after `run` failed
    pub fn progress(&self) -> ImportProgress {
        self.progress
    }

    pub async fn run<R: AsyncRead + Unpin + Send>(&mut self, reader: R) -> Result<ImportProgress> {
        let mut car = CarReader::new(reader, self.max_block_size).await?;
        debug!("Importing into {} with roots {:?}", self.repo.did(), car.roots());
        self.progress.bytes_total = car.bytes_read();
        let mut parser = BundleParser::new(self.repo.did());

        let result = async {
            while let Some(section) = car.next_section().await? {
                self.progress.blocks += 1;
                self.progress.bytes_total = car.bytes_read();
                let Some(bundle) = parser.push(section.cid, section.data)? else {
                    continue;
                };
                match self.repo.apply_bundle(&bundle).await? {
                    ApplyOutcome::Applied => self.progress.bundles += 1,
                    ApplyOutcome::AlreadyPresent => {
                        self.progress.skipped += bundle.blocks().len() as u64;
                    }
                }
                if let Some(callback) = self.on_progress.as_mut() {
                    callback(&self.progress);
                }
            }
            parser.finish()
        }
        .await;

        match result {
            Ok(()) => {
                info!(
                    "Imported {} bundle(s), {} blocks ({} skipped), {} bytes into {}",
                    self.progress.bundles,
                    self.progress.blocks,
                    self.progress.skipped,
                    self.progress.bytes_total,
                    self.repo.did()
                );
                Ok(self.progress)
            }
            Err(e) => {
                warn!(
                    "Import into {} aborted after {} bundle(s) in {} state: {}",
                    self.repo.did(),
                    self.progress.bundles,
                    parser.state().name(),
                    e
                );
                Err(e)
            }
        }
    }
}
