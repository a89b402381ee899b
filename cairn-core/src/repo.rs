//! Repo model
//!
//! A repo is a linear chain of signed commits. Each commit batches revision
//! blocks; each revision points at a content block. The head is the CID of
//! the latest Root, and advancing it is a compare-and-swap in the index,
//! serialized per repo by an async write lock.

use bytes::Bytes;
use futures::stream::{self, Stream};
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::Arc;
use tokio::sync::{Mutex, MutexGuard};
use tracing::{debug, info};

use crate::capability::{Capability, Signer};
use crate::cid::Cid;
use crate::codec::{self, Value};
use crate::config::NodeConfig;
use crate::error::{Error, Result};
use crate::ids::{IdGenerator, Uid};
use crate::index::{CommitEntry, CommitRecord, IndexedRevision, RevisionFilter, RevisionIndex, UriKind};
use crate::keys::verify_signature;
use crate::model::{Bundle, BundleRevision, Commit, Entity, EntityInput, RelationValue, Revision, Root};
use crate::schema::Schema;
use crate::storage::{BlockStore, BlockStoreExt};

/// Services shared by every repo of a node
#[derive(Clone)]
pub struct RepoContext {
    pub blocks: Arc<dyn BlockStore>,
    pub index: Arc<dyn RevisionIndex>,
    pub ids: Arc<IdGenerator>,
    pub schema: Arc<Schema>,
    pub config: Arc<NodeConfig>,
}

/// Which parent a new commit must build on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParentHint {
    /// Whatever the head is once the write lock is held
    Head,
    /// Exactly this head; anything else is `StaleHead`
    Expect(Option<Cid>),
}

/// A commit that was written
#[derive(Debug, Clone)]
pub struct CommitSummary {
    pub root_cid: Cid,
    pub commit_cid: Cid,
    pub parent: Option<Cid>,
    pub revisions: Vec<Revision>,
}

#[derive(Debug, Clone)]
pub enum CommitOutcome {
    Committed(CommitSummary),
    /// Every input matched its current revision; the head did not move
    NothingToCommit,
}

impl CommitOutcome {
    pub fn summary(&self) -> Option<&CommitSummary> {
        match self {
            CommitOutcome::Committed(summary) => Some(summary),
            CommitOutcome::NothingToCommit => None,
        }
    }
}

/// Result of replaying a bundle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    Applied,
    /// The bundle's root is already part of this repo
    AlreadyPresent,
}

/// One page of a revision listing
#[derive(Debug, Clone)]
pub struct RevisionPage {
    pub revisions: Vec<IndexedRevision>,
    /// Cursor to pass for the next page
    pub next_cursor: i64,
    /// Revisions left after this page
    pub remaining: u64,
}

/// Check a root's signature and capability against its commit
pub fn verify_root(root: &Root, commit_cid: Cid, commit: &Commit) -> Result<()> {
    if root.commit != commit_cid {
        return Err(Error::CidMismatch {
            expected: root.commit,
            received: commit_cid,
            state: "Commit",
        });
    }
    if root.agent_did != commit.agent_did {
        return Err(Error::SignatureInvalid(format!(
            "root signed by {} but commit names {}",
            root.agent_did, commit.agent_did
        )));
    }
    verify_signature(&root.agent_did, &commit_cid.to_bytes(), &root.sig)?;
    Capability::parse(&root.cap)?.authorizes(&root.agent_did, &commit.repo_did, commit.timestamp)
}

/// Per-input bookkeeping for a commit under construction
#[derive(Default)]
struct Staged {
    latest: HashMap<Uid, Revision>,
    uris: HashMap<String, Uid>,
    revisions: Vec<Revision>,
    contents: Vec<Bytes>,
}

impl Staged {
    fn stage(&mut self, revision: Revision, content: Bytes) {
        for uri in &revision.entity_uris {
            self.uris.insert(uri.clone(), revision.entity_uid.clone());
        }
        self.latest.insert(revision.entity_uid.clone(), revision.clone());
        self.revisions.push(revision);
        self.contents.push(content);
    }
}

fn merge_uris(existing: &[String], added: &[String]) -> Vec<String> {
    let mut out = existing.to_vec();
    for uri in added {
        if !out.contains(uri) {
            out.push(uri.clone());
        }
    }
    out
}

/// A repo handle
pub struct Repo {
    did: String,
    ctx: RepoContext,
    write_lock: Mutex<()>,
    ingest_lock: Mutex<()>,
}

impl Repo {
    pub fn new(did: impl Into<String>, ctx: RepoContext) -> Self {
        Self {
            did: did.into(),
            ctx,
            write_lock: Mutex::new(()),
            ingest_lock: Mutex::new(()),
        }
    }

    pub fn did(&self) -> &str {
        &self.did
    }

    pub fn context(&self) -> &RepoContext {
        &self.ctx
    }

    pub fn blocks(&self) -> &Arc<dyn BlockStore> {
        &self.ctx.blocks
    }

    pub fn index(&self) -> &Arc<dyn RevisionIndex> {
        &self.ctx.index
    }

    /// Held by an ingest from relation resolution through its commit
    pub async fn lock_ingest(&self) -> MutexGuard<'_, ()> {
        self.ingest_lock.lock().await
    }

    /// CID of the latest root, `None` for an empty repo
    pub async fn head(&self) -> Result<Option<Cid>> {
        self.ctx.index.head(&self.did).await
    }

    /// Turn relation fields into stored values: uids for known targets
    async fn resolve_relations(
        &self,
        input: &EntityInput,
        staged: &Staged,
    ) -> Result<BTreeMap<String, Value>> {
        let mut content = input.content.clone();
        for (field, relation) in &input.relations {
            let mut resolved = Vec::new();
            for target in relation.targets() {
                resolved.push(self.resolve_target(target, staged, input).await?);
            }
            let value = match relation {
                RelationValue::One(_) => resolved.pop().unwrap_or(Value::Null),
                RelationValue::Many(_) => Value::List(resolved),
            };
            content.insert(field.clone(), value);
        }
        Ok(content)
    }

    async fn resolve_target(&self, target: &str, staged: &Staged, input: &EntityInput) -> Result<Value> {
        if Uid::parse(target).is_ok() {
            return Ok(Value::from(target));
        }
        if let Some(uid) = staged.uris.get(target) {
            return Ok(Value::from(uid.as_str()));
        }
        let matches = self.ctx.index.find_by_uris(&self.did, &[target.to_string()]).await?;
        match matches.into_iter().next() {
            Some(m) => Ok(Value::from(m.entity_uid.as_str())),
            None => Err(Error::RelationUnresolved {
                uri: target.to_string(),
                entity: input.describe(),
            }),
        }
    }

    /// Current revision of the entity an input refers to
    ///
    /// A uid with no history yet falls through to the input's uris, so an
    /// input resolved before another writer claimed one of its uris still
    /// lands on that writer's entity.
    async fn current_revision(&self, input: &EntityInput, staged: &Staged) -> Result<Option<Revision>> {
        if let Some(uid) = &input.uid {
            if let Some(rev) = self.latest_of(uid, staged).await? {
                return Ok(Some(rev));
            }
        }
        let uid = match input.uris.iter().find_map(|u| staged.uris.get(u)) {
            Some(uid) => Some(uid.clone()),
            None if input.uris.is_empty() => None,
            None => {
                let matches = self.ctx.index.find_by_uris(&self.did, &input.uris).await?;
                matches
                    .iter()
                    .find(|m| m.kind == UriKind::Entity)
                    .or(matches.first())
                    .map(|m| m.entity_uid.clone())
            }
        };
        match uid {
            Some(uid) => self.latest_of(&uid, staged).await,
            None => Ok(None),
        }
    }

    async fn latest_of(&self, uid: &Uid, staged: &Staged) -> Result<Option<Revision>> {
        if let Some(rev) = staged.latest.get(uid) {
            return Ok(Some(rev.clone()));
        }
        Ok(self
            .ctx
            .index
            .latest_revision(&self.did, uid)
            .await?
            .map(|indexed| indexed.revision))
    }

    /// Create a signed commit from entity inputs
    ///
    /// Inputs whose content matches the entity's current revision produce no
    /// revision. If nothing changed and empty commits are not allowed the
    /// head stays where it is.
    pub async fn create_commit(
        &self,
        inputs: Vec<EntityInput>,
        signer: &Signer,
        parent: ParentHint,
    ) -> Result<CommitOutcome> {
        let agent = signer.did();
        signer.capability().authorizes(&agent, &self.did, self.ctx.ids.now())?;
        for input in &inputs {
            self.ctx.schema.validate_input(input)?;
        }

        let _guard = self.write_lock.lock().await;

        let head = self.head().await?;
        if let ParentHint::Expect(expected) = parent {
            if expected != head {
                return Err(Error::StaleHead {
                    expected,
                    actual: head,
                });
            }
        }

        let mut staged = Staged::default();
        for input in &inputs {
            let content = if input.deleted {
                BTreeMap::new()
            } else {
                self.resolve_relations(input, &staged).await?
            };
            let content_bytes = Bytes::from(codec::encode(&Value::Map(content))?);
            let content_cid = Cid::for_block(&content_bytes);

            let current = self.current_revision(input, &staged).await?;
            if let Some(cur) = &current {
                if cur.entity_type != input.entity_type {
                    return Err(Error::EntityTypeMismatch {
                        entity: cur.entity_uid.to_string(),
                        expected: cur.entity_type.clone(),
                        found: input.entity_type.clone(),
                    });
                }
                let unchanged = cur.content_cid == content_cid
                    && cur.is_deleted == input.deleted
                    && input.uris.iter().all(|u| cur.entity_uris.contains(u));
                if unchanged {
                    debug!("Skipping unchanged entity {}", cur.entity_uid);
                    continue;
                }
            } else if input.deleted {
                debug!("Skipping deletion of unknown entity {}", input.describe());
                continue;
            }

            let now = self.ctx.ids.now();
            let entity_uid = match (&current, &input.uid, input.uris.first()) {
                (Some(cur), _, _) => cur.entity_uid.clone(),
                (None, Some(uid), _) => uid.clone(),
                (None, None, Some(uri)) => Uid::from_uri(&self.ctx.ids, uri),
                (None, None, None) => Uid::generate(&self.ctx.ids),
            };
            let revision = Revision {
                id: self.ctx.ids.create(),
                entity_uid,
                entity_type: input.entity_type.clone(),
                content_cid,
                prev_revision_id: current.as_ref().map(|c| c.id.clone()),
                revision_uris: input.revision_uris.clone(),
                entity_uris: merge_uris(
                    current.as_ref().map(|c| c.entity_uris.as_slice()).unwrap_or(&[]),
                    &input.uris,
                ),
                date_created: current.as_ref().map(|c| c.date_created).unwrap_or(now),
                date_modified: now,
                is_deleted: input.deleted,
            };
            staged.stage(revision, content_bytes);
        }

        if staged.revisions.is_empty() && !self.ctx.config.allow_empty_commits {
            info!("Nothing to commit to {}", self.did);
            return Ok(CommitOutcome::NothingToCommit);
        }

        self.put_all(staged.contents).await?;
        let mut revision_cids = Vec::with_capacity(staged.revisions.len());
        for rev in &staged.revisions {
            revision_cids.push(self.ctx.blocks.put_value(&rev.to_value()).await?);
        }

        let commit = Commit {
            repo_did: self.did.clone(),
            agent_did: agent.clone(),
            parent: head,
            revisions: revision_cids.clone(),
            timestamp: self.ctx.ids.now(),
        };
        let commit_cid = self.ctx.blocks.put_value(&commit.to_value()).await?;

        let root = Root {
            commit: commit_cid,
            sig: signer.sign(&commit_cid.to_bytes()),
            cap: signer.capability().token().to_string(),
            agent_did: agent,
        };
        let root_cid = self.ctx.blocks.put_value(&root.to_value()).await?;

        let record = CommitRecord {
            root_cid,
            commit_cid,
            commit,
            revisions: revision_cids.into_iter().zip(staged.revisions.iter().cloned()).collect(),
        };
        self.ctx.index.apply_commit(&self.did, head, &record).await?;

        info!(
            "Committed {} revision(s) to {}: head {}",
            staged.revisions.len(),
            self.did,
            root_cid
        );

        Ok(CommitOutcome::Committed(CommitSummary {
            root_cid,
            commit_cid,
            parent: head,
            revisions: staged.revisions,
        }))
    }

    /// Replay a validated bundle on top of the current head
    pub async fn apply_bundle(&self, bundle: &Bundle) -> Result<ApplyOutcome> {
        if bundle.commit.repo_did != self.did {
            return Err(Error::RepoMismatch {
                expected: self.did.clone(),
                found: bundle.commit.repo_did.clone(),
            });
        }
        check_bundle_integrity(bundle)?;
        verify_root(&bundle.root, bundle.commit_cid, &bundle.commit)?;

        let _guard = self.write_lock.lock().await;

        if self.ctx.index.commit_entry(&self.did, bundle.root_cid).await?.is_some() {
            debug!("Bundle {} already present in {}", bundle.root_cid, self.did);
            return Ok(ApplyOutcome::AlreadyPresent);
        }
        let head = self.head().await?;
        if bundle.commit.parent != head {
            return Err(Error::StaleHead {
                expected: bundle.commit.parent,
                actual: head,
            });
        }

        let mut in_bundle: HashMap<&str, &Revision> = HashMap::new();
        for rev in &bundle.revisions {
            let revision = &rev.revision;
            let content = codec::decode(&rev.content)?;
            let content = codec::fields::map(&content, "content")?;
            self.ctx
                .schema
                .validate_content(&revision.entity_type, content, revision.is_deleted)?;

            if let Some(prev_id) = &revision.prev_revision_id {
                let prev_type = match in_bundle.get(prev_id.as_str()) {
                    Some(prev) => prev.entity_type.clone(),
                    None => self
                        .ctx
                        .index
                        .revision_by_id(&self.did, prev_id)
                        .await?
                        .map(|p| p.revision.entity_type)
                        .ok_or_else(|| Error::EntityNotFound(format!("revision {}", prev_id)))?,
                };
                if prev_type != revision.entity_type {
                    return Err(Error::EntityTypeMismatch {
                        entity: revision.entity_uid.to_string(),
                        expected: prev_type,
                        found: revision.entity_type.clone(),
                    });
                }
            }
            in_bundle.insert(revision.id.as_str(), revision);
        }

        // Content first, root last: a crash leaves only unreferenced blocks
        let leaves = bundle
            .revisions
            .iter()
            .flat_map(|rev| [rev.content.clone(), rev.bytes.clone()])
            .collect();
        self.put_all(leaves).await?;
        self.ctx.blocks.put(bundle.commit_bytes.clone()).await?;
        self.ctx.blocks.put(bundle.root_bytes.clone()).await?;

        let record = CommitRecord {
            root_cid: bundle.root_cid,
            commit_cid: bundle.commit_cid,
            commit: bundle.commit.clone(),
            revisions: bundle
                .revisions
                .iter()
                .map(|r| (r.cid, r.revision.clone()))
                .collect(),
        };
        self.ctx.index.apply_commit(&self.did, head, &record).await?;
        debug!("Applied bundle {} to {}", bundle.root_cid, self.did);
        Ok(ApplyOutcome::Applied)
    }

    /// Store blocks in one batch; the first failed block is the error
    async fn put_all(&self, data: Vec<Bytes>) -> Result<()> {
        for outcome in self.ctx.blocks.put_batch(data).await {
            outcome?;
        }
        Ok(())
    }

    /// Read a full bundle back out of the block store
    pub async fn load_bundle(&self, root_cid: Cid) -> Result<Bundle> {
        let blocks = &self.ctx.blocks;
        let root_bytes = blocks.get(root_cid).await?;
        let root = Root::from_value(&codec::decode(&root_bytes)?)?;
        let commit_bytes = blocks.get(root.commit).await?;
        let commit = Commit::from_value(&codec::decode(&commit_bytes)?)?;

        let mut decoded = Vec::with_capacity(commit.revisions.len());
        for (&cid, bytes) in commit.revisions.iter().zip(blocks.get_batch(commit.revisions.clone()).await) {
            let bytes = bytes?;
            let revision = Revision::from_value(&codec::decode(&bytes)?)?;
            decoded.push((cid, revision, bytes));
        }
        let contents = blocks
            .get_batch(decoded.iter().map(|(_, revision, _)| revision.content_cid).collect())
            .await;
        let mut revisions = Vec::with_capacity(decoded.len());
        for ((cid, revision, bytes), content) in decoded.into_iter().zip(contents) {
            revisions.push(BundleRevision {
                cid,
                revision,
                bytes,
                content: content?,
            });
        }

        Ok(Bundle {
            root_cid,
            commit_cid: root.commit,
            root,
            root_bytes,
            commit,
            commit_bytes,
            revisions,
        })
    }

    /// The index entry of a commit by its root CID
    pub async fn commit_entry(&self, root_cid: Cid) -> Result<Option<CommitEntry>> {
        self.ctx.index.commit_entry(&self.did, root_cid).await
    }

    /// Entity known under `uri`, if any
    pub async fn resolve_uri(&self, uri: &str) -> Result<Option<Uid>> {
        let matches = self.ctx.index.find_by_uris(&self.did, &[uri.to_string()]).await?;
        Ok(matches.into_iter().next().map(|m| m.entity_uid))
    }

    /// Current content of an entity; `None` once deleted
    pub async fn get_entity(&self, uid: &Uid) -> Result<Option<Entity>> {
        let Some(latest) = self.ctx.index.latest_revision(&self.did, uid).await? else {
            return Err(Error::EntityNotFound(uid.to_string()));
        };
        let revision = latest.revision;
        if revision.is_deleted {
            return Ok(None);
        }
        let content = self.ctx.blocks.get_value(revision.content_cid).await?;
        let content = codec::fields::map(&content, "content")?.clone();
        Ok(Some(Entity {
            uid: revision.entity_uid.clone(),
            entity_type: revision.entity_type.clone(),
            content,
            revision,
        }))
    }

    /// Revisions of an entity, newest first
    pub async fn history(&self, uid: &Uid) -> Result<Vec<Revision>> {
        let mut out = Vec::new();
        let mut next = self
            .ctx
            .index
            .latest_revision(&self.did, uid)
            .await?
            .map(|r| r.revision);
        while let Some(rev) = next {
            next = match &rev.prev_revision_id {
                Some(id) => self.get_revision(id).await?,
                None => None,
            };
            out.push(rev);
        }
        if out.is_empty() {
            return Err(Error::EntityNotFound(uid.to_string()));
        }
        Ok(out)
    }

    pub async fn get_revision(&self, id: &str) -> Result<Option<Revision>> {
        Ok(self
            .ctx
            .index
            .revision_by_id(&self.did, id)
            .await?
            .map(|r| r.revision))
    }

    /// One finite page of revisions after `cursor` (0 for the beginning)
    pub async fn list_revisions(
        &self,
        cursor: i64,
        filter: &RevisionFilter,
        limit: usize,
    ) -> Result<RevisionPage> {
        let revisions = self
            .ctx
            .index
            .list_revisions(&self.did, cursor, filter, limit)
            .await?;
        let next_cursor = revisions.last().map(|r| r.seq).unwrap_or(cursor);
        let remaining = self
            .ctx
            .index
            .count_revisions(&self.did, next_cursor, filter)
            .await?;
        Ok(RevisionPage {
            revisions,
            next_cursor,
            remaining,
        })
    }

    /// Like [`Repo::list_revisions`], starting from and advancing the cursor
    /// persisted under `name`
    pub async fn list_revisions_from(
        &self,
        name: &str,
        filter: &RevisionFilter,
        limit: usize,
    ) -> Result<RevisionPage> {
        let cursor = self.ctx.index.load_cursor(&self.did, name).await?.unwrap_or(0);
        let page = self.list_revisions(cursor, filter, limit).await?;
        if page.next_cursor != cursor {
            self.ctx.index.save_cursor(&self.did, name, page.next_cursor).await?;
        }
        Ok(page)
    }

    /// Lazily page through revisions after `cursor`
    pub fn revision_stream<'a>(
        &'a self,
        cursor: i64,
        filter: RevisionFilter,
        page_size: usize,
    ) -> impl Stream<Item = Result<IndexedRevision>> + Send + 'a {
        let page_size = page_size.max(1);
        let state = (cursor, VecDeque::new(), false, filter);
        stream::try_unfold(state, move |(mut cursor, mut buffer, mut exhausted, filter)| async move {
            if buffer.is_empty() && !exhausted {
                let page = self.list_revisions(cursor, &filter, page_size).await?;
                exhausted = page.remaining == 0;
                cursor = page.next_cursor;
                buffer.extend(page.revisions);
            }
            Ok::<_, Error>(
                buffer
                    .pop_front()
                    .map(|rev| (rev, (cursor, buffer, exhausted, filter))),
            )
        })
    }
}

/// Every block in a bundle must hash to the CID it is carried under
fn check_bundle_integrity(bundle: &Bundle) -> Result<()> {
    let check = |expected: Cid, bytes: &Bytes, state: &'static str| {
        let received = Cid::for_block(bytes);
        if received == expected {
            Ok(())
        } else {
            Err(Error::CidMismatch {
                expected,
                received,
                state,
            })
        }
    };
    check(bundle.root_cid, &bundle.root_bytes, "Root")?;
    check(bundle.commit_cid, &bundle.commit_bytes, "Commit")?;
    let listed: HashSet<Cid> = bundle.commit.revisions.iter().copied().collect();
    if listed.len() != bundle.revisions.len() {
        return Err(Error::UnexpectedBlock {
            cid: bundle.commit_cid,
            state: "Commit",
            reason: format!(
                "commit lists {} revisions, bundle carries {}",
                listed.len(),
                bundle.revisions.len()
            ),
        });
    }
    for rev in &bundle.revisions {
        check(rev.cid, &rev.bytes, "Revision")?;
        if !listed.contains(&rev.cid) {
            return Err(Error::UnexpectedBlock {
                cid: rev.cid,
                state: "Revision",
                reason: "not listed in commit".to_string(),
            });
        }
        check(rev.revision.content_cid, &rev.content, "Content")?;
    }
    Ok(())
}
