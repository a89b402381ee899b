//! Node context
//!
//! A node directory holds everything one process serves:
//!
//! ```text
//! <node>/config.json       NodeConfig
//! <node>/schema.json       Schema (optional; permissive when absent)
//! <node>/blocks/           fjall block store
//! <node>/index.sqlite      revision index
//! <node>/keys.sqlite       keypairs and delegations
//! <node>/transfer-log/     one JSON file per import/export
//! ```
//!
//! The node owns the instance keypair, created once on first use, which
//! receives a publishing delegation for every repo the node creates.

use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use chrono::{Duration, Utc};
use tokio::io::{AsyncRead, AsyncWrite, DuplexStream};
use tokio::sync::{OnceCell, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::capability::{Capability, Signer};
use crate::cid::Cid;
use crate::codec::Value;
use crate::config::NodeConfig;
use crate::error::{Error, Result};
use crate::export::{ExportOptions, ExportProgress, Exporter};
use crate::ids::{Clock, IdGenerator, SystemClock, Uid};
use crate::import::{ImportProgress, Importer};
use crate::index::{ProvisionalRef, SqliteIndex};
use crate::keys::{public_key_from_did, KeyStore, Keypair, INSTANCE_LABEL};
use crate::model::{as_external_ref, EntityInput};
use crate::relations::{resolve_batch, Datasource};
use crate::repo::{CommitOutcome, ParentHint, Repo, RepoContext};
use crate::schema::Schema;
use crate::storage::{BlockStore, CachedBlockStore, FjallBlockStore, MemoryBlockStore};
use crate::transfer_log::{Direction, TransferLog, TransferLogEntry};
use crate::verify::{verify_repo, VerifyReport};

const SCHEMA_FILE: &str = "schema.json";

/// What an ingest did
#[derive(Debug, Clone)]
pub struct IngestReport {
    pub outcome: CommitOutcome,
    /// URIs nothing could resolve
    pub missing: Vec<String>,
    /// Relations stored as external references
    pub provisional: usize,
    /// The reconciliation pass that followed, if it ran
    pub reconciled: Option<ReconcileReport>,
}

/// What a reconciliation pass did
#[derive(Debug, Clone)]
pub struct ReconcileReport {
    /// External references replaced by uids
    pub resolved: usize,
    /// External references still waiting for their target
    pub remaining: usize,
    pub outcome: CommitOutcome,
}

/// An export running in the background, read through `reader`
pub struct ExportStream {
    pub reader: DuplexStream,
    pub task: JoinHandle<Result<ExportProgress>>,
}

pub struct Node {
    path: Option<PathBuf>,
    ctx: RepoContext,
    keys: KeyStore,
    disk_blocks: Option<Arc<FjallBlockStore>>,
    instance: OnceCell<Arc<Keypair>>,
    repos: RwLock<HashMap<String, Arc<Repo>>>,
}

impl Node {
    /// Open or create a node directory
    pub fn open(path: &Path) -> Result<Self> {
        fs::create_dir_all(path)?;
        let config = NodeConfig::load(path)?;
        let schema_path = path.join(SCHEMA_FILE);
        let schema = if schema_path.exists() {
            serde_json::from_str(&fs::read_to_string(&schema_path)?)?
        } else {
            Schema::permissive()
        };

        let disk_blocks = Arc::new(FjallBlockStore::open(&path.join("blocks"))?);
        let blocks: Arc<dyn BlockStore> = Arc::new(CachedBlockStore::new(
            disk_blocks.clone(),
            config.block_cache_capacity,
        ));
        let index = Arc::new(SqliteIndex::open(&path.join("index.sqlite"))?);
        let keys = KeyStore::open(&path.join("keys.sqlite"))?;
        info!("Opened node at {:?}", path);

        Ok(Self {
            path: Some(path.to_path_buf()),
            ctx: RepoContext {
                blocks,
                index,
                ids: Arc::new(IdGenerator::default()),
                schema: Arc::new(schema),
                config: Arc::new(config),
            },
            keys,
            disk_blocks: Some(disk_blocks),
            instance: OnceCell::new(),
            repos: RwLock::new(HashMap::new()),
        })
    }

    /// A node that lives only in memory
    pub fn in_memory() -> Result<Self> {
        Self::in_memory_with(NodeConfig::default(), Schema::permissive(), Arc::new(SystemClock))
    }

    pub fn in_memory_with(config: NodeConfig, schema: Schema, clock: Arc<dyn Clock>) -> Result<Self> {
        Ok(Self {
            path: None,
            ctx: RepoContext {
                blocks: Arc::new(MemoryBlockStore::new()),
                index: Arc::new(SqliteIndex::in_memory()?),
                ids: Arc::new(IdGenerator::new(clock)),
                schema: Arc::new(schema),
                config: Arc::new(config),
            },
            keys: KeyStore::in_memory()?,
            disk_blocks: None,
            instance: OnceCell::new(),
            repos: RwLock::new(HashMap::new()),
        })
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn config(&self) -> &NodeConfig {
        &self.ctx.config
    }

    pub fn context(&self) -> &RepoContext {
        &self.ctx
    }

    pub fn transfer_log(&self) -> Option<TransferLog> {
        self.path.as_deref().map(TransferLog::new)
    }

    /// The node's own keypair, loaded or created on first use
    pub async fn instance_keypair(&self) -> Result<Arc<Keypair>> {
        let keypair = self
            .instance
            .get_or_try_init(|| async {
                if let Some(existing) = self.keys.keypair_by_label(INSTANCE_LABEL)? {
                    return Ok::<_, Error>(Arc::new(existing));
                }
                let created = Keypair::generate();
                self.keys.store_keypair(&created, Some(INSTANCE_LABEL))?;
                info!("Created instance keypair {}", created.did());
                Ok(Arc::new(created))
            })
            .await?;
        Ok(keypair.clone())
    }

    async fn register(&self, did: &str) -> Arc<Repo> {
        let mut repos = self.repos.write().await;
        repos
            .entry(did.to_string())
            .or_insert_with(|| Arc::new(Repo::new(did, self.ctx.clone())))
            .clone()
    }

    /// Create a repo with a fresh keypair and delegate publishing on it to
    /// the instance keypair
    pub async fn create_repo(&self) -> Result<Arc<Repo>> {
        let repo_key = Keypair::generate();
        let did = repo_key.did();
        self.keys.store_keypair(&repo_key, None)?;
        self.ctx.index.create_repo(&did).await?;

        let instance = self.instance_keypair().await?;
        let capability = Capability::delegate(&repo_key, &instance.did(), self.ctx.ids.now(), None)?;
        self.keys.store_capability(&capability)?;
        info!("Created repo {}", did);
        Ok(self.register(&did).await)
    }

    /// Register a repo known only by its DID, to import into
    pub async fn mirror_repo(&self, did: &str) -> Result<Arc<Repo>> {
        public_key_from_did(did)?;
        if self.ctx.index.create_repo(did).await? {
            info!("Registered mirror of {}", did);
        }
        Ok(self.register(did).await)
    }

    pub async fn repo(&self, did: &str) -> Result<Arc<Repo>> {
        if let Some(repo) = self.repos.read().await.get(did) {
            return Ok(repo.clone());
        }
        self.ctx.index.head(did).await?;
        Ok(self.register(did).await)
    }

    /// Every repo with its head
    pub async fn list_repos(&self) -> Result<Vec<(String, Option<Cid>)>> {
        self.ctx.index.list_repos().await
    }

    /// The signer routine commits use: the instance key and its delegation
    pub async fn signer(&self, repo_did: &str) -> Result<Signer> {
        let instance = self.instance_keypair().await?;
        let agent = instance.did();
        let capability = match self.keys.capability(repo_did, &agent)? {
            Some(capability) if capability.is_expired(self.ctx.ids.now()) => {
                debug!("Delegation on {} to {} expired, renewing", repo_did, agent);
                self.delegate(repo_did, &agent, capability.ttl()).await?
            }
            Some(capability) => capability,
            None => self.delegate(repo_did, &agent, None).await?,
        };
        Ok(Signer::new(instance, capability))
    }

    /// Delegate publishing on a repo this node holds the key for
    pub async fn delegate(&self, repo_did: &str, audience: &str, ttl: Option<Duration>) -> Result<Capability> {
        let Some(repo_key) = self.keys.keypair(repo_did)? else {
            return Err(Error::CapabilityMissing {
                agent: audience.to_string(),
                repo: repo_did.to_string(),
            });
        };
        public_key_from_did(audience)?;
        let capability = Capability::delegate(&repo_key, audience, self.ctx.ids.now(), ttl)?;
        self.keys.store_capability(&capability)?;
        debug!("Delegated {} to {}", repo_did, audience);
        Ok(capability)
    }

    /// Flush the on-disk block store
    pub fn flush(&self) -> Result<()> {
        match &self.disk_blocks {
            Some(store) => store.persist(),
            None => Ok(()),
        }
    }

    pub async fn commit(&self, repo_did: &str, inputs: Vec<EntityInput>, parent: ParentHint) -> Result<CommitOutcome> {
        let repo = self.repo(repo_did).await?;
        let signer = self.signer(repo_did).await?;
        let outcome = repo.create_commit(inputs, &signer, parent).await?;
        self.flush()?;
        Ok(outcome)
    }

    /// Resolve relations across the batch, then commit it
    pub async fn ingest(
        &self,
        repo_did: &str,
        inputs: Vec<EntityInput>,
        datasource: &dyn Datasource,
    ) -> Result<IngestReport> {
        let repo = self.repo(repo_did).await?;
        let guard = repo.lock_ingest().await;
        let batch = resolve_batch(&repo, datasource, inputs).await?;
        let outcome = self.commit(repo_did, batch.entities, ParentHint::Head).await?;
        if !batch.provisional.is_empty() {
            self.ctx.index.record_provisional(repo_did, &batch.provisional).await?;
        }
        drop(guard);
        let reconciled = if self.ctx.config.reconcile_provisional {
            Some(self.reconcile_provisional(repo_did).await?)
        } else {
            None
        };
        Ok(IngestReport {
            outcome,
            missing: batch.missing,
            provisional: batch.provisional.len(),
            reconciled,
        })
    }

    /// Replace external references whose target has since become known
    pub async fn reconcile_provisional(&self, repo_did: &str) -> Result<ReconcileReport> {
        let repo = self.repo(repo_did).await?;
        let refs = self.ctx.index.provisional_refs(repo_did).await?;

        let mut targets: HashMap<String, Uid> = HashMap::new();
        let mut by_entity: BTreeMap<Uid, Vec<ProvisionalRef>> = BTreeMap::new();
        let mut stale = Vec::new();
        let mut remaining = 0;
        for reference in refs {
            match repo.resolve_uri(&reference.uri).await? {
                Some(uid) => {
                    targets.insert(reference.uri.clone(), uid);
                    by_entity.entry(reference.entity_uid.clone()).or_default().push(reference);
                }
                None => remaining += 1,
            }
        }

        let mut inputs = Vec::new();
        let mut resolved = Vec::new();
        for (uid, references) in by_entity {
            let entity = match repo.get_entity(&uid).await {
                Ok(Some(entity)) => entity,
                Ok(None) | Err(Error::EntityNotFound(_)) => {
                    stale.extend(references);
                    continue;
                }
                Err(e) => return Err(e),
            };
            let mut content = entity.content;
            for reference in &references {
                if let Some(value) = content.get_mut(&reference.field) {
                    replace_external(value, &reference.uri, &targets[&reference.uri]);
                }
            }
            let mut input = EntityInput::new(entity.entity_type).with_uid(uid);
            input.content = content;
            inputs.push(input);
            resolved.extend(references);
        }

        let outcome = if inputs.is_empty() {
            CommitOutcome::NothingToCommit
        } else {
            self.commit(repo_did, inputs, ParentHint::Head).await?
        };
        for reference in resolved.iter().chain(stale.iter()) {
            self.ctx.index.clear_provisional(repo_did, reference).await?;
        }
        if !resolved.is_empty() {
            info!("Reconciled {} provisional relation(s) in {}", resolved.len(), repo_did);
        }
        Ok(ReconcileReport {
            resolved: resolved.len(),
            remaining,
            outcome,
        })
    }

    /// Export into `writer`, recording the transfer
    pub async fn export_to<W: AsyncWrite + Unpin + Send>(
        &self,
        repo_did: &str,
        writer: W,
        options: ExportOptions,
    ) -> Result<(W, ExportProgress)> {
        let repo = self.repo(repo_did).await?;
        let head = repo.head().await?;
        let started = Instant::now();
        let mut exporter = Exporter::new(&repo);
        let result = exporter.run(writer, options).await;
        let progress = exporter.progress();
        log_transfer(
            self.transfer_log(),
            Direction::Export,
            repo_did,
            (head, head),
            progress.commits,
            progress.blocks,
            progress.bytes,
            started,
            result.as_ref().err(),
        );
        result.map(|w| (w, progress))
    }

    /// Export through an in-process pipe; the export runs as a task and
    /// suspends whenever the reader falls behind
    pub async fn export_reader(&self, repo_did: &str, options: ExportOptions) -> Result<ExportStream> {
        let repo = self.repo(repo_did).await?;
        let (reader, writer) = tokio::io::duplex(self.ctx.config.export_buffer_size.max(1));
        let log = self.transfer_log();
        let did = repo_did.to_string();
        let task = tokio::spawn(async move {
            let head = repo.head().await?;
            let started = Instant::now();
            let mut exporter = Exporter::new(&repo);
            let result = exporter.run(writer, options).await;
            let progress = exporter.progress();
            log_transfer(
                log,
                Direction::Export,
                &did,
                (head, head),
                progress.commits,
                progress.blocks,
                progress.bytes,
                started,
                result.as_ref().err(),
            );
            result.map(|_| progress)
        });
        Ok(ExportStream { reader, task })
    }

    /// Import a bundle stream, recording the transfer
    pub async fn import_from<R: AsyncRead + Unpin + Send>(
        &self,
        repo_did: &str,
        reader: R,
        on_progress: impl FnMut(&ImportProgress) + Send + Sync,
    ) -> Result<ImportProgress> {
        let repo = self.repo(repo_did).await?;
        let head_before = repo.head().await?;
        let started = Instant::now();
        let mut importer = Importer::new(&repo).on_progress(on_progress);
        let result = importer.run(reader).await;
        let progress = importer.progress();
        self.flush()?;
        let head_after = repo.head().await?;
        log_transfer(
            self.transfer_log(),
            Direction::Import,
            repo_did,
            (head_before, head_after),
            progress.bundles,
            progress.blocks,
            progress.bytes_total,
            started,
            result.as_ref().err(),
        );
        result
    }

    pub async fn verify(&self, repo_did: &str) -> Result<VerifyReport> {
        let repo = self.repo(repo_did).await?;
        verify_repo(&repo).await
    }
}

/// Point every external reference to `uri` inside `value` at `uid`
fn replace_external(value: &mut Value, uri: &str, uid: &Uid) {
    if as_external_ref(value) == Some(uri) {
        *value = Value::from(uid.as_str());
        return;
    }
    if let Value::List(items) = value {
        for item in items {
            replace_external(item, uri, uid);
        }
    }
}

#[allow(clippy::too_many_arguments)]
fn log_transfer(
    log: Option<TransferLog>,
    direction: Direction,
    repo: &str,
    (head_before, head_after): (Option<Cid>, Option<Cid>),
    bundles: u64,
    blocks: u64,
    bytes: u64,
    started: Instant,
    error: Option<&Error>,
) {
    let Some(log) = log else {
        return;
    };
    let entry = TransferLogEntry {
        direction,
        repo: repo.to_string(),
        head_before,
        head_after,
        bundles,
        blocks,
        bytes,
        duration_ms: started.elapsed().as_millis() as u64,
        success: error.is_none(),
        error: error.map(|e| e.to_string()),
        timestamp: Utc::now(),
    };
    if let Err(e) = log.append(&entry) {
        warn!("Failed to write transfer log entry: {}", e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ResolutionMode;
    use crate::ids::ManualClock;
    use crate::relations::NoDatasource;
    use tempfile::TempDir;

    fn lenient_node(reconcile: bool) -> Node {
        let config = NodeConfig {
            resolution_mode: ResolutionMode::Lenient,
            reconcile_provisional: reconcile,
            ..Default::default()
        };
        Node::in_memory_with(config, Schema::permissive(), Arc::new(ManualClock::new(1_700_000_000_000)))
            .unwrap()
    }

    #[tokio::test]
    async fn test_instance_keypair_is_created_once() {
        let dir = TempDir::new().unwrap();
        let first = {
            let node = Node::open(dir.path()).unwrap();
            let a = node.instance_keypair().await.unwrap();
            let b = node.instance_keypair().await.unwrap();
            assert!(Arc::ptr_eq(&a, &b));
            a.did()
        };
        let node = Node::open(dir.path()).unwrap();
        assert_eq!(node.instance_keypair().await.unwrap().did(), first);
    }

    #[tokio::test]
    async fn test_expired_delegation_is_renewed() {
        let clock = Arc::new(ManualClock::new(1_700_000_000_000));
        let node = Node::in_memory_with(NodeConfig::default(), Schema::permissive(), clock.clone()).unwrap();
        let repo = node.create_repo().await.unwrap();
        let instance = node.instance_keypair().await.unwrap().did();
        node.delegate(repo.did(), &instance, Some(Duration::seconds(60))).await.unwrap();

        clock.advance(120_000);
        let stale = node.keys.capability(repo.did(), &instance).unwrap().unwrap();
        assert!(stale.is_expired(node.context().ids.now()));

        let outcome = node
            .commit(repo.did(), vec![EntityInput::new("Note").with_field("text", "late")], ParentHint::Head)
            .await
            .unwrap();
        let bundle = repo.load_bundle(outcome.summary().unwrap().root_cid).await.unwrap();
        let used = Capability::parse(&bundle.root.cap).unwrap();
        assert_ne!(used, stale);
        assert_eq!(used.ttl(), Some(Duration::seconds(60)));
        assert!(!used.is_expired(node.context().ids.now()));
        assert!(node.verify(repo.did()).await.unwrap().is_healthy());
    }

    #[tokio::test]
    async fn test_commit_uses_delegated_instance_key() {
        let node = Node::in_memory().unwrap();
        let repo = node.create_repo().await.unwrap();
        let outcome = node
            .commit(repo.did(), vec![EntityInput::new("Note").with_field("text", "hi")], ParentHint::Head)
            .await
            .unwrap();
        let summary = outcome.summary().unwrap();
        let bundle = repo.load_bundle(summary.root_cid).await.unwrap();
        let instance = node.instance_keypair().await.unwrap();
        assert_eq!(bundle.root.agent_did, instance.did());
        assert_ne!(bundle.root.agent_did, repo.did());
        assert!(node.verify(repo.did()).await.unwrap().is_healthy());
    }

    #[tokio::test]
    async fn test_unknown_repo() {
        let node = Node::in_memory().unwrap();
        assert!(matches!(node.repo("did:key:znope").await, Err(Error::RepoNotFound(_))));
        assert!(node.mirror_repo("not-a-did").await.is_err());
        let mirror_did = Keypair::generate().did();
        assert!(matches!(
            node.signer(&mirror_did).await,
            Err(Error::CapabilityMissing { .. })
        ));
    }

    #[tokio::test]
    async fn test_ingest_reconciles_when_target_arrives() {
        let node = lenient_node(true);
        let repo = node.create_repo().await.unwrap();
        let post = EntityInput::new("Post").with_uri("p:1").with_relation("author", "u:1");
        let report = node.ingest(repo.did(), vec![post], &NoDatasource).await.unwrap();
        assert_eq!(report.missing, vec!["u:1".to_string()]);
        assert_eq!(report.provisional, 1);
        assert_eq!(report.reconciled.as_ref().unwrap().remaining, 1);

        let author = EntityInput::new("Person").with_uri("u:1").with_field("name", "Ann");
        let report = node.ingest(repo.did(), vec![author], &NoDatasource).await.unwrap();
        let reconciled = report.reconciled.unwrap();
        assert_eq!(reconciled.resolved, 1);
        assert_eq!(reconciled.remaining, 0);

        let post_uid = repo.resolve_uri("p:1").await.unwrap().unwrap();
        let author_uid = repo.resolve_uri("u:1").await.unwrap().unwrap();
        let post = repo.get_entity(&post_uid).await.unwrap().unwrap();
        assert_eq!(post.content["author"], Value::from(author_uid.as_str()));
        assert_eq!(repo.history(&post_uid).await.unwrap().len(), 2);
        assert!(node.context().index.provisional_refs(repo.did()).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_reconciliation_on_demand() {
        let node = lenient_node(false);
        let repo = node.create_repo().await.unwrap();
        let post = EntityInput::new("Post").with_uri("p:1").with_relation("author", "u:1");
        let report = node.ingest(repo.did(), vec![post], &NoDatasource).await.unwrap();
        assert!(report.reconciled.is_none());

        let author = EntityInput::new("Person").with_uri("u:1");
        node.commit(repo.did(), vec![author], ParentHint::Head).await.unwrap();
        let reconciled = node.reconcile_provisional(repo.did()).await.unwrap();
        assert_eq!(reconciled.resolved, 1);
        assert!(reconciled.outcome.summary().is_some());
    }

    #[tokio::test]
    async fn test_transfer_log_records_import_and_export() {
        let source_dir = TempDir::new().unwrap();
        let target_dir = TempDir::new().unwrap();
        let source = Node::open(source_dir.path()).unwrap();
        let target = Node::open(target_dir.path()).unwrap();

        let repo = source.create_repo().await.unwrap();
        source
            .commit(repo.did(), vec![EntityInput::new("Note").with_field("text", "a")], ParentHint::Head)
            .await
            .unwrap();
        let (buf, progress) = source
            .export_to(repo.did(), Vec::new(), ExportOptions::default())
            .await
            .unwrap();
        assert_eq!(progress.blocks, 4);

        target.mirror_repo(repo.did()).await.unwrap();
        target.import_from(repo.did(), buf.as_slice(), |_| {}).await.unwrap();
        let err = target
            .import_from(repo.did(), &buf[..buf.len() - 2], |_| {})
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Io(_)));

        let exports = source.transfer_log().unwrap().for_repo(repo.did()).unwrap();
        assert_eq!(exports.len(), 1);
        assert_eq!(exports[0].direction, Direction::Export);
        let imports = target.transfer_log().unwrap().all().unwrap();
        assert_eq!(imports.len(), 2);
        assert!(imports.iter().any(|e| e.success && e.head_before.is_none() && e.head_after.is_some()));
        assert!(imports.iter().any(|e| !e.success && e.error.is_some()));
    }

    #[tokio::test]
    async fn test_streamed_export() {
        let node = Node::in_memory_with(
            NodeConfig {
                export_buffer_size: 64,
                ..Default::default()
            },
            Schema::permissive(),
            Arc::new(SystemClock),
        )
        .unwrap();
        let repo = node.create_repo().await.unwrap();
        for i in 0..5 {
            let note = EntityInput::new("Note").with_field("text", format!("note {}", i));
            node.commit(repo.did(), vec![note], ParentHint::Head).await.unwrap();
        }

        let mirror_node = Node::in_memory().unwrap();
        mirror_node.mirror_repo(repo.did()).await.unwrap();
        let stream = node.export_reader(repo.did(), ExportOptions::default()).await.unwrap();
        let imported = mirror_node.import_from(repo.did(), stream.reader, |_| {}).await.unwrap();
        let exported = stream.task.await.unwrap().unwrap();
        assert_eq!(imported.bundles, 5);
        assert_eq!(exported.bytes, imported.bytes_total);
        let mirror = mirror_node.repo(repo.did()).await.unwrap();
        assert_eq!(mirror.head().await.unwrap(), repo.head().await.unwrap());
    }
}
