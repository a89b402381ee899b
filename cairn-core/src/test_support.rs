//! Fixtures shared by unit tests.

use std::sync::Arc;

use crate::capability::Signer;
use crate::cid::Cid;
use crate::config::NodeConfig;
use crate::ids::{IdGenerator, ManualClock};
use crate::index::SqliteIndex;
use crate::keys::Keypair;
use crate::model::EntityInput;
use crate::repo::{CommitOutcome, ParentHint, Repo, RepoContext};
use crate::schema::Schema;
use crate::storage::MemoryBlockStore;

pub(crate) fn context(clock: Arc<ManualClock>) -> RepoContext {
    context_on(Arc::new(MemoryBlockStore::new()), clock)
}

pub(crate) fn context_on(blocks: Arc<MemoryBlockStore>, clock: Arc<ManualClock>) -> RepoContext {
    RepoContext {
        blocks,
        index: Arc::new(SqliteIndex::in_memory().unwrap()),
        ids: Arc::new(IdGenerator::new(clock)),
        schema: Arc::new(Schema::permissive()),
        config: Arc::new(NodeConfig::default()),
    }
}

/// A repo with `n` single-note commits; returns the roots oldest first
pub(crate) async fn repo_with_commits(n: usize) -> (Repo, Signer, Vec<Cid>) {
    repo_on(Arc::new(MemoryBlockStore::new()), n).await
}

/// Like [`repo_with_commits`], over a caller-held block store
pub(crate) async fn repo_on(blocks: Arc<MemoryBlockStore>, n: usize) -> (Repo, Signer, Vec<Cid>) {
    let key = Arc::new(Keypair::generate());
    let ctx = context_on(blocks, Arc::new(ManualClock::new(1_700_000_000_000)));
    let signer = Signer::root(key.clone(), ctx.ids.now()).unwrap();
    let repo = Repo::new(key.did(), ctx);
    repo.index().create_repo(repo.did()).await.unwrap();
    let mut roots = Vec::new();
    for i in 0..n {
        let input = EntityInput::new("Note")
            .with_uri(format!("note:{}", i))
            .with_field("text", format!("note {}", i));
        match repo.create_commit(vec![input], &signer, ParentHint::Head).await.unwrap() {
            CommitOutcome::Committed(s) => roots.push(s.root_cid),
            CommitOutcome::NothingToCommit => unreachable!(),
        }
    }
    (repo, signer, roots)
}

/// An empty repo with the same DID as `source`, on separate storage
pub(crate) async fn empty_mirror(source: &Repo) -> Repo {
    let mirror = Repo::new(
        source.did(),
        context(Arc::new(ManualClock::new(1_700_000_000_000))),
    );
    mirror.index().create_repo(mirror.did()).await.unwrap();
    mirror
}
