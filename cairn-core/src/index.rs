//! Revision index
//!
//! A relational mirror of what the block store holds, used to answer the
//! questions the engine cannot answer by walking blocks: which entity a URI
//! belongs to, an entity's latest revision, revisions after a cursor, and the
//! commits of a repo in order. It also owns each repo's head so that the head
//! compare-and-swap and the index update land in one transaction.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, Row};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use crate::cid::Cid;
use crate::error::{Error, Result};
use crate::ids::Uid;
use crate::model::{Commit, Revision};

/// Everything the index records for one accepted commit
#[derive(Debug, Clone)]
pub struct CommitRecord {
    pub root_cid: Cid,
    pub commit_cid: Cid,
    pub commit: Commit,
    pub revisions: Vec<(Cid, Revision)>,
}

/// A commit as listed by the index
#[derive(Debug, Clone, PartialEq)]
pub struct CommitEntry {
    pub seq: i64,
    pub root_cid: Cid,
    pub commit_cid: Cid,
    pub parent: Option<Cid>,
    pub agent_did: String,
    pub timestamp: DateTime<Utc>,
}

/// A revision with its position in the index
#[derive(Debug, Clone, PartialEq)]
pub struct IndexedRevision {
    /// Monotonic position, usable as a listing cursor
    pub seq: i64,
    pub cid: Cid,
    pub root_cid: Cid,
    pub revision: Revision,
}

/// Which URI list a match came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UriKind {
    Entity,
    Revision,
}

/// An entity known under a URI
#[derive(Debug, Clone, PartialEq)]
pub struct UriMatch {
    pub uri: String,
    pub entity_uid: Uid,
    pub revision_id: String,
    pub kind: UriKind,
}

/// Narrows revision listings
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RevisionFilter {
    pub entity_type: Option<String>,
    pub entity_uid: Option<Uid>,
}

impl RevisionFilter {
    pub fn entity_type(entity_type: impl Into<String>) -> Self {
        Self {
            entity_type: Some(entity_type.into()),
            entity_uid: None,
        }
    }
}

/// A relation written as an external reference because its target was unknown
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProvisionalRef {
    pub entity_uid: Uid,
    pub field: String,
    pub uri: String,
}

/// The query surface the engine needs from its index
#[async_trait]
pub trait RevisionIndex: Send + Sync {
    /// Register a repo with an empty head. Returns false if it already existed.
    async fn create_repo(&self, did: &str) -> Result<bool>;

    /// All repos and their heads
    async fn list_repos(&self) -> Result<Vec<(String, Option<Cid>)>>;

    /// Current head; `RepoNotFound` for an unknown repo
    async fn head(&self, repo: &str) -> Result<Option<Cid>>;

    /// Record a commit and advance the head from `expected` to its root.
    /// Fails with `StaleHead` and records nothing if the head moved.
    async fn apply_commit(&self, repo: &str, expected: Option<Cid>, record: &CommitRecord) -> Result<i64>;

    /// Entities known under any of `uris`
    async fn find_by_uris(&self, repo: &str, uris: &[String]) -> Result<Vec<UriMatch>>;

    /// Latest revision of an entity
    async fn latest_revision(&self, repo: &str, uid: &Uid) -> Result<Option<IndexedRevision>>;

    async fn revision_by_id(&self, repo: &str, id: &str) -> Result<Option<IndexedRevision>>;

    /// Number of revisions after cursor `after`
    async fn count_revisions(&self, repo: &str, after: i64, filter: &RevisionFilter) -> Result<u64>;

    /// Up to `limit` revisions after cursor `after`, in index order
    async fn list_revisions(
        &self,
        repo: &str,
        after: i64,
        filter: &RevisionFilter,
        limit: usize,
    ) -> Result<Vec<IndexedRevision>>;

    async fn commit_entry(&self, repo: &str, root_cid: Cid) -> Result<Option<CommitEntry>>;

    /// Commits with `after < seq <= up_to` in ascending order
    async fn commits_between(&self, repo: &str, after: i64, up_to: i64) -> Result<Vec<CommitEntry>>;

    async fn load_cursor(&self, repo: &str, name: &str) -> Result<Option<i64>>;

    async fn save_cursor(&self, repo: &str, name: &str, seq: i64) -> Result<()>;

    async fn record_provisional(&self, repo: &str, refs: &[ProvisionalRef]) -> Result<()>;

    async fn provisional_refs(&self, repo: &str) -> Result<Vec<ProvisionalRef>>;

    async fn clear_provisional(&self, repo: &str, reference: &ProvisionalRef) -> Result<()>;
}

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS repos (
    did TEXT PRIMARY KEY,
    head TEXT
) WITHOUT ROWID;
CREATE TABLE IF NOT EXISTS commits (
    seq INTEGER PRIMARY KEY AUTOINCREMENT,
    repo_did TEXT NOT NULL,
    root_cid TEXT NOT NULL,
    commit_cid TEXT NOT NULL,
    parent TEXT,
    agent_did TEXT NOT NULL,
    timestamp TEXT NOT NULL,
    UNIQUE (repo_did, root_cid)
);
CREATE TABLE IF NOT EXISTS revisions (
    seq INTEGER PRIMARY KEY AUTOINCREMENT,
    repo_did TEXT NOT NULL,
    id TEXT NOT NULL,
    cid TEXT NOT NULL,
    root_cid TEXT NOT NULL,
    entity_uid TEXT NOT NULL,
    entity_type TEXT NOT NULL,
    content_cid TEXT NOT NULL,
    prev_revision_id TEXT,
    revision_uris TEXT NOT NULL,
    entity_uris TEXT NOT NULL,
    date_created TEXT NOT NULL,
    date_modified TEXT NOT NULL,
    is_deleted INTEGER NOT NULL,
    UNIQUE (repo_did, id)
);
CREATE INDEX IF NOT EXISTS revisions_by_entity ON revisions (repo_did, entity_uid, seq);
CREATE TABLE IF NOT EXISTS revision_uris (
    repo_did TEXT NOT NULL,
    uri TEXT NOT NULL,
    kind INTEGER NOT NULL,
    entity_uid TEXT NOT NULL,
    revision_id TEXT NOT NULL,
    PRIMARY KEY (repo_did, uri, kind)
) WITHOUT ROWID;
CREATE TABLE IF NOT EXISTS cursors (
    repo_did TEXT NOT NULL,
    name TEXT NOT NULL,
    seq INTEGER NOT NULL,
    PRIMARY KEY (repo_did, name)
) WITHOUT ROWID;
CREATE TABLE IF NOT EXISTS provisional_refs (
    repo_did TEXT NOT NULL,
    entity_uid TEXT NOT NULL,
    field TEXT NOT NULL,
    uri TEXT NOT NULL,
    PRIMARY KEY (repo_did, entity_uid, field, uri)
) WITHOUT ROWID;
";

const REVISION_COLUMNS: &str = "seq, cid, root_cid, id, entity_uid, entity_type, content_cid, prev_revision_id, \
     revision_uris, entity_uris, date_created, date_modified, is_deleted";

const COMMIT_COLUMNS: &str = "seq, root_cid, commit_cid, parent, agent_did, timestamp";

fn kind_to_i64(kind: UriKind) -> i64 {
    match kind {
        UriKind::Entity => 0,
        UriKind::Revision => 1,
    }
}

fn i64_to_kind(i: i64) -> UriKind {
    if i == 0 { UriKind::Entity } else { UriKind::Revision }
}

fn parse_cid(s: &str) -> Result<Cid> {
    s.parse()
}

fn parse_time(s: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| Error::Database(format!("bad timestamp {:?}: {}", s, e)))
}

fn format_time(dt: &DateTime<Utc>) -> String {
    crate::codec::format_timestamp(dt)
}

/// Raw revision row, converted outside the rusqlite closure so that
/// conversion errors surface as engine errors
struct RevisionRow {
    seq: i64,
    cid: String,
    root_cid: String,
    id: String,
    entity_uid: String,
    entity_type: String,
    content_cid: String,
    prev_revision_id: Option<String>,
    revision_uris: String,
    entity_uris: String,
    date_created: String,
    date_modified: String,
    is_deleted: bool,
}

impl RevisionRow {
    fn read(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            seq: row.get(0)?,
            cid: row.get(1)?,
            root_cid: row.get(2)?,
            id: row.get(3)?,
            entity_uid: row.get(4)?,
            entity_type: row.get(5)?,
            content_cid: row.get(6)?,
            prev_revision_id: row.get(7)?,
            revision_uris: row.get(8)?,
            entity_uris: row.get(9)?,
            date_created: row.get(10)?,
            date_modified: row.get(11)?,
            is_deleted: row.get(12)?,
        })
    }

    fn into_indexed(self) -> Result<IndexedRevision> {
        Ok(IndexedRevision {
            seq: self.seq,
            cid: parse_cid(&self.cid)?,
            root_cid: parse_cid(&self.root_cid)?,
            revision: Revision {
                id: self.id,
                entity_uid: Uid::from_trusted(self.entity_uid),
                entity_type: self.entity_type,
                content_cid: parse_cid(&self.content_cid)?,
                prev_revision_id: self.prev_revision_id,
                revision_uris: serde_json::from_str(&self.revision_uris)?,
                entity_uris: serde_json::from_str(&self.entity_uris)?,
                date_created: parse_time(&self.date_created)?,
                date_modified: parse_time(&self.date_modified)?,
                is_deleted: self.is_deleted,
            },
        })
    }
}

struct CommitRow {
    seq: i64,
    root_cid: String,
    commit_cid: String,
    parent: Option<String>,
    agent_did: String,
    timestamp: String,
}

impl CommitRow {
    fn read(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            seq: row.get(0)?,
            root_cid: row.get(1)?,
            commit_cid: row.get(2)?,
            parent: row.get(3)?,
            agent_did: row.get(4)?,
            timestamp: row.get(5)?,
        })
    }

    fn into_entry(self) -> Result<CommitEntry> {
        Ok(CommitEntry {
            seq: self.seq,
            root_cid: parse_cid(&self.root_cid)?,
            commit_cid: parse_cid(&self.commit_cid)?,
            parent: self.parent.as_deref().map(parse_cid).transpose()?,
            agent_did: self.agent_did,
            timestamp: parse_time(&self.timestamp)?,
        })
    }
}

/// Filter clause and its parameters, appended after fixed `?1` / `?2` parameters
fn filter_clause(filter: &RevisionFilter) -> (String, Vec<String>) {
    let mut sql = String::new();
    let mut params = Vec::new();
    if let Some(t) = &filter.entity_type {
        params.push(t.clone());
        sql.push_str(&format!(" AND entity_type = ?{}", params.len() + 2));
    }
    if let Some(uid) = &filter.entity_uid {
        params.push(uid.to_string());
        sql.push_str(&format!(" AND entity_uid = ?{}", params.len() + 2));
    }
    (sql, params)
}

/// Revision index on SQLite
pub struct SqliteIndex {
    conn: Mutex<Connection>,
}

impl SqliteIndex {
    /// Open or create the index database at `path`
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;
        conn.pragma_update(None, "cache_size", "-64000")?;
        conn.pragma_update(None, "temp_store", "MEMORY")?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| Error::Storage("index lock poisoned".to_string()))
    }

    fn query_revisions(&self, sql: &str, params: &[&dyn rusqlite::ToSql]) -> Result<Vec<IndexedRevision>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(sql)?;
        let rows = stmt
            .query_map(params, RevisionRow::read)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        rows.into_iter().map(RevisionRow::into_indexed).collect()
    }
}

fn read_head(conn: &Connection, repo: &str) -> Result<Option<Cid>> {
    let head: Option<Option<String>> = conn
        .query_row("SELECT head FROM repos WHERE did = ?1", [repo], |row| row.get(0))
        .optional()?;
    match head {
        None => Err(Error::RepoNotFound(repo.to_string())),
        Some(h) => h.as_deref().map(parse_cid).transpose(),
    }
}

#[async_trait]
impl RevisionIndex for SqliteIndex {
    async fn create_repo(&self, did: &str) -> Result<bool> {
        let inserted = self
            .conn()?
            .execute("INSERT OR IGNORE INTO repos (did, head) VALUES (?1, NULL)", [did])?;
        Ok(inserted > 0)
    }

    async fn list_repos(&self) -> Result<Vec<(String, Option<Cid>)>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare("SELECT did, head FROM repos ORDER BY did")?;
        let rows = stmt
            .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, Option<String>>(1)?)))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        rows.into_iter()
            .map(|(did, head)| Ok((did, head.as_deref().map(parse_cid).transpose()?)))
            .collect()
    }

    async fn head(&self, repo: &str) -> Result<Option<Cid>> {
        let conn = self.conn()?;
        read_head(&conn, repo)
    }

    async fn apply_commit(&self, repo: &str, expected: Option<Cid>, record: &CommitRecord) -> Result<i64> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;

        let actual = read_head(&tx, repo)?;
        if actual != expected {
            return Err(Error::StaleHead { expected, actual });
        }

        let commit = &record.commit;
        tx.execute(
            "INSERT INTO commits (repo_did, root_cid, commit_cid, parent, agent_did, timestamp) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            rusqlite::params![
                repo,
                record.root_cid.to_string(),
                record.commit_cid.to_string(),
                commit.parent.map(|p| p.to_string()),
                commit.agent_did,
                format_time(&commit.timestamp),
            ],
        )?;
        let seq = tx.last_insert_rowid();

        for (cid, rev) in &record.revisions {
            tx.execute(
                "INSERT INTO revisions (repo_did, id, cid, root_cid, entity_uid, entity_type, content_cid, \
                 prev_revision_id, revision_uris, entity_uris, date_created, date_modified, is_deleted) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
                rusqlite::params![
                    repo,
                    rev.id,
                    cid.to_string(),
                    record.root_cid.to_string(),
                    rev.entity_uid.as_str(),
                    rev.entity_type,
                    rev.content_cid.to_string(),
                    rev.prev_revision_id,
                    serde_json::to_string(&rev.revision_uris)?,
                    serde_json::to_string(&rev.entity_uris)?,
                    format_time(&rev.date_created),
                    format_time(&rev.date_modified),
                    rev.is_deleted,
                ],
            )?;
            let uris = rev
                .entity_uris
                .iter()
                .map(|u| (u, UriKind::Entity))
                .chain(rev.revision_uris.iter().map(|u| (u, UriKind::Revision)));
            for (uri, kind) in uris {
                tx.execute(
                    "INSERT INTO revision_uris (repo_did, uri, kind, entity_uid, revision_id) \
                     VALUES (?1, ?2, ?3, ?4, ?5) \
                     ON CONFLICT(repo_did, uri, kind) DO UPDATE SET \
                     entity_uid = excluded.entity_uid, revision_id = excluded.revision_id",
                    rusqlite::params![repo, uri, kind_to_i64(kind), rev.entity_uid.as_str(), rev.id],
                )?;
            }
        }

        tx.execute(
            "UPDATE repos SET head = ?2 WHERE did = ?1",
            rusqlite::params![repo, record.root_cid.to_string()],
        )?;
        tx.commit()?;
        Ok(seq)
    }

    async fn find_by_uris(&self, repo: &str, uris: &[String]) -> Result<Vec<UriMatch>> {
        if uris.is_empty() {
            return Ok(Vec::new());
        }
        let conn = self.conn()?;
        let placeholders: Vec<String> = (0..uris.len()).map(|i| format!("?{}", i + 2)).collect();
        let sql = format!(
            "SELECT uri, entity_uid, revision_id, kind FROM revision_uris \
             WHERE repo_did = ?1 AND uri IN ({}) ORDER BY uri, kind",
            placeholders.join(", ")
        );
        let mut params: Vec<&dyn rusqlite::ToSql> = vec![&repo];
        params.extend(uris.iter().map(|u| u as &dyn rusqlite::ToSql));
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt
            .query_map(params.as_slice(), |row| {
                Ok(UriMatch {
                    uri: row.get(0)?,
                    entity_uid: Uid::from_trusted(row.get(1)?),
                    revision_id: row.get(2)?,
                    kind: i64_to_kind(row.get(3)?),
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    async fn latest_revision(&self, repo: &str, uid: &Uid) -> Result<Option<IndexedRevision>> {
        let sql = format!(
            "SELECT {} FROM revisions WHERE repo_did = ?1 AND entity_uid = ?2 ORDER BY seq DESC LIMIT 1",
            REVISION_COLUMNS
        );
        Ok(self.query_revisions(&sql, &[&repo, &uid.as_str()])?.pop())
    }

    async fn revision_by_id(&self, repo: &str, id: &str) -> Result<Option<IndexedRevision>> {
        let sql = format!("SELECT {} FROM revisions WHERE repo_did = ?1 AND id = ?2", REVISION_COLUMNS);
        Ok(self.query_revisions(&sql, &[&repo, &id])?.pop())
    }

    async fn count_revisions(&self, repo: &str, after: i64, filter: &RevisionFilter) -> Result<u64> {
        let (clause, extra) = filter_clause(filter);
        let sql = format!(
            "SELECT COUNT(*) FROM revisions WHERE repo_did = ?1 AND seq > ?2{}",
            clause
        );
        let mut params: Vec<&dyn rusqlite::ToSql> = vec![&repo, &after];
        params.extend(extra.iter().map(|p| p as &dyn rusqlite::ToSql));
        let count: i64 = self.conn()?.query_row(&sql, params.as_slice(), |row| row.get(0))?;
        Ok(count.max(0) as u64)
    }

    async fn list_revisions(
        &self,
        repo: &str,
        after: i64,
        filter: &RevisionFilter,
        limit: usize,
    ) -> Result<Vec<IndexedRevision>> {
        let (clause, extra) = filter_clause(filter);
        let sql = format!(
            "SELECT {} FROM revisions WHERE repo_did = ?1 AND seq > ?2{} ORDER BY seq LIMIT {}",
            REVISION_COLUMNS, clause, limit
        );
        let mut params: Vec<&dyn rusqlite::ToSql> = vec![&repo, &after];
        params.extend(extra.iter().map(|p| p as &dyn rusqlite::ToSql));
        self.query_revisions(&sql, &params)
    }

    async fn commit_entry(&self, repo: &str, root_cid: Cid) -> Result<Option<CommitEntry>> {
        let sql = format!(
            "SELECT {} FROM commits WHERE repo_did = ?1 AND root_cid = ?2",
            COMMIT_COLUMNS
        );
        let row = self
            .conn()?
            .query_row(&sql, rusqlite::params![repo, root_cid.to_string()], CommitRow::read)
            .optional()?;
        row.map(CommitRow::into_entry).transpose()
    }

    async fn commits_between(&self, repo: &str, after: i64, up_to: i64) -> Result<Vec<CommitEntry>> {
        let conn = self.conn()?;
        let sql = format!(
            "SELECT {} FROM commits WHERE repo_did = ?1 AND seq > ?2 AND seq <= ?3 ORDER BY seq",
            COMMIT_COLUMNS
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt
            .query_map(rusqlite::params![repo, after, up_to], CommitRow::read)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        rows.into_iter().map(CommitRow::into_entry).collect()
    }

    async fn load_cursor(&self, repo: &str, name: &str) -> Result<Option<i64>> {
        Ok(self
            .conn()?
            .query_row(
                "SELECT seq FROM cursors WHERE repo_did = ?1 AND name = ?2",
                [repo, name],
                |row| row.get(0),
            )
            .optional()?)
    }

    async fn save_cursor(&self, repo: &str, name: &str, seq: i64) -> Result<()> {
        self.conn()?.execute(
            "INSERT INTO cursors (repo_did, name, seq) VALUES (?1, ?2, ?3) \
             ON CONFLICT(repo_did, name) DO UPDATE SET seq = excluded.seq",
            rusqlite::params![repo, name, seq],
        )?;
        Ok(())
    }

    async fn record_provisional(&self, repo: &str, refs: &[ProvisionalRef]) -> Result<()> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        for r in refs {
            tx.execute(
                "INSERT OR IGNORE INTO provisional_refs (repo_did, entity_uid, field, uri) VALUES (?1, ?2, ?3, ?4)",
                rusqlite::params![repo, r.entity_uid.as_str(), r.field, r.uri],
            )?;
        }
        tx.commit()?;
        Ok(())
    }

    async fn provisional_refs(&self, repo: &str) -> Result<Vec<ProvisionalRef>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT entity_uid, field, uri FROM provisional_refs WHERE repo_did = ?1 ORDER BY entity_uid, field, uri",
        )?;
        let rows = stmt
            .query_map([repo], |row| {
                Ok(ProvisionalRef {
                    entity_uid: Uid::from_trusted(row.get(0)?),
                    field: row.get(1)?,
                    uri: row.get(2)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    async fn clear_provisional(&self, repo: &str, reference: &ProvisionalRef) -> Result<()> {
        self.conn()?.execute(
            "DELETE FROM provisional_refs WHERE repo_did = ?1 AND entity_uid = ?2 AND field = ?3 AND uri = ?4",
            rusqlite::params![repo, reference.entity_uid.as_str(), reference.field, reference.uri],
        )?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ids::{IdGenerator, ManualClock};
    use std::sync::Arc;
    use tempfile::TempDir;

    const REPO: &str = "did:key:zrepo";

    fn record(ids: &IdGenerator, parent: Option<Cid>, tag: &str, uri: &str) -> CommitRecord {
        let now = ids.now();
        let rev = Revision {
            id: ids.create(),
            entity_uid: Uid::from_uri(ids, uri),
            entity_type: "Note".to_string(),
            content_cid: Cid::for_block(tag.as_bytes()),
            prev_revision_id: None,
            revision_uris: vec![format!("{}#rev", uri)],
            entity_uris: vec![uri.to_string()],
            date_created: now,
            date_modified: now,
            is_deleted: false,
        };
        CommitRecord {
            root_cid: Cid::for_block(format!("root-{}", tag).as_bytes()),
            commit_cid: Cid::for_block(format!("commit-{}", tag).as_bytes()),
            commit: Commit {
                repo_did: REPO.to_string(),
                agent_did: "did:key:zagent".to_string(),
                parent,
                revisions: vec![Cid::for_block(format!("rev-{}", tag).as_bytes())],
                timestamp: now,
            },
            revisions: vec![(Cid::for_block(format!("rev-{}", tag).as_bytes()), rev)],
        }
    }

    fn ids() -> IdGenerator {
        IdGenerator::new(Arc::new(ManualClock::new(1_700_000_000_000)))
    }

    #[tokio::test]
    async fn test_head_compare_and_swap() {
        let index = SqliteIndex::in_memory().unwrap();
        let ids = ids();
        assert!(matches!(index.head(REPO).await, Err(Error::RepoNotFound(_))));
        assert!(index.create_repo(REPO).await.unwrap());
        assert!(!index.create_repo(REPO).await.unwrap());
        assert_eq!(index.head(REPO).await.unwrap(), None);

        let first = record(&ids, None, "a", "https://example.org/a");
        index.apply_commit(REPO, None, &first).await.unwrap();
        assert_eq!(index.head(REPO).await.unwrap(), Some(first.root_cid));

        // A second writer that still believes the repo is empty must lose
        let racing = record(&ids, None, "b", "https://example.org/b");
        let err = index.apply_commit(REPO, None, &racing).await.unwrap_err();
        assert!(matches!(err, Error::StaleHead { expected: None, actual: Some(h) } if h == first.root_cid));
        assert!(index.find_by_uris(REPO, &["https://example.org/b".to_string()]).await.unwrap().is_empty());
        assert_eq!(index.count_revisions(REPO, 0, &RevisionFilter::default()).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_uri_lookup_and_latest() {
        let index = SqliteIndex::in_memory().unwrap();
        let ids = ids();
        index.create_repo(REPO).await.unwrap();
        let first = record(&ids, None, "a", "https://example.org/a");
        index.apply_commit(REPO, None, &first).await.unwrap();

        let matches = index
            .find_by_uris(
                REPO,
                &["https://example.org/a".to_string(), "https://example.org/a#rev".to_string(), "x".to_string()],
            )
            .await
            .unwrap();
        assert_eq!(matches.len(), 2);
        assert_eq!(matches[0].kind, UriKind::Entity);
        assert_eq!(matches[1].kind, UriKind::Revision);

        let uid = &first.revisions[0].1.entity_uid;
        let latest = index.latest_revision(REPO, uid).await.unwrap().unwrap();
        assert_eq!(latest.revision, first.revisions[0].1);
        assert_eq!(latest.root_cid, first.root_cid);
        let by_id = index.revision_by_id(REPO, &latest.revision.id).await.unwrap().unwrap();
        assert_eq!(by_id.seq, latest.seq);
    }

    #[tokio::test]
    async fn test_listing_cursors_and_filters() {
        let dir = TempDir::new().unwrap();
        let index = SqliteIndex::open(&dir.path().join("index.sqlite")).unwrap();
        let ids = ids();
        index.create_repo(REPO).await.unwrap();
        let mut head = None;
        for tag in ["a", "b", "c"] {
            let rec = record(&ids, head, tag, &format!("https://example.org/{}", tag));
            index.apply_commit(REPO, head, &rec).await.unwrap();
            head = Some(rec.root_cid);
        }

        let all = RevisionFilter::default();
        let page = index.list_revisions(REPO, 0, &all, 2).await.unwrap();
        assert_eq!(page.len(), 2);
        let rest = index.list_revisions(REPO, page[1].seq, &all, 10).await.unwrap();
        assert_eq!(rest.len(), 1);
        assert_eq!(index.count_revisions(REPO, page[0].seq, &all).await.unwrap(), 2);

        let only_notes = RevisionFilter::entity_type("Note");
        assert_eq!(index.count_revisions(REPO, 0, &only_notes).await.unwrap(), 3);
        let none = RevisionFilter::entity_type("Post");
        assert!(index.list_revisions(REPO, 0, &none, 10).await.unwrap().is_empty());
        let one = RevisionFilter {
            entity_type: Some("Note".to_string()),
            entity_uid: Some(rest[0].revision.entity_uid.clone()),
        };
        assert_eq!(index.list_revisions(REPO, 0, &one, 10).await.unwrap().len(), 1);

        index.save_cursor(REPO, "sync", page[1].seq).await.unwrap();
        assert_eq!(index.load_cursor(REPO, "sync").await.unwrap(), Some(page[1].seq));
        assert_eq!(index.load_cursor(REPO, "other").await.unwrap(), None);

        let commits = index.commits_between(REPO, 0, i64::MAX).await.unwrap();
        assert_eq!(commits.len(), 3);
        assert_eq!(commits[1].parent, Some(commits[0].root_cid));
        let tail = index.commits_between(REPO, commits[0].seq, commits[2].seq).await.unwrap();
        assert_eq!(tail.len(), 2);
    }

    #[tokio::test]
    async fn test_provisional_refs() {
        let index = SqliteIndex::in_memory().unwrap();
        let ids = ids();
        let r = ProvisionalRef {
            entity_uid: Uid::generate(&ids),
            field: "author".to_string(),
            uri: "https://example.org/u/1".to_string(),
        };
        index.record_provisional(REPO, &[r.clone(), r.clone()]).await.unwrap();
        assert_eq!(index.provisional_refs(REPO).await.unwrap(), vec![r.clone()]);
        index.clear_provisional(REPO, &r).await.unwrap();
        assert!(index.provisional_refs(REPO).await.unwrap().is_empty());
    }
}
