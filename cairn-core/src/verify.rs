//! Repository integrity check
//!
//! Walks the chain from the head and re-checks what the importer checks on
//! the way in: every block is present and hashes to its CID, every root's
//! signature and capability verify, parents link up with the index, and
//! revision chains keep their entity type. Problems are collected rather
//! than returned so one broken commit does not hide the rest.

use bytes::Bytes;
use serde::Serialize;
use tracing::{info, warn};

use crate::cid::Cid;
use crate::codec;
use crate::error::Result;
use crate::model::{Commit, Revision, Root};
use crate::repo::{verify_root, Repo};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct VerifyReport {
    pub head: Option<Cid>,
    pub commits: u64,
    pub revisions: u64,
    pub blocks: u64,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
}

impl VerifyReport {
    pub fn is_healthy(&self) -> bool {
        self.errors.is_empty()
    }
}

/// Fetch a block and check its hash; problems go to the report
async fn checked_block(repo: &Repo, cid: Cid, what: &str, report: &mut VerifyReport) -> Option<Bytes> {
    match repo.blocks().get(cid).await {
        Ok(bytes) => {
            let actual = Cid::for_block(&bytes);
            if actual != cid {
                report.errors.push(format!("{} {} hashes to {}", what, cid, actual));
                return None;
            }
            report.blocks += 1;
            Some(bytes)
        }
        Err(e) => {
            report.errors.push(format!("{} {}: {}", what, cid, e));
            None
        }
    }
}

pub async fn verify_repo(repo: &Repo) -> Result<VerifyReport> {
    let mut report = VerifyReport {
        head: repo.head().await?,
        ..Default::default()
    };

    let mut next = report.head;
    while let Some(root_cid) = next {
        let Some(root_bytes) = checked_block(repo, root_cid, "root", &mut report).await else {
            break;
        };
        let root = match codec::decode(&root_bytes).and_then(|v| Root::from_value(&v)) {
            Ok(root) => root,
            Err(e) => {
                report.errors.push(format!("root {}: {}", root_cid, e));
                break;
            }
        };
        let Some(commit_bytes) = checked_block(repo, root.commit, "commit", &mut report).await else {
            break;
        };
        let commit = match codec::decode(&commit_bytes).and_then(|v| Commit::from_value(&v)) {
            Ok(commit) => commit,
            Err(e) => {
                report.errors.push(format!("commit {}: {}", root.commit, e));
                break;
            }
        };
        report.commits += 1;
        next = commit.parent;

        if commit.repo_did != repo.did() {
            report
                .errors
                .push(format!("commit {} belongs to {}", root.commit, commit.repo_did));
        }
        if let Err(e) = verify_root(&root, root.commit, &commit) {
            report.errors.push(format!("root {}: {}", root_cid, e));
        }
        match repo.commit_entry(root_cid).await? {
            Some(entry) if entry.parent != commit.parent => report.errors.push(format!(
                "index records a different parent for {}",
                root_cid
            )),
            Some(_) => {}
            None => report.warnings.push(format!("root {} is not indexed", root_cid)),
        }
        if commit.revisions.is_empty() {
            report.warnings.push(format!("commit {} is empty", root.commit));
        }

        for &rev_cid in &commit.revisions {
            let Some(rev_bytes) = checked_block(repo, rev_cid, "revision", &mut report).await else {
                continue;
            };
            let revision = match codec::decode(&rev_bytes).and_then(|v| Revision::from_value(&v)) {
                Ok(revision) => revision,
                Err(e) => {
                    report.errors.push(format!("revision {}: {}", rev_cid, e));
                    continue;
                }
            };
            report.revisions += 1;
            checked_block(repo, revision.content_cid, "content", &mut report).await;

            if let Some(prev_id) = &revision.prev_revision_id {
                match repo.get_revision(prev_id).await? {
                    Some(prev) if prev.entity_type != revision.entity_type => {
                        report.errors.push(format!(
                            "revision {} changes entity type from {} to {}",
                            revision.id, prev.entity_type, revision.entity_type
                        ));
                    }
                    Some(_) => {}
                    None => report.warnings.push(format!(
                        "revision {} follows unknown revision {}",
                        revision.id, prev_id
                    )),
                }
            }
        }
    }

    if report.is_healthy() {
        info!(
            "Verified {}: {} commits, {} revisions, {} blocks",
            repo.did(),
            report.commits,
            report.revisions,
            report.blocks
        );
    } else {
        warn!("Verification of {} found {} error(s)", repo.did(), report.errors.len());
    }
    Ok(report)
}
