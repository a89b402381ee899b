//! Bundle exporter
//!
//! Serializes a range of a repo's chain as a bundle stream. Two orders:
//! newest-first walks `parent` links from the head down to an inclusive
//! tail; oldest-first lists the commits after the tail from the index and
//! emits them in chain order, which is the order an importer can replay.

use serde::Serialize;
use tokio::io::AsyncWrite;
use tracing::{debug, info};

use crate::car::CarWriter;
use crate::cid::Cid;
use crate::error::{Error, Result};
use crate::model::Bundle;
use crate::repo::Repo;

/// Bundle order in the stream
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ExportOrder {
    /// Head first, following parents
    NewestFirst,
    /// Oldest commit after the tail first
    #[default]
    OldestFirst,
}

/// What to export
#[derive(Debug, Clone, Copy, Default)]
pub struct ExportOptions {
    /// Lower bound. Included for newest-first, excluded for oldest-first.
    pub tail: Option<Cid>,
    pub order: ExportOrder,
}

/// Running totals reported after every bundle
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExportProgress {
    pub commits: u64,
    pub commits_total: u64,
    pub blocks: u64,
    pub bytes: u64,
    /// Bytes written since the previous report
    pub delta_bytes: u64,
}

type ProgressFn<'a> = Box<dyn FnMut(&ExportProgress) + Send + Sync + 'a>;

/// Writes a repo range into a bundle stream
pub struct Exporter<'a> {
    repo: &'a Repo,
    progress: ExportProgress,
    on_progress: Option<ProgressFn<'a>>,
}

impl<'a> Exporter<'a> {
    pub fn new(repo: &'a Repo) -> Self {
        Self {
            repo,
            progress: ExportProgress::default(),
            on_progress: None,
        }
    }

    pub fn on_progress(mut self, callback: impl FnMut(&ExportProgress) + Send + Sync + 'a) -> Self {
        self.on_progress = Some(Box::new(callback));
        self
    }

    pub fn progress(&self) -> ExportProgress {
        self.progress
    }

    async fn seq_of(&self, root_cid: Cid) -> Result<i64> {
        self.repo
            .commit_entry(root_cid)
            .await?
            .map(|e| e.seq)
            .ok_or(Error::NotFound(root_cid))
    }

    /// Stream the selected range into `writer` and return it flushed
    pub async fn run<W: AsyncWrite + Unpin + Send>(&mut self, writer: W, options: ExportOptions) -> Result<W> {
        let head = self.repo.head().await?;
        let roots: Vec<Cid> = head.into_iter().collect();
        let mut car = CarWriter::new(writer, &roots).await?;
        self.progress.bytes = car.bytes_written();

        let Some(head) = head else {
            info!("Exported empty repo {}", self.repo.did());
            return car.finish().await;
        };
        let head_seq = self.seq_of(head).await?;
        let tail_seq = match options.tail {
            Some(tail) => Some(self.seq_of(tail).await?),
            None => None,
        };
        let index = self.repo.index();

        match options.order {
            ExportOrder::OldestFirst => {
                let entries = index
                    .commits_between(self.repo.did(), tail_seq.unwrap_or(0), head_seq)
                    .await?;
                self.progress.commits_total = entries.len() as u64;
                for entry in entries {
                    let bundle = self.repo.load_bundle(entry.root_cid).await?;
                    self.write_bundle(&mut car, &bundle).await?;
                }
            }
            ExportOrder::NewestFirst => {
                let floor = tail_seq.map(|s| s - 1).unwrap_or(0);
                self.progress.commits_total =
                    index.commits_between(self.repo.did(), floor, head_seq).await?.len() as u64;
                let mut next = Some(head);
                while let Some(root_cid) = next {
                    let bundle = self.repo.load_bundle(root_cid).await?;
                    self.write_bundle(&mut car, &bundle).await?;
                    next = match options.tail {
                        Some(tail) if tail == root_cid => None,
                        _ => bundle.commit.parent,
                    };
                }
            }
        }

        info!(
            "Exported {} commit(s), {} blocks, {} bytes from {}",
            self.progress.commits,
            self.progress.blocks,
            self.progress.bytes,
            self.repo.did()
        );
        car.finish().await
    }

    async fn write_bundle<W: AsyncWrite + Unpin + Send>(
        &mut self,
        car: &mut CarWriter<W>,
        bundle: &Bundle,
    ) -> Result<()> {
        let mut delta = 0;
        for (cid, bytes) in bundle.blocks() {
            delta += car.write_block(cid, &bytes).await?;
            self.progress.blocks += 1;
        }
        self.progress.commits += 1;
        self.progress.bytes += delta;
        self.progress.delta_bytes = delta;
        debug!("Exported bundle {} ({} bytes)", bundle.root_cid, delta);
        if let Some(callback) = self.on_progress.as_mut() {
            callback(&self.progress);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::car::CarReader;
    use crate::test_support::repo_with_commits;

    async fn section_cids(buf: &[u8]) -> Vec<Cid> {
        let mut reader = CarReader::new(buf, 1 << 20).await.unwrap();
        let mut out = Vec::new();
        while let Some(section) = reader.next_section().await.unwrap() {
            out.push(section.cid);
        }
        out
    }

    #[tokio::test]
    async fn test_oldest_first_with_tail() {
        let (repo, _, roots) = repo_with_commits(3).await;
        let mut reports = Vec::new();
        let buf = {
            let mut exporter = Exporter::new(&repo).on_progress(|p| reports.push(*p));
            let options = ExportOptions {
                tail: Some(roots[0]),
                order: ExportOrder::OldestFirst,
            };
            exporter.run(Vec::new(), options).await.unwrap()
        };
        let cids = section_cids(&buf).await;
        assert_eq!(cids.len(), 8);
        assert_eq!(cids[0], roots[1]);
        assert_eq!(cids[4], roots[2]);
        assert_eq!(reports.len(), 2);
        assert_eq!(reports[1].commits, 2);
        assert_eq!(reports[1].commits_total, 2);
        assert_eq!(reports[1].blocks, 8);
        assert_eq!(reports[1].bytes, buf.len() as u64);
        assert!(reports[1].delta_bytes > 0);
    }

    #[tokio::test]
    async fn test_newest_first_includes_tail() {
        let (repo, _, roots) = repo_with_commits(3).await;
        let mut exporter = Exporter::new(&repo);
        let options = ExportOptions {
            tail: Some(roots[1]),
            order: ExportOrder::NewestFirst,
        };
        let buf = exporter.run(Vec::new(), options).await.unwrap();
        let cids = section_cids(&buf).await;
        assert_eq!(cids.len(), 8);
        assert_eq!(cids[0], roots[2]);
        assert_eq!(cids[4], roots[1]);
        assert_eq!(exporter.progress().commits_total, 2);
    }

    #[tokio::test]
    async fn test_empty_repo_exports_header_only() {
        let (repo, _, _) = repo_with_commits(0).await;
        let buf = Exporter::new(&repo).run(Vec::new(), ExportOptions::default()).await.unwrap();
        let reader = CarReader::new(buf.as_slice(), 1024).await.unwrap();
        assert!(reader.roots().is_empty());
    }

    #[tokio::test]
    async fn test_unknown_tail_is_not_found() {
        let (repo, _, _) = repo_with_commits(1).await;
        let options = ExportOptions {
            tail: Some(Cid::for_block(b"elsewhere")),
            order: ExportOrder::OldestFirst,
        };
        let err = Exporter::new(&repo).run(Vec::new(), options).await.unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
    }
}
